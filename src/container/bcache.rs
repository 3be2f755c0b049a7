//! bcache backing-device adapter.
//!
//! Registration and teardown go through sysfs; the superblock is read
//! with bcache-super-show. Detection reads the magic directly so it
//! works before bcache-tools is required.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::common::cmd::output_of;
use crate::common::devpath_from_sysdir;
use crate::common::units::SECTOR;
use crate::device::BlockDevice;

pub const BCACHE_MAGIC: [u8; 16] = [
    0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca, 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d,
    0x81,
];

/// The magic sits 24 bytes into the superblock, which starts at 4096.
pub const BCACHE_MAGIC_OFFSET: u64 = 4096 + 24;

/// Versions written by make-bcache for backing devices. Whitelisted in
/// case newer backing formats change the layout.
const BACKING_VERSIONS: [u32; 2] = [1, 4];

const SYSFS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BcacheBacking {
    pub device: BlockDevice,
    offset: Option<u64>,
    version: Option<u32>,
}

impl BcacheBacking {
    pub fn new(device: BlockDevice) -> BcacheBacking {
        BcacheBacking {
            device,
            offset: None,
            version: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_offset(device: BlockDevice, offset: u64) -> BcacheBacking {
        BcacheBacking {
            device,
            offset: Some(offset),
            version: Some(1),
        }
    }

    fn devpath_str(&self) -> &str {
        self.device.devpath.to_str().expect("device paths are ascii")
    }

    /// First data byte; the container's size overhead.
    pub fn offset(&self) -> u64 {
        self.offset.expect("superblock not read yet")
    }

    pub fn read_superblock(&mut self) -> Result<()> {
        let out = output_of(&["bcache-super-show", "--", self.devpath_str()])?;
        let parsed = parse_super_show(&out)?;
        self.version = Some(parsed.version);
        self.offset = Some(parsed.first_sector * SECTOR);
        Ok(())
    }

    pub fn is_backing(&self) -> bool {
        self.version
            .map(|v| BACKING_VERSIONS.contains(&v))
            .unwrap_or(false)
    }

    pub fn is_activated(&self) -> Result<bool> {
        Ok(self.device.sysfspath()?.join("bcache").exists())
    }

    /// The /dev/bcacheN device exposing the cached data, registering the
    /// backing device first if needed. Registration is asynchronous in
    /// the kernel, so wait for the sysfs link to appear.
    pub fn cached_device(&self) -> Result<BlockDevice> {
        if !self.is_activated()? {
            std::fs::write("/sys/fs/bcache/register", self.devpath_str())
                .context("registering the bcache backing device")?;
        }
        let dev_link = self.device.sysfspath()?.join("bcache/dev");
        wait_for(|| dev_link.exists(), "bcache device registration")?;
        BlockDevice::new(devpath_from_sysdir(&dev_link)?)
    }

    /// Stop the bcache device. The kernel detaches asynchronously; poll
    /// until the sysfs directory disappears.
    pub fn deactivate(&mut self) -> Result<()> {
        let bcache_dir = self.device.sysfspath()?.join("bcache");
        std::fs::write(bcache_dir.join("stop"), "stop")
            .context("stopping the bcache device")?;
        wait_for(|| !bcache_dir.exists(), "bcache device teardown")?;
        Ok(())
    }

    /// bcache only knows how to extend to the whole device.
    pub fn grow(&mut self, upper_bound: u64) -> Result<u64> {
        anyhow::ensure!(
            upper_bound == self.device.size()?,
            "bcache can only grow to the size of its backing device"
        );

        if !self.is_activated()? {
            // Nothing to do, bcache picks up the size on activation.
            return Ok(upper_bound);
        }

        std::fs::write(self.device.sysfspath()?.join("bcache/resize"), "max")
            .context("resizing the bcache device")?;

        let cached = self.cached_device()?;
        cached.reset_size();
        anyhow::ensure!(
            cached.size()? + self.offset() == upper_bound,
            "cached device did not grow to fill the backing device"
        );
        Ok(upper_bound)
    }

}

fn wait_for(mut done: impl FnMut() -> bool, what: &str) -> Result<()> {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > SYSFS_TIMEOUT {
            anyhow::bail!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct SuperShow {
    version: u32,
    first_sector: u64,
}

fn parse_super_show(output: &str) -> Result<SuperShow> {
    let mut version = None;
    let mut first_sector = None;

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("sb.version") => {
                version = fields.next().and_then(|v| v.parse().ok());
            }
            Some("dev.data.first_sector") => {
                first_sector = fields.next().and_then(|v| v.parse().ok());
            }
            _ => {}
        }
    }

    let version = version.context("bcache-super-show did not report sb.version")?;
    let first_sector = first_sector
        .filter(|&s| s != 0)
        .context("bcache-super-show did not report a data offset")?;
    Ok(SuperShow {
        version,
        first_sector,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPER_SHOW: &str = "\
sb.magic\t\tok
sb.first_sector\t\t8 [match]
sb.csum\t\t\tDE63D1914A4DB8F5 [match]
sb.version\t\t1 [backing device]

dev.label\t\t(empty)
dev.uuid\t\t22d8e932-14c7-4e5f-8f5a-cfd6f22e5c10
dev.sectors_per_block\t1
dev.sectors_per_bucket\t1024
dev.data.first_sector\t16
dev.data.cache_mode\t0 [writethrough]
dev.data.cache_state\t0 [detached]

cset.uuid\t\t4f47d9b1-f440-4b85-87e5-fc2e4c9f87f9
";

    #[test]
    fn super_show_parse() {
        let parsed = parse_super_show(SUPER_SHOW).unwrap();
        assert_eq!(
            parsed,
            SuperShow {
                version: 1,
                first_sector: 16
            }
        );
    }

    #[test]
    fn super_show_requires_a_data_offset() {
        assert!(parse_super_show("sb.version\t\t1\n").is_err());
    }

    #[test]
    fn backing_versions() {
        let mut backing = BcacheBacking::new(BlockDevice::fake("/dev/null"));
        assert!(!backing.is_backing());
        backing.version = Some(1);
        assert!(backing.is_backing());
        backing.version = Some(4);
        assert!(backing.is_backing());
        // Cache-device versions must not pass as backing devices.
        backing.version = Some(3);
        assert!(!backing.is_backing());
    }

    #[test]
    fn magic_matches_the_on_disk_constant() {
        assert_eq!(BCACHE_MAGIC.len(), 16);
        assert_eq!(BCACHE_MAGIC_OFFSET, 4120);
    }
}
