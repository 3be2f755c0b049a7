//! Block device probing.
//!
//! A [`BlockDevice`] answers read-only questions about a `/dev` node:
//! size, superblock type, where it sits in the sysfs topology, and who
//! holds it. Probe results are cached per instance; mutation paths call
//! [`BlockDevice::reset_size`] to invalidate what they changed.

pub mod partition;

use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::libc;
use nix::sys::stat::{major, minor, stat};

use crate::common::cmd::{output_of, output_or_absent, quiet_call};
use crate::common::devpath_from_sysdir;
use crate::common::errors::ConvertError;
use crate::common::units::{align_up, SECTOR};
use crate::container::bcache::{BCACHE_MAGIC, BCACHE_MAGIC_OFFSET};

use self::partition::PartitionTable;

#[derive(Debug, Default, Clone)]
struct ProbeCache {
    size: Cell<Option<u64>>,
    superblock_type: RefCell<Option<String>>,
    ptable_type: RefCell<Option<String>>,
    has_bcache_superblock: Cell<Option<bool>>,
    is_partition: Cell<Option<bool>>,
    is_dm: Cell<Option<bool>>,
    is_lv: Cell<Option<bool>>,
}

#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub devpath: PathBuf,
    cache: ProbeCache,
}

impl BlockDevice {
    pub fn new(devpath: impl Into<PathBuf>) -> Result<Self> {
        let devpath = devpath.into();
        anyhow::ensure!(
            devpath.exists(),
            "device {} does not exist",
            devpath.display()
        );
        Ok(BlockDevice {
            devpath,
            cache: ProbeCache::default(),
        })
    }

    /// A handle that skips the existence check, for tests that only
    /// exercise parsing.
    #[cfg(test)]
    pub(crate) fn fake(devpath: impl Into<PathBuf>) -> Self {
        BlockDevice {
            devpath: devpath.into(),
            cache: ProbeCache::default(),
        }
    }

    pub fn by_uuid(uuid: &str) -> Result<Self> {
        let devpath = output_of(&["blkid", "-U", uuid])
            .with_context(|| format!("looking up filesystem uuid {uuid}"))?;
        BlockDevice::new(devpath)
    }

    fn devpath_str(&self) -> &str {
        self.devpath.to_str().expect("device paths are ascii")
    }

    /// Open with the kernel's exclusive-open discipline. Fails if a
    /// mount, dm target or swap still claims the device. O_SYNC gives
    /// durability for the few direct writes we do.
    pub fn open_excl(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL | libc::O_SYNC)
            .open(&self.devpath)
            .with_context(|| {
                format!(
                    "opening {} exclusively (is it still mounted or mapped?)",
                    self.devpath.display()
                )
            })
    }

    pub fn size(&self) -> Result<u64> {
        if let Some(size) = self.cache.size.get() {
            return Ok(size);
        }
        let out = output_of(&["blockdev", "--getsize64", self.devpath_str()])?;
        let size: u64 = out
            .parse()
            .with_context(|| format!("parsing blockdev output {out:?}"))?;
        anyhow::ensure!(size % SECTOR == 0, "device size {size} is not sector-aligned");
        self.cache.size.set(Some(size));
        Ok(size)
    }

    /// Forget the cached size after an operation that may have changed it.
    pub fn reset_size(&self) {
        self.cache.size.set(None);
    }

    pub fn superblock_type(&self) -> Result<String> {
        if let Some(cached) = self.cache.superblock_type.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let sbtype = self.superblock_at(0)?;
        *self.cache.superblock_type.borrow_mut() = Some(sbtype.clone());
        Ok(sbtype)
    }

    /// Superblock type at a byte offset; empty string when nothing is
    /// recognised there (blkid exit code 2).
    pub fn superblock_at(&self, offset: u64) -> Result<String> {
        let offset = offset.to_string();
        let out = output_or_absent(
            &[
                "blkid",
                "-p",
                "-o",
                "value",
                "-s",
                "TYPE",
                "-O",
                &offset,
                "--",
                self.devpath_str(),
            ],
            2,
        )?;
        Ok(out.unwrap_or_default())
    }

    pub fn ptable_type(&self) -> Result<String> {
        if let Some(cached) = self.cache.ptable_type.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let out = output_or_absent(
            &[
                "blkid",
                "-p",
                "-o",
                "value",
                "-s",
                "PTTYPE",
                "--",
                self.devpath_str(),
            ],
            2,
        )?;
        let ptype = out.unwrap_or_default();
        *self.cache.ptable_type.borrow_mut() = Some(ptype.clone());
        Ok(ptype)
    }

    /// blkid doesn't detect bcache, so read the magic directly. Keeping
    /// detection independent of bcache-tools means the requirement check
    /// only runs after a positive match.
    pub fn has_bcache_superblock(&self) -> Result<bool> {
        if let Some(cached) = self.cache.has_bcache_superblock.get() {
            return Ok(cached);
        }
        let found = if self.size()? <= 8192 {
            false
        } else {
            let file = File::open(&self.devpath)
                .with_context(|| format!("opening {} to probe bcache", self.devpath.display()))?;
            let mut magic = [0u8; 16];
            match file.read_exact_at(&mut magic, BCACHE_MAGIC_OFFSET) {
                Ok(()) => magic == BCACHE_MAGIC,
                Err(_) => false,
            }
        };
        self.cache.has_bcache_superblock.set(Some(found));
        Ok(found)
    }

    pub fn devnum(&self) -> Result<(u64, u64)> {
        let st = stat(&self.devpath)
            .with_context(|| format!("stat {}", self.devpath.display()))?;
        anyhow::ensure!(
            (st.st_mode & libc::S_IFMT) == libc::S_IFBLK,
            "{} is not a block device",
            self.devpath.display()
        );
        Ok((major(st.st_rdev), minor(st.st_rdev)))
    }

    pub fn sysfspath(&self) -> Result<PathBuf> {
        let (major, minor) = self.devnum()?;
        Ok(PathBuf::from(format!("/sys/dev/block/{major}:{minor}")))
    }

    /// Devices layered on top of this one, per sysfs.
    pub fn iter_holders(&self) -> Result<Vec<BlockDevice>> {
        let holders_dir = self.sysfspath()?.join("holders");
        let mut holders = Vec::new();
        if !holders_dir.exists() {
            return Ok(holders);
        }
        for entry in std::fs::read_dir(&holders_dir)
            .with_context(|| format!("listing {}", holders_dir.display()))?
        {
            let entry = entry?;
            holders.push(BlockDevice::new(
                Path::new("/dev").join(entry.file_name()),
            )?);
        }
        Ok(holders)
    }

    pub fn is_partition(&self) -> Result<bool> {
        if let Some(cached) = self.cache.is_partition.get() {
            return Ok(cached);
        }
        let part_file = self.sysfspath()?.join("partition");
        let result = match std::fs::read_to_string(&part_file) {
            Ok(contents) => {
                let trimmed = contents.trim();
                !trimmed.is_empty() && trimmed != "0"
            }
            Err(_) => false,
        };
        self.cache.is_partition.set(Some(result));
        Ok(result)
    }

    pub fn is_dm(&self) -> Result<bool> {
        if let Some(cached) = self.cache.is_dm.get() {
            return Ok(cached);
        }
        let result = self.sysfspath()?.join("dm").exists();
        self.cache.is_dm.set(Some(result));
        Ok(result)
    }

    /// An LV is a dm device lvm knows an extent size for.
    pub fn is_lv(&self) -> Result<bool> {
        if let Some(cached) = self.cache.is_lv.get() {
            return Ok(cached);
        }
        let result = self.is_dm()? && self.lv_extent_size().is_ok();
        self.cache.is_lv.set(Some(result));
        Ok(result)
    }

    pub fn lv_extent_size(&self) -> Result<u64> {
        let out = output_of(&[
            "lvm",
            "lvs",
            "--noheadings",
            "--rows",
            "--units=b",
            "--nosuffix",
            "-o",
            "vg_extent_size",
            "--",
            self.devpath_str(),
        ])?;
        out.trim()
            .parse()
            .with_context(|| format!("parsing vg_extent_size {out:?}"))
    }

    pub fn dm_table(&self) -> Result<String> {
        output_of(&["dmsetup", "table", "--", self.devpath_str()])
    }

    /// The partition table containing this partition, and our byte
    /// offset within it.
    pub fn ptable_context(&self) -> Result<(PartitionTable, u64)> {
        anyhow::ensure!(self.is_partition()?, "not a partition");

        let sysfs = self.sysfspath()?;
        let parent = sysfs
            .canonicalize()
            .with_context(|| format!("resolving {}", sysfs.display()))?
            .parent()
            .map(Path::to_path_buf)
            .context("partition without a parent device")?;
        let disk = BlockDevice::new(devpath_from_sysdir(&parent)?)?;

        let start: u64 = std::fs::read_to_string(sysfs.join("start"))?
            .trim()
            .parse()
            .context("parsing partition start sector")?;
        let partno: u64 = std::fs::read_to_string(sysfs.join("partition"))?
            .trim()
            .parse()
            .context("parsing partition number")?;

        Ok((PartitionTable::new(disk, partno)?, start * SECTOR))
    }

    /// Resize the underlying device. Only partitions and LVs can be
    /// resized; `shrink` makes the intended direction explicit since
    /// shrinking is the dangerous one.
    pub fn dev_resize(&self, newsize: u64, shrink: bool) -> Result<()> {
        let newsize = align_up(newsize, SECTOR);

        if self.is_partition()? {
            let (ptable, part_start) = self.ptable_context()?;
            ptable.part_resize(part_start, newsize, shrink)?;
        } else if self.is_lv()? {
            let size_arg = format!("--size={newsize}b");
            let argv: Vec<&str> = if shrink {
                vec!["lvm", "lvreduce", "-f", size_arg.as_str(), "--", self.devpath_str()]
            } else {
                vec!["lvm", "lvextend", size_arg.as_str(), "--", self.devpath_str()]
            };
            quiet_call(&argv)?;
        } else {
            return Err(ConvertError::UnsupportedLayout(
                "only partitions and logical volumes can be resized".into(),
            )
            .into());
        }

        self.reset_size();
        Ok(())
    }
}
