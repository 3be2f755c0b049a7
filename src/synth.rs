//! Ephemeral write-redirect overlay.
//!
//! LVM and bcache tools want to write a superblock onto "the device".
//! Instead of letting them touch the real disk, they get a synthetic
//! device-mapper composition: a writable head (and optionally tail)
//! backed by a scratch file, and a read-error middle so nothing can read
//! stale data through it. Afterwards the captured bytes are copied onto
//! the physical device in one verified pass.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::common::cmd::{quiet_call, quiet_call_with_input};
use crate::common::units::bytes_to_sectors;
use crate::device::BlockDevice;

/// Create a dm device, falling back from `--noudevsync` to
/// `--verifyudev` for systems without udev synchronisation. Returns the
/// flag that worked so removal can use the same one.
fn mk_dm(devname: &str, table: &str, readonly: bool) -> Result<&'static str> {
    for flag in ["--noudevsync", "--verifyudev"] {
        let mut argv = vec!["dmsetup", "create", flag];
        if readonly {
            argv.push("--readonly");
        }
        argv.extend(["--", devname]);
        match quiet_call_with_input(&argv, table) {
            Ok(()) => return Ok(flag),
            Err(err) if flag == "--noudevsync" => {
                eprintln!("dmsetup without udev sync failed ({err}), retrying with --verifyudev");
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("the fallback either returned or failed")
}

fn rm_dm(devname: &str, flag: &str) -> Result<()> {
    quiet_call(&["dmsetup", "remove", flag, "--", devname])
}

pub struct SyntheticDevice {
    device: BlockDevice,
    scratch: Option<NamedTempFile>,
    lo_dev: String,
    rozeros_name: String,
    synth_name: String,
    udev_flag: &'static str,
    writable_hdr_size: u64,
    rz_size: u64,
    writable_end_size: u64,
    torn_down: bool,
}

impl SyntheticDevice {
    pub fn create(
        writable_hdr_size: u64,
        rz_size: u64,
        writable_end_size: u64,
    ) -> Result<SyntheticDevice> {
        let scratch = tempfile::Builder::new()
            .prefix("blockshift-")
            .suffix(".img")
            .tempfile()
            .context("creating the scratch file")?;
        scratch
            .as_file()
            .set_len(writable_hdr_size + writable_end_size)
            .context("sizing the scratch file")?;
        let scratch_path = scratch
            .path()
            .to_str()
            .expect("temp paths are ascii")
            .to_string();

        let lo_dev = crate::common::cmd::output_of(&[
            "losetup", "-f", "--show", "--", &scratch_path,
        ])?;
        anyhow::ensure!(lo_dev.starts_with('/'), "unexpected losetup output {lo_dev:?}");

        let rozeros_name = format!("rozeros-{}", Uuid::new_v4());
        let synth_name = format!("synthetic-{}", Uuid::new_v4());

        let writable_sectors = bytes_to_sectors(writable_hdr_size);
        let rz_sectors = bytes_to_sectors(rz_size);
        let wrend_sectors = bytes_to_sectors(writable_end_size);

        let guard = LoopGuard {
            lo_dev: lo_dev.clone(),
        };
        let rozeros_flag = mk_dm(&rozeros_name, &format!("0 {rz_sectors} error\n"), true)?;
        let rozeros_guard = DmGuard {
            name: rozeros_name.clone(),
            flag: rozeros_flag,
        };

        let mut table = format!(
            "0 {writable_sectors} linear {lo_dev} 0\n\
             {writable_sectors} {rz_sectors} linear /dev/mapper/{rozeros_name} 0\n"
        );
        if writable_end_size != 0 {
            let wrend_offset = writable_sectors + rz_sectors;
            table.push_str(&format!(
                "{wrend_offset} {wrend_sectors} linear {lo_dev} {writable_sectors}\n"
            ));
        }
        let udev_flag = mk_dm(&synth_name, &table, false)?;
        let synth_guard = DmGuard {
            name: synth_name.clone(),
            flag: udev_flag,
        };

        let device = BlockDevice::new(PathBuf::from("/dev/mapper").join(&synth_name))?;

        // Everything is mapped; the struct owns teardown from here on.
        std::mem::forget(synth_guard);
        std::mem::forget(rozeros_guard);
        std::mem::forget(guard);

        Ok(SyntheticDevice {
            device,
            scratch: Some(scratch),
            lo_dev,
            rozeros_name,
            synth_name,
            udev_flag,
            writable_hdr_size,
            rz_size,
            writable_end_size,
            torn_down: false,
        })
    }

    pub fn device(&self) -> &BlockDevice {
        &self.device
    }

    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        rm_dm(&self.synth_name, self.udev_flag)?;
        rm_dm(&self.rozeros_name, self.udev_flag)?;
        quiet_call(&["losetup", "-d", &self.lo_dev])?;
        Ok(())
    }

    /// Tear the composition down and return the bytes the external tool
    /// wrote into the head and tail regions.
    pub fn finish(mut self) -> Result<StagedImage> {
        self.teardown()?;
        let mut scratch = self.scratch.take().expect("scratch lives until finish");

        let mut data = Vec::with_capacity((self.writable_hdr_size + self.writable_end_size) as usize);
        scratch
            .as_file_mut()
            .read_to_end(&mut data)
            .context("reading back the scratch file")?;
        anyhow::ensure!(
            data.len() as u64 == self.writable_hdr_size + self.writable_end_size,
            "scratch file changed size"
        );

        Ok(StagedImage {
            data,
            writable_hdr_size: self.writable_hdr_size,
            rz_size: self.rz_size,
            writable_end_size: self.writable_end_size,
        })
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            eprintln!("warning: failed to release the synthetic device: {err}");
        }
    }
}

struct LoopGuard {
    lo_dev: String,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let _ = quiet_call(&["losetup", "-d", &self.lo_dev]);
    }
}

struct DmGuard {
    name: String,
    flag: &'static str,
}

impl Drop for DmGuard {
    fn drop(&mut self) {
        let _ = rm_dm(&self.name, self.flag);
    }
}

/// Superblock bytes captured from a synthetic device, ready to be
/// installed on the real one.
pub struct StagedImage {
    data: Vec<u8>,
    writable_hdr_size: u64,
    rz_size: u64,
    writable_end_size: u64,
}

impl StagedImage {
    #[cfg(test)]
    pub(crate) fn from_parts(
        data: Vec<u8>,
        writable_hdr_size: u64,
        rz_size: u64,
        writable_end_size: u64,
    ) -> StagedImage {
        StagedImage {
            data,
            writable_hdr_size,
            rz_size,
            writable_end_size,
        }
    }

    /// Write the captured head (and tail) onto `file`, read them back
    /// and compare. `shift_by` may be negative to address from the end
    /// of the synthetic extent. When writing to the same device the
    /// regions must fall inside it; `reserved_area` additionally floors
    /// them.
    pub fn copy_to_physical(
        &self,
        file: &File,
        shift_by: i64,
        reserved_area: Option<u64>,
        other_device: bool,
    ) -> Result<()> {
        anyhow::ensure!(
            self.data.len() as u64 == self.writable_hdr_size + self.writable_end_size,
            "staged data does not match the writable regions"
        );

        let size = self.writable_hdr_size + self.rz_size + self.writable_end_size;
        let shift_by = if shift_by < 0 {
            anyhow::ensure!(!other_device, "negative offsets only make sense in place");
            u64::try_from(shift_by + size as i64).context("negative shift out of range")?
        } else {
            shift_by as u64
        };

        let wrend_offset = self.writable_hdr_size + self.rz_size + shift_by;

        if let Some(reserved) = reserved_area {
            anyhow::ensure!(
                shift_by >= reserved && wrend_offset >= reserved,
                "write would overlap the reserved area"
            );
        }
        if !other_device {
            anyhow::ensure!(shift_by + self.writable_hdr_size <= size);
            if self.writable_end_size != 0 {
                anyhow::ensure!(wrend_offset + self.writable_end_size <= size);
            }
        }

        let (head, tail) = self.data.split_at(self.writable_hdr_size as usize);

        write_and_verify(file, head, shift_by)?;
        if self.writable_end_size != 0 {
            write_and_verify(file, tail, wrend_offset)?;
        }
        Ok(())
    }
}

fn write_and_verify(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)
        .with_context(|| format!("writing {} bytes at offset {offset}", data.len()))?;

    let mut read_back = vec![0u8; data.len()];
    file.read_exact_at(&mut read_back, offset)
        .with_context(|| format!("reading back {} bytes at offset {offset}", data.len()))?;
    anyhow::ensure!(
        read_back == data,
        "verification failed: bytes at offset {offset} differ from what was written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_device(size: u64) -> (NamedTempFile, File) {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.as_file_mut().set_len(size).unwrap();
        tmp.flush().unwrap();
        let file = tmp.reopen().unwrap();
        (tmp, file)
    }

    #[test]
    fn head_lands_at_shift() {
        let (_tmp, file) = scratch_device(4096);
        let staged = StagedImage::from_parts(vec![0xAAu8; 512], 512, 2048, 0);
        staged.copy_to_physical(&file, 1024, None, false).unwrap();

        let mut buf = vec![0u8; 512];
        file.read_exact_at(&mut buf, 1024).unwrap();
        assert_eq!(buf, vec![0xAAu8; 512]);
    }

    #[test]
    fn tail_lands_after_the_middle() {
        let (_tmp, file) = scratch_device(8192);
        let mut data = vec![0x11u8; 512];
        data.extend_from_slice(&[0x22u8; 512]);
        let staged = StagedImage::from_parts(data, 512, 1024, 512);
        staged.copy_to_physical(&file, 0, None, false).unwrap();

        let mut head = vec![0u8; 512];
        file.read_exact_at(&mut head, 0).unwrap();
        assert_eq!(head, vec![0x11u8; 512]);

        let mut tail = vec![0u8; 512];
        file.read_exact_at(&mut tail, 512 + 1024).unwrap();
        assert_eq!(tail, vec![0x22u8; 512]);
    }

    #[test]
    fn negative_shift_addresses_from_the_end() {
        let (_tmp, file) = scratch_device(8192);
        let staged = StagedImage::from_parts(vec![0x33u8; 512], 512, 7680, 0);
        // -512 on an 8192-byte extent puts the header at 7680.
        staged.copy_to_physical(&file, -512, None, false).unwrap();

        let mut buf = vec![0u8; 512];
        file.read_exact_at(&mut buf, 7680).unwrap();
        assert_eq!(buf, vec![0x33u8; 512]);
    }

    #[test]
    fn negative_shift_rejected_for_other_devices() {
        let (_tmp, file) = scratch_device(8192);
        let staged = StagedImage::from_parts(vec![0u8; 512], 512, 7680, 0);
        assert!(staged.copy_to_physical(&file, -512, None, true).is_err());
    }

    #[test]
    fn reserved_area_is_enforced() {
        let (_tmp, file) = scratch_device(8192);
        let staged = StagedImage::from_parts(vec![0u8; 512], 512, 7168, 0);
        assert!(staged
            .copy_to_physical(&file, 512, Some(1024), false)
            .is_err());
        staged
            .copy_to_physical(&file, 1024, Some(1024), false)
            .unwrap();
    }

    #[test]
    fn in_place_writes_must_fit_the_extent() {
        let (_tmp, file) = scratch_device(8192);
        let staged = StagedImage::from_parts(vec![0u8; 512], 512, 1024, 0);
        // Extent is 1536 bytes; a 4096 shift would write past it.
        assert!(staged.copy_to_physical(&file, 4096, None, false).is_err());
        // On another device the same shift is fine.
        staged.copy_to_physical(&file, 4096, None, true).unwrap();
    }
}
