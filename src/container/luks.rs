//! LUKS v1 container adapter.
//!
//! The high-level operations (activate, resize) go through cryptsetup.
//! The header shift used by the bcache conversion edits the on-disk v1
//! header directly, so the layout constants live here too.

use std::cell::RefCell;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use regex::Regex;
use uuid::Uuid;

use crate::common::cmd::{interactive_call, output_of, quiet_call};
use crate::common::units::{bytes_to_sectors, SECTOR};
use crate::device::BlockDevice;

const LUKS_MAGIC: &[u8; 6] = b"LUKS\xba\xbe";
const PAYLOAD_OFFSET_FIELD: u64 = 104;
const KEY_SLOT_TABLE: u64 = 208;
const KEY_SLOT_STRIDE: u64 = 48;
const KEY_SLOTS: u64 = 8;
const KEY_STRIPES: u32 = 4000;

/// The fixed part of the v1 header ends at byte 592; key material may
/// extend past it.
const HEADER_FIXED_END: u64 = 592;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuksHeader {
    /// Payload offset in bytes.
    pub payload_offset: u64,
    /// Highest byte occupied by the header and key slots.
    pub sb_end: u64,
}

pub struct Luks {
    pub device: BlockDevice,
    offset: Option<u64>,
    sb_end: Option<u64>,
    cleartext: RefCell<Option<BlockDevice>>,
}

impl Luks {
    pub fn new(device: BlockDevice) -> Luks {
        Luks {
            device,
            offset: None,
            sb_end: None,
            cleartext: RefCell::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_offset(device: BlockDevice, offset: u64) -> Luks {
        Luks {
            device,
            offset: Some(offset),
            sb_end: None,
            cleartext: RefCell::new(None),
        }
    }

    fn devpath_str(&self) -> &str {
        self.device.devpath.to_str().expect("device paths are ascii")
    }

    /// Payload offset in bytes; the container's size overhead.
    pub fn offset(&self) -> u64 {
        self.offset.expect("superblock not read yet")
    }

    pub fn sb_end(&self) -> u64 {
        self.sb_end.expect("low-level superblock not read yet")
    }

    pub fn read_superblock(&mut self) -> Result<()> {
        let out = output_of(&["cryptsetup", "luksDump", "--", self.devpath_str()])?;
        let mut offset = None;
        for line in out.lines() {
            if let Some(value) = line.trim_start().strip_prefix("Payload offset:") {
                let sectors: u64 = value.trim().parse().context("parsing payload offset")?;
                offset = Some(sectors * SECTOR);
            }
        }
        self.offset =
            Some(offset.context("cryptsetup luksDump did not report a payload offset")?);
        Ok(())
    }

    /// Parse the on-disk header, cross-checking the payload offset the
    /// high-level read reported.
    pub fn read_superblock_ll(&mut self, file: &File) -> Result<()> {
        let mut buf = vec![0u8; HEADER_FIXED_END as usize];
        file.read_exact_at(&mut buf, 0)
            .context("reading the LUKS header")?;
        let header = parse_luks_header(&buf)?;
        anyhow::ensure!(
            header.payload_offset == self.offset(),
            "LUKS payload offset disagrees between luksDump and the on-disk header"
        );
        self.sb_end = Some(header.sb_end);
        Ok(())
    }

    /// Move the header `shift_by` bytes further into the device, zeroing
    /// the vacated prefix and patching the payload offset to keep the
    /// cleartext mapping identical.
    pub fn shift_sb(&mut self, file: &File, shift_by: u64) -> Result<()> {
        let offset = self.offset();
        let sb_end = self.sb_end();
        anyhow::ensure!(shift_by > 0 && shift_by % SECTOR == 0 && offset % SECTOR == 0);
        anyhow::ensure!(
            sb_end + shift_by <= offset,
            "not enough room between the key slots and the payload"
        );

        let mut sb = vec![0u8; sb_end as usize];
        file.read_exact_at(&mut sb, 0)
            .context("reading the LUKS superblock")?;

        let combined = shifted_sb_bytes(&sb, offset, shift_by);

        // One pwrite covering both the zeroed prefix and the moved
        // header.
        file.write_all_at(&combined, 0)
            .context("writing the shifted LUKS superblock")?;

        // The low-level view is stale now; offset is kept for callers
        // that still need the payload position.
        self.sb_end = None;
        Ok(())
    }

    pub fn activate(&self, dmname: &str) -> Result<()> {
        interactive_call(&["cryptsetup", "luksOpen", "--", self.devpath_str(), dmname])
    }

    pub fn deactivate(&mut self) -> Result<()> {
        while let Some(dev) = self.snoop_activated()? {
            quiet_call(&[
                "cryptsetup",
                "remove",
                "--",
                dev.devpath.to_str().expect("device paths are ascii"),
            ])?;
        }
        *self.cleartext.borrow_mut() = None;
        Ok(())
    }

    /// Find an already-open cleartext mapping of this device by matching
    /// holder dm tables against the expected crypt target.
    pub fn snoop_activated(&mut self) -> Result<Option<BlockDevice>> {
        if self.offset.is_none() {
            self.read_superblock()?;
        }
        let expected = bytes_to_sectors(self.offset());
        for holder in self.device.iter_holders()? {
            let table = holder.dm_table()?;
            if crypt_table_offset(&table) == Some(expected) {
                return Ok(Some(holder));
            }
        }
        Ok(None)
    }

    /// The cleartext device, activating the container if needed. An
    /// existing mapping is reused so the user isn't prompted again.
    pub fn cleartext_device(&mut self) -> Result<BlockDevice> {
        if let Some(dev) = self.cleartext.borrow().as_ref() {
            return Ok(dev.clone());
        }
        let dev = match self.snoop_activated()? {
            Some(dev) => dev,
            None => {
                let dmname = format!("cleartext-{}", Uuid::new_v4());
                self.activate(&dmname)?;
                BlockDevice::new(PathBuf::from("/dev/mapper").join(&dmname))?
            }
        };
        *self.cleartext.borrow_mut() = Some(dev.clone());
        Ok(dev)
    }

    pub fn grow(&mut self, upper_bound: u64) -> Result<u64> {
        self.reserve_end_area(upper_bound)
    }

    /// Resize the cleartext mapping so the container ends at `pos`.
    /// cryptsetup takes the inner (cleartext) size in sectors; the size
    /// isn't stored in the superblock, only in the dm table.
    pub fn reserve_end_area(&mut self, pos: u64) -> Result<u64> {
        let inner_size = pos - self.offset();
        let sectors = bytes_to_sectors(inner_size).to_string();
        let cleartext = self.cleartext_device()?;
        quiet_call(&[
            "cryptsetup",
            "resize",
            &format!("--size={sectors}"),
            "--",
            cleartext.devpath.to_str().expect("device paths are ascii"),
        ])?;

        if let Some(activated) = self.snoop_activated()? {
            activated.reset_size();
            anyhow::ensure!(
                activated.size()? == inner_size,
                "cleartext device is not {inner_size} bytes after the resize"
            );
        }
        Ok(pos)
    }
}

/// Parse the fixed part of a LUKS v1 header.
pub fn parse_luks_header(buf: &[u8]) -> Result<LuksHeader> {
    anyhow::ensure!(buf.len() >= HEADER_FIXED_END as usize, "header too short");
    anyhow::ensure!(&buf[0..6] == LUKS_MAGIC, "bad LUKS magic");
    let version = u16::from_be_bytes(buf[6..8].try_into().expect("2 bytes"));
    anyhow::ensure!(version == 1, "unsupported LUKS version {version}");

    let at = |pos: u64| -> u32 {
        u32::from_be_bytes(
            buf[pos as usize..pos as usize + 4]
                .try_into()
                .expect("4 bytes"),
        )
    };

    let payload_sectors = at(PAYLOAD_OFFSET_FIELD);
    let key_bytes = at(PAYLOAD_OFFSET_FIELD + 4);

    let mut sb_end = HEADER_FIXED_END;
    for slot in 0..KEY_SLOTS {
        let slot_base = KEY_SLOT_TABLE + KEY_SLOT_STRIDE * slot;
        let key_offset = at(slot_base + 40);
        let key_stripes = at(slot_base + 44);
        anyhow::ensure!(
            key_stripes == KEY_STRIPES,
            "key slot {slot} has {key_stripes} stripes, expected {KEY_STRIPES}"
        );
        let key_end = u64::from(key_offset) * SECTOR + u64::from(key_stripes) * u64::from(key_bytes);
        sb_end = sb_end.max(key_end);
    }

    let payload_offset = u64::from(payload_sectors) * SECTOR;
    anyhow::ensure!(
        payload_offset >= sb_end,
        "payload offset {payload_offset} is inside the header"
    );

    Ok(LuksHeader {
        payload_offset,
        sb_end,
    })
}

/// Build the buffer written over the start of the device when shifting:
/// `shift_by` zero bytes, then the superblock with its payload-offset
/// field decremented by the shift.
fn shifted_sb_bytes(sb: &[u8], payload_offset: u64, shift_by: u64) -> Vec<u8> {
    let new_offset_sectors =
        u32::try_from(bytes_to_sectors(payload_offset) - bytes_to_sectors(shift_by))
            .expect("payload offsets fit in 32 bits");

    let mut combined = vec![0u8; shift_by as usize + sb.len()];
    combined[shift_by as usize..].copy_from_slice(sb);
    combined[shift_by as usize + PAYLOAD_OFFSET_FIELD as usize
        ..shift_by as usize + PAYLOAD_OFFSET_FIELD as usize + 4]
        .copy_from_slice(&new_offset_sectors.to_be_bytes());
    combined
}

/// Sector offset of a dm-crypt table, if the table is one we trust.
/// Fairly strict: snooping an incorrect mapping would be bad.
fn crypt_table_offset(table: &str) -> Option<u64> {
    let re = Regex::new(
        r"^0 (\d+) crypt ([a-z0-9:-]+) 0+ 0 (\d+):(\d+) (\d+)( [^\n]*)?\n?$",
    )
    .expect("static regex");
    let caps = re.captures(table)?;
    caps[5].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A well-formed v1 header: payload at 4096 sectors, 32-byte keys,
    /// key slots laid out the way cryptsetup does.
    fn sample_header() -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_FIXED_END as usize];
        buf[0..6].copy_from_slice(LUKS_MAGIC);
        buf[6..8].copy_from_slice(&1u16.to_be_bytes());
        buf[104..108].copy_from_slice(&4096u32.to_be_bytes());
        buf[108..112].copy_from_slice(&32u32.to_be_bytes());
        for slot in 0..8u64 {
            let base = (KEY_SLOT_TABLE + KEY_SLOT_STRIDE * slot) as usize;
            let key_offset = 8 + 248 * slot as u32;
            buf[base + 40..base + 44].copy_from_slice(&key_offset.to_be_bytes());
            buf[base + 44..base + 48].copy_from_slice(&KEY_STRIPES.to_be_bytes());
        }
        buf
    }

    #[test]
    fn header_parse() {
        let header = parse_luks_header(&sample_header()).unwrap();
        assert_eq!(header.payload_offset, 4096 * SECTOR);
        // Last slot: offset (8 + 248*7)*512 + 4000*32.
        assert_eq!(header.sb_end, (8 + 248 * 7) * 512 + 4000 * 32);
        assert!(header.sb_end <= header.payload_offset);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut buf = sample_header();
        buf[0] = b'X';
        assert!(parse_luks_header(&buf).is_err());
    }

    #[test]
    fn header_rejects_version_2() {
        let mut buf = sample_header();
        buf[6..8].copy_from_slice(&2u16.to_be_bytes());
        assert!(parse_luks_header(&buf).is_err());
    }

    #[test]
    fn header_rejects_odd_stripe_counts() {
        let mut buf = sample_header();
        let base = KEY_SLOT_TABLE as usize + 44;
        buf[base..base + 4].copy_from_slice(&2u32.to_be_bytes());
        assert!(parse_luks_header(&buf).is_err());
    }

    #[test]
    fn shift_moves_and_patches() {
        let sb = sample_header();
        let header = parse_luks_header(&sb).unwrap();
        let shift_by = 512 * 16;

        let combined = shifted_sb_bytes(&sb, header.payload_offset, shift_by);
        assert_eq!(combined.len(), shift_by as usize + sb.len());
        assert!(combined[..shift_by as usize].iter().all(|&b| b == 0));

        // The moved header parses and reports a payload offset reduced
        // by exactly the shift.
        let shifted = parse_luks_header(&combined[shift_by as usize..]).unwrap();
        assert_eq!(shifted.payload_offset, header.payload_offset - shift_by);
        assert_eq!(shifted.sb_end, header.sb_end);
    }

    #[test]
    fn crypt_table_snooping() {
        let table = "0 2093056 crypt aes-xts-plain64 0000000000000000000000000000000000000000000000000000000000000000 0 254:2 4096\n";
        assert_eq!(crypt_table_offset(table), Some(4096));

        // A linear table must not match.
        let linear = "0 2093056 linear 254:2 4096\n";
        assert_eq!(crypt_table_offset(linear), None);

        // Options after the offset are fine.
        let with_opts = "0 2093056 crypt aes-xts-plain64 00000000 0 254:2 4096 1 allow_discards\n";
        assert_eq!(crypt_table_offset(with_opts), Some(4096));
    }
}
