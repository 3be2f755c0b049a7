//! Filesystem adapters.
//!
//! One closed set of variants covering everything the conversions can
//! meet: ext2/3/4, XFS, btrfs, reiserfs, nilfs2 and swap. Each variant
//! knows how to read its superblock, whether it can shrink, and how to
//! drive its resize tool; the shared code handles alignment, temporary
//! mounts and the post-resize verification.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;

use crate::common::cmd::{output_of, output_or_absent, quiet_call};
use crate::common::errors::ConvertError;
use crate::common::requirements::{
    RequiredTool, BTRFS, BTRFS_SHOW_SUPER, E2FSCK, NILFS_RESIZE, NILFS_TUNE, REISERFSTUNE,
    RESIZE2FS, RESIZE_REISERFS, TUNE2FS, XFS_DB, XFS_GROWFS,
};
use crate::common::units::align_down;
use crate::device::BlockDevice;

const SWAP_PAGE_SIZE: u64 = 4096;
const SWAP_MAGIC: &[u8; 10] = b"SWAPSPACE2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext,
    Xfs,
    Btrfs,
    Reiserfs,
    Nilfs,
    Swap,
}

impl FsKind {
    pub fn from_superblock_type(sbtype: &str) -> Option<FsKind> {
        match sbtype {
            "ext2" | "ext3" | "ext4" => Some(FsKind::Ext),
            "xfs" => Some(FsKind::Xfs),
            "btrfs" => Some(FsKind::Btrfs),
            "reiserfs" => Some(FsKind::Reiserfs),
            "nilfs2" => Some(FsKind::Nilfs),
            "swap" => Some(FsKind::Swap),
            _ => None,
        }
    }

    /// The type passed to mount(8).
    pub fn vfstype(self) -> &'static str {
        match self {
            // Covers ext2/3/4; the ext4 driver mounts all three.
            FsKind::Ext => "ext4",
            FsKind::Xfs => "xfs",
            FsKind::Btrfs => "btrfs",
            FsKind::Reiserfs => "reiserfs",
            FsKind::Nilfs => "nilfs2",
            FsKind::Swap => "swap",
        }
    }

    pub fn can_shrink(self) -> bool {
        !matches!(self, FsKind::Xfs)
    }

    fn resize_needs_mpoint(self) -> bool {
        matches!(self, FsKind::Xfs | FsKind::Nilfs)
    }

    /// Whether the superblock reports a byte size directly instead of a
    /// block count.
    fn sb_size_in_bytes(self) -> bool {
        matches!(self, FsKind::Btrfs | FsKind::Nilfs)
    }

    /// The external tools this filesystem's probe and resize paths call.
    pub fn required_tools(self) -> &'static [&'static RequiredTool] {
        const EXT: &[&RequiredTool] = &[&TUNE2FS, &RESIZE2FS, &E2FSCK];
        const XFS: &[&RequiredTool] = &[&XFS_DB, &XFS_GROWFS];
        const BTRFS_TOOLS: &[&RequiredTool] = &[&BTRFS_SHOW_SUPER, &BTRFS];
        const REISERFS: &[&RequiredTool] = &[&REISERFSTUNE, &RESIZE_REISERFS];
        const NILFS: &[&RequiredTool] = &[&NILFS_TUNE, &NILFS_RESIZE];
        match self {
            FsKind::Ext => EXT,
            FsKind::Xfs => XFS,
            FsKind::Btrfs => BTRFS_TOOLS,
            FsKind::Reiserfs => REISERFS,
            FsKind::Nilfs => NILFS,
            // Swap is rewritten directly.
            FsKind::Swap => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ExtState {
    clean: bool,
    mount_tm: i64,
    check_tm: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SwapState {
    big_endian: bool,
    version: u32,
}

#[derive(Debug)]
pub struct Filesystem {
    pub device: BlockDevice,
    pub kind: FsKind,
    block_size: u64,
    block_count: u64,
    size_bytes: u64,
    ext: ExtState,
    btrfs_devid: u64,
    swap: SwapState,
}

impl Filesystem {
    pub fn new(device: BlockDevice, kind: FsKind) -> Filesystem {
        Filesystem {
            device,
            kind,
            block_size: 0,
            block_count: 0,
            size_bytes: 0,
            ext: ExtState::default(),
            btrfs_devid: 0,
            swap: SwapState::default(),
        }
    }

    /// A filesystem with probed sizes filled in, for arithmetic tests.
    #[cfg(test)]
    pub(crate) fn fake(kind: FsKind, block_size: u64, block_count: u64) -> Filesystem {
        let mut fs = Filesystem::new(BlockDevice::fake("/dev/null"), kind);
        fs.block_size = block_size;
        fs.block_count = block_count;
        fs.size_bytes = block_size * block_count;
        fs
    }

    fn devpath_str(&self) -> &str {
        self.device.devpath.to_str().expect("device paths are ascii")
    }

    pub fn block_size(&self) -> u64 {
        assert!(self.block_size != 0, "superblock not read yet");
        self.block_size
    }

    pub fn fssize(&self) -> u64 {
        if self.kind.sb_size_in_bytes() {
            assert!(self.size_bytes % self.block_size() == 0);
            self.size_bytes
        } else {
            self.block_size() * self.block_count
        }
    }

    pub fn read_superblock(&mut self) -> Result<()> {
        self.block_size = 0;
        self.block_count = 0;
        self.size_bytes = 0;

        match self.kind {
            FsKind::Ext => {
                let out = output_of(&["tune2fs", "-l", "--", self.devpath_str()])?;
                self.read_ext_superblock(&out)?;
            }
            FsKind::Xfs => {
                let out = output_of(&[
                    "xfs_db",
                    "-c",
                    "sb 0",
                    "-c",
                    "p dblocks blocksize",
                    "--",
                    self.devpath_str(),
                ])?;
                for line in out.lines() {
                    if let Some(value) = field_after(line, "dblocks =") {
                        self.block_count = value.parse()?;
                    } else if let Some(value) = field_after(line, "blocksize =") {
                        self.block_size = value.parse()?;
                    }
                }
            }
            FsKind::Btrfs => {
                let out = output_of(&["btrfs-show-super", "--", self.devpath_str()])?;
                for line in out.lines() {
                    if let Some(value) = word_value(line, "dev_item.devid") {
                        self.btrfs_devid = value.parse()?;
                    } else if let Some(value) = word_value(line, "sectorsize") {
                        self.block_size = value.parse()?;
                    } else if let Some(value) = word_value(line, "dev_item.total_bytes") {
                        self.size_bytes = value.parse()?;
                    }
                }
            }
            FsKind::Reiserfs => {
                let out = output_of(&["reiserfstune", "--", self.devpath_str()])?;
                for line in out.lines() {
                    if let Some(value) = field_after(line, "Blocksize:") {
                        self.block_size = value.parse()?;
                    } else if let Some(value) =
                        field_after(line, "Count of blocks on the device:")
                    {
                        self.block_count = value.parse()?;
                    }
                }
            }
            FsKind::Nilfs => {
                let out = output_of(&["nilfs-tune", "-l", "--", self.devpath_str()])?;
                for line in out.lines() {
                    if let Some(value) = field_after(line, "Block size:") {
                        self.block_size = value.parse()?;
                    } else if let Some(value) = field_after(line, "Device size:") {
                        self.size_bytes = value.parse()?;
                    }
                }
            }
            FsKind::Swap => {
                let file = self.device.open_excl()?;
                let (big_endian, version, last_page) =
                    read_swap_superblock(&file, &self.device.devpath)?;
                self.swap = SwapState {
                    big_endian,
                    version,
                };
                self.block_size = SWAP_PAGE_SIZE;
                self.block_count = u64::from(last_page) + 1;
            }
        }

        anyhow::ensure!(
            self.block_size != 0,
            "could not read the {} superblock on {}",
            self.kind.vfstype(),
            self.device.devpath.display()
        );
        Ok(())
    }

    fn read_ext_superblock(&mut self, tune2fs_output: &str) -> Result<()> {
        self.ext = ExtState::default();
        for line in tune2fs_output.lines() {
            if let Some(value) = field_after(line, "Block size:") {
                self.block_size = value.parse()?;
            } else if let Some(value) = field_after(line, "Block count:") {
                self.block_count = value.parse()?;
            } else if let Some(value) = field_after(line, "Filesystem state:") {
                self.ext.clean = value == "clean";
            } else if let Some(value) = field_after(line, "Last mount time:") {
                self.ext.mount_tm = parse_e2fs_date(value);
            } else if let Some(value) = field_after(line, "Last checked:") {
                self.ext.check_tm = parse_e2fs_date(value);
            }
        }
        Ok(())
    }

    pub fn fslabel(&self) -> Result<String> {
        let out = output_or_absent(
            &["blkid", "-o", "value", "-s", "LABEL", "--", self.devpath_str()],
            2,
        )?;
        Ok(out.unwrap_or_default())
    }

    pub fn fsuuid(&self) -> Result<String> {
        let out = output_or_absent(
            &["blkid", "-o", "value", "-s", "UUID", "--", self.devpath_str()],
            2,
        )?;
        Ok(out.unwrap_or_default())
    }

    pub fn is_mounted(&self) -> Result<bool> {
        let (major, minor) = self.device.devnum()?;
        if self.kind == FsKind::Swap {
            let swaps = std::fs::read_to_string("/proc/swaps")?;
            for path in swaps_device_paths(&swaps) {
                if let Ok(dev) = BlockDevice::new(&path) {
                    if dev.devnum()? == (major, minor) {
                        return Ok(true);
                    }
                }
            }
            return Ok(false);
        }
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        Ok(mountinfo_lists_devnum(&mountinfo, major, minor))
    }

    fn temp_mount(&self) -> Result<TempMount> {
        TempMount::new(&self.device.devpath, self.kind.vfstype())
    }

    /// Grow up to `upper_bound`, which gets aligned down to the block
    /// size. A no-op when already there.
    pub fn grow(&mut self, upper_bound: u64) -> Result<u64> {
        let newsize = align_down(upper_bound, self.block_size());
        anyhow::ensure!(
            self.fssize() <= newsize,
            "grow target below the current filesystem size"
        );
        if self.fssize() == newsize {
            return Ok(newsize);
        }
        self.mount_and_resize(newsize)?;
        Ok(newsize)
    }

    /// Make sure the filesystem ends at or before `pos`, shrinking it if
    /// needed and possible.
    pub fn reserve_end_area(&mut self, pos: u64) -> Result<u64> {
        // Align to a block boundary that doesn't encroach.
        let pos = align_down(pos, self.block_size());

        if self.fssize() <= pos {
            return Ok(pos);
        }
        if !self.kind.can_shrink() {
            return Err(ConvertError::CantShrink {
                fstype: self.kind.vfstype().to_string(),
                needed: self.fssize() - pos,
            }
            .into());
        }

        self.mount_and_resize(pos)?;
        Ok(pos)
    }

    fn mount_and_resize(&mut self, target: u64) -> Result<()> {
        if self.kind.resize_needs_mpoint() && !self.is_mounted()? {
            let _mount = self.temp_mount()?;
            self.resize(target)?;
        } else {
            self.resize(target)?;
        }

        // Measure again; a resize that silently did something else is
        // worse than a failed one.
        self.read_superblock()?;
        anyhow::ensure!(
            self.fssize() == target,
            "resize left the filesystem at {} instead of {target}",
            self.fssize()
        );
        Ok(())
    }

    fn resize(&mut self, target: u64) -> Result<()> {
        assert!(target % self.block_size() == 0);

        match self.kind {
            FsKind::Ext => {
                // resize2fs requires a checked filesystem. -n won't do:
                // it is strictly read-only and leaves the check time
                // stale in the superblock.
                if !self.is_mounted()?
                    && (!self.ext.clean || self.ext.check_tm < self.ext.mount_tm)
                {
                    println!("Checking the filesystem before resizing it");
                    quiet_call(&["e2fsck", "-f", "-p", "--", self.devpath_str()])?;
                }
                let blocks = (target / self.block_size()).to_string();
                quiet_call(&["resize2fs", "--", self.devpath_str(), &blocks])?;
            }
            FsKind::Xfs => {
                // The caller mounted us; xfs_growfs resolves the mount
                // from the device node.
                let blocks = (target / self.block_size()).to_string();
                quiet_call(&["xfs_growfs", "-D", &blocks, "--", self.devpath_str()])?;
            }
            FsKind::Btrfs => {
                // The device stays EBUSY for a moment after unmounting
                // (bug introduced in Linux 3.0, fixed in 3.9), so always
                // resize on a fresh mount of our own.
                let mount = self.temp_mount()?;
                let target_spec = format!("{}:{}", self.btrfs_devid, target);
                quiet_call(&[
                    "btrfs",
                    "filesystem",
                    "resize",
                    &target_spec,
                    mount.path().to_str().expect("mount points are ascii"),
                ])?;
            }
            FsKind::Reiserfs => {
                let size = target.to_string();
                quiet_call(&["resize_reiserfs", "-q", "-s", &size, "--", self.devpath_str()])?;
            }
            FsKind::Nilfs => {
                let size = target.to_string();
                quiet_call(&["nilfs-resize", "--yes", "--", self.devpath_str(), &size])?;
            }
            FsKind::Swap => {
                // mkswap+swaplabel would drop metadata; patch the header
                // in place instead.
                let last_page = u32::try_from(target / SWAP_PAGE_SIZE - 1)
                    .context("swap size out of range")?;
                let header =
                    encode_swap_header(self.swap.big_endian, self.swap.version, last_page);
                let file = self.device.open_excl()?;
                file.write_all_at(&header, 1024)
                    .context("rewriting the swap header")?;
            }
        }
        Ok(())
    }
}

/// Temporary mount released on drop.
struct TempMount {
    dir: tempfile::TempDir,
}

impl TempMount {
    fn new(devpath: &Path, vfstype: &str) -> Result<TempMount> {
        let dir = tempfile::Builder::new()
            .prefix("privmnt-")
            .tempdir()
            .context("creating a temporary mount point")?;
        quiet_call(&[
            "mount",
            "-t",
            vfstype,
            "-o",
            "noatime,noexec,nodev",
            "--",
            devpath.to_str().expect("device paths are ascii"),
            dir.path().to_str().expect("mount points are ascii"),
        ])?;
        Ok(TempMount { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        let mpoint = self.dir.path().to_string_lossy().into_owned();
        if let Err(err) = quiet_call(&["umount", "--", &mpoint]) {
            eprintln!("warning: failed to unmount {mpoint}: {err}");
        }
    }
}

/// The rest of the line after `prefix`, trimmed. `None` if the line
/// doesn't start with it.
fn field_after<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix).map(str::trim)
}

/// The value of a whitespace-separated `key value` line, matching the
/// key as a whole word.
fn word_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(key)?;
    if rest.is_empty() || !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim())
}

/// tune2fs prints ctime-style dates, or "n/a" for never-mounted.
fn parse_e2fs_date(value: &str) -> i64 {
    if value == "n/a" {
        return 0;
    }
    NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y")
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

fn mountinfo_lists_devnum(mountinfo: &str, major: u64, minor: u64) -> bool {
    let devnum = format!("{major}:{minor}");
    mountinfo
        .lines()
        .any(|line| line.split_whitespace().nth(2) == Some(devnum.as_str()))
}

fn swaps_device_paths(swaps: &str) -> Vec<PathBuf> {
    swaps
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter(|path| path.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}

/// Decode the 8 bytes at offset 1024 of a v1 swap header, trying big
/// endian first.
fn decode_swap_header(buf: &[u8; 8]) -> Option<(bool, u32, u32)> {
    let version = u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes"));
    let last_page = u32::from_be_bytes(buf[4..8].try_into().expect("4 bytes"));
    if version == 1 {
        return Some((true, version, last_page));
    }

    let version = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
    let last_page = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
    if version == 1 {
        return Some((false, version, last_page));
    }
    None
}

fn encode_swap_header(big_endian: bool, version: u32, last_page: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    if big_endian {
        buf[0..4].copy_from_slice(&version.to_be_bytes());
        buf[4..8].copy_from_slice(&last_page.to_be_bytes());
    } else {
        buf[0..4].copy_from_slice(&version.to_le_bytes());
        buf[4..8].copy_from_slice(&last_page.to_le_bytes());
    }
    buf
}

fn read_swap_superblock(file: &File, devpath: &Path) -> Result<(bool, u32, u32)> {
    // Assume 4k pages; bail otherwise.
    let mut magic = [0u8; 10];
    file.read_exact_at(&mut magic, SWAP_PAGE_SIZE - 10)
        .context("reading the swap magic")?;
    if &magic != SWAP_MAGIC {
        // Might be suspend data.
        return Err(ConvertError::unsupported_superblock_with(
            devpath,
            format!("magic={}", String::from_utf8_lossy(&magic)),
        )
        .into());
    }

    let mut header = [0u8; 8];
    file.read_exact_at(&mut header, 1024)
        .context("reading the swap header")?;
    let (big_endian, version, last_page) = decode_swap_header(&header).ok_or_else(|| {
        ConvertError::unsupported_superblock_with(devpath, "swap version is not 1")
    })?;
    if last_page == 0 {
        return Err(
            ConvertError::unsupported_superblock_with(devpath, "last_page=0").into(),
        );
    }
    Ok((big_endian, version, last_page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_type_mapping() {
        assert_eq!(FsKind::from_superblock_type("ext3"), Some(FsKind::Ext));
        assert_eq!(FsKind::from_superblock_type("xfs"), Some(FsKind::Xfs));
        assert_eq!(FsKind::from_superblock_type("crypto_LUKS"), None);
        assert_eq!(FsKind::from_superblock_type(""), None);
    }

    #[test]
    fn xfs_cannot_shrink() {
        assert!(!FsKind::Xfs.can_shrink());
        assert!(FsKind::Ext.can_shrink());
        assert!(FsKind::Btrfs.can_shrink());
    }

    #[test]
    fn ext_superblock_fields() {
        let output = "tune2fs 1.47.0 (5-Feb-2023)\n\
Filesystem volume name:   home\n\
Filesystem state:         clean\n\
Block count:              262144\n\
Block size:               4096\n\
Last mount time:          Tue Jul  1 09:15:42 2025\n\
Last checked:             Mon Jun 30 20:03:11 2025\n";

        let mut fs = Filesystem::new(BlockDevice::fake("/dev/null"), FsKind::Ext);
        fs.read_ext_superblock(output).unwrap();
        assert_eq!(fs.block_size, 4096);
        assert_eq!(fs.block_count, 262144);
        assert!(fs.ext.clean);
        // Checked before the last mount: a resize must fsck first.
        assert!(fs.ext.check_tm < fs.ext.mount_tm);
        assert_eq!(fs.fssize(), 262144 * 4096);
    }

    #[test]
    fn e2fs_dates() {
        assert_eq!(parse_e2fs_date("n/a"), 0);
        let t = parse_e2fs_date("Thu Jan  1 00:00:01 1970");
        assert_eq!(t, 1);
    }

    #[test]
    fn word_values_match_whole_words() {
        assert_eq!(word_value("sectorsize\t4096", "sectorsize"), Some("4096"));
        assert_eq!(word_value("sectorsize_v2 4096", "sectorsize"), None);
        assert_eq!(
            word_value("dev_item.total_bytes\t1073741824", "dev_item.total_bytes"),
            Some("1073741824")
        );
    }

    #[test]
    fn swap_header_round_trip() {
        for big_endian in [false, true] {
            let buf = encode_swap_header(big_endian, 1, 262143);
            let (be, version, last_page) = decode_swap_header(&buf).unwrap();
            assert_eq!(be, big_endian);
            assert_eq!(version, 1);
            assert_eq!(last_page, 262143);
        }
    }

    #[test]
    fn swap_header_rejects_unknown_versions() {
        let buf = encode_swap_header(true, 2, 100);
        assert!(decode_swap_header(&buf).is_none());
    }

    #[test]
    fn mountinfo_matching() {
        let mountinfo = "\
22 63 0:21 / /proc rw,nosuid shared:12 - proc proc rw\n\
63 1 254:1 / / rw,relatime shared:1 - ext4 /dev/vda1 rw\n";
        assert!(mountinfo_lists_devnum(mountinfo, 254, 1));
        assert!(!mountinfo_lists_devnum(mountinfo, 254, 2));
    }

    #[test]
    fn swaps_paths() {
        let swaps = "\
Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
/dev/dm-2                               partition\t8388604\t\t0\t\t-2\n";
        assert_eq!(swaps_device_paths(swaps), vec![PathBuf::from("/dev/dm-2")]);
    }
}
