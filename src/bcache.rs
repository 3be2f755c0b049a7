//! In-place bcache conversion.
//!
//! All three strategies reserve a small area at the head of the data
//! region, have make-bcache write a backing superblock into a synthetic
//! device sized like the real one, and install the captured bytes with
//! one verified write. What differs is how the space is found: free
//! space before a partition, slack between a LUKS header and its
//! payload, or a whole PE rotated to the front of an LV.

use std::io::Write;

use anyhow::{Context, Result};

use crate::common::errors::ConvertError;
use crate::common::progress::ProgressListener;
use crate::common::requirements::{
    require_all, BCACHE_SUPER_SHOW, DMSETUP, LOSETUP, LVM, MAKE_BCACHE, SFDISK, UDEVADM,
};
use crate::common::units::bytes_to_sectors;
use crate::container::bcache::BcacheBacking;
use crate::container::luks::Luks;
use crate::device::BlockDevice;
use crate::lvm;
use crate::stack;
use crate::synth::{StagedImage, SyntheticDevice};

/// The smallest and most compatible bcache data offset, for the LUKS
/// strategy where every sector between header and payload counts.
const LUKS_BSB_SIZE: u64 = 512 * 16;

/// Partitions get a full alignment unit so the shifted boundary stays
/// 1MiB-aligned.
const PART_BSB_SIZE: u64 = 1024 * 1024;

/// Run make-bcache against a synthetic device and capture the backing
/// superblock it writes.
fn make_bcache_sb(bsb_size: u64, data_size: u64, cset_uuid: Option<&str>) -> Result<StagedImage> {
    let synth = SyntheticDevice::create(bsb_size, data_size, 0)?;
    let synth_path = synth
        .device()
        .devpath
        .to_str()
        .expect("device paths are ascii")
        .to_string();

    let data_offset = bytes_to_sectors(bsb_size).to_string();
    let mut argv: Vec<&str> = vec!["make-bcache", "--bdev", "--data_offset", data_offset.as_str()];
    if let Some(uuid) = cset_uuid {
        argv.extend(["--cset-uuid", uuid]);
    }
    argv.push(synth_path.as_str());
    crate::common::cmd::quiet_call(&argv)?;

    // Read the superblock back through the synthetic device; its offset
    // must be exactly the space we are reserving.
    let mut backing = BcacheBacking::new(synth.device().clone());
    backing.read_superblock()?;
    anyhow::ensure!(
        backing.offset() == bsb_size,
        "make-bcache put the data at {} instead of {bsb_size}",
        backing.offset()
    );

    synth.finish()
}

/// Reserve one PE at the end of the LV, write the superblock there, and
/// rotate the LV so that PE becomes logically first.
fn lv_to_bcache(
    device: &BlockDevice,
    debug: bool,
    progress: &dyn ProgressListener,
    join: Option<&str>,
) -> Result<()> {
    LVM.require(progress)?;
    let pe_size = device.lv_extent_size()?;
    let dev_size = device.size()?;
    anyhow::ensure!(
        dev_size % pe_size == 0,
        "LV size is not a whole number of extents"
    );
    let data_size = dev_size - pe_size;

    let mut block_stack = stack::discover(device.clone(), progress)?;
    block_stack.read_superblocks()?;
    block_stack.stack_reserve_end_area(data_size, progress)?;
    block_stack.deactivate()?;

    let staged = make_bcache_sb(pe_size, data_size, join)?;

    print!("Copying the bcache superblock... ");
    std::io::stdout().flush().ok();
    {
        let dev_fd = device.open_excl()?;
        let shift = -i64::try_from(pe_size).context("extent size out of range")?;
        staged.copy_to_physical(&dev_fd, shift, None, false)?;
    }
    println!("ok");

    lvm::rotate_lv(device, dev_size, false, debug)
}

/// Shift the LUKS header 16 sectors right and put the superblock in the
/// vacated space.
fn luks_to_bcache(
    device: &BlockDevice,
    _debug: bool,
    progress: &dyn ProgressListener,
    join: Option<&str>,
) -> Result<()> {
    let mut luks = Luks::new(device.clone());
    luks.deactivate()?;

    let dev_fd = device.open_excl()?;
    luks.read_superblock()?;
    luks.read_superblock_ll(&dev_fd)?;

    let shift_by = LUKS_BSB_SIZE;
    if luks.sb_end() + shift_by > luks.offset() {
        return Err(progress.bail(
            "The LUKS key slots leave no room for a bcache superblock",
            ConvertError::UnsupportedLayout(
                "LUKS header has no slack before the payload".into(),
            ),
        ));
    }

    let data_size = device.size()? - shift_by;
    let staged = make_bcache_sb(shift_by, data_size, join)?;

    // Not atomic: the header is rewritten first, then overlaid with the
    // bcache superblock. Both writes are read-back verified.
    print!("Shifting and editing the LUKS superblock... ");
    std::io::stdout().flush().ok();
    luks.shift_sb(&dev_fd, shift_by)?;
    println!("ok");

    print!("Copying the bcache superblock... ");
    std::io::stdout().flush().ok();
    staged.copy_to_physical(&dev_fd, 0, None, false)?;
    println!("ok");

    Ok(())
}

/// Claim free space immediately before the partition, write the
/// superblock there, then move the partition boundary onto it.
fn part_to_bcache(
    device: &BlockDevice,
    _debug: bool,
    progress: &dyn ProgressListener,
    join: Option<&str>,
) -> Result<()> {
    require_all(&[&SFDISK, &UDEVADM], progress)?;

    let bsb_size = PART_BSB_SIZE;
    let data_size = device.size()?;

    let (ptable, part_start) = device.ptable_context()?;

    let ptype = ptable.disk.ptable_type()?;
    if ptype != "dos" && ptype != "gpt" {
        return Err(progress.bail(
            &format!("Cannot edit a {ptype:?} partition table"),
            ConvertError::UnsupportedLayout(format!(
                "unsupported partition table type {ptype:?}"
            )),
        ));
    }

    ptable.reserve_space_before(part_start, bsb_size, progress)?;
    let part_start1 = part_start - bsb_size;

    let staged = make_bcache_sb(bsb_size, data_size, join)?;

    print!("Copying the bcache superblock... ");
    std::io::stdout().flush().ok();
    {
        let disk_fd = ptable.disk.open_excl()?;
        let shift = i64::try_from(part_start1).context("partition offset out of range")?;
        staged.copy_to_physical(&disk_fd, shift, None, true)?;
    }
    println!("ok");

    // Hold the partition exclusively while the table is reloaded; the
    // kernel refuses to reread tables with in-use partitions.
    let _part_fd = device.open_excl()?;

    print!("Shifting the partition to start on the bcache superblock... ");
    std::io::stdout().flush().ok();
    ptable.shift_left(part_start, part_start1)?;
    println!("ok");

    device.reset_size();
    Ok(())
}

pub fn cmd_to_bcache(
    device: &BlockDevice,
    join: Option<&str>,
    debug: bool,
    progress: &dyn ProgressListener,
) -> Result<()> {
    if device.has_bcache_superblock()? {
        anyhow::bail!(
            "device {} already has a bcache superblock",
            device.devpath.display()
        );
    }

    require_all(
        &[&MAKE_BCACHE, &BCACHE_SUPER_SHOW, &DMSETUP, &LOSETUP],
        progress,
    )?;

    if device.is_partition()? {
        part_to_bcache(device, debug, progress, join)
    } else if device.is_lv()? {
        lv_to_bcache(device, debug, progress, join)
    } else if device.superblock_type()? == "crypto_LUKS" {
        luks_to_bcache(device, debug, progress, join)
    } else {
        Err(progress.bail(
            &format!(
                "Device {} is not a partition, a logical volume, or a LUKS volume",
                device.devpath.display()
            ),
            ConvertError::UnsupportedLayout(
                "bcache conversion needs a partition, LV or LUKS device".into(),
            ),
        ))
    }
}
