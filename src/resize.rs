//! Coordinated resize of a whole stack.
//!
//! Growing: enlarge the device first, then let each layer expand into
//! it, outermost first. Shrinking: pull the filesystem in first, walk
//! the wrappers inwards-out, and only then cut the device down to the
//! data. Either way the data never hangs over the edge of any layer.

use anyhow::Result;

use crate::common::progress::ProgressListener;
use crate::common::requirements::{require_all, LVM, SFDISK, UDEVADM};
use crate::device::BlockDevice;
use crate::stack;

pub fn cmd_resize(
    device: &BlockDevice,
    newsize: u64,
    resize_device: bool,
    progress: &dyn ProgressListener,
) -> Result<()> {
    if resize_device {
        if device.is_partition()? {
            require_all(&[&SFDISK, &UDEVADM], progress)?;
        } else if device.is_lv()? {
            LVM.require(progress)?;
        }
    }

    let mut block_stack = stack::discover(device.clone(), progress)?;

    let device_delta = newsize as i64 - device.size()? as i64;

    let mut newsize = newsize;
    if device_delta > 0 && resize_device {
        device.dev_resize(newsize, false)?;
        // The device may come back larger: partition alignment rounds
        // up, and LVM extends in whole extents.
        newsize = device.size()?;
    }

    block_stack.read_superblocks()?;
    anyhow::ensure!(
        block_stack.total_data_size() <= device.size()?,
        "the stack is larger than its device; refusing to touch it"
    );

    let data_delta = newsize as i64 - block_stack.total_data_size() as i64;
    if data_delta == 0 {
        progress.notify("The stack already ends at the requested size");
    } else {
        block_stack.stack_resize(newsize, data_delta < 0, progress)?;
    }

    if device_delta < 0 && resize_device {
        let total_data_size = block_stack.total_data_size();
        // LVM can reload in-use volumes; the kernel's partition table
        // handling can't, so partitions get torn down first.
        if device.is_partition()? {
            block_stack.deactivate()?;
        }
        device.dev_resize(total_data_size, true)?;
    }

    Ok(())
}
