//! The ordered stack of containers over a filesystem.
//!
//! Discovery walks from the outermost device inwards: LUKS and bcache
//! layers are pushed as wrappers, the walk ends at a recognised
//! filesystem. Growing works outer-first, shrinking inner-first, so the
//! data always fits whatever layer is being resized.

use anyhow::Result;

use crate::common::errors::ConvertError;
use crate::common::progress::ProgressListener;
use crate::common::requirements::{require_all, CRYPTSETUP};
use crate::common::units::align_down;
use crate::container::bcache::BcacheBacking;
use crate::container::luks::Luks;
use crate::device::BlockDevice;
use crate::fs::{Filesystem, FsKind};

pub enum Container {
    Luks(Luks),
    Bcache(BcacheBacking),
}

impl Container {
    /// Bytes of overhead this layer adds before its payload.
    fn offset(&self) -> u64 {
        match self {
            Container::Luks(luks) => luks.offset(),
            Container::Bcache(bcache) => bcache.offset(),
        }
    }

    fn read_superblock(&mut self) -> Result<()> {
        match self {
            Container::Luks(luks) => luks.read_superblock(),
            Container::Bcache(bcache) => bcache.read_superblock(),
        }
    }

    fn grow(&mut self, upper_bound: u64) -> Result<u64> {
        match self {
            Container::Luks(luks) => luks.grow(upper_bound),
            Container::Bcache(bcache) => bcache.grow(upper_bound),
        }
    }
}

pub struct BlockStack {
    wrappers: Vec<Container>,
    fs: Filesystem,
}

/// Walk the device's layering and build the stack.
pub fn discover(device: BlockDevice, progress: &dyn ProgressListener) -> Result<BlockStack> {
    let mut wrappers = Vec::new();
    let mut device = device;

    loop {
        let sbtype = device.superblock_type()?;

        if sbtype == "crypto_LUKS" {
            CRYPTSETUP.require(progress)?;
            let mut luks = Luks::new(device);
            let inner = luks.cleartext_device()?;
            wrappers.push(Container::Luks(luks));
            device = inner;
            continue;
        }

        if device.has_bcache_superblock()? {
            let mut bcache = BcacheBacking::new(device);
            bcache.read_superblock()?;
            if !bcache.is_backing() {
                return Err(progress.bail(
                    "BCache device isn't a backing device",
                    ConvertError::unsupported_superblock(&bcache.device.devpath),
                ));
            }
            let inner = bcache.cached_device()?;
            wrappers.push(Container::Bcache(bcache));
            device = inner;
            continue;
        }

        return match FsKind::from_superblock_type(&sbtype) {
            Some(kind) => {
                require_all(kind.required_tools(), progress)?;
                Ok(BlockStack {
                    wrappers,
                    fs: Filesystem::new(device, kind),
                })
            }
            None => {
                let msg = if sbtype.is_empty() {
                    "Unrecognised superblock".to_string()
                } else {
                    format!("Unsupported superblock type: {sbtype}")
                };
                Err(progress.bail(
                    &msg,
                    ConvertError::unsupported_superblock_with(&device.devpath, sbtype),
                ))
            }
        };
    }
}

impl BlockStack {
    #[cfg(test)]
    pub(crate) fn assemble(wrappers: Vec<Container>, fs: Filesystem) -> BlockStack {
        BlockStack { wrappers, fs }
    }

    pub fn fsuuid(&self) -> Result<String> {
        self.fs.fsuuid()
    }

    pub fn fslabel(&self) -> Result<String> {
        self.fs.fslabel()
    }

    /// Total bytes of container overhead above the filesystem.
    pub fn overhead(&self) -> u64 {
        self.wrappers.iter().map(Container::offset).sum()
    }

    /// Bytes of the underlying device the stack occupies: the
    /// filesystem plus every wrapper's overhead.
    pub fn total_data_size(&self) -> u64 {
        self.fs.fssize() + self.overhead()
    }

    pub fn read_superblocks(&mut self) -> Result<()> {
        for wrapper in &mut self.wrappers {
            wrapper.read_superblock()?;
        }
        self.fs.read_superblock()
    }

    pub fn stack_resize(
        &mut self,
        pos: u64,
        shrink: bool,
        progress: &dyn ProgressListener,
    ) -> Result<()> {
        if shrink {
            self.stack_reserve_end_area(pos, progress)
        } else {
            self.stack_grow(pos)
        }
    }

    /// Grow outer layers first so each inner layer always fits inside
    /// an already-enlarged parent.
    fn stack_grow(&mut self, newsize: u64) -> Result<()> {
        let mut current = newsize;
        for wrapper in &mut self.wrappers {
            wrapper.grow(current)?;
            current -= wrapper.offset();
        }
        self.fs.grow(current)?;
        Ok(())
    }

    /// The position each wrapper ends at when the stack ends at `pos`
    /// (outermost first), and the position left for the filesystem.
    fn layer_positions(&self, pos: u64) -> (Vec<u64>, u64) {
        let mut wrapper_pos = Vec::with_capacity(self.wrappers.len());
        let mut current = pos;
        for wrapper in &self.wrappers {
            wrapper_pos.push(current);
            current -= wrapper.offset();
        }
        (wrapper_pos, current)
    }

    /// Shrink the stack so it fits in `pos` bytes of the underlying
    /// device, innermost layer first.
    pub fn stack_reserve_end_area(
        &mut self,
        pos: u64,
        progress: &dyn ProgressListener,
    ) -> Result<()> {
        let inner_pos = align_down(pos - self.overhead(), self.fs.block_size());
        let fstype = self.fs.device.superblock_type()?;

        if self.fs.fssize() > inner_pos {
            let shrink_size = self.fs.fssize() - inner_pos;
            if self.fs.kind.can_shrink() {
                progress.notify(&format!(
                    "Will shrink the filesystem ({fstype}) by {shrink_size} bytes"
                ));
            } else {
                return Err(progress.bail(
                    &format!(
                        "Can't shrink filesystem ({fstype}), but need another \
                         {shrink_size} bytes at the end"
                    ),
                    ConvertError::CantShrink {
                        fstype,
                        needed: shrink_size,
                    },
                ));
            }
        } else {
            progress.notify(&format!(
                "The filesystem ({fstype}) leaves enough room, no need to shrink it"
            ));
        }

        // Even when the topmost fs doesn't move, the wrapper layers
        // still get resized for the new stack end. Innermost first.
        let (wrapper_pos, fs_pos) = self.layer_positions(pos);
        self.fs.reserve_end_area(fs_pos)?;
        for (wrapper, layer_pos) in self.wrappers.iter_mut().zip(wrapper_pos).rev() {
            if let Container::Luks(luks) = wrapper {
                luks.reserve_end_area(layer_pos)?;
            }
        }
        Ok(())
    }

    /// Tear down the stack, topmost layer first. Consumes the stack:
    /// the inner devpaths are obsolete afterwards.
    pub fn deactivate(self) -> Result<()> {
        for wrapper in self.wrappers.into_iter().rev() {
            match wrapper {
                Container::Luks(mut luks) => luks.deactivate()?,
                Container::Bcache(mut bcache) => bcache.deactivate()?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BlockDevice;

    fn sample_stack() -> BlockStack {
        // LUKS with a 2MiB payload offset over bcache with an 8KiB
        // offset over ext4.
        let luks = Luks::with_offset(BlockDevice::fake("/dev/sda2"), 2 * 1024 * 1024);
        let bcache = BcacheBacking::with_offset(BlockDevice::fake("/dev/mapper/ct"), 8192);
        let fs = Filesystem::fake(FsKind::Ext, 4096, 1024);
        BlockStack::assemble(
            vec![Container::Luks(luks), Container::Bcache(bcache)],
            fs,
        )
    }

    #[test]
    fn overhead_sums_wrapper_offsets() {
        let stack = sample_stack();
        assert_eq!(stack.overhead(), 2 * 1024 * 1024 + 8192);
    }

    #[test]
    fn total_data_size_includes_the_filesystem() {
        let stack = sample_stack();
        assert_eq!(stack.total_data_size(), 2 * 1024 * 1024 + 8192 + 4096 * 1024);
    }

    #[test]
    fn layer_positions_walk_the_overheads() {
        let stack = sample_stack();
        let pos: u64 = 64 * 1024 * 1024;
        let (wrapper_pos, fs_pos) = stack.layer_positions(pos);
        // The LUKS layer ends at the stack end; the bcache layer and the
        // filesystem sit deeper by the outer overheads.
        assert_eq!(wrapper_pos, vec![pos, pos - 2 * 1024 * 1024]);
        assert_eq!(fs_pos, pos - 2 * 1024 * 1024 - 8192);
    }

    #[test]
    fn bare_filesystem_has_no_overhead() {
        let stack =
            BlockStack::assemble(Vec::new(), Filesystem::fake(FsKind::Btrfs, 4096, 256));
        assert_eq!(stack.overhead(), 0);
        assert_eq!(stack.total_data_size(), 4096 * 256);
        let (wrapper_pos, fs_pos) = stack.layer_positions(4096 * 256);
        assert!(wrapper_pos.is_empty());
        assert_eq!(fs_pos, 4096 * 256);
    }
}
