//! External tool availability checks.
//!
//! Conversions depend on a fleet of external programs. Each one is
//! declared here with the package that ships it, so a missing tool
//! produces an actionable message before anything touches the disk.

use anyhow::Result;

use crate::common::errors::ConvertError;
use crate::common::progress::ProgressListener;

#[derive(Debug, Clone, Copy)]
pub struct RequiredTool {
    pub cmd: &'static str,
    pub pkg: &'static str,
}

impl RequiredTool {
    pub fn is_installed(&self) -> bool {
        which::which(self.cmd).is_ok()
    }

    pub fn require(&self, progress: &dyn ProgressListener) -> Result<()> {
        if self.is_installed() {
            return Ok(());
        }
        Err(progress.bail(
            &format!(
                "Command `{}` not found, please install the {} package",
                self.cmd, self.pkg
            ),
            ConvertError::MissingRequirement {
                cmd: self.cmd.to_string(),
                pkg: self.pkg.to_string(),
            },
        ))
    }
}

pub static BLKID: RequiredTool = RequiredTool {
    cmd: "blkid",
    pkg: "util-linux",
};
pub static BLOCKDEV: RequiredTool = RequiredTool {
    cmd: "blockdev",
    pkg: "util-linux",
};
pub static LOSETUP: RequiredTool = RequiredTool {
    cmd: "losetup",
    pkg: "util-linux",
};
pub static SFDISK: RequiredTool = RequiredTool {
    cmd: "sfdisk",
    pkg: "util-linux",
};
pub static UDEVADM: RequiredTool = RequiredTool {
    cmd: "udevadm",
    pkg: "systemd",
};
pub static DMSETUP: RequiredTool = RequiredTool {
    cmd: "dmsetup",
    pkg: "dmsetup",
};
pub static LVM: RequiredTool = RequiredTool {
    cmd: "lvm",
    pkg: "lvm2",
};
pub static CRYPTSETUP: RequiredTool = RequiredTool {
    cmd: "cryptsetup",
    pkg: "cryptsetup",
};
pub static MAKE_BCACHE: RequiredTool = RequiredTool {
    cmd: "make-bcache",
    pkg: "bcache-tools",
};
pub static BCACHE_SUPER_SHOW: RequiredTool = RequiredTool {
    cmd: "bcache-super-show",
    pkg: "bcache-tools",
};
pub static RESIZE2FS: RequiredTool = RequiredTool {
    cmd: "resize2fs",
    pkg: "e2fsprogs",
};
pub static E2FSCK: RequiredTool = RequiredTool {
    cmd: "e2fsck",
    pkg: "e2fsprogs",
};
pub static TUNE2FS: RequiredTool = RequiredTool {
    cmd: "tune2fs",
    pkg: "e2fsprogs",
};
pub static XFS_GROWFS: RequiredTool = RequiredTool {
    cmd: "xfs_growfs",
    pkg: "xfsprogs",
};
pub static XFS_DB: RequiredTool = RequiredTool {
    cmd: "xfs_db",
    pkg: "xfsprogs",
};
pub static BTRFS: RequiredTool = RequiredTool {
    cmd: "btrfs",
    pkg: "btrfs-progs",
};
pub static BTRFS_SHOW_SUPER: RequiredTool = RequiredTool {
    cmd: "btrfs-show-super",
    pkg: "btrfs-progs",
};
pub static RESIZE_REISERFS: RequiredTool = RequiredTool {
    cmd: "resize_reiserfs",
    pkg: "reiserfsprogs",
};
pub static REISERFSTUNE: RequiredTool = RequiredTool {
    cmd: "reiserfstune",
    pkg: "reiserfsprogs",
};
pub static NILFS_RESIZE: RequiredTool = RequiredTool {
    cmd: "nilfs-resize",
    pkg: "nilfs-tools",
};
pub static NILFS_TUNE: RequiredTool = RequiredTool {
    cmd: "nilfs-tune",
    pkg: "nilfs-tools",
};

pub fn require_all(tools: &[&RequiredTool], progress: &dyn ProgressListener) -> Result<()> {
    for tool in tools {
        tool.require(progress)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::progress::QuietProgress;

    #[test]
    fn present_tool_passes() {
        let tool = RequiredTool {
            cmd: "sh",
            pkg: "shell",
        };
        tool.require(&QuietProgress).unwrap();
    }

    #[test]
    fn absent_tool_names_the_package() {
        let tool = RequiredTool {
            cmd: "definitely-not-a-real-command",
            pkg: "no-such-package",
        };
        let err = tool.require(&QuietProgress).unwrap_err();
        let kind = err.downcast_ref::<ConvertError>().unwrap();
        match kind {
            ConvertError::MissingRequirement { pkg, .. } => {
                assert_eq!(pkg, "no-such-package");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
