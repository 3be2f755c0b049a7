use std::path::PathBuf;

use thiserror::Error;

/// Errors a conversion can surface to the user. Anything else is an
/// internal failure and propagates as a plain `anyhow` error.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unsupported superblock on {}{}", .devpath.display(), details_suffix(.details))]
    UnsupportedSuperblock {
        devpath: PathBuf,
        details: Option<String>,
    },

    #[error("the device layout cannot be handled: {0}")]
    UnsupportedLayout(String),

    #[error("can't shrink the filesystem ({fstype}), but need another {needed} bytes at the end")]
    CantShrink { fstype: String, needed: u64 },

    #[error("no free space immediately before the partition")]
    OverlappingPartition,

    #[error("command `{cmd}` not found, please install the {pkg} package")]
    MissingRequirement { cmd: String, pkg: String },
}

fn details_suffix(details: &Option<String>) -> String {
    match details {
        Some(d) => format!(" ({d})"),
        None => String::new(),
    }
}

impl ConvertError {
    pub fn unsupported_superblock(devpath: impl Into<PathBuf>) -> Self {
        ConvertError::UnsupportedSuperblock {
            devpath: devpath.into(),
            details: None,
        }
    }

    pub fn unsupported_superblock_with(
        devpath: impl Into<PathBuf>,
        details: impl Into<String>,
    ) -> Self {
        ConvertError::UnsupportedSuperblock {
            devpath: devpath.into(),
            details: Some(details.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_message_includes_details() {
        let err = ConvertError::unsupported_superblock_with("/dev/sda1", "magic=XXXX");
        assert_eq!(
            err.to_string(),
            "unsupported superblock on /dev/sda1 (magic=XXXX)"
        );

        let err = ConvertError::unsupported_superblock("/dev/sda1");
        assert_eq!(err.to_string(), "unsupported superblock on /dev/sda1");
    }

    #[test]
    fn missing_requirement_names_package() {
        let err = ConvertError::MissingRequirement {
            cmd: "make-bcache".into(),
            pkg: "bcache-tools".into(),
        };
        assert!(err.to_string().contains("bcache-tools"));
    }
}
