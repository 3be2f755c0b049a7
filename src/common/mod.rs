pub mod cmd;
pub mod errors;
pub mod progress;
pub mod requirements;
pub mod units;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolve the `/dev` path of a sysfs block directory by reading its
/// `uevent` file.
pub fn devpath_from_sysdir(sysdir: &Path) -> Result<PathBuf> {
    let uevent = sysdir.join("uevent");
    let contents = std::fs::read_to_string(&uevent)
        .with_context(|| format!("reading {}", uevent.display()))?;

    for line in contents.lines() {
        if let Some(name) = line.strip_prefix("DEVNAME=") {
            return Ok(PathBuf::from("/dev").join(name));
        }
    }

    anyhow::bail!("no DEVNAME in {}", uevent.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devpath_from_uevent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("uevent"),
            "MAJOR=254\nMINOR=3\nDEVNAME=dm-3\nDEVTYPE=disk\n",
        )
        .unwrap();
        let devpath = devpath_from_sysdir(dir.path()).unwrap();
        assert_eq!(devpath, PathBuf::from("/dev/dm-3"));
    }

    #[test]
    fn devpath_missing_devname() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uevent"), "MAJOR=254\nMINOR=3\n").unwrap();
        assert!(devpath_from_sysdir(dir.path()).is_err());
    }
}
