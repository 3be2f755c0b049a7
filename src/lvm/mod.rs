//! In-place LVM conversion.
//!
//! The trick: carve one PE out of the end of the filesystem, copy the
//! first PE there, then write LVM metadata over the first PE describing
//! an LV whose segments map the logical bytes back to where they are.
//! The metadata itself is synthesized by the real LVM tools writing into
//! a synthetic device, so the on-disk format is always exactly what the
//! installed LVM version expects.

pub mod vgcfg;

use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use uuid::Uuid;

use crate::common::cmd::{output_of, quiet_call};
use crate::common::errors::ConvertError;
use crate::common::progress::{finish_spinner, spinner, ProgressListener};
use crate::common::requirements::{require_all, DMSETUP, LOSETUP, LVM};
use crate::common::units::{bytes_to_sectors, LVM_PE_SIZE};
use crate::device::BlockDevice;
use crate::stack;
use crate::synth::SyntheticDevice;

/// VG and LV names we generate or accept. Stricter than LVM itself so
/// the names survive every context they end up in.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.')
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

struct LvInfo {
    vgname: String,
    lvname: String,
    active: bool,
}

fn lv_info(device: &BlockDevice) -> Result<LvInfo> {
    let out = output_of(&[
        "lvm",
        "lvs",
        "--noheadings",
        "--rows",
        "--units=b",
        "--nosuffix",
        "-o",
        "vg_name,vg_uuid,lv_name,lv_uuid,lv_attr",
        "--",
        device.devpath.to_str().expect("device paths are ascii"),
    ])?;
    let fields: Vec<&str> = out.split_whitespace().collect();
    anyhow::ensure!(fields.len() == 5, "unexpected lvs output {out:?}");
    let lv_attr = fields[4];
    Ok(LvInfo {
        vgname: fields[0].to_string(),
        lvname: fields[2].to_string(),
        active: lv_attr.as_bytes().get(4) == Some(&b'a'),
    })
}

/// Rotate a logical volume by a single PE.
///
/// Forward moves the first physical extent of the LV to the end;
/// backward moves the last extent to the start. The edit goes through
/// the vgcfg text, with the inverse rotation applied as a self-check
/// before anything is committed.
pub fn rotate_lv(device: &BlockDevice, size: u64, forward: bool, debug: bool) -> Result<()> {
    let info = lv_info(device)?;
    anyhow::ensure!(valid_name(&info.vgname), "unexpected VG name {:?}", info.vgname);
    anyhow::ensure!(valid_name(&info.lvname), "unexpected LV name {:?}", info.lvname);
    let vg_lv = format!("{}/{}", info.vgname, info.lvname);

    // Make sure the volume isn't in use by unmapping it.
    quiet_call(&["lvm", "lvchange", "-an", "--", &vg_lv])?;

    let tdir = tempfile::Builder::new()
        .prefix("blockshift-vgcfg-")
        .tempdir()
        .context("creating a metadata workspace")?;
    let cfg_path = tdir.path().join("vg.cfg");
    let cfg_path_str = cfg_path.to_str().expect("temp paths are ascii");

    print!("Loading LVM metadata... ");
    std::io::stdout().flush().ok();
    quiet_call(&[
        "lvm",
        "vgcfgbackup",
        "--file",
        cfg_path_str,
        "--",
        &info.vgname,
    ])?;

    let backup_text = std::fs::read_to_string(&cfg_path)?;
    let canonical = vgcfg::serialize(&vgcfg::parse(&backup_text)?);

    let mut rotated = vgcfg::parse(&canonical)?;
    vgcfg::rotate(&mut rotated, &info.vgname, &info.lvname, forward, size)?;
    let rotated_text = vgcfg::serialize(&rotated);

    // Apply the inverse to what we are about to commit; it must land
    // exactly on the config we started from, or the transformation is
    // not trustworthy.
    let mut back = vgcfg::parse(&rotated_text)?;
    vgcfg::rotate(&mut back, &info.vgname, &info.lvname, !forward, size)?;
    anyhow::ensure!(
        vgcfg::serialize(&back) == canonical,
        "rotation self-check failed, refusing to commit the edited metadata"
    );
    println!("ok");

    let new_path = tdir.path().join("vg.cfg.new");
    std::fs::write(&new_path, &rotated_text)?;
    if debug {
        eprintln!("rotated config:\n{rotated_text}");
    }

    if forward {
        print!("Rotating the first extent to be the last... ");
    } else {
        print!("Rotating the last extent to be the first... ");
    }
    std::io::stdout().flush().ok();

    quiet_call(&[
        "lvm",
        "vgcfgrestore",
        "--file",
        new_path.to_str().expect("temp paths are ascii"),
        "--",
        &info.vgname,
    ])?;

    // Poke LVM to refresh the mapping.
    quiet_call(&["lvm", "lvchange", "--refresh", "--", &vg_lv])?;
    if info.active {
        quiet_call(&["lvm", "lvchange", "-ay", "--", &vg_lv])?;
    }
    println!("ok");
    Ok(())
}

pub struct ToLvmOptions<'a> {
    pub vg_name: Option<&'a str>,
    pub join: Option<&'a str>,
    pub debug: bool,
}

pub fn cmd_to_lvm(
    device: &BlockDevice,
    opts: &ToLvmOptions<'_>,
    progress: &dyn ProgressListener,
) -> Result<()> {
    if device.superblock_type()? == "LVM2_member" {
        progress.notify("Already a physical volume, removing the existing LVM metadata");
        quiet_call(&[
            "lvm",
            "pvremove",
            "-ff",
            "--",
            device.devpath.to_str().expect("device paths are ascii"),
        ])?;
    }

    // The synthetic device needs the dm and loop tooling too.
    require_all(&[&LVM, &DMSETUP, &LOSETUP], progress)?;

    // Join targets dictate the extent size; otherwise our fixed 4MiB
    // keeps the VG mergeable later.
    let (vgname, pe_size, join_name) = match opts.join {
        Some(join) => {
            let out = output_of(&[
                "lvm",
                "vgs",
                "--noheadings",
                "--rows",
                "--units=b",
                "--nosuffix",
                "-o",
                "vg_name,vg_uuid,vg_extent_size",
                "--",
                join,
            ])?;
            let fields: Vec<&str> = out.split_whitespace().collect();
            anyhow::ensure!(fields.len() == 3, "unexpected vgs output {out:?}");
            let pe_size: u64 = fields[2].parse().context("parsing vg_extent_size")?;
            // A temporary name; the final name is the join target's.
            let vgname = Uuid::new_v4().simple().to_string();
            (vgname, pe_size, Some(fields[0].to_string()))
        }
        None => {
            let vgname = match opts.vg_name {
                Some(name) => name.to_string(),
                None => format!("vg.{}", basename(&device.devpath)),
            };
            (vgname, LVM_PE_SIZE, None)
        }
    };
    anyhow::ensure!(
        valid_name(&vgname),
        "VG name {vgname:?} must match [a-zA-Z0-9.]+"
    );

    let dev_size = device.size()?;
    if dev_size < 2 * pe_size {
        return Err(progress.bail(
            "The device is too small: converting needs at least two physical extents",
            ConvertError::UnsupportedLayout("device smaller than two PEs".into()),
        ));
    }

    let mut block_stack = stack::discover(device.clone(), progress)?;

    let mut lvname = block_stack.fslabel()?;
    if lvname.is_empty() {
        lvname = basename(&device.devpath);
    }
    if !valid_name(&lvname) {
        lvname = "lv1".to_string();
    }

    let pe_sectors = bytes_to_sectors(pe_size);
    let pe_count = dev_size / pe_size - 1;
    let pe_newpos = pe_count * pe_size;
    // Bootloader area, in sectors, matching what pvcreate would reserve.
    let ba_start = 2048;
    let ba_size = 2048;

    if opts.debug {
        eprintln!("pe_size {pe_size} pe_newpos {pe_newpos} devsize {dev_size}");
    }

    block_stack.read_superblocks()?;
    block_stack.stack_reserve_end_area(pe_newpos, progress)?;
    let fsuuid = block_stack.fsuuid()?;
    block_stack.deactivate()?;

    {
        let pb = spinner(format!(
            "Copying {pe_size} bytes from position 0 to position {pe_newpos}"
        ));
        let dev_fd = device.open_excl()?;
        let mut pe_data = vec![0u8; pe_size as usize];
        dev_fd
            .read_exact_at(&mut pe_data, 0)
            .context("reading the first PE")?;
        dev_fd
            .write_all_at(&pe_data, pe_newpos)
            .context("relocating the first PE")?;
        finish_spinner(pb, "Relocated the first physical extent");
        // The exclusive open must end before device-mapper touches the
        // device again.
    }

    print!("Preparing LVM metadata... ");
    std::io::stdout().flush().ok();

    let synth = SyntheticDevice::create(pe_size, dev_size - pe_size, 0)?;
    let synth_path = synth
        .device()
        .devpath
        .to_str()
        .expect("device paths are ascii")
        .to_string();

    let pv_uuid = Uuid::new_v4().to_string();
    let vg_uuid = Uuid::new_v4().to_string();
    let lv_uuid = Uuid::new_v4().to_string();

    let cfg = vgcfg::initial_vg_config(&vgcfg::InitialVg {
        vgname: &vgname,
        vg_uuid: &vg_uuid,
        pv_uuid: &pv_uuid,
        lvname: &lvname,
        lv_uuid: &lv_uuid,
        pe_sectors,
        pe_count,
        ba_start,
        ba_size,
    });

    let mut cfg_file = tempfile::Builder::new()
        .prefix("blockshift-")
        .suffix(".vgcfg")
        .tempfile()
        .context("creating the VG config file")?;
    cfg_file.write_all(vgcfg::serialize(&cfg).as_bytes())?;
    cfg_file.flush()?;
    let cfg_path = cfg_file.path().to_str().expect("temp paths are ascii");

    // Restrict LVM's device scanning to the synthetic device so it
    // cannot go looking at the real disk mid-conversion.
    let lvm_config = format!(
        "devices{{filter=[\"a|^{synth_path}$|\",\"r|.*|\"]}}\
         activation{{verify_udev_operations=1}}"
    );

    quiet_call(&[
        "lvm",
        "pvcreate",
        "--config",
        &lvm_config,
        "--restorefile",
        cfg_path,
        "--uuid",
        &pv_uuid,
        "--zero",
        "y",
        "--",
        &synth_path,
    ])?;
    quiet_call(&[
        "lvm",
        "vgcfgrestore",
        "--config",
        &lvm_config,
        "--file",
        cfg_path,
        "--",
        &vgname,
    ])?;
    println!("ok");

    let staged = synth.finish()?;

    println!(
        "{}",
        format!(
            "If the next stage is interrupted, it can be reverted with:\n    \
             dd if={dev} of={dev} bs={pe_size} count=1 skip={pe_count} conv=notrunc",
            dev = device.devpath.display()
        )
        .yellow()
    );

    print!("Installing LVM metadata... ");
    std::io::stdout().flush().ok();
    {
        let dev_fd = device.open_excl()?;
        staged.copy_to_physical(&dev_fd, 0, None, false)?;
    }
    println!("ok");

    print!("Activating volume group {vgname}... ");
    std::io::stdout().flush().ok();
    quiet_call(&["lvm", "vgchange", "-ay", "--", &vgname])?;
    println!("ok");

    let final_vg = match join_name {
        Some(join_name) => {
            quiet_call(&["lvm", "vgmerge", "--", &join_name, &vgname])?;
            join_name
        }
        None => vgname,
    };

    progress.notify(&format!(
        "Volume group name: {final_vg}\nLogical volume name: {lvname}\nFilesystem uuid: {fsuuid}"
    ));
    Ok(())
}

/// Undo half of a conversion: move the LV's first PE back to the front
/// of the device, so its contents start at the second PE.
pub fn cmd_rotate(
    device: &BlockDevice,
    debug: bool,
    progress: &dyn ProgressListener,
) -> Result<()> {
    LVM.require(progress)?;
    let pe_size = device.lv_extent_size()?;

    if device.superblock_at(pe_size)?.is_empty() {
        anyhow::bail!("no superblock on the second PE, nothing to rotate");
    }

    rotate_lv(device, device.size()?, true, debug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_whitelist() {
        assert!(valid_name("vg.sda1"));
        assert!(valid_name("home2"));
        assert!(!valid_name(""));
        assert!(!valid_name("my home"));
        assert!(!valid_name("vg-0"));
        assert!(!valid_name("vg_0"));
    }

    #[test]
    fn lv_attr_activity_flag() {
        // Position 4 of lv_attr is the activation state.
        assert_eq!("-wi-a-----".as_bytes().get(4), Some(&b'a'));
        assert_eq!("-wi-------".as_bytes().get(4), Some(&b'-'));
    }
}
