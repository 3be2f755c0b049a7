use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod bcache;
mod common;
mod container;
mod device;
mod fs;
mod lvm;
mod resize;
mod stack;
mod synth;

use common::cmd;
use common::errors::ConvertError;
use common::progress::CliProgress;
use common::requirements::{require_all, BLKID, BLOCKDEV};
use common::units::parse_size_arg;
use device::BlockDevice;

/// Convert block devices between plain, LVM and bcache layouts without
/// moving the data.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print every external command before running it
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert a filesystem into an LVM logical volume, in place
    #[command(alias = "lvmify")]
    ToLvm {
        /// Name for the new volume group
        #[arg(long, conflicts_with = "join")]
        vg_name: Option<String>,
        /// Merge into this existing volume group
        #[arg(long)]
        join: Option<String>,
        /// The device holding the filesystem (path or UUID=...)
        device: String,
    },
    /// Turn a device into a bcache backing device, in place
    ToBcache {
        /// Attach to this existing cache set (cset uuid)
        #[arg(long)]
        join: Option<String>,
        /// The partition, LV or LUKS device to convert (path or UUID=...)
        device: String,
    },
    /// Resize a filesystem stack, optionally with its device
    Resize {
        /// Also resize the containing partition or LV
        #[arg(long)]
        resize_device: bool,
        /// The outermost device of the stack (path or UUID=...)
        device: String,
        /// New size: decimal bytes with an optional bkmgtpe suffix
        size: String,
    },
    /// Rotate an LV's contents so they start at the second PE
    Rotate {
        /// The logical volume to rotate (path or UUID=...)
        device: String,
    },
}

fn resolve_device(arg: &str, progress: &CliProgress) -> Result<BlockDevice> {
    // Everything after this point is probing, so the probe tools are
    // always needed.
    require_all(&[&BLKID, &BLOCKDEV], progress)?;
    match arg.strip_prefix("UUID=") {
        Some(uuid) => BlockDevice::by_uuid(uuid),
        None => BlockDevice::new(arg),
    }
}

fn run(cli: &Cli) -> Result<()> {
    let progress = CliProgress;

    match &cli.command {
        Commands::ToLvm {
            vg_name,
            join,
            device,
        } => {
            let device = resolve_device(device, &progress)?;
            lvm::cmd_to_lvm(
                &device,
                &lvm::ToLvmOptions {
                    vg_name: vg_name.as_deref(),
                    join: join.as_deref(),
                    debug: cli.debug,
                },
                &progress,
            )
        }
        Commands::ToBcache { join, device } => {
            let device = resolve_device(device, &progress)?;
            bcache::cmd_to_bcache(&device, join.as_deref(), cli.debug, &progress)
        }
        Commands::Resize {
            resize_device,
            device,
            size,
        } => {
            let newsize = parse_size_arg(size)?;
            let device = resolve_device(device, &progress)?;
            resize::cmd_resize(&device, newsize, *resize_device, &progress)
        }
        Commands::Rotate { device } => {
            let device = resolve_device(device, &progress)?;
            lvm::cmd_rotate(&device, cli.debug, &progress)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cmd::set_debug(cli.debug);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", format!("{err:#}").red());
            // Conversion-specific failures are fatal internal errors;
            // everything else is assumed to be user error.
            if err.downcast_ref::<ConvertError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
