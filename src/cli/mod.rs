//! Command-line interface definitions for the `withvol` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `withvol` binary.
#[derive(Debug, Parser)]
#[command(
    name = "withvol",
    version,
    about = "Attach, format, and mount a block volume for the lifetime of one command",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Identifier of the block volume to attach.
    #[arg(long, value_name = "ID")]
    pub(crate) volume: Option<String>,
    /// Directory to mount the volume on (default: /mnt/<volume id>).
    #[arg(long, value_name = "PATH")]
    pub(crate) mountpoint: Option<String>,
    /// Filesystem to create when the volume is blank.
    #[arg(long = "fs", value_name = "TYPE")]
    pub(crate) fs_type: Option<String>,
    /// Seconds to wait for the device to appear after attaching.
    #[arg(long, value_name = "SECS")]
    pub(crate) attach_timeout: Option<u64>,
    /// Log progress at debug level (`RUST_LOG` takes precedence).
    #[arg(short, long)]
    pub(crate) verbose: bool,
    /// Attach and mount the volume, then exit leaving it mounted.
    #[arg(long, conflicts_with = "unmount")]
    pub(crate) mount: bool,
    /// Unmount and detach a volume left mounted by `--mount`.
    #[arg(long)]
    pub(crate) unmount: bool,
    /// Command to run with the volume mounted (use -- to separate flags).
    #[arg(
        trailing_var_arg = true,
        value_name = "COMMAND",
        required_unless_present_any = ["mount", "unmount"],
        conflicts_with_all = ["mount", "unmount"]
    )]
    pub(crate) command: Vec<String>,
}
