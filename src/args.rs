use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::scheduler::DEFAULT_LABEL_PREFIX;
use crate::zfs_types::*;

#[derive(Parser, Debug)]
#[command(name = "guarddog", about = "Snapshots ZFS datasets on the cadence set in their properties", version)]
#[command(rename_all = "snake_case")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Pool to watch; repeat for several. Watches every pool if not given.
    #[arg(long = "pool", global = true)]
    pub pools: Vec<PoolName>,
    /// Seconds between refreshes of each pool's datasets and snapshots.
    #[arg(long, default_value_t = 300, global = true)]
    pub refresh_interval: u64,
    /// User property holding a dataset's snapshot policy, e.g. `24h,0.5h:45`.
    #[arg(long, default_value = "com.guarddog:auto-snapshot", global = true)]
    pub property: String,
    /// Prefix of created snapshot names.
    #[arg(long, default_value = DEFAULT_LABEL_PREFIX, global = true)]
    pub label_prefix: String,

    /// Path to the `zfs` binary.
    #[arg(long, default_value = "zfs", global = true)]
    pub zfs: PathBuf,
    /// Path to the `zpool` binary.
    #[arg(long, default_value = "zpool", global = true)]
    pub zpool: PathBuf,

    /// Log snapshot commands instead of running them.
    #[arg(long, default_value_t = false, global = true)]
    pub dry_run: bool,
    /// Reschedule whenever a refresh finds datasets joining or leaving a policy. Otherwise
    /// schedules are only rebuilt at startup and on interrupt.
    #[arg(long, default_value_t = false, global = true)]
    pub reschedule_on_change: bool,

    /// More logging: -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Only log errors.
    #[arg(short, long, default_value_t = false, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Command {
    /// Run the snapshot daemon (the default).
    #[default]
    Run,
    /// Print pools and their snapshot policies as JSON, then exit.
    Status,
}
