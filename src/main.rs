#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
#![cfg_attr(
    test,
    allow(clippy::panic, clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)
)]

use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

mod args;
use args::*;
mod typed_command;
mod zfs_types;
use zfs_types::*;
mod snapshot_command;
mod commands;
mod zfs;
use zfs::*;
mod organised_data;
mod timer;
mod pool_watcher;
use pool_watcher::*;
mod scheduler;
use scheduler::*;
mod status;

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("guarddog={}", level).parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// One populated watcher per selected pool (every pool if none are selected). Failing to list
/// pools, a selected pool that doesn't exist, or nothing to watch at all is fatal.
fn build_watchers(zfs: &Arc<dyn Zfs>, selected: &[PoolName]) -> anyhow::Result<Vec<Arc<PoolWatcher>>> {
    let pools = Pool::all(&**zfs).context("cannot enumerate pools")?;
    for name in selected {
        if !pools.iter().any(|p| &p.name == name) {
            anyhow::bail!("pool `{}` not found", name);
        }
    }

    let pools: Vec<Pool> = pools
        .into_iter()
        .filter(|p| selected.is_empty() || selected.contains(&p.name))
        .collect();
    if pools.is_empty() {
        anyhow::bail!("no pools to watch");
    }

    pools
        .into_iter()
        .map(|pool| {
            let name = pool.name.clone();
            PoolWatcher::new(pool, Arc::clone(zfs))
                .map(Arc::new)
                .with_context(|| format!("cannot watch pool `{}`", name))
        })
        .collect()
}

fn run_daemon(args: &Args, zfs: Arc<dyn Zfs>, watchers: Vec<Arc<PoolWatcher>>) -> anyhow::Result<()> {
    let scheduler = Arc::new(Scheduler::new(
        watchers.clone(),
        zfs,
        SchedulerConfig::starting_today(args.label_prefix.clone()),
    )?);

    let interval = Duration::from_secs(args.refresh_interval.max(1));
    let (changes_tx, changes_rx) = mpsc::channel::<PoolName>();
    let refresh_loops = watchers
        .iter()
        .map(|w| w.spawn_refresh_loop(interval, args.reschedule_on_change.then(|| changes_tx.clone())))
        .collect::<anyhow::Result<Vec<_>>>()?;
    drop(changes_tx);

    if args.reschedule_on_change {
        let scheduler = Arc::clone(&scheduler);
        std::thread::Builder::new()
            .name("reconcile".to_string())
            .spawn(move || {
                // Ends when the refresh loops are gone.
                for pool in changes_rx {
                    info!("Pool {} changed, rescheduling", pool);
                    if let Err(e) = scheduler.full_reschedule() {
                        error!("Reschedule failed: {:#}", e);
                    }
                }
            })
            .context("failed to spawn reconcile thread")?;
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    {
        let scheduler = Arc::downgrade(&scheduler);
        ctrlc::set_handler(move || {
            info!("Received interrupt, rescheduling before exit");
            if let Some(scheduler) = scheduler.upgrade() {
                if let Err(e) = scheduler.full_reschedule() {
                    error!("Reschedule failed: {:#}", e);
                }
            }
            let _ = shutdown_tx.send(());
        })
        .context("failed to install interrupt handler")?;
    }

    info!(
        "guarddog running: {} pools, {} policies, refresh every {}s",
        scheduler.watchers().len(),
        scheduler.armed().len(),
        interval.as_secs()
    );
    let _ = shutdown_rx.recv();

    info!("Shutting down...");
    drop(refresh_loops);
    drop(scheduler);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    info!("guarddog {} starting", env!("CARGO_PKG_VERSION"));

    let zfs: Arc<dyn Zfs> = Arc::new(CommandZfs {
        zfs: args.zfs.clone(),
        zpool: args.zpool.clone(),
        policy_property: args.property.clone(),
        dry_run: args.dry_run,
    });
    let watchers = build_watchers(&zfs, &args.pools)?;

    match args.command.unwrap_or_default() {
        Command::Run => run_daemon(&args, zfs, watchers),
        Command::Status => {
            let report = status::status_report(watchers.iter().map(|w| &**w), Utc::now());
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
