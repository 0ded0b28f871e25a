use std::collections::BTreeMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, error, info};

use crate::organised_data::*;
use crate::pool_watcher::PoolWatcher;
use crate::snapshot_command::SnapshotCommand;
use crate::timer::{schedule_recurring, TimerHandle};
use crate::zfs::Zfs;
use crate::zfs_types::*;

pub const DEFAULT_LABEL_PREFIX: &str = "guarddog_";
const LABEL_FORMAT: &str = "%Y-%m-%d_%H:%M:%S%.3f";

/// Snapshot label for a firing of `command` at `now`, e.g.
/// `guarddog_2025-10-12_21:40:13.000_1h`. Millisecond resolution, in UTC. The policy suffix
/// keeps policies that fire together on one dataset from colliding.
pub fn snapshot_label(prefix: &str, command: &SnapshotCommand, now: DateTime<Utc>) -> String {
    format!("{}{}_{}", prefix, now.format(LABEL_FORMAT), command)
}

/// Midnight at the start of `now`'s calendar day, in `now`'s own time zone.
pub fn start_of_day<Tz: TimeZone>(now: DateTime<Tz>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| now.timezone().from_local_datetime(&midnight).earliest())
        .map_or_else(|| now.with_timezone(&Utc), |midnight| midnight.with_timezone(&Utc))
}

/// Snapshot every dataset in `datasets` under one label. Datasets are grouped per pool so each
/// pool's snapshots are taken atomically; a failure in one pool doesn't stop the others.
/// Returns how many snapshots were created.
pub fn take_snapshots(
    zfs: &dyn Zfs,
    label_prefix: &str,
    command: &SnapshotCommand,
    datasets: &[Dataset],
    now: DateTime<Utc>,
) -> usize {
    let label = snapshot_label(label_prefix, command, now);
    let mut by_pool = BTreeMap::<&str, Vec<SnapshotFullName>>::new();
    for dataset in datasets {
        by_pool
            .entry(&dataset.pool)
            .or_default()
            .push(format!("{}@{}", dataset.name, label));
    }

    let mut created = 0;
    for (pool, snapshots) in by_pool {
        match zfs.create_snapshots(&snapshots) {
            Ok(()) => {
                info!("[{}] created {} in pool {}", command, snapshots.join(" "), pool);
                created += snapshots.len();
            }
            Err(e) => error!("[{}] failed to snapshot pool {}: {:#}", command, pool, e),
        }
    }
    created
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Every timer fires at `anchor + k * interval`, so rescheduling never shifts the phase.
    pub anchor: DateTime<Utc>,
    pub label_prefix: String,
}
impl SchedulerConfig {
    pub fn starting_today(label_prefix: String) -> Self {
        Self {
            anchor: start_of_day(chrono::Local::now()),
            label_prefix,
        }
    }
}

/// Outcome of a full reschedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rescheduled {
    pub cancelled: usize,
    pub armed: usize,
    pub fired_immediately: usize,
}

/// Sent by a timer when it elapses. `generation` tells events from timers a later reschedule
/// has cancelled apart from current ones.
#[derive(Debug, Clone, Copy)]
struct TimerEvent {
    command: SnapshotCommand,
    generation: u64,
}

struct ArmedTimer {
    generation: u64,
    /// Captured at arming; topology changes need a reschedule to be seen.
    datasets: Vec<Dataset>,
    handle: TimerHandle,
}

#[derive(Default)]
struct Armed {
    generation: u64,
    timers: BTreeMap<SnapshotCommand, ArmedTimer>,
}
impl Armed {
    fn cancel_all(&mut self) -> usize {
        let timers = std::mem::take(&mut self.timers);
        let cancelled = timers.len();
        for timer in timers.into_values() {
            timer.handle.cancel();
        }
        cancelled
    }
}

/// Keeps one recurring timer per distinct policy across all watched pools, and snapshots the
/// policy's datasets each time it fires.
pub struct Scheduler {
    watchers: Vec<Arc<PoolWatcher>>,
    zfs: Arc<dyn Zfs>,
    config: SchedulerConfig,
    /// Only touched by `full_reschedule` (and read by the dispatcher to resolve events).
    armed: Arc<Mutex<Armed>>,
    events: Sender<TimerEvent>,
}
impl Scheduler {
    /// Start the dispatcher and perform the first full reschedule.
    pub fn new(watchers: Vec<Arc<PoolWatcher>>, zfs: Arc<dyn Zfs>, config: SchedulerConfig) -> anyhow::Result<Self> {
        let (events, events_rx) = mpsc::channel::<TimerEvent>();
        let armed = Arc::new(Mutex::new(Armed::default()));

        {
            let armed = Arc::clone(&armed);
            let zfs = Arc::clone(&zfs);
            let label_prefix = config.label_prefix.clone();
            std::thread::Builder::new()
                .name("snapshot dispatcher".to_string())
                .spawn(move || {
                    // Ends once the scheduler and all its timers are gone.
                    for event in events_rx {
                        let datasets = match lock(&armed).timers.get(&event.command) {
                            Some(timer) if timer.generation == event.generation => timer.datasets.clone(),
                            _ => {
                                debug!("[{}] ignoring event from a cancelled timer", event.command);
                                continue;
                            }
                        };
                        take_snapshots(&*zfs, &label_prefix, &event.command, &datasets, Utc::now());
                    }
                })?;
        }

        let scheduler = Self {
            watchers,
            zfs,
            config,
            armed,
            events,
        };
        scheduler.full_reschedule()?;
        Ok(scheduler)
    }

    pub fn watchers(&self) -> &[Arc<PoolWatcher>] {
        &self.watchers
    }

    /// Cancel every timer, then rebuild them from the watchers' current cadence groups. Groups
    /// that are overdue, or have no snapshots at all, are snapshotted once before their timer is
    /// armed.
    pub fn full_reschedule(&self) -> anyhow::Result<Rescheduled> {
        self.reschedule_at(Utc::now())
    }

    fn reschedule_at(&self, now: DateTime<Utc>) -> anyhow::Result<Rescheduled> {
        let mut armed = lock(&self.armed);

        let cancelled = armed.cancel_all();
        armed.generation += 1;
        let generation = armed.generation;

        let mut groups = CadenceGroups::new();
        for watcher in &self.watchers {
            merge_cadence_groups(&mut groups, watcher.cadence_groups());
        }

        let mut fired_immediately = 0;
        for (command, group) in groups {
            let latest = latest_snapshot(&group);
            let mut datasets: Vec<Dataset> = group.into_keys().collect();
            datasets.sort_by(|a, b| a.name.cmp(&b.name));

            if is_overdue(latest, &command, now) {
                match latest {
                    Some(latest) => info!("[{}] overdue since last snapshot at {}", command, latest),
                    None => info!("[{}] no snapshots yet", command),
                }
                take_snapshots(&*self.zfs, &self.config.label_prefix, &command, &datasets, now);
                fired_immediately += 1;
            }

            let handle = schedule_recurring(
                command.to_string(),
                self.config.anchor,
                command.interval(),
                TimerEvent { command, generation },
                self.events.clone(),
            )?;
            info!("[{}] armed for {} datasets", command, datasets.len());
            armed.timers.insert(
                command,
                ArmedTimer {
                    generation,
                    datasets,
                    handle,
                },
            );
        }

        let rescheduled = Rescheduled {
            cancelled,
            armed: armed.timers.len(),
            fired_immediately,
        };
        info!(
            "Rescheduled: {} timers cancelled, {} armed, {} fired immediately",
            rescheduled.cancelled, rescheduled.armed, rescheduled.fired_immediately
        );
        Ok(rescheduled)
    }

    /// Armed policies, each with the names of the datasets it will snapshot.
    pub fn armed(&self) -> BTreeMap<SnapshotCommand, Vec<DatasetName>> {
        lock(&self.armed)
            .timers
            .iter()
            .map(|(command, timer)| (*command, timer.datasets.iter().map(|d| d.name.clone()).collect()))
            .collect()
    }
}
impl Drop for Scheduler {
    fn drop(&mut self) {
        // The dispatcher shares `armed`; the timers in it must go for the dispatcher to finish.
        lock(&self.armed).cancel_all();
    }
}

fn lock(armed: &Mutex<Armed>) -> MutexGuard<'_, Armed> {
    armed.lock().unwrap_or_else(PoisonError::into_inner)
}
