use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::organised_data::*;
use crate::timer::{schedule_recurring, TimerHandle};
use crate::zfs::Zfs;
use crate::zfs_types::*;

/// What a successful refresh found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refreshed {
    pub datasets: usize,
    pub snapshots: usize,
    /// Whether any dataset joined or left a cadence group, or a group appeared or vanished.
    pub groups_changed: bool,
}

/// Mirrors the snapshots of every filesystem and volume in one pool.
///
/// Refreshes are serialised against each other. The map is swapped in whole, so a reader sees
/// either the state before a refresh or after it, never a mix, and a failed refresh leaves the
/// previous state in place.
pub struct PoolWatcher {
    pool: Pool,
    zfs: Arc<dyn Zfs>,
    refresh_lock: Mutex<()>,
    snapshots: RwLock<Arc<SnapshotMap>>,
}
impl PoolWatcher {
    /// Build a watcher and populate it. Fails if the first refresh does.
    pub fn new(pool: Pool, zfs: Arc<dyn Zfs>) -> anyhow::Result<Self> {
        let watcher = Self {
            pool,
            zfs,
            refresh_lock: Mutex::new(()),
            snapshots: RwLock::new(Arc::new(SnapshotMap::new())),
        };
        let refreshed = watcher.refresh()?;
        info!(
            "Watching pool {} with {} datasets and {} snapshots",
            watcher.pool.name, refreshed.datasets, refreshed.snapshots
        );
        Ok(watcher)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Re-list the pool's filesystems and volumes and each one's snapshots, then replace the
    /// mirrored map. Blocks on the storage tools.
    pub fn refresh(&self) -> anyhow::Result<Refreshed> {
        let _serial = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let datasets = self
            .pool
            .list_datasets(&*self.zfs, None, &[DatasetType::Filesystem, DatasetType::Volume])
            .with_context(|| format!("failed to refresh pool `{}`", self.pool.name))?;

        let mut map = SnapshotMap::with_capacity(datasets.len());
        for dataset in datasets {
            let snapshots = dataset
                .list_children(&*self.zfs, Some(1), &[DatasetType::Snapshot])
                .with_context(|| format!("failed to list snapshots of `{}`", dataset.name))?;
            debug!("{} has {} snapshots", dataset.name, snapshots.len());
            map.insert(dataset, snapshots);
        }

        let previous = self.snapshot_map();
        let refreshed = Refreshed {
            datasets: map.len(),
            snapshots: map.values().map(|s| s.len()).sum(),
            groups_changed: group_membership(&cadence_groups(&previous)) != group_membership(&cadence_groups(&map)),
        };
        *self.snapshots.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        Ok(refreshed)
    }

    /// The mirrored map as of the last successful refresh.
    pub fn snapshot_map(&self) -> Arc<SnapshotMap> {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Datasets of this pool grouped by declared policy, with their current snapshots.
    pub fn cadence_groups(&self) -> CadenceGroups {
        cadence_groups(&self.snapshot_map())
    }

    /// Refresh every `interval` on a background thread until the returned handle is dropped.
    /// The pool's name is sent to `changes`, if given, whenever a refresh changes group
    /// membership.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        interval: Duration,
        changes: Option<Sender<PoolName>>,
    ) -> anyhow::Result<RefreshLoop> {
        let (tick_tx, tick_rx) = mpsc::channel();
        let timer = schedule_recurring(format!("refresh {}", self.pool.name), Utc::now(), interval, (), tick_tx)?;

        let watcher = Arc::clone(self);
        let worker = std::thread::Builder::new()
            .name(format!("refresh {}", self.pool.name))
            .spawn(move || {
                // Ends when the timer, and with it the only sender, is dropped.
                while tick_rx.recv().is_ok() {
                    match watcher.refresh() {
                        Ok(refreshed) => {
                            debug!("Refreshed pool {}: {:?}", watcher.pool.name, refreshed);
                            if refreshed.groups_changed {
                                info!("Cadence groups changed in pool {}", watcher.pool.name);
                                if let Some(changes) = &changes {
                                    let _ = changes.send(watcher.pool.name.clone());
                                }
                            }
                        }
                        Err(e) => warn!("{:#}; keeping previous state", e),
                    }
                    // Ticks that piled up during a slow refresh are redundant.
                    while tick_rx.try_recv().is_ok() {}
                }
            })
            .context("failed to spawn refresh thread")?;

        Ok(RefreshLoop {
            timer: Some(timer),
            worker: Some(worker),
        })
    }
}

/// Background refresh of one watcher. Stops, after any refresh in progress, when dropped.
pub struct RefreshLoop {
    timer: Option<TimerHandle>,
    worker: Option<JoinHandle<()>>,
}
impl Drop for RefreshLoop {
    fn drop(&mut self) {
        self.timer.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::snapshot_command::SnapshotCommand;
    use crate::zfs::fake::FakeZfs;

    const POOLS: &str = "tank 2T 500G 1.5T - 10% 80% 1.20x ONLINE -";
    const DATASETS: &str = "\
1 filesystem tank 1700000000 0 1 1 1 0 0 - -
2 filesystem tank/a 1700000000 0 1 1 1 0 0 - 1h,1d
3 snapshot tank/a@one 1700000100 - 1 1 - - - - 1h
4 snapshot tank/a@two 1700000200 - 1 1 - - - - 1h
5 volume tank/vm 1700000000 0 1 1 1 0 0 4096 1h
6 snapshot tank/vm@one 1700000300 - 1 1 - - - 4096 -
7 snapshot tank/a/nested@x 1700000300 - 1 1 - - - - -";

    fn cmd(s: &str) -> SnapshotCommand {
        s.parse().unwrap()
    }

    fn watcher(zfs: &Arc<FakeZfs>) -> PoolWatcher {
        let pool = Pool::all(&**zfs).unwrap().pop_first().unwrap();
        PoolWatcher::new(pool, zfs.clone()).unwrap()
    }

    #[test]
    fn mirrors_filesystems_and_volumes() {
        let zfs = Arc::new(FakeZfs::new(POOLS, DATASETS));
        let w = watcher(&zfs);
        let map = w.snapshot_map();
        assert_eq!(map.len(), 3);
        assert!(map
            .keys()
            .all(|d| matches!(d.dataset_type, DatasetType::Filesystem | DatasetType::Volume)));
        let a = map.iter().find(|(d, _)| d.name == "tank/a").unwrap().1;
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|s| s.dataset_type == DatasetType::Snapshot));
    }

    #[test]
    fn groups_by_policy() {
        let zfs = Arc::new(FakeZfs::new(POOLS, DATASETS));
        let groups = watcher(&zfs).cadence_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&cmd("1h")].len(), 2);
        assert_eq!(groups[&cmd("1d")].len(), 1);
        assert_eq!(latest_snapshot(&groups[&cmd("1h")]).unwrap().timestamp(), 1_700_000_300);
    }

    #[test]
    fn failed_refresh_keeps_state() {
        let zfs = Arc::new(FakeZfs::new(POOLS, DATASETS));
        let w = watcher(&zfs);
        let before = w.snapshot_map();

        zfs.set_failing(true);
        assert!(w.refresh().is_err());
        assert_eq!(*w.snapshot_map(), *before);
        assert_eq!(w.cadence_groups().len(), 2);
    }

    #[test]
    fn refresh_reports_group_changes() {
        let zfs = Arc::new(FakeZfs::new(POOLS, DATASETS));
        let w = watcher(&zfs);

        // Only snapshots change.
        zfs.create_snapshots(&["tank/a@three".to_string()]).unwrap();
        let refreshed = w.refresh().unwrap();
        assert_eq!(refreshed.snapshots, 4);
        assert!(!refreshed.groups_changed);

        // The volume drops its policy.
        zfs.set_datasets(&DATASETS.replace("4096 1h", "4096 -"));
        let refreshed = w.refresh().unwrap();
        assert!(refreshed.groups_changed);
        assert_eq!(w.cadence_groups()[&cmd("1h")].len(), 1);
    }

    #[test]
    fn readers_never_see_a_partial_map() {
        let zfs = Arc::new(FakeZfs::new(POOLS, DATASETS));
        let w = Arc::new(watcher(&zfs));
        zfs.set_list_delay(Duration::from_millis(5));

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let w = Arc::clone(&w);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut reads = 0;
                while !done.load(Ordering::SeqCst) {
                    let groups = w.cadence_groups();
                    assert_eq!(groups.len(), 2);
                    for group in groups.values() {
                        for (dataset, snapshots) in group {
                            assert!(!snapshots.is_empty(), "{} seen without snapshots", dataset.name);
                        }
                    }
                    reads += 1;
                }
                reads
            })
        };
        for _ in 0..5 {
            w.refresh().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        assert!(reader.join().unwrap() > 0);
    }

    #[test]
    fn refresh_loop_notifies_changes() {
        let zfs = Arc::new(FakeZfs::new(POOLS, DATASETS));
        let w = Arc::new(watcher(&zfs));
        let (tx, rx) = mpsc::channel();
        let refresh_loop = w.spawn_refresh_loop(Duration::from_millis(20), Some(tx)).unwrap();

        zfs.set_datasets(&DATASETS.replace("4096 1h", "4096 30m"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "tank");
        assert!(w.cadence_groups().contains_key(&cmd("30m")));
        drop(refresh_loop);
    }
}
