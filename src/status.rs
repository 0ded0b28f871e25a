//! Point-in-time view of what the scheduler would do, for `guarddog status`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::organised_data::*;
use crate::pool_watcher::PoolWatcher;
use crate::snapshot_command::SnapshotCommand;
use crate::zfs_types::*;

#[derive(Serialize, Debug)]
pub struct StatusReport {
    pub generated: DateTime<Utc>,
    pub pools: Vec<PoolStatus>,
}

#[derive(Serialize, Debug)]
pub struct PoolStatus {
    #[serde(flatten)]
    pub pool: Pool,
    pub datasets: usize,
    pub policies: Vec<PolicyStatus>,
}

#[derive(Serialize, Debug)]
pub struct PolicyStatus {
    pub policy: SnapshotCommand,
    pub seconds_interval: f64,
    pub latest_snapshot: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
    pub overdue: bool,
    pub datasets: Vec<DatasetStatus>,
}

#[derive(Serialize, Debug)]
pub struct DatasetStatus {
    pub name: DatasetName,
    pub snapshots: usize,
    /// Name after the `@` of the most recent snapshot.
    pub latest_snapshot: Option<String>,
    pub latest_snapshot_creation: Option<DateTime<Utc>>,
}

pub fn status_report<'a>(watchers: impl IntoIterator<Item = &'a PoolWatcher>, now: DateTime<Utc>) -> StatusReport {
    let pools = watchers
        .into_iter()
        .map(|watcher| {
            let snapshot_map = watcher.snapshot_map();
            let policies = cadence_groups(&snapshot_map)
                .into_iter()
                .map(|(policy, group)| {
                    let latest = latest_snapshot(&group);
                    let mut datasets: Vec<DatasetStatus> = group
                        .iter()
                        .map(|(dataset, snapshots)| {
                            let latest = snapshots.iter().max_by_key(|s| s.creation);
                            DatasetStatus {
                                name: dataset.name.clone(),
                                snapshots: snapshots.len(),
                                latest_snapshot: latest.and_then(|s| s.snapshot_name()).map(str::to_string),
                                latest_snapshot_creation: latest.map(|s| s.creation),
                            }
                        })
                        .collect();
                    datasets.sort_by(|a, b| a.name.cmp(&b.name));
                    PolicyStatus {
                        policy,
                        seconds_interval: policy.seconds_interval(),
                        latest_snapshot: latest,
                        next_due: latest.and_then(|latest| next_due(latest, &policy)),
                        overdue: is_overdue(latest, &policy, now),
                        datasets,
                    }
                })
                .collect();
            PoolStatus {
                pool: watcher.pool().clone(),
                datasets: snapshot_map.len(),
                policies,
            }
        })
        .collect();
    StatusReport { generated: now, pools }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::zfs::fake::FakeZfs;

    #[test]
    fn report_as_json() {
        let zfs = Arc::new(FakeZfs::new(
            "tank 2T 500G 1.5T - 10% 80% 1.20x ONLINE -",
            "2 filesystem tank/a 1700000000 0 1 1 1 0 0 - 1h:24\n\
             3 snapshot tank/a@one 1700000000 - 1 1 - - - - -\n\
             4 filesystem tank/b 1700000000 0 1 1 1 0 0 - -",
        ));
        let pool = Pool::all(&*zfs).unwrap().pop_first().unwrap();
        let watcher = PoolWatcher::new(pool, zfs.clone()).unwrap();
        let now = DateTime::from_timestamp(1_700_001_800, 0).unwrap();

        let json = serde_json::to_value(status_report([&watcher], now)).unwrap();
        let pool = &json["pools"][0];
        assert_eq!(pool["name"], "tank");
        assert_eq!(pool["size"], "2199023255552");
        assert_eq!(pool["health"], "online");
        assert_eq!(pool["datasets"], 2);

        let policy = &pool["policies"][0];
        assert_eq!(policy["policy"], "1h:24");
        assert_eq!(policy["seconds_interval"], 3600.0);
        assert_eq!(policy["overdue"], false);
        assert_eq!(policy["next_due"], "2023-11-14T23:13:20Z");
        assert_eq!(policy["datasets"][0]["name"], "tank/a");
        assert_eq!(policy["datasets"][0]["snapshots"], 1);
        assert_eq!(policy["datasets"][0]["latest_snapshot"], "one");
        assert_eq!(pool["policies"].as_array().unwrap().len(), 1);
    }
}
