use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use anyhow::Context;

use crate::commands::*;
use crate::typed_command::*;
use crate::zfs_types::*;

/// Everything the daemon asks of the storage tools. Listing calls block until the tool exits.
pub trait Zfs: Send + Sync {
    fn list_pools(&self) -> anyhow::Result<Vec<Pool>>;

    /// `target` and its descendants down to `depth` levels (unlimited if `None`), restricted to
    /// `types` when non-empty.
    fn list_datasets(&self, target: &str, depth: Option<u32>, types: &[DatasetType]) -> anyhow::Result<Vec<Dataset>>;

    /// Create all of `snapshots` atomically. They must all belong to one pool.
    fn create_snapshots(&self, snapshots: &[SnapshotFullName]) -> anyhow::Result<()>;
}

/// Runs the real `zfs`/`zpool` binaries.
#[derive(Debug, Clone)]
pub struct CommandZfs {
    pub zfs: PathBuf,
    pub zpool: PathBuf,
    /// User property holding each dataset's snapshot policy.
    pub policy_property: String,
    pub dry_run: bool,
}
impl Zfs for CommandZfs {
    fn list_pools(&self) -> anyhow::Result<Vec<Pool>> {
        let TabularOutput(pools) = make_zpool_list_command(self.zpool.as_os_str())
            .run()
            .context("failed to list pools")?;
        Ok(pools)
    }

    fn list_datasets(&self, target: &str, depth: Option<u32>, types: &[DatasetType]) -> anyhow::Result<Vec<Dataset>> {
        let TabularOutput(datasets) =
            make_zfs_list_datasets_command(self.zfs.as_os_str(), &self.policy_property, target, depth, types)
                .run()
                .with_context(|| format!("failed to list datasets under `{}`", target))?;
        Ok(datasets)
    }

    fn create_snapshots(&self, snapshots: &[SnapshotFullName]) -> anyhow::Result<()> {
        if snapshots.is_empty() {
            return Ok(());
        }
        make_zfs_snapshot_command(self.zfs.as_os_str(), snapshots).run_or_dry_run(self.dry_run)
    }
}

impl Pool {
    /// Every pool on the system.
    pub fn all(zfs: &dyn Zfs) -> anyhow::Result<BTreeSet<Pool>> {
        Ok(zfs.list_pools()?.into_iter().collect())
    }

    pub fn list_datasets(
        &self,
        zfs: &dyn Zfs,
        depth: Option<u32>,
        types: &[DatasetType],
    ) -> anyhow::Result<HashSet<Dataset>> {
        Ok(zfs.list_datasets(&self.name, depth, types)?.into_iter().collect())
    }
}

impl Dataset {
    /// Descendants of this dataset, e.g. `depth = Some(1)` with `[Snapshot]` for its own snapshots.
    pub fn list_children(
        &self,
        zfs: &dyn Zfs,
        depth: Option<u32>,
        types: &[DatasetType],
    ) -> anyhow::Result<HashSet<Dataset>> {
        Ok(zfs
            .list_datasets(&self.name, depth, types)?
            .into_iter()
            .filter(|d| d.name != self.name)
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeZfs;
    use super::*;

    const POOLS: &str = "tank 2T 500G 1.5T - 10% 80% 1.20x ONLINE -\n\
                         backup 1T 1G 1T - 0% 0% 1.00x ONLINE -\n";
    const DATASETS: &str = "\
1 filesystem tank 1700000000 0 1 1 1 0 0 - -
2 filesystem tank/a 1700000000 0 1 1 1 0 0 - 1h
3 snapshot tank/a@one 1700000100 - 1 1 - - - - 1h
4 snapshot tank/a@two 1700000200 - 1 1 - - - - 1h
5 filesystem tank/a/b 1700000000 0 1 1 1 0 0 - 1h
6 snapshot tank/a/b@one 1700000100 - 1 1 - - - - 1h
7 volume backup/vm 1700000000 0 1 1 1 0 0 1024 1d";

    #[test]
    fn all_pools() {
        let zfs = FakeZfs::new(POOLS, DATASETS);
        let pools = Pool::all(&zfs).unwrap();
        let names: Vec<_> = pools.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["backup", "tank"]);

        zfs.set_failing(true);
        assert!(Pool::all(&zfs).is_err());
    }

    #[test]
    fn pool_datasets_by_type() {
        let zfs = FakeZfs::new(POOLS, DATASETS);
        let pools = Pool::all(&zfs).unwrap();
        let tank = pools.iter().find(|p| p.name == "tank").unwrap();

        let datasets = tank
            .list_datasets(&zfs, None, &[DatasetType::Filesystem, DatasetType::Volume])
            .unwrap();
        assert_eq!(datasets.len(), 3);
        assert!(datasets.iter().all(|d| d.pool == "tank"));

        let shallow = tank.list_datasets(&zfs, Some(1), &[DatasetType::Filesystem]).unwrap();
        assert_eq!(shallow.len(), 2);
    }

    #[test]
    fn dataset_own_snapshots() {
        let zfs = FakeZfs::new(POOLS, DATASETS);
        let a = zfs
            .list_datasets("tank/a", Some(0), &[DatasetType::Filesystem])
            .unwrap()
            .pop()
            .unwrap();
        let snapshots = a.list_children(&zfs, Some(1), &[DatasetType::Snapshot]).unwrap();
        let mut names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        assert_eq!(names, ["tank/a@one", "tank/a@two"]);
    }

    #[test]
    fn created_snapshots_are_listed() {
        let zfs = FakeZfs::new(POOLS, DATASETS);
        zfs.create_snapshots(&["backup/vm@new".to_string()]).unwrap();
        assert_eq!(zfs.created(), [["backup/vm@new".to_string()]]);
        let listed = zfs.list_datasets("backup/vm", Some(1), &[DatasetType::Snapshot]).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn duplicate_snapshot_fails_whole_batch() {
        let zfs = FakeZfs::new(POOLS, DATASETS);
        let err = zfs
            .create_snapshots(&["tank/a/b@fresh".to_string(), "tank/a@one".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("tank/a@one"));
        assert!(zfs
            .create_snapshots(&["tank/a@x".to_string(), "tank/a@x".to_string()])
            .is_err());
        assert!(zfs.created().is_empty());
        assert!(zfs
            .list_datasets("tank/a/b", Some(1), &[DatasetType::Snapshot])
            .unwrap()
            .iter()
            .all(|s| s.name != "tank/a/b@fresh"));
    }
}
