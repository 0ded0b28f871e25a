use std::ffi::OsStr;

use crate::typed_command::*;
use crate::zfs_types::*;

// Column order here must match `Pool::from_columns` and `Dataset::from_columns`.
const ZPOOL_LIST_COLUMNS: &str = "name,size,allocated,free,expandsize,fragmentation,capacity,dedupratio,health,altroot";
const ZFS_LIST_COLUMNS: &str = "guid,type,name,creation,reservation,referenced,used,available,quota,refquota,volsize";

pub fn make_zpool_list_command(zpool: &OsStr) -> TypedCommand<TabularOutput<Pool>> {
    let mut c = TypedCommand::new(zpool);
    c.args(["list", "-H", "-p", "-o", ZPOOL_LIST_COLUMNS]);
    c
}

/// List `target` and its descendants down to `depth` levels (all levels if `None`), restricted
/// to `types` when non-empty. The last column is the user property holding the policy.
pub fn make_zfs_list_datasets_command(
    zfs: &OsStr,
    policy_property: &str,
    target: &str,
    depth: Option<u32>,
    types: &[DatasetType],
) -> TypedCommand<TabularOutput<Dataset>> {
    let mut c = TypedCommand::new(zfs);
    c.args(["list", "-H", "-p", "-o"]);
    c.arg(format!("{},{}", ZFS_LIST_COLUMNS, policy_property));
    if !types.is_empty() {
        let types: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        c.arg("-t").arg(types.join(","));
    }
    match depth {
        Some(depth) => c.arg("-d").arg(depth.to_string()),
        None => c.arg("-r"),
    };
    c.arg(target);
    c
}

/// Snapshots named in one invocation are created atomically, which the tool only supports
/// within a single pool.
pub fn make_zfs_snapshot_command(zfs: &OsStr, snapshots: &[SnapshotFullName]) -> TypedCommand<IgnoreOutput> {
    let mut c = TypedCommand::new(zfs);
    c.arg("snapshot");
    c.args(snapshots);
    c
}
