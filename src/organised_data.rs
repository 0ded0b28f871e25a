use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, TimeDelta, Utc};

use crate::snapshot_command::SnapshotCommand;
use crate::zfs_types::*;

/// Each filesystem/volume mapped to its own snapshots.
pub type SnapshotMap = HashMap<Dataset, HashSet<Dataset>>;

/// Each policy mapped to the datasets declaring it, with their snapshots.
pub type CadenceGroups = BTreeMap<SnapshotCommand, SnapshotMap>;

/// Group datasets by the policies they declare. A dataset declaring several policies appears
/// in each of their groups; datasets declaring none appear nowhere.
pub fn cadence_groups(snapshots: &SnapshotMap) -> CadenceGroups {
    let mut groups = CadenceGroups::new();
    for (dataset, dataset_snapshots) in snapshots {
        let Some(commands) = dataset.declared_commands() else {
            continue;
        };
        for command in commands {
            groups
                .entry(*command)
                .or_default()
                .insert(dataset.clone(), dataset_snapshots.clone());
        }
    }
    groups
}

/// Union `from` into `into`. Equal policies from different pools become one group.
pub fn merge_cadence_groups(into: &mut CadenceGroups, from: CadenceGroups) {
    for (command, datasets) in from {
        into.entry(command).or_default().extend(datasets);
    }
}

/// Which dataset names are in which group; what a reschedule would arm.
pub fn group_membership(groups: &CadenceGroups) -> BTreeMap<SnapshotCommand, BTreeSet<DatasetName>> {
    groups
        .iter()
        .map(|(command, datasets)| (*command, datasets.keys().map(|d| d.name.clone()).collect()))
        .collect()
}

/// Creation time of the most recent snapshot of any dataset in the group.
pub fn latest_snapshot(group: &SnapshotMap) -> Option<DateTime<Utc>> {
    group.values().flatten().map(|s| s.creation).max()
}

/// When a policy is next due given its latest snapshot. `None` if that is beyond representable time.
pub fn next_due(latest: DateTime<Utc>, command: &SnapshotCommand) -> Option<DateTime<Utc>> {
    let interval = TimeDelta::from_std(command.interval()).ok()?;
    latest.checked_add_signed(interval)
}

/// A group with no snapshots at all is overdue, as is one whose next due time has passed.
pub fn is_overdue(latest: Option<DateTime<Utc>>, command: &SnapshotCommand, now: DateTime<Utc>) -> bool {
    match latest {
        None => true,
        Some(latest) => next_due(latest, command).is_some_and(|due| due <= now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(line: &str) -> Dataset {
        Dataset::from_line(line).unwrap()
    }
    fn cmd(s: &str) -> SnapshotCommand {
        s.parse().unwrap()
    }
    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn tank_map() -> SnapshotMap {
        let mut map = SnapshotMap::new();
        map.insert(
            ds("1 filesystem tank/a 1000 0 1 1 1 0 0 - 1h,1d"),
            [ds("2 snapshot tank/a@x 5000 - 1 1 - - - - -"), ds("3 snapshot tank/a@y 9000 - 1 1 - - - - -")]
                .into_iter()
                .collect(),
        );
        map.insert(ds("4 filesystem tank/b 1000 0 1 1 1 0 0 - 1h"), HashSet::new());
        map.insert(ds("5 filesystem tank/c 1000 0 1 1 1 0 0 - -"), HashSet::new());
        map.insert(ds("6 filesystem tank/d 1000 0 1 1 1 0 0 - junk"), HashSet::new());
        map
    }

    #[test]
    fn groups_by_declared_policy() {
        let groups = cadence_groups(&tank_map());
        assert_eq!(groups.len(), 2);
        let hourly = &groups[&cmd("1h")];
        let mut names: Vec<_> = hourly.keys().map(|d| d.name.as_str()).collect();
        names.sort();
        assert_eq!(names, ["tank/a", "tank/b"]);
        let daily = &groups[&cmd("1d")];
        assert_eq!(daily.len(), 1);
        assert_eq!(daily.values().next().unwrap().len(), 2);
    }

    #[test]
    fn merge_unions_equal_policies() {
        let mut groups = cadence_groups(&tank_map());
        let mut other = SnapshotMap::new();
        other.insert(ds("9 volume backup/vm 1000 0 1 1 1 0 0 1024 1h"), HashSet::new());
        other.insert(ds("10 filesystem backup/x 1000 0 1 1 1 0 0 - 30m"), HashSet::new());
        merge_cadence_groups(&mut groups, cadence_groups(&other));

        let membership = group_membership(&groups);
        assert_eq!(membership.len(), 3);
        assert_eq!(
            membership[&cmd("1h")].iter().map(String::as_str).collect::<Vec<_>>(),
            ["backup/vm", "tank/a", "tank/b"]
        );
        assert_eq!(membership[&cmd("30m")].len(), 1);
    }

    #[test]
    fn latest_across_group() {
        let groups = cadence_groups(&tank_map());
        assert_eq!(latest_snapshot(&groups[&cmd("1h")]), Some(at(9000)));

        let mut empty = SnapshotMap::new();
        empty.insert(ds("4 filesystem tank/b 1000 0 1 1 1 0 0 - 1h"), HashSet::new());
        assert_eq!(latest_snapshot(&empty), None);
    }

    #[test]
    fn overdue_rules() {
        let hourly = cmd("1h");
        assert!(is_overdue(None, &hourly, at(0)));
        assert_eq!(next_due(at(1000), &hourly), Some(at(4600)));
        assert!(!is_overdue(Some(at(1000)), &hourly, at(4599)));
        assert!(is_overdue(Some(at(1000)), &hourly, at(4600)));
        assert!(is_overdue(Some(at(1000)), &hourly, at(100_000)));
        assert_eq!(next_due(at(0), &cmd("0.5s")), Some(at(0) + TimeDelta::milliseconds(500)));
    }
}
