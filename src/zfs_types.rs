use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::Serialize;
use tracing::warn;

use crate::snapshot_command::SnapshotCommand;

// E.g. `tank`
pub type PoolName = String;
// E.g. `tank/home/alice`
pub type DatasetName = String;
// E.g. `tank/home/alice@guarddog_2025-10-12_21:40:13`
pub type SnapshotFullName = String;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    Filesystem,
    Volume,
    Snapshot,
    Bookmark,
}
impl DatasetType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" => Some(DatasetType::Filesystem),
            "volume" => Some(DatasetType::Volume),
            "snapshot" => Some(DatasetType::Snapshot),
            "bookmark" => Some(DatasetType::Bookmark),
            _ => None,
        }
    }

    /// Name as accepted by `zfs list -t`.
    pub const fn as_str(self) -> &'static str {
        match self {
            DatasetType::Filesystem => "filesystem",
            DatasetType::Volume => "volume",
            DatasetType::Snapshot => "snapshot",
            DatasetType::Bookmark => "bookmark",
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Degraded,
    Faulted,
    Offline,
    Online,
    Removed,
    Unavailable,
}
impl Health {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEGRADED" => Some(Health::Degraded),
            "FAULTED" => Some(Health::Faulted),
            "OFFLINE" => Some(Health::Offline),
            "ONLINE" => Some(Health::Online),
            "REMOVED" => Some(Health::Removed),
            "UNAVAIL" => Some(Health::Unavailable),
            _ => None,
        }
    }
}

/// A value parsed from one whitespace-separated line of `zpool list -H` / `zfs list -H` output.
pub trait FromColumns: Sized {
    /// What a line describes, for diagnostics.
    const WHAT: &'static str;

    fn from_columns(columns: &[&str]) -> anyhow::Result<Self>;

    fn from_line(line: &str) -> anyhow::Result<Self> {
        let columns: Vec<&str> = line.split_whitespace().collect();
        Self::from_columns(&columns).with_context(|| format!("unable to parse {} from `{}`", Self::WHAT, line.trim()))
    }
}

/// Parse every line of a listing. Lines that fail to parse are logged and dropped, so the
/// result can be empty without this being an error.
pub fn parse_listing<T: FromColumns>(output: &str) -> Vec<T> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match T::from_line(line) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("dropping line: {:#}", e);
                None
            }
        })
        .collect()
}

/// Parse a byte count, either exact (`1649267441664`, as printed with `-p`) or human-readable
/// with a binary suffix (`1.5T`). Fractional bytes are truncated.
pub fn parse_size(s: &str) -> anyhow::Result<BigUint> {
    let (number, exponent) = match s.char_indices().last() {
        Some((i, suffix)) if suffix.is_ascii_alphabetic() => {
            let exponent = match suffix.to_ascii_uppercase() {
                'B' => 0,
                'K' => 1,
                'M' => 2,
                'G' => 3,
                'T' => 4,
                'P' => 5,
                'E' => 6,
                'Z' => 7,
                _ => anyhow::bail!("unknown size suffix in `{}`", s),
            };
            (s.split_at(i).0, exponent)
        }
        _ => (s, 0),
    };
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    let is_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !is_digits(whole) || !is_digits(fraction) {
        anyhow::bail!("invalid size `{}`", s);
    }

    let mantissa: BigUint = format!("{}{}", whole, fraction)
        .parse()
        .with_context(|| format!("invalid size `{}`", s))?;
    let fraction_digits = u32::try_from(fraction.len()).context("size has too many digits")?;
    Ok(mantissa * BigUint::from(1024u32).pow(exponent) / BigUint::from(10u32).pow(fraction_digits))
}

/// `-` means "not applicable".
fn parse_optional_size(s: &str) -> anyhow::Result<Option<BigUint>> {
    if s == "-" {
        Ok(None)
    } else {
        parse_size(s).map(Some)
    }
}

fn parse_suffixed_f64(s: &str, suffix: char) -> anyhow::Result<f64> {
    let value: f64 = s
        .strip_suffix(suffix)
        .unwrap_or(s)
        .parse()
        .with_context(|| format!("invalid number `{}`", s))?;
    if !value.is_finite() {
        anyhow::bail!("invalid number `{}`", s);
    }
    Ok(value)
}

/// `10` and `10%` are both ten percent.
pub fn parse_percentage(s: &str) -> anyhow::Result<f64> {
    parse_suffixed_f64(s, '%')
}

/// `1.20` and `1.20x` are both a ratio of 1.2.
pub fn parse_ratio(s: &str) -> anyhow::Result<f64> {
    parse_suffixed_f64(s, 'x')
}

// Sizes go out as decimal strings; JSON numbers can't hold them all.
fn serialize_size<S: serde::Serializer>(size: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(size)
}
fn serialize_optional_size<S: serde::Serializer>(size: &Option<BigUint>, serializer: S) -> Result<S::Ok, S::Error> {
    match size {
        Some(size) => serializer.collect_str(size),
        None => serializer.serialize_none(),
    }
}

/// A storage pool as reported by `zpool list -H`. Identity is the name alone, so the same pool
/// seen across polls compares equal even when its usage figures have moved.
#[derive(Serialize, Debug, Clone)]
pub struct Pool {
    pub name: PoolName,
    #[serde(serialize_with = "serialize_size")]
    pub size: BigUint,
    #[serde(serialize_with = "serialize_size")]
    pub allocated: BigUint,
    #[serde(serialize_with = "serialize_size")]
    pub free: BigUint,
    /// Whole percent as printed, so `10%` is `10.0`, not `0.1`. The tool prints `-` when it has
    /// no figure.
    pub fragmentation: Option<f64>,
    /// Whole percent, like `fragmentation`.
    pub capacity: f64,
    pub dedup: f64,
    pub health: Health,
    pub altroot: Option<PathBuf>,
}
impl FromColumns for Pool {
    const WHAT: &'static str = "pool";

    // name size alloc free expandsz frag cap dedup health altroot
    fn from_columns(columns: &[&str]) -> anyhow::Result<Self> {
        let &[name, size, allocated, free, _expand_size, fragmentation, capacity, dedup, health, altroot] = columns
        else {
            anyhow::bail!("expected 10 columns, found {}", columns.len())
        };

        let fragmentation = if fragmentation == "-" {
            None
        } else {
            Some(parse_percentage(fragmentation).context("bad fragmentation")?)
        };
        let Some(health) = Health::parse(health) else {
            anyhow::bail!("unknown health `{}`", health)
        };
        let altroot = if altroot == "-" || !altroot.contains('/') {
            None
        } else {
            Some(PathBuf::from(altroot))
        };

        Ok(Pool {
            name: name.to_string(),
            size: parse_size(size).context("bad size")?,
            allocated: parse_size(allocated).context("bad allocated")?,
            free: parse_size(free).context("bad free")?,
            fragmentation,
            capacity: parse_percentage(capacity).context("bad capacity")?,
            dedup: parse_ratio(dedup).context("bad dedup ratio")?,
            health,
            altroot,
        })
    }
}
impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for Pool {}
impl std::hash::Hash for Pool {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}
impl PartialOrd for Pool {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pool {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// One row of `zfs list -H -p`. Equality is structural: a dataset whose properties changed
/// between polls is a different value.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dataset {
    pub guid: String,
    #[serde(rename = "type")]
    pub dataset_type: DatasetType,
    pub name: DatasetName,
    /// Components of the name up to any `@`, e.g. `["tank", "home", "alice"]`.
    pub name_path: Vec<String>,
    /// Owning pool, by name.
    pub pool: PoolName,
    pub creation: DateTime<Utc>,
    #[serde(serialize_with = "serialize_optional_size")]
    pub reserved: Option<BigUint>,
    #[serde(serialize_with = "serialize_size")]
    pub referenced: BigUint,
    #[serde(serialize_with = "serialize_size")]
    pub used: BigUint,
    #[serde(serialize_with = "serialize_optional_size")]
    pub free: Option<BigUint>,
    #[serde(serialize_with = "serialize_optional_size")]
    pub quota: Option<BigUint>,
    #[serde(serialize_with = "serialize_optional_size")]
    pub ref_quota: Option<BigUint>,
    /// Present iff this is a volume.
    #[serde(serialize_with = "serialize_optional_size")]
    pub volume_size: Option<BigUint>,
    /// Declared auto-snapshot policy. Never present on snapshots or bookmarks.
    pub snapshot_commands: Option<BTreeSet<SnapshotCommand>>,
}
impl Dataset {
    /// The part after `@` for a snapshot.
    pub fn snapshot_name(&self) -> Option<&str> {
        self.name.split_once('@').map(|(_, snapshot)| snapshot)
    }

    /// Non-empty declared policy, if any.
    pub fn declared_commands(&self) -> Option<&BTreeSet<SnapshotCommand>> {
        self.snapshot_commands.as_ref().filter(|c| !c.is_empty())
    }
}
impl FromColumns for Dataset {
    const WHAT: &'static str = "dataset";

    // guid type name creation reservation refer used available quota refquota volsize <policy property>
    fn from_columns(columns: &[&str]) -> anyhow::Result<Self> {
        let &[guid, dataset_type, name, creation, reserved, referenced, used, free, quota, ref_quota, volume_size, commands] =
            columns
        else {
            anyhow::bail!("expected 12 columns, found {}", columns.len())
        };

        let Some(dataset_type) = DatasetType::parse(dataset_type) else {
            anyhow::bail!("unknown dataset type `{}`", dataset_type)
        };

        let base_name = name.split_once(['@', '#']).map_or(name, |(base, _)| base);
        let name_path: Vec<String> = base_name.split('/').map(str::to_string).collect();
        let pool = match name_path.first() {
            Some(pool) if !pool.is_empty() => pool.clone(),
            _ => anyhow::bail!("dataset name `{}` has no pool component", name),
        };

        let creation_secs: i64 = creation
            .parse()
            .with_context(|| format!("bad creation time `{}`", creation))?;
        let creation = DateTime::<Utc>::from_timestamp(creation_secs, 0)
            .with_context(|| format!("creation time `{}` out of range", creation_secs))?;

        let volume_size = match dataset_type {
            DatasetType::Volume => Some(parse_size(volume_size).context("bad volsize for volume")?),
            // Snapshots of volumes report the origin's volsize; it isn't theirs to carry.
            _ => None,
        };

        let snapshot_commands = match dataset_type {
            DatasetType::Filesystem | DatasetType::Volume if commands != "-" => {
                Some(SnapshotCommand::parse_list(commands))
            }
            _ => None,
        };

        Ok(Dataset {
            guid: guid.to_string(),
            dataset_type,
            name: name.to_string(),
            name_path,
            pool,
            creation,
            reserved: parse_optional_size(reserved).context("bad reservation")?,
            referenced: parse_size(referenced).context("bad referenced")?,
            used: parse_size(used).context("bad used")?,
            free: parse_optional_size(free).context("bad available")?,
            quota: parse_optional_size(quota).context("bad quota")?,
            ref_quota: parse_optional_size(ref_quota).context("bad refquota")?,
            volume_size,
            snapshot_commands,
        })
    }
}
