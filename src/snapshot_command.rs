use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::warn;

/// Base unit of time a snapshot cadence is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SnapshotFrequency {
    Month,
    Day,
    Hour,
    Minute,
    Second,
}
impl SnapshotFrequency {
    pub const fn seconds_per_unit(self) -> f64 {
        match self {
            // Average month: 365.25 days / 12.
            SnapshotFrequency::Month => 2_629_800.0,
            SnapshotFrequency::Day => 86_400.0,
            SnapshotFrequency::Hour => 3_600.0,
            SnapshotFrequency::Minute => 60.0,
            SnapshotFrequency::Second => 1.0,
        }
    }

    pub fn seconds_interval(self, units: f64) -> f64 {
        units * self.seconds_per_unit()
    }

    /// Parse a unit code (`mo`, `d`, `h`, `m`/`mi`, `s`), ignoring case.
    pub fn parse(code: &str) -> Option<Self> {
        match code.to_ascii_lowercase().as_str() {
            "mo" => Some(SnapshotFrequency::Month),
            "d" => Some(SnapshotFrequency::Day),
            "h" => Some(SnapshotFrequency::Hour),
            "m" | "mi" => Some(SnapshotFrequency::Minute),
            "s" => Some(SnapshotFrequency::Second),
            _ => None,
        }
    }

    /// Canonical code, accepted by `parse`.
    pub const fn code(self) -> &'static str {
        match self {
            SnapshotFrequency::Month => "mo",
            SnapshotFrequency::Day => "d",
            SnapshotFrequency::Hour => "h",
            SnapshotFrequency::Minute => "m",
            SnapshotFrequency::Second => "s",
        }
    }
}

/// Shortest cadence accepted. Snapshot labels carry milliseconds, so two firings of one policy
/// always get distinct labels.
pub const MIN_SECONDS_INTERVAL: f64 = 0.001;

/// "Snapshot every `units` `frequency`, keeping at most `keep`".
///
/// Written by humans as `<value><unit>[:<keep>]`, e.g. `24h`, `0.5h:45` or `2.5s:10`.
/// Two commands are the same policy iff frequency, units and keep all match, so `30m` and
/// `0.5h` are distinct policies even though they share an interval.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCommand {
    pub frequency: SnapshotFrequency,
    /// Always finite and strictly positive.
    pub units: f64,
    /// Retention count. Parsed and carried, never enforced.
    pub keep: Option<u64>,
}
impl SnapshotCommand {
    pub fn new(frequency: SnapshotFrequency, units: f64, keep: Option<u64>) -> anyhow::Result<Self> {
        if !units.is_finite() || units <= 0.0 {
            anyhow::bail!("snapshot cadence must be a positive number of units, got {}", units);
        }
        if frequency.seconds_interval(units) < MIN_SECONDS_INTERVAL {
            anyhow::bail!("snapshot cadence of {}{} is shorter than a millisecond", units, frequency.code());
        }
        if Duration::try_from_secs_f64(frequency.seconds_interval(units)).is_err() {
            anyhow::bail!("snapshot cadence of {}{} is too long", units, frequency.code());
        }
        Ok(Self { frequency, units, keep })
    }

    pub fn seconds_interval(&self) -> f64 {
        self.frequency.seconds_interval(self.units)
    }

    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.seconds_interval()).unwrap_or(Duration::MAX)
    }

    /// Parse a comma-separated list of commands. Entries that fail to parse are logged and
    /// dropped, so the result may be empty. `-` (the tool's "unset") yields no commands.
    pub fn parse_list(commands: &str) -> BTreeSet<SnapshotCommand> {
        let commands = commands.trim();
        if commands == "-" {
            return BTreeSet::new();
        }
        commands
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .filter_map(|c| match c.parse::<SnapshotCommand>() {
                Ok(command) => Some(command),
                Err(e) => {
                    warn!("ignoring snapshot command `{}`: {:#}", c, e);
                    None
                }
            })
            .collect()
    }
}
impl FromStr for SnapshotCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s == "-" {
            anyhow::bail!("`-` declares no snapshot command");
        }
        let (cadence, keep) = match s.split_once(':') {
            Some((_, keep)) if keep.contains(':') => {
                anyhow::bail!("`{}` has more than one `:`", s)
            }
            Some((cadence, keep)) => (
                cadence,
                Some(
                    keep.parse::<u64>()
                        .with_context(|| format!("invalid keep count `{}`", keep))?,
                ),
            ),
            None => (s, None),
        };

        let split = cadence
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(cadence.len());
        let (value, unit) = cadence.split_at(split);
        let units = value
            .parse::<f64>()
            .with_context(|| format!("invalid cadence value `{}` in `{}`", value, s))?;
        let Some(frequency) = SnapshotFrequency::parse(unit) else {
            anyhow::bail!("unknown cadence unit `{}` in `{}`", unit, s)
        };
        SnapshotCommand::new(frequency, units, keep)
    }
}
impl fmt::Display for SnapshotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.units, self.frequency.code())?;
        if let Some(keep) = self.keep {
            write!(f, ":{}", keep)?;
        }
        Ok(())
    }
}
impl Serialize for SnapshotCommand {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// `units` is never NaN, so comparing its bits gives a lawful Eq/Hash.
impl PartialEq for SnapshotCommand {
    fn eq(&self, other: &Self) -> bool {
        self.frequency == other.frequency
            && self.units.to_bits() == other.units.to_bits()
            && self.keep == other.keep
    }
}
impl Eq for SnapshotCommand {}
impl Hash for SnapshotCommand {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.frequency.hash(state);
        self.units.to_bits().hash(state);
        self.keep.hash(state);
    }
}
impl PartialOrd for SnapshotCommand {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SnapshotCommand {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Shortest cadence first, which also reads nicely in logs.
        self.seconds_interval()
            .total_cmp(&other.seconds_interval())
            .then(self.frequency.cmp(&other.frequency))
            .then(self.units.total_cmp(&other.units))
            .then(self.keep.cmp(&other.keep))
    }
}
