//! Core record model, identity keys, and schedule conversion for matchday.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "matchday-core";

pub const DEFAULT_LOGO_URL: &str =
    "https://cdn.jsdelivr.net/gh/drnewske/tyhdsjax-nfhbqsm/logos/default.png";
pub const DEFAULT_ICON_URL: &str =
    "https://cdn.jsdelivr.net/gh/drnewske/tyhdsjax-nfhbqsm/logos/streamed.png";

/// Owned records starting more than this many hours before the run instant expire.
pub const STALENESS_HOURS: i64 = 24;

pub const STORE_DATE_FORMAT: &str = "%d-%m-%Y";
pub const INGEST_DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

pub fn staleness_threshold() -> Duration {
    Duration::hours(STALENESS_HOURS)
}

/// One side of a fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub logo_url: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Participant {
    pub fn with_default_logo(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logo_url: DEFAULT_LOGO_URL.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

/// One scheduled event as persisted in the shared store.
///
/// Fields this crate does not model are kept in `extra` so records written by
/// other producers survive a load/persist cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "source_name")]
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_icon_url: Option<String>,
    #[serde(
        rename = "match_title_from_api",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<String>,
    pub team1: Participant,
    pub team2: Participant,
    pub time: String,
    pub date: String,
    pub links: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Record {
    pub fn identity_key(&self) -> IdentityKey {
        identity_key(
            &self.owner,
            &self.team1.name,
            &self.team2.name,
            &self.date,
            &self.time,
        )
    }

    /// Start instant parsed from the stored `date` + `time` strings.
    pub fn scheduled_start(&self) -> Result<NaiveDateTime, ScheduleError> {
        parse_schedule(&self.date, &self.time, ScheduleFormat::Store)
    }
}

/// Element of the persisted store array.
///
/// Anything that does not have the [`Record`] shape is carried as `Opaque` and
/// written back exactly as it was read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StoreEntry {
    Record(Record),
    Opaque(JsonValue),
}

impl StoreEntry {
    /// Typed record only when writing it back reproduces `value` exactly, so
    /// other producers' entries (e.g. with explicit `null` fields) stay byte-stable.
    pub fn from_json(value: JsonValue) -> Self {
        match serde_json::from_value::<Record>(value.clone()) {
            Ok(record) if serde_json::to_value(&record).ok().as_ref() == Some(&value) => {
                StoreEntry::Record(record)
            }
            _ => StoreEntry::Opaque(value),
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            StoreEntry::Record(record) => Some(record),
            StoreEntry::Opaque(_) => None,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            StoreEntry::Record(record) => Some(record.owner.as_str()),
            StoreEntry::Opaque(value) => value.get("source_name").and_then(JsonValue::as_str),
        }
    }

    /// `None` when the entry has no parseable schedule.
    pub fn scheduled_start(&self) -> Option<NaiveDateTime> {
        match self {
            StoreEntry::Record(record) => record.scheduled_start().ok(),
            StoreEntry::Opaque(value) => {
                let date = value.get("date").and_then(JsonValue::as_str)?;
                let time = value.get("time").and_then(JsonValue::as_str)?;
                parse_schedule(date, time, ScheduleFormat::Store).ok()
            }
        }
    }
}

impl<'de> Deserialize<'de> for StoreEntry {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(StoreEntry::from_json)
    }
}

impl From<Record> for StoreEntry {
    fn from(record: Record) -> Self {
        StoreEntry::Record(record)
    }
}

/// Order-invariant dedup key: owner, normalized participant pair, date, time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_participant(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn identity_key(owner: &str, name_a: &str, name_b: &str, date: &str, time: &str) -> IdentityKey {
    let a = normalize_participant(name_a);
    let b = normalize_participant(name_b);
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let parts = [owner, first.as_str(), second.as_str(), date, time].map(escape_key_part);
    IdentityKey(parts.join("|"))
}

/// Backslash-escape the separator so no two field tuples share a key.
fn escape_key_part(part: &str) -> String {
    part.replace('\\', "\\\\").replace('|', "\\|")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFormat {
    /// Upstream feed: `YYYY-MM-DD` + `HH:MM`.
    Ingest,
    /// Shared store: `DD-MM-YYYY` + `HH:MM`.
    Store,
}

impl ScheduleFormat {
    pub fn date_pattern(self) -> &'static str {
        match self {
            ScheduleFormat::Ingest => INGEST_DATE_FORMAT,
            ScheduleFormat::Store => STORE_DATE_FORMAT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("date {value:?} does not match {pattern}")]
    InvalidDate { value: String, pattern: &'static str },
    #[error("time {value:?} does not match %H:%M")]
    InvalidTime { value: String },
}

/// Single conversion point for every date/time string pair in the system.
pub fn parse_schedule(
    date: &str,
    time: &str,
    format: ScheduleFormat,
) -> Result<NaiveDateTime, ScheduleError> {
    let pattern = format.date_pattern();
    let day = NaiveDate::parse_from_str(date.trim(), pattern).map_err(|_| {
        ScheduleError::InvalidDate {
            value: date.to_string(),
            pattern,
        }
    })?;
    let clock = NaiveTime::parse_from_str(time.trim(), TIME_FORMAT).map_err(|_| {
        ScheduleError::InvalidTime {
            value: time.to_string(),
        }
    })?;
    Ok(day.and_time(clock))
}

/// Store-format `(date, time)` strings for an instant.
pub fn format_schedule(start: NaiveDateTime) -> (String, String) {
    (
        start.format(STORE_DATE_FORMAT).to_string(),
        start.format(TIME_FORMAT).to_string(),
    )
}

/// Schedules carry no zone; they are read as UTC wall-clock.
pub fn is_stale(start: NaiveDateTime, run_instant: DateTime<Utc>, threshold: Duration) -> bool {
    start.and_utc() < run_instant - threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    CategoryMismatch,
    MalformedItem,
    InvalidParticipants,
    UnparsableSchedule,
    Historical,
    NoPlayableLinks,
}

impl RejectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionKind::CategoryMismatch => "category_mismatch",
            RejectionKind::MalformedItem => "malformed_item",
            RejectionKind::InvalidParticipants => "invalid_participants",
            RejectionKind::UnparsableSchedule => "unparsable_schedule",
            RejectionKind::Historical => "historical",
            RejectionKind::NoPlayableLinks => "no_playable_links",
        }
    }

    /// Category mismatches are filters, not data problems.
    pub fn is_filter(self) -> bool {
        matches!(self, RejectionKind::CategoryMismatch)
    }
}

/// Structured events emitted while a run reconciles the store.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StoreLoaded { path: String, entries: usize },
    StoreLoadFailed { path: String, missing: bool, error: String },
    DuplicateCollapsed { key: IdentityKey },
    FetchFailed { url: String, error: String },
    TlsFallbackUsed { url: String },
    DecodeFailed { error: String },
    ItemRejected { kind: RejectionKind, detail: String },
    RecordInserted { key: IdentityKey },
    RecordUpdated { key: IdentityKey },
    ForeignRecordRefused { key: IdentityKey, owner: String },
    RecordExpired { key: IdentityKey },
    ExpiryUnparsable { key: IdentityKey, error: String },
    StoreWritten { path: String, entries: usize, sha256: String },
    StoreWriteFailed { path: String, error: String },
}

/// Sink for reconciliation events. Injected into the engine instead of
/// reaching for a global logger.
pub trait SyncObserver: Send + Sync {
    fn record(&self, event: &SyncEvent);
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {
    fn record(&self, _event: &SyncEvent) {}
}

/// Keeps every event in memory; used by tests and by callers that want to
/// inspect a run after the fact.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, predicate: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl SyncObserver for RecordingObserver {
    fn record(&self, event: &SyncEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
