//! Reconciliation engine + single-pass sync pipeline for the shared event store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use matchday_adapters::{
    AdapterContext, AdapterError, FeedProfile, MatchFeedAdapter, ParsedListing, SourceAdapter,
};
use matchday_core::{
    is_stale, staleness_threshold, IdentityKey, Record, RejectionKind, StoreEntry, SyncEvent,
    SyncObserver, DEFAULT_ICON_URL,
};
use matchday_storage::{HttpClientConfig, HttpFetcher, SnapshotStore, TlsFallbackPolicy};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-sync";

const DEFAULT_ENDPOINT: &str = "https://streamed.su/api/matches/all-today";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_path: PathBuf,
    pub source: FeedProfile,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub tls_fallback: TlsFallbackPolicy,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let source = match lookup("MATCHDAY_SOURCE_FILE") {
            Some(path) => load_source_profile(Path::new(&path))?,
            None => FeedProfile {
                owner: lookup("MATCHDAY_OWNER").unwrap_or_else(|| "streamed".to_string()),
                endpoint: lookup("MATCHDAY_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
                category: lookup("MATCHDAY_CATEGORY").unwrap_or_else(|| "football".to_string()),
                icon_url: lookup("MATCHDAY_ICON_URL").unwrap_or_else(|| DEFAULT_ICON_URL.to_string()),
            },
        };

        let tls_fallback = match lookup("MATCHDAY_TLS_FALLBACK") {
            Some(raw) => raw
                .parse()
                .map_err(anyhow::Error::msg)
                .context("parsing MATCHDAY_TLS_FALLBACK")?,
            None => TlsFallbackPolicy::default(),
        };

        Ok(Self {
            store_path: lookup("MATCHDAY_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("live_events.json")),
            source,
            user_agent: lookup("MATCHDAY_USER_AGENT").unwrap_or_else(|| "matchday-bot/0.1".to_string()),
            http_timeout_secs: lookup("MATCHDAY_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            tls_fallback,
        })
    }
}

pub fn load_source_profile(path: &Path) -> Result<FeedProfile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading source profile {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing source profile {}", path.display()))
}

/// `FETCH-YYYYMMDD-HHMMSS-XXXXXXXX`, printable in logs and summaries.
pub fn run_code(started_at: DateTime<Utc>, run_id: Uuid) -> String {
    let simple = run_id.simple().to_string();
    format!(
        "FETCH-{}-{}",
        started_at.format("%Y%m%d-%H%M%S"),
        simple[..8].to_ascii_uppercase()
    )
}

/// Owned partition keyed by identity. Every record in it carries `owner`.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedIndex {
    owner: String,
    records: BTreeMap<IdentityKey, Record>,
}

impl OwnedIndex {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            records: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub owned: OwnedIndex,
    pub foreign: Vec<StoreEntry>,
    pub collapsed_duplicates: usize,
}

/// Split the store into the owner's records and everything else.
///
/// An opaque entry tagged with `owner` is read as a record when it has the
/// record shape; otherwise it stays in `foreign` untouched.
pub fn partition_store(entries: Vec<StoreEntry>, owner: &str, observer: &dyn SyncObserver) -> Partition {
    let mut owned = OwnedIndex::new(owner);
    let mut foreign = Vec::new();
    let mut collapsed_duplicates = 0usize;

    for entry in entries {
        let record = match entry {
            StoreEntry::Record(record) if record.owner == owner => record,
            StoreEntry::Opaque(value) if entry_owned_by(&value, owner) => {
                match serde_json::from_value::<Record>(value.clone()) {
                    Ok(record) => record,
                    Err(_) => {
                        foreign.push(StoreEntry::Opaque(value));
                        continue;
                    }
                }
            }
            other => {
                foreign.push(other);
                continue;
            }
        };

        let key = record.identity_key();
        if owned.records.insert(key.clone(), record).is_some() {
            collapsed_duplicates += 1;
            observer.record(&SyncEvent::DuplicateCollapsed { key });
        }
    }

    Partition {
        owned,
        foreign,
        collapsed_duplicates,
    }
}

fn entry_owned_by(value: &serde_json::Value, owner: &str) -> bool {
    value.get("source_name").and_then(serde_json::Value::as_str) == Some(owner)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub refused: usize,
}

/// Insert new keys, overwrite existing ones wholesale. Nothing from the old
/// record survives an overwrite.
pub fn upsert(
    mut index: OwnedIndex,
    incoming: Vec<Record>,
    observer: &dyn SyncObserver,
) -> (OwnedIndex, MergeStats) {
    let mut stats = MergeStats::default();

    for record in incoming {
        let key = record.identity_key();
        if record.owner != index.owner {
            stats.refused += 1;
            observer.record(&SyncEvent::ForeignRecordRefused {
                key,
                owner: record.owner,
            });
            continue;
        }
        if index.records.insert(key.clone(), record).is_some() {
            stats.updated += 1;
            observer.record(&SyncEvent::RecordUpdated { key });
        } else {
            stats.inserted += 1;
            observer.record(&SyncEvent::RecordInserted { key });
        }
    }

    (index, stats)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryStats {
    pub expired: usize,
    pub unparsable_kept: usize,
}

/// Drop owned records that started more than `threshold` before `run_instant`.
/// Records whose schedule cannot be read are kept.
pub fn expire(
    index: OwnedIndex,
    run_instant: DateTime<Utc>,
    threshold: Duration,
    observer: &dyn SyncObserver,
) -> (Vec<Record>, ExpiryStats) {
    let mut stats = ExpiryStats::default();
    let mut kept = Vec::with_capacity(index.len());

    for (key, record) in index.records {
        match record.scheduled_start() {
            Ok(start) if is_stale(start, run_instant, threshold) => {
                stats.expired += 1;
                observer.record(&SyncEvent::RecordExpired { key });
            }
            Ok(_) => kept.push(record),
            Err(err) => {
                stats.unparsable_kept += 1;
                observer.record(&SyncEvent::ExpiryUnparsable {
                    key,
                    error: err.to_string(),
                });
                kept.push(record);
            }
        }
    }

    (kept, stats)
}

/// Stable ascending sort by start instant; unreadable schedules sort first.
pub fn sort_chronologically(mut entries: Vec<StoreEntry>) -> Vec<StoreEntry> {
    entries.sort_by_key(StoreEntry::scheduled_start);
    entries
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub loaded: usize,
    pub owned_before: usize,
    pub foreign: usize,
    pub opaque: usize,
    pub collapsed_duplicates: usize,
    pub merge: MergeStats,
    pub expiry: ExpiryStats,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub entries: Vec<StoreEntry>,
    pub stats: ReconcileStats,
}

/// Load-independent core of a run: partition, upsert, expire, recombine, sort.
pub fn reconcile(
    store: Vec<StoreEntry>,
    incoming: Vec<Record>,
    owner: &str,
    run_instant: DateTime<Utc>,
    observer: &dyn SyncObserver,
) -> Reconciliation {
    let loaded = store.len();
    let opaque = store
        .iter()
        .filter(|e| matches!(e, StoreEntry::Opaque(_)))
        .count();

    let partition = partition_store(store, owner, observer);
    let owned_before = partition.owned.len();
    let foreign_count = partition.foreign.len();

    let (owned, merge) = upsert(partition.owned, incoming, observer);
    let (owned, expiry) = expire(owned, run_instant, staleness_threshold(), observer);

    let mut combined = partition.foreign;
    combined.extend(owned.into_iter().map(StoreEntry::from));
    let entries = sort_chronologically(combined);

    Reconciliation {
        stats: ReconcileStats {
            loaded,
            owned_before,
            foreign: foreign_count,
            opaque,
            collapsed_duplicates: partition.collapsed_duplicates,
            merge,
            expiry,
            total: entries.len(),
        },
        entries,
    }
}

/// Production observer: every event becomes a structured tracing event.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn record(&self, event: &SyncEvent) {
        match event {
            SyncEvent::StoreLoaded { path, entries } => {
                info!(path = %path, entries, "loaded shared store")
            }
            SyncEvent::StoreLoadFailed { path, missing: true, .. } => {
                info!(path = %path, "no shared store yet; starting empty")
            }
            SyncEvent::StoreLoadFailed { path, error, .. } => {
                warn!(path = %path, error = %error, "shared store unusable; starting empty")
            }
            SyncEvent::DuplicateCollapsed { key } => {
                warn!(key = %key, "duplicate owned record in store; keeping the later one")
            }
            SyncEvent::FetchFailed { url, error } => {
                error!(url = %url, error = %error, "upstream fetch failed; continuing with no new items")
            }
            SyncEvent::TlsFallbackUsed { url } => {
                warn!(url = %url, "upstream fetched with certificate verification disabled")
            }
            SyncEvent::DecodeFailed { error } => {
                error!(error = %error, "upstream payload rejected; continuing with no new items")
            }
            SyncEvent::ItemRejected { kind, detail } if kind.is_filter() => {
                debug!(reason = kind.as_str(), detail = %detail, "item filtered")
            }
            SyncEvent::ItemRejected { kind, detail } => {
                warn!(reason = kind.as_str(), detail = %detail, "item skipped")
            }
            SyncEvent::RecordInserted { key } => info!(key = %key, "new record"),
            SyncEvent::RecordUpdated { key } => debug!(key = %key, "record overwritten"),
            SyncEvent::ForeignRecordRefused { key, owner } => {
                warn!(key = %key, owner = %owner, "refusing to merge record of another owner")
            }
            SyncEvent::RecordExpired { key } => info!(key = %key, "record expired"),
            SyncEvent::ExpiryUnparsable { key, error } => {
                warn!(key = %key, error = %error, "cannot read schedule; keeping record")
            }
            SyncEvent::StoreWritten { path, entries, sha256 } => {
                info!(path = %path, entries, sha256 = %sha256, "shared store written")
            }
            SyncEvent::StoreWriteFailed { path, error } => {
                error!(path = %path, error = %error, "shared store write failed; previous file left in place")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub run_code: String,
    pub owner: String,
    pub store_path: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_instant: DateTime<Utc>,
    pub store_load_error: Option<String>,
    pub fetch_failed: bool,
    pub tls_fallback_used: bool,
    pub fetched_items: usize,
    pub accepted: usize,
    pub rejected: BTreeMap<RejectionKind, usize>,
    pub reconcile: ReconcileStats,
    pub persisted: bool,
    pub snapshot_sha256: Option<String>,
    pub changed: bool,
}

impl SyncRunSummary {
    pub fn total_entries(&self) -> usize {
        self.reconcile.total
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: SnapshotStore,
    http: HttpFetcher,
    adapter: Box<dyn SourceAdapter>,
    observer: Arc<dyn SyncObserver>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = SnapshotStore::new(config.store_path.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: StdDuration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            tls_fallback: config.tls_fallback,
            ..Default::default()
        })
        .context("building upstream HTTP client")?;
        let adapter = Box::new(MatchFeedAdapter::new(config.source.clone()));
        Ok(Self {
            config,
            store,
            http,
            adapter,
            observer: Arc::new(TracingObserver),
        })
    }

    pub fn with_adapter(mut self, adapter: Box<dyn SourceAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> SyncRunSummary {
        self.run_once_at(Utc::now()).await
    }

    /// One full pass with a fixed run instant. Used for both ingestion staleness
    /// and owned-record expiry.
    pub async fn run_once_at(&self, run_instant: DateTime<Utc>) -> SyncRunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let code = run_code(started_at, run_id);
        let span = info_span!("sync_run", run_code = %code, owner = %self.config.source.owner);
        self.run_inner(run_id, code, started_at, run_instant)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        run_code: String,
        started_at: DateTime<Utc>,
        run_instant: DateTime<Utc>,
    ) -> SyncRunSummary {
        let observer = self.observer.as_ref();
        let owner = self.config.source.owner.clone();
        let store_path = self.store.path().display().to_string();

        let (existing, prior_sha256, store_load_error) = match self.store.load().await {
            Ok(snapshot) => {
                observer.record(&SyncEvent::StoreLoaded {
                    path: store_path.clone(),
                    entries: snapshot.entries.len(),
                });
                (snapshot.entries, Some(snapshot.sha256), None)
            }
            Err(err) => {
                observer.record(&SyncEvent::StoreLoadFailed {
                    path: store_path.clone(),
                    missing: err.is_missing(),
                    error: err.to_string(),
                });
                (Vec::new(), None, Some(err.to_string()))
            }
        };

        let ctx = AdapterContext::new(run_id, run_instant);
        let (listing, fetch_failed, tls_fallback_used) = self.fetch_listing(&ctx).await;
        for item in &listing.rejections {
            observer.record(&SyncEvent::ItemRejected {
                kind: item.rejection.kind(),
                detail: match &item.title {
                    Some(title) => format!("{title}: {}", item.rejection),
                    None => item.rejection.to_string(),
                },
            });
        }

        let fetched_items = listing.total_items;
        let accepted = listing.records.len();
        let rejected = listing.rejected_by_kind();
        let reconciliation = reconcile(existing, listing.records, &owner, run_instant, observer);

        let (persisted, snapshot_sha256) = match self.store.persist(&reconciliation.entries).await {
            Ok(snapshot) => {
                observer.record(&SyncEvent::StoreWritten {
                    path: store_path.clone(),
                    entries: snapshot.entries,
                    sha256: snapshot.sha256.clone(),
                });
                (true, Some(snapshot.sha256))
            }
            Err(err) => {
                observer.record(&SyncEvent::StoreWriteFailed {
                    path: store_path.clone(),
                    error: err.to_string(),
                });
                (false, None)
            }
        };
        let changed = persisted && snapshot_sha256 != prior_sha256;

        let summary = SyncRunSummary {
            run_id,
            run_code,
            owner,
            store_path,
            started_at,
            finished_at: Utc::now(),
            run_instant,
            store_load_error,
            fetch_failed,
            tls_fallback_used,
            fetched_items,
            accepted,
            rejected,
            reconcile: reconciliation.stats,
            persisted,
            snapshot_sha256,
            changed,
        };
        info!(
            fetched = summary.fetched_items,
            accepted = summary.accepted,
            inserted = summary.reconcile.merge.inserted,
            updated = summary.reconcile.merge.updated,
            expired = summary.reconcile.expiry.expired,
            total = summary.reconcile.total,
            changed = summary.changed,
            "sync run finished"
        );
        summary
    }

    /// Never fails: transport and decode problems become an empty listing.
    async fn fetch_listing(&self, ctx: &AdapterContext) -> (ParsedListing, bool, bool) {
        let observer = self.observer.as_ref();
        let endpoint = &self.config.source.endpoint;

        let page = match self.adapter.fetch_listing(&self.http, ctx).await {
            Ok(page) => page,
            Err(err) => {
                let tls_fallback_used = matches!(&err, AdapterError::Fetch(f) if f.tls_fallback_used());
                if tls_fallback_used {
                    observer.record(&SyncEvent::TlsFallbackUsed {
                        url: endpoint.clone(),
                    });
                }
                observer.record(&SyncEvent::FetchFailed {
                    url: endpoint.clone(),
                    error: err.to_string(),
                });
                return (ParsedListing::default(), true, tls_fallback_used);
            }
        };

        if page.tls_fallback_used {
            observer.record(&SyncEvent::TlsFallbackUsed {
                url: page.url.clone(),
            });
        }

        match self.adapter.parse_listing(&page, ctx) {
            Ok(listing) => (listing, false, page.tls_fallback_used),
            Err(err) => {
                observer.record(&SyncEvent::DecodeFailed {
                    error: err.to_string(),
                });
                (ParsedListing::default(), false, page.tls_fallback_used)
            }
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    Ok(pipeline.run_once().await)
}

#[derive(Debug, Default)]
struct OwnerReport {
    records: usize,
    opaque: usize,
    unscheduled: usize,
    earliest: Option<NaiveDateTime>,
    latest: Option<NaiveDateTime>,
}

/// Markdown overview of a store file grouped by owner.
pub async fn report_store_markdown(path: &Path) -> Result<String> {
    let snapshot = SnapshotStore::new(path)
        .load()
        .await
        .with_context(|| format!("loading store {}", path.display()))?;

    let mut owners: BTreeMap<String, OwnerReport> = BTreeMap::new();
    for entry in &snapshot.entries {
        let owner = entry.owner().unwrap_or("<unknown>").to_string();
        let row = owners.entry(owner).or_default();
        if entry.as_record().is_none() {
            row.opaque += 1;
            continue;
        }
        row.records += 1;
        match entry.scheduled_start() {
            Some(start) => {
                row.earliest = Some(row.earliest.map_or(start, |e| e.min(start)));
                row.latest = Some(row.latest.map_or(start, |l| l.max(start)));
            }
            None => row.unscheduled += 1,
        }
    }

    let fmt_instant = |t: Option<NaiveDateTime>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    let mut lines = vec![
        "# Matchday Store Report".to_string(),
        String::new(),
        format!("- store: `{}`", path.display()),
        format!("- entries: {}", snapshot.entries.len()),
        format!("- sha256: `{}`", snapshot.sha256),
        String::new(),
    ];
    for (owner, row) in owners {
        lines.push(format!("## {owner}"));
        lines.push(format!("- records: {}", row.records));
        if row.opaque > 0 {
            lines.push(format!("- opaque entries: {}", row.opaque));
        }
        if row.unscheduled > 0 {
            lines.push(format!("- unscheduled records: {}", row.unscheduled));
        }
        lines.push(format!("- earliest: {}", fmt_instant(row.earliest)));
        lines.push(format!("- latest: {}", fmt_instant(row.latest)));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
