//! Upstream source adapter contract + the JSON match feed adapter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use matchday_core::{
    format_schedule, is_stale, parse_schedule, staleness_threshold, Participant, Record,
    RejectionKind, ScheduleError, ScheduleFormat, DEFAULT_ICON_URL,
};
use matchday_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-adapters";

/// Participant names upstream uses when it has nothing real to say.
const PLACEHOLDER_NAMES: [&str; 2] = ["Not Found", "Name Not Found"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub attempts: usize,
    pub tls_fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub run_instant: DateTime<Utc>,
    pub staleness: Duration,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, run_instant: DateTime<Utc>) -> Self {
        Self {
            run_id,
            run_instant,
            staleness: staleness_threshold(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("upstream payload could not be decoded: {0}")]
    Decode(String),
}

/// One upstream item the adapter declined to turn into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("category {found:?} is not {expected:?}")]
    CategoryMismatch {
        found: Option<String>,
        expected: String,
    },
    #[error("item is not a readable match object: {0}")]
    MalformedItem(String),
    #[error("invalid participants {team1:?} vs {team2:?}")]
    InvalidParticipants {
        team1: Option<String>,
        team2: Option<String>,
    },
    #[error("unparsable schedule: {0}")]
    UnparsableSchedule(#[source] ScheduleError),
    #[error("starts at {start}, before the staleness cutoff")]
    Historical { start: NaiveDateTime },
    #[error("no playable links")]
    NoPlayableLinks,
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Rejection::CategoryMismatch { .. } => RejectionKind::CategoryMismatch,
            Rejection::MalformedItem(_) => RejectionKind::MalformedItem,
            Rejection::InvalidParticipants { .. } => RejectionKind::InvalidParticipants,
            Rejection::UnparsableSchedule(_) => RejectionKind::UnparsableSchedule,
            Rejection::Historical { .. } => RejectionKind::Historical,
            Rejection::NoPlayableLinks => RejectionKind::NoPlayableLinks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRejection {
    pub title: Option<String>,
    pub rejection: Rejection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedListing {
    pub total_items: usize,
    pub records: Vec<Record>,
    pub rejections: Vec<ItemRejection>,
}

impl ParsedListing {
    pub fn rejected_by_kind(&self) -> BTreeMap<RejectionKind, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.rejections {
            *counts.entry(item.rejection.kind()).or_default() += 1;
        }
        counts
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Owner tag stamped on every record this adapter produces.
    fn source_id(&self) -> &str;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<ParsedListing, AdapterError>;
}

/// Where a feed lives and how its records are stamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedProfile {
    pub owner: String,
    pub endpoint: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_icon_url")]
    pub icon_url: String,
}

fn default_category() -> String {
    "football".to_string()
}

fn default_icon_url() -> String {
    DEFAULT_ICON_URL.to_string()
}

/// Raw upstream match item; every field optional so shape problems surface as
/// rejections instead of decode failures for the whole batch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamItem {
    #[serde(default)]
    pub sport: Option<String>,
    #[serde(default)]
    pub match_date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub match_text: Option<String>,
    #[serde(default)]
    pub team1: Option<String>,
    #[serde(default)]
    pub team2: Option<String>,
    #[serde(default)]
    pub channels: Option<Vec<JsonValue>>,
}

/// Accepts `{"matches": [...]}` and, failing that, a bare top-level array.
pub fn decode_feed(body: &[u8]) -> Result<Vec<JsonValue>, AdapterError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| AdapterError::Decode(e.to_string()))?;
    match value {
        JsonValue::Object(mut map) => match map.remove("matches") {
            Some(JsonValue::Array(items)) => Ok(items),
            Some(_) => Err(AdapterError::Decode("\"matches\" is not an array".to_string())),
            None => Err(AdapterError::Decode("object has no \"matches\" key".to_string())),
        },
        JsonValue::Array(items) => Ok(items),
        _ => Err(AdapterError::Decode(
            "expected an object with \"matches\" or an array".to_string(),
        )),
    }
}

/// Flatten `channels[*].links[*]`, keeping non-blank strings in upstream order.
pub fn extract_links(channels: &[JsonValue]) -> Vec<String> {
    channels
        .iter()
        .filter_map(|channel| channel.get("links").and_then(JsonValue::as_array))
        .flatten()
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .filter(|link| !link.is_empty())
        .map(str::to_string)
        .collect()
}

fn valid_name(name: Option<&str>) -> Option<&str> {
    let name = name?.trim();
    if name.is_empty() || PLACEHOLDER_NAMES.contains(&name) {
        None
    } else {
        Some(name)
    }
}

#[derive(Debug, Clone)]
pub struct MatchFeedAdapter {
    profile: FeedProfile,
}

impl MatchFeedAdapter {
    pub fn new(profile: FeedProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &FeedProfile {
        &self.profile
    }

    /// Validate one raw item and turn it into a store record.
    pub fn transform_item(&self, raw: &JsonValue, ctx: &AdapterContext) -> Result<Record, Rejection> {
        let sport = raw.get("sport").and_then(JsonValue::as_str);
        if !sport.is_some_and(|s| s.trim().eq_ignore_ascii_case(self.profile.category.trim())) {
            return Err(Rejection::CategoryMismatch {
                found: sport.map(str::to_string),
                expected: self.profile.category.clone(),
            });
        }

        let item: UpstreamItem = serde_json::from_value(raw.clone())
            .map_err(|e| Rejection::MalformedItem(e.to_string()))?;

        let (Some(team1), Some(team2)) = (
            valid_name(item.team1.as_deref()),
            valid_name(item.team2.as_deref()),
        ) else {
            return Err(Rejection::InvalidParticipants {
                team1: item.team1.clone(),
                team2: item.team2.clone(),
            });
        };

        let start = parse_schedule(
            item.match_date.as_deref().unwrap_or_default(),
            item.time.as_deref().unwrap_or_default(),
            ScheduleFormat::Ingest,
        )
        .map_err(Rejection::UnparsableSchedule)?;

        if is_stale(start, ctx.run_instant, ctx.staleness) {
            return Err(Rejection::Historical { start });
        }

        let links = extract_links(item.channels.as_deref().unwrap_or_default());
        if links.is_empty() {
            return Err(Rejection::NoPlayableLinks);
        }

        let (date, time) = format_schedule(start);
        Ok(Record {
            owner: self.profile.owner.clone(),
            source_icon_url: Some(self.profile.icon_url.clone()),
            title: item.match_text.clone(),
            team1: Participant::with_default_logo(team1),
            team2: Participant::with_default_logo(team2),
            time,
            date,
            links,
            extra: BTreeMap::new(),
        })
    }

    pub fn transform_items(&self, items: Vec<JsonValue>, ctx: &AdapterContext) -> ParsedListing {
        let mut listing = ParsedListing {
            total_items: items.len(),
            ..ParsedListing::default()
        };
        for raw in items {
            match self.transform_item(&raw, ctx) {
                Ok(record) => listing.records.push(record),
                Err(rejection) => listing.rejections.push(ItemRejection {
                    title: raw
                        .get("matchText")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                    rejection,
                }),
            }
        }
        listing
    }
}

#[async_trait]
impl SourceAdapter for MatchFeedAdapter {
    fn source_id(&self) -> &str {
        &self.profile.owner
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let fetched = http
            .fetch_bytes(ctx.run_id, &self.profile.owner, &self.profile.endpoint)
            .await?;
        Ok(FetchedPage {
            url: fetched.final_url,
            body: fetched.body,
            fetched_at: Utc::now(),
            attempts: fetched.attempts,
            tls_fallback_used: fetched.tls_fallback_used,
        })
    }

    fn parse_listing(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<ParsedListing, AdapterError> {
        let items = decode_feed(&page.body)?;
        Ok(self.transform_items(items, ctx))
    }
}

pub fn adapter_for_profile(profile: FeedProfile) -> Box<dyn SourceAdapter> {
    Box::new(MatchFeedAdapter::new(profile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use matchday_core::DEFAULT_LOGO_URL;
    use serde_json::json;

    fn adapter() -> MatchFeedAdapter {
        MatchFeedAdapter::new(FeedProfile {
            owner: "streamed".to_string(),
            endpoint: "http://localhost/feed".to_string(),
            category: "football".to_string(),
            icon_url: "https://icons/streamed.png".to_string(),
        })
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(
            Uuid::nil(),
            Utc.with_ymd_and_hms(2099, 1, 1, 12, 0, 0).single().unwrap(),
        )
    }

    fn item(team1: &str, team2: &str, date: &str, time: &str) -> JsonValue {
        json!({
            "sport": "Football",
            "matchDate": date,
            "time": time,
            "matchText": format!("{team1} vs {team2}"),
            "team1": team1,
            "team2": team2,
            "channels": [{"links": ["http://a"]}]
        })
    }

    #[test]
    fn valid_item_becomes_store_record() {
        let record = adapter()
            .transform_item(&item("Chelsea", "Arsenal", "2099-01-01", "18:00"), &ctx())
            .expect("valid");
        assert_eq!(record.owner, "streamed");
        assert_eq!(record.date, "01-01-2099");
        assert_eq!(record.time, "18:00");
        assert_eq!(record.team1.name, "Chelsea");
        assert_eq!(record.team2.logo_url, DEFAULT_LOGO_URL);
        assert_eq!(record.source_icon_url.as_deref(), Some("https://icons/streamed.png"));
        assert_eq!(record.title.as_deref(), Some("Chelsea vs Arsenal"));
        assert_eq!(record.links, vec!["http://a".to_string()]);
    }

    #[test]
    fn other_categories_are_filtered() {
        let mut raw = item("A", "B", "2099-01-01", "18:00");
        raw["sport"] = json!("basketball");
        let err = adapter().transform_item(&raw, &ctx()).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::CategoryMismatch);
        assert!(err.kind().is_filter());

        raw.as_object_mut().unwrap().remove("sport");
        assert_eq!(
            adapter().transform_item(&raw, &ctx()).unwrap_err().kind(),
            RejectionKind::CategoryMismatch
        );
    }

    #[test]
    fn blank_or_placeholder_names_are_invalid() {
        for (a, b) in [("", "B"), ("A", "   "), ("Not Found", "B"), ("A", "Name Not Found")] {
            let err = adapter()
                .transform_item(&item(a, b, "2099-01-01", "18:00"), &ctx())
                .unwrap_err();
            assert_eq!(err.kind(), RejectionKind::InvalidParticipants, "{a:?} {b:?}");
        }

        let mut raw = item("A", "B", "2099-01-01", "18:00");
        raw.as_object_mut().unwrap().remove("team2");
        assert_eq!(
            adapter().transform_item(&raw, &ctx()).unwrap_err().kind(),
            RejectionKind::InvalidParticipants
        );
    }

    #[test]
    fn bad_schedule_rejects_only_that_item() {
        let items = vec![
            item("A", "B", "01/01/2099", "18:00"),
            item("C", "D", "2099-01-01", "late"),
            item("E", "F", "2099-01-02", "09:30"),
        ];
        let listing = adapter().transform_items(items, &ctx());
        assert_eq!(listing.total_items, 3);
        assert_eq!(listing.records.len(), 1);
        assert_eq!(listing.records[0].time, "09:30");
        assert_eq!(
            listing.rejected_by_kind().get(&RejectionKind::UnparsableSchedule),
            Some(&2)
        );
    }

    #[test]
    fn staleness_cutoff_is_inclusive() {
        // run instant is 2099-01-01 12:00, so the cutoff is 2098-12-31 12:00
        assert!(adapter()
            .transform_item(&item("A", "B", "2098-12-31", "12:00"), &ctx())
            .is_ok());
        let err = adapter()
            .transform_item(&item("A", "B", "2098-12-31", "11:59"), &ctx())
            .unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Historical);
    }

    #[test]
    fn links_are_flattened_in_order_keeping_duplicates() {
        let channels = vec![
            json!({"links": ["http://1", "", "http://2"]}),
            json!({"name": "no links here"}),
            json!({"links": [null, 7, "  ", "http://1"]}),
            json!("not an object"),
        ];
        assert_eq!(
            extract_links(&channels),
            vec!["http://1".to_string(), "http://2".to_string(), "http://1".to_string()]
        );
    }

    #[test]
    fn empty_links_reject_an_otherwise_valid_item() {
        let mut raw = item("A", "B", "2099-01-01", "18:00");
        raw["channels"] = json!([{"links": ["", "   "]}, {"links": []}]);
        assert_eq!(
            adapter().transform_item(&raw, &ctx()).unwrap_err(),
            Rejection::NoPlayableLinks
        );

        raw.as_object_mut().unwrap().remove("channels");
        assert_eq!(
            adapter().transform_item(&raw, &ctx()).unwrap_err(),
            Rejection::NoPlayableLinks
        );
    }

    #[test]
    fn wrongly_typed_fields_are_malformed_not_fatal() {
        let mut raw = item("A", "B", "2099-01-01", "18:00");
        raw["team1"] = json!(42);
        let listing = adapter().transform_items(vec![raw, item("C", "D", "2099-01-01", "18:00")], &ctx());
        assert_eq!(listing.records.len(), 1);
        assert_eq!(listing.rejections[0].rejection.kind(), RejectionKind::MalformedItem);
        assert_eq!(listing.rejections[0].title.as_deref(), Some("A vs B"));
    }

    #[test]
    fn feed_accepts_wrapped_or_bare_arrays() {
        assert_eq!(decode_feed(br#"{"matches": [{}, {}]}"#).unwrap().len(), 2);
        assert_eq!(decode_feed(br#"[{}]"#).unwrap().len(), 1);
        assert!(matches!(decode_feed(b"<html>"), Err(AdapterError::Decode(_))));
        assert!(matches!(decode_feed(br#"{"data": []}"#), Err(AdapterError::Decode(_))));
        assert!(matches!(decode_feed(br#"{"matches": {}}"#), Err(AdapterError::Decode(_))));
        assert!(matches!(decode_feed(b"42"), Err(AdapterError::Decode(_))));
    }

    #[test]
    fn parse_listing_surfaces_decode_errors() {
        let page = FetchedPage {
            url: "http://localhost/feed".to_string(),
            body: b"not json".to_vec(),
            fetched_at: ctx().run_instant,
            attempts: 1,
            tls_fallback_used: false,
        };
        assert!(matches!(
            adapter().parse_listing(&page, &ctx()),
            Err(AdapterError::Decode(_))
        ));
    }

    #[test]
    fn profile_defaults_apply_when_yaml_omits_them() {
        let profile: FeedProfile =
            serde_json::from_value(json!({"owner": "x", "endpoint": "http://e"})).unwrap();
        assert_eq!(profile.category, "football");
        assert_eq!(profile.icon_url, DEFAULT_ICON_URL);
    }
}
