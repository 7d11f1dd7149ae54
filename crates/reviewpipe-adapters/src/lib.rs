//! Source adapter contract + App Store customer-review RSS adapter.
//!
//! The Google Play adapter is [`GooglePlayAdapter`].

mod google_play;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reviewpipe_core::{AppTarget, CanonicalReview, RatingPolicy, ReviewSource};
use reviewpipe_storage::{author_hash, FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use google_play::{
    parse_reviews_response, parse_search_results, reviews_request, reviews_to_canonical,
    GooglePlayAdapter, ReviewBatch, GOOGLE_PLAY_BASE_URL, GOOGLE_PLAY_DEFAULT_LANG,
    GOOGLE_PLAY_MAX_REVIEWS, GOOGLE_PLAY_PAGE_SIZE, GOOGLE_PLAY_SEARCH_CANDIDATES,
};

pub const CRATE_NAME: &str = "reviewpipe-adapters";

pub const APP_STORE_FEED_BASE_URL: &str = "https://itunes.apple.com";

/// The public feed serves at most ten pages per app and country.
pub const APP_STORE_MAX_PAGES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed feed page {page}: {message}")]
    Parse { page: u32, message: String },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> ReviewSource;

    /// Collects every review the source currently exposes for `target`, in feed order.
    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &AppTarget,
    ) -> Result<Vec<CanonicalReview>, AdapterError>;
}

/// Knobs shared by every adapter built through [`adapter_for_source`].
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub app_store_base_url: String,
    pub google_play_base_url: String,
    pub google_play_lang: String,
    pub google_play_max_reviews: usize,
    pub rating_policy: RatingPolicy,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            app_store_base_url: APP_STORE_FEED_BASE_URL.to_string(),
            google_play_base_url: GOOGLE_PLAY_BASE_URL.to_string(),
            google_play_lang: GOOGLE_PLAY_DEFAULT_LANG.to_string(),
            google_play_max_reviews: GOOGLE_PLAY_MAX_REVIEWS,
            rating_policy: RatingPolicy::default(),
        }
    }
}

pub fn adapter_for_source(
    source: ReviewSource,
    settings: &AdapterSettings,
) -> Arc<dyn SourceAdapter> {
    match source {
        ReviewSource::AppStore => Arc::new(AppStoreRssAdapter::new(
            settings.app_store_base_url.clone(),
            settings.rating_policy,
        )),
        ReviewSource::GooglePlay => Arc::new(GooglePlayAdapter::new(
            settings.google_play_base_url.clone(),
            settings.google_play_lang.clone(),
            settings.google_play_max_reviews,
            settings.rating_policy,
        )),
    }
}

#[derive(Debug, Clone)]
pub struct AppStoreRssAdapter {
    base_url: String,
    max_pages: u32,
    rating_policy: RatingPolicy,
}

impl AppStoreRssAdapter {
    pub fn new(base_url: impl Into<String>, rating_policy: RatingPolicy) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_pages: APP_STORE_MAX_PAGES,
            rating_policy,
        }
    }

    pub fn page_url(&self, target: &AppTarget, page: u32) -> String {
        format!(
            "{}/{}/rss/customerreviews/page={}/id={}/sortby=mostrecent/json",
            self.base_url, target.country, page, target.app_id
        )
    }
}

#[async_trait]
impl SourceAdapter for AppStoreRssAdapter {
    fn source(&self) -> ReviewSource {
        ReviewSource::AppStore
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &AppTarget,
    ) -> Result<Vec<CanonicalReview>, AdapterError> {
        if target.source != self.source() {
            return Err(AdapterError::Message(format!(
                "target source={} does not match adapter source={}",
                target.source,
                self.source()
            )));
        }

        let mut rows = Vec::new();
        for page in 1..=self.max_pages {
            let url = self.page_url(target, page);
            let resp = match http.fetch_bytes(ctx.run_id, self.source().as_str(), &url).await {
                Ok(resp) => resp,
                Err(FetchError::HttpStatus { status, .. }) => {
                    debug!(%target, page, status, "feed ended on non-success status");
                    break;
                }
                Err(err) => return Err(err.into()),
            };

            let parsed = parse_feed_page(&resp.body, target, self.rating_policy).map_err(|e| {
                AdapterError::Parse {
                    page,
                    message: e.to_string(),
                }
            })?;
            match parsed {
                FeedPage::End => {
                    debug!(%target, page, "feed ended on page without reviews");
                    break;
                }
                FeedPage::Reviews(mut reviews) => {
                    debug!(%target, page, reviews = reviews.len(), "parsed feed page");
                    rows.append(&mut reviews);
                }
            }
        }
        Ok(rows)
    }
}

const MISSING_ID_PART: &str = "undefined";

/// Result of parsing one feed page.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPage {
    /// No reviews on this page; pagination stops here.
    End,
    Reviews(Vec<CanonicalReview>),
}

/// Parses one page of the customer-review JSON feed.
///
/// `feed.entry[0]` is always the app's own metadata record, so a page needs at least two
/// entries to carry any review. A body that is not JSON at all is an error.
pub fn parse_feed_page(
    body: &[u8],
    target: &AppTarget,
    rating_policy: RatingPolicy,
) -> Result<FeedPage, serde_json::Error> {
    let document: JsonValue = serde_json::from_slice(body)?;
    let entries = match json_value(&document, &["feed", "entry"]) {
        Some(JsonValue::Array(entries)) => entries.as_slice(),
        _ => return Ok(FeedPage::End),
    };
    if entries.len() <= 1 {
        return Ok(FeedPage::End);
    }

    Ok(FeedPage::Reviews(
        entries[1..]
            .iter()
            .map(|entry| entry_to_review(entry, target, rating_policy))
            .collect(),
    ))
}

/// The subset of an RSS entry the pipeline reads. Everything else rides along in `data`.
#[derive(Debug, Default, PartialEq)]
struct EntryFields {
    id: Option<String>,
    author: Option<String>,
    rating: Option<JsonValue>,
    title: Option<String>,
    content: Option<String>,
    updated: Option<String>,
}

impl EntryFields {
    fn from_entry(entry: &JsonValue) -> Self {
        let rating = json_value(entry, &["im:rating", "label"])
            .filter(|v| !v.is_null())
            .or_else(|| json_value(entry, &["rating", "label"]))
            .cloned();
        Self {
            id: json_text(entry, &["id", "label"]),
            author: json_text(entry, &["author", "name", "label"]),
            rating,
            title: json_text(entry, &["title", "label"]),
            content: json_text(entry, &["content", "label"])
                .or_else(|| json_text(entry, &["summary", "label"])),
            updated: json_text(entry, &["updated", "label"]),
        }
    }
}

// Entries without an id get `{author}-{updated}`, with `undefined` standing in for either
// missing part so keys already stored for such entries stay stable.
fn entry_to_review(
    entry: &JsonValue,
    target: &AppTarget,
    rating_policy: RatingPolicy,
) -> CanonicalReview {
    let fields = EntryFields::from_entry(entry);
    let review_id = fields.id.clone().unwrap_or_else(|| {
        format!(
            "{}-{}",
            fields.author.as_deref().unwrap_or(MISSING_ID_PART),
            fields.updated.as_deref().unwrap_or(MISSING_ID_PART)
        )
    });
    let posted_at = fields.updated.as_deref().and_then(|raw| {
        let parsed = parse_timestamp(raw);
        if parsed.is_none() {
            debug!(review_id = %review_id, updated = raw, "unparseable review timestamp");
        }
        parsed
    });

    CanonicalReview {
        source: ReviewSource::AppStore,
        platform_app_id: target.app_id.clone(),
        author_hash: author_hash(fields.author.as_deref()),
        rating: normalize_rating(fields.rating.as_ref(), rating_policy),
        review_id,
        author_name: fields.author,
        title: fields.title,
        content: fields.content,
        posted_at,
        thumbs_up: 0,
        data: entry.clone(),
    }
}

/// Star rating from a feed label or a numeric score.
///
/// Absent, non-numeric, fractional and out-of-range values are `None`. A value that reads as
/// zero (including an empty label) is `None` under [`RatingPolicy::ZeroIsMissing`].
///
/// Fractional labels such as `"4.5"` are rejected rather than truncated to `4`, so they
/// never land in the integer rating column as a different score.
pub fn normalize_rating(raw: Option<&JsonValue>, policy: RatingPolicy) -> Option<i32> {
    let number = match raw? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().ok()?
            }
        }
        JsonValue::Number(n) => n.as_f64()?,
        _ => return None,
    };
    if !number.is_finite() || number.fract() != 0.0 {
        return None;
    }
    if number == 0.0 && policy == RatingPolicy::ZeroIsMissing {
        return None;
    }
    if number < i32::MIN as f64 || number > i32::MAX as f64 {
        return None;
    }
    Some(number as i32)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn json_value<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_value(value, path)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
