//! Core domain model for reviewpipe.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "reviewpipe-core";

/// Origin platform of a review. The serialized tag is what lands in `raw_reviews.source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewSource {
    AppStore,
    GooglePlay,
}

impl ReviewSource {
    pub const ALL: [ReviewSource; 2] = [ReviewSource::AppStore, ReviewSource::GooglePlay];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewSource::AppStore => "app_store",
            ReviewSource::GooglePlay => "google_play",
        }
    }
}

impl fmt::Display for ReviewSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown review source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for ReviewSource {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReviewSource::ALL
            .into_iter()
            .find(|source| source.as_str() == s.trim())
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// One (source, app, locale) collection target.
///
/// `query` is a store search phrase used to rediscover the app when `app_id` yields nothing.
/// Only the Google Play adapter reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTarget {
    pub source: ReviewSource,
    pub app_id: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl AppTarget {
    pub fn new(
        source: ReviewSource,
        app_id: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            source,
            app_id: app_id.into(),
            country: country.into().trim().to_ascii_lowercase(),
            query: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = Some(query.trim().to_string()).filter(|q| !q.is_empty());
        self
    }
}

impl fmt::Display for AppTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.app_id, self.country)
    }
}

/// How a rating that parses to zero is treated.
///
/// Feeds only ever send 1..=5, so the collector has historically folded a literal `0` into
/// "no rating" together with unparseable input. `KeepZero` stores it as `Some(0)` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingPolicy {
    #[default]
    ZeroIsMissing,
    KeepZero,
}

/// Normalized review row, shaped like the `raw_reviews` table.
///
/// Constructed once per run from a fetched feed entry and never mutated afterwards.
/// `(source, review_id)` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReview {
    pub source: ReviewSource,
    pub platform_app_id: String,
    pub review_id: String,
    pub author_name: Option<String>,
    pub author_hash: String,
    pub rating: Option<i32>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub thumbs_up: i32,
    pub data: JsonValue,
}
