//! Google Play reviews through the store's `batchexecute` RPC.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reviewpipe_core::{AppTarget, CanonicalReview, RatingPolicy, ReviewSource};
use reviewpipe_storage::{author_hash, HttpFetcher};
use scraper::{Html, Selector};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{normalize_rating, AdapterContext, AdapterError, SourceAdapter};

pub const GOOGLE_PLAY_BASE_URL: &str = "https://play.google.com";
pub const GOOGLE_PLAY_DEFAULT_LANG: &str = "en";
pub const GOOGLE_PLAY_MAX_REVIEWS: usize = 1200;

/// Largest batch the reviews RPC hands out per call.
pub const GOOGLE_PLAY_PAGE_SIZE: usize = 200;

/// Search hits tried, in rank order, when the configured app id yields nothing.
pub const GOOGLE_PLAY_SEARCH_CANDIDATES: usize = 5;

const REVIEWS_RPC_ID: &str = "UsvDTd";
const SORT_NEWEST: u8 = 2;

#[derive(Debug, Clone)]
pub struct GooglePlayAdapter {
    base_url: String,
    lang: String,
    max_reviews: usize,
    rating_policy: RatingPolicy,
}

impl GooglePlayAdapter {
    pub fn new(
        base_url: impl Into<String>,
        lang: impl Into<String>,
        max_reviews: usize,
        rating_policy: RatingPolicy,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            lang: lang.into(),
            max_reviews,
            rating_policy,
        }
    }

    fn rpc_url(&self) -> String {
        format!("{}/_/PlayStoreUi/data/batchexecute", self.base_url)
    }

    fn search_url(&self) -> String {
        format!("{}/store/search", self.base_url)
    }

    /// Pages newest-first until the cap, an empty batch or a missing continuation token.
    ///
    /// A failed or undecodable call ends paging and keeps what was already fetched. `None` for
    /// `country` queries the global store.
    async fn fetch_reviews(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        app_id: &str,
        country: Option<&str>,
    ) -> Vec<JsonValue> {
        let mut query = vec![("hl", self.lang.as_str())];
        if let Some(country) = country {
            query.push(("gl", country));
        }
        let store = country.unwrap_or("global");
        let rpc_url = self.rpc_url();

        let mut fetched = Vec::new();
        let mut token: Option<String> = None;
        while fetched.len() < self.max_reviews {
            let count = GOOGLE_PLAY_PAGE_SIZE.min(self.max_reviews - fetched.len());
            let request = reviews_request(app_id, count, token.as_deref());
            let resp = match http
                .post_form(
                    ctx.run_id,
                    ReviewSource::GooglePlay.as_str(),
                    &rpc_url,
                    &query,
                    &[("f.req", request.as_str())],
                )
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(app_id, store, error = %err, "review batch fetch failed; stopping");
                    break;
                }
            };
            let batch = match parse_reviews_response(&resp.body) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(app_id, store, error = %err, "review batch undecodable; stopping");
                    break;
                }
            };
            if batch.reviews.is_empty() {
                break;
            }
            debug!(app_id, store, reviews = batch.reviews.len(), "fetched review batch");
            fetched.extend(batch.reviews);
            match batch.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        fetched.truncate(self.max_reviews);
        fetched
    }

    async fn search_candidates(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        query: &str,
        country: &str,
    ) -> Vec<String> {
        let params = [
            ("q", query),
            ("c", "apps"),
            ("hl", self.lang.as_str()),
            ("gl", country),
        ];
        let resp = match http
            .fetch_query(
                ctx.run_id,
                ReviewSource::GooglePlay.as_str(),
                &self.search_url(),
                &params,
            )
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!(query, error = %err, "app search failed");
                return Vec::new();
            }
        };
        let html = String::from_utf8_lossy(&resp.body);
        match parse_search_results(&html, GOOGLE_PLAY_SEARCH_CANDIDATES) {
            Ok(ids) => ids,
            Err(err) => {
                warn!(query, error = %err, "app search page unreadable");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for GooglePlayAdapter {
    fn source(&self) -> ReviewSource {
        ReviewSource::GooglePlay
    }

    /// Tries the regional store, then the global store, then each search candidate for
    /// `target.query`. Reviews are attributed to whichever app id produced them.
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

        let mut app_id = target.app_id.clone();
        let mut raw = self
            .fetch_reviews(http, ctx, &app_id, Some(&target.country))
            .await;
        if raw.is_empty() {
            info!(%target, "no reviews in the regional store; retrying the global store");
            raw = self.fetch_reviews(http, ctx, &app_id, None).await;
        }
        if raw.is_empty() {
            if let Some(query) = target.query.as_deref() {
                info!(%target, query, "searching for the app by name");
                for candidate in self.search_candidates(http, ctx, query, &target.country).await {
                    debug!(candidate = %candidate, "trying search candidate");
                    let mut found = self
                        .fetch_reviews(http, ctx, &candidate, Some(&target.country))
                        .await;
                    if found.is_empty() {
                        found = self.fetch_reviews(http, ctx, &candidate, None).await;
                    }
                    if !found.is_empty() {
                        app_id = candidate;
                        raw = found;
                        break;
                    }
                }
            }
        }

        let rows = reviews_to_canonical(&raw, &app_id, self.rating_policy);
        debug!(%target, app_id = %app_id, fetched = raw.len(), unique = rows.len(), "collected");
        Ok(rows)
    }
}

/// `f.req` form value for one reviews RPC call. The inner request travels as a JSON string.
pub fn reviews_request(app_id: &str, count: usize, token: Option<&str>) -> String {
    let inner = json!([
        null,
        null,
        [2, SORT_NEWEST, [count, null, token], null, []],
        [app_id, 7]
    ]);
    json!([[[REVIEWS_RPC_ID, inner.to_string(), null, "generic"]]]).to_string()
}

/// One decoded reviews RPC response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewBatch {
    pub reviews: Vec<JsonValue>,
    pub next_token: Option<String>,
}

/// Decodes a `batchexecute` response: an anti-XSSI prefix, then a frame list whose
/// `wrb.fr` frame carries the RPC result as a JSON string. The result holds the review
/// records at `[0]` and the continuation token as the last element of `[1]`.
pub fn parse_reviews_response(body: &[u8]) -> Result<ReviewBatch, AdapterError> {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_start();
    let payload = trimmed.strip_prefix(")]}'").unwrap_or(trimmed);
    let frames: JsonValue = serde_json::from_str(payload.trim()).map_err(malformed)?;

    let frame = frames
        .as_array()
        .and_then(|frames| {
            frames.iter().find(|frame| {
                frame.get(0).and_then(JsonValue::as_str) == Some("wrb.fr")
                    && frame.get(1).and_then(JsonValue::as_str) == Some(REVIEWS_RPC_ID)
            })
        })
        .ok_or_else(|| AdapterError::Message("reviews rpc frame missing".into()))?;

    let Some(result) = frame.get(2).and_then(JsonValue::as_str) else {
        return Ok(ReviewBatch::default());
    };
    let result: JsonValue = serde_json::from_str(result).map_err(malformed)?;

    Ok(ReviewBatch {
        reviews: result
            .get(0)
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default(),
        next_token: result
            .get(1)
            .and_then(JsonValue::as_array)
            .and_then(|tail| tail.last())
            .and_then(JsonValue::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string),
    })
}

fn malformed(err: serde_json::Error) -> AdapterError {
    AdapterError::Message(format!("malformed reviews response: {err}"))
}

/// App ids linked from a store search page, in page order, without repeats.
pub fn parse_search_results(html: &str, limit: usize) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = Selector::parse(r#"a[href*="/store/apps/details?id="]"#)
        .map_err(|e| AdapterError::Message(e.to_string()))?;

    let mut ids: Vec<String> = Vec::new();
    for href in document.select(&sel).filter_map(|n| n.value().attr("href")) {
        if ids.len() == limit {
            break;
        }
        let Some((_, rest)) = href.split_once("details?id=") else {
            continue;
        };
        let id = rest.split('&').next().unwrap_or_default().trim();
        if !id.is_empty() && !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

/// Maps raw review records, dropping records without an id and repeats of an id already seen
/// in this run.
pub fn reviews_to_canonical(
    raw: &[JsonValue],
    app_id: &str,
    rating_policy: RatingPolicy,
) -> Vec<CanonicalReview> {
    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(|record| {
            let review_id = text_at(record, &[0]).filter(|id| !id.is_empty())?;
            if !seen.insert(review_id.clone()) {
                return None;
            }
            Some(record_to_review(record, review_id, app_id, rating_policy))
        })
        .collect()
}

fn record_to_review(
    record: &JsonValue,
    review_id: String,
    app_id: &str,
    rating_policy: RatingPolicy,
) -> CanonicalReview {
    let author = text_at(record, &[1, 0]);
    let posted_at = timestamp_at(record, &[5]);
    let thumbs_up = at(record, &[6])
        .and_then(JsonValue::as_i64)
        .and_then(|n| i32::try_from(n).ok())
        .unwrap_or(0);

    CanonicalReview {
        source: ReviewSource::GooglePlay,
        platform_app_id: app_id.to_string(),
        author_hash: author_hash(author.as_deref()),
        rating: normalize_rating(at(record, &[2]), rating_policy),
        title: None,
        content: text_at(record, &[4]),
        posted_at,
        thumbs_up,
        data: json!({
            "reviewId": review_id,
            "userName": author,
            "userImage": at(record, &[1, 1, 3, 2]),
            "content": at(record, &[4]),
            "score": at(record, &[2]),
            "thumbsUpCount": at(record, &[6]),
            "reviewCreatedVersion": at(record, &[10]),
            "at": posted_at.map(|ts| ts.to_rfc3339()),
            "replyContent": at(record, &[7, 1]),
            "repliedAt": timestamp_at(record, &[7, 2]).map(|ts| ts.to_rfc3339()),
            "appVersion": at(record, &[10]),
        }),
        review_id,
        author_name: author,
    }
}

fn at<'a>(value: &'a JsonValue, path: &[usize]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for index in path {
        cur = cur.get(*index)?;
    }
    Some(cur).filter(|v| !v.is_null())
}

fn text_at(value: &JsonValue, path: &[usize]) -> Option<String> {
    match at(value, path)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// Timestamps are `[seconds, nanos]` pairs.
fn timestamp_at(value: &JsonValue, path: &[usize]) -> Option<DateTime<Utc>> {
    let pair = at(value, path)?;
    let secs = pair.get(0)?.as_i64()?;
    let nanos = pair
        .get(1)
        .and_then(JsonValue::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);
    DateTime::<Utc>::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, user: &str, score: i64, thumbs: i64) -> JsonValue {
        json!([
            id,
            [user, [null, 2, null, [null, null, "https://play-lh.example/avatar"]]],
            score,
            null,
            "Approved in a day",
            [1714550400, 500],
            thumbs,
            [null, "Thanks for the feedback", [1714636800, 0]],
            null,
            null,
            "3.12.0"
        ])
    }

    fn response(result: JsonValue) -> Vec<u8> {
        let frames = json!([
            ["wrb.fr", "UsvDTd", result.to_string(), null, null, null, "generic"],
            ["di", 42]
        ]);
        format!(")]}}'\n\n{frames}").into_bytes()
    }

    #[test]
    fn request_embeds_app_count_and_token_as_inner_json() {
        let decode = |raw: &str| serde_json::from_str::<JsonValue>(raw).unwrap();

        let first = decode(&reviews_request("com.tonik.mobile", 200, None));
        assert_eq!(first[0][0][0], "UsvDTd");
        let inner = decode(first[0][0][1].as_str().unwrap());
        assert_eq!(
            inner,
            json!([null, null, [2, 2, [200, null, null], null, []], ["com.tonik.mobile", 7]])
        );

        let next = decode(&reviews_request("com.tonik.mobile", 50, Some("tok")));
        let inner = decode(next[0][0][1].as_str().unwrap());
        assert_eq!(inner[2][2], json!([50, null, "tok"]));
    }

    #[test]
    fn response_yields_records_and_continuation_token() {
        let body = response(json!([[record("a", "Ana", 5, 1)], [null, "next-page"]]));
        let batch = parse_reviews_response(&body).unwrap();
        assert_eq!(batch.reviews.len(), 1);
        assert_eq!(batch.next_token.as_deref(), Some("next-page"));

        let body = response(json!([[record("a", "Ana", 5, 1)], null]));
        let last = parse_reviews_response(&body).unwrap();
        assert_eq!(last.next_token, None);
    }

    #[test]
    fn empty_result_is_an_empty_batch() {
        let frames = json!([["wrb.fr", "UsvDTd", null, null, null, null, "generic"]]);
        let body = format!(")]}}'\n{frames}");
        assert_eq!(parse_reviews_response(body.as_bytes()).unwrap(), ReviewBatch::default());

        let no_reviews = parse_reviews_response(&response(json!([null, null]))).unwrap();
        assert!(no_reviews.reviews.is_empty());
    }

    #[test]
    fn missing_frame_or_garbage_is_an_error() {
        assert!(parse_reviews_response(b")]}'\n[[\"di\",1]]").is_err());
        assert!(parse_reviews_response(b"<html>captcha</html>").is_err());
    }

    #[test]
    fn record_maps_to_canonical_review() {
        let raw = [record("gp:1", "Ana", 4, 12)];
        let rows = reviews_to_canonical(&raw, "com.tonik.mobile", RatingPolicy::default());
        let review = &rows[0];
        assert_eq!(review.source, ReviewSource::GooglePlay);
        assert_eq!(review.platform_app_id, "com.tonik.mobile");
        assert_eq!(review.review_id, "gp:1");
        assert_eq!(review.author_name.as_deref(), Some("Ana"));
        assert_eq!(review.author_hash, author_hash(Some("Ana")));
        assert_eq!(review.rating, Some(4));
        assert_eq!(review.title, None);
        assert_eq!(review.content.as_deref(), Some("Approved in a day"));
        assert_eq!(review.thumbs_up, 12);
        assert_eq!(
            review.posted_at.unwrap().to_rfc3339(),
            "2024-05-01T08:00:00.000000500+00:00"
        );
        assert_eq!(review.data["reviewId"], "gp:1");
        assert_eq!(review.data["userImage"], "https://play-lh.example/avatar");
        assert_eq!(review.data["replyContent"], "Thanks for the feedback");
        assert_eq!(review.data["appVersion"], "3.12.0");
    }

    #[test]
    fn repeated_and_idless_records_are_dropped() {
        let mut no_id = record("x", "Ben", 3, 0);
        no_id[0] = JsonValue::Null;
        let raw = vec![
            record("a", "Ana", 5, 0),
            record("b", "Ben", 2, 0),
            no_id,
            record("a", "Ana", 1, 0),
        ];
        let rows = reviews_to_canonical(&raw, "com.tonik.mobile", RatingPolicy::default());
        let ids = rows.iter().map(|r| r.review_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(rows[0].rating, Some(5));
    }

    #[test]
    fn missing_thumbs_and_timestamp_default() {
        let raw = json!(["only-id"]);
        let rows = reviews_to_canonical(&[raw], "app", RatingPolicy::default());
        assert_eq!(rows[0].thumbs_up, 0);
        assert_eq!(rows[0].posted_at, None);
        assert_eq!(rows[0].author_hash, author_hash(None));
    }

    #[test]
    fn search_results_are_unique_ordered_and_limited() {
        let html = r#"
            <a href="/store/apps/details?id=com.tonik.mobile">Tonik</a>
            <a href="/store/apps/details?id=com.tonik.mobile&hl=en">Tonik again</a>
            <a href="/store/apps/dev?id=123">Developer</a>
            <a href="https://play.google.com/store/apps/details?id=com.other.bank">Other</a>
            <a href="/store/apps/details?id=com.third.app">Third</a>
        "#;
        assert_eq!(
            parse_search_results(html, 5).unwrap(),
            vec!["com.tonik.mobile", "com.other.bank", "com.third.app"]
        );
        assert_eq!(parse_search_results(html, 1).unwrap(), vec!["com.tonik.mobile"]);
        assert!(parse_search_results("<p>no apps</p>", 5).unwrap().is_empty());
    }
}
