use std::time::Duration;

use async_trait::async_trait;
use reviewpipe_core::CanonicalReview;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{ReportStore, ReportView, ReviewSink, StoreCredentials, StoreError, RAW_REVIEWS_TABLE};

/// Store reached through a PostgREST (Supabase-style) HTTP endpoint.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: reqwest::Client,
    base_url: String,
    service_role_key: String,
}

impl PostgrestStore {
    pub fn new(credentials: &StoreCredentials, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: credentials.project_url.trim().trim_end_matches('/').to_string(),
            service_role_key: credentials.service_role_key.clone(),
        })
    }

    fn rest_url(&self, relation: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, relation)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }
}

async fn status_error(resp: reqwest::Response) -> StoreError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<JsonValue>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(ToString::to_string))
        .unwrap_or(text);
    StoreError::Status { status, message }
}

#[async_trait]
impl ReviewSink for PostgrestStore {
    async fn insert_new(&self, rows: &[CanonicalReview]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // ignore-duplicates maps to ON CONFLICT DO NOTHING; the representation only holds
        // rows that were actually inserted.
        let resp = self
            .authorized(self.client.post(self.rest_url(RAW_REVIEWS_TABLE)))
            .query(&[("on_conflict", "source,review_id"), ("select", "review_id")])
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(rows)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let inserted: Vec<JsonValue> = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("insert response: {e}")))?;
        debug!(sent = rows.len(), inserted = inserted.len(), "postgrest upsert");
        Ok(inserted.len() as u64)
    }
}

#[async_trait]
impl ReportStore for PostgrestStore {
    async fn fetch_view(&self, view: ReportView) -> Result<Vec<JsonValue>, StoreError> {
        let resp = self
            .authorized(self.client.get(self.rest_url(view.as_str())))
            .query(&[("select", "*")])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        resp.json()
            .await
            .map_err(|e| StoreError::Decode(format!("{} rows: {e}", view.as_str())))
    }
}
