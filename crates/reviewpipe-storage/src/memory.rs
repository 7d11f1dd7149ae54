use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use reviewpipe_core::{CanonicalReview, ReviewSource};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{ReportStore, ReportView, ReviewSink, StoreError};

/// In-process store with the same insert-or-ignore semantics as `raw_reviews`.
///
/// Used for dry runs and tests. Insert calls are numbered from zero so a test can make a
/// specific chunk fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<CanonicalReview>,
    keys: HashSet<(ReviewSource, String)>,
    insert_calls: Vec<usize>,
    failing_calls: HashSet<usize>,
    views: HashMap<ReportView, Vec<JsonValue>>,
    failing_views: HashSet<ReportView>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_insert_call(&self, call_index: usize) {
        self.state.lock().await.failing_calls.insert(call_index);
    }

    pub async fn set_view(&self, view: ReportView, rows: Vec<JsonValue>) {
        self.state.lock().await.views.insert(view, rows);
    }

    pub async fn fail_view(&self, view: ReportView) {
        self.state.lock().await.failing_views.insert(view);
    }

    pub async fn rows(&self) -> Vec<CanonicalReview> {
        self.state.lock().await.rows.clone()
    }

    /// Row count of every insert call received, including failed ones.
    pub async fn insert_calls(&self) -> Vec<usize> {
        self.state.lock().await.insert_calls.clone()
    }
}

#[async_trait]
impl ReviewSink for MemoryStore {
    async fn insert_new(&self, rows: &[CanonicalReview]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        let call_index = state.insert_calls.len();
        state.insert_calls.push(rows.len());
        if state.failing_calls.contains(&call_index) {
            return Err(StoreError::Status {
                status: 503,
                message: format!("insert call {call_index} rejected"),
            });
        }

        let mut inserted = 0;
        for row in rows {
            if state.keys.insert((row.source, row.review_id.clone())) {
                state.rows.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn fetch_view(&self, view: ReportView) -> Result<Vec<JsonValue>, StoreError> {
        let state = self.state.lock().await;
        if state.failing_views.contains(&view) {
            return Err(StoreError::Status {
                status: 500,
                message: format!("{} unavailable", view.as_str()),
            });
        }
        Ok(state.views.get(&view).cloned().unwrap_or_default())
    }
}
