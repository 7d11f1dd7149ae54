use async_trait::async_trait;
use reviewpipe_core::CanonicalReview;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::{ReportStore, ReportView, ReviewSink, StoreError, RAW_REVIEWS_TABLE};

/// Direct Postgres connection to the same schema PostgREST would expose.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(4).connect_lazy(database_url)?;
        Ok(Self { pool })
    }
}

fn insert_statement(rows: &[CanonicalReview]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {RAW_REVIEWS_TABLE} \
         (source, platform_app_id, review_id, author_name, author_hash, rating, title, \
         content, posted_at, thumbs_up, data) "
    ));
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.source.as_str())
            .push_bind(&row.platform_app_id)
            .push_bind(&row.review_id)
            .push_bind(&row.author_name)
            .push_bind(&row.author_hash)
            .push_bind(row.rating)
            .push_bind(&row.title)
            .push_bind(&row.content)
            .push_bind(row.posted_at)
            .push_bind(row.thumbs_up)
            .push_bind(Json(&row.data));
    });
    qb.push(" ON CONFLICT (source, review_id) DO NOTHING");
    qb
}

#[async_trait]
impl ReviewSink for PgStore {
    async fn insert_new(&self, rows: &[CanonicalReview]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let result = insert_statement(rows).build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReportStore for PgStore {
    async fn fetch_view(&self, view: ReportView) -> Result<Vec<JsonValue>, StoreError> {
        let sql = format!("SELECT to_jsonb(v) AS row FROM {} v", view.as_str());
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get::<JsonValue, _>("row")?);
        }
        Ok(out)
    }
}
