//! Axum + Askama surface: on-demand collection plus JSON and HTML review reports.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use reviewpipe_storage::{ReportStore, ReportView, StoreBackend, StoreError};
use reviewpipe_sync::{CollectPipeline, ConfigError, PipelineConfig, TargetRegistry};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "reviewpipe-web";
pub const DEFAULT_WEB_PORT: u16 = 8000;

/// Shared handler state. Both handles are absent when the store secrets are missing.
#[derive(Clone, Default)]
pub struct AppState {
    pipeline: Option<Arc<CollectPipeline>>,
    reports: Option<Arc<dyn ReportStore>>,
}

impl AppState {
    pub fn new(pipeline: Arc<CollectPipeline>, reports: Arc<dyn ReportStore>) -> Self {
        Self {
            pipeline: Some(pipeline),
            reports: Some(reports),
        }
    }

    pub fn unconfigured() -> Self {
        Self::default()
    }

    pub async fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let credentials = match config.credentials() {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(error = %err, "store secrets missing; endpoints will answer with an error");
                return Ok(Self::unconfigured());
            }
        };
        let registry = TargetRegistry::load(&config.targets_path).await?;
        let backend = StoreBackend::connect(&credentials, config.http_timeout())?;
        let pipeline = CollectPipeline::from_config(config, &registry, backend.clone())?;
        Ok(Self::new(Arc::new(pipeline), backend))
    }
}

/// Body of `/report_api`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportPayload {
    pub kpis: Option<JsonValue>,
    pub aspects: Vec<JsonValue>,
    pub quotes: Vec<JsonValue>,
}

/// Reads the three report views concurrently. The first failing view, in view order, wins.
pub async fn load_report(store: &dyn ReportStore) -> Result<ReportPayload, StoreError> {
    let (kpis, aspects, quotes) = tokio::join!(
        store.fetch_view(ReportView::Kpis),
        store.fetch_view(ReportView::AspectSentiment),
        store.fetch_view(ReportView::AspectQuotes),
    );
    Ok(ReportPayload {
        kpis: kpis?.into_iter().next(),
        aspects: aspects?,
        quotes: quotes?,
    })
}

#[derive(Debug, Clone, PartialEq)]
struct KpiLine {
    total_with_stance: String,
    liked: String,
    disliked: String,
}

impl KpiLine {
    fn zero() -> Self {
        Self {
            total_with_stance: "0".into(),
            liked: "0".into(),
            disliked: "0".into(),
        }
    }

    fn from_row(row: &JsonValue) -> Self {
        Self {
            total_with_stance: cell_text(row.get("total_with_stance"), "0"),
            liked: cell_text(row.get("liked"), "0"),
            disliked: cell_text(row.get("disliked"), "0"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AspectRow {
    aspect: String,
    liked_count: String,
    disliked_count: String,
}

impl AspectRow {
    fn from_row(row: &JsonValue) -> Self {
        Self {
            aspect: cell_text(row.get("aspect"), ""),
            liked_count: cell_text(row.get("liked_count"), ""),
            disliked_count: cell_text(row.get("disliked_count"), ""),
        }
    }
}

fn cell_text(value: Option<&JsonValue>, missing: &str) -> String {
    match value {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Null) | None => missing.to_string(),
        Some(other) => other.to_string(),
    }
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate {
    kpis: KpiLine,
    aspects: Vec<AspectRow>,
}

#[derive(Template)]
#[template(path = "report_error.html")]
struct ReportErrorTemplate {
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/collect_reviews",
            get(collect_reviews_handler).post(collect_reviews_handler),
        )
        .route("/report_api", get(report_api_handler).post(report_api_handler))
        .route("/report_web", get(report_web_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving collect and report endpoints");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn collect_reviews_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = state.pipeline.as_ref() else {
        return missing_secrets_json();
    };
    let run = pipeline.run_once().await;
    Json(run.summary()).into_response()
}

async fn report_api_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(reports) = state.reports.as_deref() else {
        return missing_secrets_json();
    };
    match load_report(reports).await {
        Ok(payload) => Json(payload).into_response(),
        Err(err) => {
            warn!(error = %err, "report query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

// Query failures degrade to an empty report rather than an error page.
async fn report_web_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(reports) = state.reports.as_deref() else {
        return render_html(ReportErrorTemplate {
            message: ConfigError::MissingSecrets.to_string(),
        });
    };

    let (kpis, aspects) = tokio::join!(
        reports.fetch_view(ReportView::Kpis),
        reports.fetch_view(ReportView::AspectSentiment),
    );
    let kpis = match kpis {
        Ok(rows) if rows.len() == 1 => KpiLine::from_row(&rows[0]),
        Ok(rows) => {
            warn!(rows = rows.len(), "expected exactly one kpi row; showing zeros");
            KpiLine::zero()
        }
        Err(err) => {
            warn!(error = %err, "kpi view unavailable; showing zeros");
            KpiLine::zero()
        }
    };
    let aspects = match aspects {
        Ok(rows) => rows.iter().map(AspectRow::from_row).collect(),
        Err(err) => {
            warn!(error = %err, "aspect view unavailable; showing an empty table");
            Vec::new()
        }
    };

    render_html(ReportTemplate { kpis, aspects })
}

fn missing_secrets_json() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": ConfigError::MissingSecrets.to_string() })),
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use reviewpipe_storage::MemoryStore;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn send(router: Router, method: &str, uri: &str) -> (StatusCode, String) {
        let resp = router
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn state_with(store: Arc<MemoryStore>, config: &PipelineConfig) -> AppState {
        let pipeline =
            CollectPipeline::from_config(config, &TargetRegistry::default(), store.clone())
                .unwrap();
        AppState::new(Arc::new(pipeline), store)
    }

    fn offline_state(store: Arc<MemoryStore>) -> AppState {
        state_with(store, &PipelineConfig::from_lookup(|_| None))
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .set_view(
                ReportView::Kpis,
                vec![json!({"total_with_stance": 12, "liked": 8, "disliked": 4})],
            )
            .await;
        store
            .set_view(
                ReportView::AspectSentiment,
                vec![
                    json!({"aspect": "fees", "liked_count": 1, "disliked_count": 3}),
                    json!({
                        "aspect": "<script>alert(1)</script>",
                        "liked_count": 0,
                        "disliked_count": 1
                    }),
                ],
            )
            .await;
        store
            .set_view(
                ReportView::AspectQuotes,
                vec![json!({"aspect": "fees", "quote": "Hidden fees on the secured loan."})],
            )
            .await;
        store
    }

    #[tokio::test]
    async fn missing_secrets_short_circuit_every_endpoint() {
        let router = app(AppState::unconfigured());
        for (verb, uri) in [
            ("GET", "/collect_reviews"),
            ("POST", "/collect_reviews"),
            ("POST", "/report_api"),
        ] {
            let (status, body) = send(router.clone(), verb, uri).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            let body: JsonValue = serde_json::from_str(&body).unwrap();
            assert_eq!(body, json!({"error": "Missing PROJECT_URL or SERVICE_ROLE_KEY"}));
        }

        let (status, body) = send(router, "GET", "/report_web").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(
            r#"<p style="color:#b00">Missing PROJECT_URL or SERVICE_ROLE_KEY</p>"#
        ));
    }

    #[tokio::test]
    async fn from_config_without_secrets_is_unconfigured() {
        let state = AppState::from_config(&PipelineConfig::from_lookup(|_| None))
            .await
            .unwrap();
        assert!(state.pipeline.is_none());
        assert!(state.reports.is_none());
    }

    #[tokio::test]
    async fn report_api_returns_first_kpi_row_and_all_views() {
        let router = app(offline_state(seeded_store().await));
        let (status, body) = send(router, "GET", "/report_api").await;
        assert_eq!(status, StatusCode::OK);
        let body: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(body["kpis"]["total_with_stance"], 12);
        assert_eq!(body["aspects"].as_array().unwrap().len(), 2);
        assert_eq!(body["quotes"][0]["aspect"], "fees");
    }

    #[tokio::test]
    async fn report_api_kpis_are_null_when_view_is_empty() {
        let router = app(offline_state(Arc::new(MemoryStore::new())));
        let (status, body) = send(router, "POST", "/report_api").await;
        assert_eq!(status, StatusCode::OK);
        let body: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(body, json!({"kpis": null, "aspects": [], "quotes": []}));
    }

    #[tokio::test]
    async fn report_api_query_failure_is_a_500() {
        let store = seeded_store().await;
        store.fail_view(ReportView::AspectQuotes).await;
        let resp = app(offline_state(store))
            .oneshot(Request::builder().uri("/report_api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body: JsonValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("v_aspect_quotes"));
    }

    #[tokio::test]
    async fn report_web_renders_kpis_and_escaped_aspects() {
        let router = app(offline_state(seeded_store().await));
        let (status, body) = send(router, "GET", "/report_web").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<h1>Credit Builder Feedback</h1>"));
        assert!(body.contains("Total with stance: <strong>12</strong>"));
        assert!(body.contains("Liked: <strong>8</strong>"));
        assert!(body.contains("<tr><td>fees</td><td>1</td><td>3</td></tr>"));
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>alert"));
        assert!(body.contains("API: <code>/report_api</code>"));
    }

    #[tokio::test]
    async fn report_web_degrades_when_views_fail() {
        let store = seeded_store().await;
        store.fail_view(ReportView::Kpis).await;
        store.fail_view(ReportView::AspectSentiment).await;
        let (status, body) = send(app(offline_state(store)), "GET", "/report_web").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Total with stance: <strong>0</strong>"));
        assert!(!body.contains("<td>"));
    }

    #[tokio::test]
    async fn collect_endpoint_reports_fetched_and_inserted_counts() {
        let server = MockServer::start().await;
        let fixture = std::fs::read(
            Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("../../fixtures/app-store/sample/page1.json"),
        )
        .unwrap();
        Mock::given(method("GET"))
            .and(path("/ph/rss/customerreviews/page=1/id=1541576007/sortby=mostrecent/json"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ph/rss/customerreviews/page=2/id=1541576007/sortby=mostrecent/json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let base_url = server.uri();
        let config = PipelineConfig::from_lookup(|key| match key {
            "REVIEWPIPE_FEED_BASE_URL" => Some(base_url.clone()),
            _ => None,
        });
        let store = Arc::new(MemoryStore::new());
        let router = app(state_with(store.clone(), &config));

        let (status, body) = send(router.clone(), "POST", "/collect_reviews").await;
        assert_eq!(status, StatusCode::OK);
        let body: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(body, json!({"ok": true, "inserted": 3, "sources": {"app_store": 3}}));

        let (_, body) = send(router, "GET", "/collect_reviews").await;
        let body: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(body, json!({"ok": true, "inserted": 0, "sources": {"app_store": 3}}));
        assert_eq!(store.rows().await.len(), 3);
    }

    #[tokio::test]
    async fn failing_feed_still_answers_ok() {
        let config = PipelineConfig::from_lookup(|key| match key {
            "REVIEWPIPE_FEED_BASE_URL" => Some("http://127.0.0.1:9".into()),
            _ => None,
        });
        let store = Arc::new(MemoryStore::new());
        let router = app(state_with(store.clone(), &config));
        let (status, body) = send(router, "GET", "/collect_reviews").await;
        assert_eq!(status, StatusCode::OK);
        let body: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(body, json!({"ok": true, "inserted": 0, "sources": {"app_store": 0}}));
        assert!(store.insert_calls().await.is_empty());
    }
}
