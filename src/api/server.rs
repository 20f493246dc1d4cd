use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    config::Config,
    datasource::Datasource,
    metrics,
    models::{DatasourceRequest, DatasourceResponse},
    DatasourceError, Result,
};

#[derive(Clone)]
pub struct AppState {
    pub datasource: Arc<Datasource>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(query))
        .route("/metrics", get(prometheus_metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<DatasourceRequest>,
) -> Result<Json<DatasourceResponse>> {
    debug!(
        queries = request.queries.len(),
        from = request.time_range.from_epoch_ms,
        to = request.time_range.to_epoch_ms,
        "Running query"
    );
    let response = state.datasource.query(&request).await?;
    Ok(Json(response))
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.datasource.manager().job_count().await;
    Json(json!({ "status": "ok", "jobs": jobs }))
}

/// Serves until Ctrl-C.
pub async fn serve(config: &Config, state: AppState) -> Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DatasourceError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Starting datasource server on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| DatasourceError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiClient;
    use crate::jobs::{JobManager, JobManagerConfig};
    use crate::signalflow::fake::FakeConnector;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let manager = JobManager::new(FakeConnector::new(), JobManagerConfig::default());
        let api = ApiClient::new(Duration::from_secs(5)).unwrap();
        router(AppState {
            datasource: Arc::new(Datasource::new(manager, api)),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok", "jobs": 0}));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::record_connection();
        let response = app()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("stream_connections_total"));
    }

    #[tokio::test]
    async fn test_query_without_queries_is_bad_request() {
        let body = json!({
            "datasource": {"url": "https://stream.us1.signalfx.com"},
            "timeRange": {"fromEpochMs": 0, "toEpochMs": 1000},
            "queries": []
        });
        let response = app()
            .oneshot(
                Request::post("/query")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await;
        assert!(error["error"].as_str().unwrap().contains("no queries"));
    }
}
