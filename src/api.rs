// =============================================================================
// Observability API — Axum 0.7
// =============================================================================
//
// Three read-only endpoints:
//   GET /metrics            — Prometheus text exposition
//   GET /health             — liveness + per-shard connection states
//   GET /api/v1/alerts/recent?limit=N[&symbol=S] — alert store query
//
// CORS is permissive: the surface is read-only observability data.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::alerts::AlertStore;
use crate::metrics::Metrics;

/// Shared state behind the observability router.
#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<Metrics>,
    pub store: Option<Arc<AlertStore>>,
}

/// Build the observability router.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/api/v1/alerts/recent", get(recent_alerts))
        .layer(cors)
        .with_state(state)
}

/// Serve the router until the listener fails (caller owns the task).
pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "observability API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.metrics.health())
}

#[derive(Deserialize)]
struct RecentQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    symbol: Option<String>,
}

fn default_limit() -> usize {
    50
}

async fn recent_alerts(
    State(state): State<ApiState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let store = match &state.store {
        Some(store) => store.clone(),
        None => {
            return (StatusCode::NOT_FOUND, Json(serde_json::json!({
                "error": "alert store not configured"
            })))
                .into_response();
        }
    };

    let limit = query.limit.min(500);
    let result = match &query.symbol {
        Some(symbol) => store.by_symbol(symbol, limit),
        None => store.recent(limit),
    };

    match result {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            warn!(error = %e, "alert query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::store::sample_alert;
    use crate::types::Severity;
    use tower::util::ServiceExt;

    fn state_with_store() -> ApiState {
        let store = Arc::new(AlertStore::open_in_memory().unwrap());
        store.save(&sample_alert("BTC-USDT", Severity::High)).unwrap();
        store.save(&sample_alert("ETH-USDT", Severity::Low)).unwrap();
        ApiState {
            metrics: Arc::new(Metrics::new()),
            store: Some(store),
        }
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text() {
        let state = state_with_store();
        state.metrics.inc_trades("binance", 3);
        let (status, body) = get_body(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("orca_trades_processed_total{venue=\"binance\"} 3"));
    }

    #[tokio::test]
    async fn health_reports_shards() {
        let state = state_with_store();
        state.metrics.set_shard_state("binance-spot-0", "streaming");
        let (status, body) = get_body(router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["shards"]["binance-spot-0"], "streaming");
    }

    #[tokio::test]
    async fn recent_alerts_with_symbol_filter() {
        let state = state_with_store();
        let (status, body) =
            get_body(router(state), "/api/v1/alerts/recent?symbol=BTC-USDT").await;
        assert_eq!(status, StatusCode::OK);
        let rows: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["symbol"], "BTC-USDT");
    }

    #[tokio::test]
    async fn recent_alerts_without_store_is_404() {
        let state = ApiState {
            metrics: Arc::new(Metrics::new()),
            store: None,
        };
        let (status, _) = get_body(router(state), "/api/v1/alerts/recent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
