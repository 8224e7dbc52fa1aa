//! HTTP server exposing the scrape endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::store::SharedStore;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct AppState {
    store: SharedStore,
}

fn create_router(store: SharedStore, metrics_path: &str) -> Router {
    let state = AppState { store };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.store.render();
    debug!(bytes = body.len(), "Serving scrape");

    (StatusCode::OK, [("content-type", CONTENT_TYPE)], body).into_response()
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Ready once a collection cycle has fetched at least one group.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.store.is_ready() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no successful poll yet\n",
        )
            .into_response()
    }
}

/// Scrape endpoint bound to its listening socket.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Bind `listen_addr` and prepare the routes. Port 0 picks a free port.
    pub async fn bind(
        store: SharedStore,
        listen_addr: SocketAddr,
        metrics_path: &str,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", listen_addr, e))?;

        info!(addr = %listen_addr, path = %metrics_path, "HTTP server listening");
        Ok(Self {
            listener,
            router: create_router(store, metrics_path),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, MetricKind, PollingConfig, PrometheusConfig};
    use crate::extract::{CollectedMetric, MetricData, MetricValues};
    use crate::poller::CollectionReport;
    use crate::store::MetricStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn make_store() -> SharedStore {
        Arc::new(MetricStore::new(
            PrometheusConfig::default(),
            PollingConfig::default(),
            FilterConfig::default(),
        ))
    }

    fn successful_cycle(store: &SharedStore) {
        store.record_cycle(&CollectionReport {
            metrics: vec![CollectedMetric {
                name: "keenetic_system_cpuload".to_string(),
                data: MetricData {
                    kind: MetricKind::Gauge,
                    help: "CPU load".to_string(),
                    values: MetricValues::Single(12.0),
                },
            }],
            groups_ok: 1,
            groups_failed: 0,
        });
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let store = make_store();
        successful_cycle(&store);
        let router = create_router(store, "/metrics");

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let body = body_text(response).await;
        assert!(body.contains("# HELP keenetic_system_cpuload CPU load"));
        assert!(body.contains("keenetic_system_cpuload 12\n"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = create_router(make_store(), "/metrics");

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_endpoint_not_ready() {
        let router = create_router(make_store(), "/metrics");

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ready_endpoint_ready() {
        let store = make_store();
        successful_cycle(&store);
        let router = create_router(store, "/metrics");

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let router = create_router(make_store(), "/prometheus/metrics");

        let response = router
            .clone()
            .oneshot(
                Request::get("/prometheus/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bound_server_serves_until_shutdown() {
        let store = make_store();
        successful_cycle(&store);
        let server = HttpServer::bind(store, "127.0.0.1:0".parse().unwrap(), "/metrics")
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(shutdown_rx));

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("keenetic_system_cpuload 12\n"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_reports_address_in_use() {
        let first = HttpServer::bind(make_store(), "127.0.0.1:0".parse().unwrap(), "/metrics")
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let err = HttpServer::bind(make_store(), addr, "/metrics")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to bind"));
    }
}
