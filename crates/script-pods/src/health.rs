//! Liveness, readiness and a JSON view of tracked pods.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use crate::error::Result;
use crate::pods::{PodMonitor, PodStatus};

#[derive(Clone)]
struct HealthState {
    monitor: Arc<PodMonitor>,
}

pub fn router(monitor: Arc<PodMonitor>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/pods", get(list_pods))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .with_state(HealthState { monitor })
}

/// Serve the health endpoints on `port` until `cancel` fires.
pub async fn serve(monitor: Arc<PodMonitor>, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health server listening");

    axum::serve(listener, router(monitor))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn readiness_check(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.monitor.is_initial_load_complete() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "loading script pods")
    }
}

async fn list_pods(State(state): State<HealthState>) -> Json<Vec<PodStatus>> {
    Json(state.monitor.get_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::logs::ScriptLogProvider;
    use crate::pods::PodWatchEvent;
    use crate::testing::{pod_created_at, script_pod, FakePodService};
    use crate::ticket::ScriptTicket;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn monitor(fake: Arc<FakePodService>) -> Arc<PodMonitor> {
        let clock = Arc::new(FixedClock::new(pod_created_at()));
        Arc::new(PodMonitor::new(
            fake,
            Arc::new(ScriptLogProvider::new(clock.clone())),
            clock,
        ))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let app = router(monitor(Arc::new(FakePodService::default())));
        let (status, body) = get(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn ready_only_after_initial_load() {
        let monitor = monitor(Arc::new(FakePodService::default()));

        let (status, _) = get(router(monitor.clone()), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            async move { monitor.run(cancel).await }
        });
        monitor
            .wait_for_initial_load(Duration::from_secs(5))
            .await
            .unwrap();

        let (status, _) = get(router(monitor), "/ready").await;
        assert_eq!(status, StatusCode::OK);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pods_lists_tracked_statuses() {
        let monitor = monitor(Arc::new(FakePodService::default()));
        let ticket = ScriptTicket::new("listed");
        monitor.apply(PodWatchEvent::Added(script_pod(&ticket, "Running", None)));

        let (status, body) = get(router(monitor), "/pods").await;
        assert_eq!(status, StatusCode::OK);

        let pods: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(pods.as_array().unwrap().len(), 1);
        assert_eq!(pods[0]["state"], "Running");
    }
}
