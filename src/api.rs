//! ==============================================================================
//! api.rs - local status and command api
//! ==============================================================================
//!
//! endpoints:
//!     GET   /api/state          reported state, config, counters, last reading
//!     PATCH /api/desired        desired-state payload, same rules as the cloud
//!     POST  /api/methods/:name  direct method, http status mirrors the result
//!
//! every write goes through the Dispatcher, so a local change is persisted and
//! reported exactly like one coming from the cloud.
//!
//! ==============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::agent::Shutdown;
use crate::dispatch::{DesiredOutcome, Dispatcher};
use crate::domain::{Config, Reading, ReportedState};
use crate::ledger::LedgerSnapshot;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub latest: watch::Receiver<Option<Reading>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub reported: ReportedState,
    pub config: Config,
    pub counters: LedgerSnapshot,
    pub update_running: bool,
    pub latest: Option<Reading>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/desired", patch(desired_handler))
        .route("/api/methods/:name", post(method_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn serve(bind: &str, state: ApiState, shutdown: Shutdown) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot bind api to {}", bind))?;
    tracing::info!("api listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.wait().await;
        })
        .await?;
    Ok(())
}

async fn state_handler(State(state): State<ApiState>) -> Json<StatusResponse> {
    let d = &state.dispatcher;
    Json(StatusResponse {
        reported: d.reported_state(),
        config: d.config(),
        counters: d.ledger().snapshot(),
        update_running: d.update_running(),
        latest: *state.latest.borrow(),
    })
}

async fn desired_handler(
    State(state): State<ApiState>,
    Json(payload): Json<Value>,
) -> Result<Json<DesiredOutcome>, (StatusCode, String)> {
    if !payload.is_object() {
        return Err((StatusCode::BAD_REQUEST, "desired state must be a json object".into()));
    }
    Ok(Json(state.dispatcher.apply_desired(&payload, false).await))
}

async fn method_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: String,
) -> Response {
    let response = state.dispatcher.invoke_method(&name, &body);
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], response.body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::LogDisplay;
    use crate::ledger::Ledger;
    use crate::platform::{PlatformInfo, Updater};
    use crate::store::tests::sample_store;
    use crate::transport;
    use serde_json::json;

    async fn spawn_api() -> (String, Arc<transport::LoopbackTransport>, Shutdown) {
        let (store, _) = sample_store();
        let (loopback, events) = transport::loopback();
        let shutdown = Shutdown::new();
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            loopback.clone(),
            Arc::new(LogDisplay),
            Updater::new(vec![]),
            Arc::new(Ledger::new()),
            PlatformInfo {
                runtime_version: "pisensor-agent 0.1.0".into(),
                platform_version: "test".into(),
            },
            shutdown.clone(),
            false,
        ));
        tokio::spawn(Arc::clone(&dispatcher).run(events));

        let (_tx, latest) = watch::channel(None);
        let state = ApiState { dispatcher, latest };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router(state))
                .with_graceful_shutdown(async move {
                    stop.wait().await;
                })
                .await
                .unwrap();
        });
        (format!("http://{}", addr), loopback, shutdown)
    }

    #[tokio::test]
    async fn state_endpoint_reports_config() {
        let (base, _, shutdown) = spawn_api().await;
        let body: Value = reqwest::get(format!("{}/api/state", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["reported"]["sendInterval"], 60);
        assert_eq!(body["reported"]["pythonVersion"], "pisensor-agent 0.1.0");
        assert_eq!(body["config"]["temp_alert_threshold"], 30.0);
        assert_eq!(body["counters"]["sent"], 0);
        assert!(body["latest"].is_null());
        shutdown.trigger(crate::agent::StopReason::Interrupted);
    }

    #[tokio::test]
    async fn desired_patch_applies_and_reports() {
        let (base, loopback, shutdown) = spawn_api().await;
        let client = reqwest::Client::new();
        let outcome: Value = client
            .patch(format!("{}/api/desired", base))
            .json(&json!({"tempAlert": 25}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(outcome["changed"], json!(["tempAlert"]));
        assert_eq!(outcome["reported"], true);
        assert_eq!(loopback.reports()[0].temp_alert, 25.0);

        let bad = client
            .patch(format!("{}/api/desired", base))
            .json(&json!([1, 2]))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
        shutdown.trigger(crate::agent::StopReason::Interrupted);
    }

    #[tokio::test]
    async fn methods_mirror_status() {
        let (base, _, shutdown) = spawn_api().await;
        let client = reqwest::Client::new();

        let ok = client
            .post(format!("{}/api/methods/displayMessage", base))
            .body("\"hello\"")
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::OK);
        assert_eq!(ok.text().await.unwrap(), r#"{"methodName":"displayMessage"}"#);

        let missing = client
            .post(format!("{}/api/methods/unknown_cmd", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        shutdown.trigger(crate::agent::StopReason::Interrupted);
    }
}
