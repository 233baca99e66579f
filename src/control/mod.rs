//! Control-plane HTTP API.
//!
//! Optional bearer-token-protected endpoints for liveness and for
//! inspecting, validating, and hot-swapping the dataplane configuration:
//!
//! - `GET  /healthz`            liveness and path summary
//! - `GET  /dataplane`          current dataplane configuration
//! - `POST /dataplane/validate` parse + compile, report, don't apply
//! - `POST /dataplane/apply`    atomically swap into the running scheduler
//! - `POST /dataplane/reload`   re-read `dataplane_config_file` and apply
//!
//! Bodies are accepted as JSON or YAML; the Content-Type header is a hint,
//! with fall-through parsing when it's absent or wrong.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::SchedulerHandle;
use crate::config::Config;
use crate::dataplane::{Classifier, DataplaneConfig};
use crate::error::{Error, Result};

/// Shutdown grace period for in-flight requests.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Clone)]
struct ControlState {
    scheduler: Arc<SchedulerHandle>,
    config: Arc<Config>,
    current: Arc<RwLock<Option<DataplaneConfig>>>,
    auth_token: Option<String>,
}

/// Run the control API until cancelled.
pub async fn run(
    listen: SocketAddr,
    config: Config,
    scheduler: Arc<SchedulerHandle>,
    cancel: CancellationToken,
) -> Result<()> {
    let current = config.load_dataplane()?;
    let state = ControlState {
        scheduler,
        auth_token: config.control_api_auth_token.clone(),
        config: Arc::new(config),
        current: Arc::new(RwLock::new(current)),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/dataplane", get(get_dataplane))
        .route("/dataplane/validate", post(validate_dataplane))
        .route("/dataplane/apply", post(apply_dataplane))
        .route("/dataplane/reload", post(reload_dataplane))
        .layer(middleware::from_fn_with_state(state.clone(), check_auth))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen = %listen, "control API listening");

    let server =
        axum::serve(listener, app).with_graceful_shutdown(cancel.clone().cancelled_owned());

    // Graceful shutdown begins at cancellation; in-flight requests get a
    // bounded grace period rather than holding the process open.
    tokio::select! {
        result = server => result.map_err(Error::Io),
        () = async {
            cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        } => Ok(()),
    }
}

async fn check_auth(
    State(state): State<ControlState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(expected) = &state.auth_token {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthorized"})),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn healthz(State(state): State<ControlState>) -> impl IntoResponse {
    let paths = state.scheduler.get().map(|conn| {
        conn.path_snapshots()
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "alive": p.alive,
                    "reconnecting": p.reconnecting,
                    "fails": p.consecutive_fails,
                })
            })
            .collect::<Vec<_>>()
    });
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "paths": paths,
    }))
}

async fn get_dataplane(State(state): State<ControlState>) -> Response {
    match state.current.read().as_ref() {
        Some(dataplane) => Json(dataplane).into_response(),
        None => Json(json!({"default_class": "default"})).into_response(),
    }
}

async fn validate_dataplane(State(_state): State<ControlState>, body: Bytes) -> Response {
    match parse_body(&body) {
        Ok(dataplane) => match Classifier::compile(&dataplane) {
            Ok(classifier) => Json(json!({
                "valid": true,
                "classes": classifier.class_names(),
            }))
            .into_response(),
            Err(e) => bad_request(&e),
        },
        Err(e) => bad_request(&e),
    }
}

async fn apply_dataplane(State(state): State<ControlState>, body: Bytes) -> Response {
    match parse_body(&body) {
        Ok(dataplane) => apply(&state, dataplane),
        Err(e) => bad_request(&e),
    }
}

async fn reload_dataplane(State(state): State<ControlState>) -> Response {
    let Some(path) = &state.config.dataplane_config_file else {
        return bad_request(&Error::Config(
            "no dataplane_config_file configured".into(),
        ));
    };
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => return bad_request(&Error::Config(format!("read {}: {e}", path.display()))),
    };
    match crate::config::parse_dataplane(&content) {
        Ok(dataplane) => apply(&state, dataplane),
        Err(e) => bad_request(&e),
    }
}

/// Compile and atomically swap the classifier into the running scheduler.
fn apply(state: &ControlState, dataplane: DataplaneConfig) -> Response {
    let classifier = match Classifier::compile(&dataplane) {
        Ok(classifier) => classifier,
        Err(e) => return bad_request(&e),
    };
    let classes = classifier.class_names();

    match state.scheduler.get() {
        Some(conn) => conn.set_classifier(Arc::new(classifier)),
        None => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"error": "scheduler not running"})),
            )
                .into_response();
        }
    }
    *state.current.write() = Some(dataplane);
    info!(classes = ?classes, "dataplane applied");
    Json(json!({"applied": true, "classes": classes})).into_response()
}

/// JSON first, YAML as the fall-through; YAML is a superset, so plain JSON
/// bodies parse either way.
fn parse_body(body: &[u8]) -> Result<DataplaneConfig> {
    if let Ok(dataplane) = serde_json::from_slice::<DataplaneConfig>(body) {
        return Ok(dataplane);
    }
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::Config("body is not UTF-8".into()))?;
    crate::config::parse_dataplane(text)
}

fn bad_request(err: &Error) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_parses_json_and_yaml() {
        let json = br#"{"default_class": "bulk", "classes": {"bulk": {}}}"#;
        assert_eq!(parse_body(json).unwrap().default_class, "bulk");

        let yaml = b"default_class: bulk\nclasses:\n  bulk: {}\n";
        assert_eq!(parse_body(yaml).unwrap().default_class, "bulk");

        assert!(parse_body(b"\xff\xfe").is_err());
    }
}
