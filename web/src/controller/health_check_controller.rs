use crate::controller::ApiResponse;
use crate::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use service::AppState;

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    connections: usize,
    identities: usize,
    broker_sessions: usize,
}

/// GET the bridge's liveness and current load.
///
/// Answers 503 once shutdown has begun so load balancers stop routing here.
pub async fn health_check(State(app_state): State<AppState>) -> Result<impl IntoResponse> {
    let manager = &app_state.manager;
    manager.ensure_accepting()?;

    let report = HealthReport {
        status: "ok",
        connections: manager.registry().connection_count(),
        identities: manager.registry().identity_count(),
        broker_sessions: manager.pool().session_count(),
    };

    Ok((
        StatusCode::OK,
        Json(ApiResponse::new(StatusCode::OK.into(), report)),
    ))
}
