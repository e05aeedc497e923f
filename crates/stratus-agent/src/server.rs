//! Agent HTTP surface.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/state` | Currently applied job, index and networks |
//! | POST | `/apply` | Apply a new spec (same deployment only) |

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::apply::ApplyHandler;
use crate::error::AgentError;
use crate::state::{AgentState, ApplySpec};

#[derive(serde::Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(err: &AgentError) -> axum::response::Response {
    let status = match err {
        AgentError::NotApplied => StatusCode::NOT_FOUND,
        AgentError::DeploymentMismatch { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

pub fn build_router(handler: Arc<ApplyHandler>) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/apply", post(apply))
        .with_state(handler)
}

/// GET /state
async fn get_state(State(handler): State<Arc<ApplyHandler>>) -> impl IntoResponse {
    match handler.state() {
        Ok(state) => Json(state).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /apply
async fn apply(
    State(handler): State<Arc<ApplyHandler>>,
    Json(spec): Json<ApplySpec>,
) -> impl IntoResponse {
    match handler.apply(spec) {
        Ok(applied) => Json(AgentState::from(&applied)).into_response(),
        Err(e) => error_response(&e),
    }
}
