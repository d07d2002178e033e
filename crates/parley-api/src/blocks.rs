use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use parley_types::api::{Claims, CreateBlockRequest};

use crate::AppState;
use crate::error::{ApiResult, blocking};

pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateBlockRequest>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    blocking(move || db.create_block(claims.sub, req.blocked_user_id, req.reason.as_deref()))
        .await?;

    info!(
        "{} ({}) blocked {}",
        claims.username, claims.sub, req.blocked_user_id
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(blocked_user_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    blocking(move || db.remove_block(claims.sub, blocked_user_id)).await?;

    info!(
        "{} ({}) unblocked {}",
        claims.username, claims.sub, blocked_user_id
    );
    Ok(StatusCode::NO_CONTENT)
}
