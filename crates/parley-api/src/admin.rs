//! Privileged moderation surface. Every handler requires the `admin` claim;
//! these paths bypass the normal actor checks on purpose, so each action is
//! logged with the acting admin.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use parley_db::StoreError;
use parley_types::api::{AdjustCoinsRequest, AdminBlockRequest, Claims, ForceStatusRequest};
use parley_types::models::LedgerReason;

use crate::AppState;
use crate::error::{ApiResult, blocking};

fn require_admin(claims: &Claims) -> Result<(), StoreError> {
    if claims.admin {
        Ok(())
    } else {
        Err(StoreError::Authorization("admin only"))
    }
}

pub async fn force_request_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<ForceStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&claims)?;

    let db = state.db.clone();
    let row =
        blocking(move || db.force_request_status(id, req.status, req.note.as_deref())).await?;

    info!(
        "Admin {} ({}) forced request {} to {}",
        claims.username, claims.sub, row.id, row.status
    );
    Ok(Json(row.to_api()))
}

pub async fn adjust_coins(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AdjustCoinsRequest>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&claims)?;

    if req.delta == 0 {
        return Err(StoreError::Validation("delta must be non-zero".into()).into());
    }

    let db = state.db.clone();
    let description = req.description.clone();
    let balance = blocking(move || {
        if req.delta > 0 {
            db.credit(
                user_id,
                req.delta,
                LedgerReason::Adjust,
                "users",
                Some(&user_id.to_string()),
                description.as_deref(),
            )
        } else {
            db.debit(
                user_id,
                -req.delta,
                LedgerReason::Adjust,
                "users",
                Some(&user_id.to_string()),
                description.as_deref(),
            )
        }
    })
    .await?;

    info!(
        "Admin {} ({}) adjusted coins of {} by {} (balance now {})",
        claims.username, claims.sub, user_id, req.delta, balance
    );
    Ok(Json(serde_json::json!({ "coins": balance })))
}

pub async fn create_block(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AdminBlockRequest>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&claims)?;

    let db = state.db.clone();
    blocking(move || {
        db.create_block(
            req.blocker_user_id,
            req.blocked_user_id,
            req.reason.as_deref(),
        )
    })
    .await?;

    info!(
        "Admin {} ({}) created block {} -> {}",
        claims.username, claims.sub, req.blocker_user_id, req.blocked_user_id
    );
    Ok(StatusCode::NO_CONTENT)
}
