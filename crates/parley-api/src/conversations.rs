use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use parley_types::api::{Claims, MarkReadRequest};

use crate::AppState;
use crate::error::{ApiResult, blocking};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    /// Exclusive upper bound on message id, for paging backwards.
    pub before: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let rows = blocking(move || db.list_conversations(claims.sub)).await?;
    Ok(Json(rows.iter().map(|r| r.to_api()).collect::<Vec<_>>()))
}

pub async fn messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let db = state.db.clone();
    let rows =
        blocking(move || db.messages_page(conversation_id, claims.sub, limit, query.before))
            .await?;
    Ok(Json(rows.iter().map(|r| r.to_api()).collect::<Vec<_>>()))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    blocking(move || db.mark_read(conversation_id, claims.sub, req.message_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((conversation_id, message_id)): Path<(Uuid, i64)>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    blocking(move || db.delete_message(conversation_id, message_id, claims.sub)).await?;
    Ok(StatusCode::NO_CONTENT)
}
