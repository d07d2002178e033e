use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use parley_types::api::Claims;

use crate::AppState;
use crate::error::{ApiResult, blocking};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsQuery {
    #[serde(default)]
    pub unseen_only: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<NotificationsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let offset = query.offset.unwrap_or(0);
    let db = state.db.clone();
    let rows =
        blocking(move || db.notifications_page(claims.sub, query.unseen_only, limit, offset))
            .await?;
    // Rows with corrupt payloads are logged and skipped rather than failing
    // the whole page.
    Ok(Json(
        rows.iter().filter_map(|r| r.to_api()).collect::<Vec<_>>(),
    ))
}

pub async fn mark_seen(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    blocking(move || db.mark_notification_seen(claims.sub, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_seen(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let updated = blocking(move || db.mark_all_notifications_seen(claims.sub)).await?;
    Ok(Json(json!({ "updated": updated })))
}
