use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use parley_db::StoreError;
use parley_types::api::{Claims, CreateConnectRequest, ModerateConnectRequest};

use crate::AppState;
use crate::error::{ApiResult, blocking};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestBox {
    #[default]
    Incoming,
    Outgoing,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// `incoming` (default): requests addressed to me. `outgoing`: mine.
    #[serde(rename = "box", default)]
    pub mailbox: RequestBox,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConnectRequest>,
) -> ApiResult<impl IntoResponse> {
    let cost = state.coins.connect_cost;
    let db = state.db.clone();
    let row = blocking(move || {
        db.create_connection_request(claims.sub, req.target_user_id, req.post_id, cost)
    })
    .await?;

    info!(
        "{} ({}) requested connection {} -> {}",
        claims.username, claims.sub, row.id, row.target_user_id
    );
    Ok((StatusCode::CREATED, Json(row.to_api())))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let incoming = matches!(query.mailbox, RequestBox::Incoming);
    let db = state.db.clone();
    let rows = blocking(move || db.list_connection_requests(claims.sub, incoming)).await?;
    Ok(Json(
        rows.iter().map(|r| r.to_api()).collect::<Vec<_>>(),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let row = blocking(move || db.get_connection_request(id)).await?;
    let request = row.to_api();
    if request.requester_id != claims.sub && request.target_user_id != claims.sub && !claims.admin {
        return Err(StoreError::Authorization("not a party to this request").into());
    }
    Ok(Json(request))
}

pub async fn approve(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    body: Option<Json<ModerateConnectRequest>>,
) -> ApiResult<impl IntoResponse> {
    let note = body.and_then(|Json(b)| b.note);
    let db = state.db.clone();
    let (request, conversation) =
        blocking(move || db.approve_connection_request(id, claims.sub, note.as_deref())).await?;

    info!(
        "{} ({}) approved connection request {}, conversation {}",
        claims.username, claims.sub, request.id, conversation.id
    );
    Ok(Json(json!({
        "request": request.to_api(),
        "conversation": conversation.to_api(),
    })))
}

pub async fn reject(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    body: Option<Json<ModerateConnectRequest>>,
) -> ApiResult<impl IntoResponse> {
    let note = body.and_then(|Json(b)| b.note);
    let refund = state.coins.refund_on_reject;
    let db = state.db.clone();
    let request =
        blocking(move || db.reject_connection_request(id, claims.sub, note.as_deref(), refund))
            .await?;

    info!(
        "{} ({}) rejected connection request {}",
        claims.username, claims.sub, request.id
    );
    Ok(Json(request.to_api()))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let request = blocking(move || db.cancel_connection_request(id, claims.sub)).await?;

    info!(
        "{} ({}) cancelled connection request {}",
        claims.username, claims.sub, request.id
    );
    Ok(Json(request.to_api()))
}
