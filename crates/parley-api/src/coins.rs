use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use parley_types::api::{BalanceResponse, Claims};

use crate::AppState;
use crate::error::{ApiResult, blocking};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct LedgerQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn balance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let coins = blocking(move || db.balance(claims.sub)).await?;
    Ok(Json(BalanceResponse { coins }))
}

pub async fn ledger(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let offset = query.offset.unwrap_or(0);
    let db = state.db.clone();
    let rows = blocking(move || db.ledger_page(claims.sub, limit, offset)).await?;
    Ok(Json(rows.iter().map(|r| r.to_api()).collect::<Vec<_>>()))
}
