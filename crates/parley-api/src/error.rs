use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use parley_db::StoreError;

/// REST-facing error wrapper: maps the store taxonomy onto HTTP statuses and
/// a `{ "error": ... }` body. Internal failures are logged server-side and
/// surfaced as an opaque 500.
pub enum ApiError {
    Store(StoreError),
    /// Bad credentials. Deliberately carries no detail.
    Unauthorized,
    Internal,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl ApiError {
    pub fn join(e: tokio::task::JoinError) -> Self {
        error!("spawn_blocking join error: {}", e);
        Self::Internal
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Store(e) => {
                let status = match e {
                    StoreError::Validation(_) => StatusCode::BAD_REQUEST,
                    StoreError::Authorization(detail) => {
                        warn!("Authorization denied: {}", detail);
                        StatusCode::FORBIDDEN
                    }
                    StoreError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
                    StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    StoreError::Conflict(_) => StatusCode::CONFLICT,
                    StoreError::Lock | StoreError::Json(_) | StoreError::Db(_) => {
                        error!("Store error: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "internal error".to_string()
                } else {
                    e.to_string()
                };
                (status, message)
            }
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid credentials".to_string()),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Run a blocking store call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::join)?
        .map_err(ApiError::from)
}
