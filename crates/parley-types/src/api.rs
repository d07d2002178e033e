use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, RequestStatus};
use crate::notifications::NotificationPayload;

// -- JWT Claims --

/// JWT claims shared across parley-api (REST middleware) and parley-gateway
/// (WebSocket authentication). Canonical definition lives here in parley-types
/// to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub coins: i64,
    pub token: String,
}

// -- Connection requests --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateConnectRequest {
    pub target_user_id: Uuid,
    pub post_id: Option<Uuid>,
}

/// Body of approve/reject. Cancel takes no body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModerateConnectRequest {
    pub note: Option<String>,
}

// -- Conversations --

/// One row of `GET /conversations`: the conversation, who the other
/// participant is, and a last-message preview for list rendering.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub other_user_id: Uuid,
    pub other_username: String,
    pub last_message: Option<Message>,
    pub unread_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarkReadRequest {
    pub message_id: i64,
}

// -- Coins --

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub coins: i64,
}

// -- Blocks --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateBlockRequest {
    pub blocked_user_id: Uuid,
    pub reason: Option<String>,
}

// -- Notifications --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub id: Uuid,
    pub payload: NotificationPayload,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

// -- Admin --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ForceStatusRequest {
    pub status: RequestStatus,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdjustCoinsRequest {
    pub delta: i64,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdminBlockRequest {
    pub blocker_user_id: Uuid,
    pub blocked_user_id: Uuid,
    pub reason: Option<String>,
}
