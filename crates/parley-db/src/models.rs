//! Database row types — these map directly to SQLite rows.
//! Distinct from the parley-types API models to keep the DB layer
//! independent; each row knows how to convert itself for the API surface.

use tracing::warn;

use parley_types::api::{ConversationSummary, NotificationResponse};
use parley_types::models::{
    CoinLedgerEntry, ConnectionRequest, Conversation, ConversationStatus, LedgerReason, Message,
    RequestStatus, parse_timestamp, parse_uuid,
};
use parley_types::notifications::NotificationPayload;

#[derive(Debug)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub coins: i64,
    pub is_admin: bool,
    pub created_at: String,
}

#[derive(Debug)]
pub struct LedgerRow {
    pub id: String,
    pub user_id: String,
    pub delta: i64,
    pub reason: String,
    pub ref_table: Option<String>,
    pub ref_id: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
}

impl LedgerRow {
    pub fn to_api(&self) -> CoinLedgerEntry {
        CoinLedgerEntry {
            id: parse_uuid(&self.id),
            user_id: parse_uuid(&self.user_id),
            delta: self.delta,
            reason: LedgerReason::parse(&self.reason).unwrap_or_else(|| {
                warn!("Unknown ledger reason '{}' on entry {}", self.reason, self.id);
                LedgerReason::Other
            }),
            ref_table: self.ref_table.clone(),
            ref_id: self.ref_id.clone(),
            description: self.description.clone(),
            created_at: parse_timestamp(&self.created_at),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionRequestRow {
    pub id: String,
    pub requester_id: String,
    pub target_user_id: String,
    pub post_id: Option<String>,
    pub status: String,
    pub admin_note: Option<String>,
    pub refund_applied: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ConnectionRequestRow {
    pub fn status(&self) -> RequestStatus {
        RequestStatus::parse(&self.status).unwrap_or_else(|| {
            warn!("Unknown request status '{}' on request {}", self.status, self.id);
            RequestStatus::Pending
        })
    }

    pub fn to_api(&self) -> ConnectionRequest {
        ConnectionRequest {
            id: parse_uuid(&self.id),
            requester_id: parse_uuid(&self.requester_id),
            target_user_id: parse_uuid(&self.target_user_id),
            post_id: self.post_id.as_deref().map(parse_uuid),
            status: self.status(),
            admin_note: self.admin_note.clone(),
            refund_applied: self.refund_applied,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        }
    }
}

#[derive(Debug)]
pub struct ConversationRow {
    pub id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRow {
    pub fn status(&self) -> ConversationStatus {
        ConversationStatus::parse(&self.status).unwrap_or_else(|| {
            warn!("Unknown conversation status '{}' on {}", self.status, self.id);
            ConversationStatus::Closed
        })
    }

    pub fn to_api(&self) -> Conversation {
        Conversation {
            id: parse_uuid(&self.id),
            status: self.status(),
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        }
    }
}

#[derive(Debug)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub attachments: String,
    pub sent_at: String,
}

impl MessageRow {
    pub fn to_api(&self) -> Message {
        let attachments = serde_json::from_str(&self.attachments).unwrap_or_else(|e| {
            warn!("Corrupt attachments on message {}: {}", self.id, e);
            Vec::new()
        });
        Message {
            id: self.id,
            conversation_id: parse_uuid(&self.conversation_id),
            sender_id: parse_uuid(&self.sender_id),
            body: self.body.clone(),
            attachments,
            sent_at: parse_timestamp(&self.sent_at),
        }
    }
}

#[derive(Debug)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub payload: String,
    pub seen: bool,
    pub created_at: String,
}

impl NotificationRow {
    /// Returns `None` (and warns) when the stored payload no longer parses;
    /// listings skip such rows rather than failing the whole page.
    pub fn to_api(&self) -> Option<NotificationResponse> {
        let payload: NotificationPayload = match serde_json::from_str(&self.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!("Corrupt payload on notification {} ({}): {}", self.id, self.kind, e);
                return None;
            }
        };
        Some(NotificationResponse {
            id: parse_uuid(&self.id),
            payload,
            seen: self.seen,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

#[derive(Debug)]
pub struct ConversationSummaryRow {
    pub conversation: ConversationRow,
    pub other_user_id: String,
    pub other_username: String,
    pub last_message: Option<MessageRow>,
    pub unread_count: i64,
}

impl ConversationSummaryRow {
    pub fn to_api(&self) -> ConversationSummary {
        ConversationSummary {
            conversation: self.conversation.to_api(),
            other_user_id: parse_uuid(&self.other_user_id),
            other_username: self.other_username.clone(),
            last_message: self.last_message.as_ref().map(|m| m.to_api()),
            unread_count: self.unread_count,
        }
    }
}
