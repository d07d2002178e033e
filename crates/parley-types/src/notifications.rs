use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::LedgerReason;

/// Structured notification payload, one variant per notification kind.
/// Stored as JSON alongside a `kind` column carrying the tag, so consumers
/// get exhaustive matching instead of a free-form data bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum NotificationPayload {
    ConnectionRequested {
        request_id: Uuid,
        requester_id: Uuid,
        post_id: Option<Uuid>,
    },
    ConnectionApproved {
        request_id: Uuid,
        conversation_id: Uuid,
        approved_by: Uuid,
    },
    ConnectionRejected {
        request_id: Uuid,
        rejected_by: Uuid,
        note: Option<String>,
    },
    NewMessage {
        conversation_id: Uuid,
        message_id: i64,
        sender_id: Uuid,
        preview: String,
    },
    CoinsCredited {
        amount: i64,
        reason: LedgerReason,
        new_balance: i64,
    },
}

impl NotificationPayload {
    /// The tag mirrored into the indexed `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionRequested { .. } => "CONNECTION_REQUESTED",
            Self::ConnectionApproved { .. } => "CONNECTION_APPROVED",
            Self::ConnectionRejected { .. } => "CONNECTION_REJECTED",
            Self::NewMessage { .. } => "NEW_MESSAGE",
            Self::CoinsCredited { .. } => "COINS_CREDITED",
        }
    }
}
