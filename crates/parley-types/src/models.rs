use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a connection request. PENDING is the only non-terminal state;
/// once a request reaches a terminal state it never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Why a ledger entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerReason {
    Topup,
    Post,
    Connect,
    Adjust,
    Refund,
    Other,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topup => "TOPUP",
            Self::Post => "POST",
            Self::Connect => "CONNECT",
            Self::Adjust => "ADJUST",
            Self::Refund => "REFUND",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TOPUP" => Some(Self::Topup),
            "POST" => Some(Self::Post),
            "CONNECT" => Some(Self::Connect),
            "ADJUST" => Some(Self::Adjust),
            "REFUND" => Some(Self::Refund),
            "OTHER" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Active,
    Blocked,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Blocked => "BLOCKED",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "BLOCKED" => Some(Self::Blocked),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub target_user_id: Uuid,
    pub post_id: Option<Uuid>,
    pub status: RequestStatus,
    pub admin_note: Option<String>,
    pub refund_applied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Message ids are assigned by the store and are strictly increasing within a
/// conversation; fetch order and delivery order both follow the id order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub attachments: Vec<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub delta: i64,
    pub reason: LedgerReason,
    pub ref_table: Option<String>,
    pub ref_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS" without timezone; newer
/// rows may carry RFC 3339. Parse both, warn and fall back on anything else.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

/// Parse a stored uuid, warning on corruption instead of failing the request.
pub fn parse_uuid(raw: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        tracing::warn!("Corrupt uuid '{}': {}", raw, e);
        Uuid::default()
    })
}
