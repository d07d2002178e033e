//! Conversation manager. A one-to-one conversation is created exactly once
//! per user pair: creation only ever happens inside the approving
//! transaction, and the pair lookup plus the UNIQUE(conversation_id, user_id)
//! constraint keep concurrent approvals from doubling it.

use rusqlite::{OptionalExtension, Transaction, params};
use uuid::Uuid;

use crate::models::{ConversationRow, ConversationSummaryRow, MessageRow};
use crate::{Database, Result, StoreError};

impl Database {
    pub fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.transaction(|tx| is_participant_tx(tx, conversation_id, user_id))
    }

    pub fn list_participants(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        self.transaction(|tx| list_participants_tx(tx, conversation_id))
    }

    pub fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<ConversationRow>> {
        self.transaction(|tx| conversation_by_id_tx(tx, conversation_id))
    }

    /// Conversations the user participates in, newest activity first, with
    /// the other participant and a last-message preview.
    pub fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummaryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.status, c.created_at, c.updated_at,
                        other.user_id, u.username,
                        m.id, m.conversation_id, m.sender_id, m.body, m.attachments, m.sent_at,
                        (SELECT COUNT(*) FROM messages mm
                          WHERE mm.conversation_id = c.id
                            AND mm.deleted_at IS NULL
                            AND mm.sender_id != ?1
                            AND mm.id > COALESCE(me.last_read_message_id, 0))
                 FROM conversations c
                 JOIN conversation_participants me
                   ON me.conversation_id = c.id AND me.user_id = ?1
                 JOIN conversation_participants other
                   ON other.conversation_id = c.id AND other.user_id != ?1
                 JOIN users u ON u.id = other.user_id
                 LEFT JOIN messages m ON m.id =
                    (SELECT MAX(id) FROM messages
                      WHERE conversation_id = c.id AND deleted_at IS NULL)
                 ORDER BY COALESCE(m.sent_at, c.created_at) DESC",
            )?;

            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    let last_message = match row.get::<_, Option<i64>>(6)? {
                        Some(id) => Some(MessageRow {
                            id,
                            conversation_id: row.get(7)?,
                            sender_id: row.get(8)?,
                            body: row.get(9)?,
                            attachments: row.get(10)?,
                            sent_at: row.get(11)?,
                        }),
                        None => None,
                    };
                    Ok(ConversationSummaryRow {
                        conversation: ConversationRow {
                            id: row.get(0)?,
                            status: row.get(1)?,
                            created_at: row.get(2)?,
                            updated_at: row.get(3)?,
                        },
                        other_user_id: row.get(4)?,
                        other_username: row.get(5)?,
                        last_message,
                        unread_count: row.get(12)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Advance the caller's read cursor. The cursor only moves forward; a
    /// stale `mark_read` from a lagging session cannot rewind it.
    pub fn mark_read(&self, conversation_id: Uuid, user_id: Uuid, message_id: i64) -> Result<()> {
        self.transaction(|tx| {
            if !is_participant_tx(tx, conversation_id, user_id)? {
                return Err(StoreError::Authorization("not a participant of this conversation"));
            }

            let belongs: Option<i64> = tx
                .query_row(
                    "SELECT id FROM messages WHERE id = ?1 AND conversation_id = ?2",
                    params![message_id, conversation_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if belongs.is_none() {
                return Err(StoreError::NotFound("message"));
            }

            tx.execute(
                "UPDATE conversation_participants
                 SET last_read_message_id = MAX(COALESCE(last_read_message_id, 0), ?3)
                 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.to_string(), message_id],
            )?;

            tx.execute(
                "INSERT INTO message_receipts (message_id, user_id, status)
                 VALUES (?1, ?2, 'READ')
                 ON CONFLICT(message_id, user_id)
                 DO UPDATE SET status = 'READ', at = datetime('now')",
                params![message_id, user_id.to_string()],
            )?;

            Ok(())
        })
    }
}

/// Find the non-CLOSED conversation linking two users, creating it (plus both
/// participant rows) when none exists. Idempotent within and across
/// transactions.
pub(crate) fn get_or_create_for_pair_tx(
    tx: &Transaction,
    a: Uuid,
    b: Uuid,
) -> Result<(ConversationRow, bool)> {
    if let Some(existing) = conversation_for_pair_tx(tx, a, b)? {
        return Ok((existing, false));
    }

    let id = Uuid::new_v4();
    tx.execute("INSERT INTO conversations (id) VALUES (?1)", [id.to_string()])?;
    for user in [a, b] {
        tx.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
            params![id.to_string(), user.to_string()],
        )?;
    }

    let row = conversation_by_id_tx(tx, id)?.ok_or(StoreError::NotFound("conversation"))?;
    Ok((row, true))
}

pub(crate) fn conversation_for_pair_tx(
    tx: &Transaction,
    a: Uuid,
    b: Uuid,
) -> Result<Option<ConversationRow>> {
    let row = tx
        .query_row(
            "SELECT c.id, c.status, c.created_at, c.updated_at
             FROM conversations c
             JOIN conversation_participants pa
               ON pa.conversation_id = c.id AND pa.user_id = ?1
             JOIN conversation_participants pb
               ON pb.conversation_id = c.id AND pb.user_id = ?2
             WHERE c.status != 'CLOSED'
             LIMIT 1",
            params![a.to_string(), b.to_string()],
            map_conversation,
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn conversation_by_id_tx(
    tx: &Transaction,
    id: Uuid,
) -> Result<Option<ConversationRow>> {
    let row = tx
        .query_row(
            "SELECT id, status, created_at, updated_at FROM conversations WHERE id = ?1",
            [id.to_string()],
            map_conversation,
        )
        .optional()?;
    Ok(row)
}

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        status: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

pub(crate) fn is_participant_tx(
    tx: &Transaction,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<bool> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn list_participants_tx(tx: &Transaction, conversation_id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = tx.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1",
    )?;
    let ids = stmt
        .query_map([conversation_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids
        .iter()
        .map(|s| parley_types::models::parse_uuid(s))
        .collect())
}

pub(crate) fn set_pair_conversation_status_tx(
    tx: &Transaction,
    a: Uuid,
    b: Uuid,
    status: &str,
) -> Result<()> {
    if let Some(convo) = conversation_for_pair_tx(tx, a, b)? {
        tx.execute(
            "UPDATE conversations SET status = ?2, updated_at = datetime('now') WHERE id = ?1",
            params![convo.id, status],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn two_users(db: &Database) -> (Uuid, Uuid) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        db.create_user(a, "alice", "hash").unwrap();
        db.create_user(b, "bob", "hash").unwrap();
        (a, b)
    }

    #[test]
    fn pair_conversation_is_created_once() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = two_users(&db);

        let first = db
            .transaction(|tx| get_or_create_for_pair_tx(tx, a, b))
            .unwrap();
        assert!(first.1, "first call should create");

        // Same pair, either order
        let second = db
            .transaction(|tx| get_or_create_for_pair_tx(tx, b, a))
            .unwrap();
        assert!(!second.1, "second call should reuse");
        assert_eq!(first.0.id, second.0.id);

        assert!(db.is_participant(parley_types::models::parse_uuid(&first.0.id), a).unwrap());
        assert!(db.is_participant(parley_types::models::parse_uuid(&first.0.id), b).unwrap());
    }

    #[test]
    fn mark_read_requires_participation() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = two_users(&db);
        let outsider = Uuid::new_v4();
        db.create_user(outsider, "mallory", "hash").unwrap();

        let (convo, _) = db
            .transaction(|tx| get_or_create_for_pair_tx(tx, a, b))
            .unwrap();
        let cid = parley_types::models::parse_uuid(&convo.id);
        let (msg, _) = db.store_chat_message(cid, a, "hi", &[]).unwrap();

        assert!(matches!(
            db.mark_read(cid, outsider, msg.id),
            Err(StoreError::Authorization(_))
        ));
        db.mark_read(cid, b, msg.id).unwrap();
    }

    #[test]
    fn mark_read_cursor_never_rewinds() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = two_users(&db);
        let (convo, _) = db
            .transaction(|tx| get_or_create_for_pair_tx(tx, a, b))
            .unwrap();
        let cid = parley_types::models::parse_uuid(&convo.id);

        let (m1, _) = db.store_chat_message(cid, a, "one", &[]).unwrap();
        let (m2, _) = db.store_chat_message(cid, a, "two", &[]).unwrap();

        db.mark_read(cid, b, m2.id).unwrap();
        db.mark_read(cid, b, m1.id).unwrap();

        let summaries = db.list_conversations(b).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 0);
    }

    #[test]
    fn summary_reports_other_user_and_last_message() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = two_users(&db);
        let (convo, _) = db
            .transaction(|tx| get_or_create_for_pair_tx(tx, a, b))
            .unwrap();
        let cid = parley_types::models::parse_uuid(&convo.id);

        db.store_chat_message(cid, a, "first", &[]).unwrap();
        db.store_chat_message(cid, b, "second", &[]).unwrap();

        let summaries = db.list_conversations(a).unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.other_username, "bob");
        assert_eq!(summary.last_message.as_ref().unwrap().body, "second");
        assert_eq!(summary.unread_count, 1);
    }
}
