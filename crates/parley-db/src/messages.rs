//! Message persistence. Ids are assigned by the store and strictly increase,
//! so within a conversation the id order is the accepted order; the gateway
//! fans out in the same order it persists.

use rusqlite::{OptionalExtension, Transaction, params};
use uuid::Uuid;

use parley_types::models::Message;
use parley_types::notifications::NotificationPayload;

use crate::conversations::{conversation_by_id_tx, is_participant_tx, list_participants_tx};
use crate::models::MessageRow;
use crate::notifications::insert_notification_tx;
use crate::{Database, Result, StoreError, blocks};

/// Upper bound on message body length, in bytes.
const MAX_BODY_LEN: usize = 4000;

/// Notification previews keep only the head of the body.
const PREVIEW_LEN: usize = 80;

impl Database {
    /// Authorize and persist one chat message. Checks and insert share a
    /// transaction, so a concurrent block or participant change cannot slip
    /// a message into a conversation it no longer belongs in. Returns the
    /// stored row and the conversation's participants for fanout.
    pub fn store_chat_message(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        body: &str,
        attachments: &[String],
    ) -> Result<(MessageRow, Vec<Uuid>)> {
        let body = body.trim();
        if body.is_empty() && attachments.is_empty() {
            return Err(StoreError::Validation("message body must not be empty".into()));
        }
        if body.len() > MAX_BODY_LEN {
            return Err(StoreError::Validation(format!(
                "message body exceeds {} bytes",
                MAX_BODY_LEN
            )));
        }

        self.transaction(|tx| {
            let convo = conversation_by_id_tx(tx, conversation_id)?
                .ok_or(StoreError::NotFound("conversation"))?;
            if convo.status != "ACTIVE" {
                return Err(StoreError::Conflict("conversation is not active"));
            }

            let participants = list_participants_tx(tx, conversation_id)?;
            if !participants.contains(&sender) {
                return Err(StoreError::Authorization("not a participant of this conversation"));
            }
            for other in participants.iter().filter(|p| **p != sender) {
                if blocks::is_blocked_tx(tx, sender, *other)? {
                    return Err(StoreError::Conflict("conversation blocked"));
                }
            }

            tx.execute(
                "INSERT INTO messages (conversation_id, sender_id, body, attachments)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    conversation_id.to_string(),
                    sender.to_string(),
                    body,
                    serde_json::to_string(attachments)?
                ],
            )?;
            let id = tx.last_insert_rowid();

            let row = message_by_id_tx(tx, id)?.ok_or(StoreError::NotFound("message"))?;
            Ok((row, participants))
        })
    }

    /// Page through a conversation's messages, newest first, participant
    /// gated. `before` is an exclusive id cursor for older pages; soft
    /// deleted messages are skipped.
    pub fn messages_page(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<MessageRow>> {
        self.transaction(|tx| {
            if !is_participant_tx(tx, conversation_id, user_id)? {
                return Err(StoreError::Authorization("not a participant of this conversation"));
            }

            let mut stmt = tx.prepare(
                "SELECT id, conversation_id, sender_id, body, attachments, sent_at
                 FROM messages
                 WHERE conversation_id = ?1
                   AND deleted_at IS NULL
                   AND (?2 IS NULL OR id < ?2)
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;

            let rows = stmt
                .query_map(
                    params![conversation_id.to_string(), before, limit],
                    map_message,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Post-fanout bookkeeping: DELIVERED receipts for recipients that had a
    /// live session, NEW_MESSAGE notification rows for those that had none.
    pub fn record_delivery(
        &self,
        message: &Message,
        delivered_to: &[Uuid],
        offline: &[Uuid],
    ) -> Result<()> {
        let preview: String = message.body.chars().take(PREVIEW_LEN).collect();
        self.transaction(|tx| {
            for user in delivered_to {
                tx.execute(
                    "INSERT INTO message_receipts (message_id, user_id, status)
                     VALUES (?1, ?2, 'DELIVERED')
                     ON CONFLICT(message_id, user_id) DO NOTHING",
                    params![message.id, user.to_string()],
                )?;
            }
            for user in offline {
                insert_notification_tx(
                    tx,
                    *user,
                    &NotificationPayload::NewMessage {
                        conversation_id: message.conversation_id,
                        message_id: message.id,
                        sender_id: message.sender_id,
                        preview: preview.clone(),
                    },
                )?;
            }
            Ok(())
        })
    }

    /// Soft delete: the row keeps its body for moderation but drops out of
    /// every fetch. Sender only.
    pub fn delete_message(
        &self,
        conversation_id: Uuid,
        message_id: i64,
        user_id: Uuid,
    ) -> Result<()> {
        self.transaction(|tx| {
            let sender: Option<String> = tx
                .query_row(
                    "SELECT sender_id FROM messages
                     WHERE id = ?1 AND conversation_id = ?2 AND deleted_at IS NULL",
                    params![message_id, conversation_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            let sender = sender.ok_or(StoreError::NotFound("message"))?;
            if sender != user_id.to_string() {
                return Err(StoreError::Authorization("only the sender may delete a message"));
            }

            tx.execute(
                "UPDATE messages SET deleted_at = datetime('now') WHERE id = ?1",
                [message_id],
            )?;
            Ok(())
        })
    }
}

fn message_by_id_tx(tx: &Transaction, id: i64) -> Result<Option<MessageRow>> {
    let row = tx
        .query_row(
            "SELECT id, conversation_id, sender_id, body, attachments, sent_at
             FROM messages WHERE id = ?1",
            [id],
            map_message,
        )
        .optional()?;
    Ok(row)
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        body: row.get(3)?,
        attachments: row.get(4)?,
        sent_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::get_or_create_for_pair_tx;
    use parley_types::models::parse_uuid;

    fn conversation() -> (Database, Uuid, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        db.create_user(a, "alice", "hash").unwrap();
        db.create_user(b, "bob", "hash").unwrap();
        let (convo, _) = db
            .transaction(|tx| get_or_create_for_pair_tx(tx, a, b))
            .unwrap();
        let cid = parse_uuid(&convo.id);
        (db, cid, a, b)
    }

    #[test]
    fn ids_increase_and_fetch_order_matches_send_order() {
        let (db, cid, a, b) = conversation();

        let (m1, _) = db.store_chat_message(cid, a, "one", &[]).unwrap();
        let (m2, _) = db.store_chat_message(cid, b, "two", &[]).unwrap();
        let (m3, _) = db.store_chat_message(cid, a, "three", &[]).unwrap();
        assert!(m1.id < m2.id && m2.id < m3.id);

        let page = db.messages_page(cid, a, 10, None).unwrap();
        let bodies: Vec<_> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["three", "two", "one"]);
    }

    #[test]
    fn cursor_pages_older_messages() {
        let (db, cid, a, _) = conversation();
        for i in 0..5 {
            db.store_chat_message(cid, a, &format!("m{}", i), &[]).unwrap();
        }

        let newest = db.messages_page(cid, a, 2, None).unwrap();
        let older = db
            .messages_page(cid, a, 10, Some(newest.last().unwrap().id))
            .unwrap();
        assert_eq!(older.len(), 3);
        assert!(older.iter().all(|m| m.id < newest.last().unwrap().id));
    }

    #[test]
    fn non_participant_cannot_send_and_no_row_is_created() {
        let (db, cid, a, _) = conversation();
        let outsider = Uuid::new_v4();
        db.create_user(outsider, "mallory", "hash").unwrap();

        assert!(matches!(
            db.store_chat_message(cid, outsider, "hi", &[]),
            Err(StoreError::Authorization(_))
        ));
        assert!(db.messages_page(cid, a, 10, None).unwrap().is_empty());
    }

    #[test]
    fn non_participant_cannot_read() {
        let (db, cid, _, _) = conversation();
        let outsider = Uuid::new_v4();
        db.create_user(outsider, "mallory", "hash").unwrap();

        assert!(matches!(
            db.messages_page(cid, outsider, 10, None),
            Err(StoreError::Authorization(_))
        ));
    }

    #[test]
    fn blocked_pair_cannot_send() {
        let (db, cid, a, b) = conversation();
        db.create_block(b, a, None).unwrap();

        // Block parks the conversation, so the status gate trips first;
        // either way the send conflicts and nothing is stored.
        assert!(matches!(
            db.store_chat_message(cid, a, "hi", &[]),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn empty_body_is_invalid() {
        let (db, cid, a, _) = conversation();
        assert!(matches!(
            db.store_chat_message(cid, a, "   ", &[]),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn attachments_round_trip() {
        let (db, cid, a, _) = conversation();
        let uris = vec!["https://cdn.example/a.jpg".to_string()];
        let (row, _) = db.store_chat_message(cid, a, "look", &uris).unwrap();
        assert_eq!(row.to_api().attachments, uris);
    }

    #[test]
    fn record_delivery_writes_receipts_and_offline_notifications() {
        let (db, cid, a, b) = conversation();
        let (row, _) = db.store_chat_message(cid, a, "hello there", &[]).unwrap();
        let message = row.to_api();

        db.record_delivery(&message, &[], &[b]).unwrap();
        let notes = db.notifications_page(b, true, 10, 0).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, "NEW_MESSAGE");

        // Duplicate receipts are absorbed
        db.record_delivery(&message, &[b], &[]).unwrap();
        db.record_delivery(&message, &[b], &[]).unwrap();
    }

    #[test]
    fn deleted_messages_drop_out_of_fetch() {
        let (db, cid, a, b) = conversation();
        let (m1, _) = db.store_chat_message(cid, a, "keep", &[]).unwrap();
        let (m2, _) = db.store_chat_message(cid, a, "drop", &[]).unwrap();

        assert!(matches!(
            db.delete_message(cid, m2.id, b),
            Err(StoreError::Authorization(_))
        ));
        db.delete_message(cid, m2.id, a).unwrap();

        let page = db.messages_page(cid, b, 10, None).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, m1.id);
    }
}
