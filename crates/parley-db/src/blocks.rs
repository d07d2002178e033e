//! Chat blocks. A block in either direction suppresses message sending and
//! conversation creation between the pair; blocking also parks any live
//! conversation in BLOCKED until the block is lifted.

use rusqlite::{OptionalExtension, Transaction, params};
use uuid::Uuid;

use crate::conversations::set_pair_conversation_status_tx;
use crate::{Database, Result, StoreError};

impl Database {
    pub fn create_block(&self, blocker: Uuid, blocked: Uuid, reason: Option<&str>) -> Result<()> {
        if blocker == blocked {
            return Err(StoreError::Validation("cannot block yourself".into()));
        }
        self.transaction(|tx| {
            if !crate::users::user_exists_tx(tx, blocked)? {
                return Err(StoreError::NotFound("user"));
            }
            // Idempotent: re-blocking is a no-op.
            tx.execute(
                "INSERT INTO chat_blocks (blocker_id, blocked_id, reason)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(blocker_id, blocked_id) DO NOTHING",
                params![blocker.to_string(), blocked.to_string(), reason],
            )?;
            set_pair_conversation_status_tx(tx, blocker, blocked, "BLOCKED")?;
            Ok(())
        })
    }

    pub fn remove_block(&self, blocker: Uuid, blocked: Uuid) -> Result<()> {
        self.transaction(|tx| {
            let removed = tx.execute(
                "DELETE FROM chat_blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
                params![blocker.to_string(), blocked.to_string()],
            )?;
            if removed == 0 {
                return Err(StoreError::NotFound("block"));
            }
            // Reactivate the conversation only once no block remains in
            // either direction.
            if !is_blocked_tx(tx, blocker, blocked)? {
                set_pair_conversation_status_tx(tx, blocker, blocked, "ACTIVE")?;
            }
            Ok(())
        })
    }

    pub fn is_blocked(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.transaction(|tx| is_blocked_tx(tx, a, b))
    }
}

/// True when a block exists in either direction between the pair.
pub(crate) fn is_blocked_tx(tx: &Transaction, a: Uuid, b: Uuid) -> Result<bool> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM chat_blocks
             WHERE (blocker_id = ?1 AND blocked_id = ?2)
                OR (blocker_id = ?2 AND blocked_id = ?1)
             LIMIT 1",
            params![a.to_string(), b.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
