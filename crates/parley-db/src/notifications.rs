//! Notification store. Rows are written inside the same transaction as the
//! state transition that caused them, so a committed transition always has
//! its notification and a rolled-back one never does. Delivery is pull-based:
//! the WebSocket envelope set is closed, so clients fetch on reconnect.

use rusqlite::{Transaction, params};
use uuid::Uuid;

use parley_types::notifications::NotificationPayload;

use crate::models::NotificationRow;
use crate::{Database, Result, StoreError};

impl Database {
    pub fn notifications_page(
        &self,
        user_id: Uuid,
        unseen_only: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, payload, seen, created_at
                 FROM notifications
                 WHERE user_id = ?1 AND (?2 = 0 OR seen = 0)
                 ORDER BY rowid DESC
                 LIMIT ?3 OFFSET ?4",
            )?;

            let rows = stmt
                .query_map(
                    params![user_id.to_string(), unseen_only, limit, offset],
                    |row| {
                        Ok(NotificationRow {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            kind: row.get(2)?,
                            payload: row.get(3)?,
                            seen: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    },
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Mark one notification seen. Scoped to the owner so one user cannot
    /// touch another's rows.
    pub fn mark_notification_seen(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET seen = 1 WHERE id = ?1 AND user_id = ?2",
                params![id.to_string(), user_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("notification"));
            }
            Ok(())
        })
    }

    pub fn mark_all_notifications_seen(&self, user_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE notifications SET seen = 1 WHERE user_id = ?1 AND seen = 0",
                [user_id.to_string()],
            )?)
        })
    }
}

pub(crate) fn insert_notification_tx(
    tx: &Transaction,
    user_id: Uuid,
    payload: &NotificationPayload,
) -> Result<()> {
    tx.execute(
        "INSERT INTO notifications (id, user_id, kind, payload) VALUES (?1, ?2, ?3, ?4)",
        params![
            Uuid::new_v4().to_string(),
            user_id.to_string(),
            payload.kind(),
            serde_json::to_string(payload)?,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_user(db: &Database) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(id, "alice", "hash").unwrap();
        id
    }

    #[test]
    fn insert_and_page_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let user = one_user(&db);
        let payload = NotificationPayload::CoinsCredited {
            amount: 5,
            reason: parley_types::models::LedgerReason::Refund,
            new_balance: 100,
        };
        db.transaction(|tx| insert_notification_tx(tx, user, &payload))
            .unwrap();

        let rows = db.notifications_page(user, false, 10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "COINS_CREDITED");
        let api = rows[0].to_api().unwrap();
        assert!(!api.seen);
        match api.payload {
            NotificationPayload::CoinsCredited { amount, new_balance, .. } => {
                assert_eq!(amount, 5);
                assert_eq!(new_balance, 100);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn seen_is_scoped_to_the_owner() {
        let db = Database::open_in_memory().unwrap();
        let owner = one_user(&db);
        let other = Uuid::new_v4();
        db.create_user(other, "bob", "hash").unwrap();

        let payload = NotificationPayload::CoinsCredited {
            amount: 1,
            reason: parley_types::models::LedgerReason::Topup,
            new_balance: 1,
        };
        db.transaction(|tx| insert_notification_tx(tx, owner, &payload))
            .unwrap();
        let id = parley_types::models::parse_uuid(
            &db.notifications_page(owner, true, 1, 0).unwrap()[0].id,
        );

        assert!(matches!(
            db.mark_notification_seen(other, id),
            Err(StoreError::NotFound("notification"))
        ));
        db.mark_notification_seen(owner, id).unwrap();
        assert!(db.notifications_page(owner, true, 10, 0).unwrap().is_empty());
    }

    #[test]
    fn mark_all_reports_count() {
        let db = Database::open_in_memory().unwrap();
        let user = one_user(&db);
        let payload = NotificationPayload::CoinsCredited {
            amount: 1,
            reason: parley_types::models::LedgerReason::Topup,
            new_balance: 1,
        };
        for _ in 0..3 {
            db.transaction(|tx| insert_notification_tx(tx, user, &payload))
                .unwrap();
        }
        assert_eq!(db.mark_all_notifications_seen(user).unwrap(), 3);
        assert_eq!(db.mark_all_notifications_seen(user).unwrap(), 0);
    }
}
