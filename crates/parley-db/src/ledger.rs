//! Coin ledger engine. Every balance mutation appends an immutable ledger
//! entry and updates the cached `users.coins` column in the same transaction;
//! the cache must never diverge from SUM(delta) over the entries.

use rusqlite::{OptionalExtension, Transaction, params};
use uuid::Uuid;

use parley_types::models::LedgerReason;

use crate::models::LedgerRow;
use crate::{Database, Result, StoreError};

impl Database {
    /// Debit `amount` coins from a user. Fails with `InsufficientBalance`
    /// when the current balance does not cover it; the entry and the balance
    /// update are applied atomically or not at all.
    pub fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: LedgerReason,
        ref_table: &str,
        ref_id: Option<&str>,
        description: Option<&str>,
    ) -> Result<i64> {
        self.transaction(|tx| {
            debit_tx(tx, user_id, amount, reason, ref_table, ref_id, description)
        })
    }

    /// Credit `amount` coins to a user. Used for refunds, top-up approvals
    /// and admin adjustments.
    pub fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: LedgerReason,
        ref_table: &str,
        ref_id: Option<&str>,
        description: Option<&str>,
    ) -> Result<i64> {
        self.transaction(|tx| {
            credit_tx(tx, user_id, amount, reason, ref_table, ref_id, description)
        })
    }

    pub fn balance(&self, user_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT coins FROM users WHERE id = ?1",
                [user_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound("user"))
        })
    }

    /// SUM(delta) over the user's entries — the source of truth the cached
    /// balance must always equal.
    pub fn ledger_sum(&self, user_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(delta), 0) FROM coin_ledger WHERE user_id = ?1",
                [user_id.to_string()],
                |row| row.get(0),
            )?)
        })
    }

    /// Ledger entries for a user, most recent first.
    pub fn ledger_page(&self, user_id: Uuid, limit: u32, offset: u32) -> Result<Vec<LedgerRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, delta, reason, ref_table, ref_id, description, created_at
                 FROM coin_ledger
                 WHERE user_id = ?1
                 ORDER BY rowid DESC
                 LIMIT ?2 OFFSET ?3",
            )?;

            let rows = stmt
                .query_map(params![user_id.to_string(), limit, offset], |row| {
                    Ok(LedgerRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        delta: row.get(2)?,
                        reason: row.get(3)?,
                        ref_table: row.get(4)?,
                        ref_id: row.get(5)?,
                        description: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

pub(crate) fn debit_tx(
    tx: &Transaction,
    user_id: Uuid,
    amount: i64,
    reason: LedgerReason,
    ref_table: &str,
    ref_id: Option<&str>,
    description: Option<&str>,
) -> Result<i64> {
    if amount < 0 {
        return Err(StoreError::Validation("debit amount must not be negative".into()));
    }
    let available = balance_tx(tx, user_id)?;
    if available < amount {
        return Err(StoreError::InsufficientBalance {
            required: amount,
            available,
        });
    }
    apply_tx(tx, user_id, -amount, reason, ref_table, ref_id, description)
}

pub(crate) fn credit_tx(
    tx: &Transaction,
    user_id: Uuid,
    amount: i64,
    reason: LedgerReason,
    ref_table: &str,
    ref_id: Option<&str>,
    description: Option<&str>,
) -> Result<i64> {
    if amount < 0 {
        return Err(StoreError::Validation("credit amount must not be negative".into()));
    }
    // NotFound before the write, same as debit
    balance_tx(tx, user_id)?;
    apply_tx(tx, user_id, amount, reason, ref_table, ref_id, description)
}

pub(crate) fn balance_tx(tx: &Transaction, user_id: Uuid) -> Result<i64> {
    tx.query_row(
        "SELECT coins FROM users WHERE id = ?1",
        [user_id.to_string()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(StoreError::NotFound("user"))
}

fn apply_tx(
    tx: &Transaction,
    user_id: Uuid,
    delta: i64,
    reason: LedgerReason,
    ref_table: &str,
    ref_id: Option<&str>,
    description: Option<&str>,
) -> Result<i64> {
    let uid = user_id.to_string();
    tx.execute(
        "INSERT INTO coin_ledger (id, user_id, delta, reason, ref_table, ref_id, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            uid,
            delta,
            reason.as_str(),
            ref_table,
            ref_id,
            description
        ],
    )?;
    tx.execute(
        "UPDATE users SET coins = coins + ?1 WHERE id = ?2",
        params![delta, uid],
    )?;
    balance_tx(tx, user_id)
}

/// The original CONNECT debit recorded against a request, if any.
pub(crate) fn connect_debit_tx(tx: &Transaction, user_id: Uuid, request_id: &str) -> Result<i64> {
    let delta: Option<i64> = tx
        .query_row(
            "SELECT delta FROM coin_ledger
             WHERE user_id = ?1 AND ref_table = 'connection_requests'
               AND ref_id = ?2 AND reason = 'CONNECT'",
            params![user_id.to_string(), request_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(delta.map(|d| -d).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn db_with_user(coins: i64) -> (Database, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        db.create_user(user, "alice", "hash").unwrap();
        if coins > 0 {
            db.credit(user, coins, LedgerReason::Topup, "users", None, Some("seed"))
                .unwrap();
        }
        (db, user)
    }

    #[test]
    fn debit_and_credit_update_balance_and_ledger() {
        let (db, user) = db_with_user(100);

        let after = db
            .debit(user, 5, LedgerReason::Connect, "connection_requests", None, None)
            .unwrap();
        assert_eq!(after, 95);
        assert_eq!(db.balance(user).unwrap(), 95);

        let entries = db.ledger_page(user, 10, 0).unwrap();
        assert_eq!(entries.len(), 2);
        // Most recent first
        assert_eq!(entries[0].delta, -5);
        assert_eq!(entries[0].reason, "CONNECT");
        assert_eq!(entries[1].delta, 100);
    }

    #[test]
    fn balance_always_equals_ledger_sum() {
        let (db, user) = db_with_user(50);
        db.debit(user, 20, LedgerReason::Post, "posts", None, None).unwrap();
        db.credit(user, 7, LedgerReason::Adjust, "users", None, None).unwrap();
        let _ = db.debit(user, 1000, LedgerReason::Other, "t", None, None);

        assert_eq!(db.balance(user).unwrap(), db.ledger_sum(user).unwrap());
        assert_eq!(db.balance(user).unwrap(), 37);
    }

    #[test]
    fn overdraw_fails_and_writes_nothing() {
        let (db, user) = db_with_user(3);
        let err = db
            .debit(user, 5, LedgerReason::Connect, "connection_requests", None, None)
            .unwrap_err();
        match err {
            StoreError::InsufficientBalance { required, available } => {
                assert_eq!(required, 5);
                assert_eq!(available, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(db.balance(user).unwrap(), 3);
        assert_eq!(db.ledger_page(user, 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn unknown_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.balance(Uuid::new_v4()),
            Err(StoreError::NotFound("user"))
        ));
    }

    #[test]
    fn concurrent_debits_never_overdraw() {
        let (db, user) = db_with_user(100);
        let db = Arc::new(db);

        // Each debit alone fits the balance; together they overdraw. The
        // serialized transaction must fail exactly one of them.
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    db.debit(user, 60, LedgerReason::Connect, "connection_requests", None, None)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let failures = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(failures, 1);
        assert_eq!(db.balance(user).unwrap(), 40);
        assert_eq!(db.balance(user).unwrap(), db.ledger_sum(user).unwrap());
    }
}
