//! Connection request state machine.
//!
//! PENDING is the only non-terminal state; APPROVED, REJECTED and CANCELLED
//! are terminal and nothing transitions out of them. Coin side effects
//! (connect debit on create, refund credit on cancel) ride in the same
//! transaction as the status write, so a request and its money can never
//! disagree.

use rusqlite::{OptionalExtension, Transaction, params};
use uuid::Uuid;

use parley_types::models::{LedgerReason, RequestStatus, parse_uuid};
use parley_types::notifications::NotificationPayload;

use crate::error::map_constraint;
use crate::models::{ConnectionRequestRow, ConversationRow};
use crate::notifications::insert_notification_tx;
use crate::{Database, Result, StoreError, blocks, conversations, ledger, users};

impl Database {
    /// Create a PENDING request and debit the requester's connect cost. If
    /// the debit fails the request is not created; if the insert fails the
    /// debit is rolled back.
    pub fn create_connection_request(
        &self,
        requester: Uuid,
        target: Uuid,
        post_id: Option<Uuid>,
        cost: i64,
    ) -> Result<ConnectionRequestRow> {
        if requester == target {
            return Err(StoreError::Validation(
                "cannot request a connection with yourself".into(),
            ));
        }

        let id = Uuid::new_v4();
        self.transaction(|tx| {
            if !users::user_exists_tx(tx, target)? {
                return Err(StoreError::NotFound("user"));
            }
            if blocks::is_blocked_tx(tx, requester, target)? {
                return Err(StoreError::Conflict("connection blocked between these users"));
            }

            ledger::debit_tx(
                tx,
                requester,
                cost,
                LedgerReason::Connect,
                "connection_requests",
                Some(&id.to_string()),
                Some("connect request"),
            )?;

            tx.execute(
                "INSERT INTO connection_requests (id, requester_id, target_user_id, post_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    requester.to_string(),
                    target.to_string(),
                    post_id.map(|p| p.to_string())
                ],
            )
            .map_err(|e| map_constraint(e, "a pending request to this user already exists"))?;

            insert_notification_tx(
                tx,
                target,
                &NotificationPayload::ConnectionRequested {
                    request_id: id,
                    requester_id: requester,
                    post_id,
                },
            )?;

            load_request_tx(tx, id)
        })
    }

    /// Approve a PENDING request. Only the target may approve. The status
    /// write, the conversation creation and the requester's notification
    /// commit together; a second approval sees a terminal row and conflicts,
    /// leaving exactly one conversation.
    pub fn approve_connection_request(
        &self,
        request_id: Uuid,
        acting_user: Uuid,
        note: Option<&str>,
    ) -> Result<(ConnectionRequestRow, ConversationRow)> {
        self.transaction(|tx| {
            let row = load_request_tx(tx, request_id)?;
            if parse_uuid(&row.target_user_id) != acting_user {
                return Err(StoreError::Authorization("only the target may approve"));
            }
            approve_tx(tx, &row, note)
        })
    }

    /// Reject a PENDING request. Only the target may reject. Whether the
    /// requester's coins come back is policy (`refund`); the default
    /// configuration keeps them.
    pub fn reject_connection_request(
        &self,
        request_id: Uuid,
        acting_user: Uuid,
        note: Option<&str>,
        refund: bool,
    ) -> Result<ConnectionRequestRow> {
        self.transaction(|tx| {
            let row = load_request_tx(tx, request_id)?;
            if parse_uuid(&row.target_user_id) != acting_user {
                return Err(StoreError::Authorization("only the target may reject"));
            }
            reject_tx(tx, &row, note, refund)
        })
    }

    /// Cancel a PENDING request and refund the original connect cost. Only
    /// the requester may cancel. Cancelling an already-CANCELLED request is a
    /// no-op; `refund_applied` guarantees the credit happens at most once.
    pub fn cancel_connection_request(
        &self,
        request_id: Uuid,
        acting_user: Uuid,
    ) -> Result<ConnectionRequestRow> {
        self.transaction(|tx| {
            let row = load_request_tx(tx, request_id)?;
            if parse_uuid(&row.requester_id) != acting_user {
                return Err(StoreError::Authorization("only the requester may cancel"));
            }
            cancel_tx(tx, &row)
        })
    }

    /// Privileged moderation path: force a PENDING request into a terminal
    /// state without actor checks. Terminal-state monotonicity and the
    /// exactly-once refund contract still hold.
    pub fn force_request_status(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        note: Option<&str>,
    ) -> Result<ConnectionRequestRow> {
        if status == RequestStatus::Pending {
            return Err(StoreError::Validation(
                "cannot force a request back to PENDING".into(),
            ));
        }
        self.transaction(|tx| {
            let row = load_request_tx(tx, request_id)?;
            match status {
                RequestStatus::Approved => approve_tx(tx, &row, note).map(|(row, _)| row),
                RequestStatus::Rejected => reject_tx(tx, &row, note, false),
                RequestStatus::Cancelled => cancel_tx(tx, &row),
                RequestStatus::Pending => unreachable!("rejected above"),
            }
        })
    }

    pub fn get_connection_request(&self, id: Uuid) -> Result<ConnectionRequestRow> {
        self.transaction(|tx| load_request_tx(tx, id))
    }

    /// Requests where the user is the target (`incoming`) or the requester
    /// (`outgoing`), newest first.
    pub fn list_connection_requests(
        &self,
        user_id: Uuid,
        incoming: bool,
    ) -> Result<Vec<ConnectionRequestRow>> {
        let column = if incoming { "target_user_id" } else { "requester_id" };
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, requester_id, target_user_id, post_id, status, admin_note,
                        refund_applied, created_at, updated_at
                 FROM connection_requests
                 WHERE {} = ?1
                 ORDER BY rowid DESC",
                column
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], map_request)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn approve_tx(
    tx: &Transaction,
    row: &ConnectionRequestRow,
    note: Option<&str>,
) -> Result<(ConnectionRequestRow, ConversationRow)> {
    ensure_pending(row)?;

    let request_id = parse_uuid(&row.id);
    let requester = parse_uuid(&row.requester_id);
    let target = parse_uuid(&row.target_user_id);

    // A block may have landed while the request sat PENDING; approval must
    // not open a conversation between a blocked pair.
    if blocks::is_blocked_tx(tx, requester, target)? {
        return Err(StoreError::Conflict("connection blocked between these users"));
    }

    set_status_tx(tx, request_id, RequestStatus::Approved, note)?;
    let (conversation, _created) = conversations::get_or_create_for_pair_tx(tx, requester, target)?;

    insert_notification_tx(
        tx,
        requester,
        &NotificationPayload::ConnectionApproved {
            request_id,
            conversation_id: parse_uuid(&conversation.id),
            approved_by: target,
        },
    )?;

    Ok((load_request_tx(tx, request_id)?, conversation))
}

fn reject_tx(
    tx: &Transaction,
    row: &ConnectionRequestRow,
    note: Option<&str>,
    refund: bool,
) -> Result<ConnectionRequestRow> {
    ensure_pending(row)?;

    let request_id = parse_uuid(&row.id);
    let requester = parse_uuid(&row.requester_id);
    let target = parse_uuid(&row.target_user_id);

    set_status_tx(tx, request_id, RequestStatus::Rejected, note)?;
    if refund {
        refund_tx(tx, row)?;
    }

    insert_notification_tx(
        tx,
        requester,
        &NotificationPayload::ConnectionRejected {
            request_id,
            rejected_by: target,
            note: note.map(str::to_string),
        },
    )?;

    load_request_tx(tx, request_id)
}

fn cancel_tx(tx: &Transaction, row: &ConnectionRequestRow) -> Result<ConnectionRequestRow> {
    // Repeat cancel is a no-op, not an error: the refund already happened
    // and the state is what the caller asked for.
    if row.status() == RequestStatus::Cancelled {
        return load_request_tx(tx, parse_uuid(&row.id));
    }
    ensure_pending(row)?;

    let request_id = parse_uuid(&row.id);
    set_status_tx(tx, request_id, RequestStatus::Cancelled, None)?;
    refund_tx(tx, row)?;

    load_request_tx(tx, request_id)
}

fn ensure_pending(row: &ConnectionRequestRow) -> Result<()> {
    if row.status().is_terminal() {
        return Err(StoreError::Conflict("request already resolved"));
    }
    Ok(())
}

fn set_status_tx(
    tx: &Transaction,
    request_id: Uuid,
    status: RequestStatus,
    note: Option<&str>,
) -> Result<()> {
    tx.execute(
        "UPDATE connection_requests
         SET status = ?2,
             admin_note = COALESCE(?3, admin_note),
             updated_at = datetime('now')
         WHERE id = ?1",
        params![request_id.to_string(), status.as_str(), note],
    )?;
    Ok(())
}

/// Credit back the original connect cost, exactly once per request. The
/// `refund_applied` flag gates the credit; the amount comes from the original
/// CONNECT ledger entry so later cost changes cannot skew the refund.
fn refund_tx(tx: &Transaction, row: &ConnectionRequestRow) -> Result<()> {
    if row.refund_applied {
        return Ok(());
    }

    let requester = parse_uuid(&row.requester_id);
    let amount = ledger::connect_debit_tx(tx, requester, &row.id)?;
    if amount > 0 {
        let new_balance = ledger::credit_tx(
            tx,
            requester,
            amount,
            LedgerReason::Refund,
            "connection_requests",
            Some(&row.id),
            Some("connect refund"),
        )?;
        insert_notification_tx(
            tx,
            requester,
            &NotificationPayload::CoinsCredited {
                amount,
                reason: LedgerReason::Refund,
                new_balance,
            },
        )?;
    }

    tx.execute(
        "UPDATE connection_requests
         SET refund_applied = 1, updated_at = datetime('now')
         WHERE id = ?1",
        [&row.id],
    )?;
    Ok(())
}

pub(crate) fn load_request_tx(tx: &Transaction, id: Uuid) -> Result<ConnectionRequestRow> {
    tx.query_row(
        "SELECT id, requester_id, target_user_id, post_id, status, admin_note,
                refund_applied, created_at, updated_at
         FROM connection_requests
         WHERE id = ?1",
        [id.to_string()],
        map_request,
    )
    .optional()?
    .ok_or(StoreError::NotFound("connection request"))
}

fn map_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRequestRow> {
    Ok(ConnectionRequestRow {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        target_user_id: row.get(2)?,
        post_id: row.get(3)?,
        status: row.get(4)?,
        admin_note: row.get(5)?,
        refund_applied: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COST: i64 = 5;

    fn seeded() -> (Database, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        db.create_user(a, "alice", "hash").unwrap();
        db.create_user(b, "bob", "hash").unwrap();
        db.credit(a, 100, LedgerReason::Topup, "users", None, Some("seed"))
            .unwrap();
        (db, a, b)
    }

    #[test]
    fn create_debits_the_connect_cost() {
        let (db, a, b) = seeded();

        let row = db.create_connection_request(a, b, None, COST).unwrap();
        assert_eq!(row.status(), RequestStatus::Pending);
        assert_eq!(db.balance(a).unwrap(), 95);

        let entries = db.ledger_page(a, 1, 0).unwrap();
        assert_eq!(entries[0].delta, -COST);
        assert_eq!(entries[0].reason, "CONNECT");
        assert_eq!(entries[0].ref_id.as_deref(), Some(row.id.as_str()));

        // Target learns about the request
        let notes = db.notifications_page(b, true, 10, 0).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, "CONNECTION_REQUESTED");
    }

    #[test]
    fn insufficient_balance_blocks_creation() {
        let (db, a, b) = seeded();
        db.debit(a, 98, LedgerReason::Other, "t", None, None).unwrap();

        let err = db.create_connection_request(a, b, None, COST).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientBalance { .. }));
        assert!(db.list_connection_requests(b, true).unwrap().is_empty());
        assert_eq!(db.balance(a).unwrap(), 2);
    }

    #[test]
    fn self_request_is_rejected() {
        let (db, a, _) = seeded();
        assert!(matches!(
            db.create_connection_request(a, a, None, COST),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_pending_request_conflicts_and_keeps_coins() {
        let (db, a, b) = seeded();
        db.create_connection_request(a, b, None, COST).unwrap();

        let err = db.create_connection_request(a, b, None, COST).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // The duplicate's debit rolled back with the insert
        assert_eq!(db.balance(a).unwrap(), 95);
        assert_eq!(db.balance(a).unwrap(), db.ledger_sum(a).unwrap());
    }

    #[test]
    fn resolved_pair_can_request_again() {
        let (db, a, b) = seeded();
        let first = db.create_connection_request(a, b, None, COST).unwrap();
        db.reject_connection_request(parse_uuid(&first.id), b, None, false)
            .unwrap();

        // The partial unique index only covers PENDING rows
        db.create_connection_request(a, b, None, COST).unwrap();
    }

    #[test]
    fn approve_creates_conversation_and_notifies_requester() {
        let (db, a, b) = seeded();
        let row = db.create_connection_request(a, b, None, COST).unwrap();
        let request_id = parse_uuid(&row.id);

        let (approved, convo) = db.approve_connection_request(request_id, b, None).unwrap();
        assert_eq!(approved.status(), RequestStatus::Approved);

        let cid = parse_uuid(&convo.id);
        assert!(db.is_participant(cid, a).unwrap());
        assert!(db.is_participant(cid, b).unwrap());

        let notes = db.notifications_page(a, true, 10, 0).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, "CONNECTION_APPROVED");
    }

    #[test]
    fn double_approve_conflicts_with_one_conversation() {
        let (db, a, b) = seeded();
        let row = db.create_connection_request(a, b, None, COST).unwrap();
        let request_id = parse_uuid(&row.id);

        let (_, convo) = db.approve_connection_request(request_id, b, None).unwrap();
        let err = db.approve_connection_request(request_id, b, None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // And a later request between the same pair reuses the conversation
        let again = db.create_connection_request(a, b, None, COST).unwrap();
        let (_, convo2) = db
            .approve_connection_request(parse_uuid(&again.id), b, None)
            .unwrap();
        assert_eq!(convo.id, convo2.id);
    }

    #[test]
    fn only_the_target_may_approve_or_reject() {
        let (db, a, b) = seeded();
        let row = db.create_connection_request(a, b, None, COST).unwrap();
        let request_id = parse_uuid(&row.id);

        assert!(matches!(
            db.approve_connection_request(request_id, a, None),
            Err(StoreError::Authorization(_))
        ));
        assert!(matches!(
            db.reject_connection_request(request_id, a, None, false),
            Err(StoreError::Authorization(_))
        ));

        // Still PENDING and still approvable by the right actor
        db.approve_connection_request(request_id, b, None).unwrap();
    }

    #[test]
    fn cancel_refunds_exactly_once() {
        let (db, a, b) = seeded();
        let row = db.create_connection_request(a, b, None, COST).unwrap();
        let request_id = parse_uuid(&row.id);
        assert_eq!(db.balance(a).unwrap(), 95);

        let cancelled = db.cancel_connection_request(request_id, a).unwrap();
        assert_eq!(cancelled.status(), RequestStatus::Cancelled);
        assert!(cancelled.refund_applied);
        assert_eq!(db.balance(a).unwrap(), 100);

        // Second cancel: no-op, no double credit
        let again = db.cancel_connection_request(request_id, a).unwrap();
        assert_eq!(again.status(), RequestStatus::Cancelled);
        assert_eq!(db.balance(a).unwrap(), 100);
        assert_eq!(db.balance(a).unwrap(), db.ledger_sum(a).unwrap());
    }

    #[test]
    fn only_the_requester_may_cancel() {
        let (db, a, b) = seeded();
        let row = db.create_connection_request(a, b, None, COST).unwrap();
        assert!(matches!(
            db.cancel_connection_request(parse_uuid(&row.id), b),
            Err(StoreError::Authorization(_))
        ));
    }

    #[test]
    fn cancel_after_approval_conflicts() {
        let (db, a, b) = seeded();
        let row = db.create_connection_request(a, b, None, COST).unwrap();
        let request_id = parse_uuid(&row.id);
        db.approve_connection_request(request_id, b, None).unwrap();

        assert!(matches!(
            db.cancel_connection_request(request_id, a),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(db.balance(a).unwrap(), 95);
    }

    #[test]
    fn reject_keeps_coins_by_default_and_refunds_when_configured() {
        let (db, a, b) = seeded();

        let first = db.create_connection_request(a, b, None, COST).unwrap();
        db.reject_connection_request(parse_uuid(&first.id), b, Some("no"), false)
            .unwrap();
        assert_eq!(db.balance(a).unwrap(), 95);

        let second = db.create_connection_request(a, b, None, COST).unwrap();
        let rejected = db
            .reject_connection_request(parse_uuid(&second.id), b, None, true)
            .unwrap();
        assert!(rejected.refund_applied);
        assert_eq!(db.balance(a).unwrap(), 95);
        assert_eq!(db.balance(a).unwrap(), db.ledger_sum(a).unwrap());
    }

    #[test]
    fn force_status_skips_actor_checks_but_not_monotonicity() {
        let (db, a, b) = seeded();
        let row = db.create_connection_request(a, b, None, COST).unwrap();
        let request_id = parse_uuid(&row.id);

        let forced = db
            .force_request_status(request_id, RequestStatus::Cancelled, Some("moderated"))
            .unwrap();
        assert_eq!(forced.status(), RequestStatus::Cancelled);
        assert_eq!(db.balance(a).unwrap(), 100);

        assert!(matches!(
            db.force_request_status(request_id, RequestStatus::Approved, None),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            db.force_request_status(request_id, RequestStatus::Pending, None),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn block_arriving_while_pending_prevents_approval() {
        let (db, a, b) = seeded();
        let row = db.create_connection_request(a, b, None, COST).unwrap();
        let request_id = parse_uuid(&row.id);

        db.create_block(b, a, None).unwrap();

        let err = db.approve_connection_request(request_id, b, None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Request stays PENDING and no conversation was opened
        let reloaded = db.get_connection_request(request_id).unwrap();
        assert_eq!(reloaded.status(), RequestStatus::Pending);
        assert!(
            db.transaction(|tx| crate::conversations::conversation_for_pair_tx(tx, a, b))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn blocked_pair_cannot_request() {
        let (db, a, b) = seeded();
        db.create_block(b, a, None).unwrap();
        assert!(matches!(
            db.create_connection_request(a, b, None, COST),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(db.balance(a).unwrap(), 100);
    }
}
