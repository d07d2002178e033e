use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            coins       INTEGER NOT NULL DEFAULT 0,
            is_admin    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Append-only. Rows are never updated or deleted; a user's balance
        -- column is a materialized cache of SUM(delta) over this table.
        CREATE TABLE IF NOT EXISTS coin_ledger (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            delta       INTEGER NOT NULL,
            reason      TEXT NOT NULL,
            ref_table   TEXT,
            ref_id      TEXT,
            description TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_user
            ON coin_ledger(user_id, created_at);

        CREATE TABLE IF NOT EXISTS connection_requests (
            id              TEXT PRIMARY KEY,
            requester_id    TEXT NOT NULL REFERENCES users(id),
            target_user_id  TEXT NOT NULL REFERENCES users(id),
            post_id         TEXT,
            status          TEXT NOT NULL DEFAULT 'PENDING',
            admin_note      TEXT,
            refund_applied  INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- At most one PENDING request per ordered pair. Enforced here rather
        -- than application-side so a concurrent check-then-insert cannot slip
        -- a duplicate through.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_pending_pair
            ON connection_requests(requester_id, target_user_id)
            WHERE status = 'PENDING';

        CREATE INDEX IF NOT EXISTS idx_requests_target
            ON connection_requests(target_user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_requests_requester
            ON connection_requests(requester_id, created_at);

        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            status      TEXT NOT NULL DEFAULT 'ACTIVE',
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id      TEXT NOT NULL REFERENCES conversations(id),
            user_id              TEXT NOT NULL REFERENCES users(id),
            last_read_message_id INTEGER,
            muted_until          TEXT,
            joined_at            TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        -- AUTOINCREMENT keeps message ids strictly increasing; within a
        -- conversation the id order is the delivery order.
        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            body            TEXT NOT NULL,
            attachments     TEXT NOT NULL DEFAULT '[]',
            sent_at         TEXT NOT NULL DEFAULT (datetime('now')),
            edited_at       TEXT,
            deleted_at      TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, id);

        CREATE TABLE IF NOT EXISTS message_receipts (
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            status      TEXT NOT NULL,
            at          TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS chat_blocks (
            blocker_id  TEXT NOT NULL REFERENCES users(id),
            blocked_id  TEXT NOT NULL REFERENCES users(id),
            reason      TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(blocker_id, blocked_id)
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            kind        TEXT NOT NULL,
            payload     TEXT NOT NULL,
            seen        INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_user
            ON notifications(user_id, seen, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
