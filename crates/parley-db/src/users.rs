use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::map_constraint;
use crate::models::UserRow;
use crate::{Database, Result, StoreError};

impl Database {
    pub fn create_user(&self, id: Uuid, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                params![id.to_string(), username, password_hash],
            )
            .map_err(|e| map_constraint(e, "username already taken"))?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", &id.to_string()))
    }

    /// Operator escape hatch; there is no API route that grants admin.
    pub fn set_admin(&self, id: Uuid, admin: bool) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET is_admin = ?1 WHERE id = ?2",
                params![admin, id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("user"));
            }
            Ok(())
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    // `column` is one of two literals above, never user input.
    let sql = format!(
        "SELECT id, username, password, coins, is_admin, created_at FROM users WHERE {} = ?1",
        column
    );
    let row = conn
        .prepare(&sql)?
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                coins: row.get(3)?,
                is_admin: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

pub(crate) fn user_exists_tx(tx: &rusqlite::Transaction, id: Uuid) -> Result<bool> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM users WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
