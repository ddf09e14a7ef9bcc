//! Embedded relational store backing one node.
//!
//! A single SQLite file holds accounts, messages, and per-conversation
//! preferences. Every operation takes the connection lock, so callers on any
//! task see serialized, atomic writes. Domain failures (duplicate username,
//! forced-id collision, unknown owner) come back as `Ok(false)`/`Ok(None)`;
//! engine failures surface as `Error::Storage` and are never retried here.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use crate::error::Result;

/// Page size handed to clients that do not ask for one.
pub const DEFAULT_MESSAGE_LIMIT: i64 = 50;

/// Seconds since the epoch, as stored in the `timestamp` column.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One row of the `messages` table.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageRow {
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub timestamp: f64,
    pub is_read: bool,
    pub is_delivered: bool,
}

/// A page of usernames from `list_accounts`.
#[derive(Clone, Debug, PartialEq)]
pub struct AccountPage {
    pub users: Vec<String>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// A page of a two-party conversation, newest first.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationPage {
    pub messages: Vec<MessageRow>,
    pub total: u64,
}

/// Thread-safe handle to the node's durable state.
pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    /// Opens (or creates) the backing file and ensures the schema exists.
    /// Failure here is fatal to the node.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp REAL NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_delivered INTEGER NOT NULL DEFAULT 0,
                sender_deleted INTEGER NOT NULL DEFAULT 0,
                recipient_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS chat_preferences (
                username TEXT NOT NULL,
                partner TEXT NOT NULL,
                message_limit INTEGER NOT NULL DEFAULT 50,
                PRIMARY KEY (username, partner)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(recipient, is_delivered);
            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(sender, recipient);
            "#,
        )?;
        Ok(())
    }

    /// Inserts a new account. Returns false when the username is taken.
    pub fn create_account(&self, username: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        match conn.execute(
            "INSERT INTO accounts (username, password_hash) VALUES (?, ?)",
            params![username, password_hash],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn user_exists(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM accounts WHERE username = ?",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Verifies a password against the stored verifier. Accounts created by
    /// replication carry an empty verifier and never verify.
    pub fn verify_login(&self, username: &str, password: &str) -> Result<bool> {
        let hash: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT password_hash FROM accounts WHERE username = ?",
                params![username],
                |row| row.get(0),
            )
            .optional()?
        };
        match hash {
            Some(h) if !h.is_empty() => Ok(bcrypt::verify(password, &h)?),
            _ => Ok(false),
        }
    }

    /// Inserts a message and returns its id. With `forced_id` (the follower
    /// path) the id is stored verbatim; a collision returns `None`.
    pub fn store_message(
        &self,
        sender: &str,
        recipient: &str,
        content: &str,
        is_delivered: bool,
        forced_id: Option<i64>,
    ) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let ts = now_secs();
        match forced_id {
            Some(id) => {
                let inserted = conn.execute(
                    "INSERT INTO messages (id, sender, recipient, content, timestamp, is_delivered)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params![id, sender, recipient, content, ts, is_delivered],
                );
                match inserted {
                    Ok(_) => Ok(Some(id)),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(None)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO messages (sender, recipient, content, timestamp, is_delivered)
                     VALUES (?, ?, ?, ?, ?)",
                    params![sender, recipient, content, ts, is_delivered],
                )?;
                Ok(Some(conn.last_insert_rowid()))
            }
        }
    }

    pub fn mark_message_as_delivered(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET is_delivered = 1 WHERE id = ?",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Marks messages as read for their recipient. An empty id list means the
    /// whole inbox; a non-empty list referencing no stored row returns false.
    pub fn mark_messages_as_read(&self, owner: &str, ids: &[i64]) -> Result<bool> {
        if !self.user_exists(owner)? {
            return Ok(false);
        }
        let conn = self.conn.lock();
        if ids.is_empty() {
            conn.execute(
                "UPDATE messages SET is_read = 1 WHERE recipient = ? AND recipient_deleted = 0",
                params![owner],
            )?;
            return Ok(true);
        }

        let placeholders = vec!["?"; ids.len()].join(",");
        let existing: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM messages WHERE id IN ({})", placeholders),
            rusqlite::params_from_iter(ids.iter()),
            |row| row.get(0),
        )?;
        if existing == 0 {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE messages SET is_read = 1 WHERE recipient = ? AND id IN ({})",
            placeholders
        );
        let mut bound: Vec<&dyn ToSql> = vec![&owner];
        for id in ids {
            bound.push(id);
        }
        conn.execute(&sql, &bound[..])?;
        Ok(true)
    }

    /// Soft-deletes messages from the owner's view: flips `sender_deleted`
    /// where the owner sent, `recipient_deleted` where the owner received.
    /// Unknown ids are skipped.
    pub fn delete_messages(&self, owner: &str, ids: &[i64]) -> Result<bool> {
        if !self.user_exists(owner)? {
            return Ok(false);
        }
        let conn = self.conn.lock();
        for id in ids {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT sender, recipient FROM messages WHERE id = ?",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((sender, _)) if sender == owner => {
                    conn.execute(
                        "UPDATE messages SET sender_deleted = 1 WHERE id = ?",
                        params![id],
                    )?;
                }
                Some((_, recipient)) if recipient == owner => {
                    conn.execute(
                        "UPDATE messages SET recipient_deleted = 1 WHERE id = ?",
                        params![id],
                    )?;
                }
                _ => continue,
            }
        }
        Ok(true)
    }

    /// Reverses `delete_messages` for the same owner and ids. Used only to
    /// roll back a soft delete that failed to replicate.
    pub fn undelete_messages(&self, owner: &str, ids: &[i64]) -> Result<bool> {
        let conn = self.conn.lock();
        for id in ids {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT sender, recipient FROM messages WHERE id = ?",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((sender, _)) if sender == owner => {
                    conn.execute(
                        "UPDATE messages SET sender_deleted = 0 WHERE id = ?",
                        params![id],
                    )?;
                }
                Some((_, recipient)) if recipient == owner => {
                    conn.execute(
                        "UPDATE messages SET recipient_deleted = 0 WHERE id = ?",
                        params![id],
                    )?;
                }
                _ => continue,
            }
        }
        Ok(true)
    }

    /// Physically removes a message row. Rollback path for a stored message
    /// that failed to replicate.
    pub fn purge_message(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM messages WHERE id = ?", params![id])?;
        Ok(changed > 0)
    }

    /// Removes the account and every message naming it as sender or
    /// recipient.
    pub fn delete_account(&self, username: &str) -> Result<bool> {
        if !self.user_exists(username)? {
            return Ok(false);
        }
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM messages WHERE sender = ? OR recipient = ?",
            params![username, username],
        )?;
        conn.execute("DELETE FROM accounts WHERE username = ?", params![username])?;
        Ok(true)
    }

    /// Substring-matches usernames with 1-based pagination, ordered by
    /// username. Invalid page arguments yield an empty page.
    pub fn list_accounts(&self, pattern: &str, page: u32, per_page: u32) -> Result<AccountPage> {
        if page < 1 || per_page < 1 {
            return Ok(AccountPage { users: vec![], total: 0, page, per_page });
        }
        let conn = self.conn.lock();
        let like = format!("%{}%", pattern);
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM accounts WHERE username LIKE ?",
            params![like],
            |row| row.get(0),
        )?;
        let offset = (page as i64 - 1) * per_page as i64;
        let mut stmt = conn.prepare(
            "SELECT username FROM accounts WHERE username LIKE ?
             ORDER BY username LIMIT ? OFFSET ?",
        )?;
        let users = stmt
            .query_map(params![like, per_page as i64, offset], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(AccountPage { users, total, page, per_page })
    }

    /// Both directions of a conversation, visible to `me`, newest first.
    /// Negative offset/limit are clamped to zero.
    pub fn get_messages_between_users(
        &self,
        me: &str,
        partner: &str,
        offset: i64,
        limit: i64,
    ) -> Result<ConversationPage> {
        let offset = offset.max(0);
        let limit = limit.max(0);
        let conn = self.conn.lock();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE (sender = ?1 AND recipient = ?2 AND sender_deleted = 0)
                OR (sender = ?2 AND recipient = ?1 AND recipient_deleted = 0)",
            params![me, partner],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT id, sender, recipient, content, timestamp, is_read, is_delivered
             FROM messages
             WHERE (sender = ?1 AND recipient = ?2 AND sender_deleted = 0)
                OR (sender = ?2 AND recipient = ?1 AND recipient_deleted = 0)
             ORDER BY timestamp DESC, id DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let messages = stmt
            .query_map(params![me, partner, limit, offset], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ConversationPage { messages, total })
    }

    /// Undelivered, still-visible messages for a recipient, oldest first.
    pub fn get_undelivered_messages(&self, recipient: &str) -> Result<Vec<MessageRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sender, recipient, content, timestamp, is_read, is_delivered
             FROM messages
             WHERE recipient = ? AND is_delivered = 0 AND recipient_deleted = 0
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![recipient], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, sender, recipient, content, timestamp, is_read, is_delivered
                 FROM messages WHERE id = ?",
                params![id],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    /// Distinct counterparties with at least one message in either direction.
    pub fn get_chat_partners(&self, me: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT CASE WHEN sender = ?1 THEN recipient ELSE sender END AS partner
             FROM messages
             WHERE sender = ?1 OR recipient = ?1
             ORDER BY partner",
        )?;
        let partners = stmt
            .query_map(params![me], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(partners)
    }

    /// Unread messages sent by `partner` and addressed to `me`.
    pub fn get_unread_between_users(&self, me: &str, partner: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE recipient = ? AND sender = ? AND is_read = 0",
            params![me, partner],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total unread messages across all of the owner's conversations.
    pub fn get_unread_message_count(&self, owner: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE recipient = ? AND is_read = 0 AND recipient_deleted = 0",
            params![owner],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Per-conversation page size, inserted lazily at the default on first
    /// read.
    pub fn get_chat_message_limit(&self, owner: &str, partner: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT message_limit FROM chat_preferences WHERE username = ? AND partner = ?",
                params![owner, partner],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(limit) => Ok(limit),
            None => {
                conn.execute(
                    "INSERT INTO chat_preferences (username, partner, message_limit)
                     VALUES (?, ?, ?)",
                    params![owner, partner, DEFAULT_MESSAGE_LIMIT],
                )?;
                Ok(DEFAULT_MESSAGE_LIMIT)
            }
        }
    }

    pub fn update_chat_message_limit(&self, owner: &str, partner: &str, limit: i64) -> Result<bool> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chat_preferences (username, partner, message_limit) VALUES (?, ?, ?)
             ON CONFLICT (username, partner) DO UPDATE SET message_limit = excluded.message_limit",
            params![owner, partner, limit],
        )?;
        Ok(true)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender: row.get(1)?,
        recipient: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        is_read: row.get(5)?,
        is_delivered: row.get(6)?,
    })
}
