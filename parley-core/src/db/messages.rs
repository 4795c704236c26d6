//! Message repository
//!
//! Live messages are those with `is_deleted = 0`. Conversation replay uses
//! creation order, with insertion order (rowid) breaking timestamp ties.

use crate::db::codec::{decode_list, decode_timestamp, encode_list};
use crate::db::connection::{Database, Handle};
use crate::error::{Error, Result};
use crate::types::{Message, MessageFilter, NewMessage};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Row};
use std::sync::Arc;

const SELECT_MESSAGE: &str = "
SELECT id, session_id, role, content, file_paths, token_count,
       is_summary, original_message_ids, is_deleted, created_at
FROM messages";

/// CRUD, search, tombstoning and compaction-target selection over `messages`.
#[derive(Clone)]
pub struct MessageRepository {
    db: Arc<Database>,
}

impl MessageRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a message and return it as stored.
    pub fn create(&self, message: &NewMessage) -> Result<Message> {
        self.db.with_handle(|h| Self::create_in(h, message))
    }

    /// [`Self::create`] against an explicit handle, e.g. inside a transaction.
    pub fn create_in(h: &Handle<'_>, message: &NewMessage) -> Result<Message> {
        let file_paths = encode_list(message.file_paths.as_deref())?;
        let original_ids = encode_list(message.original_message_ids.as_deref())?;

        h.execute(
            r#"
            INSERT INTO messages (
                id, session_id, role, content, file_paths,
                token_count, is_summary, original_message_ids
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                message.id,
                message.session_id,
                message.role.as_str(),
                message.content,
                file_paths,
                message.token_count.unwrap_or(0),
                message.is_summary.unwrap_or(false),
                original_ids,
            ],
        )?;

        Self::find_in(h, &message.id)?.ok_or_else(|| Error::MessageNotFound(message.id.clone()))
    }

    /// Get a message by ID, tombstoned or not.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Message>> {
        self.db.with_handle(|h| Self::find_in(h, id))
    }

    pub fn find_in(h: &Handle<'_>, id: &str) -> Result<Option<Message>> {
        h.query_one(
            &format!("{SELECT_MESSAGE} WHERE id = ?1"),
            [id],
            Self::row_to_message,
        )
    }

    /// Live messages of a session in chronological order.
    pub fn find_by_session_id(&self, session_id: &str) -> Result<Vec<Message>> {
        self.db.query_all(
            &format!(
                "{SELECT_MESSAGE}
                WHERE session_id = ?1 AND is_deleted = 0
                ORDER BY created_at ASC, rowid ASC"
            ),
            [session_id],
            Self::row_to_message,
        )
    }

    /// Messages matching every set filter, newest first.
    pub fn search(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if let Some(session_id) = &filter.session_id {
            conditions.push("session_id = ?");
            values.push(Value::Text(session_id.clone()));
        }
        if let Some(role) = filter.role {
            conditions.push("role = ?");
            values.push(Value::Text(role.as_str().to_string()));
        }
        if let Some(is_summary) = filter.is_summary {
            conditions.push("is_summary = ?");
            values.push(Value::Integer(is_summary.into()));
        }
        if let Some(is_deleted) = filter.is_deleted {
            conditions.push("is_deleted = ?");
            values.push(Value::Integer(is_deleted.into()));
        }

        let mut sql = SELECT_MESSAGE.to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded
        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                sql.push_str(" LIMIT ?");
                values.push(Value::Integer(limit.into()));
                if let Some(offset) = offset {
                    sql.push_str(" OFFSET ?");
                    values.push(Value::Integer(offset.into()));
                }
            }
            (None, Some(offset)) => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                values.push(Value::Integer(offset.into()));
            }
            (None, None) => {}
        }

        self.db
            .query_all(&sql, params_from_iter(values), Self::row_to_message)
    }

    /// Tombstone a message. The row stays for history and summaries.
    pub fn mark_as_deleted(&self, id: &str) -> Result<()> {
        self.db.with_handle(|h| Self::mark_as_deleted_in(h, id))
    }

    pub fn mark_as_deleted_in(h: &Handle<'_>, id: &str) -> Result<()> {
        h.execute("UPDATE messages SET is_deleted = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Physically delete every message of a session, tombstoned or not.
    pub fn delete_by_session_id(&self, session_id: &str) -> Result<()> {
        self.db
            .execute("DELETE FROM messages WHERE session_id = ?1", [session_id])
    }

    /// Oldest live, non-summary messages, leaving the newest `keep_recent`.
    ///
    /// With `n` eligible messages this returns the first `n - keep_recent`
    /// in creation order, or nothing when that is not positive. Count and
    /// selection run in one transaction so they see the same rows.
    pub fn get_summary_targets(&self, session_id: &str, keep_recent: u32) -> Result<Vec<Message>> {
        self.db.transaction(|tx| {
            let eligible: i64 = tx
                .query_one(
                    "SELECT COUNT(*) FROM messages
                     WHERE session_id = ?1 AND is_summary = 0 AND is_deleted = 0",
                    [session_id],
                    |r| r.get(0),
                )?
                .unwrap_or(0);

            let take = eligible - i64::from(keep_recent);
            if take <= 0 {
                return Ok(Vec::new());
            }

            tx.query_all(
                &format!(
                    "{SELECT_MESSAGE}
                    WHERE session_id = ?1 AND is_summary = 0 AND is_deleted = 0
                    ORDER BY created_at ASC, rowid ASC
                    LIMIT ?2"
                ),
                params![session_id, take],
                Self::row_to_message,
            )
        })
    }

    /// Number of live messages in a session (summaries included).
    pub fn get_message_count(&self, session_id: &str) -> Result<i64> {
        Ok(self
            .db
            .query_one(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND is_deleted = 0",
                [session_id],
                |r| r.get(0),
            )?
            .unwrap_or(0))
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let role: String = row.get("role")?;
        let created_at: String = row.get("created_at")?;

        Ok(Message {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            role: role.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
            })?,
            content: row.get("content")?,
            file_paths: decode_list(4, row.get("file_paths")?)?,
            token_count: row.get("token_count")?,
            is_summary: row.get("is_summary")?,
            original_message_ids: decode_list(7, row.get("original_message_ids")?)?,
            is_deleted: row.get("is_deleted")?,
            created_at: decode_timestamp(9, &created_at)?,
        })
    }
}
