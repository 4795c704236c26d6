//! Session repository

use crate::db::codec::decode_timestamp;
use crate::db::connection::{Database, Handle};
use crate::error::{Error, Result};
use crate::types::{Session, SessionUpdate};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Row};
use std::sync::Arc;

const SELECT_SESSION: &str =
    "SELECT id, name, total_tokens, created_at, updated_at FROM sessions";

/// CRUD and token accounting over `sessions`.
#[derive(Clone)]
pub struct SessionRepository {
    db: Arc<Database>,
}

impl SessionRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a session with zero tokens and return it as stored.
    ///
    /// An existing `id` fails with the driver's constraint error.
    pub fn create(&self, id: &str, name: &str) -> Result<Session> {
        self.db.with_handle(|h| Self::create_in(h, id, name))
    }

    /// [`Self::create`] against an explicit handle, e.g. inside a transaction.
    pub fn create_in(h: &Handle<'_>, id: &str, name: &str) -> Result<Session> {
        h.execute(
            "INSERT INTO sessions (id, name) VALUES (?1, ?2)",
            params![id, name],
        )?;

        Self::find_in(h, id)?.ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Get a session by ID
    pub fn find_by_id(&self, id: &str) -> Result<Option<Session>> {
        self.db.with_handle(|h| Self::find_in(h, id))
    }

    pub fn find_in(h: &Handle<'_>, id: &str) -> Result<Option<Session>> {
        h.query_one(
            &format!("{SELECT_SESSION} WHERE id = ?1"),
            [id],
            Self::row_to_session,
        )
    }

    /// All sessions, most recently updated first.
    pub fn find_all(&self) -> Result<Vec<Session>> {
        self.db.query_all(
            &format!("{SELECT_SESSION} ORDER BY updated_at DESC, rowid DESC"),
            [],
            Self::row_to_session,
        )
    }

    /// Apply a partial update and return the row afterwards.
    ///
    /// Only the supplied fields appear in the statement; `updated_at` is
    /// refreshed by a trigger. Returns `None` when `id` does not exist.
    pub fn update(&self, id: &str, update: &SessionUpdate) -> Result<Option<Session>> {
        if update.is_empty() {
            return Err(Error::NoFieldsToUpdate);
        }

        let mut fields = Vec::new();
        let mut values = Vec::new();

        if let Some(name) = &update.name {
            fields.push("name = ?");
            values.push(Value::Text(name.clone()));
        }
        if let Some(total_tokens) = update.total_tokens {
            fields.push("total_tokens = ?");
            values.push(Value::Integer(total_tokens));
        }
        values.push(Value::Text(id.to_string()));

        let sql = format!("UPDATE sessions SET {} WHERE id = ?", fields.join(", "));

        self.db.with_handle(|h| {
            h.execute(&sql, params_from_iter(values))?;
            Self::find_in(h, id)
        })
    }

    /// Delete one session. Its messages go with it through the cascade.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.db.execute("DELETE FROM sessions WHERE id = ?1", [id])
    }

    /// Delete every session and, transitively, every message.
    pub fn delete_all(&self) -> Result<()> {
        self.db.execute("DELETE FROM sessions", [])
    }

    /// Add `delta` (possibly negative) to `total_tokens` in one statement.
    pub fn update_token_count(&self, id: &str, delta: i64) -> Result<()> {
        self.db.with_handle(|h| Self::update_token_count_in(h, id, delta))
    }

    pub fn update_token_count_in(h: &Handle<'_>, id: &str, delta: i64) -> Result<()> {
        h.execute(
            "UPDATE sessions SET total_tokens = total_tokens + ?1 WHERE id = ?2",
            params![delta, id],
        )?;
        Ok(())
    }

    /// Number of sessions.
    pub fn count(&self) -> Result<i64> {
        Ok(self
            .db
            .query_one("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?
            .unwrap_or(0))
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(Session {
            id: row.get("id")?,
            name: row.get("name")?,
            total_tokens: row.get("total_tokens")?,
            created_at: decode_timestamp(3, &created_at)?,
            updated_at: decode_timestamp(4, &updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::DatabaseOptions;
    use std::thread::sleep;
    use std::time::Duration;

    fn repo() -> SessionRepository {
        SessionRepository::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    /// Timestamps have millisecond resolution; keep ordering tests honest.
    fn tick() {
        sleep(Duration::from_millis(5));
    }

    #[test]
    fn test_session_crud() {
        let sessions = repo();

        let created = sessions.create("s1", "First chat").unwrap();
        assert_eq!(created.id, "s1");
        assert_eq!(created.name, "First chat");
        assert_eq!(created.total_tokens, 0);
        assert_eq!(created.created_at, created.updated_at);

        let found = sessions.find_by_id("s1").unwrap().unwrap();
        assert_eq!(found, created);

        sessions.delete("s1").unwrap();
        assert!(sessions.find_by_id("s1").unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_id_fails() {
        let sessions = repo();
        sessions.create("dup", "One").unwrap();

        let err = sessions.create("dup", "Two").unwrap_err();
        assert!(matches!(err, Error::Query { .. }), "got {err:?}");
        assert_eq!(sessions.find_by_id("dup").unwrap().unwrap().name, "One");
    }

    #[test]
    fn test_find_missing_is_none() {
        assert!(repo().find_by_id("nope").unwrap().is_none());
    }

    #[test]
    fn test_find_all_most_recent_first() {
        let sessions = repo();
        sessions.create("old", "Old").unwrap();
        tick();
        sessions.create("new", "New").unwrap();
        tick();

        let ids: Vec<String> = sessions.find_all().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["new", "old"]);

        // Touching the older session moves it to the front
        sessions.update("old", &SessionUpdate::name("Old, renamed")).unwrap();
        let ids: Vec<String> = sessions.find_all().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["old", "new"]);
    }

    #[test]
    fn test_update_touches_only_given_fields() {
        let sessions = repo();
        sessions.create("s1", "Before").unwrap();
        sessions.update_token_count("s1", 12).unwrap();
        let before = sessions.find_by_id("s1").unwrap().unwrap();
        tick();

        let after = sessions
            .update("s1", &SessionUpdate::name("After"))
            .unwrap()
            .unwrap();

        assert_eq!(after.name, "After");
        assert_eq!(after.total_tokens, 12);
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.created_at, before.created_at);
    }

    #[test]
    fn test_update_both_fields() {
        let sessions = repo();
        sessions.create("s1", "Before").unwrap();

        let after = sessions
            .update(
                "s1",
                &SessionUpdate {
                    name: Some("Both".to_string()),
                    total_tokens: Some(99),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(after.name, "Both");
        assert_eq!(after.total_tokens, 99);
    }

    #[test]
    fn test_update_missing_returns_none() {
        let sessions = repo();
        let result = sessions.update("ghost", &SessionUpdate::name("x")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_update_without_fields_issues_no_statement() {
        // A disconnected manager would fail any statement with NotConnected
        let db = Arc::new(Database::new(DatabaseOptions::in_memory()));
        let sessions = SessionRepository::new(db);

        let err = sessions.update("s1", &SessionUpdate::default()).unwrap_err();
        assert!(matches!(err, Error::NoFieldsToUpdate));
    }

    #[test]
    fn test_token_count_accumulates() {
        let sessions = repo();
        sessions.create("s1", "Tokens").unwrap();

        sessions.update_token_count("s1", 50).unwrap();
        sessions.update_token_count("s1", -30).unwrap();

        assert_eq!(sessions.find_by_id("s1").unwrap().unwrap().total_tokens, 20);
    }

    #[test]
    fn test_token_count_cannot_go_negative() {
        let sessions = repo();
        sessions.create("s1", "Tokens").unwrap();

        let err = sessions.update_token_count("s1", -1).unwrap_err();
        assert!(matches!(err, Error::Query { .. }));
        assert_eq!(sessions.find_by_id("s1").unwrap().unwrap().total_tokens, 0);
    }

    #[test]
    fn test_delete_all() {
        let sessions = repo();
        sessions.create("a", "A").unwrap();
        sessions.create("b", "B").unwrap();
        assert_eq!(sessions.count().unwrap(), 2);

        sessions.delete_all().unwrap();
        assert_eq!(sessions.count().unwrap(), 0);
        assert!(sessions.find_all().unwrap().is_empty());
    }
}
