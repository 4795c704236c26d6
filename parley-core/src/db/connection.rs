//! Connection manager
//!
//! Owns the single SQLite handle for the process. Repositories borrow the
//! manager through an `Arc` and never open or close the file themselves.
//!
//! All statements run through [`Handle`], a thin executor bound to the live
//! connection. [`Database::transaction`] hands the closure a `Handle` that has
//! no `transaction` method of its own, so nested transactions cannot be
//! expressed.

use crate::db::migrate::{AppliedMigration, MigrationSource, Migrator};
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Params, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A file on disk; its parent directory is created on connect
    File(PathBuf),
    /// A private in-memory database (tests, dry runs)
    Memory,
}

/// Construction-time options for [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Database file location
    pub location: Location,
    /// Where migration definitions come from
    pub migrations: MigrationSource,
    /// Whether `reset()` may drop the schema. Must be `false` in production.
    pub allow_destructive_reset: bool,
}

impl DatabaseOptions {
    /// Options for a file-backed database with the embedded migrations.
    ///
    /// Destructive reset is disabled; enable it explicitly for development.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::File(path.into()),
            migrations: MigrationSource::Embedded,
            allow_destructive_reset: false,
        }
    }

    /// Options for an in-memory database with reset allowed.
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            migrations: MigrationSource::Embedded,
            allow_destructive_reset: true,
        }
    }

    /// Use migration definitions from a different source.
    pub fn with_migrations(mut self, migrations: MigrationSource) -> Self {
        self.migrations = migrations;
        self
    }

    /// Set whether `reset()` is permitted.
    pub fn allow_destructive_reset(mut self, allow: bool) -> Self {
        self.allow_destructive_reset = allow;
        self
    }
}

/// Statement executor bound to a live connection.
pub struct Handle<'c> {
    conn: &'c Connection,
}

impl<'c> Handle<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Run a mutating statement, returning the number of affected rows.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        tracing::trace!(sql = sql.trim(), "execute");
        self.conn
            .execute(sql, params)
            .map_err(|e| Error::query(sql, e))
    }

    /// Run one or more statements without parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| Error::query(sql, e))
    }

    /// Fetch at most one row. No row is `Ok(None)`, not an error.
    pub fn query_one<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.conn
            .query_row(sql, params, map)
            .optional()
            .map_err(|e| Error::query(sql, e))
    }

    /// Fetch every row in the order the statement produces them.
    pub fn query_all<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql).map_err(|e| Error::query(sql, e))?;
        let rows = stmt
            .query_map(params, map)
            .map_err(|e| Error::query(sql, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::query(sql, e))
    }
}

/// Run `f` inside `BEGIN`/`COMMIT`, rolling back if it fails.
///
/// The original error is returned after rollback. A rollback failure is
/// logged but never masks the error that caused it.
pub(crate) fn with_transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Handle<'_>) -> Result<T>,
{
    let tx = conn.transaction().map_err(|e| Error::query("BEGIN", e))?;

    let result = f(&Handle::new(&tx));

    match result {
        Ok(value) => {
            tx.commit().map_err(|e| Error::query("COMMIT", e))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                tracing::error!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

/// The process-wide database resource.
///
/// Lifecycle is explicit: construct with [`Database::new`], bring it up with
/// [`Database::connect`] (which also migrates), and release it with
/// [`Database::close`]. Statements are serialized by an internal mutex.
pub struct Database {
    options: DatabaseOptions,
    conn: Mutex<Option<Connection>>,
}

impl Database {
    /// Create an unconnected manager.
    pub fn new(options: DatabaseOptions) -> Self {
        Self {
            options,
            conn: Mutex::new(None),
        }
    }

    /// Construct and connect in one step.
    pub fn open(options: DatabaseOptions) -> Result<Self> {
        let db = Self::new(options);
        db.connect()?;
        Ok(db)
    }

    /// Open an in-memory database with the embedded schema (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(DatabaseOptions::in_memory())
    }

    /// The options this manager was built with.
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// Database file path, or `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        match &self.options.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    /// Whether a live handle is held.
    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// Open the database and bring the schema to the latest version.
    ///
    /// No-op when already connected. If migrating fails the freshly opened
    /// handle is dropped and the error is returned, so a failed migration
    /// never leaves a half-ready connection behind.
    pub fn connect(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }

        let mut conn = match &self.options.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| Error::connection(path, e))?;
                }
                let conn = Connection::open(path).map_err(|e| Error::connection(path, e))?;
                conn.execute_batch(
                    "
                    PRAGMA foreign_keys = ON;
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    ",
                )
                .map_err(|e| Error::connection(path, e))?;
                conn
            }
            Location::Memory => {
                let conn =
                    Connection::open_in_memory().map_err(|e| Error::connection(":memory:", e))?;
                conn.execute_batch("PRAGMA foreign_keys = ON;")
                    .map_err(|e| Error::connection(":memory:", e))?;
                conn
            }
        };

        tracing::info!(location = ?self.options.location, "Connected to database");

        self.migrator().migrate(&mut conn)?;

        *guard = Some(conn);
        Ok(())
    }

    /// Release the handle. No-op when not connected.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock();
        let Some(conn) = guard.take() else {
            return Ok(());
        };

        conn.close().map_err(|(_, source)| Error::Query {
            sql: "CLOSE".to_string(),
            source,
        })?;
        tracing::info!("Database connection closed");
        Ok(())
    }

    /// Run a mutating statement.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<()> {
        self.with_handle(|h| h.execute(sql, params).map(|_| ()))
    }

    /// Fetch at most one row.
    pub fn query_one<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_handle(|h| h.query_one(sql, params, map))
    }

    /// Fetch zero or more rows, in statement order.
    pub fn query_all<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_handle(|h| h.query_all(sql, params, map))
    }

    /// Run `f` against the live connection outside any explicit transaction.
    pub fn with_handle<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Handle<'_>) -> Result<T>,
    {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(Error::NotConnected)?;
        f(&Handle::new(conn))
    }

    /// Run `f` atomically: commit on `Ok`, roll back and re-raise on `Err`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Handle<'_>) -> Result<T>,
    {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;
        with_transaction(conn, f)
    }

    /// Most recently applied schema version, `None` if never migrated.
    pub fn current_version(&self) -> Result<Option<String>> {
        self.with_handle(Migrator::current_version)
    }

    /// Applied migrations, oldest first.
    pub fn migration_history(&self) -> Result<Vec<AppliedMigration>> {
        self.with_handle(Migrator::history)
    }

    /// Apply any pending migrations, returning how many ran.
    ///
    /// `connect()` already does this; calling it again is a no-op unless
    /// new migrations appeared since.
    pub fn migrate(&self) -> Result<usize> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;
        self.migrator().migrate(conn)
    }

    /// Drop every table and rebuild the schema from scratch.
    ///
    /// Refused with [`Error::ForbiddenOperation`] unless the manager was built
    /// with `allow_destructive_reset`; the check runs before any statement.
    pub fn reset(&self) -> Result<usize> {
        if !self.options.allow_destructive_reset {
            return Err(Error::ForbiddenOperation(
                "database reset is not allowed in production".to_string(),
            ));
        }

        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;
        self.migrator().reset(conn)
    }

    fn migrator(&self) -> Migrator {
        Migrator::new(
            self.options.migrations.clone(),
            self.options.allow_destructive_reset,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panic inside a transaction closure drops the rusqlite Transaction,
        // which rolls back, so the connection itself is still consistent.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to close database on drop");
        }
    }
}
