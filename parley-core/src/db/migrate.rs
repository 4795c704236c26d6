//! Schema migrations
//!
//! Migrations are plain SQL files named `v<major>_<seq>_<description>.sql`.
//! The `v<major>_<seq>` prefix is the version token. Tokens are compared as
//! strings, so sequence numbers must be zero-padded to a fixed width; a set
//! whose string order disagrees with its numeric order is rejected at load.
//!
//! Applied versions are appended to `schema_version`. Each migration runs in
//! its own transaction together with its log entry, so a failing migration
//! leaves no trace while earlier ones stay applied. Migration bodies must not
//! contain their own `BEGIN`/`COMMIT`.

use crate::db::connection::{with_transaction, Handle};
use crate::error::{Error, Result};
use regex::Regex;
use rusqlite::Connection;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Migrations compiled into the binary.
const EMBEDDED: &[(&str, &str)] = &[
    (
        "v1_001_create_sessions.sql",
        include_str!("../../migrations/v1_001_create_sessions.sql"),
    ),
    (
        "v1_002_create_messages.sql",
        include_str!("../../migrations/v1_002_create_messages.sql"),
    ),
    (
        "v1_003_message_indexes.sql",
        include_str!("../../migrations/v1_003_message_indexes.sql"),
    ),
];

/// Migration log owned by the engine, created alongside the first migration.
const SCHEMA_VERSION_DDL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version    TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
";

/// Domain tables dropped by `reset()`, children first.
const DOMAIN_TABLES: &[&str] = &["messages", "sessions"];

fn filename_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(v(\d+)_(\d+))_.*\.sql$").expect("migration filename pattern is valid")
    })
}

/// Where migration definitions are read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MigrationSource {
    /// The SQL files shipped in `parley-core/migrations/`
    #[default]
    Embedded,
    /// Every matching file in a directory, read at migrate time
    Directory(PathBuf),
}

/// A version token such as `v1_001`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationVersion {
    token: String,
    major: u64,
    seq: u64,
}

impl MigrationVersion {
    /// Extract the version token from a migration file name.
    ///
    /// Returns `None` for names that do not follow the naming pattern.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let caps = filename_pattern().captures(filename)?;
        Some(Self {
            token: caps[1].to_string(),
            major: caps[2].parse().ok()?,
            seq: caps[3].parse().ok()?,
        })
    }

    /// The token text, e.g. `"v1_001"`
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// The `(major, seq)` pair the token encodes.
    pub fn numeric(&self) -> (u64, u64) {
        (self.major, self.seq)
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token.cmp(&other.token)
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// One migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: MigrationVersion,
    pub filename: String,
    pub content: String,
}

/// Row from the migration log.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: String,
    pub applied_at: String,
}

/// Discovers and applies migrations.
#[derive(Debug, Clone)]
pub struct Migrator {
    source: MigrationSource,
    allow_destructive_reset: bool,
}

impl Migrator {
    pub fn new(source: MigrationSource, allow_destructive_reset: bool) -> Self {
        Self {
            source,
            allow_destructive_reset,
        }
    }

    /// Most recently applied version, or `None` if nothing was ever applied.
    pub fn current_version(h: &Handle<'_>) -> Result<Option<String>> {
        if !Self::log_exists(h)? {
            return Ok(None);
        }

        h.query_one(
            "SELECT version FROM schema_version ORDER BY applied_at DESC, rowid DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
    }

    /// Every applied migration, oldest first.
    pub fn history(h: &Handle<'_>) -> Result<Vec<AppliedMigration>> {
        if !Self::log_exists(h)? {
            return Ok(Vec::new());
        }

        h.query_all(
            "SELECT version, applied_at FROM schema_version ORDER BY applied_at ASC, rowid ASC",
            [],
            |r| {
                Ok(AppliedMigration {
                    version: r.get(0)?,
                    applied_at: r.get(1)?,
                })
            },
        )
    }

    fn log_exists(h: &Handle<'_>) -> Result<bool> {
        let count: Option<i64> = h.query_one(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |r| r.get(0),
        )?;
        Ok(count.unwrap_or(0) > 0)
    }

    /// List migrations in ascending version order.
    ///
    /// Files that do not match the naming pattern are skipped silently. A
    /// missing directory yields an empty list.
    pub fn load_migrations(&self) -> Result<Vec<Migration>> {
        let mut migrations = match &self.source {
            MigrationSource::Embedded => EMBEDDED
                .iter()
                .filter_map(|(filename, content)| {
                    MigrationVersion::from_filename(filename).map(|version| Migration {
                        version,
                        filename: (*filename).to_string(),
                        content: (*content).to_string(),
                    })
                })
                .collect(),
            MigrationSource::Directory(dir) => Self::read_dir(dir)?,
        };

        migrations.sort_by(|a, b| a.version.cmp(&b.version));

        for pair in migrations.windows(2) {
            let (prev, next) = (&pair[0].version, &pair[1].version);
            if prev == next {
                return Err(Error::InvalidMigration(format!(
                    "duplicate version {prev} ({} and {})",
                    pair[0].filename, pair[1].filename
                )));
            }
            if prev.numeric() >= next.numeric() {
                return Err(Error::InvalidMigration(format!(
                    "{prev} sorts before {next} as text but not as numbers; zero-pad the sequence"
                )));
            }
        }

        Ok(migrations)
    }

    fn read_dir(dir: &Path) -> Result<Vec<Migration>> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "Migration directory does not exist");
            return Ok(Vec::new());
        }

        let mut migrations = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = MigrationVersion::from_filename(&filename) else {
                continue;
            };
            let content = std::fs::read_to_string(entry.path())?;
            migrations.push(Migration {
                version,
                filename,
                content,
            });
        }
        Ok(migrations)
    }

    /// Apply every migration newer than the current version, in order.
    ///
    /// Returns the number of migrations applied. Stops at the first failure
    /// with [`Error::MigrationFailed`].
    pub fn migrate(&self, conn: &mut Connection) -> Result<usize> {
        let current = Self::current_version(&Handle::new(conn))?;
        let migrations = self.load_migrations()?;

        let pending: Vec<&Migration> = migrations
            .iter()
            .filter(|m| match current.as_deref() {
                Some(current) => m.version.as_str() > current,
                None => true,
            })
            .collect();

        tracing::info!(
            current_version = current.as_deref().unwrap_or("none"),
            pending = pending.len(),
            "Checking database migrations"
        );

        if pending.is_empty() {
            return Ok(0);
        }

        for migration in &pending {
            Self::apply(conn, migration)?;
        }

        tracing::info!(
            from = current.as_deref().unwrap_or("none"),
            to = %pending[pending.len() - 1].version,
            "Migrations complete"
        );

        Ok(pending.len())
    }

    fn apply(conn: &mut Connection, migration: &Migration) -> Result<()> {
        tracing::info!(
            version = %migration.version,
            file = %migration.filename,
            "Running migration"
        );

        with_transaction(conn, |tx| {
            tx.execute_batch(SCHEMA_VERSION_DDL)?;
            tx.execute_batch(&migration.content)?;
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version.as_str()],
            )?;
            Ok(())
        })
        .map_err(|source| {
            tracing::error!(version = %migration.version, error = %source, "Migration failed");
            Error::MigrationFailed {
                version: migration.version.to_string(),
                source: Box::new(source),
            }
        })
    }

    /// Drop all domain tables and the log, then migrate from scratch.
    ///
    /// Refused before any statement runs unless destructive reset is allowed.
    pub fn reset(&self, conn: &mut Connection) -> Result<usize> {
        if !self.allow_destructive_reset {
            return Err(Error::ForbiddenOperation(
                "database reset is not allowed in production".to_string(),
            ));
        }

        tracing::warn!("Resetting database");

        with_transaction(conn, |tx| {
            for table in DOMAIN_TABLES.iter().chain(["schema_version"].iter()) {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
            }
            Ok(())
        })?;

        self.migrate(conn)
    }
}
