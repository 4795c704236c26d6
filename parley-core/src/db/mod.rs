//! Database layer for parley
//!
//! This module provides the storage layer using SQLite with:
//! - A connection manager owning the single handle and its transactions
//! - Versioned schema migrations with an applied-version log
//! - Repositories for sessions and messages

pub mod codec;
pub mod connection;
pub mod messages;
pub mod migrate;
pub mod sessions;

pub use connection::{Database, DatabaseOptions, Handle, Location};
pub use messages::MessageRepository;
pub use migrate::{AppliedMigration, Migration, MigrationSource, MigrationVersion, Migrator};
pub use sessions::SessionRepository;
