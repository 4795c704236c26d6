//! # parley-core
//!
//! Core library for parley - a chat client for hosted LLMs that keeps its
//! conversation history in a local SQLite database.
//!
//! This library provides:
//! - Domain types for sessions and messages
//! - Database storage layer with SQLite and versioned migrations
//! - An LLM provider seam with an Anthropic Messages API client
//! - The chat service a front end drives
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parley_core::{ChatService, ClaudeProvider, Config, Database, LlmProvider};
//!
//! # async fn run() -> parley_core::Result<()> {
//! let config = Config::load()?;
//!
//! // Opening the database runs any pending migrations
//! let db = Arc::new(Database::open(config.database_options())?);
//! let provider: Arc<dyn LlmProvider> = Arc::new(ClaudeProvider::from_config(&config)?);
//! let chat = ChatService::new(db, Some(provider));
//!
//! let reply = chat
//!     .send_message(parley_core::SendMessageRequest {
//!         message: "Hello!".to_string(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("{}", reply.response);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{Database, DatabaseOptions, MessageRepository, MigrationSource, SessionRepository};
pub use error::{Error, Result};
pub use provider::{ChatMessage, ClaudeProvider, LlmProvider, ProviderError, ProviderResponse};
pub use service::{ChatService, Conversation, SendMessageRequest, SendMessageResponse};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod provider;
pub mod service;
pub mod types;
