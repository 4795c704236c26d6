//! parley - chat with hosted LLMs from the terminal
//!
//! Every exchange is stored in a local SQLite database so conversations can
//! be continued, renamed, compacted and deleted later.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/parley/chat.db (~/.local/share/parley/chat.db)
//! - Config: $XDG_CONFIG_HOME/parley/config.toml (~/.config/parley/config.toml)
//! - Logs: $XDG_STATE_HOME/parley/ (~/.local/state/parley/)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use parley_core::{
    ChatService, ClaudeProvider, Config, Database, LlmProvider, ProviderError,
    SendMessageRequest,
};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Chat with Claude and keep the history locally")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Chat(ChatCommand),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Inspect or reset the database schema
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Subcommand)]
enum ChatCommand {
    /// Send a message, starting a new session unless one is given
    Send {
        /// Message text
        message: String,

        /// Continue this session
        #[arg(short, long)]
        session: Option<String>,

        /// Attach a file (repeatable)
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// Project context file prepended to the message (default: from config)
        #[arg(long)]
        context: Option<PathBuf>,
    },

    /// List sessions, most recently active first
    Sessions,

    /// Show a session and its messages
    Show {
        session_id: String,

        /// Include message IDs
        #[arg(short, long)]
        verbose: bool,
    },

    /// Rename a session
    Rename { session_id: String, name: String },

    /// Delete a session, or with --message a single message
    Delete {
        id: String,

        /// Treat the ID as a message ID and hide that message
        #[arg(short, long)]
        message: bool,
    },

    /// Delete every session
    Clear {
        /// Skip the confirmation guard
        #[arg(short, long)]
        yes: bool,
    },

    /// Replace older messages of a session with a summary
    Compact {
        session_id: String,

        /// Number of most recent messages to keep verbatim
        #[arg(short, long, default_value_t = 10)]
        keep: u32,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Check that the configuration can be used to chat
    Validate,
    /// Print file locations
    Path,
    /// Change one setting (e.g. `claude.model`) and save the config file
    Set {
        /// Dotted key, `section.field`
        key: String,
        value: String,
    },
}

#[derive(Subcommand)]
enum DbCommand {
    /// Print the schema version and migration history
    Version,
    /// Drop all data and rebuild the schema (development only)
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        parley_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match args.command {
        Command::Chat(command) => run_chat(&config, command).await,
        Command::Config { command } => run_config(&config, &command),
        Command::Db { command } => run_db(&config, &command),
    }
}

/// Open the database, running pending migrations
fn open_database(config: &Config) -> Result<Arc<Database>> {
    let db_path = config.database_path();
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(config.database_options()).context("failed to open database")?;
    Ok(Arc::new(db))
}

/// Absolute form of an attachment path, so the stored record stays
/// meaningful from any working directory. Missing files are kept as given.
fn attachment_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

async fn run_chat(config: &Config, command: ChatCommand) -> Result<()> {
    let db = open_database(config)?;

    let provider: Option<Arc<dyn LlmProvider>> = match ClaudeProvider::from_config(config) {
        Ok(provider) => Some(Arc::new(provider)),
        Err(ProviderError::NotConfigured) => None,
        Err(e) => return Err(e).context("failed to create Claude client"),
    };
    let chat = ChatService::new(db, provider);

    match command {
        ChatCommand::Send {
            message,
            session,
            files,
            context,
        } => {
            let response = chat
                .send_message(SendMessageRequest {
                    message,
                    file_paths: files.iter().map(|p| attachment_path(p)).collect(),
                    session_id: session,
                    context_file_path: context.or_else(|| config.app.context_file_path.clone()),
                })
                .await
                .context("failed to send message")?;

            println!("{}", response.response);
            println!();
            println!(
                "[session {} | {} tokens, {} total]",
                response.session_id, response.token_count, response.total_tokens
            );
        }

        ChatCommand::Sessions => {
            let sessions = chat.list_sessions()?;
            if sessions.is_empty() {
                println!("No sessions yet.");
                return Ok(());
            }
            for session in sessions {
                println!(
                    "{}  {}  {:>7} tokens  {}",
                    session.id,
                    session
                        .updated_at
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M"),
                    session.total_tokens,
                    session.name
                );
            }
        }

        ChatCommand::Show {
            session_id,
            verbose,
        } => {
            let conversation = chat
                .get_session(&session_id)?
                .with_context(|| format!("no session found with ID '{}'", session_id))?;

            println!("{}", conversation.session.name);
            println!(
                "Created {} | {} tokens | {} messages",
                conversation
                    .session
                    .created_at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M"),
                conversation.session.total_tokens,
                conversation.messages.len()
            );

            for message in &conversation.messages {
                println!();
                let label = if message.is_summary {
                    "summary".to_string()
                } else {
                    message.role.to_string()
                };
                if verbose {
                    println!("[{}] {}", label, message.id);
                } else {
                    println!("[{}]", label);
                }
                println!("{}", message.content);
                for path in message.file_paths.iter().flatten() {
                    println!("  attached: {}", path);
                }
            }
        }

        ChatCommand::Rename { session_id, name } => {
            let session = chat.rename_session(&session_id, &name)?;
            println!("Renamed {} to \"{}\"", session.id, session.name);
        }

        ChatCommand::Delete { id, message } => {
            if message {
                chat.delete_message(&id)?;
                println!("Deleted message {}", id);
            } else if chat.delete_session(&id)? {
                println!("Deleted session {}", id);
            } else {
                anyhow::bail!("no session found with ID '{}'", id);
            }
        }

        ChatCommand::Clear { yes } => {
            if !yes {
                anyhow::bail!(
                    "refusing to delete {} session(s) without --yes",
                    chat.session_count()?
                );
            }
            let count = chat.session_count()?;
            chat.clear_all_sessions()?;
            println!("Deleted {} session(s)", count);
        }

        ChatCommand::Compact { session_id, keep } => {
            match chat
                .compact_session(&session_id, keep)
                .await
                .context("failed to compact session")?
            {
                Some(summary) => println!(
                    "Compacted {} message(s) into summary {}",
                    summary.original_message_ids.map(|ids| ids.len()).unwrap_or(0),
                    summary.id
                ),
                None => println!("Nothing to compact (keeping the last {} messages)", keep),
            }
        }
    }

    Ok(())
}

fn run_db(config: &Config, command: &DbCommand) -> Result<()> {
    let db = open_database(config)?;

    match command {
        DbCommand::Version => {
            match db.current_version()? {
                Some(version) => println!("Schema version: {}", version),
                None => println!("Schema version: none"),
            }
            for applied in db.migration_history()? {
                println!("  {}  applied {}", applied.version, applied.applied_at);
            }
        }
        DbCommand::Reset => {
            let applied = db.reset().context("failed to reset database")?;
            println!("Database reset; applied {} migration(s)", applied);
        }
    }

    Ok(())
}

fn run_config(config: &Config, command: &ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            println!("[claude]");
            println!("  model:         {}", config.claude.model);
            println!("  max_tokens:    {}", config.claude.max_tokens);
            println!("  temperature:   {}", config.claude.temperature);
            println!("  endpoint:      {}", config.claude.endpoint);
            println!(
                "  api_key:       {}",
                if config.claude.api_key().is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
            println!("[app]");
            println!("  environment:   {:?}", config.app.environment);
            if let Some(path) = &config.app.context_file_path {
                println!("  context_file:  {}", path.display());
            }
            println!("[database]");
            println!("  path:          {}", config.database_path().display());
            match &config.database.migrations_dir {
                Some(dir) => println!("  migrations:    {}", dir.display()),
                None => println!("  migrations:    built-in"),
            }
            println!("[file]");
            println!("  max_file_size: {}", config.file.max_file_size);
            println!("  allowed:       {}", config.file.allowed_file_types.join(" "));
        }
        ConfigCommand::Validate => {
            let report = config.validate();
            if report.is_valid {
                println!("Configuration is valid");
            } else {
                for error in &report.errors {
                    println!("error: {}", error);
                }
                anyhow::bail!("configuration has {} problem(s)", report.errors.len());
            }
        }
        ConfigCommand::Path => {
            println!("config:   {}", Config::config_path().display());
            println!("database: {}", config.database_path().display());
            println!("logs:     {}", Config::state_dir().display());
        }
        ConfigCommand::Set { key, value } => {
            let mut updated = config.clone();
            updated.set(key, value)?;
            if updated.claude.api_key.is_some() {
                eprintln!(
                    "warning: claude.api_key is not written back; use {} instead",
                    parley_core::config::API_KEY_ENV
                );
            }
            updated.save().context("failed to save configuration")?;
            println!("Set {} = {}", key, value);
        }
    }
    Ok(())
}
