//! Integration tests for parley's storage and chat pipeline
//!
//! These tests run against file-backed databases in temporary directories,
//! a scripted provider, and a mock Anthropic endpoint.

use async_trait::async_trait;
use parley_core::config::{ClaudeConfig, Environment, FileConfig};
use parley_core::db::{Database, DatabaseOptions, MessageRepository, MigrationSource};
use parley_core::{
    ChatMessage, ChatService, ClaudeProvider, Config, Error, LlmProvider, MessageFilter,
    NewMessage, ProviderError, ProviderResponse, Role, SendMessageRequest, SessionRepository,
};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Replies with a numbered echo and a fixed token count.
struct EchoProvider {
    calls: Mutex<usize>,
}

impl EchoProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(0),
        })
    }
}

#[async_trait]
impl LlmProvider for EchoProvider {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ProviderResponse, ProviderError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(ProviderResponse {
            content: format!("echo {}: {}", calls, last),
            token_count: 10,
        })
    }
}

fn file_db(dir: &Path) -> Arc<Database> {
    Arc::new(Database::open(DatabaseOptions::file(dir.join("data").join("chat.db"))).unwrap())
}

fn write_migration(dir: &Path, name: &str, sql: &str) {
    std::fs::write(dir.join(name), sql).unwrap();
}

// ============================================
// Storage
// ============================================

#[test]
fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let db = file_db(dir.path());
        let sessions = SessionRepository::new(db.clone());
        let messages = MessageRepository::new(db.clone());
        sessions.create("s1", "Persistent").unwrap();
        messages
            .create(&NewMessage::new("m1", "s1", Role::User, "remember me"))
            .unwrap();
        sessions.update_token_count("s1", 42).unwrap();
        db.close().unwrap();
    }

    let db = file_db(dir.path());
    assert_eq!(db.current_version().unwrap().as_deref(), Some("v1_003"));
    assert_eq!(db.migration_history().unwrap().len(), 3);

    let session = SessionRepository::new(db.clone())
        .find_by_id("s1")
        .unwrap()
        .unwrap();
    assert_eq!(session.total_tokens, 42);

    let messages = MessageRepository::new(db).find_by_session_id("s1").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "remember me");
}

#[test]
fn test_directory_migrations_apply_incrementally() {
    let dir = TempDir::new().unwrap();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    write_migration(
        &migrations,
        "v1_001_notes.sql",
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);",
    );
    write_migration(&migrations, "README.md", "not a migration");

    let options = DatabaseOptions::file(dir.path().join("notes.db"))
        .with_migrations(MigrationSource::Directory(migrations.clone()));

    let db = Database::open(options.clone()).unwrap();
    assert_eq!(db.current_version().unwrap().as_deref(), Some("v1_001"));
    db.execute("INSERT INTO notes (body) VALUES (?1)", ["first"])
        .unwrap();
    db.close().unwrap();

    write_migration(
        &migrations,
        "v1_002_note_tags.sql",
        "ALTER TABLE notes ADD COLUMN tag TEXT;",
    );

    let db = Database::open(options).unwrap();
    assert_eq!(db.current_version().unwrap().as_deref(), Some("v1_002"));
    let tagged: Option<String> = db
        .query_one("SELECT tag FROM notes WHERE body = ?1", ["first"], |r| {
            r.get(0)
        })
        .unwrap()
        .unwrap();
    assert_eq!(tagged, None);
}

#[test]
fn test_failed_migration_blocks_open() {
    let dir = TempDir::new().unwrap();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    write_migration(&migrations, "v1_001_ok.sql", "CREATE TABLE ok (id INTEGER);");
    write_migration(&migrations, "v1_002_broken.sql", "CREATE TABLE nope (;");

    let options = DatabaseOptions::file(dir.path().join("broken.db"))
        .with_migrations(MigrationSource::Directory(migrations));

    let err = Database::open(options.clone()).err().unwrap();
    match err {
        Error::MigrationFailed { version, .. } => assert_eq!(version, "v1_002"),
        other => panic!("expected MigrationFailed, got {other:?}"),
    }

    // The first migration stayed applied
    let raw = rusqlite::Connection::open(dir.path().join("broken.db")).unwrap();
    let version: String = raw
        .query_row(
            "SELECT version FROM schema_version ORDER BY applied_at DESC, rowid DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(version, "v1_001");
}

#[test]
fn test_production_config_forbids_reset() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.database.path = Some(dir.path().join("prod.db"));

    let db = Arc::new(Database::open(config.database_options()).unwrap());
    SessionRepository::new(db.clone())
        .create("keep", "Keep me")
        .unwrap();

    assert!(matches!(db.reset(), Err(Error::ForbiddenOperation(_))));
    assert!(SessionRepository::new(db.clone())
        .find_by_id("keep")
        .unwrap()
        .is_some());
    db.close().unwrap();

    config.app.environment = Environment::Development;
    let db = Arc::new(Database::open(config.database_options()).unwrap());
    assert_eq!(db.reset().unwrap(), 3);
    assert_eq!(SessionRepository::new(db).count().unwrap(), 0);
}

// ============================================
// Chat flow
// ============================================

#[tokio::test]
async fn test_chat_flow_with_compaction() {
    let dir = TempDir::new().unwrap();
    let db = file_db(dir.path());
    let service = ChatService::new(db.clone(), Some(EchoProvider::new() as Arc<dyn LlmProvider>));

    let first = service
        .send_message(SendMessageRequest {
            message: "Plan the migration layer".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let session_id = first.session_id.clone();

    for turn in ["add sessions", "add messages", "add indexes"] {
        service
            .send_message(SendMessageRequest {
                message: turn.to_string(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let conversation = service.get_session(&session_id).unwrap().unwrap();
    assert_eq!(conversation.session.name, "Plan the migration layer");
    assert_eq!(conversation.session.total_tokens, 40);
    assert_eq!(conversation.messages.len(), 8);

    let summary = service
        .compact_session(&session_id, 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.original_message_ids.as_ref().unwrap().len(), 6);

    let conversation = service.get_session(&session_id).unwrap().unwrap();
    assert_eq!(conversation.messages.len(), 3);
    assert!(conversation.messages[0].is_summary);
    assert_eq!(conversation.session.total_tokens, 50);

    let tombstones = MessageRepository::new(db.clone())
        .search(&MessageFilter {
            is_deleted: Some(true),
            ..MessageFilter::session(session_id.clone())
        })
        .unwrap();
    assert_eq!(tombstones.len(), 6);

    // Deleting the session takes every message with it
    assert!(service.delete_session(&session_id).unwrap());
    let leftovers = MessageRepository::new(db)
        .search(&MessageFilter::session(session_id))
        .unwrap();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_chat_through_claude_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "Hello from the mock" }],
            "usage": { "input_tokens": 3, "output_tokens": 6 }
        })))
        .mount(&server)
        .await;

    let claude = ClaudeConfig {
        endpoint: server.uri(),
        ..Default::default()
    };
    let provider =
        ClaudeProvider::with_api_key(&claude, &FileConfig::default(), "sk-test").unwrap();

    let db = Arc::new(Database::open_in_memory().unwrap());
    let service = ChatService::new(db, Some(Arc::new(provider) as Arc<dyn LlmProvider>));

    let response = service
        .send_message(SendMessageRequest {
            message: "Hi".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(response.response, "Hello from the mock");
    assert_eq!(response.token_count, 6);
    assert_eq!(response.total_tokens, 6);
    assert_eq!(service.session_count().unwrap(), 1);
}

#[tokio::test]
async fn test_follow_up_after_attachment_is_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "Noted" }],
            "usage": { "output_tokens": 2 }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let notes = dir.path().join("notes.md");
    std::fs::write(&notes, "ship on friday").unwrap();

    let claude = ClaudeConfig {
        endpoint: server.uri(),
        ..Default::default()
    };
    let provider =
        ClaudeProvider::with_api_key(&claude, &FileConfig::default(), "sk-test").unwrap();
    let service = ChatService::new(
        file_db(dir.path()),
        Some(Arc::new(provider) as Arc<dyn LlmProvider>),
    );

    let first = service
        .send_message(SendMessageRequest {
            message: "Read my notes".to_string(),
            file_paths: vec![notes.to_string_lossy().into_owned()],
            ..Default::default()
        })
        .await
        .unwrap();

    std::fs::remove_file(&notes).unwrap();

    service
        .send_message(SendMessageRequest {
            message: "Summarize them".to_string(),
            session_id: Some(first.session_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let first_body: serde_json::Value = requests[0].body_json().unwrap();
    let first_blocks = first_body["messages"][0]["content"].as_array().unwrap();
    assert_eq!(first_blocks.len(), 2);
    assert!(first_blocks[1]["text"]
        .as_str()
        .unwrap()
        .contains("ship on friday"));

    // The replayed turn is the same text whether or not the file still exists
    let second_body: serde_json::Value = requests[1].body_json().unwrap();
    let turns = second_body["messages"].as_array().unwrap();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0]["content"].as_array().unwrap().len(), 1);
    assert_eq!(turns[0]["content"][0]["text"], "Read my notes");
}
