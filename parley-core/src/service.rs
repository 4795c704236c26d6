//! Chat orchestration
//!
//! [`ChatService`] is the request/response surface a front end drives. It
//! replays stored history to the provider, persists both sides of every
//! exchange atomically, and runs the compaction workflow.

use crate::db::{Database, MessageRepository, SessionRepository};
use crate::error::{Error, Result};
use crate::provider::{ChatMessage, LlmProvider, ProviderError};
use crate::types::{Message, NewMessage, Role, Session, SessionUpdate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Longest generated session title, ellipsis included
const MAX_TITLE_CHARS: usize = 50;
const DEFAULT_TITLE: &str = "New Chat";

const SUMMARY_INSTRUCTIONS: &str = "Summarize the conversation below so it can replace the \
original messages as context for the rest of the chat. Keep facts, decisions, open questions \
and any code or file names that were discussed. Reply with the summary only.";

/// Input to [`ChatService::send_message`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(default)]
    pub file_paths: Vec<String>,
    /// Continue this session; `None` starts a new one
    pub session_id: Option<String>,
    /// Project context prepended to this turn
    pub context_file_path: Option<PathBuf>,
}

/// Output of [`ChatService::send_message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub response: String,
    pub session_id: String,
    /// Tokens used by this reply
    pub token_count: i64,
    /// Session total after this reply
    pub total_tokens: i64,
}

/// A session together with its live messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub session: Session,
    /// Summaries first, then the remaining messages in creation order
    pub messages: Vec<Message>,
}

pub struct ChatService {
    db: Arc<Database>,
    sessions: SessionRepository,
    messages: MessageRepository,
    provider: Option<Arc<dyn LlmProvider>>,
}

impl ChatService {
    pub fn new(db: Arc<Database>, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            sessions: SessionRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            db,
            provider,
        }
    }

    fn provider(&self) -> Result<&Arc<dyn LlmProvider>> {
        self.provider
            .as_ref()
            .ok_or(Error::Provider(ProviderError::NotConfigured))
    }

    /// Send one user turn and persist the exchange.
    ///
    /// Nothing is written unless the provider answers; a new session only
    /// comes into existence together with its first exchange.
    ///
    /// Attachments are read for the turn they arrive with. Stored messages
    /// keep their `file_paths` as a record, but replayed history is text
    /// only, so later turns never depend on those files still existing.
    pub async fn send_message(&self, request: SendMessageRequest) -> Result<SendMessageResponse> {
        let provider = self.provider()?;

        let (session_id, new_title, history) = match &request.session_id {
            Some(id) => {
                if self.sessions.find_by_id(id)?.is_none() {
                    return Err(Error::SessionNotFound(id.clone()));
                }
                let history = self.messages.find_by_session_id(id)?;
                (id.clone(), None, history)
            }
            None => (
                Uuid::new_v4().to_string(),
                Some(generate_session_title(&request.message)),
                Vec::new(),
            ),
        };

        let mut outgoing: Vec<ChatMessage> = summaries_first(history)
            .into_iter()
            .map(|m| ChatMessage::new(m.role, m.content))
            .collect();

        let context = match &request.context_file_path {
            Some(path) => load_context(path).await,
            None => String::new(),
        };
        let file_paths = (!request.file_paths.is_empty()).then(|| request.file_paths.clone());
        outgoing.push(ChatMessage {
            role: Role::User,
            content: format!("{context}{}", request.message),
            file_paths: file_paths.clone(),
        });

        let reply = provider.send_message(&outgoing).await?;

        let session = self.db.transaction(|tx| {
            if let Some(title) = &new_title {
                SessionRepository::create_in(tx, &session_id, title)?;
            }

            let mut user = NewMessage::new(
                Uuid::new_v4().to_string(),
                &session_id,
                Role::User,
                &request.message,
            );
            user.file_paths = file_paths;
            MessageRepository::create_in(tx, &user)?;

            let assistant = NewMessage::new(
                Uuid::new_v4().to_string(),
                &session_id,
                Role::Assistant,
                &reply.content,
            )
            .with_token_count(reply.token_count);
            MessageRepository::create_in(tx, &assistant)?;

            SessionRepository::update_token_count_in(tx, &session_id, reply.token_count)?;
            SessionRepository::find_in(tx, &session_id)?
                .ok_or_else(|| Error::SessionNotFound(session_id.clone()))
        })?;

        tracing::info!(
            session_id = %session.id,
            token_count = reply.token_count,
            total_tokens = session.total_tokens,
            "Exchange stored"
        );

        Ok(SendMessageResponse {
            response: reply.content,
            session_id: session.id,
            token_count: reply.token_count,
            total_tokens: session.total_tokens,
        })
    }

    /// A session with its live messages.
    pub fn get_session(&self, session_id: &str) -> Result<Option<Conversation>> {
        let Some(session) = self.sessions.find_by_id(session_id)? else {
            return Ok(None);
        };
        let messages = summaries_first(self.messages.find_by_session_id(session_id)?);
        Ok(Some(Conversation { session, messages }))
    }

    /// All sessions, most recently updated first.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        self.sessions.find_all()
    }

    pub fn rename_session(&self, session_id: &str, name: &str) -> Result<Session> {
        self.sessions
            .update(session_id, &SessionUpdate::name(name))?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Delete a session and its messages. Returns whether it existed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        if self.sessions.find_by_id(session_id)?.is_none() {
            return Ok(false);
        }
        self.sessions.delete(session_id)?;
        tracing::info!(%session_id, "Session deleted");
        Ok(true)
    }

    pub fn clear_all_sessions(&self) -> Result<()> {
        self.sessions.delete_all()?;
        tracing::info!("All sessions cleared");
        Ok(())
    }

    /// Tombstone one message.
    pub fn delete_message(&self, message_id: &str) -> Result<()> {
        if self.messages.find_by_id(message_id)?.is_none() {
            return Err(Error::MessageNotFound(message_id.to_string()));
        }
        self.messages.mark_as_deleted(message_id)
    }

    pub fn session_count(&self) -> Result<i64> {
        self.sessions.count()
    }

    /// Replace all but the newest `keep_recent` messages with a summary.
    ///
    /// The cut is moved forward past any assistant replies so the oldest
    /// kept message is a user turn; replayed history must open with one.
    /// Returns the stored summary, or `None` when there was nothing to
    /// compact. The summary insert and the tombstoning commit together.
    pub async fn compact_session(
        &self,
        session_id: &str,
        keep_recent: u32,
    ) -> Result<Option<Message>> {
        let provider = self.provider()?;

        if self.sessions.find_by_id(session_id)?.is_none() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }

        let mut targets = self.messages.get_summary_targets(session_id, keep_recent)?;
        if !targets.is_empty() {
            let orphaned = self
                .messages
                .find_by_session_id(session_id)?
                .into_iter()
                .filter(|m| !m.is_summary)
                .skip(targets.len())
                .take_while(|m| m.role != Role::User);
            targets.extend(orphaned);
        }
        if targets.is_empty() {
            tracing::debug!(%session_id, keep_recent, "Nothing to compact");
            return Ok(None);
        }

        let reply = provider
            .send_message(&[ChatMessage::new(Role::User, summary_prompt(&targets))])
            .await?;

        let target_ids: Vec<String> = targets.iter().map(|m| m.id.clone()).collect();
        let summary = NewMessage::new(
            Uuid::new_v4().to_string(),
            session_id,
            Role::System,
            reply.content,
        )
        .with_token_count(reply.token_count)
        .summarizing(target_ids.clone());

        let stored = self.db.transaction(|tx| {
            let stored = MessageRepository::create_in(tx, &summary)?;
            for id in &target_ids {
                MessageRepository::mark_as_deleted_in(tx, id)?;
            }
            SessionRepository::update_token_count_in(tx, session_id, reply.token_count)?;
            Ok(stored)
        })?;

        tracing::info!(
            %session_id,
            compacted = target_ids.len(),
            summary_id = %stored.id,
            "Session compacted"
        );

        Ok(Some(stored))
    }
}

/// Title for a new session: whitespace collapsed, at most 50 characters.
pub fn generate_session_title(message: &str) -> String {
    let clean = message.split_whitespace().collect::<Vec<_>>().join(" ");

    if clean.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if clean.chars().count() <= MAX_TITLE_CHARS {
        return clean;
    }

    let mut title: String = clean.chars().take(MAX_TITLE_CHARS - 3).collect();
    title.push_str("...");
    title
}

/// Context file contents formatted as a prefix, or empty if unreadable.
async fn load_context(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => format!("Project context:\n{content}\n\n"),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read context file");
            String::new()
        }
    }
}

/// Stable partition putting summaries ahead of ordinary messages.
fn summaries_first(messages: Vec<Message>) -> Vec<Message> {
    let (mut summaries, rest): (Vec<_>, Vec<_>) =
        messages.into_iter().partition(|m| m.is_summary);
    summaries.extend(rest);
    summaries
}

fn summary_prompt(targets: &[Message]) -> String {
    let transcript = targets
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{SUMMARY_INSTRUCTIONS}\n\n<conversation>\n{transcript}\n</conversation>")
}
