//! LLM provider seam
//!
//! [`LlmProvider`] is the only thing the chat service knows about the model
//! backend. [`ClaudeProvider`] implements it over the Anthropic Messages API.

use crate::config::{ClaudeConfig, Config, FileConfig};
use crate::types::Role;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Failures talking to the model backend.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// No credentials, so no provider could be built
    #[error("LLM provider is not configured (missing API key)")]
    NotConfigured,

    /// The backend answered without any content
    #[error("LLM provider returned an empty response")]
    EmptyResponse,

    /// The backend answered with a non-success status
    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport or decoding failure
    #[error("LLM request failed: {0}")]
    Http(String),
}

/// One turn of conversation as sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Files to attach; only honored on user turns
    pub file_paths: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            file_paths: None,
        }
    }
}

/// A completed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub content: String,
    /// Output tokens reported by the backend
    pub token_count: i64,
}

/// A chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Anthropic Messages API client.
pub struct ClaudeProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    files: FileConfig,
}

impl ClaudeProvider {
    /// Build a client; fails with `NotConfigured` without an API key.
    pub fn new(claude: &ClaudeConfig, files: &FileConfig) -> Result<Self, ProviderError> {
        let api_key = claude.api_key().ok_or(ProviderError::NotConfigured)?;
        Self::with_api_key(claude, files, api_key)
    }

    /// Build a client from the full configuration.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        Self::new(&config.claude, &config.file)
    }

    /// Build a client with an explicit key, ignoring the environment.
    pub fn with_api_key(
        claude: &ClaudeConfig,
        files: &FileConfig,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: claude.endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: claude.model.clone(),
            max_tokens: claude.max_tokens,
            temperature: claude.temperature,
            files: files.clone(),
        })
    }

    async fn build_request(&self, messages: &[ChatMessage]) -> MessagesRequest {
        let mut system = Vec::new();
        let mut turns = Vec::new();

        for message in messages {
            match message.role {
                // Summaries travel in the top-level system prompt
                Role::System => system.push(message.content.clone()),
                Role::Assistant => turns.push(Turn {
                    role: "assistant",
                    content: Content::Text(message.content.clone()),
                }),
                Role::User => {
                    let mut blocks = vec![ContentBlock::Text {
                        text: message.content.clone(),
                    }];
                    for path in message.file_paths.iter().flatten() {
                        if let Some(block) = self.attachment_block(Path::new(path)).await {
                            blocks.push(block);
                        }
                    }
                    turns.push(Turn {
                        role: "user",
                        content: Content::Blocks(blocks),
                    });
                }
            }
        }

        // The API requires the first turn to come from the user
        let leading = turns.iter().take_while(|t| t.role == "assistant").count();
        if leading > 0 {
            tracing::debug!(dropped = leading, "Dropping assistant turns ahead of the first user turn");
            turns.drain(..leading);
        }

        MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: turns,
        }
    }

    /// Turn one attachment into a content block, or `None` if it is skipped.
    async fn attachment_block(&self, path: &Path) -> Option<ContentBlock> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                tracing::warn!(path = %path.display(), "Attachment not found, skipping");
                return None;
            }
        };
        if metadata.len() > self.files.max_file_size {
            tracing::warn!(
                path = %path.display(),
                size = metadata.len(),
                limit = self.files.max_file_size,
                "Attachment too large, skipping"
            );
            return None;
        }

        let ext = extension_of(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(media_type) = image_media_type(&ext) {
            return match tokio::fs::read(path).await {
                Ok(bytes) => Some(ContentBlock::Image {
                    source: ImageSource {
                        kind: "base64",
                        media_type,
                        data: BASE64_STANDARD.encode(bytes),
                    },
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read attachment");
                    None
                }
            };
        }

        if !self
            .files
            .allowed_file_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
        {
            tracing::warn!(path = %path.display(), ext = %ext, "Attachment type not allowed, skipping");
            return None;
        }

        match tokio::fs::read_to_string(path).await {
            Ok(text) => Some(ContentBlock::Text {
                text: format!("File: {name}\n```\n{text}\n```"),
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read attachment");
                None
            }
        }
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ProviderResponse, ProviderError> {
        let request = self.build_request(messages).await;
        let url = format!("{}/v1/messages", self.endpoint);

        tracing::debug!(model = %self.model, turns = request.messages.len(), "Sending Claude request");

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Http(format!("claude request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::Http(format!("claude read body failed: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|wrapper| wrapper.error.message)
                .unwrap_or(body);
            tracing::warn!(status = status.as_u16(), %message, "Claude API error");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Http(format!("failed to parse claude response: {e}")))?;

        if parsed.content.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        let content: String = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .collect();
        let token_count = parsed.usage.map(|u| u.output_tokens).unwrap_or(0);

        tracing::info!(model = %self.model, token_count, "Claude response received");

        Ok(ProviderResponse {
            content,
            token_count,
        })
    }
}

/// Lowercase extension with its leading dot, or empty.
fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default()
}

fn image_media_type(ext: &str) -> Option<&'static str> {
    match ext {
        ".jpg" | ".jpeg" => Some("image/jpeg"),
        ".png" => Some("image/png"),
        ".gif" => Some("image/gif"),
        ".webp" => Some("image/webp"),
        _ => None,
    }
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Turn>,
}

#[derive(Serialize)]
struct Turn {
    role: &'static str,
    content: Content,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'static str,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    output_tokens: i64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}
