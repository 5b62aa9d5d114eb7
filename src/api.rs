//! Completion API protocol: request payloads, SSE stream framing, and the
//! backend seam the session drives.
//!
//! The wire contract is the OpenAI-style chat-completions shape: a JSON POST
//! with bearer auth, answered (when `stream` is true) by a server-sent-event
//! stream of `{choices:[{delta:{content}}]}` objects terminated by a literal
//! `[DONE]` payload. Malformed event lines are skipped, never fatal.

use crate::types::{BranchKind, RequestSettings, Role};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Model used for title generation; kept cheap and deterministic.
pub const TITLE_MODEL: &str = "gpt-4o-mini";

static HTTP: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApiError {
    #[error("Invalid API key. Please check your API key.")]
    InvalidCredential,
    #[error("Rate limit exceeded. Please try again in a moment.")]
    RateLimited,
    #[error("Access denied. Please check your API key permissions.")]
    Forbidden,
    #[error("API error: status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Transport(String),
}

pub fn map_status(status: u16) -> ApiError {
    match status {
        401 => ApiError::InvalidCredential,
        403 => ApiError::Forbidden,
        429 => ApiError::RateLimited,
        other => ApiError::Status(other),
    }
}

/// One `{role, content}` entry in a request payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompletionBody {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub stream: bool,
}

impl CompletionBody {
    pub fn new(settings: &RequestSettings, messages: Vec<ApiMessage>, stream: bool) -> Self {
        Self {
            model: settings.model.clone(),
            messages,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            top_p: settings.top_p,
            presence_penalty: settings.presence_penalty,
            frequency_penalty: settings.frequency_penalty,
            stream,
        }
    }
}

/// A ready-to-send request. The credential rides alongside the body and is
/// only ever written into the `Authorization` header, never serialized or
/// logged (hence no `Debug` derive).
pub struct CompletionRequest {
    pub credential: String,
    pub body: CompletionBody,
}

// ---------------
// System prompts
// ---------------

const NEUTRAL_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

const LOOKUP_SYSTEM_PROMPT: &str = "You are a helpful dictionary and reference assistant with \
access to the conversation context. When asked about terms, provide concise, encyclopedic \
definitions including usage examples and related terms. Use the previous conversation context \
to give more relevant and contextualized explanations.";

const EXPLORE_SYSTEM_PROMPT: &str = "You are continuing a previous conversation. The user has \
selected a specific part of the earlier discussion to explore further. You have access to the \
previous conversation context and should reference it when relevant to provide deeper, more \
connected insights. Expansive answers are welcome.";

const TITLE_SYSTEM_PROMPT: &str = "Generate a short, descriptive title (2-6 words) for a chat \
conversation based on the user's first message and assistant's response. Return only the \
title, no quotes or extra text.";

/// Branch-kind-dependent system prompt; `None` means a main conversation.
pub fn system_prompt(kind: Option<BranchKind>) -> &'static str {
    match kind {
        None => NEUTRAL_SYSTEM_PROMPT,
        Some(BranchKind::Lookup) => LOOKUP_SYSTEM_PROMPT,
        Some(BranchKind::Explore) => EXPLORE_SYSTEM_PROMPT,
    }
}

/// Non-streaming request asking for a 2-6 word conversation title.
pub fn title_request(credential: &str, user_message: &str, reply: &str) -> CompletionRequest {
    let preview: String = reply.chars().take(200).collect();
    let body = CompletionBody {
        model: TITLE_MODEL.to_string(),
        messages: vec![
            ApiMessage {
                role: Role::System,
                content: TITLE_SYSTEM_PROMPT.to_string(),
            },
            ApiMessage {
                role: Role::User,
                content: format!(
                    "User asked: \"{user_message}\"\nAssistant replied: \"{preview}...\"\n\nGenerate a concise title:"
                ),
            },
        ],
        max_tokens: 20,
        temperature: 0.3,
        top_p: 1.0,
        presence_penalty: 0.0,
        frequency_penalty: 0.0,
        stream: false,
    };
    CompletionRequest {
        credential: credential.to_string(),
        body,
    }
}

// ---------------
// SSE framing
// ---------------

#[derive(Debug, PartialEq)]
pub enum SseEvent {
    Fragment(String),
    Done,
}

#[derive(Deserialize)]
struct StreamPayload {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Interpret one line of the response body. Lines without the `data:`
/// marker, payloads without a text delta, and malformed JSON all yield
/// `None` and the stream continues.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    match serde_json::from_str::<StreamPayload>(data) {
        Ok(payload) => {
            let piece = payload
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta)
                .and_then(|d| d.content)?;
            if piece.is_empty() {
                None
            } else {
                Some(SseEvent::Fragment(piece))
            }
        }
        Err(err) => {
            tracing::debug!("skipping malformed stream chunk: {err}");
            None
        }
    }
}

// ---------------
// Backend seam
// ---------------

/// Incremental text fragments, then end-of-stream. An `Err` item is terminal
/// for the send that owns it.
pub type FragmentStream = BoxStream<'static, Result<String, ApiError>>;

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Issue a streaming completion request and hand back the fragments.
    async fn stream_completion(&self, request: CompletionRequest)
    -> Result<FragmentStream, ApiError>;

    /// Issue a non-streaming request and return the full reply text.
    async fn completion(&self, request: CompletionRequest) -> Result<String, ApiError>;
}

/// Production backend speaking to a chat-completions endpoint over HTTPS.
pub struct HttpBackend {
    endpoint: String,
}

impl HttpBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Endpoint from `DETOUR_ENDPOINT`, falling back to the hosted default.
    pub fn from_env() -> Self {
        let endpoint =
            std::env::var("DETOUR_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        Self::new(endpoint)
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<FragmentStream, ApiError> {
        let res = HTTP
            .post(&self.endpoint)
            .bearer_auth(&request.credential)
            .header("accept", "text/event-stream")
            .json(&request.body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16()));
        }

        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut bytes = res.bytes_stream();
            while let Some(item) = bytes.next().await {
                match item {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buffer.find('\n') {
                            let mut line = buffer[..pos].to_string();
                            if line.ends_with('\r') {
                                line.pop();
                            }
                            buffer = buffer[pos + 1..].to_string();
                            match parse_sse_line(&line) {
                                Some(SseEvent::Fragment(piece)) => {
                                    // Receiver dropped means the owning
                                    // conversation went away; stop reading.
                                    if tx.unbounded_send(Ok(piece)).is_err() {
                                        return;
                                    }
                                }
                                Some(SseEvent::Done) => return,
                                None => {}
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!("completion stream transport error: {err}");
                        let _ = tx.unbounded_send(Err(ApiError::Transport(err.to_string())));
                        return;
                    }
                }
            }
        });

        Ok(rx.boxed())
    }

    async fn completion(&self, request: CompletionRequest) -> Result<String, ApiError> {
        #[derive(Deserialize)]
        struct ResponseMessage {
            content: String,
        }
        #[derive(Deserialize)]
        struct ResponseChoice {
            message: Option<ResponseMessage>,
        }
        #[derive(Deserialize)]
        struct CompletionResponse {
            choices: Vec<ResponseChoice>,
        }

        let res = HTTP
            .post(&self.endpoint)
            .bearer_auth(&request.credential)
            .json(&request.body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16()));
        }

        let payload: CompletionResponse = res
            .json()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .unwrap_or_default())
    }
}
