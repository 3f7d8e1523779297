//! Conversation front end
//!
//! The coordinator only sees [`InboundEvent`]s and replies through a
//! [`ConversationSink`]. The Telegram long-polling client in [`telegram`]
//! provides both in production; [`MemorySink`] records replies in tests.

use async_trait::async_trait;
use courier_sdk::{DispatchError, PayloadRef};
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod telegram;

pub use telegram::{TelegramApi, TelegramFrontend};

/// Maximum characters per outgoing conversation message
pub const MESSAGE_CHUNK_CHARS: usize = 3500;

/// Something a user sent to the bot
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub conversation_id: String,
    pub originator_id: String,
    pub content: InboundContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundContent {
    /// Plain text
    Text(String),

    /// `/name args`, with any `@botname` suffix removed
    Command { name: String, args: String },

    /// File attachment
    Document(PayloadRef),

    /// Voice message or audio file
    Voice(PayloadRef),

    /// Photo, largest available size
    Photo(PayloadRef),
}

impl InboundEvent {
    pub fn new(
        conversation_id: impl Into<String>,
        originator_id: impl Into<String>,
        content: InboundContent,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            originator_id: originator_id.into(),
            content,
        }
    }
}

/// Parse `/cmd@bot args` into `("cmd", "args")`
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let rest = text.trim().strip_prefix('/')?;
    let (head, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    Some((name, args.trim().to_string()))
}

/// Split `text` into pieces of at most `limit` characters
///
/// Prefers to break after a newline in the second half of a piece.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some((hard_cut, _)) = rest.char_indices().nth(limit) else {
            chunks.push(rest.to_string());
            break;
        };

        let cut = match rest[..hard_cut].rfind('\n') {
            Some(pos) if pos >= hard_cut / 2 => pos + 1,
            _ => hard_cut,
        };
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    chunks
}

/// Outgoing side of the conversation channel
#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn send(&self, conversation_id: &str, text: &str) -> Result<(), DispatchError>;
}

/// Sink that records every message, for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(conversation_id, text)` pair sent so far
    pub async fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().await.clone()
    }

    pub async fn messages_for(&self, conversation_id: &str) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ConversationSink for MemorySink {
    async fn send(&self, conversation_id: &str, text: &str) -> Result<(), DispatchError> {
        self.messages
            .lock()
            .await
            .push((conversation_id.to_string(), text.to_string()));
        Ok(())
    }
}
