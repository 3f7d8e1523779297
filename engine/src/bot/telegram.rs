//! Telegram Bot Integration
//!
//! Long-polls the Bot API for messages, turns them into [`InboundEvent`]s for
//! the coordinator, and delivers replies. The same [`TelegramApi`] client is
//! used by workers to download file attachments.

use async_trait::async_trait;
use courier_sdk::{DispatchError, PayloadRef};
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    parse_command, split_message, ConversationSink, InboundContent, InboundEvent,
    MESSAGE_CHUNK_CHARS,
};
use crate::daemon::Shutdown;
use crate::secrets::{self, SecretString};

/// Pause after a failed poll
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// HTTP timeout; must exceed the long-polling timeout
const HTTP_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Deserialize, Debug)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Deserialize, Debug)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub document: Option<Document>,
    pub voice: Option<Voice>,
    pub audio: Option<Voice>,
    pub photo: Option<Vec<PhotoSize>>,
}

#[derive(Deserialize, Debug)]
pub struct Chat {
    pub id: i64,
}

#[derive(Deserialize, Debug)]
pub struct User {
    pub id: i64,
}

#[derive(Deserialize, Debug)]
pub struct Document {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

/// Voice messages and audio files share this shape
#[derive(Deserialize, Debug)]
pub struct Voice {
    pub file_id: String,
    pub duration: u32,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub struct PhotoSize {
    pub file_id: String,
    pub file_size: Option<u64>,
}

/// Result of `getFile`
#[derive(Deserialize, Debug)]
pub struct TelegramFile {
    pub file_id: String,
    pub file_size: Option<u64>,
    pub file_path: Option<String>,
}

/// Thin Bot API client
#[derive(Clone)]
pub struct TelegramApi {
    client: Client,
    api_base: String,
    token: SecretString,
}

impl std::fmt::Debug for TelegramApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramApi")
            .field("api_base", &self.api_base)
            .field("token", &self.token)
            .finish()
    }
}

impl TelegramApi {
    pub fn new(api_base: impl Into<String>, token: SecretString) -> Self {
        Self {
            client: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token.expose(), method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token.expose(), file_path)
    }

    /// Call a Bot API method; the error string never contains the token
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, String> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("{} request failed: {}", method, e.without_url()))?
            .json::<ApiResponse<T>>()
            .await
            .map_err(|e| format!("{} returned invalid JSON: {}", method, e.without_url()))?;

        if !response.ok {
            return Err(format!(
                "{} failed: {}",
                method,
                response.description.unwrap_or_else(|| "ok=false".to_string())
            ));
        }

        response
            .result
            .ok_or_else(|| format!("{} returned no result", method))
    }

    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, DispatchError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        self.call("getUpdates", &body)
            .await
            .map_err(DispatchError::Delivery)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), DispatchError> {
        let body = json!({ "chat_id": chat_id, "text": text });
        self.call::<serde_json::Value>("sendMessage", &body)
            .await
            .map(|_| ())
            .map_err(DispatchError::Delivery)
    }

    pub async fn get_file(&self, file_id: &str) -> Result<TelegramFile, DispatchError> {
        let body = json!({ "file_id": file_id });
        self.call("getFile", &body)
            .await
            .map_err(DispatchError::ArtifactDownload)
    }

    /// Stream a file to `dest`, aborting once more than `max_bytes` arrive
    pub async fn download_file(
        &self,
        file_path: &str,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, DispatchError> {
        let response = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|e| DispatchError::ArtifactDownload(e.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(DispatchError::ArtifactDownload(format!(
                "file download returned {}",
                response.status()
            )));
        }

        if let Some(size) = response.content_length() {
            if size > max_bytes {
                return Err(DispatchError::ArtifactTooLarge {
                    size,
                    limit: max_bytes,
                });
            }
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| DispatchError::ArtifactDownload(e.without_url().to_string()))?;
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(DispatchError::ArtifactTooLarge {
                    size: written,
                    limit: max_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(written)
    }
}

#[async_trait]
impl ConversationSink for TelegramApi {
    async fn send(&self, conversation_id: &str, text: &str) -> Result<(), DispatchError> {
        let chat_id: i64 = conversation_id.parse().map_err(|_| {
            DispatchError::Delivery(format!("invalid chat id '{}'", conversation_id))
        })?;

        // Scrub secrets from outgoing messages
        let scrubbed = secrets::scrub(text);
        for chunk in split_message(&scrubbed, MESSAGE_CHUNK_CHARS) {
            self.send_message(chat_id, &chunk).await?;
        }
        Ok(())
    }
}

/// Convert a Bot API message into an inbound event
///
/// Returns `None` for message kinds the bot does not handle (stickers, ...).
pub fn to_event(message: Message) -> Option<InboundEvent> {
    let conversation_id = message.chat.id.to_string();
    let originator_id = message
        .from
        .as_ref()
        .map(|u| u.id)
        .unwrap_or(message.chat.id)
        .to_string();

    let content = if let Some(doc) = message.document {
        let mut payload = PayloadRef::telegram(&doc.file_id);
        payload.file_name = doc.file_name;
        payload.mime_type = doc.mime_type;
        payload.size_bytes = doc.file_size;
        InboundContent::Document(payload)
    } else if let Some(voice) = message.voice.or(message.audio) {
        let mut payload = PayloadRef::telegram(&voice.file_id).with_duration(voice.duration);
        payload.file_name = voice.file_name;
        payload.mime_type = voice.mime_type;
        payload.size_bytes = voice.file_size;
        InboundContent::Voice(payload)
    } else if let Some(photo) = message.photo.and_then(|sizes| sizes.into_iter().last()) {
        let mut payload = PayloadRef::telegram(&photo.file_id);
        payload.size_bytes = photo.file_size;
        InboundContent::Photo(payload)
    } else {
        let text = message.text?;
        match parse_command(&text) {
            Some((name, args)) => InboundContent::Command { name, args },
            None => InboundContent::Text(text),
        }
    };

    Some(InboundEvent {
        conversation_id,
        originator_id,
        content,
    })
}

/// Long-polling front end feeding the coordinator
pub struct TelegramFrontend {
    api: TelegramApi,
    allowed_users: Vec<i64>,
    poll_timeout_secs: u64,
}

impl TelegramFrontend {
    pub fn new(api: TelegramApi, allowed_users: Vec<i64>, poll_timeout_secs: u64) -> Self {
        Self {
            api,
            allowed_users,
            poll_timeout_secs,
        }
    }

    /// Empty allow list admits everyone
    pub fn is_allowed(&self, user_id: &str) -> bool {
        self.allowed_users.is_empty()
            || user_id
                .parse::<i64>()
                .map(|id| self.allowed_users.contains(&id))
                .unwrap_or(false)
    }

    /// Start the long-polling loop
    ///
    /// Runs until shutdown or until the event receiver is dropped.
    pub async fn run(self, events: mpsc::Sender<InboundEvent>, shutdown: Shutdown) {
        info!("Starting Telegram long-polling loop");
        let mut offset = 0;

        loop {
            let updates = tokio::select! {
                _ = shutdown.wait() => break,
                result = self.api.get_updates(offset, self.poll_timeout_secs) => result,
            };

            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    error!("Failed to fetch Telegram updates: {}", e);
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                    }
                }
            };

            for update in updates {
                offset = update.update_id + 1;
                let Some(event) = update.message.and_then(to_event) else {
                    debug!("Ignoring update {} with no supported content", update.update_id);
                    continue;
                };

                if !self.is_allowed(&event.originator_id) {
                    warn!("Unauthorized user {} attempted to use the bot", event.originator_id);
                    if let Err(e) = self
                        .api
                        .send(&event.conversation_id, "Unauthorized. Access denied.")
                        .await
                    {
                        warn!("Failed to send rejection: {}", e);
                    }
                    continue;
                }

                if events.send(event).await.is_err() {
                    info!("Event receiver closed, stopping Telegram polling");
                    return;
                }
            }
        }

        info!("Telegram polling stopped");
    }
}
