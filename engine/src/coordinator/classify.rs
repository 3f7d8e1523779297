//! Inbound event classification
//!
//! Decides which capability (if any) handles an event and rejects input that
//! violates a configured bound before any task exists.

use courier_sdk::{Capability, DispatchError, PayloadRef};
use std::time::Duration;

use crate::bot::InboundContent;
use crate::config::LimitsConfig;
use crate::worker::extract::is_supported_document;

/// Mime type assumed for voice messages that carry none
const DEFAULT_AUDIO_MIME: &str = "audio/ogg";

/// What the coordinator does with an event
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Publish a task for this capability
    Dispatch(Capability, PayloadRef),

    /// Answer a bot command locally
    Command { name: String, args: String },

    /// Plain text; no capability handles it
    Unclassified,
}

/// Classify one inbound event
///
/// # Errors
/// - `Classification` for unsupported file types
/// - `ArtifactTooLarge` / `AudioTooLong` when a declared bound is exceeded
pub fn classify(content: InboundContent, limits: &LimitsConfig) -> Result<Route, DispatchError> {
    match content {
        InboundContent::Text(_) => Ok(Route::Unclassified),
        InboundContent::Command { name, args } => Ok(Route::Command { name, args }),
        InboundContent::Document(payload) => {
            let ext = payload.extension().ok_or_else(|| {
                DispatchError::Classification("the file has no extension".to_string())
            })?;
            if !is_supported_document(&ext) {
                return Err(DispatchError::Classification(format!(
                    "unsupported file type .{}",
                    ext
                )));
            }
            check_size(&payload, limits)?;
            Ok(Route::Dispatch(Capability::Document, payload))
        }
        InboundContent::Voice(mut payload) => {
            let mime = payload
                .mime_type
                .get_or_insert_with(|| DEFAULT_AUDIO_MIME.to_string());
            if !mime.starts_with("audio/") {
                return Err(DispatchError::Classification(format!(
                    "unsupported audio type {}",
                    mime
                )));
            }
            if let Some(duration) = payload.duration_secs {
                if duration > limits.max_audio_secs {
                    return Err(DispatchError::AudioTooLong {
                        duration,
                        limit: limits.max_audio_secs,
                    });
                }
            }
            check_size(&payload, limits)?;
            Ok(Route::Dispatch(Capability::Audio, payload))
        }
        InboundContent::Photo(payload) => {
            check_size(&payload, limits)?;
            Ok(Route::Dispatch(Capability::Image, payload))
        }
    }
}

fn check_size(payload: &PayloadRef, limits: &LimitsConfig) -> Result<(), DispatchError> {
    match payload.size_bytes {
        Some(size) if size > limits.max_artifact_bytes => Err(DispatchError::ArtifactTooLarge {
            size,
            limit: limits.max_artifact_bytes,
        }),
        _ => Ok(()),
    }
}

/// Rough processing time shown in the acknowledgement
pub fn estimate_processing_time(capability: Capability, payload: &PayloadRef) -> Duration {
    let secs = match capability {
        Capability::Audio => {
            let duration = f64::from(payload.duration_secs.unwrap_or(60));
            (duration * 2.5) as u64 + 30
        }
        Capability::Document => match payload.extension().as_deref() {
            Some("pdf") => {
                let mib = payload.size_bytes.unwrap_or(0) as f64 / 1024.0 / 1024.0;
                let pages = mib * 20.0;
                (pages * 1.5) as u64 + 30
            }
            Some("docx") => 60,
            Some("txt") => 30,
            Some("xlsx" | "xlsm" | "xls" | "ods" | "csv" | "tsv") => 90,
            _ => 60,
        },
        Capability::Image => 30,
    };
    Duration::from_secs(secs)
}

/// `45s`, `2m`, `2m 30s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        return format!("{}s", secs);
    }
    match secs % 60 {
        0 => format!("{}m", secs / 60),
        rem => format!("{}m {}s", secs / 60, rem),
    }
}
