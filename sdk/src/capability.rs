//! Capabilities and channel naming
//!
//! A capability is a closed set: adding one means adding a variant here and a
//! worker that serves it. Channel names are derived, never typed by hand:
//!
//! - `<capability>_tasks`: one task channel per capability
//! - `results`: shared result channel consumed by the coordinator
//! - `progress_<conversation_id>`: one progress channel per conversation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::DispatchError;

/// Shared channel every worker publishes results on
pub const RESULTS_CHANNEL: &str = "results";

/// Kind of processing a worker performs
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Documents (PDF, office formats, plain text)
    Document,
    /// Voice messages and audio files
    Audio,
    /// Photos and images
    Image,
}

impl Capability {
    /// Every capability, in a stable order
    pub const ALL: [Capability; 3] = [Capability::Document, Capability::Audio, Capability::Image];

    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Document => "document",
            Capability::Audio => "audio",
            Capability::Image => "image",
        }
    }

    /// Channel the coordinator publishes tasks for this capability on
    pub fn task_channel(&self) -> String {
        format!("{}_tasks", self.as_str())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" => Ok(Capability::Document),
            "audio" => Ok(Capability::Audio),
            "image" => Ok(Capability::Image),
            other => Err(DispatchError::UnknownCapability(other.to_string())),
        }
    }
}

/// Progress channel for a conversation
pub fn progress_channel(conversation_id: &str) -> String {
    format!("progress_{}", conversation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_channel_names() {
        assert_eq!(Capability::Document.task_channel(), "document_tasks");
        assert_eq!(Capability::Audio.task_channel(), "audio_tasks");
        assert_eq!(Capability::Image.task_channel(), "image_tasks");
    }

    #[test]
    fn test_progress_channel_name() {
        assert_eq!(progress_channel("C1"), "progress_C1");
    }

    #[test]
    fn test_parse_capability() {
        assert_eq!("Document".parse::<Capability>().unwrap(), Capability::Document);
        assert_eq!(" audio ".parse::<Capability>().unwrap(), Capability::Audio);
        assert!(matches!(
            "video".parse::<Capability>(),
            Err(DispatchError::UnknownCapability(name)) if name == "video"
        ));
    }

    #[test]
    fn test_capability_serializes_lowercase() {
        let json = serde_json::to_string(&Capability::Image).unwrap();
        assert_eq!(json, "\"image\"");
    }
}
