//! Conversation reply formatting

use chrono::{DateTime, Utc};
use courier_sdk::{
    Capability, CourierErrorExt, DispatchError, PayloadRef, ProgressEvent, ResultEnvelope,
    ResultPayload,
};
use std::time::Duration;

use super::classify::format_duration;
use super::correlation::CorrelationRecord;
use crate::secrets::scrub;

pub const START_TEXT: &str = "Courier is ready. Send a document, a voice message or a photo \
and I will analyze it in the background.";

pub const HELP_TEXT: &str = "Send me:\n\
 - a document (pdf, docx, pptx, xlsx, csv, txt, md, ...) for a summary\n\
 - a voice message or audio file for a transcript and summary\n\
 - a photo for an image description\n\n\
Commands:\n\
 /start  - Initialize bot\n\
 /status - Show tasks still in progress\n\
 /bots   - Show which processors are online\n\
 /help   - Show this help";

pub const USAGE_TEXT: &str = "I can only analyze files. Send a document, a voice message \
or a photo, or use /help.";

fn icon(capability: Capability) -> &'static str {
    match capability {
        Capability::Document => "📄",
        Capability::Audio => "🎤",
        Capability::Image => "🖼",
    }
}

fn subject(capability: Capability, artifact_name: Option<&str>) -> String {
    match (capability, artifact_name) {
        (_, Some(name)) => name.to_string(),
        (Capability::Document, None) => "your document".to_string(),
        (Capability::Audio, None) => "your voice message".to_string(),
        (Capability::Image, None) => "your image".to_string(),
    }
}

/// Immediate acknowledgement after a task was published
pub fn acknowledgement(capability: Capability, payload: &PayloadRef, eta: Duration) -> String {
    format!(
        "{} Processing {}.\nEstimated time: ~{}",
        icon(capability),
        subject(capability, payload.file_name.as_deref()),
        format_duration(eta)
    )
}

/// Reply to `/bots`: live workers per capability
pub fn bots_message(counts: &[(Capability, Result<usize, DispatchError>)]) -> String {
    let mut text = String::from("Processors:");
    for (capability, count) in counts {
        let status = match count {
            Ok(0) => "🔴 offline".to_string(),
            Ok(n) => format!("🟢 online ({} worker(s))", n),
            Err(_) => "⚪ status unknown".to_string(),
        };
        text.push_str(&format!("\n{} {}: {}", icon(*capability), capability, status));
    }
    text
}

/// Reply for input that was refused before dispatch
pub fn rejection(err: &DispatchError) -> String {
    format!("❌ {}\n({})", err.user_hint(), scrub(&err.to_string()))
}

/// Reply when the task could not be published
pub fn transient_failure(err: &DispatchError) -> String {
    format!("⚠️ {}", err.user_hint())
}

/// Reply for a matched result
pub fn result_message(record: &CorrelationRecord, result: &ResultEnvelope) -> String {
    let name = subject(record.capability, record.artifact_name.as_deref());

    match &result.payload {
        ResultPayload::Analysis {
            summary,
            excerpt,
            truncated,
            degraded,
            ..
        } => {
            let mut text = match record.capability {
                Capability::Document => match excerpt {
                    Some(excerpt) if !*degraded => format!(
                        "📄 Summary of {}\n\n{}\n\nBeginning of the document\n{}",
                        name, summary, excerpt
                    ),
                    _ => format!("📄 Summary of {}\n\n{}", name, summary),
                },
                Capability::Audio => match excerpt {
                    Some(transcript) if !*degraded => format!(
                        "🎤 Transcript\n{}\n\nSummary\n{}",
                        transcript, summary
                    ),
                    _ => format!("🎤 {}\n\n{}", name, summary),
                },
                Capability::Image => format!("🖼 Analysis of {}\n\n{}", name, summary),
            };

            if *degraded {
                text.push_str("\n\n(Analysis was unavailable; showing the extracted content.)");
            }
            if *truncated {
                text.push_str("\n\n(The content was long and only its beginning was analyzed.)");
            }
            text
        }
        ResultPayload::Failure { failure, reason } => format!(
            "❌ Processing {} failed: {}.\n{}",
            name,
            failure.describe(),
            scrub(reason)
        ),
    }
}

/// Status line relayed for a progress event
pub fn progress_message(record: &CorrelationRecord, event: &ProgressEvent) -> String {
    format!(
        "⏳ {}: {}",
        subject(record.capability, record.artifact_name.as_deref()),
        event.stage.describe()
    )
}

/// Notice for a record evicted at its deadline
pub fn timeout_notice(record: &CorrelationRecord) -> String {
    let err = DispatchError::DispatchTimeout(record.correlation_id.to_string());
    let waited = (record.deadline - record.issued_at)
        .to_std()
        .unwrap_or_default();
    format!(
        "⌛ {} ({} after {}).",
        err.user_hint(),
        subject(record.capability, record.artifact_name.as_deref()),
        format_duration(waited)
    )
}

/// `/status` reply
pub fn status_message(records: &[&CorrelationRecord], now: DateTime<Utc>) -> String {
    if records.is_empty() {
        return "No tasks in progress.".to_string();
    }

    let mut text = format!("{} task(s) in progress:", records.len());
    for record in records {
        let elapsed = (now - record.issued_at).to_std().unwrap_or_default();
        text.push_str(&format!(
            "\n{} {} (running {})",
            icon(record.capability),
            subject(record.capability, record.artifact_name.as_deref()),
            format_duration(elapsed)
        ));
    }
    text
}
