//! Capability-specific analysis prompts

use courier_sdk::Capability;

use super::AnalysisRequest;

const DOCUMENT_DEFAULT: &str = "Analyze this document and summarize its key points.";

const AUDIO: &str = "Analyze the following voice transcript:\n\
1. Summarize the main content\n\
2. Extract important information\n\
3. List next steps or action items, if any";

const AUDIO_INLINE: &str = "Transcribe this audio, then summarize the main content \
and list any action items.";

const IMAGE: &str = "Analyze this image in detail:\n\
1. Describe what it shows\n\
2. Name the main objects or features\n\
3. Describe colors and mood\n\
4. Transcribe any visible text";

/// Prompt for a document of the given kind (lowercased extension)
fn document_prompt(kind: Option<&str>) -> &'static str {
    match kind {
        Some("pdf") => "Analyze this PDF document and summarize its key points.",
        Some("txt") => "Analyze this text and summarize its key points.",
        Some("md") => "Analyze this markdown document and summarize its key points.",
        Some("csv") | Some("tsv") | Some("xlsx") | Some("xls") => {
            "Analyze this data and provide the main insights."
        }
        _ => DOCUMENT_DEFAULT,
    }
}

/// Instruction placed before the content of a request
pub fn prompt_for(request: &AnalysisRequest) -> &'static str {
    match request.capability {
        Capability::Document => document_prompt(request.document_kind.as_deref()),
        Capability::Audio if request.text.is_none() => AUDIO_INLINE,
        Capability::Audio => AUDIO,
        Capability::Image => IMAGE,
    }
}
