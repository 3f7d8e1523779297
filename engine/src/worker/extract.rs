//! Content extraction per capability
//!
//! - Document: text, PDF, Word, PowerPoint and spreadsheet formats are read
//!   in-process. A configured converter command takes over every binary
//!   format, and is the only way to read legacy formats such as `.doc`.
//! - Audio: an external transcriber produces the transcript. Without one the
//!   recording is handed to analysis as inline media.
//! - Image: the bytes are handed to analysis as inline media.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use courier_sdk::{Capability, DispatchError, TaskEnvelope};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use super::artifact::ScopedArtifact;
use super::office;
use crate::config::Config;
use crate::llm::InlineMedia;

/// Document formats decoded as text
pub const TEXT_FORMATS: &[&str] = &[
    "txt", "md", "csv", "tsv", "json", "xml", "yaml", "yml", "toml", "log", "html", "ini", "sql",
];

/// Binary document formats read in-process
pub const OFFICE_FORMATS: &[&str] = &["pdf", "docx", "pptx", "xlsx", "xlsm", "xls", "ods"];

/// Document formats only the external converter can read
pub const CONVERTED_FORMATS: &[&str] = &["doc", "ppt", "odt", "rtf"];

/// Transcript used when the recording contains no speech
pub const NO_SPEECH: &str = "(no speech detected)";

/// Placeholder in command templates replaced by the artifact path
const INPUT_PLACEHOLDER: &str = "{input}";

/// Whether `ext` (lowercase, no dot) is a supported document format
pub fn is_supported_document(ext: &str) -> bool {
    [TEXT_FORMATS, OFFICE_FORMATS, CONVERTED_FORMATS]
        .iter()
        .any(|formats| formats.contains(&ext))
}

/// Output of an extractor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub text: Option<String>,
    pub media: Option<InlineMedia>,
}

/// Turns a scoped artifact into analysable content
#[async_trait]
pub trait Extractor: Send + Sync {
    fn capability(&self) -> Capability;

    async fn extract(
        &self,
        task: &TaskEnvelope,
        artifact: &ScopedArtifact,
    ) -> Result<Extracted, DispatchError>;
}

/// Build the extractor a worker of `capability` uses
pub fn extractor_for(capability: Capability, config: &Config) -> Arc<dyn Extractor> {
    let timeout = Duration::from_secs(config.extractors.timeout_secs);
    match capability {
        Capability::Document => Arc::new(DocumentExtractor::new(ExternalCommand::from_argv(
            &config.extractors.document_converter,
            timeout,
        ))),
        Capability::Audio => Arc::new(AudioExtractor::new(
            ExternalCommand::from_argv(&config.extractors.transcriber, timeout),
            config.limits.max_audio_secs,
        )),
        Capability::Image => Arc::new(ImageExtractor),
    }
}

/// External collaborator run once per artifact
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalCommand {
    /// `None` when `argv` is empty
    pub fn from_argv(argv: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    /// Run against `input` and return stdout as text
    ///
    /// The child is killed when the timeout elapses.
    pub async fn run(&self, input: &Path) -> Result<String, DispatchError> {
        let input_str = input.to_string_lossy();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, &input_str))
            .collect();
        if !self.args.iter().any(|arg| arg.contains(INPUT_PLACEHOLDER)) {
            args.push(input_str.to_string());
        }

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DispatchError::Extraction(format!("failed to start {}: {}", self.program, e))
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                DispatchError::Extraction(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| DispatchError::Extraction(format!("{} failed: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail: String = stderr.trim().chars().take(200).collect();
            return Err(DispatchError::Extraction(format!(
                "{} exited with {}: {}",
                self.program, output.status, detail
            )));
        }

        Ok(decode_text(&output.stdout))
    }
}

/// Lossy UTF-8 decoding with the byte order mark removed
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Extension from the payload's file name, falling back to the artifact's
fn artifact_extension(task: &TaskEnvelope, artifact: &ScopedArtifact) -> Option<String> {
    task.payload_ref.extension().or_else(|| {
        Path::new(artifact.file_name())
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    })
}

/// Prefix tabular text with its shape and column names
///
/// Rows are counted as records, so quoted fields spanning lines count once.
fn summarize_table(text: &str, delimiter: u8, label: &str) -> String {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let columns: Vec<String> = match reader.headers() {
        Ok(headers) if !headers.is_empty() => headers.iter().map(str::to_string).collect(),
        _ => return text.to_string(),
    };
    let rows = reader.records().filter(|record| record.is_ok()).count();

    format!(
        "{} file: {} rows, {} columns\nColumns: {}\n\n{}",
        label,
        rows,
        columns.len(),
        columns.join(", "),
        text
    )
}

/// Run an in-process reader on the blocking pool
///
/// A panic inside the reader surfaces as an extraction error.
async fn read_office_blocking(path: &Path, ext: &str) -> Result<String, DispatchError> {
    let path = path.to_path_buf();
    let ext = ext.to_string();
    tokio::task::spawn_blocking(move || office::read_office(&path, &ext))
        .await
        .map_err(|e| DispatchError::Extraction(format!("document reader crashed: {}", e)))?
}

/// Extractor for the document capability
pub struct DocumentExtractor {
    converter: Option<ExternalCommand>,
}

impl DocumentExtractor {
    pub fn new(converter: Option<ExternalCommand>) -> Self {
        Self { converter }
    }
}

#[async_trait]
impl Extractor for DocumentExtractor {
    fn capability(&self) -> Capability {
        Capability::Document
    }

    async fn extract(
        &self,
        task: &TaskEnvelope,
        artifact: &ScopedArtifact,
    ) -> Result<Extracted, DispatchError> {
        let ext = artifact_extension(task, artifact).unwrap_or_default();

        let text = if TEXT_FORMATS.contains(&ext.as_str()) {
            let text = decode_text(&artifact.read().await?);
            match ext.as_str() {
                "csv" => summarize_table(&text, b',', "CSV"),
                "tsv" => summarize_table(&text, b'\t', "TSV"),
                _ => text,
            }
        } else if let Some(converter) = self.converter.as_ref().filter(|_| {
            OFFICE_FORMATS.contains(&ext.as_str()) || CONVERTED_FORMATS.contains(&ext.as_str())
        }) {
            converter.run(artifact.path()).await?
        } else if OFFICE_FORMATS.contains(&ext.as_str()) {
            read_office_blocking(artifact.path(), &ext).await?
        } else if CONVERTED_FORMATS.contains(&ext.as_str()) {
            return Err(DispatchError::Extraction(format!(
                "no document converter configured for .{}",
                ext
            )));
        } else {
            return Err(DispatchError::Extraction(format!(
                "unsupported document format '{}'",
                ext
            )));
        };

        if text.trim().is_empty() {
            return Err(DispatchError::Extraction(
                "document contains no extractable text".to_string(),
            ));
        }

        Ok(Extracted {
            text: Some(text),
            media: None,
        })
    }
}

/// Extractor for the audio capability
pub struct AudioExtractor {
    transcriber: Option<ExternalCommand>,
    max_audio_secs: u32,
}

impl AudioExtractor {
    pub fn new(transcriber: Option<ExternalCommand>, max_audio_secs: u32) -> Self {
        Self {
            transcriber,
            max_audio_secs,
        }
    }
}

#[async_trait]
impl Extractor for AudioExtractor {
    fn capability(&self) -> Capability {
        Capability::Audio
    }

    async fn extract(
        &self,
        task: &TaskEnvelope,
        artifact: &ScopedArtifact,
    ) -> Result<Extracted, DispatchError> {
        if let Some(duration) = task.payload_ref.duration_secs {
            if duration > self.max_audio_secs {
                return Err(DispatchError::AudioTooLong {
                    duration,
                    limit: self.max_audio_secs,
                });
            }
        }

        match &self.transcriber {
            Some(transcriber) => {
                let transcript = transcriber.run(artifact.path()).await?;
                let transcript = transcript.trim();
                let text = if transcript.is_empty() {
                    NO_SPEECH.to_string()
                } else {
                    transcript.to_string()
                };
                Ok(Extracted {
                    text: Some(text),
                    media: None,
                })
            }
            None => {
                let mime_type = task
                    .payload_ref
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "audio/ogg".to_string());
                Ok(Extracted {
                    text: None,
                    media: Some(InlineMedia {
                        mime_type,
                        data: STANDARD.encode(artifact.read().await?),
                    }),
                })
            }
        }
    }
}

/// Extractor for the image capability
pub struct ImageExtractor;

fn image_mime(ext: Option<&str>) -> &'static str {
    match ext {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "image/jpeg",
    }
}

#[async_trait]
impl Extractor for ImageExtractor {
    fn capability(&self) -> Capability {
        Capability::Image
    }

    async fn extract(
        &self,
        task: &TaskEnvelope,
        artifact: &ScopedArtifact,
    ) -> Result<Extracted, DispatchError> {
        let bytes = artifact.read().await?;
        if bytes.is_empty() {
            return Err(DispatchError::Extraction("image is empty".to_string()));
        }

        let mime_type = match &task.payload_ref.mime_type {
            Some(mime) if mime.starts_with("image/") => mime.clone(),
            _ => image_mime(artifact_extension(task, artifact).as_deref()).to_string(),
        };

        Ok(Extracted {
            text: None,
            media: Some(InlineMedia {
                mime_type,
                data: STANDARD.encode(bytes),
            }),
        })
    }
}
