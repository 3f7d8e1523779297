//! Scoped artifacts
//!
//! A worker never holds artifact bytes outside a [`ScopedArtifact`]. Each one
//! owns a private temporary directory under the configured scratch dir; the
//! directory and everything in it is removed when the artifact is dropped,
//! whichever way processing ends (success, error, or panic unwinding).

use async_trait::async_trait;
use courier_sdk::{DispatchError, PayloadRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::bot::telegram::TelegramApi;

/// Fallback name when the payload carries no usable file name
const DEFAULT_FILE_NAME: &str = "artifact";

/// Fetches the bytes behind a payload reference
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    /// URI scheme this resolver serves (`telegram`, `file`)
    fn scheme(&self) -> &'static str;

    /// Write the artifact to `dest`, returning its size in bytes
    ///
    /// Must fail with `ArtifactTooLarge` instead of writing more than
    /// `max_bytes`.
    async fn fetch(
        &self,
        payload: &PayloadRef,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, DispatchError>;
}

/// Downloaded artifact bound to a temporary directory
#[derive(Debug)]
pub struct ScopedArtifact {
    dir: TempDir,
    path: PathBuf,
    file_name: String,
    size_bytes: u64,
}

impl ScopedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Directory removed when this artifact drops
    pub fn scope_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Read the whole artifact into memory
    pub async fn read(&self) -> Result<Vec<u8>, DispatchError> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}

/// Resolves payload references into scoped artifacts
pub struct ArtifactStore {
    scratch_dir: PathBuf,
    max_bytes: u64,
    resolvers: HashMap<&'static str, Arc<dyn ArtifactResolver>>,
}

impl ArtifactStore {
    pub fn new(scratch_dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            max_bytes,
            resolvers: HashMap::new(),
        }
    }

    /// Register a resolver for its scheme, replacing any previous one
    pub fn with_resolver(mut self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        self.resolvers.insert(resolver.scheme(), resolver);
        self
    }

    /// Download the artifact into a fresh scoped directory
    ///
    /// # Errors
    /// - `ArtifactTooLarge` when the declared or actual size exceeds the limit
    /// - `ArtifactDownload` when the reference cannot be resolved
    /// - `Io` when the scratch directory cannot be created
    pub async fn acquire(&self, payload: &PayloadRef) -> Result<ScopedArtifact, DispatchError> {
        if let Some(size) = payload.size_bytes {
            if size > self.max_bytes {
                return Err(DispatchError::ArtifactTooLarge {
                    size,
                    limit: self.max_bytes,
                });
            }
        }

        let scheme = payload.scheme().ok_or_else(|| {
            DispatchError::ArtifactDownload(format!("artifact reference has no scheme: {}", payload.uri))
        })?;
        let resolver = self.resolvers.get(scheme).ok_or_else(|| {
            DispatchError::ArtifactDownload(format!("unsupported artifact scheme '{}'", scheme))
        })?;

        let dir = tempfile::Builder::new()
            .prefix("courier-")
            .tempdir_in(&self.scratch_dir)?;
        let file_name = sanitize_file_name(payload.file_name.as_deref());
        let path = dir.path().join(&file_name);

        // On error `dir` drops here and takes any partial download with it
        let size_bytes = resolver.fetch(payload, &path, self.max_bytes).await?;
        tracing::debug!("Fetched {} ({} bytes) into {:?}", payload.uri, size_bytes, dir.path());

        Ok(ScopedArtifact {
            dir,
            path,
            file_name,
            size_bytes,
        })
    }
}

/// Keep only the final path component and drop characters that are unsafe
/// in file names
fn sanitize_file_name(name: Option<&str>) -> String {
    let base = name
        .and_then(|n| Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_FILE_NAME);

    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

/// Artifacts on a filesystem shared with the front end (`file:<path>`)
pub struct LocalFileResolver;

#[async_trait]
impl ArtifactResolver for LocalFileResolver {
    fn scheme(&self) -> &'static str {
        "file"
    }

    async fn fetch(
        &self,
        payload: &PayloadRef,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, DispatchError> {
        let source = Path::new(payload.locator());
        let metadata = tokio::fs::metadata(source).await.map_err(|e| {
            DispatchError::ArtifactDownload(format!("cannot read {}: {}", source.display(), e))
        })?;

        if !metadata.is_file() {
            return Err(DispatchError::ArtifactDownload(format!(
                "{} is not a file",
                source.display()
            )));
        }
        if metadata.len() > max_bytes {
            return Err(DispatchError::ArtifactTooLarge {
                size: metadata.len(),
                limit: max_bytes,
            });
        }

        tokio::fs::copy(source, dest).await.map_err(|e| {
            DispatchError::ArtifactDownload(format!("copy of {} failed: {}", source.display(), e))
        })
    }
}

/// Files held by the Telegram Bot API (`telegram:<file_id>`)
pub struct TelegramFileResolver {
    api: TelegramApi,
}

impl TelegramFileResolver {
    pub fn new(api: TelegramApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ArtifactResolver for TelegramFileResolver {
    fn scheme(&self) -> &'static str {
        "telegram"
    }

    async fn fetch(
        &self,
        payload: &PayloadRef,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, DispatchError> {
        let file = self.api.get_file(payload.locator()).await?;

        if let Some(size) = file.file_size {
            if size > max_bytes {
                return Err(DispatchError::ArtifactTooLarge {
                    size,
                    limit: max_bytes,
                });
            }
        }

        let file_path = file.file_path.ok_or_else(|| {
            DispatchError::ArtifactDownload("Telegram returned no file path".to_string())
        })?;

        self.api.download_file(&file_path, dest, max_bytes).await
    }
}
