//! Worker runtime
//!
//! One worker process serves one capability. It holds a subscription on the
//! capability's task channel and processes tasks strictly one at a time:
//!
//! 1. acquire the artifact into a scoped temporary directory
//! 2. extract content and cut it to the character budget
//! 3. run the analysis collaborator
//! 4. publish exactly one result, whichever step failed
//!
//! Progress events are emitted between steps on a best-effort basis. The
//! pipeline runs in its own task, so a panic inside it still yields an
//! `internal` failure result, and the artifact is gone before the result is
//! published.

use courier_sdk::{
    progress_channel, Capability, DispatchError, Envelope, FailureKind, ProgressEvent,
    ResultEnvelope, ResultPayload, Stage, TaskEnvelope, RESULTS_CHANNEL,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::daemon::Shutdown;
use crate::llm::{AnalysisProvider, AnalysisRequest, LLMError};
use crate::message_bus::{publish_envelope, subscribe_with_retry, Backoff, MessageBus};
use crate::secrets::scrub;

pub mod artifact;
pub mod budget;
pub mod extract;
pub mod office;

use artifact::ArtifactStore;
use budget::bound_content;
use extract::Extractor;

/// Characters of extracted text echoed back alongside the summary
const EXCERPT_CHARS: usize = 1000;

/// Attempts to publish a result before giving up on it
const RESULT_PUBLISH_ATTEMPTS: usize = 5;

/// Everything one task needs; cloned into the spawned processing task
#[derive(Clone)]
struct Pipeline {
    capability: Capability,
    bus: Arc<dyn MessageBus>,
    store: Arc<ArtifactStore>,
    extractor: Arc<dyn Extractor>,
    analyzer: Arc<dyn AnalysisProvider>,
    char_budget: usize,
    analysis_timeout: Duration,
}

impl Pipeline {
    async fn progress(&self, task: &TaskEnvelope, stage: Stage) {
        let event = ProgressEvent::new(task, stage);
        let channel = progress_channel(&task.conversation_id);
        if let Err(e) = publish_envelope(self.bus.as_ref(), &channel, &event).await {
            debug!("Progress for {} not sent: {}", task.correlation_id, e);
        }
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, LLMError> {
        tokio::time::timeout(self.analysis_timeout, self.analyzer.analyze(request))
            .await
            .map_err(|_| LLMError::Timeout)?
    }

    async fn execute(&self, task: &TaskEnvelope) -> Result<ResultPayload, DispatchError> {
        let artifact = self.store.acquire(&task.payload_ref).await?;
        debug!(
            "Task {}: acquired {} ({} bytes)",
            task.correlation_id,
            artifact.file_name(),
            artifact.size_bytes()
        );
        self.progress(task, Stage::Downloaded).await;

        let extracted = self.extractor.extract(task, &artifact).await?;
        self.progress(task, Stage::Extracted).await;

        let bounded = extracted
            .text
            .as_deref()
            .map(|text| bound_content(text, self.char_budget));
        let truncated = bounded.as_ref().is_some_and(|b| b.truncated);
        if truncated {
            debug!("Task {}: content cut to {} characters", task.correlation_id, self.char_budget);
        }

        let request = match (bounded, extracted.media) {
            (Some(bounded), _) => AnalysisRequest::text(self.capability, bounded.text),
            (None, Some(media)) => AnalysisRequest::media(self.capability, media),
            (None, None) => {
                return Err(DispatchError::Extraction(
                    "nothing to analyze in the artifact".to_string(),
                ))
            }
        }
        .with_document_kind(task.payload_ref.extension());
        let artifact_name = Some(artifact.file_name().to_string());

        match self.analyze(&request).await {
            Ok(summary) => {
                self.progress(task, Stage::Analyzed).await;
                let excerpt = request
                    .text
                    .as_deref()
                    .filter(|_| self.capability != Capability::Image)
                    .map(|text| bound_content(text, EXCERPT_CHARS).text);
                Ok(ResultPayload::Analysis {
                    summary,
                    excerpt,
                    artifact_name,
                    truncated,
                    degraded: false,
                })
            }
            Err(e) => match request.text {
                Some(text) => {
                    warn!(
                        "Task {}: analysis via {} failed ({}), returning raw content",
                        task.correlation_id,
                        self.analyzer.name(),
                        e
                    );
                    Ok(ResultPayload::Analysis {
                        summary: text,
                        excerpt: None,
                        artifact_name,
                        truncated,
                        degraded: true,
                    })
                }
                None => Err(DispatchError::Analysis(e.to_string())),
            },
        }
    }
}

/// Task loop for one capability
pub struct WorkerRuntime {
    pipeline: Pipeline,
    backoff: Backoff,
}

impl WorkerRuntime {
    pub fn new(
        capability: Capability,
        bus: Arc<dyn MessageBus>,
        store: ArtifactStore,
        extractor: Arc<dyn Extractor>,
        analyzer: Arc<dyn AnalysisProvider>,
        config: &Config,
    ) -> Self {
        Self {
            pipeline: Pipeline {
                capability,
                bus,
                store: Arc::new(store),
                extractor,
                analyzer,
                char_budget: config.limits.char_budget,
                analysis_timeout: config.limits.analysis_timeout(),
            },
            backoff: config.bus.backoff(),
        }
    }

    pub fn capability(&self) -> Capability {
        self.pipeline.capability
    }

    /// Process one task and publish its result
    ///
    /// Always returns the result that was (or should have been) published.
    pub async fn process(&self, task: TaskEnvelope) -> ResultEnvelope {
        info!(
            "Processing {} task {} for conversation {}",
            task.capability, task.correlation_id, task.conversation_id
        );

        let pipeline = self.pipeline.clone();
        let job = task.clone();
        let outcome = tokio::spawn(async move { pipeline.execute(&job).await }).await;

        let result = match outcome {
            Ok(Ok(payload)) => ResultEnvelope::for_task(&task, payload),
            Ok(Err(e)) => {
                warn!("Task {} failed: {}", task.correlation_id, e);
                ResultEnvelope::failure(&task, e.failure_kind(), scrub(&e.to_string()))
            }
            Err(e) => {
                error!("Task {} aborted: {}", task.correlation_id, e);
                ResultEnvelope::failure(&task, FailureKind::Internal, "task processing panicked")
            }
        };

        self.publish_result(&result).await;
        result
    }

    async fn publish_result(&self, result: &ResultEnvelope) {
        let mut backoff = self.backoff.clone();
        for attempt in 1..=RESULT_PUBLISH_ATTEMPTS {
            match publish_envelope(self.pipeline.bus.as_ref(), RESULTS_CHANNEL, result).await {
                Ok(()) => {
                    debug!("Published result for {}", result.correlation_id);
                    return;
                }
                Err(e) if attempt < RESULT_PUBLISH_ATTEMPTS => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Publishing result for {} failed (attempt {}): {}",
                        result.correlation_id, attempt, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => error!(
                    "Giving up on result for {}: {}",
                    result.correlation_id, e
                ),
            }
        }
    }

    /// Consume tasks until shutdown
    ///
    /// The initial subscription must succeed; later subscription loss is
    /// retried with backoff. A task in progress when shutdown arrives is
    /// finished and its result published before returning.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), DispatchError> {
        let capability = self.capability();
        let channel = capability.task_channel();
        let mut backoff = self.backoff.clone();
        let mut tasks = self.pipeline.bus.subscribe(&channel).await?;
        info!("{} worker listening on {}", capability, channel);

        loop {
            let raw = tokio::select! {
                _ = shutdown.wait() => break,
                raw = tasks.recv() => raw,
            };

            match raw {
                Some(raw) => match TaskEnvelope::decode(&raw) {
                    Ok(task) if task.capability != capability => warn!(
                        "Ignoring {} task {} on {}",
                        task.capability, task.correlation_id, channel
                    ),
                    Ok(task) => {
                        self.process(task).await;
                    }
                    Err(e) => warn!("Dropping malformed task: {}", e),
                },
                None => {
                    warn!("Subscription to {} ended, resubscribing", channel);
                    match subscribe_with_retry(
                        self.pipeline.bus.as_ref(),
                        &channel,
                        &mut backoff,
                        &shutdown,
                    )
                    .await
                    {
                        Some(subscription) => tasks = subscription,
                        None => break,
                    }
                }
            }
        }

        info!("{} worker stopped", capability);
        Ok(())
    }
}
