//! Coordinator
//!
//! Classifies conversation events, publishes tasks on the capability
//! channels and reconciles results, progress and timeouts back to the
//! originating conversation. The conversation never waits on a task: every
//! event is acknowledged as soon as its task is on the bus.
//!
//! All correlation bookkeeping goes through one [`CorrelationTable`] behind a
//! single mutex. Dispatch inserts, result matching and the timeout sweep
//! remove, and whichever removal comes first wins.

use chrono::{DateTime, Utc};
use courier_sdk::{
    progress_channel, Capability, DispatchError, Envelope, PayloadRef, ProgressEvent,
    ResultEnvelope, TaskEnvelope, RESULTS_CHANNEL,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bot::{ConversationSink, InboundEvent};
use crate::config::{Config, CoordinatorConfig, LimitsConfig};
use crate::daemon::Shutdown;
use crate::message_bus::{
    publish_envelope, subscribe_with_retry, worker_counts, Backoff, MessageBus,
    CHANNEL_BUFFER_SIZE,
};

pub mod classify;
pub mod correlation;
pub mod format;
pub mod supervisor;

pub use classify::{classify, Route};
pub use correlation::{CorrelationRecord, CorrelationTable};
pub use supervisor::Supervisor;

pub struct Coordinator {
    bus: Arc<dyn MessageBus>,
    sink: Arc<dyn ConversationSink>,
    limits: LimitsConfig,
    settings: CoordinatorConfig,
    backoff: Backoff,
    supervisor: Supervisor,
    table: Mutex<CorrelationTable>,

    /// Progress forwarders, one per conversation with outstanding tasks
    progress: Mutex<HashMap<String, JoinHandle<()>>>,
    progress_tx: mpsc::Sender<String>,
    progress_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Coordinator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        sink: Arc<dyn ConversationSink>,
        config: &Config,
    ) -> Self {
        let (progress_tx, progress_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        Self {
            bus,
            sink,
            limits: config.limits.clone(),
            settings: config.coordinator.clone(),
            backoff: config.bus.backoff(),
            supervisor: Supervisor::new(config.limits.sweep_interval()),
            table: Mutex::new(CorrelationTable::new()),
            progress: Mutex::new(HashMap::new()),
            progress_tx,
            progress_rx: Mutex::new(Some(progress_rx)),
        }
    }

    /// Number of open correlation records
    pub async fn outstanding(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Whether a progress subscription is held for the conversation
    pub async fn has_progress_subscription(&self, conversation_id: &str) -> bool {
        self.progress.lock().await.contains_key(conversation_id)
    }

    async fn reply(&self, conversation_id: &str, text: &str) {
        if let Err(e) = self.sink.send(conversation_id, text).await {
            error!("Failed to reply to conversation {}: {}", conversation_id, e);
        }
    }

    /// Handle one inbound conversation event
    pub async fn handle_event(&self, event: InboundEvent) {
        let InboundEvent {
            conversation_id,
            originator_id,
            content,
        } = event;

        match classify(content, &self.limits) {
            Ok(Route::Unclassified) => self.reply(&conversation_id, format::USAGE_TEXT).await,
            Ok(Route::Command { name, .. }) => self.handle_command(&conversation_id, &name).await,
            Ok(Route::Dispatch(capability, payload)) => {
                let eta = classify::estimate_processing_time(capability, &payload);
                let task = TaskEnvelope::new(capability, &conversation_id, originator_id, payload);

                match self.dispatch(task).await {
                    Ok(task) => {
                        let ack = format::acknowledgement(capability, &task.payload_ref, eta);
                        self.reply(&conversation_id, &ack).await;
                    }
                    Err(e) => {
                        warn!("Dispatch for conversation {} failed: {}", conversation_id, e);
                        self.reply(&conversation_id, &format::transient_failure(&e))
                            .await;
                    }
                }
            }
            Err(e) => {
                info!("Rejected input from conversation {}: {}", conversation_id, e);
                self.reply(&conversation_id, &format::rejection(&e)).await;
            }
        }
    }

    async fn handle_command(&self, conversation_id: &str, name: &str) {
        let reply = match name {
            "start" => format::START_TEXT.to_string(),
            "help" => format::HELP_TEXT.to_string(),
            "status" => {
                let table = self.table.lock().await;
                format::status_message(&table.outstanding_for(conversation_id), Utc::now())
            }
            "bots" => format::bots_message(&worker_counts(self.bus.as_ref()).await),
            other => format!("Unknown command: /{}", other),
        };
        self.reply(conversation_id, &reply).await;
    }

    /// Publish a task and open its correlation record
    ///
    /// The record exists before the task reaches the bus, so a fast result
    /// always finds it. If publishing fails the record is removed again and
    /// no bookkeeping remains.
    pub async fn dispatch(&self, task: TaskEnvelope) -> Result<TaskEnvelope, DispatchError> {
        let channel = task.capability.task_channel();

        if self.settings.require_live_worker && self.bus.subscriber_count(&channel).await? == 0 {
            return Err(DispatchError::NoLiveWorker(task.capability));
        }

        if self.settings.relay_progress {
            self.hold_progress(&task.conversation_id).await;
        }

        let record = CorrelationRecord::for_task(&task, self.limits.task_timeout());
        let inserted = self.table.lock().await.insert(record);
        if let Err(e) = inserted {
            self.release_progress_if_idle(&task.conversation_id).await;
            return Err(e);
        }

        if let Err(e) = publish_envelope(self.bus.as_ref(), &channel, &task).await {
            self.table.lock().await.discard(&task.correlation_id);
            self.release_progress_if_idle(&task.conversation_id).await;
            return Err(e);
        }

        info!(
            "Dispatched {} task {} for conversation {}",
            task.capability, task.correlation_id, task.conversation_id
        );
        Ok(task)
    }

    /// Build and dispatch a task without going through a conversation event
    pub async fn dispatch_payload(
        &self,
        capability: Capability,
        conversation_id: &str,
        originator_id: &str,
        payload: PayloadRef,
    ) -> Result<TaskEnvelope, DispatchError> {
        self.dispatch(TaskEnvelope::new(
            capability,
            conversation_id,
            originator_id,
            payload,
        ))
        .await
    }

    /// Deliver a result to its conversation
    ///
    /// Returns `false` when no record matched: the task already timed out,
    /// or this is a duplicate. Such results are logged and dropped.
    pub async fn handle_result(&self, result: ResultEnvelope) -> bool {
        let record = self.table.lock().await.resolve(&result.correlation_id);
        let Some(record) = record else {
            warn!(
                "Dropping {} result for unknown or expired task {}",
                result.capability, result.correlation_id
            );
            return false;
        };

        if record.conversation_id != result.conversation_id {
            warn!(
                "Result {} names conversation {}, delivering to {}",
                result.correlation_id, result.conversation_id, record.conversation_id
            );
        }

        info!(
            "Task {} completed with status {:?}",
            record.correlation_id, result.status
        );
        self.reply(
            &record.conversation_id,
            &format::result_message(&record, &result),
        )
        .await;
        self.release_progress_if_idle(&record.conversation_id).await;
        true
    }

    /// Relay a progress event; events for unknown tasks are ignored
    pub async fn handle_progress(&self, event: ProgressEvent) {
        let record = self
            .table
            .lock()
            .await
            .outstanding_for(&event.conversation_id)
            .into_iter()
            .find(|r| r.correlation_id == event.correlation_id)
            .cloned();

        match record {
            Some(record) => {
                self.reply(&record.conversation_id, &format::progress_message(&record, &event))
                    .await
            }
            None => debug!("Ignoring progress for unknown task {}", event.correlation_id),
        }
    }

    /// Evict records past their deadline and notify their conversations
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let evicted = {
            let mut table = self.table.lock().await;
            self.supervisor.sweep(&mut table, now)
        };

        for record in &evicted {
            self.reply(&record.conversation_id, &format::timeout_notice(record))
                .await;
            self.release_progress_if_idle(&record.conversation_id).await;
        }
        evicted.len()
    }

    async fn hold_progress(&self, conversation_id: &str) {
        let mut progress = self.progress.lock().await;
        if progress
            .get(conversation_id)
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }

        match self.bus.subscribe(&progress_channel(conversation_id)).await {
            Ok(mut subscription) => {
                let tx = self.progress_tx.clone();
                let handle = tokio::spawn(async move {
                    while let Some(raw) = subscription.recv().await {
                        if tx.send(raw).await.is_err() {
                            break;
                        }
                    }
                });
                progress.insert(conversation_id.to_string(), handle);
            }
            Err(e) => warn!(
                "Progress updates unavailable for conversation {}: {}",
                conversation_id, e
            ),
        }
    }

    async fn release_progress_if_idle(&self, conversation_id: &str) {
        if self.table.lock().await.has_outstanding(conversation_id) {
            return;
        }
        if let Some(handle) = self.progress.lock().await.remove(conversation_id) {
            handle.abort();
            debug!("Released progress channel for conversation {}", conversation_id);
        }
    }

    /// Run the event loop until shutdown or until the event source closes
    ///
    /// Multiplexes inbound events, the result channel, relayed progress and
    /// the supervisor's sweep timer.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<InboundEvent>,
        shutdown: Shutdown,
    ) -> Result<(), DispatchError> {
        let mut progress_rx = self
            .progress_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| DispatchError::Config("coordinator is already running".to_string()))?;

        let mut backoff = self.backoff.clone();
        let mut results = self.bus.subscribe(RESULTS_CHANNEL).await?;
        let mut ticker = self.supervisor.ticker();

        info!(
            "Coordinator running (task timeout {:?}, sweep every {:?})",
            self.limits.task_timeout(),
            self.supervisor.interval()
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Conversation event source closed");
                        break;
                    }
                },
                raw = results.recv() => match raw {
                    Some(raw) => match ResultEnvelope::decode(&raw) {
                        Ok(result) => {
                            self.handle_result(result).await;
                        }
                        Err(e) => warn!("Dropping malformed result: {}", e),
                    },
                    None => {
                        warn!("Result subscription ended, resubscribing");
                        match subscribe_with_retry(
                            self.bus.as_ref(),
                            RESULTS_CHANNEL,
                            &mut backoff,
                            &shutdown,
                        )
                        .await
                        {
                            Some(subscription) => results = subscription,
                            None => break,
                        }
                    }
                },
                Some(raw) = progress_rx.recv() => match ProgressEvent::decode(&raw) {
                    Ok(event) => self.handle_progress(event).await,
                    Err(e) => warn!("Dropping malformed progress event: {}", e),
                },
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }

        for (_, handle) in self.progress.lock().await.drain() {
            handle.abort();
        }
        *self.progress_rx.lock().await = Some(progress_rx);

        let outstanding = self.outstanding().await;
        if outstanding > 0 {
            warn!("Coordinator stopped with {} task(s) outstanding", outstanding);
        }
        info!("Coordinator stopped");
        Ok(())
    }
}
