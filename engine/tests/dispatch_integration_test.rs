//! End-to-end dispatch tests
//!
//! A coordinator and a document worker run their real event loops over one
//! in-memory bus. Conversation replies land in a `MemorySink`; the analysis
//! collaborator is scripted.

use async_trait::async_trait;
use courier_engine::bot::{InboundContent, InboundEvent, MemorySink};
use courier_engine::config::Config;
use courier_engine::coordinator::Coordinator;
use courier_engine::daemon::Shutdown;
use courier_engine::llm::{AnalysisProvider, AnalysisRequest, LLMError};
use courier_engine::message_bus::{publish_envelope, InMemoryBus, MessageBus};
use courier_engine::worker::artifact::{ArtifactStore, LocalFileResolver};
use courier_engine::worker::extract::DocumentExtractor;
use courier_engine::worker::WorkerRuntime;
use courier_sdk::{
    Capability, PayloadRef, ResultEnvelope, ResultPayload, TaskEnvelope, RESULTS_CHANNEL,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Analyzer that summarizes by echoing the first words of its input
struct EchoAnalyzer;

#[async_trait]
impl AnalysisProvider for EchoAnalyzer {
    fn name(&self) -> &str {
        "echo"
    }

    async fn analyze(&self, request: &AnalysisRequest) -> courier_engine::llm::Result<String> {
        let text = request
            .text
            .as_deref()
            .ok_or_else(|| LLMError::InvalidRequest("no text".to_string()))?;
        let words: Vec<&str> = text.split_whitespace().take(3).collect();
        Ok(format!("About: {}", words.join(" ")))
    }
}

struct System {
    bus: InMemoryBus,
    sink: MemorySink,
    coordinator: Arc<Coordinator>,
    events: mpsc::Sender<InboundEvent>,
    shutdown: Shutdown,
    handles: Vec<JoinHandle<()>>,
    scratch: TempDir,
    source: TempDir,
}

impl System {
    async fn start(config: Config, with_worker: bool) -> Self {
        let bus = InMemoryBus::new();
        let sink = MemorySink::new();
        let shutdown = Shutdown::new();
        let scratch = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let mut handles = Vec::new();

        let coordinator = Arc::new(Coordinator::new(
            Arc::new(bus.clone()),
            Arc::new(sink.clone()),
            &config,
        ));
        let (events, events_rx) = mpsc::channel(16);
        {
            let coordinator = Arc::clone(&coordinator);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                coordinator.run(events_rx, shutdown).await.unwrap();
            }));
        }
        wait_for_subscribers(&bus, RESULTS_CHANNEL).await;

        if with_worker {
            let store = ArtifactStore::new(scratch.path(), config.limits.max_artifact_bytes)
                .with_resolver(Arc::new(LocalFileResolver));
            let worker = WorkerRuntime::new(
                Capability::Document,
                Arc::new(bus.clone()),
                store,
                Arc::new(DocumentExtractor::new(None)),
                Arc::new(EchoAnalyzer),
                &config,
            );
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.run(shutdown).await.unwrap();
            }));
            wait_for_subscribers(&bus, &Capability::Document.task_channel()).await;
        }

        Self {
            bus,
            sink,
            coordinator,
            events,
            shutdown,
            handles,
            scratch,
            source,
        }
    }

    fn document(&self, name: &str, contents: Option<&str>) -> InboundEvent {
        let path = self.source.path().join(name);
        if let Some(contents) = contents {
            std::fs::write(&path, contents).unwrap();
        }
        InboundEvent::new(
            "C1",
            "U1",
            InboundContent::Document(PayloadRef::local(&path).with_file_name(name)),
        )
    }

    async fn send(&self, event: InboundEvent) {
        self.events.send(event).await.unwrap();
    }

    async fn wait_for_reply(&self, needle: &str) -> Vec<String> {
        for _ in 0..250 {
            let messages = self.sink.messages_for("C1").await;
            if messages.iter().any(|m| m.contains(needle)) {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "no reply containing {:?}; got {:?}",
            needle,
            self.sink.messages_for("C1").await
        );
    }

    async fn stop(self) {
        self.shutdown.trigger();
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

async fn wait_for_subscribers(bus: &InMemoryBus, channel: &str) {
    for _ in 0..250 {
        if bus.subscriber_count(channel).await.unwrap() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nobody subscribed to {}", channel);
}

#[tokio::test]
async fn test_document_round_trip() {
    let system = System::start(Config::default(), true).await;

    system
        .send(system.document("notes.txt", Some("quarterly revenue grew strongly")))
        .await;

    let replies = system.wait_for_reply("Summary of notes.txt").await;
    assert!(replies[0].starts_with("📄 Processing notes.txt."));
    let result = replies.iter().find(|m| m.contains("Summary of")).unwrap();
    assert!(result.contains("About: quarterly revenue grew"));
    assert!(result.contains("Beginning of the document"));

    assert_eq!(system.coordinator.outstanding().await, 0);
    // Scoped artifact directories are gone once the result is out
    assert_eq!(std::fs::read_dir(system.scratch.path()).unwrap().count(), 0);

    system.stop().await;
}

#[tokio::test]
async fn test_unreadable_artifact_reports_failure() {
    let system = System::start(Config::default(), true).await;

    system.send(system.document("missing.txt", None)).await;

    let replies = system.wait_for_reply("failed").await;
    let failure = replies.iter().find(|m| m.contains("failed")).unwrap();
    assert!(failure.starts_with("❌ Processing missing.txt failed"));

    assert_eq!(system.coordinator.outstanding().await, 0);
    assert_eq!(std::fs::read_dir(system.scratch.path()).unwrap().count(), 0);

    system.stop().await;
}

#[tokio::test]
async fn test_tasks_are_processed_one_at_a_time_in_order() {
    let system = System::start(Config::default(), true).await;

    system.send(system.document("a.txt", Some("alpha first file"))).await;
    system.send(system.document("b.txt", Some("beta second file"))).await;

    system.wait_for_reply("Summary of b.txt").await;
    let replies = system.wait_for_reply("Summary of a.txt").await;

    let position = |needle: &str| replies.iter().position(|m| m.contains(needle)).unwrap();
    assert!(position("Summary of a.txt") < position("Summary of b.txt"));
    assert_eq!(system.coordinator.outstanding().await, 0);

    system.stop().await;
}

#[tokio::test]
async fn test_missing_worker_times_out_and_late_result_is_dropped() {
    let mut config = Config::default();
    config.limits.task_timeout_secs = 1;
    config.limits.sweep_interval_secs = 1;
    let system = System::start(config, false).await;

    // Stand-in for a worker that never answers in time
    let mut tasks = system
        .bus
        .subscribe(&Capability::Document.task_channel())
        .await
        .unwrap();

    system
        .send(system.document("slow.txt", Some("nobody reads this")))
        .await;
    let task: TaskEnvelope = tasks.next_envelope().await.unwrap().unwrap();

    let replies = system.wait_for_reply("No response received").await;
    let before = replies.len();
    assert_eq!(system.coordinator.outstanding().await, 0);

    let late = ResultEnvelope::for_task(
        &task,
        ResultPayload::Analysis {
            summary: "too late".to_string(),
            excerpt: None,
            artifact_name: None,
            truncated: false,
            degraded: false,
        },
    );
    publish_envelope(&system.bus, RESULTS_CHANNEL, &late)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = system.sink.messages_for("C1").await;
    assert_eq!(after.len(), before);
    assert!(!after.iter().any(|m| m.contains("too late")));

    system.stop().await;
}

#[tokio::test]
async fn test_status_command_lists_outstanding_tasks() {
    let system = System::start(Config::default(), false).await;
    let _tasks = system
        .bus
        .subscribe(&Capability::Document.task_channel())
        .await
        .unwrap();

    system.send(system.document("pending.txt", Some("waiting"))).await;
    system.wait_for_reply("Processing pending.txt").await;

    system
        .send(InboundEvent::new(
            "C1",
            "U1",
            InboundContent::Command {
                name: "status".to_string(),
                args: String::new(),
            },
        ))
        .await;

    let replies = system.wait_for_reply("task(s) in progress").await;
    assert!(replies.iter().any(|m| m.contains("pending.txt")));

    system.stop().await;
}
