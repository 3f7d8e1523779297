//! Command handlers for CLI operations
//!
//! One handler per role:
//! - broker: serve the message bus over WebSocket
//! - coordinator: Telegram front end plus dispatch and correlation
//! - worker: process tasks of one capability
//! - check: validate configuration and report live workers

use anyhow::{Context, Result};
use courier_sdk::{Capability, RESULTS_CHANNEL};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::bot::telegram::{TelegramApi, TelegramFrontend};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::daemon::{join_with_grace, Shutdown};
use crate::llm::gemini::GeminiProvider;
use crate::llm::AnalysisProvider;
use crate::message_bus::{
    worker_counts, Broker, InMemoryBus, MessageBus, WsBus, CHANNEL_BUFFER_SIZE,
};
use crate::secrets::{SecretManager, SERVICE_NAME};
use crate::worker::artifact::{ArtifactStore, LocalFileResolver, TelegramFileResolver};
use crate::worker::extract::extractor_for;
use crate::worker::WorkerRuntime;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

async fn connect_bus(config: &Config, secrets: &SecretManager) -> Result<WsBus> {
    let token = secrets.resolve_optional(&config.bus.auth_token_key)?;
    let bus = WsBus::connect(
        &config.bus.endpoint,
        token.as_ref().map(|t| t.expose()),
        config.bus.backoff(),
    )
    .await?;
    Ok(bus)
}

fn telegram_api(config: &Config, secrets: &SecretManager) -> Result<TelegramApi> {
    let token = secrets
        .resolve(&config.telegram.token_key)
        .context("Telegram bot token is required")?;
    Ok(TelegramApi::new(config.telegram.api_base.clone(), token))
}

/// Run the bus broker until interrupted
pub async fn handle_broker(config: &Config) -> Result<()> {
    let secrets = SecretManager::new(SERVICE_NAME);
    let token = secrets.resolve_optional(&config.bus.auth_token_key)?;
    if token.is_none() {
        tracing::warn!(
            "No bus token configured ({}); the broker accepts any client",
            config.bus.auth_token_key
        );
    }

    let listener = TcpListener::bind(&config.bus.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.bus.listen))?;

    let shutdown = Shutdown::new();
    let _signals = shutdown.install_signal_handler();

    let broker = Broker::new(InMemoryBus::new(), token.map(|t| t.expose().to_string()));
    let wait = shutdown.clone();
    broker.serve(listener, async move { wait.wait().await }).await
}

/// Run the coordinator and its Telegram front end until interrupted
pub async fn handle_coordinator(config: &Config) -> Result<()> {
    let secrets = SecretManager::new(SERVICE_NAME);
    let api = telegram_api(config, &secrets)?;
    let bus = connect_bus(config, &secrets).await?;

    let shutdown = Shutdown::new();
    let _signals = shutdown.install_signal_handler();

    let coordinator = Coordinator::new(Arc::new(bus), Arc::new(api.clone()), config);

    let (events_tx, events_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let frontend = TelegramFrontend::new(
        api,
        config.telegram.allowed_users.clone(),
        config.telegram.poll_timeout_secs,
    );
    let frontend = tokio::spawn(frontend.run(events_tx, shutdown.clone()));

    tracing::info!("Coordinator started");
    let outcome = coordinator.run(events_rx, shutdown.clone()).await;

    // The loop can also end on a fatal error; stop the front end either way
    shutdown.trigger();
    join_with_grace(frontend, "Telegram front end").await;

    tracing::info!(
        "Coordinator stopped with {} task(s) still outstanding",
        coordinator.outstanding().await
    );
    outcome.map_err(Into::into)
}

/// Run a worker for `capability` until interrupted
pub async fn handle_worker(capability: Capability, config: &Config) -> Result<()> {
    let secrets = SecretManager::new(SERVICE_NAME);
    let api_key = secrets
        .resolve(&config.analysis.api_key_key)
        .context("Analysis API key is required")?;

    let mut store = ArtifactStore::new(
        config.core.scratch_dir.join(capability.as_str()),
        config.limits.max_artifact_bytes,
    )
    .with_resolver(Arc::new(LocalFileResolver));

    match secrets.resolve_optional(&config.telegram.token_key)? {
        Some(token) => {
            let api = TelegramApi::new(config.telegram.api_base.clone(), token);
            store = store.with_resolver(Arc::new(TelegramFileResolver::new(api)));
        }
        None => tracing::warn!(
            "No Telegram token ({}); only file: payloads can be fetched",
            config.telegram.token_key
        ),
    }

    let analyzer = GeminiProvider::new(config.analysis.clone(), api_key);
    let bus = connect_bus(config, &secrets).await?;

    let shutdown = Shutdown::new();
    let _signals = shutdown.install_signal_handler();

    let runtime = WorkerRuntime::new(
        capability,
        Arc::new(bus),
        store,
        extractor_for(capability, config),
        Arc::new(analyzer),
        config,
    );

    tracing::info!("Worker for {} started", capability);
    runtime.run(shutdown).await?;
    tracing::info!("Worker for {} stopped", capability);
    Ok(())
}

/// Result of the `check` command
#[derive(Debug, Default)]
pub struct CheckReport {
    pub checks: Vec<(String, String)>,
    pub issues: Vec<String>,
}

impl CheckReport {
    fn check(&mut self, name: impl Into<String>, status: impl Into<String>) {
        self.checks.push((name.into(), status.into()));
    }

    pub fn healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Add live subscriber counts for every task channel and the results channel
pub async fn check_subscribers(bus: &dyn MessageBus, report: &mut CheckReport) {
    for (capability, count) in worker_counts(bus).await {
        let channel = capability.task_channel();
        match count {
            Ok(0) => {
                report.check(channel, "No workers");
                report
                    .issues
                    .push(format!("No {} worker is running; tasks will time out", capability));
            }
            Ok(n) => report.check(channel, format!("{} worker(s)", n)),
            Err(e) => {
                report.check(channel, "Error");
                report.issues.push(format!("Cannot count subscribers: {}", e));
            }
        }
    }

    match bus.subscriber_count(RESULTS_CHANNEL).await {
        Ok(0) => {
            report.check(RESULTS_CHANNEL, "No coordinator");
            report
                .issues
                .push("No coordinator is listening for results".to_string());
        }
        Ok(n) => report.check(RESULTS_CHANNEL, format!("{} subscriber(s)", n)),
        Err(e) => {
            report.check(RESULTS_CHANNEL, "Error");
            report.issues.push(format!("Cannot count subscribers: {}", e));
        }
    }
}

fn check_secret(
    secrets: &SecretManager,
    key: &str,
    label: &str,
    required: bool,
    report: &mut CheckReport,
) {
    match secrets.resolve_optional(key) {
        Ok(Some(_)) => report.check(label, "Configured"),
        Ok(None) if required => {
            report.check(label, "Missing");
            report
                .issues
                .push(format!("Set {} in the environment or keychain", key));
        }
        Ok(None) => report.check(label, "Not configured"),
        Err(e) => {
            report.check(label, "Error");
            report.issues.push(e.to_string());
        }
    }
}

/// Report whether the analysis provider answers with its credentials
pub async fn check_analysis(provider: &dyn AnalysisProvider, report: &mut CheckReport) {
    if provider.check_health().await {
        report.check("Analysis provider", format!("Reachable ({})", provider.name()));
    } else {
        report.check("Analysis provider", "Unreachable");
        report.issues.push(format!(
            "The {} API did not accept the configured key and model",
            provider.name()
        ));
    }
}

/// Validate configuration and credentials, then report live workers
pub async fn handle_check(config: &Config, format: OutputFormat) -> Result<()> {
    let secrets = SecretManager::new(SERVICE_NAME);
    let mut report = CheckReport::default();

    // Config is already validated when loaded
    report.check("Configuration", "Valid");

    if config.core.scratch_dir.exists() {
        report.check("Scratch directory", "Exists");
    } else {
        report.check("Scratch directory", "Created on first task");
    }

    check_secret(&secrets, &config.telegram.token_key, "Telegram token", true, &mut report);
    check_secret(&secrets, &config.analysis.api_key_key, "Analysis API key", true, &mut report);
    check_secret(&secrets, &config.bus.auth_token_key, "Bus token", false, &mut report);

    if let Ok(Some(api_key)) = secrets.resolve_optional(&config.analysis.api_key_key) {
        let provider = GeminiProvider::new(config.analysis.clone(), api_key);
        check_analysis(&provider, &mut report).await;
    }

    report.check(
        "Document converter",
        if config.extractors.document_converter.is_empty() {
            "Not configured (built-in readers, no legacy formats)"
        } else {
            "Configured"
        },
    );
    report.check(
        "Transcriber",
        if config.extractors.transcriber.is_empty() {
            "Not configured (audio sent inline)"
        } else {
            "Configured"
        },
    );

    match connect_bus(config, &secrets).await {
        Ok(bus) if bus.is_connected() => {
            report.check("Bus broker", "Connected");
            check_subscribers(&bus, &mut report).await;
        }
        Ok(_) => {
            report.check("Bus broker", "Disconnected");
            report
                .issues
                .push(format!("Lost the connection to {}", config.bus.endpoint));
        }
        Err(e) => {
            report.check("Bus broker", "Unreachable");
            report.issues.push(format!("{:#}", e));
        }
    }

    match format {
        OutputFormat::Text => {
            println!("Courier Diagnostics");
            println!("===================");
            println!();

            println!("Checks:");
            for (check, status) in &report.checks {
                println!("  {:<25} {}", format!("{}:", check), status);
            }

            println!();

            if report.healthy() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in report.issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": report.checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": report.issues,
                "healthy": report.healthy()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_subscribers_reports_missing_workers() {
        let bus = InMemoryBus::new();
        let _doc = bus.subscribe("document_tasks").await.unwrap();
        let _results = bus.subscribe(RESULTS_CHANNEL).await.unwrap();

        let mut report = CheckReport::default();
        check_subscribers(&bus, &mut report).await;

        assert!(report
            .checks
            .contains(&("document_tasks".to_string(), "1 worker(s)".to_string())));
        assert!(report
            .checks
            .contains(&("audio_tasks".to_string(), "No workers".to_string())));
        assert_eq!(report.issues.len(), 2);
        assert!(!report.healthy());
    }

    struct FixedHealth(bool);

    #[async_trait::async_trait]
    impl AnalysisProvider for FixedHealth {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn analyze(
            &self,
            _request: &crate::llm::AnalysisRequest,
        ) -> crate::llm::Result<String> {
            Ok("ok".to_string())
        }

        async fn check_health(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn test_check_analysis() {
        let mut report = CheckReport::default();
        check_analysis(&FixedHealth(true), &mut report).await;
        assert_eq!(
            report.checks,
            vec![("Analysis provider".to_string(), "Reachable (fixed)".to_string())]
        );
        assert!(report.healthy());

        let mut report = CheckReport::default();
        check_analysis(&FixedHealth(false), &mut report).await;
        assert!(!report.healthy());
        assert!(report.issues[0].contains("fixed"));
    }

    #[tokio::test]
    async fn test_check_subscribers_all_live() {
        let bus = InMemoryBus::new();
        let mut subs = Vec::new();
        for capability in Capability::ALL {
            subs.push(bus.subscribe(&capability.task_channel()).await.unwrap());
        }
        subs.push(bus.subscribe(RESULTS_CHANNEL).await.unwrap());

        let mut report = CheckReport::default();
        check_subscribers(&bus, &mut report).await;
        assert!(report.healthy());
        assert_eq!(report.checks.len(), 4);
    }
}
