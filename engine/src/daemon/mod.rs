//! Process lifecycle management
//!
//! Every Courier role (broker, coordinator, worker) runs until it receives
//! SIGINT or SIGTERM. The signal flips a shared [`Shutdown`] handle that the
//! role's loops watch; in-flight work then gets a grace period to finish.
//!
//! # Examples
//!
//! ```no_run
//! use courier_engine::daemon::Shutdown;
//!
//! # async fn example() {
//! let shutdown = Shutdown::new();
//! let _signals = shutdown.install_signal_handler();
//!
//! shutdown.wait().await;
//! println!("stopping");
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Time granted to in-flight work after shutdown is signaled
pub const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Shared shutdown flag
///
/// Cloning is cheap; triggering any clone wakes every waiter.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal shutdown to every holder of this handle
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been signaled
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Trigger shutdown on SIGINT or SIGTERM
    ///
    /// Returns a `JoinHandle` for the signal handler task.
    #[cfg(unix)]
    pub fn install_signal_handler(&self) -> JoinHandle<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown = self.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT signal"),
                        _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("Received SIGINT signal");
                }
            }
            shutdown.trigger();
        })
    }

    /// Trigger shutdown on Ctrl-C
    #[cfg(not(unix))]
    pub fn install_signal_handler(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl-C");
            shutdown.trigger();
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a role's main task, giving up after [`GRACE_PERIOD`]
pub async fn join_with_grace<T>(handle: JoinHandle<T>, name: &str) -> Option<T> {
    match tokio::time::timeout(GRACE_PERIOD, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::error!("{} task failed: {}", name, e);
            None
        }
        Err(_) => {
            tracing::warn!("Timeout waiting for {} to stop - proceeding with shutdown", name);
            None
        }
    }
}
