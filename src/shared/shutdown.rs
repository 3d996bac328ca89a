//! Graceful shutdown handling
//!
//! One [`ShutdownSignal`] is shared by the accept loop and the liveness
//! monitor. [`ShutdownCoordinator::drain`] then waits for the named
//! background tasks, bounded by the configured timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown signal that can be cloned and shared across tasks
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            info!("🛑 Shutdown signal triggered");
            let _ = self.sender.send(());
        }
    }

    /// Resolves once shutdown has been triggered, including when it already was.
    pub async fn wait(&self) {
        self.notified().wait().await;
    }

    pub fn notified(&self) -> ShutdownNotified {
        ShutdownNotified {
            receiver: self.sender.subscribe(),
            triggered: self.triggered.clone(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A future that resolves when shutdown is triggered
pub struct ShutdownNotified {
    receiver: broadcast::Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownNotified {
    pub async fn wait(mut self) {
        if self.triggered.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.receiver.recv().await;
    }
}

/// Listen for OS shutdown signals (SIGTERM, SIGINT)
pub async fn listen_for_shutdown_signals(shutdown: ShutdownSignal) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("📡 Received SIGINT signal (Ctrl+C)");
            }
        }

        shutdown.trigger();
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        info!("📡 Received Ctrl+C signal");
        shutdown.trigger();
    }
}

/// Graceful shutdown coordinator
pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            signal: ShutdownSignal::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn start_signal_listener(&self) {
        let signal = self.signal.clone();
        tokio::spawn(async move {
            listen_for_shutdown_signals(signal).await;
        });
    }

    /// Wait for the signal, then join `tasks` in order within the shutdown
    /// timeout. Returns `false` when some task was still running at the
    /// deadline; a task that panicked counts as stopped.
    pub async fn drain(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) -> bool {
        self.signal.wait().await;
        info!(
            tasks = tasks.len(),
            "⏳ Draining background tasks (timeout: {}s)...",
            self.timeout.as_secs()
        );

        let join_all = async {
            for (name, task) in tasks {
                if let Err(e) = task.await {
                    error!(task = name, error = %e, "Background task failed");
                }
            }
        };

        match tokio::time::timeout(self.timeout, join_all).await {
            Ok(()) => {
                info!("✅ Background tasks stopped");
                true
            }
            Err(_) => {
                warn!("Background tasks still running after {}s", self.timeout.as_secs());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notified_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let notified = signal.notified();
        assert!(!signal.is_triggered());

        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), notified.wait())
            .await
            .expect("notified should resolve");
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn wait_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("already triggered");
    }

    #[tokio::test]
    async fn drain_joins_finished_and_failed_tasks() {
        let coordinator = ShutdownCoordinator::new(1);
        coordinator.signal().trigger();

        let quick = tokio::spawn(async {});
        let failed = tokio::spawn(async { panic!("task failure") });
        assert!(coordinator.drain(vec![("quick", quick), ("failed", failed)]).await);
    }

    #[tokio::test]
    async fn drain_gives_up_at_the_deadline() {
        let coordinator = ShutdownCoordinator::new(1);
        coordinator.signal().trigger();

        let stuck = tokio::spawn(std::future::pending::<()>());
        let started = std::time::Instant::now();
        assert!(!coordinator.drain(vec![("stuck", stuck)]).await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
