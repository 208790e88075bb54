//! Graceful shutdown: one watch channel fans the stop signal out to the
//! scheduler, hub, audit sink and in-flight operations, and the drain waits
//! for them inside a single budget (default 30s).

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Shutdown {
    tx: watch::Sender<bool>,
    budget: Duration,
}

impl Shutdown {
    pub fn new(budget: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx, budget }
    }

    /// A receiver that flips to `true` exactly once, at trigger time.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Trigger the signal and wait for the named tasks to finish within the
    /// budget. Tasks still running when the budget lapses are aborted.
    /// Returns true when everything drained cleanly.
    pub async fn drain(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) -> bool {
        self.trigger();
        info!(budget_secs = self.budget.as_secs(), "draining for shutdown");

        let deadline = tokio::time::Instant::now() + self.budget;
        let mut clean = true;

        for (name, handle) in tasks {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => info!(task = name, "drained"),
                Ok(Err(e)) => {
                    warn!(task = name, "task ended abnormally during drain: {e}");
                    clean = false;
                }
                Err(_) => {
                    warn!(task = name, "did not drain within budget, aborting");
                    abort.abort();
                    clean = false;
                }
            }
        }
        clean
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
