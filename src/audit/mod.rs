//! Audit pipeline: producers append without blocking onto a bounded queue;
//! a single consumer drains to storage in batches of up to 100 or every 5s,
//! whichever comes first. On overflow the oldest info-level events are
//! dropped first; warn/error events survive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::domain::{AuditEvent, AuditLevel};
use crate::repository::AuditRepository;

const QUEUE_CAPACITY: usize = 1024;
const BATCH_MAX: usize = 100;
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

struct Shared {
    queue: Mutex<VecDeque<AuditEvent>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Shared {
    /// A poisoned lock only means a producer panicked mid-append; the queue
    /// itself is still usable.
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEvent>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clonable producer handle
#[derive(Clone)]
pub struct AuditSink {
    shared: Arc<Shared>,
}

impl AuditSink {
    /// Create the sink and spawn its consumer task. The task drains the
    /// queue to `repo` and exits (after a final drain) when `shutdown`
    /// flips to true.
    pub fn spawn(
        repo: Arc<dyn AuditRepository>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });

        let sink = Self {
            shared: shared.clone(),
        };

        let handle = tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
            flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = flush_tick.tick() => {
                        flush_all(&shared, repo.as_ref()).await;
                    }
                    _ = shared.notify.notified() => {
                        if queued(&shared) >= BATCH_MAX {
                            flush_all(&shared, repo.as_ref()).await;
                        }
                    }
                    result = shutdown.changed() => {
                        flush_all(&shared, repo.as_ref()).await;
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            let dropped = shared.dropped.load(Ordering::Relaxed);
            if dropped > 0 {
                warn!(dropped, "audit sink dropped events under overflow");
            }
            debug!("audit sink drained and stopped");
        });

        (sink, handle)
    }

    /// Enqueue an event; never blocks the caller.
    pub fn append(&self, event: AuditEvent) {
        {
            let mut queue = self.shared.lock_queue();
            if queue.len() >= QUEUE_CAPACITY {
                // Shed load: oldest info event goes first. If none exists
                // and the incoming event is info itself, the incoming one
                // is dropped; otherwise the oldest event of any level goes,
                // keeping memory bounded.
                if let Some(pos) = queue.iter().position(|e| e.level == AuditLevel::Info) {
                    queue.remove(pos);
                } else if event.level == AuditLevel::Info {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                } else {
                    queue.pop_front();
                }
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }

    /// Total events shed by the overflow policy since startup
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn queued_events(&self) -> Vec<AuditEvent> {
        self.shared.lock_queue().iter().cloned().collect()
    }
}

fn queued(shared: &Shared) -> usize {
    shared.lock_queue().len()
}

fn take_batch(shared: &Shared) -> Vec<AuditEvent> {
    let mut queue = shared.lock_queue();
    let take = queue.len().min(BATCH_MAX);
    queue.drain(..take).collect()
}

async fn flush_all(shared: &Shared, repo: &dyn AuditRepository) {
    loop {
        let batch = take_batch(shared);
        if batch.is_empty() {
            return;
        }
        if let Err(e) = repo.append_audit_batch(&batch).await {
            // The batch is lost; producers keep running and the next tick
            // retries whatever has queued since.
            error!(batch = batch.len(), "failed to persist audit batch: {e}");
            return;
        }
    }
}
