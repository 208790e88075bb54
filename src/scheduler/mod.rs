//! Health scheduler: a single coordinator task ticks on a monotonic
//! interval, enumerates enabled environments and dispatches due probes into
//! a bounded worker pool. Dispatch never blocks: when the pool is
//! saturated a probe is skipped for this tick (with a warn audit) and
//! reconsidered on the next one.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::domain::{AuditEvent, AuditKind, AuditLevel, EnvironmentFilter, Page};
use crate::probe::ProbeRunner;
use crate::repository::{EnvironmentRepository as _, Store};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period; the finest probe granularity
    pub tick_interval: Duration,
    /// Bounded worker pool size (`ConcurrentChecks`)
    pub concurrency: usize,
    /// Budget for draining in-flight probes at shutdown
    pub drain_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            concurrency: 10,
            drain_timeout: Duration::from_secs(60),
        }
    }
}

pub struct HealthScheduler {
    store: Arc<dyn Store>,
    runner: Arc<dyn ProbeRunner>,
    audit: AuditSink,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

impl HealthScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<dyn ProbeRunner>,
        audit: AuditSink,
        config: SchedulerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency));
        Self {
            store,
            runner,
            audit,
            config,
            permits,
        }
    }

    /// Run until shutdown flips, then drain in-flight probes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            period_secs = self.config.tick_interval.as_secs(),
            concurrency = self.config.concurrency,
            "health scheduler started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.dispatch_due(&mut in_flight).await;
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Cooperative stop: let in-flight probes finish within the budget.
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("scheduler drain timed out; aborting remaining probes");
            in_flight.shutdown().await;
        }
        info!("health scheduler stopped");
    }

    /// One tick: enumerate enabled environments and dispatch whatever is due.
    async fn dispatch_due(&self, in_flight: &mut JoinSet<()>) {
        let filter = EnvironmentFilter {
            check_enabled: Some(true),
            ..Default::default()
        };

        let now = Utc::now();
        let mut page = Page {
            page: 1,
            page_size: Page::MAX_PAGE_SIZE,
        };

        loop {
            let envs = match self.store.list_environments(&filter, page).await {
                Ok(envs) => envs,
                Err(e) => {
                    warn!("scheduler could not enumerate environments: {e}");
                    return;
                }
            };
            let page_len = envs.len();

            for env in envs {
                if !env.probe_due(now) {
                    continue;
                }

                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let runner = self.runner.clone();
                        let env_id = env.id;
                        let env_name = env.name.clone();
                        in_flight.spawn(async move {
                            let _permit = permit;
                            if let Err(e) = runner.probe(env_id).await {
                                debug!(environment = %env_name, "probe failed: {e}");
                            }
                        });
                    }
                    Err(_) => {
                        // Saturated: skip this tick, emit the warn audit.
                        self.audit.append(
                            AuditEvent::new(
                                AuditKind::System,
                                AuditLevel::Warn,
                                "probe skipped: worker pool saturated",
                            )
                            .environment(env.id, &env.name),
                        );
                    }
                }
            }

            if page_len < Page::MAX_PAGE_SIZE as usize {
                return;
            }
            page.page += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::domain::{
        AuditFilter, EnvStatus, Environment, Health, HealthCheckConfig, ProbeValidation,
        SystemInfo, Target, Timestamps,
    };
    use crate::error::Result;
    use crate::probe::ProbeOutcome;
    use crate::repository::{AuditRepository, EnvironmentRepository};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingRunner {
        current: AtomicUsize,
        peak: AtomicUsize,
        total: AtomicUsize,
        delay: Duration,
    }

    impl CountingRunner {
        fn new(delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ProbeRunner for CountingRunner {
        async fn probe(&self, _environment_id: Uuid) -> Result<ProbeOutcome> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(ProbeOutcome::Completed {
                verdict: Health::Healthy,
                changed: false,
                applied: true,
            })
        }
    }

    fn env(name: &str, enabled: bool, last_check_secs_ago: Option<i64>) -> Environment {
        let mut status = EnvStatus::default();
        if let Some(ago) = last_check_secs_ago {
            status.last_check = Some(Utc::now() - chrono::Duration::seconds(ago));
        }
        Environment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            target: Target {
                host: "127.0.0.1".to_string(),
                port: 9999,
                domain: None,
                host_key_fingerprint: None,
                insecure_skip_host_key: false,
            },
            credential: None,
            health_check: HealthCheckConfig {
                enabled,
                endpoint: "/health".to_string(),
                method: "GET".to_string(),
                interval_secs: 30,
                timeout_ms: 1000,
                headers: HashMap::new(),
                validation: ProbeValidation::StatusCode { status_code: 200 },
            },
            restart: None,
            upgrade: None,
            status,
            system_info: SystemInfo::default(),
            timestamps: Timestamps::now(),
        }
    }

    async fn scheduler_with(
        store: Arc<MemoryStore>,
        runner: Arc<dyn ProbeRunner>,
        concurrency: usize,
    ) -> (HealthScheduler, AuditSink, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (audit, _task) = AuditSink::spawn(store.clone(), shutdown_rx);
        let scheduler = HealthScheduler::new(
            store,
            runner,
            audit.clone(),
            SchedulerConfig {
                tick_interval: Duration::from_secs(3600),
                concurrency,
                drain_timeout: Duration::from_secs(5),
            },
        );
        (scheduler, audit, shutdown_tx)
    }

    #[tokio::test]
    async fn test_due_and_disabled_gating() {
        let store = Arc::new(MemoryStore::new());
        let due = env("due", true, None);
        let due_id = due.id;
        store.create_environment(&due).await.unwrap();
        store
            .create_environment(&env("recent", true, Some(3)))
            .await
            .unwrap();
        store
            .create_environment(&env("disabled", false, None))
            .await
            .unwrap();

        // Only the never-probed enabled environment is due this tick.
        let mut runner = crate::probe::MockProbeRunner::new();
        runner
            .expect_probe()
            .withf(move |id| *id == due_id)
            .times(1)
            .returning(|_| {
                Ok(ProbeOutcome::Completed {
                    verdict: Health::Healthy,
                    changed: false,
                    applied: true,
                })
            });

        let (scheduler, _audit, _shutdown) =
            scheduler_with(store, Arc::new(runner), 10).await;

        let mut tasks = JoinSet::new();
        scheduler.dispatch_due(&mut tasks).await;
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_cap_and_saturation_audit() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..6 {
            store
                .create_environment(&env(&format!("env-{i}"), true, None))
                .await
                .unwrap();
        }

        let runner = Arc::new(CountingRunner::new(Duration::from_millis(200)));
        let (scheduler, audit, shutdown_tx) = scheduler_with(store.clone(), runner.clone(), 2).await;

        let mut tasks = JoinSet::new();
        scheduler.dispatch_due(&mut tasks).await;
        while tasks.join_next().await.is_some() {}

        // Two ran, four were skipped with a warn audit each.
        assert_eq!(runner.total.load(Ordering::SeqCst), 2);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(audit);

        let skipped = store
            .count_audit(&AuditFilter {
                level: Some(AuditLevel::Warn),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(skipped, 4);
    }
}
