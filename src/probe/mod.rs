//! Probe engine: executes one health check, maps the response to a verdict,
//! records the status delta and publishes transitions to the hub.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::domain::{
    AuditEvent, AuditKind, AuditLevel, EnvStatus, Environment, Health, ProbeValidation,
};
use crate::error::{OpsdeckError, Result};
use crate::hub::{HubEvent, HubHandle};
use crate::repository::{EnvironmentRepository, Store};
use crate::transport::http::{validate_json_regex, validate_status_code};
use crate::transport::{HttpClient, HttpRequest};

/// Global ceiling on any single probe, regardless of per-environment config
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Health check disabled; status untouched
    Skipped,
    Completed {
        verdict: Health,
        /// Health transition versus the previously persisted status
        changed: bool,
        /// False when the write lost the compare-and-set (overtaken probe)
        applied: bool,
    },
}

/// Seam the scheduler dispatches through; lets dispatch and saturation be
/// tested without real HTTP.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn probe(&self, environment_id: Uuid) -> Result<ProbeOutcome>;
}

pub struct ProbeEngine {
    store: Arc<dyn Store>,
    http: HttpClient,
    audit: AuditSink,
    hub: HubHandle,
    probe_timeout: Duration,
}

impl ProbeEngine {
    pub fn new(
        store: Arc<dyn Store>,
        http: HttpClient,
        audit: AuditSink,
        hub: HubHandle,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            http,
            audit,
            hub,
            probe_timeout,
        }
    }

    async fn run_probe(&self, environment_id: Uuid) -> Result<ProbeOutcome> {
        // The probe start time becomes status.lastCheck: a later-started
        // probe always wins the repository's compare-and-set.
        let started = Utc::now();
        let env = self.store.get_environment(environment_id).await?;
        if !env.health_check.enabled {
            return Ok(ProbeOutcome::Skipped);
        }

        let deadline = Duration::from_millis(env.health_check.timeout_ms).min(self.probe_timeout);
        let request = HttpRequest {
            method: env.health_check.method.clone(),
            url: env.probe_url(),
            headers: env.health_check.headers.clone(),
            body: None,
        };

        let (health, level, message, response_time_ms) =
            match self.http.execute(&request, deadline).await {
                Ok(response) => {
                    let elapsed_ms = response.elapsed.as_millis() as u64;
                    match verdict_for(&env, &response) {
                        Ok(()) => (
                            Health::Healthy,
                            AuditLevel::Info,
                            format!("HTTP {} in {}ms", response.status, elapsed_ms),
                            Some(elapsed_ms),
                        ),
                        Err(reason) => {
                            (Health::Unhealthy, AuditLevel::Warn, reason, Some(elapsed_ms))
                        }
                    }
                }
                Err(err) => (
                    Health::Unhealthy,
                    AuditLevel::Error,
                    classify_probe_error(&err),
                    None,
                ),
            };

        let new_status = EnvStatus {
            health,
            last_check: Some(started),
            message,
            response_time_ms,
        };
        let changed = env.status.health != health;

        let applied = match self
            .store
            .update_environment_status(environment_id, &new_status)
            .await
        {
            Ok(applied) => applied,
            Err(err) => {
                // The next tick retries; the failure itself is auditable.
                self.audit.append(
                    AuditEvent::new(
                        AuditKind::Error,
                        AuditLevel::Error,
                        format!("failed to persist probe status: {err}"),
                    )
                    .environment(env.id, &env.name),
                );
                return Err(err);
            }
        };

        if !applied {
            debug!(environment = %env.name, "probe overtaken by a later-started probe, discarded");
            return Ok(ProbeOutcome::Completed {
                verdict: health,
                changed,
                applied,
            });
        }

        if changed {
            self.audit.append(
                AuditEvent::new(
                    AuditKind::HealthCheck,
                    level,
                    format!(
                        "health changed {} -> {}: {}",
                        env.status.health.as_str(),
                        health.as_str(),
                        new_status.message
                    ),
                )
                .environment(env.id, &env.name),
            );
            if let Err(e) = self
                .hub
                .publish(HubEvent::StatusUpdate {
                    environment_id: env.id,
                    status: new_status.clone(),
                })
                .await
            {
                warn!(environment = %env.name, "status fan-out failed: {e}");
            }
        }

        Ok(ProbeOutcome::Completed {
            verdict: health,
            changed,
            applied,
        })
    }
}

#[async_trait]
impl ProbeRunner for ProbeEngine {
    async fn probe(&self, environment_id: Uuid) -> Result<ProbeOutcome> {
        self.run_probe(environment_id).await
    }
}

/// Apply the environment's validator; Err carries the unhealthy message.
fn verdict_for(
    env: &Environment,
    response: &crate::transport::HttpResponse,
) -> std::result::Result<(), String> {
    match &env.health_check.validation {
        ProbeValidation::StatusCode { status_code } => {
            if validate_status_code(response, *status_code) {
                Ok(())
            } else {
                Err(format!(
                    "unexpected status {} (expected {})",
                    response.status, status_code
                ))
            }
        }
        ProbeValidation::JsonRegex { json_regex } => {
            if validate_json_regex(response, &json_regex.path, &json_regex.pattern) {
                Ok(())
            } else {
                Err(format!(
                    "json value at {} did not match /{}/",
                    json_regex.path, json_regex.pattern
                ))
            }
        }
    }
}

fn classify_probe_error(err: &OpsdeckError) -> String {
    match err {
        OpsdeckError::Timeout(_) => "probe timed out".to_string(),
        OpsdeckError::Transport(msg) => format!("transport failure: {msg}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use std::collections::HashMap;

    fn env_with_validation(validation: ProbeValidation) -> Environment {
        Environment {
            id: Uuid::new_v4(),
            name: "probe-test".to_string(),
            target: crate::domain::Target {
                host: "127.0.0.1".to_string(),
                port: 80,
                domain: None,
                host_key_fingerprint: None,
                insecure_skip_host_key: false,
            },
            credential: None,
            health_check: crate::domain::HealthCheckConfig {
                enabled: true,
                endpoint: "/health".to_string(),
                method: "GET".to_string(),
                interval_secs: 30,
                timeout_ms: 5000,
                headers: HashMap::new(),
                validation,
            },
            restart: None,
            upgrade: None,
            status: EnvStatus::default(),
            system_info: crate::domain::SystemInfo::default(),
            timestamps: crate::domain::Timestamps::now(),
        }
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            body: body.as_bytes().to_vec(),
            elapsed: Duration::from_millis(7),
        }
    }

    #[test]
    fn test_status_code_verdicts() {
        let env = env_with_validation(ProbeValidation::StatusCode { status_code: 200 });
        assert!(verdict_for(&env, &response(200, "")).is_ok());

        let unhealthy = verdict_for(&env, &response(500, "")).unwrap_err();
        assert!(unhealthy.contains("500"));
        assert!(unhealthy.contains("expected 200"));
    }

    #[test]
    fn test_json_regex_verdicts() {
        let env = env_with_validation(ProbeValidation::JsonRegex {
            json_regex: crate::domain::JsonRegexRule {
                path: "$.status".to_string(),
                pattern: "^ok$".to_string(),
            },
        });
        assert!(verdict_for(&env, &response(200, r#"{"status":"ok"}"#)).is_ok());
        assert!(verdict_for(&env, &response(200, r#"{"status":"down"}"#)).is_err());
        // Unparseable body is a failed verdict, not an error.
        assert!(verdict_for(&env, &response(200, "plain text")).is_err());
    }

    #[test]
    fn test_probe_error_classification() {
        assert_eq!(
            classify_probe_error(&OpsdeckError::Timeout("t".into())),
            "probe timed out"
        );
        assert!(
            classify_probe_error(&OpsdeckError::Transport("refused".into()))
                .contains("transport failure")
        );
    }
}
