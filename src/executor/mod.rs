//! Operation executor: runs restart and upgrade actions against remote
//! environments over SSH or HTTP. At most one operation is in flight per
//! environment; the `operationId` is returned synchronously once the
//! operation is running and the remainder happens asynchronously, fanned
//! out to subscribers and recorded as paired audit events.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::credentials::CredentialStore;
use crate::domain::{
    ActionType, Actor, AuditEvent, AuditKind, AuditLevel, CommandDetails, CredentialKind,
    Environment, Health, Operation, OperationKind, OperationStatus, OperationUpdate,
};
use crate::error::{OpsdeckError, Result};
use crate::hub::{HubEvent, HubHandle};
use crate::repository::{EnvironmentRepository as _, Store};
use crate::transport::substitute::{substitute_body, substitute_shell, substitute_url};
use crate::transport::{HostKeyPolicy, HttpClient, HttpRequest, SshAuth, SshPool};

/// Versions listed for an environment
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub current: Option<String>,
    pub available: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Budget for one remote command (SSH or HTTP action)
    pub command_timeout: Duration,
    /// Budget for the version-list request
    pub version_list_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            version_list_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct OperationExecutor {
    store: Arc<dyn Store>,
    credentials: Arc<CredentialStore>,
    ssh: Arc<SshPool>,
    http: HttpClient,
    audit: AuditSink,
    hub: HubHandle,
    config: ExecutorConfig,
    /// environment id → running operation id
    in_flight: Arc<DashMap<Uuid, Uuid>>,
    shutdown: watch::Receiver<bool>,
}

/// Releases the per-environment slot even if the operation task panics.
struct InFlightGuard {
    map: Arc<DashMap<Uuid, Uuid>>,
    environment_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.environment_id);
    }
}

impl OperationExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        credentials: Arc<CredentialStore>,
        ssh: Arc<SshPool>,
        http: HttpClient,
        audit: AuditSink,
        hub: HubHandle,
        config: ExecutorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            credentials,
            ssh,
            http,
            audit,
            hub,
            config,
            in_flight: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Restart the environment. Returns once the operation is running.
    pub async fn restart(
        &self,
        environment_id: Uuid,
        force: bool,
        actor: Option<Actor>,
    ) -> Result<Operation> {
        let env = self.store.get_environment(environment_id).await?;
        let command = env
            .restart
            .as_ref()
            .filter(|command| command.enabled)
            .ok_or_else(|| {
                OpsdeckError::Validation(format!(
                    "restart is not enabled for environment \"{}\"",
                    env.name
                ))
            })?;
        ensure_health_allows(OperationKind::Restart, force, env.status.health, &env.name)?;

        let details = command.details.clone();
        self.launch(env, OperationKind::Restart, details, None, actor)
            .await
    }

    /// Upgrade the environment to `version`.
    pub async fn upgrade(
        &self,
        environment_id: Uuid,
        version: &str,
        force: bool,
        actor: Option<Actor>,
    ) -> Result<Operation> {
        if version.trim().is_empty() {
            return Err(OpsdeckError::Validation("version must not be empty".into()));
        }
        let env = self.store.get_environment(environment_id).await?;
        let upgrade = env
            .upgrade
            .as_ref()
            .filter(|u| u.enabled)
            .ok_or_else(|| {
                OpsdeckError::Validation(format!(
                    "upgrade is not enabled for environment \"{}\"",
                    env.name
                ))
            })?;
        ensure_health_allows(OperationKind::Upgrade, force, env.status.health, &env.name)?;

        let details = upgrade.upgrade_command.clone();
        self.launch(
            env,
            OperationKind::Upgrade,
            details,
            Some(version.to_string()),
            actor,
        )
        .await
    }

    /// List versions the environment can be upgraded to, in server order.
    pub async fn list_versions(&self, environment_id: Uuid) -> Result<VersionInfo> {
        let env = self.store.get_environment(environment_id).await?;
        let upgrade = env.upgrade.as_ref().ok_or_else(|| {
            OpsdeckError::Validation(format!(
                "environment \"{}\" has no upgrade configuration",
                env.name
            ))
        })?;

        let request = HttpRequest {
            method: upgrade.version_list.method.clone(),
            url: upgrade.version_list.url.clone(),
            headers: upgrade.version_list.headers.clone(),
            body: upgrade.version_list.body.clone(),
        };
        let response = self
            .http
            .execute(&request, self.config.version_list_timeout)
            .await?;
        if !response.is_2xx() {
            return Err(OpsdeckError::Transport(format!(
                "version list request returned HTTP {}",
                response.status
            )));
        }
        let body = response.json().ok_or_else(|| {
            OpsdeckError::Transport("version list response was not valid JSON".to_string())
        })?;
        let available =
            crate::transport::jsonpath::evaluate_strings(&body, &upgrade.json_path_response)?;

        Ok(VersionInfo {
            current: env.system_info.app_version.clone(),
            available,
        })
    }

    /// Number of operations currently running (all environments)
    pub fn running_operations(&self) -> usize {
        self.in_flight.len()
    }

    /// Claim the per-environment slot, emit the start events, and spawn the
    /// asynchronous remainder.
    async fn launch(
        &self,
        env: Environment,
        kind: OperationKind,
        details: CommandDetails,
        version: Option<String>,
        actor: Option<Actor>,
    ) -> Result<Operation> {
        let operation = Operation::start(env.id, kind);

        // Single-flight per environment: the entry API makes claim-or-reject
        // atomic under concurrent calls.
        let guard = match self.in_flight.entry(env.id) {
            dashmap::mapref::entry::Entry::Occupied(running) => {
                return Err(OpsdeckError::Conflict(format!(
                    "operation {} already running for environment \"{}\"",
                    running.get(),
                    env.name
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(operation.operation_id);
                InFlightGuard {
                    map: self.in_flight.clone(),
                    environment_id: env.id,
                }
            }
        };

        let action = match kind {
            OperationKind::Restart => ActionType::Restart,
            OperationKind::Upgrade => ActionType::Upgrade,
        };

        let mut started = AuditEvent::new(AuditKind::Action, AuditLevel::Info, "started")
            .environment(env.id, &env.name)
            .action(action)
            .detail("operationId", operation.operation_id.to_string());
        if let Some(actor) = &actor {
            started = started.actor(actor);
        }
        self.audit.append(started);

        self.publish_update(&operation, OperationStatus::InProgress, None)
            .await;

        let executor = self.clone();
        let task_operation = operation.clone();
        tokio::spawn(async move {
            let _guard = guard;
            executor
                .run_to_completion(env, task_operation, details, version, actor, action)
                .await;
        });

        Ok(operation)
    }

    async fn run_to_completion(
        &self,
        env: Environment,
        operation: Operation,
        details: CommandDetails,
        version: Option<String>,
        actor: Option<Actor>,
        action: ActionType,
    ) {
        let mut shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            outcome = self.execute_command(&env, &details, version.as_deref()) => outcome,
            _ = shutdown.changed() => Err(OpsdeckError::Cancelled),
        };

        let (status, level, message, error) = match &outcome {
            Ok(summary) => (
                OperationStatus::Success,
                AuditLevel::Success,
                summary.clone(),
                None,
            ),
            Err(OpsdeckError::Cancelled) => (
                OperationStatus::Cancelled,
                AuditLevel::Error,
                "cancelled".to_string(),
                Some("cancelled".to_string()),
            ),
            Err(err) => (
                OperationStatus::Failed,
                AuditLevel::Error,
                err.to_string(),
                Some(err.to_string()),
            ),
        };

        if status == OperationStatus::Success {
            let now = Utc::now();
            let recorded = match operation.kind {
                OperationKind::Restart => self.store.record_restart(env.id, now).await,
                OperationKind::Upgrade => {
                    self.store
                        .record_upgrade(env.id, now, version.as_deref().unwrap_or_default())
                        .await
                }
            };
            if let Err(e) = recorded {
                warn!(environment = %env.name, "failed to record operation timestamp: {e}");
            }
            info!(
                environment = %env.name,
                operation = %operation.operation_id,
                kind = operation.kind.as_str(),
                "operation succeeded"
            );
        } else {
            warn!(
                environment = %env.name,
                operation = %operation.operation_id,
                kind = operation.kind.as_str(),
                "operation finished: {message}"
            );
        }

        let mut finished = AuditEvent::new(AuditKind::Action, level, message)
            .environment(env.id, &env.name)
            .action(action)
            .detail("operationId", operation.operation_id.to_string());
        if let Some(actor) = &actor {
            finished = finished.actor(actor);
        }
        self.audit.append(finished);

        self.publish_update(&operation, status, error).await;
    }

    async fn publish_update(
        &self,
        operation: &Operation,
        status: OperationStatus,
        error: Option<String>,
    ) {
        let event = HubEvent::OperationUpdate {
            operation_id: operation.operation_id,
            update: OperationUpdate {
                environment_id: operation.environment_id,
                kind: operation.kind,
                status,
                error,
            },
        };
        if let Err(e) = self.hub.publish(event).await {
            warn!(operation = %operation.operation_id, "operation fan-out failed: {e}");
        }
    }

    /// Dispatch on the command's transport tag. Returns a short success
    /// summary for the audit trail.
    async fn execute_command(
        &self,
        env: &Environment,
        details: &CommandDetails,
        version: Option<&str>,
    ) -> Result<String> {
        match details {
            CommandDetails::Ssh { template } => {
                let command = match version {
                    Some(version) => substitute_shell(template, version),
                    None => template.clone(),
                };
                self.execute_ssh(env, &command).await
            }
            CommandDetails::Http {
                url,
                method,
                headers,
                body,
            } => {
                let url = match version {
                    Some(version) => substitute_url(url, version),
                    None => url.clone(),
                };
                let body = match (body, version) {
                    (Some(body), Some(version)) => Some(substitute_body(body, version)),
                    (body, _) => body.clone(),
                };
                let request = HttpRequest {
                    method: method.clone(),
                    url,
                    headers: headers.clone(),
                    body,
                };
                let response = self
                    .http
                    .execute(&request, self.config.command_timeout)
                    .await?;
                if response.is_2xx() {
                    Ok(format!("HTTP {}", response.status))
                } else {
                    Err(OpsdeckError::Internal(format!(
                        "command endpoint returned HTTP {}",
                        response.status
                    )))
                }
            }
        }
    }

    async fn execute_ssh(&self, env: &Environment, command: &str) -> Result<String> {
        let credential = env.credential.as_ref().ok_or_else(|| {
            OpsdeckError::Credential(format!(
                "environment \"{}\" has no credential for ssh commands",
                env.name
            ))
        })?;

        let policy = if env.target.insecure_skip_host_key {
            self.audit.append(
                AuditEvent::new(
                    AuditKind::System,
                    AuditLevel::Warn,
                    "dialing with host-key verification disabled",
                )
                .environment(env.id, &env.name),
            );
            HostKeyPolicy::InsecureAccept
        } else {
            match &env.target.host_key_fingerprint {
                Some(fingerprint) => HostKeyPolicy::Pinned(fingerprint.clone()),
                None => HostKeyPolicy::DenyUnknown,
            }
        };

        // Decrypted material lives exactly as long as this acquire.
        let secret = self.credentials.decrypt(credential.credential_id).await?;
        let auth = match credential.kind {
            CredentialKind::Password => SshAuth::Password(secret.expose()),
            CredentialKind::Key => SshAuth::Key(secret.expose()),
        };

        let mut session = self
            .ssh
            .acquire(
                &env.target.host,
                env.target.port,
                &credential.username,
                credential.credential_id,
                auth,
                policy,
            )
            .await?;
        drop(secret);

        let output = match session.exec(command).await {
            Ok(output) => output,
            Err(err) => {
                // Do not return a session in an unknown state to the pool.
                return Err(err);
            }
        };
        self.ssh.release(session).await;

        if output.success() {
            Ok("exit 0".to_string())
        } else {
            Err(OpsdeckError::Internal(format!(
                "command exited with {}: {}",
                output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "no status".to_string()),
                output.stderr.trim()
            )))
        }
    }
}

/// `force=true` proceeds regardless of health; `force=false` refuses an
/// unhealthy environment unless the operation is exactly a restart.
fn ensure_health_allows(
    kind: OperationKind,
    force: bool,
    health: Health,
    name: &str,
) -> Result<()> {
    if force || kind == OperationKind::Restart || health != Health::Unhealthy {
        return Ok(());
    }
    Err(OpsdeckError::Conflict(format!(
        "environment \"{name}\" is unhealthy; pass force=true to {} anyway",
        kind.as_str()
    )))
}
