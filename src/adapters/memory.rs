//! In-memory store: test double and `STORAGE_URI=memory` development mode.
//! Shares the exact compare-and-set semantics of the PostgreSQL adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    is_safe_text, AuditEvent, AuditFilter, EnvStatus, Environment, EnvironmentFilter, Health, Page,
    User,
};
use crate::error::{OpsdeckError, Result};
use crate::repository::{
    AuditRepository, CredentialRecord, CredentialRepository, EnvironmentRepository, UserRepository,
};

#[derive(Default)]
pub struct MemoryStore {
    environments: DashMap<Uuid, Environment>,
    audit: RwLock<Vec<AuditEvent>>,
    users: DashMap<String, User>,
    credentials: DashMap<Uuid, CredentialRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ensure_safe_filter(filter: &EnvironmentFilter) -> Result<()> {
    if let Some(name) = &filter.name {
        if !is_safe_text(name) {
            return Err(OpsdeckError::Validation(format!(
                "name filter contains disallowed characters: \"{name}\""
            )));
        }
    }
    Ok(())
}

fn filter_matches(filter: &EnvironmentFilter, env: &Environment) -> bool {
    if let Some(health) = filter.health {
        if env.status.health != health {
            return false;
        }
    }
    if let Some(enabled) = filter.check_enabled {
        if env.health_check.enabled != enabled {
            return false;
        }
    }
    if let Some(name) = &filter.name {
        if !env.name.contains(name.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl EnvironmentRepository for MemoryStore {
    async fn create_environment(&self, env: &Environment) -> Result<()> {
        if self.environments.iter().any(|e| e.name == env.name) {
            return Err(OpsdeckError::AlreadyExists(format!(
                "environment name \"{}\"",
                env.name
            )));
        }
        self.environments.insert(env.id, env.clone());
        Ok(())
    }

    async fn get_environment(&self, id: Uuid) -> Result<Environment> {
        self.environments
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| OpsdeckError::NotFound(format!("environment {id}")))
    }

    async fn get_environment_by_name(&self, name: &str) -> Result<Environment> {
        if !is_safe_text(name) {
            return Err(OpsdeckError::Validation(format!(
                "name contains disallowed characters: \"{name}\""
            )));
        }
        self.environments
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.clone())
            .ok_or_else(|| OpsdeckError::NotFound(format!("environment \"{name}\"")))
    }

    async fn list_environments(
        &self,
        filter: &EnvironmentFilter,
        page: Page,
    ) -> Result<Vec<Environment>> {
        ensure_safe_filter(filter)?;
        let page = page.clamped();
        let mut matched: Vec<Environment> = self
            .environments
            .iter()
            .filter(|e| filter_matches(filter, e))
            .map(|e| e.clone())
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matched
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect())
    }

    async fn count_environments(&self, filter: &EnvironmentFilter) -> Result<u64> {
        ensure_safe_filter(filter)?;
        Ok(self
            .environments
            .iter()
            .filter(|e| filter_matches(filter, e))
            .count() as u64)
    }

    async fn update_environment(&self, env: &Environment) -> Result<Environment> {
        let duplicate = self
            .environments
            .iter()
            .any(|e| e.name == env.name && e.id != env.id);
        if duplicate {
            return Err(OpsdeckError::AlreadyExists(format!(
                "environment name \"{}\"",
                env.name
            )));
        }
        let mut entry = self
            .environments
            .get_mut(&env.id)
            .ok_or_else(|| OpsdeckError::NotFound(format!("environment {}", env.id)))?;
        let mut updated = env.clone();
        // Status and probe timestamps are owned by update_environment_status.
        updated.status = entry.status.clone();
        updated.timestamps.created_at = entry.timestamps.created_at;
        updated.timestamps.last_healthy_at = entry.timestamps.last_healthy_at;
        updated.timestamps.last_restart_at = entry.timestamps.last_restart_at;
        updated.timestamps.last_upgrade_at = entry.timestamps.last_upgrade_at;
        updated.timestamps.updated_at = Utc::now();
        *entry = updated.clone();
        Ok(updated)
    }

    async fn update_environment_status(&self, id: Uuid, status: &EnvStatus) -> Result<bool> {
        let mut entry = self
            .environments
            .get_mut(&id)
            .ok_or_else(|| OpsdeckError::NotFound(format!("environment {id}")))?;
        // Monotonic lastCheck: an overtaken probe's write is discarded.
        if let (Some(current), Some(incoming)) = (entry.status.last_check, status.last_check) {
            if incoming < current {
                return Ok(false);
            }
        }
        entry.status = status.clone();
        if status.health == Health::Healthy {
            entry.timestamps.last_healthy_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn record_restart(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut entry = self
            .environments
            .get_mut(&id)
            .ok_or_else(|| OpsdeckError::NotFound(format!("environment {id}")))?;
        entry.timestamps.last_restart_at = Some(at);
        entry.timestamps.updated_at = at;
        Ok(())
    }

    async fn record_upgrade(&self, id: Uuid, at: DateTime<Utc>, version: &str) -> Result<()> {
        let mut entry = self
            .environments
            .get_mut(&id)
            .ok_or_else(|| OpsdeckError::NotFound(format!("environment {id}")))?;
        entry.timestamps.last_upgrade_at = Some(at);
        entry.timestamps.updated_at = at;
        entry.system_info.app_version = Some(version.to_string());
        entry.system_info.last_updated = Some(at);
        Ok(())
    }

    async fn delete_environment(&self, id: Uuid) -> Result<()> {
        self.environments
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| OpsdeckError::NotFound(format!("environment {id}")))
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn append_audit_batch(&self, events: &[AuditEvent]) -> Result<()> {
        self.audit.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn list_audit(&self, filter: &AuditFilter, page: Page) -> Result<Vec<AuditEvent>> {
        let page = page.clamped();
        let log = self.audit.read().await;
        let mut matched: Vec<AuditEvent> =
            log.iter().filter(|e| filter.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matched
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect())
    }

    async fn count_audit(&self, filter: &AuditFilter) -> Result<u64> {
        let log = self.audit.read().await;
        Ok(log.iter().filter(|e| filter.matches(e)).count() as u64)
    }

    async fn get_audit(&self, id: Uuid) -> Result<AuditEvent> {
        let log = self.audit.read().await;
        log.iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| OpsdeckError::NotFound(format!("audit event {id}")))
    }

    async fn delete_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut log = self.audit.write().await;
        let before = log.len();
        log.retain(|e| e.timestamp >= cutoff);
        Ok((before - log.len()) as u64)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get_user_by_username(&self, username: &str) -> Result<User> {
        self.users
            .get(username)
            .map(|u| u.clone())
            .ok_or_else(|| OpsdeckError::NotFound(format!("user \"{username}\"")))
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        if self.users.contains_key(&user.username) {
            return Err(OpsdeckError::AlreadyExists(format!(
                "user \"{}\"",
                user.username
            )));
        }
        self.users.insert(user.username.clone(), user.clone());
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn insert_credential(&self, record: &CredentialRecord) -> Result<()> {
        self.credentials.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_credential(&self, id: Uuid) -> Result<CredentialRecord> {
        self.credentials
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| OpsdeckError::NotFound(format!("credential {id}")))
    }

    async fn list_credentials(&self) -> Result<Vec<CredentialRecord>> {
        Ok(self.credentials.iter().map(|c| c.clone()).collect())
    }

    async fn delete_credential(&self, id: Uuid) -> Result<()> {
        self.credentials
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| OpsdeckError::NotFound(format!("credential {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CommandDetails, HealthCheckConfig, ProbeValidation, SystemInfo, Target, Timestamps,
    };
    use std::collections::HashMap;

    fn env_named(name: &str) -> Environment {
        Environment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            target: Target {
                host: "127.0.0.1".to_string(),
                port: 9000,
                domain: None,
                host_key_fingerprint: None,
                insecure_skip_host_key: false,
            },
            credential: None,
            health_check: HealthCheckConfig {
                enabled: true,
                endpoint: "/health".to_string(),
                method: "GET".to_string(),
                interval_secs: 30,
                timeout_ms: 5000,
                headers: HashMap::new(),
                validation: ProbeValidation::StatusCode { status_code: 200 },
            },
            restart: None,
            upgrade: None,
            status: EnvStatus::default(),
            system_info: SystemInfo::default(),
            timestamps: Timestamps::now(),
        }
    }

    #[tokio::test]
    async fn test_create_then_get_by_name_round_trips() {
        let store = MemoryStore::new();
        let env = env_named("api-prod");
        store.create_environment(&env).await.unwrap();

        let loaded = store.get_environment_by_name("api-prod").await.unwrap();
        assert_eq!(loaded.id, env.id);
        assert_eq!(loaded.name, env.name);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let store = MemoryStore::new();
        store.create_environment(&env_named("dup")).await.unwrap();
        let err = store
            .create_environment(&env_named("dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, OpsdeckError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_status_cas_discards_overtaken_probe() {
        let store = MemoryStore::new();
        let env = env_named("cas");
        store.create_environment(&env).await.unwrap();

        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(30);

        let newer = EnvStatus {
            health: Health::Healthy,
            last_check: Some(t1),
            message: "ok".to_string(),
            response_time_ms: Some(12),
        };
        assert!(store
            .update_environment_status(env.id, &newer)
            .await
            .unwrap());

        // An earlier-started probe finishing late must be discarded.
        let stale = EnvStatus {
            health: Health::Unhealthy,
            last_check: Some(t0),
            message: "late".to_string(),
            response_time_ms: None,
        };
        assert!(!store
            .update_environment_status(env.id, &stale)
            .await
            .unwrap());

        let loaded = store.get_environment(env.id).await.unwrap();
        assert_eq!(loaded.status.health, Health::Healthy);
        assert!(loaded.timestamps.last_healthy_at.is_some());
    }

    #[tokio::test]
    async fn test_unsafe_name_filter_rejected() {
        let store = MemoryStore::new();
        let filter = EnvironmentFilter {
            name: Some("x'; --".to_string()),
            ..Default::default()
        };
        let err = store
            .list_environments(&filter, Page::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsdeckError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_preserves_status_subtree() {
        let store = MemoryStore::new();
        let mut env = env_named("keep-status");
        store.create_environment(&env).await.unwrap();

        let status = EnvStatus {
            health: Health::Healthy,
            last_check: Some(Utc::now()),
            message: "ok".to_string(),
            response_time_ms: Some(3),
        };
        store
            .update_environment_status(env.id, &status)
            .await
            .unwrap();

        env.restart = Some(crate::domain::CommandSpec {
            enabled: true,
            details: CommandDetails::Http {
                url: "http://127.0.0.1:9000/restart".to_string(),
                method: "POST".to_string(),
                headers: HashMap::new(),
                body: None,
            },
        });
        let updated = store.update_environment(&env).await.unwrap();
        assert_eq!(updated.status.health, Health::Healthy);
        assert!(updated.restart.is_some());
    }
}
