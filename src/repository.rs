//! Storage contracts. The scheduler, prober, executor and API only see these
//! traits; PostgreSQL and the in-memory store implement them in `adapters`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{AuditEvent, AuditFilter, EnvStatus, Environment, EnvironmentFilter, Page, User};
use crate::error::Result;

/// Encrypted credential material as it sits at rest. Plaintext only ever
/// exists inside the credential store module.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub kind: String,
    pub label: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait EnvironmentRepository: Send + Sync {
    /// Insert a new environment; `AlreadyExists` on a duplicate name.
    async fn create_environment(&self, env: &Environment) -> Result<()>;

    async fn get_environment(&self, id: Uuid) -> Result<Environment>;

    async fn get_environment_by_name(&self, name: &str) -> Result<Environment>;

    async fn list_environments(
        &self,
        filter: &EnvironmentFilter,
        page: Page,
    ) -> Result<Vec<Environment>>;

    async fn count_environments(&self, filter: &EnvironmentFilter) -> Result<u64>;

    /// Full update of the mutable config subtree; bumps `updated_at`.
    async fn update_environment(&self, env: &Environment) -> Result<Environment>;

    /// Compare-and-set over `{health, lastCheck, message, responseTime}`.
    ///
    /// The write applies only when `status.last_check` is >= the persisted
    /// value, so a probe overtaken by a later-started one is discarded.
    /// When the new health is `healthy`, `lastHealthyAt` is advanced in the
    /// same write. Returns whether the write applied.
    async fn update_environment_status(&self, id: Uuid, status: &EnvStatus) -> Result<bool>;

    async fn record_restart(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Also records `version` into the advisory system info.
    async fn record_upgrade(&self, id: Uuid, at: DateTime<Utc>, version: &str) -> Result<()>;

    async fn delete_environment(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append_audit_batch(&self, events: &[AuditEvent]) -> Result<()>;

    async fn list_audit(&self, filter: &AuditFilter, page: Page) -> Result<Vec<AuditEvent>>;

    async fn count_audit(&self, filter: &AuditFilter) -> Result<u64>;

    async fn get_audit(&self, id: Uuid) -> Result<AuditEvent>;

    /// Retention sweep; returns the number of events removed.
    async fn delete_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_user_by_username(&self, username: &str) -> Result<User>;

    async fn create_user(&self, user: &User) -> Result<()>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn insert_credential(&self, record: &CredentialRecord) -> Result<()>;

    async fn get_credential(&self, id: Uuid) -> Result<CredentialRecord>;

    async fn list_credentials(&self) -> Result<Vec<CredentialRecord>>;

    async fn delete_credential(&self, id: Uuid) -> Result<()>;
}

/// The full storage surface the service is wired with.
pub trait Store:
    EnvironmentRepository + AuditRepository + UserRepository + CredentialRepository
{
}

impl<T> Store for T where
    T: EnvironmentRepository + AuditRepository + UserRepository + CredentialRepository
{
}
