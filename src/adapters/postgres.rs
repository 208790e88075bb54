//! PostgreSQL storage adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    is_safe_text, ActionType, AuditEvent, AuditFilter, EnvStatus, Environment, EnvironmentFilter,
    Health, Page, SystemInfo, Timestamps, User,
};
use crate::error::{OpsdeckError, Result};
use crate::repository::{
    AuditRepository, CredentialRecord, CredentialRepository, EnvironmentRepository, UserRepository,
};

/// PostgreSQL store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a new pool
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const ENV_COLUMNS: &str = "id, name, target, credential, health_check, restart, upgrade, \
     status_health, status_last_check, status_message, status_response_time_ms, \
     system_info, created_at, updated_at, last_restart_at, last_upgrade_at, last_healthy_at";

fn env_from_row(row: &sqlx::postgres::PgRow) -> Result<Environment> {
    let health: String = row.get("status_health");
    let health = health
        .parse::<Health>()
        .map_err(OpsdeckError::Internal)?;

    let system_info: Option<serde_json::Value> = row.get("system_info");
    let system_info: SystemInfo = match system_info {
        Some(value) => serde_json::from_value(value)?,
        None => SystemInfo::default(),
    };

    let credential: Option<serde_json::Value> = row.get("credential");
    let restart: Option<serde_json::Value> = row.get("restart");
    let upgrade: Option<serde_json::Value> = row.get("upgrade");

    Ok(Environment {
        id: row.get("id"),
        name: row.get("name"),
        target: serde_json::from_value(row.get("target"))?,
        credential: credential.map(serde_json::from_value).transpose()?,
        health_check: serde_json::from_value(row.get("health_check"))?,
        restart: restart.map(serde_json::from_value).transpose()?,
        upgrade: upgrade.map(serde_json::from_value).transpose()?,
        status: EnvStatus {
            health,
            last_check: row.get("status_last_check"),
            message: row.get("status_message"),
            response_time_ms: row
                .get::<Option<i64>, _>("status_response_time_ms")
                .map(|v| v as u64),
        },
        system_info,
        timestamps: Timestamps {
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_restart_at: row.get("last_restart_at"),
            last_upgrade_at: row.get("last_upgrade_at"),
            last_healthy_at: row.get("last_healthy_at"),
        },
    })
}

fn map_unique_violation(err: sqlx::Error, what: &str) -> OpsdeckError {
    if let sqlx::Error::Database(ref db) = err {
        if db.code().as_deref() == Some("23505") {
            return OpsdeckError::AlreadyExists(what.to_string());
        }
    }
    err.into()
}

fn validated_name_filter(filter: &EnvironmentFilter) -> Result<Option<String>> {
    match &filter.name {
        Some(name) if !is_safe_text(name) => Err(OpsdeckError::Validation(format!(
            "name filter contains disallowed characters: \"{name}\""
        ))),
        other => Ok(other.clone()),
    }
}

#[async_trait]
impl EnvironmentRepository for PostgresStore {
    #[instrument(skip(self, env), fields(name = %env.name))]
    async fn create_environment(&self, env: &Environment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO environments (
                id, name, target, credential, health_check, restart, upgrade,
                status_health, status_last_check, status_message, status_response_time_ms,
                system_info, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(env.id)
        .bind(&env.name)
        .bind(serde_json::to_value(&env.target)?)
        .bind(env.credential.as_ref().map(serde_json::to_value).transpose()?)
        .bind(serde_json::to_value(&env.health_check)?)
        .bind(env.restart.as_ref().map(serde_json::to_value).transpose()?)
        .bind(env.upgrade.as_ref().map(serde_json::to_value).transpose()?)
        .bind(env.status.health.as_str())
        .bind(env.status.last_check)
        .bind(&env.status.message)
        .bind(env.status.response_time_ms.map(|v| v as i64))
        .bind(serde_json::to_value(&env.system_info)?)
        .bind(env.timestamps.created_at)
        .bind(env.timestamps.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("environment name \"{}\"", env.name)))?;

        Ok(())
    }

    async fn get_environment(&self, id: Uuid) -> Result<Environment> {
        let row = sqlx::query(&format!(
            "SELECT {ENV_COLUMNS} FROM environments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => env_from_row(&row),
            None => Err(OpsdeckError::NotFound(format!("environment {id}"))),
        }
    }

    async fn get_environment_by_name(&self, name: &str) -> Result<Environment> {
        if !is_safe_text(name) {
            return Err(OpsdeckError::Validation(format!(
                "name contains disallowed characters: \"{name}\""
            )));
        }
        let row = sqlx::query(&format!(
            "SELECT {ENV_COLUMNS} FROM environments WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => env_from_row(&row),
            None => Err(OpsdeckError::NotFound(format!("environment \"{name}\""))),
        }
    }

    async fn list_environments(
        &self,
        filter: &EnvironmentFilter,
        page: Page,
    ) -> Result<Vec<Environment>> {
        let name = validated_name_filter(filter)?;
        let page = page.clamped();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENV_COLUMNS} FROM environments
            WHERE ($1::text IS NULL OR status_health = $1)
              AND ($2::bool IS NULL OR (health_check->>'enabled')::bool = $2)
              AND ($3::text IS NULL OR name LIKE '%' || $3 || '%')
            ORDER BY name ASC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.health.map(|h| h.as_str()))
        .bind(filter.check_enabled)
        .bind(name)
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(env_from_row).collect()
    }

    async fn count_environments(&self, filter: &EnvironmentFilter) -> Result<u64> {
        let name = validated_name_filter(filter)?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM environments
            WHERE ($1::text IS NULL OR status_health = $1)
              AND ($2::bool IS NULL OR (health_check->>'enabled')::bool = $2)
              AND ($3::text IS NULL OR name LIKE '%' || $3 || '%')
            "#,
        )
        .bind(filter.health.map(|h| h.as_str()))
        .bind(filter.check_enabled)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("total") as u64)
    }

    async fn update_environment(&self, env: &Environment) -> Result<Environment> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE environments SET
                name = $2,
                target = $3,
                credential = $4,
                health_check = $5,
                restart = $6,
                upgrade = $7,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ENV_COLUMNS}
            "#
        ))
        .bind(env.id)
        .bind(&env.name)
        .bind(serde_json::to_value(&env.target)?)
        .bind(env.credential.as_ref().map(serde_json::to_value).transpose()?)
        .bind(serde_json::to_value(&env.health_check)?)
        .bind(env.restart.as_ref().map(serde_json::to_value).transpose()?)
        .bind(env.upgrade.as_ref().map(serde_json::to_value).transpose()?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("environment name \"{}\"", env.name)))?;

        match row {
            Some(row) => env_from_row(&row),
            None => Err(OpsdeckError::NotFound(format!("environment {}", env.id))),
        }
    }

    async fn update_environment_status(&self, id: Uuid, status: &EnvStatus) -> Result<bool> {
        // CAS on status_last_check; lastHealthyAt advances in the same write.
        let result = sqlx::query(
            r#"
            UPDATE environments SET
                status_health = $2,
                status_last_check = $3,
                status_message = $4,
                status_response_time_ms = $5,
                last_healthy_at = CASE WHEN $2 = 'healthy' THEN NOW() ELSE last_healthy_at END
            WHERE id = $1
              AND (status_last_check IS NULL OR $3::timestamptz IS NULL
                   OR status_last_check <= $3)
            "#,
        )
        .bind(id)
        .bind(status.health.as_str())
        .bind(status.last_check)
        .bind(&status.message)
        .bind(status.response_time_ms.map(|v| v as i64))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_restart(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result =
            sqlx::query("UPDATE environments SET last_restart_at = $2, updated_at = $2 WHERE id = $1")
                .bind(id)
                .bind(at)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(OpsdeckError::NotFound(format!("environment {id}")));
        }
        Ok(())
    }

    async fn record_upgrade(&self, id: Uuid, at: DateTime<Utc>, version: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE environments SET
                last_upgrade_at = $2,
                updated_at = $2,
                system_info = system_info
                    || jsonb_build_object('appVersion', $3::text, 'lastUpdated', $2::timestamptz)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OpsdeckError::NotFound(format!("environment {id}")));
        }
        Ok(())
    }

    async fn delete_environment(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM environments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OpsdeckError::NotFound(format!("environment {id}")));
        }
        Ok(())
    }
}

fn audit_from_row(row: &sqlx::postgres::PgRow) -> Result<AuditEvent> {
    let kind: String = row.get("kind");
    let level: String = row.get("level");
    let action_type: Option<String> = row.get("action_type");
    let details: Option<serde_json::Value> = row.get("details");

    Ok(AuditEvent {
        id: row.get("id"),
        timestamp: row.get("ts"),
        environment_id: row.get("environment_id"),
        environment_name: row.get("environment_name"),
        actor_id: row.get("actor_id"),
        actor_name: row.get("actor_name"),
        kind: serde_json::from_value(serde_json::Value::String(kind))?,
        level: serde_json::from_value(serde_json::Value::String(level))?,
        action_type: action_type
            .map(|a| serde_json::from_value::<ActionType>(serde_json::Value::String(a)))
            .transpose()?,
        message: row.get("message"),
        details: details
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default(),
    })
}

fn escaped_search(filter: &AuditFilter) -> Option<String> {
    filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(regex::escape)
}

#[async_trait]
impl AuditRepository for PostgresStore {
    async fn append_audit_batch(&self, events: &[AuditEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO audit_log (
                    id, ts, environment_id, environment_name, actor_id, actor_name,
                    kind, level, action_type, message, details
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(event.id)
            .bind(event.timestamp)
            .bind(event.environment_id)
            .bind(&event.environment_name)
            .bind(event.actor_id)
            .bind(&event.actor_name)
            .bind(event.kind.as_str())
            .bind(event.level.as_str())
            .bind(event.action_type.map(|a| a.as_str()))
            .bind(&event.message)
            .bind(serde_json::to_value(&event.details)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn list_audit(&self, filter: &AuditFilter, page: Page) -> Result<Vec<AuditEvent>> {
        let page = page.clamped();

        let rows = sqlx::query(
            r#"
            SELECT id, ts, environment_id, environment_name, actor_id, actor_name,
                   kind, level, action_type, message, details
            FROM audit_log
            WHERE ($1::uuid IS NULL OR environment_id = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR level = $3)
              AND ($4::uuid IS NULL OR actor_id = $4)
              AND ($5::timestamptz IS NULL OR ts >= $5)
              AND ($6::timestamptz IS NULL OR ts <= $6)
              AND ($7::text IS NULL
                   OR message ~* $7
                   OR environment_name ~* $7
                   OR actor_name ~* $7)
            ORDER BY ts DESC
            LIMIT $8 OFFSET $9
            "#,
        )
        .bind(filter.environment_id)
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.level.map(|l| l.as_str()))
        .bind(filter.actor_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(escaped_search(filter))
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }

    async fn count_audit(&self, filter: &AuditFilter) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM audit_log
            WHERE ($1::uuid IS NULL OR environment_id = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR level = $3)
              AND ($4::uuid IS NULL OR actor_id = $4)
              AND ($5::timestamptz IS NULL OR ts >= $5)
              AND ($6::timestamptz IS NULL OR ts <= $6)
              AND ($7::text IS NULL
                   OR message ~* $7
                   OR environment_name ~* $7
                   OR actor_name ~* $7)
            "#,
        )
        .bind(filter.environment_id)
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.level.map(|l| l.as_str()))
        .bind(filter.actor_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(escaped_search(filter))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("total") as u64)
    }

    async fn get_audit(&self, id: Uuid) -> Result<AuditEvent> {
        let row = sqlx::query(
            r#"
            SELECT id, ts, environment_id, environment_name, actor_id, actor_name,
                   kind, level, action_type, message, details
            FROM audit_log WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => audit_from_row(&row),
            None => Err(OpsdeckError::NotFound(format!("audit event {id}"))),
        }
    }

    async fn delete_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE ts < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UserRepository for PostgresStore {
    async fn get_user_by_username(&self, username: &str) -> Result<User> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, disabled, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(User {
                id: row.get("id"),
                username: row.get("username"),
                password_hash: row.get("password_hash"),
                disabled: row.get("disabled"),
                created_at: row.get("created_at"),
            }),
            None => Err(OpsdeckError::NotFound(format!("user \"{username}\""))),
        }
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, password_hash, disabled, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.disabled)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("user \"{}\"", user.username)))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for PostgresStore {
    async fn insert_credential(&self, record: &CredentialRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (id, kind, label, nonce, ciphertext, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.kind)
        .bind(&record.label)
        .bind(&record.nonce)
        .bind(&record.ciphertext)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_credential(&self, id: Uuid) -> Result<CredentialRecord> {
        let row = sqlx::query(
            "SELECT id, kind, label, nonce, ciphertext, created_at FROM credentials WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(CredentialRecord {
                id: row.get("id"),
                kind: row.get("kind"),
                label: row.get("label"),
                nonce: row.get("nonce"),
                ciphertext: row.get("ciphertext"),
                created_at: row.get("created_at"),
            }),
            None => Err(OpsdeckError::NotFound(format!("credential {id}"))),
        }
    }

    async fn list_credentials(&self) -> Result<Vec<CredentialRecord>> {
        let rows = sqlx::query(
            "SELECT id, kind, label, nonce, ciphertext, created_at FROM credentials ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CredentialRecord {
                id: row.get("id"),
                kind: row.get("kind"),
                label: row.get("label"),
                nonce: row.get("nonce"),
                ciphertext: row.get("ciphertext"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn delete_credential(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OpsdeckError::NotFound(format!("credential {id}")));
        }
        Ok(())
    }
}
