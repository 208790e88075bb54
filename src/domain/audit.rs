//! Append-only audit events emitted by the prober, executor and API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditKind {
    HealthCheck,
    Action,
    System,
    Auth,
    Error,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::HealthCheck => "healthCheck",
            AuditKind::Action => "action",
            AuditKind::System => "system",
            AuditKind::Auth => "auth",
            AuditKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
    Success,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "info",
            AuditLevel::Warn => "warn",
            AuditLevel::Error => "error",
            AuditLevel::Success => "success",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    Restart,
    Upgrade,
    Login,
    Logout,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
            ActionType::Restart => "restart",
            ActionType::Upgrade => "upgrade",
            ActionType::Login => "login",
            ActionType::Logout => "logout",
        }
    }
}

/// Authenticated identity recorded against an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_name: Option<String>,
    pub kind: AuditKind,
    pub level: AuditLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    pub message: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl AuditEvent {
    /// Start a new event; remaining fields are filled with the builder methods.
    pub fn new(kind: AuditKind, level: AuditLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            environment_id: None,
            environment_name: None,
            actor_id: None,
            actor_name: None,
            kind,
            level,
            action_type: None,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn environment(mut self, id: Uuid, name: &str) -> Self {
        self.environment_id = Some(id);
        self.environment_name = Some(name.to_string());
        self
    }

    pub fn actor(mut self, actor: &Actor) -> Self {
        self.actor_id = Some(actor.id);
        self.actor_name = Some(actor.name.clone());
        self
    }

    pub fn action(mut self, action: ActionType) -> Self {
        self.action_type = Some(action);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Query filter for the audit log
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    #[serde(default)]
    pub environment_id: Option<Uuid>,
    #[serde(default)]
    pub kind: Option<AuditKind>,
    #[serde(default)]
    pub level: Option<AuditLevel>,
    #[serde(default)]
    pub actor_id: Option<Uuid>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// Free-text search over message / environmentName / actorName.
    /// Escaped before it is used as a regex.
    #[serde(default)]
    pub search: Option<String>,
}

impl AuditFilter {
    /// True when `event` matches every set predicate.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(env_id) = self.environment_id {
            if event.environment_id != Some(env_id) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(level) = self.level {
            if event.level != level {
                return false;
            }
        }
        if let Some(actor_id) = self.actor_id {
            if event.actor_id != Some(actor_id) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp > to {
                return false;
            }
        }
        if let Some(search) = &self.search {
            // Pre-escaped: free text is matched literally, never as a pattern.
            let needle = regex::escape(search);
            let re = match regex::RegexBuilder::new(&needle)
                .case_insensitive(true)
                .build()
            {
                Ok(re) => re,
                Err(_) => return false,
            };
            let hit = re.is_match(&event.message)
                || event
                    .environment_name
                    .as_deref()
                    .is_some_and(|n| re.is_match(n))
                || event.actor_name.as_deref().is_some_and(|n| re.is_match(n));
            if !hit {
                return false;
            }
        }
        true
    }
}
