//! The Environment aggregate: a logical remote deployment under control.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::is_safe_text;

/// Minimum / maximum per-environment health-check cadence in seconds.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 5;
pub const MAX_CHECK_INTERVAL_SECS: u64 = 3600;

/// A registered remote deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: Uuid,
    /// Unique, case-sensitive human name
    pub name: String,
    pub target: Target,
    /// Reference to secret material held by the credential store.
    /// Required for SSH-kind commands, optional otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
    pub health_check: HealthCheckConfig,
    /// Restart command declaration, if the environment supports restarts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<CommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeConfig>,
    #[serde(default)]
    pub status: EnvStatus,
    #[serde(default)]
    pub system_info: SystemInfo,
    pub timestamps: Timestamps,
}

/// Where the deployment lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// SHA256 host-key fingerprint pinned for SSH dials ("SHA256:...").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
    /// Explicit per-environment opt-out of host-key verification.
    /// Every dial made with this set emits a warn audit event.
    #[serde(default)]
    pub insecure_skip_host_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Key,
    Password,
}

/// Pointer to secret material owned by the credential store; never inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    pub kind: CredentialKind,
    pub username: String,
    pub credential_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Path (joined onto the target) or absolute http(s) URL
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Seconds between probes for this environment; the scheduler tick is
    /// the finest granularity.
    pub interval_secs: u64,
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub validation: ProbeValidation,
}

fn default_method() -> String {
    "GET".to_string()
}

/// How a probe response is mapped to a verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeValidation {
    #[serde(rename_all = "camelCase")]
    StatusCode { status_code: u16 },
    #[serde(rename_all = "camelCase")]
    JsonRegex { json_regex: JsonRegexRule },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRegexRule {
    /// JSONPath subset: dotted paths, bracketed indices, terminal `[*]`
    pub path: String,
    pub pattern: String,
}

/// A declared remote command. The executor dispatches on the variant tag;
/// shared concerns (timeout, audit, token substitution) live above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CommandDetails {
    Ssh {
        /// Shell template; `{VERSION}` tokens are substituted shell-safely
        template: String,
    },
    Http {
        url: String,
        #[serde(default = "default_post")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

fn default_post() -> String {
    "POST".to_string()
}

impl CommandDetails {
    pub fn kind_str(&self) -> &'static str {
        match self {
            CommandDetails::Ssh { .. } => "ssh",
            CommandDetails::Http { .. } => "http",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub enabled: bool,
    #[serde(flatten)]
    pub details: CommandDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeConfig {
    pub enabled: bool,
    pub version_list: VersionListSpec,
    /// JSONPath into the version-list response, e.g. `$.data.tags[*]`
    pub json_path_response: String,
    pub upgrade_command: CommandDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionListSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
            Health::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for Health {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Health::Healthy),
            "unhealthy" => Ok(Health::Unhealthy),
            "unknown" => Ok(Health::Unknown),
            other => Err(format!("unknown health value: {other}")),
        }
    }
}

/// Last observed probe outcome. `last_check` carries the probe start time,
/// which is what makes the repository's compare-and-set discard overtaken
/// probes (later-started probe always wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvStatus {
    pub health: Health,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl Default for EnvStatus {
    fn default() -> Self {
        Self {
            health: Health::Unknown,
            last_check: None,
            message: String::new(),
            response_time_ms: None,
        }
    }
}

/// Advisory facts reported by the deployment itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_at: Option<DateTime<Utc>>,
    /// Set iff the environment has ever been healthy; monotonically
    /// non-decreasing, written only inside `update_status`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_healthy_at: Option<DateTime<Utc>>,
}

impl Timestamps {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            last_restart_at: None,
            last_upgrade_at: None,
            last_healthy_at: None,
        }
    }
}

/// Filter for environment listings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentFilter {
    #[serde(default)]
    pub health: Option<Health>,
    /// Only environments whose health check is enabled
    #[serde(default)]
    pub check_enabled: Option<bool>,
    /// Substring match on name; must pass the allow-list
    #[serde(default)]
    pub name: Option<String>,
}

impl Environment {
    /// Validate declared constraints. Returns list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.len() > 128 || !is_safe_text(&self.name) {
            errors.push(format!(
                "name must be 1-128 chars of alphanumerics, '_', '-' or space, got \"{}\"",
                self.name
            ));
        }

        if self.target.host.trim().is_empty() {
            errors.push("target.host must not be empty".to_string());
        }
        if self.target.port == 0 {
            errors.push("target.port must be in [1, 65535]".to_string());
        }

        let hc = &self.health_check;
        if !(MIN_CHECK_INTERVAL_SECS..=MAX_CHECK_INTERVAL_SECS).contains(&hc.interval_secs) {
            errors.push(format!(
                "healthCheck.intervalSecs must be in [{MIN_CHECK_INTERVAL_SECS}, {MAX_CHECK_INTERVAL_SECS}], got {}",
                hc.interval_secs
            ));
        }
        if hc.timeout_ms == 0 {
            errors.push("healthCheck.timeoutMs must be > 0".to_string());
        }
        if hc.endpoint.trim().is_empty() {
            errors.push("healthCheck.endpoint must not be empty".to_string());
        }
        if !matches!(hc.method.as_str(), "GET" | "POST" | "HEAD" | "PUT" | "DELETE") {
            errors.push(format!("healthCheck.method not allowed: {}", hc.method));
        }
        if let ProbeValidation::JsonRegex { json_regex } = &hc.validation {
            if let Err(e) = regex::Regex::new(&json_regex.pattern) {
                errors.push(format!("healthCheck.validation pattern invalid: {e}"));
            }
            if json_regex.path.trim().is_empty() {
                errors.push("healthCheck.validation path must not be empty".to_string());
            }
        }

        if let Some(restart) = &self.restart {
            if let Some(e) = self.command_error("restart", &restart.details) {
                errors.push(e);
            }
        }

        if let Some(upgrade) = &self.upgrade {
            if upgrade.json_path_response.trim().is_empty() {
                errors.push("upgrade.jsonPathResponse must not be empty".to_string());
            }
            if upgrade.version_list.url.trim().is_empty() {
                errors.push("upgrade.versionList.url must not be empty".to_string());
            }
            if let Some(e) = self.command_error("upgrade", &upgrade.upgrade_command) {
                errors.push(e);
            }
        }

        errors
    }

    fn command_error(&self, which: &str, details: &CommandDetails) -> Option<String> {
        match details {
            CommandDetails::Ssh { template } => {
                if template.trim().is_empty() {
                    return Some(format!("{which}: ssh template must not be empty"));
                }
                if self.credential.is_none() {
                    return Some(format!("{which}: ssh commands require a credential"));
                }
                None
            }
            CommandDetails::Http { url, .. } => {
                if url.trim().is_empty() {
                    Some(format!("{which}: http url must not be empty"))
                } else {
                    None
                }
            }
        }
    }

    /// Absolute probe URL: an absolute endpoint is used as-is; a path is
    /// joined onto the domain (https) when one is set, else onto host:port.
    pub fn probe_url(&self) -> String {
        let endpoint = self.health_check.endpoint.as_str();
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        let path = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{endpoint}")
        };
        match &self.target.domain {
            Some(domain) => format!("https://{domain}{path}"),
            None => format!("http://{}:{}{}", self.target.host, self.target.port, path),
        }
    }

    /// True when a probe for this environment is due at `now`
    pub fn probe_due(&self, now: DateTime<Utc>) -> bool {
        match self.status.last_check {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed >= chrono::Duration::seconds(self.health_check.interval_secs as i64)
            }
        }
    }
}
