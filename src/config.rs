use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub health: HealthCheckDefaults,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    /// Comma-separated in env, list in file
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Budget for draining the scheduler, hub and in-flight operations
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// PostgreSQL connection URI, or "memory" for the in-process store
    pub uri: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_storage_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_storage_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Required, non-empty; HS256 signing secret
    pub jwt_secret: String,
    #[serde(default = "default_token_expiration_secs")]
    pub token_expiration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    /// Exactly 32 bytes once decoded: raw 32 chars or 64 hex chars
    pub encryption_key: String,
}

impl CredentialConfig {
    /// Decode the configured key into the 32 raw bytes AES-256-GCM needs.
    pub fn key_bytes(&self) -> Result<[u8; 32], String> {
        let raw = self.encryption_key.as_bytes();
        if raw.len() == 32 {
            let mut out = [0u8; 32];
            out.copy_from_slice(raw);
            return Ok(out);
        }
        if self.encryption_key.len() == 64 {
            if let Ok(decoded) = hex::decode(&self.encryption_key) {
                let mut out = [0u8; 32];
                out.copy_from_slice(&decoded);
                return Ok(out);
            }
        }
        Err(format!(
            "CRED_ENCRYPTION_KEY must be exactly 32 bytes (raw) or 64 hex chars, got {} bytes",
            raw.len()
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_ssh_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_ssh_max_connections")]
    pub max_connections: usize,
    /// Seconds an idle pooled session survives before it is dropped
    #[serde(default = "default_ssh_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_ssh_connection_timeout_secs(),
            command_timeout_secs: default_ssh_command_timeout_secs(),
            max_connections: default_ssh_max_connections(),
            idle_ttl_secs: default_ssh_idle_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckDefaults {
    /// Scheduler tick period; each environment gates on its own interval
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Global probe deadline ceiling
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
    /// Bounded worker pool size for concurrent probes
    #[serde(default = "default_health_concurrency")]
    pub concurrency: usize,
}

impl Default for HealthCheckDefaults {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
            concurrency: default_health_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_ws_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ws_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_ws_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ws_ping_interval_secs(),
            pong_timeout_secs: default_ws_pong_timeout_secs(),
            max_message_bytes: default_ws_max_message_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Optional directory for rolling file output
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuditConfig {
    /// When set, audit events older than this many days are swept daily
    #[serde(default)]
    pub retention_days: Option<u32>,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_write_timeout_secs() -> u64 {
    30
}

fn default_storage_max_connections() -> u32 {
    10
}

fn default_storage_timeout_secs() -> u64 {
    10
}

fn default_token_expiration_secs() -> u64 {
    86_400
}

fn default_ssh_connection_timeout_secs() -> u64 {
    30
}

fn default_ssh_command_timeout_secs() -> u64 {
    300
}

fn default_ssh_max_connections() -> usize {
    50
}

fn default_ssh_idle_ttl_secs() -> u64 {
    300
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    60
}

fn default_health_concurrency() -> usize {
    10
}

fn default_ws_ping_interval_secs() -> u64 {
    30
}

fn default_ws_pong_timeout_secs() -> u64 {
    60
}

fn default_ws_max_message_bytes() -> usize {
    512 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from either a config directory or a single TOML file
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_path = config_dir.as_ref();

        let mut builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("storage.uri", "memory")?
            .set_default("auth.jwt_secret", "")?
            .set_default("credentials.encryption_key", "")?;

        // Accept either a config directory (`config/`) or a single TOML file.
        if config_path.is_file() {
            builder = builder.add_source(File::from(config_path).required(true));
        } else {
            builder = builder
                .add_source(File::from(config_path.join("default.toml")).required(false))
                .add_source(
                    File::from(config_path.join(
                        std::env::var("OPSDECK_ENV").unwrap_or_else(|_| "development".to_string()),
                    ))
                    .required(false),
                );
        }

        builder = builder.add_source(
            // Override with environment variables (OPSDECK_SERVER__PORT, etc.)
            Environment::with_prefix("OPSDECK")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("allowed_origins")
                .try_parsing(true),
        );

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Validate configuration values. Any violation is fatal at startup.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.auth.jwt_secret.trim().is_empty() {
            errors.push("JWT_SECRET must be set and non-empty".to_string());
        }

        if let Err(e) = self.credentials.key_bytes() {
            errors.push(e);
        }

        if self.server.port == 0 {
            errors.push("SERVER_PORT must be in [1, 65535]".to_string());
        }

        if self.storage.uri.trim().is_empty() {
            errors.push("STORAGE_URI must not be empty".to_string());
        }

        if self.health.concurrency == 0 {
            errors.push("HEALTH_CHECK_CONCURRENCY must be > 0".to_string());
        }

        if self.ssh.max_connections == 0 {
            errors.push("SSH_MAX_CONNECTIONS must be > 0".to_string());
        }

        if self.ws.pong_timeout_secs <= self.ws.ping_interval_secs {
            errors.push("WS_PONG_TIMEOUT must exceed WS_PING_INTERVAL".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Flat deployment-facing variable names take precedence over everything
    /// the file/prefixed sources produced.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string(&["SERVER_HOST"]) {
            self.server.host = v;
        }
        if let Some(v) = env_u64(&["SERVER_PORT"]).and_then(|v| u16::try_from(v).ok()) {
            self.server.port = v;
        }
        if let Some(v) = env_u64(&["READ_TIMEOUT"]) {
            self.server.read_timeout_secs = v;
        }
        if let Some(v) = env_u64(&["WRITE_TIMEOUT"]) {
            self.server.write_timeout_secs = v;
        }

        if let Some(v) = env_string(&["STORAGE_URI", "DATABASE_URL"]) {
            self.storage.uri = v;
        }
        if let Some(v) = env_string(&["STORAGE_DATABASE"]) {
            self.storage.database = Some(v);
        }
        if let Some(v) = env_u64(&["STORAGE_MAX_CONNECTIONS"]).and_then(|v| u32::try_from(v).ok())
        {
            self.storage.max_connections = v;
        }
        if let Some(v) = env_u64(&["STORAGE_TIMEOUT"]) {
            self.storage.timeout_secs = v;
        }

        if let Some(v) = env_string(&["JWT_SECRET"]) {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = env_u64(&["TOKEN_EXPIRATION"]) {
            self.auth.token_expiration_secs = v;
        }
        if let Some(v) = env_string(&["CRED_ENCRYPTION_KEY"]) {
            self.credentials.encryption_key = v;
        }

        if let Some(v) = env_u64(&["SSH_CONNECTION_TIMEOUT"]) {
            self.ssh.connection_timeout_secs = v;
        }
        if let Some(v) = env_u64(&["SSH_COMMAND_TIMEOUT"]) {
            self.ssh.command_timeout_secs = v;
        }
        if let Some(v) = env_u64(&["SSH_MAX_CONNECTIONS"]) {
            self.ssh.max_connections = v as usize;
        }

        if let Some(v) = env_u64(&["HEALTH_CHECK_INTERVAL"]) {
            self.health.interval_secs = v;
        }
        if let Some(v) = env_u64(&["HEALTH_CHECK_TIMEOUT"]) {
            self.health.timeout_secs = v;
        }
        if let Some(v) = env_u64(&["HEALTH_CHECK_CONCURRENCY"]) {
            self.health.concurrency = v as usize;
        }

        if let Some(v) = env_string(&["ALLOWED_ORIGINS"]) {
            self.allowed_origins = parse_string_list(&v);
        }

        if let Some(v) = env_u64(&["WS_PING_INTERVAL"]) {
            self.ws.ping_interval_secs = v;
        }
        if let Some(v) = env_u64(&["WS_PONG_TIMEOUT"]) {
            self.ws.pong_timeout_secs = v;
        }
        if let Some(v) = env_u64(&["WS_MAX_MESSAGE_SIZE"]) {
            self.ws.max_message_bytes = v as usize;
        }

        if let Some(v) = env_u64(&["AUDIT_RETENTION_DAYS"]).and_then(|v| u32::try_from(v).ok()) {
            self.audit.retention_days = Some(v);
        }
    }
}

fn env_string(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(v) = std::env::var(key) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
    }
    None
}

fn env_u64(keys: &[&str]) -> Option<u64> {
    env_string(keys).and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_string_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
