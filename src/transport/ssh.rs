//! SSH connection pool: at most `max_connections` dialed sessions globally,
//! idle sessions reused per `(target, credential)` after a liveness check.
//! Host-key verification is the default; the insecure path exists only as an
//! explicit per-environment opt-out and is warned on every dial.

use russh::client::{self, Handle};
use russh::keys::{decode_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OpsdeckError, Result, SshError};

/// Liveness probe budget for an idle session before reuse
const REUSE_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
const REUSE_CHECK_COMMAND: &str = "echo pool-liveness";

#[derive(Debug, Clone)]
pub struct SshPoolConfig {
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    pub idle_ttl: Duration,
}

impl Default for SshPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            connection_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(300),
            idle_ttl: Duration::from_secs(300),
        }
    }
}

/// How the dial treats the server's host key
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Require a match against a pinned SHA256 fingerprint
    Pinned(String),
    /// No pinned key: refuse unknown hosts (the library default)
    DenyUnknown,
    /// Accept anything. Deployment-time opt-out; every dial warns.
    InsecureAccept,
}

/// Authentication material, borrowed for the duration of one acquire
pub enum SshAuth<'a> {
    Password(&'a str),
    /// PEM/OpenSSH-encoded private key
    Key(&'a str),
}

/// Captured result of one remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    port: u16,
    username: String,
    credential_id: Uuid,
}

struct ClientHandler {
    host: String,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::InsecureAccept => {
                warn!(host = %self.host, "accepting SSH host key without verification (explicit opt-out)");
                Ok(true)
            }
            HostKeyPolicy::Pinned(expected) => {
                let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
                let expected_full = if expected.starts_with("SHA256:") {
                    expected.clone()
                } else {
                    format!("SHA256:{expected}")
                };
                if actual == expected_full {
                    Ok(true)
                } else {
                    warn!(host = %self.host, %actual, "SSH host key does not match pinned fingerprint");
                    Ok(false)
                }
            }
            HostKeyPolicy::DenyUnknown => {
                warn!(host = %self.host, "no pinned SSH host key for host; refusing dial");
                Ok(false)
            }
        }
    }
}

struct IdleEntry {
    handle: Handle<ClientHandler>,
    permit: OwnedSemaphorePermit,
    since: Instant,
}

/// A checked-out session. Return it with `SshPool::release` to keep the
/// connection warm; dropping it closes the connection and frees capacity.
pub struct PooledSession {
    handle: Handle<ClientHandler>,
    permit: OwnedSemaphorePermit,
    key: PoolKey,
    command_timeout: Duration,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("key", &self.key)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl PooledSession {
    /// Run one command, capturing stdout, stderr and the exit code.
    pub async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        self.exec_with_timeout(command, self.command_timeout).await
    }

    async fn exec_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, run_command(&self.handle, command)).await {
            Ok(result) => result,
            Err(_) => Err(SshError::CommandTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
            .into()),
        }
    }
}

async fn run_command(handle: &Handle<ClientHandler>, command: &str) -> Result<CommandOutput> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| OpsdeckError::Transport(format!("ssh channel open failed: {e}")))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| OpsdeckError::Transport(format!("ssh exec failed: {e}")))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    loop {
        let Some(msg) = channel.wait().await else {
            break;
        };
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
            _ => {}
        }
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

pub struct SshPool {
    config: SshPoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<HashMap<PoolKey, Vec<IdleEntry>>>,
}

impl SshPool {
    pub fn new(config: SshPoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config,
            semaphore,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a session for `(host, port, username, credential)`: an idle
    /// one is reused after a liveness check, otherwise a new dial is made
    /// within the connection timeout.
    pub async fn acquire(
        &self,
        host: &str,
        port: u16,
        username: &str,
        credential_id: Uuid,
        auth: SshAuth<'_>,
        policy: HostKeyPolicy,
    ) -> Result<PooledSession> {
        let key = PoolKey {
            host: host.to_string(),
            port,
            username: username.to_string(),
            credential_id,
        };

        // Reuse path: idle sessions already hold a capacity permit.
        while let Some(entry) = self.pop_idle(&key).await {
            let mut candidate = PooledSession {
                handle: entry.handle,
                permit: entry.permit,
                key: key.clone(),
                command_timeout: self.config.command_timeout,
            };
            match candidate
                .exec_with_timeout(REUSE_CHECK_COMMAND, REUSE_CHECK_TIMEOUT)
                .await
            {
                Ok(out) if out.success() => {
                    debug!(host, port, "reusing pooled ssh session");
                    return Ok(candidate);
                }
                _ => {
                    debug!(host, port, "idle ssh session failed liveness check, discarding");
                    close_handle(candidate.handle).await;
                }
            }
        }

        let permit = self.acquire_permit().await?;
        let handle = self.dial(&key, auth, policy).await?;
        Ok(PooledSession {
            handle,
            permit,
            key,
            command_timeout: self.config.command_timeout,
        })
    }

    /// Return a healthy session to the idle set for later reuse.
    pub async fn release(&self, session: PooledSession) {
        self.prune_expired().await;
        let mut idle = self.idle.lock().await;
        idle.entry(session.key.clone()).or_default().push(IdleEntry {
            handle: session.handle,
            permit: session.permit,
            since: Instant::now(),
        });
    }

    /// Disconnect every idle session. In-flight sessions close when their
    /// owners drop them.
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        for (_, entries) in idle.drain() {
            for entry in entries {
                close_handle(entry.handle).await;
                drop(entry.permit);
            }
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }
        // At capacity: evict the stalest idle session to make room.
        if self.evict_oldest_idle().await {
            if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                return Ok(permit);
            }
        }
        match tokio::time::timeout(
            self.config.connection_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(SshError::PoolExhausted {
                cap: self.config.max_connections,
            }
            .into()),
        }
    }

    async fn pop_idle(&self, key: &PoolKey) -> Option<IdleEntry> {
        let mut idle = self.idle.lock().await;
        let entries = idle.get_mut(key)?;
        while let Some(entry) = entries.pop() {
            if entry.since.elapsed() < self.config.idle_ttl {
                return Some(entry);
            }
            // expired; drop connection and its permit
            let handle = entry.handle;
            tokio::spawn(async move { close_handle(handle).await });
        }
        None
    }

    async fn prune_expired(&self) {
        let ttl = self.config.idle_ttl;
        let mut idle = self.idle.lock().await;
        for entries in idle.values_mut() {
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if entry.since.elapsed() < ttl {
                    kept.push(entry);
                } else {
                    let handle = entry.handle;
                    tokio::spawn(async move { close_handle(handle).await });
                }
            }
            *entries = kept;
        }
        idle.retain(|_, entries| !entries.is_empty());
    }

    async fn evict_oldest_idle(&self) -> bool {
        let mut idle = self.idle.lock().await;
        let oldest_key = idle
            .iter()
            .filter_map(|(key, entries)| {
                entries.iter().map(|e| e.since).min().map(|t| (key.clone(), t))
            })
            .min_by_key(|(_, t)| *t)
            .map(|(key, _)| key);

        let Some(key) = oldest_key else {
            return false;
        };
        let Some(entries) = idle.get_mut(&key) else {
            return false;
        };
        if entries.is_empty() {
            return false;
        }
        let entry = entries.remove(0);
        if entries.is_empty() {
            idle.remove(&key);
        }
        let handle = entry.handle;
        tokio::spawn(async move { close_handle(handle).await });
        true
    }

    async fn dial(
        &self,
        key: &PoolKey,
        auth: SshAuth<'_>,
        policy: HostKeyPolicy,
    ) -> Result<Handle<ClientHandler>> {
        let config = Arc::new(client::Config::default());
        let handler = ClientHandler {
            host: key.host.clone(),
            policy,
        };

        let connect = client::connect(config, (key.host.as_str(), key.port), handler);
        let mut handle = match tokio::time::timeout(self.config.connection_timeout, connect).await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(classify_dial_error(err, key).into()),
            Err(_) => {
                return Err(SshError::Transient(format!(
                    "connection to {}:{} timed out",
                    key.host, key.port
                ))
                .into())
            }
        };

        let authenticated = match auth {
            SshAuth::Password(password) => handle
                .authenticate_password(&key.username, password)
                .await
                .map_err(|e| classify_dial_error(e, key))?,
            SshAuth::Key(pem) => {
                let private_key = decode_secret_key(pem, None).map_err(|e| {
                    OpsdeckError::Credential(format!("private key for {} is invalid: {e}", key.host))
                })?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| classify_dial_error(e, key))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        &key.username,
                        PrivateKeyWithHashAlg::new(Arc::new(private_key), hash),
                    )
                    .await
                    .map_err(|e| classify_dial_error(e, key))?
            }
        };

        if !authenticated.success() {
            close_handle(handle).await;
            return Err(SshError::Auth {
                username: key.username.clone(),
                host: key.host.clone(),
            }
            .into());
        }

        debug!(host = %key.host, port = key.port, "dialed new ssh session");
        Ok(handle)
    }
}

async fn close_handle(handle: Handle<ClientHandler>) {
    let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
}

fn classify_dial_error(err: russh::Error, key: &PoolKey) -> SshError {
    match err {
        russh::Error::UnknownKey => SshError::HostKeyRejected {
            host: key.host.clone(),
            reason: "server key rejected by host-key policy".to_string(),
        },
        russh::Error::NoAuthMethod => SshError::Auth {
            username: key.username.clone(),
            host: key.host.clone(),
        },
        russh::Error::IO(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable => {
                SshError::HostUnreachable {
                    host: key.host.clone(),
                    port: key.port,
                }
            }
            _ => SshError::Transient(io.to_string()),
        },
        other => SshError::Transient(other.to_string()),
    }
}
