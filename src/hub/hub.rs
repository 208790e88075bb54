//! Hub: the single owner of the session registry and subscriber index.
//!
//! All mutations arrive over one command channel and are processed one at a
//! time by the coordinator task; that total order is what lets sessions be
//! mutated without locks anywhere else. Sends into session queues are
//! non-blocking: a full queue marks the session as a slow consumer, which
//! is evicted in the same iteration.

use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{EnvStatus, OperationUpdate};
use crate::error::{OpsdeckError, Result};
use crate::hub::protocol::ServerFrame;

/// Bounded per-session outbound queue
pub const SESSION_QUEUE_CAPACITY: usize = 256;

const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Event published into the hub by the prober and the operation executor
#[derive(Debug, Clone)]
pub enum HubEvent {
    StatusUpdate {
        environment_id: Uuid,
        status: EnvStatus,
    },
    OperationUpdate {
        operation_id: Uuid,
        update: OperationUpdate,
    },
}

impl HubEvent {
    /// The environment whose subscribers receive this event. Operation
    /// updates route to the owning environment's subscribers.
    fn routing_key(&self) -> Uuid {
        match self {
            HubEvent::StatusUpdate { environment_id, .. } => *environment_id,
            HubEvent::OperationUpdate { update, .. } => update.environment_id,
        }
    }

    fn into_frame(self) -> ServerFrame {
        match self {
            HubEvent::StatusUpdate {
                environment_id,
                status,
            } => ServerFrame::StatusUpdate {
                environment_id,
                status,
            },
            HubEvent::OperationUpdate {
                operation_id,
                update,
            } => ServerFrame::OperationUpdate {
                operation_id,
                update,
            },
        }
    }
}

/// A registered session as the hub sees it
#[derive(Debug)]
pub struct SessionHandle {
    pub id: Uuid,
    pub tx: mpsc::Sender<ServerFrame>,
}

enum HubCommand {
    Register {
        session: SessionHandle,
    },
    Unregister {
        session_id: Uuid,
    },
    Subscribe {
        session_id: Uuid,
        environments: Vec<Uuid>,
    },
    Unsubscribe {
        session_id: Uuid,
        environments: Vec<Uuid>,
    },
    Publish {
        event: HubEvent,
    },
    /// Client-level ping; the pong rides the same bounded queue so a slow
    /// consumer cannot hide behind heartbeats.
    Ping {
        session_id: Uuid,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Clonable handle used by sessions and publishers
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn register(&self, session: SessionHandle) -> Result<()> {
        self.send(HubCommand::Register { session }).await
    }

    pub async fn unregister(&self, session_id: Uuid) -> Result<()> {
        self.send(HubCommand::Unregister { session_id }).await
    }

    pub async fn subscribe(&self, session_id: Uuid, environments: Vec<Uuid>) -> Result<()> {
        self.send(HubCommand::Subscribe {
            session_id,
            environments,
        })
        .await
    }

    pub async fn unsubscribe(&self, session_id: Uuid, environments: Vec<Uuid>) -> Result<()> {
        self.send(HubCommand::Unsubscribe {
            session_id,
            environments,
        })
        .await
    }

    pub async fn publish(&self, event: HubEvent) -> Result<()> {
        self.send(HubCommand::Publish { event }).await
    }

    pub async fn ping(&self, session_id: Uuid) -> Result<()> {
        self.send(HubCommand::Ping { session_id }).await
    }

    pub async fn session_count(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::SessionCount { reply }).await?;
        rx.await
            .map_err(|_| OpsdeckError::Internal("hub stopped".to_string()))
    }

    async fn send(&self, command: HubCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| OpsdeckError::Internal("hub command channel closed".to_string()))
    }
}

struct SessionEntry {
    tx: mpsc::Sender<ServerFrame>,
    subscriptions: HashSet<Uuid>,
}

/// The coordinator. Owns the registry and index exclusively.
pub struct Hub {
    sessions: HashMap<Uuid, SessionEntry>,
    /// environment id → subscribed session ids
    index: HashMap<Uuid, HashSet<Uuid>>,
}

impl Hub {
    /// Spawn the coordinator task. It drains commands until shutdown, then
    /// drops every session queue so writers close their connections.
    pub fn spawn(mut shutdown: watch::Receiver<bool>) -> (HubHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let handle = HubHandle { tx };

        let task = tokio::spawn(async move {
            let mut hub = Hub {
                sessions: HashMap::new(),
                index: HashMap::new(),
            };

            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(command) => hub.handle(command),
                        None => break,
                    },
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            let open = hub.sessions.len();
            hub.sessions.clear();
            hub.index.clear();
            info!(sessions = open, "hub stopped, session queues closed");
        });

        (handle, task)
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { session } => {
                debug!(session = %session.id, "session registered");
                self.sessions.insert(
                    session.id,
                    SessionEntry {
                        tx: session.tx,
                        subscriptions: HashSet::new(),
                    },
                );
            }
            HubCommand::Unregister { session_id } => {
                self.remove_session(session_id);
            }
            HubCommand::Subscribe {
                session_id,
                environments,
            } => {
                let Some(entry) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                for env in &environments {
                    entry.subscriptions.insert(*env);
                    self.index.entry(*env).or_default().insert(session_id);
                }
                self.reply(session_id, ServerFrame::Subscribed { environments });
            }
            HubCommand::Unsubscribe {
                session_id,
                environments,
            } => {
                let Some(entry) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                for env in &environments {
                    entry.subscriptions.remove(env);
                    if let Some(subscribers) = self.index.get_mut(env) {
                        subscribers.remove(&session_id);
                        if subscribers.is_empty() {
                            self.index.remove(env);
                        }
                    }
                }
                self.reply(session_id, ServerFrame::Unsubscribed { environments });
            }
            HubCommand::Publish { event } => {
                let key = event.routing_key();
                let frame = event.into_frame();
                let subscribers: Vec<Uuid> = self
                    .index
                    .get(&key)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                for session_id in subscribers {
                    self.reply(session_id, frame.clone());
                }
            }
            HubCommand::Ping { session_id } => {
                self.reply(session_id, ServerFrame::Pong);
            }
            HubCommand::SessionCount { reply } => {
                let _ = reply.send(self.sessions.len());
            }
        }
    }

    /// Non-blocking send; a full queue evicts the session immediately.
    fn reply(&mut self, session_id: Uuid, frame: ServerFrame) {
        let Some(entry) = self.sessions.get(&session_id) else {
            return;
        };
        match entry.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %session_id, "slow consumer: send queue full, evicting session");
                self.remove_session(session_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.remove_session(session_id);
            }
        }
    }

    fn remove_session(&mut self, session_id: Uuid) {
        let Some(entry) = self.sessions.remove(&session_id) else {
            return;
        };
        for env in entry.subscriptions {
            if let Some(subscribers) = self.index.get_mut(&env) {
                subscribers.remove(&session_id);
                if subscribers.is_empty() {
                    self.index.remove(&env);
                }
            }
        }
        debug!(session = %session_id, "session removed from registry");
        // entry.tx drops here; the session's writer observes the closed
        // queue and terminates its connection.
    }
}
