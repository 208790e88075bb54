//! Real-time fan-out: a single-owner hub coordinating client sessions,
//! per-session subscriptions and bounded send queues.

pub mod hub;
pub mod protocol;
pub mod session;

pub use hub::{Hub, HubEvent, HubHandle, SessionHandle, SESSION_QUEUE_CAPACITY};
pub use protocol::{ClientFrame, ServerFrame};
pub use session::{run_session, SessionConfig};
