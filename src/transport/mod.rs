//! Outbound transports: HTTP (probes and actions) and SSH (actions), plus
//! the JSONPath subset and `{VERSION}` substitution shared above them.

pub mod http;
pub mod jsonpath;
pub mod ssh;
pub mod substitute;

pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use ssh::{CommandOutput, HostKeyPolicy, PooledSession, SshAuth, SshPool, SshPoolConfig};
