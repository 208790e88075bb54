pub mod auth;
pub mod credentials;
pub mod environments;
pub mod logs;
pub mod operations;
pub mod system;

pub use auth::login;
pub use credentials::{create_credential, delete_credential, list_credentials};
pub use environments::{
    check_health, create_environment, delete_environment, get_environment, list_environments,
    update_environment,
};
pub use logs::{count_logs, get_log, list_logs};
pub use operations::{list_versions, restart, upgrade};
pub use system::{health, system_status};
