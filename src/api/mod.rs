pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;
pub mod websocket;

pub use auth::AuthKeys;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
