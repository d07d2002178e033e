pub mod connection;
pub mod dispatcher;

use std::sync::Arc;

use parley_db::Database;

pub use dispatcher::Dispatcher;

/// Shared context for WebSocket connection handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}
