pub mod admin;
pub mod auth;
pub mod blocks;
pub mod coins;
pub mod connections;
pub mod conversations;
pub mod error;
pub mod middleware;
pub mod notifications;

use std::sync::Arc;

use parley_db::Database;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub coins: CoinConfig,
}

/// Coin costs and policy, read from the environment at startup. Stands in
/// for the settings service that owns these numbers in the full product.
#[derive(Debug, Clone, Copy)]
pub struct CoinConfig {
    /// Debited from the requester when a connection request is created.
    pub connect_cost: i64,
    /// TOPUP entry granted to every fresh account.
    pub signup_grant: i64,
    /// Whether a rejection credits the connect cost back to the requester.
    pub refund_on_reject: bool,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            connect_cost: 5,
            signup_grant: 100,
            refund_on_reject: false,
        }
    }
}
