use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::middleware::require_auth;
use parley_api::{AppState, AppStateInner, CoinConfig, admin, auth, blocks, coins, connections, conversations, notifications};
use parley_gateway::{Dispatcher, GatewayState, connection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let coins = coin_config()?;

    // Init database
    let db = Arc::new(parley_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
        coins,
    });
    let gateway_state = GatewayState {
        db,
        dispatcher,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/connect-requests", post(connections::create).get(connections::list))
        .route("/connect-requests/{id}", get(connections::get))
        .route("/connect-requests/{id}/approve", post(connections::approve))
        .route("/connect-requests/{id}/reject", post(connections::reject))
        .route("/connect-requests/{id}/cancel", post(connections::cancel))
        .route("/conversations", get(conversations::list))
        .route("/conversations/{id}/messages", get(conversations::messages))
        .route(
            "/conversations/{id}/messages/{message_id}",
            delete(conversations::delete_message),
        )
        .route("/conversations/{id}/read", post(conversations::mark_read))
        .route("/coins/balance", get(coins::balance))
        .route("/coins/ledger", get(coins::ledger))
        .route("/notifications", get(notifications::list))
        .route("/notifications/{id}/seen", post(notifications::mark_seen))
        .route("/notifications/seen", post(notifications::mark_all_seen))
        .route("/blocks", post(blocks::create))
        .route("/blocks/{user_id}", delete(blocks::remove))
        .route(
            "/admin/connect-requests/{id}/force",
            post(admin::force_request_status),
        )
        .route("/admin/users/{id}/coins", post(admin::adjust_coins))
        .route("/admin/blocks", post(admin::create_block))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn coin_config() -> anyhow::Result<CoinConfig> {
    let defaults = CoinConfig::default();
    Ok(CoinConfig {
        connect_cost: env_i64("PARLEY_CONNECT_COST", defaults.connect_cost)?,
        signup_grant: env_i64("PARLEY_SIGNUP_GRANT", defaults.signup_grant)?,
        refund_on_reject: std::env::var("PARLEY_REFUND_ON_REJECT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.refund_on_reject),
    })
}

fn env_i64(key: &str, default: i64) -> anyhow::Result<i64> {
    match std::env::var(key) {
        Ok(raw) => Ok(raw.parse()?),
        Err(_) => Ok(default),
    }
}

async fn ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state))
}
