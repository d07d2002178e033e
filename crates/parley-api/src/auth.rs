use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::info;
use uuid::Uuid;

use parley_db::StoreError;
use parley_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use parley_types::models::LedgerReason;

use crate::AppState;
use crate::error::{ApiError, ApiResult, blocking};

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(StoreError::Validation("username must be 3-32 characters".into()).into());
    }
    if req.password.len() < 8 {
        return Err(StoreError::Validation("password must be at least 8 characters".into()).into());
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|_| ApiError::Internal)?
        .to_string();

    let user_id = Uuid::new_v4();
    let username = req.username.clone();
    let grant = state.coins.signup_grant;

    let db = state.db.clone();
    blocking(move || {
        db.create_user(user_id, &username, &password_hash)?;
        if grant > 0 {
            db.credit(
                user_id,
                grant,
                LedgerReason::Topup,
                "users",
                Some(&user_id.to_string()),
                Some("signup grant"),
            )?;
        }
        Ok(())
    })
    .await?;

    let token = create_token(&state.jwt_secret, user_id, &req.username, false)
        .map_err(|_| ApiError::Internal)?;

    info!("Registered user {} ({})", req.username, user_id);

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let username = req.username.clone();
    let user = blocking(move || db.get_user_by_username(&username))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password).map_err(|_| ApiError::Internal)?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized)?;

    let user_id = parley_types::models::parse_uuid(&user.id);

    let token = create_token(&state.jwt_secret, user_id, &user.username, user.is_admin)
        .map_err(|_| ApiError::Internal)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        coins: user.coins,
        token,
    }))
}

pub(crate) fn create_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    admin: bool,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        admin,
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
