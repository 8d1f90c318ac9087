use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use super::AppState;
use super::error::ApiError;

/// Token issuance lives elsewhere; this service only verifies.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
    pub user_id: i64,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub roles: Vec<String>,
}

#[derive(Clone)]
pub struct AuthSettings {
    decoding_key: DecodingKey,
    admin_role: String,
}

impl AuthSettings {
    pub fn new(secret: &str, admin_role: impl Into<String>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            admin_role: admin_role.into(),
        }
    }

    fn validate(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(token_data.claims)
    }
}

pub fn has_role(user: &AuthUser, required_role: &str) -> bool {
    user.roles.iter().any(|r| r == required_role)
}

/// Rejects requests without a valid bearer token and attaches an [`AuthUser`].
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = state.auth.validate(token)?;
    request.extensions_mut().insert(AuthUser {
        user_id: claims.user_id,
        roles: claims.roles,
    });

    Ok(next.run(request).await)
}

/// Runs after [`auth_middleware`].
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or(ApiError::Unauthorized)?;
    if !has_role(user, &state.auth.admin_role) {
        tracing::warn!(user_id = user.user_id, "non-admin attempted a privileged backup operation");
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}
