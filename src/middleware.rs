//! Authentication middleware

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
    Extension,
};
use std::sync::Arc;
use tracing::debug;

use crate::error::TradeError;
use crate::state::AppState;
use crate::types::UserAccount;

/// Extract and validate API key from request
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(key) = extract_api_key(request.headers()) {
        match state.validate_api_key(&key) {
            // Insert validated user into request extensions
            Some(user) => {
                request.extensions_mut().insert(user);
            }
            None => debug!("Unknown API key presented"),
        }
    }

    // Continue - handlers decide if auth is required
    next.run(request).await
}

/// Helper to extract API key from headers
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-API-Key")
        .or_else(|| headers.get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_start_matches("Bearer ").trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Require authenticated user
pub fn require_auth(user: Option<Extension<UserAccount>>) -> Result<UserAccount, TradeError> {
    user.map(|Extension(u)| u).ok_or(TradeError::Unauthorized)
}

/// Require authenticated user with a linked wallet
pub fn require_wallet(user: Option<Extension<UserAccount>>) -> Result<UserAccount, TradeError> {
    let user = require_auth(user)?;
    match user.wallet_address.as_deref() {
        Some(w) if !w.is_empty() => Ok(user),
        _ => Err(TradeError::WalletNotLinked),
    }
}
