use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use parley_identity::{resolve, UserIdentity};
use std::sync::Arc;

use crate::AppState;

/// Wrapper for `UserIdentity` to be stored in request extensions.
#[derive(Clone, Debug)]
pub struct IdentityContext(pub UserIdentity);

/// Resolves a bearer credential to an active user.
///
/// Every rejection maps to `401` without saying which check failed. Internal
/// failures map to `500`.
pub async fn authenticate(state: &Arc<AppState>, token: String) -> Result<UserIdentity, StatusCode> {
    let pool = state.pool.clone();
    let secret = Arc::clone(&state.token_secret);

    tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| {
            tracing::error!("auth could not get a database connection: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        resolve(&conn, &token, &secret).map_err(|e| {
            if e.is_rejection() {
                tracing::debug!("credential rejected: {}", e);
                StatusCode::UNAUTHORIZED
            } else {
                tracing::error!("credential lookup failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
}

/// Middleware to authenticate requests via `Authorization: Bearer`.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    // 1. Extract the credential from the header
    let token = match req.headers().get("Authorization") {
        Some(val) => {
            let val_str = val.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;
            val_str
                .strip_prefix("Bearer ")
                .ok_or(StatusCode::UNAUTHORIZED)?
                .to_string()
        }
        None => return Err(StatusCode::UNAUTHORIZED),
    };

    // 2. Get AppState
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    // 3. Verify the credential and load the user (blocking DB operation)
    let identity = authenticate(&state, token).await?;

    // 4. Insert into extensions
    req.extensions_mut().insert(IdentityContext(identity));

    Ok(next.run(req).await)
}
