//! Request identity. Tokens are provisioned into the `auth_tokens` table by
//! the identity provider; this module only looks them up.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};

use crate::db::User;
use crate::routes::{ApiError, AppState};

/// The authenticated user for this request, if any.
///
/// A request without an `Authorization` header (or with a scheme other than
/// `Token`/`Bearer`) is anonymous. A recognised scheme with a missing or
/// unknown key is rejected.
#[derive(Debug, Clone)]
pub struct Viewer(pub Option<User>);

impl Viewer {
    pub fn user(&self) -> Option<&User> {
        self.0.as_ref()
    }

    /// The user, or 401 for protected routes
    pub fn require(&self) -> Result<&User, ApiError> {
        self.0.as_ref().ok_or(ApiError::NotAuthenticated)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Credentials<'a> {
    Absent,
    Malformed,
    Key(&'a str),
}

fn credentials(headers: &HeaderMap) -> Credentials<'_> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Credentials::Absent;
    };
    let Ok(value) = value.to_str() else {
        return Credentials::Malformed;
    };

    let mut parts = value.split_whitespace();
    let scheme = parts.next().unwrap_or_default();
    if !scheme.eq_ignore_ascii_case("token") && !scheme.eq_ignore_ascii_case("bearer") {
        return Credentials::Absent;
    }
    match (parts.next(), parts.next()) {
        (Some(key), None) => Credentials::Key(key),
        _ => Credentials::Malformed,
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Viewer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        match credentials(&parts.headers) {
            Credentials::Absent => Ok(Viewer(None)),
            Credentials::Malformed => Err(ApiError::InvalidToken),
            Credentials::Key(key) => match state.db.get_user_by_token(key).await? {
                Some(user) => {
                    tracing::debug!(user_id = user.id, "authenticated request");
                    Ok(Viewer(Some(user)))
                }
                None => Err(ApiError::InvalidToken),
            },
        }
    }
}
