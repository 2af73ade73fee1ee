// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller identity for the control API.
//!
//! Authenticated callers present `Authorization: Bearer <token>`; the
//! configured [`IdentityProvider`] maps the token to a user. Sandboxed
//! execution also accepts anonymous callers identified only by
//! `X-Session-Id`.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use thiserror::Error;

/// Header carrying the bearer token.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Header identifying an anonymous sandbox session.
pub const SESSION_HEADER: &str = "x-session-id";

const MAX_SESSION_ID_LEN: usize = 128;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// Stable user identifier; owns environments and credit.
    pub user_id: String,
}

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Bearer token accepted by the identity provider.
    User(UserIdentity),
    /// No credentials, only a session id.
    Anonymous {
        /// Caller-chosen session id.
        session_id: String,
    },
}

impl Caller {
    /// The user id, when authenticated.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(identity) => Some(&identity.user_id),
            Self::Anonymous { .. } => None,
        }
    }

    /// The session id, when anonymous.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::User(_) => None,
            Self::Anonymous { session_id } => Some(session_id),
        }
    }
}

/// Authentication failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token and no usable session id.
    #[error("Authentication required")]
    MissingCredentials,

    /// The Authorization header is not a bearer token.
    #[error("Authorization must be a Bearer token")]
    MalformedAuthorization,

    /// The identity provider rejected the token.
    #[error("Invalid or expired token")]
    InvalidToken,
}

/// Maps credentials to users.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Validate a bearer token. `None` when it is not recognized.
    async fn validate(&self, credential: &str) -> Option<UserIdentity>;
}

/// Fixed token table loaded from `MOCKCLOUD_API_TOKENS`.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenIdentity {
    tokens: HashMap<String, String>,
}

impl StaticTokenIdentity {
    /// Parse `token:user,token:user`. Malformed entries are skipped.
    pub fn parse(raw: &str) -> Self {
        let tokens = raw
            .split(',')
            .filter_map(|entry| {
                let (token, user) = entry.trim().split_once(':')?;
                let (token, user) = (token.trim(), user.trim());
                (!token.is_empty() && !user.is_empty())
                    .then(|| (token.to_string(), user.to_string()))
            })
            .collect();
        Self { tokens }
    }

    /// Number of configured tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are configured.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenIdentity {
    async fn validate(&self, credential: &str) -> Option<UserIdentity> {
        self.tokens.get(credential).map(|user_id| UserIdentity {
            user_id: user_id.clone(),
        })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The bearer token, if an Authorization header is present.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = header(headers, AUTHORIZATION_HEADER) else {
        return Ok(None);
    };
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MalformedAuthorization)?;
    Ok(Some(token))
}

/// Resolve an authenticated user. Anonymous callers are rejected.
pub async fn authenticate(
    provider: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<UserIdentity, AuthError> {
    let token = bearer_token(headers)?.ok_or(AuthError::MissingCredentials)?;
    provider
        .validate(token)
        .await
        .ok_or(AuthError::InvalidToken)
}

/// Resolve a user, falling back to an anonymous session when no
/// Authorization header is sent.
pub async fn identify(
    provider: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<Caller, AuthError> {
    if bearer_token(headers)?.is_some() {
        return authenticate(provider, headers).await.map(Caller::User);
    }
    match header(headers, SESSION_HEADER) {
        Some(session_id) if session_id.len() <= MAX_SESSION_ID_LEN => Ok(Caller::Anonymous {
            session_id: session_id.to_string(),
        }),
        _ => Err(AuthError::MissingCredentials),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_tokens() {
        let provider = StaticTokenIdentity::parse("abc:alice, def:bob,broken,:x,y:");
        assert_eq!(provider.len(), 2);
        assert!(StaticTokenIdentity::parse("").is_empty());
    }

    #[tokio::test]
    async fn test_authenticate() {
        let provider = StaticTokenIdentity::parse("abc:alice");
        let user = authenticate(&provider, &headers(&[("authorization", "Bearer abc")]))
            .await
            .unwrap();
        assert_eq!(user.user_id, "alice");

        assert_eq!(
            authenticate(&provider, &headers(&[("authorization", "Bearer nope")])).await,
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            authenticate(&provider, &headers(&[("authorization", "Basic abc")])).await,
            Err(AuthError::MalformedAuthorization)
        );
        assert_eq!(
            authenticate(&provider, &HeaderMap::new()).await,
            Err(AuthError::MissingCredentials)
        );
    }

    #[tokio::test]
    async fn test_identify_anonymous_session() {
        let provider = StaticTokenIdentity::default();
        let caller = identify(&provider, &headers(&[("x-session-id", "sess-1")]))
            .await
            .unwrap();
        assert_eq!(caller.session_id(), Some("sess-1"));
        assert_eq!(caller.user_id(), None);

        assert_eq!(
            identify(&provider, &HeaderMap::new()).await,
            Err(AuthError::MissingCredentials)
        );
    }

    #[tokio::test]
    async fn test_identify_prefers_bearer() {
        let provider = StaticTokenIdentity::parse("abc:alice");
        let caller = identify(
            &provider,
            &headers(&[("authorization", "Bearer abc"), ("x-session-id", "sess-1")]),
        )
        .await
        .unwrap();
        assert_eq!(caller.user_id(), Some("alice"));
    }
}
