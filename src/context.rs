//! Request-scoped execution context.
//!
//! A [`Context`] is threaded through every endpoint invocation. It is never
//! mutated in place: each `with_*` method consumes the value and returns a new
//! one, so a layer that derives a context cannot affect what an outer layer
//! observes.

use std::fmt;
use std::sync::Arc;

use crate::auth::AuthClaims;

/// Immutable context carrying transport-supplied credentials and, once
/// authenticated, the verified claims.
///
/// `C` is the claims variant the auth middleware validated into.
pub struct Context<C = AuthClaims> {
    request_id: Option<Arc<str>>,
    token: Option<Arc<str>>,
    api_key: Option<Arc<str>>,
    claims: Option<Arc<C>>,
}

impl<C> Context<C> {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            request_id: None,
            token: None,
            api_key: None,
            claims: None,
        }
    }

    /// Attach the request id.
    pub fn with_request_id(self, request_id: impl Into<Arc<str>>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..self
        }
    }

    /// Attach the raw bearer token. Set by the transport before auth runs.
    pub fn with_token(self, token: impl Into<Arc<str>>) -> Self {
        Self {
            token: Some(token.into()),
            ..self
        }
    }

    /// Attach the raw API key. Set by the transport before auth runs.
    pub fn with_api_key(self, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..self
        }
    }

    /// Attach validated claims. Only auth middlewares should call this.
    pub fn with_claims(self, claims: C) -> Self {
        Self {
            claims: Some(Arc::new(claims)),
            ..self
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Validated claims, present only after an auth middleware succeeded.
    pub fn claims(&self) -> Option<&C> {
        self.claims.as_deref()
    }

    /// Whether an auth middleware has attached claims.
    pub fn is_authenticated(&self) -> bool {
        self.claims.is_some()
    }
}

impl<C> Clone for Context<C> {
    fn clone(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            token: self.token.clone(),
            api_key: self.api_key.clone(),
            claims: self.claims.clone(),
        }
    }
}

impl<C> Default for Context<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Context<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // credentials are never printed
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("has_token", &self.token.is_some())
            .field("has_api_key", &self.api_key.is_some())
            .field("authenticated", &self.claims.is_some())
            .finish()
    }
}
