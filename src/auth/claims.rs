//! Token claims.
//!
//! The codec is generic over [`Claims`]; callers pick the concrete variant
//! when they validate (`codec.validate::<AuthClaims>(..)`) or issue
//! (`codec.create_token(|| claims, ..)`).

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Capability every claims variant provides.
pub trait Claims: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// `sub` claim.
    fn subject(&self) -> Option<&str>;

    /// `exp` claim, seconds since the Unix epoch.
    fn expires_at(&self) -> Option<u64>;

    /// `nbf` claim, seconds since the Unix epoch.
    fn not_before(&self) -> Option<u64>;

    /// `aud` claim.
    fn audience(&self) -> Option<&str>;

    /// Variant-specific validity check run after signature and temporal
    /// checks pass. Returning `false` rejects the token as invalid.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Produces the claims value to sign.
pub type ClaimsFactory<C> = fn() -> C;

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// `aud` claim, which may be a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    /// First listed audience.
    pub fn first(&self) -> Option<&str> {
        match self {
            Audience::Single(aud) => Some(aud),
            Audience::Multiple(auds) => auds.first().map(String::as_str),
        }
    }

    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == audience,
            Audience::Multiple(auds) => auds.iter().any(|aud| aud == audience),
        }
    }
}

impl From<String> for Audience {
    fn from(aud: String) -> Self {
        Audience::Single(aud)
    }
}

impl From<&str> for Audience {
    fn from(aud: &str) -> Self {
        Audience::Single(aud.to_string())
    }
}

/// Registered JWT claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl StandardClaims {
    /// Claims for `subject`, issued now.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            sub: Some(subject.into()),
            iat: Some(now_secs()),
            ..Default::default()
        }
    }

    /// Expire `ttl` from now.
    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        self.exp = Some(now_secs().saturating_add(ttl.as_secs()));
        self
    }

    /// Become valid `delay` from now.
    pub fn with_not_before(mut self, delay: Duration) -> Self {
        self.nbf = Some(now_secs().saturating_add(delay.as_secs()));
        self
    }

    pub fn with_audience(mut self, audience: impl Into<Audience>) -> Self {
        self.aud = Some(audience.into());
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.iss = Some(issuer.into());
        self
    }
}

impl Claims for StandardClaims {
    fn subject(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    fn expires_at(&self) -> Option<u64> {
        self.exp
    }

    fn not_before(&self) -> Option<u64> {
        self.nbf
    }

    fn audience(&self) -> Option<&str> {
        self.aud.as_ref().and_then(Audience::first)
    }
}

/// Standard claims plus application identity attributes.
///
/// This is the default claims variant for the auth middlewares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthClaims {
    #[serde(flatten)]
    pub standard: StandardClaims,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl AuthClaims {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            standard: StandardClaims::new(subject),
            ..Default::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        self.standard = self.standard.with_expiry(ttl);
        self
    }

    pub fn with_not_before(mut self, delay: Duration) -> Self {
        self.standard = self.standard.with_not_before(delay);
        self
    }

    pub fn with_audience(mut self, audience: impl Into<Audience>) -> Self {
        self.standard = self.standard.with_audience(audience);
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.standard = self.standard.with_issuer(issuer);
        self
    }
}

impl Claims for AuthClaims {
    fn subject(&self) -> Option<&str> {
        self.standard.subject()
    }

    fn expires_at(&self) -> Option<u64> {
        self.standard.exp
    }

    fn not_before(&self) -> Option<u64> {
        self.standard.nbf
    }

    fn audience(&self) -> Option<&str> {
        self.standard.audience()
    }
}

/// Untyped claims, for callers that only need a few ad-hoc fields.
pub type MapClaims = Map<String, Value>;

impl Claims for MapClaims {
    fn subject(&self) -> Option<&str> {
        self.get("sub").and_then(Value::as_str)
    }

    fn expires_at(&self) -> Option<u64> {
        self.get("exp").and_then(Value::as_u64)
    }

    fn not_before(&self) -> Option<u64> {
        self.get("nbf").and_then(Value::as_u64)
    }

    fn audience(&self) -> Option<&str> {
        match self.get("aud")? {
            Value::Array(auds) => auds.first().and_then(Value::as_str),
            aud => aud.as_str(),
        }
    }
}

/// Factory for empty [`StandardClaims`].
pub fn standard_claims() -> StandardClaims {
    StandardClaims::default()
}

/// Factory for empty [`AuthClaims`].
pub fn auth_claims() -> AuthClaims {
    AuthClaims::default()
}

/// Factory for empty [`MapClaims`].
pub fn map_claims() -> MapClaims {
    MapClaims::new()
}
