//! Token issuance and validation against a [`KeyRegistry`].
//!
//! Tokens are HMAC-signed JWTs. The index of the signing key is written into
//! the `kid` header so that several keys can be live at once and rotated out
//! gradually.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
};
use rand::Rng;
use serde::Deserialize;
use tracing::debug;

use crate::auth::claims::Claims;
use crate::auth::keys::{KeyLookup, KeyRegistry, Secret};
use crate::error::{AuthError, NOT_AUTHORIZED_MESSAGE, TokenError};

/// Picks which of `candidates` active keys signs the next token.
pub trait KeySelector: Send + Sync {
    fn select(&self, candidates: usize) -> usize;
}

/// Uniform random selection from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSelector;

impl KeySelector for RandomSelector {
    fn select(&self, candidates: usize) -> usize {
        if candidates <= 1 {
            return 0;
        }
        rand::rng().random_range(0..candidates)
    }
}

/// Always returns the same position. Useful in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelector(pub usize);

impl KeySelector for FixedSelector {
    fn select(&self, _candidates: usize) -> usize {
        self.0
    }
}

/// What to do when a selector returns a position outside the active keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Refuse to issue.
    #[default]
    Strict,
    /// Clamp into `[0, len - 1]`.
    Clamp,
}

/// Claim checks applied on top of signature verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserOptions {
    pub audience: Option<String>,
    pub issuer: Option<String>,
    /// Clock skew tolerance in seconds for `exp` and `nbf`.
    pub leeway: u64,
    /// Registered claims that must be present, e.g. `"exp"`.
    pub required_claims: Vec<String>,
}

impl ParserOptions {
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_leeway(mut self, leeway: u64) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn require(mut self, claim: impl Into<String>) -> Self {
        self.required_claims.push(claim.into());
        self
    }
}

/// Creates and validates signed tokens.
#[derive(Clone)]
pub struct TokenCodec {
    algorithm: Algorithm,
    options: ParserOptions,
    selector: Arc<dyn KeySelector>,
    policy: SelectionPolicy,
}

impl TokenCodec {
    /// HS256, default parser options, random key selection, strict policy.
    pub fn new() -> Self {
        Self {
            algorithm: Algorithm::HS256,
            options: ParserOptions::default(),
            selector: Arc::new(RandomSelector),
            policy: SelectionPolicy::Strict,
        }
    }

    /// Use a different HMAC algorithm. Tokens signed with anything else are
    /// rejected.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Result<Self, TokenError> {
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(TokenError::UnsupportedAlgorithm(algorithm));
        }
        self.algorithm = algorithm;
        Ok(self)
    }

    pub fn with_options(mut self, options: ParserOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_selector(mut self, selector: impl KeySelector + 'static) -> Self {
        self.selector = Arc::new(selector);
        self
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    /// Choose the signing key among the registry's active keys.
    ///
    /// Returns the absolute registry index, which becomes the `kid`.
    pub fn select_key<'a>(&self, keys: &'a KeyRegistry) -> Result<(usize, &'a Secret), TokenError> {
        let candidates = keys.issuable();
        if candidates.is_empty() {
            return Err(TokenError::NoSigningKeys);
        }

        let len = candidates.len();
        let mut position = self.selector.select(len);
        if position >= len {
            match self.policy {
                SelectionPolicy::Strict => {
                    return Err(TokenError::SelectionOutOfRange {
                        index: position,
                        len,
                    });
                }
                SelectionPolicy::Clamp => position = len - 1,
            }
        }

        Ok(candidates[position])
    }

    /// Sign the claims produced by `factory` with a key from `keys`.
    pub fn create_token<C, F>(&self, factory: F, keys: &KeyRegistry) -> Result<String, TokenError>
    where
        C: Claims,
        F: FnOnce() -> C,
    {
        let claims = factory();
        let (index, secret) = self.select_key(keys)?;

        let mut header = Header::new(self.algorithm);
        header.kid = Some(index.to_string());

        let token = encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes()))?;
        debug!(kid = index, subject = ?claims.subject(), "issued token");
        Ok(token)
    }

    /// Verify `token` and decode its payload as `C`.
    ///
    /// The algorithm is checked before any key lookup. Failures other than
    /// the specific causes in [`AuthError`] collapse into
    /// [`AuthError::NotAuthorized`].
    pub fn validate<C: Claims>(&self, token: &str, keys: &dyn KeyLookup) -> Result<C, AuthError> {
        let header = decode_header(token).map_err(|e| match declared_algorithm(token) {
            Some(alg) if alg.parse::<Algorithm>().ok() != Some(self.algorithm) => {
                debug!(
                    expected = ?self.algorithm,
                    actual = %alg,
                    "token declares unsupported algorithm"
                );
                AuthError::UnexpectedSigningMethod
            }
            _ => {
                debug!(error = %e, "token header could not be decoded");
                AuthError::TokenMalformed
            }
        })?;

        if header.alg != self.algorithm {
            debug!(
                expected = ?self.algorithm,
                actual = ?header.alg,
                "token signed with unexpected algorithm"
            );
            return Err(AuthError::UnexpectedSigningMethod);
        }

        let secret = keys.lookup(header.kid.as_deref()).map_err(|e| {
            debug!(error = %e, kid = ?header.kid, "verification key lookup failed");
            AuthError::NotAuthorized
        })?;

        let data = decode::<C>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &self.validation(),
        )
        .map_err(classify)?;

        if !data.claims.is_valid() {
            return Err(AuthError::TokenInvalid);
        }

        Ok(data.claims)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = self.options.leeway;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&self.options.required_claims);

        match &self.options.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.options.issuer {
            validation.set_issuer(&[issuer]);
        }

        validation
    }
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", &self.algorithm)
            .field("options", &self.options)
            .field("policy", &self.policy)
            .finish()
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

/// `alg` from a header jsonwebtoken refused, e.g. `none`.
fn declared_algorithm(token: &str) -> Option<String> {
    let segment = token.split('.').next()?;
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<RawHeader>(&bytes)
        .ok()
        .map(|header| header.alg)
}

fn classify(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            AuthError::TokenMalformed
        }
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::ImmatureSignature => AuthError::TokenNotActive,
        ErrorKind::InvalidAlgorithm => AuthError::UnexpectedSigningMethod,
        ErrorKind::MissingRequiredClaim(_) => AuthError::TokenInvalid,
        _ => {
            debug!(error = %err, "token rejected");
            AuthError::NotAuthorized
        }
    }
}

/// Client-facing message for an auth failure.
///
/// Only malformed, expired and not-yet-valid tokens get a specific message.
pub fn parse_error_message(err: &AuthError) -> String {
    match err {
        AuthError::TokenMalformed | AuthError::TokenExpired | AuthError::TokenNotActive => {
            err.to_string()
        }
        _ => NOT_AUTHORIZED_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::{AuthClaims, MapClaims, StandardClaims};
    use crate::error::KeyError;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    fn registry() -> KeyRegistry {
        KeyRegistry::new([
            "6ai1Vz6dHy9PbLCKUc8QtadUIuOUMuHQ",
            "rUpWCnIwgvHfEpKJpXknmw5ozfBrpzbz",
            "bczvJVnrzXk5WHzSTm5GNMQo5nBfHnyK",
        ])
    }

    fn kid_of(token: &str) -> String {
        decode_header(token).unwrap().kid.unwrap()
    }

    fn sign_with_header(header: Header, secret: &str, claims: &impl Serialize) -> String {
        encode(&header, claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    #[test]
    fn test_round_trip_returns_same_claims() {
        let keys = registry();
        let codec = TokenCodec::new().with_selector(FixedSelector(2));
        let claims = AuthClaims::new("user-7")
            .with_username("alice")
            .with_admin(true)
            .with_meta("region", "eu")
            .with_expiry(Duration::from_secs(300));

        let token = codec.create_token(|| claims.clone(), &keys).unwrap();
        assert_eq!(kid_of(&token), "2");

        let validated: AuthClaims = codec.validate(&token, &keys).unwrap();
        assert_eq!(validated, claims);
    }

    #[test]
    fn test_single_key_always_index_zero() {
        let keys = KeyRegistry::new(["only-key"]);
        let codec = TokenCodec::new();
        for _ in 0..20 {
            let token = codec
                .create_token(|| StandardClaims::new("s"), &keys)
                .unwrap();
            assert_eq!(kid_of(&token), "0");
        }
    }

    proptest! {
        #[test]
        fn prop_selected_kid_within_registry(n in 1usize..24) {
            let keys = KeyRegistry::new((0..n).map(|i| format!("key-number-{i}")));
            let codec = TokenCodec::new();
            let token = codec.create_token(|| StandardClaims::new("s"), &keys).unwrap();
            let kid: usize = kid_of(&token).parse().unwrap();
            prop_assert!(kid < n);
        }
    }

    #[test]
    fn test_issuance_skips_retired_keys() {
        let keys = registry().retire(0).unwrap().retire(1).unwrap();
        let codec = TokenCodec::new();
        for _ in 0..10 {
            let token = codec
                .create_token(|| StandardClaims::new("s"), &keys)
                .unwrap();
            assert_eq!(kid_of(&token), "2");
        }
    }

    #[test]
    fn test_strict_policy_rejects_out_of_range_selection() {
        let codec = TokenCodec::new().with_selector(FixedSelector(7));
        let err = codec
            .create_token(|| StandardClaims::new("s"), &registry())
            .unwrap_err();
        assert!(matches!(
            err,
            TokenError::SelectionOutOfRange { index: 7, len: 3 }
        ));
    }

    #[test]
    fn test_clamp_policy_clamps_selection() {
        let codec = TokenCodec::new()
            .with_selector(FixedSelector(7))
            .with_policy(SelectionPolicy::Clamp);
        let token = codec
            .create_token(|| StandardClaims::new("s"), &registry())
            .unwrap();
        assert_eq!(kid_of(&token), "2");
    }

    #[test]
    fn test_no_active_keys() {
        let keys = KeyRegistry::new(["a"]).retire(0).unwrap();
        let err = TokenCodec::new()
            .create_token(|| StandardClaims::new("s"), &keys)
            .unwrap_err();
        assert!(matches!(err, TokenError::NoSigningKeys));
    }

    #[test]
    fn test_rejects_asymmetric_algorithm() {
        let err = TokenCodec::new().with_algorithm(Algorithm::RS256).unwrap_err();
        assert!(matches!(err, TokenError::UnsupportedAlgorithm(Algorithm::RS256)));
    }

    #[test]
    fn test_unexpected_signing_method() {
        let keys = registry();
        let hs512 = TokenCodec::new().with_algorithm(Algorithm::HS512).unwrap();
        let token = hs512.create_token(|| StandardClaims::new("s"), &keys).unwrap();

        let result = TokenCodec::new().validate::<StandardClaims>(&token, &keys);
        assert_eq!(result.unwrap_err(), AuthError::UnexpectedSigningMethod);
    }

    #[test]
    fn test_unexpected_signing_method_checked_before_kid() {
        let mut header = Header::new(Algorithm::HS384);
        header.kid = Some("not-a-number".to_string());
        let token = sign_with_header(header, "whatever", &StandardClaims::new("s"));

        let result = TokenCodec::new().validate::<StandardClaims>(&token, &registry());
        assert_eq!(result.unwrap_err(), AuthError::UnexpectedSigningMethod);
    }

    fn unsigned_token(header: &str) -> String {
        let payload = serde_json::to_vec(&StandardClaims::new("s")).unwrap();
        format!(
            "{}.{}.",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn test_alg_none_is_unexpected_signing_method() {
        let token = unsigned_token(r#"{"alg":"none","typ":"JWT","kid":"0"}"#);
        let result = TokenCodec::new().validate::<StandardClaims>(&token, &registry());
        assert_eq!(result.unwrap_err(), AuthError::UnexpectedSigningMethod);
    }

    #[test]
    fn test_unknown_alg_is_unexpected_signing_method() {
        for alg in ["HS1", "ES256K", "None"] {
            let token = unsigned_token(&format!(r#"{{"alg":"{alg}","kid":"0"}}"#));
            assert_eq!(
                TokenCodec::new()
                    .validate::<StandardClaims>(&token, &registry())
                    .unwrap_err(),
                AuthError::UnexpectedSigningMethod,
                "alg {alg}"
            );
        }
    }

    #[test]
    fn test_header_without_alg_is_malformed() {
        for header in [r#"{"typ":"JWT"}"#, "not json", r#"{"alg":7}"#] {
            let token = unsigned_token(header);
            assert_eq!(
                TokenCodec::new()
                    .validate::<StandardClaims>(&token, &registry())
                    .unwrap_err(),
                AuthError::TokenMalformed,
                "header {header}"
            );
        }
    }

    #[test]
    fn test_kid_out_of_range_fails() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("9".to_string());
        let token = sign_with_header(header, "6ai1Vz6dHy9PbLCKUc8QtadUIuOUMuHQ", &StandardClaims::new("s"));

        let result = TokenCodec::new().validate::<StandardClaims>(&token, &registry());
        assert_eq!(result.unwrap_err(), AuthError::NotAuthorized);
    }

    #[test]
    fn test_non_numeric_or_missing_kid_fails() {
        let secret = "6ai1Vz6dHy9PbLCKUc8QtadUIuOUMuHQ";

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("zero".to_string());
        let token = sign_with_header(header, secret, &StandardClaims::new("s"));
        let result = TokenCodec::new().validate::<StandardClaims>(&token, &registry());
        assert_eq!(result.unwrap_err(), AuthError::NotAuthorized);

        let token = sign_with_header(Header::new(Algorithm::HS256), secret, &StandardClaims::new("s"));
        let result = TokenCodec::new().validate::<StandardClaims>(&token, &registry());
        assert_eq!(result.unwrap_err(), AuthError::NotAuthorized);
    }

    #[test]
    fn test_rotation_keeps_retired_key_verifiable_until_removed() {
        let keys = registry();
        let codec = TokenCodec::new().with_selector(FixedSelector(1));
        let token = codec.create_token(|| StandardClaims::new("s"), &keys).unwrap();
        assert_eq!(kid_of(&token), "1");

        let retired = keys.retire(1).unwrap();
        assert!(codec.validate::<StandardClaims>(&token, &retired).is_ok());

        let removed = retired.remove(1).unwrap();
        assert_eq!(
            codec.validate::<StandardClaims>(&token, &removed).unwrap_err(),
            AuthError::NotAuthorized
        );
    }

    #[test]
    fn test_wrong_key_for_kid_fails_generically() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("0".to_string());
        let token = sign_with_header(header, "some-other-secret", &StandardClaims::new("s"));

        let result = TokenCodec::new().validate::<StandardClaims>(&token, &registry());
        assert_eq!(result.unwrap_err(), AuthError::NotAuthorized);
    }

    #[test]
    fn test_expired_token() {
        let keys = registry();
        let codec = TokenCodec::new();
        let claims = StandardClaims {
            sub: Some("s".to_string()),
            exp: Some(now() - 120),
            ..Default::default()
        };
        let token = codec.create_token(|| claims, &keys).unwrap();

        assert_eq!(
            codec.validate::<StandardClaims>(&token, &keys).unwrap_err(),
            AuthError::TokenExpired
        );
    }

    #[test]
    fn test_leeway_tolerates_recent_expiry() {
        let keys = registry();
        let codec = TokenCodec::new().with_options(ParserOptions::default().with_leeway(300));
        let claims = StandardClaims {
            exp: Some(now() - 30),
            ..Default::default()
        };
        let token = codec.create_token(|| claims, &keys).unwrap();
        assert!(codec.validate::<StandardClaims>(&token, &keys).is_ok());
    }

    #[test]
    fn test_not_yet_active_token() {
        let keys = registry();
        let codec = TokenCodec::new();
        let claims = StandardClaims::new("s").with_not_before(Duration::from_secs(3600));
        let token = codec.create_token(|| claims, &keys).unwrap();

        assert_eq!(
            codec.validate::<StandardClaims>(&token, &keys).unwrap_err(),
            AuthError::TokenNotActive
        );
    }

    #[test]
    fn test_malformed_token() {
        let codec = TokenCodec::new();
        for token in ["", "not-a-token", "a.b", "a.b.c"] {
            assert_eq!(
                codec.validate::<StandardClaims>(token, &registry()).unwrap_err(),
                AuthError::TokenMalformed,
                "token {token:?}"
            );
        }
    }

    #[test]
    fn test_tampered_payload_fails() {
        let keys = registry();
        let codec = TokenCodec::new();
        let token = codec
            .create_token(|| AuthClaims::new("s").with_admin(false), &keys)
            .unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(r#"{"sub":"s","is_admin":true}"#);
        parts[1] = &forged;
        let forged_token = parts.join(".");

        assert_eq!(
            codec.validate::<AuthClaims>(&forged_token, &keys).unwrap_err(),
            AuthError::NotAuthorized
        );
    }

    #[test]
    fn test_audience_checks() {
        let keys = registry();
        let codec =
            TokenCodec::new().with_options(ParserOptions::default().with_audience("billing"));

        let good = codec
            .create_token(|| StandardClaims::new("s").with_audience("billing"), &keys)
            .unwrap();
        assert!(codec.validate::<StandardClaims>(&good, &keys).is_ok());

        let bad = codec
            .create_token(|| StandardClaims::new("s").with_audience("reports"), &keys)
            .unwrap();
        assert_eq!(
            codec.validate::<StandardClaims>(&bad, &keys).unwrap_err(),
            AuthError::NotAuthorized
        );
    }

    #[test]
    fn test_audience_array_is_accepted() {
        let keys = registry();
        let codec =
            TokenCodec::new().with_options(ParserOptions::default().with_audience("billing"));
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("0".to_string());
        let token = sign_with_header(
            header,
            "6ai1Vz6dHy9PbLCKUc8QtadUIuOUMuHQ",
            &serde_json::json!({ "sub": "s", "aud": ["reports", "billing"] }),
        );

        let claims: AuthClaims = codec.validate(&token, &keys).unwrap();
        assert!(claims.standard.aud.unwrap().contains("billing"));
    }

    #[test]
    fn test_required_claim_missing_is_invalid() {
        let keys = registry();
        let codec = TokenCodec::new().with_options(ParserOptions::default().require("exp"));
        let token = codec
            .create_token(|| StandardClaims::new("s"), &keys)
            .unwrap();

        assert_eq!(
            codec.validate::<StandardClaims>(&token, &keys).unwrap_err(),
            AuthError::TokenInvalid
        );
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ServiceClaims {
        sub: String,
        scopes: Vec<String>,
    }

    impl Claims for ServiceClaims {
        fn subject(&self) -> Option<&str> {
            Some(&self.sub)
        }

        fn expires_at(&self) -> Option<u64> {
            None
        }

        fn not_before(&self) -> Option<u64> {
            None
        }

        fn audience(&self) -> Option<&str> {
            None
        }

        fn is_valid(&self) -> bool {
            !self.scopes.is_empty()
        }
    }

    #[test]
    fn test_claims_validity_hook() {
        let keys = registry();
        let codec = TokenCodec::new();
        let token = codec
            .create_token(
                || ServiceClaims {
                    sub: "svc".to_string(),
                    scopes: vec![],
                },
                &keys,
            )
            .unwrap();

        assert_eq!(
            codec.validate::<ServiceClaims>(&token, &keys).unwrap_err(),
            AuthError::TokenInvalid
        );
    }

    #[test]
    fn test_map_claims_variant() {
        let keys = registry();
        let codec = TokenCodec::new();
        let mut claims = MapClaims::new();
        claims.insert("sub".into(), "svc".into());
        claims.insert("tier".into(), "gold".into());

        let token = codec.create_token(|| claims.clone(), &keys).unwrap();
        let validated: MapClaims = codec.validate(&token, &keys).unwrap();
        assert_eq!(validated, claims);
    }

    #[test]
    fn test_closure_key_lookup() {
        let keys = registry();
        let codec = TokenCodec::new().with_selector(FixedSelector(0));
        let token = codec.create_token(|| StandardClaims::new("s"), &keys).unwrap();

        let lookup = |kid: Option<&str>| -> Result<Secret, KeyError> {
            match kid {
                Some("0") => Ok(Secret::from("6ai1Vz6dHy9PbLCKUc8QtadUIuOUMuHQ")),
                _ => Err(KeyError::MissingKid),
            }
        };
        assert!(codec.validate::<StandardClaims>(&token, &lookup).is_ok());
    }

    #[test]
    fn test_parse_error_message() {
        assert_eq!(
            parse_error_message(&AuthError::TokenExpired),
            "JWT Token is expired"
        );
        assert_eq!(
            parse_error_message(&AuthError::UnexpectedSigningMethod),
            NOT_AUTHORIZED_MESSAGE
        );
    }
}
