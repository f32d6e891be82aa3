//! Authentication middlewares.
//!
//! Each middleware reads credentials the transport placed in the
//! [`Context`], authenticates them and hands the wrapped endpoint a derived
//! context carrying the verified claims. On failure the wrapped endpoint is
//! never invoked.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::auth::apikey::ApiKeyValidator;
use crate::auth::claims::Claims;
use crate::auth::keys::KeyLookup;
use crate::auth::token::TokenCodec;
use crate::auth::AuthClaims;
use crate::context::Context;
use crate::endpoint::{BoxEndpoint, Endpoint, EndpointFuture, Middleware};
use crate::error::AuthError;

/// Turns an unauthenticated context into an authenticated one.
pub trait Authenticator<C>: Send + Sync {
    fn authenticate(&self, ctx: Context<C>) -> Result<Context<C>, AuthError>;
}

struct Guarded<A, I, O, C> {
    auth: A,
    next: BoxEndpoint<I, O, C>,
}

impl<A, I, O, C> Endpoint<I, O, C> for Guarded<A, I, O, C>
where
    A: Authenticator<C>,
    I: Send + 'static,
    O: Send + 'static,
    C: Send + Sync + 'static,
{
    fn handle(&self, ctx: Context<C>, input: I) -> EndpointFuture<'_, O> {
        Box::pin(async move {
            let ctx = self.auth.authenticate(ctx)?;
            self.next.handle(ctx, input).await
        })
    }
}

/// Bearer token authentication.
pub struct JwtAuth<C = AuthClaims> {
    codec: TokenCodec,
    keys: Arc<dyn KeyLookup>,
    _claims: PhantomData<fn() -> C>,
}

impl<C: Claims> JwtAuth<C> {
    pub fn new(codec: TokenCodec, keys: impl KeyLookup + 'static) -> Self {
        Self::shared(codec, Arc::new(keys))
    }

    /// Use a key source that is also held elsewhere, e.g. a
    /// [`KeyRing`](crate::auth::KeyRing) rotated by an admin task.
    pub fn shared(codec: TokenCodec, keys: Arc<dyn KeyLookup>) -> Self {
        Self {
            codec,
            keys,
            _claims: PhantomData,
        }
    }
}

impl<C> Clone for JwtAuth<C> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            keys: self.keys.clone(),
            _claims: PhantomData,
        }
    }
}

impl<C: Claims> Authenticator<C> for JwtAuth<C> {
    fn authenticate(&self, ctx: Context<C>) -> Result<Context<C>, AuthError> {
        let token = ctx.token().ok_or(AuthError::TokenContextMissing)?;
        let claims = self.codec.validate::<C>(token, self.keys.as_ref())?;
        Ok(ctx.with_claims(claims))
    }
}

impl<I, O, C> Middleware<I, O, C> for JwtAuth<C>
where
    I: Send + 'static,
    O: Send + 'static,
    C: Claims,
{
    fn wrap(&self, next: BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C> {
        Arc::new(Guarded {
            auth: self.clone(),
            next,
        })
    }
}

/// API key authentication through a pluggable validator.
pub struct ApiKeyAuth<C = AuthClaims> {
    validator: Arc<dyn ApiKeyValidator<C>>,
}

impl<C> ApiKeyAuth<C> {
    pub fn new(validator: impl ApiKeyValidator<C> + 'static) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }
}

impl<C> Clone for ApiKeyAuth<C> {
    fn clone(&self) -> Self {
        Self {
            validator: self.validator.clone(),
        }
    }
}

impl<C> Authenticator<C> for ApiKeyAuth<C> {
    fn authenticate(&self, ctx: Context<C>) -> Result<Context<C>, AuthError> {
        let key = ctx.api_key().ok_or(AuthError::Unauthorized)?;
        let claims = self.validator.validate(key).ok_or(AuthError::Unauthorized)?;
        Ok(ctx.with_claims(claims))
    }
}

impl<I, O, C> Middleware<I, O, C> for ApiKeyAuth<C>
where
    I: Send + 'static,
    O: Send + 'static,
    C: Send + Sync + 'static,
{
    fn wrap(&self, next: BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C> {
        Arc::new(Guarded {
            auth: self.clone(),
            next,
        })
    }
}

/// Bearer token first, API key only when no bearer token was presented.
///
/// A present but invalid bearer token is rejected without trying the API key.
pub struct BearerOrApiKeyAuth<C = AuthClaims> {
    jwt: JwtAuth<C>,
    api_key: ApiKeyAuth<C>,
}

impl<C: Claims> BearerOrApiKeyAuth<C> {
    pub fn new(jwt: JwtAuth<C>, api_key: ApiKeyAuth<C>) -> Self {
        Self { jwt, api_key }
    }
}

impl<C> Clone for BearerOrApiKeyAuth<C> {
    fn clone(&self) -> Self {
        Self {
            jwt: self.jwt.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

impl<C: Claims> Authenticator<C> for BearerOrApiKeyAuth<C> {
    fn authenticate(&self, ctx: Context<C>) -> Result<Context<C>, AuthError> {
        match (ctx.token(), ctx.api_key()) {
            (Some(_), _) => self.jwt.authenticate(ctx),
            (None, Some(_)) => self.api_key.authenticate(ctx),
            (None, None) => Err(AuthError::Unauthorized),
        }
    }
}

impl<I, O, C> Middleware<I, O, C> for BearerOrApiKeyAuth<C>
where
    I: Send + 'static,
    O: Send + 'static,
    C: Claims,
{
    fn wrap(&self, next: BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C> {
        Arc::new(Guarded {
            auth: self.clone(),
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::apikey::StaticApiKeys;
    use crate::auth::claims::StandardClaims;
    use crate::auth::keys::KeyRegistry;
    use crate::auth::token::FixedSelector;
    use crate::endpoint::endpoint_fn;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn keys() -> KeyRegistry {
        KeyRegistry::new(["first-secret-key", "second-secret-key"])
    }

    /// Endpoint that counts invocations and echoes the authenticated subject.
    fn counting(calls: Arc<AtomicUsize>) -> BoxEndpoint<(), String> {
        endpoint_fn(move |ctx: Context, _: ()| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let claims = ctx.claims().ok_or(Error::Forbidden)?;
                Ok(claims.subject().unwrap_or_default().to_string())
            }
        })
    }

    fn issue(claims: AuthClaims) -> String {
        TokenCodec::new()
            .with_selector(FixedSelector(1))
            .create_token(|| claims, &keys())
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_never_calls_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint =
            JwtAuth::<AuthClaims>::new(TokenCodec::new(), keys()).wrap(counting(calls.clone()));

        let err = endpoint.handle(Context::new(), ()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::TokenContextMissing)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_token_injects_claims() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint =
            JwtAuth::<AuthClaims>::new(TokenCodec::new(), keys()).wrap(counting(calls.clone()));

        let token = issue(AuthClaims::new("user-5").with_expiry(Duration::from_secs(60)));
        let ctx = Context::new().with_token(token);
        assert_eq!(endpoint.handle(ctx, ()).await.unwrap(), "user-5");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected_with_specific_cause() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint =
            JwtAuth::<AuthClaims>::new(TokenCodec::new(), keys()).wrap(counting(calls.clone()));

        let ctx = Context::new().with_token("garbage");
        let err = endpoint.handle(ctx, ()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::TokenMalformed)));

        let expired = AuthClaims {
            standard: StandardClaims {
                sub: Some("user-5".to_string()),
                exp: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = Context::new().with_token(issue(expired));
        let err = endpoint.handle(ctx, ()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::TokenExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    fn api_keys() -> StaticApiKeys<AuthClaims> {
        StaticApiKeys::new().with_key("svc-key", AuthClaims::new("svc-reports"))
    }

    #[tokio::test]
    async fn test_api_key_auth() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = ApiKeyAuth::new(api_keys()).wrap(counting(calls.clone()));

        let ok = endpoint
            .handle(Context::new().with_api_key("svc-key"), ())
            .await
            .unwrap();
        assert_eq!(ok, "svc-reports");

        let err = endpoint
            .handle(Context::new().with_api_key("nope"), ())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::Unauthorized)));

        let err = endpoint.handle(Context::new(), ()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::Unauthorized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn combined() -> BearerOrApiKeyAuth {
        BearerOrApiKeyAuth::new(
            JwtAuth::new(TokenCodec::new(), keys()),
            ApiKeyAuth::new(api_keys()),
        )
    }

    #[tokio::test]
    async fn test_combined_prefers_bearer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = combined().wrap(counting(calls.clone()));

        let ctx = Context::new()
            .with_token(issue(AuthClaims::new("user-1")))
            .with_api_key("svc-key");
        assert_eq!(endpoint.handle(ctx, ()).await.unwrap(), "user-1");

        // an invalid bearer token does not fall back to the API key
        let ctx = Context::new().with_token("bad").with_api_key("svc-key");
        let err = endpoint.handle(ctx, ()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::TokenMalformed)));
    }

    #[tokio::test]
    async fn test_combined_falls_back_to_api_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = combined().wrap(counting(calls.clone()));

        let ctx = Context::new().with_api_key("svc-key");
        assert_eq!(endpoint.handle(ctx, ()).await.unwrap(), "svc-reports");

        let err = endpoint.handle(Context::new(), ()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::Unauthorized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_standard_claims_variant() {
        let codec = TokenCodec::new();
        let token = codec
            .create_token(|| StandardClaims::new("svc"), &keys())
            .unwrap();

        let endpoint: BoxEndpoint<(), String, StandardClaims> = endpoint_fn(
            |ctx: Context<StandardClaims>, _: ()| async move {
                Ok(ctx.claims().and_then(|c| c.sub.clone()).unwrap_or_default())
            },
        );
        let endpoint = JwtAuth::<StandardClaims>::new(codec, keys()).wrap(endpoint);

        let ctx = Context::new().with_token(token);
        assert_eq!(endpoint.handle(ctx, ()).await.unwrap(), "svc");
    }
}
