//! Token and API key authentication.
//!
//! - **Keys**: an index-addressed [`KeyRegistry`], hot-swappable through a
//!   [`KeyRing`] for rotation
//! - **Claims**: the [`Claims`] capability with standard, application and
//!   untyped variants
//! - **Tokens**: [`TokenCodec`] signs with a randomly selected active key and
//!   validates against any [`KeyLookup`]
//! - **Middlewares**: [`JwtAuth`], [`ApiKeyAuth`] and [`BearerOrApiKeyAuth`]
//!   guard an endpoint and inject the verified claims into its context
//!
//! ## Usage
//!
//! ```ignore
//! let keys = KeyRegistry::new(config.keys.clone());
//! let codec = TokenCodec::new().with_options(ParserOptions::default().with_audience("api"));
//!
//! let token = codec.create_token(|| AuthClaims::new("user-1"), &keys)?;
//!
//! let endpoint = JwtAuth::<AuthClaims>::new(codec, keys).wrap(endpoint_fn(whoami));
//! ```

mod apikey;
mod claims;
mod keys;
mod middleware;
mod token;

pub use apikey::{ApiKeyValidator, StaticApiKeys, generate_api_key, hash_api_key};
pub use claims::{
    Audience, AuthClaims, Claims, ClaimsFactory, MapClaims, StandardClaims, auth_claims,
    map_claims, standard_claims,
};
pub use keys::{KeyLookup, KeyRegistry, KeyRing, Secret, parse_kid};
pub use middleware::{ApiKeyAuth, Authenticator, BearerOrApiKeyAuth, JwtAuth};
pub use token::{
    FixedSelector, KeySelector, ParserOptions, RandomSelector, SelectionPolicy, TokenCodec,
    parse_error_message,
};
