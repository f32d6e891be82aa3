//! Authentication and request-decoding building blocks for HTTP services.
//!
//! - [`auth`]: HMAC-signed tokens over a rotating key registry, API keys, and
//!   the middlewares that enforce them
//! - [`endpoint`]: typed endpoints and composable middleware chains
//! - [`multipart`]: a streaming multipart decoder that hands out file content
//!   before the rest of the body has arrived
//! - [`transport`]: axum adapters tying the pieces to HTTP requests

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod multipart;
pub mod transport;


pub use auth::{
    ApiKeyAuth, Audience, AuthClaims, BearerOrApiKeyAuth, Claims, JwtAuth, KeyLookup, KeyRegistry,
    KeyRing, MapClaims, ParserOptions, Secret, StandardClaims, StaticApiKeys, TokenCodec,
};
pub use config::GatekitConfig;
pub use context::Context;
pub use endpoint::{
    BoxEndpoint, BoxMiddleware, ChainBuilder, Endpoint, LoggingMiddleware, Middleware, chain,
    compose, endpoint_fn,
};
pub use error::{AuthError, Error, KeyError, MultipartError, Result, TokenError};
pub use multipart::{FileStream, MultipartDecoder, Part};
pub use transport::{EndpointHandler, Envelope};
