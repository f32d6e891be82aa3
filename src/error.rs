//! Error types for the request pipeline.
//!
//! Every failure the core can produce is a member of a closed enum so the
//! HTTP status mapping in [`Error::status_code`] stays table-driven.

use http::StatusCode;
use thiserror::Error;

/// Message returned to clients for any auth failure without a specific cause.
pub const NOT_AUTHORIZED_MESSAGE: &str = "not authorized to access this resource";

/// Authentication failures.
///
/// Everything except [`AuthError::NotAuthorized`] and
/// [`AuthError::Unauthorized`] names a specific cause. Failures that do not
/// match one of them collapse into `NotAuthorized`, which deliberately carries
/// no detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token was placed in the context before the auth middleware ran.
    #[error("token up for parsing was not passed through the context")]
    TokenContextMissing,

    /// The token is not a well-formed JWT.
    #[error("JWT Token is malformed")]
    TokenMalformed,

    /// The `exp` claim has passed.
    #[error("JWT Token is expired")]
    TokenExpired,

    /// The `nbf` claim is in the future.
    #[error("token is not valid yet")]
    TokenNotActive,

    /// The token parsed but its claims did not validate.
    #[error("JWT Token was invalid")]
    TokenInvalid,

    /// The token was signed with an algorithm other than the configured one.
    #[error("unexpected signing method")]
    UnexpectedSigningMethod,

    /// Catch-all for every other validation failure.
    #[error("{}", NOT_AUTHORIZED_MESSAGE)]
    NotAuthorized,

    /// No usable credential, or the API key was rejected.
    #[error("unauthorized")]
    Unauthorized,
}

/// Key registry misuse and key lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("token header carries no kid")]
    MissingKid,

    #[error("failed to parse the kid {0:?}")]
    InvalidKid(String),

    #[error("kid index {index} is out of range for {len} keys")]
    OutOfRange { index: usize, len: usize },

    #[error("key {0} has been removed")]
    Removed(usize),

    #[error("key {0} is still active; retire it before removing")]
    StillActive(usize),

    #[error("key {0} is already retired")]
    AlreadyRetired(usize),
}

/// Failures while issuing a token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no active signing keys")]
    NoSigningKeys,

    #[error("selected key index {index} is outside 0..{len}")]
    SelectionOutOfRange { index: usize, len: usize },

    #[error("algorithm {0:?} is not a symmetric signing method")]
    UnsupportedAlgorithm(jsonwebtoken::Algorithm),

    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Multipart decoding failures.
///
/// All of them abort the decode; there is no partial success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("failed to read multipart part: {0}")]
    PartRead(String),

    #[error("multipart: field {field:?} exceeds {limit} bytes")]
    PayloadTooLarge { field: String, limit: u64 },

    #[error("multipart: file {file_name:?} exceeds {limit} bytes")]
    FileTooLarge { file_name: String, limit: u64 },

    #[error("malformed multipart body: {0}")]
    Malformed(String),
}

impl From<multer::Error> for MultipartError {
    fn from(err: multer::Error) -> Self {
        match err {
            multer::Error::StreamReadFailed(e) => Self::PartRead(e.to_string()),
            other => Self::Malformed(other.to_string()),
        }
    }
}

/// Error returned by endpoints, decoders and middlewares.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("{}", NOT_AUTHORIZED_MESSAGE)]
    Forbidden,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Create a bad request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// HTTP status an outer transport should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Multipart(MultipartError::PayloadTooLarge { .. })
            | Self::Multipart(MultipartError::FileTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Multipart(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to a client.
    ///
    /// Internal errors are not echoed, and token failures other than the
    /// malformed, expired and not-yet-active causes collapse into the generic
    /// not-authorized message.
    pub fn client_message(&self) -> String {
        match self {
            Self::Auth(err @ (AuthError::TokenInvalid | AuthError::Unauthorized)) => err.to_string(),
            Self::Auth(err) => crate::auth::parse_error_message(err),
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
