// Demo HTTP API: token introspection and a streaming upload

use axum::{
    Router,
    extract::Request,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::{ApiKeyAuth, AuthClaims, BearerOrApiKeyAuth, JwtAuth, KeyRing};
use crate::config::GatekitConfig;
use crate::context::Context;
use crate::endpoint::{ChainBuilder, LoggingMiddleware, endpoint_fn};
use crate::error::{Error, MultipartError, Result};
use crate::transport::{EndpointHandler, FileUpload, decode_single_file};

/// Form fields accepted alongside an uploaded file.
#[derive(Debug, Default, Deserialize)]
pub struct UploadMeta {
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadReceipt {
    pub subject: Option<String>,
    pub field: String,
    pub file_name: String,
    pub bytes: u64,
    pub description: Option<String>,
}

/// Build the public router.
///
/// `keys` is shared with the caller so it can rotate keys while the server
/// runs; every request verifies against the registry current at that time.
pub fn create_public_router(cfg: &GatekitConfig, keys: Arc<KeyRing>) -> anyhow::Result<Router> {
    let jwt = JwtAuth::<AuthClaims>::shared(cfg.token_codec()?, keys);
    let either = BearerOrApiKeyAuth::new(jwt.clone(), ApiKeyAuth::new(cfg.api_key_validator()));
    let decoder = cfg.multipart_decoder();
    let max_file_size = decoder.max_file_size();

    let whoami_handler = EndpointHandler::new(
        |_req: Request| async { Ok::<_, Error>(()) },
        ChainBuilder::new()
            .layer(LoggingMiddleware::new("whoami"))
            .layer(jwt)
            .build(endpoint_fn(whoami)),
    )
    .with_api_key_header(cfg.api_key_header.clone());

    let upload_handler = EndpointHandler::new(
        move |req: Request| decode_single_file::<UploadMeta>(decoder, req),
        ChainBuilder::new()
            .layer(LoggingMiddleware::new("upload"))
            .layer(either)
            .build(endpoint_fn(
                move |ctx: Context, upload: FileUpload<UploadMeta>| {
                    receive_upload(ctx, upload, max_file_size)
                },
            )),
    )
    .with_api_key_header(cfg.api_key_header.clone());

    Ok(Router::new()
        .route("/health", get(health_check))
        .route("/whoami", get(whoami_handler.into_handler()))
        .route("/upload", post(upload_handler.into_handler()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        ))
}

async fn health_check() -> std::result::Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn whoami(ctx: Context, _: ()) -> Result<AuthClaims> {
    ctx.claims().cloned().ok_or(Error::Forbidden)
}

/// Stream the file to nowhere and report how much arrived.
async fn receive_upload(
    ctx: Context,
    upload: FileUpload<UploadMeta>,
    max_file_size: u64,
) -> Result<UploadReceipt> {
    let mut file = upload
        .file
        .ok_or_else(|| Error::bad_request("request carries no file part"))?;

    let bytes = file.drain().await.map_err(|err| match err.kind() {
        io::ErrorKind::InvalidData => Error::from(MultipartError::FileTooLarge {
            file_name: file.file_name().to_string(),
            limit: max_file_size,
        }),
        _ => Error::from(MultipartError::PartRead(err.to_string())),
    })?;
    debug!(file_name = %file.file_name(), bytes, "upload drained");

    Ok(UploadReceipt {
        subject: ctx.claims().and_then(|c| c.standard.sub.clone()),
        field: file.name().to_string(),
        file_name: file.file_name().to_string(),
        bytes,
        description: upload.data.description,
    })
}
