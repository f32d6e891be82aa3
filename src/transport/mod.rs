//! HTTP adapters for axum.
//!
//! Everything transport-specific lives here: credential extraction from
//! headers, request decoders and [`EndpointHandler`], which turns a decoder
//! plus a composed endpoint into an axum handler answering with an
//! [`Envelope`].

mod response;

pub use response::{Envelope, error_response, success_response};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::BodyDataStream;
use axum::extract::Request;
use axum::response::Response;
use http::{HeaderMap, Uri, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::auth::AuthClaims;
use crate::context::Context;
use crate::endpoint::BoxEndpoint;
use crate::error::{Error, MultipartError, Result};
use crate::multipart::bind::{bind, bind_query, parse_query};
use crate::multipart::{BufferedFile, FileStream, MultipartDecoder, MultipartStream};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

/// Largest JSON body [`decode_json`] will buffer.
pub const MAX_JSON_BODY: usize = 5 << 20;

const BEARER_PREFIX: &str = "bearer ";

/// Token from an `Authorization: Bearer <token>` header. The scheme is
/// matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    if value.len() <= BEARER_PREFIX.len() {
        return None;
    }
    let (scheme, token) = value.split_at(BEARER_PREFIX.len());
    scheme.eq_ignore_ascii_case(BEARER_PREFIX).then_some(token)
}

/// Non-empty value of the API key header `name`.
pub fn api_key<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .filter(|key| !key.is_empty())
}

/// The caller's `X-Request-Id`, or a fresh UUID.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Build the unauthenticated context for a request.
pub fn context_from_headers<C>(headers: &HeaderMap, api_key_header: &str) -> Context<C> {
    let mut ctx = Context::new().with_request_id(request_id(headers));
    if let Some(token) = bearer_token(headers) {
        ctx = ctx.with_token(token);
    }
    if let Some(key) = api_key(headers, api_key_header) {
        ctx = ctx.with_api_key(key);
    }
    ctx
}

pub fn query_params(uri: &Uri) -> Vec<(String, String)> {
    uri.query().map(parse_query).unwrap_or_default()
}

/// Bind the URL query into `T`.
pub async fn decode_query<T: DeserializeOwned>(req: Request) -> Result<T> {
    Ok(bind_query(&query_params(req.uri()))?)
}

/// Bind a JSON body, then the URL query over it, into `T`. An empty body
/// binds as an empty object.
pub async fn decode_json<T: DeserializeOwned>(req: Request) -> Result<T> {
    let query = query_params(req.uri());
    let bytes = axum::body::to_bytes(req.into_body(), MAX_JSON_BODY)
        .await
        .map_err(|e| Error::bad_request(format!("failed to read body: {e}")))?;

    let body = if bytes.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok(bind(&[], &[body], &query)?)
}

/// Decoded single-file upload.
#[derive(Debug)]
pub struct FileUpload<T> {
    /// Form values captured before the file, with the query merged over them.
    pub data: T,
    pub file: Option<FileStream>,
}

/// Decoded buffered multipart body.
#[derive(Debug)]
pub struct BufferedUpload<T> {
    pub data: T,
    pub files: Vec<BufferedFile>,
}

fn multipart_body(req: Request) -> Result<(String, Vec<(String, String)>, BodyDataStream)> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| MultipartError::Malformed("missing content type".to_string()))?;
    let query = query_params(req.uri());
    Ok((content_type, query, req.into_body().into_data_stream()))
}

/// Multipart adapter for [`MultipartDecoder::decode_single_file`].
pub async fn decode_single_file<T: DeserializeOwned>(
    decoder: MultipartDecoder,
    req: Request,
) -> Result<FileUpload<T>> {
    let (content_type, query, body) = multipart_body(req)?;
    let upload = decoder.decode_single_file(&content_type, body).await?;
    Ok(FileUpload {
        data: upload.form.bind(&query)?,
        file: upload.file,
    })
}

/// Multipart adapter for [`MultipartDecoder::decode_stream`].
pub async fn decode_multipart_stream(
    decoder: MultipartDecoder,
    req: Request,
) -> Result<MultipartStream> {
    let (content_type, query, body) = multipart_body(req)?;
    Ok(decoder.decode_stream(&content_type, query, body)?)
}

/// Multipart adapter for [`MultipartDecoder::decode_buffered`].
pub async fn decode_multipart<T: DeserializeOwned>(
    decoder: MultipartDecoder,
    req: Request,
) -> Result<BufferedUpload<T>> {
    let (content_type, query, body) = multipart_body(req)?;
    let form = decoder.decode_buffered(&content_type, body).await?;
    Ok(BufferedUpload {
        data: form.form.bind(&query)?,
        files: form.files,
    })
}

type DecodeFuture<I> = Pin<Box<dyn Future<Output = Result<I>> + Send>>;
type DecodeFn<I> = Arc<dyn Fn(Request) -> DecodeFuture<I> + Send + Sync>;

/// An axum handler built from a request decoder and an endpoint.
///
/// The endpoint receives a context carrying the request id and whatever
/// credentials the headers held. Its output is wrapped in a success
/// envelope; decode and endpoint errors become failure envelopes with the
/// status from [`Error::status_code`].
pub struct EndpointHandler<I, O, C = AuthClaims> {
    decode: DecodeFn<I>,
    endpoint: BoxEndpoint<I, O, C>,
    api_key_header: Arc<str>,
}

impl<I, O, C> EndpointHandler<I, O, C>
where
    I: Send + 'static,
    O: Serialize + Send + 'static,
    C: Send + Sync + 'static,
{
    pub fn new<D, Fut>(decode: D, endpoint: BoxEndpoint<I, O, C>) -> Self
    where
        D: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<I>> + Send + 'static,
    {
        Self {
            decode: Arc::new(move |req: Request| -> DecodeFuture<I> { Box::pin(decode(req)) }),
            endpoint,
            api_key_header: Arc::from(DEFAULT_API_KEY_HEADER),
        }
    }

    /// Read API keys from `header` instead of `X-Api-Key`.
    pub fn with_api_key_header(mut self, header: impl Into<Arc<str>>) -> Self {
        self.api_key_header = header.into();
        self
    }

    pub async fn serve(&self, req: Request) -> Response {
        let ctx = context_from_headers::<C>(req.headers(), &self.api_key_header);
        let request_id = ctx.request_id().unwrap_or_default().to_owned();

        let input = match (self.decode)(req).await {
            Ok(input) => input,
            Err(err) => {
                debug!(request_id = %request_id, error = %err, "request decoding failed");
                return error_response(&request_id, &err);
            }
        };

        match self.endpoint.handle(ctx, input).await {
            Ok(output) => success_response(&request_id, output),
            Err(err) => error_response(&request_id, &err),
        }
    }

    /// Convert into a function usable with axum's method routers.
    pub fn into_handler(
        self,
    ) -> impl Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>>
    + Clone
    + Send
    + Sync
    + 'static {
        let this = Arc::new(self);
        move |req: Request| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            let this = Arc::clone(&this);
            Box::pin(async move { this.serve(req).await })
        }
    }
}

#[cfg(test)]
pub(crate) fn request(
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: axum::body::Body,
) -> Request {
    let mut builder = http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(body).unwrap()
}
