//! Streaming multipart decoder.
//!
//! Parts are read in arrival order. Parts without a filename are form values,
//! captured in memory up to `max_field_size`. Parts with a filename are files:
//! depending on the flavor they are handed out as a [`FileStream`] while the
//! body is still being read, or buffered up to `max_file_size`.
//!
//! Three flavors:
//!
//! - [`MultipartDecoder::decode_single_file`]: form values up to the first
//!   file, which is returned as a stream. Later parts are not read.
//! - [`MultipartDecoder::decode_stream`]: every part, in order, over a
//!   channel, with a separate error channel.
//! - [`MultipartDecoder::decode_buffered`]: every part, files buffered.

pub mod bind;
mod stream;

pub use bind::{bind, bind_query, merge_json_objects, parse_query};
pub use stream::FileStream;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use multer::{Field, Multipart};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::MultipartError;

/// Default cap for an in-memory form value.
pub const DEFAULT_MAX_FIELD_SIZE: u64 = 5 * 1024 * 1024;

/// Default cap for a single file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 32 * 1024 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json";

/// A form value part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPart {
    pub name: String,
    pub content_type: Option<String>,
    pub value: Bytes,
}

impl FieldPart {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
    }

    pub fn text(&self) -> Result<&str, MultipartError> {
        std::str::from_utf8(&self.value).map_err(|_| {
            MultipartError::Malformed(format!("field {:?} is not valid UTF-8", self.name))
        })
    }
}

/// One part of a streamed body.
#[derive(Debug)]
pub enum Part {
    Field(FieldPart),
    File(FileStream),
}

/// Form values and JSON parts captured during a decode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    values: Vec<(String, String)>,
    json: Vec<Value>,
}

impl FormData {
    /// Record a form value part. JSON parts are parsed and kept apart.
    pub fn push(&mut self, field: &FieldPart) -> Result<(), MultipartError> {
        if field.is_json() {
            let value = serde_json::from_slice(&field.value).map_err(|e| {
                MultipartError::Malformed(format!("JSON part {:?}: {}", field.name, e))
            })?;
            self.json.push(value);
        } else {
            self.values
                .push((field.name.clone(), field.text()?.to_string()));
        }
        Ok(())
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn values(&self) -> &[(String, String)] {
        &self.values
    }

    pub fn json_parts(&self) -> &[Value] {
        &self.json
    }

    /// Bind the captured values, then the JSON parts, then `query` into `T`.
    pub fn bind<T: DeserializeOwned>(&self, query: &[(String, String)]) -> Result<T, serde_json::Error> {
        bind::bind(&self.values, &self.json, query)
    }
}

/// Result of [`MultipartDecoder::decode_single_file`].
#[derive(Debug)]
pub struct SingleFileUpload {
    pub form: FormData,
    /// `None` when the body carried no file part.
    pub file: Option<FileStream>,
}

/// A buffered file part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedFile {
    pub name: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub content: Bytes,
}

/// Result of [`MultipartDecoder::decode_buffered`].
#[derive(Debug, Default)]
pub struct MultipartForm {
    pub form: FormData,
    pub files: Vec<BufferedFile>,
}

/// Result of [`MultipartDecoder::decode_stream`].
///
/// `parts` yields parts in arrival order and closes when the body is
/// exhausted or decoding failed. A failure is delivered on `errors` before
/// `parts` closes. File parts must be drained or dropped before the next part
/// is produced.
#[derive(Debug)]
pub struct MultipartStream {
    pub query: Vec<(String, String)>,
    pub parts: mpsc::Receiver<Part>,
    pub errors: mpsc::Receiver<MultipartError>,
}

impl MultipartStream {
    /// Next part, or the error that ended the decode.
    pub async fn next_part(&mut self) -> Result<Option<Part>, MultipartError> {
        match self.parts.recv().await {
            Some(part) => Ok(Some(part)),
            None => match self.errors.recv().await {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }
}

/// Multipart body decoder.
#[derive(Debug, Clone, Copy)]
pub struct MultipartDecoder {
    max_field_size: u64,
    max_file_size: u64,
}

impl Default for MultipartDecoder {
    fn default() -> Self {
        Self {
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl MultipartDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_field_size(mut self, limit: u64) -> Self {
        self.max_field_size = limit;
        self
    }

    pub fn with_max_file_size(mut self, limit: u64) -> Self {
        self.max_file_size = limit;
        self
    }

    pub fn max_field_size(&self) -> u64 {
        self.max_field_size
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Capture form values up to the first file and return that file as a
    /// stream, before its content has been read.
    pub async fn decode_single_file<S, O, E>(
        &self,
        content_type: &str,
        body: S,
    ) -> Result<SingleFileUpload, MultipartError>
    where
        S: Stream<Item = Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let mut multipart = open(content_type, body)?;
        let mut form = FormData::default();

        while let Some(field) = multipart.next_field().await? {
            match field.file_name().map(str::to_owned) {
                None => {
                    let part = read_field(field, self.max_field_size).await?;
                    form.push(&part)?;
                }
                Some(file_name) => {
                    let name = field.name().unwrap_or_default().to_owned();
                    debug!(name = %name, file_name = %file_name, "streaming file part");
                    let (file, _feeder) =
                        stream::spawn_feeder(field, name, file_name, self.max_file_size);
                    return Ok(SingleFileUpload {
                        form,
                        file: Some(file),
                    });
                }
            }
        }

        Ok(SingleFileUpload { form, file: None })
    }

    /// Decode every part on a background task, surfacing them in order.
    ///
    /// The producer waits for each file part to be drained or dropped before
    /// reading on, so an abandoned-but-held file stream stalls the decode.
    pub fn decode_stream<S, O, E>(
        &self,
        content_type: &str,
        query: Vec<(String, String)>,
        body: S,
    ) -> Result<MultipartStream, MultipartError>
    where
        S: Stream<Item = Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let multipart = open(content_type, body)?;
        let (parts_tx, parts) = mpsc::channel(1);
        let (errors_tx, errors) = mpsc::channel(1);

        tokio::spawn(produce(*self, multipart, parts_tx, errors_tx));

        Ok(MultipartStream {
            query,
            parts,
            errors,
        })
    }

    /// Read the whole body, buffering files up to `max_file_size`.
    pub async fn decode_buffered<S, O, E>(
        &self,
        content_type: &str,
        body: S,
    ) -> Result<MultipartForm, MultipartError>
    where
        S: Stream<Item = Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let mut multipart = open(content_type, body)?;
        let mut out = MultipartForm::default();

        while let Some(mut field) = multipart.next_field().await? {
            match field.file_name().map(str::to_owned) {
                None => {
                    let part = read_field(field, self.max_field_size).await?;
                    out.form.push(&part)?;
                }
                Some(file_name) => {
                    let name = field.name().unwrap_or_default().to_owned();
                    let content_type = field.content_type().map(|m| m.to_string());
                    let content = read_capped(&mut field, self.max_file_size)
                        .await?
                        .ok_or_else(|| MultipartError::FileTooLarge {
                            file_name: file_name.clone(),
                            limit: self.max_file_size,
                        })?;
                    out.files.push(BufferedFile {
                        name,
                        file_name,
                        content_type,
                        content,
                    });
                }
            }
        }

        Ok(out)
    }
}

fn open<S, O, E>(content_type: &str, body: S) -> Result<Multipart<'static>, MultipartError>
where
    S: Stream<Item = Result<O, E>> + Send + 'static,
    O: Into<Bytes> + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| MultipartError::Malformed(e.to_string()))?;
    Ok(Multipart::new(body, boundary))
}

/// Read a field into memory. `None` if it exceeds `limit`.
async fn read_capped(field: &mut Field<'static>, limit: u64) -> Result<Option<Bytes>, MultipartError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field.chunk().await? {
        if (buf.len() + chunk.len()) as u64 > limit {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Some(buf.freeze()))
}

async fn read_field(mut field: Field<'static>, limit: u64) -> Result<FieldPart, MultipartError> {
    let name = field.name().unwrap_or_default().to_owned();
    let content_type = field.content_type().map(|m| m.to_string());
    let value = read_capped(&mut field, limit)
        .await?
        .ok_or_else(|| MultipartError::PayloadTooLarge {
            field: name.clone(),
            limit,
        })?;
    Ok(FieldPart {
        name,
        content_type,
        value,
    })
}

async fn produce(
    decoder: MultipartDecoder,
    mut multipart: Multipart<'static>,
    parts: mpsc::Sender<Part>,
    errors: mpsc::Sender<MultipartError>,
) {
    if let Err(err) = pump(decoder, &mut multipart, &parts).await {
        debug!(error = %err, "multipart stream aborted");
        let _ = errors.send(err).await;
    }
}

async fn pump(
    decoder: MultipartDecoder,
    multipart: &mut Multipart<'static>,
    parts: &mpsc::Sender<Part>,
) -> Result<(), MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        let Some(file_name) = field.file_name().map(str::to_owned) else {
            let part = read_field(field, decoder.max_field_size).await?;
            if parts.send(Part::Field(part)).await.is_err() {
                return Ok(());
            }
            continue;
        };

        let name = field.name().unwrap_or_default().to_owned();
        let (file, feeder) = stream::spawn_feeder(field, name, file_name, decoder.max_file_size);
        if parts.send(Part::File(file)).await.is_err() {
            debug!("multipart consumer went away");
            return Ok(());
        }

        // the feeder owns the field; it has to finish before the next one
        feeder
            .await
            .map_err(|e| MultipartError::PartRead(e.to_string()))??;
    }
    Ok(())
}
