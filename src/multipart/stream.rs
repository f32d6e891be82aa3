//! Pipe-backed file streams.
//!
//! Each file part gets a feeder task that pumps the part's bytes into a
//! bounded channel of capacity one. The feeder can only run one chunk ahead
//! of the consumer, so a slow reader slows the network read instead of
//! growing a buffer.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use multer::Field;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::MultipartError;

/// Streamed content of one file part.
///
/// Must be drained or dropped: while it is held unread the decoder cannot
/// advance past this part. Dropping it (or calling [`FileStream::close`])
/// makes the feeder stop and release the part.
pub struct FileStream {
    name: String,
    file_name: String,
    content_type: Option<String>,
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl FileStream {
    /// Form field name of the part.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Next chunk of content, `None` at end of file.
    pub async fn chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.rx.recv().await.transpose()
    }

    /// Read the remaining content into memory.
    pub async fn read_to_end(&mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Count the remaining bytes without keeping them.
    pub async fn drain(&mut self) -> io::Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = self.chunk().await? {
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// Stop reading. The feeder observes the closed pipe on its next write.
    pub fn close(self) {
        drop(self);
    }

    /// Adapt into a [`tokio::io::AsyncRead`].
    pub fn into_async_read(self) -> StreamReader<Self, Bytes> {
        StreamReader::new(self)
    }
}

impl Stream for FileStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Start a feeder for a file part.
///
/// The returned handle resolves with the number of bytes handed to the
/// consumer, or the error that ended the part. The same error is also
/// delivered to the consumer through the stream.
pub(crate) fn spawn_feeder(
    field: Field<'static>,
    name: String,
    file_name: String,
    max_file_size: u64,
) -> (FileStream, JoinHandle<Result<u64, MultipartError>>) {
    let (tx, rx) = mpsc::channel(1);
    let stream = FileStream {
        name,
        file_name: file_name.clone(),
        content_type: field.content_type().map(|m| m.to_string()),
        rx,
    };
    let feeder = tokio::spawn(feed(field, tx, file_name, max_file_size));
    (stream, feeder)
}

async fn feed(
    mut field: Field<'static>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    file_name: String,
    limit: u64,
) -> Result<u64, MultipartError> {
    let mut written = 0u64;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(written),
            Err(err) => {
                let err = MultipartError::from(err);
                let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
                return Err(err);
            }
        };

        written += chunk.len() as u64;
        if written > limit {
            let err = MultipartError::FileTooLarge { file_name, limit };
            let _ = tx
                .send(Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string())))
                .await;
            return Err(err);
        }

        if tx.send(Ok(chunk)).await.is_err() {
            debug!(file_name = %file_name, written, "file stream closed by consumer");
            return Ok(written);
        }
    }
}
