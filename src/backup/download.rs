// pgbackup/src/backup/download.rs
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs::File;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use super::archive::ArchiveArtifact;
use super::cleanup::TempFiles;
use crate::errors::ArchiveError;

const CHUNK_SIZE: usize = 64 * 1024;

/// An archive ready to be streamed to a caller.
#[derive(Debug)]
pub struct ArchiveDownload {
    pub file_name: String,
    pub content_type: &'static str,
    pub content_length: u64,
    pub stream: ArchiveStream,
}

impl ArchiveDownload {
    /// Opens the archive before any response framing is decided, so a failure
    /// here can still become a 500. The archive is discarded once `limit`
    /// passes, whether or not the caller is still reading.
    pub async fn open(
        artifact: &ArchiveArtifact,
        cleanup: TempFiles,
        limit: Duration,
    ) -> Result<Self, ArchiveError> {
        let file = File::open(&artifact.path).await.map_err(|e| {
            ArchiveError::io(format!("Failed to open archive {}", artifact.path.display()), e)
        })?;
        Ok(ArchiveDownload {
            file_name: artifact.file_name.clone(),
            content_type: artifact.format.content_type(),
            content_length: artifact.size,
            stream: ArchiveStream::new(file, artifact.file_name.clone(), artifact.size, cleanup, limit),
        })
    }

    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.file_name)
    }
}

impl IntoResponse for ArchiveDownload {
    fn into_response(self) -> Response {
        let disposition = self.content_disposition();
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, self.content_type)
            .header(header::CONTENT_DISPOSITION, disposition)
            .header(header::CONTENT_LENGTH, self.content_length)
            .body(Body::from_stream(self.stream));

        match response {
            Ok(response) => response,
            Err(e) => {
                // The stream (and its temp files) was dropped with the failed builder.
                error!(error = %e, "❌ Failed to build download response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Chunked reader over the archive file. Owns the invocation's temp files and
/// removes them once the stream finishes, fails, expires, or is dropped
/// mid-transfer.
pub struct ArchiveStream {
    inner: ReaderStream<File>,
    file_name: String,
    expected: u64,
    sent: u64,
    done: bool,
    limit: Duration,
    expired: Arc<AtomicBool>,
    cleanup: Arc<Mutex<TempFiles>>,
    watchdog: JoinHandle<()>,
}

impl ArchiveStream {
    fn new(file: File, file_name: String, expected: u64, cleanup: TempFiles, limit: Duration) -> Self {
        let cleanup = Arc::new(Mutex::new(cleanup));
        let expired = Arc::new(AtomicBool::new(false));
        // A stalled client stops polling the body, so the deadline needs its own task.
        let watchdog = tokio::spawn(expire_after(
            limit,
            file_name.clone(),
            expired.clone(),
            cleanup.clone(),
        ));
        ArchiveStream {
            inner: ReaderStream::with_capacity(file, CHUNK_SIZE),
            file_name,
            expected,
            sent: 0,
            done: false,
            limit,
            expired,
            cleanup,
            watchdog,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    fn finish(&mut self) {
        self.done = true;
        self.watchdog.abort();
        remove_files(&self.cleanup);
    }
}

async fn expire_after(
    limit: Duration,
    file_name: String,
    expired: Arc<AtomicBool>,
    cleanup: Arc<Mutex<TempFiles>>,
) {
    tokio::time::sleep(limit).await;
    expired.store(true, Ordering::SeqCst);
    let removed = remove_files(&cleanup);
    warn!(
        file = %file_name,
        limit = ?limit,
        removed_files = removed,
        "⏰ Download not completed in time, archive discarded"
    );
}

fn remove_files(cleanup: &Mutex<TempFiles>) -> usize {
    match cleanup.lock() {
        Ok(mut files) => files.remove_all(),
        Err(poisoned) => poisoned.into_inner().remove_all(),
    }
}

impl std::fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("file_name", &self.file_name)
            .field("expected", &self.expected)
            .field("sent", &self.sent)
            .field("done", &self.done)
            .finish()
    }
}

impl Stream for ArchiveStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if this.expired.load(Ordering::SeqCst) {
            error!(
                file = %this.file_name,
                sent = this.sent,
                expected = this.expected,
                "❌ Archive stream expired mid-transfer"
            );
            this.finish();
            let message = format!("download not completed within {:?}", this.limit);
            return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::TimedOut, message))));
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Headers are already out; all that is left is to report it.
                error!(
                    file = %this.file_name,
                    sent = this.sent,
                    expected = this.expected,
                    error = %e,
                    "❌ Archive stream failed mid-transfer"
                );
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                info!(file = %this.file_name, bytes = this.sent, "✅ Archive streamed to caller");
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                file = %self.file_name,
                sent = self.sent,
                expected = self.expected,
                "⚠️ Download cancelled before completion"
            );
        }
        self.watchdog.abort();
        remove_files(&self.cleanup);
    }
}
