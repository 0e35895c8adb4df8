//! Storage uploaders: the targets a finished backup archive is written to.
//!
//! Every backend implements the same streaming contract: data is taken from
//! an async reader and written to the storage without ever materializing the
//! whole archive in memory. Encryption, when configured, happens inside the
//! stream as well.

pub mod fs;
pub mod s3;
pub mod sftp;

pub use fs::FsUploader;
pub use s3::S3Uploader;
pub use sftp::SftpUploader;

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};
use crate::events::{Event, EventDispatcher};
use crate::source::ByteReader;

/// Minimum pause between two upload progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Supported storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Fs,
    Sftp,
    S3,
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fs" => Ok(StorageKind::Fs),
            "sftp" => Ok(StorageKind::Sftp),
            "s3" => Ok(StorageKind::S3),
            _ => Err(Error::Config(format!("Unknown storage type: {}", s))),
        }
    }
}

/// Progress snapshot of a running upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    /// Completed share in percent. Unset when the total size is unknown.
    pub progress: Option<f64>,
    pub current: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn new(current: u64, total: u64) -> Self {
        let progress = if total > 0 {
            Some((current as f64 / total as f64 * 100.0).min(100.0))
        } else {
            None
        };

        Self {
            progress,
            current,
            total,
        }
    }
}

/// A storage backend a finished backup archive can be written to.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Short backend tag used in events and logs.
    fn name(&self) -> &'static str;

    /// Attaches the dispatcher that receives upload events.
    fn set_dispatcher(&mut self, dispatcher: EventDispatcher);

    /// Streams `reader` into the storage under the given file name.
    /// `size` is the expected payload size in bytes, zero when unknown.
    async fn write(&self, reader: ByteReader, file_name: &str, size: u64) -> Result<()>;

    /// Uploads a local file to the storage.
    async fn upload(&self, file: &Path, file_name: &str) -> Result<()> {
        let fd = tokio::fs::File::open(file)
            .await
            .map_err(|err| Error::Storage(format!("Can't open backup file for reading: {}", err)))?;
        let size = fd.metadata().await?.len();

        self.write(Box::new(fd), file_name, size).await
    }
}

/// Byte counter shared by the progress adapters below.
struct Meter {
    dispatcher: Option<EventDispatcher>,
    current: u64,
    total: u64,
    last_emit: Instant,
    min_interval: Duration,
}

impl Meter {
    fn new(dispatcher: Option<EventDispatcher>, total: u64) -> Self {
        Self {
            dispatcher,
            current: 0,
            total,
            last_emit: Instant::now(),
            min_interval: PROGRESS_INTERVAL,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.current += bytes as u64;

        if self.last_emit.elapsed() < self.min_interval {
            return;
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(Event::UploadProgress(TransferProgress::new(
                self.current,
                self.total,
            )));
        }

        self.last_emit = Instant::now();
    }
}

/// Write half of the progress metering: counts bytes written to `inner`.
pub(crate) struct ProgressWriter<W> {
    inner: W,
    meter: Meter,
}

impl<W> ProgressWriter<W> {
    pub fn new(inner: W, dispatcher: Option<EventDispatcher>, total: u64) -> Self {
        Self {
            inner,
            meter: Meter::new(dispatcher, total),
        }
    }

    #[cfg(test)]
    fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.meter.min_interval = min_interval;
        self
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let written = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.meter.record(written);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read half of the progress metering: counts bytes read from `inner`.
pub(crate) struct ProgressReader<R> {
    inner: R,
    meter: Meter,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, dispatcher: Option<EventDispatcher>, total: u64) -> Self {
        Self {
            inner,
            meter: Meter::new(dispatcher, total),
        }
    }

    #[cfg(test)]
    fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.meter.min_interval = min_interval;
        self
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;

        let read = buf.filled().len() - before;
        if read > 0 {
            self.meter.record(read);
        }

        Poll::Ready(Ok(()))
    }
}

/// Human readable byte size, e.g. "1.5 MB".
pub fn pretty_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = size as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", size)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Joins a storage base path with a file name, tolerating empty bases.
pub(crate) fn join_remote(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');

    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}
