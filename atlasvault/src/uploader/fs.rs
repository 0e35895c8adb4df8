//! Local filesystem uploader.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::events::{Event, EventDispatcher};
use crate::secret::Secret;
use crate::source::ByteReader;
use crate::uploader::{ProgressWriter, Uploader};

/// Configuration for the filesystem uploader.
pub struct FsConfig {
    /// Directory the backups are written into.
    pub path: PathBuf,
    /// Permissions of uploaded files.
    pub mode: u32,
    /// Optional encryption applied to the stored data.
    pub secret: Option<Secret>,
}

impl FsConfig {
    fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Config("Storage path must be set".into()));
        }

        if self.mode == 0 {
            return Err(Error::Config("Invalid file mode 0".into()));
        }

        Ok(())
    }
}

pub struct FsUploader {
    config: FsConfig,
    dispatcher: Option<EventDispatcher>,
}

impl FsUploader {
    pub fn new(config: FsConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            dispatcher: None,
        })
    }
}

#[async_trait]
impl Uploader for FsUploader {
    fn name(&self) -> &'static str {
        "FS"
    }

    fn set_dispatcher(&mut self, dispatcher: EventDispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    async fn write(&self, mut reader: ByteReader, file_name: &str, size: u64) -> Result<()> {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_and_wait(Event::UploadStarted(self.name()));
        }

        tracing::info!(path = %self.config.path.display(), "Copying backup file to local storage");

        if !self.config.path.exists() {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true);

            #[cfg(unix)]
            builder.mode(0o750);

            builder.create(&self.config.path).await.map_err(|err| {
                Error::Storage(format!("Can't create directory for backup: {}", err))
            })?;
        }

        let output = self.config.path.join(file_name);
        let file = open_output(&output, self.config.mode).await?;

        let sink: Box<dyn AsyncWrite + Send + Unpin> = match &self.config.secret {
            Some(secret) => Box::new(secret.writer(file)),
            None => Box::new(file),
        };

        let mut writer = ProgressWriter::new(sink, self.dispatcher.clone(), size);

        tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|err| Error::Storage(format!("File writing error: {}", err)))?;
        writer
            .shutdown()
            .await
            .map_err(|err| Error::Storage(format!("File writing error: {}", err)))?;

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_and_wait(Event::UploadDone(self.name()));
        }

        tracing::info!(path = %self.config.path.display(), "Backup successfully copied to local storage");

        Ok(())
    }
}

async fn open_output(path: &Path, mode: u32) -> Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);

    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    options
        .open(path)
        .await
        .map_err(|err| Error::Storage(format!("Can't open file for saving data: {}", err)))
}
