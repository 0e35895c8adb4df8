//! S3 uploader.
//!
//! Streams the archive into an S3-compatible object store using multipart
//! uploads. Unlike the writer-based backends, encryption happens on the
//! read side here: the object store client pulls from a reader chain.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::events::{Event, EventDispatcher};
use crate::secret::Secret;
use crate::source::ByteReader;
use crate::uploader::{join_remote, ProgressReader, Uploader};

/// Configuration for the S3 uploader.
pub struct S3Config {
    /// Endpoint host without scheme, e.g. "storage.example.com".
    pub host: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Key prefix the backups are written under.
    pub path: String,
    /// Multipart part size in bytes.
    pub part_size: usize,
    /// Optional encryption applied to the stored data.
    pub secret: Option<Secret>,
}

impl S3Config {
    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("S3 host must be set".into()));
        }

        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            return Err(Error::Config("S3 host must not contain scheme".into()));
        }

        if self.region.is_empty() {
            return Err(Error::Config("S3 region must be set".into()));
        }

        if self.access_key.is_empty() {
            return Err(Error::Config("S3 access key must be set".into()));
        }

        if self.secret_key.is_empty() {
            return Err(Error::Config("S3 secret key must be set".into()));
        }

        if self.bucket.is_empty() {
            return Err(Error::Config("S3 bucket must be set".into()));
        }

        if self.path.is_empty() {
            return Err(Error::Config("S3 path must be set".into()));
        }

        if self.part_size == 0 {
            return Err(Error::Config("Invalid multipart part size 0".into()));
        }

        Ok(())
    }
}

pub struct S3Uploader {
    config: S3Config,
    store: Arc<dyn ObjectStore>,
    dispatcher: Option<EventDispatcher>,
}

impl fmt::Debug for S3Uploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Uploader").finish_non_exhaustive()
    }
}

impl S3Uploader {
    pub fn new(config: S3Config) -> Result<Self> {
        config.validate()?;

        let store = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_endpoint(format!("https://{}", config.host))
            .with_access_key_id(&config.access_key)
            .with_secret_access_key(&config.secret_key)
            .build()
            .map_err(|err| Error::Storage(format!("Can't create S3 client: {}", err)))?;

        Ok(Self {
            config,
            store: Arc::new(store),
            dispatcher: None,
        })
    }

    #[cfg(test)]
    fn with_store(config: S3Config, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            dispatcher: None,
        }
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    fn name(&self) -> &'static str {
        "S3"
    }

    fn set_dispatcher(&mut self, dispatcher: EventDispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    async fn write(&self, reader: ByteReader, file_name: &str, size: u64) -> Result<()> {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_and_wait(Event::UploadStarted(self.name()));
        }

        tracing::info!(
            bucket = %self.config.bucket,
            path = %self.config.path,
            host = %self.config.host,
            region = %self.config.region,
            "Uploading backup file to S3 storage"
        );

        let output = join_remote(&self.config.path, file_name);

        let source: Box<dyn AsyncRead + Send + Unpin> = match &self.config.secret {
            Some(secret) => Box::new(secret.encrypt_reader(reader)),
            None => reader,
        };

        // Progress is sampled behind the encryption step, so the byte
        // count can overshoot the plaintext size estimate
        let mut source = ProgressReader::new(source, self.dispatcher.clone(), size);

        let mut writer = BufWriter::with_capacity(
            self.store.clone(),
            ObjectPath::from(output),
            self.config.part_size,
        );

        tokio::io::copy(&mut source, &mut writer)
            .await
            .map_err(|err| Error::Storage(format!("Can't upload file to S3: {}", err)))?;
        writer
            .shutdown()
            .await
            .map_err(|err| Error::Storage(format!("Can't upload file to S3: {}", err)))?;

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_and_wait(Event::UploadDone(self.name()));
        }

        tracing::info!("File successfully uploaded to S3");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use object_store::memory::InMemory;
    use tokio::io::AsyncReadExt;

    fn reader_of(data: &[u8]) -> ByteReader {
        Box::new(Cursor::new(data.to_vec()))
    }

    fn test_config() -> S3Config {
        S3Config {
            host: "storage.example.com".to_string(),
            region: "us-east-1".to_string(),
            access_key: "key-id".to_string(),
            secret_key: "key-data".to_string(),
            bucket: "backups".to_string(),
            path: "atlas".to_string(),
            part_size: 1024,
            secret: None,
        }
    }

    #[test]
    fn test_host_scheme_is_rejected() {
        let mut config = test_config();
        config.host = "https://storage.example.com".to_string();

        let err = S3Uploader::new(config).unwrap_err().to_string();
        assert!(err.contains("scheme"), "unexpected error: {}", err);
    }

    #[test]
    fn test_required_fields() {
        for field in ["host", "region", "access_key", "secret_key", "bucket", "path"] {
            let mut config = test_config();

            match field {
                "host" => config.host = String::new(),
                "region" => config.region = String::new(),
                "access_key" => config.access_key = String::new(),
                "secret_key" => config.secret_key = String::new(),
                "bucket" => config.bucket = String::new(),
                _ => config.path = String::new(),
            }

            assert!(S3Uploader::new(config).is_err(), "{} accepted empty", field);
        }
    }

    #[test]
    fn test_part_size_must_be_non_zero() {
        let mut config = test_config();
        config.part_size = 0;
        assert!(S3Uploader::new(config).is_err());
    }

    #[tokio::test]
    async fn test_write_stores_object() {
        let store = Arc::new(InMemory::new());
        let uploader = S3Uploader::with_store(test_config(), store.clone());

        uploader
            .write(reader_of(b"archive data"), "backup.zip", 12)
            .await
            .unwrap();

        let stored = store
            .get(&ObjectPath::from("atlas/backup.zip"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), b"archive data");
    }

    #[tokio::test]
    async fn test_write_spans_multiple_parts() {
        let store = Arc::new(InMemory::new());
        let uploader = S3Uploader::with_store(test_config(), store.clone());

        // Larger than the 1 KiB part size configured above
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        uploader
            .write(reader_of(&payload), "backup.zip", payload.len() as u64)
            .await
            .unwrap();

        let stored = store
            .get(&ObjectPath::from("atlas/backup.zip"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_write_encrypts_when_secret_set() {
        let store = Arc::new(InMemory::new());

        let mut config = test_config();
        config.secret = Some(Secret::new("hunter2"));

        let uploader = S3Uploader::with_store(config, store.clone());
        let payload = b"super important archive".to_vec();

        uploader
            .write(reader_of(&payload), "backup.zip", payload.len() as u64)
            .await
            .unwrap();

        let stored = store
            .get(&ObjectPath::from("atlas/backup.zip"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_ne!(stored.as_ref(), payload.as_slice());

        let mut decrypted = Vec::new();
        Secret::new("hunter2")
            .decrypt_reader(Cursor::new(stored.to_vec()))
            .read_to_end(&mut decrypted)
            .await
            .unwrap();
        assert_eq!(decrypted, payload);
    }
}
