//! One-shot backup runs.
//!
//! Wires a backup source to an uploader based on the configuration and
//! drives the full cycle: create the export task, wait for it, download
//! the archive into a scratch directory and hand it to the storage.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::{parse_mode, Config};
use crate::error::{Error, Result};
use crate::events::EventDispatcher;
use crate::secret::Secret;
use crate::source::{BackupConfig, BackupSource, ConfluenceSource, JiraSource, Target};
use crate::uploader::fs::FsConfig;
use crate::uploader::s3::S3Config;
use crate::uploader::sftp::SftpConfig;
use crate::uploader::{join_remote, FsUploader, S3Uploader, SftpUploader, StorageKind, Uploader};

/// Options of a single backup run.
#[derive(Default)]
pub struct RunOptions {
    /// Start a fresh export even when a pending one could be reused.
    pub force: bool,
    /// Receives lifecycle events of the run.
    pub dispatcher: Option<EventDispatcher>,
}

/// Builds the backup source for the given target from the configuration.
pub fn build_source(config: &Config, target: Target) -> Result<Box<dyn BackupSource>> {
    let section = config.target_section(target);
    let backup_config = BackupConfig {
        account: config.access.account.clone(),
        email: config.access.email.clone(),
        api_key: config.access.api_key.clone(),
        with_attachments: section.include_attachments,
        for_cloud: section.cloud_format,
    };

    match target {
        Target::Jira => {
            let mut source = JiraSource::new(backup_config)?;
            if let Some(base_url) = &config.access.base_url {
                source = source.with_base_url(base_url);
            }
            Ok(Box::new(source))
        }
        Target::Confluence => {
            let mut source = ConfluenceSource::new(backup_config)?;
            if let Some(base_url) = &config.access.base_url {
                source = source.with_base_url(base_url);
            }
            Ok(Box::new(source))
        }
    }
}

/// Builds the uploader for the configured storage backend. The per-target
/// subdirectory is appended to the configured path, so Jira and Confluence
/// archives never mix.
pub fn build_uploader(config: &Config, target: Target) -> Result<Box<dyn Uploader>> {
    let secret = config.storage.encryption_key.as_deref().map(Secret::new);

    match config.storage.kind.parse::<StorageKind>()? {
        StorageKind::Fs => {
            let fs = &config.storage.fs;
            let uploader = FsUploader::new(FsConfig {
                path: Path::new(&fs.path).join(target.as_str()),
                mode: parse_mode(&fs.mode)?,
                secret,
            })?;
            Ok(Box::new(uploader))
        }
        StorageKind::Sftp => {
            let sftp = &config.storage.sftp;
            let uploader = SftpUploader::new(SftpConfig {
                host: sftp.host.clone(),
                user: sftp.user.clone(),
                key: load_private_key(&sftp.key)?,
                path: join_remote(&sftp.path, target.as_str()),
                mode: parse_mode(&sftp.mode)?,
                secret,
            })?;
            Ok(Box::new(uploader))
        }
        StorageKind::S3 => {
            let s3 = &config.storage.s3;
            let uploader = S3Uploader::new(S3Config {
                host: s3.host.clone(),
                region: s3.region.clone(),
                access_key: s3.access_key.clone(),
                secret_key: s3.secret_key.clone(),
                bucket: s3.bucket.clone(),
                path: join_remote(&s3.path, target.as_str()),
                part_size: s3.part_size_mb as usize * 1024 * 1024,
                secret,
            })?;
            Ok(Box::new(uploader))
        }
    }
}

/// Loads the SFTP private key: the configured value is either a path to a
/// key file or the base64-encoded key itself.
fn load_private_key(value: &str) -> Result<String> {
    if Path::new(value).exists() {
        return std::fs::read_to_string(value)
            .map_err(|err| Error::Config(format!("Can't read SFTP key file: {}", err)));
    }

    let raw = BASE64
        .decode(value)
        .map_err(|err| Error::Config(format!("Can't decode SFTP key: {}", err)))?;

    String::from_utf8(raw).map_err(|_| Error::Config("SFTP key is not valid UTF-8".into()))
}

/// Runs a full backup for the given target.
pub async fn run_backup(config: &Config, target: Target, options: RunOptions) -> Result<()> {
    let source = build_source(config, target)?;
    let uploader = build_uploader(config, target)?;

    run_backup_with(source, uploader, config, target, options).await
}

/// Same as [`run_backup`] with explicit source and uploader instances.
pub async fn run_backup_with(
    mut source: Box<dyn BackupSource>,
    mut uploader: Box<dyn Uploader>,
    config: &Config,
    target: Target,
    options: RunOptions,
) -> Result<()> {
    if let Some(dispatcher) = &options.dispatcher {
        source.set_dispatcher(dispatcher.clone());
        uploader.set_dispatcher(dispatcher.clone());
    }

    let output_name = config.output_file_name(target);

    // The scratch directory lives until the upload is done, then the
    // downloaded archive goes away with it.
    let scratch = tempfile::Builder::new()
        .prefix("atlasvault-")
        .tempdir_in(&config.temp.dir)
        .map_err(|err| Error::Storage(format!("Can't create temporary directory: {}", err)))?;
    let local_file = scratch.path().join(&output_name);

    let task = source.start(options.force).await?;
    let backup_file = source.progress(&task).await?;
    source.download(&backup_file, &local_file).await?;

    tracing::info!("Backup process successfully finished");

    uploader.upload(&local_file, &output_name).await?;

    tracing::info!(file = %output_name, "Backup uploaded to storage");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_config() -> Config {
        let mut config = Config::default();
        config.access.account = "acme".to_string();
        config.access.email = "admin@acme.com".to_string();
        config.access.api_key = "token".to_string();
        config.storage.fs.path = "/backups".to_string();
        config
    }

    #[test]
    fn load_private_key_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, "KEY DATA\n").unwrap();

        let key = load_private_key(path.to_str().unwrap()).unwrap();
        assert_eq!(key, "KEY DATA\n");
    }

    #[test]
    fn load_private_key_decodes_base64() {
        let encoded = BASE64.encode("KEY DATA\n");
        assert_eq!(load_private_key(&encoded).unwrap(), "KEY DATA\n");

        assert!(load_private_key("!! not base64 !!").is_err());
    }

    #[test]
    fn build_source_covers_both_targets() {
        let config = fs_config();

        build_source(&config, Target::Jira).unwrap();
        build_source(&config, Target::Confluence).unwrap();

        let mut broken = fs_config();
        broken.access.account = String::new();
        assert!(build_source(&broken, Target::Jira).is_err());
    }

    #[test]
    fn build_uploader_selects_backend() {
        let config = fs_config();
        let uploader = build_uploader(&config, Target::Jira).unwrap();
        assert_eq!(uploader.name(), "FS");

        let mut config = fs_config();
        config.storage.kind = "s3".to_string();
        config.storage.s3.host = "storage.example.com".to_string();
        config.storage.s3.access_key = "AK".to_string();
        config.storage.s3.secret_key = "SK".to_string();
        config.storage.s3.bucket = "backups".to_string();
        config.storage.s3.path = "atlassian".to_string();
        let uploader = build_uploader(&config, Target::Jira).unwrap();
        assert_eq!(uploader.name(), "S3");

        let mut config = fs_config();
        config.storage.kind = "carrier-pigeon".to_string();
        assert!(build_uploader(&config, Target::Jira).is_err());
    }

    #[test]
    fn build_uploader_accepts_encryption_key() {
        let mut config = fs_config();
        config.storage.encryption_key = Some("a passphrase long enough".to_string());
        build_uploader(&config, Target::Confluence).unwrap();
    }

    #[test]
    fn build_uploader_rejects_missing_sftp_key() {
        let mut config = fs_config();
        config.storage.kind = "sftp".to_string();
        config.storage.sftp.host = "backup.example.com:22".to_string();
        config.storage.sftp.user = "backup".to_string();
        config.storage.sftp.key = "!! neither a file nor base64 !!".to_string();
        config.storage.sftp.path = "/srv/backups".to_string();

        assert!(build_uploader(&config, Target::Jira).is_err());
    }
}
