//! Configuration loading and validation.
//!
//! Configuration is a TOML file selected on the command line. `validate()`
//! runs before anything touches the network or the filesystem, so a bad
//! config fails the process at startup instead of mid-backup.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::source::Target;
use crate::uploader::StorageKind;

/// Default output file template for Jira backups
const DEFAULT_JIRA_OUTPUT: &str = "jira-backup-%Y-%m-%d";

/// Default output file template for Confluence backups
const DEFAULT_CONFLUENCE_OUTPUT: &str = "confluence-backup-%Y-%m-%d";

/// Encryption passphrase length bounds
const MIN_ENCRYPTION_KEY_LEN: usize = 16;
const MAX_ENCRYPTION_KEY_LEN: usize = 96;

/// S3 part size bounds in MiB
const MIN_PART_SIZE_MB: u64 = 1;
const MAX_PART_SIZE_MB: u64 = 100;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_jira_section")]
    pub jira: TargetConfig,
    #[serde(default = "default_confluence_section")]
    pub confluence: TargetConfig,
    #[serde(default)]
    pub temp: TempConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access: AccessConfig::default(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            jira: default_jira_section(),
            confluence: default_confluence_section(),
            temp: TempConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Cloud account credentials shared by both backup targets.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AccessConfig {
    /// Account name, i.e. the subdomain of the cloud instance
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub api_key: String,
    /// Overrides the account-derived API endpoint (proxies, test rigs)
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_ip")]
    pub ip: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Shared secret required in the `token` query parameter when set
    #[serde(default)]
    pub access_token: Option<String>,
    /// Health-pulse webhook notified after each service-mode request
    #[serde(default)]
    pub pulse_url: Option<String>,
}

fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_server_ip(),
            port: default_server_port(),
            access_token: None,
            pulse_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Storage backend: "fs", "sftp" or "s3"
    #[serde(rename = "type", default = "default_storage_type")]
    pub kind: String,
    /// Optional passphrase; when set, artifacts are encrypted in transit
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub fs: FsStorageConfig,
    #[serde(default)]
    pub sftp: SftpStorageConfig,
    #[serde(default)]
    pub s3: S3StorageConfig,
}

fn default_storage_type() -> String {
    "fs".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_type(),
            encryption_key: None,
            fs: FsStorageConfig::default(),
            sftp: SftpStorageConfig::default(),
            s3: S3StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsStorageConfig {
    #[serde(default)]
    pub path: String,
    /// Octal mode applied to stored files
    #[serde(default = "default_file_mode")]
    pub mode: String,
}

fn default_file_mode() -> String {
    "0600".to_string()
}

impl Default for FsStorageConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            mode: default_file_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SftpStorageConfig {
    /// Remote host with port, e.g. "backup.example.com:22"
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    /// Private key: a filesystem path or a base64-encoded blob
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub path: String,
    /// Octal mode applied to stored files
    #[serde(default = "default_file_mode")]
    pub mode: String,
}

impl Default for SftpStorageConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            key: String::new(),
            path: String::new(),
            mode: default_file_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3StorageConfig {
    /// Bare hostname of the S3-compatible endpoint, without a scheme
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub bucket: String,
    /// Key prefix inside the bucket
    #[serde(default)]
    pub path: String,
    /// Multipart upload part size in MiB
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: u64,
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_part_size_mb() -> u64 {
    5
}

impl Default for S3StorageConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            region: default_s3_region(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: String::new(),
            path: String::new(),
            part_size_mb: default_part_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Output file name template (chrono strftime), ".zip" is appended
    #[serde(default)]
    pub output_file: String,
    #[serde(default = "default_true")]
    pub include_attachments: bool,
    /// Export in the cloud-compatible format instead of the server one
    #[serde(default = "default_true")]
    pub cloud_format: bool,
}

fn default_true() -> bool {
    true
}

fn default_jira_section() -> TargetConfig {
    TargetConfig {
        output_file: DEFAULT_JIRA_OUTPUT.to_string(),
        include_attachments: true,
        cloud_format: true,
    }
}

fn default_confluence_section() -> TargetConfig {
    TargetConfig {
        output_file: DEFAULT_CONFLUENCE_OUTPUT.to_string(),
        include_attachments: true,
        cloud_format: true,
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TempConfig {
    /// Directory hosting per-run scratch directories
    #[serde(default = "default_temp_dir")]
    pub dir: PathBuf,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for TempConfig {
    fn default() -> Self {
        Self {
            dir: default_temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log output format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Can't read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Can't parse {}: {}", path.display(), e)))
    }

    /// Validates everything needed before a run may start.
    pub fn validate(&self) -> Result<()> {
        if self.access.account.is_empty() {
            return Err(Error::Config("access.account must be set".into()));
        }
        if self.access.email.is_empty() {
            return Err(Error::Config("access.email must be set".into()));
        }
        if !self.access.email.contains('@') {
            return Err(Error::Config(format!(
                "access.email is not a valid email address: {}",
                self.access.email
            )));
        }
        if self.access.api_key.is_empty() {
            return Err(Error::Config("access.api_key must be set".into()));
        }

        match self.storage.kind.parse::<StorageKind>()? {
            StorageKind::Fs => {
                if self.storage.fs.path.is_empty() {
                    return Err(Error::Config("storage.fs.path must be set".into()));
                }
                if parse_mode(&self.storage.fs.mode)? == 0 {
                    return Err(Error::Config("storage.fs.mode must not be zero".into()));
                }
            }
            StorageKind::Sftp => {
                for (value, name) in [
                    (&self.storage.sftp.host, "storage.sftp.host"),
                    (&self.storage.sftp.user, "storage.sftp.user"),
                    (&self.storage.sftp.key, "storage.sftp.key"),
                    (&self.storage.sftp.path, "storage.sftp.path"),
                ] {
                    if value.is_empty() {
                        return Err(Error::Config(format!("{} must be set", name)));
                    }
                }
                if parse_mode(&self.storage.sftp.mode)? == 0 {
                    return Err(Error::Config("storage.sftp.mode must not be zero".into()));
                }
            }
            StorageKind::S3 => {
                for (value, name) in [
                    (&self.storage.s3.host, "storage.s3.host"),
                    (&self.storage.s3.region, "storage.s3.region"),
                    (&self.storage.s3.access_key, "storage.s3.access_key"),
                    (&self.storage.s3.secret_key, "storage.s3.secret_key"),
                    (&self.storage.s3.bucket, "storage.s3.bucket"),
                    (&self.storage.s3.path, "storage.s3.path"),
                ] {
                    if value.is_empty() {
                        return Err(Error::Config(format!("{} must be set", name)));
                    }
                }
                let part_size = self.storage.s3.part_size_mb;
                if !(MIN_PART_SIZE_MB..=MAX_PART_SIZE_MB).contains(&part_size) {
                    return Err(Error::Config(format!(
                        "storage.s3.part_size_mb must be between {} and {}, got {}",
                        MIN_PART_SIZE_MB, MAX_PART_SIZE_MB, part_size
                    )));
                }
            }
        }

        if let Some(key) = &self.storage.encryption_key {
            if !(MIN_ENCRYPTION_KEY_LEN..=MAX_ENCRYPTION_KEY_LEN).contains(&key.len()) {
                return Err(Error::Config(format!(
                    "storage.encryption_key length must be between {} and {} characters",
                    MIN_ENCRYPTION_KEY_LEN, MAX_ENCRYPTION_KEY_LEN
                )));
            }
        }

        probe_template(self.output_template(Target::Jira), "jira.output_file")?;
        probe_template(
            self.output_template(Target::Confluence),
            "confluence.output_file",
        )?;

        Ok(())
    }

    pub fn target_section(&self, target: Target) -> &TargetConfig {
        match target {
            Target::Jira => &self.jira,
            Target::Confluence => &self.confluence,
        }
    }

    fn output_template(&self, target: Target) -> &str {
        let section = self.target_section(target);
        if section.output_file.is_empty() {
            match target {
                Target::Jira => DEFAULT_JIRA_OUTPUT,
                Target::Confluence => DEFAULT_CONFLUENCE_OUTPUT,
            }
        } else {
            &section.output_file
        }
    }

    /// Renders the dated output file name for the given target.
    pub fn output_file_name(&self, target: Target) -> String {
        let mut name = String::new();
        let now = chrono::Local::now();
        // validate() probed the template, rendering cannot fail here
        let _ = write!(&mut name, "{}", now.format(self.output_template(target)));
        name.push_str(".zip");
        name
    }

    /// Listen address for service mode. The PORT environment variable wins
    /// over the configured port (serverless hosts inject it).
    pub fn bind_addr(&self) -> String {
        match std::env::var("PORT") {
            Ok(port) if !port.is_empty() => format!("{}:{}", self.server.ip, port),
            _ => format!("{}:{}", self.server.ip, self.server.port),
        }
    }
}

/// Parses an octal mode string like "0600" or "0o750".
pub(crate) fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .map_err(|_| Error::Config(format!("Invalid file mode: {}", mode)))
}

fn probe_template(template: &str, name: &str) -> Result<()> {
    let mut out = String::new();
    let now = chrono::Local::now();
    if write!(&mut out, "{}", now.format(template)).is_err() {
        return Err(Error::Config(format!(
            "{} is not a valid date template: {}",
            name, template
        )));
    }
    Ok(())
}
