//! Backup sources: the remote export APIs of the supported cloud services.
//!
//! Both services share the same job lifecycle: an export task is started (or
//! a pending one is reused), its progress is polled on a fixed interval, and
//! once the service reports a finished backup the resulting archive can be
//! downloaded as a byte stream. The differences in endpoints, payloads and
//! completion criteria live in the per-service modules.

pub mod confluence;
pub mod jira;

pub use confluence::ConfluenceSource;
pub use jira::JiraSource;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::events::EventDispatcher;

/// Byte stream handed from a source download to an uploader.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Services a backup can be taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Jira,
    Confluence,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Jira => "jira",
            Target::Confluence => "confluence",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jira" => Ok(Target::Jira),
            "confluence" => Ok(Target::Confluence),
            _ => Err(Error::Config(format!("Unknown backup target: {}", s))),
        }
    }
}

/// Credentials and export options for one backup run.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Account name, i.e. the subdomain of the cloud instance.
    pub account: String,
    /// Email of the user the API token belongs to.
    pub email: String,
    /// API token used for basic auth.
    pub api_key: String,
    /// Include attachments in the export.
    pub with_attachments: bool,
    /// Produce the archive in cloud import format.
    pub for_cloud: bool,
}

impl BackupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.account.is_empty() {
            return Err(Error::Config("Account name must be set".into()));
        }

        if self.email.is_empty() {
            return Err(Error::Config("User email must be set".into()));
        }

        if self.api_key.is_empty() {
            return Err(Error::Config("API key must be set".into()));
        }

        Ok(())
    }

    /// Base URL of the cloud instance this config points at.
    pub fn account_url(&self) -> String {
        format!("https://{}.atlassian.net", self.account)
    }
}

/// One reading of a running export task.
#[derive(Debug, Clone, Default)]
pub struct ProgressInfo {
    pub message: String,
    pub progress: i64,
}

/// Timing knobs for the progress poll loop.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Pause between progress checks.
    pub interval: Duration,
    /// Consecutive failed checks tolerated before giving up.
    pub max_errors: u32,
    /// Hard ceiling on the total poll time.
    pub max_duration: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_errors: 10,
            max_duration: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Filters poll readings so only values above the last reported one
/// count as new. The services occasionally report a lower percentage
/// mid-run; those readings are delivered but not worth logging again.
#[derive(Debug, Default)]
pub(crate) struct ProgressGate {
    last: Option<i64>,
}

impl ProgressGate {
    pub fn observe(&mut self, progress: i64) -> bool {
        match self.last {
            Some(last) if progress <= last => false,
            _ => {
                self.last = Some(progress);
                true
            }
        }
    }
}

/// A remote service able to produce and hand over full-instance backups.
#[async_trait]
pub trait BackupSource: Send + Sync {
    /// Attaches the dispatcher that receives lifecycle events.
    fn set_dispatcher(&mut self, dispatcher: EventDispatcher);

    /// Ensures an export task is running, reusing a pending one unless
    /// `force` is set. Returns the task handle, which may be empty for
    /// services tracking a single implicit task per account.
    async fn start(&self, force: bool) -> Result<String>;

    /// Polls the export task until the service reports a finished backup.
    /// Returns the name of the backup file ready for download.
    async fn progress(&self, task: &str) -> Result<String>;

    /// Downloads a finished backup file to a local path.
    async fn download(&self, backup_file: &str, output: &Path) -> Result<()>;

    /// Opens a streaming reader over a finished backup file.
    async fn reader(&self, backup_file: &str) -> Result<ByteReader>;

    /// Name of the latest finished backup file, if any.
    async fn backup_file(&self) -> Result<String>;

    /// Whether a finished backup is currently available for download.
    async fn is_backup_created(&self) -> Result<bool>;
}

/// Export options payload shared by both services.
#[derive(Debug, Serialize)]
pub(crate) struct ExportPrefs {
    #[serde(rename = "cbAttachments")]
    pub attachments: bool,
    #[serde(rename = "exportToCloud")]
    pub export_to_cloud: bool,
}

/// Timeout for plain API calls. Download requests are exempt since a
/// backup archive can take much longer than any sane request timeout.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("atlasvault/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    Ok(client)
}

pub(crate) fn ensure_ok(response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::RemoteStatus(status.as_u16()));
    }

    Ok(())
}

/// Decodes a JSON response body, reporting malformed payloads as decode
/// errors rather than transport errors.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T> {
    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

/// Wraps a response body into an async reader without buffering it.
pub(crate) fn into_reader(response: reqwest::Response) -> ByteReader {
    let stream = response.bytes_stream().map_err(std::io::Error::other);
    Box::new(StreamReader::new(Box::pin(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_str() {
        assert_eq!("jira".parse::<Target>().unwrap(), Target::Jira);
        assert_eq!("Confluence".parse::<Target>().unwrap(), Target::Confluence);
        assert!("bitbucket".parse::<Target>().is_err());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::Jira.to_string(), "jira");
        assert_eq!(Target::Confluence.to_string(), "confluence");
    }

    #[test]
    fn test_backup_config_validate() {
        let config = BackupConfig {
            account: "acme".to_string(),
            email: "admin@acme.org".to_string(),
            api_key: "token".to_string(),
            with_attachments: true,
            for_cloud: true,
        };
        assert!(config.validate().is_ok());

        let mut missing = config.clone();
        missing.account = String::new();
        let err = missing.validate().unwrap_err().to_string();
        assert!(err.contains("Account"), "unexpected error: {}", err);

        let mut missing = config.clone();
        missing.email = String::new();
        let err = missing.validate().unwrap_err().to_string();
        assert!(err.contains("email"), "unexpected error: {}", err);

        let mut missing = config;
        missing.api_key = String::new();
        let err = missing.validate().unwrap_err().to_string();
        assert!(err.contains("API key"), "unexpected error: {}", err);
    }

    #[test]
    fn test_account_url() {
        let config = BackupConfig {
            account: "acme".to_string(),
            email: "admin@acme.org".to_string(),
            api_key: "token".to_string(),
            with_attachments: true,
            for_cloud: true,
        };
        assert_eq!(config.account_url(), "https://acme.atlassian.net");
    }

    #[test]
    fn test_poll_policy_defaults() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(15));
        assert_eq!(policy.max_errors, 10);
        assert_eq!(policy.max_duration, Duration::from_secs(21600));
    }

    #[test]
    fn test_progress_gate_reports_only_new_highs() {
        let mut gate = ProgressGate::default();
        let readings = [10, 10, 8, 40, 100];
        let reported: Vec<i64> = readings
            .iter()
            .copied()
            .filter(|p| gate.observe(*p))
            .collect();
        assert_eq!(reported, vec![10, 40, 100]);
    }

    #[test]
    fn test_progress_gate_first_reading_counts() {
        let mut gate = ProgressGate::default();
        assert!(gate.observe(0));
        assert!(!gate.observe(0));
        assert!(gate.observe(1));
    }

    #[test]
    fn test_export_prefs_wire_names() {
        let prefs = ExportPrefs {
            attachments: true,
            export_to_cloud: false,
        };
        let json = serde_json::to_string(&prefs).unwrap();
        assert_eq!(json, r#"{"cbAttachments":true,"exportToCloud":false}"#);
    }
}
