//! Confluence Cloud backup source.
//!
//! Unlike Jira, Confluence tracks a single implicit export task per
//! instance: starting a backup returns no ID and the progress endpoint is
//! queried without one. Progress comes back as a percentage string, and the
//! task is complete once the service publishes the backup file name.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::events::{Event, EventDispatcher};
use crate::source::{
    ensure_ok, http_client, into_reader, read_json, BackupConfig, BackupSource, ByteReader,
    ExportPrefs, PollPolicy, ProgressGate, ProgressInfo, REQUEST_TIMEOUT,
};
use crate::uploader::pretty_size;

pub struct ConfluenceSource {
    config: BackupConfig,
    base_url: String,
    client: reqwest::Client,
    policy: PollPolicy,
    dispatcher: Option<EventDispatcher>,
}

#[derive(Debug, Deserialize)]
struct BackupStatus {
    #[serde(rename = "currentStatus", default)]
    current_status: String,
    #[serde(rename = "alternativePercentage", default)]
    percentage: String,
    #[serde(rename = "fileName", default)]
    file_name: String,
    #[serde(rename = "isOutdated", default)]
    outdated: bool,
}

impl BackupStatus {
    /// Converts the service status into the shared progress format. The
    /// percentage arrives as a string like "33%"; anything unparsable is
    /// reported as zero progress.
    fn info(&self) -> ProgressInfo {
        match self.percentage.trim_end_matches('%').parse::<i64>() {
            Ok(progress) => ProgressInfo {
                message: self.current_status.clone(),
                progress,
            },
            Err(_) => ProgressInfo {
                message: "Unknown status".to_string(),
                progress: 0,
            },
        }
    }
}

impl ConfluenceSource {
    pub fn new(config: BackupConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            base_url: config.account_url(),
            client: http_client()?,
            config,
            policy: PollPolicy::default(),
            dispatcher: None,
        })
    }

    /// Points the source at a different API root, e.g. a proxy.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Overrides the timing of the progress poll loop.
    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn run_export(&self) -> Result<()> {
        let url = format!("{}/wiki/rest/obm/1.0/runbackup", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .timeout(REQUEST_TIMEOUT)
            .json(&ExportPrefs {
                attachments: self.config.with_attachments,
                export_to_cloud: self.config.for_cloud,
            })
            .send()
            .await?;

        ensure_ok(&response)
    }

    async fn backup_status(&self) -> Result<BackupStatus> {
        let url = format!("{}/wiki/rest/obm/1.0/getprogress", self.base_url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        ensure_ok(&response)?;

        let mut status: BackupStatus = read_json(response).await?;

        // The service ends status messages with a useless dot
        status.current_status = status.current_status.trim_end_matches('.').to_string();

        Ok(status)
    }
}

#[async_trait]
impl BackupSource for ConfluenceSource {
    fn set_dispatcher(&mut self, dispatcher: EventDispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    async fn start(&self, force: bool) -> Result<String> {
        tracing::info!(account = %self.config.account, "Starting Confluence backup process");

        let mut pending = None;

        if !force {
            tracing::info!("Checking for existing backup task");
            pending = self.backup_status().await.ok();
        }

        match pending {
            Some(status) if !status.outdated => {
                tracing::info!("Found previously created backup task");
            }
            _ => {
                self.run_export().await?;
                tracing::info!("Backup task created");
            }
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_and_wait(Event::BackupStarted);
        }

        // There is no task ID, the instance tracks a single export task
        Ok(String::new())
    }

    async fn progress(&self, _task: &str) -> Result<String> {
        let started = Instant::now();
        let mut errors = 0u32;
        let mut gate = ProgressGate::default();

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.policy.interval,
            self.policy.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if started.elapsed() > self.policy.max_duration {
                return Err(Error::TimeBudget);
            }

            let status = match self.backup_status().await {
                Ok(status) => {
                    errors = 0;
                    status
                }
                Err(err) => {
                    tracing::error!(error = %err, "Got error while checking progress");
                    errors += 1;

                    if errors > self.policy.max_errors {
                        return Err(Error::ErrorBudget(errors));
                    }

                    continue;
                }
            };

            let info = status.info();

            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.dispatch(Event::BackupProgress(info.clone()));
            }

            if gate.observe(info.progress) {
                tracing::info!(
                    progress = info.progress,
                    message = %info.message,
                    "Backup in progress"
                );
            }

            if !status.file_name.is_empty() {
                tracing::info!("Backup is ready for download");
                return Ok(status.file_name);
            }
        }
    }

    async fn download(&self, backup_file: &str, output: &Path) -> Result<()> {
        tracing::info!(file = %output.display(), "Writing backup file");

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_and_wait(Event::BackupSaving);
        }

        let mut reader = self.reader(backup_file).await?;
        let file = tokio::fs::File::create(output).await?;
        let mut writer = tokio::io::BufWriter::new(file);

        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await?;

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_and_wait(Event::BackupDone);
        }

        let size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        tracing::info!(size = %pretty_size(size), "Backup successfully saved");

        Ok(())
    }

    async fn reader(&self, backup_file: &str) -> Result<ByteReader> {
        let url = format!("{}/wiki/download/{}", self.base_url, backup_file);

        tracing::debug!(url = %url, "Downloading backup file");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .send()
            .await?;

        ensure_ok(&response)?;

        Ok(into_reader(response))
    }

    async fn backup_file(&self) -> Result<String> {
        let status = self.backup_status().await?;

        if status.file_name.is_empty() {
            return Err(Error::NotReady("no backup file found".into()));
        }

        Ok(status.file_name)
    }

    /// An outdated task still exposes its file name, it only stops
    /// counting as a fresh backup.
    async fn is_backup_created(&self) -> Result<bool> {
        let status = self.backup_status().await?;
        Ok(!status.file_name.is_empty() && !status.outdated)
    }
}
