//! Jira Cloud backup source.
//!
//! Jira tracks export jobs by task ID: starting a backup returns an ID,
//! progress is queried per task, and the task is complete once it reports
//! 100% together with the download path of the produced archive.

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

pub struct JiraSource {
    config: BackupConfig,
    base_url: String,
    client: reqwest::Client,
    policy: PollPolicy,
    dispatcher: Option<EventDispatcher>,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    #[serde(rename = "taskId", default)]
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskProgress {
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    progress: i64,
}

impl TaskProgress {
    /// The export is done once it reports full progress and the service
    /// has published the download path.
    fn is_complete(&self) -> bool {
        self.progress >= 100 && !self.result.is_empty()
    }
}

impl JiraSource {
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

    async fn run_export(&self) -> Result<String> {
        let url = format!("{}/rest/backup/1/export/runbackup", self.base_url);
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

        ensure_ok(&response)?;

        let info: TaskInfo = read_json(response).await?;
        Ok(info.task_id)
    }

    /// ID of the most recent export task, delivered as a plain text body.
    async fn last_task_id(&self) -> Result<String> {
        let url = format!("{}/rest/backup/1/export/lastTaskId", self.base_url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        ensure_ok(&response)?;

        Ok(response.text().await?.trim().to_string())
    }

    async fn task_progress(&self, task: &str) -> Result<TaskProgress> {
        let url = format!("{}/rest/backup/1/export/getProgress", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("taskId", task)])
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        ensure_ok(&response)?;

        read_json(response).await
    }
}

#[async_trait]
impl BackupSource for JiraSource {
    fn set_dispatcher(&mut self, dispatcher: EventDispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    async fn start(&self, force: bool) -> Result<String> {
        tracing::info!(account = %self.config.account, "Starting Jira backup process");

        let mut task = String::new();

        if !force {
            tracing::info!("Checking for existing backup task");
            task = self.last_task_id().await.unwrap_or_default();
        }

        if task.is_empty() {
            task = self.run_export().await?;
            tracing::info!(task = %task, "Backup task created");
        } else {
            tracing::info!(task = %task, "Found previously created backup task");
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_and_wait(Event::BackupStarted);
        }

        Ok(task)
    }

    async fn progress(&self, task: &str) -> Result<String> {
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

            let progress = match self.task_progress(task).await {
                Ok(progress) => {
                    errors = 0;
                    progress
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

            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.dispatch(Event::BackupProgress(ProgressInfo {
                    message: progress.message.clone(),
                    progress: progress.progress,
                }));
            }

            if gate.observe(progress.progress) {
                tracing::info!(
                    progress = progress.progress,
                    message = %progress.message,
                    "Backup in progress"
                );
            }

            if progress.is_complete() {
                tracing::info!("Backup is ready for download");
                return Ok(progress.result);
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
        let url = format!("{}/plugins/servlet/{}", self.base_url, backup_file);

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
        let task = self.last_task_id().await?;

        if task.is_empty() {
            return Err(Error::NotReady("no backup task found".into()));
        }

        let progress = self.task_progress(&task).await?;

        if !progress.is_complete() {
            return Err(Error::NotReady("backup task is not finished yet".into()));
        }

        Ok(progress.result)
    }

    async fn is_backup_created(&self) -> Result<bool> {
        let task = self.last_task_id().await?;

        if task.is_empty() {
            return Ok(false);
        }

        Ok(self.task_progress(&task).await?.is_complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::Json as JsonBody;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use crate::events;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    fn test_config() -> BackupConfig {
        BackupConfig {
            account: "acme".to_string(),
            email: "admin@acme.org".to_string(),
            api_key: "token".to_string(),
            with_attachments: true,
            for_cloud: false,
        }
    }

    fn test_source(base_url: &str) -> JiraSource {
        JiraSource::new(test_config())
            .unwrap()
            .with_base_url(base_url)
            .with_poll_policy(PollPolicy {
                interval: Duration::from_millis(5),
                max_errors: 10,
                max_duration: Duration::from_secs(10),
            })
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = test_config();
        config.account = String::new();
        assert!(JiraSource::new(config).is_err());
    }

    #[test]
    fn test_base_url_defaults_to_account_url() {
        let source = JiraSource::new(test_config()).unwrap();
        assert_eq!(source.base_url, "https://acme.atlassian.net");
    }

    #[tokio::test]
    async fn test_start_reuses_pending_task() {
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();

        let app = Router::new()
            .route("/rest/backup/1/export/lastTaskId", get(|| async { "10199" }))
            .route(
                "/rest/backup/1/export/runbackup",
                post(move || {
                    let r = r.clone();
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"taskId": "10200"}))
                    }
                }),
            );

        let base = serve(app).await;
        let source = test_source(&base);

        let task = source.start(false).await.unwrap();
        assert_eq!(task, "10199");
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_force_skips_pending_task() {
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();

        let app = Router::new()
            .route("/rest/backup/1/export/lastTaskId", get(|| async { "10199" }))
            .route(
                "/rest/backup/1/export/runbackup",
                post(move || {
                    let r = r.clone();
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"taskId": "10200"}))
                    }
                }),
            );

        let base = serve(app).await;
        let source = test_source(&base);

        let task = source.start(true).await.unwrap();
        assert_eq!(task, "10200");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_sends_export_prefs() {
        let seen = Arc::new(Mutex::new(None::<Value>));
        let s = seen.clone();

        let app = Router::new()
            .route("/rest/backup/1/export/lastTaskId", get(|| async { "" }))
            .route(
                "/rest/backup/1/export/runbackup",
                post(move |JsonBody(body): JsonBody<Value>| {
                    let s = s.clone();
                    async move {
                        *s.lock() = Some(body);
                        Json(json!({"taskId": "10200"}))
                    }
                }),
            );

        let base = serve(app).await;
        let source = test_source(&base);

        let task = source.start(false).await.unwrap();
        assert_eq!(task, "10200");

        let body = seen.lock().clone().unwrap();
        assert_eq!(body["cbAttachments"], json!(true));
        assert_eq!(body["exportToCloud"], json!(false));
    }

    #[tokio::test]
    async fn test_progress_completes_when_export_ready() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();

        let app = Router::new().route(
            "/rest/backup/1/export/getProgress",
            get(move || {
                let h = h.clone();
                async move {
                    let n = h.fetch_add(1, Ordering::SeqCst);
                    let body = match n {
                        0 => json!({"message": "Exporting issues", "progress": 20}),
                        1 => json!({"message": "Exporting attachments", "progress": 75}),
                        _ => json!({
                            "message": "Export completed",
                            "progress": 100,
                            "result": "export/download/jira-export.zip",
                        }),
                    };
                    Json(body)
                }
            }),
        );

        let base = serve(app).await;
        let source = test_source(&base);

        let file = source.progress("10200").await.unwrap();
        assert_eq!(file, "export/download/jira-export.zip");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_progress_dispatches_event_on_every_tick() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();

        let app = Router::new().route(
            "/rest/backup/1/export/getProgress",
            get(move || {
                let h = h.clone();
                async move {
                    let n = h.fetch_add(1, Ordering::SeqCst);
                    let body = match n {
                        0 => json!({"message": "Exporting", "progress": 10}),
                        1 => json!({"message": "Exporting", "progress": 10}),
                        2 => json!({"message": "Exporting", "progress": 8}),
                        3 => json!({"message": "Exporting", "progress": 40}),
                        _ => json!({"message": "Done", "progress": 100, "result": "export/x.zip"}),
                    };
                    Json(body)
                }
            }),
        );

        let base = serve(app).await;
        let mut source = test_source(&base);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();

        let dispatcher = EventDispatcher::new();
        dispatcher.add_handler(events::BACKUP_PROGRESS, move |event| {
            if let Event::BackupProgress(info) = event {
                s.lock().push(info.progress);
            }
        });
        source.set_dispatcher(dispatcher);

        source.progress("10200").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 5 {
            assert!(deadline > Instant::now(), "progress events were not delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Regressive and duplicate readings still reach handlers, only the log gate skips them.
        assert_eq!(*seen.lock(), vec![10, 10, 8, 40, 100]);
    }

    #[tokio::test]
    async fn test_progress_gives_up_after_error_budget() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();

        let app = Router::new().route(
            "/rest/backup/1/export/getProgress",
            get(move || {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );

        let base = serve(app).await;
        let source = test_source(&base);

        let err = source.progress("10200").await.unwrap_err();
        assert!(matches!(err, Error::ErrorBudget(11)), "unexpected error: {}", err);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_progress_recovers_from_transient_errors() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();

        let app = Router::new().route(
            "/rest/backup/1/export/getProgress",
            get(move || {
                let h = h.clone();
                async move {
                    let n = h.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        StatusCode::BAD_GATEWAY.into_response()
                    } else if n < 5 {
                        Json(json!({"message": "Exporting", "progress": 40})).into_response()
                    } else {
                        Json(json!({"message": "Done", "progress": 100, "result": "export/x.zip"}))
                            .into_response()
                    }
                }
            }),
        );

        let base = serve(app).await;
        let source = test_source(&base);

        let file = source.progress("10200").await.unwrap();
        assert_eq!(file, "export/x.zip");
    }

    #[tokio::test]
    async fn test_progress_enforces_time_budget() {
        let app = Router::new().route(
            "/rest/backup/1/export/getProgress",
            get(|| async { Json(json!({"message": "Exporting", "progress": 10})) }),
        );

        let base = serve(app).await;
        let source = JiraSource::new(test_config())
            .unwrap()
            .with_base_url(&base)
            .with_poll_policy(PollPolicy {
                interval: Duration::from_millis(20),
                max_errors: 10,
                max_duration: Duration::from_millis(50),
            });

        let err = source.progress("10200").await.unwrap_err();
        assert!(matches!(err, Error::TimeBudget), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_download_writes_file_and_reports_lifecycle() {
        let payload = b"PK\x03\x04 fake jira archive".to_vec();
        let body = payload.clone();

        let app = Router::new().route(
            "/plugins/servlet/*file",
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        );

        let base = serve(app).await;
        let mut source = test_source(&base);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();

        for kind in [events::BACKUP_SAVING, events::BACKUP_DONE] {
            let s = seen.clone();
            dispatcher.add_handler(kind, move |event| s.lock().push(event.kind()));
        }
        source.set_dispatcher(dispatcher);

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("jira-backup.zip");

        source
            .download("export/download/jira-export.zip", &output)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), payload);
        assert_eq!(*seen.lock(), vec![events::BACKUP_SAVING, events::BACKUP_DONE]);
    }

    #[tokio::test]
    async fn test_backup_file_reports_not_ready() {
        let app = Router::new()
            .route("/rest/backup/1/export/lastTaskId", get(|| async { "10199" }))
            .route(
                "/rest/backup/1/export/getProgress",
                get(|| async { Json(json!({"message": "Exporting", "progress": 64})) }),
            );

        let base = serve(app).await;
        let source = test_source(&base);

        let err = source.backup_file().await.unwrap_err();
        assert!(matches!(err, Error::NotReady(_)), "unexpected error: {}", err);
        assert!(!source.is_backup_created().await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_file_returns_result_when_ready() {
        let app = Router::new()
            .route("/rest/backup/1/export/lastTaskId", get(|| async { "10199" }))
            .route(
                "/rest/backup/1/export/getProgress",
                get(|| async {
                    Json(json!({
                        "message": "Done",
                        "progress": 100,
                        "result": "export/download/jira-export.zip",
                    }))
                }),
            );

        let base = serve(app).await;
        let source = test_source(&base);

        assert_eq!(
            source.backup_file().await.unwrap(),
            "export/download/jira-export.zip"
        );
        assert!(source.is_backup_created().await.unwrap());
    }

    #[tokio::test]
    async fn test_is_backup_created_without_task() {
        let app = Router::new()
            .route("/rest/backup/1/export/lastTaskId", get(|| async { "" }));

        let base = serve(app).await;
        let source = test_source(&base);

        assert!(!source.is_backup_created().await.unwrap());
    }
}
