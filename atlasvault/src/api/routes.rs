//! Handlers of the service mode endpoints.
//!
//! Both endpoints answer with a bare status code. The caller is a
//! scheduler, not a browser, and the interesting output goes to the log
//! and to the pulse URL.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use crate::api::server::AppState;
use crate::runner::{build_source, build_uploader};
use crate::source::Target;

#[derive(Debug, Deserialize)]
pub struct BackupQuery {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub token: String,
    /// Any non-empty value forces a fresh export task.
    #[serde(default)]
    pub force: String,
}

/// Checks the query arguments shared by both endpoints and resolves the
/// requested target. The token is compared before anything touches the
/// cloud service.
fn validate_query(state: &AppState, query: &BackupQuery) -> std::result::Result<Target, String> {
    if query.target.is_empty() {
        return Err("target is empty".to_string());
    }

    let configured = state.config.server.access_token.as_deref();

    if configured.is_some() && query.token.is_empty() {
        return Err("token is empty".to_string());
    }

    let target = query
        .target
        .parse::<Target>()
        .map_err(|err| err.to_string())?;

    if let Some(expected) = configured {
        if query.token != expected {
            return Err("Invalid access token".to_string());
        }
    }

    Ok(target)
}

/// GET /create - starts an export task on the cloud service.
pub async fn create_backup(
    State(state): State<AppState>,
    Query(query): Query<BackupQuery>,
) -> StatusCode {
    tracing::info!(
        account = %state.config.access.account,
        storage = %state.config.storage.kind,
        "Got create request"
    );

    let target = match validate_query(&state, &query) {
        Ok(target) => target,
        Err(err) => {
            tracing::error!(error = %err, "Invalid request query");
            return StatusCode::BAD_REQUEST;
        }
    };

    let source = match build_source(&state.config, target) {
        Ok(source) => source,
        Err(err) => {
            state.pulse.send(false, &err.to_string()).await;
            tracing::error!(error = %err, "Can't create backup source");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let force = !query.force.is_empty();

    match source.start(force).await {
        Ok(task) => {
            tracing::info!(task = %task, "Backup request successfully created");
            state.pulse.send(true, "create-backup").await;
            StatusCode::OK
        }
        Err(err) => {
            state.pulse.send(false, &err.to_string()).await;
            tracing::error!(error = %err, "Can't create backup");
            StatusCode::BAD_GATEWAY
        }
    }
}

/// GET /download - streams a finished backup into the configured storage.
pub async fn download_backup(
    State(state): State<AppState>,
    Query(query): Query<BackupQuery>,
) -> StatusCode {
    tracing::info!(
        account = %state.config.access.account,
        storage = %state.config.storage.kind,
        "Got download request"
    );

    let target = match validate_query(&state, &query) {
        Ok(target) => target,
        Err(err) => {
            tracing::error!(error = %err, "Invalid request query");
            return StatusCode::BAD_REQUEST;
        }
    };

    let source = match build_source(&state.config, target) {
        Ok(source) => source,
        Err(err) => {
            state.pulse.send(false, &err.to_string()).await;
            tracing::error!(error = %err, "Can't create backup source");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let backup_file = match source.backup_file().await {
        Ok(file) => file,
        Err(err) => {
            state.pulse.send(false, &err.to_string()).await;
            tracing::error!(error = %err, "Can't find backup file");
            return StatusCode::BAD_GATEWAY;
        }
    };

    tracing::info!(file = %backup_file, "Starting download of the backup");

    let reader = match source.reader(&backup_file).await {
        Ok(reader) => reader,
        Err(err) => {
            state.pulse.send(false, &err.to_string()).await;
            tracing::error!(error = %err, "Can't open backup file for reading");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let uploader = match build_uploader(&state.config, target) {
        Ok(uploader) => uploader,
        Err(err) => {
            state.pulse.send(false, &err.to_string()).await;
            tracing::error!(error = %err, "Can't create uploader");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let output_name = state.config.output_file_name(target);

    tracing::info!(file = %backup_file, output = %output_name, "Uploading backup to storage");

    // The payload size is unknown when piping straight from the cloud
    // service, progress events carry byte counts only.
    match uploader.write(reader, &output_name, 0).await {
        Ok(()) => {
            tracing::info!(output = %output_name, "Backup successfully uploaded");
            state.pulse.send(true, "upload-backup").await;
            StatusCode::OK
        }
        Err(err) => {
            state.pulse.send(false, &err.to_string()).await;
            tracing::error!(error = %err, "Can't upload backup file");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
