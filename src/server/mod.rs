// pgbackup/src/server/mod.rs
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::backup::{BackupPipeline, Delivery};
use crate::config::DELIVERY_MODE;
use crate::errors::BackupError;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<BackupPipeline>,
    /// Configuration snapshot taken at startup.
    pub vars: Arc<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BackupQuery {
    /// Overrides `BACKUP_DELIVERY_MODE` for this request.
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupResponse {
    pub fn failure(err: &BackupError) -> Self {
        BackupResponse {
            message: "Error creating backup.".to_string(),
            error: Some(err.to_string()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/backup", get(trigger_backup).post(trigger_backup))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "🚀 Backup service listening");
    axum::serve(listener, router(state)).await
}

async fn health() -> Json<BackupResponse> {
    Json(BackupResponse {
        message: "ok".to_string(),
        error: None,
    })
}

async fn trigger_backup(State(state): State<AppState>, Query(query): Query<BackupQuery>) -> Response {
    let mut vars = (*state.vars).clone();
    if let Some(mode) = query.mode {
        vars.insert(DELIVERY_MODE.to_string(), mode);
    }

    match state.pipeline.run_backup(&vars).await {
        Ok(Delivery::Download(download)) => download.into_response(),
        Ok(Delivery::Uploaded(stored)) => (
            StatusCode::OK,
            Json(BackupResponse {
                message: format!(
                    "Backup successfully uploaded to s3://{}/{} ({} bytes).",
                    stored.bucket, stored.key, stored.size
                ),
                error: None,
            }),
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(BackupResponse::failure(&err))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::read_single_entry;
    use crate::backup::logic::fakes::{DumpBehavior, FakeDump, RecordingStore};
    use crate::config::{
        ArchiveFormat, PipelineSettings, POSTGRES_DATABASE, POSTGRES_HOST, POSTGRES_PASSWORD,
        POSTGRES_USER, S3_ACCESS_KEY_ID, S3_BUCKET, S3_REGION, S3_SECRET_ACCESS_KEY,
    };
    use crate::errors::StorageError;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use std::io::Cursor;
    use std::path::Path;
    use tower::ServiceExt;

    const DUMP: &[u8] = b"--\n-- PostgreSQL database dump\n--\nCREATE TABLE users (id int);\n";

    fn app(dir: &Path, store: Arc<RecordingStore>, vars: &[(&str, &str)]) -> Router {
        let settings = PipelineSettings {
            temp_dir: dir.to_path_buf(),
            ..PipelineSettings::default()
        };
        let pipeline = BackupPipeline::new(FakeDump::new(DumpBehavior::Write(DUMP.to_vec())), store, settings);
        router(AppState {
            pipeline: Arc::new(pipeline),
            vars: Arc::new(
                vars.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        })
    }

    const DB_VARS: [(&str, &str); 4] = [
        (POSTGRES_USER, "backup"),
        (POSTGRES_DATABASE, "app"),
        (POSTGRES_HOST, "localhost"),
        (POSTGRES_PASSWORD, "pw"),
    ];

    const S3_VARS: [(&str, &str); 4] = [
        (S3_BUCKET, "offsite"),
        (S3_REGION, "eu-west-1"),
        (S3_ACCESS_KEY_ID, "AKIA"),
        (S3_SECRET_ACCESS_KEY, "secret"),
    ];

    async fn get(app: Router, uri: &str) -> anyhow::Result<Response> {
        Ok(app.oneshot(Request::get(uri).body(Body::empty())?).await?)
    }

    #[tokio::test]
    async fn test_download_returns_attachment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let app = app(dir.path(), Arc::default(), &DB_VARS);

        let response = get(app, "/api/backup").await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
        let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str()?.to_string();
        assert!(disposition.starts_with("attachment; filename=\"database_backup_"));
        assert!(disposition.ends_with(".zip\""));

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let (entry, restored) = read_single_entry(Cursor::new(body.to_vec()), ArchiveFormat::Zip)?;
        assert!(disposition.contains(entry.trim_end_matches(".sql")));
        assert_eq!(restored, DUMP);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_mode_via_query() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(RecordingStore::default());
        let vars: Vec<_> = DB_VARS.iter().chain(S3_VARS.iter()).copied().collect();
        let app = app(dir.path(), store.clone(), &vars);

        let response = get(app, "/api/backup?mode=upload").await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body: BackupResponse = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
        assert!(body.message.contains("s3://offsite/database_backup_"));
        assert_eq!(body.error, None);
        assert_eq!(store.uploads().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_config_is_500_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let app = app(dir.path(), Arc::default(), &DB_VARS[..3]);

        let response = get(app, "/api/backup").await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
        assert_eq!(body["message"], "Error creating backup.");
        assert!(body["error"].as_str().unwrap_or_default().contains(POSTGRES_PASSWORD));
        Ok(())
    }

    #[tokio::test]
    async fn test_storage_failure_is_500_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RecordingStore::failing(StorageError::BucketNotFound("offsite".into()));
        let vars: Vec<_> = DB_VARS.iter().chain(S3_VARS.iter()).copied().collect();
        let app = app(dir.path(), store, &vars);

        let response = get(app, "/api/backup?mode=upload").await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: BackupResponse = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
        assert!(body.error.unwrap_or_default().contains("bucket not found"));
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_health() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let response = get(app(dir.path(), Arc::default(), &[]), "/health").await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }
}
