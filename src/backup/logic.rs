// pgbackup/src/backup/logic.rs
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::archive::{ArchiveArtifact, create_archive};
use super::cleanup::TempFiles;
use super::db_dump::{DumpProducer, verify_dump_output};
use super::download::ArchiveDownload;
use super::s3_upload::ObjectStore;
use crate::config::{self, ArchiveFormat, BackupRequest, Delivery as DeliveryMode, PipelineSettings, StorageConfig};
use crate::errors::{ArchiveError, BackupError, DumpError, UploadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Dumping,
    Archiving,
    Delivering,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::Dumping => "dumping",
            Stage::Archiving => "archiving",
            Stage::Delivering => "delivering",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Remote copy of an uploaded archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

/// What a successful run hands back to the caller.
#[derive(Debug)]
pub enum Delivery {
    /// Archive still on disk, streamed (and then removed) by the caller.
    Download(ArchiveDownload),
    Uploaded(StoredObject),
}

/// Per-invocation file names: `database_backup_<UTC timestamp>_<random>`.
/// The random suffix keeps concurrent runs from sharing (and deleting) files.
#[derive(Debug, Clone)]
struct BackupNames {
    stem: String,
}

impl BackupNames {
    fn new() -> Self {
        let timestamp = Utc::now().format("%Y-%m-%d_%H_%M_%S");
        let suffix = Uuid::new_v4().simple().to_string();
        BackupNames {
            stem: format!("database_backup_{}_{}", timestamp, &suffix[..8]),
        }
    }

    fn dump_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.sql", self.stem))
    }

    fn archive_path(&self, dir: &Path, format: ArchiveFormat) -> PathBuf {
        dir.join(format!("{}.{}", self.stem, format.extension()))
    }
}

/// Dump → archive → deliver, one stage at a time.
pub struct BackupPipeline {
    dumper: Arc<dyn DumpProducer>,
    store: Arc<dyn ObjectStore>,
    settings: PipelineSettings,
}

impl BackupPipeline {
    pub fn new(
        dumper: Arc<dyn DumpProducer>,
        store: Arc<dyn ObjectStore>,
        settings: PipelineSettings,
    ) -> Self {
        BackupPipeline {
            dumper,
            store,
            settings,
        }
    }

    /// Resolves `vars` into a request and runs it.
    pub async fn run_backup(&self, vars: &HashMap<String, String>) -> Result<Delivery, BackupError> {
        transition(Stage::Validating);
        let request = config::resolve(vars).map_err(|e| {
            let err = BackupError::from(e);
            error!(stage = %Stage::Failed, error = %err, "❌ Backup configuration rejected");
            err
        })?;
        self.run(request).await
    }

    pub async fn run(&self, request: BackupRequest) -> Result<Delivery, BackupError> {
        let mut temp_files = TempFiles::default();
        match self.execute(&request, &mut temp_files).await {
            Ok(delivery) => {
                transition(Stage::Done);
                Ok(delivery)
            }
            Err(err) => {
                let removed = temp_files.remove_all();
                error!(
                    stage = %Stage::Failed,
                    kind = err.kind(),
                    retryable = err.is_retryable(),
                    removed_files = removed,
                    error = %err,
                    "❌ Backup failed"
                );
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: &BackupRequest,
        temp_files: &mut TempFiles,
    ) -> Result<Delivery, BackupError> {
        let names = BackupNames::new();
        let temp_dir = &self.settings.temp_dir;
        tokio::fs::create_dir_all(temp_dir)
            .await
            .map_err(DumpError::Output)?;

        transition(Stage::Dumping);
        let dump_path = names.dump_path(temp_dir);
        // Tracked up front: a failed or timed-out dump may leave a partial file.
        temp_files.track(&dump_path);
        self.dump(request, &dump_path).await?;

        transition(Stage::Archiving);
        let archive_path = names.archive_path(temp_dir, request.archive_format);
        let artifact = self
            .archive(&dump_path, &archive_path, request.archive_format)
            .await?;
        temp_files.track(&artifact.path);

        transition(Stage::Delivering);
        match &request.delivery {
            DeliveryMode::Download => {
                let download = ArchiveDownload::open(
                    &artifact,
                    std::mem::take(temp_files),
                    self.settings.download_timeout,
                )
                .await?;
                Ok(Delivery::Download(download))
            }
            DeliveryMode::Upload(storage) => {
                let stored = self.upload(storage, &artifact).await?;
                temp_files.remove_all();
                Ok(Delivery::Uploaded(stored))
            }
        }
    }

    async fn dump(&self, request: &BackupRequest, dump_path: &Path) -> Result<(), DumpError> {
        let limit = self.settings.dump_timeout;
        match timeout(limit, self.dumper.dump(&request.connection, dump_path)).await {
            Ok(result) => result?,
            Err(_) => return Err(DumpError::Timeout(limit)),
        }
        let bytes = verify_dump_output(dump_path).await?;
        info!(dump = %dump_path.display(), bytes, "✓ Database dump complete");
        Ok(())
    }

    async fn archive(
        &self,
        dump_path: &Path,
        archive_path: &Path,
        format: ArchiveFormat,
    ) -> Result<ArchiveArtifact, ArchiveError> {
        let limit = self.settings.archive_timeout;
        let source = dump_path.to_path_buf();
        let dest = archive_path.to_path_buf();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            create_archive(&source, &dest, format, &worker_cancel)
        });
        match timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ArchiveError::Worker(join_err.to_string())),
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                warn!(archive = %archive_path.display(), "⚠️ Archiving exceeded its time limit");
                // The writer may already be past its cancel check; remove whatever it finishes.
                tokio::spawn(async move {
                    if let Ok(Ok(artifact)) = task.await {
                        let mut late = TempFiles::default();
                        late.track(artifact.path);
                        late.remove_all();
                    }
                });
                Err(ArchiveError::Timeout(limit))
            }
        }
    }

    async fn upload(
        &self,
        storage: &StorageConfig,
        artifact: &ArchiveArtifact,
    ) -> Result<StoredObject, UploadError> {
        let key = storage.object_key(&artifact.file_name);
        let limit = self.settings.upload_timeout;
        let put = self.store.put_object(
            storage,
            &key,
            &artifact.path,
            artifact.format.content_type(),
            artifact.size,
        );
        match timeout(limit, put).await {
            Ok(Ok(())) => Ok(StoredObject {
                bucket: storage.bucket.clone(),
                key,
                size: artifact.size,
            }),
            Ok(Err(source)) => Err(UploadError::Storage {
                bucket: storage.bucket.clone(),
                key,
                source,
            }),
            Err(_) => Err(UploadError::Timeout(limit)),
        }
    }
}

fn transition(stage: Stage) {
    info!(stage = %stage, "Backup stage: {}", stage);
}
