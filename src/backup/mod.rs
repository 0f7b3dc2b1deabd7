pub(crate) mod logic; // Orchestrator: stage sequencing, timeouts and cleanup
pub(crate) mod archive; // Single-entry zip / tar.gz creation
pub(crate) mod cleanup; // Temp file guard shared by all stages
pub(crate) mod db_dump; // pg_dump invocation
pub(crate) mod download; // Streaming download sink
pub(crate) mod s3_upload; // Object storage upload sink

pub use logic::{BackupPipeline, Delivery, StoredObject};

use std::sync::Arc;

use crate::config::PipelineSettings;
use crate::errors::DumpError;

/// Pipeline wired to the real collaborators: `pg_dump` from PATH and S3.
pub fn default_pipeline(settings: PipelineSettings) -> Result<BackupPipeline, DumpError> {
    let dumper = db_dump::PgDump::locate()?;
    Ok(BackupPipeline::new(
        Arc::new(dumper),
        Arc::new(s3_upload::S3ObjectStore::default()),
        settings,
    ))
}
