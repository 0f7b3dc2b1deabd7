// pgbackup/src/config/mod.rs
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

pub const POSTGRES_USER: &str = "POSTGRES_USER";
pub const POSTGRES_DATABASE: &str = "POSTGRES_DATABASE";
pub const POSTGRES_HOST: &str = "POSTGRES_HOST";
pub const POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";
pub const POSTGRES_PORT: &str = "POSTGRES_PORT";

pub const DELIVERY_MODE: &str = "BACKUP_DELIVERY_MODE";
pub const ARCHIVE_FORMAT: &str = "BACKUP_ARCHIVE_FORMAT";

pub const S3_BUCKET: &str = "S3_BUCKET";
pub const S3_REGION: &str = "S3_REGION";
pub const S3_ACCESS_KEY_ID: &str = "S3_ACCESS_KEY_ID";
pub const S3_SECRET_ACCESS_KEY: &str = "S3_SECRET_ACCESS_KEY";
pub const S3_ENDPOINT_URL: &str = "S3_ENDPOINT_URL";
pub const S3_KEY_PREFIX: &str = "S3_KEY_PREFIX";

pub const TEMP_DIR: &str = "BACKUP_TEMP_DIR";
pub const DUMP_TIMEOUT_SECS: &str = "BACKUP_DUMP_TIMEOUT_SECS";
pub const ARCHIVE_TIMEOUT_SECS: &str = "BACKUP_ARCHIVE_TIMEOUT_SECS";
pub const UPLOAD_TIMEOUT_SECS: &str = "BACKUP_UPLOAD_TIMEOUT_SECS";
pub const DOWNLOAD_TIMEOUT_SECS: &str = "BACKUP_DOWNLOAD_TIMEOUT_SECS";
pub const LISTEN_ADDR: &str = "BACKUP_LISTEN_ADDR";
pub const OUTPUT_DIR: &str = "BACKUP_OUTPUT_DIR";

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_TEMP_DIR: &str = "./databasebackup";
pub const DEFAULT_OUTPUT_DIR: &str = "./backups";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3600;

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Target for the upload sink. Works for AWS S3 and S3-compatible services
/// (DigitalOcean Spaces, MinIO) when `endpoint_url` is set.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
    pub key_prefix: Option<String>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("endpoint_url", &self.endpoint_url)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl StorageConfig {
    /// Object key for an archive: `<prefix>/<file_name>`, or just the file name.
    pub fn object_key(&self, file_name: &str) -> String {
        match self.key_prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, file_name),
            _ => file_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Download,
    Upload(StorageConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    #[default]
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::TarGz => "application/gzip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub connection: ConnectionParams,
    pub delivery: Delivery,
    pub archive_format: ArchiveFormat,
}

/// Where the pipeline keeps its working files and how long each stage may take.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub temp_dir: PathBuf,
    pub dump_timeout: Duration,
    pub archive_timeout: Duration,
    pub upload_timeout: Duration,
    /// How long a download-mode archive may wait to be fully read.
    pub download_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let timeout = Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS);
        PipelineSettings {
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            dump_timeout: timeout,
            archive_timeout: timeout,
            upload_timeout: timeout,
            download_timeout: timeout,
        }
    }
}

impl PipelineSettings {
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = PipelineSettings::default();
        Ok(PipelineSettings {
            temp_dir: lookup(vars, TEMP_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            dump_timeout: parse_timeout(vars, DUMP_TIMEOUT_SECS)?.unwrap_or(defaults.dump_timeout),
            archive_timeout: parse_timeout(vars, ARCHIVE_TIMEOUT_SECS)?
                .unwrap_or(defaults.archive_timeout),
            upload_timeout: parse_timeout(vars, UPLOAD_TIMEOUT_SECS)?
                .unwrap_or(defaults.upload_timeout),
            download_timeout: parse_timeout(vars, DOWNLOAD_TIMEOUT_SECS)?
                .unwrap_or(defaults.download_timeout),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    pub output_dir: PathBuf,
}

impl ServerSettings {
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let raw_addr = lookup(vars, LISTEN_ADDR).unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen_addr = raw_addr.parse().map_err(|e| ConfigError::Invalid {
            key: LISTEN_ADDR,
            reason: format!("'{}' is not a socket address: {}", raw_addr, e),
        })?;
        Ok(ServerSettings {
            listen_addr,
            output_dir: PathBuf::from(lookup(vars, OUTPUT_DIR).unwrap_or(DEFAULT_OUTPUT_DIR)),
        })
    }
}

/// Builds a validated request from a key/value source.
///
/// Every required key is checked before failing; missing keys are reported
/// together, in the order connection keys then storage keys.
pub fn resolve(vars: &HashMap<String, String>) -> Result<BackupRequest, ConfigError> {
    let mut missing = Vec::new();
    let mut required = |key: &'static str| match lookup(vars, key) {
        Some(value) => value.to_string(),
        None => {
            missing.push(key);
            String::new()
        }
    };

    let user = required(POSTGRES_USER);
    let database = required(POSTGRES_DATABASE);
    let host = required(POSTGRES_HOST);
    let password = required(POSTGRES_PASSWORD);

    let upload = match lookup(vars, DELIVERY_MODE).map(str::to_ascii_lowercase) {
        None => false,
        Some(mode) if mode == "download" => false,
        Some(mode) if mode == "upload" => true,
        Some(mode) => {
            return Err(ConfigError::Invalid {
                key: DELIVERY_MODE,
                reason: format!("'{}' is neither 'download' nor 'upload'", mode),
            });
        }
    };

    let storage = upload.then(|| StorageConfig {
        bucket: required(S3_BUCKET),
        region: required(S3_REGION),
        access_key_id: required(S3_ACCESS_KEY_ID),
        secret_access_key: required(S3_SECRET_ACCESS_KEY),
        endpoint_url: lookup(vars, S3_ENDPOINT_URL).map(str::to_string),
        key_prefix: lookup(vars, S3_KEY_PREFIX).map(str::to_string),
    });

    if !missing.is_empty() {
        return Err(ConfigError::Missing(missing));
    }

    let port = match lookup(vars, POSTGRES_PORT) {
        None => DEFAULT_PORT,
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                return Err(ConfigError::Invalid {
                    key: POSTGRES_PORT,
                    reason: format!("'{}' is not a valid TCP port", raw),
                });
            }
        },
    };

    let archive_format = match lookup(vars, ARCHIVE_FORMAT).map(str::to_ascii_lowercase) {
        None => ArchiveFormat::default(),
        Some(format) => match format.as_str() {
            "zip" => ArchiveFormat::Zip,
            "tar.gz" | "tgz" => ArchiveFormat::TarGz,
            other => {
                return Err(ConfigError::Invalid {
                    key: ARCHIVE_FORMAT,
                    reason: format!("'{}' is not one of zip, tar.gz", other),
                });
            }
        },
    };

    Ok(BackupRequest {
        connection: ConnectionParams {
            host,
            port,
            user,
            password,
            database,
        },
        delivery: storage.map_or(Delivery::Download, Delivery::Upload),
        archive_format,
    })
}

/// Empty and whitespace-only values count as unset.
fn lookup<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_timeout(
    vars: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    lookup(vars, key)
        .map(|raw| match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::Invalid {
                key,
                reason: format!("'{}' is not a positive number of seconds", raw),
            }),
        })
        .transpose()
}
