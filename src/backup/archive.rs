// pgbackup/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tar::{Builder, Header};
use tempfile::NamedTempFile;
use tracing::info;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::config::ArchiveFormat;
use crate::errors::ArchiveError;

/// A finished archive on local disk holding exactly one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub format: ArchiveFormat,
    pub size: u64,
}

/// Compresses `source` into a single-entry archive at `archive_path`.
///
/// The archive is written to a temporary file beside `archive_path`, synced
/// to disk and only then renamed into place, so the final path either holds
/// a complete archive or nothing. Once `cancel` is set the partial file is
/// discarded instead of being moved into place.
pub fn create_archive(
    source: &Path,
    archive_path: &Path,
    format: ArchiveFormat,
    cancel: &AtomicBool,
) -> Result<ArchiveArtifact, ArchiveError> {
    let entry_name = file_name_of(source)?;
    let file_name = file_name_of(archive_path)?;

    let source_file = File::open(source)
        .map_err(|e| ArchiveError::io(format!("Failed to open dump {}", source.display()), e))?;
    let entry_len = source_file
        .metadata()
        .map_err(|e| ArchiveError::io(format!("Failed to stat dump {}", source.display()), e))?
        .len();

    info!(
        source = %source.display(),
        archive = %archive_path.display(),
        format = format.extension(),
        "🗜 Compressing dump"
    );

    write_archive(source_file, &entry_name, entry_len, archive_path, format, cancel)?;

    let size = std::fs::metadata(archive_path)
        .map_err(|e| ArchiveError::io(format!("Failed to stat archive {}", archive_path.display()), e))?
        .len();

    info!(archive = %archive_path.display(), bytes = size, "✓ Archive created");
    Ok(ArchiveArtifact {
        path: archive_path.to_path_buf(),
        file_name,
        format,
        size,
    })
}

fn write_archive<R: Read>(
    mut reader: R,
    entry_name: &str,
    entry_len: u64,
    archive_path: &Path,
    format: ArchiveFormat,
    cancel: &AtomicBool,
) -> Result<(), ArchiveError> {
    let dir = match archive_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut partial = NamedTempFile::new_in(dir).map_err(|e| {
        ArchiveError::io(format!("Failed to create partial archive in {}", dir.display()), e)
    })?;

    let written = match format {
        ArchiveFormat::Zip => write_zip(&mut reader, entry_name, entry_len, partial.as_file_mut()),
        ArchiveFormat::TarGz => write_tar_gz(&mut reader, entry_name, entry_len, partial.as_file_mut()),
    };
    // `partial` is deleted on drop when any of these steps fail.
    written.map_err(|e| ArchiveError::io(format!("Failed to write archive entry {}", entry_name), e))?;

    partial
        .as_file_mut()
        .sync_all()
        .map_err(|e| ArchiveError::io("Failed to sync archive to disk", e))?;

    if cancel.load(Ordering::SeqCst) {
        return Err(ArchiveError::Cancelled);
    }
    partial.persist(archive_path).map_err(|e| {
        ArchiveError::io(
            format!("Failed to move archive into place at {}", archive_path.display()),
            e.error,
        )
    })?;
    Ok(())
}

fn write_zip<R: Read>(
    reader: &mut R,
    entry_name: &str,
    entry_len: u64,
    out: &mut File,
) -> io::Result<()> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        // Maximum deflate level; backups run off the request path.
        .compression_level(Some(9))
        .large_file(entry_len >= u64::from(u32::MAX));

    let mut zip = ZipWriter::new(out);
    zip.start_file(entry_name, options).map_err(io::Error::other)?;
    io::copy(reader, &mut zip)?;
    let out = zip.finish().map_err(io::Error::other)?;
    out.flush()
}

fn write_tar_gz<R: Read>(
    reader: &mut R,
    entry_name: &str,
    entry_len: u64,
    out: &mut File,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(entry_len);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let encoder = GzEncoder::new(out, Compression::best());
    let mut tar_builder = Builder::new(encoder);
    tar_builder.append_data(&mut header, entry_name, reader)?;
    let encoder = tar_builder.into_inner()?;
    let out = encoder.finish()?;
    out.flush()
}

/// Reads back the single entry of an archive. Returns the entry name and bytes.
#[cfg(test)]
pub fn extract_single_entry(
    archive_path: &Path,
    format: ArchiveFormat,
) -> Result<(String, Vec<u8>), ArchiveError> {
    let file = File::open(archive_path)
        .map_err(|e| ArchiveError::io(format!("Failed to open archive {}", archive_path.display()), e))?;
    read_single_entry(file, format)
        .map_err(|e| ArchiveError::io(format!("Failed to read archive {}", archive_path.display()), e))
}

#[cfg(test)]
pub(crate) fn read_single_entry<R: Read + io::Seek>(
    reader: R,
    format: ArchiveFormat,
) -> io::Result<(String, Vec<u8>)> {
    let mut contents = Vec::new();
    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(reader).map_err(io::Error::other)?;
            if zip.len() != 1 {
                return Err(io::Error::other(format!("expected one entry, found {}", zip.len())));
            }
            let mut entry = zip.by_index(0).map_err(io::Error::other)?;
            let name = entry.name().to_string();
            entry.read_to_end(&mut contents)?;
            Ok((name, contents))
        }
        ArchiveFormat::TarGz => {
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(reader));
            let mut entries = archive.entries()?;
            let mut entry = entries
                .next()
                .ok_or_else(|| io::Error::other("archive has no entries"))??;
            let name = entry.path()?.to_string_lossy().into_owned();
            entry.read_to_end(&mut contents)?;
            drop(entry);
            if entries.next().is_some() {
                return Err(io::Error::other("expected one entry, found more"));
            }
            Ok((name, contents))
        }
    }
}

fn file_name_of(path: &Path) -> Result<String, ArchiveError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ArchiveError::io(
                format!("Invalid file name: {}", path.display()),
                io::Error::from(io::ErrorKind::InvalidInput),
            )
        })
}
