//! Zip assembly and integrity scanning for playlist workspaces.
//!
//! Both functions are blocking; callers run them on tokio's blocking pool.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter},
    path::{Component, Path},
};

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::error::{ServiceError, ServiceResult};

/// Zips every regular file under `workspace` into `archive_path`, naming each
/// entry by its path relative to `workspace`. Returns the number of entries.
///
/// An empty workspace produces a valid, empty archive.
pub fn build_archive(workspace: &Path, archive_path: &Path) -> ServiceResult<usize> {
    let file = File::create(archive_path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    let mut count = 0usize;
    for entry in WalkDir::new(workspace).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() || entry.path() == archive_path {
            continue;
        }

        let Some(name) = entry_name(workspace, entry.path()) else {
            warn!(path = %entry.path().display(), "skipping file outside workspace");
            continue;
        };
        let len = entry.metadata().map_err(io::Error::from)?.len();
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(len >= u64::from(u32::MAX));

        zip.start_file(name.as_str(), options).map_err(zip_error)?;
        let mut source = BufReader::new(File::open(entry.path())?);
        io::copy(&mut source, &mut zip)?;
        debug!(entry = %name, bytes = len, "archived file");
        count += 1;
    }

    zip.finish().map_err(zip_error)?;
    info!(archive = %archive_path.display(), files = count, "archive assembled");
    Ok(count)
}

/// Reads every entry to the end so its CRC is checked.
///
/// Fails with [`ServiceError::ArchiveCreation`] when the file is missing and
/// [`ServiceError::ArchiveCorrupt`] on the first unreadable entry.
pub fn verify_archive(archive_path: &Path) -> ServiceResult<usize> {
    if !archive_path.is_file() {
        return Err(ServiceError::ArchiveCreation {
            path: archive_path.to_path_buf(),
        });
    }

    let corrupt = |detail: String| ServiceError::ArchiveCorrupt {
        path: archive_path.to_path_buf(),
        detail,
    };

    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|err| corrupt(err.to_string()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| corrupt(format!("entry #{index}: {err}")))?;
        let name = entry.name().to_string();
        io::copy(&mut entry, &mut io::sink()).map_err(|err| corrupt(format!("{name}: {err}")))?;
    }

    info!(archive = %archive_path.display(), entries = archive.len(), "archive verified");
    Ok(archive.len())
}

/// `/`-separated path of `path` relative to `root`.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn zip_error(err: zip::result::ZipError) -> ServiceError {
    ServiceError::Unexpected(format!("zip error: {err}"))
}
