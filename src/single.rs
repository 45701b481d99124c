//! Single video or audio download into a per-request job directory.
//!
//! Each request gets its own directory under the download root, so two
//! requests for the same title never share a file. The engine writes the
//! file there under its own title, reports the final path in its info JSON,
//! and the caller streams the file back. The whole job directory, fragments
//! included, is deleted when the returned [`SingleDownload`] (or the body
//! holding its [`RemoveOnDrop`] guard) is dropped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::Builder;
use tracing::info;

use crate::{
    cleanup::remove_tree,
    engine::{ContentKind, PlaylistMode, YtDlp, title_template},
    error::{ServiceError, ServiceResult},
    sanitize::{safe_title, with_extension},
};

const JOB_DIR_PREFIX: &str = "single_";

/// Deletes the job directory at `path` once, when dropped.
#[derive(Debug)]
pub struct RemoveOnDrop {
    path: Option<PathBuf>,
}

impl RemoveOnDrop {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        remove_tree(&path, "download job directory");
    }
}

/// A finished single-item download, ready to stream.
#[derive(Debug)]
pub struct SingleDownload {
    pub file: tokio::fs::File,
    pub len: u64,
    /// Client-facing name, e.g. `My Song.mp3`.
    pub filename: String,
    pub mime_type: &'static str,
    /// Owns the job directory holding `file`.
    pub source: RemoveOnDrop,
}

pub async fn download(
    engine: &YtDlp,
    download_root: &Path,
    url: &str,
    kind: ContentKind,
) -> ServiceResult<SingleDownload> {
    let job_dir = Builder::new()
        .prefix(JOB_DIR_PREFIX)
        .tempdir_in(download_root)?
        .keep();
    // Owns the directory from here on, so every early return below removes
    // whatever the engine left in it.
    let source = RemoveOnDrop::new(&job_dir);

    let options = kind
        .engine_options()
        .with_playlist(PlaylistMode::Single)
        .with_output_template(title_template(&job_dir))
        .reporting();

    let info = engine
        .run_json(url, &options)
        .await
        .map_err(ServiceError::from_download)?;

    let path = resolve_output_path(&info, kind.extension()).ok_or_else(|| {
        ServiceError::Unexpected("engine did not report a downloaded file".to_string())
    })?;

    let title = info.get("title").and_then(Value::as_str).unwrap_or_default();
    let filename = with_extension(&safe_title(title), kind.fallback_stem(), kind.extension());

    let file = tokio::fs::File::open(&path).await?;
    let len = file.metadata().await?.len();
    info!(path = %path.display(), %filename, bytes = len, "single download ready");

    Ok(SingleDownload {
        file,
        len,
        filename,
        mime_type: kind.mime_type(),
        source,
    })
}

/// Finds the file the engine produced. Candidates come from
/// `requested_downloads[].filepath`, then `_filename` and `filename`; each is
/// also tried with `extension` swapped in, since post-processing may change it.
pub fn resolve_output_path(info: &Value, extension: &str) -> Option<PathBuf> {
    let requested = info
        .get("requested_downloads")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|download| download.get("filepath").and_then(Value::as_str));
    let legacy = ["_filename", "filename"]
        .into_iter()
        .filter_map(|key| info.get(key).and_then(Value::as_str));

    requested
        .chain(legacy)
        .map(PathBuf::from)
        .flat_map(|candidate| {
            let swapped = candidate.with_extension(extension);
            [candidate, swapped]
        })
        .find(|candidate| candidate.is_file())
}
