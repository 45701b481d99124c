//! Adapter around the external `yt-dlp` executable.
//!
//! Callers describe what they want with an [`EngineOptions`] value; this module
//! renders it into command-line flags, runs the process on tokio's blocking
//! pool and reports either the captured stdout or a classified failure.
//! Concurrency is bounded by a semaphore sized from `engine_workers`: requests
//! beyond the bound wait for a permit instead of being rejected.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{config::ServiceConfig, quality::QualitySpec};

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 50;

pub const AUDIO_CODEC: &str = "mp3";
pub const AUDIO_BITRATE_KBPS: u32 = 192;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yt-dlp exited with error ({status}): {stderr_tail}")]
    Failed { status: String, stderr_tail: String },

    #[error("unreadable yt-dlp output: {0}")]
    Output(String),

    #[error("engine worker failed: {0}")]
    Worker(String),
}

/// Playlist handling requested from the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaylistMode {
    /// Let the engine decide from the URL.
    #[default]
    Auto,
    /// Only the addressed video, even inside a playlist context.
    Single,
    /// Crawl and download every member.
    Whole,
}

/// Post-processing directive: extract the audio track and transcode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTranscode {
    pub codec: String,
    pub bitrate_kbps: u32,
}

impl Default for AudioTranscode {
    fn default() -> Self {
        Self {
            codec: AUDIO_CODEC.to_string(),
            bitrate_kbps: AUDIO_BITRATE_KBPS,
        }
    }
}

/// Declarative option set for one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub format: Option<String>,
    pub output_template: Option<PathBuf>,
    pub merge_output_format: Option<String>,
    pub extract_audio: Option<AudioTranscode>,
    pub playlist: PlaylistMode,
    pub flat_playlist: bool,
    /// Print the resolved info JSON on stdout.
    pub dump_json: bool,
    /// Resolve metadata only; never write media.
    pub skip_download: bool,
    pub quiet: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            format: None,
            output_template: None,
            merge_output_format: None,
            extract_audio: None,
            playlist: PlaylistMode::Auto,
            flat_playlist: false,
            dump_json: false,
            skip_download: false,
            quiet: true,
        }
    }
}

impl EngineOptions {
    /// Cheap flat crawl: metadata for a video or playlist, members unresolved.
    pub fn metadata() -> Self {
        Self {
            flat_playlist: true,
            dump_json: true,
            skip_download: true,
            ..Self::default()
        }
    }

    pub fn with_output_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.output_template = Some(template.into());
        self
    }

    pub fn with_playlist(mut self, mode: PlaylistMode) -> Self {
        self.playlist = mode;
        self
    }

    /// Ask for the final info JSON after the download so the produced file
    /// can be located.
    pub fn reporting(mut self) -> Self {
        self.dump_json = true;
        self.skip_download = false;
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.quiet {
            args.push("--quiet".to_string());
            args.push("--no-warnings".to_string());
        }
        match self.playlist {
            PlaylistMode::Auto => {}
            PlaylistMode::Single => args.push("--no-playlist".to_string()),
            PlaylistMode::Whole => args.push("--yes-playlist".to_string()),
        }
        if self.flat_playlist {
            args.push("--flat-playlist".to_string());
        }
        if let Some(format) = &self.format {
            args.push("-f".to_string());
            args.push(format.clone());
        }
        if let Some(container) = &self.merge_output_format {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }
        if let Some(transcode) = &self.extract_audio {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(transcode.codec.clone());
            args.push("--audio-quality".to_string());
            args.push(format!("{}K", transcode.bitrate_kbps));
        }
        if let Some(template) = &self.output_template {
            args.push("-o".to_string());
            args.push(template.to_string_lossy().into_owned());
        }
        if self.dump_json {
            args.push("-J".to_string());
            if !self.skip_download {
                args.push("--no-simulate".to_string());
            }
        } else if self.skip_download {
            args.push("--skip-download".to_string());
        }
        args
    }
}

/// What a request wants delivered; selects the engine option set, the file
/// extension and the archive suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Video(QualitySpec),
    Audio,
}

impl ContentKind {
    pub fn engine_options(self) -> EngineOptions {
        match self {
            Self::Video(quality) => {
                let height = quality.height();
                EngineOptions {
                    format: Some(format!(
                        "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/best[height<={height}]/best"
                    )),
                    merge_output_format: Some("mp4".to_string()),
                    ..EngineOptions::default()
                }
            }
            Self::Audio => EngineOptions {
                format: Some("bestaudio[ext=m4a]/bestaudio/best".to_string()),
                extract_audio: Some(AudioTranscode::default()),
                ..EngineOptions::default()
            },
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Video(_) => "mp4",
            Self::Audio => AUDIO_CODEC,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Video(_) => "video/mp4",
            Self::Audio => "audio/mpeg",
        }
    }

    /// Stem used when a title sanitizes to nothing.
    pub fn fallback_stem(self) -> &'static str {
        match self {
            Self::Video(_) => "video",
            Self::Audio => "audio",
        }
    }

    pub fn archive_suffix(self) -> &'static str {
        match self {
            Self::Video(_) => "videos",
            Self::Audio => "audio",
        }
    }

    /// Prefix for per-job temporary workspaces.
    pub fn workspace_prefix(self) -> &'static str {
        match self {
            Self::Video(_) => "playlist_video_",
            Self::Audio => "playlist_audio_",
        }
    }
}

/// Output template placing each item under its own title.
pub fn title_template(dir: &Path) -> PathBuf {
    dir.join("%(title)s.%(ext)s")
}

#[derive(Debug)]
pub struct EngineOutput {
    pub stdout: Vec<u8>,
    pub stderr_tail: String,
}

impl EngineOutput {
    pub fn json(&self) -> Result<Value, EngineError> {
        serde_json::from_slice(&self.stdout).map_err(|err| EngineError::Output(err.to_string()))
    }
}

/// Cheap to clone; all clones share the same worker bound.
#[derive(Clone)]
pub struct YtDlp {
    inner: Arc<YtDlpInner>,
}

struct YtDlpInner {
    program: PathBuf,
    ffmpeg: Option<PathBuf>,
    permits: Arc<Semaphore>,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, ffmpeg: Option<PathBuf>, workers: usize) -> Self {
        Self {
            inner: Arc::new(YtDlpInner {
                program: program.into(),
                ffmpeg,
                permits: Arc::new(Semaphore::new(workers.max(1))),
            }),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.ytdlp_bin.clone(),
            config.ffmpeg_bin.clone(),
            config.engine_workers,
        )
    }

    pub fn program(&self) -> &Path {
        &self.inner.program
    }

    /// Full argument vector for `url` under `options`.
    pub fn command_args(&self, url: &str, options: &EngineOptions) -> Vec<String> {
        let mut args = options.to_args();
        if let Some(ffmpeg) = &self.inner.ffmpeg {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    /// Runs one invocation on a blocking worker and waits for it to exit.
    pub async fn run(&self, url: &str, options: &EngineOptions) -> Result<EngineOutput, EngineError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| EngineError::Worker(err.to_string()))?;

        let program = self.inner.program.clone();
        let args = self.command_args(url, options);
        debug!(program = %program.display(), ?args, "invoking yt-dlp");

        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_blocking(&program, &args)
        })
        .await
        .map_err(|err| EngineError::Worker(err.to_string()))?;

        if let Err(EngineError::Failed { status, stderr_tail }) = &result {
            warn!(%url, %status, stderr = %stderr_tail, "yt-dlp failed");
        }
        result
    }

    /// Runs an invocation that dumps JSON and parses stdout.
    pub async fn run_json(&self, url: &str, options: &EngineOptions) -> Result<Value, EngineError> {
        self.run(url, options).await?.json()
    }
}

fn run_blocking(program: &Path, args: &[String]) -> Result<EngineOutput, EngineError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| EngineError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    let stderr_tail = stderr_tail(&output.stderr);
    if !output.status.success() {
        return Err(EngineError::Failed {
            status: output.status.to_string(),
            stderr_tail,
        });
    }

    Ok(EngineOutput {
        stdout: output.stdout,
        stderr_tail,
    })
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for line in text.lines().map(str::trim_end).filter(|line| !line.is_empty()) {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    if tail.is_empty() {
        return "no stderr output captured".to_string();
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}
