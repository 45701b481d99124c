use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_LISTEN_PORT: u16 = 8001;
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_CLEANUP_DELAY_SECS: u64 = 300;
pub const DEFAULT_ENGINE_WORKERS: usize = 4;
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = ["http://localhost:5173", "http://127.0.0.1:5173"];

/// Process-wide settings, resolved once at start-up and handed to every
/// pipeline constructor. Nothing in the crate reads configuration from
/// globals after this point.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub download_root: PathBuf,
    pub listen_host: String,
    pub listen_port: u16,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: Option<PathBuf>,
    pub allowed_origins: Vec<String>,
    pub cleanup_delay: Duration,
    pub engine_workers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from(DEFAULT_DOWNLOAD_ROOT),
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            ffmpeg_bin: None,
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|origin| origin.to_string())
                .collect(),
            cleanup_delay: Duration::from_secs(DEFAULT_CLEANUP_DELAY_SECS),
            engine_workers: DEFAULT_ENGINE_WORKERS,
        }
    }
}

impl ServiceConfig {
    /// Creates the download root if it does not exist yet.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.download_root)
            .with_context(|| format!("Creating {}", self.download_root.display()))
    }
}

/// Values supplied on the command line. They win over both the process
/// environment and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub env_path: Option<PathBuf>,
    pub download_root: Option<PathBuf>,
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub ytdlp_bin: Option<PathBuf>,
    pub ffmpeg_bin: Option<PathBuf>,
    pub cleanup_delay_secs: Option<u64>,
    pub engine_workers: Option<usize>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<ServiceConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_config(&file_vars, env_var_string, overrides))
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> ServiceConfig {
    let defaults = ServiceConfig::default();
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let download_root = overrides
        .download_root
        .or_else(|| lookup("DOWNLOAD_ROOT").map(PathBuf::from))
        .unwrap_or(defaults.download_root);
    let listen_host = overrides
        .listen_host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("YANKTUBE_HOST"))
        .unwrap_or(defaults.listen_host);
    let listen_port = overrides
        .listen_port
        .or_else(|| lookup("YANKTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(defaults.listen_port);
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup("YTDLP_BIN").map(PathBuf::from))
        .unwrap_or(defaults.ytdlp_bin);
    let ffmpeg_bin = overrides
        .ffmpeg_bin
        .or_else(|| lookup("FFMPEG_BIN").map(PathBuf::from));
    let allowed_origins = lookup("ALLOWED_ORIGINS")
        .map(|value| parse_origin_list(&value))
        .filter(|origins| !origins.is_empty())
        .unwrap_or(defaults.allowed_origins);
    let cleanup_delay = overrides
        .cleanup_delay_secs
        .or_else(|| lookup("CLEANUP_DELAY_SECS").and_then(|value| value.parse::<u64>().ok()))
        .map(Duration::from_secs)
        .unwrap_or(defaults.cleanup_delay);
    let engine_workers = overrides
        .engine_workers
        .or_else(|| lookup("ENGINE_WORKERS").and_then(|value| value.parse::<usize>().ok()))
        .unwrap_or(defaults.engine_workers)
        .max(1);

    ServiceConfig {
        download_root,
        listen_host,
        listen_port,
        ytdlp_bin,
        ffmpeg_bin,
        allowed_origins,
        cleanup_delay,
        engine_workers,
    }
}

fn parse_origin_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(|origin| origin.trim_end_matches('/').to_string())
        .collect()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
