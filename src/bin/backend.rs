#![forbid(unsafe_code)]

//! Axum front end for the YankTube download service.
//!
//! Every handler is thin: validate the query, hand off to a pipeline from the
//! library crate, and turn the result into either a JSON body or a streamed
//! attachment. Failures leave the pipelines as [`ServiceError`] values and are
//! rendered by [`ApiError`].

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use async_stream::stream;
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use yanktube::{
    cleanup::CleanupScheduler,
    config::{ConfigOverrides, ServiceConfig, resolve_config},
    engine::{ContentKind, YtDlp},
    error::ServiceError,
    metadata::{MediaDetails, extract_details},
    playlist::PlaylistPipeline,
    quality::QualitySpec,
    sanitize::content_disposition,
    single,
};

const DEFAULT_LOG_FILTER: &str = "info,yanktube=debug,tower_http=info";
const DEFAULT_QUALITY: &str = "720p";
const ZIP_MIME: &str = "application/zip";

const ENDPOINTS: [&str; 5] = [
    "/details",
    "/download/video",
    "/download/audio",
    "/download/playlist/video",
    "/download/playlist/audio",
];

#[derive(Debug, Parser)]
#[command(name = "backend", version, about = "HTTP API for fetching videos, audio and playlists")]
struct BackendArgs {
    /// `.env` file to read before the process environment.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    download_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, value_name = "PATH")]
    ytdlp_bin: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    ffmpeg_bin: Option<PathBuf>,
    /// Seconds a finished playlist archive stays on disk.
    #[arg(long, value_name = "SECS")]
    cleanup_delay_secs: Option<u64>,
    /// Upper bound on concurrent yt-dlp processes.
    #[arg(long, value_name = "N")]
    engine_workers: Option<usize>,
}

impl BackendArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            env_path: self.env_file,
            download_root: self.download_root,
            listen_host: self.host,
            listen_port: self.port,
            ytdlp_bin: self.ytdlp_bin,
            ffmpeg_bin: self.ffmpeg_bin,
            cleanup_delay_secs: self.cleanup_delay_secs,
            engine_workers: self.engine_workers,
        }
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServiceConfig>,
    engine: YtDlp,
    playlists: PlaylistPipeline,
    scheduler: CleanupScheduler,
}

impl AppState {
    fn new(config: ServiceConfig) -> Self {
        let config = Arc::new(config);
        let engine = YtDlp::from_config(&config);
        let scheduler = CleanupScheduler::new(config.cleanup_delay);
        let playlists =
            PlaylistPipeline::new(engine.clone(), config.download_root.clone(), scheduler.clone());
        Self {
            config,
            engine,
            playlists,
            scheduler,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "unexpected_error",
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(kind = err.kind(), error = %err, "request failed");
        } else {
            warn!(kind = err.kind(), error = %err, "request rejected");
        }
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind,
            "detail": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    quality: Option<String>,
}

impl DownloadQuery {
    fn quality(&self) -> QualitySpec {
        QualitySpec::parse(self.quality.as_deref().unwrap_or(DEFAULT_QUALITY))
    }
}

/// Rejects a missing or blank `url` before any engine work.
fn required_url(url: Option<&str>) -> ApiResult<&str> {
    url.map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("the url query parameter is required"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = BackendArgs::parse();
    let config = resolve_config(args.into_overrides())?;
    config.prepare()?;

    let host = config
        .listen_host
        .parse::<IpAddr>()
        .with_context(|| format!("invalid listen host {:?}", config.listen_host))?;
    let addr = SocketAddr::new(host, config.listen_port);

    info!(
        download_root = %config.download_root.display(),
        ytdlp = %config.ytdlp_bin.display(),
        workers = config.engine_workers,
        cleanup_delay_secs = config.cleanup_delay.as_secs(),
        "configuration resolved"
    );

    let state = AppState::new(config);
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    let flushed = state.scheduler.flush_pending().await;
    info!(flushed, "server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutdown requested");
}

fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.allowed_origins);
    Router::new()
        .route("/", get(index))
        .route("/details", get(details))
        .route("/download/video", get(download_video))
        .route("/download/audio", get(download_audio))
        .route("/download/playlist/video", get(download_playlist_video))
        .route("/download/playlist/audio", get(download_playlist_audio))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Exact-match origin allow-list; no credentials, any method or header.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    info!(origins = ?origins, "CORS allow-list loaded");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_credentials(false)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION, header::CONTENT_LENGTH])
}

async fn index() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ENDPOINTS,
    }))
}

async fn details(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<MediaDetails>> {
    let url = required_url(query.url.as_deref())?;
    Ok(Json(extract_details(&state.engine, url).await?))
}

async fn download_video(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let url = required_url(query.url.as_deref())?;
    single_item(&state, url, ContentKind::Video(query.quality())).await
}

async fn download_audio(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Response> {
    let url = required_url(query.url.as_deref())?;
    single_item(&state, url, ContentKind::Audio).await
}

async fn download_playlist_video(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let url = required_url(query.url.as_deref())?;
    playlist_archive(&state, url, ContentKind::Video(query.quality())).await
}

async fn download_playlist_audio(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Response> {
    let url = required_url(query.url.as_deref())?;
    playlist_archive(&state, url, ContentKind::Audio).await
}

async fn single_item(state: &AppState, url: &str, kind: ContentKind) -> ApiResult<Response> {
    let download = single::download(&state.engine, &state.config.download_root, url, kind).await?;
    attachment(
        download.file,
        download.len,
        download.mime_type,
        &download.filename,
        download.source,
    )
}

async fn playlist_archive(state: &AppState, url: &str, kind: ContentKind) -> ApiResult<Response> {
    let archive = state.playlists.run(url, kind).await?;
    attachment(archive.file, archive.len, ZIP_MIME, &archive.filename, archive.cleanup)
}

/// Streams `file` as a download. `guard` lives as long as the body, so its
/// drop marks the end of the transfer (or the client going away).
fn attachment<G>(file: File, len: u64, mime: &str, filename: &str, guard: G) -> ApiResult<Response>
where
    G: Send + 'static,
{
    let disposition = HeaderValue::from_str(&content_disposition(filename))
        .map_err(|err| ApiError::internal(format!("invalid download filename: {err}")))?;
    let content_type =
        HeaderValue::from_str(mime).map_err(|err| ApiError::internal(err.to_string()))?;

    let body = stream! {
        let _guard = guard;
        let mut chunks = ReaderStream::new(file);
        while let Some(chunk) = chunks.next().await {
            yield chunk;
        }
    };

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, http::Request};
    use std::{fs, io::Cursor, path::Path};
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    const STUB: &str = r#"#!/usr/bin/env bash
set -eu
printf '%s\n' "$*" >> "$(dirname "$0")/calls.log"
all="$*"
output=""
url=""
ext=mp4
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o) shift; output="$1" ;;
    -x) ext=mp3 ;;
    --) shift; url="$1" ;;
  esac
  shift || true
done
if [[ "$url" == *FAIL* ]]; then
  echo "ERROR: Private video" >&2
  exit 1
fi
case "$all" in
  *--flat-playlist*)
    if [[ "$url" == *playlist* ]]; then
      echo '{"title":"Road: Trip?","id":"PLxyz","entries":[{"id":"a1","title":"First Song"},null]}'
    else
      echo '{"id":"abc123","title":"Stub Title","duration":212,"uploader":"Stub Channel"}'
    fi
    ;;
  *--yes-playlist*)
    echo "first" > "$(dirname "$output")/First Song.$ext"
    ;;
  *--no-simulate*)
    target="$(printf '%s' "$output" | sed -e 's/%(title)s/Stub Title/' -e "s/%(ext)s/$ext/")"
    echo "media-bytes" > "$target"
    printf '{"title":"Stub: Title!","requested_downloads":[{"filepath":"%s"}]}\n' "$target"
    ;;
esac
"#;

    struct TestContext {
        bin: TempDir,
        root: TempDir,
        state: AppState,
    }

    impl TestContext {
        fn new() -> Self {
            let bin = tempdir().unwrap();
            let root = tempdir().unwrap();
            let script = bin.path().join("yt-dlp");
            fs::write(&script, STUB).unwrap();
            #[cfg(unix)]
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

            let config = ServiceConfig {
                download_root: root.path().to_path_buf(),
                ytdlp_bin: script,
                engine_workers: 2,
                ..ServiceConfig::default()
            };
            Self {
                bin,
                root,
                state: AppState::new(config),
            }
        }

        fn calls(&self) -> String {
            fs::read_to_string(self.bin.path().join("calls.log")).unwrap_or_default()
        }

        async fn get(&self, uri: &str) -> Response {
            self.request(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
        }

        async fn request(&self, request: Request<Body>) -> Response {
            build_router(self.state.clone()).oneshot(request).await.unwrap()
        }
    }

    fn with_url(path: &str, url: &str) -> String {
        format!("{path}?url={}", urlencoding::encode(url))
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    fn is_empty_dir(path: &Path) -> bool {
        fs::read_dir(path).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let ctx = TestContext::new();
        let response = ctx.get("/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["service"], "yanktube");
        assert_eq!(body["endpoints"].as_array().unwrap().len(), ENDPOINTS.len());
    }

    #[tokio::test]
    async fn details_treats_watch_in_playlist_as_video() {
        let ctx = TestContext::new();
        let uri = with_url("/details", "https://example.com/watch?v=abc123&list=PLxyz");
        let response = ctx.get(&uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["type"], "video");
        assert_eq!(body["id"], "abc123");
        assert!(ctx.calls().contains("-- https://example.com/watch?v=abc123\n"));
    }

    #[tokio::test]
    async fn details_returns_playlist_summary() {
        let ctx = TestContext::new();
        let uri = with_url("/details", "https://example.com/playlist?list=PLxyz");
        let body = json_body(ctx.get(&uri).await).await;
        assert_eq!(body["type"], "playlist");
        assert_eq!(body["playlist_name"], "Road: Trip?");
        assert_eq!(body["videos"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extraction_failure_is_a_400() {
        let ctx = TestContext::new();
        let uri = with_url("/details", "https://example.com/watch?v=FAIL");
        let response = ctx.get(&uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "extraction_error");
        assert!(body["detail"].as_str().unwrap().contains("Private video"));
    }

    #[tokio::test]
    async fn blank_url_is_rejected_without_engine_call() {
        let ctx = TestContext::new();
        for uri in ["/details?url=%20%20", "/download/audio", "/download/playlist/video?url="] {
            let response = ctx.get(uri).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
        assert!(ctx.calls().is_empty());
    }

    #[tokio::test]
    async fn video_download_streams_file_then_deletes_it() {
        let ctx = TestContext::new();
        let uri = format!(
            "{}&quality=99999p",
            with_url("/download/video", "https://example.com/watch?v=abc123")
        );
        let response = ctx.get(&uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), "12");
        assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-store");
        assert!(header_str(&response, header::CONTENT_DISPOSITION).contains("filename=\"Stub Title.mp4\""));
        assert!(ctx.calls().contains("height<=4320"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"media-bytes\n");
        assert!(is_empty_dir(ctx.root.path()));
    }

    #[tokio::test]
    async fn audio_download_is_labelled_mp3() {
        let ctx = TestContext::new();
        let uri = with_url("/download/audio", "https://example.com/watch?v=abc123");
        let response = ctx.get(&uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "audio/mpeg");
        assert!(header_str(&response, header::CONTENT_DISPOSITION).contains("Stub Title.mp3"));
    }

    #[tokio::test]
    async fn playlist_download_streams_zip_and_defers_cleanup() {
        let ctx = TestContext::new();
        let uri = with_url("/download/playlist/audio", "https://example.com/playlist?list=PLxyz");
        let response = ctx.get(&uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "application/zip");
        assert!(
            header_str(&response, header::CONTENT_DISPOSITION).contains("filename=\"Road Trip_audio.zip\"")
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(body.to_vec())).unwrap();
        assert_eq!(archive.file_names().collect::<Vec<_>>(), vec!["First Song.mp3"]);

        assert_eq!(ctx.state.scheduler.pending(), 1);
        assert!(!is_empty_dir(ctx.root.path()));
        assert_eq!(ctx.state.scheduler.flush_pending().await, 1);
        assert!(is_empty_dir(ctx.root.path()));
    }

    #[tokio::test]
    async fn cors_allows_only_configured_origins() {
        let ctx = TestContext::new();
        let allowed = ctx
            .request(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(
            header_str(&allowed, header::ACCESS_CONTROL_ALLOW_ORIGIN),
            "http://localhost:5173"
        );
        let exposed = header_str(&allowed, header::ACCESS_CONTROL_EXPOSE_HEADERS).to_ascii_lowercase();
        assert!(exposed.contains("content-disposition"));
        assert!(exposed.contains("content-length"));
        assert!(allowed.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());

        let denied = ctx
            .request(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "http://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert!(denied.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn cli_flags_become_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--port",
            "9000",
            "--download-root",
            "/srv/dl",
            "--engine-workers",
            "8",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.listen_port, Some(9000));
        assert_eq!(overrides.download_root, Some(PathBuf::from("/srv/dl")));
        assert_eq!(overrides.engine_workers, Some(8));
        assert!(overrides.env_path.is_none());
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::bad_request("missing").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "bad_request");
        assert_eq!(body["detail"], "missing");
    }
}
