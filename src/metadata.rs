//! Metadata lookups against the engine in flat, no-download mode.
//!
//! The structs here are the JSON shapes returned by `GET /details`. Every
//! field is optional because the engine may omit any of them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use tracing::debug;

use crate::{
    engine::{EngineOptions, YtDlp},
    error::{ServiceError, ServiceResult},
    media_url::{MediaKind, MediaReference},
};

/// Read-only projection of one video as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub title: Option<String>,
    #[serde(rename = "duration")]
    pub duration_seconds: Option<Number>,
    pub uploader: Option<String>,
    #[serde(rename = "id")]
    pub external_id: Option<String>,
}

/// A playlist and its members in native order. Entries the engine reported
/// as null are dropped, never replaced with placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSummary {
    #[serde(rename = "playlist_name")]
    pub name: Option<String>,
    #[serde(rename = "playlist_id")]
    pub external_id: Option<String>,
    #[serde(rename = "videos")]
    pub items: Vec<VideoSummary>,
}

/// Response body of `GET /details`, tagged with `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaDetails {
    Video(VideoSummary),
    Playlist(PlaylistSummary),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        match self {
            OneOrMany::One(value) => Box::new(std::iter::once(value)),
            OneOrMany::Many(values) => Box::new(values.iter()),
        }
    }
}

/// Subset of an engine info dict shared by videos and playlist entries.
#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    duration: Option<Number>,
    uploader: Option<OneOrMany<String>>,
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default)]
    entries: Option<Vec<Option<RawInfo>>>,
}

impl RawInfo {
    fn uploader(&self) -> Option<String> {
        let names = self
            .uploader
            .as_ref()?
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>();
        if names.is_empty() {
            None
        } else {
            Some(names.join(", "))
        }
    }

    fn into_video(self) -> VideoSummary {
        VideoSummary {
            uploader: self.uploader(),
            title: self.title,
            duration_seconds: self.duration,
            external_id: self.id,
        }
    }

    fn into_playlist(self) -> PlaylistSummary {
        let items = self
            .entries
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .map(RawInfo::into_video)
            .collect();
        PlaylistSummary {
            name: self.title,
            external_id: self.id,
            items,
        }
    }
}

/// Accepts strings as-is and renders numbers or booleans as text. Extractors
/// disagree on whether ids are numeric.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

fn parse_info(value: Value) -> ServiceResult<RawInfo> {
    serde_json::from_value(value)
        .map_err(|err| ServiceError::Unexpected(format!("unexpected engine metadata: {err}")))
}

pub fn video_from_json(value: Value) -> ServiceResult<VideoSummary> {
    Ok(parse_info(value)?.into_video())
}

pub fn playlist_from_json(value: Value) -> ServiceResult<PlaylistSummary> {
    Ok(parse_info(value)?.into_playlist())
}

async fn extract(engine: &YtDlp, url: &str) -> ServiceResult<Value> {
    engine
        .run_json(url, &EngineOptions::metadata())
        .await
        .map_err(ServiceError::from_extraction)
}

pub async fn extract_video(engine: &YtDlp, url: &str) -> ServiceResult<VideoSummary> {
    let summary = video_from_json(extract(engine, url).await?)?;
    debug!(%url, id = ?summary.external_id, "resolved video metadata");
    Ok(summary)
}

pub async fn extract_playlist(engine: &YtDlp, url: &str) -> ServiceResult<PlaylistSummary> {
    let summary = playlist_from_json(extract(engine, url).await?)?;
    debug!(%url, items = summary.items.len(), "resolved playlist metadata");
    Ok(summary)
}

/// Classifies `raw_url` and fetches the matching summary.
pub async fn extract_details(engine: &YtDlp, raw_url: &str) -> ServiceResult<MediaDetails> {
    let reference = MediaReference::classify(raw_url);
    match reference.kind {
        MediaKind::Playlist => Ok(MediaDetails::Playlist(
            extract_playlist(engine, &reference.canonical_url).await?,
        )),
        MediaKind::Video => Ok(MediaDetails::Video(
            extract_video(engine, &reference.canonical_url).await?,
        )),
    }
}
