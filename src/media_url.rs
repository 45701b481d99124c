//! Classifies a user-supplied URL as a single video or a playlist and strips
//! playlist-tracking parameters from watch links. Pure string work; no I/O.

use serde::Serialize;
use url::Url;

const PLAYLIST_PATH: &str = "/playlist";
const WATCH_PATH: &str = "/watch";
const PLAYLIST_ID_PARAM: &str = "list";
const VIDEO_ID_PARAM: &str = "v";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Playlist,
}

/// Immutable result of classifying one request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaReference {
    pub kind: MediaKind,
    pub canonical_url: String,
}

impl MediaReference {
    /// First matching rule wins:
    /// 1. `/playlist…` with a `list` id → playlist, URL untouched.
    /// 2. `/watch…` with a `v` id → video, URL rebuilt with only `v`.
    /// 3. anything else → video, URL untouched.
    pub fn classify(raw: &str) -> Self {
        let Ok(mut parsed) = Url::parse(raw.trim()) else {
            return Self::video(raw.trim());
        };

        let path = parsed.path().to_string();
        if path.starts_with(PLAYLIST_PATH) && first_param(&parsed, PLAYLIST_ID_PARAM).is_some() {
            return Self {
                kind: MediaKind::Playlist,
                canonical_url: raw.trim().to_string(),
            };
        }

        if path.starts_with(WATCH_PATH)
            && let Some(video_id) = first_param(&parsed, VIDEO_ID_PARAM)
        {
            parsed
                .query_pairs_mut()
                .clear()
                .append_pair(VIDEO_ID_PARAM, &video_id);
            return Self::video(parsed.as_str());
        }

        Self::video(raw.trim())
    }

    fn video(url: &str) -> Self {
        Self {
            kind: MediaKind::Video,
            canonical_url: url.to_string(),
        }
    }
}

/// First non-blank value of `key`; later duplicates are ignored.
fn first_param(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .filter(|(name, value)| name == key && !value.is_empty())
        .map(|(_, value)| value.into_owned())
        .next()
}
