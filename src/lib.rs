#![forbid(unsafe_code)]

//! Core of the YankTube download service.
//!
//! The HTTP surface lives in `src/bin/backend.rs`; everything it calls into
//! (URL classification, the yt-dlp adapter, the single-item and playlist
//! pipelines, archive assembly and the deferred cleanup scheduler) lives here
//! so it can be exercised without a running server.

pub mod archive;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod media_url;
pub mod metadata;
pub mod playlist;
pub mod quality;
pub mod sanitize;
pub mod single;
