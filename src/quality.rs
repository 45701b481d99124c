//! Parsing of the `quality` query parameter into a vertical-resolution cap.

use std::{fmt, num::IntErrorKind};

pub const MIN_HEIGHT: u32 = 144;
pub const MAX_HEIGHT: u32 = 4320;
pub const DEFAULT_HEIGHT: u32 = 720;

/// Target vertical resolution, always within `[MIN_HEIGHT, MAX_HEIGHT]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualitySpec(u32);

impl QualitySpec {
    /// Parses strings such as `"720p"` or `"1080"`. Out-of-range numbers are
    /// clamped and anything unparsable yields the default; this never fails.
    pub fn parse(raw: &str) -> Self {
        let digits = raw.trim().trim_end_matches(['p', 'P']);
        match digits.parse::<i64>() {
            Ok(value) => Self(value.clamp(MIN_HEIGHT as i64, MAX_HEIGHT as i64) as u32),
            Err(err) => match err.kind() {
                IntErrorKind::PosOverflow => Self(MAX_HEIGHT),
                IntErrorKind::NegOverflow => Self(MIN_HEIGHT),
                _ => Self::default(),
            },
        }
    }

    pub fn height(self) -> u32 {
        self.0
    }
}

impl Default for QualitySpec {
    fn default() -> Self {
        Self(DEFAULT_HEIGHT)
    }
}

impl fmt::Display for QualitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}p", self.0)
    }
}
