use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::quality::QualityLevel;

/// Playback state as published by the session.
///
/// Transitions:
///   Idle -> Loading -> Playing -> Paused -> Loading ...
///   any -> Error(msg) -> (explicit reconnect / toggle / quality change) -> Loading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum PlaybackState {
    /// Nothing loaded yet, or reset by a reconnect.
    #[default]
    Idle,
    /// Media item built, waiting for the player to report audio.
    Loading,
    /// Audio flowing.
    Playing,
    /// Paused by the user or by the player's own controls.
    Paused,
    /// Player reported a failure.  Not retried until the user acts.
    Error(String),
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, PlaybackState::Loading)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            PlaybackState::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Short label for log lines and status displays.
    pub fn label(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Loading => "loading",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Error(_) => "error",
        }
    }
}

/// What is on air right now, after fallbacks have been applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Track {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub art_url: String,
}

/// Listener counters reported by the metadata endpoint.  Informational only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListenerSnapshot {
    pub current: u32,
    pub total: u32,
    pub unique: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LiveStatus {
    pub is_live: bool,
    /// Only meaningful while `is_live` is true.
    pub streamer_name: String,
}

impl LiveStatus {
    pub fn streamer(&self) -> Option<&str> {
        if self.is_live && !self.streamer_name.is_empty() {
            Some(&self.streamer_name)
        } else {
            None
        }
    }
}

/// One decoded now-playing document.
///
/// `track` and `listeners` are `None` when the document did not carry them,
/// so the consumer can keep what it had.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NowPlaying {
    pub track: Option<Track>,
    pub listeners: Option<ListenerSnapshot>,
    pub live: LiveStatus,
    pub station_name: Option<String>,
}

/// The poller's published view.  Replaced wholesale on every successful poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetadataSnapshot {
    pub track: Option<Track>,
    pub listeners: Option<ListenerSnapshot>,
    pub live: LiveStatus,
    pub updated_at: Option<DateTime<Local>>,
}

impl MetadataSnapshot {
    /// Merge a fresh document into the previous snapshot.  Fields the
    /// document did not carry keep their previous value.
    pub fn merged(&self, now_playing: NowPlaying, at: DateTime<Local>) -> Self {
        Self {
            track: now_playing.track.or_else(|| self.track.clone()),
            listeners: now_playing.listeners.or(self.listeners),
            live: now_playing.live,
            updated_at: Some(at),
        }
    }
}

/// Session view served to the control surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    pub state: PlaybackState,
    pub is_playing: bool,
    pub is_loading: bool,
    pub error_message: Option<String>,
    pub quality: QualityLevel,
    pub track: Option<Track>,
    pub generation: u64,
}

impl SessionStatus {
    pub fn new(
        state: PlaybackState,
        quality: QualityLevel,
        track: Option<Track>,
        generation: u64,
    ) -> Self {
        Self {
            is_playing: state.is_playing(),
            is_loading: state.is_loading(),
            error_message: state.error_message().map(str::to_string),
            state,
            quality,
            track,
            generation,
        }
    }
}
