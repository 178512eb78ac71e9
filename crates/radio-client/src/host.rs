//! The player capability driven by `PlaybackSession`.
//!
//! The session is the only caller.  Player-side notifications come back as
//! `HostEvent`s on an mpsc channel handed to the host at construction, each
//! tagged with the generation of the media item it concerns so that events
//! from a superseded item can be discarded.

use async_trait::async_trait;
use radio_proto::protocol::Track;

use crate::error::HostError;

/// Monotonic id of one `start`.  0 means "nothing started yet".
pub type Generation = u64;

/// Display metadata attached to the live item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub artwork_url: String,
}

impl From<&Track> for ItemMetadata {
    fn from(track: &Track) -> Self {
        Self {
            title: track.title.clone(),
            artist: track.artist.clone(),
            album: track.album.clone(),
            artwork_url: track.art_url.clone(),
        }
    }
}

impl ItemMetadata {
    /// Single line used where the player only has one title slot.
    pub fn display_title(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub url: String,
    pub metadata: ItemMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEventKind {
    /// Player status changed.
    Status { playing: bool, buffering: bool },
    /// Player failed.  Message is shown to the user as-is.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    pub generation: Generation,
    pub kind: HostEventKind,
}

impl HostEvent {
    pub fn playing(generation: Generation) -> Self {
        Self {
            generation,
            kind: HostEventKind::Status {
                playing: true,
                buffering: false,
            },
        }
    }

    pub fn buffering(generation: Generation) -> Self {
        Self {
            generation,
            kind: HostEventKind::Status {
                playing: false,
                buffering: true,
            },
        }
    }

    pub fn stopped(generation: Generation) -> Self {
        Self {
            generation,
            kind: HostEventKind::Status {
                playing: false,
                buffering: false,
            },
        }
    }

    pub fn error(generation: Generation, message: impl Into<String>) -> Self {
        Self {
            generation,
            kind: HostEventKind::Error(message.into()),
        }
    }
}

#[async_trait]
pub trait SessionHost: Send {
    /// Replace the current item.  Events for this item carry `generation`.
    async fn set_media_item(
        &mut self,
        generation: Generation,
        item: MediaItem,
    ) -> Result<(), HostError>;
    async fn prepare(&mut self) -> Result<(), HostError>;
    async fn play(&mut self) -> Result<(), HostError>;
    async fn pause(&mut self) -> Result<(), HostError>;
    /// Drop the current item, if any.
    async fn stop(&mut self) -> Result<(), HostError>;
    /// Update display metadata without interrupting audio.
    async fn replace_current_item_metadata(
        &mut self,
        metadata: ItemMetadata,
    ) -> Result<(), HostError>;
    /// Release the underlying player resource.  Called once at teardown.
    async fn release(&mut self);
}
