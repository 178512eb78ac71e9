//! Tolerant decoder for the now-playing document.
//!
//! The endpoint is not under our control, so nothing in the document is
//! trusted: missing keys, nulls and wrong types all fall back to defaults.
//! Only a body that is not a JSON object counts as a failure.
//!
//! ```text
//! { "now_playing": { "song": { "title", "artist", "album", "art" } },
//!   "listeners":   { "current", "total", "unique" },
//!   "live":        { "is_live", "streamer_name" },
//!   "station":     { "name" } }
//! ```

use serde_json::Value;

use crate::config::StationConfig;
use crate::protocol::{ListenerSnapshot, LiveStatus, NowPlaying, Track};

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Values substituted for empty song fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFallbacks {
    pub title: String,
    pub art_url: String,
}

impl TrackFallbacks {
    pub fn from_station(station: &StationConfig) -> Self {
        Self {
            title: station.name.clone(),
            art_url: station.default_art_url.clone(),
        }
    }
}

pub fn parse_now_playing(body: &str, fallbacks: &TrackFallbacks) -> anyhow::Result<NowPlaying> {
    let json: Value = serde_json::from_str(body)?;
    decode_now_playing(&json, fallbacks)
        .ok_or_else(|| anyhow::anyhow!("now-playing document is not a JSON object"))
}

pub fn decode_now_playing(json: &Value, fallbacks: &TrackFallbacks) -> Option<NowPlaying> {
    if !json.is_object() {
        return None;
    }

    let song = &json["now_playing"]["song"];
    let track = song.is_object().then(|| decode_track(song, fallbacks));

    let listeners = json["listeners"]
        .is_object()
        .then(|| decode_listeners(&json["listeners"]));

    let live = LiveStatus {
        is_live: json["live"]["is_live"].as_bool().unwrap_or(false),
        streamer_name: text(&json["live"]["streamer_name"]).unwrap_or_default(),
    };

    Some(NowPlaying {
        track,
        listeners,
        live,
        station_name: text(&json["station"]["name"]),
    })
}

fn decode_track(song: &Value, fallbacks: &TrackFallbacks) -> Track {
    Track {
        title: text(&song["title"]).unwrap_or_else(|| fallbacks.title.clone()),
        artist: text(&song["artist"]).unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
        album: text(&song["album"]).unwrap_or_default(),
        art_url: text(&song["art"]).unwrap_or_else(|| fallbacks.art_url.clone()),
    }
}

fn decode_listeners(listeners: &Value) -> ListenerSnapshot {
    ListenerSnapshot {
        current: count(&listeners["current"]),
        total: count(&listeners["total"]),
        unique: count(&listeners["unique"]),
    }
}

/// Non-empty string value, kept as sent.
fn text(v: &Value) -> Option<String> {
    v.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

/// Non-negative counter.  Floats are truncated, numeric strings accepted,
/// anything else is 0.
fn count(v: &Value) -> u32 {
    let n = match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    n.clamp(0, u32::MAX as i64) as u32
}
