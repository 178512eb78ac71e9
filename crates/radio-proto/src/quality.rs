use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::StreamsConfig;

/// Stream bitrate selection.  One URL per level, picked by the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    #[default]
    High,
    Mid,
    Low,
}

impl QualityLevel {
    pub const ALL: [QualityLevel; 3] = [QualityLevel::High, QualityLevel::Mid, QualityLevel::Low];

    /// Human label shown next to the selector.
    pub fn label(&self) -> &'static str {
        match self {
            QualityLevel::High => "HiFi",
            QualityLevel::Mid => "MidFi",
            QualityLevel::Low => "LoFi",
        }
    }

    pub fn bitrate(&self) -> &'static str {
        match self {
            QualityLevel::High => "352k",
            QualityLevel::Mid => "211k",
            QualityLevel::Low => "141k",
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.bitrate())
    }
}

impl FromStr for QualityLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "hifi" => Ok(QualityLevel::High),
            "mid" | "midfi" => Ok(QualityLevel::Mid),
            "low" | "lofi" => Ok(QualityLevel::Low),
            other => anyhow::bail!("unknown quality level '{}'", other),
        }
    }
}

/// Immutable quality → stream URL lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpointTable {
    high: String,
    mid: String,
    low: String,
}

impl StreamEndpointTable {
    pub fn new(high: impl Into<String>, mid: impl Into<String>, low: impl Into<String>) -> Self {
        Self {
            high: high.into(),
            mid: mid.into(),
            low: low.into(),
        }
    }

    pub fn from_config(streams: &StreamsConfig) -> Self {
        Self::new(&streams.high_url, &streams.mid_url, &streams.low_url)
    }

    pub fn url(&self, level: QualityLevel) -> &str {
        match level {
            QualityLevel::High => &self.high,
            QualityLevel::Mid => &self.mid,
            QualityLevel::Low => &self.low,
        }
    }

    /// All levels with their URL, in selector order.
    pub fn entries(&self) -> impl Iterator<Item = (QualityLevel, &str)> + '_ {
        QualityLevel::ALL.into_iter().map(move |q| (q, self.url(q)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!("high".parse::<QualityLevel>().unwrap(), QualityLevel::High);
        assert_eq!("MidFi".parse::<QualityLevel>().unwrap(), QualityLevel::Mid);
        assert_eq!(" LOW ".parse::<QualityLevel>().unwrap(), QualityLevel::Low);
        assert!("ultra".parse::<QualityLevel>().is_err());
    }

    #[test]
    fn test_default_is_high() {
        assert_eq!(QualityLevel::default(), QualityLevel::High);
        assert_eq!(QualityLevel::High.to_string(), "HiFi (352k)");
    }

    #[test]
    fn test_table_lookup() {
        let table = StreamEndpointTable::from_config(&StreamsConfig::default());
        assert!(table.url(QualityLevel::High).ends_with("aac_hifi.m3u8"));
        assert!(table.url(QualityLevel::Mid).ends_with("aac_midfi.m3u8"));
        assert!(table.url(QualityLevel::Low).ends_with("aac_lofi.m3u8"));

        let levels: Vec<_> = table.entries().map(|(q, _)| q).collect();
        assert_eq!(levels, QualityLevel::ALL.to_vec());
    }
}
