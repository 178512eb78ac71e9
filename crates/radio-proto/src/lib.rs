pub mod config;
pub mod nowplaying;
pub mod platform;
pub mod protocol;
pub mod quality;
pub mod schedule;
