/// Now-playing metadata poller.
///
/// One loop per poller: fetch, publish, sleep, repeat.  A fetch is never
/// started while another is in flight.  Failed polls leave the published
/// snapshot exactly as it was; the next tick simply tries again.
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use radio_proto::config::{MetadataConfig, StationConfig};
use radio_proto::nowplaying::{parse_now_playing, TrackFallbacks};
use radio_proto::protocol::{MetadataSnapshot, NowPlaying};
use reqwest::Client;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;

#[derive(Clone)]
pub struct MetadataPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    client: Client,
    url: String,
    interval: Duration,
    fallbacks: TrackFallbacks,
    station_name: String,
    web_url: String,
    snapshot_tx: watch::Sender<MetadataSnapshot>,
    /// Token of the running loop, if any.
    running: Mutex<Option<CancellationToken>>,
}

impl MetadataPoller {
    pub fn from_config(config: &MetadataConfig, station: &StationConfig) -> anyhow::Result<Self> {
        Self::new(
            config.url.clone(),
            Duration::from_secs(config.poll_interval_secs.max(1)),
            Duration::from_secs(config.timeout_secs.max(1)),
            station,
        )
    }

    pub fn new(
        url: String,
        interval: Duration,
        timeout: Duration,
        station: &StationConfig,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let (snapshot_tx, _) = watch::channel(MetadataSnapshot::default());
        Ok(Self {
            inner: Arc::new(PollerInner {
                client,
                url,
                interval,
                fallbacks: TrackFallbacks::from_station(station),
                station_name: station.name.clone(),
                web_url: station.web_url.clone(),
                snapshot_tx,
                running: Mutex::new(None),
            }),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<MetadataSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> MetadataSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// One GET + decode.  Does not touch the published snapshot.
    pub async fn fetch_once(&self) -> Result<NowPlaying, FetchError> {
        let inner = &self.inner;
        let response = inner.client.get(&inner.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let body = response.text().await?;
        parse_now_playing(&body, &inner.fallbacks).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Fetch and merge into the snapshot.  Returns whether the snapshot was
    /// replaced; failures are logged and otherwise ignored.
    pub async fn poll_once(&self) -> bool {
        match self.fetch_once().await {
            Ok(now_playing) => {
                if let Some(name) = &now_playing.station_name {
                    debug!("metadata: station reports name '{}'", name);
                }
                let next = self
                    .inner
                    .snapshot_tx
                    .borrow()
                    .merged(now_playing, Local::now());
                if let Some(track) = &next.track {
                    debug!("metadata: {} - {}", track.artist, track.title);
                }
                self.inner.snapshot_tx.send_replace(next);
                true
            }
            Err(FetchError::Decode(e)) => {
                warn!("metadata: ignoring undecodable response: {}", e);
                false
            }
            Err(e) => {
                debug!("metadata: poll failed: {}", e);
                false
            }
        }
    }

    /// Start the poll loop.  No-op while it is already running.
    pub async fn start_polling(&self) {
        let mut running = self.inner.running.lock().await;
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            debug!("metadata: poller already running");
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());
        info!(
            "metadata: polling {} every {:?}",
            self.inner.url, self.inner.interval
        );
        tokio::spawn(poll_loop(self.clone(), token));
    }

    pub async fn stop_polling(&self) {
        if let Some(token) = self.inner.running.lock().await.take() {
            token.cancel();
            info!("metadata: polling stopped");
        }
    }

    pub async fn is_polling(&self) -> bool {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Text for the share action, built from the latest snapshot.
    pub fn share_text(&self) -> String {
        let snapshot = self.inner.snapshot_tx.borrow();
        let inner = &self.inner;
        match &snapshot.track {
            Some(track) => format!(
                "Listening to {} by {} on {}! {}",
                track.title, track.artist, inner.station_name, inner.web_url
            ),
            None => format!("Listening to {}! {}", inner.station_name, inner.web_url),
        }
    }
}

async fn poll_loop(poller: MetadataPoller, token: CancellationToken) {
    let interval = poller.inner.interval;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = poller.poll_once() => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("metadata: poll loop exited");
}
