/// PlaybackSession: single-owner state machine for the live stream.
///
/// Runs as one task.  User intents arrive as `SessionCommand`s through a
/// `SessionHandle`; player notifications arrive as `HostEvent`s from the
/// `SessionHost`.  Nothing else touches the playback state, the selected
/// quality or the last known track.  Every change is published as a
/// `SessionStatus` on a `watch` channel.
///
/// Every `start` bumps the generation.  Host events carry the generation of
/// the media item they concern and anything older than the current one is
/// dropped, so a slow callback from a superseded start can never overwrite
/// the state of a newer one.
///
/// Player errors are terminal until the user (or a configured connectivity
/// recovery) asks again; there is no timed retry.
use radio_proto::config::{SessionConfig, StationConfig};
use radio_proto::protocol::{PlaybackState, SessionStatus, Track};
use radio_proto::quality::{QualityLevel, StreamEndpointTable};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::host::{Generation, HostEvent, HostEventKind, ItemMetadata, MediaItem, SessionHost};

// ── SessionCommand ────────────────────────────────────────────────────────────

/// All intents into the session loop.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    TogglePlayPause,
    /// Start with the given level, or the selected one.
    Start(Option<QualityLevel>),
    SetQuality(QualityLevel),
    UpdateMetadata(Track),
    Reconnect,
    /// Connectivity edge from the observer bridge.
    Connectivity(bool),
    Shutdown,
}

// ── SessionHandle ─────────────────────────────────────────────────────────────

/// Cloneable front door to the session task.  Never blocks on player I/O.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    status_rx: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn new(status_rx: watch::Receiver<SessionStatus>) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx, status_rx }, rx)
    }

    pub async fn send(&self, cmd: SessionCommand) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("session task gone"))
    }

    pub async fn toggle_play_pause(&self) -> anyhow::Result<()> {
        self.send(SessionCommand::TogglePlayPause).await
    }

    pub async fn set_quality(&self, level: QualityLevel) -> anyhow::Result<()> {
        self.send(SessionCommand::SetQuality(level)).await
    }

    pub async fn update_metadata(&self, track: Track) -> anyhow::Result<()> {
        self.send(SessionCommand::UpdateMetadata(track)).await
    }

    pub async fn reconnect(&self) -> anyhow::Result<()> {
        self.send(SessionCommand::Reconnect).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.send(SessionCommand::Shutdown).await
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }
}

// ── PlaybackSession ───────────────────────────────────────────────────────────

pub struct PlaybackSession<H: SessionHost> {
    host: H,
    endpoints: StreamEndpointTable,
    station: StationConfig,
    reconnect_on_recovery: bool,
    state: PlaybackState,
    quality: QualityLevel,
    last_track: Option<Track>,
    generation: Generation,
    /// Last connectivity value seen, `None` before the first one.
    online: Option<bool>,
    status_tx: watch::Sender<SessionStatus>,
}

impl<H: SessionHost> PlaybackSession<H> {
    pub fn new(
        host: H,
        endpoints: StreamEndpointTable,
        station: StationConfig,
        config: &SessionConfig,
        quality: QualityLevel,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::new(
            PlaybackState::Idle,
            quality,
            None,
            0,
        ));
        Self {
            host,
            endpoints,
            station,
            reconnect_on_recovery: config.reconnect_on_network_recovery,
            state: PlaybackState::Idle,
            quality,
            last_track: None,
            generation: 0,
            online: None,
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    #[cfg(test)]
    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    #[cfg(test)]
    pub fn quality(&self) -> QualityLevel {
        self.quality
    }

    #[cfg(test)]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Run the session loop.  Returns on `Shutdown` or when every handle is
    /// gone; the host is released on the way out.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut host_events: mpsc::Receiver<HostEvent>,
    ) {
        info!("session: starting event loop");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None => {
                        info!("session: command channel closed, shutting down");
                        break;
                    }
                    Some(SessionCommand::Shutdown) => {
                        info!("session: shutdown requested");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = host_events.recv() => self.handle_host_event(event),
            }
        }
        self.release().await;
    }

    pub async fn handle_command(&mut self, cmd: SessionCommand) {
        debug!("session: command {:?}", cmd);
        match cmd {
            SessionCommand::TogglePlayPause => self.toggle_play_pause().await,
            SessionCommand::Start(quality) => {
                let quality = quality.unwrap_or(self.quality);
                self.start(quality, self.last_track.clone()).await
            }
            SessionCommand::SetQuality(level) => self.set_quality(level).await,
            SessionCommand::UpdateMetadata(track) => self.update_metadata(track).await,
            SessionCommand::Reconnect => self.reconnect().await,
            SessionCommand::Connectivity(online) => self.on_connectivity(online).await,
            SessionCommand::Shutdown => {}
        }
    }

    // ── operations ────────────────────────────────────────────────────────────

    pub async fn toggle_play_pause(&mut self) {
        if self.state.is_playing() {
            match self.host.pause().await {
                Ok(()) => self.set_state(PlaybackState::Paused),
                Err(e) => self.fail(e),
            }
        } else {
            self.start(self.quality, self.last_track.clone()).await;
        }
    }

    /// Tear down and rebuild the media item.  There is no hot swap: a new
    /// level always means a new item from the live edge.
    pub async fn start(&mut self, quality: QualityLevel, fallback: Option<Track>) {
        self.generation += 1;
        self.quality = quality;
        let generation = self.generation;
        self.set_state(PlaybackState::Loading);

        let item = self.media_item(quality, fallback.as_ref());
        info!(
            "session: start gen={} quality={} url={}",
            generation, quality, item.url
        );
        if let Err(e) = self.load(generation, item).await {
            self.fail(e);
        }
    }

    pub async fn set_quality(&mut self, level: QualityLevel) {
        let active = matches!(
            self.state,
            PlaybackState::Playing | PlaybackState::Loading | PlaybackState::Error(_)
        );
        info!("session: quality {} → {} (active={})", self.quality, level, active);
        self.quality = level;
        if active {
            self.start(level, self.last_track.clone()).await;
        } else {
            self.publish();
        }
    }

    pub async fn update_metadata(&mut self, track: Track) {
        let metadata = ItemMetadata::from(&track);
        self.last_track = Some(track);
        if self.state.is_playing() {
            debug!("session: metadata → {}", metadata.display_title());
            if let Err(e) = self.host.replace_current_item_metadata(metadata).await {
                warn!("session: metadata update failed: {}", e);
            }
        }
        self.publish();
    }

    pub async fn reconnect(&mut self) {
        info!("session: reconnect from {}", self.state.label());
        self.set_state(PlaybackState::Idle);
        self.start(self.quality, self.last_track.clone()).await;
    }

    /// Connectivity never moves the state by itself.  The only reaction is
    /// the opt-in reconnect of a failed session on an offline → online edge.
    pub async fn on_connectivity(&mut self, online: bool) {
        let previous = self.online.replace(online);
        if previous == Some(online) {
            return;
        }
        if !online {
            warn!(
                "session: connectivity lost while {}",
                self.state.label()
            );
            return;
        }
        info!("session: connectivity restored");
        if previous == Some(false)
            && self.reconnect_on_recovery
            && matches!(self.state, PlaybackState::Error(_))
        {
            self.reconnect().await;
        }
    }

    pub fn handle_host_event(&mut self, event: HostEvent) {
        if self.generation == 0 || event.generation != self.generation {
            debug!(
                "session: dropping stale event gen={} (current {}): {:?}",
                event.generation, self.generation, event.kind
            );
            return;
        }
        match event.kind {
            HostEventKind::Error(message) => {
                warn!("session: player error: {}", message);
                self.set_state(PlaybackState::Error(message));
            }
            HostEventKind::Status { playing, buffering } => {
                let next = match (&self.state, playing, buffering) {
                    (PlaybackState::Error(_), _, _) => None,
                    (_, true, _) => Some(PlaybackState::Playing),
                    (PlaybackState::Playing, false, true) => Some(PlaybackState::Loading),
                    (PlaybackState::Playing, false, false) => Some(PlaybackState::Paused),
                    _ => None,
                };
                if let Some(next) = next {
                    if next != self.state {
                        self.set_state(next);
                    }
                }
            }
        }
    }

    pub async fn release(&mut self) {
        info!("session: releasing player");
        self.host.release().await;
    }

    // ── internals ─────────────────────────────────────────────────────────────

    async fn load(&mut self, generation: Generation, item: MediaItem) -> Result<(), HostError> {
        self.host.stop().await?;
        self.host.set_media_item(generation, item).await?;
        self.host.prepare().await?;
        self.host.play().await
    }

    fn media_item(&self, quality: QualityLevel, fallback: Option<&Track>) -> MediaItem {
        let metadata = match fallback {
            Some(track) => ItemMetadata::from(track),
            None => ItemMetadata {
                title: self.station.name.clone(),
                artist: self.station.tagline.clone(),
                album: String::new(),
                artwork_url: self.station.logo_url.clone(),
            },
        };
        MediaItem {
            url: self.endpoints.url(quality).to_string(),
            metadata,
        }
    }

    fn fail(&mut self, e: HostError) {
        warn!("session: player call failed: {}", e);
        self.set_state(PlaybackState::Error(e.to_string()));
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            info!(
                "session: {} → {} (gen={})",
                self.state.label(),
                state.label(),
                self.generation
            );
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(SessionStatus::new(
            self.state.clone(),
            self.quality,
            self.last_track.clone(),
            self.generation,
        ));
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        SetItem(Generation, MediaItem),
        Prepare,
        Play,
        Pause,
        Stop,
        ReplaceMetadata(ItemMetadata),
        Release,
    }

    /// Records every call.  `fail_play` makes `play()` fail once.
    #[derive(Clone, Default)]
    pub(crate) struct FakeHost {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub fail_play: Arc<Mutex<Option<String>>>,
        /// When set, the published state is captured on every set_media_item.
        pub watch: Arc<Mutex<Option<watch::Receiver<SessionStatus>>>>,
        pub seen_on_set_item: Arc<Mutex<Vec<PlaybackState>>>,
    }

    impl FakeHost {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn last_url(&self) -> Option<String> {
            self.calls().into_iter().rev().find_map(|c| match c {
                Call::SetItem(_, item) => Some(item.url),
                _ => None,
            })
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl SessionHost for FakeHost {
        async fn set_media_item(
            &mut self,
            generation: Generation,
            item: MediaItem,
        ) -> Result<(), HostError> {
            if let Some(rx) = self.watch.lock().unwrap().as_ref() {
                let state = rx.borrow().state.clone();
                self.seen_on_set_item.lock().unwrap().push(state);
            }
            self.record(Call::SetItem(generation, item));
            Ok(())
        }

        async fn prepare(&mut self) -> Result<(), HostError> {
            self.record(Call::Prepare);
            Ok(())
        }

        async fn play(&mut self) -> Result<(), HostError> {
            self.record(Call::Play);
            match self.fail_play.lock().unwrap().take() {
                Some(msg) => Err(HostError::Ipc(msg)),
                None => Ok(()),
            }
        }

        async fn pause(&mut self) -> Result<(), HostError> {
            self.record(Call::Pause);
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), HostError> {
            self.record(Call::Stop);
            Ok(())
        }

        async fn replace_current_item_metadata(
            &mut self,
            metadata: ItemMetadata,
        ) -> Result<(), HostError> {
            self.record(Call::ReplaceMetadata(metadata));
            Ok(())
        }

        async fn release(&mut self) {
            self.record(Call::Release);
        }
    }

    fn endpoints() -> StreamEndpointTable {
        StreamEndpointTable::new("http://s/high", "http://s/mid", "http://s/low")
    }

    fn session_with(config: SessionConfig) -> (PlaybackSession<FakeHost>, FakeHost) {
        let host = FakeHost::default();
        let session = PlaybackSession::new(
            host.clone(),
            endpoints(),
            StationConfig::default(),
            &config,
            QualityLevel::High,
        );
        (session, host)
    }

    fn session() -> (PlaybackSession<FakeHost>, FakeHost) {
        session_with(SessionConfig::default())
    }

    fn track(title: &str) -> Track {
        Track {
            title: title.into(),
            artist: "Artist".into(),
            album: "Album".into(),
            art_url: "http://art".into(),
        }
    }

    async fn playing() -> (PlaybackSession<FakeHost>, FakeHost) {
        let (mut s, host) = session();
        s.start(QualityLevel::High, None).await;
        s.handle_host_event(HostEvent::playing(s.generation()));
        assert_eq!(*s.state(), PlaybackState::Playing);
        (s, host)
    }

    #[tokio::test]
    async fn test_start_sets_loading_before_host_io() {
        let (mut s, host) = session();
        *host.watch.lock().unwrap() = Some(s.subscribe());
        s.start(QualityLevel::Mid, None).await;

        assert_eq!(
            *host.seen_on_set_item.lock().unwrap(),
            vec![PlaybackState::Loading]
        );
        assert_eq!(*s.state(), PlaybackState::Loading);
        let calls = host.calls();
        assert_eq!(calls[0], Call::Stop);
        assert!(matches!(&calls[1], Call::SetItem(1, item) if item.url == "http://s/mid"));
        assert_eq!(calls[2..], [Call::Prepare, Call::Play]);
    }

    #[tokio::test]
    async fn test_start_without_track_uses_station_identity() {
        let (mut s, host) = session();
        s.start(QualityLevel::High, None).await;
        let item = host
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::SetItem(_, item) => Some(item),
                _ => None,
            })
            .unwrap();
        let station = StationConfig::default();
        assert_eq!(item.metadata.title, station.name);
        assert_eq!(item.metadata.artist, station.tagline);
        assert_eq!(item.metadata.artwork_url, station.logo_url);
    }

    #[tokio::test]
    async fn test_superseded_start_is_discarded() {
        let (mut s, host) = session();
        s.start(QualityLevel::High, None).await;
        let first = s.generation();
        s.start(QualityLevel::Low, None).await;
        let second = s.generation();
        assert!(second > first);

        // late callbacks for the first start change nothing
        s.handle_host_event(HostEvent::playing(first));
        assert_eq!(*s.state(), PlaybackState::Loading);
        s.handle_host_event(HostEvent::error(first, "404"));
        assert_eq!(*s.state(), PlaybackState::Loading);

        s.handle_host_event(HostEvent::playing(second));
        assert_eq!(*s.state(), PlaybackState::Playing);
        assert_eq!(s.quality(), QualityLevel::Low);
        assert_eq!(host.last_url().as_deref(), Some("http://s/low"));
    }

    #[tokio::test]
    async fn test_toggle_round_trip() {
        let (mut s, host) = playing().await;

        s.toggle_play_pause().await;
        assert_eq!(*s.state(), PlaybackState::Paused);
        assert!(!s.state().is_playing());
        assert!(!s.state().is_loading());
        assert_eq!(s.state().error_message(), None);
        assert_eq!(host.calls().last(), Some(&Call::Pause));

        s.toggle_play_pause().await;
        assert_eq!(*s.state(), PlaybackState::Loading);
        s.handle_host_event(HostEvent::playing(s.generation()));
        assert!(s.state().is_playing());
    }

    #[tokio::test]
    async fn test_pause_echo_is_ignored() {
        let (mut s, _host) = playing().await;
        s.toggle_play_pause().await;
        s.handle_host_event(HostEvent::stopped(s.generation()));
        assert_eq!(*s.state(), PlaybackState::Paused);
    }

    #[tokio::test]
    async fn test_set_quality_while_idle_only_stores() {
        let (mut s, host) = session();
        let rx = s.subscribe();
        s.set_quality(QualityLevel::Low).await;

        assert_eq!(*s.state(), PlaybackState::Idle);
        assert_eq!(rx.borrow().state, PlaybackState::Idle);
        assert_eq!(rx.borrow().quality, QualityLevel::Low);
        assert!(host.calls().is_empty());

        s.toggle_play_pause().await;
        assert_eq!(host.last_url().as_deref(), Some("http://s/low"));
    }

    #[tokio::test]
    async fn test_set_quality_while_playing_restarts() {
        let (mut s, host) = playing().await;
        let before = s.generation();
        s.set_quality(QualityLevel::Mid).await;
        assert_eq!(*s.state(), PlaybackState::Loading);
        assert_eq!(s.generation(), before + 1);
        assert_eq!(host.last_url().as_deref(), Some("http://s/mid"));
    }

    #[tokio::test]
    async fn test_set_quality_while_paused_only_stores() {
        let (mut s, host) = playing().await;
        s.toggle_play_pause().await;
        let calls = host.calls().len();
        s.set_quality(QualityLevel::Low).await;
        assert_eq!(*s.state(), PlaybackState::Paused);
        assert_eq!(host.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_error_then_reconnect() {
        let (mut s, _host) = playing().await;
        let rx = s.subscribe();
        s.handle_host_event(HostEvent::error(s.generation(), "decoder failure"));
        assert_eq!(
            *s.state(),
            PlaybackState::Error("decoder failure".into())
        );
        assert_eq!(rx.borrow().error_message.as_deref(), Some("decoder failure"));

        // status noise after a failure does not clear it
        s.handle_host_event(HostEvent::playing(s.generation()));
        assert!(matches!(s.state(), PlaybackState::Error(_)));

        s.reconnect().await;
        assert_eq!(*s.state(), PlaybackState::Loading);
        s.handle_host_event(HostEvent::playing(s.generation()));
        assert_eq!(*s.state(), PlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_toggle_from_error_restarts() {
        let (mut s, _host) = playing().await;
        let generation = s.generation();
        s.handle_host_event(HostEvent::error(generation, "network"));
        s.toggle_play_pause().await;
        assert_eq!(*s.state(), PlaybackState::Loading);
        assert_eq!(s.generation(), generation + 1);
    }

    #[tokio::test]
    async fn test_host_call_failure_is_error() {
        let (mut s, host) = session();
        *host.fail_play.lock().unwrap() = Some("socket closed".into());
        s.start(QualityLevel::High, None).await;
        assert_eq!(
            s.state().error_message(),
            Some("player IPC error: socket closed")
        );
    }

    #[tokio::test]
    async fn test_metadata_pushed_only_while_playing() {
        let (mut s, host) = session();
        s.update_metadata(track("first")).await;
        assert!(host.calls().is_empty());

        // stored track becomes the initial metadata of the next start
        s.start(QualityLevel::High, Some(track("first"))).await;
        assert!(host.calls().iter().any(
            |c| matches!(c, Call::SetItem(_, item) if item.metadata.title == "first")
        ));

        s.handle_host_event(HostEvent::playing(s.generation()));
        s.update_metadata(track("second")).await;
        let replaced: Vec<_> = host
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ReplaceMetadata(m) => Some(m.title),
                _ => None,
            })
            .collect();
        assert_eq!(replaced, vec!["second".to_string()]);
        assert_eq!(*s.state(), PlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_rebuffer_and_external_pause() {
        let (mut s, _host) = playing().await;
        s.handle_host_event(HostEvent::buffering(s.generation()));
        assert_eq!(*s.state(), PlaybackState::Loading);
        s.handle_host_event(HostEvent::playing(s.generation()));
        s.handle_host_event(HostEvent::stopped(s.generation()));
        assert_eq!(*s.state(), PlaybackState::Paused);
    }

    #[tokio::test]
    async fn test_loading_ignores_idle_status() {
        let (mut s, _host) = session();
        s.start(QualityLevel::High, None).await;
        s.handle_host_event(HostEvent::stopped(s.generation()));
        assert_eq!(*s.state(), PlaybackState::Loading);
    }

    #[tokio::test]
    async fn test_connectivity_does_not_transition() {
        let (mut s, _host) = playing().await;
        s.on_connectivity(true).await;
        s.on_connectivity(false).await;
        assert_eq!(*s.state(), PlaybackState::Playing);

        let generation = s.generation();
        s.handle_host_event(HostEvent::error(generation, "network"));
        s.on_connectivity(true).await;
        assert!(matches!(s.state(), PlaybackState::Error(_)));
        assert_eq!(s.generation(), generation);
    }

    #[tokio::test]
    async fn test_reconnect_on_network_recovery() {
        let (mut s, _host) = session_with(SessionConfig {
            reconnect_on_network_recovery: true,
            ..SessionConfig::default()
        });
        s.start(QualityLevel::High, None).await;
        s.on_connectivity(true).await;
        s.on_connectivity(false).await;
        s.handle_host_event(HostEvent::error(s.generation(), "network"));

        let generation = s.generation();
        s.on_connectivity(true).await;
        assert_eq!(*s.state(), PlaybackState::Loading);
        assert_eq!(s.generation(), generation + 1);
    }

    #[tokio::test]
    async fn test_run_loop_through_handle() {
        let (s, host) = session();
        let (handle, cmd_rx) = SessionHandle::new(s.subscribe());
        let (host_tx, host_rx) = mpsc::channel(8);
        let task = tokio::spawn(s.run(cmd_rx, host_rx));

        let mut rx = handle.subscribe();
        handle.toggle_play_pause().await.unwrap();
        rx.wait_for(|st| st.state == PlaybackState::Loading)
            .await
            .unwrap();
        let generation = handle.status().generation;

        host_tx.send(HostEvent::playing(generation)).await.unwrap();
        rx.wait_for(|st| st.state == PlaybackState::Playing)
            .await
            .unwrap();

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(host.calls().last(), Some(&Call::Release));
    }
}
