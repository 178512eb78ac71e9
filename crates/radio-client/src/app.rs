/// Application wiring.  Built once in `main`; owns every long-lived task.
use std::sync::Arc;

use radio_proto::config::Config;
use radio_proto::protocol::{MetadataSnapshot, Track};
use radio_proto::quality::StreamEndpointTable;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::{
    spawn_monitor, ConnectivityCapability, ConnectivityObserver, ProbeConnectivity,
};
use crate::host::{HostEvent, SessionHost};
use crate::http::{self, HttpState};
use crate::mpv::MpvHost;
use crate::poller::MetadataPoller;
use crate::schedule::ScheduleService;
use crate::session::{PlaybackSession, SessionHandle};

pub struct AppContext {
    pub config: Config,
    pub endpoints: StreamEndpointTable,
    pub session: SessionHandle,
    pub poller: MetadataPoller,
    pub online: watch::Receiver<bool>,
    pub schedule: ScheduleService,
    token: CancellationToken,
    session_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    http_task: Option<JoinHandle<()>>,
}

impl AppContext {
    /// Production wiring: mpv host, TCP probe, polling and the HTTP API.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let capability = Arc::new(ProbeConnectivity::start(&config.connectivity).await);
        let (host_tx, host_rx) = mpsc::channel::<HostEvent>(256);
        let host = MpvHost::new(&config.mpv, host_tx);

        let mut ctx = Self::new(config, host, host_rx, capability)?;
        ctx.poller.start_polling().await;
        if ctx.config.http.enabled {
            ctx.http_task = Some(http::start_server(
                ctx.config.http.bind_address.clone(),
                ctx.config.http.port,
                ctx.http_state(),
            ));
        }
        Ok(ctx)
    }

    /// Spawn the session, connectivity monitor and metadata bridge around
    /// the given host and capability.  Polling and HTTP are left to the caller.
    pub fn new<H>(
        config: Config,
        host: H,
        host_events: mpsc::Receiver<HostEvent>,
        capability: Arc<dyn ConnectivityCapability>,
    ) -> anyhow::Result<Self>
    where
        H: SessionHost + 'static,
    {
        let endpoints = StreamEndpointTable::from_config(&config.streams);
        let session = PlaybackSession::new(
            host,
            endpoints.clone(),
            config.station.clone(),
            &config.session,
            config.streams.default_quality,
        );
        let (handle, commands) = SessionHandle::new(session.subscribe());
        let session_task = tokio::spawn(session.run(commands, host_events));

        let poller = MetadataPoller::from_config(&config.metadata, &config.station)?;
        let schedule = ScheduleService::from_config(&config.schedule)?;

        let connectivity = ConnectivityObserver::new(capability);
        let (online_tx, online) = watch::channel(connectivity.is_online());
        let token = CancellationToken::new();
        let monitor = spawn_monitor(
            connectivity,
            online_tx,
            handle.clone(),
            token.clone(),
        );
        let bridge = spawn_metadata_bridge(poller.subscribe(), handle.clone(), token.clone());

        info!(
            "app: initialised (quality={}, http={})",
            config.streams.default_quality, config.http.enabled
        );
        Ok(Self {
            config,
            endpoints,
            session: handle,
            poller,
            online,
            schedule,
            token,
            session_task,
            background: vec![monitor, bridge],
            http_task: None,
        })
    }

    pub fn http_state(&self) -> HttpState {
        HttpState {
            session: self.session.clone(),
            poller: self.poller.clone(),
            schedule: self.schedule.clone(),
            online: self.online.clone(),
            endpoints: self.endpoints.clone(),
        }
    }

    /// Stop polling and monitoring, then let the session release the player.
    pub async fn shutdown(self) {
        info!("app: shutting down");
        self.poller.stop_polling().await;
        self.token.cancel();
        if let Some(http) = self.http_task {
            http.abort();
        }
        for task in self.background {
            let _ = task.await;
        }
        if let Err(e) = self.session.shutdown().await {
            warn!("app: session already gone: {}", e);
        }
        if let Err(e) = self.session_task.await {
            warn!("app: session task failed: {}", e);
        }
        info!("app: shutdown complete");
    }
}

/// Push the poller's track into the session, once per distinct track.
pub fn spawn_metadata_bridge(
    mut snapshots: watch::Receiver<MetadataSnapshot>,
    session: SessionHandle,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: Option<Track> = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let Some(track) = snapshots.borrow_and_update().track.clone() else {
                continue;
            };
            if last.as_ref() == Some(&track) {
                continue;
            }
            debug!("app: track changed to '{}'", track.title);
            last = Some(track.clone());
            if session.update_metadata(track).await.is_err() {
                break;
            }
        }
        debug!("app: metadata bridge exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::tests::FakeConnectivity;
    use crate::connectivity::NetworkEvent;
    use crate::session::tests::{Call, FakeHost};
    use crate::session::SessionCommand;
    use chrono::Local;
    use radio_proto::protocol::PlaybackState;
    use std::time::Duration;

    fn track(title: &str) -> Track {
        Track {
            title: title.into(),
            artist: "A".into(),
            album: String::new(),
            art_url: String::new(),
        }
    }

    fn snapshot(track: Option<Track>, listeners: u32) -> MetadataSnapshot {
        MetadataSnapshot {
            track,
            listeners: Some(radio_proto::protocol::ListenerSnapshot {
                current: listeners,
                total: listeners,
                unique: listeners,
            }),
            updated_at: Some(Local::now()),
            ..MetadataSnapshot::default()
        }
    }

    #[tokio::test]
    async fn test_bridge_sends_only_track_changes() {
        let (tx, rx) = watch::channel(MetadataSnapshot::default());
        let (_status_tx, status_rx) = watch::channel(radio_proto::protocol::SessionStatus::new(
            PlaybackState::Idle,
            Default::default(),
            None,
            0,
        ));
        let (session, mut commands) = SessionHandle::new(status_rx);
        let token = CancellationToken::new();
        let task = spawn_metadata_bridge(rx, session, token.clone());

        tx.send_replace(snapshot(Some(track("One")), 1));
        match commands.recv().await {
            Some(SessionCommand::UpdateMetadata(t)) => assert_eq!(t.title, "One"),
            other => panic!("unexpected {:?}", other),
        }

        // listener count changes alone are not forwarded
        tx.send_replace(snapshot(Some(track("One")), 5));
        tx.send_replace(snapshot(None, 6));
        tx.send_replace(snapshot(Some(track("Two")), 6));
        match commands.recv().await {
            Some(SessionCommand::UpdateMetadata(t)) => assert_eq!(t.title, "Two"),
            other => panic!("unexpected {:?}", other),
        }

        token.cancel();
        task.await.unwrap();
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_context_wires_session_and_shutdown_releases() {
        let host = FakeHost::default();
        let (host_tx, host_rx) = mpsc::channel(8);
        let fake = FakeConnectivity::new(false);
        let mut config = Config::default();
        config.session.reconnect_on_network_recovery = true;

        let ctx = AppContext::new(config, host.clone(), host_rx, fake.clone()).unwrap();
        assert!(!*ctx.online.borrow());

        let mut status = ctx.session.subscribe();
        ctx.session.toggle_play_pause().await.unwrap();
        status
            .wait_for(|s| s.state == PlaybackState::Loading)
            .await
            .unwrap();
        let generation = ctx.session.status().generation;
        host_tx
            .send(HostEvent::error(generation, "decoder failure"))
            .await
            .unwrap();
        status
            .wait_for(|s| s.error_message.as_deref() == Some("decoder failure"))
            .await
            .unwrap();

        // offline -> online while failed reconnects
        fake.emit(NetworkEvent::Available);
        status
            .wait_for(|s| s.generation > generation && s.state == PlaybackState::Loading)
            .await
            .unwrap();
        let mut online = ctx.online.clone();
        tokio::time::timeout(Duration::from_secs(1), online.wait_for(|v| *v))
            .await
            .unwrap()
            .unwrap();

        ctx.shutdown().await;
        assert_eq!(host.calls().last(), Some(&Call::Release));
        assert_eq!(fake.registered(), 0);
    }
}
