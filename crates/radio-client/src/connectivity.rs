/// Network connectivity as a restartable stream of booleans.
///
/// The platform side is a `ConnectivityCapability`: a synchronous "is the
/// internet reachable" query plus register/unregister of an event sink.
/// `ConnectivityObserver::subscribe` turns that into a
/// `ConnectivitySubscription` which yields the current value first and then
/// one bool per platform event.  Dropping the subscription unregisters it.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use radio_proto::config::ConnectivityConfig;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{SessionCommand, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available,
    Lost,
    CapabilitiesChanged { has_internet: bool },
}

impl NetworkEvent {
    pub fn is_online(self) -> bool {
        match self {
            NetworkEvent::Available => true,
            NetworkEvent::Lost => false,
            NetworkEvent::CapabilitiesChanged { has_internet } => has_internet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

pub trait ConnectivityCapability: Send + Sync {
    /// Current reachability, answered without waiting.
    fn has_internet(&self) -> bool;
    fn register(&self, tx: mpsc::UnboundedSender<NetworkEvent>) -> RegistrationId;
    fn unregister(&self, id: RegistrationId);
}

// ── observer ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ConnectivityObserver {
    capability: Arc<dyn ConnectivityCapability>,
}

impl ConnectivityObserver {
    pub fn new(capability: Arc<dyn ConnectivityCapability>) -> Self {
        Self { capability }
    }

    pub fn is_online(&self) -> bool {
        self.capability.has_internet()
    }

    /// Register first, then read the current value, so no event between the
    /// two can be lost.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.capability.register(tx);
        let initial = self.capability.has_internet();
        debug!("connectivity: subscribed id={:?} initial={}", id, initial);
        ConnectivitySubscription {
            capability: self.capability.clone(),
            id,
            initial: Some(initial),
            rx,
        }
    }
}

pub struct ConnectivitySubscription {
    capability: Arc<dyn ConnectivityCapability>,
    id: RegistrationId,
    initial: Option<bool>,
    rx: mpsc::UnboundedReceiver<NetworkEvent>,
}

impl Stream for ConnectivitySubscription {
    type Item = bool;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<bool>> {
        if let Some(initial) = self.initial.take() {
            return Poll::Ready(Some(initial));
        }
        self.rx
            .poll_recv(cx)
            .map(|event| event.map(NetworkEvent::is_online))
    }
}

impl Drop for ConnectivitySubscription {
    fn drop(&mut self) {
        debug!("connectivity: unsubscribed id={:?}", self.id);
        self.capability.unregister(self.id);
    }
}

// ── TCP probe capability ──────────────────────────────────────────────────────

/// Treats "a TCP connect to the stream host succeeds" as having internet.
/// A probe address that does not even resolve counts as no network at all.
pub struct ProbeConnectivity {
    shared: Arc<ProbeShared>,
    token: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Reach {
    #[default]
    NoNetwork,
    /// Resolves, but the probe host does not answer.
    NoInternet,
    Online,
}

#[derive(Default)]
struct ProbeShared {
    online: AtomicBool,
    reach: Mutex<Reach>,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<RegistrationId, mpsc::UnboundedSender<NetworkEvent>>>,
}

impl ProbeShared {
    fn listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<RegistrationId, mpsc::UnboundedSender<NetworkEvent>>>
    {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_reach(&self, reach: Reach) {
        let previous = {
            let mut current = self.reach.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, reach)
        };
        if previous == reach {
            return;
        }
        let online = reach == Reach::Online;
        self.online.store(online, Ordering::Release);
        let event = match (previous, reach) {
            (_, Reach::NoNetwork) => NetworkEvent::Lost,
            (Reach::NoNetwork, Reach::Online) => NetworkEvent::Available,
            _ => NetworkEvent::CapabilitiesChanged {
                has_internet: online,
            },
        };
        info!("connectivity: {:?}", event);
        self.listeners().retain(|_, tx| tx.send(event).is_ok());
    }
}

impl ProbeConnectivity {
    /// Runs the first probe before returning so `has_internet` is meaningful
    /// from the start.
    pub async fn start(config: &ConnectivityConfig) -> Self {
        let address = config.probe_address.clone();
        let interval = Duration::from_secs(config.probe_interval_secs.max(1));
        let timeout = Duration::from_secs(config.probe_timeout_secs.max(1));

        let shared = Arc::new(ProbeShared::default());
        shared.set_reach(probe(&address, timeout).await);
        info!(
            "connectivity: probing {} every {:?} (online={})",
            address,
            interval,
            shared.online.load(Ordering::Acquire)
        );

        let token = CancellationToken::new();
        tokio::spawn(probe_loop(
            shared.clone(),
            address,
            interval,
            timeout,
            token.clone(),
        ));
        Self { shared, token }
    }
}

impl Drop for ProbeConnectivity {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl ConnectivityCapability for ProbeConnectivity {
    fn has_internet(&self) -> bool {
        self.shared.online.load(Ordering::Acquire)
    }

    fn register(&self, tx: mpsc::UnboundedSender<NetworkEvent>) -> RegistrationId {
        let id = RegistrationId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners().insert(id, tx);
        id
    }

    fn unregister(&self, id: RegistrationId) {
        self.shared.listeners().remove(&id);
    }
}

async fn probe(address: &str, timeout: Duration) -> Reach {
    let attempt = async {
        let addrs: Vec<SocketAddr> = match lookup_host(address).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!("connectivity: probe {} does not resolve: {}", address, e);
                return Reach::NoNetwork;
            }
        };
        match TcpStream::connect(&addrs[..]).await {
            Ok(_) => Reach::Online,
            Err(e) => {
                debug!("connectivity: probe {} failed: {}", address, e);
                Reach::NoInternet
            }
        }
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(reach) => reach,
        Err(_) => {
            debug!("connectivity: probe {} timed out", address);
            Reach::NoInternet
        }
    }
}

async fn probe_loop(
    shared: Arc<ProbeShared>,
    address: String,
    interval: Duration,
    timeout: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let reach = tokio::select! {
            _ = token.cancelled() => break,
            reach = probe(&address, timeout) => reach,
        };
        shared.set_reach(reach);
    }
    debug!("connectivity: probe loop exited");
}

// ── monitor ───────────────────────────────────────────────────────────────────

/// Drive one subscription into `online_tx` and forward every value to the
/// session.  The session itself ignores repeats.
pub fn spawn_monitor(
    observer: ConnectivityObserver,
    online_tx: watch::Sender<bool>,
    session: SessionHandle,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = observer.subscribe();
        loop {
            let online = tokio::select! {
                _ = token.cancelled() => break,
                next = subscription.next() => match next {
                    Some(online) => online,
                    None => break,
                },
            };
            online_tx.send_replace(online);
            if session
                .send(SessionCommand::Connectivity(online))
                .await
                .is_err()
            {
                warn!("connectivity: session gone, stopping monitor");
                break;
            }
        }
        debug!("connectivity: monitor exited");
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Capability whose state and events are driven by the test.
    #[derive(Default)]
    pub(crate) struct FakeConnectivity {
        online: AtomicBool,
        next_id: AtomicU64,
        listeners: Mutex<HashMap<RegistrationId, mpsc::UnboundedSender<NetworkEvent>>>,
    }

    impl FakeConnectivity {
        pub fn new(online: bool) -> Arc<Self> {
            let fake = Self::default();
            fake.online.store(online, Ordering::SeqCst);
            Arc::new(fake)
        }

        pub fn emit(&self, event: NetworkEvent) {
            self.online.store(event.is_online(), Ordering::SeqCst);
            for tx in self.listeners.lock().unwrap().values() {
                let _ = tx.send(event);
            }
        }

        pub fn registered(&self) -> usize {
            self.listeners.lock().unwrap().len()
        }
    }

    impl ConnectivityCapability for FakeConnectivity {
        fn has_internet(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        fn register(&self, tx: mpsc::UnboundedSender<NetworkEvent>) -> RegistrationId {
            let id = RegistrationId(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.listeners.lock().unwrap().insert(id, tx);
            id
        }

        fn unregister(&self, id: RegistrationId) {
            self.listeners.lock().unwrap().remove(&id);
        }
    }

    #[tokio::test]
    async fn test_initial_value_comes_first() {
        for online in [true, false] {
            let fake = FakeConnectivity::new(online);
            let observer = ConnectivityObserver::new(fake.clone());
            let mut sub = observer.subscribe();
            // an event queued before the first poll still comes after the initial value
            fake.emit(NetworkEvent::CapabilitiesChanged {
                has_internet: !online,
            });
            assert_eq!(sub.next().await, Some(online));
            assert_eq!(sub.next().await, Some(!online));
        }
    }

    #[tokio::test]
    async fn test_events_map_without_debounce() {
        let fake = FakeConnectivity::new(true);
        let observer = ConnectivityObserver::new(fake.clone());
        let mut sub = observer.subscribe();
        assert_eq!(sub.next().await, Some(true));

        fake.emit(NetworkEvent::Lost);
        fake.emit(NetworkEvent::Lost);
        fake.emit(NetworkEvent::Available);
        fake.emit(NetworkEvent::CapabilitiesChanged {
            has_internet: false,
        });
        let got: Vec<bool> = sub.by_ref().take(4).collect().await;
        assert_eq!(got, vec![false, false, true, false]);
    }

    #[tokio::test]
    async fn test_drop_unregisters_and_resubscribe_restarts() {
        let fake = FakeConnectivity::new(false);
        let observer = ConnectivityObserver::new(fake.clone());

        let sub = observer.subscribe();
        assert_eq!(fake.registered(), 1);
        drop(sub);
        assert_eq!(fake.registered(), 0);

        fake.emit(NetworkEvent::Available);
        let mut sub = observer.subscribe();
        assert_eq!(sub.next().await, Some(true));
        assert_eq!(fake.registered(), 1);
    }

    #[tokio::test]
    async fn test_monitor_forwards_to_session() {
        let fake = FakeConnectivity::new(true);
        let observer = ConnectivityObserver::new(fake.clone());
        let (_status_tx, status_rx) = watch::channel(radio_proto::protocol::SessionStatus::new(
            Default::default(),
            Default::default(),
            None,
            0,
        ));
        let (session, mut commands) = SessionHandle::new(status_rx);
        let (online_tx, mut online_rx) = watch::channel(false);
        let token = CancellationToken::new();
        let task = spawn_monitor(observer, online_tx, session, token.clone());

        assert!(matches!(
            commands.recv().await,
            Some(SessionCommand::Connectivity(true))
        ));
        assert!(*online_rx.borrow_and_update());

        fake.emit(NetworkEvent::Lost);
        assert!(matches!(
            commands.recv().await,
            Some(SessionCommand::Connectivity(false))
        ));
        assert!(!*online_rx.borrow());

        token.cancel();
        task.await.unwrap();
        assert_eq!(fake.registered(), 0);
    }

    #[tokio::test]
    async fn test_tcp_check_reports_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ConnectivityConfig {
            probe_address: addr.to_string(),
            probe_interval_secs: 1,
            probe_timeout_secs: 1,
        };
        let probe_cap = ProbeConnectivity::start(&config).await;
        assert!(probe_cap.has_internet());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = probe_cap.register(tx);
        drop(listener);
        // next probe (within ~1s) sees the refused connection
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(NetworkEvent::CapabilitiesChanged {
                has_internet: false
            })
        );
        assert!(!probe_cap.has_internet());
        probe_cap.unregister(id);
    }

    #[test]
    fn test_reachability_maps_to_events() {
        let shared = ProbeShared::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.listeners().insert(RegistrationId(0), tx);

        shared.set_reach(Reach::Online);
        shared.set_reach(Reach::Online);
        shared.set_reach(Reach::NoInternet);
        shared.set_reach(Reach::Online);
        shared.set_reach(Reach::NoNetwork);
        shared.set_reach(Reach::NoInternet);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                NetworkEvent::Available,
                NetworkEvent::CapabilitiesChanged {
                    has_internet: false
                },
                NetworkEvent::CapabilitiesChanged { has_internet: true },
                NetworkEvent::Lost,
                NetworkEvent::CapabilitiesChanged {
                    has_internet: false
                },
            ]
        );
        assert!(!shared.online.load(Ordering::Acquire));
    }
}
