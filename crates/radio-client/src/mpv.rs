/// mpv as the session host, driven over its JSON IPC socket.
///
/// Architecture:
///
/// ```text
///   MpvHost (SessionHost)
///         │ spawns on first use
///         ├── MpvDriver      ← owns the mpv child process
///         ├── writer_task    ← receives PendingRequest via mpsc, serialises → socket
///         ├── reader_task    ← reads JSON lines from socket
///         │                      ├── response (has request_id) → matched oneshot::Sender
///         │                      └── event / property-change   → MpvEvent channel
///         └── bridge_task    ← MpvEvent → StatusTracker → HostEvent (tagged with generation)
/// ```
///
/// Generations: every `loadfile` reply carries mpv's playlist entry id, and
/// the host binds that id to the generation of the item it loaded.  mpv
/// echoes the id on `start-file` / `end-file`, so each event is tagged with
/// the generation of the file it belongs to, however late it is processed.
/// Anything from a replaced file is then dropped by the session.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use radio_proto::config::MpvConfig;

use crate::error::HostError;
use crate::host::{Generation, HostEvent, ItemMetadata, MediaItem, SessionHost};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_PAUSED_FOR_CACHE: u64 = 3;

/// mpv's id for one `loadfile`.
pub type EntryId = u64;

/// How many recent entry → generation bindings the tracker keeps.
const KEPT_BINDINGS: u64 = 8;

const IPC_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line, '\n' terminated
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key)?.as_str()
    }

    /// Playlist entry id carried by start-file / end-file.
    pub fn entry_id(&self) -> Option<EntryId> {
        self.raw.get("playlist_entry_id")?.as_u64()
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the writer task.  `send()` fires a command and awaits
/// the matching response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    /// Returns the playlist entry id mpv assigned to the file, if reported.
    pub async fn load(&self, url: &str) -> anyhow::Result<Option<EntryId>> {
        let reply = self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(reply
            .get("data")
            .and_then(|d| d.get("playlist_entry_id"))
            .and_then(Value::as_u64))
    }

    /// The writer task is gone, so every send would fail.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.set_property("pause", json!(paused)).await
    }

    pub async fn set_volume(&self, vol: f32) -> anyhow::Result<()> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.set_property("volume", json!(vol_pct)).await
    }

    /// Register observe_property for everything the status tracker needs.
    /// mpv answers each with the current value, then pushes changes.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    binary: Option<PathBuf>,
    volume: f32,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new(config: &MpvConfig) -> Self {
        Self {
            socket_name: radio_proto::platform::mpv_socket_name(),
            binary: config.binary.clone(),
            volume: config.volume,
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }

    fn spawn(&mut self) -> Result<(), HostError> {
        let mpv_binary = radio_proto::platform::find_mpv_binary(self.binary.as_deref())
            .ok_or_else(|| HostError::Spawn("mpv binary not found".into()))?;
        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        info!("mpv: spawning {}", mpv_binary.display());
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(radio_proto::platform::mpv_socket_arg(&self.socket_name))
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::Spawn(e.to_string()))?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> Result<MpvHandle, HostError> {
        self.kill().await;
        let socket_path = PathBuf::from(&self.socket_name);
        self.spawn()?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            return Err(HostError::Spawn("mpv IPC socket did not appear".into()));
        }

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| HostError::Ipc(e.to_string()))?;
        info!("mpv: connected to IPC socket");
        Ok(start_io_tasks(stream, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> Result<MpvHandle, HostError> {
        self.kill().await;
        self.spawn()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                return Ok(start_io_tasks(client, event_tx));
            }
        }
        Err(HostError::Spawn("mpv named pipe did not appear".into()))
    }
}

fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader / writer tasks ─────────────────────────────────────────────────────

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        debug!("mpv reader: event receiver gone");
                    }
                    continue;
                };

                let Some(tx) = pending.lock().await.remove(&req_id) else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                    continue;
                };
                let error = val
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                let result = if error == "success" {
                    Ok(val)
                } else {
                    Err(anyhow::anyhow!("mpv error: {}", error))
                };
                let _ = tx.send(result);
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── status tracking ───────────────────────────────────────────────────────────

/// Folds mpv events into `HostEvent`s for the session.
///
/// The binding of an entry can reach the tracker before or after that
/// entry's own events.  Status of an unbound entry is held back until the
/// binding arrives, and its end-file error is parked until then.
#[derive(Debug, Default)]
pub struct StatusTracker {
    bindings: HashMap<EntryId, Generation>,
    /// Entry between its start-file and end-file.
    current: Option<EntryId>,
    /// Last entry that started, kept after end-file.
    last_entry: Option<EntryId>,
    core_idle: Option<bool>,
    pause: bool,
    paused_for_cache: bool,
    last: Option<(bool, bool)>,
    parked_error: Option<(EntryId, String)>,
}

impl StatusTracker {
    /// Record that `entry` plays the item of `generation`.
    pub fn bind(&mut self, entry: EntryId, generation: Generation) -> Option<HostEvent> {
        self.bindings.insert(entry, generation);
        self.bindings.retain(|e, _| *e + KEPT_BINDINGS > entry);
        debug!("mpv: entry {} bound to gen={}", entry, generation);

        if let Some((parked, message)) = self.parked_error.take() {
            if parked == entry {
                return Some(HostEvent::error(generation, message));
            }
            self.parked_error = Some((parked, message));
        }
        if self.current == Some(entry) {
            return self.status_event();
        }
        None
    }

    pub fn on_event(&mut self, evt: &MpvEvent) -> Option<HostEvent> {
        if let Some((obs_id, data)) = evt.as_property_change() {
            match obs_id {
                OBS_CORE_IDLE => self.core_idle = data.as_bool(),
                OBS_PAUSE => self.pause = data.as_bool().unwrap_or(false),
                OBS_PAUSED_FOR_CACHE => self.paused_for_cache = data.as_bool().unwrap_or(false),
                _ => return None,
            }
            return self.status_event();
        }

        match evt.event_name() {
            Some("start-file") => {
                let entry = evt.entry_id();
                self.current = entry;
                self.last_entry = entry;
                self.core_idle = None;
                self.paused_for_cache = false;
                self.last = None;
                debug!("mpv: start-file entry={:?}", entry);
                self.status_event()
            }
            Some("end-file") => {
                let entry = evt.entry_id().or(self.current);
                if entry == self.current {
                    self.current = None;
                }
                let reason = evt.str_field("reason").unwrap_or("unknown");
                info!("mpv: end-file reason={} entry={:?}", reason, entry);
                let message = match reason {
                    "error" => evt.str_field("file_error").unwrap_or("playback error"),
                    "eof" => "stream ended",
                    _ => return None,
                };
                let entry = entry?;
                match self.bindings.get(&entry) {
                    Some(&generation) => Some(HostEvent::error(generation, message)),
                    None => {
                        self.parked_error = Some((entry, message.to_string()));
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// The IPC connection dropped: whatever was playing is gone.
    pub fn on_disconnect(&self) -> Option<HostEvent> {
        let generation = *self.bindings.get(&self.last_entry?)?;
        Some(HostEvent::error(generation, "player connection lost"))
    }

    fn status_event(&mut self) -> Option<HostEvent> {
        let generation = *self.bindings.get(&self.current?)?;
        let audio_flowing = self.core_idle == Some(false) && !self.paused_for_cache;
        let playing = !self.pause && audio_flowing;
        let buffering = !self.pause && !audio_flowing;
        if self.last == Some((playing, buffering)) {
            return None;
        }
        self.last = Some((playing, buffering));
        Some(match (playing, buffering) {
            (true, _) => HostEvent::playing(generation),
            (false, true) => HostEvent::buffering(generation),
            (false, false) => HostEvent::stopped(generation),
        })
    }
}

async fn bridge_task(
    mut mpv_rx: mpsc::Receiver<MpvEvent>,
    mut bind_rx: mpsc::UnboundedReceiver<(EntryId, Generation)>,
    host_tx: mpsc::Sender<HostEvent>,
) {
    let mut tracker = StatusTracker::default();
    loop {
        let event = tokio::select! {
            biased;
            Some((entry, generation)) = bind_rx.recv() => tracker.bind(entry, generation),
            evt = mpv_rx.recv() => match evt {
                Some(evt) => tracker.on_event(&evt),
                None => break,
            },
        };
        if let Some(event) = event {
            if host_tx.send(event).await.is_err() {
                return;
            }
        }
    }
    debug!("mpv bridge: event stream ended");
    if let Some(event) = tracker.on_disconnect() {
        let _ = host_tx.send(event).await;
    }
}

// ── MpvHost ───────────────────────────────────────────────────────────────────

pub struct MpvHost {
    driver: MpvDriver,
    volume: f32,
    handle: Option<MpvHandle>,
    bridge: Option<JoinHandle<()>>,
    bind_tx: Option<mpsc::UnboundedSender<(EntryId, Generation)>>,
    /// Generation of the item set by the last `set_media_item`.
    generation: Generation,
    host_tx: mpsc::Sender<HostEvent>,
    item: Option<MediaItem>,
}

impl MpvHost {
    pub fn new(config: &MpvConfig, host_tx: mpsc::Sender<HostEvent>) -> Self {
        Self {
            driver: MpvDriver::new(config),
            volume: config.volume,
            handle: None,
            bridge: None,
            bind_tx: None,
            generation: 0,
            host_tx,
            item: None,
        }
    }

    /// Process running and IPC writer still accepting requests.
    fn is_live(&mut self) -> bool {
        let open = self.handle.as_ref().is_some_and(|h| !h.is_closed());
        open && self.driver.process_alive()
    }

    fn drop_connection(&mut self) {
        self.handle = None;
        self.bind_tx = None;
        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
        }
    }

    /// Spawn mpv on first use, or again if the process died.
    async fn ensure_connected(&mut self) -> Result<MpvHandle, HostError> {
        if self.handle.is_some() {
            if self.is_live() {
                if let Some(h) = &self.handle {
                    return Ok(h.clone());
                }
            }
            warn!("mpv: player gone, respawning");
        }
        self.drop_connection();

        let (mpv_tx, mpv_rx) = mpsc::channel::<MpvEvent>(256);
        let handle = self.driver.spawn_and_connect(mpv_tx).await?;
        handle.observe_all_properties().await;
        if let Err(e) = handle.set_volume(self.volume).await {
            warn!("mpv: failed to set volume: {}", e);
        }
        let (bind_tx, bind_rx) = mpsc::unbounded_channel();
        self.bridge = Some(tokio::spawn(bridge_task(
            mpv_rx,
            bind_rx,
            self.host_tx.clone(),
        )));
        self.bind_tx = Some(bind_tx);
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn connected(&self) -> Result<&MpvHandle, HostError> {
        self.handle.as_ref().ok_or(HostError::NotConnected)
    }
}

#[async_trait]
impl SessionHost for MpvHost {
    async fn set_media_item(
        &mut self,
        generation: Generation,
        item: MediaItem,
    ) -> Result<(), HostError> {
        let handle = self.ensure_connected().await?;
        handle.set_pause(true).await?;
        handle
            .set_property("force-media-title", json!(item.metadata.display_title()))
            .await?;
        self.generation = generation;
        self.item = Some(item);
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), HostError> {
        let url = self
            .item
            .as_ref()
            .map(|i| i.url.clone())
            .ok_or_else(|| HostError::Ipc("no media item set".into()))?;
        let entry = self.connected()?.load(&url).await?;
        match (entry, &self.bind_tx) {
            (Some(entry), Some(tx)) => {
                let _ = tx.send((entry, self.generation));
            }
            _ => warn!(
                "mpv: no playlist entry for gen={}, its status will not be reported",
                self.generation
            ),
        }
        Ok(())
    }

    async fn play(&mut self) -> Result<(), HostError> {
        self.connected()?.set_pause(false).await?;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), HostError> {
        self.connected()?.set_pause(true).await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), HostError> {
        // a dead player has nothing left to stop; the next item respawns it
        if self.handle.is_some() && !self.is_live() {
            warn!("mpv: player gone, dropping stale connection");
            self.drop_connection();
        }
        if let Some(h) = &self.handle {
            h.stop().await?;
        }
        self.item = None;
        Ok(())
    }

    async fn replace_current_item_metadata(
        &mut self,
        metadata: ItemMetadata,
    ) -> Result<(), HostError> {
        let handle = self.connected()?;
        handle
            .set_property("force-media-title", json!(metadata.display_title()))
            .await?;
        if let Some(item) = self.item.as_mut() {
            item.metadata = metadata;
        }
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.send(json!(["quit"])).await;
        }
        self.drop_connection();
        self.driver.kill().await;
        info!("mpv: released");
    }
}
