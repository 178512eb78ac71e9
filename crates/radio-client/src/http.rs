use crate::poller::MetadataPoller;
use crate::schedule::{ScheduleService, ScheduleView};
use crate::session::SessionHandle;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Local;
use radio_proto::protocol::{MetadataSnapshot, SessionStatus};
use radio_proto::quality::{QualityLevel, StreamEndpointTable};
use radio_proto::schedule::{ScheduleDay, ScheduleProgram};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Everything the handlers may read or send to.  No handler owns state.
#[derive(Clone)]
pub struct HttpState {
    pub session: SessionHandle,
    pub poller: MetadataPoller,
    pub schedule: ScheduleService,
    pub online: watch::Receiver<bool>,
    pub endpoints: StreamEndpointTable,
}

#[derive(Serialize)]
struct ApiState {
    session: SessionStatus,
    metadata: MetadataSnapshot,
    online: bool,
    polling: bool,
}

#[derive(Serialize)]
struct QualityInfo {
    level: QualityLevel,
    label: &'static str,
    bitrate: &'static str,
    url: String,
    selected: bool,
}

#[derive(Serialize)]
struct ShareText {
    text: String,
}

#[derive(Serialize)]
struct Connectivity {
    online: bool,
}

#[derive(Serialize)]
struct ApiSchedule {
    #[serde(flatten)]
    view: ScheduleView,
    today: Option<ScheduleDay>,
    on_air: Option<ScheduleProgram>,
}

impl From<ScheduleView> for ApiSchedule {
    fn from(view: ScheduleView) -> Self {
        let now = Local::now().naive_local();
        Self {
            today: view.today(now.date()).cloned(),
            on_air: view.on_air(now).cloned(),
            view,
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/toggle", post(toggle))
        .route("/api/reconnect", post(reconnect))
        .route("/api/quality/:level", post(set_quality))
        .route("/api/qualities", get(get_qualities))
        .route("/api/now-playing", get(get_now_playing))
        .route("/api/share", get(get_share))
        .route("/api/connectivity", get(get_connectivity))
        .route("/api/schedule", get(get_schedule))
        .route("/api/schedule/refresh", post(refresh_schedule))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<ApiState> {
    let session = state.session.status();
    let metadata = state.poller.snapshot();
    let online = *state.online.borrow();
    let polling = state.poller.is_polling().await;
    Json(ApiState {
        session,
        metadata,
        online,
        polling,
    })
}

async fn toggle(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Toggle play/pause");
    if state.session.toggle_play_pause().await.is_err() {
        error!("Failed to send toggle command");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn reconnect(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Reconnect");
    if state.session.reconnect().await.is_err() {
        error!("Failed to send reconnect command");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn set_quality(
    State(state): State<HttpState>,
    Path(level): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let level: QualityLevel = level
        .parse()
        .map_err(|e: anyhow::Error| (StatusCode::BAD_REQUEST, e.to_string()))?;
    info!("HTTP API: Set quality to {}", level);
    if state.session.set_quality(level).await.is_err() {
        error!("Failed to send quality command");
        return Ok(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(StatusCode::OK)
}

async fn get_qualities(State(state): State<HttpState>) -> Json<Vec<QualityInfo>> {
    let selected = state.session.status().quality;
    let qualities = state
        .endpoints
        .entries()
        .map(|(level, url)| QualityInfo {
            level,
            label: level.label(),
            bitrate: level.bitrate(),
            url: url.to_string(),
            selected: level == selected,
        })
        .collect();
    Json(qualities)
}

async fn get_now_playing(State(state): State<HttpState>) -> Json<MetadataSnapshot> {
    Json(state.poller.snapshot())
}

async fn get_share(State(state): State<HttpState>) -> Json<ShareText> {
    Json(ShareText {
        text: state.poller.share_text(),
    })
}

async fn get_connectivity(State(state): State<HttpState>) -> Json<Connectivity> {
    Json(Connectivity {
        online: *state.online.borrow(),
    })
}

async fn get_schedule(State(state): State<HttpState>) -> Json<ApiSchedule> {
    // cached after the first successful load
    state.schedule.load().await;
    Json(state.schedule.view().into())
}

async fn refresh_schedule(State(state): State<HttpState>) -> Json<ApiSchedule> {
    info!("HTTP API: Refresh schedule");
    state.schedule.refresh().await;
    Json(state.schedule.view().into())
}
