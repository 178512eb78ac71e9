/// Weekly schedule: fetched once, cached, refreshed on request.
///
/// Failures never escape; they show up as `ScheduleView::error` and the
/// next `load`/`refresh` tries again.
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, Timelike};
use radio_proto::config::ScheduleConfig;
use radio_proto::schedule::{current_day_index, parse_schedule, ScheduleDay, ScheduleProgram};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::FetchError;

pub const LOAD_ERROR: &str = "Failed to load schedule. Please try again.";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleView {
    pub days: Vec<ScheduleDay>,
    pub loading: bool,
    pub error: Option<String>,
}

impl ScheduleView {
    pub fn day(&self, index: usize) -> Option<&ScheduleDay> {
        self.days.iter().find(|d| d.id == index)
    }

    /// The program on air at `now`, looking only at that weekday.
    pub fn on_air(&self, now: NaiveDateTime) -> Option<&ScheduleProgram> {
        let time = now.time().with_second(0)?;
        self.day(current_day_index(now.date()))?
            .programs
            .iter()
            .find(|p| p.is_on_air(time))
    }

    pub fn today(&self, now: impl Datelike) -> Option<&ScheduleDay> {
        self.day(current_day_index(now))
    }
}

#[derive(Clone)]
pub struct ScheduleService {
    inner: Arc<ScheduleInner>,
}

struct ScheduleInner {
    client: Client,
    url: String,
    view_tx: watch::Sender<ScheduleView>,
    /// Serialises load/refresh so two callers never fetch at once.
    load_lock: Mutex<()>,
}

impl ScheduleService {
    pub fn from_config(config: &ScheduleConfig) -> anyhow::Result<Self> {
        Self::new(
            config.url.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let (view_tx, _) = watch::channel(ScheduleView::default());
        Ok(Self {
            inner: Arc::new(ScheduleInner {
                client,
                url,
                view_tx,
                load_lock: Mutex::new(()),
            }),
        })
    }

    pub fn view(&self) -> ScheduleView {
        self.inner.view_tx.borrow().clone()
    }

    async fn fetch(&self) -> Result<Vec<ScheduleDay>, FetchError> {
        let response = self.inner.client.get(&self.inner.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let body = response.text().await?;
        parse_schedule(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Fetch unless something is cached already.
    pub async fn load(&self) {
        let _guard = self.inner.load_lock.lock().await;
        if !self.inner.view_tx.borrow().days.is_empty() {
            return;
        }
        self.inner.view_tx.send_modify(|v| {
            v.loading = true;
            v.error = None;
        });

        match self.fetch().await {
            Ok(days) => {
                info!("schedule: loaded {} days", days.len());
                self.inner.view_tx.send_replace(ScheduleView {
                    days,
                    loading: false,
                    error: None,
                });
            }
            Err(e) => {
                warn!("schedule: load failed: {}", e);
                self.inner.view_tx.send_modify(|v| {
                    v.loading = false;
                    v.error = Some(LOAD_ERROR.to_string());
                });
            }
        }
    }

    pub async fn refresh(&self) {
        {
            let _guard = self.inner.load_lock.lock().await;
            self.inner.view_tx.send_modify(|v| v.days.clear());
        }
        self.load().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::tests::MockEndpoint;
    use axum::http::StatusCode;
    use chrono::NaiveDate;
    use std::sync::atomic::Ordering;

    const BODY: &str = r#"{"schedule": [
        {"day": "monday", "programs": [
            {"name": "Morning Show", "description": "Wake up", "start_time": "7:00 AM", "end_time": "10:00 AM"},
            {"name": "Late Jazz", "start_time": "10:00 PM", "end_time": "2:00 AM"}
        ]},
        {"day": "Sunday", "programs": [
            {"name": "Gospel Hour", "start_time": "09:00", "end_time": "10:00"}
        ]}
    ]}"#;

    fn service(url: String) -> ScheduleService {
        ScheduleService::new(url, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_load_caches() {
        let mock = MockEndpoint::new(BODY);
        let url = mock.clone().serve().await;
        let svc = service(url);

        svc.load().await;
        let view = svc.view();
        assert!(!view.loading);
        assert_eq!(view.error, None);
        assert_eq!(
            view.days.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["Sunday", "Monday"]
        );
        assert_eq!(view.days[1].programs[1].id, "1_1");
        assert_eq!(view.days[1].programs[0].time_range(), "7:00 AM - 10:00 AM");

        svc.load().await;
        assert_eq!(mock.hits.load(Ordering::SeqCst), 1);

        svc.refresh().await;
        assert_eq!(mock.hits.load(Ordering::SeqCst), 2);
        assert_eq!(svc.view().days.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_sets_retryable_error() {
        let mock = MockEndpoint::new("not json");
        let url = mock.clone().serve().await;
        let svc = service(url);

        svc.load().await;
        let view = svc.view();
        assert!(!view.loading);
        assert!(view.days.is_empty());
        assert_eq!(view.error.as_deref(), Some(LOAD_ERROR));

        mock.set(StatusCode::INTERNAL_SERVER_ERROR, BODY);
        svc.load().await;
        assert_eq!(svc.view().error.as_deref(), Some(LOAD_ERROR));

        mock.set(StatusCode::OK, BODY);
        svc.load().await;
        let view = svc.view();
        assert_eq!(view.error, None);
        assert_eq!(view.days.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_cache() {
        let mock = MockEndpoint::new(BODY);
        let url = mock.clone().serve().await;
        let svc = service(url);
        svc.load().await;

        mock.set(StatusCode::BAD_GATEWAY, "");
        svc.refresh().await;
        let view = svc.view();
        assert!(view.days.is_empty());
        assert_eq!(view.error.as_deref(), Some(LOAD_ERROR));
    }

    #[test]
    fn test_on_air_lookup() {
        let days = parse_schedule(BODY).unwrap();
        let view = ScheduleView {
            days,
            ..ScheduleView::default()
        };
        // 2024-01-01 is a Monday
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let at = |h, m| monday.and_hms_opt(h, m, 30).unwrap();

        assert_eq!(view.today(monday).map(|d| d.id), Some(1));
        assert_eq!(view.on_air(at(8, 15)).map(|p| p.name.as_str()), Some("Morning Show"));
        assert_eq!(view.on_air(at(23, 0)).map(|p| p.name.as_str()), Some("Late Jazz"));
        assert_eq!(view.on_air(at(12, 0)), None);

        // nothing listed for Tuesday
        let tuesday = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(view.today(tuesday).is_none());
    }
}
