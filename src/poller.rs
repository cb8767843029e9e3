//! Station polling pipeline
//!
//! fetch → parse → map → publish, once per station per tick. The async and
//! blocking entry points differ only at the fetch call; everything after the
//! body arrives goes through [`StationPoller::apply_body`].

use std::sync::Arc;
use std::time::Duration;

use crate::api::AppState;
use crate::sensor::{composite_id, SensorState, ValueMode};
use crate::viva::{self, Fetch, FetchBlocking, FetchError, StationRecord};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Sensors of one station plus what is needed to refresh them.
#[derive(Debug)]
pub struct StationPoller {
    prefix: String,
    station_id: String,
    mode: ValueMode,
    sensors: Vec<SensorState>,
}

impl StationPoller {
    /// Create one sensor per sample of `record` and fill them from it.
    pub fn from_record(prefix: &str, station_id: &str, mode: ValueMode, record: &StationRecord) -> Self {
        let sensors = record
            .samples
            .iter()
            .map(|sample| SensorState::new(prefix, &record.station_name, &sample.name))
            .collect();
        let mut poller = Self {
            prefix: prefix.to_string(),
            station_id: station_id.to_string(),
            mode,
            sensors,
        };
        poller.apply(record);
        poller
    }

    pub async fn setup<F: Fetch>(
        fetcher: &F,
        prefix: &str,
        station_id: &str,
        mode: ValueMode,
    ) -> Result<Self, PollError> {
        let body = fetcher.fetch(&viva::station_url(station_id)).await?;
        let record = viva::parse_station(&body)?;
        Ok(Self::from_record(prefix, station_id, mode, &record))
    }

    pub fn setup_blocking<F: FetchBlocking>(
        fetcher: &F,
        prefix: &str,
        station_id: &str,
        mode: ValueMode,
    ) -> Result<Self, PollError> {
        let body = fetcher.fetch_blocking(&viva::station_url(station_id))?;
        let record = viva::parse_station(&body)?;
        Ok(Self::from_record(prefix, station_id, mode, &record))
    }

    /// Fetch and apply one poll. Returns the number of sensors updated.
    pub async fn poll<F: Fetch>(&mut self, fetcher: &F) -> Result<usize, PollError> {
        let body = fetcher.fetch(&self.url()).await?;
        self.apply_body(&body)
    }

    pub fn poll_blocking<F: FetchBlocking>(&mut self, fetcher: &F) -> Result<usize, PollError> {
        let body = fetcher.fetch_blocking(&self.url())?;
        self.apply_body(&body)
    }

    /// Parse a raw body and apply it. A body of the wrong shape leaves every
    /// sensor untouched.
    pub fn apply_body(&mut self, body: &str) -> Result<usize, PollError> {
        let record = viva::parse_station(body)?;
        Ok(self.apply(&record))
    }

    /// Update every sensor whose id matches a sample of `record`.
    ///
    /// Ids are recomputed from this record's station name, so a renamed
    /// station leaves its old sensors stale rather than failing.
    pub fn apply(&mut self, record: &StationRecord) -> usize {
        let mut updated = 0;
        for sensor in &mut self.sensors {
            let matching = record.samples.iter().find(|sample| {
                composite_id(&self.prefix, &record.station_name, &sample.name) == sensor.composite_id()
            });
            match matching {
                Some(sample) => {
                    sensor.update(sample, self.mode);
                    updated += 1;
                }
                None => {
                    tracing::debug!(
                        "station {}: no sample {:?} under {}, keeping last value",
                        self.station_id,
                        sensor.sample_name(),
                        record.station_name
                    );
                }
            }
        }
        updated
    }

    pub fn url(&self) -> String {
        viva::station_url(&self.station_id)
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn sensors(&self) -> &[SensorState] {
        &self.sensors
    }
}

// ── Background task ─────────────────────────────────────────────

/// One configured station: sets itself up on the first successful tick and
/// polls on every tick after that.
pub struct StationTask {
    prefix: String,
    station_id: String,
    mode: ValueMode,
    poller: Option<StationPoller>,
}

impl StationTask {
    pub fn new(prefix: &str, station_id: &str, mode: ValueMode) -> Self {
        Self {
            prefix: prefix.to_string(),
            station_id: station_id.to_string(),
            mode,
            poller: None,
        }
    }

    pub fn poller(&self) -> Option<&StationPoller> {
        self.poller.as_ref()
    }

    /// Run one cycle and publish the result. Returns the number of sensors
    /// updated.
    pub async fn tick<F: Fetch>(&mut self, fetcher: &F, app: &AppState) -> Result<usize, PollError> {
        let updated = match self.poller.as_mut() {
            Some(poller) => poller.poll(fetcher).await?,
            None => {
                let poller =
                    StationPoller::setup(fetcher, &self.prefix, &self.station_id, self.mode).await?;
                let count = poller.sensors().len();
                tracing::info!("Station {} ready with {} sensors", self.station_id, count);
                self.poller = Some(poller);
                count
            }
        };

        if let Some(poller) = &self.poller {
            for sensor in poller.sensors() {
                app.store.publish(sensor);
            }
        }
        Ok(updated)
    }
}

/// Spawn a background task that polls one station forever.
pub fn start_station_poller<F>(app: Arc<AppState>, fetcher: Arc<F>, mut task: StationTask, interval: Duration)
where
    F: Fetch + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            match task.tick(fetcher.as_ref(), &app).await {
                Ok(updated) => {
                    tracing::debug!("Station {}: {} sensors updated", task.station_id, updated);
                }
                Err(e) => {
                    tracing::warn!(
                        "Station {} poll failed: {}, retrying in {}s",
                        task.station_id,
                        e,
                        interval.as_secs()
                    );
                }
            }
            tokio::time::sleep(interval).await;
        }
    });
}

/// Start one independent poller per station id.
pub fn start_all<F>(
    app: Arc<AppState>,
    fetcher: Arc<F>,
    prefix: &str,
    stations: &[String],
    mode: ValueMode,
    interval: Duration,
) where
    F: Fetch + Send + Sync + 'static,
{
    for station_id in stations {
        tracing::info!("Polling ViVa station {} every {}s", station_id, interval.as_secs());
        start_station_poller(
            app.clone(),
            fetcher.clone(),
            StationTask::new(prefix, station_id, mode),
            interval,
        );
    }
}

/// Set up every station once over blocking HTTP and publish the result.
/// Returns the number of stations that answered.
///
/// Must run off the async runtime (e.g. inside `spawn_blocking`).
pub fn poll_once_blocking<F: FetchBlocking>(
    fetcher: &F,
    app: &AppState,
    prefix: &str,
    mode: ValueMode,
) -> usize {
    let mut ok = 0;
    for station_id in &app.stations {
        match StationPoller::setup_blocking(fetcher, prefix, station_id, mode) {
            Ok(poller) => {
                for sensor in poller.sensors() {
                    app.store.publish(sensor);
                }
                ok += 1;
            }
            Err(e) => tracing::warn!("Station {} poll failed: {}", station_id, e),
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::DisplayValue;
    use crate::state::StateStore;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Scripted responses per URL, consumed in order.
    #[derive(Default)]
    struct FakeFetcher {
        responses: Mutex<HashMap<String, VecDeque<Result<String, FetchError>>>>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn push(&self, station_id: &str, response: Result<&str, FetchError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(viva::station_url(station_id))
                .or_default()
                .push_back(response.map(String::from));
        }

        fn next(&self, url: &str) -> Result<String, FetchError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|q| q.pop_front())
                .unwrap_or(Err(FetchError::Status(404)))
        }
    }

    impl Fetch for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            self.next(url)
        }
    }

    impl FetchBlocking for FakeFetcher {
        fn fetch_blocking(&self, url: &str) -> Result<String, FetchError> {
            self.next(url)
        }
    }

    fn body(station: &str, samples: &[(&str, &str, Option<&str>)]) -> String {
        let samples: Vec<_> = samples
            .iter()
            .map(|(name, value, trend)| {
                let mut s = serde_json::json!({
                    "Name": name,
                    "Value": value,
                    "Unit": "cm",
                    "Type": "level",
                    "Updated": "2024-05-01 12:00:00",
                });
                if let Some(trend) = trend {
                    s["Trend"] = serde_json::json!(trend);
                }
                s
            })
            .collect();
        serde_json::json!({
            "GetSingleStationResult": { "Name": station, "Samples": samples }
        })
        .to_string()
    }

    fn test_app_state() -> AppState {
        AppState {
            store: StateStore::new(64),
            stations: vec!["111".into(), "222".into()],
        }
    }

    #[test]
    fn test_setup_creates_sensor_per_sample() {
        let fetcher = FakeFetcher::default();
        let b = body("Ystad", &[("Vattenstånd", "12 cm", None), ("Medelvind", "7.4", None)]);
        fetcher.push("2", Ok(&b));

        let poller = StationPoller::setup_blocking(&fetcher, "S", "2", ValueMode::Raw).unwrap();
        let ids: Vec<_> = poller.sensors().iter().map(|s| s.composite_id()).collect();
        assert_eq!(ids, vec!["S_Ystad_Vattenstånd", "S_Ystad_Medelvind"]);
        assert_eq!(
            poller.sensors()[0].display_value(),
            Some(&DisplayValue::Text("12 cm".into()))
        );
        assert_eq!(
            fetcher.requests.lock().unwrap()[0],
            "https://services.viva.sjofartsverket.se:8080/output/vivaoutputservice.svc/vivastation/2"
        );
    }

    #[test]
    fn test_poll_updates_matching_sensors() {
        let fetcher = FakeFetcher::default();
        let first = body("Ystad", &[("Vattenstånd", "12 cm", None), ("Medelvind", "7.4", None)]);
        let second = body("Ystad", &[("Vattenstånd", "14 cm", None)]);
        fetcher.push("2", Ok(&first));
        fetcher.push("2", Ok(&second));

        let mut poller = StationPoller::setup_blocking(&fetcher, "S", "2", ValueMode::Raw).unwrap();
        assert_eq!(poller.poll_blocking(&fetcher).unwrap(), 1);
        assert_eq!(
            poller.sensors()[0].display_value(),
            Some(&DisplayValue::Text("14 cm".into()))
        );
        // Missing sample: stale, not cleared
        assert_eq!(
            poller.sensors()[1].display_value(),
            Some(&DisplayValue::Text("7.4".into()))
        );
    }

    #[test]
    fn test_updates_never_exceed_samples() {
        let record = viva::parse_station(&body("Ystad", &[("A", "1", None), ("B", "2", None)])).unwrap();
        let mut poller = StationPoller::from_record("S", "2", ValueMode::Raw, &record);
        let smaller = viva::parse_station(&body("Ystad", &[("B", "3", None), ("C", "4", None)])).unwrap();
        let updated = poller.apply(&smaller);
        assert!(updated <= smaller.samples.len());
        assert_eq!(updated, 1);
    }

    #[test]
    fn test_renamed_station_goes_stale() {
        let record = viva::parse_station(&body("Ystad", &[("A", "1", None)])).unwrap();
        let mut poller = StationPoller::from_record("S", "2", ValueMode::Raw, &record);

        let renamed = viva::parse_station(&body("Ystad hamn", &[("A", "9", None)])).unwrap();
        assert_eq!(poller.apply(&renamed), 0);
        assert_eq!(poller.sensors()[0].composite_id(), "S_Ystad_A");
        assert_eq!(
            poller.sensors()[0].display_value(),
            Some(&DisplayValue::Text("1".into()))
        );
    }

    #[test]
    fn test_malformed_body_leaves_sensors_untouched() {
        let record = viva::parse_station(&body("Ystad", &[("A", "1", Some("Stigande"))])).unwrap();
        let mut poller = StationPoller::from_record("S", "2", ValueMode::Raw, &record);
        let before = poller.sensors().to_vec();

        let result = poller.apply_body(r#"{"unexpected": true}"#);
        assert!(matches!(result, Err(PollError::Shape(_))));
        assert_eq!(poller.sensors(), before.as_slice());
    }

    #[test]
    fn test_fetch_error_leaves_sensors_untouched() {
        let fetcher = FakeFetcher::default();
        let b = body("Ystad", &[("A", "1", None)]);
        fetcher.push("2", Ok(&b));
        fetcher.push("2", Err(FetchError::EmptyBody));

        let mut poller = StationPoller::setup_blocking(&fetcher, "S", "2", ValueMode::Raw).unwrap();
        let before = poller.sensors().to_vec();
        let result = poller.poll_blocking(&fetcher);
        assert!(matches!(result, Err(PollError::Fetch(FetchError::EmptyBody))));
        assert_eq!(poller.sensors(), before.as_slice());
    }

    #[test]
    fn test_identical_polls_are_idempotent() {
        let b = body("Ystad", &[("A", "12.5 cm", Some("Stigande"))]);
        let record = viva::parse_station(&b).unwrap();
        let mut poller = StationPoller::from_record("S", "2", ValueMode::Numeric, &record);
        poller.apply_body(&b).unwrap();
        let once = poller.sensors()[0].attributes().clone();
        poller.apply_body(&b).unwrap();
        assert_eq!(poller.sensors()[0].attributes(), &once);
    }

    #[test]
    fn test_missing_trend_is_retained() {
        let with_trend = body("Ystad", &[("A", "1", Some("Stigande"))]);
        let without = body("Ystad", &[("A", "2", None)]);
        let record = viva::parse_station(&with_trend).unwrap();
        let mut poller = StationPoller::from_record("S", "2", ValueMode::Raw, &record);
        poller.apply_body(&without).unwrap();
        assert_eq!(poller.sensors()[0].attributes()["Trend"], "Stigande");
    }

    #[test]
    fn test_duplicate_sample_names_map_to_first() {
        let b = body("Ystad", &[("A", "1", None), ("A", "2", None)]);
        let record = viva::parse_station(&b).unwrap();
        let poller = StationPoller::from_record("S", "2", ValueMode::Raw, &record);
        assert_eq!(poller.sensors().len(), 2);
        for sensor in poller.sensors() {
            assert_eq!(sensor.display_value(), Some(&DisplayValue::Text("1".into())));
        }
    }

    #[test]
    fn test_poll_once_isolates_failures() {
        let app = test_app_state();
        let fetcher = FakeFetcher::default();
        let b = body("Visby", &[("A", "2", None), ("B", "3", None)]);
        fetcher.push("111", Err(FetchError::Status(500)));
        fetcher.push("222", Ok(&b));

        assert_eq!(poll_once_blocking(&fetcher, &app, "S", ValueMode::Raw), 1);
        assert_eq!(app.store.len(), 2);
        assert_eq!(app.store.get("S_Visby_B").unwrap().state, "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_pollers_retry_independently() {
        let app = Arc::new(test_app_state());
        let fetcher = FakeFetcher::default();
        let ok_111 = body("Ystad", &[("A", "1", None)]);
        let ok_222 = body("Visby", &[("A", "2", None)]);
        fetcher.push("111", Err(FetchError::Status(503)));
        fetcher.push("111", Ok(&ok_111));
        fetcher.push("222", Ok(&ok_222));
        let fetcher = Arc::new(fetcher);

        let stations = app.stations.clone();
        start_all(
            app.clone(),
            fetcher.clone(),
            "S",
            &stations,
            ValueMode::Raw,
            crate::config::POLL_INTERVAL,
        );

        // First tick: 111 fails, 222 publishes
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(app.store.get("S_Ystad_A").is_none());
        assert_eq!(app.store.get("S_Visby_A").unwrap().state, "2");

        // Second tick: 111 recovers, 222 keeps its last value through a failed poll
        tokio::time::sleep(crate::config::POLL_INTERVAL).await;
        assert_eq!(app.store.get("S_Ystad_A").unwrap().state, "1");
        assert_eq!(app.store.get("S_Visby_A").unwrap().state, "2");

        let requests = fetcher.requests.lock().unwrap();
        let count = |id: &str| requests.iter().filter(|u| **u == viva::station_url(id)).count();
        assert_eq!(count("111"), 2);
        assert_eq!(count("222"), 2);
    }

    #[tokio::test]
    async fn test_async_setup_and_poll() {
        let fetcher = FakeFetcher::default();
        let first = body("Ystad", &[("A", "12.5 cm", None)]);
        let second = body("Ystad", &[("A", "13 cm", None)]);
        fetcher.push("2", Ok(&first));
        fetcher.push("2", Ok(&second));

        let mut poller = StationPoller::setup(&fetcher, "S", "2", ValueMode::Numeric)
            .await
            .unwrap();
        assert_eq!(poller.sensors()[0].display_value(), Some(&DisplayValue::Number(12.5)));
        assert_eq!(poller.poll(&fetcher).await.unwrap(), 1);
        assert_eq!(poller.sensors()[0].display_value(), Some(&DisplayValue::Number(13.0)));
        assert_eq!(poller.sensors()[0].attributes()["Additional"], " cm");
    }

    #[tokio::test]
    async fn test_task_retries_setup_after_failure() {
        let app = test_app_state();
        let fetcher = FakeFetcher::default();
        let b = body("Ystad", &[("A", "1", None)]);
        fetcher.push("2", Err(FetchError::Status(503)));
        fetcher.push("2", Ok(&b));

        let mut task = StationTask::new("S", "2", ValueMode::Raw);
        assert!(task.tick(&fetcher, &app).await.is_err());
        assert!(task.poller().is_none());
        assert_eq!(app.store.len(), 0);

        assert_eq!(task.tick(&fetcher, &app).await.unwrap(), 1);
        assert_eq!(app.store.get("S_Ystad_A").unwrap().state, "1");
    }

    #[tokio::test]
    async fn test_stations_fail_independently() {
        let app = test_app_state();
        let fetcher = FakeFetcher::default();
        let ok_111 = body("Ystad", &[("A", "1", None)]);
        let ok_222 = body("Visby", &[("A", "2", None)]);
        let next_222 = body("Visby", &[("A", "3", None)]);
        fetcher.push("111", Ok(&ok_111));
        fetcher.push("111", Ok(r#"{"unexpected": true}"#));
        fetcher.push("222", Ok(&ok_222));
        fetcher.push("222", Ok(&next_222));

        let mut tasks: Vec<_> = app
            .stations
            .iter()
            .map(|id| StationTask::new("S", id, ValueMode::Raw))
            .collect();
        for task in &mut tasks {
            task.tick(&fetcher, &app).await.unwrap();
        }

        assert!(matches!(
            tasks[0].tick(&fetcher, &app).await,
            Err(PollError::Shape(_))
        ));
        assert_eq!(tasks[1].tick(&fetcher, &app).await.unwrap(), 1);

        assert_eq!(app.store.get("S_Ystad_A").unwrap().state, "1");
        assert_eq!(app.store.get("S_Visby_A").unwrap().state, "3");
        assert_eq!(tasks[0].poller().unwrap().station_id(), "111");
        assert_eq!(tasks[1].poller().unwrap().station_id(), "222");
    }
}
