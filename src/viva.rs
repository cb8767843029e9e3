//! Sjöfartsverket ViVa station service
//!
//! One GET per station returns every sample the station currently reports:
//!
//! ```text
//! GET <VIVA_ENDPOINT><station id>
//! { "GetSingleStationResult": { "Name": "...", "Samples": [ {...}, ... ] } }
//! ```
//!
//! No API key. The response shape is fixed; anything else is a shape error.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

pub const VIVA_ENDPOINT: &str =
    "https://services.viva.sjofartsverket.se:8080/output/vivaoutputservice.svc/vivastation/";

const USER_AGENT: &str = concat!("sjofart/", env!("CARGO_PKG_VERSION"));

/// Request URL for one station. The id is appended as-is.
pub fn station_url(station_id: &str) -> String {
    format!("{}{}", VIVA_ENDPOINT, station_id)
}

// ── Response structures ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StationResponse {
    #[serde(rename = "GetSingleStationResult")]
    result: StationRecord,
}

/// One station as reported by a single poll.
#[derive(Debug, Clone, Deserialize)]
pub struct StationRecord {
    #[serde(rename = "Name")]
    pub station_name: String,
    #[serde(rename = "Samples")]
    pub samples: Vec<SampleRecord>,
}

/// One measurement stream of a station (water level, wind, ...).
///
/// The optional fields are kept as raw JSON so that any truthy value the
/// service sends can be copied into the sensor attributes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SampleRecord {
    pub name: String,
    pub value: String,
    pub unit: String,
    #[serde(rename = "Type")]
    pub sample_type: String,
    pub updated: String,
    #[serde(default)]
    pub trend: Option<Value>,
    #[serde(default)]
    pub msg: Option<Value>,
    #[serde(default)]
    pub calm: Option<Value>,
    #[serde(default)]
    pub heading: Option<Value>,
    #[serde(default)]
    pub water_level_reference: Option<Value>,
    #[serde(default)]
    pub water_level_offset: Option<Value>,
}

impl SampleRecord {
    /// Optional side attributes, keyed by their wire names.
    pub fn optional_attributes(&self) -> [(&'static str, Option<&Value>); 6] {
        [
            ("Trend", self.trend.as_ref()),
            ("Msg", self.msg.as_ref()),
            ("Calm", self.calm.as_ref()),
            ("Heading", self.heading.as_ref()),
            ("WaterLevelReference", self.water_level_reference.as_ref()),
            ("WaterLevelOffset", self.water_level_offset.as_ref()),
        ]
    }
}

/// Decode a raw response body into a station record.
pub fn parse_station(body: &str) -> Result<StationRecord, serde_json::Error> {
    let resp: StationResponse = serde_json::from_str(body)?;
    Ok(resp.result)
}

// ── Fetch boundary ─────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("ViVa returned HTTP {0}")]
    Status(u16),
    #[error("ViVa returned an empty body")]
    EmptyBody,
}

/// Awaitable GET returning the response body.
pub trait Fetch {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// Blocking GET returning the response body.
pub trait FetchBlocking {
    fn fetch_blocking(&self, url: &str) -> Result<String, FetchError>;
}

fn non_empty(body: String) -> Result<String, FetchError> {
    if body.trim().is_empty() {
        Err(FetchError::EmptyBody)
    } else {
        Ok(body)
    }
}

/// Async reqwest client with certificate verification and a request timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        non_empty(resp.text().await?)
    }
}

/// Blocking counterpart of [`HttpFetcher`]. Must not be built or dropped
/// inside an async runtime.
pub struct BlockingHttpFetcher {
    client: reqwest::blocking::Client,
}

impl BlockingHttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl FetchBlocking for BlockingHttpFetcher {
    fn fetch_blocking(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        non_empty(resp.text()?)
    }
}
