use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{trace, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::location::FailureReason;

/// A validated `(latitude, longitude)` pair.
///
/// The only constructor checks `-90..=90` / `-180..=180`, so a value of this
/// type can always be persisted as a resolved location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeocodeError> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid {
            return Err(GeocodeError::InvalidCoordinates {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn latitude_text(&self) -> String {
        format!("{:.6}", self.latitude)
    }

    pub fn longitude_text(&self) -> String {
        format!("{:.6}", self.longitude)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("no match for address '{0}'")]
    NotFound(String),
    #[error("geocoder request failed: {0}")]
    Transient(String),
    #[error("coordinates out of range: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
}

impl GeocodeError {
    pub fn reason(&self) -> FailureReason {
        match self {
            GeocodeError::NotFound(_) => FailureReason::NotFoundUpstream,
            GeocodeError::Transient(_) => FailureReason::TransientUpstream,
            GeocodeError::InvalidCoordinates { .. } => FailureReason::InvalidCoordinates,
        }
    }
}

#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    /// Issues exactly one upstream lookup for `query_address`.
    async fn resolve(&self, query_address: &str) -> Result<Coordinates, GeocodeError>;
}

#[derive(Clone)]
pub struct GeocodingService {
    inner: Arc<dyn GeocodingProvider>,
    rate_limiter: Arc<RateLimiter>,
}

impl GeocodingService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let provider: Arc<dyn GeocodingProvider> = match config.geocoder_api_key.clone() {
            Some(key) => Arc::new(HttpGeocoder::new(
                key,
                config.geocoder_base_url.clone(),
                config.geocoder_timeout(),
            )?),
            None => {
                warn!(
                    target: "geocoder",
                    "GEOCODER_API_KEY not set; every resolution will be recorded as failed"
                );
                Arc::new(DisabledGeocoder)
            }
        };
        Ok(Self::from_provider(provider, config.geocoder_rate_limit_qps))
    }

    pub fn from_provider(provider: Arc<dyn GeocodingProvider>, qps: u32) -> Self {
        Self {
            inner: provider,
            rate_limiter: Arc::new(RateLimiter::new(qps.max(1))),
        }
    }

    pub async fn resolve(&self, query_address: &str) -> Result<Coordinates, GeocodeError> {
        self.rate_limiter.wait().await;
        self.inner.resolve(query_address).await
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(50)
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Client for the Yandex-style geocoder: `GET ?apikey=&format=json&geocode=`.
pub struct HttpGeocoder {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl HttpGeocoder {
    pub fn new(api_key: SecretString, base_url: String, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key,
            base_url,
        })
    }
}

#[derive(Deserialize)]
struct GeoResponse {
    response: GeoResponseBody,
}

#[derive(Deserialize)]
struct GeoResponseBody {
    #[serde(rename = "GeoObjectCollection")]
    collection: GeoObjectCollection,
}

#[derive(Deserialize)]
struct GeoObjectCollection {
    #[serde(rename = "featureMember", default)]
    members: Vec<FeatureMember>,
}

#[derive(Deserialize)]
struct FeatureMember {
    #[serde(rename = "GeoObject")]
    geo_object: GeoObject,
}

#[derive(Deserialize)]
struct GeoObject {
    #[serde(rename = "Point")]
    point: GeoPoint,
}

#[derive(Deserialize)]
struct GeoPoint {
    pos: String,
}

#[async_trait]
impl GeocodingProvider for HttpGeocoder {
    async fn resolve(&self, query_address: &str) -> Result<Coordinates, GeocodeError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("apikey", self.api_key.expose_secret()),
                ("format", "json"),
                ("geocode", query_address),
            ])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| GeocodeError::Transient(err.to_string()))?;

        let parsed: GeoResponse = response
            .json()
            .await
            .map_err(|err| GeocodeError::Transient(format!("malformed response: {err}")))?;

        let member = parsed
            .response
            .collection
            .members
            .into_iter()
            .next()
            .ok_or_else(|| GeocodeError::NotFound(query_address.to_string()))?;

        trace!(target: "geocoder", pos = %member.geo_object.point.pos, "geocoder match");
        parse_point(&member.geo_object.point.pos)
    }
}

/// Parses the provider's `"longitude latitude"` point into coordinates.
pub fn parse_point(pos: &str) -> Result<Coordinates, GeocodeError> {
    let mut parts = pos.split_whitespace();
    let (Some(lon), Some(lat), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(GeocodeError::Transient(format!(
            "invalid coordinates format: '{pos}'"
        )));
    };
    let longitude: f64 = lon
        .parse()
        .map_err(|_| GeocodeError::Transient(format!("invalid longitude: '{lon}'")))?;
    let latitude: f64 = lat
        .parse()
        .map_err(|_| GeocodeError::Transient(format!("invalid latitude: '{lat}'")))?;
    Coordinates::new(latitude, longitude)
}

struct DisabledGeocoder;

#[async_trait]
impl GeocodingProvider for DisabledGeocoder {
    async fn resolve(&self, _query_address: &str) -> Result<Coordinates, GeocodeError> {
        Err(GeocodeError::Transient(
            "geocoder api key not configured".into(),
        ))
    }
}
