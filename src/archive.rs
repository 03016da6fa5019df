use crate::config::ArchiveConfig;
use crate::error::{AppError, Result};
use crate::sensor_type::ArchiveType;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Location data written into placeholder rows.
///
/// Built once per sensor and passed by reference into every download and
/// placeholder call of that sensor's run.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorMetadata {
    pub sensor_id: i64,
    pub location: String,
    pub lat: String,
    pub lon: String,
}

impl SensorMetadata {
    /// Coordinates keep at least one decimal place (`23.0`, not `23`)
    pub fn new(sensor_id: i64, location: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            sensor_id,
            location: location.into(),
            lat: format!("{:?}", lat),
            lon: format!("{:?}", lon),
        }
    }

    /// Fallback used when nothing is known about the sensor's position
    pub fn unknown(sensor_id: i64) -> Self {
        Self {
            sensor_id,
            location: format!("Sensor_{}", sensor_id),
            lat: "0.0".to_string(),
            lon: "0.0".to_string(),
        }
    }
}

/// Client for the Sensor.Community file archive and metadata API.
///
/// Each instance owns its own connection pool. Download workers must each
/// build their own instance rather than share one.
pub struct ArchiveClient {
    client: Client,
    base_url: String,
    api_url: String,
    head_timeout: Duration,
    get_timeout: Duration,
    metadata_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiReading {
    #[serde(default)]
    location: Option<ApiLocation>,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    latitude: Option<serde_json::Value>,
    #[serde(default)]
    longitude: Option<serde_json::Value>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

impl ArchiveClient {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sensolog-archive/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(config.head_timeout_seconds))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            head_timeout: Duration::from_secs(config.head_timeout_seconds),
            get_timeout: Duration::from_secs(config.get_timeout_seconds),
            metadata_timeout: Duration::from_secs(config.metadata_timeout_seconds),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Archive file name: `<date>_<type>_sensor_<id>.csv`
    pub fn file_name(date: NaiveDate, sensor_id: i64, sensor_type: ArchiveType) -> String {
        format!(
            "{}_{}_sensor_{}.csv",
            date.format("%Y-%m-%d"),
            sensor_type.token(),
            sensor_id
        )
    }

    pub fn file_url(&self, date: NaiveDate, sensor_id: i64, sensor_type: ArchiveType) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            date.format("%Y-%m-%d"),
            Self::file_name(date, sensor_id, sensor_type)
        )
    }

    /// HEAD the url; only a 200 counts as present
    pub async fn file_exists(&self, url: &str) -> bool {
        let timeout = self.head_timeout;
        match self
            .send_with_retry(|| self.client.head(url).timeout(timeout))
            .await
        {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("Existence check failed for {}: {}", url, e);
                false
            }
        }
    }

    /// Remote files present for one day.
    ///
    /// With a type there is a single candidate; without one the common types
    /// are probed in turn and every hit is returned.
    pub async fn files_for_date(
        &self,
        sensor_id: i64,
        date: NaiveDate,
        sensor_type: Option<ArchiveType>,
    ) -> Vec<(ArchiveType, String)> {
        let candidates: Vec<ArchiveType> = match sensor_type {
            Some(t) => vec![t],
            None => ArchiveType::COMMON.to_vec(),
        };

        let mut found = Vec::new();
        for candidate in candidates {
            let url = self.file_url(date, sensor_id, candidate);
            debug!("Trying {}", url);
            if self.file_exists(&url).await {
                found.push((candidate, url));
            }
        }
        found
    }

    /// Download `url` into `folder`, keeping the remote file name.
    ///
    /// An already present file is returned without a request. Failures are
    /// logged and reported as `None`; a partial body never lands under the
    /// final name.
    pub async fn download_to(&self, url: &str, folder: &Path) -> Option<PathBuf> {
        let file_name = url.rsplit('/').next().filter(|name| !name.is_empty())?;
        let file_path = folder.join(file_name);

        if file_path.exists() {
            debug!("Already exists: {}", file_name);
            return Some(file_path);
        }

        match self.fetch_to_file(url, &file_path).await {
            Ok(bytes) => {
                info!("Downloaded {} ({:.1} KB)", file_name, bytes as f64 / 1024.0);
                Some(file_path)
            }
            Err(e) => {
                warn!("Download of {} failed: {}", url, e);
                None
            }
        }
    }

    async fn fetch_to_file(&self, url: &str, file_path: &Path) -> Result<u64> {
        let timeout = self.get_timeout;
        let mut response = self
            .send_with_retry(|| self.client.get(url).timeout(timeout))
            .await?
            .error_for_status()?;

        let partial_path = file_path.with_extension("csv.part");
        let mut file = tokio::fs::File::create(&partial_path).await?;
        let mut total_bytes = 0u64;

        let streamed = async {
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                total_bytes += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<(), AppError>(())
        }
        .await;
        drop(file);

        if let Err(e) = streamed {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(e);
        }

        tokio::fs::rename(&partial_path, file_path).await?;
        Ok(total_bytes)
    }

    /// Look up a sensor's position from the live API.
    ///
    /// Never fails: any error yields [`SensorMetadata::unknown`].
    pub async fn fetch_metadata(&self, sensor_id: i64) -> SensorMetadata {
        match self.fetch_metadata_impl(sensor_id).await {
            Ok(metadata) => {
                info!(
                    "Metadata for sensor {}: {} ({}, {})",
                    sensor_id, metadata.location, metadata.lat, metadata.lon
                );
                metadata
            }
            Err(e) => {
                warn!(
                    "Could not fetch metadata for sensor {}: {}. Using defaults",
                    sensor_id, e
                );
                SensorMetadata::unknown(sensor_id)
            }
        }
    }

    async fn fetch_metadata_impl(&self, sensor_id: i64) -> Result<SensorMetadata> {
        let url = format!("{}/{}/", self.api_url, sensor_id);
        debug!("Fetching sensor metadata from {}", url);

        let timeout = self.metadata_timeout;
        let body = self
            .send_with_retry(|| self.client.get(&url).timeout(timeout))
            .await?
            .error_for_status()?
            .text()
            .await?;

        let readings: Vec<ApiReading> = serde_json::from_str(&body)
            .map_err(|e| AppError::InvalidData(format!("Malformed API response: {}", e)))?;

        let location = readings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("No API data for sensor {}", sensor_id)))?
            .location
            .ok_or_else(|| {
                AppError::InvalidData(format!("API data for sensor {} has no location", sensor_id))
            })?;

        Ok(metadata_from_location(sensor_id, location))
    }

    /// Send a request, retrying rate limits, gateway errors, timeouts and
    /// refused connections with exponential backoff.
    ///
    /// A retryable status that persists past the last retry is returned as
    /// an `Ok` response for the caller to inspect.
    async fn send_with_retry<F>(&self, mut build: F) -> Result<Response>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut retries = 0;
        loop {
            let outcome = build().send().await;

            let should_retry = match &outcome {
                Ok(response) => is_retryable_status(response.status()),
                Err(e) => e.is_timeout() || e.is_connect(),
            };

            if !should_retry || retries >= self.max_retries {
                return outcome.map_err(AppError::from);
            }

            retries += 1;
            let delay = self
                .retry_backoff
                .saturating_mul(2u32.saturating_pow(retries - 1));
            match &outcome {
                Ok(response) => warn!(
                    "{} returned {} (attempt {}/{}). Retrying in {:?}...",
                    response.url(),
                    response.status(),
                    retries,
                    self.max_retries,
                    delay
                ),
                Err(e) => warn!(
                    "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                    retries, self.max_retries, e, delay
                ),
            }
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

fn json_coordinate(value: Option<serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => "0.0".to_string(),
    }
}

fn metadata_from_location(sensor_id: i64, location: ApiLocation) -> SensorMetadata {
    let country = location.country.filter(|c| !c.is_empty());
    let city = location.city.filter(|c| !c.is_empty());

    let label = match (city, country) {
        (Some(city), Some(country)) => format!("{}, {}", city, country),
        (None, Some(country)) => country,
        _ => location
            .location
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| format!("Location_{}", location.id.unwrap_or(0))),
    };

    SensorMetadata {
        sensor_id,
        location: label,
        lat: json_coordinate(location.latitude),
        lon: json_coordinate(location.longitude),
    }
}
