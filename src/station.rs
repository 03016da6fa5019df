use crate::archive::SensorMetadata;
use crate::config::ArchiveConfig;
use crate::db::models::{Sensor, Station, StationRef};
use crate::db::Repository;
use crate::downloader::{DownloadRequest, MetadataSource, SensorDownloader};
use crate::error::{AppError, Result};
use crate::executor::MonthlyFiles;
use crate::sensor_type::ArchiveType;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DownloaderSettings {
    /// Root under which each station gets its own folder
    pub output_dir: PathBuf,
    pub max_workers: usize,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone)]
pub struct SensorReport {
    pub sensor_id: i64,
    pub sensor_type: ArchiveType,
    pub files: MonthlyFiles,
    pub total_files: usize,
    /// Folder holding this sensor's month directories
    pub output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum SensorOutcome {
    Success(SensorReport),
    Failed { error: String },
    Skipped { reason: String },
}

impl SensorOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SensorOutcome::Success(_))
    }
}

#[derive(Debug, Clone)]
pub struct SensorSummary {
    pub sensor_id: Option<i64>,
    pub sensor_type: String,
    pub manufacturer: String,
    pub archive_type: Option<ArchiveType>,
}

#[derive(Debug, Clone)]
pub struct StationSummary {
    pub station_id: i32,
    pub station_uid: Uuid,
    pub station_name: String,
    pub location: String,
    pub coordinates: Option<(f64, f64)>,
    pub output_directory: PathBuf,
    pub max_workers: usize,
    pub sensors: Vec<SensorSummary>,
}

/// Downloads the archive data of every sensor attached to one station.
pub struct StationDownloader {
    station: Station,
    sensors: Vec<Sensor>,
    downloader: SensorDownloader,
}

impl StationDownloader {
    /// Creates `<output_dir>/<station directory name>` right away
    pub async fn new(
        station: Station,
        sensors: Vec<Sensor>,
        settings: &DownloaderSettings,
    ) -> Result<Self> {
        let station_dir = settings.output_dir.join(station.directory_name());
        tokio::fs::create_dir_all(&station_dir).await?;

        info!(
            "Station '{}' ({} sensor(s)) -> {}",
            station.name,
            sensors.len(),
            station_dir.display()
        );

        Ok(Self {
            station,
            sensors,
            downloader: SensorDownloader::new(
                settings.archive.clone(),
                station_dir,
                settings.max_workers,
            ),
        })
    }

    pub async fn load(
        repository: &Repository,
        station: StationRef,
        settings: &DownloaderSettings,
    ) -> Result<Self> {
        let station = repository.find_station(station).await?;
        let sensors = repository.list_sensors(station.id).await?;
        Self::new(station, sensors, settings).await
    }

    pub fn station(&self) -> &Station {
        &self.station
    }

    pub fn station_dir(&self) -> &Path {
        self.downloader.station_dir()
    }

    /// Placeholder metadata from the station when it has coordinates
    fn metadata_for(&self, sensor_id: i64) -> MetadataSource {
        match self.station.coordinates() {
            Some((lat, lon)) => MetadataSource::Known(SensorMetadata::new(
                sensor_id,
                self.station.location_label(),
                lat,
                lon,
            )),
            None => MetadataSource::FetchFromApi,
        }
    }

    async fn run_sensor(
        &self,
        sensor_id: i64,
        sensor_type: ArchiveType,
        request: &DownloadRequest,
    ) -> Result<SensorReport> {
        let run = self
            .downloader
            .download(sensor_id, Some(sensor_type), self.metadata_for(sensor_id), request)
            .await?;

        Ok(SensorReport {
            sensor_id,
            sensor_type,
            total_files: run.total_files(),
            files: run.execution.files,
            output_path: self.downloader.sensor_dir(sensor_id),
        })
    }

    /// Download every sensor of the station, or only those in `sensor_ids`
    /// when it is non-empty. A failing sensor never stops the others.
    pub async fn download_all_sensors(
        &self,
        sensor_ids: &[i64],
        request: &DownloadRequest,
    ) -> BTreeMap<i64, SensorOutcome> {
        let mut outcomes = BTreeMap::new();

        for sensor in &self.sensors {
            let Some(sensor_id) = sensor.sensor_id else {
                warn!("Skipping {}: no archive sensor id", sensor);
                continue;
            };
            if !sensor_ids.is_empty() && !sensor_ids.contains(&sensor_id) {
                continue;
            }

            let sensor_type = match ArchiveType::from_type_name(&sensor.sensor_type_name) {
                Ok(t) => t,
                Err(unsupported) => {
                    warn!("Skipping sensor {}: {}", sensor_id, unsupported);
                    outcomes.insert(
                        sensor_id,
                        SensorOutcome::Skipped {
                            reason: unsupported.to_string(),
                        },
                    );
                    continue;
                }
            };

            let outcome = match self.run_sensor(sensor_id, sensor_type, request).await {
                Ok(report) => {
                    info!(
                        "Sensor {} ({}): {} file(s)",
                        sensor_id, sensor_type, report.total_files
                    );
                    SensorOutcome::Success(report)
                }
                Err(e) => {
                    error!("Sensor {} ({}) failed: {}", sensor_id, sensor_type, e);
                    SensorOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            outcomes.insert(sensor_id, outcome);
        }

        outcomes
    }

    pub async fn download_specific_sensor(
        &self,
        sensor_id: i64,
        request: &DownloadRequest,
    ) -> Result<SensorReport> {
        let sensor = self
            .sensors
            .iter()
            .find(|s| s.sensor_id == Some(sensor_id))
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Sensor {} not found in station '{}'",
                    sensor_id, self.station.name
                ))
            })?;

        let sensor_type = ArchiveType::from_type_name(&sensor.sensor_type_name)
            .map_err(|e| AppError::UnsupportedSensorType(e.to_string()))?;

        self.run_sensor(sensor_id, sensor_type, request).await
    }

    pub fn summary(&self) -> StationSummary {
        StationSummary {
            station_id: self.station.id,
            station_uid: self.station.uid,
            station_name: self.station.name.clone(),
            location: self.station.location_label().to_string(),
            coordinates: self.station.coordinates(),
            output_directory: self.station_dir().to_path_buf(),
            max_workers: self.downloader.max_workers(),
            sensors: self
                .sensors
                .iter()
                .map(|s| SensorSummary {
                    sensor_id: s.sensor_id,
                    sensor_type: s.sensor_type_name.clone(),
                    manufacturer: s.sensor_type_manufacturer.clone(),
                    archive_type: ArchiveType::from_type_name(&s.sensor_type_name).ok(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StationOutcome {
    Completed(BTreeMap<i64, SensorOutcome>),
    Failed { error: String },
}

impl StationOutcome {
    /// `(succeeded, failed)` sensors; skipped sensors count as neither
    pub fn sensor_counts(&self) -> (usize, usize) {
        let StationOutcome::Completed(sensors) = self else {
            return (0, 0);
        };

        sensors
            .values()
            .fold((0, 0), |(ok, bad), outcome| match outcome {
                SensorOutcome::Success(_) => (ok + 1, bad),
                SensorOutcome::Failed { .. } => (ok, bad + 1),
                SensorOutcome::Skipped { .. } => (ok, bad),
            })
    }
}

/// Run [`StationDownloader::download_all_sensors`] for each station in turn.
///
/// A station that cannot be loaded is recorded and the rest continue.
pub async fn download_multiple_stations(
    repository: &Repository,
    stations: &[StationRef],
    sensor_ids: &[i64],
    request: &DownloadRequest,
    settings: &DownloaderSettings,
) -> Vec<(StationRef, StationOutcome)> {
    let mut results = Vec::with_capacity(stations.len());

    for &station in stations {
        let outcome = match StationDownloader::load(repository, station, settings).await {
            Ok(downloader) => {
                StationOutcome::Completed(downloader.download_all_sensors(sensor_ids, request).await)
            }
            Err(e) => {
                error!("Station {} failed: {}", station, e);
                StationOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        results.push((station, outcome));
    }

    let failed_stations = results
        .iter()
        .filter(|(_, o)| matches!(o, StationOutcome::Failed { .. }))
        .count();
    let (succeeded, failed) = results
        .iter()
        .map(|(_, o)| o.sensor_counts())
        .fold((0, 0), |(ok, bad), (o, b)| (ok + o, bad + b));

    info!(
        "Processed {} station(s) ({} failed): {} sensor(s) succeeded, {} failed",
        results.len(),
        failed_stations,
        succeeded,
        failed
    );

    results
}
