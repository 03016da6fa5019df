use crate::archive::{ArchiveClient, SensorMetadata};
use crate::config::{ArchiveConfig, DownloadConfig};
use crate::error::Result;
use crate::executor::{self, ExecutionReport, ExecutorOptions, MonthlyFiles};
use crate::merge::{self, MergeOutcome};
use crate::sensor_type::ArchiveType;
use crate::tasks::{build_tasks, month_key};
use chrono::{Datelike, Days, Local, NaiveDate};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Date range and switches for one download run
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub start_date: NaiveDate,
    /// Today when `None`
    pub end_date: Option<NaiveDate>,
    pub merge: bool,
    pub merge_by_year: bool,
    pub create_missing: bool,
    pub list_only: bool,
    /// Days on or after this date may not be published yet: they get no
    /// placeholder, and their month and year are not merged.
    pub unsettled_from: Option<NaiveDate>,
}

impl DownloadRequest {
    pub fn new(start_date: NaiveDate, end_date: Option<NaiveDate>) -> Self {
        Self {
            start_date,
            end_date,
            merge: true,
            merge_by_year: false,
            create_missing: true,
            list_only: false,
            unsettled_from: None,
        }
    }

    /// For runs that repeat: with an open end date, yesterday and today stay
    /// unsettled so a later run can still fetch their real files.
    pub fn defer_recent_days(mut self, today: NaiveDate) -> Self {
        if self.end_date.is_none() {
            self.unsettled_from = today.checked_sub_days(Days::new(1));
        }
        self
    }

    fn is_settled_month(&self, month: &str) -> bool {
        self.unsettled_from
            .map_or(true, |cutoff| month < month_key(cutoff).as_str())
    }

    pub fn end_or_today(&self) -> NaiveDate {
        self.end_date.unwrap_or_else(|| Local::now().date_naive())
    }
}

impl From<&DownloadConfig> for DownloadRequest {
    fn from(config: &DownloadConfig) -> Self {
        Self {
            start_date: config.start_date,
            end_date: config.end_date,
            merge: config.merge,
            merge_by_year: config.merge_by_year,
            create_missing: config.create_missing,
            list_only: config.list_only,
            unsettled_from: None,
        }
    }
}

/// Where placeholder metadata comes from
#[derive(Debug, Clone)]
pub enum MetadataSource {
    Known(SensorMetadata),
    FetchFromApi,
}

#[derive(Debug, Clone, Default)]
pub struct SensorRun {
    pub execution: ExecutionReport,
    pub monthly_merges: BTreeMap<String, MergeOutcome>,
    pub yearly_merges: BTreeMap<String, MergeOutcome>,
}

impl SensorRun {
    pub fn files(&self) -> &MonthlyFiles {
        &self.execution.files
    }

    pub fn total_files(&self) -> usize {
        self.execution.total_files()
    }
}

/// Download → placeholder → merge pipeline for sensors of one station folder
#[derive(Debug, Clone)]
pub struct SensorDownloader {
    archive: ArchiveConfig,
    station_dir: PathBuf,
    max_workers: usize,
}

impl SensorDownloader {
    pub fn new(archive: ArchiveConfig, station_dir: impl Into<PathBuf>, max_workers: usize) -> Self {
        Self {
            archive,
            station_dir: station_dir.into(),
            max_workers,
        }
    }

    pub fn station_dir(&self) -> &Path {
        &self.station_dir
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Folder holding a sensor's month directories
    pub fn sensor_dir(&self, sensor_id: i64) -> PathBuf {
        self.station_dir.join(sensor_id.to_string())
    }

    /// Run the whole pipeline for one sensor.
    ///
    /// Downloads for every day finish before any merge starts. Merge errors
    /// are logged and leave the downloaded files in place.
    pub async fn download(
        &self,
        sensor_id: i64,
        sensor_type: Option<ArchiveType>,
        metadata: MetadataSource,
        request: &DownloadRequest,
    ) -> Result<SensorRun> {
        let end = request.end_or_today();
        info!(
            "Sensor {} ({}): {} to {}",
            sensor_id,
            sensor_type.map(|t| t.token()).unwrap_or("any common type"),
            request.start_date,
            end
        );

        let metadata = match metadata {
            MetadataSource::Known(metadata) => metadata,
            MetadataSource::FetchFromApi if sensor_type.is_some() => {
                ArchiveClient::new(&self.archive)?
                    .fetch_metadata(sensor_id)
                    .await
            }
            MetadataSource::FetchFromApi => SensorMetadata::unknown(sensor_id),
        };

        let sensor_dir = self.sensor_dir(sensor_id);
        tokio::fs::create_dir_all(&sensor_dir).await?;

        let start = request.start_date;
        let create_missing = request.create_missing && !request.list_only;
        let mut plan = tokio::task::spawn_blocking(move || {
            build_tasks(&sensor_dir, start, end, sensor_id, sensor_type, create_missing)
        })
        .await??;

        if let Some(cutoff) = request.unsettled_from {
            for task in plan.tasks.iter_mut().filter(|t| t.date >= cutoff) {
                task.create_missing = false;
            }
        }

        let execution = executor::execute(
            plan,
            &self.archive,
            Arc::new(metadata),
            ExecutorOptions {
                max_workers: self.max_workers,
                list_only: request.list_only,
            },
        )
        .await?;

        let mut run = SensorRun {
            execution,
            ..SensorRun::default()
        };

        for (month, files) in run.files() {
            info!("  {}: {} file(s)", month, files.len());
        }

        if request.list_only || run.total_files() == 0 {
            return Ok(run);
        }

        if request.merge {
            let months: Vec<String> = run
                .files()
                .iter()
                .filter(|(_, files)| !files.is_empty())
                .map(|(month, _)| month.clone())
                .filter(|month| {
                    let settled = request.is_settled_month(month);
                    if !settled {
                        info!("  {}: not merged yet, recent days may still be published", month);
                    }
                    settled
                })
                .collect();
            run.monthly_merges = self.merge_months(sensor_id, sensor_type, months).await;
        }

        if request.merge_by_year {
            let station_dir = self.station_dir.clone();
            let open_year = request.unsettled_from.map(|d| d.year());
            match tokio::task::spawn_blocking(move || {
                merge::merge_years(&station_dir, sensor_id, open_year)
            })
            .await
            {
                Ok(Ok(outcomes)) => run.yearly_merges = outcomes,
                Ok(Err(e)) => warn!("Yearly merge for sensor {} failed: {}", sensor_id, e),
                Err(e) => warn!("Yearly merge for sensor {} aborted: {}", sensor_id, e),
            }
        }

        Ok(run)
    }

    async fn merge_months(
        &self,
        sensor_id: i64,
        sensor_type: Option<ArchiveType>,
        months: Vec<String>,
    ) -> BTreeMap<String, MergeOutcome> {
        let station_dir = self.station_dir.clone();

        let merged = tokio::task::spawn_blocking(move || {
            let mut outcomes = BTreeMap::new();
            for month in months {
                match merge::merge_month(&station_dir, sensor_id, &month, sensor_type) {
                    Ok(outcome) => {
                        outcomes.insert(month, outcome);
                    }
                    Err(e) => warn!("Merging {} for sensor {} failed: {}", month, sensor_id, e),
                }
            }
            outcomes
        })
        .await;

        merged.unwrap_or_else(|e| {
            warn!("Monthly merge for sensor {} aborted: {}", sensor_id, e);
            BTreeMap::new()
        })
    }
}
