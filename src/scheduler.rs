use crate::config::Config;
use crate::db::models::StationRef;
use crate::db::Repository;
use crate::downloader::DownloadRequest;
use crate::error::Result;
use crate::station::{download_multiple_stations, DownloaderSettings, StationOutcome};
use chrono::Local;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub struct Scheduler {
    config: Config,
    repository: Arc<Repository>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        repository: Arc<Repository>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            repository,
            shutdown_rx,
        }
    }

    /// Stations named in the config, ids first
    pub fn station_refs(&self) -> Vec<StationRef> {
        let stations = &self.config.stations;
        stations
            .ids
            .iter()
            .copied()
            .map(StationRef::Id)
            .chain(stations.uids.iter().copied().map(StationRef::Uid))
            .collect()
    }

    pub async fn run(&mut self) -> Result<()> {
        let initial_delay = Duration::from_secs(self.config.scheduler.initial_delay_seconds);

        match self.config.scheduler.interval_minutes {
            Some(minutes) => info!(
                "Scheduler starting with {}s initial delay, {}m interval",
                self.config.scheduler.initial_delay_seconds, minutes
            ),
            None => info!(
                "Single download run after {}s initial delay",
                self.config.scheduler.initial_delay_seconds
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {},
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown received during initial delay");
                return Ok(());
            }
        }

        self.run_download().await;

        let Some(minutes) = self.config.scheduler.interval_minutes else {
            return Ok(());
        };

        let mut ticker = interval(Duration::from_secs(minutes * 60));
        ticker.tick().await; // First tick is immediate, skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_download().await,
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn run_download(&self) {
        info!("Starting download run");

        let download = &self.config.download;
        let mut request = DownloadRequest::from(download);
        if self.config.scheduler.interval_minutes.is_some() {
            request = request.defer_recent_days(Local::now().date_naive());
        }
        let settings = DownloaderSettings {
            output_dir: download.output_dir.clone(),
            max_workers: download.max_workers,
            archive: self.config.archive.clone(),
        };

        let results = download_multiple_stations(
            &self.repository,
            &self.station_refs(),
            &self.config.stations.sensor_ids,
            &request,
            &settings,
        )
        .await;

        let failed = results
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StationOutcome::Failed { .. }))
            .count();
        if failed > 0 {
            error!("{} of {} station(s) could not be loaded", failed, results.len());
        }

        info!("Download run completed");
    }
}
