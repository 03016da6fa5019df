use crate::archive::{ArchiveClient, SensorMetadata};
use crate::config::ArchiveConfig;
use crate::error::{AppError, Result};
use crate::placeholder::write_placeholder;
use crate::tasks::{DownloadTask, TaskPlan};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Local files per `YYYY-MM`
pub type MonthlyFiles = BTreeMap<String, Vec<PathBuf>>;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    pub max_workers: usize,
    /// Record remote URLs instead of downloading
    pub list_only: bool,
}

/// What happened to one day
#[derive(Debug)]
enum DayOutcome {
    Reused(PathBuf),
    Downloaded(Vec<PathBuf>),
    Placeholder(PathBuf),
    Listed(Vec<String>),
    Missing,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub files: MonthlyFiles,
    /// Only filled in list-only mode
    pub remote_urls: BTreeMap<String, Vec<String>>,
    pub reused: usize,
    pub downloaded: usize,
    pub placeholders: usize,
    pub missing: usize,
    pub failed: usize,
}

impl ExecutionReport {
    fn with_months(months: &[String]) -> Self {
        let mut report = Self::default();
        for month in months {
            report.files.insert(month.clone(), Vec::new());
        }
        report
    }

    pub fn total_files(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    fn record(&mut self, month: String, outcome: DayOutcome) {
        match outcome {
            DayOutcome::Reused(path) => {
                self.reused += 1;
                self.files.entry(month).or_default().push(path);
            }
            DayOutcome::Downloaded(paths) => {
                self.downloaded += paths.len();
                self.files.entry(month).or_default().extend(paths);
            }
            DayOutcome::Placeholder(path) => {
                self.placeholders += 1;
                self.files.entry(month).or_default().push(path);
            }
            DayOutcome::Listed(urls) => {
                self.remote_urls.entry(month).or_default().extend(urls);
            }
            DayOutcome::Missing => self.missing += 1,
            DayOutcome::Failed => self.failed += 1,
        }
    }

    /// Fold a worker's partial report in; keyed by month so completion order
    /// does not matter.
    fn absorb(&mut self, other: ExecutionReport) {
        for (month, files) in other.files {
            self.files.entry(month).or_default().extend(files);
        }
        for (month, urls) in other.remote_urls {
            self.remote_urls.entry(month).or_default().extend(urls);
        }
        self.reused += other.reused;
        self.downloaded += other.downloaded;
        self.placeholders += other.placeholders;
        self.missing += other.missing;
        self.failed += other.failed;
    }

    fn sort(&mut self) {
        for files in self.files.values_mut() {
            files.sort();
        }
        for urls in self.remote_urls.values_mut() {
            urls.sort();
        }
    }
}

/// Run every task of `plan` on a bounded pool of workers.
///
/// Each worker owns its own [`ArchiveClient`]. A failing day is logged and
/// counted; it never stops the other days.
pub async fn execute(
    plan: TaskPlan,
    archive: &ArchiveConfig,
    metadata: Arc<SensorMetadata>,
    options: ExecutorOptions,
) -> Result<ExecutionReport> {
    if options.max_workers == 0 {
        return Err(AppError::Config(
            "max_workers must be at least 1".to_string(),
        ));
    }

    let mut report = ExecutionReport::with_months(&plan.months);
    if plan.tasks.is_empty() {
        return Ok(report);
    }

    let worker_count = options.max_workers.min(plan.tasks.len());
    let total_tasks = plan.tasks.len();
    let queue = Arc::new(Mutex::new(VecDeque::from(plan.tasks)));

    debug!(
        "Running {} day task(s) on {} worker(s)",
        total_tasks, worker_count
    );

    let mut workers = JoinSet::new();
    for worker_id in 0..worker_count {
        let client = ArchiveClient::new(archive)?;
        let queue = Arc::clone(&queue);
        let metadata = Arc::clone(&metadata);
        let list_only = options.list_only;

        workers.spawn(async move {
            let mut local = ExecutionReport::default();
            loop {
                let next = queue.lock().await.pop_front();
                let Some(task) = next else { break };

                let outcome = process_task(&client, &task, &metadata, list_only).await;
                local.record(task.month, outcome);
            }
            debug!("Worker {} finished", worker_id);
            local
        });
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(partial) => report.absorb(partial),
            Err(e) => error!("Download worker aborted: {}", e),
        }
    }

    report.sort();

    info!(
        "Sensor {}: {} downloaded, {} already present, {} placeholders, {} missing, {} failed",
        metadata.sensor_id,
        report.downloaded,
        report.reused,
        report.placeholders,
        report.missing,
        report.failed
    );

    Ok(report)
}

async fn process_task(
    client: &ArchiveClient,
    task: &DownloadTask,
    metadata: &SensorMetadata,
    list_only: bool,
) -> DayOutcome {
    if !list_only {
        if let Some(sensor_type) = task.sensor_type {
            let local = task
                .month_folder
                .join(ArchiveClient::file_name(task.date, task.sensor_id, sensor_type));
            if local.exists() {
                return DayOutcome::Reused(local);
            }
        }
    }

    let found = client
        .files_for_date(task.sensor_id, task.date, task.sensor_type)
        .await;

    if list_only {
        return DayOutcome::Listed(found.into_iter().map(|(_, url)| url).collect());
    }

    if found.is_empty() {
        debug!("No archive file for sensor {} on {}", task.sensor_id, task.date);

        return match (task.create_missing, task.sensor_type) {
            (true, Some(sensor_type)) => {
                match write_placeholder(task.date, sensor_type, metadata, &task.month_folder) {
                    Ok(path) => DayOutcome::Placeholder(path),
                    Err(e) => {
                        warn!(
                            "Could not write placeholder for {} ({}): {}",
                            task.date, task.sensor_id, e
                        );
                        DayOutcome::Failed
                    }
                }
            }
            _ => DayOutcome::Missing,
        };
    }

    let mut paths = Vec::with_capacity(found.len());
    for (_, url) in found {
        if let Some(path) = client.download_to(&url, &task.month_folder).await {
            paths.push(path);
        }
    }

    if paths.is_empty() {
        DayOutcome::Failed
    } else {
        DayOutcome::Downloaded(paths)
    }
}
