use crate::error::{AppError, Result};
use crate::sensor_type::ArchiveType;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One calendar day of one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub date: NaiveDate,
    pub sensor_id: i64,
    pub sensor_type: Option<ArchiveType>,
    /// `YYYY-MM`, the key results are grouped under
    pub month: String,
    pub month_folder: PathBuf,
    pub create_missing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    /// In date order
    pub tasks: Vec<DownloadTask>,
    /// Every month touched by the range, ascending
    pub months: Vec<String>,
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
        AppError::Config(format!(
            "Invalid date '{}', expected YYYY-MM-DD: {}",
            value, e
        ))
    })
}

pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// Expand `[start, end]` into one task per day under `sensor_folder`.
///
/// Month folders are created here, before any worker runs, so workers never
/// race on directory creation. A reversed range yields an empty plan.
pub fn build_tasks(
    sensor_folder: &Path,
    start: NaiveDate,
    end: NaiveDate,
    sensor_id: i64,
    sensor_type: Option<ArchiveType>,
    create_missing: bool,
) -> Result<TaskPlan> {
    let mut plan = TaskPlan::default();

    for date in start.iter_days().take_while(|d| *d <= end) {
        let month = month_key(date);
        let month_folder = sensor_folder.join(&month);

        if plan.months.last() != Some(&month) {
            std::fs::create_dir_all(&month_folder)?;
            plan.months.push(month.clone());
        }

        plan.tasks.push(DownloadTask {
            date,
            sensor_id,
            sensor_type,
            month,
            month_folder,
            create_missing,
        });
    }

    debug!(
        "Planned {} day task(s) across {} month(s) for sensor {}",
        plan.tasks.len(),
        plan.months.len(),
        sensor_id
    );

    Ok(plan)
}
