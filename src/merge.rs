//! Monthly and yearly consolidation of per-day archive files.
//!
//! Merged outputs live under `<station>/merged/<sensor_id>/` and are written
//! exactly once: an existing output is never re-derived.

use crate::error::{AppError, Result};
use crate::sensor_type::ArchiveType;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TIMESTAMP_COLUMN: &str = "timestamp";
const MERGED_DIR: &str = "merged";
const YEARLY_PREFIX: &str = "FULL_";
const EXCLUDED_PREFIXES: [&str; 2] = ["merged_", YEARLY_PREFIX];

/// A `;`-separated table held as text so values round-trip unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .from_path(path)?;

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if headers.is_empty() || headers.iter().all(String::is_empty) {
            return Err(AppError::InvalidData(format!(
                "{} has no header row",
                path.display()
            )));
        }

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() > headers.len() {
                return Err(AppError::InvalidData(format!(
                    "{} line {}: expected {} fields, found {}",
                    path.display(),
                    index + 2,
                    headers.len(),
                    record.len()
                )));
            }
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    /// Append `other`, taking the union of both headers; cells for columns a
    /// table lacks are left empty.
    pub fn append(&mut self, other: CsvTable) {
        let mut positions = Vec::with_capacity(other.headers.len());
        for header in &other.headers {
            let position = match self.headers.iter().position(|h| h == header) {
                Some(position) => position,
                None => {
                    self.headers.push(header.clone());
                    for row in &mut self.rows {
                        row.push(String::new());
                    }
                    self.headers.len() - 1
                }
            };
            positions.push(position);
        }

        let width = self.headers.len();
        for row in other.rows {
            let mut aligned = vec![String::new(); width];
            for (value, &position) in row.into_iter().zip(&positions) {
                aligned[position] = value;
            }
            self.rows.push(aligned);
        }
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Stable ascending sort on `timestamp`; rows whose timestamp does not
    /// parse go last. Returns false when the column is absent.
    pub fn sort_by_timestamp(&mut self) -> bool {
        let Some(column) = self.column(TIMESTAMP_COLUMN) else {
            return false;
        };

        let mut keyed: Vec<(Option<NaiveDateTime>, Vec<String>)> = self
            .rows
            .drain(..)
            .map(|row| (parse_timestamp(&row[column]), row))
            .collect();

        keyed.sort_by(|(ta, ra), (tb, rb)| match (ta, tb) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => ra[column].cmp(&rb[column]),
        });

        self.rows = keyed.into_iter().map(|(_, row)| row).collect();
        true
    }

    /// Drop rows identical in every column, keeping the first occurrence
    pub fn drop_duplicates(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen = HashSet::with_capacity(before);
        self.rows.retain(|row| seen.insert(row.clone()));
        before - self.rows.len()
    }

    /// Timestamps carried by more than one (non-identical) row
    pub fn conflicting_timestamps(&self) -> usize {
        let Some(column) = self.column(TIMESTAMP_COLUMN) else {
            return 0;
        };
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for row in &self.rows {
            *counts.entry(row[column].as_str()).or_default() += 1;
        }
        counts.values().filter(|&&n| n > 1).count()
    }

    /// Write to a temporary sibling and rename into place
    pub fn write(&self, path: &Path) -> Result<()> {
        let partial = path.with_extension("csv.tmp");
        {
            let mut writer = csv::WriterBuilder::new()
                .delimiter(b';')
                .from_path(&partial)?;
            writer.write_record(&self.headers)?;
            for row in &self.rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&partial, path)?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Written {
        path: PathBuf,
        rows: usize,
        duplicates_removed: usize,
    },
    AlreadyExists(PathBuf),
    NoSources,
    NothingReadable,
}

impl MergeOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, MergeOutcome::Written { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeStats {
    pub sources: usize,
    pub sources_read: usize,
    pub sources_skipped: usize,
    pub rows_in: usize,
    pub duplicates_removed: usize,
    pub conflicting_timestamps: usize,
}

pub fn merged_dir(station_dir: &Path, sensor_id: i64) -> PathBuf {
    station_dir.join(MERGED_DIR).join(sensor_id.to_string())
}

/// `2024-01` → `2024_01_<id>.csv`
pub fn monthly_file_name(month: &str, sensor_id: i64) -> Result<String> {
    let (year, month_num) = month
        .split_once('-')
        .filter(|(y, m)| y.len() == 4 && m.len() == 2)
        .ok_or_else(|| AppError::InvalidData(format!("Invalid month folder '{}'", month)))?;
    Ok(format!("{}_{}_{}.csv", year, month_num, sensor_id))
}

pub fn yearly_file_name(year: &str, sensor_id: i64) -> String {
    format!("{}{}_{}.csv", YEARLY_PREFIX, year, sensor_id)
}

/// Concatenate, sort and de-duplicate `sources`.
///
/// Unreadable files are skipped with a warning; `None` means none could be
/// read.
pub fn combine(sources: &[PathBuf]) -> (Option<CsvTable>, MergeStats) {
    let mut stats = MergeStats {
        sources: sources.len(),
        ..MergeStats::default()
    };
    let mut combined: Option<CsvTable> = None;

    for source in sources {
        match CsvTable::read(source) {
            Ok(table) => {
                debug!(
                    "{}: {} rows, {} columns",
                    source.display(),
                    table.rows.len(),
                    table.headers.len()
                );
                stats.sources_read += 1;
                stats.rows_in += table.rows.len();
                match combined.as_mut() {
                    Some(all) => all.append(table),
                    None => combined = Some(table),
                }
            }
            Err(e) => {
                stats.sources_skipped += 1;
                warn!("Skipping unreadable file {}: {}", source.display(), e);
            }
        }
    }

    if let Some(table) = combined.as_mut() {
        table.sort_by_timestamp();
        stats.duplicates_removed = table.drop_duplicates();
        stats.conflicting_timestamps = table.conflicting_timestamps();
    }

    (combined, stats)
}

fn write_merged(sources: &[PathBuf], target: &Path) -> Result<MergeOutcome> {
    let (table, stats) = combine(sources);
    let Some(table) = table else {
        warn!("No readable files to merge into {}", target.display());
        return Ok(MergeOutcome::NothingReadable);
    };

    if stats.duplicates_removed > 0 {
        info!("Removed {} duplicate rows", stats.duplicates_removed);
    }
    if stats.conflicting_timestamps > 0 {
        warn!(
            "{} timestamp(s) in {} carry differing values; all rows kept",
            stats.conflicting_timestamps,
            target.display()
        );
    }

    table.write(target)?;
    info!(
        "Merged {} file(s) into {} ({} rows)",
        stats.sources_read,
        target.display(),
        table.rows.len()
    );

    Ok(MergeOutcome::Written {
        path: target.to_path_buf(),
        rows: table.rows.len(),
        duplicates_removed: stats.duplicates_removed,
    })
}

fn is_excluded(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| EXCLUDED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)))
        .unwrap_or(true)
}

fn glob_files(folder: &Path, file_pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&folder.to_string_lossy()),
        file_pattern
    );
    let entries = glob::glob(&pattern)
        .map_err(|e| AppError::InvalidData(format!("Bad file pattern '{}': {}", pattern, e)))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Unreadable directory entry: {}", e);
                None
            }
        })
        .filter(|path| path.is_file() && !is_excluded(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Merge the day files of `<station>/<sensor_id>/<month>/` into
/// `<station>/merged/<sensor_id>/<year>_<month>_<sensor_id>.csv`.
///
/// With a sensor type only that type's day files are taken.
pub fn merge_month(
    station_dir: &Path,
    sensor_id: i64,
    month: &str,
    sensor_type: Option<ArchiveType>,
) -> Result<MergeOutcome> {
    let target_dir = merged_dir(station_dir, sensor_id);
    let target = target_dir.join(monthly_file_name(month, sensor_id)?);

    if target.exists() {
        debug!("Merged file already exists: {}", target.display());
        return Ok(MergeOutcome::AlreadyExists(target));
    }

    let month_folder = station_dir.join(sensor_id.to_string()).join(month);
    if !month_folder.is_dir() {
        return Ok(MergeOutcome::NoSources);
    }

    let file_pattern = match sensor_type {
        Some(t) => format!("*_{}_sensor_{}.csv", t.token(), sensor_id),
        None => "*.csv".to_string(),
    };
    let sources = glob_files(&month_folder, &file_pattern)?;

    if sources.is_empty() {
        warn!("No CSV files found in {}", month_folder.display());
        return Ok(MergeOutcome::NoSources);
    }

    std::fs::create_dir_all(&target_dir)?;
    info!("Merging {} file(s) for {} of sensor {}", sources.len(), month, sensor_id);
    write_merged(&sources, &target)
}

/// Group the monthly merged files of a sensor by year and write
/// `FULL_<year>_<sensor_id>.csv` for each year that lacks one.
///
/// Years from `open_year` on are left alone. A year whose write fails is
/// logged and left out of the result; the other years still merge.
pub fn merge_years(
    station_dir: &Path,
    sensor_id: i64,
    open_year: Option<i32>,
) -> Result<BTreeMap<String, MergeOutcome>> {
    let target_dir = merged_dir(station_dir, sensor_id);
    let mut outcomes = BTreeMap::new();

    if !target_dir.is_dir() {
        warn!("No monthly merged files found for sensor {}", sensor_id);
        return Ok(outcomes);
    }

    let monthly_name = regex_lite::Regex::new(&format!(r"^(\d{{4}})_(\d{{2}})_{}\.csv$", sensor_id))
        .map_err(|e| AppError::InvalidData(format!("Bad monthly file pattern: {}", e)))?;

    let mut by_year: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for path in glob_files(&target_dir, &format!("*_{}.csv", sensor_id))? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(caps) = monthly_name.captures(name) {
            by_year.entry(caps[1].to_string()).or_default().push(path.clone());
        }
    }

    if by_year.is_empty() {
        warn!("No monthly merged files found for sensor {}", sensor_id);
        return Ok(outcomes);
    }

    for (year, files) in by_year {
        let target = target_dir.join(yearly_file_name(&year, sensor_id));

        let is_open = match (open_year, year.parse::<i32>()) {
            (Some(open), Ok(y)) => y >= open,
            _ => false,
        };
        if is_open {
            debug!("Year {} of sensor {} is still open, not merged", year, sensor_id);
            continue;
        }

        if target.exists() {
            debug!("Yearly file already exists: {}", target.display());
            outcomes.insert(year, MergeOutcome::AlreadyExists(target));
            continue;
        }

        info!(
            "Merging {} monthly file(s) for {} of sensor {}",
            files.len(),
            year,
            sensor_id
        );
        match write_merged(&files, &target) {
            Ok(outcome) => {
                outcomes.insert(year, outcome);
            }
            Err(e) => warn!("Merging {} for sensor {} failed: {}", year, sensor_id, e),
        }
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_append_takes_union_of_columns() {
        let mut a = CsvTable {
            headers: vec!["timestamp".into(), "P1".into()],
            rows: vec![vec!["t1".into(), "1".into()]],
        };
        let b = CsvTable {
            headers: vec!["P2".into(), "timestamp".into()],
            rows: vec![vec!["2".into(), "t2".into()]],
        };
        a.append(b);

        assert_eq!(a.headers, ["timestamp", "P1", "P2"]);
        assert_eq!(a.rows[0], ["t1", "1", ""]);
        assert_eq!(a.rows[1], ["t2", "", "2"]);
    }

    #[test]
    fn test_sort_mixes_timestamp_formats() {
        let mut table = CsvTable {
            headers: vec!["timestamp".into()],
            rows: vec![
                vec!["2024-01-02T00:03:10".into()],
                vec!["".into()],
                vec!["2024-01-02 00:00:00".into()],
                vec!["2024-01-01 00:00:00".into()],
            ],
        };
        assert!(table.sort_by_timestamp());
        let order: Vec<&str> = table.rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(
            order,
            ["2024-01-01 00:00:00", "2024-01-02 00:00:00", "2024-01-02T00:03:10", ""]
        );
    }

    #[test]
    fn test_sort_without_timestamp_keeps_order() {
        let mut table = CsvTable {
            headers: vec!["value".into()],
            rows: vec![vec!["b".into()], vec!["a".into()]],
        };
        assert!(!table.sort_by_timestamp());
        assert_eq!(table.rows[0], ["b"]);
    }

    #[test]
    fn test_drop_duplicates_keeps_first_and_counts() {
        let mut table = CsvTable {
            headers: vec!["timestamp".into(), "P1".into()],
            rows: vec![
                vec!["t1".into(), "1".into()],
                vec!["t1".into(), "1".into()],
                vec!["t1".into(), "2".into()],
            ],
        };
        assert_eq!(table.drop_duplicates(), 1);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.conflicting_timestamps(), 1);
    }

    #[test]
    fn test_read_rejects_overlong_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.csv");
        write(&path, "a;b\n1;2;3\n");
        assert!(CsvTable::read(&path).is_err());
    }

    #[test]
    fn test_read_pads_short_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.csv");
        write(&path, "a;b;c\n1;2\n");
        let table = CsvTable::read(&path).unwrap();
        assert_eq!(table.rows[0], ["1", "2", ""]);
    }

    #[test]
    fn test_monthly_file_name() {
        assert_eq!(monthly_file_name("2024-01", 95522).unwrap(), "2024_01_95522.csv");
        assert!(monthly_file_name("202401", 1).is_err());
        assert_eq!(yearly_file_name("2024", 95522), "FULL_2024_95522.csv");
    }

    #[test]
    fn test_merge_month_counts_and_sorts() {
        let dir = TempDir::new().unwrap();
        let station = dir.path();
        let month = station.join("7").join("2024-03");
        let header = "sensor_id;timestamp;P1\n";
        write(
            &month.join("2024-03-02_sds011_sensor_7.csv"),
            &format!("{}7;2024-03-02T10:00:00;5\n7;2024-03-02T09:00:00;4\n", header),
        );
        write(
            &month.join("2024-03-01_sds011_sensor_7.csv"),
            &format!("{}7;2024-03-01T08:00:00;3\n7;2024-03-01T08:00:00;3\n", header),
        );
        // different type, must be ignored
        write(
            &month.join("2024-03-01_dht22_sensor_7.csv"),
            "sensor_id;timestamp;temperature\n7;2024-03-01T00:00:00;20\n",
        );

        let outcome = merge_month(station, 7, "2024-03", Some(ArchiveType::Sds011)).unwrap();
        let target = station.join("merged").join("7").join("2024_03_7.csv");
        assert_eq!(
            outcome,
            MergeOutcome::Written {
                path: target.clone(),
                rows: 3,
                duplicates_removed: 1,
            }
        );

        let content = std::fs::read_to_string(&target).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "sensor_id;timestamp;P1");
        assert_eq!(lines[1], "7;2024-03-01T08:00:00;3");
        assert_eq!(lines[2], "7;2024-03-02T09:00:00;4");
        assert_eq!(lines[3], "7;2024-03-02T10:00:00;5");
        assert!(!target.with_extension("csv.tmp").exists());
    }

    #[test]
    fn test_merge_month_is_write_once() {
        let dir = TempDir::new().unwrap();
        let station = dir.path();
        write(
            &station.join("7").join("2024-03").join("2024-03-01_sds011_sensor_7.csv"),
            "timestamp;P1\n2024-03-01T00:00:00;1\n",
        );
        let first = merge_month(station, 7, "2024-03", Some(ArchiveType::Sds011)).unwrap();
        assert!(first.is_written());

        let target = merged_dir(station, 7).join("2024_03_7.csv");
        std::fs::write(&target, "sentinel").unwrap();

        let second = merge_month(station, 7, "2024-03", Some(ArchiveType::Sds011)).unwrap();
        assert_eq!(second, MergeOutcome::AlreadyExists(target.clone()));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "sentinel");
    }

    #[test]
    fn test_merge_month_without_sources() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("7").join("2024-03")).unwrap();
        let outcome = merge_month(dir.path(), 7, "2024-03", None).unwrap();
        assert_eq!(outcome, MergeOutcome::NoSources);
        assert!(!merged_dir(dir.path(), 7).join("2024_03_7.csv").exists());
    }

    #[test]
    fn test_merge_month_with_only_unreadable_sources() {
        let dir = TempDir::new().unwrap();
        write(
            &dir.path().join("7").join("2024-03").join("2024-03-01_sds011_sensor_7.csv"),
            "",
        );
        let outcome = merge_month(dir.path(), 7, "2024-03", None).unwrap();
        assert_eq!(outcome, MergeOutcome::NothingReadable);
        assert!(!merged_dir(dir.path(), 7).join("2024_03_7.csv").exists());
    }

    #[test]
    fn test_merge_years_groups_by_parsed_year() {
        let dir = TempDir::new().unwrap();
        let merged = merged_dir(dir.path(), 95522);
        write(
            &merged.join("2023_12_95522.csv"),
            "timestamp;P1\n2023-12-31T00:00:00;9\n",
        );
        write(
            &merged.join("2024_12_95522.csv"),
            "timestamp;P1\n2024-12-01T00:00:00;2\n",
        );
        write(
            &merged.join("2024_01_95522.csv"),
            "timestamp;P1\n2024-01-01T00:00:00;1\n",
        );
        write(&merged.join("notes_95522.csv"), "timestamp;P1\n2024-06-01T00:00:00;7\n");

        let outcomes = merge_years(dir.path(), 95522, None).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes["2023"].is_written());
        assert!(outcomes["2024"].is_written());

        let content = std::fs::read_to_string(merged.join("FULL_2024_95522.csv")).unwrap();
        assert_eq!(
            content,
            "timestamp;P1\n2024-01-01T00:00:00;1\n2024-12-01T00:00:00;2\n"
        );

        // second pass does nothing
        let again = merge_years(dir.path(), 95522, None).unwrap();
        assert!(again.values().all(|o| matches!(o, MergeOutcome::AlreadyExists(_))));
    }

    #[test]
    fn test_merge_years_leaves_open_year() {
        let dir = TempDir::new().unwrap();
        let merged = merged_dir(dir.path(), 3);
        write(&merged.join("2023_12_3.csv"), "timestamp;P1
2023-12-31T00:00:00;9
");
        write(&merged.join("2024_01_3.csv"), "timestamp;P1
2024-01-01T00:00:00;1
");

        let outcomes = merge_years(dir.path(), 3, Some(2024)).unwrap();
        assert_eq!(outcomes.keys().collect::<Vec<_>>(), ["2023"]);
        assert!(!merged.join("FULL_2024_3.csv").exists());
    }

    #[test]
    fn test_merge_years_continues_past_failed_year() {
        let dir = TempDir::new().unwrap();
        let merged = merged_dir(dir.path(), 3);
        write(&merged.join("2023_12_3.csv"), "timestamp;P1
2023-12-31T00:00:00;9
");
        write(&merged.join("2024_01_3.csv"), "timestamp;P1
2024-01-01T00:00:00;1
");
        // a directory where the 2023 temp file must go makes that write fail
        std::fs::create_dir_all(merged.join("FULL_2023_3.csv.tmp")).unwrap();

        let outcomes = merge_years(dir.path(), 3, None).unwrap();
        assert!(!outcomes.contains_key("2023"));
        assert!(outcomes["2024"].is_written());
        assert!(merged.join("FULL_2024_3.csv").is_file());
        assert!(!merged.join("FULL_2023_3.csv").exists());
    }

    #[test]
    fn test_merge_month_skips_unreadable_source() {
        let dir = TempDir::new().unwrap();
        let month = dir.path().join("7").join("2024-03");
        write(
            &month.join("2024-03-01_sds011_sensor_7.csv"),
            "timestamp;P1
2024-03-01T00:05:00;4
2024-03-01T00:01:00;3
",
        );
        write(
            &month.join("2024-03-02_sds011_sensor_7.csv"),
            "timestamp;P1
2024-03-02T00:00:00;1;extra;fields
",
        );

        let sources = vec![
            month.join("2024-03-01_sds011_sensor_7.csv"),
            month.join("2024-03-02_sds011_sensor_7.csv"),
        ];
        let (_, stats) = combine(&sources);
        assert_eq!(stats.sources_read, 1);
        assert_eq!(stats.sources_skipped, 1);

        let outcome = merge_month(dir.path(), 7, "2024-03", Some(ArchiveType::Sds011)).unwrap();
        match outcome {
            MergeOutcome::Written { path, rows, .. } => {
                assert_eq!(rows, 2);
                assert_eq!(
                    std::fs::read_to_string(path).unwrap(),
                    "timestamp;P1
2024-03-01T00:01:00;3
2024-03-01T00:05:00;4
"
                );
            }
            other => panic!("expected a written merge, got {:?}", other),
        }
    }
}
