use crate::archive::{ArchiveClient, SensorMetadata};
use crate::error::Result;
use crate::sensor_type::ArchiveType;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MEASUREMENT_COLUMNS: [&str; 6] = ["P1", "durP1", "ratioP1", "P2", "durP2", "ratioP2"];

pub const PLACEHOLDER_HEADER: [&str; 12] = [
    "sensor_id",
    "sensor_type",
    "location",
    "lat",
    "lon",
    "timestamp",
    "P1",
    "durP1",
    "ratioP1",
    "P2",
    "durP2",
    "ratioP2",
];

const ZERO: &str = "0.0";

/// Write a one-row, zero-valued stand-in for a day the archive does not have.
///
/// The file carries the archive's own name so the month stays contiguous for
/// consumers expecting one file per day. An existing file is left untouched.
pub fn write_placeholder(
    date: NaiveDate,
    sensor_type: ArchiveType,
    metadata: &SensorMetadata,
    month_folder: &Path,
) -> Result<PathBuf> {
    let file_name = ArchiveClient::file_name(date, metadata.sensor_id, sensor_type);
    let file_path = month_folder.join(&file_name);

    if file_path.exists() {
        return Ok(file_path);
    }

    debug!("Creating placeholder file: {}", file_name);

    let sensor_id = metadata.sensor_id.to_string();
    let timestamp = format!("{} 00:00:00", date.format("%Y-%m-%d"));

    let mut row: Vec<&str> = vec![
        sensor_id.as_str(),
        sensor_type.token(),
        metadata.location.as_str(),
        metadata.lat.as_str(),
        metadata.lon.as_str(),
        timestamp.as_str(),
    ];
    row.extend(std::iter::repeat(ZERO).take(MEASUREMENT_COLUMNS.len()));

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_path(&file_path)?;
    writer.write_record(PLACEHOLDER_HEADER)?;
    writer.write_record(&row)?;
    writer.flush()?;

    Ok(file_path)
}
