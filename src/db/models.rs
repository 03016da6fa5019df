use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// How a caller names a station: database id or public UID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationRef {
    Id(i32),
    Uid(Uuid),
}

impl fmt::Display for StationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationRef::Id(id) => write!(f, "id={}", id),
            StationRef::Uid(uid) => write!(f, "uid={}", uid),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Station {
    pub id: i32,
    pub uid: Uuid,
    pub name: String,
    pub location_display_name: Option<String>,
    pub owner_id: Option<i32>,
    pub description: Option<String>,
    pub is_active: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Station {
    /// Latitude/longitude pair, only when both are stored
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    /// Label written into placeholder rows
    pub fn location_label(&self) -> &str {
        match self.location_display_name.as_deref() {
            Some(label) if !label.is_empty() => label,
            _ => &self.name,
        }
    }

    /// Directory name for this station's downloads: `<normalized name>_<uid>`
    pub fn directory_name(&self) -> String {
        let normalized: String = self
            .name
            .to_lowercase()
            .chars()
            .map(|c| match c {
                '-' | '(' | ')' | ',' | ' ' => '_',
                other => other,
            })
            .collect();

        format!("{}_{}", normalized.trim(), self.uid)
    }
}

#[derive(Debug, Clone)]
pub struct NewStation {
    pub uid: Uuid,
    pub name: String,
    pub location_display_name: Option<String>,
    pub owner_id: Option<i32>,
    pub description: Option<String>,
    pub is_active: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SensorType {
    pub id: i32,
    pub name: String,
    pub manufacturer: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSensorType {
    pub name: String,
    pub manufacturer: String,
    pub description: Option<String>,
}

/// A sensor joined with its type
#[derive(Debug, Clone, FromRow)]
pub struct Sensor {
    pub id: i32,
    /// Identifier assigned by the Sensor.Community network
    pub sensor_id: Option<i64>,
    pub station_id: i32,
    pub sensor_type_id: i32,
    pub sensor_type_name: String,
    pub sensor_type_manufacturer: String,
    pub description: Option<String>,
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sensor_id {
            Some(id) => write!(f, "{} #{}", self.sensor_type_name, id),
            None => write!(f, "{} (no sensor id)", self.sensor_type_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSensor {
    pub sensor_id: Option<i64>,
    pub station_id: i32,
    pub sensor_type_id: i32,
    pub description: Option<String>,
}
