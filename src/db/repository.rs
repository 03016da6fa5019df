use crate::db::models::{
    NewSensor, NewSensorType, NewStation, Sensor, Station, StationRef,
};
use crate::error::{AppError, Result};
use sqlx::PgPool;
use tracing::{debug, info};

const SENSOR_COLUMNS: &str = r#"
    s.id, s.sensor_id, s.station_id, s.sensor_type_id,
    t.name AS sensor_type_name, t.manufacturer AS sensor_type_manufacturer,
    s.description
"#;

pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Look up a station by id or UID
    pub async fn find_station(&self, station: StationRef) -> Result<Station> {
        let result = match station {
            StationRef::Id(id) => {
                sqlx::query_as::<_, Station>("SELECT * FROM stations WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            StationRef::Uid(uid) => {
                sqlx::query_as::<_, Station>("SELECT * FROM stations WHERE uid = $1")
                    .bind(uid)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        result.ok_or_else(|| AppError::NotFound(format!("Station not found ({})", station)))
    }

    /// All sensors of a station with their type, in insertion order
    pub async fn list_sensors(&self, station_id: i32) -> Result<Vec<Sensor>> {
        let query = format!(
            "SELECT {} FROM sensors s \
             JOIN sensor_types t ON t.id = s.sensor_type_id \
             WHERE s.station_id = $1 \
             ORDER BY s.id",
            SENSOR_COLUMNS
        );

        let sensors = sqlx::query_as::<_, Sensor>(&query)
            .bind(station_id)
            .fetch_all(&self.pool)
            .await?;

        debug!("Station {} has {} sensor(s)", station_id, sensors.len());
        Ok(sensors)
    }

    pub async fn insert_station(&self, station: NewStation) -> Result<Station> {
        let created = sqlx::query_as::<_, Station>(
            r#"
            INSERT INTO stations
                (uid, name, location_display_name, owner_id, description,
                 is_active, latitude, longitude, altitude)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(station.uid)
        .bind(&station.name)
        .bind(&station.location_display_name)
        .bind(station.owner_id)
        .bind(&station.description)
        .bind(station.is_active)
        .bind(station.latitude)
        .bind(station.longitude)
        .bind(station.altitude)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    /// Insert a sensor type, or return the id of the existing (name, manufacturer) pair
    pub async fn upsert_sensor_type(&self, sensor_type: NewSensorType) -> Result<i32> {
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO sensor_types (name, manufacturer, description)
            VALUES ($1, $2, $3)
            ON CONFLICT (name, manufacturer) DO UPDATE SET
                description = COALESCE(EXCLUDED.description, sensor_types.description)
            RETURNING id
            "#,
        )
        .bind(&sensor_type.name)
        .bind(&sensor_type.manufacturer)
        .bind(&sensor_type.description)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn insert_sensor(&self, sensor: NewSensor) -> Result<i32> {
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO sensors (sensor_id, station_id, sensor_type_id, description)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(sensor.sensor_id)
        .bind(sensor.station_id)
        .bind(sensor.sensor_type_id)
        .bind(&sensor.description)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}
