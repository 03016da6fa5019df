pub mod archive;
pub mod config;
pub mod db;
pub mod downloader;
pub mod error;
pub mod executor;
pub mod merge;
pub mod placeholder;
pub mod scheduler;
pub mod sensor_type;
pub mod station;
pub mod tasks;
