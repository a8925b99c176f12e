//! # Meterstore
//!
//! Backend-neutral storage for telemetry metering: samples and the
//! resources, meters, users and projects derived from them, period
//! statistics, threshold alarms with their history, and events with typed
//! traits.
//!
//! ## Features
//!
//! - **One contract, several backends**: in-memory, SQLite, and a log-only sink
//! - **Filters**: owner, resource, meter, source, time window and metadata
//! - **Keyset pagination**: stable across backends with sort keys and markers
//! - **Statistics**: count/min/max/sum/avg bucketed by period
//! - **Retention**: purge samples past a time to live
//!
//! ## Modules
//!
//! - [`storage`]: The `Connection` trait, value types and backends
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meterstore::storage::*;
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = meterstore::Config::default();
//!     let conn = open(&config.storage, config.connection_options())?;
//!
//!     conn.record_sample(Sample::new(
//!         "volume.size", MeterType::Gauge, "GiB", 20, "user", "project", "vol-1", Utc::now(), "agent",
//!     ))
//!     .await?;
//!
//!     let page = Pagination::new().sort("user_id", SortDir::Desc).limit(10);
//!     let resources = conn.get_resources(&SampleFilter::new().project("project"), Some(&page)).await?;
//!     println!("{} resources", resources.len());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    open, Alarm, Backend, Capabilities, Connection, ConnectionOptions, Event, EventFilter, Meter,
    Pagination, Resource, Sample, SampleFilter, Statistics, StorageError, StorageResult,
};

pub use config::{Config, ConfigError, LoggingConfig, RetentionConfig, StorageConfig};
