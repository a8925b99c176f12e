//! Meterstore Storage Layer
//!
//! This module provides the backend-neutral storage contract and its
//! implementations:
//!
//! - **types**: Samples and the views derived from them (Resource, Meter, Statistics)
//! - **filter**: Sample and event selection
//! - **pagination**: Keyset pagination shared by every backend
//! - **statistics**: Period-bucketed aggregation
//! - **alarm** / **event**: Alarm definitions with history, events with typed traits
//! - **memory** / **sqlite** / **log**: Backends behind the `Connection` trait
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Sample → Connection::record_sample → backend rows
//!
//! Read Path:
//!   SampleFilter → backend fetch → views / statistics → paginate → results
//! ```
//!
//! Backends only store and select rows. Ordering, pagination, bucketing and
//! the derived resource and meter views are computed by the shared modules
//! here, so every backend answers the same query the same way.
//!
//! # Example
//!
//! ```rust,no_run
//! use meterstore::storage::*;
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = MemoryConnection::new(ConnectionOptions::default());
//!
//!     conn.record_sample(
//!         Sample::new("cpu", MeterType::Cumulative, "ns", 1_000_i64, "user", "project", "vm-1", Utc::now(), "agent")
//!             .metadata("flavor", "m1.tiny"),
//!     )
//!     .await?;
//!
//!     let filter = SampleFilter::new().meter("cpu");
//!     let stats = conn.get_meter_statistics(&filter, Some(3600)).await?;
//!     println!("{} buckets", stats.len());
//!
//!     Ok(())
//! }
//! ```

pub mod alarm;
pub mod clock;
pub mod error;
pub mod event;
pub mod filter;
pub mod log;
pub mod memory;
pub mod pagination;
pub mod sqlite;
pub mod statistics;
pub mod types;
pub mod utils;
pub mod views;

#[cfg(test)]
mod conformance;

// Re-export commonly used types
pub use alarm::{
    Alarm, AlarmChange, AlarmChangeType, AlarmFilter, AlarmPatch, AlarmState, ComparisonOperator,
    NewAlarm, Statistic,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StorageError, StorageResult};
pub use event::{Event, Trait, TraitType, TraitValue};
pub use filter::{EndOp, EventFilter, SampleFilter, StartOp};
pub use log::LogConnection;
pub use memory::MemoryConnection;
pub use pagination::{Pagination, SortDir};
pub use sqlite::SqliteConnection;
pub use types::{
    Metadata, MetadataValue, Meter, MeterType, Resource, ResourceMeter, Sample, Statistics, Volume,
};

use crate::config::StorageConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Storage engine selected in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Sqlite,
    Log,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Memory => "memory",
            Backend::Sqlite => "sqlite",
            Backend::Log => "log",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Backend::Memory),
            "sqlite" => Ok(Backend::Sqlite),
            "log" => Ok(Backend::Log),
            other => Err(StorageError::Config(format!("unknown storage backend: {}", other))),
        }
    }
}

/// Optional features a backend may lack.
///
/// A capability is either fully supported or every operation that needs it
/// fails with `NotSupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub metaquery: bool,
    pub purge: bool,
    pub events: bool,
    pub alarms: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Self {
            metaquery: true,
            purge: true,
            events: true,
            alarms: true,
        }
    }
}

/// Runtime parameters every backend is opened with
#[derive(Clone)]
pub struct ConnectionOptions {
    pub clock: Arc<dyn Clock>,
    /// Statistics period used when a caller does not pass one
    pub default_period: u64,
}

impl ConnectionOptions {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_period(mut self, secs: u64) -> Self {
        self.default_period = secs;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            default_period: 0,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("now", &self.clock.now())
            .field("default_period", &self.default_period)
            .finish()
    }
}

/// The storage contract.
///
/// Listing operations return empty collections rather than `NotFound`.
/// Every mutating operation is atomic: on error nothing it wrote is visible.
#[async_trait]
pub trait Connection: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Store one sample
    async fn record_sample(&self, sample: Sample) -> StorageResult<()>;

    /// Samples matching `filter`, most recent first
    async fn get_samples(&self, filter: &SampleFilter, limit: Option<usize>) -> StorageResult<Vec<Sample>>;

    /// Period statistics; `None` uses the configured default period
    async fn get_meter_statistics(
        &self,
        filter: &SampleFilter,
        period: Option<u64>,
    ) -> StorageResult<Vec<Statistics>>;

    async fn get_resources(
        &self,
        filter: &SampleFilter,
        page: Option<&Pagination>,
    ) -> StorageResult<Vec<Resource>>;

    async fn get_meters(&self, filter: &SampleFilter, page: Option<&Pagination>) -> StorageResult<Vec<Meter>>;

    /// Distinct user ids with at least one sample
    async fn get_users(&self, source: Option<&str>) -> StorageResult<BTreeSet<String>>;

    /// Distinct project ids with at least one sample
    async fn get_projects(&self, source: Option<&str>) -> StorageResult<BTreeSet<String>>;

    /// Create an alarm, filling in defaults and a fresh id
    async fn create_alarm(&self, _alarm: NewAlarm) -> StorageResult<Alarm> {
        Err(StorageError::not_supported("alarms"))
    }

    /// Replace an alarm by id and return what was persisted
    async fn update_alarm(&self, _alarm: Alarm) -> StorageResult<Alarm> {
        Err(StorageError::not_supported("alarms"))
    }

    /// Apply a partial JSON update to an alarm
    async fn patch_alarm(&self, alarm_id: &str, patch: &serde_json::Value) -> StorageResult<Alarm> {
        let stored = self
            .get_alarms(&AlarmFilter::new().alarm_id(alarm_id), None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound(format!("alarm {}", alarm_id)))?;
        let updated = stored.patched(patch)?;
        self.update_alarm(updated).await
    }

    async fn delete_alarm(&self, _alarm_id: &str) -> StorageResult<()> {
        Err(StorageError::not_supported("alarms"))
    }

    async fn get_alarms(&self, filter: &AlarmFilter, page: Option<&Pagination>) -> StorageResult<Vec<Alarm>>;

    /// History of an alarm, oldest first
    async fn get_alarm_history(&self, _alarm_id: &str) -> StorageResult<Vec<AlarmChange>> {
        Err(StorageError::not_supported("alarm history"))
    }

    /// Store events, returning them with ids assigned
    async fn record_events(&self, _events: Vec<Event>) -> StorageResult<Vec<Event>> {
        Err(StorageError::not_supported("events"))
    }

    /// Events matching `filter`, ascending by generation time
    async fn get_events(&self, _filter: &EventFilter) -> StorageResult<Vec<Event>> {
        Err(StorageError::not_supported("events"))
    }

    /// Delete samples older than `max_age_secs`, returning how many went
    async fn purge_expired(&self, _max_age_secs: u64) -> StorageResult<u64> {
        Err(StorageError::not_supported("purge"))
    }
}

/// Open the backend named in `config`
pub fn open(config: &StorageConfig, options: ConnectionOptions) -> StorageResult<Arc<dyn Connection>> {
    tracing::debug!(backend = %config.backend, "Opening storage backend");
    let conn: Arc<dyn Connection> = match config.backend {
        Backend::Memory => Arc::new(MemoryConnection::new(options)),
        Backend::Sqlite => Arc::new(SqliteConnection::open(config.database_path(), options)?),
        Backend::Log => Arc::new(LogConnection::new()),
    };
    Ok(conn)
}

/// Reject a sample filter before touching storage
pub(crate) fn check_sample_filter(filter: &SampleFilter, caps: Capabilities) -> StorageResult<()> {
    filter.validate()?;
    if filter.has_metaquery() && !caps.metaquery {
        return Err(StorageError::not_supported("metaquery"));
    }
    Ok(())
}

/// Sort most recent first; `seq` breaks timestamp ties, later recorded first
pub(crate) fn newest_first<T>(rows: &mut [(u64, T)], timestamp: impl Fn(&T) -> chrono::DateTime<chrono::Utc>) {
    rows.sort_by(|(a_seq, a), (b_seq, b)| (timestamp(b), *b_seq).cmp(&(timestamp(a), *a_seq)));
}
