//! Core metering types
//!
//! This module defines the values recorded and returned by the storage layer:
//! - `Sample`: a single immutable measurement of a meter
//! - `Resource` / `Meter`: read-only views derived from samples
//! - `Statistics`: one aggregation bucket
//! - `Volume` and `MetadataValue`: the scalar types carried by samples

use crate::storage::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Resource metadata: flat string keys to scalar values
pub type Metadata = BTreeMap<String, MetadataValue>;

/// How a meter's values relate to each other over time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MeterType {
    /// Monotonically increasing total (cpu time)
    Cumulative,
    /// Point-in-time level (disk size)
    Gauge,
    /// Change since the previous sample (bytes sent)
    Delta,
}

impl MeterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterType::Cumulative => "cumulative",
            MeterType::Gauge => "gauge",
            MeterType::Delta => "delta",
        }
    }
}

impl fmt::Display for MeterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeterType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cumulative" => Ok(MeterType::Cumulative),
            "gauge" => Ok(MeterType::Gauge),
            "delta" => Ok(MeterType::Delta),
            other => Err(StorageError::validation(format!("unknown meter type: {}", other))),
        }
    }
}

/// A measured quantity.
///
/// Integers keep their full 64-bit range; converting to `f64` happens only
/// when statistics are computed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Volume {
    Int(i64),
    Float(f64),
}

impl Volume {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Volume::Int(v) => v as f64,
            Volume::Float(v) => v,
        }
    }
}

impl From<i64> for Volume {
    fn from(v: i64) -> Self {
        Volume::Int(v)
    }
}

impl From<i32> for Volume {
    fn from(v: i32) -> Self {
        Volume::Int(v as i64)
    }
}

impl From<f64> for Volume {
    fn from(v: f64) -> Self {
        Volume::Float(v)
    }
}

/// Scalar value stored in resource metadata or used in a metaquery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Kind tag used by backends that store metadata in typed columns
    pub fn kind(&self) -> &'static str {
        match self {
            MetadataValue::Bool(_) => "bool",
            MetadataValue::Int(_) | MetadataValue::Float(_) => "number",
            MetadataValue::Text(_) => "text",
        }
    }
}

/// Ints and floats compare numerically; other kinds only match their own kind.
impl PartialEq for MetadataValue {
    fn eq(&self, other: &Self) -> bool {
        use MetadataValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Float(a), Float(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

/// A single measurement of a meter for a resource.
///
/// Produced by ingestion, already authenticated; never mutated after it is
/// recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub meter_name: String,
    pub meter_type: MeterType,
    pub unit: String,
    pub volume: Volume,
    pub user_id: String,
    pub project_id: String,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resource_metadata: Metadata,
    pub source: String,
}

impl Sample {
    /// Create a sample with empty metadata
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meter_name: impl Into<String>,
        meter_type: MeterType,
        unit: impl Into<String>,
        volume: impl Into<Volume>,
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        resource_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            meter_name: meter_name.into(),
            meter_type,
            unit: unit.into(),
            volume: volume.into(),
            user_id: user_id.into(),
            project_id: project_id.into(),
            resource_id: resource_id.into(),
            timestamp,
            resource_metadata: Metadata::new(),
            source: source.into(),
        }
    }

    /// Builder method: add a metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.resource_metadata.insert(key.into(), value.into());
        self
    }

    /// Reject samples no backend could store faithfully
    pub fn validate(&self) -> StorageResult<()> {
        if self.meter_name.is_empty() {
            return Err(StorageError::validation("sample has an empty meter name"));
        }
        if self.resource_id.is_empty() {
            return Err(StorageError::validation("sample has an empty resource id"));
        }
        if let Volume::Float(v) = self.volume {
            if !v.is_finite() {
                return Err(StorageError::validation(format!(
                    "sample volume must be finite, got {}",
                    v
                )));
            }
        }
        Ok(())
    }
}

/// A (name, type, unit) triple observed on a resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceMeter {
    pub counter_name: String,
    pub counter_type: MeterType,
    pub counter_unit: String,
}

impl ResourceMeter {
    pub fn new(name: impl Into<String>, meter_type: MeterType, unit: impl Into<String>) -> Self {
        Self {
            counter_name: name.into(),
            counter_type: meter_type,
            counter_unit: unit.into(),
        }
    }
}

/// Summary of every sample sharing a resource id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub resource_id: String,
    pub user_id: String,
    pub project_id: String,
    pub source: String,
    pub first_sample_timestamp: DateTime<Utc>,
    pub last_sample_timestamp: DateTime<Utc>,
    /// Metadata of the most recent sample
    pub metadata: Metadata,
    /// Distinct meters observed, sorted
    pub meter: Vec<ResourceMeter>,
}

/// A meter stream of one resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Meter {
    pub name: String,
    #[serde(rename = "type")]
    pub meter_type: MeterType,
    pub unit: String,
    pub resource_id: String,
    pub project_id: String,
    pub user_id: String,
    pub source: String,
}

/// Aggregates over one period bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    /// Unit of the aggregated samples; absent if none was recorded
    pub unit: Option<String>,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub avg: f64,
    /// Bucket width in seconds; 0 when the whole range is one bucket
    pub period: u64,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    /// Seconds between the first and last sample in the bucket
    pub duration: f64,
    pub duration_start: DateTime<Utc>,
    pub duration_end: DateTime<Utc>,
}
