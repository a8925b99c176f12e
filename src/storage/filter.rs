//! Query descriptors
//!
//! `SampleFilter` selects samples (and, through them, resources, meters and
//! statistics); `EventFilter` selects events. All supplied predicates are
//! AND-ed. Backends either evaluate these in memory via the `matches_*`
//! helpers or compile them to a native query, but must agree with the
//! helpers on every input.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::event::{Event, TraitValue};
use crate::storage::types::{Metadata, MetadataValue, Sample};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Prefix every metaquery key must carry
pub const METAQUERY_PREFIX: &str = "metadata.";

/// Comparison applied to a filter's start bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOp {
    /// timestamp >= start
    #[default]
    Ge,
    /// timestamp > start
    Gt,
}

impl StartOp {
    pub fn admits(&self, timestamp: &DateTime<Utc>, start: &DateTime<Utc>) -> bool {
        match self {
            StartOp::Ge => timestamp >= start,
            StartOp::Gt => timestamp > start,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            StartOp::Ge => ">=",
            StartOp::Gt => ">",
        }
    }
}

impl FromStr for StartOp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ge" => Ok(StartOp::Ge),
            "gt" => Ok(StartOp::Gt),
            other => Err(StorageError::validation(format!("invalid start timestamp op: {}", other))),
        }
    }
}

/// Comparison applied to a filter's end bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndOp {
    /// timestamp <= end
    #[default]
    Le,
    /// timestamp < end
    Lt,
}

impl EndOp {
    pub fn admits(&self, timestamp: &DateTime<Utc>, end: &DateTime<Utc>) -> bool {
        match self {
            EndOp::Le => timestamp <= end,
            EndOp::Lt => timestamp < end,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            EndOp::Le => "<=",
            EndOp::Lt => "<",
        }
    }
}

impl FromStr for EndOp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "le" => Ok(EndOp::Le),
            "lt" => Ok(EndOp::Lt),
            other => Err(StorageError::validation(format!("invalid end timestamp op: {}", other))),
        }
    }
}

/// Sample selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleFilter {
    pub user: Option<String>,
    pub project: Option<String>,
    pub resource: Option<String>,
    pub meter: Option<String>,
    pub source: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub start_timestamp_op: StartOp,
    pub end: Option<DateTime<Utc>>,
    pub end_timestamp_op: EndOp,
    /// `metadata.<key>` → required value; empty means unconstrained
    pub metaquery: BTreeMap<String, MetadataValue>,
}

impl SampleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn meter(mut self, meter: impl Into<String>) -> Self {
        self.meter = Some(meter.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Lower time bound; any offset is normalised to UTC
    pub fn start<Tz: TimeZone>(mut self, start: DateTime<Tz>) -> Self {
        self.start = Some(start.with_timezone(&Utc));
        self
    }

    pub fn start_op(mut self, op: StartOp) -> Self {
        self.start_timestamp_op = op;
        self
    }

    /// Upper time bound; any offset is normalised to UTC
    pub fn end<Tz: TimeZone>(mut self, end: DateTime<Tz>) -> Self {
        self.end = Some(end.with_timezone(&Utc));
        self
    }

    pub fn end_op(mut self, op: EndOp) -> Self {
        self.end_timestamp_op = op;
        self
    }

    pub fn metaquery(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metaquery.insert(key.into(), value.into());
        self
    }

    /// Check the filter is well formed
    pub fn validate(&self) -> StorageResult<()> {
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            if end < start {
                return Err(StorageError::validation(format!(
                    "end {} is before start {}",
                    end, start
                )));
            }
        }
        self.metadata_predicates().map(|_| ())
    }

    /// Metaquery entries with the `metadata.` prefix stripped
    pub fn metadata_predicates(&self) -> StorageResult<Vec<(&str, &MetadataValue)>> {
        self.metaquery
            .iter()
            .map(|(key, value)| match key.strip_prefix(METAQUERY_PREFIX) {
                Some(field) if !field.is_empty() => Ok((field, value)),
                _ => Err(StorageError::validation(format!(
                    "metaquery key must look like {}<key>: {}",
                    METAQUERY_PREFIX, key
                ))),
            })
            .collect()
    }

    pub fn has_metaquery(&self) -> bool {
        !self.metaquery.is_empty()
    }

    /// The same filter with only its time bounds kept
    pub fn time_bounds(&self) -> SampleFilter {
        SampleFilter {
            start: self.start,
            start_timestamp_op: self.start_timestamp_op,
            end: self.end,
            end_timestamp_op: self.end_timestamp_op,
            ..SampleFilter::default()
        }
    }

    pub fn matches_time(&self, timestamp: &DateTime<Utc>) -> bool {
        let after_start = self
            .start
            .as_ref()
            .map_or(true, |start| self.start_timestamp_op.admits(timestamp, start));
        let before_end = self
            .end
            .as_ref()
            .map_or(true, |end| self.end_timestamp_op.admits(timestamp, end));
        after_start && before_end
    }

    /// Check the owner/resource/meter/source predicates
    pub fn matches_dimensions(
        &self,
        user_id: &str,
        project_id: &str,
        resource_id: &str,
        meter_name: Option<&str>,
        source: &str,
    ) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }

        let meter_ok = match (&self.meter, meter_name) {
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
            (None, _) => true,
        };

        eq(&self.user, user_id)
            && eq(&self.project, project_id)
            && eq(&self.resource, resource_id)
            && eq(&self.source, source)
            && meter_ok
    }

    /// Check the metaquery against a metadata mapping.
    ///
    /// Malformed keys never match; call [`validate`](Self::validate) first to
    /// surface them as errors.
    pub fn matches_metadata(&self, metadata: &Metadata) -> bool {
        self.metaquery.iter().all(|(key, want)| {
            key.strip_prefix(METAQUERY_PREFIX)
                .and_then(|field| metadata.get(field))
                .map_or(false, |have| have == want)
        })
    }

    pub fn matches(&self, sample: &Sample) -> bool {
        self.matches_time(&sample.timestamp)
            && self.matches_dimensions(
                &sample.user_id,
                &sample.project_id,
                &sample.resource_id,
                Some(&sample.meter_name),
                &sample.source,
            )
            && self.matches_metadata(&sample.resource_metadata)
    }
}

/// Event selection; both time bounds are inclusive
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub event_name: Option<String>,
    /// trait name → value its populated slot must equal
    pub traits: BTreeMap<String, TraitValue>,
}

impl EventFilter {
    pub fn new<Tz: TimeZone>(start: DateTime<Tz>, end: DateTime<Tz>) -> Self {
        Self {
            start: start.with_timezone(&Utc),
            end: end.with_timezone(&Utc),
            event_name: None,
            traits: BTreeMap::new(),
        }
    }

    pub fn event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    pub fn with_trait(mut self, name: impl Into<String>, value: TraitValue) -> Self {
        self.traits.insert(name.into(), value);
        self
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.end < self.start {
            return Err(StorageError::validation(format!(
                "end {} is before start {}",
                self.end, self.start
            )));
        }
        Ok(())
    }

    pub fn matches(&self, event: &Event) -> bool {
        if event.generated < self.start || event.generated > self.end {
            return false;
        }
        if let Some(name) = &self.event_name {
            if &event.event_name != name {
                return false;
            }
        }
        self.traits.iter().all(|(name, want)| {
            event
                .traits
                .iter()
                .any(|t| &t.name == name && t.value.slot_eq(want))
        })
    }
}
