//! Events and their typed traits
//!
//! An `Event` is a named occurrence with a generation time and an ordered
//! list of `Trait`s. Each trait value is one of four types; at rest it is a
//! `TraitRow` with exactly one populated slot, which is the shape both
//! backends persist and filter on.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::utils::DecimalTimestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag of a trait value; the discriminants are the stored codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraitType {
    Text = 1,
    Int = 2,
    Float = 3,
    Datetime = 4,
}

impl TraitType {
    pub fn code(&self) -> i64 {
        *self as i64
    }

    pub fn from_code(code: i64) -> StorageResult<Self> {
        match code {
            1 => Ok(TraitType::Text),
            2 => Ok(TraitType::Int),
            3 => Ok(TraitType::Float),
            4 => Ok(TraitType::Datetime),
            other => Err(StorageError::Serialization(format!("unknown trait type code {}", other))),
        }
    }
}

impl fmt::Display for TraitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraitType::Text => "text",
            TraitType::Int => "int",
            TraitType::Float => "float",
            TraitType::Datetime => "datetime",
        };
        f.write_str(name)
    }
}

/// A typed trait value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TraitValue {
    Text(String),
    Int(i64),
    Float(f64),
    Datetime(DateTime<Utc>),
}

impl TraitValue {
    pub fn trait_type(&self) -> TraitType {
        match self {
            TraitValue::Text(_) => TraitType::Text,
            TraitValue::Int(_) => TraitType::Int,
            TraitValue::Float(_) => TraitType::Float,
            TraitValue::Datetime(_) => TraitType::Datetime,
        }
    }

    /// Equality within the typed slot; datetimes compare by their decimal
    /// encoding, values of different types never match.
    pub fn slot_eq(&self, other: &TraitValue) -> bool {
        TraitRow::from_value(self) == TraitRow::from_value(other)
    }
}

/// A named attribute of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trait {
    /// Assigned by the store on record
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(flatten)]
    pub value: TraitValue,
}

impl Trait {
    pub fn new(name: impl Into<String>, value: TraitValue) -> Self {
        Self {
            id: None,
            name: name.into(),
            value,
        }
    }

    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, TraitValue::Text(value.into()))
    }

    pub fn int(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, TraitValue::Int(value))
    }

    pub fn float(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, TraitValue::Float(value))
    }

    pub fn datetime(name: impl Into<String>, value: DateTime<Utc>) -> Self {
        Self::new(name, TraitValue::Datetime(value))
    }

    pub fn trait_type(&self) -> TraitType {
        self.value.trait_type()
    }

    /// Reject traits a backend must not persist
    pub fn validate(&self) -> StorageResult<()> {
        if self.name.is_empty() {
            return Err(StorageError::validation("trait name must not be empty"));
        }
        if let TraitValue::Float(v) = self.value {
            if !v.is_finite() {
                return Err(StorageError::validation(format!(
                    "trait {} has a non-finite float value",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Slot representation of a trait value.
///
/// Exactly one of the four value slots is populated, matching `t_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitRow {
    pub t_type: TraitType,
    pub t_string: Option<String>,
    pub t_int: Option<i64>,
    pub t_float: Option<f64>,
    pub t_datetime: Option<DecimalTimestamp>,
}

impl TraitRow {
    pub fn from_value(value: &TraitValue) -> Self {
        let mut row = TraitRow {
            t_type: value.trait_type(),
            t_string: None,
            t_int: None,
            t_float: None,
            t_datetime: None,
        };
        match value {
            TraitValue::Text(s) => row.t_string = Some(s.clone()),
            TraitValue::Int(i) => row.t_int = Some(*i),
            TraitValue::Float(f) => row.t_float = Some(*f),
            TraitValue::Datetime(dt) => row.t_datetime = Some(DecimalTimestamp::from_datetime(dt)),
        }
        row
    }

    pub fn into_value(self) -> StorageResult<TraitValue> {
        let corrupt = |t: TraitType| {
            StorageError::Serialization(format!("trait row of type {} has no value in its slot", t))
        };
        match self.t_type {
            TraitType::Text => self.t_string.map(TraitValue::Text).ok_or_else(|| corrupt(self.t_type)),
            TraitType::Int => self.t_int.map(TraitValue::Int).ok_or_else(|| corrupt(self.t_type)),
            TraitType::Float => self.t_float.map(TraitValue::Float).ok_or_else(|| corrupt(self.t_type)),
            TraitType::Datetime => match self.t_datetime {
                Some(d) => Ok(TraitValue::Datetime(d.to_datetime()?)),
                None => Err(corrupt(self.t_type)),
            },
        }
    }
}

/// A discrete named occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the store on record
    #[serde(default)]
    pub id: Option<u64>,
    pub event_name: String,
    pub generated: DateTime<Utc>,
    #[serde(default)]
    pub traits: Vec<Trait>,
}

impl Event {
    pub fn new(event_name: impl Into<String>, generated: DateTime<Utc>, traits: Vec<Trait>) -> Self {
        Self {
            id: None,
            event_name: event_name.into(),
            generated,
            traits,
        }
    }

    pub fn trait_value(&self, name: &str) -> Option<&TraitValue> {
        self.traits.iter().find(|t| t.name == name).map(|t| &t.value)
    }
}
