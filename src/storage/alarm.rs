//! Alarm definitions and their change history
//!
//! Backends persist `Alarm` records and `AlarmChange` log entries; the rules
//! for defaulting, validation, partial updates and history generation live
//! here so every backend applies them identically.

use crate::storage::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_EVALUATION_PERIODS: u32 = 1;
pub const DEFAULT_PERIOD_SECS: u32 = 60;

/// Threshold comparison
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl ComparisonOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::Lt => "lt",
            ComparisonOperator::Le => "le",
            ComparisonOperator::Eq => "eq",
            ComparisonOperator::Ne => "ne",
            ComparisonOperator::Ge => "ge",
            ComparisonOperator::Gt => "gt",
        }
    }
}

impl FromStr for ComparisonOperator {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lt" => Ok(ComparisonOperator::Lt),
            "le" => Ok(ComparisonOperator::Le),
            "eq" => Ok(ComparisonOperator::Eq),
            "ne" => Ok(ComparisonOperator::Ne),
            "ge" => Ok(ComparisonOperator::Ge),
            "gt" => Ok(ComparisonOperator::Gt),
            other => Err(StorageError::validation(format!("unknown comparison operator: {}", other))),
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistic an alarm evaluates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl Statistic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Avg => "avg",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Sum => "sum",
            Statistic::Count => "count",
        }
    }
}

impl FromStr for Statistic {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Statistic::Avg),
            "min" => Ok(Statistic::Min),
            "max" => Ok(Statistic::Max),
            "sum" => Ok(Statistic::Sum),
            "count" => Ok(Statistic::Count),
            other => Err(StorageError::validation(format!("unknown statistic: {}", other))),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alarm lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum AlarmState {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "alarm")]
    Alarm,
    #[default]
    #[serde(rename = "insufficient data")]
    InsufficientData,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Ok => "ok",
            AlarmState::Alarm => "alarm",
            AlarmState::InsufficientData => "insufficient data",
        }
    }
}

impl FromStr for AlarmState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(AlarmState::Ok),
            "alarm" => Ok(AlarmState::Alarm),
            "insufficient data" => Ok(AlarmState::InsufficientData),
            other => Err(StorageError::validation(format!("unknown alarm state: {}", other))),
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted threshold rule over meter statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alarm {
    pub alarm_id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub counter_name: String,
    pub comparison_operator: ComparisonOperator,
    pub threshold: f64,
    pub statistic: Statistic,
    pub evaluation_periods: u32,
    /// Evaluation window in seconds
    pub period: u32,
    pub repeat_actions: bool,
    pub state: AlarmState,
    /// Last state change
    pub state_timestamp: DateTime<Utc>,
    /// Last modification
    pub timestamp: DateTime<Utc>,
    pub ok_actions: Vec<String>,
    pub alarm_actions: Vec<String>,
    pub insufficient_data_actions: Vec<String>,
    /// Dotted keys such as `user_metadata.k` are opaque strings
    pub matching_metadata: BTreeMap<String, String>,
    pub user_id: String,
    pub project_id: String,
}

impl Alarm {
    /// The description used when none is supplied
    pub fn default_description(
        counter_name: &str,
        op: ComparisonOperator,
        statistic: Statistic,
        threshold: f64,
        period: u32,
    ) -> String {
        format!(
            "Alarm when {} is {} a {} of {} over {} seconds",
            counter_name, op, statistic, threshold, period
        )
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.name.is_empty() {
            return Err(StorageError::validation("alarm name must not be empty"));
        }
        if self.counter_name.is_empty() {
            return Err(StorageError::validation("alarm counter_name must not be empty"));
        }
        if !self.threshold.is_finite() {
            return Err(StorageError::validation("alarm threshold must be finite"));
        }
        if self.period == 0 {
            return Err(StorageError::validation("alarm period must be positive"));
        }
        if self.evaluation_periods == 0 {
            return Err(StorageError::validation("alarm evaluation_periods must be positive"));
        }
        for url in self
            .ok_actions
            .iter()
            .chain(&self.alarm_actions)
            .chain(&self.insufficient_data_actions)
        {
            if !url.contains("://") {
                return Err(StorageError::validation(format!("alarm action is not a URL: {}", url)));
            }
        }
        Ok(())
    }

    /// Apply a JSON partial update; unknown fields are ignored
    pub fn patched(&self, patch: &serde_json::Value) -> StorageResult<Alarm> {
        let patch = AlarmPatch::deserialize(patch)
            .map_err(|e| StorageError::validation(format!("invalid alarm update: {}", e)))?;
        Ok(patch.apply(self))
    }
}

/// Alarm as supplied on create; unset fields take their defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAlarm {
    pub name: String,
    pub counter_name: String,
    pub comparison_operator: ComparisonOperator,
    pub threshold: f64,
    pub statistic: Statistic,
    pub user_id: String,
    pub project_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub evaluation_periods: Option<u32>,
    #[serde(default)]
    pub period: Option<u32>,
    #[serde(default)]
    pub repeat_actions: Option<bool>,
    #[serde(default)]
    pub state: Option<AlarmState>,
    #[serde(default)]
    pub ok_actions: Option<Vec<String>>,
    #[serde(default)]
    pub alarm_actions: Option<Vec<String>>,
    #[serde(default)]
    pub insufficient_data_actions: Option<Vec<String>>,
    #[serde(default)]
    pub matching_metadata: BTreeMap<String, String>,
}

impl NewAlarm {
    pub fn new(
        name: impl Into<String>,
        counter_name: impl Into<String>,
        comparison_operator: ComparisonOperator,
        threshold: f64,
        statistic: Statistic,
        user_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            counter_name: counter_name.into(),
            comparison_operator,
            threshold,
            statistic,
            user_id: user_id.into(),
            project_id: project_id.into(),
            description: None,
            enabled: None,
            evaluation_periods: None,
            period: None,
            repeat_actions: None,
            state: None,
            ok_actions: None,
            alarm_actions: None,
            insufficient_data_actions: None,
            matching_metadata: BTreeMap::new(),
        }
    }

    /// Parse a create request; an unknown statistic or operator is a
    /// validation error
    pub fn from_json(value: &serde_json::Value) -> StorageResult<Self> {
        NewAlarm::deserialize(value)
            .map_err(|e| StorageError::validation(format!("invalid alarm: {}", e)))
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn evaluation_periods(mut self, n: u32) -> Self {
        self.evaluation_periods = Some(n);
        self
    }

    pub fn period(mut self, secs: u32) -> Self {
        self.period = Some(secs);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn repeat_actions(mut self, repeat: bool) -> Self {
        self.repeat_actions = Some(repeat);
        self
    }

    pub fn state(mut self, state: AlarmState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn alarm_action(mut self, url: impl Into<String>) -> Self {
        self.alarm_actions.get_or_insert_with(Vec::new).push(url.into());
        self
    }

    pub fn ok_action(mut self, url: impl Into<String>) -> Self {
        self.ok_actions.get_or_insert_with(Vec::new).push(url.into());
        self
    }

    pub fn matching(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.matching_metadata.insert(key.into(), value.into());
        self
    }

    /// Fill in defaults and produce the record to persist
    pub fn into_alarm(self, alarm_id: String, now: DateTime<Utc>) -> StorageResult<Alarm> {
        let period = self.period.unwrap_or(DEFAULT_PERIOD_SECS);
        let description = self.description.unwrap_or_else(|| {
            Alarm::default_description(
                &self.counter_name,
                self.comparison_operator,
                self.statistic,
                self.threshold,
                period,
            )
        });

        let alarm = Alarm {
            alarm_id,
            name: self.name,
            description,
            enabled: self.enabled.unwrap_or(true),
            counter_name: self.counter_name,
            comparison_operator: self.comparison_operator,
            threshold: self.threshold,
            statistic: self.statistic,
            evaluation_periods: self.evaluation_periods.unwrap_or(DEFAULT_EVALUATION_PERIODS),
            period,
            repeat_actions: self.repeat_actions.unwrap_or(false),
            state: self.state.unwrap_or_default(),
            state_timestamp: now,
            timestamp: now,
            ok_actions: self.ok_actions.unwrap_or_default(),
            alarm_actions: self.alarm_actions.unwrap_or_default(),
            insufficient_data_actions: self.insufficient_data_actions.unwrap_or_default(),
            matching_metadata: self.matching_metadata,
            user_id: self.user_id,
            project_id: self.project_id,
        };
        alarm.validate()?;
        Ok(alarm)
    }
}

/// Partial update. Deserialization ignores fields it does not know.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlarmPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub counter_name: Option<String>,
    pub comparison_operator: Option<ComparisonOperator>,
    pub threshold: Option<f64>,
    pub statistic: Option<Statistic>,
    pub evaluation_periods: Option<u32>,
    pub period: Option<u32>,
    pub repeat_actions: Option<bool>,
    pub state: Option<AlarmState>,
    pub ok_actions: Option<Vec<String>>,
    pub alarm_actions: Option<Vec<String>>,
    pub insufficient_data_actions: Option<Vec<String>>,
    pub matching_metadata: Option<BTreeMap<String, String>>,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
}

impl AlarmPatch {
    pub fn apply(self, alarm: &Alarm) -> Alarm {
        let mut out = alarm.clone();
        if let Some(v) = self.name {
            out.name = v;
        }
        if let Some(v) = self.description {
            out.description = v;
        }
        if let Some(v) = self.enabled {
            out.enabled = v;
        }
        if let Some(v) = self.counter_name {
            out.counter_name = v;
        }
        if let Some(v) = self.comparison_operator {
            out.comparison_operator = v;
        }
        if let Some(v) = self.threshold {
            out.threshold = v;
        }
        if let Some(v) = self.statistic {
            out.statistic = v;
        }
        if let Some(v) = self.evaluation_periods {
            out.evaluation_periods = v;
        }
        if let Some(v) = self.period {
            out.period = v;
        }
        if let Some(v) = self.repeat_actions {
            out.repeat_actions = v;
        }
        if let Some(v) = self.state {
            out.state = v;
        }
        if let Some(v) = self.ok_actions {
            out.ok_actions = v;
        }
        if let Some(v) = self.alarm_actions {
            out.alarm_actions = v;
        }
        if let Some(v) = self.insufficient_data_actions {
            out.insufficient_data_actions = v;
        }
        if let Some(v) = self.matching_metadata {
            out.matching_metadata = v;
        }
        if let Some(v) = self.user_id {
            out.user_id = v;
        }
        if let Some(v) = self.project_id {
            out.project_id = v;
        }
        out
    }
}

/// Alarm selection for listings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmFilter {
    pub name: Option<String>,
    pub user: Option<String>,
    pub project: Option<String>,
    pub enabled: Option<bool>,
    pub alarm_id: Option<String>,
    pub meter: Option<String>,
    pub state: Option<AlarmState>,
}

impl AlarmFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn alarm_id(mut self, alarm_id: impl Into<String>) -> Self {
        self.alarm_id = Some(alarm_id.into());
        self
    }

    pub fn meter(mut self, meter: impl Into<String>) -> Self {
        self.meter = Some(meter.into());
        self
    }

    pub fn state(mut self, state: AlarmState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, alarm: &Alarm) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }

        eq(&self.name, &alarm.name)
            && eq(&self.user, &alarm.user_id)
            && eq(&self.project, &alarm.project_id)
            && eq(&self.alarm_id, &alarm.alarm_id)
            && eq(&self.meter, &alarm.counter_name)
            && self.enabled.map_or(true, |e| e == alarm.enabled)
            && self.state.map_or(true, |s| s == alarm.state)
    }
}

/// Kind of history entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AlarmChangeType {
    #[serde(rename = "rule change")]
    RuleChange,
    #[serde(rename = "state transition")]
    StateTransition,
    #[serde(rename = "deletion")]
    Deletion,
}

impl AlarmChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmChangeType::RuleChange => "rule change",
            AlarmChangeType::StateTransition => "state transition",
            AlarmChangeType::Deletion => "deletion",
        }
    }
}

impl FromStr for AlarmChangeType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule change" => Ok(AlarmChangeType::RuleChange),
            "state transition" => Ok(AlarmChangeType::StateTransition),
            "deletion" => Ok(AlarmChangeType::Deletion),
            other => Err(StorageError::Serialization(format!("unknown alarm change type: {}", other))),
        }
    }
}

/// One append-only history entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmChange {
    pub event_id: String,
    pub alarm_id: String,
    #[serde(rename = "type")]
    pub change_type: AlarmChangeType,
    /// JSON object describing what changed
    pub detail: String,
    pub user_id: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AlarmChange {
    fn new(alarm: &Alarm, change_type: AlarmChangeType, detail: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            alarm_id: alarm.alarm_id.clone(),
            change_type,
            detail: detail.to_string(),
            user_id: alarm.user_id.clone(),
            project_id: alarm.project_id.clone(),
            timestamp: now,
        }
    }

    pub fn deletion(alarm: &Alarm, now: DateTime<Utc>) -> StorageResult<Self> {
        Ok(Self::new(alarm, AlarmChangeType::Deletion, serde_json::to_value(alarm)?, now))
    }
}

/// Fields that are bookkeeping rather than rule content
const UNTRACKED_FIELDS: &[&str] = &["alarm_id", "state", "state_timestamp", "timestamp"];

/// Work out the record to persist for an update and the history it produces.
///
/// `alarm_id` is pinned to the stored record, timestamps are maintained from
/// `now`, and no history is produced when nothing changed.
pub fn prepare_update(
    stored: &Alarm,
    mut incoming: Alarm,
    now: DateTime<Utc>,
) -> StorageResult<(Alarm, Vec<AlarmChange>)> {
    incoming.alarm_id = stored.alarm_id.clone();
    incoming.validate()?;

    let mut changes = Vec::new();

    let before = serde_json::to_value(stored)?;
    let after = serde_json::to_value(&incoming)?;
    let mut rule_detail = serde_json::Map::new();
    if let (Some(before), Some(after)) = (before.as_object(), after.as_object()) {
        for (field, value) in after {
            if UNTRACKED_FIELDS.contains(&field.as_str()) {
                continue;
            }
            if before.get(field) != Some(value) {
                rule_detail.insert(field.clone(), value.clone());
            }
        }
    }

    let state_changed = incoming.state != stored.state;
    incoming.state_timestamp = if state_changed { now } else { stored.state_timestamp };
    incoming.timestamp = if state_changed || !rule_detail.is_empty() {
        now
    } else {
        stored.timestamp
    };

    if !rule_detail.is_empty() {
        changes.push(AlarmChange::new(
            &incoming,
            AlarmChangeType::RuleChange,
            serde_json::Value::Object(rule_detail),
            now,
        ));
    }
    if state_changed {
        changes.push(AlarmChange::new(
            &incoming,
            AlarmChangeType::StateTransition,
            serde_json::json!({ "state": incoming.state.as_str() }),
            now,
        ));
    }

    Ok((incoming, changes))
}
