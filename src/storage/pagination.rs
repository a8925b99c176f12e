//! Keyset pagination
//!
//! Listings are ordered by a sort key with a fixed per-entity tie-break, then
//! cut at a marker: the page holds entities strictly after the marker in the
//! requested direction. No backend cursor is involved, so every backend
//! pages identically as long as it hands over the full filtered set.
//!
//! ```text
//! sort_key = user_id, asc, marker {user_id: user-id-4}
//!
//!   user-id  user-id-2  user-id-3  user-id-4 | user-id-5  user-id-6 ...
//!                                   marker ^   page starts here
//! ```
//!
//! The marker is resolved in two steps:
//!
//! 1. If an entity equals every marker pair, its full composite key (sort
//!    key, then tie-break fields) is the boundary. The entity is looked up in
//!    the filtered set first, then in the unfiltered population, so a marker
//!    may name an entity the filter excludes.
//! 2. Otherwise the marker must carry the sort key; the boundary is the sort
//!    key value followed by the other supplied fields in name order, which
//!    only come into play on exact ties.

use crate::storage::alarm::Alarm;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Meter, Resource};
use crate::storage::utils::parse_timestamp;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDir {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(StorageError::validation(format!("invalid sort direction: {}", other))),
        }
    }
}

/// Page request for resource, meter and alarm listings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pagination {
    /// Defaults to the entity's own default sort key
    pub sort_key: Option<String>,
    pub sort_dir: SortDir,
    /// field → value identifying the boundary entity
    pub marker_pairs: BTreeMap<String, String>,
    /// `Some(0)` is an empty page, `None` is unlimited
    pub limit: Option<usize>,
}

impl Pagination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, key: impl Into<String>, dir: SortDir) -> Self {
        self.sort_key = Some(key.into());
        self.sort_dir = dir;
        self
    }

    pub fn marker(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.marker_pairs.insert(field.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Value types a sortable field can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Bool,
    Time,
}

/// A comparable field value.
///
/// Values of one field always share a variant; the cross-variant order only
/// exists to make `Ord` total.
#[derive(Debug, Clone)]
pub enum SortValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Time(DateTime<Utc>),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Bool(_) => 0,
            SortValue::Number(_) => 1,
            SortValue::Text(_) => 2,
            SortValue::Time(_) => 3,
        }
    }

    /// Interpret a marker string as a value of `kind`
    pub fn parse(kind: FieldKind, raw: &str) -> StorageResult<Self> {
        let invalid = || StorageError::validation(format!("invalid marker value: {}", raw));
        Ok(match kind {
            FieldKind::Text => SortValue::Text(raw.to_string()),
            FieldKind::Number => SortValue::Number(raw.parse().map_err(|_| invalid())?),
            FieldKind::Bool => SortValue::Bool(raw.parse().map_err(|_| invalid())?),
            FieldKind::Time => SortValue::Time(parse_timestamp(raw)?),
        })
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Bool(a), SortValue::Bool(b)) => a.cmp(b),
            (SortValue::Number(a), SortValue::Number(b)) => a.total_cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (SortValue::Time(a), SortValue::Time(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

/// An entity that can be listed with keyset pagination
pub trait Sortable {
    /// Fields that may be used as sort key or marker field
    const FIELDS: &'static [(&'static str, FieldKind)];
    /// Fields that make the order total, in comparison order
    const TIEBREAK: &'static [&'static str];
    const DEFAULT_SORT_KEY: &'static str;

    fn sort_value(&self, field: &str) -> Option<SortValue>;

    fn field_kind(field: &str) -> Option<FieldKind> {
        Self::FIELDS
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, kind)| *kind)
    }
}

fn key_of<T: Sortable>(item: &T, fields: &[&str]) -> Vec<Option<SortValue>> {
    fields.iter().map(|f| item.sort_value(f)).collect()
}

/// Order, cut and truncate a filtered result set
pub fn paginate<T: Sortable>(items: Vec<T>, page: &Pagination) -> StorageResult<Vec<T>> {
    paginate_within(items, &[], page)
}

/// Like [`paginate`], with `population` as the unfiltered set `items` were
/// drawn from. Only consulted when the marker names no entity in `items`.
pub fn paginate_within<T: Sortable>(mut items: Vec<T>, population: &[T], page: &Pagination) -> StorageResult<Vec<T>> {
    let sort_key = page.sort_key.as_deref().unwrap_or(T::DEFAULT_SORT_KEY);
    if T::field_kind(sort_key).is_none() {
        return Err(StorageError::validation(format!("unknown sort key: {}", sort_key)));
    }
    let wanted = parse_marker::<T>(page)?;

    let mut order_fields = vec![sort_key];
    order_fields.extend(T::TIEBREAK.iter().copied().filter(|f| *f != sort_key));

    let directed = |ord: Ordering| match page.sort_dir {
        SortDir::Asc => ord,
        SortDir::Desc => ord.reverse(),
    };

    items.sort_by(|a, b| directed(key_of(a, &order_fields).cmp(&key_of(b, &order_fields))));

    if !wanted.is_empty() {
        let entity = find_marked(&items, &wanted).or_else(|| find_marked(population, &wanted));
        let (fields, boundary) = resolve_marker(entity, wanted, sort_key, &order_fields)?;
        items.retain(|item| directed(key_of(item, &fields).cmp(&boundary)) == Ordering::Greater);
    }

    if let Some(limit) = page.limit {
        items.truncate(limit);
    }

    Ok(items)
}

/// Whether the page has a marker naming no entity of `items`.
///
/// Backends use this to fetch the unfiltered population only when
/// [`paginate_within`] will need it.
pub fn marker_outside<T: Sortable>(items: &[T], page: &Pagination) -> StorageResult<bool> {
    let wanted = parse_marker::<T>(page)?;
    Ok(!wanted.is_empty() && find_marked(items, &wanted).is_none())
}

fn parse_marker<T: Sortable>(page: &Pagination) -> StorageResult<Vec<(&str, SortValue)>> {
    let mut wanted = Vec::with_capacity(page.marker_pairs.len());
    for (field, raw) in &page.marker_pairs {
        let kind = T::field_kind(field)
            .ok_or_else(|| StorageError::validation(format!("unknown marker field: {}", field)))?;
        wanted.push((field.as_str(), SortValue::parse(kind, raw)?));
    }
    Ok(wanted)
}

fn find_marked<'t, T: Sortable>(items: &'t [T], wanted: &[(&str, SortValue)]) -> Option<&'t T> {
    items.iter().find(|item| {
        wanted
            .iter()
            .all(|(field, value)| item.sort_value(field).as_ref() == Some(value))
    })
}

/// Work out the fields compared against the marker and the boundary key
fn resolve_marker<'a, T: Sortable>(
    entity: Option<&T>,
    wanted: Vec<(&'a str, SortValue)>,
    sort_key: &'a str,
    order_fields: &[&'a str],
) -> StorageResult<(Vec<&'a str>, Vec<Option<SortValue>>)> {
    if let Some(entity) = entity {
        let fields = order_fields.to_vec();
        let boundary = key_of(entity, &fields);
        return Ok((fields, boundary));
    }

    let sort_value = wanted
        .iter()
        .find(|(field, _)| *field == sort_key)
        .map(|(_, value)| value.clone())
        .ok_or_else(|| {
            StorageError::validation(format!(
                "marker matches no entity and does not include sort key {}",
                sort_key
            ))
        })?;

    let mut fields = vec![sort_key];
    let mut boundary = vec![Some(sort_value)];
    for (field, value) in wanted {
        if field != sort_key {
            fields.push(field);
            boundary.push(Some(value));
        }
    }
    Ok((fields, boundary))
}

fn text(s: &str) -> Option<SortValue> {
    Some(SortValue::Text(s.to_string()))
}

impl Sortable for Resource {
    const FIELDS: &'static [(&'static str, FieldKind)] = &[
        ("resource_id", FieldKind::Text),
        ("user_id", FieldKind::Text),
        ("project_id", FieldKind::Text),
        ("source", FieldKind::Text),
        ("first_sample_timestamp", FieldKind::Time),
        ("last_sample_timestamp", FieldKind::Time),
    ];
    const TIEBREAK: &'static [&'static str] = &["resource_id"];
    const DEFAULT_SORT_KEY: &'static str = "resource_id";

    fn sort_value(&self, field: &str) -> Option<SortValue> {
        match field {
            "resource_id" => text(&self.resource_id),
            "user_id" => text(&self.user_id),
            "project_id" => text(&self.project_id),
            "source" => text(&self.source),
            "first_sample_timestamp" => Some(SortValue::Time(self.first_sample_timestamp)),
            "last_sample_timestamp" => Some(SortValue::Time(self.last_sample_timestamp)),
            _ => None,
        }
    }
}

impl Sortable for Meter {
    const FIELDS: &'static [(&'static str, FieldKind)] = &[
        ("name", FieldKind::Text),
        ("type", FieldKind::Text),
        ("unit", FieldKind::Text),
        ("resource_id", FieldKind::Text),
        ("project_id", FieldKind::Text),
        ("user_id", FieldKind::Text),
        ("source", FieldKind::Text),
    ];
    const TIEBREAK: &'static [&'static str] = &["resource_id", "name", "type", "unit"];
    const DEFAULT_SORT_KEY: &'static str = "resource_id";

    fn sort_value(&self, field: &str) -> Option<SortValue> {
        match field {
            "name" => text(&self.name),
            "type" => text(self.meter_type.as_str()),
            "unit" => text(&self.unit),
            "resource_id" => text(&self.resource_id),
            "project_id" => text(&self.project_id),
            "user_id" => text(&self.user_id),
            "source" => text(&self.source),
            _ => None,
        }
    }
}

impl Sortable for Alarm {
    const FIELDS: &'static [(&'static str, FieldKind)] = &[
        ("alarm_id", FieldKind::Text),
        ("name", FieldKind::Text),
        ("description", FieldKind::Text),
        ("enabled", FieldKind::Bool),
        ("counter_name", FieldKind::Text),
        ("comparison_operator", FieldKind::Text),
        ("threshold", FieldKind::Number),
        ("statistic", FieldKind::Text),
        ("evaluation_periods", FieldKind::Number),
        ("period", FieldKind::Number),
        ("repeat_actions", FieldKind::Bool),
        ("state", FieldKind::Text),
        ("state_timestamp", FieldKind::Time),
        ("timestamp", FieldKind::Time),
        ("user_id", FieldKind::Text),
        ("project_id", FieldKind::Text),
    ];
    const TIEBREAK: &'static [&'static str] = &["alarm_id"];
    const DEFAULT_SORT_KEY: &'static str = "name";

    fn sort_value(&self, field: &str) -> Option<SortValue> {
        match field {
            "alarm_id" => text(&self.alarm_id),
            "name" => text(&self.name),
            "description" => text(&self.description),
            "enabled" => Some(SortValue::Bool(self.enabled)),
            "counter_name" => text(&self.counter_name),
            "comparison_operator" => text(self.comparison_operator.as_str()),
            "threshold" => Some(SortValue::Number(self.threshold)),
            "statistic" => text(self.statistic.as_str()),
            "evaluation_periods" => Some(SortValue::Number(self.evaluation_periods as f64)),
            "period" => Some(SortValue::Number(self.period as f64)),
            "repeat_actions" => Some(SortValue::Bool(self.repeat_actions)),
            "state" => text(self.state.as_str()),
            "state_timestamp" => Some(SortValue::Time(self.state_timestamp)),
            "timestamp" => Some(SortValue::Time(self.timestamp)),
            "user_id" => text(&self.user_id),
            "project_id" => text(&self.project_id),
            _ => None,
        }
    }
}
