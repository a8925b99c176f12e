//! SQLite backend
//!
//! Relational storage of samples, alarms and events. Filters are compiled to
//! `WHERE` clauses so only matching rows leave the database; ordering,
//! pagination and statistics then run on the shared engine.
//!
//! # Schema
//! - `sample`: one row per sample. `volume` has no declared type, so SQLite
//!   keeps INTEGER and REAL apart and 64-bit integers survive untouched.
//!   Timestamps are INTEGER microseconds since the epoch.
//! - `metadata`: flattened resource metadata, one row per key, typed by `kind`
//! - `alarm`: filterable columns plus the full record as JSON
//! - `alarm_history`: append-only change log
//! - `event` / `trait`: events and their typed trait slots
//!
//! The connection sits behind a `std::sync::Mutex`; no lock is held across
//! an `.await`.

use crate::storage::alarm::{prepare_update, Alarm, AlarmChange, AlarmFilter, NewAlarm};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::event::{Event, Trait, TraitRow, TraitType};
use crate::storage::filter::{EventFilter, SampleFilter};
use crate::storage::pagination::{marker_outside, paginate_within, Pagination};
use crate::storage::statistics::compute_statistics;
use crate::storage::types::{Metadata, MetadataValue, Meter, MeterType, Resource, Sample, Statistics, Volume};
use crate::storage::utils::{expiry_cutoff, from_micros, to_micros, DecimalTimestamp};
use crate::storage::views::{build_resources, meters_matching};
use crate::storage::{check_sample_filter, Capabilities, Connection, ConnectionOptions};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OpenFlags, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sample (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        meter_name TEXT NOT NULL,
        meter_type TEXT NOT NULL,
        unit TEXT NOT NULL,
        volume NOT NULL,
        user_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        source TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sample_timestamp ON sample(timestamp);
    CREATE INDEX IF NOT EXISTS idx_sample_resource ON sample(resource_id);
    CREATE INDEX IF NOT EXISTS idx_sample_meter ON sample(meter_name);

    CREATE TABLE IF NOT EXISTS metadata (
        sample_id INTEGER NOT NULL,
        meta_key TEXT NOT NULL,
        kind TEXT NOT NULL,
        value,
        PRIMARY KEY (sample_id, meta_key)
    );
    CREATE INDEX IF NOT EXISTS idx_metadata_key ON metadata(meta_key);

    CREATE TABLE IF NOT EXISTS alarm (
        alarm_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        counter_name TEXT NOT NULL,
        enabled INTEGER NOT NULL,
        state TEXT NOT NULL,
        user_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS alarm_history (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id TEXT NOT NULL UNIQUE,
        alarm_id TEXT NOT NULL,
        type TEXT NOT NULL,
        detail TEXT NOT NULL,
        user_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_alarm_history_alarm ON alarm_history(alarm_id);

    CREATE TABLE IF NOT EXISTS event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_name TEXT NOT NULL,
        generated INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_event_generated ON event(generated);

    CREATE TABLE IF NOT EXISTS trait (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        t_type INTEGER NOT NULL,
        t_string TEXT,
        t_int INTEGER,
        t_float REAL,
        t_datetime TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_trait_event ON trait(event_id);
    CREATE INDEX IF NOT EXISTS idx_trait_name ON trait(name);
";

const SAMPLE_COLUMNS: &str = "s.id, s.meter_name, s.meter_type, s.unit, s.volume, s.user_id, \
                              s.project_id, s.resource_id, s.timestamp, s.source";

/// A compiled `WHERE` clause and its bound parameters
#[derive(Debug, Default)]
struct Where {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Where {
    fn push(&mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    fn eq(&mut self, column: &str, value: &Option<String>) {
        if let Some(v) = value {
            self.push(format!("{} = ?", column), [Value::Text(v.clone())]);
        }
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn meta_kind(value: &MetadataValue) -> &'static str {
    match value {
        MetadataValue::Bool(_) => "bool",
        MetadataValue::Int(_) => "int",
        MetadataValue::Float(_) => "float",
        MetadataValue::Text(_) => "text",
    }
}

fn meta_to_sql(value: &MetadataValue) -> Value {
    match value {
        MetadataValue::Bool(b) => Value::Integer(i64::from(*b)),
        MetadataValue::Int(i) => Value::Integer(*i),
        MetadataValue::Float(f) => Value::Real(*f),
        MetadataValue::Text(s) => Value::Text(s.clone()),
    }
}

fn meta_from_sql(kind: &str, value: Value) -> StorageResult<MetadataValue> {
    match (kind, value) {
        ("bool", Value::Integer(i)) => Ok(MetadataValue::Bool(i != 0)),
        ("int", Value::Integer(i)) => Ok(MetadataValue::Int(i)),
        ("float", Value::Real(f)) => Ok(MetadataValue::Float(f)),
        ("float", Value::Integer(i)) => Ok(MetadataValue::Float(i as f64)),
        ("text", Value::Text(s)) => Ok(MetadataValue::Text(s)),
        (kind, value) => Err(StorageError::Serialization(format!(
            "metadata value {:?} does not match kind {}",
            value, kind
        ))),
    }
}

/// Translate a sample filter into conditions on the `sample s` alias
fn compile_sample_filter(filter: &SampleFilter) -> StorageResult<Where> {
    let mut w = Where::default();
    w.eq("s.user_id", &filter.user);
    w.eq("s.project_id", &filter.project);
    w.eq("s.resource_id", &filter.resource);
    w.eq("s.meter_name", &filter.meter);
    w.eq("s.source", &filter.source);

    if let Some(start) = &filter.start {
        w.push(
            format!("s.timestamp {} ?", filter.start_timestamp_op.sql()),
            [Value::Integer(to_micros(start))],
        );
    }
    if let Some(end) = &filter.end {
        w.push(
            format!("s.timestamp {} ?", filter.end_timestamp_op.sql()),
            [Value::Integer(to_micros(end))],
        );
    }

    for (key, value) in filter.metadata_predicates()? {
        let kind_clause = match value {
            MetadataValue::Int(_) | MetadataValue::Float(_) => "m.kind IN ('int', 'float')".to_string(),
            other => format!("m.kind = '{}'", meta_kind(other)),
        };
        w.push(
            format!(
                "EXISTS (SELECT 1 FROM metadata m WHERE m.sample_id = s.id AND m.meta_key = ? AND {} AND m.value = ?)",
                kind_clause
            ),
            [Value::Text(key.to_string()), meta_to_sql(value)],
        );
    }

    Ok(w)
}

/// Sample columns before typed decoding
struct RawSample {
    id: i64,
    meter_name: String,
    meter_type: String,
    unit: String,
    volume: Value,
    user_id: String,
    project_id: String,
    resource_id: String,
    timestamp: i64,
    source: String,
}

impl RawSample {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            meter_name: row.get(1)?,
            meter_type: row.get(2)?,
            unit: row.get(3)?,
            volume: row.get(4)?,
            user_id: row.get(5)?,
            project_id: row.get(6)?,
            resource_id: row.get(7)?,
            timestamp: row.get(8)?,
            source: row.get(9)?,
        })
    }

    fn into_sample(self, metadata: Metadata) -> StorageResult<(u64, Sample)> {
        let volume = match self.volume {
            Value::Integer(i) => Volume::Int(i),
            Value::Real(f) => Volume::Float(f),
            other => {
                return Err(StorageError::Serialization(format!(
                    "sample {} has a non-numeric volume {:?}",
                    self.id, other
                )))
            }
        };
        let meter_type: MeterType = self
            .meter_type
            .parse()
            .map_err(|_| StorageError::Serialization(format!("unknown meter type {}", self.meter_type)))?;

        let sample = Sample {
            meter_name: self.meter_name,
            meter_type,
            unit: self.unit,
            volume,
            user_id: self.user_id,
            project_id: self.project_id,
            resource_id: self.resource_id,
            timestamp: from_micros(self.timestamp)?,
            resource_metadata: metadata,
            source: self.source,
        };
        Ok((self.id as u64, sample))
    }
}

/// Backend storing everything in one SQLite database
pub struct SqliteConnection {
    conn: Mutex<rusqlite::Connection>,
    path: Option<PathBuf>,
    options: ConnectionOptions,
}

impl SqliteConnection {
    /// Create or open a database file
    pub fn open(path: impl AsRef<Path>, options: ConnectionOptions) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = rusqlite::Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = 10000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(path = ?path, "Opened SQLite storage");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
            options,
        })
    }

    /// A private database that disappears with the connection
    pub fn in_memory(options: ConnectionOptions) -> StorageResult<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            options,
        })
    }

    /// Database file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut rusqlite::Connection) -> StorageResult<T>) -> StorageResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Lock(format!("sqlite connection poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Samples matching `filter` with their metadata, tagged with row id
    fn select_samples(
        conn: &rusqlite::Connection,
        filter: &SampleFilter,
        newest_first: bool,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(u64, Sample)>> {
        let w = compile_sample_filter(filter)?;
        let mut sql = format!("SELECT {} FROM sample s{}", SAMPLE_COLUMNS, w.sql());
        if newest_first {
            sql.push_str(" ORDER BY s.timestamp DESC, s.id DESC");
        }
        if let Some(limit) = limit {
            // SQLite takes a signed 64-bit limit
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare_cached(&sql)?;
        let raw: Vec<RawSample> = stmt
            .query_map(params_from_iter(w.params.iter()), RawSample::from_row)?
            .collect::<Result<_, _>>()?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut metadata = Self::select_metadata(conn, &sql, &w)?;
        raw.into_iter()
            .map(|r| {
                let meta = metadata.remove(&r.id).unwrap_or_default();
                r.into_sample(meta)
            })
            .collect()
    }

    /// Metadata of every row selected by `sample_sql`
    fn select_metadata(
        conn: &rusqlite::Connection,
        sample_sql: &str,
        w: &Where,
    ) -> StorageResult<HashMap<i64, Metadata>> {
        let sql = format!(
            "SELECT md.sample_id, md.meta_key, md.kind, md.value FROM metadata md \
             WHERE md.sample_id IN (SELECT id FROM ({}))",
            sample_sql.replacen(SAMPLE_COLUMNS, "s.id AS id", 1)
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(w.params.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Value>(3)?,
            ))
        })?;

        let mut out: HashMap<i64, Metadata> = HashMap::new();
        for row in rows {
            let (sample_id, key, kind, value) = row?;
            out.entry(sample_id).or_default().insert(key, meta_from_sql(&kind, value)?);
        }
        Ok(out)
    }

    fn distinct(&self, column: &str, source: Option<&str>) -> StorageResult<BTreeSet<String>> {
        self.with_conn(|conn| {
            let mut w = Where::default();
            w.eq("s.source", &source.map(str::to_string));
            let sql = format!("SELECT DISTINCT s.{} FROM sample s{}", column, w.sql());
            let mut stmt = conn.prepare_cached(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(w.params.iter()), |row| row.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(ids)
        })
    }

    fn load_alarm(conn: &rusqlite::Connection, alarm_id: &str) -> StorageResult<Option<Alarm>> {
        let body: Option<String> = conn
            .query_row("SELECT body FROM alarm WHERE alarm_id = ?", params![alarm_id], |row| row.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    fn select_alarms(conn: &rusqlite::Connection, w: &Where) -> StorageResult<Vec<Alarm>> {
        let sql = format!("SELECT body FROM alarm{}", w.sql());
        let mut stmt = conn.prepare_cached(&sql)?;
        let bodies = stmt
            .query_map(params_from_iter(w.params.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str::<Alarm>(b).map_err(StorageError::from))
            .collect()
    }

    fn store_alarm(conn: &rusqlite::Connection, alarm: &Alarm) -> StorageResult<()> {
        let body = serde_json::to_string(alarm)?;
        conn.execute(
            "INSERT OR REPLACE INTO alarm (alarm_id, name, counter_name, enabled, state, user_id, project_id, body)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                alarm.alarm_id,
                alarm.name,
                alarm.counter_name,
                alarm.enabled,
                alarm.state.as_str(),
                alarm.user_id,
                alarm.project_id,
                body
            ],
        )?;
        Ok(())
    }

    fn append_history(conn: &rusqlite::Connection, change: &AlarmChange) -> StorageResult<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO alarm_history (event_id, alarm_id, type, detail, user_id, project_id, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )?;
        stmt.execute(params![
            change.event_id,
            change.alarm_id,
            change.change_type.as_str(),
            change.detail,
            change.user_id,
            change.project_id,
            to_micros(&change.timestamp)
        ])?;
        Ok(())
    }

    fn insert_event(tx: &rusqlite::Transaction<'_>, event: &mut Event) -> StorageResult<()> {
        if event.event_name.is_empty() {
            return Err(StorageError::validation("event name must not be empty"));
        }
        tx.prepare_cached("INSERT INTO event (event_name, generated) VALUES (?, ?)")?
            .execute(params![event.event_name, to_micros(&event.generated)])?;
        let event_id = tx.last_insert_rowid();
        event.id = Some(event_id as u64);

        for (position, t) in event.traits.iter_mut().enumerate() {
            t.validate()?;
            let row = TraitRow::from_value(&t.value);
            tx.prepare_cached(
                "INSERT INTO trait (event_id, position, name, t_type, t_string, t_int, t_float, t_datetime)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                event_id,
                position as i64,
                t.name,
                row.t_type.code(),
                row.t_string,
                row.t_int,
                row.t_float,
                row.t_datetime.map(|d| d.to_string())
            ])?;
            t.id = Some(tx.last_insert_rowid() as u64);
        }
        Ok(())
    }

    fn load_traits(conn: &rusqlite::Connection, event_id: i64) -> StorageResult<Vec<Trait>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, t_type, t_string, t_int, t_float, t_datetime
             FROM trait WHERE event_id = ? ORDER BY position",
        )?;
        let rows = stmt.query_map(params![event_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut traits = Vec::new();
        for row in rows {
            let (id, name, t_type, t_string, t_int, t_float, t_datetime) = row?;
            let t_datetime = match t_datetime {
                Some(d) => Some(d.parse::<DecimalTimestamp>()?),
                None => None,
            };
            let value = TraitRow {
                t_type: TraitType::from_code(t_type)?,
                t_string,
                t_int,
                t_float,
                t_datetime,
            }
            .into_value()?;
            traits.push(Trait {
                id: Some(id as u64),
                name,
                value,
            });
        }
        Ok(traits)
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn record_sample(&self, sample: Sample) -> StorageResult<()> {
        sample.validate()?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let volume = match sample.volume {
                Volume::Int(i) => Value::Integer(i),
                Volume::Float(f) => Value::Real(f),
            };
            tx.prepare_cached(
                "INSERT INTO sample (meter_name, meter_type, unit, volume, user_id, project_id, resource_id, timestamp, source)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                sample.meter_name,
                sample.meter_type.as_str(),
                sample.unit,
                volume,
                sample.user_id,
                sample.project_id,
                sample.resource_id,
                to_micros(&sample.timestamp),
                sample.source
            ])?;
            let sample_id = tx.last_insert_rowid();

            for (key, value) in &sample.resource_metadata {
                tx.prepare_cached("INSERT INTO metadata (sample_id, meta_key, kind, value) VALUES (?, ?, ?, ?)")?
                    .execute(params![sample_id, key, meta_kind(value), meta_to_sql(value)])?;
            }
            tx.commit()?;

            tracing::debug!(sample_id, resource = %sample.resource_id, meter = %sample.meter_name, "Recorded sample");
            Ok(())
        })
    }

    async fn get_samples(&self, filter: &SampleFilter, limit: Option<usize>) -> StorageResult<Vec<Sample>> {
        check_sample_filter(filter, self.capabilities())?;
        let rows = self.with_conn(|conn| Self::select_samples(conn, filter, true, limit))?;
        Ok(rows.into_iter().map(|(_, s)| s).collect())
    }

    async fn get_meter_statistics(
        &self,
        filter: &SampleFilter,
        period: Option<u64>,
    ) -> StorageResult<Vec<Statistics>> {
        check_sample_filter(filter, self.capabilities())?;
        let rows = self.with_conn(|conn| Self::select_samples(conn, filter, false, None))?;
        let period = period.unwrap_or(self.options.default_period);
        compute_statistics(rows.iter().map(|(_, s)| s), filter, period)
    }

    async fn get_resources(
        &self,
        filter: &SampleFilter,
        page: Option<&Pagination>,
    ) -> StorageResult<Vec<Resource>> {
        check_sample_filter(filter, self.capabilities())?;
        let default = Pagination::default();
        let page = page.unwrap_or(&default);

        let rows = self.with_conn(|conn| Self::select_samples(conn, filter, false, None))?;
        let resources = build_resources(rows.iter().map(|(seq, s)| (*seq, s)));
        let population = if marker_outside(&resources, page)? {
            let all = self.with_conn(|conn| Self::select_samples(conn, &SampleFilter::new(), false, None))?;
            build_resources(all.iter().map(|(seq, s)| (*seq, s)))
        } else {
            Vec::new()
        };
        paginate_within(resources, &population, page)
    }

    async fn get_meters(&self, filter: &SampleFilter, page: Option<&Pagination>) -> StorageResult<Vec<Meter>> {
        check_sample_filter(filter, self.capabilities())?;
        let default = Pagination::default();
        let page = page.unwrap_or(&default);

        let bounds = filter.time_bounds();
        let rows = self.with_conn(|conn| Self::select_samples(conn, &bounds, false, None))?;
        let meters = meters_matching(&build_resources(rows.iter().map(|(seq, s)| (*seq, s))), filter);
        let population = if marker_outside(&meters, page)? {
            let all = self.with_conn(|conn| Self::select_samples(conn, &SampleFilter::new(), false, None))?;
            meters_matching(&build_resources(all.iter().map(|(seq, s)| (*seq, s))), &SampleFilter::new())
        } else {
            Vec::new()
        };
        paginate_within(meters, &population, page)
    }

    async fn get_users(&self, source: Option<&str>) -> StorageResult<BTreeSet<String>> {
        self.distinct("user_id", source)
    }

    async fn get_projects(&self, source: Option<&str>) -> StorageResult<BTreeSet<String>> {
        self.distinct("project_id", source)
    }

    async fn create_alarm(&self, alarm: NewAlarm) -> StorageResult<Alarm> {
        let alarm = alarm.into_alarm(uuid::Uuid::new_v4().to_string(), self.options.clock.now())?;
        self.with_conn(|conn| Self::store_alarm(conn, &alarm))?;
        tracing::debug!(alarm_id = %alarm.alarm_id, name = %alarm.name, "Created alarm");
        Ok(alarm)
    }

    async fn update_alarm(&self, alarm: Alarm) -> StorageResult<Alarm> {
        let now = self.options.clock.now();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let stored = Self::load_alarm(&tx, &alarm.alarm_id)?
                .ok_or_else(|| StorageError::NotFound(format!("alarm {}", alarm.alarm_id)))?;

            let (updated, changes) = prepare_update(&stored, alarm, now)?;
            Self::store_alarm(&tx, &updated)?;
            for change in &changes {
                Self::append_history(&tx, change)?;
            }
            tx.commit()?;
            Ok(updated)
        })
    }

    async fn delete_alarm(&self, alarm_id: &str) -> StorageResult<()> {
        let now = self.options.clock.now();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let alarm = Self::load_alarm(&tx, alarm_id)?
                .ok_or_else(|| StorageError::NotFound(format!("alarm {}", alarm_id)))?;
            tx.execute("DELETE FROM alarm WHERE alarm_id = ?", params![alarm_id])?;
            Self::append_history(&tx, &AlarmChange::deletion(&alarm, now)?)?;
            tx.commit()?;
            Ok(())
        })
    }

    async fn get_alarms(&self, filter: &AlarmFilter, page: Option<&Pagination>) -> StorageResult<Vec<Alarm>> {
        let default = Pagination::default();
        let page = page.unwrap_or(&default);

        let mut w = Where::default();
        w.eq("alarm_id", &filter.alarm_id);
        w.eq("name", &filter.name);
        w.eq("user_id", &filter.user);
        w.eq("project_id", &filter.project);
        w.eq("counter_name", &filter.meter);
        if let Some(enabled) = filter.enabled {
            w.push("enabled = ?", [Value::Integer(i64::from(enabled))]);
        }
        if let Some(state) = filter.state {
            w.push("state = ?", [Value::Text(state.as_str().to_string())]);
        }

        let alarms = self.with_conn(|conn| Self::select_alarms(conn, &w))?;
        let population = if marker_outside(&alarms, page)? {
            self.with_conn(|conn| Self::select_alarms(conn, &Where::default()))?
        } else {
            Vec::new()
        };
        paginate_within(alarms, &population, page)
    }

    async fn get_alarm_history(&self, alarm_id: &str) -> StorageResult<Vec<AlarmChange>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event_id, alarm_id, type, detail, user_id, project_id, timestamp
                 FROM alarm_history WHERE alarm_id = ? ORDER BY timestamp, seq",
            )?;
            let rows = stmt
                .query_map(params![alarm_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            if rows.is_empty() && Self::load_alarm(conn, alarm_id)?.is_none() {
                return Err(StorageError::NotFound(format!("alarm {}", alarm_id)));
            }

            rows.into_iter()
                .map(|(event_id, alarm_id, change_type, detail, user_id, project_id, ts)| -> StorageResult<AlarmChange> {
                    Ok(AlarmChange {
                        event_id,
                        alarm_id,
                        change_type: change_type.parse()?,
                        detail,
                        user_id,
                        project_id,
                        timestamp: from_micros(ts)?,
                    })
                })
                .collect()
        })
    }

    async fn record_events(&self, mut events: Vec<Event>) -> StorageResult<Vec<Event>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for event in events.iter_mut() {
                Self::insert_event(&tx, event)?;
            }
            tx.commit()?;
            Ok(())
        })?;
        tracing::debug!(count = events.len(), "Recorded events");
        Ok(events)
    }

    async fn get_events(&self, filter: &EventFilter) -> StorageResult<Vec<Event>> {
        filter.validate()?;
        self.with_conn(|conn| {
            let mut w = Where::default();
            w.push(
                "e.generated >= ? AND e.generated <= ?",
                [Value::Integer(to_micros(&filter.start)), Value::Integer(to_micros(&filter.end))],
            );
            w.eq("e.event_name", &filter.event_name);
            for (name, value) in &filter.traits {
                let row = TraitRow::from_value(value);
                let (column, param) = match row.t_type {
                    TraitType::Text => ("t_string", row.t_string.map(Value::Text)),
                    TraitType::Int => ("t_int", row.t_int.map(Value::Integer)),
                    TraitType::Float => ("t_float", row.t_float.map(Value::Real)),
                    TraitType::Datetime => ("t_datetime", row.t_datetime.map(|d| Value::Text(d.to_string()))),
                };
                w.push(
                    format!(
                        "EXISTS (SELECT 1 FROM trait t WHERE t.event_id = e.id AND t.name = ? AND t.t_type = ? AND t.{} = ?)",
                        column
                    ),
                    [
                        Value::Text(name.clone()),
                        Value::Integer(row.t_type.code()),
                        param.unwrap_or(Value::Null),
                    ],
                );
            }

            let sql = format!(
                "SELECT e.id, e.event_name, e.generated FROM event e{} ORDER BY e.generated, e.id",
                w.sql()
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let heads = stmt
                .query_map(params_from_iter(w.params.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            heads
                .into_iter()
                .map(|(id, event_name, generated)| -> StorageResult<Event> {
                    Ok(Event {
                        id: Some(id as u64),
                        event_name,
                        generated: from_micros(generated)?,
                        traits: Self::load_traits(conn, id)?,
                    })
                })
                .collect()
        })
    }

    async fn purge_expired(&self, max_age_secs: u64) -> StorageResult<u64> {
        let Some(cutoff) = expiry_cutoff(self.options.clock.now(), max_age_secs) else {
            tracing::info!(max_age_secs, "Time to live reaches past the earliest timestamp, nothing to purge");
            return Ok(0);
        };
        let removed = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let cutoff = to_micros(&cutoff);
            tx.execute(
                "DELETE FROM metadata WHERE sample_id IN (SELECT id FROM sample WHERE timestamp < ?)",
                params![cutoff],
            )?;
            let removed = tx.execute("DELETE FROM sample WHERE timestamp < ?", params![cutoff])?;
            tx.commit()?;
            Ok(removed as u64)
        })?;
        tracing::info!(removed, %cutoff, "Purged expired samples");
        Ok(removed)
    }
}
