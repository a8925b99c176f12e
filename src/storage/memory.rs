//! In-memory backend
//!
//! Document-style storage: samples are kept per resource, each resource in
//! its own shard behind its own lock, so writers on different resources
//! never contend. The shard map itself is only write-locked to add a
//! resource or to purge.
//!
//! Alarms, alarm history and events each live behind a single lock; every
//! mutation of them is applied as a whole under that lock.

use crate::storage::alarm::{prepare_update, Alarm, AlarmChange, AlarmFilter, NewAlarm};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::event::Event;
use crate::storage::filter::{EventFilter, SampleFilter};
use crate::storage::pagination::{marker_outside, paginate_within, Pagination};
use crate::storage::statistics::compute_statistics;
use crate::storage::types::{Meter, Resource, Sample, Statistics};
use crate::storage::utils::expiry_cutoff;
use crate::storage::views::{build_resources, meters_matching};
use crate::storage::{check_sample_filter, newest_first, Capabilities, Connection, ConnectionOptions};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

type Shard = Arc<RwLock<Vec<(u64, Sample)>>>;

#[derive(Debug, Default)]
struct AlarmTables {
    alarms: HashMap<String, Alarm>,
    history: HashMap<String, Vec<AlarmChange>>,
}

#[derive(Debug, Default)]
struct EventLog {
    next_event_id: u64,
    next_trait_id: u64,
    events: Vec<Event>,
}

/// Backend holding everything in process memory
pub struct MemoryConnection {
    options: ConnectionOptions,
    /// Recording order of samples
    seq: AtomicU64,
    shards: RwLock<HashMap<String, Shard>>,
    alarms: RwLock<AlarmTables>,
    events: RwLock<EventLog>,
}

impl MemoryConnection {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            seq: AtomicU64::new(0),
            shards: RwLock::new(HashMap::new()),
            alarms: RwLock::new(AlarmTables::default()),
            events: RwLock::new(EventLog::default()),
        }
    }

    /// Copy out samples matching `filter`, tagged with their recording order
    async fn select(&self, filter: &SampleFilter) -> Vec<(u64, Sample)> {
        let shards = self.shards.read().await;
        let wanted: Vec<Shard> = match &filter.resource {
            Some(id) => shards.get(id).cloned().into_iter().collect(),
            None => shards.values().cloned().collect(),
        };

        let mut out = Vec::new();
        for shard in wanted {
            let rows = shard.read().await;
            out.extend(rows.iter().filter(|(_, s)| filter.matches(s)).cloned());
        }
        out
    }

    async fn distinct(&self, source: Option<&str>, field: fn(&Sample) -> &str) -> BTreeSet<String> {
        let shards = self.shards.read().await;
        let mut ids = BTreeSet::new();
        for shard in shards.values() {
            for (_, sample) in shard.read().await.iter() {
                if source.map_or(true, |src| src == sample.source) {
                    ids.insert(field(sample).to_string());
                }
            }
        }
        ids
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn record_sample(&self, sample: Sample) -> StorageResult<()> {
        sample.validate()?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(resource = %sample.resource_id, meter = %sample.meter_name, seq, "Recording sample");

        {
            // the map stays read-locked while writing so a purge cannot drop the shard
            let shards = self.shards.read().await;
            if let Some(shard) = shards.get(&sample.resource_id) {
                shard.write().await.push((seq, sample));
                return Ok(());
            }
        }

        let mut shards = self.shards.write().await;
        let shard = shards.entry(sample.resource_id.clone()).or_default().clone();
        shard.write().await.push((seq, sample));
        Ok(())
    }

    async fn get_samples(&self, filter: &SampleFilter, limit: Option<usize>) -> StorageResult<Vec<Sample>> {
        check_sample_filter(filter, self.capabilities())?;
        let mut rows = self.select(filter).await;
        newest_first(&mut rows, |s| s.timestamp);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows.into_iter().map(|(_, s)| s).collect())
    }

    async fn get_meter_statistics(
        &self,
        filter: &SampleFilter,
        period: Option<u64>,
    ) -> StorageResult<Vec<Statistics>> {
        check_sample_filter(filter, self.capabilities())?;
        let rows = self.select(filter).await;
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

        let rows = self.select(filter).await;
        let resources = build_resources(rows.iter().map(|(seq, s)| (*seq, s)));
        let population = if marker_outside(&resources, page)? {
            let all = self.select(&SampleFilter::new()).await;
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

        let rows = self.select(&filter.time_bounds()).await;
        let meters = meters_matching(&build_resources(rows.iter().map(|(seq, s)| (*seq, s))), filter);
        let population = if marker_outside(&meters, page)? {
            let all = self.select(&SampleFilter::new()).await;
            meters_matching(&build_resources(all.iter().map(|(seq, s)| (*seq, s))), &SampleFilter::new())
        } else {
            Vec::new()
        };
        paginate_within(meters, &population, page)
    }

    async fn get_users(&self, source: Option<&str>) -> StorageResult<BTreeSet<String>> {
        Ok(self.distinct(source, |s| s.user_id.as_str()).await)
    }

    async fn get_projects(&self, source: Option<&str>) -> StorageResult<BTreeSet<String>> {
        Ok(self.distinct(source, |s| s.project_id.as_str()).await)
    }

    async fn create_alarm(&self, alarm: NewAlarm) -> StorageResult<Alarm> {
        let alarm_id = uuid::Uuid::new_v4().to_string();
        let alarm = alarm.into_alarm(alarm_id, self.options.clock.now())?;

        let mut tables = self.alarms.write().await;
        tables.alarms.insert(alarm.alarm_id.clone(), alarm.clone());
        tracing::debug!(alarm_id = %alarm.alarm_id, name = %alarm.name, "Created alarm");
        Ok(alarm)
    }

    async fn update_alarm(&self, alarm: Alarm) -> StorageResult<Alarm> {
        let mut tables = self.alarms.write().await;
        let stored = tables
            .alarms
            .get(&alarm.alarm_id)
            .ok_or_else(|| StorageError::NotFound(format!("alarm {}", alarm.alarm_id)))?;

        let (updated, changes) = prepare_update(stored, alarm, self.options.clock.now())?;
        tables.alarms.insert(updated.alarm_id.clone(), updated.clone());
        tables
            .history
            .entry(updated.alarm_id.clone())
            .or_default()
            .extend(changes);
        Ok(updated)
    }

    async fn delete_alarm(&self, alarm_id: &str) -> StorageResult<()> {
        let mut tables = self.alarms.write().await;
        let alarm = tables
            .alarms
            .remove(alarm_id)
            .ok_or_else(|| StorageError::NotFound(format!("alarm {}", alarm_id)))?;
        let entry = AlarmChange::deletion(&alarm, self.options.clock.now())?;
        tables.history.entry(alarm.alarm_id).or_default().push(entry);
        Ok(())
    }

    async fn get_alarms(&self, filter: &AlarmFilter, page: Option<&Pagination>) -> StorageResult<Vec<Alarm>> {
        let default = Pagination::default();
        let page = page.unwrap_or(&default);

        let tables = self.alarms.read().await;
        let alarms: Vec<Alarm> = tables.alarms.values().filter(|a| filter.matches(a)).cloned().collect();
        let population: Vec<Alarm> = if marker_outside(&alarms, page)? {
            tables.alarms.values().cloned().collect()
        } else {
            Vec::new()
        };
        paginate_within(alarms, &population, page)
    }

    async fn get_alarm_history(&self, alarm_id: &str) -> StorageResult<Vec<AlarmChange>> {
        let tables = self.alarms.read().await;
        match tables.history.get(alarm_id) {
            Some(history) => {
                let mut history = history.clone();
                history.sort_by_key(|c| c.timestamp);
                Ok(history)
            }
            None if tables.alarms.contains_key(alarm_id) => Ok(Vec::new()),
            None => Err(StorageError::NotFound(format!("alarm {}", alarm_id))),
        }
    }

    async fn record_events(&self, events: Vec<Event>) -> StorageResult<Vec<Event>> {
        for event in &events {
            if event.event_name.is_empty() {
                return Err(StorageError::validation("event name must not be empty"));
            }
            for t in &event.traits {
                t.validate()?;
            }
        }

        let mut log = self.events.write().await;
        let mut recorded = Vec::with_capacity(events.len());
        for mut event in events {
            event.id = Some(log.next_event_id);
            log.next_event_id += 1;
            for t in &mut event.traits {
                t.id = Some(log.next_trait_id);
                log.next_trait_id += 1;
            }
            log.events.push(event.clone());
            recorded.push(event);
        }
        tracing::debug!(count = recorded.len(), "Recorded events");
        Ok(recorded)
    }

    async fn get_events(&self, filter: &EventFilter) -> StorageResult<Vec<Event>> {
        filter.validate()?;
        let log = self.events.read().await;
        let mut events: Vec<Event> = log.events.iter().filter(|e| filter.matches(e)).cloned().collect();
        events.sort_by_key(|e| (e.generated, e.id));
        Ok(events)
    }

    async fn purge_expired(&self, max_age_secs: u64) -> StorageResult<u64> {
        let Some(cutoff) = expiry_cutoff(self.options.clock.now(), max_age_secs) else {
            tracing::info!(max_age_secs, "Time to live reaches past the earliest timestamp, nothing to purge");
            return Ok(0);
        };

        let mut shards = self.shards.write().await;
        let mut removed = 0u64;
        let mut emptied = Vec::new();
        for (resource_id, shard) in shards.iter() {
            let mut rows = shard.write().await;
            let before = rows.len();
            rows.retain(|(_, s)| s.timestamp >= cutoff);
            removed += (before - rows.len()) as u64;
            if rows.is_empty() {
                emptied.push(resource_id.clone());
            }
        }
        for resource_id in emptied {
            shards.remove(&resource_id);
        }

        tracing::info!(removed, %cutoff, "Purged expired samples");
        Ok(removed)
    }
}
