//! Log-only backend
//!
//! Accepts samples by logging them and stores nothing. Useful as a sink when
//! metering should be observed but not kept. Listings are always empty;
//! anything that needs stored state reports `NotSupported`.

use crate::storage::alarm::{Alarm, AlarmChange, AlarmFilter};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filter::SampleFilter;
use crate::storage::pagination::Pagination;
use crate::storage::types::{Meter, Resource, Sample, Statistics};
use crate::storage::{check_sample_filter, Capabilities, Connection};
use async_trait::async_trait;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConnection;

impl LogConnection {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connection for LogConnection {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            metaquery: false,
            purge: false,
            events: false,
            alarms: false,
        }
    }

    async fn record_sample(&self, sample: Sample) -> StorageResult<()> {
        sample.validate()?;
        tracing::info!(
            meter = %sample.meter_name,
            volume = sample.volume.as_f64(),
            resource = %sample.resource_id,
            timestamp = %sample.timestamp,
            "metering data"
        );
        Ok(())
    }

    async fn get_samples(&self, filter: &SampleFilter, _limit: Option<usize>) -> StorageResult<Vec<Sample>> {
        check_sample_filter(filter, self.capabilities())?;
        Ok(Vec::new())
    }

    async fn get_meter_statistics(
        &self,
        filter: &SampleFilter,
        _period: Option<u64>,
    ) -> StorageResult<Vec<Statistics>> {
        check_sample_filter(filter, self.capabilities())?;
        Ok(Vec::new())
    }

    async fn get_resources(
        &self,
        filter: &SampleFilter,
        _page: Option<&Pagination>,
    ) -> StorageResult<Vec<Resource>> {
        check_sample_filter(filter, self.capabilities())?;
        Ok(Vec::new())
    }

    async fn get_meters(&self, filter: &SampleFilter, _page: Option<&Pagination>) -> StorageResult<Vec<Meter>> {
        check_sample_filter(filter, self.capabilities())?;
        Ok(Vec::new())
    }

    async fn get_users(&self, _source: Option<&str>) -> StorageResult<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }

    async fn get_projects(&self, _source: Option<&str>) -> StorageResult<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }

    async fn get_alarms(&self, _filter: &AlarmFilter, _page: Option<&Pagination>) -> StorageResult<Vec<Alarm>> {
        Ok(Vec::new())
    }

    async fn get_alarm_history(&self, alarm_id: &str) -> StorageResult<Vec<AlarmChange>> {
        Err(StorageError::NotFound(format!("alarm {}", alarm_id)))
    }
}
