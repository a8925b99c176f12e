//! Period-bucketed statistics
//!
//! Backends fetch the samples matching a filter and hand them here, so the
//! bucketing rules are the same whatever engine stored the data.
//!
//! With `period = 0` every sample falls into one bucket. Otherwise buckets
//! are fixed-width windows `[anchor + k*period, anchor + (k+1)*period)` where
//! the anchor is the filter's `start`, or the earliest sample floored to the
//! second. Empty windows are never emitted.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filter::SampleFilter;
use crate::storage::types::{Sample, Statistics};
use crate::storage::utils::{floor_to_second, seconds_between, to_micros};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;

/// Running aggregate for one bucket
#[derive(Debug)]
struct Bucket {
    unit: String,
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
}

impl Bucket {
    fn new(sample: &Sample) -> Self {
        let v = sample.volume.as_f64();
        Self {
            unit: sample.unit.clone(),
            count: 1,
            min: v,
            max: v,
            sum: v,
            first: sample.timestamp,
            last: sample.timestamp,
        }
    }

    fn add(&mut self, sample: &Sample) {
        let v = sample.volume.as_f64();
        self.count += 1;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.sum += v;
        self.first = self.first.min(sample.timestamp);
        self.last = self.last.max(sample.timestamp);
        if sample.unit < self.unit {
            self.unit = sample.unit.clone();
        }
    }

    fn finish(self, period: u64, bounds: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Statistics {
        Statistics {
            unit: Some(self.unit),
            count: self.count,
            min: self.min,
            max: self.max,
            sum: self.sum,
            avg: self.sum / self.count as f64,
            period,
            period_start: bounds.map(|(start, _)| start),
            period_end: bounds.map(|(_, end)| end),
            duration: seconds_between(&self.first, &self.last),
            duration_start: self.first,
            duration_end: self.last,
        }
    }
}

/// Aggregate already-filtered samples into period buckets.
///
/// Only `filter.start` is read, as the bucket anchor; the caller has already
/// applied every predicate. The result is ascending by `period_start`.
///
/// A period whose buckets cannot be placed on the timeline is a
/// `Validation` error.
pub fn compute_statistics<'a, I>(samples: I, filter: &SampleFilter, period: u64) -> StorageResult<Vec<Statistics>>
where
    I: IntoIterator<Item = &'a Sample>,
{
    let out_of_range = || StorageError::validation(format!("period of {} seconds is out of range", period));

    let width = match period {
        0 => None,
        p => {
            let width = i64::try_from(p)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .ok_or_else(out_of_range)?;
            let micros = width.num_microseconds().ok_or_else(out_of_range)?;
            Some((width, micros))
        }
    };

    let samples: Vec<&Sample> = samples.into_iter().collect();
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let Some((width, width_micros)) = width else {
        let mut bucket = Bucket::new(samples[0]);
        for sample in &samples[1..] {
            bucket.add(sample);
        }
        return Ok(vec![bucket.finish(0, None)]);
    };

    let anchor = match filter.start {
        Some(start) => start,
        None => {
            let earliest = samples.iter().map(|s| s.timestamp).min().unwrap_or_else(Utc::now);
            floor_to_second(earliest)
        }
    };
    let anchor_micros = i128::from(to_micros(&anchor));

    let mut buckets: BTreeMap<i128, Bucket> = BTreeMap::new();
    for sample in samples {
        let index = (i128::from(to_micros(&sample.timestamp)) - anchor_micros).div_euclid(i128::from(width_micros));
        buckets
            .entry(index)
            .and_modify(|b| b.add(sample))
            .or_insert_with(|| Bucket::new(sample));
    }

    buckets
        .into_iter()
        .map(|(index, bucket)| -> StorageResult<Statistics> {
            let offset = i64::try_from(index * i128::from(width_micros)).map_err(|_| out_of_range())?;
            let start = anchor
                .checked_add_signed(TimeDelta::microseconds(offset))
                .ok_or_else(out_of_range)?;
            let end = start.checked_add_signed(width).ok_or_else(out_of_range)?;
            Ok(bucket.finish(period, Some((start, end))))
        })
        .collect()
}
