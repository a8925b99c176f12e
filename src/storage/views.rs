//! Resources and meters derived from samples
//!
//! Neither is stored. Each listing recomputes them from the samples a
//! backend fetched, so a purge or a new sample is reflected immediately.

use crate::storage::filter::SampleFilter;
use crate::storage::types::{Meter, Resource, ResourceMeter, Sample};
use std::collections::{BTreeMap, BTreeSet};

struct ResourceAcc<'a> {
    latest: (u64, &'a Sample),
    first_ts: chrono::DateTime<chrono::Utc>,
    meters: BTreeSet<ResourceMeter>,
}

/// Group samples by resource id.
///
/// `seq` is the recording order of each sample. The most recent sample,
/// by timestamp and then by `seq`, supplies the owner, source and metadata.
/// Output is sorted by resource id.
pub fn build_resources<'a, I>(samples: I) -> Vec<Resource>
where
    I: IntoIterator<Item = (u64, &'a Sample)>,
{
    let mut by_id: BTreeMap<&'a str, ResourceAcc<'a>> = BTreeMap::new();

    for (seq, sample) in samples {
        let meter = ResourceMeter::new(sample.meter_name.clone(), sample.meter_type, sample.unit.clone());
        match by_id.get_mut(sample.resource_id.as_str()) {
            Some(acc) => {
                let (latest_seq, latest) = acc.latest;
                if (sample.timestamp, seq) > (latest.timestamp, latest_seq) {
                    acc.latest = (seq, sample);
                }
                acc.first_ts = acc.first_ts.min(sample.timestamp);
                acc.meters.insert(meter);
            }
            None => {
                by_id.insert(
                    &sample.resource_id,
                    ResourceAcc {
                        latest: (seq, sample),
                        first_ts: sample.timestamp,
                        meters: BTreeSet::from([meter]),
                    },
                );
            }
        }
    }

    by_id
        .into_values()
        .map(|acc| {
            let latest = acc.latest.1;
            Resource {
                resource_id: latest.resource_id.clone(),
                user_id: latest.user_id.clone(),
                project_id: latest.project_id.clone(),
                source: latest.source.clone(),
                first_sample_timestamp: acc.first_ts,
                last_sample_timestamp: latest.timestamp,
                metadata: latest.resource_metadata.clone(),
                meter: acc.meters.into_iter().collect(),
            }
        })
        .collect()
}

/// Expand resources into their meters and keep those matching `filter`.
///
/// Time bounds are not checked here: the resources should already be built
/// from the time-bounded samples. Owner, source and metaquery predicates
/// apply to the resource's current state.
pub fn meters_matching(resources: &[Resource], filter: &SampleFilter) -> Vec<Meter> {
    let mut meters = Vec::new();
    for resource in resources {
        if !filter.matches_metadata(&resource.metadata) {
            continue;
        }
        for m in &resource.meter {
            let keep = filter.matches_dimensions(
                &resource.user_id,
                &resource.project_id,
                &resource.resource_id,
                Some(&m.counter_name),
                &resource.source,
            );
            if keep {
                meters.push(Meter {
                    name: m.counter_name.clone(),
                    meter_type: m.counter_type,
                    unit: m.counter_unit.clone(),
                    resource_id: resource.resource_id.clone(),
                    project_id: resource.project_id.clone(),
                    user_id: resource.user_id.clone(),
                    source: resource.source.clone(),
                });
            }
        }
    }
    meters
}
