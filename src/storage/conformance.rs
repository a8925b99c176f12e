//! Behaviour every stateful backend must share.
//!
//! Each check opens a fresh connection through an opener so the same
//! assertions run against the memory and sqlite backends.

use crate::storage::pagination::{SortValue, Sortable};
use crate::storage::utils::parse_timestamp;
use crate::storage::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

type Opener = fn(ConnectionOptions) -> Arc<dyn Connection>;

fn open_memory(options: ConnectionOptions) -> Arc<dyn Connection> {
    Arc::new(MemoryConnection::new(options))
}

fn open_sqlite(options: ConnectionOptions) -> Arc<dyn Connection> {
    Arc::new(SqliteConnection::in_memory(options).unwrap())
}

macro_rules! conformance_suite {
    ($module:ident => $opener:expr; $($check:ident),+ $(,)?) => {
        mod $module {
            $(
                #[tokio::test]
                async fn $check() {
                    super::$check($opener).await;
                }
            )+
        }
    };
}

macro_rules! all_checks {
    ($module:ident => $opener:expr) => {
        conformance_suite!($module => $opener;
            users_and_projects,
            resources,
            resource_details,
            resources_by_start,
            resources_by_end,
            resources_by_both_bounds,
            resources_by_owner_and_metaquery,
            resource_pagination,
            resource_paging_walk,
            marker_outside_filter,
            meters,
            meter_pagination,
            meter_paging_walk,
            samples_limit_and_order,
            samples_by_user,
            samples_by_time,
            samples_by_name_and_source,
            sample_exact_match,
            invalid_filters,
            purge,
            purge_nothing,
            purge_beyond_time_range,
            statistics_without_period,
            statistics_by_period,
            statistics_with_timezone,
            statistics_narrow_windows,
            statistics_default_period,
            statistics_period_out_of_range,
            volume_kinds,
            alarms_crud,
            alarm_defaults,
            alarm_history,
            alarm_patch,
            alarm_pagination,
            alarm_paging_walk,
            events_ids,
            events_query,
            events_atomic,
            events_before_epoch,
        );
    };
}

all_checks!(memory_backend => super::open_memory as super::Opener);
all_checks!(sqlite_backend => super::open_sqlite as super::Opener);

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

fn jul2(h: u32, mi: u32) -> DateTime<Utc> {
    at(2012, 7, 2, h, mi)
}

fn instance(user: &str, project: &str, resource: &str, ts: DateTime<Utc>, source: &str, tag: &str) -> Sample {
    Sample::new("instance", MeterType::Cumulative, "", 1, user, project, resource, ts, source)
        .metadata("display_name", "test-server")
        .metadata("tag", tag)
}

/// Eleven samples over nine users, eight projects and nine resources
fn dataset() -> Vec<Sample> {
    let mut samples = vec![
        instance("user-id", "project-id", "resource-id", jul2(10, 39), "test-1", "self.counter"),
        instance("user-id", "project-id", "resource-id", jul2(10, 40), "test-1", "self.counter2"),
        instance("user-id", "project-id", "resource-id-alternate", jul2(10, 41), "test-2", "self.counter3"),
        instance("user-id-alternate", "project-id", "resource-id-alternate", jul2(10, 41), "test-3", "self.counter4"),
    ];
    let later = [
        jul2(10, 42),
        jul2(10, 43),
        jul2(10, 44),
        at(2011, 5, 30, 18, 3),
        at(2012, 12, 1, 1, 25),
        at(2012, 2, 29, 6, 59),
        at(2013, 5, 31, 23, 7),
    ];
    for (i, ts) in (2..).zip(later) {
        samples.push(instance(
            &format!("user-id-{}", i),
            &format!("project-id-{}", i),
            &format!("resource-id-{}", i),
            ts,
            "test",
            &format!("counter-{}", i),
        ));
    }
    samples
}

fn options() -> (ConnectionOptions, ManualClock) {
    let clock = ManualClock::new(jul2(10, 45));
    let options = ConnectionOptions::default().with_clock(Arc::new(clock.clone()));
    (options, clock)
}

async fn with_dataset(open: Opener) -> (Arc<dyn Connection>, ManualClock) {
    let (options, clock) = options();
    let conn = open(options);
    for sample in dataset() {
        conn.record_sample(sample).await.unwrap();
    }
    (conn, clock)
}

fn resource_ids(resources: &[Resource]) -> BTreeSet<String> {
    resources.iter().map(|r| r.resource_id.clone()).collect()
}

fn ids<const N: usize>(names: [&str; N]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn users_and_projects(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    let users = conn.get_users(None).await.unwrap();
    assert_eq!(users.len(), 9);
    assert!(users.contains("user-id-alternate"));
    assert_eq!(conn.get_users(Some("test-1")).await.unwrap(), ids(["user-id"]));

    assert_eq!(conn.get_projects(None).await.unwrap().len(), 8);
    assert_eq!(conn.get_projects(Some("test-1")).await.unwrap(), ids(["project-id"]));
    assert!(conn.get_projects(Some("no-such-source")).await.unwrap().is_empty());
}

async fn resources(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    let resources = conn.get_resources(&SampleFilter::new(), None).await.unwrap();
    assert_eq!(resources.len(), 9);
    let listed: Vec<_> = resources.iter().map(|r| r.resource_id.as_str()).collect();
    let mut sorted = listed.clone();
    sorted.sort();
    assert_eq!(listed, sorted);

    let by_source = conn
        .get_resources(&SampleFilter::new().source("test-1"), None)
        .await
        .unwrap();
    assert_eq!(resource_ids(&by_source), ids(["resource-id"]));
}

async fn resource_details(open: Opener) {
    let (conn, _) = with_dataset(open).await;
    let resources = conn.get_resources(&SampleFilter::new(), None).await.unwrap();

    let r = resources.iter().find(|r| r.resource_id == "resource-id").unwrap();
    assert_eq!(r.first_sample_timestamp, jul2(10, 39));
    assert_eq!(r.last_sample_timestamp, jul2(10, 40));
    assert_eq!(r.user_id, "user-id");
    assert_eq!(r.project_id, "project-id");
    assert_eq!(r.source, "test-1");
    assert_eq!(r.meter, vec![ResourceMeter::new("instance", MeterType::Cumulative, "")]);
    assert_eq!(r.metadata.get("tag"), Some(&MetadataValue::from("self.counter2")));

    // same timestamp, later record owns the resource
    let alt = resources
        .iter()
        .find(|r| r.resource_id == "resource-id-alternate")
        .unwrap();
    assert_eq!(alt.user_id, "user-id-alternate");
    assert_eq!(alt.source, "test-3");
}

async fn resources_by_start(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    let filter = SampleFilter::new().start(jul2(10, 42));
    let found = conn.get_resources(&filter, None).await.unwrap();
    assert_eq!(
        resource_ids(&found),
        ids(["resource-id-2", "resource-id-3", "resource-id-4", "resource-id-6", "resource-id-8"])
    );

    let filter = SampleFilter::new().start(jul2(10, 42)).start_op(StartOp::Gt);
    let found = conn.get_resources(&filter, None).await.unwrap();
    assert_eq!(
        resource_ids(&found),
        ids(["resource-id-3", "resource-id-4", "resource-id-6", "resource-id-8"])
    );
}

async fn resources_by_end(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    let filter = SampleFilter::new().end(jul2(10, 42)).end_op(EndOp::Lt);
    let found = conn.get_resources(&filter, None).await.unwrap();
    assert_eq!(
        resource_ids(&found),
        ids(["resource-id", "resource-id-alternate", "resource-id-5", "resource-id-7"])
    );

    // inclusive by default
    let filter = SampleFilter::new().end(jul2(10, 42));
    let found = conn.get_resources(&filter, None).await.unwrap();
    assert_eq!(
        resource_ids(&found),
        ids(["resource-id", "resource-id-alternate", "resource-id-2", "resource-id-5", "resource-id-7"])
    );
}

async fn resources_by_both_bounds(open: Opener) {
    let (conn, _) = with_dataset(open).await;
    let window = |start_op, end_op| {
        SampleFilter::new()
            .start(jul2(10, 42))
            .start_op(start_op)
            .end(jul2(10, 43))
            .end_op(end_op)
    };

    let found = conn.get_resources(&window(StartOp::Ge, EndOp::Lt), None).await.unwrap();
    assert_eq!(resource_ids(&found), ids(["resource-id-2"]));

    let found = conn.get_resources(&window(StartOp::Gt, EndOp::Lt), None).await.unwrap();
    assert!(found.is_empty());

    let found = conn.get_resources(&window(StartOp::Gt, EndOp::Le), None).await.unwrap();
    assert_eq!(resource_ids(&found), ids(["resource-id-3"]));

    let found = conn.get_resources(&window(StartOp::Ge, EndOp::Le), None).await.unwrap();
    assert_eq!(resource_ids(&found), ids(["resource-id-2", "resource-id-3"]));
}

async fn resources_by_owner_and_metaquery(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    let found = conn.get_resources(&SampleFilter::new().user("user-id"), None).await.unwrap();
    assert_eq!(resource_ids(&found), ids(["resource-id", "resource-id-alternate"]));

    let found = conn
        .get_resources(&SampleFilter::new().project("project-id"), None)
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let filter = SampleFilter::new().metaquery("metadata.display_name", "test-server");
    assert_eq!(conn.get_resources(&filter, None).await.unwrap().len(), 9);

    let filter = SampleFilter::new().metaquery("metadata.tag", "self.counter");
    let found = conn.get_resources(&filter, None).await.unwrap();
    assert_eq!(resource_ids(&found), ids(["resource-id"]));
}

async fn resource_pagination(open: Opener) {
    let (conn, _) = with_dataset(open).await;
    let all = SampleFilter::new();

    let page = Pagination::new().limit(8);
    assert_eq!(conn.get_resources(&all, Some(&page)).await.unwrap().len(), 8);
    let page = Pagination::new().limit(5);
    assert_eq!(conn.get_resources(&all, Some(&page)).await.unwrap().len(), 5);

    let page = Pagination::new()
        .sort("user_id", SortDir::Asc)
        .marker("user_id", "user-id-4")
        .marker("project_id", "project-id-4");
    assert_eq!(conn.get_resources(&all, Some(&page)).await.unwrap().len(), 5);

    let page = Pagination::new()
        .sort("user_id", SortDir::Asc)
        .marker("user_id", "user-id-4")
        .limit(3);
    let users: Vec<_> = conn
        .get_resources(&all, Some(&page))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.user_id)
        .collect();
    assert_eq!(users, ["user-id-5", "user-id-6", "user-id-7"]);

    let page = Pagination::new()
        .sort("user_id", SortDir::Desc)
        .marker("user_id", "user-id-4")
        .limit(2);
    let users: Vec<_> = conn
        .get_resources(&all, Some(&page))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.user_id)
        .collect();
    assert_eq!(users, ["user-id-3", "user-id-2"]);

    let page = Pagination::new()
        .sort("user_id", SortDir::Asc)
        .marker("project_id", "project-id-5")
        .limit(3);
    let found: Vec<_> = conn
        .get_resources(&all, Some(&page))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.resource_id)
        .collect();
    assert_eq!(found, ["resource-id-6", "resource-id-7", "resource-id-8"]);

    let page = Pagination::new().sort("flavor", SortDir::Asc);
    assert!(conn
        .get_resources(&all, Some(&page))
        .await
        .unwrap_err()
        .is_validation());
}

/// Marker naming `item` by its sort key and tie-break fields
fn marker_for<T: Sortable>(item: &T, sort_key: &str) -> BTreeMap<String, String> {
    std::iter::once(sort_key)
        .chain(T::TIEBREAK.iter().copied())
        .map(|field| {
            let text = match item.sort_value(field).unwrap() {
                SortValue::Text(s) => s,
                SortValue::Bool(b) => b.to_string(),
                SortValue::Number(n) => n.to_string(),
                SortValue::Time(t) => t.to_rfc3339(),
            };
            (field.to_string(), text)
        })
        .collect()
}

/// Follow markers from page to page until an empty page comes back
async fn walk_pages<T, F, Fut>(sort_key: &str, dir: SortDir, limit: usize, fetch: F) -> Vec<T>
where
    T: Sortable,
    F: Fn(Pagination) -> Fut,
    Fut: Future<Output = StorageResult<Vec<T>>>,
{
    let mut seen = Vec::new();
    let mut page = Pagination::new().sort(sort_key, dir).limit(limit);
    for _ in 0..64 {
        let batch = fetch(page.clone()).await.unwrap();
        assert!(batch.len() <= limit);
        let Some(last) = batch.last() else {
            return seen;
        };
        page.marker_pairs = marker_for(last, sort_key);
        seen.extend(batch);
    }
    panic!("paging by {} never ran out", sort_key);
}

async fn resource_paging_walk(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    for key in ["resource_id", "user_id", "source", "first_sample_timestamp"] {
        for dir in [SortDir::Asc, SortDir::Desc] {
            let full = conn
                .get_resources(&SampleFilter::new(), Some(&Pagination::new().sort(key, dir)))
                .await
                .unwrap();
            for limit in [1, 3] {
                let walked = walk_pages(key, dir, limit, |page| {
                    let conn = conn.clone();
                    async move { conn.get_resources(&SampleFilter::new(), Some(&page)).await }
                })
                .await;
                assert_eq!(resource_ids(&walked).len(), 9, "{} {:?} {}", key, dir, limit);
                assert_eq!(walked, full, "{} {:?} {}", key, dir, limit);
            }
        }
    }
}

async fn marker_outside_filter(open: Opener) {
    let (conn, _) = with_dataset(open).await;
    // resource-id-5 is from 2011 and falls outside this window
    let recent = SampleFilter::new().start(jul2(10, 42));

    let page = Pagination::new()
        .sort("user_id", SortDir::Asc)
        .marker("project_id", "project-id-5");
    let found = conn.get_resources(&recent, Some(&page)).await.unwrap();
    let listed: Vec<_> = found.iter().map(|r| r.resource_id.as_str()).collect();
    assert_eq!(listed, ["resource-id-6", "resource-id-8"]);

    let found = conn.get_resources(&recent, Some(&page.clone().limit(1))).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].resource_id, "resource-id-6");

    let page = Pagination::new()
        .sort("user_id", SortDir::Desc)
        .marker("resource_id", "resource-id-5");
    let found = conn.get_meters(&recent, Some(&page)).await.unwrap();
    let listed: Vec<_> = found.iter().map(|m| m.resource_id.as_str()).collect();
    assert_eq!(listed, ["resource-id-4", "resource-id-3", "resource-id-2"]);

    // unknown everywhere and no sort key to fall back on
    let page = Pagination::new()
        .sort("user_id", SortDir::Asc)
        .marker("project_id", "no-such-project");
    assert!(conn
        .get_resources(&recent, Some(&page))
        .await
        .unwrap_err()
        .is_validation());
}

async fn meters(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    assert_eq!(conn.get_meters(&SampleFilter::new(), None).await.unwrap().len(), 9);

    // resource-id-alternate now belongs to user-id-alternate
    let found = conn.get_meters(&SampleFilter::new().user("user-id"), None).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].resource_id, "resource-id");
    assert_eq!(found[0].name, "instance");
    assert_eq!(found[0].meter_type, MeterType::Cumulative);

    let found = conn
        .get_meters(&SampleFilter::new().project("project-id"), None)
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let filter = SampleFilter::new().metaquery("metadata.display_name", "test-server");
    assert_eq!(conn.get_meters(&filter, None).await.unwrap().len(), 9);
    let filter = SampleFilter::new().metaquery("metadata.display_name", "nope");
    assert!(conn.get_meters(&filter, None).await.unwrap().is_empty());

    assert!(conn
        .get_meters(&SampleFilter::new().meter("no-such-meter"), None)
        .await
        .unwrap()
        .is_empty());
}

async fn meter_pagination(open: Opener) {
    let (conn, _) = with_dataset(open).await;
    let all = SampleFilter::new();
    let users_of = |meters: Vec<Meter>| meters.into_iter().map(|m| m.user_id).collect::<Vec<_>>();

    let page = Pagination::new().limit(5);
    assert_eq!(conn.get_meters(&all, Some(&page)).await.unwrap().len(), 5);

    let page = Pagination::new()
        .sort("user_id", SortDir::Desc)
        .marker("user_id", "user-id-alternate");
    assert_eq!(conn.get_meters(&all, Some(&page)).await.unwrap().len(), 8);

    let page = Pagination::new()
        .sort("user_id", SortDir::Desc)
        .marker("user_id", "user-id-alternate")
        .limit(3);
    let found = users_of(conn.get_meters(&all, Some(&page)).await.unwrap());
    assert_eq!(found, ["user-id-8", "user-id-7", "user-id-6"]);

    let page = Pagination::new()
        .sort("user_id", SortDir::Asc)
        .marker("user_id", "user-id-4")
        .limit(3);
    let found = users_of(conn.get_meters(&all, Some(&page)).await.unwrap());
    assert_eq!(found, ["user-id-5", "user-id-6", "user-id-7"]);

    let page = Pagination::new()
        .sort("user_id", SortDir::Desc)
        .marker("user_id", "user-id-4")
        .limit(2);
    let found = users_of(conn.get_meters(&all, Some(&page)).await.unwrap());
    assert_eq!(found, ["user-id-3", "user-id-2"]);

    let page = Pagination::new()
        .sort("user_id", SortDir::Desc)
        .marker("user_id", "user-id");
    assert!(conn.get_meters(&all, Some(&page)).await.unwrap().is_empty());
}

async fn meter_paging_walk(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    for key in ["resource_id", "name", "user_id", "source"] {
        for dir in [SortDir::Asc, SortDir::Desc] {
            let full = conn
                .get_meters(&SampleFilter::new(), Some(&Pagination::new().sort(key, dir)))
                .await
                .unwrap();
            assert_eq!(full.len(), 9);
            for limit in [1, 3] {
                let walked = walk_pages(key, dir, limit, |page| {
                    let conn = conn.clone();
                    async move { conn.get_meters(&SampleFilter::new(), Some(&page)).await }
                })
                .await;
                assert_eq!(walked, full, "{} {:?} {}", key, dir, limit);
            }
        }
    }
}

async fn samples_limit_and_order(open: Opener) {
    let (conn, _) = with_dataset(open).await;
    let all = SampleFilter::new();

    assert!(conn.get_samples(&all, Some(0)).await.unwrap().is_empty());
    assert_eq!(conn.get_samples(&all, Some(3)).await.unwrap().len(), 3);

    let samples = conn.get_samples(&all, None).await.unwrap();
    assert_eq!(samples.len(), 11);
    for pair in samples.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp);
    }
    assert_eq!(samples[0].timestamp, at(2013, 5, 31, 23, 7));

    // equal timestamps come back most recently recorded first
    let alt = conn
        .get_samples(&SampleFilter::new().resource("resource-id-alternate"), None)
        .await
        .unwrap();
    assert_eq!(alt[0].user_id, "user-id-alternate");
    assert_eq!(alt[1].user_id, "user-id");
}

async fn samples_by_user(open: Opener) {
    let (conn, _) = with_dataset(open).await;
    let data = dataset();

    let filter = SampleFilter::new().user("user-id");
    assert_eq!(conn.get_samples(&filter, None).await.unwrap().len(), 3);
    assert_eq!(conn.get_samples(&filter, Some(1)).await.unwrap().len(), 1);
    assert_eq!(conn.get_samples(&filter, Some(42)).await.unwrap().len(), 3);

    let filter = SampleFilter::new().user("user-id").resource("resource-id");
    let found = conn.get_samples(&filter, None).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0], data[1]);
    assert_eq!(found[1], data[0]);
}

async fn samples_by_time(open: Opener) {
    let (conn, _) = with_dataset(open).await;
    let user = || SampleFilter::new().user("user-id");

    let found = conn.get_samples(&user().start(jul2(10, 41)), None).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].timestamp, jul2(10, 41));
    let found = conn
        .get_samples(&user().start(jul2(10, 41)).start_op(StartOp::Gt), None)
        .await
        .unwrap();
    assert!(found.is_empty());

    let found = conn
        .get_samples(&user().end(jul2(10, 40)).end_op(EndOp::Lt), None)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].timestamp, jul2(10, 39));
    let found = conn
        .get_samples(&user().end(jul2(10, 40)).end_op(EndOp::Le), None)
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[1].timestamp, jul2(10, 39));

    let window = |start_op, end_op| {
        SampleFilter::new()
            .start(jul2(10, 42))
            .start_op(start_op)
            .end(jul2(10, 43))
            .end_op(end_op)
    };
    let stamps = |samples: Vec<Sample>| samples.into_iter().map(|s| s.timestamp).collect::<Vec<_>>();

    let found = conn.get_samples(&window(StartOp::Ge, EndOp::Le), None).await.unwrap();
    assert_eq!(stamps(found), [jul2(10, 43), jul2(10, 42)]);
    let found = conn.get_samples(&window(StartOp::Ge, EndOp::Lt), None).await.unwrap();
    assert_eq!(stamps(found), [jul2(10, 42)]);
    let found = conn.get_samples(&window(StartOp::Gt, EndOp::Le), None).await.unwrap();
    assert_eq!(stamps(found), [jul2(10, 43)]);
    let found = conn.get_samples(&window(StartOp::Gt, EndOp::Lt), None).await.unwrap();
    assert!(found.is_empty());
}

async fn samples_by_name_and_source(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    let found = conn
        .get_samples(&SampleFilter::new().user("user-id").meter("no-such-meter"), None)
        .await
        .unwrap();
    assert!(found.is_empty());

    let found = conn
        .get_samples(&SampleFilter::new().user("user-id").meter("instance"), None)
        .await
        .unwrap();
    assert_eq!(found.len(), 3);

    let found = conn.get_samples(&SampleFilter::new().source("test-1"), None).await.unwrap();
    assert_eq!(found.len(), 2);

    let filter = SampleFilter::new().metaquery("metadata.display_name", "test-server");
    assert_eq!(conn.get_samples(&filter, None).await.unwrap().len(), 11);
}

async fn sample_exact_match(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    for sample in dataset() {
        let filter = SampleFilter::new()
            .user(&sample.user_id)
            .project(&sample.project_id)
            .resource(&sample.resource_id)
            .meter(&sample.meter_name)
            .source(&sample.source)
            .start(sample.timestamp)
            .end(sample.timestamp);
        let found = conn.get_samples(&filter, None).await.unwrap();
        assert!(found.contains(&sample), "{} not found", sample.resource_id);
        assert!(found.iter().all(|s| filter.matches(s)));
    }
}

async fn invalid_filters(open: Opener) {
    let (conn, _) = with_dataset(open).await;

    let backwards = SampleFilter::new().start(jul2(11, 0)).end(jul2(10, 0));
    assert!(conn.get_samples(&backwards, None).await.unwrap_err().is_validation());
    assert!(conn.get_resources(&backwards, None).await.unwrap_err().is_validation());

    let unprefixed = SampleFilter::new().metaquery("display_name", "test-server");
    assert!(conn.get_samples(&unprefixed, None).await.unwrap_err().is_validation());
    assert!(conn.get_meters(&unprefixed, None).await.unwrap_err().is_validation());
}

async fn purge(open: Opener) {
    let (conn, clock) = with_dataset(open).await;
    clock.set(jul2(10, 45));

    let removed = conn.purge_expired(3 * 60).await.unwrap();
    assert_eq!(removed, 6);

    assert_eq!(conn.get_samples(&SampleFilter::new(), None).await.unwrap().len(), 5);
    assert_eq!(conn.get_users(None).await.unwrap().len(), 5);
    assert_eq!(conn.get_projects(None).await.unwrap().len(), 5);
    let resources = conn.get_resources(&SampleFilter::new(), None).await.unwrap();
    assert_eq!(
        resource_ids(&resources),
        ids(["resource-id-2", "resource-id-3", "resource-id-4", "resource-id-6", "resource-id-8"])
    );
    assert_eq!(conn.get_meters(&SampleFilter::new(), None).await.unwrap().len(), 5);
}

async fn purge_nothing(open: Opener) {
    let (conn, clock) = with_dataset(open).await;
    clock.set(at(2010, 7, 2, 10, 45));

    assert_eq!(conn.purge_expired(3 * 60).await.unwrap(), 0);
    assert_eq!(conn.get_samples(&SampleFilter::new(), None).await.unwrap().len(), 11);
    assert_eq!(conn.get_users(None).await.unwrap().len(), 9);
    assert_eq!(conn.get_projects(None).await.unwrap().len(), 8);
    assert_eq!(conn.get_resources(&SampleFilter::new(), None).await.unwrap().len(), 9);
}

async fn purge_beyond_time_range(open: Opener) {
    let (conn, clock) = with_dataset(open).await;
    clock.set(jul2(10, 45));

    for max_age in [u64::MAX, i64::MAX as u64, 20_000_000_000_000] {
        assert_eq!(conn.purge_expired(max_age).await.unwrap(), 0, "{}", max_age);
    }
    // about 31 years, still on the timeline and older than every sample
    assert_eq!(conn.purge_expired(1_000_000_000).await.unwrap(), 0);

    assert_eq!(conn.get_samples(&SampleFilter::new(), None).await.unwrap().len(), 11);
    assert_eq!(conn.get_resources(&SampleFilter::new(), None).await.unwrap().len(), 9);
}

fn sep25(h: u32, mi: u32) -> DateTime<Utc> {
    at(2012, 9, 25, h, mi)
}

/// Two owners with three gauge samples each, an hour and a minute apart
async fn with_volumes(open: Opener, default_period: u64) -> Arc<dyn Connection> {
    let (options, _) = options();
    let conn = open(options.default_period(default_period));
    for i in 0..3u32 {
        let ts = sep25(10 + i, 30 + i);
        for (user, project, resource, base) in [
            ("user-id", "project1", "resource-id", 5),
            ("user-5", "project2", "resource-6", 8),
        ] {
            let sample = Sample::new(
                "volume.size",
                MeterType::Gauge,
                "GiB",
                base + i as i64,
                user,
                project,
                resource,
                ts,
                "test",
            )
            .metadata("display_name", "test-volume")
            .metadata("tag", "self.counter");
            conn.record_sample(sample).await.unwrap();
        }
    }
    conn
}

async fn statistics_without_period(open: Opener) {
    let conn = with_volumes(open, 0).await;

    let filter = SampleFilter::new().user("user-5").meter("volume.size");
    let stats = conn.get_meter_statistics(&filter, None).await.unwrap();
    assert_eq!(stats.len(), 1);
    let s = &stats[0];
    assert_eq!(s.duration, 7320.0);
    assert_eq!(s.duration_start, sep25(10, 30));
    assert_eq!(s.duration_end, sep25(12, 32));
    assert_eq!(s.count, 3);
    assert_eq!(s.min, 8.0);
    assert_eq!(s.max, 10.0);
    assert_eq!(s.sum, 27.0);
    assert_eq!(s.avg, 9.0);
    assert_eq!(s.period, 0);
    assert_eq!(s.unit.as_deref(), Some("GiB"));

    let filter = SampleFilter::new().user("user-id").meter("volume.size");
    let s = &conn.get_meter_statistics(&filter, Some(0)).await.unwrap()[0];
    assert_eq!((s.count, s.min, s.max, s.sum, s.avg), (3, 5.0, 7.0, 18.0, 6.0));

    let filter = SampleFilter::new().meter("volume.size");
    let stats = conn.get_meter_statistics(&filter, None).await.unwrap();
    assert_eq!(stats[0].count, 6);

    let filter = SampleFilter::new().meter("no-such-meter");
    assert!(conn.get_meter_statistics(&filter, None).await.unwrap().is_empty());
}

async fn statistics_by_period(open: Opener) {
    let conn = with_volumes(open, 0).await;

    let filter = SampleFilter::new()
        .user("user-5")
        .meter("volume.size")
        .start(sep25(10, 28));
    let stats = conn.get_meter_statistics(&filter, Some(7200)).await.unwrap();
    assert_eq!(stats.len(), 2);

    let first = &stats[0];
    assert_eq!(first.period, 7200);
    assert_eq!(first.period_start, Some(sep25(10, 28)));
    assert_eq!(first.period_end, Some(sep25(12, 28)));
    assert_eq!(first.count, 2);
    assert_eq!(first.avg, 8.5);
    assert_eq!(first.min, 8.0);
    assert_eq!(first.max, 9.0);
    assert_eq!(first.sum, 17.0);
    assert_eq!(first.duration, 3660.0);
    assert_eq!(first.duration_start, sep25(10, 30));
    assert_eq!(first.duration_end, sep25(11, 31));

    let second = &stats[1];
    assert_eq!(second.period_start, Some(sep25(12, 28)));
    assert_eq!(second.period_end, Some(sep25(14, 28)));
    assert_eq!(second.count, 1);
    assert_eq!(second.duration, 0.0);
}

async fn statistics_with_timezone(open: Opener) {
    let conn = with_volumes(open, 0).await;

    for start in [
        "2012-09-25T10:28:00",
        "2012-09-25T00:28:00-10:00",
        "2012-09-25T22:28:00+12:00",
    ] {
        let filter = SampleFilter::new()
            .user("user-5")
            .meter("volume.size")
            .start(parse_timestamp(start).unwrap());
        let stats = conn.get_meter_statistics(&filter, Some(7200)).await.unwrap();
        assert_eq!(stats.len(), 2, "{}", start);
        assert_eq!(stats[0].period_start, Some(sep25(10, 28)), "{}", start);
        assert_eq!(stats[0].count, 2, "{}", start);
        assert_eq!(stats[1].period_end, Some(sep25(14, 28)), "{}", start);
    }
}

async fn statistics_narrow_windows(open: Opener) {
    let conn = with_volumes(open, 0).await;

    let filter = SampleFilter::new()
        .user("user-5")
        .meter("volume.size")
        .start(sep25(10, 28))
        .end(sep25(11, 28));
    let stats = conn.get_meter_statistics(&filter, Some(1800)).await.unwrap();
    assert_eq!(stats.len(), 1);
    let s = &stats[0];
    assert_eq!(s.count, 1);
    assert_eq!(s.avg, 8.0);
    assert_eq!(s.duration, 0.0);
    assert_eq!(s.duration_start, sep25(10, 30));
    assert_eq!(s.duration_end, sep25(10, 30));

    let filter = SampleFilter::new()
        .resource("resource-id")
        .meter("volume.size")
        .start(sep25(11, 30))
        .end(sep25(11, 32));
    let stats = conn.get_meter_statistics(&filter, None).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].count, stats[0].min, stats[0].max), (1, 6.0, 6.0));
    assert_eq!(stats[0].duration, 0.0);
}

async fn statistics_default_period(open: Opener) {
    let conn = with_volumes(open, 3600).await;

    let filter = SampleFilter::new().user("user-5").meter("volume.size");
    let stats = conn.get_meter_statistics(&filter, None).await.unwrap();
    assert_eq!(stats.len(), 3);
    assert!(stats.iter().all(|s| s.period == 3600 && s.count == 1));

    // an explicit zero overrides the configured period
    let stats = conn.get_meter_statistics(&filter, Some(0)).await.unwrap();
    assert_eq!(stats.len(), 1);
}

async fn statistics_period_out_of_range(open: Opener) {
    let conn = with_volumes(open, 0).await;
    let filter = SampleFilter::new().meter("volume.size");

    for period in [10_000_000_000_000, u64::MAX] {
        let err = conn.get_meter_statistics(&filter, Some(period)).await.unwrap_err();
        assert!(err.is_validation(), "{}", period);
    }

    let year = 365 * 24 * 3600;
    let stats = conn.get_meter_statistics(&filter, Some(year)).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].count, 6);
    assert_eq!(stats[0].period_start, Some(sep25(10, 30)));
    assert_eq!(stats[0].period_end, Some(sep25(10, 30) + Duration::days(365)));

    let conn = with_volumes(open, u64::MAX).await;
    assert!(conn
        .get_meter_statistics(&filter, None)
        .await
        .unwrap_err()
        .is_validation());
}

async fn volume_kinds(open: Opener) {
    let (options, _) = options();
    let conn = open(options);
    let ts = jul2(10, 40);
    for (meter, volume) in [
        ("dummyBigCounter", Volume::Int(3372036854775807)),
        ("dummySmallCounter", Volume::Int(-3372036854775807)),
        ("floatCounter", Volume::Float(1938495037.53697)),
    ] {
        let sample = Sample::new(meter, MeterType::Cumulative, "", volume, "user-id", "project-id", "resource-id", ts, "test-1");
        conn.record_sample(sample).await.unwrap();
    }

    let volume_of = |samples: Vec<Sample>| samples.into_iter().next().map(|s| s.volume);
    let big = conn.get_samples(&SampleFilter::new().meter("dummyBigCounter"), None).await.unwrap();
    assert_eq!(volume_of(big), Some(Volume::Int(3372036854775807)));
    let small = conn.get_samples(&SampleFilter::new().meter("dummySmallCounter"), None).await.unwrap();
    assert_eq!(volume_of(small), Some(Volume::Int(-3372036854775807)));
    let float = conn.get_samples(&SampleFilter::new().meter("floatCounter"), None).await.unwrap();
    assert_eq!(volume_of(float), Some(Volume::Float(1938495037.53697)));
}

fn alarm_fixture() -> Vec<NewAlarm> {
    vec![
        NewAlarm::new("red-alert", "test.one", ComparisonOperator::Eq, 36.0, Statistic::Count, "me", "and-da-boys")
            .evaluation_periods(1)
            .period(60)
            .alarm_action("http://nowhere/alarms")
            .matching("key", "value"),
        NewAlarm::new("orange-alert", "test.fourty", ComparisonOperator::Gt, 75.0, Statistic::Avg, "me", "and-da-boys")
            .period(60)
            .alarm_action("http://nowhere/alarms")
            .matching("key2", "value2"),
        NewAlarm::new("yellow-alert", "test.five", ComparisonOperator::Lt, 10.0, Statistic::Min, "me", "and-da-boys")
            .period(60)
            .alarm_action("http://nowhere/alarms")
            .matching("key2", "value2")
            .matching("user_metadata.key3", "value3"),
    ]
}

async fn with_alarms(open: Opener) -> (Arc<dyn Connection>, ManualClock) {
    let (options, clock) = options();
    let conn = open(options);
    for alarm in alarm_fixture() {
        conn.create_alarm(alarm).await.unwrap();
    }
    (conn, clock)
}

async fn alarm_named(conn: &dyn Connection, name: &str) -> Alarm {
    conn.get_alarms(&AlarmFilter::new().name(name), None)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
}

async fn alarms_crud(open: Opener) {
    let (options, _) = options();
    let empty = open(options);
    assert!(empty.get_alarms(&AlarmFilter::new(), None).await.unwrap().is_empty());

    let (conn, _) = with_alarms(open).await;
    let all = conn.get_alarms(&AlarmFilter::new(), None).await.unwrap();
    assert_eq!(all.len(), 3);
    let distinct: BTreeSet<_> = all.iter().map(|a| a.alarm_id.clone()).collect();
    assert_eq!(distinct.len(), 3);

    let mut orange = alarm_named(&*conn, "orange-alert").await;
    orange.enabled = false;
    orange.matching_metadata.clear();
    orange
        .matching_metadata
        .insert("new_key".to_string(), "new_value".to_string());
    let updated = conn.update_alarm(orange.clone()).await.unwrap();
    assert!(!updated.enabled);
    let stored = alarm_named(&*conn, "orange-alert").await;
    assert!(!stored.enabled);
    assert_eq!(stored.matching_metadata.get("new_key").map(String::as_str), Some("new_value"));
    assert_eq!(conn.get_alarms(&AlarmFilter::new().enabled(false), None).await.unwrap().len(), 1);

    conn.delete_alarm(&orange.alarm_id).await.unwrap();
    assert_eq!(conn.get_alarms(&AlarmFilter::new(), None).await.unwrap().len(), 2);
    assert!(conn.delete_alarm(&orange.alarm_id).await.unwrap_err().is_not_found());

    let mut ghost = orange;
    ghost.alarm_id = "no-such-alarm".to_string();
    assert!(conn.update_alarm(ghost).await.unwrap_err().is_not_found());

    let user_filtered = conn
        .get_alarms(&AlarmFilter::new().user("me").project("and-da-boys").meter("test.one"), None)
        .await
        .unwrap();
    assert_eq!(user_filtered.len(), 1);
    assert_eq!(user_filtered[0].name, "red-alert");
}

async fn alarm_defaults(open: Opener) {
    let (conn, clock) = with_alarms(open).await;

    let yellow = alarm_named(&*conn, "yellow-alert").await;
    assert_eq!(yellow.description, "Alarm when test.five is lt a min of 10 over 60 seconds");
    assert_eq!(yellow.state, AlarmState::InsufficientData);
    assert!(yellow.enabled);
    assert!(!yellow.repeat_actions);
    assert_eq!(yellow.evaluation_periods, 1);
    assert!(yellow.ok_actions.is_empty());
    assert!(yellow.insufficient_data_actions.is_empty());
    assert_eq!(yellow.alarm_actions, ["http://nowhere/alarms"]);
    assert_eq!(
        yellow.matching_metadata.get("user_metadata.key3").map(String::as_str),
        Some("value3")
    );
    assert_eq!(yellow.timestamp, clock.now());
    assert_eq!(yellow.state_timestamp, clock.now());

    let magic = json!({
        "name": "magic-alert",
        "counter_name": "test.one",
        "comparison_operator": "eq",
        "threshold": 1.0,
        "statistic": "magic",
        "user_id": "me",
        "project_id": "and-da-boys",
    });
    assert!(NewAlarm::from_json(&magic).unwrap_err().is_validation());

    let no_period = NewAlarm::new("llu", "counter", ComparisonOperator::Lt, 34.0, Statistic::Max, "bla", "ffo")
        .period(0);
    assert!(conn.create_alarm(no_period).await.unwrap_err().is_validation());
    assert_eq!(conn.get_alarms(&AlarmFilter::new(), None).await.unwrap().len(), 3);
}

async fn alarm_history(open: Opener) {
    let (options, clock) = options();
    let conn = open(options);

    let llu = conn
        .create_alarm(NewAlarm::new("llu", "counter", ComparisonOperator::Lt, 34.0, Statistic::Max, "bla", "ffo"))
        .await
        .unwrap();
    assert!(conn.get_alarm_history(&llu.alarm_id).await.unwrap().is_empty());

    clock.advance(Duration::minutes(1));
    let mut changed = llu.clone();
    changed.state = AlarmState::Ok;
    changed.description = ":)".to_string();
    let updated = conn.update_alarm(changed).await.unwrap();
    assert_eq!(updated.state_timestamp, clock.now());
    assert_eq!(conn.get_alarms(&AlarmFilter::new(), None).await.unwrap().len(), 1);

    // a no-op update leaves no trace
    clock.advance(Duration::minutes(1));
    let unchanged = conn.update_alarm(updated.clone()).await.unwrap();
    assert_eq!(unchanged.timestamp, updated.timestamp);

    clock.advance(Duration::minutes(1));
    conn.delete_alarm(&llu.alarm_id).await.unwrap();

    let history = conn.get_alarm_history(&llu.alarm_id).await.unwrap();
    let kinds: Vec<_> = history.iter().map(|c| c.change_type).collect();
    assert_eq!(
        kinds,
        [
            AlarmChangeType::RuleChange,
            AlarmChangeType::StateTransition,
            AlarmChangeType::Deletion,
        ]
    );
    assert!(history[0].detail.contains(":)"));
    assert!(history[1].detail.contains("ok"));
    assert!(history.iter().all(|c| c.alarm_id == llu.alarm_id && c.user_id == "bla"));
    for pair in history.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    assert!(conn.get_alarm_history("no-such-alarm").await.unwrap_err().is_not_found());
}

async fn alarm_patch(open: Opener) {
    let (conn, _) = with_alarms(open).await;
    let red = alarm_named(&*conn, "red-alert").await;

    let patched = conn
        .patch_alarm(&red.alarm_id, &json!({ "threshold": 42.0, "favourite_colour": "blue" }))
        .await
        .unwrap();
    assert_eq!(patched.threshold, 42.0);
    assert_eq!(patched.name, "red-alert");
    assert_eq!(alarm_named(&*conn, "red-alert").await.threshold, 42.0);

    let err = conn
        .patch_alarm(&red.alarm_id, &json!({ "threshold": "high" }))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    assert!(conn
        .patch_alarm("no-such-alarm", &json!({ "enabled": false }))
        .await
        .unwrap_err()
        .is_not_found());
}

async fn alarm_pagination(open: Opener) {
    let (conn, _) = with_alarms(open).await;
    let all = AlarmFilter::new();
    let names = |alarms: Vec<Alarm>| alarms.into_iter().map(|a| a.name).collect::<Vec<_>>();

    assert_eq!(conn.get_alarms(&all, Some(&Pagination::new().limit(2))).await.unwrap().len(), 2);
    assert_eq!(conn.get_alarms(&all, Some(&Pagination::new().limit(1))).await.unwrap().len(), 1);

    let by_name = |marker: &str| {
        Pagination::new()
            .sort("name", SortDir::Desc)
            .marker("name", marker)
    };
    assert!(conn.get_alarms(&all, Some(&by_name("orange-alert"))).await.unwrap().is_empty());
    assert_eq!(conn.get_alarms(&all, Some(&by_name("red-alert"))).await.unwrap().len(), 1);
    let found = names(conn.get_alarms(&all, Some(&by_name("yellow-alert"))).await.unwrap());
    assert_eq!(found, ["red-alert", "orange-alert"]);
    let found = names(
        conn.get_alarms(&all, Some(&by_name("yellow-alert").limit(4)))
            .await
            .unwrap(),
    );
    assert_eq!(found, ["red-alert", "orange-alert"]);

    let page = Pagination::new()
        .sort("counter_name", SortDir::Desc)
        .marker("name", "orange-alert");
    assert_eq!(conn.get_alarms(&all, Some(&page)).await.unwrap().len(), 1);

    let page = Pagination::new()
        .sort("comparison_operator", SortDir::Desc)
        .marker("name", "yellow-alert");
    assert_eq!(conn.get_alarms(&all, Some(&page)).await.unwrap().len(), 2);

    let page = Pagination::new()
        .sort("comparison_operator", SortDir::Desc)
        .marker("name", "orange-alert")
        .limit(2);
    assert_eq!(names(conn.get_alarms(&all, Some(&page)).await.unwrap()), ["red-alert"]);
}

async fn alarm_paging_walk(open: Opener) {
    let (conn, _) = with_alarms(open).await;
    for extra in ["green-alert", "blue-alert", "indigo-alert"] {
        let alarm = NewAlarm::new(extra, "test.six", ComparisonOperator::Ge, 5.0, Statistic::Max, "me", "and-da-boys");
        conn.create_alarm(alarm).await.unwrap();
    }

    for key in ["name", "user_id", "threshold", "enabled", "timestamp"] {
        for dir in [SortDir::Asc, SortDir::Desc] {
            let full = conn
                .get_alarms(&AlarmFilter::new(), Some(&Pagination::new().sort(key, dir)))
                .await
                .unwrap();
            assert_eq!(full.len(), 6);
            for limit in [1, 3] {
                let walked = walk_pages(key, dir, limit, |page| {
                    let conn = conn.clone();
                    async move { conn.get_alarms(&AlarmFilter::new(), Some(&page)).await }
                })
                .await;
                assert_eq!(walked, full, "{} {:?} {}", key, dir, limit);
            }
        }
    }

    // a marker may name an alarm the filter leaves out
    let orange = alarm_named(&*conn, "orange-alert").await;
    let page = Pagination::new()
        .sort("name", SortDir::Asc)
        .marker("alarm_id", orange.alarm_id.as_str());
    let found = conn
        .get_alarms(&AlarmFilter::new().meter("test.one"), Some(&page))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "red-alert");
}

fn event_start() -> DateTime<Utc> {
    at(2013, 12, 31, 5, 0)
}

fn event_fixture() -> Vec<Event> {
    ["Foo", "Bar", "Zoo"]
        .iter()
        .zip([0i64, 100, 200])
        .enumerate()
        .map(|(i, (name, base))| {
            let generated = event_start() + Duration::hours(i as i64);
            Event::new(
                *name,
                generated,
                vec![
                    Trait::text("trait_A", format!("my_{}_text", name)),
                    Trait::int("trait_B", base + 1),
                    Trait::float("trait_C", base as f64 + 0.123456),
                    Trait::datetime("trait_D", generated),
                ],
            )
        })
        .collect()
}

async fn events_ids(open: Opener) {
    let (options, _) = options();
    let conn = open(options);

    let bare: Vec<Event> = (0..3)
        .map(|i| Event::new(format!("Foo{}", i), event_start(), Vec::new()))
        .collect();
    let recorded = conn.record_events(bare).await.unwrap();
    let ids: BTreeSet<_> = recorded.iter().map(|e| e.id.unwrap()).collect();
    assert_eq!(ids.len(), 3);

    let recorded = conn.record_events(event_fixture()).await.unwrap();
    let trait_ids: BTreeSet<_> = recorded
        .iter()
        .flat_map(|e| e.traits.iter().map(|t| t.id.unwrap()))
        .collect();
    assert_eq!(trait_ids.len(), 12);
    assert!(recorded.iter().all(|e| e.id.is_some()));
}

async fn events_query(open: Opener) {
    let (options, _) = options();
    let conn = open(options);
    conn.record_events(event_fixture()).await.unwrap();
    let end = event_start() + Duration::hours(3);

    let events = conn.get_events(&EventFilter::new(event_start(), end)).await.unwrap();
    let names: Vec<_> = events.iter().map(|e| e.event_name.as_str()).collect();
    assert_eq!(names, ["Foo", "Bar", "Zoo"]);
    for (event, expected) in events.iter().zip(event_fixture()) {
        assert_eq!(event.traits.len(), 4);
        assert_eq!(event.generated, expected.generated);
        for t in &expected.traits {
            assert_eq!(event.trait_value(&t.name), Some(&t.value), "{}", t.name);
        }
    }

    let bar = conn
        .get_events(&EventFilter::new(event_start(), end).event_name("Bar"))
        .await
        .unwrap();
    assert_eq!(bar.len(), 1);
    assert_eq!(bar[0].event_name, "Bar");

    let by_int = conn
        .get_events(&EventFilter::new(event_start(), end).with_trait("trait_B", TraitValue::Int(101)))
        .await
        .unwrap();
    assert_eq!(by_int.len(), 1);
    assert_eq!(by_int[0].event_name, "Bar");

    let zoo_at = event_start() + Duration::hours(2);
    let by_time = conn
        .get_events(&EventFilter::new(event_start(), end).with_trait("trait_D", TraitValue::Datetime(zoo_at)))
        .await
        .unwrap();
    assert_eq!(by_time.len(), 1);
    assert_eq!(by_time[0].event_name, "Zoo");

    let by_text = conn
        .get_events(&EventFilter::new(event_start(), end).with_trait("trait_A", TraitValue::Text("my_Foo_text".into())))
        .await
        .unwrap();
    assert_eq!(by_text.len(), 1);

    // the window is inclusive at both ends
    let first_only = conn
        .get_events(&EventFilter::new(event_start(), event_start()))
        .await
        .unwrap();
    assert_eq!(first_only.len(), 1);

    let backwards = EventFilter::new(end, event_start());
    assert!(conn.get_events(&backwards).await.unwrap_err().is_validation());
}

async fn events_atomic(open: Opener) {
    let (options, _) = options();
    let conn = open(options);

    let mut events = event_fixture();
    events[2].traits.push(Trait::int("", 7));
    assert!(conn.record_events(events).await.unwrap_err().is_validation());

    let end = event_start() + Duration::hours(3);
    assert!(conn
        .get_events(&EventFilter::new(event_start(), end))
        .await
        .unwrap()
        .is_empty());
}

async fn events_before_epoch(open: Opener) {
    let (options, _) = options();
    let conn = open(options);

    let landing = parse_timestamp("1969-07-20T20:17:40Z").unwrap();
    let tick = parse_timestamp("1969-12-31T23:59:59.500Z").unwrap();
    let tock = parse_timestamp("1970-01-01T00:00:00.500Z").unwrap();
    let events: Vec<Event> = [("Landing", landing), ("Tick", tick), ("Tock", tock)]
        .into_iter()
        .map(|(name, when)| Event::new(name, event_start(), vec![Trait::datetime("when", when)]))
        .collect();
    conn.record_events(events).await.unwrap();

    let window = EventFilter::new(event_start(), event_start());
    let stored = conn.get_events(&window).await.unwrap();
    assert_eq!(stored.len(), 3);
    for (event, when) in stored.iter().zip([landing, tick, tock]) {
        assert_eq!(event.trait_value("when"), Some(&TraitValue::Datetime(when)), "{}", event.event_name);
    }

    for (name, when) in [("Landing", landing), ("Tick", tick), ("Tock", tock)] {
        let found = conn
            .get_events(&window.clone().with_trait("when", TraitValue::Datetime(when)))
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "{}", name);
        assert_eq!(found[0].event_name, name);
    }
}
