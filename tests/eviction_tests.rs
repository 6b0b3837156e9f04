//! Integration tests for deletion planning and execution.

use std::sync::Arc;

use serde_json::json;

use archive_cache::cache::object::{now_millis, CachedObject, Metadata};
use archive_cache::cache::strategy::{BigOldStrategy, SelectionStrategy};
use archive_cache::cache::{DeletionPlan, DeletionPlanner};
use archive_cache::error::CacheError;
use archive_cache::inventory::{Catalog, Purpose, SharedCatalog, VolumeStatus};
use archive_cache::volume::{CacheVolume, MemoryVolume};

const SIZES: [u64; 7] = [229, 9321, 44001, 100311, 953, 2230, 100];
const TOTAL: u64 = 157145;

fn md(size: u64) -> Metadata {
    json!({ "size": size }).as_object().cloned().unwrap()
}

async fn foobar() -> (SharedCatalog, Arc<MemoryVolume>) {
    let cat = Arc::new(Catalog::in_memory().unwrap());
    cat.register_volume("foobar", 200000, None).unwrap();
    let vol = Arc::new(MemoryVolume::new("foobar"));
    for (i, sz) in SIZES.iter().enumerate() {
        let name = i.to_string();
        vol.put(&name, vec![b'x'; *sz as usize]).await;
        cat.add_object(&format!("file{i}"), "foobar", &name, Some(&md(*sz)))
            .unwrap();
    }
    (cat, vol)
}

/// Objects "2", "5" and "6", in that order.
fn candidates(cat: &Catalog) -> Vec<CachedObject> {
    let mut objs = cat.select_objects_in("foobar", Purpose::Listing, None).unwrap();
    for i in [4, 3, 1, 0] {
        objs.remove(i);
    }
    objs
}

fn count(cat: &Catalog) -> usize {
    cat.select_objects_in("foobar", Purpose::Listing, None)
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_execute_frees_target() {
    let (cat, vol) = foobar().await;
    assert_eq!(cat.used_space_in("foobar").unwrap(), TOTAL);
    let cands = candidates(&cat);
    assert_eq!(
        cands.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
        vec!["2", "5", "6"]
    );

    let plan = DeletionPlan::new(vol.clone(), cat.clone(), cands, 46200, 500);
    let freed = plan.execute().await.unwrap();
    assert_eq!(freed, 44001 + 2230);

    assert!(!vol.exists("2").await.unwrap());
    assert!(!vol.exists("5").await.unwrap());
    assert!(vol.exists("6").await.unwrap());
    assert_eq!(count(&cat), 5);
    assert_eq!(cat.used_space_in("foobar").unwrap(), TOTAL - 46231);
    assert_eq!(
        cat.available_space_in("foobar").unwrap(),
        (200000 - TOTAL + 46231) as i64
    );
}

#[tokio::test]
async fn test_execute_refused_unless_updatable() {
    for status in [VolumeStatus::ForGet, VolumeStatus::Disabled] {
        let (cat, vol) = foobar().await;
        cat.set_volume_status("foobar", status).unwrap();
        let plan = DeletionPlan::new(vol.clone(), cat.clone(), candidates(&cat), 46200, 500);

        let err = plan.execute().await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidState(_)), "{status}: {err}");
        assert_eq!(count(&cat), 7);
        assert_eq!(vol.len().await, 7);
        assert_eq!(cat.used_space_in("foobar").unwrap(), TOTAL);

        let err = plan.execute_and_reserve().await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidState(_)));
        assert_eq!(cat.reservation_count("foobar").unwrap(), 0);
    }
}

#[tokio::test]
async fn test_execute_and_reserve() {
    let (cat, vol) = foobar().await;
    let plan = DeletionPlan::new(vol.clone(), cat.clone(), candidates(&cat), 46200, 46000);
    let res = plan.execute_and_reserve().await.unwrap();

    assert_eq!(res.size(), 46000);
    assert_eq!(res.volume_name(), "foobar");
    assert_eq!(count(&cat), 5);
    assert_eq!(cat.reserved_space_in("foobar").unwrap(), 46000);
    assert_eq!(
        cat.available_space_in("foobar").unwrap(),
        (200000 - TOTAL + 46231) as i64 - 46000
    );

    drop(res);
    assert_eq!(cat.reservation_count("foobar").unwrap(), 0);
}

#[tokio::test]
async fn test_execute_and_reserve_insufficient_deletion() {
    let (cat, vol) = foobar().await;
    let plan = DeletionPlan::new(vol.clone(), cat.clone(), candidates(&cat), 60000, 46000);
    let err = plan.execute_and_reserve().await.unwrap_err();

    assert!(matches!(err, CacheError::DeletionFailure(_)));
    assert!(!vol.exists("6").await.unwrap());
    assert_eq!(count(&cat), 4);
    assert_eq!(cat.reservation_count("foobar").unwrap(), 0);
}

#[tokio::test]
async fn test_execute_and_reserve_insufficient_space() {
    let (cat, vol) = foobar().await;
    let plan = DeletionPlan::new(vol.clone(), cat.clone(), candidates(&cat), 46000, 90000);
    let err = plan.execute_and_reserve().await.unwrap_err();

    assert!(matches!(err, CacheError::DeletionFailure(_)));
    assert!(vol.exists("6").await.unwrap());
    assert_eq!(count(&cat), 5);
    assert_eq!(cat.reservation_count("foobar").unwrap(), 0);
}

#[tokio::test]
async fn test_missing_bytes_do_not_abort_plan() {
    let (cat, vol) = foobar().await;
    vol.remove("2").await.unwrap();
    let plan = DeletionPlan::new(vol.clone(), cat.clone(), candidates(&cat), 46200, 500);

    // Removing an absent object succeeds, so its recorded size still counts.
    let freed = plan.execute().await.unwrap();
    assert_eq!(freed, 46231);
    assert_eq!(count(&cat), 5);
}

#[tokio::test]
async fn test_planner_empty_when_space_available() {
    let (cat, vol) = foobar().await;
    let planner = DeletionPlanner::new(cat.clone(), Arc::new(BigOldStrategy::new(u64::MAX)));
    let plan = planner.plan(vol.clone(), 1000, None).unwrap();

    assert!(plan.candidates().is_empty());
    assert_eq!(plan.target(), 0);
    assert_eq!(plan.score, 0.0);
    assert!(plan.is_sufficient());
}

#[tokio::test]
async fn test_planner_frees_shortfall() {
    let (cat, vol) = foobar().await;
    let avail = cat.available_space_in("foobar").unwrap();
    assert_eq!(avail, 42855);

    let planner = DeletionPlanner::new(cat.clone(), Arc::new(BigOldStrategy::new(u64::MAX)));
    let plan = planner.plan(vol.clone(), 50000, None).unwrap();
    assert_eq!(plan.target(), 51000 - 42855);
    assert!(plan.is_sufficient());
    assert!(plan.score > 0.0);

    let res = plan.execute_and_reserve().await.unwrap();
    assert_eq!(res.size(), 50000);
    assert!(cat.available_space_in("foobar").unwrap() >= 0);
    assert!(count(&cat) < 7);
}

#[tokio::test]
async fn test_planner_reports_insufficient_plan() {
    let (cat, vol) = foobar().await;
    let planner = DeletionPlanner::new(cat.clone(), Arc::new(BigOldStrategy::new(u64::MAX)));
    let plan = planner.plan(vol.clone(), 300000, None).unwrap();
    assert!(!plan.is_sufficient());
    assert_eq!(plan.planned_bytes(), TOTAL);

    cat.set_volume_status("foobar", VolumeStatus::ForGet).unwrap();
    assert!(matches!(
        planner.plan(vol.clone(), 1000, None),
        Err(CacheError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_planner_skips_pinned_objects() {
    let (cat, vol) = foobar().await;
    // Pin the largest object.
    cat.update_metadata("foobar", "3", &json!({"priority": 0}).as_object().cloned().unwrap())
        .unwrap();
    let planner = DeletionPlanner::new(cat.clone(), Arc::new(BigOldStrategy::new(u64::MAX)));
    let plan = planner.plan(vol.clone(), 50000, None).unwrap();
    assert!(plan.candidates().iter().all(|o| o.name != "3"));
}

#[test]
fn test_big_old_prefers_older() {
    let strat = BigOldStrategy::new(u64::MAX);
    let mut scorer = strat.for_size(u64::MAX);
    let now = now_millis();

    let mut young = CachedObject::new("v", "young");
    young.size = Some(1000);
    young.since = now - 60_000;
    let mut old = young.clone();
    old.name = "old".into();
    old.since = now - 10 * 3_600_000;

    let ys = scorer.score(&mut young);
    let os = scorer.score(&mut old);
    assert!(os > ys, "old={os} young={ys}");
    assert_eq!(old.score, os);

    // Size contribution saturates at one priority unit.
    let mut huge = young.clone();
    huge.size = Some(50_000_000_000);
    let mut big = young.clone();
    big.size = Some(600_000_000);
    let hs = scorer.score(&mut huge);
    let bs = scorer.score(&mut big);
    assert!((hs - bs).abs() < 1e-9);
    assert!(hs <= young.priority as f64 + 1e-9);
}
