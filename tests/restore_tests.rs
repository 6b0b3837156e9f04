//! Integration tests for restore-on-miss.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use archive_cache::cache::strategy::BigOldStrategy;
use archive_cache::cache::{Cache, DeletionPlanner, Reservation, VolumeConfig};
use archive_cache::checksum::{Checksum, CRC32, SHA256};
use archive_cache::error::{CacheError, ErrorClass};
use archive_cache::integrity::{CacheObjectCheck, ChecksumCheck, SizeCheck};
use archive_cache::inventory::{Catalog, SharedCatalog};
use archive_cache::manager::CacheManager;
use archive_cache::restore::{FileCopyRestorer, Restorer, ZipFileRestorer, ZipRepoRestorer};
use archive_cache::storage::{FilesystemLongTermStorage, LongTermStorage};
use archive_cache::volume::{CacheVolume, FilesystemVolume, MemoryVolume};

const TRIAL1: &[u8] = b"{\n  \"name\": \"trial1\"\n}\n";
const TRIAL2: &[u8] = b"{\n  \"name\": \"trial2\", \"data\": [1, 2, 3]\n}\n";

fn write_file(root: &Path, rel: &str, data: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zw = zip::ZipWriter::new(file);
    for (name, data) in entries {
        zw.start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        zw.write_all(data).unwrap();
    }
    zw.finish().unwrap();
}

fn catalog() -> SharedCatalog {
    let cat = Arc::new(Catalog::in_memory().unwrap());
    cat.register_algorithm(SHA256).unwrap();
    cat.register_algorithm(CRC32).unwrap();
    cat
}

fn cache_with(cat: &SharedCatalog, vol: Arc<dyn CacheVolume>, capacity: u64) -> Arc<Cache> {
    let planner = DeletionPlanner::new(cat.clone(), Arc::new(BigOldStrategy::new(u64::MAX)));
    let mut cache = Cache::new("restore-test", cat.clone(), planner);
    cache
        .add_cache_volume(vol, capacity, None, VolumeConfig::default(), false)
        .unwrap();
    Arc::new(cache)
}

#[tokio::test]
async fn test_file_copy_restore_on_miss() {
    let lts_dir = TempDir::new().unwrap();
    write_file(lts_dir.path(), "mds1491/trial1.json", TRIAL1);
    let cache_dir = TempDir::new().unwrap();

    let cat = catalog();
    let vol = Arc::new(FilesystemVolume::new("disk", cache_dir.path()).await.unwrap());
    let cache = cache_with(&cat, vol.clone(), 100_000);
    let lts = Arc::new(FilesystemLongTermStorage::new(lts_dir.path()));
    let mgr = CacheManager::new(cache.clone(), Arc::new(FileCopyRestorer::new(lts)));

    assert!(!mgr.is_cached("mds1491/trial1.json").unwrap());
    assert!(mgr.cache("mds1491/trial1.json", false).await.unwrap());
    assert!(mgr.is_cached("mds1491/trial1.json").unwrap());
    assert!(!mgr.cache("mds1491/trial1.json", false).await.unwrap());

    let obj = mgr.get_object("mds1491/trial1.json").await.unwrap();
    assert_eq!(obj.volume, "disk");
    assert_eq!(obj.name, "mds1491/trial1.json");
    assert_eq!(obj.size, Some(TRIAL1.len() as u64));
    assert_eq!(obj.checksum, Some(Checksum::sha256_of(TRIAL1).hash));
    assert_eq!(obj.algorithm.as_deref(), Some(SHA256));
    assert!(cache_dir.path().join("mds1491/trial1.json").is_file());

    // leftover reservation space is released
    assert_eq!(cat.reservation_count("disk").unwrap(), 0);
    assert_eq!(
        cat.available_space_in("disk").unwrap(),
        100_000 - TRIAL1.len() as i64
    );

    assert_eq!(mgr.uncache("mds1491/trial1.json").await.unwrap(), 1);
    assert!(!cache_dir.path().join("mds1491/trial1.json").exists());
    assert!(mgr.find_object("mds1491/trial1.json").await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_object_restores() {
    let lts_dir = TempDir::new().unwrap();
    write_file(lts_dir.path(), "mds1491/trial2.json", TRIAL2);
    let cat = catalog();
    let cache = cache_with(&cat, Arc::new(MemoryVolume::new("mem")), 100_000);
    let lts = Arc::new(FilesystemLongTermStorage::new(lts_dir.path()));
    let mgr = CacheManager::new(cache, Arc::new(FileCopyRestorer::new(lts)));

    let obj = mgr.get_object("mds1491/trial2.json").await.unwrap();
    assert_eq!(obj.size, Some(TRIAL2.len() as u64));
    assert_eq!(cat.find_object("mds1491/trial2.json").unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_source_is_not_found() {
    let lts_dir = TempDir::new().unwrap();
    let cat = catalog();
    let cache = cache_with(&cat, Arc::new(MemoryVolume::new("mem")), 100_000);
    let lts = Arc::new(FilesystemLongTermStorage::new(lts_dir.path()));
    let restorer = Arc::new(FileCopyRestorer::new(lts));
    assert!(restorer.does_not_exist("mds1491/nope.json").await.unwrap());

    let mgr = CacheManager::new(cache, restorer);
    let err = mgr.cache("mds1491/nope.json", false).await.unwrap_err();
    assert!(matches!(err, CacheError::RestorationTargetNotFound(_)), "{err}");
    assert_eq!(err.class(), ErrorClass::NotFound);
    assert_eq!(cat.reservation_count("mem").unwrap(), 0);
}

#[tokio::test]
async fn test_restore_object_fills_metadata() {
    let lts_dir = TempDir::new().unwrap();
    write_file(lts_dir.path(), "a/b.txt", b"hello world");
    std::fs::write(
        lts_dir.path().join("a/b.txt.sha256"),
        Checksum::sha256_of(b"hello world").hash,
    )
    .unwrap();

    let cat = catalog();
    let vol: Arc<dyn CacheVolume> = Arc::new(MemoryVolume::new("mem"));
    cat.register_volume("mem", 1000, None).unwrap();
    let restorer = FileCopyRestorer::new(Arc::new(FilesystemLongTermStorage::new(lts_dir.path())));

    let mut res = Reservation::reservation_for(vol.clone(), cat.clone(), 11).unwrap();
    let obj = restorer
        .restore_object("a/b.txt", &mut res, "b.txt", None)
        .await
        .unwrap();
    assert_eq!(obj.size, Some(11));
    assert_eq!(obj.checksum, Some(Checksum::sha256_of(b"hello world").hash));
    assert_eq!(res.size(), 0);
    assert!(vol.exists("b.txt").await.unwrap());
}

#[tokio::test]
async fn test_zip_repo_restorer() {
    let repo = TempDir::new().unwrap();
    write_zip(
        &repo.path().join("mds1491.zip"),
        &[("mds1491/trial1.json", TRIAL1), ("mds1491/trial2.json", TRIAL2)],
    );
    let restorer = Arc::new(ZipRepoRestorer::new(repo.path()));
    assert_eq!(restorer.repo_dir(), repo.path());

    assert!(!restorer.does_not_exist("mds1491/trial1.json").await.unwrap());
    assert!(restorer.does_not_exist("mds1492/trial1.json").await.unwrap());
    assert!(restorer.does_not_exist("trial1.json").await.unwrap());
    assert_eq!(
        restorer.size_of("mds1491/trial2.json").await.unwrap(),
        TRIAL2.len() as u64
    );
    let cs = restorer.checksum_of("mds1491/trial1.json").await.unwrap();
    assert_eq!(cs.algorithm, CRC32);
    assert!(!cs.hash.is_empty());

    let err = restorer.size_of("mds1491/trial3.json").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");

    let cat = catalog();
    let cache = cache_with(&cat, Arc::new(MemoryVolume::new("mem")), 100_000);
    let mgr = CacheManager::new(cache.clone(), restorer);
    assert!(mgr.cache("mds1491/trial1.json", false).await.unwrap());
    let obj = mgr.find_object("mds1491/trial1.json").await.unwrap().unwrap();
    assert_eq!(obj.size, Some(TRIAL1.len() as u64));
    assert_eq!(obj.algorithm.as_deref(), Some(CRC32));
    assert_eq!(obj.checksum, Some(cs.hash));

    let mut stream = cache
        .volume("mem")
        .unwrap()
        .get_stream("mds1491/trial1.json")
        .await
        .unwrap();
    let (got, n) = Checksum::calc_sha256(&mut stream).await.unwrap();
    assert_eq!(n, TRIAL1.len() as u64);
    assert_eq!(got, Checksum::sha256_of(TRIAL1));

    let err = mgr.cache("mds1491/trial3.json", false).await.unwrap_err();
    assert!(matches!(err, CacheError::RestorationTargetNotFound(_)), "{err}");
}

#[tokio::test]
async fn test_zip_file_restorer_with_prefix() {
    let lts_dir = TempDir::new().unwrap();
    write_zip(&lts_dir.path().join("bag.zip"), &[("data/trial1.json", TRIAL1)]);
    let lts: Arc<dyn LongTermStorage> = Arc::new(FilesystemLongTermStorage::new(lts_dir.path()));
    let restorer = ZipFileRestorer::with_prefix(lts, "bag.zip", "ark:/88434/");

    assert!(!restorer.does_not_exist("ark:/88434/data/trial1.json").await.unwrap());
    assert!(restorer.does_not_exist("data/trial1.json").await.unwrap());
    assert_eq!(
        restorer.size_of("ark:/88434/data/trial1.json").await.unwrap(),
        TRIAL1.len() as u64
    );
    assert_eq!(
        restorer.name_for_object("ark:/88434/data/trial1.json"),
        "88434/data/trial1.json"
    );
    assert!(restorer
        .size_of("data/trial1.json")
        .await
        .unwrap_err()
        .is_not_found());
}

fn verifying_checks() -> Vec<Arc<dyn CacheObjectCheck>> {
    vec![Arc::new(SizeCheck), Arc::new(ChecksumCheck::default())]
}

#[tokio::test]
async fn test_zip_restore_passes_save_verification() {
    let repo = TempDir::new().unwrap();
    write_zip(
        &repo.path().join("mds1491.zip"),
        &[("mds1491/trial1.json", TRIAL1), ("mds1491/trial2.json", TRIAL2)],
    );
    let cat = catalog();
    let planner = DeletionPlanner::new(cat.clone(), Arc::new(BigOldStrategy::new(u64::MAX)));
    let mut cache = Cache::new("verified", cat.clone(), planner);
    cache
        .add_cache_volume(Arc::new(MemoryVolume::new("mem")), 100_000, None, VolumeConfig::default(), false)
        .unwrap();
    let checker = Arc::new(cache.integrity_monitor(verifying_checks()));
    cache.set_checker(Some(checker));
    let mgr = CacheManager::new(Arc::new(cache), Arc::new(ZipRepoRestorer::new(repo.path())));

    assert!(mgr.cache("mds1491/trial1.json", false).await.unwrap());
    let obj = mgr.get_object("mds1491/trial2.json").await.unwrap();
    assert_eq!(obj.algorithm.as_deref(), Some(CRC32));
    assert!(obj.checked > 0);
    assert_eq!(cat.find_object("mds1491/trial1.json").unwrap().len(), 1);
}

#[tokio::test]
async fn test_sweep_over_zip_restored_objects_completes() {
    let repo = TempDir::new().unwrap();
    let names: Vec<String> = (0..12).map(|i| format!("mds1491/part{i:02}.json")).collect();
    let bodies: Vec<Vec<u8>> = (0..12).map(|i| format!("{{\"part\": {i:02}}}\n").into_bytes()).collect();
    let entries: Vec<(&str, &[u8])> = names
        .iter()
        .zip(&bodies)
        .map(|(n, b)| (n.as_str(), b.as_slice()))
        .collect();
    write_zip(&repo.path().join("mds1491.zip"), &entries);

    let cat = catalog();
    let vol = Arc::new(MemoryVolume::new("mem"));
    let cache = cache_with(&cat, vol.clone(), 100_000);
    let mgr = CacheManager::new(cache.clone(), Arc::new(ZipRepoRestorer::new(repo.path())));
    for name in &names {
        assert!(mgr.cache(name, false).await.unwrap());
    }
    // same length, different bytes
    vol.put("mds1491/part07.json", b"{\"part\": 70}\n".to_vec()).await;

    let mon = cache.integrity_monitor(verifying_checks());
    let mut failed = Vec::new();
    let passed = mon.find_corrupted_objects(100, &mut failed, true).await.unwrap();
    assert_eq!(passed, 11);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "mds1491/part07.json");
    assert!(cat.find_object("mds1491/part07.json").unwrap().is_empty());
    assert_eq!(cat.find_object("mds1491/part08.json").unwrap().len(), 1);
}
