use carmen_cache::gridcache::*;
use test_utils::*;

fn pack(cache: &MemoryCache, directory: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    let path = directory.path().join(name);
    cache.pack(&path).unwrap();
    path
}

#[test]
fn merge_union_test() {
    init_logger();
    let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
    let a = build_memory_cache(&[("....1", None, vec![0, 1, 2, 3]), ("....2", None, vec![0, 1, 2, 3])]);
    let b = build_memory_cache(&[
        ("....1", None, vec![10, 11, 12, 13]),
        ("....3", None, vec![10, 11, 12, 13]),
    ]);
    let path_a = pack(&a, &directory, "a");
    let path_b = pack(&b, &directory, "b");
    let merged = directory.path().join("merged");

    merge(&path_a, &path_b, &merged, MergePolicy::Union).unwrap();

    let c = RocksDBCache::new(&merged).unwrap();
    assert_eq!(c.get("....2", None).unwrap(), Some(vec![3, 2, 1, 0]), "a-only");
    assert_eq!(c.get("....3", None).unwrap(), Some(vec![13, 12, 11, 10]), "b-only");
    assert_eq!(
        c.get("....1", None).unwrap(),
        Some(vec![13, 12, 11, 10, 3, 2, 1, 0]),
        "a-b-merged"
    );
    assert_eq!(
        c.get_by_prefix("....").unwrap(),
        Some(vec![13, 12, 11, 10, 3, 2, 1, 0]),
        "prefix memos are merged too"
    );

    // inputs are untouched
    let a = RocksDBCache::new(&path_a).unwrap();
    assert_eq!(a.get("....1", None).unwrap(), Some(vec![3, 2, 1, 0]));
}

#[test]
fn merge_aggregate_test() {
    let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
    let a = build_memory_cache(&[
        (MAX_KEY, None, vec![1]),
        (COUNT_KEY, None, vec![1]),
        ("3", None, vec![1]),
    ]);
    let b = build_memory_cache(&[
        (MAX_KEY, None, vec![2]),
        (COUNT_KEY, None, vec![2]),
        ("4", None, vec![2]),
    ]);
    let path_a = pack(&a, &directory, "a");
    let path_b = pack(&b, &directory, "b");
    let merged = directory.path().join("merged");

    merge(&path_a, &path_b, &merged, MergePolicy::Aggregate).unwrap();

    let c = RocksDBCache::new(&merged).unwrap();
    assert_eq!(c.get(MAX_KEY, None).unwrap(), Some(vec![2]), "a-b-max");
    assert_eq!(c.get(COUNT_KEY, None).unwrap(), Some(vec![3]), "a-b-sum");
    assert_eq!(c.get("3", None).unwrap(), Some(vec![1]), "a-only");
    assert_eq!(c.get("4", None).unwrap(), Some(vec![2]), "b-only");
}

#[test]
fn merge_languages_test() {
    let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
    let a = build_memory_cache(&[("main", Some(&[0][..]), vec![1]), ("main", None, vec![2])]);
    let b = build_memory_cache(&[("main", Some(&[0][..]), vec![3]), ("main", Some(&[1][..]), vec![4])]);
    let path_a = pack(&a, &directory, "a");
    let path_b = pack(&b, &directory, "b");
    let merged = directory.path().join("merged");

    merge(&path_a, &path_b, &merged, MergePolicy::Union).unwrap();

    let c = RocksDBCache::new(&merged).unwrap();
    assert_eq!(c.get("main", Some(&[0])).unwrap(), Some(vec![3, 1]), "same bucket is combined");
    assert_eq!(c.get("main", Some(&[1])).unwrap(), Some(vec![4]));
    assert_eq!(c.get("main", None).unwrap(), Some(vec![2]));
    assert_eq!(c.list().unwrap().len(), 3);
}

#[test]
fn merge_replaces_existing_destination_test() {
    let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
    let a = build_memory_cache(&[("1", None, vec![1])]);
    let b = build_memory_cache(&[("2", None, vec![2])]);
    let stale = build_memory_cache(&[("1", None, vec![7]), ("stale", None, vec![9])]);
    let path_a = pack(&a, &directory, "a");
    let path_b = pack(&b, &directory, "b");
    let merged = pack(&stale, &directory, "merged");

    merge(&path_a, &path_b, &merged, MergePolicy::Union).unwrap();

    let c = RocksDBCache::new(&merged).unwrap();
    assert_eq!(c.get("1", None).unwrap(), Some(vec![1]), "earlier values are not unioned in");
    assert_eq!(c.get("stale", None).unwrap(), None);
    assert_eq!(c.list().unwrap().len(), 2);
}

#[test]
fn merge_errors_test() {
    let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
    let a = build_memory_cache(&[("1", None, vec![1])]);
    let path_a = pack(&a, &directory, "a");
    let path_b = pack(&a, &directory, "b");

    let err = merge(&path_a, &path_b, &path_a, MergePolicy::Union).unwrap_err();
    assert_eq!(
        err.downcast_ref::<CacheError>(),
        Some(&CacheError::InvalidArgument("merge destination must differ from both inputs".to_owned()))
    );

    let missing = directory.path().join("missing");
    let err = merge(&path_a, &missing, directory.path().join("out"), MergePolicy::Union).unwrap_err();
    assert_eq!(
        err.downcast_ref::<CacheError>(),
        Some(&CacheError::InvalidArgument("unable to open rocksdb file for loading".to_owned()))
    );

    let c = build_memory_cache(&[(COUNT_KEY, None, vec![MAX_GRID_VALUE])]);
    let d = build_memory_cache(&[(COUNT_KEY, None, vec![1])]);
    let path_c = pack(&c, &directory, "c");
    let path_d = pack(&d, &directory, "d");
    let err = merge(&path_c, &path_d, directory.path().join("overflow"), MergePolicy::Aggregate)
        .unwrap_err();
    match err.downcast_ref::<CacheError>() {
        Some(CacheError::RangeError(_)) => {}
        other => panic!("expected a range error, got {:?}", other),
    }
}
