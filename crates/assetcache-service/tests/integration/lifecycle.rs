use assetcache_service::caching::{CacheKey, DiskTier};
use assetcache_service::executor::{InlineExecutor, WorkQueues};
use assetcache_service::{AssetCache, LifecycleSignal};
use assetcache_test::{setup, tempdir};

use crate::utils::{GatedTransport, TestProcessor, cache, remote};

#[tokio::test]
async fn test_byte_limit_trims() {
    setup();
    let cachedir = tempdir();
    let transport = GatedTransport::new();
    transport.open();
    let cache = cache(
        &transport,
        &TestProcessor::default(),
        DiskTier::local(cachedir.path()).unwrap(),
    );

    let first = CacheKey::identity(remote("/first.png"));
    let second = CacheKey::identity(remote("/second.png"));
    cache.fetch(first.clone()).await.unwrap();
    cache.fetch(second.clone()).await.unwrap();

    // no limit, nothing to trim
    let stats = cache.trim_disk().await.unwrap().unwrap();
    assert_eq!(stats.removed_files, 0);
    assert!(cache.disk().contains(&cache.filename(&first)));

    let stats = cache.set_byte_limit(Some(0)).await.unwrap().unwrap();
    assert_eq!(cache.byte_limit(), Some(0));
    assert_eq!(stats.removed_files, 2);
    assert_eq!(stats.removed_bytes, ("/first.png".len() + "/second.png".len()) as u64);
    assert!(!cache.disk().contains(&cache.filename(&first)));

    // the memory tier is not affected
    assert!(cache.get_cached(&first).is_some());
}

#[tokio::test]
async fn test_memory_pressure_falls_back_to_disk() {
    setup();
    let cachedir = tempdir();
    let transport = GatedTransport::new();
    transport.open();
    let cache = cache(
        &transport,
        &TestProcessor::default(),
        DiskTier::local(cachedir.path()).unwrap(),
    );

    let key = CacheKey::identity(remote("/cat.png"));
    cache.fetch(key.clone()).await.unwrap();

    assert!(cache.handle_signal(LifecycleSignal::MemoryPressure).is_none());
    assert_eq!(cache.get_cached(&key), None);

    let asset = cache.fetch(key.clone()).await.unwrap();
    assert_eq!(asset.data().as_ref(), b"/cat.png");
    assert_eq!(transport.fetches(), 1);
    assert!(cache.get_cached(&key).is_some());
}

#[tokio::test]
async fn test_entered_background() {
    setup();
    let cachedir = tempdir();
    let transport = GatedTransport::new();
    transport.open();
    let cache = AssetCache::builder(WorkQueues::current())
        .disk(DiskTier::local(cachedir.path()).unwrap())
        .transport(transport.clone())
        .processor(TestProcessor::default())
        .executor(InlineExecutor)
        .byte_limit(Some(0))
        .clear_memory_on_background(true)
        .build()
        .unwrap();

    let key = CacheKey::identity(remote("/cat.png"));
    cache.fetch(key.clone()).await.unwrap();

    let trim = cache.handle_signal(LifecycleSignal::EnteredBackground).unwrap();
    let stats = trim.await.unwrap().unwrap();
    assert_eq!(stats.removed_files, 1);
    assert_eq!(cache.get_cached(&key), None);

    // gone from both tiers, so it is fetched again
    cache.fetch(key).await.unwrap();
    assert_eq!(transport.fetches(), 2);
}
