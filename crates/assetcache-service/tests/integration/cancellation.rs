use std::time::Duration;

use assetcache_service::Request;
use assetcache_service::caching::{CacheKey, DiskTier};
use assetcache_test::{setup, tempdir};

use crate::utils::{GatedTransport, Results, TestProcessor, cache, remote, settle, sized, wait_until};

#[tokio::test]
async fn test_cancel_one_of_many() {
    setup();
    let transport = GatedTransport::new();
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());
    let key = CacheKey::identity(remote("/cat.png"));

    let results = Results::default();
    let requests: Vec<Request> = (0..3)
        .map(|i| cache.request(key.clone(), results.callback(i)))
        .collect();
    settle().await;

    requests[1].cancel();
    transport.open();
    wait_until(|| results.count() == 2).await;
    settle().await;

    assert_eq!(
        results.get(),
        [
            (0, Some("/cat.png".to_owned())),
            (2, Some("/cat.png".to_owned())),
        ]
    );
    assert_eq!(transport.fetches(), 1);
    assert_eq!(transport.abandoned(), 0);
}

#[tokio::test]
async fn test_cancel_all() {
    setup();
    let transport = GatedTransport::new();
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());
    let key = sized(remote("/cat.png"), 10.0, 10.0);

    let results = Results::default();
    let requests: Vec<Request> = (0..2)
        .map(|i| cache.request(key.clone(), results.callback(i)))
        .collect();
    settle().await;
    assert_eq!(transport.fetches(), 1);

    for request in &requests {
        request.cancel();
    }
    settle().await;
    assert_eq!(transport.abandoned(), 1);

    // a new request starts over
    transport.open();
    let asset = cache.fetch(key).await.unwrap();
    assert_eq!(asset.data().as_ref(), b"/cat.png@10x10");
    assert_eq!(transport.fetches(), 2);
    assert!(results.get().is_empty());
}

#[tokio::test]
async fn test_cancel_before_disk_lookup() {
    setup();
    let transport = GatedTransport::new();
    transport.open();
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());

    let results = Results::default();
    let request = cache.request(CacheKey::identity(remote("/cat.png")), results.callback(0));
    request.cancel();
    settle().await;

    assert!(results.get().is_empty());
    assert_eq!(transport.fetches(), 0);
}

#[tokio::test]
async fn test_dropped_future_cancels() {
    setup();
    let transport = GatedTransport::new();
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());
    let key = CacheKey::identity(remote("/cat.png"));

    let result = tokio::time::timeout(Duration::from_millis(50), cache.fetch(key)).await;
    assert!(result.is_err());
    settle().await;

    assert_eq!(transport.fetches(), 1);
    assert_eq!(transport.abandoned(), 1);
}

#[tokio::test]
async fn test_cancel_after_delivery() {
    setup();
    let transport = GatedTransport::new();
    transport.open();
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());

    let results = Results::default();
    let request = cache.request(CacheKey::identity(remote("/cat.png")), results.callback(0));
    wait_until(|| results.count() == 1).await;

    request.cancel();
    assert_eq!(results.get(), [(0, Some("/cat.png".to_owned()))]);
}

#[tokio::test]
async fn test_cancel_one_of_many_while_formatting() {
    setup();
    let transport = GatedTransport::new();
    let processor = TestProcessor::gated();
    let cache = cache(&transport, &processor, DiskTier::disabled());
    let key = sized(remote("/cat.png"), 5.0, 5.0);

    let results = Results::default();
    let requests: Vec<Request> = (0..2)
        .map(|i| cache.request(key.clone(), results.callback(i)))
        .collect();
    settle().await;
    transport.open();

    // both requests join the same render once the asset is obtained
    wait_until(|| processor.renders() == 1).await;
    settle().await;

    requests[0].cancel();
    processor.open();
    wait_until(|| results.count() == 1).await;
    settle().await;

    assert_eq!(results.get(), [(1, Some("/cat.png@5x5".to_owned()))]);
    assert_eq!(processor.rendered(), 1);
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn test_cancel_all_while_formatting() {
    setup();
    let basedir = tempdir();
    let transport = GatedTransport::new();
    transport.open();
    let processor = TestProcessor::gated();
    let cache = cache(&transport, &processor, DiskTier::local(basedir.path()).unwrap());
    let key = sized(remote("/cat.png"), 5.0, 5.0);

    let results = Results::default();
    let request = cache.request(key.clone(), results.callback(0));
    wait_until(|| processor.renders() == 1).await;

    request.cancel();
    settle().await;
    processor.open();
    wait_until(|| processor.rendered() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(results.get().is_empty());
    assert!(cache.get_cached(&key).is_none());
    assert!(!cache.disk().contains(&cache.filename(&key)));
    // the canonical asset was obtained before the cancellation
    assert!(cache.disk().contains(&cache.filename(&key.canonical())));
}
