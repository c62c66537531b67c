use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assetcache_service::caching::{
    CacheKey, CustomEdit, DiskTier, FileEntry, FileSystem, LocalFileSystem, Source, Variant,
};
use assetcache_service::executor::{InlineExecutor, WorkQueues};
use assetcache_service::{Asset, AssetCache};
use assetcache_test::{setup, tempdir};
use bytes::Bytes;
use futures::future::{FutureExt, join_all};

use crate::utils::{GatedTransport, TestProcessor, cache, remote, settle, sized, text, wait_until};

#[tokio::test]
async fn test_concurrent_variants() {
    setup();
    let transport = GatedTransport::new();
    let processor = TestProcessor::default();
    let cache = cache(&transport, &processor, DiskTier::disabled());

    let source = remote("/cat.png");
    let keys = [
        sized(source.clone(), 100.0, 100.0),
        sized(source.clone(), 50.0, 50.0),
        sized(source.clone(), 100.0, 100.0),
        sized(source.clone(), 50.0, 50.0),
        sized(source.clone(), 100.0, 100.0),
        sized(source.clone(), 50.0, 50.0),
    ];

    let requests = join_all(keys.iter().cloned().map(|key| cache.fetch(key)));
    let release = async {
        settle().await;
        assert_eq!(transport.fetches(), 1);
        transport.open();
    };
    let (results, ()) = futures::join!(requests, release);

    let results: Vec<_> = results.iter().map(|asset| asset.as_ref().map(text)).collect();
    assert_eq!(
        results,
        [
            Some("/cat.png@100x100".to_owned()),
            Some("/cat.png@50x50".to_owned()),
            Some("/cat.png@100x100".to_owned()),
            Some("/cat.png@50x50".to_owned()),
            Some("/cat.png@100x100".to_owned()),
            Some("/cat.png@50x50".to_owned()),
        ]
    );
    assert_eq!(transport.fetches(), 1);
    assert_eq!(processor.renders(), 2);
}

#[tokio::test]
async fn test_second_request_is_memory_hit() {
    setup();
    let transport = GatedTransport::new();
    transport.open();
    let processor = TestProcessor::default();
    let cache = cache(&transport, &processor, DiskTier::disabled());

    let key = sized(remote("/cat.png"), 10.0, 20.0);
    let first = cache.fetch(key.clone()).await.unwrap();
    assert_eq!(text(&first), "/cat.png@10x20");

    // a memory hit resolves on the first poll
    let second = cache.fetch(key.clone()).now_or_never();
    assert_eq!(second, Some(Some(first)));
    assert_eq!(transport.fetches(), 1);
    assert_eq!(processor.renders(), 1);
}

#[tokio::test]
async fn test_disk_reuse() {
    setup();
    let cachedir = tempdir();
    let key = sized(remote("/cat.png"), 10.0, 10.0);

    {
        let transport = GatedTransport::new();
        transport.open();
        let cache = cache(
            &transport,
            &TestProcessor::default(),
            DiskTier::local(cachedir.path()).unwrap(),
        );

        let asset = cache.fetch(key.clone()).await.unwrap();
        assert_eq!(text(&asset), "/cat.png@10x10");

        // the canonical file is written before anyone is notified
        assert!(cache.disk().contains(&cache.filename(&key.canonical())));
        // the variant is written in the background
        let filename = cache.filename(&key);
        wait_until(|| cache.disk().contains(&filename)).await;
    }

    let transport = GatedTransport::new();
    let processor = TestProcessor::default();
    let cache = cache(
        &transport,
        &processor,
        DiskTier::local(cachedir.path()).unwrap(),
    );

    let asset = cache.fetch(key.clone()).await.unwrap();
    assert_eq!(text(&asset), "/cat.png@10x10");

    let other = sized(remote("/cat.png"), 20.0, 20.0);
    let asset = cache.fetch(other).await.unwrap();
    assert_eq!(text(&asset), "/cat.png@20x20");

    assert_eq!(transport.fetches(), 0);
    assert_eq!(processor.renders(), 1);
}

/// Records the name of the thread every read and write happens on.
#[derive(Debug, Default)]
struct ThreadRecordingFileSystem {
    inner: LocalFileSystem,
    threads: Mutex<Vec<String>>,
}

impl ThreadRecordingFileSystem {
    fn record(&self) {
        let name = std::thread::current().name().unwrap_or_default().to_owned();
        self.threads.lock().unwrap().push(name);
    }
}

impl FileSystem for ThreadRecordingFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn read(&self, path: &Path) -> io::Result<Option<Bytes>> {
        self.record();
        self.inner.read(path)
    }

    fn atomic_write(&self, data: &[u8], path: &Path) -> io::Result<()> {
        self.record();
        self.inner.atomic_write(data, path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path)
    }

    fn enumerate(&self, directory: &Path) -> io::Result<Vec<FileEntry>> {
        self.inner.enumerate(directory)
    }

    fn touch(&self, path: &Path) -> io::Result<()> {
        self.inner.touch(path)
    }
}

#[test]
fn test_disk_access_runs_on_io_queue() {
    setup();
    let cachedir = tempdir();
    let runtime = |name: &str| {
        tokio::runtime::Builder::new_multi_thread()
            .thread_name(name)
            .enable_all()
            .build()
            .unwrap()
    };
    let orchestration = runtime("test-orchestration");
    let io_pool = runtime("test-io");

    let fs = Arc::new(ThreadRecordingFileSystem::default());
    let disk = DiskTier::with_fs(cachedir.path(), fs.clone()).unwrap();
    let transport = GatedTransport::new();
    transport.open();
    let cache = AssetCache::builder(WorkQueues::new(
        orchestration.handle().clone(),
        orchestration.handle().clone(),
        io_pool.handle().clone(),
    ))
    .disk(disk)
    .transport(transport.clone())
    .processor(TestProcessor::default())
    .executor(InlineExecutor)
    .build()
    .unwrap();

    let key = sized(remote("/cat.png"), 5.0, 5.0);
    let asset = orchestration.block_on(cache.fetch(key.clone())).unwrap();
    assert_eq!(text(&asset), "/cat.png@5x5");

    let filename = cache.filename(&key);
    for _ in 0..500 {
        if cache.disk().contains(&filename) {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(cache.disk().contains(&filename));

    // served from disk this time
    cache.clear_memory();
    let asset = orchestration.block_on(cache.fetch(key)).unwrap();
    assert_eq!(text(&asset), "/cat.png@5x5");
    assert_eq!(transport.fetches(), 1);

    let threads = fs.threads.lock().unwrap().clone();
    // three misses, two writes and a hit
    assert_eq!(threads.len(), 6);
    assert!(threads.iter().all(|name| name == "test-io"), "{threads:?}");
}

#[tokio::test]
async fn test_fetch_failure_is_not_cached() {
    setup();
    let transport = GatedTransport::new();
    transport.open();
    let processor = TestProcessor::default();
    let cache = cache(&transport, &processor, DiskTier::disabled());

    let key = sized(remote("/missing.png"), 10.0, 10.0);
    let results = join_all([
        cache.fetch(key.clone()),
        cache.fetch(key.clone()),
        cache.fetch(key.canonical()),
    ])
    .await;
    assert_eq!(results, [None, None, None]);
    assert_eq!(transport.fetches(), 1);

    assert_eq!(cache.fetch(key).await, None);
    assert_eq!(transport.fetches(), 2);
    assert_eq!(processor.renders(), 0);
}

#[tokio::test]
async fn test_render_failure() {
    setup();
    let transport = GatedTransport::new();
    transport.open();
    let processor = TestProcessor::default();
    let cache = cache(&transport, &processor, DiskTier::disabled());

    let key = sized(remote("/cat.png"), 0.0, 10.0);
    assert_eq!(cache.fetch(key.clone()).await, None);
    assert_eq!(cache.get_cached(&key), None);

    let canonical = cache.fetch(key.canonical()).await.unwrap();
    assert_eq!(text(&canonical), "/cat.png");
    assert_eq!(transport.fetches(), 2);
}

#[tokio::test]
async fn test_custom_source() {
    setup();
    let transport = GatedTransport::new();
    let loads = Arc::new(AtomicUsize::new(0));
    let source = {
        let loads = loads.clone();
        Source::custom("avatar/1", "users", move |identifier, namespace| {
            loads.fetch_add(1, Ordering::SeqCst);
            let asset = Asset::new(format!("{namespace}:{identifier}"));
            async move { Some(asset) }.boxed()
        })
    };
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());

    let results = join_all([
        cache.fetch(CacheKey::identity(source.clone())),
        cache.fetch(sized(source.clone(), 4.0, 4.0)),
        cache.fetch(CacheKey::identity(source.clone())),
    ])
    .await;
    let results: Vec<_> = results.iter().map(|asset| asset.as_ref().map(text)).collect();
    assert_eq!(
        results,
        [
            Some("users:avatar/1".to_owned()),
            Some("users:avatar/1@4x4".to_owned()),
            Some("users:avatar/1".to_owned()),
        ]
    );
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(transport.fetches(), 0);
}

#[tokio::test]
async fn test_hyphenated_custom_namespaces() {
    setup();
    let transport = GatedTransport::new();
    let loads = Arc::new(AtomicUsize::new(0));
    let custom = |identifier: &str, namespace: &str| {
        let loads = loads.clone();
        Source::custom(identifier, namespace, move |identifier, namespace| {
            loads.fetch_add(1, Ordering::SeqCst);
            let asset = Asset::new(format!("{namespace}/{identifier}"));
            async move { Some(asset) }.boxed()
        })
    };
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());

    let (a, b) = futures::join!(
        cache.fetch(CacheKey::identity(custom("42", "user-avatars"))),
        cache.fetch(CacheKey::identity(custom("avatars-42", "user"))),
    );
    assert_eq!(a.as_ref().map(text).as_deref(), Some("user-avatars/42"));
    assert_eq!(b.as_ref().map(text).as_deref(), Some("user/avatars-42"));
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_custom_edit() {
    setup();
    let transport = GatedTransport::new();
    transport.open();
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());

    let upper = CustomEdit::new("uppercase", |asset: &Asset| {
        Some(Asset::new(asset.data().to_ascii_uppercase()))
    });
    let key = CacheKey::new(remote("/cat.png"), Variant::Custom(upper));

    let asset = cache.fetch(key.clone()).await.unwrap();
    assert_eq!(text(&asset), "/CAT.PNG");

    // keys compare by edit key, not by closure
    let same = CustomEdit::new("uppercase", |_: &Asset| None);
    let key = CacheKey::new(remote("/cat.png"), Variant::Custom(same));
    assert_eq!(cache.get_cached(&key), Some(asset));
}

#[tokio::test]
async fn test_seeded_source() {
    setup();
    let transport = GatedTransport::new();
    let cache = cache(&transport, &TestProcessor::default(), DiskTier::disabled());

    let source = Source::seeded("placeholder");
    let key = sized(source.clone(), 8.0, 8.0);
    assert_eq!(cache.fetch(key.clone()).await, None);

    cache.seed(source, Bytes::from_static(b"pixels")).unwrap();
    let asset = cache.fetch(key).await.unwrap();
    assert_eq!(text(&asset), "pixels@8x8");
    assert_eq!(transport.fetches(), 0);
}
