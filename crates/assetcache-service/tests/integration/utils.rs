use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assetcache_service::caching::{
    CacheContents, CacheError, CacheKey, DiskTier, DrawRecipe, Source, Variant,
};
use assetcache_service::download::Transport;
use assetcache_service::executor::{InlineExecutor, WorkQueues};
use assetcache_service::{Asset, AssetCache, AssetProcessor};
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use url::Url;

/// A transport that holds every fetch until [`GatedTransport::open`] is called.
///
/// Responds with the requested path as body, or `NotFound` for paths containing `missing`.
#[derive(Clone, Debug)]
pub struct GatedTransport {
    gate: Arc<Semaphore>,
    fetches: Arc<AtomicUsize>,
    abandoned: Arc<AtomicUsize>,
}

impl GatedTransport {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            fetches: Default::default(),
            abandoned: Default::default(),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(1024);
    }

    /// The number of fetches that were started.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// The number of fetches that were dropped before they completed.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

impl Default for GatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct Abandoned(Option<Arc<AtomicUsize>>);

impl Drop for Abandoned {
    fn drop(&mut self) {
        if let Some(counter) = self.0.take() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Transport for GatedTransport {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, CacheContents<Bytes>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.clone();
        let abandoned = self.abandoned.clone();
        let path = url.path().to_owned();

        Box::pin(async move {
            let mut guard = Abandoned(Some(abandoned));
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| CacheError::InternalError)?;
            guard.0 = None;

            if path.contains("missing") {
                return Err(CacheError::NotFound);
            }
            Ok(Bytes::from(path))
        })
    }
}

/// Renders by appending the recipe's size to the data, failing for zero widths.
///
/// A gated processor blocks every render until [`TestProcessor::open`] is called.
#[derive(Clone, Debug, Default)]
pub struct TestProcessor {
    renders: Arc<AtomicUsize>,
    rendered: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
}

impl TestProcessor {
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        }
    }

    pub fn open(&self) {
        if let Some(ref gate) = self.gate {
            gate.add_permits(1024);
        }
    }

    /// The number of renders that were started.
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    /// The number of renders that ran to completion.
    pub fn rendered(&self) -> usize {
        self.rendered.load(Ordering::SeqCst)
    }
}

impl AssetProcessor for TestProcessor {
    fn decode(&self, data: Bytes) -> Option<Asset> {
        Some(Asset::new(data))
    }

    fn encode(&self, asset: &Asset) -> Option<Bytes> {
        Some(asset.data().clone())
    }

    fn render(&self, asset: &Asset, recipe: &DrawRecipe) -> Option<Asset> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.gate {
            // renders run on blocking threads
            let _permit = futures::executor::block_on(gate.acquire()).ok()?;
        }
        self.rendered.fetch_add(1, Ordering::SeqCst);

        if recipe.width == 0.0 {
            return None;
        }
        let data = String::from_utf8_lossy(asset.data());
        Some(Asset::new(format!("{data}@{}x{}", recipe.width, recipe.height)))
    }
}

pub fn cache(transport: &GatedTransport, processor: &TestProcessor, disk: DiskTier) -> AssetCache {
    AssetCache::builder(WorkQueues::current())
        .disk(disk)
        .transport(transport.clone())
        .processor(processor.clone())
        .executor(InlineExecutor)
        .build()
        .unwrap()
}

pub fn remote(path: &str) -> Source {
    Source::remote(format!("https://example.com{path}").parse().unwrap())
}

pub fn sized(source: Source, width: f64, height: f64) -> CacheKey {
    CacheKey::new(source, Variant::Draw(DrawRecipe::new(width, height)))
}

pub fn text(asset: &Asset) -> String {
    String::from_utf8_lossy(asset.data()).into_owned()
}

/// Collects results of callback style requests, in delivery order.
#[derive(Clone, Debug, Default)]
pub struct Results(Arc<Mutex<Vec<(usize, Option<String>)>>>);

impl Results {
    pub fn callback(&self, index: usize) -> impl FnOnce(Option<Asset>) + Send + 'static {
        let results = self.0.clone();
        move |asset| {
            let asset = asset.as_ref().map(text);
            results.lock().unwrap().push((index, asset));
        }
    }

    pub fn get(&self) -> Vec<(usize, Option<String>)> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Lets all spawned, non-blocking work run.
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

/// Waits until `condition` holds, panicking after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
