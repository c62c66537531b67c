//! The [`AssetCache`], tying all cache layers together.
//!
//! A request first looks into the memory tier, synchronously. Everything else happens on the
//! orchestration queue:
//!
//! 1. The formatted asset is looked up on disk.
//! 2. The canonical asset is obtained through the `obtain` registry, either from disk or from
//!    its source. Fetched bytes are persisted before anyone is notified.
//! 3. The variant is rendered through the `format` registry, then written to disk in the
//!    background and put into the memory tier.
//!
//! Results are handed to the caller through the configured [`CompletionExecutor`].

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::caching::{
    CacheContents, CacheError, CacheKey, DiskTier, FilenameHasher, Finisher, MemoryTier,
    RequestId, Source, TaskRegistry, TrimStats, Variant,
};
use crate::config::Config;
use crate::download::{DownloadService, Fetched, HttpTransport, Transport};
use crate::executor::{CompletionExecutor, SerialExecutor, WorkQueues};
use crate::metric;
use crate::types::{Asset, AssetProcessor, LifecycleSignal, RawProcessor};
use crate::utils::defer::defer;
use crate::utils::http::DownloadTimeouts;

/// Where an obtained canonical asset came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObtainOrigin {
    /// Fetched from its source just now, and written to the given path unless the disk tier
    /// is disabled or the write failed.
    Fresh(Option<PathBuf>),
    /// Already held by the memory tier, or loaded from a file written earlier.
    Previous,
}

/// A canonical asset, as reported by the `obtain` registry.
#[derive(Clone, Debug)]
pub struct Obtained {
    pub asset: Asset,
    pub origin: ObtainOrigin,
}

type ObtainResult = CacheContents<Obtained>;
type FormatResult = CacheContents<Asset>;
type ResultCallback = Box<dyn FnOnce(Option<Asset>) + Send + 'static>;

/// The outstanding step of a pending request.
#[derive(Debug)]
enum Phase {
    DiskLookup,
    Obtaining(RequestId),
    Formatting(RequestId),
    Done,
    Cancelled,
}

struct RequestState {
    phase: Phase,
    on_result: Option<ResultCallback>,
}

struct PendingRequest {
    key: CacheKey,
    state: Mutex<RequestState>,
}

impl PendingRequest {
    fn is_cancelled(&self) -> bool {
        matches!(self.state.lock().unwrap().phase, Phase::Cancelled)
    }
}

/// The outcome of [`AssetCache::request`].
#[derive(Debug)]
pub enum Request {
    /// The asset was in memory and has already been delivered.
    Completed,
    /// The asset will be delivered later, unless the request is cancelled.
    Pending(CancelHandle),
}

impl Request {
    pub fn is_completed(&self) -> bool {
        matches!(self, Request::Completed)
    }

    /// Cancels the request if it is still pending.
    pub fn cancel(&self) {
        if let Request::Pending(handle) = self {
            handle.cancel();
        }
    }
}

/// Cancels one pending request.
///
/// Only this request is withdrawn. Other requests for the same key keep waiting, and the
/// underlying work is only stopped when nobody is waiting for it anymore.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
    request: Arc<PendingRequest>,
}

impl CancelHandle {
    /// Cancels the request.
    ///
    /// This only prevents deliveries that have not been handed to the completion executor
    /// yet. A callback that is already queued on the executor still runs, for example behind
    /// other jobs on a [`SerialExecutor`].
    pub fn cancel(&self) {
        self.inner.cancel(&self.request);
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("key", &self.request.key)
            .finish()
    }
}

/// A multi-tier cache for fetched and rendered assets.
///
/// Cloning is cheap, all clones share the same tiers and registries.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<Inner>,
}

struct Inner {
    memory: MemoryTier,
    disk: DiskTier,
    downloads: DownloadService,
    processor: Arc<dyn AssetProcessor>,
    hasher: FilenameHasher,
    executor: Arc<dyn CompletionExecutor>,
    queues: WorkQueues,
    obtain: TaskRegistry<String, ObtainResult>,
    format: TaskRegistry<String, FormatResult>,
    byte_limit: Mutex<Option<u64>>,
    clear_memory_on_background: bool,
}

impl AssetCache {
    /// Creates a cache from the configuration, using HTTP for remote sources and storing
    /// assets verbatim.
    ///
    /// Leftover temporary files from earlier runs are removed.
    pub fn from_config(config: &Config, queues: WorkQueues) -> anyhow::Result<Self> {
        config.validate()?;
        let disk = DiskTier::from_config(config)?;
        disk.clear_tmp()?;

        Self::builder(queues)
            .disk(disk)
            .timeouts(DownloadTimeouts::from_config(config))
            .byte_limit(config.max_disk_bytes)
            .clear_memory_on_background(config.clear_memory_on_background)
            .build()
    }

    pub fn builder(queues: WorkQueues) -> AssetCacheBuilder {
        AssetCacheBuilder::new(queues)
    }

    /// Requests the asset for `key`.
    ///
    /// On a memory hit `on_result` is invoked before this returns. Otherwise it is invoked
    /// exactly once through the completion executor, with `None` on any failure, unless the
    /// request is cancelled first.
    pub fn request<F>(&self, key: CacheKey, on_result: F) -> Request
    where
        F: FnOnce(Option<Asset>) + Send + 'static,
    {
        metric!(counter("caches.access") += 1);

        if let Some(asset) = self.inner.memory.get(&key) {
            on_result(Some(asset));
            return Request::Completed;
        }

        let request = Arc::new(PendingRequest {
            key,
            state: Mutex::new(RequestState {
                phase: Phase::DiskLookup,
                on_result: Some(Box::new(on_result)),
            }),
        });

        let inner = self.inner.clone();
        let pending = request.clone();
        self.inner
            .queues
            .orchestration
            .spawn(inner.lookup_formatted(pending));

        Request::Pending(CancelHandle {
            inner: self.inner.clone(),
            request,
        })
    }

    /// Requests the asset for `key` and waits for it.
    ///
    /// Dropping the returned future cancels the request.
    pub async fn fetch(&self, key: CacheKey) -> Option<Asset> {
        let (sender, receiver) = oneshot::channel();
        let request = self.request(key, move |result| {
            sender.send(result).ok();
        });

        let guard = defer(move || request.cancel());
        let result = receiver.await.ok().flatten();
        guard.disarm();
        result
    }

    /// Looks up `key` in the memory tier only.
    pub fn get_cached(&self, key: &CacheKey) -> Option<Asset> {
        self.inner.memory.get(key)
    }

    /// Returns the file name `key` is stored under in the disk tier.
    pub fn filename(&self, key: &CacheKey) -> String {
        key.filename(&self.inner.hasher)
    }

    pub fn disk(&self) -> &DiskTier {
        &self.inner.disk
    }

    /// Puts `data` into the cache as the canonical asset of `source`.
    ///
    /// This is the only way a [`Source::Seeded`] asset becomes available, but any source can
    /// be seeded. The data is written to disk synchronously.
    pub fn seed(&self, source: Source, data: Bytes) -> CacheContents<Asset> {
        let key = CacheKey::identity(source);
        let asset = decode(self.inner.processor.as_ref(), data.clone())
            .ok_or_else(|| CacheError::Malformed("failed to decode seeded asset".into()))?;

        let filename = self.filename(&key);
        self.inner.disk.store(&filename, &data)?;
        tracing::debug!(key = %key, "Seeded asset as `{}`", filename);

        self.inner.memory.insert(key, asset.clone());
        Ok(asset)
    }

    /// Drops the memory tier, returning the number of dropped assets.
    pub fn clear_memory(&self) -> usize {
        let cleared = self.inner.memory.clear();
        tracing::debug!("Cleared {} assets from memory", cleared);
        cleared
    }

    /// Removes every file from the disk tier.
    pub fn clear_disk(&self) -> io::Result<usize> {
        self.inner.disk.clear()
    }

    /// Reacts to a signal from the host environment.
    ///
    /// Returns the handle of the disk trim if the signal started one.
    pub fn handle_signal(&self, signal: LifecycleSignal) -> Option<JoinHandle<Option<TrimStats>>> {
        tracing::debug!(?signal, "Received lifecycle signal");
        match signal {
            LifecycleSignal::MemoryPressure => {
                self.clear_memory();
                None
            }
            LifecycleSignal::EnteredBackground => {
                if self.inner.clear_memory_on_background {
                    self.clear_memory();
                }
                Some(self.trim_disk())
            }
        }
    }

    pub fn byte_limit(&self) -> Option<u64> {
        *self.inner.byte_limit.lock().unwrap()
    }

    /// Changes the size limit of the disk tier and trims it in the background.
    pub fn set_byte_limit(&self, byte_limit: Option<u64>) -> JoinHandle<Option<TrimStats>> {
        *self.inner.byte_limit.lock().unwrap() = byte_limit;
        self.trim_disk()
    }

    /// Trims the disk tier down to the current byte limit on the IO queue.
    pub fn trim_disk(&self) -> JoinHandle<Option<TrimStats>> {
        let disk = self.inner.disk.clone();
        let byte_limit = self.byte_limit();
        self.inner
            .queues
            .io
            .spawn_blocking(move || match disk.trim(byte_limit, false) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::error!(error = &e as &dyn Error, "Failed to trim disk cache");
                    None
                }
            })
    }
}

impl fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetCache")
            .field("memory", &self.inner.memory.len())
            .field("disk", &self.inner.disk)
            .field("obtain", &self.inner.obtain)
            .field("format", &self.inner.format)
            .field("byte_limit", &self.byte_limit())
            .finish()
    }
}

fn decode(processor: &dyn AssetProcessor, data: Bytes) -> Option<Asset> {
    processor
        .decode(data)
        .and_then(|asset| processor.decompress(asset))
}

impl Inner {
    /// Reads and decodes a file on the IO queue.
    async fn load_from_disk(&self, filename: &str) -> Option<Asset> {
        self.disk.asset_dir()?;
        let disk = self.disk.clone();
        let processor = self.processor.clone();
        let name = filename.to_owned();
        let loaded = self.queues.io.spawn_blocking(move || {
            let data = disk.load(&name)?;
            let asset = decode(processor.as_ref(), data);
            if asset.is_none() {
                tracing::warn!("Failed to decode cache file `{}`", name);
            }
            asset
        });

        loaded.await.unwrap_or_else(|e| {
            tracing::error!("Loading `{}` panicked: {}", filename, e);
            None
        })
    }

    /// Hands the result to the caller, unless the request was cancelled.
    fn deliver(&self, request: &PendingRequest, result: Option<Asset>) {
        let on_result = {
            let mut state = request.state.lock().unwrap();
            if matches!(state.phase, Phase::Cancelled | Phase::Done) {
                return;
            }
            state.phase = Phase::Done;
            state.on_result.take()
        };

        if let Some(on_result) = on_result {
            self.executor.execute(Box::new(move || on_result(result)));
        }
    }

    fn cancel(&self, request: &PendingRequest) {
        let (phase, on_result) = {
            let mut state = request.state.lock().unwrap();
            if matches!(state.phase, Phase::Cancelled | Phase::Done) {
                return;
            }
            let phase = std::mem::replace(&mut state.phase, Phase::Cancelled);
            (phase, state.on_result.take())
        };
        drop(on_result);

        tracing::trace!(key = %request.key, ?phase, "Cancelling request");
        match phase {
            Phase::Obtaining(id) => self.obtain.cancel_request(id),
            Phase::Formatting(id) => self.format.cancel_request(id),
            Phase::DiskLookup | Phase::Done | Phase::Cancelled => {}
        }
    }

    async fn lookup_formatted(self: Arc<Self>, request: Arc<PendingRequest>) {
        if request.is_cancelled() {
            return;
        }

        let filename = request.key.filename(&self.hasher);
        if let Some(asset) = self.load_from_disk(&filename).await {
            tracing::trace!(key = %request.key, "Loaded asset from disk");
            self.memory.insert(request.key.clone(), asset.clone());
            self.deliver(&request, Some(asset));
            return;
        }

        self.request_canonical(request);
    }

    fn request_canonical(self: &Arc<Self>, request: Arc<PendingRequest>) {
        let source = request.key.source().clone();
        let filename = CacheKey::identity(source.clone()).filename(&self.hasher);

        let mut state = request.state.lock().unwrap();
        if !matches!(state.phase, Phase::DiskLookup) {
            return;
        }

        let token = CancellationToken::new();
        let execute = {
            let inner = self.clone();
            let token = token.clone();
            let source = source.clone();
            move |finisher| inner.start_obtain(source, token, finisher)
        };
        let on_task_complete = move |result: &ObtainResult| match result {
            Ok(obtained) => {
                tracing::trace!(source = %source, origin = ?obtained.origin, "Obtained asset")
            }
            Err(e) => tracing::debug!(error = e as &dyn Error, source = %source, "Failed to obtain asset"),
        };
        let on_request_complete = {
            let inner = self.clone();
            let request = request.clone();
            move |result| inner.on_canonical(request, result)
        };

        let id = self.obtain.add_request(
            filename,
            execute,
            move || token.cancel(),
            on_task_complete,
            on_request_complete,
        );
        state.phase = Phase::Obtaining(id);
    }

    fn on_canonical(self: &Arc<Self>, request: Arc<PendingRequest>, result: ObtainResult) {
        let canonical = match result {
            Ok(obtained) => obtained.asset,
            Err(_) => {
                self.deliver(&request, None);
                return;
            }
        };

        if request.key.is_canonical() {
            self.memory.insert(request.key.clone(), canonical.clone());
            self.deliver(&request, Some(canonical));
            return;
        }

        self.request_variant(request, canonical);
    }

    fn request_variant(self: &Arc<Self>, request: Arc<PendingRequest>, canonical: Asset) {
        let filename = request.key.filename(&self.hasher);

        let mut state = request.state.lock().unwrap();
        if !matches!(state.phase, Phase::Obtaining(_)) {
            return;
        }

        let token = CancellationToken::new();
        let execute = {
            let inner = self.clone();
            let token = token.clone();
            let key = request.key.clone();
            move |finisher| inner.start_format(key, canonical, token, finisher)
        };
        let on_task_complete = {
            let inner = self.clone();
            let key = request.key.clone();
            move |result: &FormatResult| match result {
                Ok(asset) => inner.memory.insert(key, asset.clone()),
                Err(e) => {
                    tracing::debug!(error = e as &dyn Error, key = %key, "Failed to format asset")
                }
            }
        };
        let on_request_complete = {
            let inner = self.clone();
            let request = request.clone();
            move |result: FormatResult| inner.deliver(&request, result.ok())
        };

        let id = self.format.add_request(
            filename,
            execute,
            move || token.cancel(),
            on_task_complete,
            on_request_complete,
        );
        state.phase = Phase::Formatting(id);
    }

    fn start_obtain(
        self: Arc<Self>,
        source: Source,
        token: CancellationToken,
        finisher: Finisher<String, ObtainResult>,
    ) {
        let queue = self.queues.orchestration.clone();
        queue.spawn(async move {
            let filename = finisher.task_id().clone();
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(source = %source, "Obtaining asset cancelled");
                }
                result = self.obtain_canonical(&source, &filename) => finisher.finish(result),
            }
        });
    }

    async fn obtain_canonical(&self, source: &Source, filename: &str) -> ObtainResult {
        let previous = match self.memory.get(&CacheKey::identity(source.clone())) {
            Some(asset) => Some(asset),
            None => self.load_from_disk(filename).await,
        };
        if let Some(asset) = previous {
            return Ok(Obtained {
                asset,
                origin: ObtainOrigin::Previous,
            });
        }

        metric!(counter("caches.computation") += 1, "step" => "obtain");
        let (asset, path) = match self.downloads.fetch(source).await? {
            Fetched::Data(data) => {
                let asset = decode(self.processor.as_ref(), data.clone())
                    .ok_or_else(|| CacheError::Malformed("failed to decode asset".into()))?;
                (asset, self.persist(filename, data).await)
            }
            Fetched::Asset(asset) => {
                let asset = self
                    .processor
                    .decompress(asset)
                    .ok_or_else(|| CacheError::Malformed("failed to normalize asset".into()))?;
                let path = match self.processor.encode(&asset) {
                    Some(data) => self.persist(filename, data).await,
                    None => {
                        tracing::warn!(source = %source, "Failed to encode loaded asset");
                        None
                    }
                };
                (asset, path)
            }
        };

        Ok(Obtained {
            asset,
            origin: ObtainOrigin::Fresh(path),
        })
    }

    /// Writes a canonical file on the IO queue. Failures are logged, the asset is still
    /// usable.
    async fn persist(&self, filename: &str, data: Bytes) -> Option<PathBuf> {
        self.disk.asset_dir()?;
        let disk = self.disk.clone();
        let name = filename.to_owned();
        let stored = self
            .queues
            .io
            .spawn_blocking(move || disk.store(&name, &data))
            .await;

        match stored {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                tracing::error!(error = &e as &dyn Error, "Failed to persist `{}`", filename);
                None
            }
            Err(e) => {
                tracing::error!("Persisting `{}` panicked: {}", filename, e);
                None
            }
        }
    }

    fn start_format(
        self: Arc<Self>,
        key: CacheKey,
        canonical: Asset,
        token: CancellationToken,
        finisher: Finisher<String, FormatResult>,
    ) {
        let queue = self.queues.orchestration.clone();
        queue.spawn(async move {
            let filename = finisher.task_id().clone();

            // an earlier work item may have written the variant in the meantime
            if let Some(asset) = self.load_from_disk(&filename).await {
                finisher.finish(Ok(asset));
                return;
            }

            metric!(counter("caches.computation") += 1, "step" => "format");
            let inner = self.clone();
            let render = self
                .queues
                .transform
                .spawn_blocking(move || inner.render(&key, &canonical));

            let result = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("Formatting `{}` cancelled", filename);
                    return;
                }
                result = render => result.unwrap_or_else(|e| {
                    tracing::error!("Rendering `{}` panicked: {}", filename, e);
                    Err(CacheError::InternalError)
                }),
            };

            if let Ok(ref asset) = result {
                self.spawn_write(filename, asset.clone());
            }
            finisher.finish(result);
        });
    }

    fn render(&self, key: &CacheKey, canonical: &Asset) -> FormatResult {
        let rendered = match key.variant() {
            Variant::Identity => Some(canonical.clone()),
            Variant::Draw(recipe) => self.processor.render(canonical, recipe),
            Variant::Custom(edit) => edit.apply(canonical),
        };
        rendered.ok_or_else(|| CacheError::Malformed(format!("failed to render `{key}`")))
    }

    fn spawn_write(&self, filename: String, asset: Asset) {
        let disk = self.disk.clone();
        let processor = self.processor.clone();
        self.queues.io.spawn_blocking(move || {
            let Some(data) = processor.encode(&asset) else {
                tracing::warn!("Failed to encode `{}`", filename);
                return;
            };
            if let Err(e) = disk.store(&filename, &data) {
                tracing::error!(error = &e as &dyn Error, "Failed to write `{}`", filename);
            }
        });
    }
}

/// Builds an [`AssetCache`] with explicit dependencies.
pub struct AssetCacheBuilder {
    queues: WorkQueues,
    disk: DiskTier,
    transport: Option<Arc<dyn Transport>>,
    processor: Arc<dyn AssetProcessor>,
    hasher: FilenameHasher,
    executor: Option<Arc<dyn CompletionExecutor>>,
    timeouts: DownloadTimeouts,
    byte_limit: Option<u64>,
    clear_memory_on_background: bool,
}

impl AssetCacheBuilder {
    fn new(queues: WorkQueues) -> Self {
        Self {
            queues,
            disk: DiskTier::disabled(),
            transport: None,
            processor: Arc::new(RawProcessor),
            hasher: FilenameHasher::default(),
            executor: None,
            timeouts: DownloadTimeouts::default(),
            byte_limit: None,
            clear_memory_on_background: false,
        }
    }

    pub fn disk(mut self, disk: DiskTier) -> Self {
        self.disk = disk;
        self
    }

    /// Defaults to an [`HttpTransport`].
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Defaults to a [`RawProcessor`].
    pub fn processor(mut self, processor: impl AssetProcessor) -> Self {
        self.processor = Arc::new(processor);
        self
    }

    pub fn hasher(mut self, hasher: FilenameHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Defaults to a [`SerialExecutor`] on the orchestration queue.
    pub fn executor(mut self, executor: impl CompletionExecutor) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn timeouts(mut self, timeouts: DownloadTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn byte_limit(mut self, byte_limit: Option<u64>) -> Self {
        self.byte_limit = byte_limit;
        self
    }

    pub fn clear_memory_on_background(mut self, clear: bool) -> Self {
        self.clear_memory_on_background = clear;
        self
    }

    pub fn build(self) -> anyhow::Result<AssetCache> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_timeouts(&self.timeouts)?),
        };
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SerialExecutor::new(&self.queues.orchestration)));

        let orchestration = self.queues.orchestration.clone();
        let inner = Inner {
            memory: MemoryTier::new(),
            disk: self.disk,
            downloads: DownloadService::new(transport, self.timeouts),
            processor: self.processor,
            hasher: self.hasher,
            executor,
            queues: self.queues,
            obtain: TaskRegistry::new("obtain", orchestration.clone()),
            format: TaskRegistry::new("format", orchestration),
            byte_limit: Mutex::new(self.byte_limit),
            clear_memory_on_background: self.clear_memory_on_background,
        };

        Ok(AssetCache {
            inner: Arc::new(inner),
        })
    }
}
