//! # Asset caching infrastructure
//!
//! This module includes all the building blocks of the asset cache, our central [`CacheError`]
//! type, and an explanation of how they fit together. The pipeline that drives them lives in
//! [`AssetCache`](crate::service::AssetCache).
//!
//! ## Cache Layers
//!
//! The cache consists of the following layers:
//!
//! - The [`MemoryTier`], an in-memory map of fully formatted assets. It is only ever cleared as
//!   a whole, in reaction to memory pressure.
//! - The [`DiskTier`], which persists encoded assets as flat files. Canonical assets and all of
//!   their variants live side by side, each named by [`CacheKey::filename`].
//! - Two [`TaskRegistry`]s, one coalescing concurrent fetches of the same canonical asset, and
//!   one coalescing concurrent rendering of the same variant.
//!
//! A request goes through the following steps:
//! - First, it goes through the memory tier.
//! - On miss, it will try to load the formatted asset from disk.
//! - On miss, it will obtain the canonical asset, either from disk or by fetching it from its
//!   source. Fetched assets are written to disk before anyone is notified.
//! - The canonical asset is then rendered into the requested variant, which is written to disk
//!   in the background and put into the memory tier.
//!
//! Failures are never cached. The next request for the same key will try again.
//!
//! ### Metrics
//!
//! Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.computation`: Fetches and renderings that actually ran, tagged by `step`.
//! - `caches.memory.hit` / `caches.memory.miss`: Lookups in the memory tier.
//! - `caches.file.hit` / `caches.file.miss`: Lookups in the disk tier.
//! - `caches.file.write`: The number of files written to disk.
//! - `caches.file.size`: The size (in bytes) of the successfully loaded cache files.
//! - `registry.{obtain,format}.channel.{hit,miss}`: Requests that joined a running work item,
//!   or started a new one.
//! - `registry.{obtain,format}.{cancelled,finished}`: How work items ended.
//! - `caches.size.*`: Outcome of the last trimming of the disk tier.
//!
//! ### Configuration
//!
//! The disk tier is gated by the [`Config::cache_dir`](crate::config::Config::cache_dir) option.
//! If no `cache_dir` is configured, assets are fetched again whenever they are not in memory.
//! `max_disk_bytes` bounds the size of the disk tier. It is enforced by trimming the least
//! recently accessed files whenever the limit changes or the host enters the background, and
//! with the `trim` command.

mod cache_error;
mod cache_key;
mod cleanup;
mod fs;
mod memory;
mod registry;


pub use cache_error::{CacheContents, CacheError};
pub use cache_key::{
    Border, CacheKey, ContentMode, CustomEdit, CustomSource, DrawRecipe, EditTransform,
    FilenameHasher, Source, SourceLoader, Variant,
};
pub use cleanup::{TrimStats, trim};
pub use fs::{DiskTier, FileEntry, FileSystem, LocalFileSystem};
pub use memory::MemoryTier;
pub use registry::{Finisher, RequestId, TaskRegistry};
