#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod executor;
pub mod service;
pub mod types;
pub mod utils;

pub use crate::service::{AssetCache, AssetCacheBuilder, CancelHandle, Request};
pub use crate::types::{Asset, AssetProcessor, LifecycleSignal, RawProcessor};
