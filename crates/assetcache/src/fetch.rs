//! Fetches a single asset through the cache.
use std::fs;
use std::io::{self, Write};

use anyhow::{Context, Result, anyhow};
use assetcache_service::AssetCache;
use assetcache_service::caching::{CacheKey, Source, Variant};
use assetcache_service::config::Config;
use assetcache_service::executor::WorkQueues;

use crate::cli::FetchArgs;

/// Runs one request through the full pipeline, then applies the byte budget.
pub fn run(config: &Config, args: &FetchArgs) -> Result<()> {
    let io_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("assetcache-io")
        .enable_all()
        .build()?;
    let cpu_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("assetcache-cpu")
        .enable_all()
        .build()?;

    let queues = WorkQueues::new(
        io_pool.handle().to_owned(),
        cpu_pool.handle().to_owned(),
        io_pool.handle().to_owned(),
    );
    let cache = AssetCache::from_config(config, queues).context("failed to create cache")?;

    let variant = args.recipe().map_or(Variant::Identity, Variant::Draw);
    let key = CacheKey::new(Source::remote(args.url.clone()), variant);
    tracing::debug!(key = %key, "Fetching asset");

    let asset = io_pool
        .block_on(cache.fetch(key.clone()))
        .ok_or_else(|| anyhow!("could not get `{key}`"))?;

    match args.output {
        Some(ref path) => fs::write(path, asset.data())
            .with_context(|| format!("failed to write `{}`", path.display()))?,
        None => io::stdout().lock().write_all(asset.data())?,
    }

    if let Some(stats) = io_pool.block_on(cache.trim_disk())? {
        tracing::debug!(?stats, "Trimmed disk cache");
    }

    Ok(())
}
