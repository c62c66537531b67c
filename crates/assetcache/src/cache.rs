//! Maintenance of the disk cache.
use anyhow::{Result, anyhow};
use assetcache_service::caching::{self, DiskTier};
use assetcache_service::config::Config;

/// Trims the configured disk cache down to `max_disk_bytes`.
pub fn trim(config: &Config, dry_run: bool) -> Result<()> {
    let stats = caching::trim(config, dry_run)?;
    if dry_run {
        tracing::info!(
            "Would remove {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );
    }
    Ok(())
}

/// Removes every asset from the configured disk cache.
pub fn clear(config: &Config) -> Result<()> {
    let disk = DiskTier::from_config(config)?;
    if disk.asset_dir().is_none() {
        return Err(anyhow!(
            "no caching configured! Did you provide a path to your config file?"
        ));
    }
    disk.clear_tmp()?;
    disk.clear()?;
    Ok(())
}
