use std::io;

use anyhow::{Result, anyhow};

use crate::config::Config;
use crate::metric;

use super::DiskTier;
use super::fs::catch_not_found;

/// Entry function for the trim command.
///
/// This trims the configured disk cache down to `max_disk_bytes`.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn trim(config: &Config, dry_run: bool) -> Result<TrimStats> {
    let disk = DiskTier::from_config(config)?;
    if disk.asset_dir().is_none() {
        return Err(anyhow!(
            "no caching configured! Did you provide a path to your config file?"
        ));
    }
    Ok(disk.trim(config.max_disk_bytes, dry_run)?)
}

/// The outcome of trimming the disk tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrimStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl DiskTier {
    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which
    /// survive a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if let Some(ref tmp) = self.tmp_dir {
            if tmp.exists() {
                std::fs::remove_dir_all(tmp)?;
            }
            std::fs::create_dir_all(tmp)?;
        }
        Ok(())
    }

    /// Removes the least recently accessed files until the total size is within `byte_limit`.
    ///
    /// Without a limit, or with the tier disabled, nothing is removed. Files that cannot be
    /// removed are logged and count as retained.
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn trim(&self, byte_limit: Option<u64>, dry_run: bool) -> io::Result<TrimStats> {
        let mut stats = TrimStats::default();
        let (Some(limit), Some(dir)) = (byte_limit, self.asset_dir.as_ref()) else {
            return Ok(stats);
        };

        let Some(mut files) = catch_not_found(|| self.fs.enumerate(dir))? else {
            tracing::warn!("Directory not found: `{}`", dir.display());
            return Ok(stats);
        };
        let mut remaining: u64 = files.iter().map(|file| file.size).sum();
        tracing::debug!(
            "Trimming `{}` from {} to {} bytes",
            dir.display(),
            remaining,
            limit
        );

        files.sort_by_key(|file| file.last_accessed);
        for file in files {
            if remaining > limit {
                tracing::trace!("Removing file `{}`", file.path.display());
                let removed = if dry_run {
                    Ok(())
                } else {
                    catch_not_found(|| self.fs.remove(&file.path)).map(|_| ())
                };
                match removed {
                    Ok(()) => {
                        remaining -= file.size;
                        stats.removed_files += 1;
                        stats.removed_bytes += file.size;
                        continue;
                    }
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", file.path.display().to_string().into()),
                            || tracing::error!("Failed to trim cache file: {:?}", e),
                        );
                    }
                }
            }
            stats.retained_files += 1;
            stats.retained_bytes += file.size;
        }

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }
}
