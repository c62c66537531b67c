use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::metric;

/// A file inside the disk tier, as returned by [`FileSystem::enumerate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    /// The last time the file was read from or written to the cache.
    pub last_accessed: SystemTime,
}

/// The file system operations the disk tier is built on.
pub trait FileSystem: fmt::Debug + Send + Sync + 'static {
    fn exists(&self, path: &Path) -> bool;

    /// Reads the whole file, or returns `None` if it does not exist.
    fn read(&self, path: &Path) -> io::Result<Option<Bytes>>;

    /// Writes `data` to `path`, so that readers either see the old or the complete new file.
    fn atomic_write(&self, data: &[u8], path: &Path) -> io::Result<()>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Lists all files directly inside `directory`.
    fn enumerate(&self, directory: &Path) -> io::Result<Vec<FileEntry>>;

    /// Marks the file as accessed just now.
    fn touch(&self, path: &Path) -> io::Result<()>;
}

/// The local file system.
///
/// Access times are tracked with the file's `mtime`, since most filesystems are mounted
/// with `noatime`.
#[derive(Clone, Debug, Default)]
pub struct LocalFileSystem {
    /// Directory for temporary files. If `None`, they are created next to their target.
    tmp_dir: Option<PathBuf>,
}

impl LocalFileSystem {
    pub fn new(tmp_dir: Option<PathBuf>) -> Self {
        Self { tmp_dir }
    }

    /// Create a new temporary file to write into `dir`.
    fn tempfile(&self, dir: &Path) -> io::Result<NamedTempFile> {
        let path = self.tmp_dir.as_deref().unwrap_or(dir);

        // Trimming could potentially remove the directories we are operating in, so be
        // defensive here and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read(&self, path: &Path) -> io::Result<Option<Bytes>> {
        catch_not_found(|| std::fs::read(path).map(Bytes::from))
    }

    fn atomic_write(&self, data: &[u8], path: &Path) -> io::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

        let mut temp_file = self.tempfile(parent)?;
        temp_file.write_all(data)?;
        temp_file.flush()?;

        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(parent) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", parent.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match temp_file.persist(path) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    temp_file = e.file;
                    let err = e.error;
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to persist cache file: {:?}", err),
                    );
                    if retries > MAX_RETRIES {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn enumerate(&self, directory: &Path) -> io::Result<Vec<FileEntry>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let entry = entry?;
            // files can vanish while we are looking at them
            let Some(metadata) = catch_not_found(|| entry.metadata())? else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(FileEntry {
                path: entry.path(),
                size: metadata.len(),
                last_accessed: metadata.modified()?,
            });
        }
        Ok(files)
    }

    fn touch(&self, path: &Path) -> io::Result<()> {
        filetime::set_file_mtime(path, FileTime::now())
    }
}

/// The disk tier, storing encoded assets as flat files named by their cache key.
///
/// Canonical assets live next to their variants in the same directory. A disk tier without a
/// directory is disabled: it never finds anything and drops all writes.
#[derive(Clone, Debug)]
pub struct DiskTier {
    /// Directory holding the asset files.
    pub(super) asset_dir: Option<PathBuf>,

    /// Directory to use for temporary files.
    ///
    /// Just like for `asset_dir` when this tier is disabled this will be `None`.
    pub(super) tmp_dir: Option<PathBuf>,

    pub(super) fs: Arc<dyn FileSystem>,
}

impl DiskTier {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        match config.cache_dir {
            Some(ref cache_dir) => Self::local(cache_dir),
            None => Ok(Self::disabled()),
        }
    }

    /// A disk tier on the local file system, rooted at `cache_dir`.
    pub fn local(cache_dir: impl AsRef<Path>) -> io::Result<Self> {
        let tmp_dir = cache_dir.as_ref().join("tmp");
        let fs = LocalFileSystem::new(Some(tmp_dir));
        Self::with_fs(cache_dir, Arc::new(fs))
    }

    /// A disk tier rooted at `cache_dir` that performs all file operations through `fs`.
    pub fn with_fs(cache_dir: impl AsRef<Path>, fs: Arc<dyn FileSystem>) -> io::Result<Self> {
        let cache_dir = cache_dir.as_ref();
        let asset_dir = cache_dir.join("assets");
        std::fs::create_dir_all(&asset_dir)?;

        Ok(Self {
            asset_dir: Some(asset_dir),
            tmp_dir: Some(cache_dir.join("tmp")),
            fs,
        })
    }

    pub fn disabled() -> Self {
        Self {
            asset_dir: None,
            tmp_dir: None,
            fs: Arc::new(LocalFileSystem::default()),
        }
    }

    pub fn asset_dir(&self) -> Option<&Path> {
        self.asset_dir.as_deref()
    }

    /// Returns the path a file with the given name is stored at.
    pub fn path(&self, filename: &str) -> Option<PathBuf> {
        self.asset_dir.as_ref().map(|dir| dir.join(filename))
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.path(filename).is_some_and(|path| self.fs.exists(&path))
    }

    /// Reads the file with the given name, bumping its access time.
    ///
    /// Read errors are logged and treated as a miss.
    pub fn load(&self, filename: &str) -> Option<Bytes> {
        let path = self.path(filename)?;
        let data = match self.fs.read(&path) {
            Ok(Some(data)) => data,
            Ok(None) => {
                metric!(counter("caches.file.miss") += 1);
                return None;
            }
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to read cache file: {:?}", e);
                return None;
            }
        };
        metric!(counter("caches.file.hit") += 1);
        metric!(time_raw("caches.file.size") = data.len() as u64);

        if let Err(e) = self.fs.touch(&path) {
            tracing::warn!(path = %path.display(), "Failed to touch cache file: {:?}", e);
        }
        Some(data)
    }

    /// Atomically writes a file with the given name.
    ///
    /// Returns the path the file was written to, or `None` if the tier is disabled.
    pub fn store(&self, filename: &str, data: &[u8]) -> io::Result<Option<PathBuf>> {
        let Some(path) = self.path(filename) else {
            return Ok(None);
        };
        self.fs.atomic_write(data, &path)?;
        metric!(counter("caches.file.write") += 1);
        tracing::trace!(path = %path.display(), "Stored {} bytes", data.len());
        Ok(Some(path))
    }

    /// Removes every file from the tier, returning how many were removed.
    pub fn clear(&self) -> io::Result<usize> {
        let Some(ref dir) = self.asset_dir else {
            return Ok(0);
        };
        let files = catch_not_found(|| self.fs.enumerate(dir))?.unwrap_or_default();
        let mut removed = 0;
        for file in files {
            if catch_not_found(|| self.fs.remove(&file.path))?.is_some() {
                removed += 1;
            }
        }
        tracing::info!("Removed {} files from the disk cache", removed);
        Ok(removed)
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
