//! Assets and the processing hooks applied to them.

use std::fmt;

use bytes::Bytes;

use crate::caching::DrawRecipe;

/// An asset as it is held by the cache tiers.
///
/// The cache never interprets asset contents itself. Decoding, normalization and rendering
/// are left to an [`AssetProcessor`]. Cloning an asset is cheap.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    data: Bytes,
}

impl Asset {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset").field("len", &self.len()).finish()
    }
}

impl From<&'static [u8]> for Asset {
    fn from(data: &'static [u8]) -> Self {
        Self::new(data)
    }
}

/// Converts between stored bytes and in-memory assets, and renders variants.
///
/// All methods are called from worker threads and must not block on the cache itself.
pub trait AssetProcessor: Send + Sync + 'static {
    /// Decodes bytes fetched from a transport or read from disk.
    fn decode(&self, data: Bytes) -> Option<Asset>;

    /// Encodes an asset for storage on disk.
    fn encode(&self, asset: &Asset) -> Option<Bytes>;

    /// Post-load normalization, applied to every freshly decoded asset.
    fn decompress(&self, asset: Asset) -> Option<Asset> {
        Some(asset)
    }

    /// Renders `asset` according to `recipe`.
    fn render(&self, asset: &Asset, recipe: &DrawRecipe) -> Option<Asset>;
}

/// An [`AssetProcessor`] that stores assets verbatim.
///
/// It cannot render, so every drawing variant fails with it. Identity and custom variants
/// work as usual.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawProcessor;

impl AssetProcessor for RawProcessor {
    fn decode(&self, data: Bytes) -> Option<Asset> {
        Some(Asset::new(data))
    }

    fn encode(&self, asset: &Asset) -> Option<Bytes> {
        Some(asset.data().clone())
    }

    fn render(&self, _asset: &Asset, recipe: &DrawRecipe) -> Option<Asset> {
        tracing::debug!(?recipe, "Raw assets cannot be rendered");
        None
    }
}

/// Signals from the host environment that the cache reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The host is running low on memory. Drops the memory tier.
    MemoryPressure,
    /// The host moved to the background. Trims the disk tier, and optionally drops the
    /// memory tier.
    EnteredBackground,
}
