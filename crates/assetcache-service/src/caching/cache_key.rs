use std::fmt::{self, Write};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future::BoxFuture;
use sha1::{Digest, Sha1};
use url::Url;

use crate::types::Asset;

/// Loads an asset for a [`Source::Custom`], given its identifier and namespace.
pub type SourceLoader = Arc<dyn Fn(&str, &str) -> BoxFuture<'static, Option<Asset>> + Send + Sync>;

/// Produces an edited asset from the canonical one, for a [`Variant::Custom`].
pub type EditTransform = Arc<dyn Fn(&Asset) -> Option<Asset> + Send + Sync>;

/// Where an asset comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// Fetched through the transport.
    Remote(Url),
    /// Only available after it was put into the cache with [`seed`](crate::service::AssetCache::seed).
    Seeded(Arc<str>),
    /// Loaded by a caller-provided loader.
    Custom(CustomSource),
}

impl Source {
    pub fn remote(url: Url) -> Self {
        Self::Remote(url)
    }

    pub fn seeded(identifier: impl Into<Arc<str>>) -> Self {
        Self::Seeded(identifier.into())
    }

    pub fn custom<F>(identifier: impl Into<Arc<str>>, namespace: impl Into<Arc<str>>, loader: F) -> Self
    where
        F: Fn(&str, &str) -> BoxFuture<'static, Option<Asset>> + Send + Sync + 'static,
    {
        Self::Custom(CustomSource {
            identifier: identifier.into(),
            namespace: namespace.into(),
            loader: Arc::new(loader),
        })
    }

    fn write_filename(&self, hasher: &FilenameHasher, out: &mut String) {
        match self {
            Source::Remote(url) => out.push_str(&hasher.hash(url.as_str())),
            Source::Seeded(identifier) => {
                out.push_str("seeded-");
                write_path_segment(identifier, out);
            }
            Source::Custom(custom) => {
                out.push_str("custom-");
                write_path_segment(&custom.namespace, out);
                out.push('-');
                write_path_segment(&custom.identifier, out);
            }
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Remote(url) => write!(f, "{url}"),
            Source::Seeded(identifier) => write!(f, "seeded:{identifier}"),
            Source::Custom(custom) => write!(f, "custom:{}/{}", custom.namespace, custom.identifier),
        }
    }
}

/// A source that is loaded by a caller-provided loader.
///
/// Two custom sources are equal when their identifier and namespace are, regardless of the
/// loader.
#[derive(Clone)]
pub struct CustomSource {
    identifier: Arc<str>,
    namespace: Arc<str>,
    loader: SourceLoader,
}

impl CustomSource {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Invokes the loader.
    pub fn load(&self) -> BoxFuture<'static, Option<Asset>> {
        (self.loader)(&self.identifier, &self.namespace)
    }
}

impl PartialEq for CustomSource {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.namespace == other.namespace
    }
}

impl Eq for CustomSource {}

impl Hash for CustomSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
        self.namespace.hash(state);
    }
}

impl fmt::Debug for CustomSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomSource")
            .field("identifier", &self.identifier)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// How a rendered asset is fitted into its target size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentMode {
    Fill,
    AspectFit,
    AspectFill,
    Center,
}

impl ContentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentMode::Fill => "fill",
            ContentMode::AspectFit => "aspectfit",
            ContentMode::AspectFill => "aspectfill",
            ContentMode::Center => "center",
        }
    }
}

/// A border drawn around a rendered asset.
#[derive(Clone, Copy, Debug)]
pub struct Border {
    pub width: f64,
    /// RGBA color.
    pub color: [u8; 4],
}

/// Describes how to render a variant of a canonical asset.
///
/// Floating point fields compare by value. `0.0` and `-0.0` are the same.
#[derive(Clone, Copy, Debug)]
pub struct DrawRecipe {
    pub width: f64,
    pub height: f64,
    pub mode: ContentMode,
    pub bleed: f64,
    /// Between `0.0` and `1.0`.
    pub opacity: f64,
    pub corner_radius: f64,
    pub border: Option<Border>,
    pub scale: f64,
}

impl DrawRecipe {
    /// A recipe that fills `width` x `height` at scale 1, fully opaque, without any decoration.
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            mode: ContentMode::Fill,
            bleed: 0.0,
            opacity: 1.0,
            corner_radius: 0.0,
            border: None,
            scale: 1.0,
        }
    }

    pub fn with_mode(mut self, mode: ContentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_bleed(mut self, bleed: f64) -> Self {
        self.bleed = bleed;
        self
    }

    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn with_corner_radius(mut self, corner_radius: f64) -> Self {
        self.corner_radius = corner_radius;
        self
    }

    pub fn with_border(mut self, width: f64, color: [u8; 4]) -> Self {
        self.border = Some(Border { width, color });
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    fn identity(&self) -> ([u64; 6], ContentMode, Option<(u64, [u8; 4])>) {
        let floats = [
            float_bits(self.width),
            float_bits(self.height),
            float_bits(self.bleed),
            float_bits(self.opacity),
            float_bits(self.corner_radius),
            float_bits(self.scale),
        ];
        let border = self.border.map(|b| (float_bits(b.width), b.color));
        (floats, self.mode, border)
    }

    /// Numbers are truncated to integers, opacity is written as a percentage.
    fn write_filename(&self, out: &mut String) {
        write!(
            out,
            "-{}x{}-{}-b{}-o{}-r{}",
            self.width as i64,
            self.height as i64,
            self.mode.as_str(),
            self.bleed as i64,
            (self.opacity * 100.0) as i64,
            self.corner_radius as i64,
        )
        .unwrap();
        if let Some(border) = self.border {
            let [r, g, b, a] = border.color;
            write!(out, "-bd{}_{r:02x}{g:02x}{b:02x}{a:02x}", border.width as i64).unwrap();
        }
        write!(out, "-s{}", self.scale as i64).unwrap();
    }
}

impl PartialEq for DrawRecipe {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for DrawRecipe {}

impl Hash for DrawRecipe {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

fn float_bits(value: f64) -> u64 {
    if value == 0.0 { 0 } else { value.to_bits() }
}

/// A caller-defined edit of the canonical asset.
///
/// Edits are identified by their key alone. Two edits with the same key are assumed to
/// produce the same output.
#[derive(Clone)]
pub struct CustomEdit {
    edit_key: Arc<str>,
    transform: EditTransform,
}

impl CustomEdit {
    pub fn new<F>(edit_key: impl Into<Arc<str>>, transform: F) -> Self
    where
        F: Fn(&Asset) -> Option<Asset> + Send + Sync + 'static,
    {
        Self {
            edit_key: edit_key.into(),
            transform: Arc::new(transform),
        }
    }

    pub fn edit_key(&self) -> &str {
        &self.edit_key
    }

    pub fn apply(&self, asset: &Asset) -> Option<Asset> {
        (self.transform)(asset)
    }
}

impl PartialEq for CustomEdit {
    fn eq(&self, other: &Self) -> bool {
        self.edit_key == other.edit_key
    }
}

impl Eq for CustomEdit {}

impl Hash for CustomEdit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.edit_key.hash(state);
    }
}

impl fmt::Debug for CustomEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomEdit")
            .field("edit_key", &self.edit_key)
            .finish_non_exhaustive()
    }
}

/// Which form of a source's asset is requested.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Variant {
    /// The canonical asset, as fetched.
    #[default]
    Identity,
    /// A rendered version of the canonical asset.
    Draw(DrawRecipe),
    /// An edited version of the canonical asset.
    Custom(CustomEdit),
}

impl Variant {
    fn write_filename(&self, out: &mut String) {
        match self {
            Variant::Identity => {}
            Variant::Draw(recipe) => recipe.write_filename(out),
            Variant::Custom(edit) => {
                out.push_str("-edit-");
                write_path_segment(&edit.edit_key, out);
            }
        }
    }
}

/// Identifies one asset across all cache tiers.
///
/// Two keys are equal when their [`Source`] and [`Variant`] are. Every key has a canonical
/// counterpart with the same source and [`Variant::Identity`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    source: Source,
    variant: Variant,
}

impl CacheKey {
    pub fn new(source: Source, variant: Variant) -> Self {
        Self { source, variant }
    }

    /// Creates the canonical key for `source`.
    pub fn identity(source: Source) -> Self {
        Self::new(source, Variant::Identity)
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    pub fn is_canonical(&self) -> bool {
        matches!(self.variant, Variant::Identity)
    }

    /// Returns the key of the canonical asset this key is derived from.
    pub fn canonical(&self) -> CacheKey {
        Self::identity(self.source.clone())
    }

    /// Returns the file name this key is stored under on disk.
    ///
    /// The file name is also the identity under which work for this key is coalesced.
    /// A canonical key's file name is the bare source part, variants append a suffix to it.
    pub fn filename(&self, hasher: &FilenameHasher) -> String {
        let mut filename = String::new();
        self.source.write_filename(hasher, &mut filename);
        self.variant.write_filename(&mut filename);
        filename
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)?;
        match &self.variant {
            Variant::Identity => Ok(()),
            Variant::Draw(recipe) => {
                let mut suffix = String::new();
                recipe.write_filename(&mut suffix);
                write!(f, " [{}]", &suffix[1..])
            }
            Variant::Custom(edit) => write!(f, " [edit {}]", edit.edit_key),
        }
    }
}

/// Hashes remote source URLs into file names.
///
/// Defaults to the hex-formatted SHA-1 digest of the URL.
#[derive(Clone)]
pub struct FilenameHasher(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl FilenameHasher {
    pub fn new<F>(hash: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(hash))
    }

    pub fn sha1() -> Self {
        Self::new(|input| hex::encode(Sha1::digest(input.as_bytes())))
    }

    pub fn hash(&self, input: &str) -> String {
        (self.0)(input)
    }
}

impl Default for FilenameHasher {
    fn default() -> Self {
        Self::sha1()
    }
}

impl fmt::Debug for FilenameHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilenameHasher")
    }
}

/// Percent-escapes every byte except ASCII alphanumerics and `_`.
///
/// Protects against `..`, absolute paths and `:`. The output never contains `-`, so segments
/// joined with `-` cannot be confused with one another.
fn write_path_segment(s: &str, out: &mut String) {
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            out.push(byte as char);
        } else {
            write!(out, "%{byte:02X}").unwrap();
        }
    }
}
