//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use assetcache_service::caching::{ContentMode, DrawRecipe};
use assetcache_service::config::Config;
use assetcache_service::metrics;
use clap::{Args, Parser, Subcommand, ValueEnum};
use url::Url;

use crate::cache;
use crate::fetch;
use crate::logging;

/// Asset cache commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch one asset through the cache and write it out.
    Fetch(FetchArgs),

    /// Trim the disk cache down to `max_disk_bytes`.
    Trim {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every asset from the disk cache.
    Clear,
}

/// How a fetched asset is fitted into the requested size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    #[default]
    Fill,
    AspectFit,
    AspectFill,
    Center,
}

impl From<Mode> for ContentMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fill => ContentMode::Fill,
            Mode::AspectFit => ContentMode::AspectFit,
            Mode::AspectFill => ContentMode::AspectFill,
            Mode::Center => ContentMode::Center,
        }
    }
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// The URL of the asset.
    pub url: Url,

    /// Render the asset at this width.
    #[arg(long, requires = "height")]
    pub width: Option<f64>,

    /// Render the asset at this height.
    #[arg(long, requires = "width")]
    pub height: Option<f64>,

    /// How to fit the asset into the rendered size.
    #[arg(long, value_enum, default_value_t)]
    pub mode: Mode,

    /// Write the asset to this file instead of `stdout`.
    #[arg(long, short, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl FetchArgs {
    /// The recipe for the requested variant, or `None` for the asset as fetched.
    pub fn recipe(&self) -> Option<DrawRecipe> {
        let (width, height) = self.width.zip(self.height)?;
        Some(DrawRecipe::new(width, height).with_mode(self.mode.into()))
    }
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "assetcache", version)]
pub struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned at this point.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Fetch(args) => fetch::run(&config, &args).context("failed to fetch asset")?,
        Command::Trim { dry_run } => cache::trim(&config, dry_run).context("failed to trim cache")?,
        Command::Clear => cache::clear(&config).context("failed to clear cache")?,
    }

    Ok(())
}
