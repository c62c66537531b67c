//! Assetcache.
//!
//! A command line front end to the asset cache. It fetches single assets through the full
//! cache pipeline and maintains the disk cache.

#![warn(missing_debug_implementations, clippy::all)]

mod cache;
mod cli;
mod fetch;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
