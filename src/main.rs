//! A transparent, backpressured TCP relay.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]
#![warn(clippy::pedantic, clippy::cargo, clippy::unwrap_used)]
#![forbid(unsafe_code)]

use penguin_relay::{arg, deadlock_detection, server};
use thiserror::Error;
use tracing::trace;
use tracing_subscriber::{filter, fmt, prelude::*, reload};

/// Errors
#[derive(Error)]
enum Error {
    /// The relay failed to start or stopped unexpectedly
    #[error(transparent)]
    Server(#[from] server::Error),
}

impl std::fmt::Debug for Error {
    // Simply delegate to `Display` so when `main` exits, there
    // is a nice error message.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

const QUIET_QUIET_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::ERROR;
const QUIET_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::WARN;
const DEFAULT_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::INFO;
const VERBOSE_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::DEBUG;
const VERBOSE_VERBOSE_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::TRACE;

/// Pick the log level from `-v`/`-q` counts.
const fn log_level(verbose: u8, quiet: u8) -> filter::LevelFilter {
    match (verbose, quiet) {
        (0, 0) => DEFAULT_LOG_LEVEL,
        (0, 1) => QUIET_LOG_LEVEL,
        (0, _) => QUIET_QUIET_LOG_LEVEL,
        (1, _) => VERBOSE_LOG_LEVEL,
        (_, _) => VERBOSE_VERBOSE_LOG_LEVEL,
    }
}

#[tokio::main]
/// Entry point
async fn main() -> Result<(), Box<Error>> {
    let (level_layer, reload_handle) = reload::Layer::new(DEFAULT_LOG_LEVEL);
    let fmt_layer = fmt::Layer::default()
        .compact()
        .with_timer(fmt::time::time())
        .with_writer(std::io::stderr)
        .with_filter(level_layer);
    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::registry().with(fmt_layer).init();
    #[cfg(feature = "tokio-console")]
    tracing_subscriber::registry()
        .with(console_subscriber::spawn())
        .with(fmt_layer)
        .init();
    arg::RelayCli::parse_global();
    let cli_args = arg::RelayCli::get_global();
    trace!("cli_args = {cli_args:#?}");
    let level = log_level(cli_args.verbose, cli_args.quiet);
    if level != DEFAULT_LOG_LEVEL {
        reload_handle
            .reload(level)
            .expect("Resetting log level failed (this is a bug)");
    }
    deadlock_detection::try_spawn_deadlock_detection();
    server::relay_main(cli_args)
        .await
        .map_err(|e| Box::new(e.into()))?;
    Ok(())
}

#[cfg(all(feature = "tokio-console", feature = "remove-logging"))]
compile_error!("tokio-console without trace-level logging is likely not desired");
