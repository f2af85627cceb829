//! Command line arguments parsing.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::{config, parse_route::Route, timing::OptionalDuration};
use clap::{ArgAction, Parser, arg, command};
use std::sync::OnceLock;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct RelayCli {
    /// Routes to relay, each of which comes in the form:
    /// ```text
    /// <local-host>:<local-port>:<remote-host>:<remote-port>/<framing>
    /// ```
    /// - local-host defaults to `0.0.0.0` (all interfaces).
    ///
    /// - local-port defaults to remote-port.
    ///
    /// - remote-host defaults to `127.0.0.1`.
    ///
    /// - framing is `http` (default) or `raw`. It only decides where
    ///   messages are cut when relaying; the bytes are never changed.
    ///
    /// example routes:
    /// ```text
    /// 3000
    ///
    /// example.com:80
    ///
    /// 8080:example.com:80
    ///
    /// 127.0.0.1:2222:10.0.0.5:22/raw
    /// ```
    #[arg(num_args = 1.., required = true)]
    pub routes: Vec<Route>,
    /// Timeout for connecting to the remote endpoint (in seconds).
    /// A value of 0 disables the timeout.
    #[arg(long, default_value = config::DEFAULT_DIAL_TIMEOUT)]
    pub dial_timeout: OptionalDuration,
    /// Level of verbosity
    #[arg(short, long, conflicts_with = "quiet", action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Level of quietness
    #[arg(short, long, conflicts_with = "verbose", action = ArgAction::Count, global = true)]
    pub quiet: u8,
}

/// Global args to avoid cloning
pub static ARGS: OnceLock<RelayCli> = OnceLock::new();

impl RelayCli {
    /// Obtain reference to the global static instance
    ///
    /// # Panics
    /// Panics if `ARGS` is not initialized
    pub fn get_global() -> &'static Self {
        ARGS.get().expect("ARGS is not initialized (this is a bug)")
    }

    /// Parse command line arguments and set the global static instance
    ///
    /// # Panics
    /// Panics if `ARGS` is already initialized
    pub fn parse_global() {
        ARGS.set(Self::parse())
            .expect("`parse_global` should not be called twice (this is a bug)");
    }
}
