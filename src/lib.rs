//! A transparent, backpressured TCP relay.
//!
//! Each accepted connection becomes a [`session::Session`] that dials a fixed
//! remote endpoint and runs two [`pump`]s, one per direction. A pump only
//! reads the next chunk once the previous one has been flushed downstream,
//! and a failure on either leg tears the whole session down.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(rust_2018_idioms, missing_debug_implementations)]
#![warn(clippy::pedantic, clippy::cargo, clippy::unwrap_used)]
#![forbid(unsafe_code)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod arg;
pub mod codec;
pub mod config;
pub mod connection;
pub mod deadlock_detection;
pub mod dupe;
pub mod parse_route;
pub mod pump;
pub mod server;
pub mod session;
#[cfg(test)]
mod tests;
pub mod timing;

pub use crate::codec::{Framing, FramingKind, HttpFraming, RawFraming};
pub use crate::connection::{CloseHandle, Connection};
pub use crate::dupe::Dupe;
pub use crate::session::{Connector, Session, SessionHandle, SessionState, TcpConnector};
