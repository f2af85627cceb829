//! One direction of a session.
//!
//! A pump reads a chunk, writes it, waits for the write to be flushed, and
//! only then asks for the next chunk. There is never more than one chunk in
//! flight, so a slow destination slows the source down instead of piling up
//! memory.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::connection::{ChunkReader, ChunkWriter, Leg, WriteError};
use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::{fmt::Display, io};
use tracing::{debug, error, trace};

/// Direction of a pump.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to remote
    Forward,
    /// Remote to client
    Backward,
}

impl Direction {
    /// Leg this direction reads from.
    #[must_use]
    pub const fn source(self) -> Leg {
        match self {
            Self::Forward => Leg::Inbound,
            Self::Backward => Leg::Outbound,
        }
    }

    /// Leg this direction writes to.
    #[must_use]
    pub const fn destination(self) -> Leg {
        match self {
            Self::Forward => Leg::Outbound,
            Self::Backward => Leg::Inbound,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.source(), self.destination())
    }
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum Termination {
    /// The source finished sending; the destination was closed on flush.
    SourceEof,
    /// The source was closed locally, by the other pump or the session.
    SourceClosed,
    /// A chunk arrived after the destination had already been closed.
    /// This is the normal drain path during teardown.
    DestinationInactive,
    /// Writing to the destination failed; both connections were closed.
    WriteFailed(WriteError),
    /// Reading from the source failed abruptly.
    UnexpectedTermination(io::Error),
    /// The pump panicked and was stopped at the session boundary.
    Panicked(String),
}

impl Termination {
    /// Whether this is an orderly shutdown rather than a failure.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(
            self,
            Self::SourceEof | Self::SourceClosed | Self::DestinationInactive
        )
    }
}

/// What one pump did before it stopped.
#[derive(Debug)]
pub struct PumpReport {
    /// Which way the pump moved data
    pub direction: Direction,
    /// Number of chunks written to the destination
    pub chunks: u64,
    /// Number of bytes written to the destination
    pub bytes: u64,
    /// Why it stopped
    pub termination: Termination,
}

/// Move chunks from `source` to `dest` until either side is done.
///
/// Never fails: every way of stopping is described by the returned
/// [`Termination`], and the connections have been closed accordingly by the
/// time this returns.
#[tracing::instrument(skip_all, level = "debug", fields(direction = %direction))]
pub async fn relay<R, W>(
    direction: Direction,
    mut source: ChunkReader<R>,
    mut dest: ChunkWriter<W>,
) -> PumpReport
where
    R: Stream<Item = io::Result<Bytes>> + Unpin,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    let mut chunks = 0;
    let mut bytes = 0;
    let termination = loop {
        let chunk = match source.read_next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                let termination = if source.close_handle().is_closed() {
                    trace!("{} closed", source.leg());
                    Termination::SourceClosed
                } else {
                    debug!("{} finished sending", source.leg());
                    Termination::SourceEof
                };
                dest.close_on_flush().await;
                break termination;
            }
            Err(err) => {
                error!("unexpected termination of {}: {err}", source.leg());
                dest.close_on_flush().await;
                break Termination::UnexpectedTermination(err);
            }
        };
        if !dest.is_active() {
            trace!("{} inactive, dropping {} bytes", dest.leg(), chunk.len());
            break Termination::DestinationInactive;
        }
        let len = chunk.len() as u64;
        match dest.write_chunk(chunk).await {
            Ok(()) => {
                chunks += 1;
                bytes += len;
            }
            Err(err) => {
                match &err {
                    WriteError::Closed => debug!("{} closed during write", dest.leg()),
                    WriteError::Io(err) => error!("failed to write to {}: {err}", dest.leg()),
                }
                dest.close_handle().close();
                source.close_handle().close();
                break Termination::WriteFailed(err);
            }
        }
    };
    debug!("relayed {chunks} chunks ({bytes} bytes)");
    PumpReport {
        direction,
        chunks,
        bytes,
        termination,
    }
}
