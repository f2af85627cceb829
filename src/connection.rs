//! Connections as the pumps see them: a chunk source, a chunk sink, and a
//! close flag shared by both.
//!
//! Closing is the only way to cancel anything. Once a connection's
//! [`CloseHandle`] is closed, a pending [`ChunkReader::read_next_chunk`]
//! resolves to end-of-stream and a pending [`ChunkWriter::write_chunk`]
//! fails with [`WriteError::Closed`], whichever pump happens to be waiting on
//! it.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::{config, dupe::Dupe};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt::Display, io};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::{
    codec::{Decoder, Encoder, FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, trace};

/// Which side of a session a connection is on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Leg {
    /// The accepted, client-facing connection
    Inbound,
    /// The dialed, remote-facing connection
    Outbound,
}

impl Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        })
    }
}

/// Shared "this connection is closed" flag.
///
/// Closing is idempotent and may be done from either pump.
#[derive(Clone, Debug, Default)]
pub struct CloseHandle(CancellationToken);

impl Dupe for CloseHandle {}

impl CloseHandle {
    /// A fresh, open handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that is also closed when `parent` is cancelled.
    #[must_use]
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self(parent.child_token())
    }

    /// Mark the connection closed. Calling this again is a no-op.
    pub fn close(&self) {
        self.0.cancel();
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.0.cancelled().await;
    }
}

/// Failure to hand a chunk to a connection.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The connection was closed before or during the write
    #[error("connection closed")]
    Closed,
    /// The underlying write or flush failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read side of a [`FramedConnection`].
pub type FramedSource<T, C> = FramedRead<ReadHalf<T>, C>;
/// Write side of a [`FramedConnection`].
pub type FramedSink<T, C> = FramedWrite<WriteHalf<T>, C>;
/// A byte stream with a codec installed on both halves.
pub type FramedConnection<T, C> = Connection<FramedSource<T, C>, FramedSink<T, C>>;

/// A full-duplex connection, before it is handed to the pumps.
#[derive(Debug)]
pub struct Connection<R, W> {
    reader: ChunkReader<R>,
    writer: ChunkWriter<W>,
}

impl<T, C> FramedConnection<T, C>
where
    T: AsyncRead + AsyncWrite,
    C: Decoder + Encoder<Bytes> + Clone,
{
    /// Split `io` and install `codec` on both halves.
    pub fn framed(io: T, codec: C, leg: Leg, handle: CloseHandle) -> Self {
        let (rx, tx) = tokio::io::split(io);
        let source = FramedRead::with_capacity(rx, codec.clone(), config::READ_BUFFER_SIZE);
        let sink = FramedWrite::new(tx, codec);
        Self::from_parts(source, sink, leg, handle)
    }
}

impl<R, W> Connection<R, W> {
    /// Assemble a connection from an arbitrary chunk stream and sink.
    pub fn from_parts(source: R, sink: W, leg: Leg, handle: CloseHandle) -> Self {
        Self {
            reader: ChunkReader {
                stream: source,
                handle: handle.dupe(),
                leg,
            },
            writer: ChunkWriter { sink, handle, leg },
        }
    }

    /// The handle that closes this connection.
    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        self.writer.handle.dupe()
    }

    /// Hand out the two halves. Each goes to a different pump.
    pub fn split(self) -> (ChunkReader<R>, ChunkWriter<W>) {
        (self.reader, self.writer)
    }
}

/// Read half of a connection.
#[derive(Debug)]
pub struct ChunkReader<R> {
    stream: R,
    handle: CloseHandle,
    leg: Leg,
}

impl<R> ChunkReader<R> {
    /// Which side of the session this reads from.
    #[must_use]
    pub const fn leg(&self) -> Leg {
        self.leg
    }

    /// The handle shared with the write half of the same connection.
    #[must_use]
    pub const fn close_handle(&self) -> &CloseHandle {
        &self.handle
    }
}

impl<R> ChunkReader<R>
where
    R: Stream<Item = io::Result<Bytes>> + Unpin,
{
    /// Wait for the next chunk.
    ///
    /// `Ok(None)` means the peer finished sending or the connection was
    /// closed locally. Either way there is nothing more to read.
    pub async fn read_next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.handle.is_closed() {
            return Ok(None);
        }
        let handle = &self.handle;
        let stream = &mut self.stream;
        tokio::select! {
            biased;
            () = handle.closed() => {
                trace!("{} closed while reading", self.leg);
                Ok(None)
            }
            next = stream.next() => next.transpose(),
        }
    }
}

/// Write half of a connection.
#[derive(Debug)]
pub struct ChunkWriter<W> {
    sink: W,
    handle: CloseHandle,
    leg: Leg,
}

impl<W> ChunkWriter<W> {
    /// Which side of the session this writes to.
    #[must_use]
    pub const fn leg(&self) -> Leg {
        self.leg
    }

    /// The handle shared with the read half of the same connection.
    #[must_use]
    pub const fn close_handle(&self) -> &CloseHandle {
        &self.handle
    }

    /// Whether the connection can still accept writes.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.handle.is_closed()
    }
}

impl<W> ChunkWriter<W>
where
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    /// Write one chunk and wait until it has been flushed.
    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), WriteError> {
        if self.handle.is_closed() {
            return Err(WriteError::Closed);
        }
        let handle = &self.handle;
        let sink = &mut self.sink;
        tokio::select! {
            biased;
            () = handle.closed() => Err(WriteError::Closed),
            result = sink.send(chunk) => Ok(result?),
        }
    }

    /// Close after everything already written has gone out.
    ///
    /// Sends an empty chunk through the sink, and only once that flush
    /// completes shuts the write side down and marks the connection closed.
    /// No-op if the connection is already closed.
    pub async fn close_on_flush(&mut self) {
        if self.handle.is_closed() {
            trace!("{} already closed", self.leg);
            return;
        }
        let handle = &self.handle;
        let sink = &mut self.sink;
        let result = tokio::select! {
            biased;
            () = handle.closed() => Ok(()),
            result = async {
                sink.send(Bytes::new()).await?;
                sink.close().await
            } => result,
        };
        if let Err(err) = result {
            debug!("error flushing {} before close: {err}", self.leg);
        }
        self.handle.close();
        trace!("{} closed on flush", self.leg);
    }
}
