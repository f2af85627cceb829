//! A relay session: one accepted connection, one dialed connection, and the
//! two pumps between them.
//!
//! The session owns no buffers. It dials, installs the framing on both legs,
//! runs both pumps on the task that accepted the inbound connection, and makes
//! sure every connection is closed however it exits.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::{
    codec::Framing,
    connection::{CloseHandle, Connection, Leg},
    dupe::Dupe,
    pump::{self, Direction, PumpReport, Termination},
    timing::OptionalDuration,
};
use futures_util::FutureExt;
use std::{any::Any, future::Future, io, panic::AssertUnwindSafe};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a session. States only ever move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Created, not started
    Pending,
    /// Waiting for the remote endpoint to accept
    Dialing,
    /// Both pumps running
    Relaying,
    /// At least one pump has stopped
    Closing,
    /// Every connection is closed
    Closed,
}

/// Session error
#[derive(Debug, Error)]
pub enum Error {
    /// The remote endpoint could not be reached in time.
    /// The inbound connection has been closed.
    #[error("failed to dial {host}:{port}: {source}")]
    DialFailed {
        /// Remote host
        host: String,
        /// Remote port
        port: u16,
        /// Why dialing failed
        #[source]
        source: io::Error,
    },
    /// The session was closed before the remote endpoint answered.
    #[error("session closed while dialing")]
    Closed,
}

/// Ability to open outbound connections.
pub trait Connector: Send + Sync {
    /// Connection type produced by [`dial`](Self::dial).
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Make a single attempt to connect to `host:port`.
    fn dial(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Dials plain TCP.
#[derive(Debug, Default, Copy, Clone)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// What happened to a session that got as far as relaying.
#[derive(Debug)]
pub struct SessionReport {
    /// Client to remote
    pub forward: PumpReport,
    /// Remote to client
    pub backward: PumpReport,
}

impl SessionReport {
    /// Whether both directions shut down in an orderly fashion.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.forward.termination.is_clean() && self.backward.termination.is_clean()
    }
}

/// Observe or close a session from elsewhere.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    state: watch::Receiver<SessionState>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// Session id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Close every connection of the session. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the session reaches `state` or a later one.
    pub async fn wait_for(&mut self, state: SessionState) {
        // Only errors if the session was dropped, which means it is done
        self.state.wait_for(|current| *current >= state).await.ok();
    }
}

/// A relay session.
#[derive(Debug)]
pub struct Session<C, F> {
    id: u64,
    remote_host: String,
    remote_port: u16,
    connector: C,
    framing: F,
    dial_timeout: OptionalDuration,
    state: watch::Sender<SessionState>,
    /// Parent of both connections' close handles
    shutdown: CancellationToken,
}

/// Drives the session to `Closed` and closes both legs however `start` exits,
/// including when its future is dropped.
struct CloseGuard<'a> {
    state: &'a watch::Sender<SessionState>,
    shutdown: &'a CancellationToken,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        advance(self.state, SessionState::Closed);
    }
}

fn advance(state: &watch::Sender<SessionState>, next: SessionState) {
    state.send_if_modified(|current| {
        if next > *current {
            trace!("{current:?} -> {next:?}");
            *current = next;
            true
        } else {
            false
        }
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("unknown panic"))
}

impl<C: Connector, F: Framing> Session<C, F> {
    /// Create a pending session that will relay to `remote_host:remote_port`.
    pub fn new(
        id: u64,
        remote_host: impl Into<String>,
        remote_port: u16,
        connector: C,
        framing: F,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Pending);
        Self {
            id,
            remote_host: remote_host.into(),
            remote_port,
            connector,
            framing,
            dial_timeout: OptionalDuration::NONE,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    /// Give up dialing after `timeout`. A timeout counts as a dial failure.
    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: OptionalDuration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Session id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A handle that outlives `start` being called.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            state: self.state.subscribe(),
            shutdown: self.shutdown.dupe(),
        }
    }

    /// Close every connection of the session. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Dial the remote endpoint and relay between it and `inbound` until
    /// both directions have stopped.
    ///
    /// # Errors
    /// [`Error::DialFailed`] if the remote endpoint cannot be reached, and
    /// [`Error::Closed`] if the session is closed while dialing. In both cases
    /// `inbound` has been shut down and no pump was started.
    #[tracing::instrument(skip_all, fields(session = self.id), level = "debug")]
    pub async fn start<T>(self, inbound: T) -> Result<SessionReport, Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let _guard = CloseGuard {
            state: &self.state,
            shutdown: &self.shutdown,
        };
        advance(&self.state, SessionState::Dialing);
        trace!("dialing {}:{}", self.remote_host, self.remote_port);
        let dial = self
            .dial_timeout
            .timeout(self.connector.dial(&self.remote_host, self.remote_port));
        let dialed = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            result = dial => Some(result.unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()))),
        };
        let outbound = match dialed {
            Some(Ok(outbound)) => outbound,
            Some(Err(source)) => {
                warn!("failed to dial {}:{}: {source}", self.remote_host, self.remote_port);
                self.abandon(inbound).await;
                return Err(Error::DialFailed {
                    host: self.remote_host,
                    port: self.remote_port,
                    source,
                });
            }
            None => {
                debug!("closed while dialing");
                self.abandon(inbound).await;
                return Err(Error::Closed);
            }
        };
        info!("relaying to {}:{}", self.remote_host, self.remote_port);
        advance(&self.state, SessionState::Relaying);

        let inbound = Connection::framed(
            inbound,
            self.framing.inbound_codec(),
            Leg::Inbound,
            CloseHandle::child_of(&self.shutdown),
        );
        let outbound = Connection::framed(
            outbound,
            self.framing.outbound_codec(),
            Leg::Outbound,
            CloseHandle::child_of(&self.shutdown),
        );
        let (inbound_rx, inbound_tx) = inbound.split();
        let (outbound_rx, outbound_tx) = outbound.split();
        let forward = self.catch_pump(
            Direction::Forward,
            pump::relay(Direction::Forward, inbound_rx, outbound_tx),
        );
        let backward = self.catch_pump(
            Direction::Backward,
            pump::relay(Direction::Backward, outbound_rx, inbound_tx),
        );
        let (forward, backward) = tokio::join!(forward, backward);
        debug!(
            "done: {} bytes forward, {} bytes backward",
            forward.bytes, backward.bytes
        );
        Ok(SessionReport { forward, backward })
    }

    /// Close an inbound connection that never got a peer.
    async fn abandon<T: AsyncWrite + Unpin>(&self, mut inbound: T) {
        if let Err(err) = inbound.shutdown().await {
            trace!("error shutting down inbound: {err}");
        }
        drop(inbound);
        self.shutdown.cancel();
        advance(&self.state, SessionState::Closed);
    }

    /// Run a pump, turning a panic into a torn-down session rather than a
    /// dead task.
    async fn catch_pump(
        &self,
        direction: Direction,
        pump: impl Future<Output = PumpReport>,
    ) -> PumpReport {
        let report = match AssertUnwindSafe(pump).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{direction} pump panicked: {message}");
                self.shutdown.cancel();
                PumpReport {
                    direction,
                    chunks: 0,
                    bytes: 0,
                    termination: Termination::Panicked(message),
                }
            }
        };
        advance(&self.state, SessionState::Closing);
        report
    }
}
