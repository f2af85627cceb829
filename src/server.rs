//! Listeners: accept connections on each route and start a session for each.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::{
    arg::RelayCli,
    codec::{Framing, FramingKind, HttpFraming, RawFraming},
    dupe::Dupe,
    parse_route::Route,
    session::{Session, SessionHandle, TcpConnector},
    timing::OptionalDuration,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinSet};
use tracing::{debug, error, info, warn};

/// How long to back off after `accept` fails, e.g. on file descriptor
/// exhaustion.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server Error
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to bind a route's listener
    #[error("failed to listen on {host}:{port}: {source}")]
    Bind {
        /// Local host
        host: String,
        /// Local port
        port: u16,
        /// Why binding failed
        #[source]
        source: std::io::Error,
    },
    /// A listener task died
    #[error("listener task failed: {0}")]
    Listener(#[from] tokio::task::JoinError),
    /// Failed to wait for Ctrl-C
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(std::io::Error),
}

/// Sessions that are still running, so they can be closed on shutdown.
#[derive(Debug, Default, Clone)]
pub struct SessionRegistry(Arc<RegistryInner>);

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    next_id: AtomicU64,
}

impl Dupe for SessionRegistry {}

impl SessionRegistry {
    /// Allocate a session id.
    pub fn next_id(&self) -> u64 {
        self.0.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, handle: SessionHandle) {
        self.0.sessions.lock().insert(handle.id(), handle);
    }

    fn remove(&self, id: u64) {
        self.0.sessions.lock().remove(&id);
    }

    /// Number of sessions still running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.sessions.lock().len()
    }

    /// Whether no session is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every running session.
    pub fn close_all(&self) {
        let sessions = self.0.sessions.lock();
        if !sessions.is_empty() {
            info!("closing {} sessions", sessions.len());
        }
        for handle in sessions.values() {
            handle.close();
        }
    }
}

/// Bind the route's local address.
pub async fn bind(route: &Route) -> Result<TcpListener, Error> {
    let (host, port) = &route.local;
    TcpListener::bind((host.as_str(), *port))
        .await
        .map_err(|source| Error::Bind {
            host: host.clone(),
            port: *port,
            source,
        })
}

/// Accept connections on `listener` forever, relaying each to the route's
/// remote endpoint.
#[tracing::instrument(skip(listener, route, registry), fields(route = %route), level = "debug")]
pub async fn serve_route(
    listener: TcpListener,
    route: Route,
    dial_timeout: OptionalDuration,
    registry: SessionRegistry,
) {
    match route.framing {
        FramingKind::Raw => {
            accept_loop(listener, &route, RawFraming, dial_timeout, registry).await;
        }
        FramingKind::Http => {
            accept_loop(listener, &route, HttpFraming, dial_timeout, registry).await;
        }
    }
}

async fn accept_loop<F: Framing + Copy>(
    listener: TcpListener,
    route: &Route,
    framing: F,
    dial_timeout: OptionalDuration,
    registry: SessionRegistry,
) {
    let (remote_host, remote_port) = &route.remote;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("failed to accept: {err}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY for {peer}: {err}");
        }
        let id = registry.next_id();
        debug!("session {id}: accepted {peer}");
        let session = Session::new(id, remote_host.as_str(), *remote_port, TcpConnector, framing)
            .with_dial_timeout(dial_timeout);
        registry.insert(session.handle());
        let registry = registry.dupe();
        tokio::spawn(async move {
            match session.start(stream).await {
                Ok(report) if report.is_clean() => debug!("session {id}: finished"),
                Ok(report) => debug!("session {id}: finished abnormally: {report:?}"),
                // Dial failures only affect this session
                Err(err) => warn!("session {id}: {err}"),
            }
            registry.remove(id);
        });
    }
}

/// Listen on every route until Ctrl-C, then close all sessions.
pub async fn relay_main(args: &RelayCli) -> Result<(), Error> {
    let registry = SessionRegistry::default();
    let mut listeners = JoinSet::new();
    for route in &args.routes {
        let listener = bind(route).await?;
        info!("Relaying {route}");
        listeners.spawn(serve_route(listener, route.clone(), args.dial_timeout, registry.dupe()));
    }
    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            signal.map_err(Error::Signal)
        }
        Some(joined) = listeners.join_next() => {
            error!("A listener stopped unexpectedly");
            joined.map_err(Error::from)
        }
    };
    listeners.abort_all();
    registry.close_all();
    result
}
