//! End-to-end tests over loopback TCP.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::{
    codec::FramingKind,
    dupe::Dupe,
    parse_route::Route,
    server::{self, SessionRegistry},
    timing::OptionalDuration,
};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
    crate::deadlock_detection::try_spawn_deadlock_detection();
}

/// Relay from an ephemeral local port to `127.0.0.1:remote_port`.
async fn start_relay(
    remote_port: u16,
    framing: FramingKind,
) -> (SocketAddr, SessionRegistry, JoinHandle<()>) {
    let route = Route {
        local: (String::from("127.0.0.1"), 0),
        remote: (String::from("127.0.0.1"), remote_port),
        framing,
    };
    let listener = server::bind(&route).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = SessionRegistry::default();
    let task = tokio::spawn(server::serve_route(
        listener,
        route,
        OptionalDuration::from_secs(2),
        registry.dupe(),
    ));
    (addr, registry, task)
}

/// A remote endpoint that echoes every connection back.
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rx, mut tx) = stream.split();
                tokio::io::copy(&mut rx, &mut tx).await.ok();
            });
        }
    });
    port
}

/// A port nothing listens on.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_until_idle(registry: &SessionRegistry) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions did not finish");
}

async fn wait_for_sessions(registry: &SessionRegistry, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions did not start");
}

/// Expect `stream` to be closed by the other end: EOF or a reset.
async fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
        .await
        .expect("connection was not closed");
    if result.is_ok() {
        assert!(rest.is_empty(), "unexpected data: {rest:?}");
    }
}

#[tokio::test]
async fn test_http_response_is_byte_identical() {
    setup_logging();
    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\nUser-Agent: test\r\n\r\n";
    const RESPONSE: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nbody";
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_port = remote.local_addr().unwrap().port();
    let remote_task = tokio::spawn(async move {
        let (mut stream, _) = remote.accept().await.unwrap();
        let mut request = vec![0u8; REQUEST.len()];
        stream.read_exact(&mut request).await.unwrap();
        stream.write_all(RESPONSE).await.unwrap();
        stream.shutdown().await.unwrap();
        request
    });
    let (addr, registry, relay) = start_relay(remote_port, FramingKind::Http).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(REQUEST).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, RESPONSE);
    assert_eq!(remote_task.await.unwrap(), REQUEST);
    wait_until_idle(&registry).await;
    relay.abort();
}

#[tokio::test]
async fn test_http_keepalive_with_large_bodies() {
    setup_logging();
    let body: Vec<u8> = (0..(256 * 1024)).map(|_| rand::random::<u8>()).collect();
    let mut request = format!(
        "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request.extend_from_slice(b"GET /next HTTP/1.1\r\nHost: localhost\r\n\r\n");
    let mut response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for piece in body.chunks(10_000) {
        response.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
        response.extend_from_slice(piece);
        response.extend_from_slice(b"\r\n");
    }
    response.extend_from_slice(b"0\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n");

    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_port = remote.local_addr().unwrap().port();
    let (expected_request, reply) = (request.clone(), response.clone());
    let remote_task = tokio::spawn(async move {
        let (mut stream, _) = remote.accept().await.unwrap();
        let mut received = vec![0u8; expected_request.len()];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected_request);
        stream.write_all(&reply).await.unwrap();
        // Keep the connection open until the client hangs up
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.ok();
    });
    let (addr, registry, relay) = start_relay(remote_port, FramingKind::Http).await;
    let client = TcpStream::connect(addr).await.unwrap();
    let (mut client_rx, mut client_tx) = client.into_split();
    let writer = tokio::spawn(async move {
        client_tx.write_all(&request).await.unwrap();
        client_tx
    });
    let mut received = vec![0u8; response.len()];
    tokio::time::timeout(Duration::from_secs(10), client_rx.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, response);
    drop(writer.await.unwrap());
    drop(client_rx);
    tokio::time::timeout(Duration::from_secs(5), remote_task)
        .await
        .unwrap()
        .unwrap();
    wait_until_idle(&registry).await;
    relay.abort();
}

#[tokio::test]
async fn test_dial_failure_closes_client() {
    setup_logging();
    let (addr, registry, relay) = start_relay(dead_port().await, FramingKind::Raw).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_closed(&mut client).await;
    wait_until_idle(&registry).await;
    // The listener keeps serving after a failed session
    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_closed(&mut client).await;
    relay.abort();
}

#[tokio::test]
async fn test_client_reset_closes_outbound() {
    setup_logging();
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_port = remote.local_addr().unwrap().port();
    let (addr, registry, relay) = start_relay(remote_port, FramingKind::Raw).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let (mut upstream, _) = remote.accept().await.unwrap();
    client.write_all(b"part one").await.unwrap();
    let mut received = [0u8; 8];
    upstream.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"part one");
    // Zero linger turns the close into a reset
    #[allow(deprecated)]
    client.set_linger(Some(Duration::ZERO)).unwrap();
    drop(client);
    assert_closed(&mut upstream).await;
    wait_until_idle(&registry).await;
    relay.abort();
}

#[tokio::test]
async fn test_client_reset_flushes_pending_write() {
    setup_logging();
    const PAYLOAD_LEN: usize = 64 * 1024 * 1024;
    const PIECE: usize = 64 * 1024;
    // Small receive buffer so the relay's write backs up quickly
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let remote = socket.listen(16).unwrap();
    let remote_port = remote.local_addr().unwrap().port();
    let (addr, registry, relay) = start_relay(remote_port, FramingKind::Raw).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let (mut upstream, _) = remote.accept().await.unwrap();
    #[allow(deprecated)]
    client.set_linger(Some(Duration::ZERO)).unwrap();
    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
    let written = Arc::new(AtomicUsize::new(0));
    let writer = {
        let (payload, written) = (payload.clone(), written.dupe());
        tokio::spawn(async move {
            for piece in payload.chunks(PIECE) {
                client.write_all(piece).await.unwrap();
                written.fetch_add(piece.len(), Ordering::Relaxed);
            }
        })
    };
    // Wait until the client can no longer write: every buffer on the way,
    // including the relay's pending write to `upstream`, is full.
    let mut last = usize::MAX;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = written.load(Ordering::Relaxed);
        if now == last {
            break;
        }
        last = now;
    }
    assert!(last < PAYLOAD_LEN, "the relay never applied backpressure");
    // Dropping the client with zero linger resets the connection
    writer.abort();
    assert!(writer.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), upstream.read_to_end(&mut received))
        .await
        .expect("outbound was not closed")
        .expect("outbound should end with a clean shutdown");
    assert!(!received.is_empty());
    assert!(received.len() <= last + PIECE);
    assert_eq!(received, payload[..received.len()]);
    wait_until_idle(&registry).await;
    relay.abort();
}

#[tokio::test]
async fn test_non_http_on_http_route() {
    setup_logging();
    let (addr, registry, relay) = start_relay(echo_server().await, FramingKind::Http).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    for message in [&b"HELLO\n"[..], b"PING\r\n", b"bye"] {
        client.write_all(message).await.unwrap();
        let mut echoed = vec![0u8; message.len()];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
            .await
            .expect("bytes held back by the framing")
            .unwrap();
        assert_eq!(echoed, message);
    }
    drop(client);
    wait_until_idle(&registry).await;
    relay.abort();
}

#[tokio::test]
async fn test_bare_lf_request_on_http_route() {
    setup_logging();
    const REQUEST: &[u8] = b"GET / HTTP/1.0\nHost: x\n\n";
    const RESPONSE: &[u8] = b"HTTP/1.0 200 OK\nContent-Length: 2\n\nhi";
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_port = remote.local_addr().unwrap().port();
    let remote_task = tokio::spawn(async move {
        let (mut stream, _) = remote.accept().await.unwrap();
        let mut request = vec![0u8; REQUEST.len()];
        stream.read_exact(&mut request).await.unwrap();
        stream.write_all(RESPONSE).await.unwrap();
        stream.shutdown().await.unwrap();
        request
    });
    let (addr, registry, relay) = start_relay(remote_port, FramingKind::Http).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(REQUEST).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut response))
        .await
        .expect("request held back by the framing")
        .unwrap();
    assert_eq!(response, RESPONSE);
    assert_eq!(remote_task.await.unwrap(), REQUEST);
    wait_until_idle(&registry).await;
    relay.abort();
}

#[tokio::test]
async fn test_raw_relay_large_transfer() {
    setup_logging();
    let (addr, registry, relay) = start_relay(echo_server().await, FramingKind::Raw).await;
    let input: Vec<u8> = (0..(1024 * 1024)).map(|_| rand::random::<u8>()).collect();
    let client = TcpStream::connect(addr).await.unwrap();
    let (mut client_rx, mut client_tx) = client.into_split();
    let to_send = input.clone();
    let writer = tokio::spawn(async move {
        client_tx.write_all(&to_send).await.unwrap();
        client_tx
    });
    let mut output = vec![0u8; input.len()];
    tokio::time::timeout(Duration::from_secs(10), client_rx.read_exact(&mut output))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(input, output);
    drop(writer.await.unwrap());
    drop(client_rx);
    wait_until_idle(&registry).await;
    relay.abort();
}

#[tokio::test]
async fn test_broken_session_does_not_affect_others() {
    setup_logging();
    let (addr, registry, relay) = start_relay(echo_server().await, FramingKind::Raw).await;
    let mut healthy = TcpStream::connect(addr).await.unwrap();
    let doomed = TcpStream::connect(addr).await.unwrap();
    wait_for_sessions(&registry, 2).await;
    #[allow(deprecated)]
    doomed.set_linger(Some(Duration::ZERO)).unwrap();
    drop(doomed);
    for round in 0..10u8 {
        let message = [round; 32];
        healthy.write_all(&message).await.unwrap();
        let mut echoed = [0u8; 32];
        healthy.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, message);
    }
    drop(healthy);
    wait_until_idle(&registry).await;
    relay.abort();
}

#[tokio::test]
async fn test_close_all_sessions() {
    setup_logging();
    let (addr, registry, relay) = start_relay(echo_server().await, FramingKind::Http).await;
    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    wait_for_sessions(&registry, 2).await;
    registry.close_all();
    assert_closed(&mut first).await;
    assert_closed(&mut second).await;
    wait_until_idle(&registry).await;
    relay.abort();
}
