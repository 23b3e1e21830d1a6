//! Reconnection and queueing behaviour of the transport connection
//!
//! The backend drops sockets on purpose and counts how many the client opens
//! afterwards, or floods and starves the client to exercise its bounded queues.

mod common;

use std::time::Duration;

use autowire::constants::{EVENT_QUEUE_CAPACITY, OUTBOUND_QUEUE_CAPACITY};
use autowire::{
    ConnectOptions, Connection, ConnectionEvent, ConnectionState, Error, ReconnectPolicy,
};
use common::{within, MockBackend};
use serde_json::json;

const RETRY: Duration = Duration::from_millis(200);

fn options(backend: &MockBackend, reconnect: ReconnectPolicy) -> ConnectOptions {
    ConnectOptions::new(backend.ws_url("/ws")).with_reconnect(reconnect)
}

#[tokio::test]
async fn test_abrupt_close_schedules_exactly_one_reconnect() {
    let mut backend = MockBackend::start().await;
    let (conn, mut events) = Connection::open(options(
        &backend,
        ReconnectPolicy::Fixed {
            delay_ms: RETRY.as_millis() as u64,
        },
    ));

    let first = backend.accept().await;
    assert_eq!(
        within(events.recv()).await,
        Some(ConnectionEvent::Opened { generation: 1 })
    );

    first.drop_abruptly();
    match within(events.recv()).await {
        Some(ConnectionEvent::Closed {
            generation,
            retry_in,
            ..
        }) => {
            assert_eq!(generation, 1);
            assert_eq!(retry_in, Some(RETRY));
        }
        other => panic!("expected Closed, got {other:?}"),
    }

    let _second = backend.accept().await;
    assert_eq!(
        within(events.recv()).await,
        Some(ConnectionEvent::Opened { generation: 2 })
    );
    assert_eq!(conn.state(), ConnectionState::Open { generation: 2 });

    // Several retry periods later, still exactly two sockets.
    assert!(backend.try_accept(RETRY * 4).await.is_none());
    assert_eq!(backend.connection_count(), 2);
    assert!(events.try_recv().is_err());

    conn.close();
}

#[tokio::test]
async fn test_frames_flow_again_after_reconnect() {
    let mut backend = MockBackend::start().await;
    let (conn, mut events) = Connection::open(options(
        &backend,
        ReconnectPolicy::Fixed { delay_ms: 50 },
    ));

    let first = backend.accept().await;
    within(conn.wait_open()).await.unwrap();
    first.drop_abruptly();

    let mut second = backend.accept().await;
    within(async {
        while conn.generation() < 2 || !conn.is_open() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    conn.send_frame(&json!({"type": "hello"})).unwrap();
    assert_eq!(second.recv_json().await, Some(json!({"type": "hello"})));

    second.send_json(json!({"event": "pushed"})).await;
    loop {
        match within(events.recv()).await {
            Some(ConnectionEvent::Frame(frame)) => {
                assert_eq!(frame, json!({"event": "pushed"}));
                break;
            }
            Some(_) => {}
            None => panic!("event stream ended"),
        }
    }
    conn.close();
}

#[tokio::test]
async fn test_explicit_close_never_reconnects() {
    let mut backend = MockBackend::start().await;
    let (conn, mut events) = Connection::open(options(
        &backend,
        ReconnectPolicy::Fixed { delay_ms: 50 },
    ));

    let mut peer = backend.accept().await;
    assert_eq!(
        within(events.recv()).await,
        Some(ConnectionEvent::Opened { generation: 1 })
    );

    conn.close();
    match within(events.recv()).await {
        Some(ConnectionEvent::Closed {
            code, retry_in, ..
        }) => {
            assert_eq!(code, 1000);
            assert_eq!(retry_in, None);
        }
        other => panic!("expected Closed, got {other:?}"),
    }
    assert!(peer.recv_json().await.is_none());

    assert!(backend.try_accept(Duration::from_millis(300)).await.is_none());
    assert_eq!(backend.connection_count(), 1);
    assert!(conn.state().is_closed());
    assert_eq!(within(events.recv()).await, None);
}

#[tokio::test]
async fn test_never_policy_gives_up_after_loss() {
    let mut backend = MockBackend::start().await;
    let (conn, mut events) = Connection::open(options(&backend, ReconnectPolicy::Never));

    let peer = backend.accept().await;
    within(conn.wait_open()).await.unwrap();
    peer.drop_abruptly();

    loop {
        match within(events.recv()).await {
            Some(ConnectionEvent::Closed { retry_in, .. }) => {
                assert_eq!(retry_in, None);
                break;
            }
            Some(_) => {}
            None => panic!("expected Closed before the stream ended"),
        }
    }
    within(async {
        while !conn.state().is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(backend.try_accept(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_initial_connect_failure_is_retried() {
    let url = common::closed_port_url().await.replace("http://", "ws://");
    let (conn, mut events) = Connection::open(
        ConnectOptions::new(format!("{url}/ws"))
            .with_reconnect(ReconnectPolicy::Fixed { delay_ms: 50 }),
    );

    for _ in 0..2 {
        match within(events.recv()).await {
            Some(ConnectionEvent::ConnectFailed { retry_in, .. }) => {
                assert_eq!(retry_in, Some(Duration::from_millis(50)));
            }
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }
    assert!(!conn.is_open());
    conn.close();
}

#[tokio::test]
async fn test_full_outbound_queue_rejects_instead_of_growing() {
    let mut backend = MockBackend::start().await;
    let (conn, _events) = Connection::open(options(&backend, ReconnectPolicy::Never));
    let _peer = backend.accept().await;
    within(conn.wait_open()).await.unwrap();

    // No await in between, so the socket task cannot drain the queue.
    for n in 0..OUTBOUND_QUEUE_CAPACITY {
        assert_eq!(conn.send_frame(&json!({"n": n})), Ok(()));
    }
    assert_eq!(conn.send_frame(&json!({"n": "over"})), Err(Error::QueueFull));
    conn.close();
}

#[tokio::test]
async fn test_slow_consumer_loses_no_frames() {
    let mut backend = MockBackend::start().await;
    let (conn, mut events) = Connection::open(options(&backend, ReconnectPolicy::Never));
    let mut peer = backend.accept().await;
    assert_eq!(
        within(events.recv()).await,
        Some(ConnectionEvent::Opened { generation: 1 })
    );

    let total = EVENT_QUEUE_CAPACITY * 3;
    let flood = tokio::spawn(async move {
        for n in 0..total {
            peer.send_json(json!({"event": "tick", "n": n})).await;
        }
        peer
    });

    // Let the queue fill up before draining it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for n in 0..total {
        match within(events.recv()).await {
            Some(ConnectionEvent::Frame(frame)) => assert_eq!(frame["n"], n),
            other => panic!("expected frame {n}, got {other:?}"),
        }
    }

    let _peer = within(flood).await.unwrap();
    assert!(conn.is_open());
    conn.close();
}
