//! End-to-end tests exercising the server, reactor, and client together
//! over real sockets.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use switchboard_core::shutdown::Shutdown;
use switchboard_core::transport::{
    Addr, CommandClient, CommandDispatcher, CommandServer, FramingMode, TransportConfig,
    TransportError, SHUTDOWN_STEPS,
};

fn unix_config(dir: &TempDir) -> TransportConfig {
    TransportConfig {
        addr: Addr::Unix(dir.path().join("switchboard.sock")),
        call_timeout_ms: 2000,
        ..Default::default()
    }
}

fn basic_dispatcher() -> CommandDispatcher {
    let mut dispatcher = CommandDispatcher::new();
    dispatcher
        .handle("ping", |_payload| async move { Ok(b"pong".to_vec()) })
        .unwrap();
    dispatcher
        .handle("echo", |payload| async move { Ok(payload) })
        .unwrap();
    dispatcher
        .handle("reverse", |mut payload: Vec<u8>| async move {
            payload.reverse();
            Ok(payload)
        })
        .unwrap();
    dispatcher
        .handle("slow", |payload| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(payload)
        })
        .unwrap();
    dispatcher
}

struct Harness {
    server: Arc<CommandServer>,
    shutdown: Arc<Shutdown>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(config: TransportConfig, dispatcher: CommandDispatcher) -> Self {
        let server = Arc::new(CommandServer::new(config, dispatcher).unwrap());
        let root = CancellationToken::new();
        let shutdown = Arc::new(Shutdown::new(&root, SHUTDOWN_STEPS).unwrap());

        let s = Arc::clone(&server);
        let sd = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            s.serve(&sd).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        Self {
            server,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.done("accept");
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .unwrap()
            .unwrap();
        assert!(self.shutdown.is_done("reactor"));
        assert!(self.shutdown.is_done("drain"));
    }
}

#[tokio::test]
async fn test_call_roundtrip_over_unix_socket() {
    let temp_dir = TempDir::new().unwrap();
    let config = unix_config(&temp_dir);
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = CommandClient::new(&config).unwrap();
    let handle = client.open(harness.server.addr()).await.unwrap();

    assert_eq!(client.call(handle, "ping", b"").await.unwrap(), b"pong");
    assert_eq!(
        client.call(handle, "echo", b"hello world").await.unwrap(),
        b"hello world"
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_sequential_calls_on_one_connection_keep_order() {
    let temp_dir = TempDir::new().unwrap();
    let config = unix_config(&temp_dir);
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = CommandClient::new(&config).unwrap();
    let handle = client.open(harness.server.addr()).await.unwrap();

    for i in 0..20 {
        let payload = format!("message-{i}");
        let reply = client.call(handle, "echo", payload.as_bytes()).await.unwrap();
        assert_eq!(reply, payload.as_bytes());
    }

    let reply = client.call(handle, "reverse", b"abc").await.unwrap();
    assert_eq!(reply, b"cba");

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_command_is_an_err_response_not_a_disconnect() {
    let temp_dir = TempDir::new().unwrap();
    let config = unix_config(&temp_dir);
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = CommandClient::new(&config).unwrap();
    let handle = client.open(harness.server.addr()).await.unwrap();

    let err = client.call(handle, "ghost", b"boo").await.unwrap_err();
    match err {
        TransportError::Remote(msg) => {
            assert!(msg.contains("unknown command"));
            assert!(msg.contains("ghost"));
        }
        other => panic!("expected Remote error, got {other:?}"),
    }

    // The same connection keeps working afterwards
    assert_eq!(client.call(handle, "ping", b"").await.unwrap(), b"pong");

    harness.stop().await;
}

#[tokio::test]
async fn test_concurrent_call_on_same_handle_is_busy() {
    let temp_dir = TempDir::new().unwrap();
    let config = unix_config(&temp_dir);
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = Arc::new(CommandClient::new(&config).unwrap());
    let handle = client.open(harness.server.addr()).await.unwrap();

    let slow_client = Arc::clone(&client);
    let slow = tokio::spawn(async move { slow_client.call(handle, "slow", b"payload").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client.call(handle, "ping", b"").await.unwrap_err();
    assert!(matches!(err, TransportError::Busy));

    // The in-flight call is unaffected
    assert_eq!(slow.await.unwrap().unwrap(), b"payload");

    // A second handle to the same server can overlap freely
    let other = client.open_new(harness.server.addr()).await.unwrap();
    assert_ne!(handle, other);
    assert_eq!(client.call(other, "ping", b"").await.unwrap(), b"pong");

    harness.stop().await;
}

#[tokio::test]
async fn test_timeout_poisons_the_connection() {
    let temp_dir = TempDir::new().unwrap();
    let config = unix_config(&temp_dir);
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = CommandClient::new(&config).unwrap();
    let handle = client.open(harness.server.addr()).await.unwrap();

    // "slow" takes 300ms; give it 50
    let err = client
        .call_with_timeout(handle, "slow", b"x", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout));

    // The handle is gone so the late response can never be mismatched
    let err = client.call(handle, "ping", b"").await.unwrap_err();
    assert!(matches!(err, TransportError::UnknownConnection(_)));

    // A fresh open dials a new connection and works
    let fresh = client.open(harness.server.addr()).await.unwrap();
    assert_ne!(fresh, handle);
    assert_eq!(client.call(fresh, "ping", b"").await.unwrap(), b"pong");

    harness.stop().await;
}

#[tokio::test]
async fn test_graceful_shutdown_completes_steps_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let config = unix_config(&temp_dir);
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = CommandClient::new(&config).unwrap();
    let handle = client.open(harness.server.addr()).await.unwrap();
    assert_eq!(client.call(handle, "ping", b"").await.unwrap(), b"pong");

    let socket_path = match harness.server.addr() {
        Addr::Unix(p) => p.clone(),
        Addr::Tcp(_) => unreachable!(),
    };
    assert!(socket_path.exists());

    harness.stop().await;

    // Socket file is removed on teardown
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn test_call_roundtrip_over_tcp() {
    // Bind to an ephemeral port first to find a free one
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let config = TransportConfig {
        addr: Addr::Tcp(addr),
        call_timeout_ms: 2000,
        ..Default::default()
    };
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = CommandClient::new(&config).unwrap();
    let handle = client.open(harness.server.addr()).await.unwrap();
    assert_eq!(
        client.call(handle, "echo", b"over tcp").await.unwrap(),
        b"over tcp"
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_telnet_eof_framing_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let config = TransportConfig {
        framing: FramingMode::TelnetEof,
        ..unix_config(&temp_dir)
    };
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = CommandClient::new(&config).unwrap();
    let handle = client.open(harness.server.addr()).await.unwrap();

    // Payload may contain CRLF freely under sentinel framing
    let payload = b"line one\r\nline two\r\n";
    assert_eq!(
        client.call(handle, "echo", payload).await.unwrap(),
        payload
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_oversized_request_rejected_client_side() {
    let temp_dir = TempDir::new().unwrap();
    let config = TransportConfig {
        max_message_size: 64,
        ..unix_config(&temp_dir)
    };
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = CommandClient::new(&config).unwrap();
    let handle = client.open(harness.server.addr()).await.unwrap();

    let big = vec![b'x'; 200];
    let err = client.call(handle, "echo", &big).await.unwrap_err();
    assert!(matches!(err, TransportError::Frame(_)));

    harness.stop().await;
}

#[tokio::test]
async fn test_many_connections_served_by_one_reactor() {
    let temp_dir = TempDir::new().unwrap();
    let config = unix_config(&temp_dir);
    let harness = Harness::start(config.clone(), basic_dispatcher()).await;

    let client = Arc::new(CommandClient::new(&config).unwrap());
    let mut calls = Vec::new();
    for i in 0..10 {
        let client = Arc::clone(&client);
        let addr = harness.server.addr().clone();
        calls.push(tokio::spawn(async move {
            let handle = client.open_new(&addr).await.unwrap();
            let payload = format!("peer-{i}");
            let reply = client.call(handle, "echo", payload.as_bytes()).await.unwrap();
            assert_eq!(reply, payload.as_bytes());
        }));
    }
    for call in calls {
        call.await.unwrap();
    }

    harness.stop().await;
}
