//! End-to-end scenarios over real sockets: a client connects, sends the
//! streaming request, and observes either an HTTP rejection or the raw
//! handshake on the same connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use roost_config::{
    Config, CredentialKind, CredentialSection, HttpSettings, NodeSettings, ReceiverOverrides,
    StreamCredentials, StreamSettings,
};
use roost_server::constants::{
    START_STREAMING_ERROR_ALREADY_STREAMING, START_STREAMING_ERROR_BUSY_TRY_LATER,
    START_STREAMING_ERROR_NOT_PERMITTED, START_STREAMING_ERROR_SAME_LOCALHOST,
    START_STREAMING_PROMPT_VN,
};
use roost_server::receiver::{StreamHandshake, SystemInfo};
use roost_server::registry::{CreateHost, HostInfo, ReceiverHandle};
use roost_server::{HttpServer, ServiceState};
use roost_system::Service;

const API_KEY: &str = "11111111-2222-3333-4444-555555555555";
const MACHINE: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
const LOCALHOST_GUID: &str = "deadbeef-0000-4000-8000-000000000001";

fn enabled_credentials() -> StreamCredentials {
    let mut creds = StreamCredentials::default();
    creds.insert(
        API_KEY.parse().unwrap(),
        CredentialSection {
            kind: CredentialKind::Api,
            enabled: Some(true),
            allow_from: None,
            overrides: ReceiverOverrides::default(),
        },
    );
    creds
}

async fn start_server(
    credentials: StreamCredentials,
    rate_limit_secs: i64,
) -> (ServiceState, SocketAddr) {
    let http = HttpSettings {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    let stream = StreamSettings {
        rate_limit_secs,
        ..Default::default()
    };
    let node = NodeSettings {
        hostname: Some("parent".to_owned()),
        machine_guid: Some(LOCALHOST_GUID.parse().unwrap()),
    };

    let config = Arc::new(Config::from_values(http, stream, node));
    let state = ServiceState::start(config.clone(), Arc::new(credentials));

    let server = HttpServer::new(config, state.clone()).unwrap();
    let addr = server.local_addr().unwrap();
    server.start();

    (state, addr)
}

async fn stream_request(addr: SocketAddr, query: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /stream?{query} HTTP/1.1\r\nHost: parent\r\nUser-Agent: roost-child/2.1.0\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

/// Reads a full HTTP response; the server closes rejected connections.
async fn read_http_response(stream: &mut TcpStream) -> (u16, String) {
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("timed out reading the response")
        .unwrap();

    let text = String::from_utf8_lossy(&buf).into_owned();
    assert!(text.starts_with("HTTP/1.1 "), "not an HTTP response: {text}");

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("no status code");
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_owned())
        .unwrap_or_default();

    (status, body)
}

/// Reads whatever arrives next on the raw stream.
async fn read_raw_chunk(stream: &mut TcpStream) -> String {
    let mut buf = vec![0u8; 2048];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("timed out reading the stream")
        .unwrap();
    String::from_utf8_lossy(&buf[..read]).into_owned()
}

fn valid_query() -> String {
    format!("key={API_KEY}&hostname=child-1&machine_guid={MACHINE}&ver=8")
}

#[tokio::test]
async fn missing_api_key_is_denied_uniformly() {
    let (_state, addr) = start_server(enabled_credentials(), 0).await;

    let mut stream = stream_request(addr, &format!("hostname=child-1&machine_guid={MACHINE}")).await;
    let (status, body) = read_http_response(&mut stream).await;

    assert_eq!(status, 401);
    assert_eq!(body, START_STREAMING_ERROR_NOT_PERMITTED);
}

#[tokio::test]
async fn unknown_child_with_enabled_key_completes_the_handshake() {
    let (state, addr) = start_server(enabled_credentials(), 0).await;

    let mut stream = stream_request(addr, &valid_query()).await;
    let response = read_raw_chunk(&mut stream).await;

    // ver=8 announces a capability bitset, so the prompt is versioned.
    assert!(
        response.starts_with(START_STREAMING_PROMPT_VN),
        "unexpected handshake: {response}"
    );

    let machine: Uuid = MACHINE.parse().unwrap();
    let host = state.registry().find_by_guid(&machine).expect("host created");
    assert_eq!(host.hostname(), "child-1");
    assert!(host.receiver_handle().is_some());
    assert_eq!(host.info().program_name, "roost-child");
    assert_eq!(host.info().program_version, "2.1.0");
}

#[tokio::test]
async fn second_connection_for_a_working_host_conflicts() {
    let (_state, addr) = start_server(enabled_credentials(), 0).await;

    // First child connects and stays.
    let mut first = stream_request(addr, &valid_query()).await;
    let response = read_raw_chunk(&mut first).await;
    assert!(response.starts_with(START_STREAMING_PROMPT_VN));

    // The duplicate is rejected over HTTP without touching the first.
    let mut second = stream_request(addr, &valid_query()).await;
    let (status, body) = read_http_response(&mut second).await;

    assert_eq!(status, 409);
    assert_eq!(body, START_STREAMING_ERROR_ALREADY_STREAMING);
}

#[tokio::test]
async fn stale_receiver_is_preempted() {
    let (state, addr) = start_server(enabled_credentials(), 0).await;
    let machine: Uuid = MACHINE.parse().unwrap();

    // A previous receiver that stopped feeding 45 seconds ago.
    let mut none: Option<SystemInfo> = None;
    let host = state
        .registry()
        .find_or_create(
            CreateHost {
                machine_guid: machine,
                info: HostInfo {
                    hostname: "child-1".to_owned(),
                    ..Default::default()
                },
            },
            &mut none,
        )
        .unwrap();

    let stale = ReceiverHandle::new();
    stale.rewind_last_msg(45);
    assert!(state.registry().set_receiver(&host, stale.clone()));

    // It cooperates with the stop protocol the way a worker does.
    {
        let stale = stale.clone();
        let host = host.clone();
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                if stale.stop_requested().is_some() {
                    state.registry().clear_receiver(&host, &stale);
                    stale.mark_exited();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    let mut stream = stream_request(addr, &valid_query()).await;
    let response = read_raw_chunk(&mut stream).await;

    assert!(
        response.starts_with(START_STREAMING_PROMPT_VN),
        "preemption did not complete: {response}"
    );
    assert_eq!(
        stale.stop_requested(),
        Some(StreamHandshake::DisconnectStaleReceiver)
    );

    // The slot now belongs to the new connection.
    let current = host.receiver_handle().expect("new receiver attached");
    assert!(!Arc::ptr_eq(&current, &stale));
}

#[tokio::test]
async fn streaming_to_yourself_is_told_in_band() {
    let (_state, addr) = start_server(enabled_credentials(), 0).await;

    let query = format!("key={API_KEY}&hostname=parent&machine_guid={LOCALHOST_GUID}");
    let mut stream = stream_request(addr, &query).await;
    let response = read_raw_chunk(&mut stream).await;

    // The rejection rides on the stream socket, not on an HTTP response.
    assert!(!response.starts_with("HTTP/"));
    assert_eq!(response, START_STREAMING_ERROR_SAME_LOCALHOST);
}

#[tokio::test]
async fn rate_gate_rejects_as_busy() {
    let (_state, addr) = start_server(enabled_credentials(), 1000).await;

    // The gate seeds itself on first use, so this connection is deferred.
    let mut stream = stream_request(addr, &valid_query()).await;
    let (status, body) = read_http_response(&mut stream).await;

    assert_eq!(status, 503);
    assert_eq!(body, START_STREAMING_ERROR_BUSY_TRY_LATER);
}

#[tokio::test]
async fn shutdown_turns_connections_away_as_busy() {
    let (state, addr) = start_server(enabled_credentials(), 0).await;
    state.shutdown_streaming();

    let mut stream = stream_request(addr, &valid_query()).await;
    let (status, body) = read_http_response(&mut stream).await;

    assert_eq!(status, 503);
    assert_eq!(body, START_STREAMING_ERROR_BUSY_TRY_LATER);
}

#[tokio::test]
async fn legacy_children_get_the_version_one_prompt() {
    let (_state, addr) = start_server(enabled_credentials(), 0).await;

    let query = format!(
        "key={API_KEY}&hostname=child-1&machine_guid={MACHINE}&NETDATA_PROTOCOL_VERSION=1"
    );
    let mut stream = stream_request(addr, &query).await;
    let response = read_raw_chunk(&mut stream).await;

    assert_eq!(response, roost_server::constants::START_STREAMING_PROMPT_V1);
}

#[tokio::test]
async fn backfilling_parents_reject_in_band() {
    let (state, addr) = start_server(enabled_credentials(), 0).await;
    state.registry().set_accepting_children(false);

    // Admission passed and the socket was taken over, so the rejection
    // arrives raw on the stream.
    let mut stream = stream_request(addr, &valid_query()).await;
    let response = read_raw_chunk(&mut stream).await;

    assert_eq!(
        response,
        roost_server::constants::START_STREAMING_ERROR_INITIALIZATION
    );

    // The host was created, but nothing is attached to it.
    let machine: Uuid = MACHINE.parse().unwrap();
    let host = state.registry().find_by_guid(&machine).unwrap();
    assert!(host.receiver_handle().is_none());
}

#[tokio::test]
async fn unknown_paths_get_not_found() {
    let (_state, addr) = start_server(enabled_credentials(), 0).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /api/v1/info HTTP/1.1\r\nHost: parent\r\n\r\n")
        .await
        .unwrap();

    let (status, _) = read_http_response(&mut stream).await;
    assert_eq!(status, 404);
}
