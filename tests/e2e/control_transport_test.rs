mod helpers;

use helpers::*;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use sshproxyplus::controller::protocol::{self as p, ControlMessage, ControlReply};
use sshproxyplus::controller::Controller;
use sshproxyplus::transport::{insecure_client_config, tcp, ControlClient, SocketType};

fn signed(msg: &ControlMessage) -> Vec<u8> {
    msg.sign(PSK.as_bytes()).unwrap().to_json().unwrap()
}

fn create_proxy() -> ControlMessage {
    ControlMessage {
        proxy_data: Some(br#"{"ListenIP":"127.0.0.1","ListenPort":0}"#.to_vec()),
        ..ControlMessage::new(p::CREATE_PROXY)
    }
}

async fn roundtrip(client: &mut Box<dyn ControlClient>, line: &[u8]) -> ControlReply {
    client.send_line(line).await.unwrap();
    let reply = timeout(WAIT, client.read_line())
        .await
        .expect("reply timed out")
        .unwrap()
        .expect("connection closed");
    serde_json::from_slice(&reply).unwrap()
}

async fn listening(socket_type: SocketType, tls: Option<&TlsPaths>) -> (Arc<Controller>, String) {
    let controller = new_controller(controller_settings(socket_type, tls));
    let addr = controller.listen().await.unwrap();
    (controller, addr.to_string())
}

/// Commands on one line connection: create, list, a rejected line, then
/// another command on the same connection.
async fn exercise_line_client(controller: &Controller, mut client: Box<dyn ControlClient>) {
    let reply = roundtrip(&mut client, &signed(&create_proxy())).await;
    assert_eq!(reply.message_type, "create-proxy-reply");
    assert_eq!(reply.proxy_id, Some(0));

    let reply = roundtrip(&mut client, b"{not json").await;
    assert_eq!(reply.message_type, "error-reply");

    let forged = ControlMessage::new(p::DESTROY_PROXY).sign(b"not-the-key").unwrap().to_json().unwrap();
    let reply = roundtrip(&mut client, &forged).await;
    assert_eq!(reply.error.as_deref(), Some("hmac does not match"));
    assert_eq!(controller.proxy_ids(), vec![0]);

    let reply = roundtrip(&mut client, &signed(&ControlMessage::new(p::LIST_PROXIES))).await;
    let proxies: serde_json::Value = serde_json::from_slice(&reply.proxies.unwrap()).unwrap();
    assert_eq!(proxies["0"]["ListenIP"], "127.0.0.1");
}

// ---------------------------------------------------------------------------
// Test 1: plain TCP
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_plain_socket() {
    let (controller, addr) = listening(SocketType::Plain, None).await;
    let client = tcp::connect(&addr, false).await.unwrap();
    exercise_line_client(&controller, client).await;
    controller.stop();
}

// ---------------------------------------------------------------------------
// Test 2: TLS
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_tls_socket() {
    let dir = TempDir::new().unwrap();
    let tls = self_signed(dir.path());
    let (controller, addr) = listening(SocketType::Tls, Some(&tls)).await;
    let client = tcp::connect(&addr, true).await.unwrap();
    exercise_line_client(&controller, client).await;

    // A plain client cannot talk to a TLS socket.
    let mut plain = tcp::connect(&addr, false).await.unwrap();
    plain.send_line(&signed(&ControlMessage::new(p::LIST_PROXIES))).await.unwrap();
    let answer = timeout(WAIT, plain.read_line()).await.expect("no answer to plain client");
    assert!(!matches!(answer, Ok(Some(ref line)) if line.starts_with(b"{")));
    controller.stop();
}

#[tokio::test]
async fn test_tls_without_cert_fails_to_listen() {
    let controller = new_controller(controller_settings(SocketType::Tls, None));
    assert!(controller.listen().await.is_err());
}

// ---------------------------------------------------------------------------
// Test 3: WebSocket, one command per frame
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_websocket_socket() {
    let (controller, addr) = listening(SocketType::PlainWebsocket, None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await.unwrap();

    ws_send(&mut ws, std::str::from_utf8(&signed(&create_proxy())).unwrap()).await;
    let reply: ControlReply = serde_json::from_str(&ws_recv(&mut ws).await).unwrap();
    assert_eq!(reply.proxy_id, Some(0));

    ws_send(&mut ws, "garbage").await;
    let reply: ControlReply = serde_json::from_str(&ws_recv(&mut ws).await).unwrap();
    assert_eq!(reply.message_type, "error-reply");

    let info = ControlMessage::new(p::GET_PROXY_INFO).with_proxy(0);
    ws_send(&mut ws, std::str::from_utf8(&signed(&info)).unwrap()).await;
    let reply: ControlReply = serde_json::from_str(&ws_recv(&mut ws).await).unwrap();
    assert!(reply.proxy.is_some(), "{:?}", reply.error);
    controller.stop();
}

#[tokio::test]
async fn test_websocket_socket_serves_viewer_routes() {
    let (controller, addr) = listening(SocketType::PlainWebsocket, None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/proxysocket/?id=3"))
        .await
        .unwrap();
    ws_send(&mut ws, "list-active").await;
    assert_eq!(ws_recv(&mut ws).await, "could not find proxy");
    controller.stop();
}

// ---------------------------------------------------------------------------
// Test 4: WebSocket over TLS
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_tls_websocket_socket() {
    let dir = TempDir::new().unwrap();
    let tls = self_signed(dir.path());
    let (controller, addr) = listening(SocketType::TlsWebsocket, Some(&tls)).await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let connector = TlsConnector::from(insecure_client_config());
    let stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async("wss://localhost/", stream).await.unwrap();

    ws_send(&mut ws, std::str::from_utf8(&signed(&ControlMessage::new(p::LIST_PROXIES))).unwrap()).await;
    let reply: ControlReply = serde_json::from_str(&ws_recv(&mut ws).await).unwrap();
    assert_eq!(reply.message_type, "list-proxies-reply");
    assert!(!reply.is_error());
    controller.stop();
}

// ---------------------------------------------------------------------------
// Test 5: stopping the controller closes the socket
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_stop_closes_connections() {
    let (controller, addr) = listening(SocketType::Plain, None).await;
    let mut client = tcp::connect(&addr, false).await.unwrap();
    let reply = roundtrip(&mut client, &signed(&ControlMessage::new(p::LIST_PROXIES))).await;
    assert!(!reply.is_error());

    controller.stop();
    let next = timeout(WAIT, client.read_line()).await.expect("connection left open");
    assert!(matches!(next, Ok(None) | Err(_)));
    assert!(wait_until_refused(&addr).await);
}

async fn wait_until_refused(addr: &str) -> bool {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_err() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
