use sshproxyplus::session::events::{Direction, EventType, SessionEvent, SessionSummary, Stream};

#[test]
fn test_message_event_shape() {
    let ev = SessionEvent::message(Direction::Incoming, Stream::Stderr, 2, b"oops".to_vec());
    let json: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "type": "new-message",
            "direction": "incoming",
            "size": 4,
            "data": "b29wcw==",
            "channel_type": "stderr",
            "channel_id": 2,
        })
    );
}

#[test]
fn test_outgoing_direction_string() {
    let ev = SessionEvent::message(Direction::Outgoing, Stream::Stdout, 1, b"x".to_vec());
    let json: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
    assert_eq!(json["direction"], "outgoing");
    assert_eq!(json["channel_type"], "stdout");
}

#[test]
fn test_new_channel_event_shape() {
    let ev = SessionEvent::new_channel("session", b"", 1);
    assert_eq!(ev.to_json(), r#"{"type":"new-channel","channel_type":"session","channel_id":1}"#);
}

#[test]
fn test_connection_level_request_omits_channel() {
    let ev = SessionEvent::new_request("tcpip-forward", b"\x00\x00\x00\x00", 0, 3);
    let json: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
    assert_eq!(json["type"], "new-request");
    assert_eq!(json["request_type"], "tcpip-forward");
    assert_eq!(json["request_payload"], "AAAAAA==");
    assert_eq!(json["request_id"], 3);
    assert!(json.get("channel_id").is_none());
}

#[test]
fn test_bare_event_only_has_type() {
    let ev = SessionEvent::new(EventType::SessionStop);
    assert_eq!(ev.to_json(), r#"{"type":"session-stop"}"#);
}

#[test]
fn test_event_parses_back() {
    let ev = SessionEvent {
        key: "k".into(),
        start: 1_700_000_000,
        offset: 1500,
        ..SessionEvent::new_request("exec", b"\x00\x00\x00\x02ls", 1, 1)
    };
    let back: SessionEvent = serde_json::from_str(&ev.to_json()).unwrap();
    assert_eq!(back, ev);
}

#[test]
fn test_summary_field_names() {
    let summary = SessionSummary {
        start: 10,
        stop: 20,
        length: 10,
        client_host: "c".into(),
        server_host: "s".into(),
        username: "u".into(),
        password: "p".into(),
        term_rows: 24,
        term_cols: 80,
        filename: "k.log.json".into(),
        requests: vec!["pty-req".into(), "shell".into()],
    };
    let json = serde_json::to_value(&summary).unwrap();
    for field in [
        "start",
        "stop",
        "length",
        "client_host",
        "server_host",
        "username",
        "password",
        "term_rows",
        "term_cols",
        "filename",
        "requests",
    ] {
        assert!(json.get(field).is_some(), "missing {field}");
    }
    assert_eq!(json["requests"], serde_json::json!(["pty-req", "shell"]));
}
