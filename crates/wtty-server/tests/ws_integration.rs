//! End-to-end tests driving a real server over HTTP and WebSockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use wtty_server::config::Settings;
use wtty_server::registry::SessionRegistry;
use wtty_server::routes::build_router;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn test_settings() -> Settings {
    Settings {
        motd_art: "none".to_string(),
        log_enabled: false,
        ..Settings::default()
    }
}

async fn start_server(settings: Settings) -> (SocketAddr, Arc<SessionRegistry>) {
    let registry = SessionRegistry::new(settings);
    let app = build_router(registry.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    (addr, registry)
}

async fn connect(addr: SocketAddr, path: &str) -> WsStream {
    let (ws, _) = tokio::time::timeout(
        Duration::from_secs(10),
        tokio_tungstenite::connect_async(format!("ws://{addr}{path}")),
    )
    .await
    .expect("ws connect timed out")
    .expect("ws connect failed");
    ws
}

/// Read frames until the accumulated binary payload satisfies `pred`.
async fn read_binary_until(ws: &mut WsStream, pred: impl Fn(&str) -> bool) -> String {
    let deadline = Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        let mut seen = Vec::new();
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    seen.extend_from_slice(&data);
                    let text = String::from_utf8_lossy(&seen).into_owned();
                    if pred(&text) {
                        return text;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("stream ended early: {other:?}"),
            }
        }
    })
    .await
    .expect("expected output never arrived")
}

/// Expect the next text frame and parse it as JSON.
async fn read_text_json(ws: &mut WsStream) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).expect("text frame is not JSON")
                }
                Some(Ok(_)) => {}
                other => panic!("stream ended early: {other:?}"),
            }
        }
    })
    .await
    .expect("no text frame arrived")
}

#[tokio::test]
async fn fresh_attach_announces_session_then_streams() {
    let (addr, _registry) = start_server(test_settings()).await;
    let mut ws = connect(addr, "/ws?cols=80&rows=24&cmd=/bin/cat").await;

    let announce = read_text_json(&mut ws).await;
    assert_eq!(announce["type"], "session");
    let id = announce["id"].as_str().unwrap();
    assert!(id.len() >= 8 && id.chars().all(|c| c.is_ascii_hexdigit()));

    ws.send(Message::Binary(b"hello world\n".to_vec())).await.unwrap();
    let seen = read_binary_until(&mut ws, |t| t.contains("hello world")).await;
    assert!(seen.contains("hello world"));
}

#[tokio::test]
async fn resume_attach_replays_history_then_lives() {
    let (addr, _registry) = start_server(test_settings()).await;
    let mut first = connect(addr, "/ws?cols=80&rows=24&cmd=/bin/cat").await;

    let announce = read_text_json(&mut first).await;
    let id = announce["id"].as_str().unwrap().to_string();

    first.send(Message::Binary(b"marco\n".to_vec())).await.unwrap();
    read_binary_until(&mut first, |t| t.contains("marco")).await;

    // A second tab must start from the history, then see live output.
    let mut second = connect(addr, &format!("/ws/{id}?cols=80&rows=24")).await;
    let replay = read_binary_until(&mut second, |t| t.contains("marco")).await;
    assert!(replay.contains("marco"), "history replay missing: {replay:?}");

    first.send(Message::Binary(b"polo\n".to_vec())).await.unwrap();
    read_binary_until(&mut second, |t| t.contains("polo")).await;
}

#[tokio::test]
async fn resize_reaches_the_child() {
    let (addr, _registry) = start_server(test_settings()).await;
    let mut ws = connect(addr, "/ws?cols=80&rows=24&cmd=/bin/sh%20-i").await;
    let _ = read_text_json(&mut ws).await;

    ws.send(Message::Text(r#"{"type":"resize","cols":120,"rows":40}"#.into())).await.unwrap();
    // Give the ioctl a moment before asking the shell.
    tokio::time::sleep(Duration::from_millis(200)).await;
    ws.send(Message::Binary(b"stty size\n".to_vec())).await.unwrap();
    read_binary_until(&mut ws, |t| t.contains("40 120")).await;
}

#[tokio::test]
async fn exit_is_announced_to_the_client() {
    let (addr, registry) = start_server(test_settings()).await;
    let mut ws = connect(addr, "/ws?cols=80&rows=24&cmd=/bin/sh%20-i").await;
    let announce = read_text_json(&mut ws).await;
    let id = announce["id"].as_str().unwrap().to_string();

    ws.send(Message::Binary(b"exit\n".to_vec())).await.unwrap();

    let saw_exit = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if v["type"] == "exit" {
                        return true;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(_)) => return false,
            }
        }
    })
    .await
    .expect("no exit notification");
    assert!(saw_exit);

    drop(ws);
    // With the child dead and the last client gone, the registry entry
    // must disappear.
    tokio::time::timeout(Duration::from_secs(10), async {
        while registry.get(&id).is_some() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("drained session still listed");
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (addr, _registry) = start_server(test_settings()).await;
    let mut ws = connect(addr, "/ws?cols=80&rows=24&cmd=/bin/cat").await;
    let _ = read_text_json(&mut ws).await;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    let reply = read_text_json(&mut ws).await;
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn malformed_control_messages_are_ignored() {
    let (addr, _registry) = start_server(test_settings()).await;
    let mut ws = connect(addr, "/ws?cols=80&rows=24&cmd=/bin/cat").await;
    let _ = read_text_json(&mut ws).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"mystery","x":1}"#.into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"resize","cols":0,"rows":0}"#.into())).await.unwrap();

    // The bridge must still be healthy.
    ws.send(Message::Binary(b"still alive\n".to_vec())).await.unwrap();
    read_binary_until(&mut ws, |t| t.contains("still alive")).await;
}

#[tokio::test]
async fn unknown_session_id_creates_a_fresh_session() {
    let (addr, _registry) = start_server(test_settings()).await;
    let mut ws = connect(addr, "/ws/ffffffffffffffff?cols=80&rows=24&cmd=/bin/cat").await;

    let announce = read_text_json(&mut ws).await;
    assert_eq!(announce["type"], "session");
    assert_ne!(announce["id"], "ffffffffffffffff");
}

#[tokio::test]
async fn http_api_lists_sessions_and_themes() {
    let (addr, _registry) = start_server(test_settings()).await;
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let base = format!("http://{addr}");

    let health: serde_json::Value =
        client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");

    // No sessions yet.
    let sessions: serde_json::Value =
        client.get(format!("{base}/api/sessions")).send().await.unwrap().json().await.unwrap();
    assert_eq!(sessions.as_array().unwrap().len(), 0);

    // Attach one client, then the listing must show it.
    let mut ws = connect(addr, "/ws?cols=80&rows=24&cmd=/bin/cat").await;
    let announce = read_text_json(&mut ws).await;
    let id = announce["id"].as_str().unwrap();

    // The attachment registers just after the announce frame; poll briefly.
    let rows = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let sessions: serde_json::Value = client
                .get(format!("{base}/api/sessions"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let rows = sessions.as_array().unwrap().clone();
            if rows.len() == 1 && rows[0]["clients"] == 1 {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session never appeared in the listing");
    assert_eq!(rows[0]["id"], id);
    assert_eq!(rows[0]["alive"], true);
    assert!(rows[0]["created"].as_str().unwrap().contains('T'), "created must be ISO-8601");

    let themes: serde_json::Value =
        client.get(format!("{base}/api/themes")).send().await.unwrap().json().await.unwrap();
    assert!(themes["themes"].as_array().unwrap().iter().any(|t| t == "default"));
    assert_eq!(themes["current"], "default");

    let dracula: serde_json::Value = client
        .get(format!("{base}/api/themes/dracula"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dracula["background"], "#282a36");
    assert!(dracula.get("selectionBackground").is_some());

    let missing = client.get(format!("{base}/api/themes/hotdog-stand")).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn motd_banner_greets_the_creating_client_only() {
    let settings = Settings {
        motd_art: "default".to_string(),
        log_enabled: false,
        ..Settings::default()
    };
    let (addr, _registry) = start_server(settings).await;

    let mut first = connect(addr, "/ws?cols=80&rows=24&cmd=/bin/cat").await;
    let announce = read_text_json(&mut first).await;
    let id = announce["id"].as_str().unwrap().to_string();
    let banner = read_binary_until(&mut first, |t| t.contains("Listening on")).await;
    assert!(banner.contains("Mode:"));

    // The banner is not part of session history, so a resuming client
    // must not see it again.
    first.send(Message::Binary(b"checkpoint\n".to_vec())).await.unwrap();
    read_binary_until(&mut first, |t| t.contains("checkpoint")).await;

    let mut second = connect(addr, &format!("/ws/{id}?cols=80&rows=24")).await;
    let replay = read_binary_until(&mut second, |t| t.contains("checkpoint")).await;
    assert!(!replay.contains("Listening on"));
}
