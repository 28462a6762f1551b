mod common;

use futures_util::{SinkExt, StreamExt};
use parley_core::{BotStatus, ChatController, ChatHandle, ConnectionState, UserInput};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage, WebSocketStream};

use common::{assistant_messages, fast_config, wait_for};

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["action"] == "ping" {
                    continue;
                }
                return value;
            }
            Some(Ok(_)) => continue,
            other => panic!("client went away: {other:?}"),
        }
    }
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: serde_json::Value) {
    ws.send(WsMessage::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn streams_reply_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let request = next_text(&mut ws).await;
        for chunk in ["Hi", " there", "!"] {
            send_json(&mut ws, json!({"response_chunk": chunk, "session_id": "s-1"})).await;
        }
        send_json(&mut ws, json!({"response": "Hi there!", "audio_url": null})).await;
        // Stay up until the client closes
        while let Some(Ok(_)) = ws.next().await {}
        request
    });

    let controller = ChatController::with_defaults(fast_config(&format!("ws://{addr}"))).unwrap();
    let handle = ChatHandle::spawn(controller);
    let mut view = handle.view();

    wait_for(&mut view, |v| v.connection.state == ConnectionState::Open).await;
    assert!(handle.send(UserInput::SendText("test".to_string())));

    let done = wait_for(&mut view, |v| !assistant_messages(v).is_empty()).await;
    assert_eq!(assistant_messages(&done), vec!["Hi there!".to_string()]);
    assert_eq!(done.bot_status, BotStatus::Idle);
    assert_eq!(done.streaming, None);
    assert_eq!(done.session_id.as_deref(), Some("s-1"));

    handle.shutdown().await;
    let request = server.await.unwrap();
    assert_eq!(request, json!({"action": "sendMessage", "text": "test"}));
}

#[tokio::test]
async fn reconnects_after_abrupt_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (second_tx, second_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        // First connection dies without a closing handshake
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = second_tx.send(());
        let request = next_text(&mut ws).await;
        let text = request["text"].as_str().unwrap_or_default().to_string();
        send_json(&mut ws, json!({"response": format!("echo: {text}")})).await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let controller = ChatController::with_defaults(fast_config(&format!("ws://{addr}"))).unwrap();
    let handle = ChatHandle::spawn(controller);
    let mut view = handle.view();

    second_rx.await.unwrap();
    assert!(handle.send(UserInput::SendText("after drop".to_string())));

    let done = wait_for(&mut view, |v| !assistant_messages(v).is_empty()).await;
    assert_eq!(assistant_messages(&done), vec!["echo: after drop".to_string()]);
    assert_eq!(done.connection.state, ConnectionState::Open);
    assert_eq!(done.connection.attempt, 0);

    handle.shutdown().await;
    server.await.unwrap();
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    // Bind then drop to get a port nobody is listening on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = fast_config(&format!("ws://{addr}"));
    config.connection.max_attempts = 2;
    config.connection.base_delay_ms = 10;

    let handle = ChatHandle::spawn(ChatController::with_defaults(config).unwrap());
    let mut view = handle.view();

    let errored = wait_for(&mut view, |v| v.connection.state == ConnectionState::Errored).await;
    assert_eq!(errored.connection.attempt, 2);
    assert_eq!(errored.connection.retry_at, None);

    handle.shutdown().await;
}
