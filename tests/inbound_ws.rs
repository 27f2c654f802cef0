//! Inbound mode over WebSocket against a scripted ESL server.

use std::time::Duration;

use esl_duplex::{EslError, EventFormat, Events, InboundOptions, Options, Protocol};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

fn test_options() -> InboundOptions {
    InboundOptions {
        options: Options {
            protocol: Protocol::Websocket,
            exit_timeout: Duration::from_secs(2),
            ..Options::default()
        },
        auth_timeout: Duration::from_secs(2),
        ..InboundOptions::new()
    }
}

async fn accept_ws(listener: TcpListener) -> ServerWs {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no incoming connection")
        .expect("accept failed");
    accept_async(stream)
        .await
        .expect("websocket upgrade failed")
}

/// Next text frame from the client; each frame is one full request.
async fn next_text(ws: &mut ServerWs) -> String {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed the websocket")
            .expect("websocket read failed");
        match message {
            Message::Text(text) => return text.to_string(),
            Message::Close(_) => panic!("client sent close while a request was expected"),
            _ => continue,
        }
    }
}

async fn send_text(ws: &mut ServerWs, payload: &str) {
    ws.send(Message::Text(payload.to_string().into()))
        .await
        .expect("write frame to client");
}

#[tokio::test]
async fn auth_timeout_sends_exit_and_fails_dial() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let url = format!(
        "ws://{}/ws",
        listener
            .local_addr()
            .unwrap()
    );

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(listener).await;
        send_text(&mut ws, "Content-Type: auth/request\r\nContent-Length: 0\r\n\r\n").await;

        assert_eq!(next_text(&mut ws).await, "auth ClueCon\r\n\r\n");
        // No reply: the client gives up and exits.
        assert_eq!(next_text(&mut ws).await, "exit\r\n\r\n");
        send_text(&mut ws, "Content-Type: command/reply\r\nContent-Length: 0\r\n\r\n").await;
    });

    let err = test_options()
        .dial(&url)
        .await
        .expect_err("dial should fail on auth timeout");
    assert!(matches!(err, EslError::Timeout { .. }), "got {err:?}");

    server
        .await
        .unwrap();
}

#[tokio::test]
async fn auth_rejection_surfaces_as_failed_to_auth() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let url = format!(
        "ws://{}/ws",
        listener
            .local_addr()
            .unwrap()
    );

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(listener).await;
        send_text(&mut ws, "Content-Type: auth/request\r\nContent-Length: 0\r\n\r\n").await;

        assert_eq!(next_text(&mut ws).await, "auth ClueCon\r\n\r\n");
        send_text(
            &mut ws,
            "Content-Type: command/reply\nReply-Text: -ERR invalid\r\n\r\n",
        )
        .await;

        assert_eq!(next_text(&mut ws).await, "exit\r\n\r\n");
        send_text(&mut ws, "Content-Type: command/reply\r\nContent-Length: 0\r\n\r\n").await;
    });

    let err = test_options()
        .dial(&url)
        .await
        .expect_err("dial should fail on rejected auth");
    assert!(
        err.to_string()
            .starts_with("failed to auth"),
        "error should start with 'failed to auth': {err}"
    );

    server
        .await
        .unwrap();
}

#[tokio::test]
async fn auth_ok_then_event_subscription_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let url = format!(
        "ws://{}/ws",
        listener
            .local_addr()
            .unwrap()
    );

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(listener).await;
        send_text(&mut ws, "Content-Type: auth/request\r\nContent-Length: 0\r\n\r\n").await;

        assert_eq!(next_text(&mut ws).await, "auth ClueCon\r\n\r\n");
        send_text(
            &mut ws,
            "Content-Type: command/reply\nReply-Text: +OK accepted\r\n\r\n",
        )
        .await;

        assert_eq!(next_text(&mut ws).await, "event plain MESSAGE_QUERY\r\n\r\n");
        send_text(
            &mut ws,
            "Content-Type: command/reply\nReply-Text: +OK event listener enabled plain\r\n\r\n",
        )
        .await;
    });

    let conn = test_options()
        .dial(&url)
        .await
        .expect("dial should succeed");

    let response = conn
        .send_command(&Events::new(EventFormat::Plain, ["MESSAGE_QUERY"]))
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .len(),
        2
    );
    assert_eq!(response.content_type(), "command/reply");
    assert_eq!(
        response.reply_text(),
        Some("+OK event listener enabled plain")
    );

    server
        .await
        .unwrap();
}
