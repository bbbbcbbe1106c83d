use futures::{SinkExt, StreamExt};
use periscope_app::{serve, AppState};
use periscope_common::Details;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

async fn start_app() -> (SocketAddr, Arc<AppState>) {
    let details = Details {
        id: "app-test".to_string(),
        version: periscope_common::VERSION.to_string(),
        hostname: "localhost".to_string(),
    };
    let state = Arc::new(AppState::new(details, Duration::from_secs(15)).expect("state"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(serve(listener, Arc::clone(&state)));
    (addr, state)
}

async fn next_binary<S>(stream: &mut S) -> Vec<u8>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("valid message");
        if let Message::Binary(data) = message {
            return data;
        }
    }
}

#[tokio::test]
async fn test_pipe_connects_ui_and_probe() {
    let (addr, state) = start_app().await;

    let (ui, _) = connect_async(format!("ws://{}/api/pipe/p1", addr))
        .await
        .expect("ui connects");
    let (probe, _) = connect_async(format!("ws://{}/api/pipe/p1/probe", addr))
        .await
        .expect("probe connects");
    let (mut ui_tx, mut ui_rx) = ui.split();
    let (mut probe_tx, mut probe_rx) = probe.split();

    ui_tx
        .send(Message::Binary(b"ls\n".to_vec()))
        .await
        .expect("ui sends");
    assert_eq!(next_binary(&mut probe_rx).await, b"ls\n");

    probe_tx
        .send(Message::Binary(b"file.txt\n".to_vec()))
        .await
        .expect("probe sends");
    assert_eq!(next_binary(&mut ui_rx).await, b"file.txt\n");

    let client = reqwest::Client::new();
    let response = client
        .delete(format!("http://{}/api/pipe/p1", addr))
        .send()
        .await
        .expect("delete");
    assert!(response.status().is_success());

    // Once deleted, the probe end is refused.
    let refused = connect_async(format!("ws://{}/api/pipe/p1/probe", addr)).await;
    match refused {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404)
        }
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }

    state.shutdown.cancel();
    state.pipes.stop().await;
}

/// Everything received before the socket ends
async fn drain_binary<S>(stream: &mut S) -> Vec<u8>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Binary(data) => received.extend_from_slice(&data),
                Message::Close(_) => break,
                _ => {}
            }
        }
    })
    .await
    .expect("socket ends after delete");
    received
}

#[tokio::test]
async fn test_output_sent_just_before_delete_reaches_ui() {
    let (addr, state) = start_app().await;

    let (ui, _) = connect_async(format!("ws://{}/api/pipe/p2", addr))
        .await
        .expect("ui connects");
    let (mut probe, _) = connect_async(format!("ws://{}/api/pipe/p2/probe", addr))
        .await
        .expect("probe connects");
    let (_ui_tx, mut ui_rx) = ui.split();

    probe
        .send(Message::Binary(b"last words\n".to_vec()))
        .await
        .expect("probe sends");
    let response = reqwest::Client::new()
        .delete(format!("http://{}/api/pipe/p2", addr))
        .send()
        .await
        .expect("delete");
    assert!(response.status().is_success());

    assert_eq!(drain_binary(&mut ui_rx).await, b"last words\n");

    state.shutdown.cancel();
    state.pipes.stop().await;
}

#[tokio::test]
async fn test_control_socket_requires_probe_id() {
    let (addr, state) = start_app().await;
    let result = connect_async(format!("ws://{}/api/control/ws", addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400)
        }
        other => panic!("expected 400, got {:?}", other.map(|_| ())),
    }
    state.shutdown.cancel();
}
