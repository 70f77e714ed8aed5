//! End-to-end tests of stream sessions against an in-process WebSocket
//! server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use containerdeck::session::exec::{ExecOptions, ExecOutput, ExecSession};
use containerdeck::session::logs::{decode_log_frame, open_logs, LogOptions, LogStream};
use containerdeck::session::pull::{pull_image, PullError};
use containerdeck::session::{SessionEnd, StreamSession};
use containerdeck::{ClientConfig, WsError};

type ServerWs = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, ClientConfig) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let config = ClientConfig::new(format!("http://{addr}"), "token");
    (listener, config)
}

/// Accept one connection, capturing the request path and query.
async fn accept_with_uri(listener: &TcpListener) -> (ServerWs, String) {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut uri = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        uri = req.uri().to_string();
        Ok(resp)
    })
    .await
    .expect("ws accept");
    (ws, uri)
}

async fn next_message(ws: &mut ServerWs) -> Message {
    ws.next().await.expect("stream ended").expect("ws error")
}

async fn recv_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test]
async fn test_log_session_decodes_and_reports_normal_close() {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut ws, uri) = accept_with_uri(&listener).await;
        assert_eq!(uri, "/api/container/abc/logs?follow=1&tail=50");

        assert_eq!(next_message(&mut ws).await, Message::Text("token".to_string()));

        ws.send(Message::Text("0hello\nworld".to_string()))
            .await
            .expect("send");
        ws.send(Message::Text("1warning".to_string()))
            .await
            .expect("send");
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        })))
        .await
        .expect("close");
    });

    let opts = LogOptions {
        follow: true,
        tail: Some(50),
    };
    let (pending, _canceler) = open_logs(&config, "abc", &opts).expect("open");
    let handle = pending.handle().await.expect("handle");

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
    handle.on_receive(move |frame| {
        if let Some(chunk) = decode_log_frame(&frame) {
            let _ = chunk_tx.send(chunk);
        }
    });
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    handle.on_close(move |event| {
        let _ = close_tx.send(event);
    });

    let first = recv_timeout(&mut chunk_rx).await;
    assert_eq!(first.stream, LogStream::Stdout);
    assert_eq!(first.text, "hello\r\nworld");

    let second = recv_timeout(&mut chunk_rx).await;
    assert_eq!(second.stream, LogStream::Stderr);
    assert_eq!(second.text, "warning");

    let close = recv_timeout(&mut close_rx).await;
    assert_eq!(
        close.classify(),
        SessionEnd::Normal {
            reason: "done".to_string()
        }
    );

    server.await.expect("server");
}

#[tokio::test]
async fn test_exec_session_handshake_resize_and_input() {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut ws, uri) = accept_with_uri(&listener).await;
        assert!(uri.starts_with("/api/container/abc/exec?cmd="), "{uri}");
        assert!(uri.contains("tty=1"), "{uri}");
        assert!(uri.contains("interactive=1"), "{uri}");

        assert_eq!(next_message(&mut ws).await, Message::Text("token".to_string()));

        ws.send(Message::Text("1$ ".to_string())).await.expect("send");

        // First frame completes the handshake; the initial geometry report
        // follows.
        assert_eq!(
            next_message(&mut ws).await,
            Message::Binary(vec![0x72, 0, 80, 0, 24])
        );
        // Terminal input is a text frame with the stdin selector.
        assert_eq!(
            next_message(&mut ws).await,
            Message::Text("1ls\r".to_string())
        );
        // An explicit resize after the handshake.
        assert_eq!(
            next_message(&mut ws).await,
            Message::Binary(vec![0x72, 0, 120, 0, 40])
        );

        match next_message(&mut ws).await {
            Message::Close(Some(cf)) => {
                assert_eq!(u16::from(cf.code), 1000);
                assert_eq!(cf.reason, "user terminated the session");
            }
            other => panic!("expected close, got {other:?}"),
        }
    });

    let opts = ExecOptions {
        cmd: "/bin/sh".to_string(),
        tty: true,
        interactive: true,
    };
    let (pending, _canceler) =
        containerdeck::session::exec::open_exec(&config, "abc", &opts).expect("open");
    let handle = pending.handle().await.expect("handle");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let session = ExecSession::attach(handle, true, 80, 24, move |out| {
        let _ = out_tx.send(out);
    });

    assert_eq!(
        recv_timeout(&mut out_rx).await,
        ExecOutput::Stdout(b"$ ".to_vec())
    );

    // The resize report goes out on the handshake; wait for it to be on the
    // wire before sending input so the server sees a stable order.
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.send_input("ls\r");
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.resize(120, 40);
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.close();

    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_frames_sent_before_callbacks_attach_are_not_lost() {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut ws, _uri) = accept_with_uri(&listener).await;
        assert_eq!(next_message(&mut ws).await, Message::Text("token".to_string()));

        // No grace period: the payload and close race the client attaching
        // its callbacks after the open resolves.
        ws.send(Message::Text("0hello\n".to_string()))
            .await
            .expect("send");
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        })))
        .await
        .expect("close");
    });

    let (pending, _canceler) =
        StreamSession::open(config.subscribe_url(), config.token.clone()).expect("open");
    let handle = pending.handle().await.expect("handle");

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
    handle.on_receive(move |frame| {
        let _ = chunk_tx.send(frame);
    });
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    handle.on_close(move |event| {
        let _ = close_tx.send(event);
    });

    assert_eq!(recv_timeout(&mut chunk_rx).await, b"0hello\n".to_vec());
    let close = recv_timeout(&mut close_rx).await;
    assert_eq!(
        close.classify(),
        SessionEnd::Normal {
            reason: "done".to_string()
        }
    );

    server.await.expect("server");
}

#[tokio::test]
async fn test_canceling_a_pending_open_resolves_canceled() {
    // A listener that never accepts keeps the dial pending.
    let (listener, config) = bind().await;

    let (pending, canceler) =
        StreamSession::open(config.subscribe_url(), config.token.clone()).expect("open");
    canceler.cancel();

    let err = pending.handle().await.err().expect("must fail");
    assert_eq!(err, WsError::Canceled);

    drop(listener);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_the_dial_always_settles_the_open() {
    let (listener, config) = bind().await;

    // Accept everything; each socket is read until the peer goes away.
    let server = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(msg) = ws.next().await {
                    if msg.is_err() {
                        return;
                    }
                }
            });
        }
    });

    for i in 0..20u64 {
        let (pending, canceler) =
            StreamSession::open(config.subscribe_url(), config.token.clone()).expect("open");
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_micros(i * 150)).await;
            canceler.cancel();
        });

        // Whatever the cancel timing, the open must settle; a failure can
        // only be the cancellation itself.
        let settled = tokio::time::timeout(Duration::from_secs(5), pending.handle())
            .await
            .expect("open never settled");
        match settled {
            Ok(handle) => handle.close(),
            Err(err) => assert_eq!(err, WsError::Canceled),
        }
        cancel.await.expect("cancel task");
    }

    server.abort();
}

#[tokio::test]
async fn test_dropping_all_handles_closes_the_socket() {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut ws, _uri) = accept_with_uri(&listener).await;
        assert_eq!(next_message(&mut ws).await, Message::Text("token".to_string()));
        match next_message(&mut ws).await {
            Message::Close(Some(cf)) => {
                assert_eq!(u16::from(cf.code), 1000);
                assert_eq!(cf.reason, "user terminated the session");
            }
            other => panic!("expected close, got {other:?}"),
        }
    });

    let (pending, _canceler) =
        StreamSession::open(config.subscribe_url(), config.token.clone()).expect("open");
    let handle = pending.handle().await.expect("handle");
    drop(handle);

    server.await.expect("server");
}

#[tokio::test]
async fn test_pull_resolves_image_id_on_normal_close() {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut ws, uri) = accept_with_uri(&listener).await;
        assert_eq!(uri, "/api/image/pull?name=alpine%3Alatest");
        assert_eq!(next_message(&mut ws).await, Message::Text("token".to_string()));

        ws.send(Message::Text("0Downloading layer 1\n".to_string()))
            .await
            .expect("send");
        ws.send(Message::Text("ssha256:ffee".to_string()))
            .await
            .expect("send");
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await
        .expect("close");
    });

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let image_id = pull_image(&config, "alpine:latest", move |text| {
        let _ = progress_tx.send(text);
    })
    .await
    .expect("pull");

    assert_eq!(image_id, "sha256:ffee");
    assert_eq!(
        recv_timeout(&mut progress_rx).await,
        "Downloading layer 1\r\n"
    );

    server.await.expect("server");
}

#[tokio::test]
async fn test_pull_reports_in_stream_failure_before_close() {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut ws, _uri) = accept_with_uri(&listener).await;
        assert_eq!(next_message(&mut ws).await, Message::Text("token".to_string()));

        ws.send(Message::Text("eno such image".to_string()))
            .await
            .expect("send");
        // Even a normal close afterwards must not mask the failure.
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await
        .expect("close");
    });

    let err = pull_image(&config, "nope", |_| {}).await.err().expect("must fail");
    match err {
        PullError::Remote(reason) => assert_eq!(reason, "no such image"),
        other => panic!("expected remote failure, got {other}"),
    }

    server.await.expect("server");
}

#[tokio::test]
async fn test_pull_auth_expiry_surfaces_as_session_error() {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut ws, _uri) = accept_with_uri(&listener).await;
        assert_eq!(next_message(&mut ws).await, Message::Text("token".to_string()));

        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(4001),
            reason: "".into(),
        })))
        .await
        .expect("close");
    });

    let err = pull_image(&config, "x", |_| {}).await.err().expect("must fail");
    assert!(matches!(err, PullError::Session(WsError::AuthExpired)));

    server.await.expect("server");
}
