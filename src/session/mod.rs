//! Per-operation stream sessions.
//!
//! Unlike the multiplexed hub socket, byte-oriented operations (log tailing,
//! interactive exec, image pull) each get a dedicated WebSocket wrapped in a
//! [`StreamSession`]. The session pumps inbound frames into a receive
//! conduit and outbound writes onto the socket, and reports the final close
//! exactly once.
//!
//! Opening is two-step: [`StreamSession::open`] returns a [`PendingSession`]
//! to await plus a [`SessionCanceler`] so a caller that navigated away can
//! abandon the dial without ever seeing a handle.

pub mod exec;
pub mod logs;
pub mod pull;
pub mod update;

use std::pin::pin;

use futures_util::FutureExt;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::WsError;
use crate::pipe::{Pipe, PipeWriter};
use crate::ws::{self, WsMessage};

/// Close reason sent when the consumer ends the session.
const USER_TERMINATED: &str = "user terminated the session";

/// The close that ended a session, reported exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// WebSocket close code (1006 when the peer vanished without one).
    pub code: u16,
    /// Close reason, possibly empty.
    pub reason: String,
}

impl CloseEvent {
    /// Classify the close for the caller's UI decision.
    pub fn classify(&self) -> SessionEnd {
        match self.code {
            ws::CLOSE_NORMAL => SessionEnd::Normal {
                reason: self.reason.clone(),
            },
            ws::CLOSE_AUTH_EXPIRED => SessionEnd::AuthExpired,
            code => SessionEnd::Abnormal {
                code,
                reason: self.reason.clone(),
            },
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Orderly completion (code 1000). The reason may carry a final payload.
    Normal {
        /// Reason text from the close frame.
        reason: String,
    },
    /// The token is no longer valid (code 4001).
    AuthExpired,
    /// Anything else; the operation did not finish cleanly.
    Abnormal {
        /// WebSocket close code.
        code: u16,
        /// Reason text from the close frame.
        reason: String,
    },
}

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Handle to an open stream session.
///
/// Clones share the session. Dropping the last clone closes the socket with
/// code 1000, so an abandoned session never leaks a connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    data: Pipe<Vec<u8>>,
    close: Pipe<CloseEvent>,
    out_tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    /// Register the receive callback for inbound payload bytes. Text and
    /// binary frames both arrive here as raw bytes.
    pub fn on_receive(&self, cb: impl FnMut(Vec<u8>) + Send + 'static) {
        self.data.set_receiver(cb);
    }

    /// Register the callback for the final close notification.
    pub fn on_close(&self, cb: impl FnMut(CloseEvent) + Send + 'static) {
        self.close.set_receiver(cb);
    }

    /// Send a binary frame. No-op after the session ended.
    pub fn write(&self, data: Vec<u8>) {
        let _ = self.out_tx.send(Outbound::Binary(data));
    }

    /// Send a text frame. No-op after the session ended.
    pub fn write_text(&self, text: impl Into<String>) {
        let _ = self.out_tx.send(Outbound::Text(text.into()));
    }

    /// Close the session normally.
    pub fn close(&self) {
        self.close_with(ws::CLOSE_NORMAL, USER_TERMINATED);
    }

    /// Close the session with an explicit code and reason.
    pub fn close_with(&self, code: u16, reason: &str) {
        let _ = self.out_tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// An in-flight session open. Await [`handle`](Self::handle) for the result.
#[derive(Debug)]
pub struct PendingSession {
    rx: oneshot::Receiver<Result<SessionHandle, WsError>>,
}

impl PendingSession {
    /// Resolve the open. Returns [`WsError::Canceled`] if the paired
    /// [`SessionCanceler`] fired first.
    pub async fn handle(self) -> Result<SessionHandle, WsError> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(WsError::Canceled),
        }
    }
}

/// Cancels a pending session open. Dropping it without calling
/// [`cancel`](Self::cancel) lets the open proceed.
#[derive(Debug)]
pub struct SessionCanceler {
    tx: oneshot::Sender<()>,
}

impl SessionCanceler {
    /// Abandon the open. The pending handle resolves to
    /// [`WsError::Canceled`] and any socket being dialed is dropped.
    pub fn cancel(self) {
        let _ = self.tx.send(());
    }
}

/// A dedicated WebSocket for one streaming operation.
#[derive(Debug)]
pub struct StreamSession;

impl StreamSession {
    /// Start opening a session to `url`, authenticating with `token`.
    ///
    /// Fails synchronously only with [`WsError::NoLogin`] when the token is
    /// empty; dial failures resolve through the returned [`PendingSession`].
    pub fn open(url: String, token: String) -> Result<(PendingSession, SessionCanceler), WsError> {
        if token.is_empty() {
            return Err(WsError::NoLogin);
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        tokio::spawn(run_session(url, token, cancel_rx, result_tx));

        Ok((
            PendingSession { rx: result_rx },
            SessionCanceler { tx: cancel_tx },
        ))
    }
}

async fn run_session(
    url: String,
    token: String,
    cancel_rx: oneshot::Receiver<()>,
    result_tx: oneshot::Sender<Result<SessionHandle, WsError>>,
) {
    // A dropped canceler must not cancel; only an explicit fire does. The
    // cancel window stays open until the handle is resolved.
    let mut canceled = pin!(async {
        if cancel_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    });

    let connected = tokio::select! {
        () = &mut canceled => {
            debug!("session open canceled before connect completed");
            let _ = result_tx.send(Err(WsError::Canceled));
            return;
        }
        res = ws::connect(&url) => res,
    };

    let (mut writer, mut reader) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };

    let token_sent = tokio::select! {
        () = &mut canceled => {
            debug!("session open canceled after connect, before resolve");
            let _ = writer.close_with(ws::CLOSE_NORMAL, "canceled").await;
            let _ = result_tx.send(Err(WsError::Canceled));
            return;
        }
        res = writer.send_text(&token) => res,
    };
    if let Err(e) = token_sent {
        let _ = result_tx
            .send(Err(WsError::Connect(format!("token handshake failed: {e}"))));
        return;
    }

    let data = Pipe::new();
    let close = Pipe::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        data: data.clone(),
        close: close.clone(),
        out_tx,
    };

    // Last look at the canceler before the open settles.
    if canceled.as_mut().now_or_never().is_some() {
        let _ = writer.close_with(ws::CLOSE_NORMAL, "canceled").await;
        let _ = result_tx.send(Err(WsError::Canceled));
        return;
    }
    if result_tx.send(Ok(handle)).is_err() {
        // The awaiting side vanished between connect and resolve.
        let _ = writer.close_with(ws::CLOSE_NORMAL, USER_TERMINATED).await;
        return;
    }

    pump(&mut writer, &mut reader, &mut out_rx, data.writer(), close.writer()).await;
}

/// Forward frames both ways until the socket ends, then report the close
/// once.
async fn pump(
    writer: &mut ws::WsWriter,
    reader: &mut ws::WsReader,
    out_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    data: PipeWriter<Vec<u8>>,
    close: PipeWriter<CloseEvent>,
) {
    let mut out_open = true;
    let mut close_notified = false;
    let mut notify_close = |event: CloseEvent| {
        if !close_notified {
            close_notified = true;
            close.write(event);
        }
    };

    loop {
        tokio::select! {
            out = out_rx.recv(), if out_open => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = writer.send_text(&text).await {
                        warn!("session send failed: {e}");
                        notify_close(CloseEvent {
                            code: ws::CLOSE_ABNORMAL,
                            reason: "websocket error".to_string(),
                        });
                        return;
                    }
                }
                Some(Outbound::Binary(bytes)) => {
                    if let Err(e) = writer.send_binary(bytes).await {
                        warn!("session send failed: {e}");
                        notify_close(CloseEvent {
                            code: ws::CLOSE_ABNORMAL,
                            reason: "websocket error".to_string(),
                        });
                        return;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    // Keep reading; the close notification comes from the
                    // peer's close echo or the stream ending.
                    let _ = writer.close_with(code, &reason).await;
                    out_open = false;
                }
                None => {
                    // Last handle clone dropped.
                    let _ = writer.close_with(ws::CLOSE_NORMAL, USER_TERMINATED).await;
                    out_open = false;
                }
            },

            msg = reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => data.write(text.into_bytes()),
                Some(Ok(WsMessage::Binary(bytes))) => data.write(bytes),
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = writer.send_pong(payload).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { code, reason })) => {
                    notify_close(CloseEvent { code, reason });
                    return;
                }
                Some(Err(e)) => {
                    warn!("session socket error: {e}");
                    notify_close(CloseEvent {
                        code: ws::CLOSE_ABNORMAL,
                        reason: "websocket error".to_string(),
                    });
                    return;
                }
                None => {
                    notify_close(CloseEvent {
                        code: ws::CLOSE_ABNORMAL,
                        reason: String::new(),
                    });
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_normal() {
        let event = CloseEvent {
            code: 1000,
            reason: "done".to_string(),
        };
        assert_eq!(
            event.classify(),
            SessionEnd::Normal {
                reason: "done".to_string()
            }
        );
    }

    #[test]
    fn test_classify_auth_expired() {
        let event = CloseEvent {
            code: 4001,
            reason: String::new(),
        };
        assert_eq!(event.classify(), SessionEnd::AuthExpired);
    }

    #[test]
    fn test_classify_abnormal() {
        let event = CloseEvent {
            code: 1006,
            reason: String::new(),
        };
        assert_eq!(
            event.classify(),
            SessionEnd::Abnormal {
                code: 1006,
                reason: String::new()
            }
        );
    }

    #[tokio::test]
    async fn test_open_without_token_is_no_login() {
        let err = StreamSession::open("ws://127.0.0.1:1/x".to_string(), String::new())
            .err()
            .expect("must fail");
        assert_eq!(err, WsError::NoLogin);
    }

    #[tokio::test]
    async fn test_dial_failure_resolves_connect_error() {
        let (pending, _canceler) =
            StreamSession::open("ws://127.0.0.1:1/x".to_string(), "t".to_string())
                .expect("open");
        let err = pending.handle().await.err().expect("must fail");
        assert!(matches!(err, WsError::Connect(_)));
    }
}
