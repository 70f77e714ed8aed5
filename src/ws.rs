//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. Both the multiplex channel and every per-operation
//! stream session connect through this module rather than using
//! `tokio-tungstenite` directly.
//!
//! Every socket speaks the same handshake: the first client message after
//! open is the raw bearer token (not JSON). [`open_authenticated`] performs
//! connect-plus-handshake in one step.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::error::WsError;

/// Normal, user-initiated closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// The peer vanished without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// The server invalidated our token; re-authentication is required.
pub const CLOSE_AUTH_EXPIRED: u16 = 4001;
/// We are closing because an inbound message failed to parse.
pub const CLOSE_PROTOCOL_ERROR: u16 = 4500;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1005 = no code supplied).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl std::fmt::Debug for WsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsWriter").finish_non_exhaustive()
    }
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .map_err(send_error)
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), WsError> {
        self.sink
            .send(tungstenite::Message::Binary(data))
            .await
            .map_err(send_error)
    }

    /// Send a pong frame in response to a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), WsError> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .map_err(send_error)
    }

    /// Send a close frame with an explicit code and reason, then flush.
    pub async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        self.sink
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })))
            .await
            .map_err(send_error)?;
        self.sink.flush().await.map_err(send_error)
    }
}

fn send_error(e: tungstenite::Error) -> WsError {
    WsError::Disconnect {
        code: CLOSE_ABNORMAL,
        reason: format!("websocket send failed: {e}"),
    }
}

/// Read half of a WebSocket connection.
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl std::fmt::Debug for WsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsReader").finish_non_exhaustive()
    }
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage, WsError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text)));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data)));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data)));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data)));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames are a write-path artifact, skip them
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(WsError::Disconnect {
                        code: CLOSE_ABNORMAL,
                        reason: format!("websocket read error: {e}"),
                    }));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL.
///
/// A failure here is always a [`WsError::Connect`]: the transport never
/// reached the open state.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader), WsError> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .map_err(|e| WsError::Connect(format!("invalid WebSocket URL {url}: {e}")))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| WsError::Connect(e.to_string()))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Connect and immediately send the bearer token as the first raw message.
///
/// The token send happens before any other traffic; the server starts
/// streaming only after receiving it. A send failure at this point is
/// reported as a `Connect` error since the connection was never usable.
pub async fn open_authenticated(url: &str, token: &str) -> Result<(WsWriter, WsReader), WsError> {
    let (mut writer, reader) = connect(url).await?;
    writer
        .send_text(token)
        .await
        .map_err(|e| WsError::Connect(format!("token handshake failed: {e}")))?;
    Ok((writer, reader))
}
