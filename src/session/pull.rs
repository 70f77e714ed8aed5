//! Image pull sessions.
//!
//! The pull socket is receive-only. Inbound frames carry a one-byte
//! selector: `0` progress text, `e` a fatal error, `s` the id of the pulled
//! image. A normal close (code 1000) after an `s` frame means success.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::error::WsError;
use crate::session::{SessionEnd, StreamSession};

/// One decoded frame of a pull stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullFrame {
    /// Progress text, newlines already expanded to CRLF.
    Progress(String),
    /// The pull failed; the payload explains why. The socket may still close
    /// normally afterwards.
    Fatal(String),
    /// Id of the image that was pulled. Arrives before the normal close.
    ImageId(String),
}

/// Decode one inbound pull frame. Unknown selectors yield `None` and are
/// ignored.
pub fn decode_pull_frame(frame: &[u8]) -> Option<PullFrame> {
    let (&selector, rest) = frame.split_first()?;
    let text = String::from_utf8_lossy(rest);
    match selector {
        b'0' => Some(PullFrame::Progress(text.replace('\n', "\r\n"))),
        b'e' => Some(PullFrame::Fatal(text.replace('\n', "\r\n"))),
        b's' => Some(PullFrame::ImageId(text.into_owned())),
        _ => None,
    }
}

/// Why an image pull failed.
#[derive(Debug, Clone)]
pub enum PullError {
    /// The session itself failed (dial, auth, abnormal close).
    Session(WsError),
    /// The server reported a pull failure in-stream.
    Remote(String),
}

impl std::fmt::Display for PullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(e) => write!(f, "pull session failed: {e}"),
            Self::Remote(reason) => write!(f, "pull failed: {reason}"),
        }
    }
}

impl std::error::Error for PullError {}

impl From<WsError> for PullError {
    fn from(e: WsError) -> Self {
        Self::Session(e)
    }
}

/// The pull endpoint URL for one image reference.
pub fn pull_url(config: &ClientConfig, image: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("name", image)
        .finish();
    format!("{}?{}", config.image_pull_url(), query)
}

/// Pull an image, reporting progress text as it streams in.
///
/// Resolves with the pulled image id on a normal close; the first terminal
/// outcome wins, so an in-stream `e` frame takes precedence over the close
/// that follows it.
pub async fn pull_image(
    config: &ClientConfig,
    image: &str,
    mut on_progress: impl FnMut(String) + Send + 'static,
) -> Result<String, PullError> {
    let (pending, _canceler) = StreamSession::open(pull_url(config, image), config.token.clone())?;
    let handle = pending.handle().await?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let image_id = Arc::new(Mutex::new(String::new()));

    {
        let done_tx = done_tx.clone();
        let image_id = Arc::clone(&image_id);
        handle.on_receive(move |frame| match decode_pull_frame(&frame) {
            Some(PullFrame::Progress(text)) => on_progress(text),
            Some(PullFrame::Fatal(reason)) => {
                let _ = done_tx.send(Err(PullError::Remote(reason)));
            }
            Some(PullFrame::ImageId(id)) => {
                *image_id.lock().expect("image id lock poisoned") = id;
            }
            None => {}
        });
    }

    handle.on_close(move |event| {
        let outcome = match event.classify() {
            SessionEnd::Normal { .. } => {
                Ok(image_id.lock().expect("image id lock poisoned").clone())
            }
            SessionEnd::AuthExpired => Err(PullError::Session(WsError::AuthExpired)),
            SessionEnd::Abnormal { code, reason } => {
                Err(PullError::Session(WsError::Disconnect { code, reason }))
            }
        };
        let _ = done_tx.send(outcome);
    });

    // The handle stays alive here, so a sender always exists until an
    // outcome arrives.
    match done_rx.recv().await {
        Some(outcome) => outcome,
        None => Err(PullError::Session(WsError::Canceled)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_progress_expands_newlines() {
        assert_eq!(
            decode_pull_frame(b"0Downloading layer\n"),
            Some(PullFrame::Progress("Downloading layer\r\n".to_string()))
        );
    }

    #[test]
    fn test_decode_fatal_and_image_id() {
        assert_eq!(
            decode_pull_frame(b"eno such image"),
            Some(PullFrame::Fatal("no such image".to_string()))
        );
        assert_eq!(
            decode_pull_frame(b"ssha256:abcd"),
            Some(PullFrame::ImageId("sha256:abcd".to_string()))
        );
        assert_eq!(decode_pull_frame(b"?x"), None);
        assert_eq!(decode_pull_frame(b""), None);
    }

    #[test]
    fn test_pull_url() {
        let config = ClientConfig::new("http://host", "k");
        assert_eq!(
            pull_url(&config, "docker.io/library/alpine:latest"),
            "ws://host/api/image/pull?name=docker.io%2Flibrary%2Falpine%3Alatest"
        );
    }

    #[tokio::test]
    async fn test_pull_without_token_is_no_login() {
        let config = ClientConfig::new("http://127.0.0.1:1", "");
        let err = pull_image(&config, "alpine", |_| {})
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, PullError::Session(WsError::NoLogin)));
    }
}
