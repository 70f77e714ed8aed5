//! Container log streaming.
//!
//! Inbound frames carry a one-byte stream selector (`0` stdout, `1` stderr)
//! followed by the log text. Decoded chunks have bare newlines expanded to
//! CRLF so they can be fed straight to a terminal emulator.

use crate::config::ClientConfig;
use crate::error::WsError;
use crate::session::{PendingSession, SessionCanceler, StreamSession};

/// Options for a log stream.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Keep the stream open and follow new output.
    pub follow: bool,
    /// Limit the backlog to the last N lines; `None` sends the whole log.
    pub tail: Option<u32>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            tail: Some(1000),
        }
    }
}

/// Which process stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One decoded chunk of log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    /// Originating stream.
    pub stream: LogStream,
    /// Text with newlines already expanded to CRLF.
    pub text: String,
}

/// Decode one inbound log frame. Returns `None` for frames with an unknown
/// selector, which are ignored.
pub fn decode_log_frame(frame: &[u8]) -> Option<LogChunk> {
    let (&selector, rest) = frame.split_first()?;
    let stream = match selector {
        b'0' => LogStream::Stdout,
        b'1' => LogStream::Stderr,
        _ => return None,
    };
    let text = String::from_utf8_lossy(rest).replace('\n', "\r\n");
    Some(LogChunk { stream, text })
}

/// The log endpoint URL for one container, query string included.
pub fn logs_url(config: &ClientConfig, container_id: &str, opts: &LogOptions) -> String {
    let mut url = config.container_stream_url(container_id, "logs");
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    if opts.follow {
        query.append_pair("follow", "1");
    }
    if let Some(tail) = opts.tail {
        query.append_pair("tail", &tail.to_string());
    }
    let query = query.finish();
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }
    url
}

/// Start opening a log stream session for one container.
pub fn open_logs(
    config: &ClientConfig,
    container_id: &str,
    opts: &LogOptions,
) -> Result<(PendingSession, SessionCanceler), WsError> {
    StreamSession::open(logs_url(config, container_id, opts), config.token.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stdout_expands_newlines() {
        let chunk = decode_log_frame(b"0hello\nworld\n").expect("chunk");
        assert_eq!(chunk.stream, LogStream::Stdout);
        assert_eq!(chunk.text, "hello\r\nworld\r\n");
    }

    #[test]
    fn test_decode_stderr() {
        let chunk = decode_log_frame(b"1oops").expect("chunk");
        assert_eq!(chunk.stream, LogStream::Stderr);
        assert_eq!(chunk.text, "oops");
    }

    #[test]
    fn test_decode_unknown_selector_is_ignored() {
        assert_eq!(decode_log_frame(b"xdata"), None);
        assert_eq!(decode_log_frame(b""), None);
    }

    #[test]
    fn test_logs_url_query() {
        let config = ClientConfig::new("http://host:3000", "k");

        let opts = LogOptions {
            follow: true,
            tail: Some(200),
        };
        assert_eq!(
            logs_url(&config, "abc", &opts),
            "ws://host:3000/api/container/abc/logs?follow=1&tail=200"
        );

        let opts = LogOptions {
            follow: false,
            tail: None,
        };
        assert_eq!(
            logs_url(&config, "abc", &opts),
            "ws://host:3000/api/container/abc/logs"
        );
    }
}
