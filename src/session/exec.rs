//! Interactive exec sessions.
//!
//! The exec socket is a duplex byte stream with one-byte selectors:
//!
//! - inbound: `1` + stdout bytes, `2` + stderr bytes
//! - outbound text: `1` + terminal input
//! - outbound binary: `r` + 4 bytes of big-endian-ish cols/rows (resize)
//!
//! The server only accepts a resize after it has produced output, so the
//! session starts in [`ExecPhase::Handshaking`] and moves to
//! [`ExecPhase::Streaming`] on the first decoded frame; for TTY sessions the
//! initial terminal geometry is reported at that transition.

use crate::config::ClientConfig;
use crate::error::WsError;
use crate::session::{CloseEvent, PendingSession, SessionCanceler, SessionHandle, StreamSession};

const RESIZE_SELECTOR: u8 = b'r';
const INPUT_SELECTOR: char = '1';

/// Options for starting an exec session.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Command line to run inside the container.
    pub cmd: String,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
    /// Keep stdin open.
    pub interactive: bool,
}

/// One decoded chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    /// Bytes from the process's stdout.
    Stdout(Vec<u8>),
    /// Bytes from the process's stderr.
    Stderr(Vec<u8>),
}

/// Decode one inbound exec frame. Unknown selectors yield `None` and are
/// ignored.
pub fn decode_exec_frame(frame: &[u8]) -> Option<ExecOutput> {
    let (&selector, rest) = frame.split_first()?;
    match selector {
        b'1' => Some(ExecOutput::Stdout(rest.to_vec())),
        b'2' => Some(ExecOutput::Stderr(rest.to_vec())),
        _ => None,
    }
}

/// Encode a terminal input chunk as an outbound text frame.
pub fn encode_input(input: &str) -> String {
    let mut frame = String::with_capacity(input.len() + 1);
    frame.push(INPUT_SELECTOR);
    frame.push_str(input);
    frame
}

/// Encode a resize report as an outbound binary frame.
pub fn encode_resize(cols: u16, rows: u16) -> [u8; 5] {
    [
        RESIZE_SELECTOR,
        (cols / 256) as u8,
        (cols % 256) as u8,
        (rows / 256) as u8,
        (rows % 256) as u8,
    ]
}

/// Where an exec session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPhase {
    /// Connected, no output seen yet; resize reports are not accepted.
    Handshaking,
    /// First output received; the session is fully interactive.
    Streaming,
}

/// Tracks the handshaking-to-streaming transition of the inbound frame
/// stream. Pure state, separated out so the transition is testable without
/// a socket.
#[derive(Debug)]
pub struct ExecFraming {
    phase: ExecPhase,
}

impl Default for ExecFraming {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecFraming {
    /// Start in [`ExecPhase::Handshaking`].
    pub fn new() -> Self {
        Self {
            phase: ExecPhase::Handshaking,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ExecPhase {
        self.phase
    }

    /// Feed one inbound frame. Returns the decoded output plus whether this
    /// frame completed the handshake. Undecodable frames do not advance the
    /// phase.
    pub fn on_frame(&mut self, frame: &[u8]) -> (Option<ExecOutput>, bool) {
        let Some(output) = decode_exec_frame(frame) else {
            return (None, false);
        };
        let first = self.phase == ExecPhase::Handshaking;
        self.phase = ExecPhase::Streaming;
        (Some(output), first)
    }
}

/// The exec endpoint URL for one container, query string included.
pub fn exec_url(config: &ClientConfig, container_id: &str, opts: &ExecOptions) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("cmd", &opts.cmd);
    if opts.tty {
        query.append_pair("tty", "1");
    }
    if opts.interactive {
        query.append_pair("interactive", "1");
    }
    format!(
        "{}?{}",
        config.container_stream_url(container_id, "exec"),
        query.finish()
    )
}

/// Start opening an exec session for one container.
pub fn open_exec(
    config: &ClientConfig,
    container_id: &str,
    opts: &ExecOptions,
) -> Result<(PendingSession, SessionCanceler), WsError> {
    StreamSession::open(exec_url(config, container_id, opts), config.token.clone())
}

/// A running exec session wired to a consumer.
#[derive(Debug)]
pub struct ExecSession {
    handle: SessionHandle,
    tty: bool,
}

impl ExecSession {
    /// Wire a resolved session handle to an output consumer.
    ///
    /// `cols`/`rows` give the initial terminal geometry, reported to the
    /// server once the handshake completes (TTY sessions only).
    pub fn attach(
        handle: SessionHandle,
        tty: bool,
        cols: u16,
        rows: u16,
        mut on_output: impl FnMut(ExecOutput) + Send + 'static,
    ) -> Self {
        let mut framing = ExecFraming::new();
        let resize_handle = handle.clone();
        handle.on_receive(move |frame| {
            let (output, first) = framing.on_frame(&frame);
            if let Some(output) = output {
                on_output(output);
                if first && tty {
                    resize_handle.write(encode_resize(cols, rows).to_vec());
                }
            }
        });
        Self { handle, tty }
    }

    /// Send terminal input to the process.
    pub fn send_input(&self, input: &str) {
        self.handle.write_text(encode_input(input));
    }

    /// Report a new terminal geometry. No-op for non-TTY sessions.
    pub fn resize(&self, cols: u16, rows: u16) {
        if self.tty {
            self.handle.write(encode_resize(cols, rows).to_vec());
        }
    }

    /// Register the final close callback.
    pub fn on_close(&self, cb: impl FnMut(CloseEvent) + Send + 'static) {
        self.handle.on_close(cb);
    }

    /// End the session normally.
    pub fn close(&self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stdout_and_stderr() {
        assert_eq!(
            decode_exec_frame(b"1hi"),
            Some(ExecOutput::Stdout(b"hi".to_vec()))
        );
        assert_eq!(
            decode_exec_frame(b"2err"),
            Some(ExecOutput::Stderr(b"err".to_vec()))
        );
        assert_eq!(decode_exec_frame(b"3nope"), None);
        assert_eq!(decode_exec_frame(b""), None);
    }

    #[test]
    fn test_encode_input_prefixes_selector() {
        assert_eq!(encode_input("ls\r"), "1ls\r");
    }

    #[test]
    fn test_encode_resize_packs_geometry() {
        assert_eq!(encode_resize(80, 24), [0x72, 0, 80, 0, 24]);
        assert_eq!(encode_resize(300, 70), [0x72, 1, 44, 0, 70]);
    }

    #[test]
    fn test_framing_transitions_on_first_decoded_frame() {
        let mut framing = ExecFraming::new();
        assert_eq!(framing.phase(), ExecPhase::Handshaking);

        // Undecodable frames leave the handshake pending.
        let (out, first) = framing.on_frame(b"x?");
        assert_eq!(out, None);
        assert!(!first);
        assert_eq!(framing.phase(), ExecPhase::Handshaking);

        let (out, first) = framing.on_frame(b"1$ ");
        assert_eq!(out, Some(ExecOutput::Stdout(b"$ ".to_vec())));
        assert!(first);
        assert_eq!(framing.phase(), ExecPhase::Streaming);

        let (out, first) = framing.on_frame(b"1ls\r\n");
        assert_eq!(out, Some(ExecOutput::Stdout(b"ls\r\n".to_vec())));
        assert!(!first);
    }

    #[test]
    fn test_exec_url_query() {
        let config = ClientConfig::new("https://host", "k");
        let opts = ExecOptions {
            cmd: "/bin/sh -c 'ls'".to_string(),
            tty: true,
            interactive: true,
        };
        assert_eq!(
            exec_url(&config, "abc", &opts),
            "wss://host/api/container/abc/exec?cmd=%2Fbin%2Fsh+-c+%27ls%27&tty=1&interactive=1"
        );

        let opts = ExecOptions {
            cmd: "top".to_string(),
            tty: false,
            interactive: false,
        };
        assert_eq!(
            exec_url(&config, "abc", &opts),
            "wss://host/api/container/abc/exec?cmd=top"
        );
    }
}
