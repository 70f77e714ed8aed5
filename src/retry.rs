//! Disconnect classification and automatic resubscription.
//!
//! A feed that never produced data fails hard: the backend is presumed
//! unreachable and retrying would just spin. A feed that was working when
//! the transport dropped goes stale instead, and is resubscribed through a
//! fresh hub with quadratically growing delays until data flows again.

use log::{debug, warn};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::hub::{HubProvider, SubscriptionError};
use crate::protocol::SubscriptionKind;

/// What to do about a subscription error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Stop; surface a persistent error.
    Fatal,
    /// Resubscribe after the given delay.
    RetryAfter(Duration),
}

/// Per-feed retry state machine.
///
/// Feed every payload through [`on_data`](Self::on_data) and every error
/// through [`on_error`](Self::on_error); the policy tracks whether the feed
/// ever worked and how many consecutive attempts have failed.
#[derive(Debug, Default)]
pub struct ReconnectPolicy {
    received: u64,
    attempt: u32,
    stale: bool,
}

impl ReconnectPolicy {
    /// Fresh policy: no data seen, no failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a payload. Returns true when this payload ends a stale
    /// period, i.e. the resubscription worked and the caller may clear its
    /// warning.
    pub fn on_data(&mut self) -> bool {
        self.received += 1;
        if self.stale {
            self.stale = false;
            self.attempt = 0;
            return true;
        }
        false
    }

    /// Whether the feed is currently in a stale period.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Classify an error into a retry decision.
    ///
    /// Errors before any data are fatal, as are failures that demand user
    /// action (no login, unreachable backend, expired token). Everything
    /// else gets a retry after `attempt² × 1s`.
    pub fn on_error(&mut self, err: &SubscriptionError) -> RetryDecision {
        if self.received == 0 {
            return RetryDecision::Fatal;
        }
        if let SubscriptionError::Transport(e) = err {
            if e.is_connect() || *e == crate::error::WsError::AuthExpired {
                return RetryDecision::Fatal;
            }
        }
        self.stale = true;
        self.attempt += 1;
        RetryDecision::RetryAfter(Duration::from_millis(
            1000 * u64::from(self.attempt) * u64::from(self.attempt),
        ))
    }
}

/// Events emitted by a retrying feed.
#[derive(Debug)]
pub enum FeedEvent {
    /// A payload arrived.
    Data(Value),
    /// The feed broke after having worked; resubscription is underway. The
    /// caller should mark the shown data as possibly outdated.
    Stale,
    /// A resubscription produced data again; the stale warning can go.
    Restored,
    /// The feed is over. No more events follow.
    Failed(SubscriptionError),
}

/// Stops the retry loop when dropped.
#[derive(Debug)]
pub struct FeedGuard {
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

enum Signal {
    Data(Value),
    Error(SubscriptionError),
}

/// Subscribe to a feed with automatic resubscription on transient failures.
///
/// Returns the event stream and a guard; dropping the guard unsubscribes
/// and ends the loop.
pub fn subscribe_with_retry(
    provider: &HubProvider,
    kind: SubscriptionKind,
    arg: Option<Value>,
) -> (mpsc::UnboundedReceiver<FeedEvent>, FeedGuard) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();

    tokio::spawn(run_feed(provider.clone(), kind, arg, event_tx, stop_rx));

    (event_rx, FeedGuard { stop: Some(stop_tx) })
}

async fn run_feed(
    provider: HubProvider,
    kind: SubscriptionKind,
    arg: Option<Value>,
    event_tx: mpsc::UnboundedSender<FeedEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut policy = ReconnectPolicy::new();

    loop {
        let hub = match provider.hub() {
            Ok(hub) => hub,
            Err(e) => {
                let _ = event_tx.send(FeedEvent::Failed(SubscriptionError::Transport(e)));
                return;
            }
        };

        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
        let data_tx = sig_tx.clone();
        let sub = hub.subscribe(
            kind,
            arg.clone(),
            move |value| {
                let _ = data_tx.send(Signal::Data(value));
            },
            move |err| {
                let _ = sig_tx.send(Signal::Error(err));
            },
        );

        // Consume this subscription until it errors or we are stopped.
        let err = loop {
            tokio::select! {
                sig = sig_rx.recv() => match sig {
                    Some(Signal::Data(value)) => {
                        if policy.on_data() {
                            debug!("feed {kind:?} restored");
                            if event_tx.send(FeedEvent::Restored).is_err() {
                                sub.unsubscribe();
                                return;
                            }
                        }
                        if event_tx.send(FeedEvent::Data(value)).is_err() {
                            sub.unsubscribe();
                            return;
                        }
                    }
                    Some(Signal::Error(err)) => break err,
                    // Both callbacks gone without an error; nothing more
                    // can arrive.
                    None => return,
                },
                _ = &mut stop_rx => {
                    sub.unsubscribe();
                    return;
                }
            }
        };

        let was_stale = policy.is_stale();
        match policy.on_error(&err) {
            RetryDecision::Fatal => {
                warn!("feed {kind:?} failed permanently: {err}");
                let _ = event_tx.send(FeedEvent::Failed(err));
                return;
            }
            RetryDecision::RetryAfter(delay) => {
                debug!("feed {kind:?} stale, resubscribing in {delay:?}");
                if !was_stale && event_tx.send(FeedEvent::Stale).is_err() {
                    return;
                }
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = &mut stop_rx => return,
                }
            }
        }
    }
}
