//! Containerdeck core - real-time communication for a container engine dashboard.
//!
//! This crate provides the transport layer a dashboard UI sits on top of:
//! one shared, multiplexed publish/subscribe WebSocket carrying the live
//! container/image/stats feeds, and dedicated per-operation WebSockets for
//! byte-oriented streams (log tailing, interactive exec, image pull,
//! self-update).
//!
//! # Architecture
//!
//! ```text
//! HubProvider (scoped singleton)
//!     └── SubscriptionHub ── one shared WebSocket, many indexed subscriptions
//!             └── ws (transport) ── tokio-tungstenite
//!
//! StreamSession ── one WebSocket per operation (logs / exec / pull / update)
//!     └── Pipe / TwoWayPipe ── single-slot async conduits to the consumer
//!
//! ReconnectPolicy ── caller-side retry state machine wrapping hub subscribe
//! ```
//!
//! # Modules
//!
//! - [`hub`] - Shared subscription multiplexer and its scoped singleton owner
//! - [`session`] - Per-operation stream sessions and their byte framing
//! - [`retry`] - Disconnect classification and quadratic-backoff resubscribe
//! - [`pipe`] - Single-slot asynchronous message conduits
//! - [`ws`] - Shared WebSocket transport wrapper
//! - [`protocol`] - Multiplex wire format (subscription kinds, frames)
//! - [`config`] - Client configuration and endpoint construction

pub mod config;
pub mod error;
pub mod hub;
pub mod pipe;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod ws;

// Re-export commonly used types
pub use config::ClientConfig;
pub use error::WsError;
pub use hub::{HubOptions, HubProvider, Subscription, SubscriptionError, SubscriptionHub};
pub use pipe::{Pipe, PipeWriter, TwoWayPipe};
pub use protocol::{ClientCommand, ServerFrame, SubscriptionKind};
pub use retry::{subscribe_with_retry, FeedEvent, FeedGuard, ReconnectPolicy, RetryDecision};
pub use session::{CloseEvent, PendingSession, SessionCanceler, SessionEnd, SessionHandle, StreamSession};
