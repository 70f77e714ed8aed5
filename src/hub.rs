//! Shared subscription multiplexer.
//!
//! One WebSocket carries every live feed the dashboard shows. Each
//! subscription gets a connection-scoped index; the server echoes that index
//! on every frame so the hub can route payloads to callbacks without
//! understanding them.
//!
//! # Architecture
//!
//! ```text
//! HubProvider ─ owns at most one live hub, replaces it after retirement
//!     │
//!     ▼
//! SubscriptionHub (handle) ──mpsc──▶ actor task
//!     │                                │ connecting: queue commands
//!     ▼                                │ ready: route frames by index
//! Subscription (RAII unsubscribe)      │ idle timer when no subscribers
//! ```
//!
//! The actor owns the socket exclusively. Subscribing before the socket is
//! open queues the request; queued subscriptions are flushed in order on
//! open. Any transport failure is broadcast to every subscriber exactly once
//! and the hub retires; callers resubscribe through a fresh hub obtained
//! from the provider.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::WsError;
use crate::protocol::{parse_server_frame, ClientCommand, SubscriptionKind};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// How a single subscription ends abnormally.
#[derive(Debug, Clone)]
pub enum SubscriptionError {
    /// The server rejected or terminated this one subscription; the payload
    /// is its error value. The connection and other subscriptions live on.
    Remote(Value),
    /// The shared transport failed; every subscription on the hub receives
    /// this simultaneously and the hub retires.
    Transport(WsError),
}

impl std::fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(v) => write!(f, "subscription rejected: {v}"),
            Self::Transport(e) => write!(f, "subscription transport failed: {e}"),
        }
    }
}

impl std::error::Error for SubscriptionError {}

/// Tunables for a hub connection.
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// How long the hub keeps an open socket with zero subscribers before
    /// closing it (code 1000) and retiring.
    pub idle_close: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            idle_close: Duration::from_secs(15),
        }
    }
}

type DataCallback = Box<dyn FnMut(Value) + Send + 'static>;
type ErrorCallback = Box<dyn FnOnce(SubscriptionError) + Send + 'static>;

enum HubCommand {
    Subscribe {
        index: u64,
        kind: SubscriptionKind,
        arg: Option<Value>,
        on_data: DataCallback,
        on_error: ErrorCallback,
    },
    Unsubscribe {
        index: u64,
    },
}

/// Handle to one multiplexed pub/sub connection.
///
/// Obtained from [`HubProvider::hub`]. Cheap to clone through its `Arc`; the
/// connection lives until every subscriber is gone plus the idle window, or
/// until the transport fails.
pub struct SubscriptionHub {
    next_index: Arc<AtomicU64>,
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHub {
    /// Start a hub connection.
    ///
    /// Fails synchronously only with [`WsError::NoLogin`]; network failures
    /// surface asynchronously through each subscription's error callback.
    /// `on_retired` runs exactly once when the hub stops serving, whatever
    /// the cause.
    pub fn connect(
        config: &ClientConfig,
        options: HubOptions,
        on_retired: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Self>, WsError> {
        let token = config.require_token()?.to_string();
        let url = config.subscribe_url();

        let next_index = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let actor = HubActor {
            url,
            token,
            options,
            cmd_rx,
            next_index: Arc::clone(&next_index),
            closed: Arc::clone(&closed),
            on_retired: Some(Box::new(on_retired)),
        };
        tokio::spawn(actor.run());

        Ok(Arc::new(Self {
            next_index,
            cmd_tx,
            closed,
        }))
    }

    /// Whether this hub has retired. A retired hub accepts no new
    /// subscriptions; ask the provider for a fresh one.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to a feed.
    ///
    /// `on_data` fires for every payload, including `null`. `on_error` fires
    /// at most once and ends the subscription. Subscribing on a retired hub
    /// reports a transport error asynchronously and returns an inert handle.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe(
        &self,
        kind: SubscriptionKind,
        arg: Option<Value>,
        on_data: impl FnMut(Value) + Send + 'static,
        on_error: impl FnOnce(SubscriptionError) + Send + 'static,
    ) -> Subscription {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let cmd = HubCommand::Subscribe {
            index,
            kind,
            arg,
            on_data: Box::new(on_data),
            on_error: Box::new(on_error),
        };

        if self.is_closed() {
            report_closed(cmd);
            return Subscription { inner: None };
        }
        if let Err(mpsc::error::SendError(cmd)) = self.cmd_tx.send(cmd) {
            report_closed(cmd);
            return Subscription { inner: None };
        }

        Subscription {
            inner: Some((index, self.cmd_tx.clone())),
        }
    }
}

/// Fire the error callback of a subscribe attempt that never reached the
/// actor. Deferred so the caller's error path never runs inline.
fn report_closed(cmd: HubCommand) {
    if let HubCommand::Subscribe { on_error, .. } = cmd {
        tokio::spawn(async move {
            on_error(SubscriptionError::Transport(WsError::Disconnect {
                code: ws::CLOSE_ABNORMAL,
                reason: "connection closed".to_string(),
            }));
        });
    }
}

/// RAII handle for one subscription; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    inner: Option<(u64, mpsc::UnboundedSender<HubCommand>)>,
}

impl Subscription {
    /// Unsubscribe explicitly. Fire-and-forget: no acknowledgement is
    /// awaited, matching the drop path.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some((index, tx)) = self.inner.take() {
            let _ = tx.send(HubCommand::Unsubscribe { index });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

struct ActiveSub {
    kind: SubscriptionKind,
    on_data: DataCallback,
    on_error: Option<ErrorCallback>,
}

struct PendingSub {
    index: u64,
    kind: SubscriptionKind,
    arg: Option<Value>,
    on_data: DataCallback,
    on_error: ErrorCallback,
}

struct HubActor {
    url: String,
    token: String,
    options: HubOptions,
    cmd_rx: mpsc::UnboundedReceiver<HubCommand>,
    next_index: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    on_retired: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl HubActor {
    async fn run(mut self) {
        if let Some((writer, reader, active)) = self.connect_phase().await {
            self.ready_phase(writer, reader, active).await;
        }
        self.cmd_rx.close();
        self.retire();
        // Subscribes that raced retirement still get their error callback.
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            report_closed(cmd);
        }
    }

    /// Mark the hub closed and notify the owner. Called exactly once, at the
    /// end of `run`.
    fn retire(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(cb) = self.on_retired.take() {
            cb();
        }
        debug!("hub retired");
    }

    /// Dial the socket while queueing early subscribe requests, then flush
    /// the queue in arrival order. Returns `None` if the hub is already done.
    async fn connect_phase(
        &mut self,
    ) -> Option<(WsWriter, WsReader, HashMap<u64, ActiveSub>)> {
        let mut pending: Vec<PendingSub> = Vec::new();
        let mut connect = pin!(ws::connect(&self.url));

        let (mut writer, reader) = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(pair) => break pair,
                    Err(e) => {
                        warn!("hub connect failed: {e}");
                        for sub in pending {
                            (sub.on_error)(SubscriptionError::Transport(e.clone()));
                        }
                        return None;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(HubCommand::Subscribe { index, kind, arg, on_data, on_error }) => {
                        pending.push(PendingSub { index, kind, arg, on_data, on_error });
                    }
                    Some(HubCommand::Unsubscribe { index }) => {
                        // Never reached the wire, so nothing to tell the server
                        pending.retain(|p| p.index != index);
                    }
                    None => return None,
                },
            }
        };

        if let Err(e) = writer.send_text(&self.token).await {
            let e = WsError::Connect(format!("token handshake failed: {e}"));
            for sub in pending {
                (sub.on_error)(SubscriptionError::Transport(e.clone()));
            }
            return None;
        }

        let mut active = HashMap::new();
        for sub in pending {
            let cmd = ClientCommand::subscribe(sub.index, sub.kind, sub.arg.clone());
            active.insert(
                sub.index,
                ActiveSub {
                    kind: sub.kind,
                    on_data: sub.on_data,
                    on_error: Some(sub.on_error),
                },
            );
            if let Err(e) = writer.send_text(&cmd.to_json()).await {
                broadcast(&mut active, &e);
                return None;
            }
        }

        debug!("hub connected with {} initial subscriptions", active.len());
        Some((writer, reader, active))
    }

    /// Main loop: route inbound frames by index, apply commands, close the
    /// socket after the idle window once the last subscriber is gone.
    async fn ready_phase(
        &mut self,
        mut writer: WsWriter,
        mut reader: WsReader,
        mut active: HashMap<u64, ActiveSub>,
    ) {
        let mut idle_deadline = if active.is_empty() {
            Some(Instant::now() + self.options.idle_close)
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = idle_wait(idle_deadline) => {
                    debug!("hub idle for {:?}, closing", self.options.idle_close);
                    if let Err(e) = writer.close_with(ws::CLOSE_NORMAL, "idle").await {
                        warn!("hub idle close failed: {e}");
                    }
                    return;
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(HubCommand::Subscribe { index, kind, arg, on_data, on_error }) => {
                        idle_deadline = None;
                        let cmd = ClientCommand::subscribe(index, kind, arg);
                        active.insert(index, ActiveSub {
                            kind,
                            on_data,
                            on_error: Some(on_error),
                        });
                        if let Err(e) = writer.send_text(&cmd.to_json()).await {
                            broadcast(&mut active, &e);
                            return;
                        }
                    }
                    Some(HubCommand::Unsubscribe { index }) => {
                        let Some(sub) = active.remove(&index) else { continue };
                        // The command consumes a fresh index; no response is
                        // expected for it
                        let cmd_index = self.next_index.fetch_add(1, Ordering::SeqCst);
                        let cmd = ClientCommand::unsubscribe(cmd_index, sub.kind, index);
                        if let Err(e) = writer.send_text(&cmd.to_json()).await {
                            broadcast(&mut active, &e);
                            return;
                        }
                        if active.is_empty() {
                            idle_deadline = Some(Instant::now() + self.options.idle_close);
                        }
                    }
                    None => {
                        // Every handle dropped; nothing can subscribe again
                        if let Err(e) = writer.close_with(ws::CLOSE_NORMAL, "client released").await {
                            warn!("hub close failed: {e}");
                        }
                        return;
                    }
                },

                msg = reader.recv() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let frame = match parse_server_frame(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("hub received unparseable frame: {e}");
                                broadcast(&mut active, &e);
                                let _ = writer
                                    .close_with(ws::CLOSE_PROTOCOL_ERROR, "invalid message")
                                    .await;
                                return;
                            }
                        };
                        if frame.error {
                            let Some(mut sub) = active.remove(&frame.index) else {
                                continue;
                            };
                            if let Some(on_error) = sub.on_error.take() {
                                on_error(SubscriptionError::Remote(frame.data));
                            }
                            if active.is_empty() {
                                idle_deadline = Some(Instant::now() + self.options.idle_close);
                            }
                        } else if let Some(sub) = active.get_mut(&frame.index) {
                            (sub.on_data)(frame.data);
                        }
                        // Frames for unknown indices are tail frames of feeds
                        // we already unsubscribed; ignore them.
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        let e = WsError::Protocol("unexpected binary frame".to_string());
                        broadcast(&mut active, &e);
                        let _ = writer
                            .close_with(ws::CLOSE_PROTOCOL_ERROR, "invalid message")
                            .await;
                        return;
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if let Err(e) = writer.send_pong(payload).await {
                            broadcast(&mut active, &e);
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        let e = WsError::from_close(code, &reason);
                        warn!("hub socket closed by server: {e}");
                        broadcast(&mut active, &e);
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("hub socket error: {e}");
                        broadcast(&mut active, &e);
                        return;
                    }
                    None => {
                        let e = WsError::Disconnect {
                            code: ws::CLOSE_ABNORMAL,
                            reason: String::new(),
                        };
                        broadcast(&mut active, &e);
                        return;
                    }
                },
            }
        }
    }
}

/// Sleep until the idle deadline, or forever when there is none.
async fn idle_wait(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Deliver a transport failure to every remaining subscriber, once each.
fn broadcast(active: &mut HashMap<u64, ActiveSub>, err: &WsError) {
    for (_, mut sub) in active.drain() {
        if let Some(on_error) = sub.on_error.take() {
            on_error(SubscriptionError::Transport(err.clone()));
        }
    }
}

struct ProviderSlot {
    generation: u64,
    hub: Option<Arc<SubscriptionHub>>,
}

/// Scoped owner of at most one live [`SubscriptionHub`].
///
/// Cloning the provider shares the slot. Every caller asks the provider for
/// the current hub; when the hub retires (idle close, failure, auth expiry)
/// the slot empties itself and the next `hub()` call dials a fresh
/// connection.
#[derive(Clone)]
pub struct HubProvider {
    config: ClientConfig,
    options: HubOptions,
    slot: Arc<Mutex<ProviderSlot>>,
}

impl std::fmt::Debug for HubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubProvider")
            .field("config", &self.config)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl HubProvider {
    /// Create a provider. No connection is dialed until [`hub`](Self::hub)
    /// is first called.
    pub fn new(config: ClientConfig, options: HubOptions) -> Self {
        Self {
            config,
            options,
            slot: Arc::new(Mutex::new(ProviderSlot {
                generation: 0,
                hub: None,
            })),
        }
    }

    /// The live hub, dialing a new connection if the previous one retired.
    pub fn hub(&self) -> Result<Arc<SubscriptionHub>, WsError> {
        let mut slot = self.slot.lock().expect("provider slot lock poisoned");

        if let Some(hub) = &slot.hub {
            if !hub.is_closed() {
                return Ok(Arc::clone(hub));
            }
        }

        slot.generation += 1;
        let generation = slot.generation;
        let weak: Weak<Mutex<ProviderSlot>> = Arc::downgrade(&self.slot);
        let hub = SubscriptionHub::connect(&self.config, self.options.clone(), move || {
            let Some(strong) = weak.upgrade() else { return };
            let mut slot = strong.lock().expect("provider slot lock poisoned");
            // A newer hub may already occupy the slot; only clear our own
            if slot.generation == generation {
                slot.hub = None;
            }
        })?;
        slot.hub = Some(Arc::clone(&hub));
        Ok(hub)
    }
}
