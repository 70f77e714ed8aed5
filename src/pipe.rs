//! Single-slot asynchronous message conduits.
//!
//! A [`Pipe`] decouples a producer from a consumer that may wire up in either
//! order: writes are delivered on a later turn of the runtime, never inline,
//! so a producer can safely write before the consumer has attached. Until
//! the first receiver attaches, writes are buffered and replayed in order on
//! attach; the producer and consumer live on different tasks, so nothing
//! guarantees the consumer wires up before the first delivery. Once a
//! receiver has been deregistered, writes are dropped (the consumer opted
//! out; at-most-once from then on).
//!
//! [`TwoWayPipe`] composes two pipes into a left/right pair so each side has
//! its own `write`/`set_receiver`, which is how a stream session bridges its
//! byte protocol to a terminal-emulator-like consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Receiver<T> = Box<dyn FnMut(T) + Send + 'static>;

enum Slot<T> {
    /// No receiver has ever attached; writes queue until one does.
    Buffering(VecDeque<T>),
    Attached(Receiver<T>),
    /// A receiver was deregistered; writes are dropped.
    Detached,
}

/// A unidirectional single-slot conduit. Pure scheduling primitive; it
/// cannot fail.
pub struct Pipe<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> std::fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe").finish_non_exhaustive()
    }
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Send + 'static> Default for Pipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Pipe<T> {
    /// Create an empty pipe with no receiver attached.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Buffering(VecDeque::new()))),
        }
    }

    /// A cloneable writer handle for this pipe.
    pub fn writer(&self) -> PipeWriter<T> {
        PipeWriter {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Register the receiver, replacing any previous one. Only one receiver
    /// is attached at a time. Messages written before the first receiver
    /// attached are replayed to it in write order.
    pub fn set_receiver(&self, cb: impl FnMut(T) + Send + 'static) {
        let mut cb: Receiver<T> = Box::new(cb);
        let mut slot = self.slot.lock().expect("pipe slot lock poisoned");
        if let Slot::Buffering(buffered) = &mut *slot {
            for msg in buffered.drain(..) {
                cb(msg);
            }
        }
        *slot = Slot::Attached(cb);
    }

    /// Deregister the current receiver. Subsequent deliveries are dropped,
    /// never buffered again.
    pub fn clear_receiver(&self) {
        let mut slot = self.slot.lock().expect("pipe slot lock poisoned");
        *slot = Slot::Detached;
    }
}

/// Writer half of a [`Pipe`]. Cloneable so a producer can be handed out
/// without exposing the receiver slot.
pub struct PipeWriter<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> std::fmt::Debug for PipeWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

impl<T> Clone for PipeWriter<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Send + 'static> PipeWriter<T> {
    /// Schedule `msg` for delivery to whichever receiver is registered when
    /// the spawned task runs. Never delivers inline; buffers until the first
    /// receiver attaches, drops once a receiver has been deregistered.
    ///
    /// Must be called from within a tokio runtime.
    pub fn write(&self, msg: T) {
        let slot = Arc::clone(&self.slot);
        tokio::spawn(async move {
            let mut slot = slot.lock().expect("pipe slot lock poisoned");
            match &mut *slot {
                Slot::Buffering(buffered) => buffered.push_back(msg),
                Slot::Attached(cb) => cb(msg),
                Slot::Detached => {}
            }
        });
    }
}

/// One side of a [`TwoWayPipe`]: writes travel to the opposite side's
/// receiver.
pub struct PipeSide<T> {
    writer: PipeWriter<T>,
    inbound: Pipe<T>,
}

impl<T> std::fmt::Debug for PipeSide<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeSide").finish_non_exhaustive()
    }
}

impl<T> Clone for PipeSide<T> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            inbound: self.inbound.clone(),
        }
    }
}

impl<T: Send + 'static> PipeSide<T> {
    /// Write toward the opposite side.
    pub fn write(&self, msg: T) {
        self.writer.write(msg);
    }

    /// A cloneable writer toward the opposite side.
    pub fn writer(&self) -> PipeWriter<T> {
        self.writer.clone()
    }

    /// Receive messages written by the opposite side.
    pub fn set_receiver(&self, cb: impl FnMut(T) + Send + 'static) {
        self.inbound.set_receiver(cb);
    }

    /// Stop receiving messages from the opposite side.
    pub fn clear_receiver(&self) {
        self.inbound.clear_receiver();
    }
}

/// Two independent unidirectional pipes composed into a left/right pair.
#[derive(Debug)]
pub struct TwoWayPipe<T> {
    left: PipeSide<T>,
    right: PipeSide<T>,
}

impl<T: Send + 'static> Default for TwoWayPipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TwoWayPipe<T> {
    /// Create a pipe pair. Left writes arrive at right's receiver and vice
    /// versa.
    pub fn new() -> Self {
        let to_right = Pipe::new();
        let to_left = Pipe::new();
        let left = PipeSide {
            writer: to_right.writer(),
            inbound: to_left.clone(),
        };
        let right = PipeSide {
            writer: to_left.writer(),
            inbound: to_right,
        };
        Self { left, right }
    }

    /// The left side. Clones share the underlying pipes.
    pub fn left(&self) -> PipeSide<T> {
        self.left.clone()
    }

    /// The right side. Clones share the underlying pipes.
    pub fn right(&self) -> PipeSide<T> {
        self.right.clone()
    }

    /// Consume the pair into its two sides.
    pub fn split(self) -> (PipeSide<T>, PipeSide<T>) {
        (self.left, self.right)
    }
}
