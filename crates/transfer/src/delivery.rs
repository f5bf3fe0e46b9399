//! Delivery sink and the bounded buffer pool behind it.
//!
//! Completed blocks are copied into a slot from a fixed-size [`BlockPool`]
//! and pushed to the orchestrator without ever waiting. When no slot is
//! free, or the event channel has no room, the block is dropped and
//! counted; the orchestrator re-requests it later.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::EngineEvent;

/// Event-channel slots kept free for control events.
pub(crate) const CONTROL_HEADROOM: usize = 1;

// ---------------------------------------------------------------------------
// BlockPool
// ---------------------------------------------------------------------------

/// A fixed set of reusable block buffers shared with the orchestrator.
///
/// Buffers go back to the pool when the [`PooledBuffer`] holding them is
/// dropped.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Box<[u8]>>>,
    capacity: usize,
    slot_size: usize,
}

impl PoolInner {
    fn free(&self) -> MutexGuard<'_, Vec<Box<[u8]>>> {
        // The free list stays consistent even if a holder panicked.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlockPool {
    /// Creates a pool of `slots` buffers of `slot_size` bytes each.
    pub fn new(slots: usize, slot_size: usize) -> Self {
        let free = (0..slots)
            .map(|_| vec![0u8; slot_size].into_boxed_slice())
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity: slots,
                slot_size,
            }),
        }
    }

    /// Takes a free buffer, or `None` if all are in use.
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let buf = self.inner.free().pop()?;
        Some(PooledBuffer {
            buf: Some(buf),
            len: 0,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Number of free buffers.
    pub fn available(&self) -> usize {
        self.inner.free().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.inner.slot_size
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("slot_size", &self.slot_size())
            .finish()
    }
}

/// A buffer borrowed from a [`BlockPool`]. Dereferences to the filled bytes.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Copies `data` into the slot. Returns `false` if it does not fit.
    pub(crate) fn fill(&mut self, data: &[u8]) -> bool {
        let Some(buf) = self.buf.as_mut() else {
            return false;
        };
        if data.len() > buf.len() {
            return false;
        }
        buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        true
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free().push(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len).finish()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters shared between the engine task and every [`EngineHandle`](crate::EngineHandle).
#[derive(Debug, Default)]
pub struct EngineStats {
    requested: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_requested(&self) {
        self.requested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            requested: self.requested.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Block requests dispatched.
    pub requested: u64,
    /// Blocks handed to the orchestrator.
    pub received: u64,
    /// Completed blocks discarded for lack of buffer or channel space.
    pub dropped: u64,
    /// Successful in-place reconnects.
    pub reconnects: u64,
}

// ---------------------------------------------------------------------------
// DeliverySink
// ---------------------------------------------------------------------------

/// A block whose response was validated in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBlock {
    pub index: u32,
    pub length: u32,
    pub payload: Vec<u8>,
}

/// Why a completed block was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No free buffer in the pool.
    PoolExhausted,
    /// The event channel is at capacity.
    ChannelFull,
    /// The orchestrator stopped listening.
    ChannelClosed,
    /// The payload is larger than a pool slot.
    Oversized,
}

/// Result of [`DeliverySink::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Dropped(DropReason),
}

/// Hands completed blocks to the orchestrator's event channel.
#[derive(Clone)]
pub struct DeliverySink {
    pool: BlockPool,
    events: mpsc::Sender<EngineEvent>,
    stats: Arc<EngineStats>,
}

impl DeliverySink {
    pub fn new(pool: BlockPool, events: mpsc::Sender<EngineEvent>, stats: Arc<EngineStats>) -> Self {
        Self {
            pool,
            events,
            stats,
        }
    }

    /// Delivers `block` without blocking. Never retries.
    pub fn deliver(&self, block: CompletedBlock) -> DeliveryOutcome {
        let outcome = self.try_deliver(block.index, &block.payload);
        match outcome {
            DeliveryOutcome::Delivered => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                debug!(block = block.index, length = block.length, "block delivered");
            }
            DeliveryOutcome::Dropped(reason) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(block = block.index, ?reason, "block dropped");
            }
        }
        outcome
    }

    fn try_deliver(&self, index: u32, payload: &[u8]) -> DeliveryOutcome {
        if self.events.is_closed() {
            return DeliveryOutcome::Dropped(DropReason::ChannelClosed);
        }
        if self.events.capacity() <= CONTROL_HEADROOM {
            return DeliveryOutcome::Dropped(DropReason::ChannelFull);
        }
        let Some(mut slot) = self.pool.try_acquire() else {
            return DeliveryOutcome::Dropped(DropReason::PoolExhausted);
        };
        if !slot.fill(payload) {
            return DeliveryOutcome::Dropped(DropReason::Oversized);
        }

        match self.events.try_send(EngineEvent::BlockReceived {
            index,
            payload: slot,
        }) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                DeliveryOutcome::Dropped(DropReason::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                DeliveryOutcome::Dropped(DropReason::ChannelClosed)
            }
        }
    }
}
