//! [`FaultLog`] – bounded ring of fault records.
//!
//! The control thread appends; any number of monitors drain.  Appending
//! never blocks: when the ring is full the oldest record is discarded to make
//! room, and the discard is counted.  Built on a bounded `crossbeam-channel`,
//! whose array flavour is lock-free.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use biped_types::FaultRecord;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{error, warn};

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    overwritten: AtomicU64,
}

/// Overwrite-oldest fault ring.  Clones share the same ring.
#[derive(Debug, Clone)]
pub struct FaultLog {
    tx: Sender<FaultRecord>,
    rx: Receiver<FaultRecord>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl FaultLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `record`, evicting the oldest entry if the ring is full.
    pub fn push(&self, record: FaultRecord) {
        if record.fatal {
            error!(kind = %record.kind, joint = ?record.joint, tick = record.tick, detail = %record.detail, "fatal fault");
        } else {
            warn!(kind = %record.kind, joint = ?record.joint, tick = record.tick, detail = %record.detail, "fault");
        }
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let mut pending = record;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.counters.overwritten.fetch_add(1, Ordering::Relaxed);
                    }
                    pending = back;
                }
                // We hold a receiver ourselves, so the channel cannot close.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Remove and return every record currently in the ring, oldest first.
    pub fn drain(&self) -> Vec<FaultRecord> {
        self.rx.try_iter().collect()
    }

    /// Records currently held.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Records ever appended.
    pub fn total(&self) -> u64 {
        self.counters.total.load(Ordering::Relaxed)
    }

    /// Records discarded to make room for newer ones.
    pub fn overwritten(&self) -> u64 {
        self.counters.overwritten.load(Ordering::Relaxed)
    }
}
