//! Deferred packets from unknown sources.
//!
//! A packet that cannot be authenticated because its sender's identity is
//! unknown is parked here, keyed by source address, while WHOIS lookups are
//! retried against the root. The queue is bounded per source and entries are
//! abandoned after a few unanswered retries, so a spoofed-source flood cannot
//! pin buffers indefinitely.

use crate::path::Path;
use meshwire_proto::{Address, Slice};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Minimum spacing between WHOIS requests for the same address.
pub const WHOIS_RETRY_DELAY_MS: i64 = 500;

/// Unanswered retries after which an entry (and its parked packets) is
/// dropped.
pub const MAX_WHOIS_RETRIES: u8 = 4;

/// Parked packets per source; older ones are evicted first.
pub const MAX_PENDING_PACKETS_PER_SOURCE: usize = 8;

/// A packet awaiting its sender's identity, with the path it arrived on.
pub struct PendingPacket {
    pub path: Arc<Path>,
    pub packet: Slice,
}

struct QueueItem {
    last_retry: i64,
    retries: u8,
    pending: VecDeque<PendingPacket>,
}

/// Map from unknown source address to parked packets plus retry metadata.
#[derive(Default)]
pub struct WhoisQueue {
    inner: Mutex<HashMap<Address, QueueItem>>,
}

impl WhoisQueue {
    pub fn new() -> Self {
        WhoisQueue::default()
    }

    /// Park a packet for `source`. A new entry's retry clock starts at `now`,
    /// so the first WHOIS goes out one retry delay after first sight.
    pub fn enqueue(&self, source: Address, path: Arc<Path>, packet: Slice, now: i64) {
        let mut inner = self.inner.lock();
        let item = inner.entry(source).or_insert_with(|| QueueItem {
            last_retry: now,
            retries: 0,
            pending: VecDeque::new(),
        });
        if item.pending.len() >= MAX_PENDING_PACKETS_PER_SOURCE {
            item.pending.pop_front();
        }
        item.pending.push_back(PendingPacket { path, packet });
    }

    /// Collect the addresses whose retry timer has elapsed, stamping their
    /// retry state. Exhausted entries are dropped instead of collected. The
    /// caller performs the actual sends after this returns, outside the lock.
    pub fn due(&self, now: i64) -> Vec<Address> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        inner.retain(|&address, item| {
            if now - item.last_retry < WHOIS_RETRY_DELAY_MS {
                return true;
            }
            if item.retries >= MAX_WHOIS_RETRIES {
                return false;
            }
            item.last_retry = now;
            item.retries += 1;
            out.push(address);
            true
        });
        out
    }

    /// Remove and return everything parked for `source` (its identity has
    /// been learned).
    pub fn take(&self, source: Address) -> Vec<PendingPacket> {
        self.inner
            .lock()
            .remove(&source)
            .map(|item| item.pending.into())
            .unwrap_or_default()
    }

    /// Number of sources with parked packets.
    pub fn pending_sources(&self) -> usize {
        self.inner.lock().len()
    }

    /// Number of packets parked for `source`.
    pub fn pending_for(&self, source: Address) -> usize {
        self.inner
            .lock()
            .get(&source)
            .map(|item| item.pending.len())
            .unwrap_or(0)
    }
}
