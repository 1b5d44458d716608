//! Traffic counters
//!
//! Shared between the session task and the owner, so reads never touch
//! session state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Byte counters for one session, cheap to clone and read concurrently.
#[derive(Debug, Default)]
pub struct DataCount {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
}

impl DataCount {
    /// Fresh shared counter.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record one decrypted inbound packet.
    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one encrypted outbound packet.
    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// (bytes in, bytes out)
    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    /// (packets in, packets out)
    pub fn packets(&self) -> (u64, u64) {
        (
            self.packets_in.load(Ordering::Relaxed),
            self.packets_out.load(Ordering::Relaxed),
        )
    }
}
