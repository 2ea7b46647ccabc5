//! Minimal internal bookkeeping: counters the engine itself consults for
//! threshold decisions (mapped-byte tracking lives in `tunables.rs`; this
//! module is just the current/peak counters the allocation and release
//! engines bump on every call). Not a reporting subsystem — there is no
//! public stats-dump API.

use core::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct Counter {
    current: AtomicI64,
    peak: AtomicI64,
}

impl Counter {
    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Per-arena counters: live bytes handed to callers and bytes currently
/// reserved from the OS, each with a running peak.
#[derive(Default)]
pub struct ArenaStats {
    pub allocated: Counter,
    pub reserved: Counter,
}
