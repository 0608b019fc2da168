use core::sync::atomic::{AtomicU64, Ordering};

/// Per-connection counters. Advisory only: updated without ordering guarantees.
#[derive(Debug, Default)]
pub struct BusStats {
    resets: AtomicU64,
    reset_errors: AtomicU64,
    shorts: AtomicU64,
    searches: AtomicU64,
    search_errors: AtomicU64,
    devices_found: AtomicU64,
    transactions: AtomicU64,
    transaction_errors: AtomicU64,
    crc_errors: AtomicU64,
    timeouts: AtomicU64,
    reconnects: AtomicU64,
    reconnect_failures: AtomicU64,
}

/// A copy of [`BusStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bus resets issued.
    pub resets: u64,
    /// Resets that failed or did not reach the adapter.
    pub reset_errors: u64,
    /// Resets that found the bus shorted.
    pub shorts: u64,
    /// Search passes started.
    pub searches: u64,
    /// Search passes aborted.
    pub search_errors: u64,
    /// Devices reported by searches.
    pub devices_found: u64,
    /// Transactions and sendbacks run.
    pub transactions: u64,
    /// Transactions and sendbacks that failed.
    pub transaction_errors: u64,
    /// CRC8 and CRC16 failures.
    pub crc_errors: u64,
    /// Adapter timeouts.
    pub timeouts: u64,
    /// Reconnect attempts.
    pub reconnects: u64,
    /// Reconnect attempts that failed.
    pub reconnect_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BusStats {
    pub(crate) fn reset(&self) {
        bump(&self.resets)
    }

    pub(crate) fn reset_error(&self) {
        bump(&self.reset_errors)
    }

    pub(crate) fn short(&self) {
        bump(&self.shorts)
    }

    pub(crate) fn search(&self) {
        bump(&self.searches)
    }

    pub(crate) fn search_error(&self) {
        bump(&self.search_errors)
    }

    pub(crate) fn found(&self, devices: usize) {
        self.devices_found.fetch_add(devices as u64, Ordering::Relaxed);
    }

    pub(crate) fn transaction(&self) {
        bump(&self.transactions)
    }

    pub(crate) fn reconnect(&self) {
        bump(&self.reconnects)
    }

    pub(crate) fn reconnect_failure(&self) {
        bump(&self.reconnect_failures)
    }

    /// Counts a failed transaction by its cause.
    pub(crate) fn error(&self, e: &crate::BusError) {
        bump(&self.transaction_errors);
        match e {
            crate::BusError::Crc => bump(&self.crc_errors),
            crate::BusError::Timeout => bump(&self.timeouts),
            _ => {}
        }
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            resets: load(&self.resets),
            reset_errors: load(&self.reset_errors),
            shorts: load(&self.shorts),
            searches: load(&self.searches),
            search_errors: load(&self.search_errors),
            devices_found: load(&self.devices_found),
            transactions: load(&self.transactions),
            transaction_errors: load(&self.transaction_errors),
            crc_errors: load(&self.crc_errors),
            timeouts: load(&self.timeouts),
            reconnects: load(&self.reconnects),
            reconnect_failures: load(&self.reconnect_failures),
        }
    }
}
