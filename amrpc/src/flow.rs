//! Flow control: the `requested` / `acknowledged` quiescence barrier.
//!
//! The dispatcher bumps `requested` by the number of envelopes in each batch
//! before the batch is handed to the transport, and the ack handler bumps
//! `acknowledged` after a whole reply batch has been applied. The process is
//! quiescent when the two are equal.
//!
//! Resetting both counters takes two steps. An `epoch` counter, odd while a
//! reset is in progress, lets [`FlowControl::is_quiescent`] retry instead of
//! comparing one pre-reset and one post-reset value.

use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::progress::Driver;

/// A counter on its own cache line so that dispatching threads and the
/// thread running the ack handler do not false-share.
#[repr(C, align(64))]
struct PaddedCounter(AtomicU64);

impl PaddedCounter {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }
}

/// Process-wide monotonic request/acknowledge counters.
pub struct FlowControl {
    requested: PaddedCounter,
    acknowledged: PaddedCounter,
    epoch: PaddedCounter,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl {
    pub const fn new() -> Self {
        Self {
            requested: PaddedCounter::new(),
            acknowledged: PaddedCounter::new(),
            epoch: PaddedCounter::new(),
        }
    }

    /// Records `n` envelopes as sent.
    #[inline]
    pub fn request(&self, n: usize) {
        self.requested.0.fetch_add(n as u64, Ordering::AcqRel);
    }

    /// Takes back `n` envelopes recorded by [`request`](Self::request) whose
    /// batch the transport refused.
    #[inline]
    pub(crate) fn cancel(&self, n: usize) {
        self.requested.0.fetch_sub(n as u64, Ordering::AcqRel);
    }

    /// Records `n` envelopes as acknowledged.
    #[inline]
    pub fn acknowledge(&self, n: usize) {
        self.acknowledged.0.fetch_add(n as u64, Ordering::AcqRel);
    }

    #[inline]
    pub fn requested(&self) -> u64 {
        self.requested.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.0.load(Ordering::Acquire)
    }

    /// Returns true when every envelope sent so far has been acknowledged.
    ///
    /// Never true while a [`reset`](Self::reset) is halfway through.
    pub fn is_quiescent(&self) -> bool {
        loop {
            let epoch = self.epoch.0.load(Ordering::SeqCst);
            if epoch % 2 == 1 {
                return false;
            }
            // `acknowledged` first: it never exceeds `requested`, so a
            // request between the two loads can only read as "not yet".
            let acknowledged = self.acknowledged.0.load(Ordering::SeqCst);
            let requested = self.requested.0.load(Ordering::SeqCst);
            if self.epoch.0.load(Ordering::SeqCst) == epoch {
                return acknowledged >= requested;
            }
        }
    }

    /// Spins on `driver` until the counters meet.
    pub fn wait_quiescent(&self, driver: &Driver) {
        driver.wait_until(|| self.is_quiescent());
    }

    /// Subtracts the current count from both counters if they are equal,
    /// otherwise returns the observed `(requested, acknowledged)` pair.
    ///
    /// Requests issued concurrently are kept. Concurrent resets run one at a
    /// time. [`requested`](Self::requested) and
    /// [`acknowledged`](Self::acknowledged) read individually may straddle
    /// a reset; use [`is_quiescent`](Self::is_quiescent) to compare them.
    pub fn reset(&self) -> Result<(), (u64, u64)> {
        let mut epoch = self.epoch.0.load(Ordering::SeqCst);
        loop {
            if epoch % 2 == 1 {
                hint::spin_loop();
                epoch = self.epoch.0.load(Ordering::SeqCst);
                continue;
            }
            match self.epoch.0.compare_exchange_weak(
                epoch,
                epoch + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => epoch = current,
            }
        }

        let acknowledged = self.acknowledged.0.load(Ordering::SeqCst);
        let requested = self.requested.0.load(Ordering::SeqCst);
        let result = if requested == acknowledged {
            self.acknowledged.0.fetch_sub(acknowledged, Ordering::SeqCst);
            self.requested.0.fetch_sub(requested, Ordering::SeqCst);
            Ok(())
        } else {
            Err((requested, acknowledged))
        };
        self.epoch.0.fetch_add(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use crate::config::WaitStrategy;

    #[test]
    fn test_counters() {
        let flow = FlowControl::new();
        assert!(flow.is_quiescent());

        flow.request(3);
        assert_eq!(flow.requested(), 3);
        assert!(!flow.is_quiescent());

        flow.acknowledge(2);
        assert!(!flow.is_quiescent());
        flow.acknowledge(1);
        assert!(flow.is_quiescent());
        assert_eq!(flow.acknowledged(), 3);
    }

    #[test]
    fn test_cancel() {
        let flow = FlowControl::new();
        flow.request(4);
        flow.cancel(4);
        assert_eq!(flow.requested(), 0);
        assert!(flow.is_quiescent());
    }

    #[test]
    fn test_reset() {
        let flow = FlowControl::new();
        flow.request(2);
        assert_eq!(flow.reset(), Err((2, 0)));

        flow.acknowledge(2);
        assert_eq!(flow.reset(), Ok(()));
        assert_eq!(flow.requested(), 0);
        assert_eq!(flow.acknowledged(), 0);
    }

    #[test]
    fn test_concurrent_counts() {
        let flow = Arc::new(FlowControl::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let flow = Arc::clone(&flow);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        flow.request(1);
                        flow.acknowledge(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(flow.requested(), 40_000);
        assert_eq!(flow.acknowledged(), 40_000);
    }

    #[test]
    fn test_wait_quiescent_external() {
        let flow = Arc::new(FlowControl::new());
        flow.request(1);

        let acker = {
            let flow = Arc::clone(&flow);
            thread::spawn(move || flow.acknowledge(1))
        };

        flow.wait_quiescent(&Driver::external(WaitStrategy::Yield));
        assert!(flow.is_quiescent());
        acker.join().unwrap();
    }

    #[test]
    fn test_reset_keeps_concurrent_requests() {
        let flow = FlowControl::new();
        flow.request(3);
        flow.acknowledge(3);
        flow.reset().unwrap();
        flow.request(2);
        assert_eq!(flow.reset(), Err((2, 0)));
        assert_eq!(flow.requested(), 2);
        assert!(!flow.is_quiescent());
    }

    #[test]
    fn test_reset_never_reports_outstanding_as_done() {
        let flow = Arc::new(FlowControl::new());
        let stop = Arc::new(AtomicBool::new(false));

        let resetters: Vec<_> = (0..2)
            .map(|_| {
                let flow = Arc::clone(&flow);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let _ = flow.reset();
                    }
                })
            })
            .collect();

        for _ in 0..100_000 {
            flow.request(1);
            assert!(!flow.is_quiescent());
            flow.acknowledge(1);
        }

        stop.store(true, Ordering::Relaxed);
        for h in resetters {
            h.join().unwrap();
        }
        assert!(flow.is_quiescent());
        assert_eq!(flow.requested(), flow.acknowledged());
    }
}
