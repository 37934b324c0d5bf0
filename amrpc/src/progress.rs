//! Progress pumps and the busy-wait driver used at suspension points.
//!
//! Nothing in amrpc blocks in the OS. [`Future::wait`](crate::Future::wait)
//! and [`Context::flush`](crate::Context::flush) loop on a [`Driver`], which
//! either runs a [`ProgressPump`] (so pending handlers execute on the waiting
//! thread) or, in external mode, only relaxes while another thread pumps.

use std::fmt;
use std::sync::Arc;

use crate::config::WaitStrategy;

/// A cooperative progress step.
pub trait ProgressPump: Send + Sync {
    /// Delivers pending work on the calling thread.
    ///
    /// Returns the number of handlers executed. Never blocks.
    fn progress(&self) -> usize;
}

/// Busy-wait loop around an optional pump.
#[derive(Clone)]
pub struct Driver {
    pump: Option<Arc<dyn ProgressPump>>,
    strategy: WaitStrategy,
}

impl Driver {
    /// A driver that runs `pump` while waiting.
    pub fn polling(pump: Arc<dyn ProgressPump>, strategy: WaitStrategy) -> Self {
        Self {
            pump: Some(pump),
            strategy,
        }
    }

    /// A driver that relies on another thread for progress.
    pub fn external(strategy: WaitStrategy) -> Self {
        Self {
            pump: None,
            strategy,
        }
    }

    /// Returns true if this driver runs a pump.
    pub fn is_polling(&self) -> bool {
        self.pump.is_some()
    }

    /// One iteration of a wait loop.
    #[inline]
    pub fn step(&self) {
        let progressed = match &self.pump {
            Some(pump) => pump.progress(),
            None => 0,
        };
        if progressed == 0 {
            self.relax();
        }
    }

    #[inline]
    fn relax(&self) {
        match self.strategy {
            WaitStrategy::Spin => std::hint::spin_loop(),
            WaitStrategy::Yield => std::thread::yield_now(),
        }
    }

    /// Steps until `done` returns true. `done` is checked before the first step.
    #[inline]
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) {
        while !done() {
            self.step();
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("polling", &self.is_polling())
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPump {
        calls: AtomicUsize,
    }

    impl ProgressPump for CountingPump {
        fn progress(&self) -> usize {
            self.calls.fetch_add(1, Ordering::Relaxed);
            1
        }
    }

    #[test]
    fn test_polling_driver_pumps() {
        let pump = Arc::new(CountingPump {
            calls: AtomicUsize::new(0),
        });
        let driver = Driver::polling(pump.clone(), WaitStrategy::Spin);
        assert!(driver.is_polling());

        driver.wait_until(|| pump.calls.load(Ordering::Relaxed) >= 5);
        assert_eq!(pump.calls.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_done_checked_first() {
        let pump = Arc::new(CountingPump {
            calls: AtomicUsize::new(0),
        });
        let driver = Driver::polling(pump.clone(), WaitStrategy::Yield);
        driver.wait_until(|| true);
        assert_eq!(pump.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_external_driver_never_pumps() {
        let driver = Driver::external(WaitStrategy::Spin);
        assert!(!driver.is_polling());
        let mut remaining = 3;
        driver.wait_until(|| {
            remaining -= 1;
            remaining == 0
        });
        assert_eq!(remaining, 0);
    }
}
