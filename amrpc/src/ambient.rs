//! Ambient worker context.
//!
//! Each physical thread carries the id of the logical worker it is currently
//! impersonating. The id is local to the process (`0..workers_per_process`).
//! The request handler switches it around every individual call with
//! [`enter`], and the returned guard restores the previous id on every exit
//! path, unwinding included.
//!
//! Storage is thread-local, so handlers running concurrently on different
//! threads never observe each other's identity.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static CURRENT_WORKER: Cell<usize> = const { Cell::new(0) };
}

/// Returns the local worker id the calling thread is impersonating.
#[inline]
pub fn current_worker() -> usize {
    CURRENT_WORKER.with(Cell::get)
}

/// Switches the calling thread to `worker` until the guard is dropped.
#[inline]
pub fn enter(worker: usize) -> AmbientGuard {
    let prev = CURRENT_WORKER.with(|c| c.replace(worker));
    AmbientGuard {
        prev,
        _not_send: PhantomData,
    }
}

/// Runs `f` as `worker` and restores the previous id afterwards.
pub fn with_worker<R>(worker: usize, f: impl FnOnce() -> R) -> R {
    let _guard = enter(worker);
    f()
}

/// Restores the previous ambient worker on drop.
///
/// Not `Send`: it must be dropped on the thread whose context it changed.
#[must_use = "the ambient worker is restored as soon as the guard is dropped"]
pub struct AmbientGuard {
    prev: usize,
    _not_send: PhantomData<*const ()>,
}

impl AmbientGuard {
    /// The id that will be restored on drop.
    pub fn previous(&self) -> usize {
        self.prev
    }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|c| c.set(self.prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;
    use std::thread;

    #[test]
    fn test_enter_restores() {
        let _base = enter(3);
        {
            let guard = enter(7);
            assert_eq!(guard.previous(), 3);
            assert_eq!(current_worker(), 7);
            {
                let _inner = enter(1);
                assert_eq!(current_worker(), 1);
            }
            assert_eq!(current_worker(), 7);
        }
        assert_eq!(current_worker(), 3);
    }

    #[test]
    fn test_with_worker() {
        let _base = enter(2);
        let seen = with_worker(5, current_worker);
        assert_eq!(seen, 5);
        assert_eq!(current_worker(), 2);
    }

    #[test]
    fn test_restored_on_panic() {
        let _base = enter(4);
        let result = panic::catch_unwind(|| {
            let _guard = enter(9);
            panic!("call failed");
        });
        assert!(result.is_err());
        assert_eq!(current_worker(), 4);
    }

    #[test]
    fn test_thread_isolation() {
        let _base = enter(11);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                thread::spawn(move || {
                    assert_eq!(current_worker(), 0);
                    let _guard = enter(i);
                    for _ in 0..1000 {
                        assert_eq!(current_worker(), i);
                        thread::yield_now();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(current_worker(), 11);
    }
}
