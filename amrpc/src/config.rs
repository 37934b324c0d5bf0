//! Configuration types for an amrpc context.

use crate::error::{Error, Result};

/// Who drives transport progress while a thread waits in
/// [`Future::wait`](crate::Future::wait) or [`Context::flush`](crate::Context::flush).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// The waiting thread drives progress itself.
    #[default]
    Poll,
    /// Some other thread calls [`Context::progress`](crate::Context::progress);
    /// waiters only re-check their condition. Nothing completes if no such
    /// thread exists.
    External,
}

/// What a waiting thread does between two checks that made no progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// `std::hint::spin_loop()`.
    #[default]
    Spin,
    /// `std::thread::yield_now()`.
    Yield,
}

/// Context configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Logical workers hosted by each process.
    /// Default: 1
    pub workers_per_process: usize,
    /// Envelopes buffered per destination before a batch is sent.
    /// 1 sends every call immediately.
    /// Default: 1
    pub max_batch: usize,
    /// Default: `ProgressMode::Poll`
    pub progress_mode: ProgressMode,
    /// Default: `WaitStrategy::Spin`
    pub wait_strategy: WaitStrategy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            workers_per_process: 1,
            max_batch: 1,
            progress_mode: ProgressMode::Poll,
            wait_strategy: WaitStrategy::Spin,
        }
    }
}

impl ContextConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of logical workers per process.
    pub fn with_workers_per_process(mut self, workers_per_process: usize) -> Self {
        self.workers_per_process = workers_per_process;
        self
    }

    /// Set the per-destination batch size.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Set the progress mode.
    pub fn with_progress_mode(mut self, progress_mode: ProgressMode) -> Self {
        self.progress_mode = progress_mode;
        self
    }

    /// Set the wait strategy.
    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategy) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    /// Checks that every field is in range.
    pub fn validate(&self) -> Result<()> {
        if self.workers_per_process == 0 {
            return Err(Error::InvalidConfig(
                "workers_per_process must be at least 1".into(),
            ));
        }
        if self.workers_per_process > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "workers_per_process {} does not fit in a u32 worker id",
                self.workers_per_process
            )));
        }
        if self.max_batch == 0 {
            return Err(Error::InvalidConfig("max_batch must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ContextConfig::new();
        assert_eq!(config.workers_per_process, 1);
        assert_eq!(config.max_batch, 1);
        assert_eq!(config.progress_mode, ProgressMode::Poll);
        assert_eq!(config.wait_strategy, WaitStrategy::Spin);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ContextConfig::new()
            .with_workers_per_process(4)
            .with_max_batch(32)
            .with_progress_mode(ProgressMode::External)
            .with_wait_strategy(WaitStrategy::Yield);
        assert_eq!(config.workers_per_process, 4);
        assert_eq!(config.max_batch, 32);
        assert_eq!(config.progress_mode, ProgressMode::External);
        assert_eq!(config.wait_strategy, WaitStrategy::Yield);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero() {
        let config = ContextConfig::new().with_workers_per_process(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = ContextConfig::new().with_max_batch(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
