//! The runtime session: one [`Context`] per process, shared by its workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ambient;
use crate::config::{ContextConfig, ProgressMode};
use crate::dispatch::Dispatcher;
use crate::encoding::{EncodedCall, FnCall};
use crate::envelope::CallEnvelope;
use crate::error::{Error, Result};
use crate::flow::FlowControl;
use crate::future::{CompletionTable, Future};
use crate::handler::handler_entries;
use crate::progress::{Driver, ProgressPump};
use crate::serial::Serial;
use crate::transport::Transport;

/// Remembers whether the last flush attempt was refused.
#[derive(Default)]
struct RefusalLatch {
    refused: AtomicBool,
}

impl RefusalLatch {
    /// Marks a refusal. True only for the first one after a success.
    fn refuse(&self) -> bool {
        !self.refused.swap(true, Ordering::Relaxed)
    }

    /// Marks a success. True if it ends a run of refusals.
    fn accept(&self) -> bool {
        self.refused.swap(false, Ordering::Relaxed)
    }
}

/// Sends buffered batches, then runs the transport's handlers.
struct ContextPump<T: Transport, C: EncodedCall> {
    transport: Arc<T>,
    dispatcher: Arc<Dispatcher<C>>,
    flow: Arc<FlowControl>,
    latch: RefusalLatch,
}

impl<T: Transport, C: EncodedCall> ProgressPump for ContextPump<T, C> {
    fn progress(&self) -> usize {
        let mut progressed = 0;
        if self.dispatcher.max_batch() > 1 {
            match self.dispatcher.flush_all(&*self.transport, &self.flow) {
                Ok(sent) => {
                    if self.latch.accept() {
                        tracing::info!(sent, "buffered batches accepted again");
                    }
                    progressed += sent;
                }
                Err(e) if self.latch.refuse() => {
                    tracing::warn!(error = %e, "failed to send buffered batches, will retry")
                }
                Err(e) => tracing::trace!(error = %e, "buffered batches still refused"),
            }
        }
        progressed + self.transport.progress()
    }
}

struct Inner<T: Transport, C: EncodedCall> {
    transport: Arc<T>,
    config: ContextConfig,
    flow: Arc<FlowControl>,
    table: Arc<CompletionTable>,
    dispatcher: Arc<Dispatcher<C>>,
    pump: Arc<ContextPump<T, C>>,
    /// Used by futures and `flush`, per `config.progress_mode`.
    driver: Driver,
    poll_driver: Driver,
    nopoll_driver: Driver,
}

/// Active-message RPC context of one process.
///
/// Cheap to clone; every clone shares the same counters, completion table
/// and outbound buffers. Global worker `w` lives on process
/// `w / workers_per_process` as local worker `w % workers_per_process`.
pub struct Context<T: Transport, C: EncodedCall = FnCall> {
    inner: Arc<Inner<T, C>>,
}

impl<T: Transport, C: EncodedCall> Clone for Context<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, C: EncodedCall> Context<T, C> {
    /// Creates a context over `transport` and registers its handler pair.
    pub fn new(transport: T, config: ContextConfig) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(transport);
        let flow = Arc::new(FlowControl::new());
        let table = Arc::new(CompletionTable::new());
        let dispatcher = Arc::new(Dispatcher::new(transport.nprocs(), config.max_batch));

        transport.register(handler_entries::<T, C>(
            Arc::clone(&table),
            Arc::clone(&flow),
            config.workers_per_process,
        ))?;
        tracing::debug!(rank = transport.rank(), "registered request and ack handlers");

        let pump = Arc::new(ContextPump {
            transport: Arc::clone(&transport),
            dispatcher: Arc::clone(&dispatcher),
            flow: Arc::clone(&flow),
            latch: RefusalLatch::default(),
        });
        let poll_driver = Driver::polling(pump.clone(), config.wait_strategy);
        let nopoll_driver = Driver::external(config.wait_strategy);
        let driver = match config.progress_mode {
            ProgressMode::Poll => poll_driver.clone(),
            ProgressMode::External => nopoll_driver.clone(),
        };

        tracing::debug!(
            rank = transport.rank(),
            nprocs = transport.nprocs(),
            workers_per_process = config.workers_per_process,
            max_batch = config.max_batch,
            progress_mode = ?config.progress_mode,
            "amrpc context created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                config,
                flow,
                table,
                dispatcher,
                pump,
                driver,
                poll_driver,
                nopoll_driver,
            }),
        })
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// This process's rank.
    pub fn rank(&self) -> usize {
        self.inner.transport.rank()
    }

    /// Number of processes.
    pub fn nprocs(&self) -> usize {
        self.inner.transport.nprocs()
    }

    pub fn workers_per_process(&self) -> usize {
        self.inner.config.workers_per_process
    }

    /// Total number of logical workers across all processes.
    pub fn nworkers(&self) -> usize {
        self.nprocs() * self.workers_per_process()
    }

    /// Global id of the worker the calling thread currently acts as.
    pub fn my_worker(&self) -> usize {
        self.rank() * self.workers_per_process() + ambient::current_worker()
    }

    /// Issues `call` on global worker `worker`.
    ///
    /// [`rpc`](Self::rpc) and [`rpc0`](Self::rpc0) are the safe entry points
    /// for [`FnCall`].
    ///
    /// # Safety
    /// `R` must be the type whose bytes `call.execute()` writes into the
    /// result buffer. The future decodes the result as `R` unchecked.
    pub unsafe fn launch<R: Serial>(&self, worker: usize, call: C) -> Result<Future<R>> {
        let nworkers = self.nworkers();
        if worker >= nworkers {
            return Err(Error::InvalidWorker { worker, nworkers });
        }
        let wpp = self.workers_per_process();
        let (dest, local) = (worker / wpp, worker % wpp);

        let inner = &*self.inner;
        let (slot, data) = inner.table.reserve();
        let env = CallEnvelope::new(call, slot, local as u32);
        if let Err(e) = inner
            .dispatcher
            .enqueue(&*inner.transport, &inner.flow, dest, env)
        {
            inner.table.discard(slot);
            return Err(e.into());
        }
        Ok(Future::new(
            slot,
            data,
            Arc::clone(&inner.table),
            inner.driver.clone(),
        ))
    }

    /// Sends every buffered batch. Returns the number of envelopes sent.
    pub fn flush_requests(&self) -> Result<usize> {
        let inner = &*self.inner;
        Ok(inner.dispatcher.flush_all(&*inner.transport, &inner.flow)?)
    }

    /// Waits until every call issued by this process has been acknowledged.
    ///
    /// Drives progress itself in [`ProgressMode::Poll`]; in
    /// [`ProgressMode::External`] another thread must call
    /// [`progress`](Self::progress).
    pub fn flush(&self) -> Result<()> {
        self.flush_with(&self.inner.driver)
    }

    /// Like [`flush`](Self::flush), always driving progress.
    pub fn flush_poll(&self) -> Result<()> {
        self.flush_with(&self.inner.poll_driver)
    }

    /// Like [`flush`](Self::flush), never driving progress.
    pub fn flush_nopoll(&self) -> Result<()> {
        self.flush_with(&self.inner.nopoll_driver)
    }

    fn flush_with(&self, driver: &Driver) -> Result<()> {
        self.flush_requests()?;
        self.inner.flow.wait_quiescent(driver);
        Ok(())
    }

    /// One progress step: buffered batches go out, pending handlers run on
    /// the calling thread. Returns the amount of work done.
    pub fn progress(&self) -> usize {
        self.inner.pump.progress()
    }

    pub fn requested(&self) -> u64 {
        self.inner.flow.requested()
    }

    pub fn acknowledged(&self) -> u64 {
        self.inner.flow.acknowledged()
    }

    /// Completion slots held by live futures.
    pub fn outstanding_completions(&self) -> usize {
        self.inner.table.len()
    }

    /// Envelopes waiting in outbound buffers.
    pub fn buffered(&self) -> usize {
        self.inner.dispatcher.buffered_total()
    }

    /// Zeroes both flow counters. Fails while calls are outstanding.
    ///
    /// Safe to race with issuing threads: their calls stay counted, and a
    /// concurrent [`flush`](Self::flush) never sees the reset halfway.
    pub fn reset_counters(&self) -> Result<()> {
        self.inner
            .flow
            .reset()
            .map_err(|(requested, acknowledged)| Error::NotQuiescent {
                requested,
                acknowledged,
            })?;
        tracing::debug!(rank = self.rank(), "flow counters reset");
        Ok(())
    }
}

impl<T: Transport> Context<T, FnCall> {
    /// Calls `f(args)` on global worker `worker`.
    pub fn rpc<A: Serial, R: Serial>(
        &self,
        worker: usize,
        f: fn(A) -> R,
        args: A,
    ) -> Result<Future<R>> {
        // SAFETY: the trampoline of `FnCall::new` encodes an `R`.
        unsafe { self.launch(worker, FnCall::new(f, args)) }
    }

    /// Calls `f()` on global worker `worker`.
    pub fn rpc0<R: Serial>(&self, worker: usize, f: fn() -> R) -> Result<Future<R>> {
        // SAFETY: the trampoline of `FnCall::nullary` encodes an `R`.
        unsafe { self.launch(worker, FnCall::nullary(f)) }
    }
}
