//! Request dispatcher: per-destination batching of call envelopes.

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::encoding::EncodedCall;
use crate::envelope::CallEnvelope;
use crate::flow::FlowControl;
use crate::handler::REQUEST_HANDLER;
use crate::pack::pack_records;
use crate::transport::{Transport, TransportError};

/// Outbound batch buffers, one per destination process.
pub struct Dispatcher<C: EncodedCall> {
    buffers: Box<[Mutex<Vec<CallEnvelope<C>>>]>,
    max_batch: usize,
}

impl<C: EncodedCall> Dispatcher<C> {
    pub fn new(nprocs: usize, max_batch: usize) -> Self {
        Self {
            buffers: (0..nprocs)
                .map(|_| Mutex::new(Vec::with_capacity(max_batch)))
                .collect(),
            max_batch,
        }
    }

    fn buffer(&self, dest: usize) -> MutexGuard<'_, Vec<CallEnvelope<C>>> {
        self.buffers[dest]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `env` for `dest`, sending the buffer once it holds `max_batch`
    /// envelopes.
    ///
    /// With `max_batch == 1` the envelope goes out immediately and a send
    /// failure means it was not sent. With larger batches the envelope is
    /// always accepted; a full batch the transport refuses stays buffered
    /// for the next flush.
    pub fn enqueue<T: Transport>(
        &self,
        transport: &T,
        flow: &FlowControl,
        dest: usize,
        env: CallEnvelope<C>,
    ) -> Result<(), TransportError> {
        if self.max_batch == 1 {
            return send_batch(transport, flow, dest, &[env]);
        }

        let full = {
            let mut buf = self.buffer(dest);
            buf.push(env);
            if buf.len() < self.max_batch {
                return Ok(());
            }
            take_counted(&mut buf, flow)
        };
        if let Err(e) = self.transmit(transport, flow, dest, full) {
            tracing::warn!(dest, error = %e, "batch send failed, keeping it buffered");
        }
        Ok(())
    }

    /// Sends every non-empty buffer. Returns the number of envelopes sent,
    /// or the first transport error; batches that failed stay buffered.
    pub fn flush_all<T: Transport>(
        &self,
        transport: &T,
        flow: &FlowControl,
    ) -> Result<usize, TransportError> {
        let mut sent = 0;
        let mut first_err = None;
        for dest in 0..self.buffers.len() {
            let batch = take_counted(&mut self.buffer(dest), flow);
            if batch.is_empty() {
                continue;
            }
            let count = batch.len();
            match self.transmit(transport, flow, dest, batch) {
                Ok(()) => sent += count,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    /// Sends a batch already counted in `requested`. On failure the batch
    /// goes back in front of anything queued since, then the count is
    /// withdrawn.
    fn transmit<T: Transport>(
        &self,
        transport: &T,
        flow: &FlowControl,
        dest: usize,
        mut batch: Vec<CallEnvelope<C>>,
    ) -> Result<(), TransportError> {
        match transport.request(dest, REQUEST_HANDLER, pack_records(&batch)) {
            Ok(()) => {
                tracing::trace!(dest, count = batch.len(), "sent request batch");
                Ok(())
            }
            Err(e) => {
                let count = batch.len();
                {
                    let mut buf = self.buffer(dest);
                    batch.append(&mut buf);
                    *buf = batch;
                }
                flow.cancel(count);
                Err(e)
            }
        }
    }

    /// Envelopes currently buffered for `dest`.
    pub fn buffered(&self, dest: usize) -> usize {
        self.buffer(dest).len()
    }

    /// Envelopes currently buffered for all destinations.
    pub fn buffered_total(&self) -> usize {
        (0..self.buffers.len()).map(|d| self.buffered(d)).sum()
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }
}

/// Empties `buf` and counts its envelopes as requested while the buffer
/// lock is still held, so a concurrent flush that finds the buffer empty
/// also sees them in `requested`.
fn take_counted<C: EncodedCall>(
    buf: &mut Vec<CallEnvelope<C>>,
    flow: &FlowControl,
) -> Vec<CallEnvelope<C>> {
    let batch = mem::take(buf);
    if !batch.is_empty() {
        flow.request(batch.len());
    }
    batch
}

/// Packs `batch` and hands it to the transport as one request message.
///
/// `requested` is raised before the send so that the matching
/// acknowledgement can never be counted first, and lowered again if the
/// transport refuses the batch.
pub fn send_batch<T: Transport, C: EncodedCall>(
    transport: &T,
    flow: &FlowControl,
    dest: usize,
    batch: &[CallEnvelope<C>],
) -> Result<(), TransportError> {
    if batch.is_empty() {
        return Ok(());
    }
    let bytes = pack_records(batch);
    flow.request(batch.len());
    transport
        .request(dest, REQUEST_HANDLER, bytes)
        .inspect(|()| tracing::trace!(dest, count = batch.len(), "sent request batch"))
        .inspect_err(|_| flow.cancel(batch.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::encoding::FnCall;
    use crate::envelope::SlotId;
    use crate::pack::BufferPack;
    use crate::transport::{HandlerEntry, HandlerIndex};

    /// Captures request batches; can be told to refuse sends.
    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(usize, Vec<u8>)>>,
        refuse: AtomicBool,
    }

    unsafe impl Transport for Capture {
        type Token = ();

        fn rank(&self) -> usize {
            0
        }

        fn nprocs(&self) -> usize {
            2
        }

        fn register(&self, _entries: Vec<HandlerEntry<Self>>) -> Result<(), TransportError> {
            Ok(())
        }

        fn request(
            &self,
            dest: usize,
            handler: HandlerIndex,
            payload: Vec<u8>,
        ) -> Result<(), TransportError> {
            assert_eq!(handler, REQUEST_HANDLER);
            if self.refuse.load(Ordering::Relaxed) {
                return Err(TransportError::Disconnected(dest));
            }
            self.sent.lock().unwrap().push((dest, payload));
            Ok(())
        }

        fn reply(
            &self,
            _token: &(),
            _handler: HandlerIndex,
            _payload: Vec<u8>,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn progress(&self) -> usize {
            0
        }
    }

    fn noop() {}

    fn env(key: u32) -> CallEnvelope<FnCall> {
        CallEnvelope::new(FnCall::nullary(noop), SlotId { key, generation: 0 }, 0)
    }

    fn batch_slots(bytes: &[u8]) -> Vec<u32> {
        let pack = BufferPack::<CallEnvelope<FnCall>>::new(bytes);
        (0..pack.len())
            .map(|i| unsafe { pack.read(i) }.slot.key)
            .collect()
    }

    #[test]
    fn test_immediate_mode() {
        let transport = Capture::default();
        let flow = FlowControl::new();
        let dispatcher = Dispatcher::<FnCall>::new(2, 1);

        dispatcher.enqueue(&transport, &flow, 1, env(0)).unwrap();
        dispatcher.enqueue(&transport, &flow, 1, env(1)).unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(flow.requested(), 2);
        assert_eq!(dispatcher.buffered_total(), 0);
    }

    #[test]
    fn test_full_batch_sent_once() {
        let transport = Capture::default();
        let flow = FlowControl::new();
        let dispatcher = Dispatcher::<FnCall>::new(2, 3);

        for key in 0..3 {
            dispatcher.enqueue(&transport, &flow, 1, env(key)).unwrap();
        }
        dispatcher.enqueue(&transport, &flow, 0, env(9)).unwrap();

        {
            let sent = transport.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, 1);
            assert_eq!(batch_slots(&sent[0].1), vec![0, 1, 2]);
        }
        assert_eq!(flow.requested(), 3);
        assert_eq!(dispatcher.buffered(0), 1);

        assert_eq!(dispatcher.flush_all(&transport, &flow), Ok(1));
        assert_eq!(flow.requested(), 4);
        assert_eq!(dispatcher.buffered_total(), 0);
        assert_eq!(dispatcher.flush_all(&transport, &flow), Ok(0));
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_refused_immediate_send_rolls_back() {
        let transport = Capture::default();
        transport.refuse.store(true, Ordering::Relaxed);
        let flow = FlowControl::new();
        let dispatcher = Dispatcher::<FnCall>::new(2, 1);

        assert_eq!(
            dispatcher.enqueue(&transport, &flow, 1, env(0)),
            Err(TransportError::Disconnected(1))
        );
        assert_eq!(flow.requested(), 0);
    }

    #[test]
    fn test_refused_batch_stays_buffered() {
        let transport = Capture::default();
        let flow = FlowControl::new();
        let dispatcher = Dispatcher::<FnCall>::new(2, 2);

        transport.refuse.store(true, Ordering::Relaxed);
        dispatcher.enqueue(&transport, &flow, 1, env(0)).unwrap();
        dispatcher.enqueue(&transport, &flow, 1, env(1)).unwrap();
        assert_eq!(dispatcher.buffered(1), 2);
        assert_eq!(flow.requested(), 0);
        assert!(dispatcher.flush_all(&transport, &flow).is_err());
        assert_eq!(dispatcher.buffered(1), 2);

        transport.refuse.store(false, Ordering::Relaxed);
        dispatcher.enqueue(&transport, &flow, 1, env(2)).unwrap();
        assert_eq!(dispatcher.buffered(1), 0);
        assert_eq!(dispatcher.flush_all(&transport, &flow), Ok(0));
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(batch_slots(&sent[0].1), vec![0, 1, 2]);
        assert_eq!(flow.requested(), 3);
    }

    #[test]
    fn test_empty_batch_not_sent() {
        let transport = Capture::default();
        let flow = FlowControl::new();
        send_batch::<_, FnCall>(&transport, &flow, 0, &[]).unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(flow.requested(), 0);
    }
}
