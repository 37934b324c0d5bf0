//! The request/ack handler pair.
//!
//! Both handlers receive a flat batch of fixed-size records. The request
//! handler runs every call under its target worker's ambient identity and
//! answers the whole batch with one reply; the ack handler applies each
//! result to its completion slot and then acknowledges the batch.

use std::sync::Arc;

use crate::ambient;
use crate::encoding::EncodedCall;
use crate::envelope::{CallEnvelope, ResultEnvelope};
use crate::flow::FlowControl;
use crate::future::CompletionTable;
use crate::pack::{BufferPack, pack_records};
use crate::transport::{
    HANDLER_INDEX_BASE, HandlerEntry, HandlerFlags, HandlerIndex, Transport,
};

/// Receives result batches on the issuing process.
pub const ACK_HANDLER: HandlerIndex = HandlerIndex(HANDLER_INDEX_BASE);

/// Receives call batches on the destination process.
pub const REQUEST_HANDLER: HandlerIndex = HandlerIndex(HANDLER_INDEX_BASE + 1);

/// Executes one call batch and replies with its results.
///
/// # Safety
/// `payload` must be a batch packed from `CallEnvelope<C>` records by this
/// program: the call encodings are executed as read.
///
/// # Panics
/// Panics if `payload` is not a whole number of `CallEnvelope<C>` records,
/// or if an envelope targets a worker this process does not host.
pub unsafe fn handle_request<T: Transport, C: EncodedCall>(
    transport: &T,
    token: &T::Token,
    payload: &[u8],
    workers_per_process: usize,
) {
    let calls = BufferPack::<CallEnvelope<C>>::new(payload);
    if calls.is_empty() {
        return;
    }

    let mut results = Vec::with_capacity(calls.len());
    for i in 0..calls.len() {
        // SAFETY: the caller guarantees the records were packed as
        // `CallEnvelope<C>`.
        let env = unsafe { calls.read(i) };
        let (call, slot) = (env.call, env.slot);
        let worker = env.target_worker as usize;
        assert!(
            worker < workers_per_process,
            "call for local worker {} but only {} are hosted",
            worker,
            workers_per_process
        );
        let result = {
            let _guard = ambient::enter(worker);
            call.execute()
        };
        results.push(ResultEnvelope::new(slot, result));
    }

    tracing::trace!(calls = results.len(), "executed request batch");

    if let Err(e) = transport.reply(token, ACK_HANDLER, pack_records(&results)) {
        tracing::error!(error = %e, count = results.len(), "failed to send reply batch");
    }
}

/// Applies one result batch.
///
/// # Panics
/// Panics if `payload` is not a whole number of `ResultEnvelope` records, or
/// if any result targets an unknown or already completed slot.
pub fn handle_ack(table: &CompletionTable, flow: &FlowControl, payload: &[u8]) {
    let results = BufferPack::<ResultEnvelope>::new(payload);
    for result in results.iter() {
        table.complete(result.slot, &result.payload);
    }
    flow.acknowledge(results.len());
}

/// Builds the handler table entries for one context.
pub(crate) fn handler_entries<T: Transport, C: EncodedCall>(
    table: Arc<CompletionTable>,
    flow: Arc<FlowControl>,
    workers_per_process: usize,
) -> Vec<HandlerEntry<T>> {
    vec![
        HandlerEntry::new(
            ACK_HANDLER,
            HandlerFlags::REPLY | HandlerFlags::MEDIUM,
            Arc::new(move |_: &T, _: &T::Token, payload: &[u8]| {
                handle_ack(&table, &flow, payload)
            }),
        ),
        HandlerEntry::new(
            REQUEST_HANDLER,
            HandlerFlags::REQUEST | HandlerFlags::MEDIUM,
            Arc::new(move |transport: &T, token: &T::Token, payload: &[u8]| {
                // SAFETY: `Transport` delivers request payloads exactly as a
                // dispatcher of this program packed them.
                unsafe { handle_request::<T, C>(transport, token, payload, workers_per_process) }
            }),
        ),
    ]
}
