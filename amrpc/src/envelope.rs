//! Wire records for request and reply batches.
//!
//! ```text
//! CallEnvelope<FnCall> (80 bytes)
//! +--------------------+-----------------+------------------+---------+
//! | call (64)          | slot (8)        | target_worker(4) | pad (4) |
//! +--------------------+-----------------+------------------+---------+
//!
//! ResultEnvelope (72 bytes)
//! +-----------------+-------------------------------------------------+
//! | slot (8)        | payload (RESULT_CAPACITY = 64)                  |
//! +-----------------+-------------------------------------------------+
//! ```

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::encoding::{EncodedCall, ResultBuf};

/// Stable reference to a completion slot in the issuing process.
///
/// `key` indexes the completion table; `generation` distinguishes reuses of
/// the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct SlotId {
    pub key: u32,
    pub generation: u32,
}

/// One outbound call.
///
/// Packed so that any call encoding lays out without padding. Fields are
/// read by value: `let call = env.call;`.
#[derive(IntoBytes, Immutable)]
#[repr(C, packed)]
pub struct CallEnvelope<C: EncodedCall> {
    pub call: C,
    pub slot: SlotId,
    /// Worker id local to the destination process.
    pub target_worker: u32,
    _pad: u32,
}

impl<C: EncodedCall> Clone for CallEnvelope<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: EncodedCall> Copy for CallEnvelope<C> {}

impl<C: EncodedCall + fmt::Debug> fmt::Debug for CallEnvelope<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (call, slot, target_worker) = (self.call, self.slot, self.target_worker);
        f.debug_struct("CallEnvelope")
            .field("call", &call)
            .field("slot", &slot)
            .field("target_worker", &target_worker)
            .finish()
    }
}

impl<C: EncodedCall> CallEnvelope<C> {
    pub fn new(call: C, slot: SlotId, target_worker: u32) -> Self {
        Self {
            call,
            slot,
            target_worker,
            _pad: 0,
        }
    }
}

/// One call result, routed back to the slot it was issued from.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct ResultEnvelope {
    pub slot: SlotId,
    pub payload: ResultBuf,
}

impl ResultEnvelope {
    pub fn new(slot: SlotId, payload: ResultBuf) -> Self {
        Self { slot, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    use crate::encoding::FnCall;

    fn noop() {}

    #[test]
    fn test_sizes() {
        assert_eq!(size_of::<SlotId>(), 8);
        assert_eq!(size_of::<CallEnvelope<FnCall>>(), 80);
        assert_eq!(size_of::<ResultEnvelope>(), 72);
    }

    #[test]
    fn test_call_envelope_bytes() {
        let env = CallEnvelope::new(
            FnCall::nullary(noop),
            SlotId {
                key: 5,
                generation: 6,
            },
            7,
        );
        let bytes = env.as_bytes();
        let call = env.call;
        assert_eq!(&bytes[..64], call.as_bytes());
        assert_eq!(&bytes[64..68], &5u32.to_ne_bytes());
        assert_eq!(&bytes[68..72], &6u32.to_ne_bytes());
        assert_eq!(&bytes[72..76], &7u32.to_ne_bytes());
        assert_eq!(&bytes[76..], &[0u8; 4]);
    }
}
