//! Call encoding: fixed-size, bit-copyable records that know how to execute
//! themselves.
//!
//! The core only needs [`EncodedCall`]. [`FnCall`] is the stock encoding: a
//! type-erased function pointer, a monomorphized trampoline and the argument
//! bytes stored inline.
//!
//! # Layout
//!
//! ```text
//! FnCall (64 bytes)
//! +----------------+----------------+-----------------------------+
//! | func (8)       | invoke (8)     | args (ARGS_CAPACITY = 48)   |
//! +----------------+----------------+-----------------------------+
//! ```
//!
//! Function addresses are only meaningful inside one address-space image,
//! so `FnCall` is suitable for the in-process mesh transport and for SPMD
//! processes running the same non-relocated binary.

use std::fmt;
use std::mem::{self, size_of};
use std::ptr;

use zerocopy::{Immutable, IntoBytes};

use crate::serial::Serial;

/// Inline argument storage in bytes.
pub const ARGS_CAPACITY: usize = 48;

/// Inline result storage in bytes. Every result type must fit.
pub const RESULT_CAPACITY: usize = 64;

/// Raw argument bytes of an [`FnCall`].
pub type ArgsBuf = [u8; ARGS_CAPACITY];

/// Raw result bytes carried by a result envelope.
pub type ResultBuf = [u8; RESULT_CAPACITY];

/// Compile-time proof that `Self` fits into `N` bytes.
trait FitsIn<const N: usize>: Sized {
    const OK: ();
}

impl<T, const N: usize> FitsIn<N> for T {
    const OK: () = assert!(
        size_of::<T>() <= N,
        "value does not fit into the fixed-size payload"
    );
}

/// Copies `value` into the front of an `N`-byte buffer. The remaining
/// bytes are zero.
///
/// Rejected at compile time if `T` is larger than `N`. Types with padding
/// are not [`Serial`] and cannot be encoded:
///
/// ```compile_fail
/// let buf = amrpc::encode_value::<(u8, u64), 64>((1, 2));
/// ```
#[inline]
pub fn encode_value<T: Serial, const N: usize>(value: T) -> [u8; N] {
    #[allow(clippy::let_unit_value)]
    let () = <T as FitsIn<N>>::OK;
    let mut buf = [0u8; N];
    buf[..size_of::<T>()].copy_from_slice(value.as_bytes());
    buf
}

/// Reads a `T` back from the front of an `N`-byte buffer.
///
/// Rejected at compile time if `T` is larger than `N`.
///
/// # Safety
/// The leading `size_of::<T>()` bytes must have been produced by
/// [`encode_value`] with the same `T`.
#[inline]
pub unsafe fn decode_value<T: Serial, const N: usize>(buf: &[u8; N]) -> T {
    #[allow(clippy::let_unit_value)]
    let () = <T as FitsIn<N>>::OK;
    unsafe { ptr::read_unaligned(buf.as_ptr() as *const T) }
}

/// A fixed-size call record with a zero-argument execute operation.
///
/// Encodings are written to the wire as plain bytes, so they must be
/// [`Serial`]. The request handler reads them back without validation;
/// only the bytes of an encoding sent by the same program may reach it.
pub trait EncodedCall: Serial + Send {
    /// Runs the call and returns its encoded result.
    fn execute(&self) -> ResultBuf;
}

type Trampoline = unsafe fn(*const (), &ArgsBuf) -> ResultBuf;

/// Function address plus inline arguments.
///
/// Not `FromBytes`: an `FnCall` can only be built by
/// [`new`](Self::new) or [`nullary`](Self::nullary), or read back from
/// bytes an `FnCall` was written to.
#[derive(Clone, Copy, IntoBytes, Immutable)]
#[repr(C)]
pub struct FnCall {
    /// Exposed address of the erased `fn`.
    func: usize,
    /// Exposed address of the matching [`Trampoline`].
    invoke: usize,
    args: ArgsBuf,
}

const _: () = assert!(size_of::<FnCall>() == 2 * size_of::<usize>() + ARGS_CAPACITY);

#[inline]
fn expose(addr: *const ()) -> usize {
    addr.expose_provenance()
}

impl FnCall {
    /// Encodes a call of `f(args)`.
    ///
    /// Several arguments are passed as an array or a padding-free struct.
    pub fn new<A: Serial, R: Serial>(f: fn(A) -> R, args: A) -> Self {
        let invoke: Trampoline = invoke_unary::<A, R>;
        Self {
            func: expose(f as *const ()),
            invoke: expose(invoke as *const ()),
            args: encode_value(args),
        }
    }

    /// Encodes a call of `f()`.
    pub fn nullary<R: Serial>(f: fn() -> R) -> Self {
        let invoke: Trampoline = invoke_nullary::<R>;
        Self {
            func: expose(f as *const ()),
            invoke: expose(invoke as *const ()),
            args: [0u8; ARGS_CAPACITY],
        }
    }
}

impl EncodedCall for FnCall {
    #[inline]
    fn execute(&self) -> ResultBuf {
        let func = ptr::with_exposed_provenance::<()>(self.func);
        let invoke = ptr::with_exposed_provenance::<()>(self.invoke);
        // SAFETY: `invoke` was exposed from a `Trampoline` monomorphized for
        // the exact signature `func` was erased from, and `args` was encoded
        // with the matching type. Fields are private and `FnCall` has no
        // constructor from arbitrary bytes.
        unsafe {
            let invoke = mem::transmute::<*const (), Trampoline>(invoke);
            invoke(func, &self.args)
        }
    }
}

impl fmt::Debug for FnCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCall")
            .field("func", &format_args!("{:#x}", self.func))
            .finish()
    }
}

unsafe fn invoke_unary<A: Serial, R: Serial>(func: *const (), args: &ArgsBuf) -> ResultBuf {
    let f = unsafe { mem::transmute::<*const (), fn(A) -> R>(func) };
    let args = unsafe { decode_value::<A, ARGS_CAPACITY>(args) };
    encode_value(f(args))
}

unsafe fn invoke_nullary<R: Serial>(func: *const (), _args: &ArgsBuf) -> ResultBuf {
    let f = unsafe { mem::transmute::<*const (), fn() -> R>(func) };
    encode_value(f())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{BufferPack, pack_records};

    /// A `u8` tag widened with an explicit gap so the struct has no padding.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable)]
    #[repr(C)]
    struct Tagged {
        tag: u8,
        _gap: [u8; 7],
        value: u64,
    }

    impl Tagged {
        fn new(tag: u8, value: u64) -> Self {
            Self {
                tag,
                _gap: [0; 7],
                value,
            }
        }
    }

    fn add([a, b]: [u64; 2]) -> u64 {
        a + b
    }

    fn answer() -> i32 {
        42
    }

    fn widen(x: u8) -> [u64; 8] {
        [x as u64; 8]
    }

    fn nothing(_: u32) {}

    fn swap_tag(t: Tagged) -> Tagged {
        Tagged::new(t.value as u8, t.tag as u64)
    }

    /// Leaves a recognizable pattern in stack memory the next call may reuse.
    #[inline(never)]
    fn scribble_stack() -> u8 {
        let junk = std::hint::black_box([0xaau8; 4096]);
        junk[4095]
    }

    #[test]
    fn test_fncall_size() {
        assert_eq!(size_of::<FnCall>(), 64);
    }

    #[test]
    fn test_execute_unary() {
        let call = FnCall::new(add, [40, 2]);
        let result = call.execute();
        assert_eq!(unsafe { decode_value::<u64, RESULT_CAPACITY>(&result) }, 42);
    }

    #[test]
    fn test_execute_nullary() {
        let call = FnCall::nullary(answer);
        let result = call.execute();
        assert_eq!(unsafe { decode_value::<i32, RESULT_CAPACITY>(&result) }, 42);
    }

    #[test]
    fn test_full_capacity_result() {
        let call = FnCall::new(widen, 7u8);
        let result = call.execute();
        assert_eq!(
            unsafe { decode_value::<[u64; 8], RESULT_CAPACITY>(&result) },
            [7; 8]
        );
    }

    #[test]
    fn test_unit_result() {
        let call = FnCall::new(nothing, 1u32);
        let result = call.execute();
        assert_eq!(result, [0u8; RESULT_CAPACITY]);
    }

    #[test]
    fn test_encoded_bytes_are_exact() {
        assert_eq!(scribble_stack(), 0xaa);
        let buf: ResultBuf = encode_value(Tagged::new(1, 2));

        let mut expected = [0u8; RESULT_CAPACITY];
        expected[0] = 1;
        expected[8..16].copy_from_slice(&2u64.to_ne_bytes());
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_call_bytes_are_deterministic() {
        assert_eq!(scribble_stack(), 0xaa);
        let first = FnCall::new(swap_tag, Tagged::new(3, 9));
        assert_eq!(scribble_stack(), 0xaa);
        let second = FnCall::new(swap_tag, Tagged::new(3, 9));
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert!(first.args[size_of::<Tagged>()..].iter().all(|&b| b == 0));

        let result = first.execute();
        assert!(result[size_of::<Tagged>()..].iter().all(|&b| b == 0));
        assert_eq!(
            unsafe { decode_value::<Tagged, RESULT_CAPACITY>(&result) },
            Tagged::new(9, 3)
        );
    }

    #[test]
    fn test_copy_preserves_call() {
        let call = FnCall::new(add, [1, 2]);
        let bytes = pack_records(&[call]);
        let copied = unsafe { BufferPack::<FnCall>::new(&bytes).read(0) };
        let result = copied.execute();
        assert_eq!(unsafe { decode_value::<u64, RESULT_CAPACITY>(&result) }, 3);
    }
}
