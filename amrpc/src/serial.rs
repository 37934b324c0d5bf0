//! Bound for values that are copied bytewise into fixed-size payloads.

use zerocopy::{Immutable, IntoBytes};

/// A value whose bytes can be copied into a payload buffer.
///
/// Every type that is `IntoBytes + Immutable` qualifies, so padding-free
/// primitives, arrays and `#[derive(IntoBytes, Immutable)]` structs can be
/// passed as arguments and results. Types with padding bytes, such as
/// `(u8, u64)` or `Option<u64>`, are rejected at compile time; pack
/// several arguments into an array or a `#[repr(C)]` struct without gaps.
///
/// `Serial` only covers the write side. Reading a value back from bytes
/// is safe for `zerocopy::FromBytes` types; for others (`bool`, `char`,
/// call encodings) the bytes must have been written from the same type.
pub trait Serial: IntoBytes + Immutable + Copy + 'static {}

impl<T: IntoBytes + Immutable + Copy + 'static> Serial for T {}
