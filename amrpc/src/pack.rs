//! Bounds-checked views of a raw byte range as a sequence of fixed-size records.
//!
//! A batch on the wire is a flat concatenation of records with no header and
//! no length prefix. The record count is recovered from the byte length, so
//! constructing a view over a length that is not an exact multiple of the
//! record size is a contract violation and panics.
//!
//! Records are accessed with unaligned loads and stores, so the underlying
//! buffer needs no particular alignment.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;

use zerocopy::{FromBytes, IntoBytes};

use crate::serial::Serial;

/// Returns the record count for `nbytes` bytes of `T` records.
///
/// # Panics
/// Panics if `T` is zero-sized or `nbytes` is not a multiple of
/// `size_of::<T>()`.
#[inline]
fn record_count<T>(nbytes: usize) -> usize {
    let size = size_of::<T>();
    assert!(size > 0, "zero-sized records cannot be packed");
    assert!(
        nbytes.is_multiple_of(size),
        "batch length {} is not a multiple of the record size {}",
        nbytes,
        size
    );
    nbytes / size
}

#[inline]
fn check_index(index: usize, len: usize) {
    assert!(
        index < len,
        "record index {} out of range for batch of {}",
        index,
        len
    );
}

/// Read-only view of a byte buffer as `len()` records of type `T`.
///
/// Any record type can be viewed, but only `FromBytes` records can be read
/// with the safe [`get`](Self::get): they are valid for every bit pattern.
/// Other records go through [`read`](Self::read).
///
/// ```compile_fail
/// // `char` is not valid for every bit pattern.
/// let c = amrpc::BufferPack::<char>::new(&[0xff; 4]).get(0);
/// ```
///
/// ```compile_fail
/// // Neither is a call encoding.
/// let bytes = [0u8; 64];
/// let call = amrpc::BufferPack::<amrpc::FnCall>::new(&bytes).get(0);
/// ```
pub struct BufferPack<'a, T> {
    buf: &'a [u8],
    len: usize,
    _marker: PhantomData<T>,
}

impl<'a, T: Copy> BufferPack<'a, T> {
    /// Creates a view over `buf`.
    ///
    /// # Panics
    /// Panics if `buf.len()` is not a multiple of `size_of::<T>()`.
    pub fn new(buf: &'a [u8]) -> Self {
        let len = record_count::<T>(buf.len());
        Self {
            buf,
            len,
            _marker: PhantomData,
        }
    }

    /// Number of records in the view.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a copy of the record at `index` without checking that its
    /// bytes form a valid `T`.
    ///
    /// # Safety
    /// The record's bytes must have been written from a `T`, e.g. by
    /// [`pack_records`] or [`BufferPackMut::set`] with the same type.
    ///
    /// # Panics
    /// Panics if `index >= self.len()`.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T {
        check_index(index, self.len);
        // SAFETY: index < len, so the record lies within `buf`; the caller
        // vouches for the bit pattern.
        unsafe { ptr::read_unaligned(self.buf.as_ptr().add(index * size_of::<T>()) as *const T) }
    }
}

impl<'a, T: Copy + FromBytes> BufferPack<'a, T> {
    /// Returns a copy of the record at `index`.
    ///
    /// # Panics
    /// Panics if `index >= self.len()`.
    #[inline]
    pub fn get(&self, index: usize) -> T {
        // SAFETY: `T: FromBytes` is valid for any bit pattern.
        unsafe { self.read(index) }
    }

    /// Iterates over the records in buffer order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }
}

/// Writable view of a byte buffer as `len()` records of type `T`.
pub struct BufferPackMut<'a, T: Serial> {
    buf: &'a mut [u8],
    len: usize,
    _marker: PhantomData<T>,
}

impl<'a, T: Serial> BufferPackMut<'a, T> {
    /// Creates a writable view over `buf`.
    ///
    /// # Panics
    /// Panics if `buf.len()` is not a multiple of `size_of::<T>()`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let len = record_count::<T>(buf.len());
        Self {
            buf,
            len,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes `value` into the record at `index`.
    ///
    /// # Panics
    /// Panics if `index >= self.len()`.
    #[inline]
    pub fn set(&mut self, index: usize, value: T) {
        check_index(index, self.len);
        let start = index * size_of::<T>();
        self.buf[start..start + size_of::<T>()].copy_from_slice(value.as_bytes());
    }

    /// Reborrows as a read-only view.
    pub fn as_pack(&self) -> BufferPack<'_, T> {
        BufferPack {
            buf: &*self.buf,
            len: self.len,
            _marker: PhantomData,
        }
    }
}

/// Packs `records` into a freshly allocated buffer of exactly
/// `records.len() * size_of::<T>()` bytes.
pub fn pack_records<T: Serial>(records: &[T]) -> Vec<u8> {
    let mut buf = vec![0u8; records.len() * size_of::<T>()];
    let mut view = BufferPackMut::<T>::new(&mut buf);
    for (i, record) in records.iter().enumerate() {
        view.set(i, *record);
    }
    buf
}
