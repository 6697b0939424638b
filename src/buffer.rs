//! Aligned wire buffer with a single read/write cursor.
//!
//! The backing store is a vector of [`MAX_ALIGN`]-aligned blocks, so an
//! offset that is a multiple of an alignment is also an address with that
//! alignment. Padding is computed with [`crate::layout::padding`], the same
//! function used for compile-time layouts.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::layout::{MAX_ALIGN, align_to, check_alignment};
use crate::wire::{MarshalCx, Marshal, Unmarshal, UnmarshalCx, Unmarshalled};

#[derive(Clone, Copy)]
#[repr(C, align(128))]
struct Block([u8; MAX_ALIGN]);

// SAFETY: `Block` is a byte array with no padding (size == alignment == 128),
// so every bit pattern is valid and all-zero is a valid value.
unsafe impl Zeroable for Block {}
// SAFETY: see above; the type is `Copy`, `'static` and `repr(C)`.
unsafe impl Pod for Block {}

const ZERO_BLOCK: Block = Block([0; MAX_ALIGN]);

/// Growable byte buffer used for every outbound and inbound message.
///
/// Writes append at the cursor after padding to the requested alignment;
/// reads consume from the cursor after the same padding. The cursor only
/// moves forward.
///
/// # Example
///
/// ```
/// use rankcall::{Buffer, MarshalCx, Registry};
///
/// let registry = Registry::builder().build();
/// let mut buf = Buffer::new();
/// buf.push(&7u8, &MarshalCx::detached())?;
/// buf.push(&1.5f64, &MarshalCx::detached())?;
/// assert_eq!(buf.len(), 16);
///
/// let mut inbound = Buffer::from_bytes(buf.as_bytes());
/// let cx = registry.unmarshal_cx();
/// assert_eq!(inbound.pop_ready::<u8>(&cx)?, 7);
/// assert_eq!(inbound.pop_ready::<f64>(&cx)?, 1.5);
/// # Ok::<(), rankcall::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct Buffer {
    blocks: Vec<Block>,
    len: usize,
    cursor: usize,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Buffer {
    /// Create an empty buffer for writing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with room for `bytes` bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        let mut buf = Self::new();
        buf.blocks.reserve(bytes.div_ceil(MAX_ALIGN));
        buf
    }

    /// Create a buffer holding a copy of `data`, positioned for reading.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.grow_to(data.len());
        if let Some(dst) = buf.storage_mut().get_mut(..data.len()) {
            dst.copy_from_slice(data);
        }
        buf.len = data.len();
        buf
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current cursor offset.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes between the cursor and the end of the written data.
    pub fn remaining(&self) -> usize {
        self.len.saturating_sub(self.cursor)
    }

    /// The written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.storage().get(..self.len).unwrap_or_default()
    }

    /// The bytes after the cursor, without consuming them.
    pub fn peek_remaining(&self) -> &[u8] {
        self.as_bytes().get(self.cursor..).unwrap_or_default()
    }

    /// Copy the written bytes out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Move the cursor back to the start, keeping the contents.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Whether the byte under the cursor sits at an address aligned to `alignment`.
    pub fn address_is_aligned(&self, alignment: usize) -> bool {
        let base = self.storage().as_ptr() as usize;
        (base + self.cursor) % alignment == 0
    }

    fn storage(&self) -> &[u8] {
        bytemuck::cast_slice(&self.blocks)
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.blocks)
    }

    /// Ensure the block store covers `end` bytes. Existing bytes are preserved.
    fn grow_to(&mut self, end: usize) {
        let blocks = end.div_ceil(MAX_ALIGN);
        if blocks > self.blocks.len() {
            self.blocks.resize(blocks, ZERO_BLOCK);
        }
    }

    fn exhausted(&self, needed: usize) -> Error {
        Error::BufferExhausted {
            needed,
            available: self.len,
        }
    }

    /// Advance the read cursor to the next multiple of `alignment`.
    pub fn realign(&mut self, alignment: usize) -> Result<()> {
        check_alignment(alignment)?;
        let target = align_to(self.cursor, alignment);
        if target > self.len {
            return Err(self.exhausted(target));
        }
        self.cursor = target;
        Ok(())
    }

    /// Advance the write cursor to the next multiple of `alignment`, zero-filling the gap.
    pub fn realign_append(&mut self, alignment: usize) -> Result<()> {
        check_alignment(alignment)?;
        let target = align_to(self.cursor, alignment);
        self.grow_to(target);
        let start = self.cursor;
        if let Some(gap) = self.storage_mut().get_mut(start..target) {
            gap.fill(0);
        }
        self.cursor = target;
        self.len = self.len.max(target);
        Ok(())
    }

    /// Pad to `alignment`, then append `bytes`.
    pub fn append(&mut self, bytes: &[u8], alignment: usize) -> Result<()> {
        self.realign_append(alignment)?;
        let start = self.cursor;
        let end = start + bytes.len();
        self.grow_to(end);
        let available = self.len;
        self.storage_mut()
            .get_mut(start..end)
            .ok_or(Error::BufferExhausted {
                needed: end,
                available,
            })?
            .copy_from_slice(bytes);
        self.cursor = end;
        self.len = self.len.max(end);
        Ok(())
    }

    /// Append the memory image of a plain-old-data value.
    pub fn append_pod<T: Pod>(&mut self, value: &T, alignment: usize) -> Result<()> {
        self.append(bytemuck::bytes_of(value), alignment)
    }

    /// Append the memory image of a slice of plain-old-data values.
    pub fn append_pod_slice<T: Pod>(&mut self, values: &[T], alignment: usize) -> Result<()> {
        self.append(bytemuck::cast_slice(values), alignment)
    }

    /// Append another buffer's bytes, realigned to [`MAX_ALIGN`] so the
    /// offsets inside it keep their alignment.
    pub fn append_buffer(&mut self, other: &Buffer) -> Result<()> {
        self.append(other.as_bytes(), MAX_ALIGN)
    }

    /// Consume `len` bytes at the cursor.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8]> {
        let start = self.cursor;
        let end = start
            .checked_add(len)
            .ok_or(Error::LengthOverflow(len as u64))?;
        if end > self.len {
            return Err(self.exhausted(end));
        }
        self.cursor = end;
        self.storage()
            .get(start..end)
            .ok_or(Error::BufferExhausted {
                needed: end,
                available: self.len,
            })
    }

    /// Realign, then copy out a plain-old-data value.
    pub fn read_pod<T: Pod>(&mut self, alignment: usize) -> Result<T> {
        self.realign(alignment)?;
        let bytes = self.read_bytes(std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// View `count` values of `T` in place at the cursor and advance past them.
    ///
    /// The cursor must already be aligned for `T`; the wire image is taken as
    /// the receiver's memory image (same layout and endianness on both ends).
    pub fn reinterpret_and_advance<T: Pod>(&mut self, count: usize) -> Result<&[T]> {
        let offset = self.cursor;
        let alignment = std::mem::align_of::<T>();
        if !self.address_is_aligned(alignment) {
            return Err(Error::Misaligned { offset, alignment });
        }
        let len = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(Error::LengthOverflow(count as u64))?;
        let bytes = self.read_bytes(len)?;
        bytemuck::try_cast_slice(bytes).map_err(|_| Error::Misaligned { offset, alignment })
    }

    /// Marshal `value` at its wire alignment.
    pub fn push<T: Marshal + ?Sized>(&mut self, value: &T, cx: &MarshalCx<'_>) -> Result<()> {
        self.push_aligned(value, T::ALIGN, cx)
    }

    /// Marshal `value` at `alignment` (raised to the type's own wire alignment).
    pub fn push_aligned<T: Marshal + ?Sized>(
        &mut self,
        value: &T,
        alignment: usize,
        cx: &MarshalCx<'_>,
    ) -> Result<()> {
        self.realign_append(alignment.max(T::ALIGN))?;
        value.marshal(cx, self)
    }

    /// Realign to `T`'s wire alignment and unmarshal a value or its construction plan.
    pub fn pop<T: Unmarshal>(&mut self, cx: &UnmarshalCx<'_>) -> Result<Unmarshalled<T>> {
        self.realign(T::ALIGN)?;
        T::unmarshal(cx, self)
    }

    /// Like [`Buffer::pop`], but fails when the type needs deferred construction.
    pub fn pop_ready<T: Unmarshal>(&mut self, cx: &UnmarshalCx<'_>) -> Result<T> {
        self.pop::<T>(cx)?.into_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_pads_to_alignment() {
        let mut buf = Buffer::new();
        buf.append(&[1], 1).unwrap();
        buf.append(&[2, 2, 2, 2], 4).unwrap();
        assert_eq!(buf.as_bytes(), &[1, 0, 0, 0, 2, 2, 2, 2]);
        assert_eq!(buf.cursor(), 8);
    }

    #[test]
    fn growth_preserves_contents() {
        let mut buf = Buffer::new();
        for i in 0..1000u32 {
            buf.append_pod(&i, 4).unwrap();
        }
        buf.rewind();
        for i in 0..1000u32 {
            assert_eq!(buf.read_pod::<u32>(4).unwrap(), i);
        }
    }

    #[test]
    fn realign_append_zero_fills() {
        let mut buf = Buffer::new();
        buf.append(&[0xff], 1).unwrap();
        buf.realign_append(32).unwrap();
        assert_eq!(buf.len(), 32);
        assert!(buf.as_bytes().iter().skip(1).all(|b| *b == 0));
        assert!(buf.address_is_aligned(32));
    }

    #[test]
    fn reading_past_end_is_reported() {
        let mut buf = Buffer::from_bytes(&[1, 2, 3]);
        let err = buf.read_pod::<u32>(4).unwrap_err();
        assert!(matches!(
            err,
            Error::BufferExhausted {
                needed: 4,
                available: 3
            }
        ));
    }

    #[test]
    fn realign_past_end_is_reported() {
        let mut buf = Buffer::from_bytes(&[1, 2, 3]);
        buf.read_bytes(1).unwrap();
        assert!(buf.realign(8).unwrap_err().is_buffer());
    }

    #[test]
    fn reinterpret_views_in_place() {
        let mut buf = Buffer::new();
        buf.append_pod_slice(&[1u64, 2, 3], 8).unwrap();
        buf.rewind();
        let view = buf.reinterpret_and_advance::<u64>(3).unwrap();
        assert_eq!(view, &[1, 2, 3]);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn reinterpret_rejects_misaligned_cursor() {
        let mut buf = Buffer::from_bytes(&[0; 16]);
        buf.read_bytes(1).unwrap();
        let err = buf.reinterpret_and_advance::<u32>(1).unwrap_err();
        assert!(matches!(err, Error::Misaligned { offset: 1, alignment: 4 }));
    }

    #[test]
    fn append_buffer_keeps_inner_alignment() {
        let mut inner = Buffer::new();
        inner.append_pod(&9u64, 8).unwrap();
        let mut outer = Buffer::new();
        outer.append(&[1], 1).unwrap();
        outer.append_buffer(&inner).unwrap();
        outer.rewind();
        outer.read_bytes(1).unwrap();
        outer.realign(MAX_ALIGN).unwrap();
        assert_eq!(outer.read_pod::<u64>(8).unwrap(), 9);
    }

    #[test]
    fn invalid_alignment_rejected() {
        let mut buf = Buffer::new();
        assert!(matches!(
            buf.append(&[1], 3).unwrap_err(),
            Error::InvalidAlignment { alignment: 3, .. }
        ));
    }
}
