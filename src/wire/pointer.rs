//! Pointer wrappers: element runs sent with their count, alignment and
//! ownership flags.
//!
//! Wire layout:
//!
//! ```text
//! [count: usize][alignment: usize][pass_back: u8][pass_ownership: u8]
//! [type key: u64]            -- only for polymorphic element types
//! <pad to alignment>
//! [element 0][element 1]...  -- each at the element's wire alignment
//! ```
//!
//! The receiving side always copies the elements into a [`TrackedVec`]
//! accounted to the context's allocator, so the wrapper it hands to the
//! callee owns its storage regardless of the flags.

use super::{Marshal, MarshalCx, Unmarshal, UnmarshalCx, Unmarshalled, Wire, sequence};
use crate::alloc::TrackedVec;
use crate::buffer::Buffer;
use crate::classify::ArgCategory;
use crate::error::{Error, Result};
use crate::layout::check_alignment;
use crate::registry::TypeKey;

/// Header written before the elements of a wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerHeader {
    pub count: usize,
    pub alignment: usize,
    /// The callee's final element values travel back to the caller.
    pub pass_back: bool,
    /// The callee becomes responsible for releasing the elements.
    pub pass_ownership: bool,
    /// Dynamic type shared by every element, for polymorphic element types.
    pub key: Option<TypeKey>,
}

impl PointerHeader {
    fn validate(&self) -> Result<()> {
        if self.pass_back && self.pass_ownership {
            return Err(Error::InvalidPointerFlags {
                pass_back: self.pass_back,
                pass_ownership: self.pass_ownership,
            });
        }
        check_alignment(self.alignment)?;
        Ok(())
    }

    fn write<T: Wire>(&self, buf: &mut Buffer) -> Result<()> {
        self.validate()?;
        let word = std::mem::align_of::<usize>();
        buf.append_pod(&self.count, word)?;
        buf.append_pod(&self.alignment, word)?;
        buf.append(&[u8::from(self.pass_back), u8::from(self.pass_ownership)], 1)?;
        if T::POLYMORPHIC {
            buf.append_pod(&self.key.map_or(0, TypeKey::get), 8)?;
        }
        buf.realign_append(self.alignment)
    }

    fn read<T: Wire>(buf: &mut Buffer) -> Result<Self> {
        let word = std::mem::align_of::<usize>();
        let count = buf.read_pod::<usize>(word)?;
        let alignment = buf.read_pod::<usize>(word)?;
        let pass_back = read_flag(buf)?;
        let pass_ownership = read_flag(buf)?;
        let key = if T::POLYMORPHIC {
            Some(buf.read_pod::<u64>(8)?)
                .filter(|raw| *raw != 0)
                .map(TypeKey::from_raw)
        } else {
            None
        };
        let header = Self {
            count,
            alignment,
            pass_back,
            pass_ownership,
            key,
        };
        header.validate()?;
        buf.realign(alignment)?;
        Ok(header)
    }
}

fn read_flag(buf: &mut Buffer) -> Result<bool> {
    match buf.read_pod::<u8>(1)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::InvalidBool(other)),
    }
}

fn common_key<T: Marshal>(items: &[T]) -> Result<Option<TypeKey>> {
    let mut keys = items.iter().map(Marshal::dynamic_key);
    let first = keys.next().flatten();
    if keys.any(|key| key != first) {
        return Err(Error::MixedPolymorphicElements);
    }
    Ok(first)
}

/// Write a header and the elements of `items`.
pub(crate) fn marshal_elements<T: Marshal>(
    items: &[T],
    alignment: usize,
    pass_back: bool,
    pass_ownership: bool,
    cx: &MarshalCx<'_>,
    buf: &mut Buffer,
) -> Result<()> {
    let key = if T::POLYMORPHIC {
        common_key(items)?
    } else {
        None
    };
    let header = PointerHeader {
        count: items.len(),
        alignment: alignment.max(T::ALIGN),
        pass_back,
        pass_ownership,
        key,
    };
    header.write::<T>(buf)?;
    if T::POLYMORPHIC {
        for item in items {
            buf.realign_append(T::ALIGN)?;
            item.marshal_untagged(cx, buf)?;
        }
        Ok(())
    } else {
        T::marshal_many(items, cx, buf)
    }
}

/// Read a header and the elements that follow it.
pub(crate) fn unmarshal_elements<T: Unmarshal>(
    cx: &UnmarshalCx<'_>,
    buf: &mut Buffer,
) -> Result<(PointerHeader, Vec<Unmarshalled<T>>)> {
    let header = PointerHeader::read::<T>(buf)?;
    let items = match header.key {
        Some(key) if T::POLYMORPHIC => {
            let mut items = Vec::with_capacity(header.count.min(buf.remaining()));
            for _ in 0..header.count {
                buf.realign(T::ALIGN)?;
                items.push(T::unmarshal_tagged(cx, buf, key)?);
            }
            items
        }
        _ => T::unmarshal_many(cx, buf, header.count)?,
    };
    Ok((header, items))
}

/// Read a passed-back element run into `target`, which must have the same length.
pub(crate) fn restore_elements<T: Unmarshal>(
    target: &mut [T],
    cx: &UnmarshalCx<'_>,
    buf: &mut Buffer,
) -> Result<()> {
    let (header, items) = unmarshal_elements::<T>(cx, buf)?;
    if header.count != target.len() {
        return Err(Error::ElementCount {
            expected: target.len(),
            found: header.count,
        });
    }
    for (slot, item) in target.iter_mut().zip(items) {
        *slot = item.build_detached()?;
    }
    Ok(())
}

enum Storage<'a, T> {
    Shared(&'a [T]),
    Exclusive(&'a mut [T]),
    Owned(TrackedVec<T>),
}

/// A run of elements passed by address.
///
/// On the calling side the wrapper borrows or owns the caller's elements;
/// on the receiving side it owns a tracked copy.
///
/// ```
/// use rankcall::PtrWrapper;
///
/// let mut samples = [1.0f64, 2.0, 3.0];
/// let wrapper = PtrWrapper::view_mut(&mut samples).with_alignment(32);
/// assert!(wrapper.is_pass_back());
/// assert_eq!(wrapper.alignment(), 32);
/// ```
pub struct PtrWrapper<'a, T> {
    storage: Storage<'a, T>,
    alignment: usize,
    pass_back: bool,
    pass_ownership: bool,
}

impl<'a, T: Wire> PtrWrapper<'a, T> {
    fn new(storage: Storage<'a, T>, pass_back: bool, pass_ownership: bool) -> Self {
        Self {
            storage,
            alignment: T::ALIGN,
            pass_back,
            pass_ownership,
        }
    }

    /// Borrow `data` read-only. Nothing comes back after the call.
    pub fn view(data: &'a [T]) -> Self {
        Self::new(Storage::Shared(data), false, false)
    }

    /// Borrow `data` mutably. The callee's final values are written back.
    pub fn view_mut(data: &'a mut [T]) -> Self {
        Self::new(Storage::Exclusive(data), true, false)
    }

    /// Hand `data` to the callee, which becomes responsible for releasing it.
    pub fn give(data: Vec<T>) -> Self {
        Self::new(Storage::Owned(TrackedVec::untracked(data)), false, true)
    }

    fn received(data: TrackedVec<T>, header: PointerHeader) -> Self {
        Self {
            storage: Storage::Owned(data),
            alignment: header.alignment,
            pass_back: header.pass_back,
            pass_ownership: header.pass_ownership,
        }
    }

    /// Require at least `alignment` for the element run on the wire.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = self.alignment.max(alignment);
        self
    }

    /// Override the pass-back flag.
    pub fn with_pass_back(mut self, pass_back: bool) -> Self {
        self.pass_back = pass_back;
        self
    }
}

impl<T> PtrWrapper<'_, T> {
    pub fn as_slice(&self) -> &[T] {
        match &self.storage {
            Storage::Shared(data) => *data,
            Storage::Exclusive(data) => &**data,
            Storage::Owned(data) => data.as_slice(),
        }
    }

    /// Mutable access, unless the wrapper is a read-only view.
    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        match &mut self.storage {
            Storage::Shared(_) => None,
            Storage::Exclusive(data) => Some(&mut **data),
            Storage::Owned(data) => Some(data.as_mut_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().and_then(|data| data.get_mut(index))
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn is_pass_back(&self) -> bool {
        self.pass_back
    }

    pub fn is_pass_ownership(&self) -> bool {
        self.pass_ownership
    }

    /// Whether the wrapper owns its elements.
    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// Release owned elements. A borrowed view releases nothing.
    pub fn free(self) {
        drop(self);
    }

    /// Take owned elements out of the wrapper; `None` for a borrowed view.
    pub fn into_owned(self) -> Option<Vec<T>> {
        match self.storage {
            Storage::Owned(data) => Some(data.into_vec()),
            Storage::Shared(_) | Storage::Exclusive(_) => None,
        }
    }

    /// Copy passed-back element values into the borrowed or owned elements.
    pub(crate) fn restore_from(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()>
    where
        T: Unmarshal,
    {
        let target = self.as_mut_slice().ok_or_else(|| Error::CategoryMismatch {
            expected: "mutable pointer".to_string(),
            found: "read-only view".to_string(),
        })?;
        restore_elements(target, cx, buf)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PtrWrapper<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtrWrapper")
            .field("elements", &self.as_slice())
            .field("alignment", &self.alignment)
            .field("pass_back", &self.pass_back)
            .field("pass_ownership", &self.pass_ownership)
            .finish()
    }
}

impl<T: Wire> Wire for PtrWrapper<'_, T> {
    const ALIGN: usize = std::mem::align_of::<usize>();
    const NAME: &'static str = "PtrWrapper";
    const CATEGORY: ArgCategory = ArgCategory::NonOwningPointer;
}

impl<T: Marshal> Marshal for PtrWrapper<'_, T> {
    fn marshal(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        marshal_elements(
            self.as_slice(),
            self.alignment,
            self.pass_back,
            self.pass_ownership,
            cx,
            buf,
        )
    }
}

impl<T: Unmarshal> Unmarshal for PtrWrapper<'static, T> {
    fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        let (header, items) = unmarshal_elements::<T>(cx, buf)?;
        let allocator = cx.allocator().clone();
        sequence(items, move |values| {
            Ok(PtrWrapper::received(
                TrackedVec::new_in(values, allocator),
                header,
            ))
        })
    }

    fn restore(
        target: &mut Self,
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        _frame: Option<&mut crate::construct::Frame>,
    ) -> Result<()> {
        target.restore_from(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::alloc::CountingAllocator;
    use crate::registry::Registry;

    #[test]
    fn header_layout() {
        let data = [1u32, 2, 3];
        let mut buf = Buffer::new();
        buf.push(&PtrWrapper::view(&data).with_alignment(32), &MarshalCx::detached())
            .unwrap();
        let bytes = buf.as_bytes();
        let word = std::mem::size_of::<usize>();
        assert_eq!(&bytes[..word], &3usize.to_ne_bytes());
        assert_eq!(&bytes[word..2 * word], &32usize.to_ne_bytes());
        assert_eq!(bytes[2 * word], 0);
        assert_eq!(bytes[2 * word + 1], 0);
        assert_eq!(buf.len(), 32 + 12);
    }

    #[test]
    fn received_copy_is_tracked() {
        let counter = Arc::new(CountingAllocator::new());
        let registry = Registry::builder().allocator(counter.clone()).build();
        let data = vec![5u64, 6, 7];
        let mut buf = Buffer::new();
        buf.push(&PtrWrapper::give(data), &MarshalCx::detached()).unwrap();
        buf.rewind();
        let received = buf
            .pop_ready::<PtrWrapper<'static, u64>>(&registry.unmarshal_cx())
            .unwrap();
        assert!(received.is_pass_ownership());
        assert_eq!(received.as_slice(), &[5, 6, 7]);
        assert_eq!(counter.allocations(), 1);
        received.free();
        assert_eq!(counter.deallocations(), 1);
    }

    #[test]
    fn both_flags_rejected() {
        let mut buf = Buffer::new();
        let err = buf
            .push(
                &PtrWrapper::give(vec![1u8]).with_pass_back(true),
                &MarshalCx::detached(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPointerFlags { .. }));
    }

    #[test]
    fn restore_requires_matching_count() {
        let registry = Registry::builder().build();
        let mut buf = Buffer::new();
        buf.push(&PtrWrapper::view(&[1i32, 2]), &MarshalCx::detached())
            .unwrap();
        buf.rewind();
        let mut target = [0i32; 3];
        let err = PtrWrapper::view_mut(&mut target)
            .restore_from(&registry.unmarshal_cx(), &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::ElementCount { expected: 3, found: 2 }));
    }

    #[test]
    fn read_only_view_cannot_restore() {
        let registry = Registry::builder().build();
        let mut buf = Buffer::new();
        let source = [1i32];
        let mut view = PtrWrapper::view(&source);
        assert!(view.restore_from(&registry.unmarshal_cx(), &mut buf).is_err());
        assert!(view.get_mut(0).is_none());
    }
}
