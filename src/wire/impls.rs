//! Wire impls for primitives, strings and standard containers.

use std::ffi::CString;

use bytemuck::Pod;

use super::{Marshal, MarshalCx, Unmarshal, UnmarshalCx, Unmarshalled, Wire, sequence};
use crate::buffer::Buffer;
use crate::classify::ArgCategory;
use crate::construct::{ArgSpec, ConstructionPlan, StorageDuration, next_arg};
use crate::error::{Error, Result};

crate::pod_wire!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64
);

/// Read a `u64` length field and convert it to `usize`.
pub(crate) fn read_len(buf: &mut Buffer) -> Result<usize> {
    let len = buf.read_pod::<u64>(8)?;
    usize::try_from(len).map_err(|_| Error::LengthOverflow(len))
}

pub(crate) fn write_len(buf: &mut Buffer, len: usize) -> Result<()> {
    buf.append_pod(&(len as u64), 8)
}

impl Wire for bool {
    const ALIGN: usize = 1;
    const NAME: &'static str = "bool";
}

impl Marshal for bool {
    fn marshal(&self, _cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        buf.append(&[u8::from(*self)], 1)
    }
}

impl Unmarshal for bool {
    fn unmarshal(_cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        match buf.read_pod::<u8>(1)? {
            0 => Ok(Unmarshalled::Ready(false)),
            1 => Ok(Unmarshalled::Ready(true)),
            other => Err(Error::InvalidBool(other)),
        }
    }
}

impl Wire for char {
    const ALIGN: usize = 4;
    const NAME: &'static str = "char";
}

impl Marshal for char {
    fn marshal(&self, _cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        buf.append_pod(&u32::from(*self), 4)
    }
}

impl Unmarshal for char {
    fn unmarshal(_cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        let code = buf.read_pod::<u32>(4)?;
        char::from_u32(code)
            .map(Unmarshalled::Ready)
            .ok_or(Error::InvalidChar(code))
    }
}

impl Wire for () {
    const ALIGN: usize = 1;
    const NAME: &'static str = "()";
}

impl Marshal for () {
    fn marshal(&self, _cx: &MarshalCx<'_>, _buf: &mut Buffer) -> Result<()> {
        Ok(())
    }
}

impl Unmarshal for () {
    fn unmarshal(_cx: &UnmarshalCx<'_>, _buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        Ok(Unmarshalled::Ready(()))
    }
}

// Strings: [len: u64][bytes]

impl Wire for String {
    const ALIGN: usize = 8;
    const NAME: &'static str = "String";
}

impl Marshal for String {
    fn marshal(&self, _cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        write_len(buf, self.len())?;
        buf.append(self.as_bytes(), 1)
    }
}

impl Unmarshal for String {
    fn unmarshal(_cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        let len = read_len(buf)?;
        let bytes = buf.read_bytes(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?;
        Ok(Unmarshalled::Ready(s.to_string()))
    }
}

// C strings: bytes up to and including the terminating NUL

impl Wire for CString {
    const ALIGN: usize = 1;
    const NAME: &'static str = "CString";
    const CATEGORY: ArgCategory = ArgCategory::CString;
}

impl Marshal for CString {
    fn marshal(&self, _cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        buf.append(self.as_bytes_with_nul(), 1)
    }
}

impl Unmarshal for CString {
    fn unmarshal(_cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        let len = buf
            .peek_remaining()
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::InvalidCString("missing terminator".to_string()))?;
        let bytes = buf.read_bytes(len + 1)?;
        let s = CString::from_vec_with_nul(bytes.to_vec())
            .map_err(|e| Error::InvalidCString(e.to_string()))?;
        Ok(Unmarshalled::Ready(s))
    }
}

// Vectors: [len: u64][elements]

impl<T: Wire> Wire for Vec<T> {
    const ALIGN: usize = 8;
    const NAME: &'static str = "Vec";
    const CATEGORY: ArgCategory = ArgCategory::ArrayReference { extent: None };
}

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        write_len(buf, self.len())?;
        T::marshal_many(self, cx, buf)
    }
}

impl<T: Unmarshal> Unmarshal for Vec<T> {
    fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        let len = read_len(buf)?;
        let items = T::unmarshal_many(cx, buf, len)?;
        sequence(items, Ok)
    }
}

// Fixed arrays: N elements, no length prefix

impl<T: Wire, const N: usize> Wire for [T; N] {
    const ALIGN: usize = T::ALIGN;
    const NAME: &'static str = "array";
    const CATEGORY: ArgCategory = ArgCategory::ArrayReference { extent: Some(N) };
}

impl<T: Marshal, const N: usize> Marshal for [T; N] {
    fn marshal(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        T::marshal_many(self, cx, buf)
    }
}

impl<T: Unmarshal, const N: usize> Unmarshal for [T; N] {
    fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        let items = T::unmarshal_many(cx, buf, N)?;
        sequence(items, vec_into_array::<T, N>)
    }
}

pub(crate) fn vec_into_array<T, const N: usize>(values: Vec<T>) -> Result<[T; N]> {
    <[T; N]>::try_from(values).map_err(|values| Error::ElementCount {
        expected: N,
        found: values.len(),
    })
}

// Options: [present: u8][value]

impl<T: Wire> Wire for Option<T> {
    const ALIGN: usize = 1;
    const NAME: &'static str = "Option";
}

impl<T: Marshal> Marshal for Option<T> {
    fn marshal(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        match self {
            None => buf.append(&[0], 1),
            Some(value) => {
                buf.append(&[1], 1)?;
                buf.push(value, cx)
            }
        }
    }
}

impl<T: Unmarshal> Unmarshal for Option<T> {
    fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        match buf.read_pod::<u8>(1)? {
            0 => Ok(Unmarshalled::Ready(None)),
            1 => Ok(buf.pop::<T>(cx)?.map(Some)),
            other => Err(Error::InvalidBool(other)),
        }
    }
}

// Tuples: elements in order, each at its own alignment. A tuple holding an
// aggregate defers until the aggregate's plan runs.

macro_rules! impl_tuple_wire {
    ($arity:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: Wire),+> Wire for ($($name,)+) {
            const ALIGN: usize = 1;
            const NAME: &'static str = "tuple";
        }

        impl<$($name: Marshal),+> Marshal for ($($name,)+) {
            fn marshal(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
                $( buf.push(&self.$idx, cx)?; )+
                Ok(())
            }
        }

        impl<$($name: Unmarshal),+> Unmarshal for ($($name,)+) {
            fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
                let items = ($( buf.pop::<$name>(cx)?, )+);
                if !($( items.$idx.is_deferred() )||+) {
                    return Ok(Unmarshalled::Ready(($( items.$idx.into_ready()?, )+)));
                }
                let parts = vec![$( ArgSpec::new(StorageDuration::Constructor, items.$idx) ),+];
                Ok(Unmarshalled::Deferred(ConstructionPlan::assemble(parts, |realized| {
                    let mut realized = realized.into_iter();
                    Ok(($( next_arg(&mut realized, $idx, $arity)?.into_value::<$name>()?, )+))
                })))
            }
        }
    };
}

impl_tuple_wire!(2; A: 0, B: 1);
impl_tuple_wire!(3; A: 0, B: 1, C: 2);
impl_tuple_wire!(4; A: 0, B: 1, C: 2, D: 3);

/// A plain-old-data value written at a wire alignment of `A` (or its own,
/// if larger).
///
/// Frame slots holding one honour the same alignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Overaligned<T, const A: usize>(pub T);

impl<T, const A: usize> Wire for Overaligned<T, A> {
    const ALIGN: usize = if A > std::mem::align_of::<T>() {
        A
    } else {
        std::mem::align_of::<T>()
    };
    const NAME: &'static str = "Overaligned";
}

impl<T: Pod, const A: usize> Marshal for Overaligned<T, A> {
    fn marshal(&self, _cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        buf.append_pod(&self.0, Self::ALIGN)
    }
}

impl<T: Pod, const A: usize> Unmarshal for Overaligned<T, A> {
    fn unmarshal(_cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        Ok(Unmarshalled::Ready(Overaligned(buf.read_pod::<T>(Self::ALIGN)?)))
    }
}
