//! Parameter classification.
//!
//! A registered function declares its parameters as a tuple of [`Param`]
//! types. Each one fixes the parameter's [`ArgCategory`], the type stored in
//! the callee's frame, and whether its final value is passed back:
//!
//! | Parameter            | Caller passes                     | Callee storage          | Passed back  |
//! |----------------------|-----------------------------------|-------------------------|--------------|
//! | `i32`, `f64`, `String`, ... | anything `Into` the type   | the type                | no           |
//! | `CString`            | `&CStr`, `CString`                | `CString`               | no           |
//! | [`Val<T>`], [`Ref<T>`] | `&T`, [`Bound<T>`]              | `T`                     | no           |
//! | [`Mut<T>`]           | `&mut T`, [`BoundMut<T>`]         | `T`                     | yes          |
//! | [`Array<T, N>`]      | `&[T; N]`                         | `[T; N]`                | no           |
//! | [`ArrayMut<T, N>`]   | `&mut [T; N]`                     | `[T; N]`                | yes          |
//! | [`Slice<T>`]         | `&[T]`, `&Vec<T>`                 | `Vec<T>`                | no           |
//! | [`SliceMut<T>`]      | `&mut [T]`                        | `Vec<T>`                | yes          |
//! | [`Ptr<T>`]           | `&[T]`, `&mut [T]`, [`PtrWrapper`] | [`Received<T>`]        | if flagged   |
//! | [`Owned<T>`]         | `Vec<T>`, [`PtrWrapper::give`]    | [`Received<T>`]         | no           |
//!
//! Arrays, slices and pointers travel in the pointer wrapper format.
//! Conversions happen on the calling side, so widening (`i32` into an
//! `i64` parameter) is implicit and narrowing does not compile.

use std::any::type_name;
use std::ffi::CString;
use std::fmt;
use std::marker::PhantomData;

use crate::buffer::Buffer;
use crate::construct::{Bound, BoundMut, Frame, Reservation};
use crate::error::{Error, Result};
use crate::layout::FieldSpec;
use crate::wire::pointer::{marshal_elements, restore_elements, unmarshal_elements};
use crate::wire::{Marshal, MarshalCx, PtrWrapper, Unmarshal, UnmarshalCx, Wire, sequence};

/// How an argument is carried across the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgCategory {
    /// Copied by value.
    Scalar,
    /// NUL-terminated byte string.
    CString,
    /// Element run whose release becomes the callee's responsibility.
    OwningPointer,
    /// Element run borrowed for the duration of the call.
    NonOwningPointer,
    /// Reference to an array; `extent` is `None` when only known at run time.
    ArrayReference { extent: Option<usize> },
    /// Mutable reference whose final value is written back to the caller.
    PassBackReference,
    /// Aggregate rebuilt through its constructor.
    UserAggregate,
}

impl ArgCategory {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::CString => "C string",
            Self::OwningPointer => "owning pointer",
            Self::NonOwningPointer => "non-owning pointer",
            Self::ArrayReference { .. } => "array reference",
            Self::PassBackReference => "pass-back reference",
            Self::UserAggregate => "user aggregate",
        }
    }
}

impl fmt::Display for ArgCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArrayReference { extent: Some(n) } => write!(f, "array reference [{n}]"),
            other => f.write_str(other.name()),
        }
    }
}

/// When a parameter's final value travels back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassBack {
    Never,
    Always,
    /// When the received pointer wrapper carries the pass-back flag.
    IfFlagged,
}

type UnmarshalParamFn = fn(&UnmarshalCx<'_>, &mut Buffer, &mut Frame, Reservation) -> Result<usize>;
type PassBackFn = fn(&Frame, usize, &mut Buffer) -> Result<bool>;

/// Everything the applier needs to know about one parameter.
#[derive(Clone, Copy)]
pub struct ParamDesc {
    pub type_name: &'static str,
    pub storage_name: &'static str,
    pub category: ArgCategory,
    pub pass_back: PassBack,
    /// Size and alignment of the parameter's position in the callee's frame.
    pub storage: FieldSpec,
    pub(crate) unmarshal: UnmarshalParamFn,
    pub(crate) marshal_back: PassBackFn,
}

impl fmt::Debug for ParamDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamDesc")
            .field("type_name", &self.type_name)
            .field("category", &self.category)
            .field("pass_back", &self.pass_back)
            .field("storage", &self.storage)
            .finish()
    }
}

/// A declared parameter type.
pub trait Param: Sized + 'static {
    /// The value the callee's frame holds for this parameter.
    type Storage: Marshal + Unmarshal;
    const CATEGORY: ArgCategory;
    const PASS_BACK: PassBack;

    /// Read the argument into its reserved frame position.
    fn unmarshal_into(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
        at: Reservation,
    ) -> Result<usize> {
        Ok(buf.pop::<Self::Storage>(cx)?.realize_at(frame, at)?.index())
    }

    /// Write the argument's final value if it travels back. Returns whether it did.
    fn pass_back(frame: &Frame, index: usize, buf: &mut Buffer) -> Result<bool> {
        if Self::PASS_BACK == PassBack::Never {
            return Ok(false);
        }
        let slot = frame.typed_slot::<Self::Storage>(index)?;
        buf.push(frame.get(slot)?, &MarshalCx::with_frame(frame))?;
        Ok(true)
    }

    fn describe() -> ParamDesc {
        ParamDesc {
            type_name: type_name::<Self>(),
            storage_name: type_name::<Self::Storage>(),
            category: Self::CATEGORY,
            pass_back: Self::PASS_BACK,
            storage: FieldSpec::of::<Self::Storage>()
                .with_min_align(<Self::Storage as Wire>::ALIGN),
            unmarshal: Self::unmarshal_into,
            marshal_back: Self::pass_back,
        }
    }
}

/// Scalar parameter types, declared directly.
pub trait Scalar: Param<Storage = Self> + Marshal + Unmarshal {}

macro_rules! impl_scalar_param {
    ($($t:ty),+) => {$(
        impl Param for $t {
            type Storage = $t;
            const CATEGORY: ArgCategory = <$t as Wire>::CATEGORY;
            const PASS_BACK: PassBack = PassBack::Never;
        }

        impl Scalar for $t {}
    )+};
}

impl_scalar_param!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char,
    String, CString
);

/// A by-value parameter of any wire type.
pub struct Val<T>(PhantomData<fn() -> T>);
/// A read-only reference parameter.
pub struct Ref<T>(PhantomData<fn() -> T>);
/// A mutable reference parameter; its final value is passed back.
pub struct Mut<T>(PhantomData<fn() -> T>);
/// A reference to a fixed-size array.
pub struct Array<T, const N: usize>(PhantomData<fn() -> T>);
/// A mutable reference to a fixed-size array; elements are passed back.
pub struct ArrayMut<T, const N: usize>(PhantomData<fn() -> T>);
/// A reference to a run-time sized array.
pub struct Slice<T>(PhantomData<fn() -> T>);
/// A mutable reference to a run-time sized array; elements are passed back.
pub struct SliceMut<T>(PhantomData<fn() -> T>);
/// A bare pointer the callee borrows.
pub struct Ptr<T>(PhantomData<fn() -> T>);
/// A bare pointer whose elements the callee takes over.
pub struct Owned<T>(PhantomData<fn() -> T>);

/// Pointer wrapper as the callee receives it.
pub type Received<T> = PtrWrapper<'static, T>;

impl<T: Marshal + Unmarshal> Param for Val<T> {
    type Storage = T;
    const CATEGORY: ArgCategory = <T as Wire>::CATEGORY;
    const PASS_BACK: PassBack = PassBack::Never;
}

impl<T: Marshal + Unmarshal> Param for Ref<T> {
    type Storage = T;
    const CATEGORY: ArgCategory = <T as Wire>::CATEGORY;
    const PASS_BACK: PassBack = PassBack::Never;
}

impl<T: Marshal + Unmarshal> Param for Mut<T> {
    type Storage = T;
    const CATEGORY: ArgCategory = ArgCategory::PassBackReference;
    const PASS_BACK: PassBack = PassBack::Always;
}

fn reject_owning(found_ownership: bool, expected: ArgCategory) -> Result<()> {
    if found_ownership {
        return Err(Error::CategoryMismatch {
            expected: expected.to_string(),
            found: ArgCategory::OwningPointer.to_string(),
        });
    }
    Ok(())
}

impl<T: Marshal + Unmarshal, const N: usize> Param for Array<T, N> {
    type Storage = [T; N];
    const CATEGORY: ArgCategory = ArgCategory::ArrayReference { extent: Some(N) };
    const PASS_BACK: PassBack = PassBack::Never;

    fn unmarshal_into(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
        at: Reservation,
    ) -> Result<usize> {
        unmarshal_array::<T, N>(cx, buf, frame, at, Self::CATEGORY)
    }
}

impl<T: Marshal + Unmarshal, const N: usize> Param for ArrayMut<T, N> {
    type Storage = [T; N];
    const CATEGORY: ArgCategory = ArgCategory::ArrayReference { extent: Some(N) };
    const PASS_BACK: PassBack = PassBack::Always;

    fn unmarshal_into(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
        at: Reservation,
    ) -> Result<usize> {
        unmarshal_array::<T, N>(cx, buf, frame, at, Self::CATEGORY)
    }

    fn pass_back(frame: &Frame, index: usize, buf: &mut Buffer) -> Result<bool> {
        let slot = frame.typed_slot::<[T; N]>(index)?;
        let elements = frame.get(slot)?;
        marshal_elements(elements, T::ALIGN, true, false, &MarshalCx::with_frame(frame), buf)?;
        Ok(true)
    }
}

fn unmarshal_array<T: Unmarshal, const N: usize>(
    cx: &UnmarshalCx<'_>,
    buf: &mut Buffer,
    frame: &mut Frame,
    at: Reservation,
    category: ArgCategory,
) -> Result<usize> {
    let (header, items) = unmarshal_elements::<T>(cx, buf)?;
    reject_owning(header.pass_ownership, category)?;
    let array = sequence(items, crate::wire::impls::vec_into_array::<T, N>)?;
    Ok(array.realize_at(frame, at)?.index())
}

impl<T: Marshal + Unmarshal> Param for Slice<T> {
    type Storage = Vec<T>;
    const CATEGORY: ArgCategory = ArgCategory::ArrayReference { extent: None };
    const PASS_BACK: PassBack = PassBack::Never;

    fn unmarshal_into(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
        at: Reservation,
    ) -> Result<usize> {
        unmarshal_slice::<T>(cx, buf, frame, at, Self::CATEGORY)
    }
}

impl<T: Marshal + Unmarshal> Param for SliceMut<T> {
    type Storage = Vec<T>;
    const CATEGORY: ArgCategory = ArgCategory::ArrayReference { extent: None };
    const PASS_BACK: PassBack = PassBack::Always;

    fn unmarshal_into(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
        at: Reservation,
    ) -> Result<usize> {
        unmarshal_slice::<T>(cx, buf, frame, at, Self::CATEGORY)
    }

    fn pass_back(frame: &Frame, index: usize, buf: &mut Buffer) -> Result<bool> {
        let slot = frame.typed_slot::<Vec<T>>(index)?;
        let elements = frame.get(slot)?;
        marshal_elements(elements, T::ALIGN, true, false, &MarshalCx::with_frame(frame), buf)?;
        Ok(true)
    }
}

fn unmarshal_slice<T: Unmarshal>(
    cx: &UnmarshalCx<'_>,
    buf: &mut Buffer,
    frame: &mut Frame,
    at: Reservation,
    category: ArgCategory,
) -> Result<usize> {
    let (header, items) = unmarshal_elements::<T>(cx, buf)?;
    reject_owning(header.pass_ownership, category)?;
    let values = sequence(items, Ok)?;
    Ok(values.realize_at(frame, at)?.index())
}

impl<T: Marshal + Unmarshal> Param for Ptr<T> {
    type Storage = Received<T>;
    const CATEGORY: ArgCategory = ArgCategory::NonOwningPointer;
    const PASS_BACK: PassBack = PassBack::IfFlagged;

    fn unmarshal_into(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
        at: Reservation,
    ) -> Result<usize> {
        let wrapper = buf.pop::<Received<T>>(cx)?.realize_at(frame, at)?;
        reject_owning(frame.get(wrapper)?.is_pass_ownership(), Self::CATEGORY)?;
        Ok(wrapper.index())
    }

    fn pass_back(frame: &Frame, index: usize, buf: &mut Buffer) -> Result<bool> {
        let slot = frame.typed_slot::<Received<T>>(index)?;
        let wrapper = frame.get(slot)?;
        if !wrapper.is_pass_back() {
            return Ok(false);
        }
        buf.push(wrapper, &MarshalCx::with_frame(frame))?;
        Ok(true)
    }
}

impl<T: Marshal + Unmarshal> Param for Owned<T> {
    type Storage = Received<T>;
    const CATEGORY: ArgCategory = ArgCategory::OwningPointer;
    const PASS_BACK: PassBack = PassBack::Never;

    fn unmarshal_into(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
        at: Reservation,
    ) -> Result<usize> {
        let wrapper = buf.pop::<Received<T>>(cx)?.realize_at(frame, at)?;
        if !frame.get(wrapper)?.is_pass_ownership() {
            return Err(Error::CategoryMismatch {
                expected: Self::CATEGORY.to_string(),
                found: ArgCategory::NonOwningPointer.to_string(),
            });
        }
        Ok(wrapper.index())
    }
}

/// A caller-side value accepted for parameter `P`.
pub trait Argument<P: Param> {
    /// Write the argument in `P`'s wire form.
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()>;

    /// Whether the callee will pass this argument's final value back.
    fn expects_pass_back(&self) -> bool {
        P::PASS_BACK == PassBack::Always
    }

    /// Read the passed-back value into the caller's storage.
    fn restore_arg(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        let _ = (cx, buf);
        Ok(())
    }
}

impl<T: Scalar, U: Into<T> + Clone> Argument<T> for U {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        let value: T = self.clone().into();
        buf.push(&value, &MarshalCx::detached())
    }
}

impl<T: Marshal + Unmarshal> Argument<Val<T>> for &T {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.push(*self, &MarshalCx::detached())
    }
}

impl<T: Marshal + Unmarshal> Argument<Val<T>> for Bound<'_, T> {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.push(self.get()?, &MarshalCx::with_frame(self.frame()))
    }
}

impl<T: Marshal + Unmarshal> Argument<Ref<T>> for &T {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.push(*self, &MarshalCx::detached())
    }
}

impl<T: Marshal + Unmarshal> Argument<Ref<T>> for Bound<'_, T> {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.push(self.get()?, &MarshalCx::with_frame(self.frame()))
    }
}

impl<T: Marshal + Unmarshal> Argument<Mut<T>> for &mut T {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.push(&**self, &MarshalCx::detached())
    }

    fn restore_arg(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        T::restore(self, cx, buf, None)
    }
}

impl<T: Marshal + Unmarshal> Argument<Mut<T>> for BoundMut<'_, T> {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.push(self.get()?, &MarshalCx::with_frame(self.frame()))
    }

    fn restore_arg(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        self.restore(cx, buf)
    }
}

impl<T: Marshal + Unmarshal, const N: usize> Argument<Array<T, N>> for &[T; N] {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        marshal_elements(*self, T::ALIGN, false, false, &MarshalCx::detached(), buf)
    }
}

impl<T: Marshal + Unmarshal, const N: usize> Argument<ArrayMut<T, N>> for &mut [T; N] {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        marshal_elements(&**self, T::ALIGN, true, false, &MarshalCx::detached(), buf)
    }

    fn restore_arg(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        restore_elements(&mut **self, cx, buf)
    }
}

impl<T: Marshal + Unmarshal> Argument<Slice<T>> for &[T] {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        marshal_elements(self, T::ALIGN, false, false, &MarshalCx::detached(), buf)
    }
}

impl<T: Marshal + Unmarshal> Argument<Slice<T>> for &Vec<T> {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        marshal_elements(self, T::ALIGN, false, false, &MarshalCx::detached(), buf)
    }
}

impl<T: Marshal + Unmarshal> Argument<SliceMut<T>> for &mut [T] {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        marshal_elements(self, T::ALIGN, true, false, &MarshalCx::detached(), buf)
    }

    fn restore_arg(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        restore_elements(self, cx, buf)
    }
}

impl<T: Marshal + Unmarshal> Argument<Ptr<T>> for PtrWrapper<'_, T> {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        reject_owning(self.is_pass_ownership(), ArgCategory::NonOwningPointer)?;
        buf.push(self, &MarshalCx::detached())
    }

    fn expects_pass_back(&self) -> bool {
        self.is_pass_back()
    }

    fn restore_arg(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        buf.realign(<PtrWrapper<'_, T> as Wire>::ALIGN)?;
        self.restore_from(cx, buf)
    }
}

impl<T: Marshal + Unmarshal> Argument<Ptr<T>> for &[T] {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.push(&PtrWrapper::view(self), &MarshalCx::detached())
    }
}

impl<T: Marshal + Unmarshal> Argument<Ptr<T>> for &mut [T] {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.realign_append(<PtrWrapper<'_, T> as Wire>::ALIGN)?;
        marshal_elements(self, T::ALIGN, true, false, &MarshalCx::detached(), buf)
    }

    fn expects_pass_back(&self) -> bool {
        true
    }

    fn restore_arg(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        buf.realign(<PtrWrapper<'_, T> as Wire>::ALIGN)?;
        restore_elements(self, cx, buf)
    }
}

impl<T: Marshal + Unmarshal> Argument<Owned<T>> for PtrWrapper<'_, T> {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        if !self.is_pass_ownership() {
            return Err(Error::CategoryMismatch {
                expected: ArgCategory::OwningPointer.to_string(),
                found: ArgCategory::NonOwningPointer.to_string(),
            });
        }
        buf.push(self, &MarshalCx::detached())
    }
}

impl<T: Marshal + Unmarshal> Argument<Owned<T>> for Vec<T> {
    fn marshal_arg(&self, buf: &mut Buffer) -> Result<()> {
        buf.realign_append(<PtrWrapper<'_, T> as Wire>::ALIGN)?;
        marshal_elements(self, T::ALIGN, false, true, &MarshalCx::detached(), buf)
    }
}

/// A declared parameter list: a tuple of [`Param`] types.
pub trait ParamList: 'static {
    fn describe() -> Vec<ParamDesc>;
}

/// A caller-side argument tuple matching parameter list `P`.
pub trait Arguments<P: ParamList> {
    /// Marshal every argument left to right.
    fn marshal_all(&self, buf: &mut Buffer) -> Result<()>;

    /// Restore passed-back arguments in declaration order.
    fn restore_all(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()>;
}

impl ParamList for () {
    fn describe() -> Vec<ParamDesc> {
        Vec::new()
    }
}

impl Arguments<()> for () {
    fn marshal_all(&self, _buf: &mut Buffer) -> Result<()> {
        Ok(())
    }

    fn restore_all(&mut self, _cx: &UnmarshalCx<'_>, _buf: &mut Buffer) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_param_list {
    ($($p:ident $a:ident $idx:tt),+) => {
        impl<$($p: Param),+> ParamList for ($($p,)+) {
            fn describe() -> Vec<ParamDesc> {
                vec![$($p::describe()),+]
            }
        }

        impl<$($p: Param,)+ $($a: Argument<$p>),+> Arguments<($($p,)+)> for ($($a,)+) {
            fn marshal_all(&self, buf: &mut Buffer) -> Result<()> {
                $( self.$idx.marshal_arg(buf)?; )+
                Ok(())
            }

            fn restore_all(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
                $(
                    if self.$idx.expects_pass_back() {
                        self.$idx.restore_arg(cx, buf)?;
                    }
                )+
                Ok(())
            }
        }
    };
}

impl_param_list!(P0 A0 0);
impl_param_list!(P0 A0 0, P1 A1 1);
impl_param_list!(P0 A0 0, P1 A1 1, P2 A2 2);
impl_param_list!(P0 A0 0, P1 A1 1, P2 A2 2, P3 A3 3);
impl_param_list!(P0 A0 0, P1 A1 1, P2 A2 2, P3 A3 3, P4 A4 4);
impl_param_list!(P0 A0 0, P1 A1 1, P2 A2 2, P3 A3 3, P4 A4 4, P5 A5 5);
impl_param_list!(P0 A0 0, P1 A1 1, P2 A2 2, P3 A3 3, P4 A4 4, P5 A5 5, P6 A6 6);
impl_param_list!(P0 A0 0, P1 A1 1, P2 A2 2, P3 A3 3, P4 A4 4, P5 A5 5, P6 A6 6, P7 A7 7);
