//! Marshal/unmarshal registry: how each type is written to and read from a [`Buffer`].
//!
//! A type takes part in the protocol by implementing [`Wire`] plus one or
//! both of [`Marshal`] and [`Unmarshal`]. The resolution order is:
//!
//! - plain-old-data types copy their memory image at their natural
//!   alignment ([`pod_wire!`](crate::pod_wire) and the primitive impls);
//! - aggregates that can only be rebuilt through a constructor marshal
//!   their constructor arguments and unmarshal into a
//!   [`ConstructionPlan`] ([`construct_wire!`](crate::construct_wire));
//! - containers, strings, pointer wrappers and polymorphic boxes have
//!   dedicated impls in this module.
//!
//! Types with no impl are rejected at compile time.

pub(crate) mod impls;
pub mod pointer;
mod poly;

use std::sync::Arc;

use crate::alloc::Allocator;
use crate::buffer::Buffer;
use crate::classify::ArgCategory;
use crate::construct::{ConstructionPlan, Frame, Reservation, Slot};
use crate::error::{Error, Result};
use crate::registry::{Registry, TypeKey};

pub use impls::Overaligned;
pub use pointer::PtrWrapper;
pub use poly::Polymorphic;

/// Longest run of elements that occupy no wire bytes a receiver accepts.
pub const ZERO_WIDTH_RUN_LIMIT: usize = 1 << 16;

/// Static wire properties of a type.
pub trait Wire {
    /// Alignment the buffer is padded to before the value is written or read.
    const ALIGN: usize;
    /// Stable name; [`TypeKey::of`] hashes it for polymorphic dispatch.
    const NAME: &'static str;
    /// How the type is classified when it appears as a by-value parameter.
    const CATEGORY: ArgCategory = ArgCategory::Scalar;
    /// Whether the dynamic type is carried separately from the fields.
    const POLYMORPHIC: bool = false;
}

/// Writes a value into a buffer.
pub trait Marshal: Wire {
    /// Append the value. The buffer is already padded to [`Wire::ALIGN`].
    fn marshal(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()>;

    /// Append a run of values, each at its wire alignment.
    fn marshal_many(items: &[Self], cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()>
    where
        Self: Sized,
    {
        for item in items {
            buf.push(item, cx)?;
        }
        Ok(())
    }

    /// The dynamic type of a polymorphic value.
    fn dynamic_key(&self) -> Option<TypeKey> {
        None
    }

    /// Append the value without its dynamic type key.
    fn marshal_untagged(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        self.marshal(cx, buf)
    }
}

/// Reads a value, or the plan to construct it, from a buffer.
pub trait Unmarshal: Wire + Sized + 'static {
    /// Read one value. The cursor is already aligned to [`Wire::ALIGN`].
    fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>>;

    /// Read `count` values written by [`Marshal::marshal_many`].
    fn unmarshal_many(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        count: usize,
    ) -> Result<Vec<Unmarshalled<Self>>> {
        let mut items = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            let start = buf.cursor();
            items.push(buf.pop::<Self>(cx)?);
            // Zero-width elements cannot be counted against the payload.
            if buf.cursor() == start && count > buf.remaining().max(ZERO_WIDTH_RUN_LIMIT) {
                return Err(Error::LengthOverflow(count as u64));
            }
        }
        Ok(items)
    }

    /// Read a value whose dynamic type key was carried elsewhere.
    fn unmarshal_tagged(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        key: TypeKey,
    ) -> Result<Unmarshalled<Self>> {
        let _ = key;
        buf.pop::<Self>(cx)
    }

    /// Overwrite `target` with a passed-back value.
    ///
    /// `frame` is the caller's frame when `target` lives in one, so
    /// call-scoped constructor arguments can be updated in place.
    fn restore(
        target: &mut Self,
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: Option<&mut Frame>,
    ) -> Result<()> {
        let item = buf.pop::<Self>(cx)?;
        *target = match frame {
            Some(frame) => item.build(frame)?,
            None => item.build_detached()?,
        };
        Ok(())
    }

    /// [`Unmarshal::restore`] for a value held in `frame`, with the cursor
    /// already aligned.
    fn restore_in_place(
        target: &mut Self,
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
    ) -> Result<()> {
        *target = Self::unmarshal(cx, buf)?.build(frame)?;
        Ok(())
    }
}

/// Context for marshalling.
///
/// Carries the frame whose slots call-scoped constructor arguments refer to.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarshalCx<'a> {
    frame: Option<&'a Frame>,
}

impl<'a> MarshalCx<'a> {
    /// A context with no frame. Values holding frame slots fail to marshal.
    pub const fn detached() -> Self {
        Self { frame: None }
    }

    pub const fn with_frame(frame: &'a Frame) -> Self {
        Self { frame: Some(frame) }
    }

    pub fn frame(&self) -> Option<&'a Frame> {
        self.frame
    }
}

/// Context for unmarshalling: polymorphic factories and the allocator for
/// received element blocks.
#[derive(Clone)]
pub struct UnmarshalCx<'a> {
    registry: &'a Registry,
    allocator: Arc<dyn Allocator>,
}

impl<'a> UnmarshalCx<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            allocator: registry.allocator(),
        }
    }

    /// Account received element blocks to `allocator` instead of the registry's.
    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }
}

impl std::fmt::Debug for UnmarshalCx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnmarshalCx").finish_non_exhaustive()
    }
}

/// Result of unmarshalling: a finished value, or the recipe to construct it.
pub enum Unmarshalled<T> {
    Ready(T),
    Deferred(ConstructionPlan<T>),
}

impl<T: 'static> Unmarshalled<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    /// The finished value; a plan is an error.
    pub fn into_ready(self) -> Result<T> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Deferred(_) => Err(Error::UnexpectedConstructionInfo(
                std::any::type_name::<T>(),
            )),
        }
    }

    /// Place the value in `frame`, running its plan if it has one.
    pub fn realize(self, frame: &mut Frame) -> Result<Slot<T>> {
        match self {
            Self::Ready(value) => frame.emplace(value),
            Self::Deferred(plan) => frame.realize(plan),
        }
    }

    pub(crate) fn realize_at(self, frame: &mut Frame, at: Reservation) -> Result<Slot<T>> {
        match self {
            Self::Ready(value) => frame.emplace_at(at, value),
            Self::Deferred(plan) => frame.realize_at(plan, at),
        }
    }

    /// Produce the value itself. Call-scoped arguments of a plan stay in `frame`.
    pub fn build(self, frame: &mut Frame) -> Result<T> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Deferred(plan) => frame.build(plan),
        }
    }

    /// Produce the value without a frame to keep call-scoped arguments in.
    ///
    /// A plan whose constructor needs a call-scoped argument fails with
    /// [`Error::DetachedCallScoped`].
    pub fn build_detached(self) -> Result<T> {
        let mut scratch = Frame::new();
        let value = self.build(&mut scratch)?;
        if !scratch.is_empty() {
            return Err(Error::DetachedCallScoped(std::any::type_name::<T>()));
        }
        Ok(value)
    }

    /// Convert the value, deferring the conversion if construction is pending.
    pub fn map<U: 'static>(self, f: fn(T) -> U) -> Unmarshalled<U> {
        match self {
            Self::Ready(value) => Unmarshalled::Ready(f(value)),
            Self::Deferred(plan) => Unmarshalled::Deferred(plan.map(f)),
        }
    }
}

impl<T> std::fmt::Debug for Unmarshalled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Ready(..)"),
            Self::Deferred(plan) => f.debug_tuple("Deferred").field(plan).finish(),
        }
    }
}

/// Combine element results into one container result.
///
/// When every element is ready `finish` runs immediately; otherwise it runs
/// once the element plans are realized.
pub(crate) fn sequence<T, U, F>(items: Vec<Unmarshalled<T>>, finish: F) -> Result<Unmarshalled<U>>
where
    T: Wire + 'static,
    U: 'static,
    F: FnOnce(Vec<T>) -> Result<U> + 'static,
{
    if items.iter().any(Unmarshalled::is_deferred) {
        return Ok(Unmarshalled::Deferred(ConstructionPlan::collect(
            items, finish,
        )));
    }
    let values = items
        .into_iter()
        .filter_map(|item| match item {
            Unmarshalled::Ready(value) => Some(value),
            Unmarshalled::Deferred(_) => None,
        })
        .collect();
    Ok(Unmarshalled::Ready(finish(values)?))
}

/// Implement the wire traits for plain-old-data types by copying their
/// memory image at their natural alignment.
///
/// The types must implement [`bytemuck::Pod`].
///
/// ```
/// use bytemuck::{Pod, Zeroable};
///
/// #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
/// #[repr(C)]
/// struct Point {
///     x: f32,
///     y: f32,
/// }
///
/// rankcall::pod_wire!(Point);
/// ```
#[macro_export]
macro_rules! pod_wire {
    ($($t:ty),+ $(,)?) => {$(
        impl $crate::Wire for $t {
            const ALIGN: usize = ::std::mem::align_of::<$t>();
            const NAME: &'static str = stringify!($t);
        }

        impl $crate::Marshal for $t {
            fn marshal(
                &self,
                _cx: &$crate::MarshalCx<'_>,
                buf: &mut $crate::Buffer,
            ) -> $crate::Result<()> {
                buf.append_pod(self, <$t as $crate::Wire>::ALIGN)
            }

            fn marshal_many(
                items: &[Self],
                _cx: &$crate::MarshalCx<'_>,
                buf: &mut $crate::Buffer,
            ) -> $crate::Result<()> {
                buf.append_pod_slice(items, <$t as $crate::Wire>::ALIGN)
            }
        }

        impl $crate::Unmarshal for $t {
            fn unmarshal(
                _cx: &$crate::UnmarshalCx<'_>,
                buf: &mut $crate::Buffer,
            ) -> $crate::Result<$crate::Unmarshalled<Self>> {
                Ok($crate::Unmarshalled::Ready(
                    buf.read_pod::<$t>(<$t as $crate::Wire>::ALIGN)?,
                ))
            }

            fn unmarshal_many(
                _cx: &$crate::UnmarshalCx<'_>,
                buf: &mut $crate::Buffer,
                count: usize,
            ) -> $crate::Result<::std::vec::Vec<$crate::Unmarshalled<Self>>> {
                buf.realign(<$t as $crate::Wire>::ALIGN)?;
                Ok(buf
                    .reinterpret_and_advance::<$t>(count)?
                    .iter()
                    .map(|value| $crate::Unmarshalled::Ready(*value))
                    .collect())
            }
        }
    )+};
}
