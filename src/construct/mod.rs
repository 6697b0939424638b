//! Construction plans for aggregates that can only be rebuilt through a
//! constructor.
//!
//! An aggregate implements [`Construct`] by naming its constructor argument
//! list as a tuple of [`Temp`] and [`Held`] markers:
//!
//! - [`Temp<T>`] arguments only need to live while the constructor runs
//!   and are handed over by value;
//! - [`Held<T>`] arguments must outlive the call that receives the
//!   aggregate. They are placed in the [`Frame`] next to it and handed over
//!   as a [`Slot`].
//!
//! The aggregate marshals the arguments returned by
//! [`Construct::arguments`]; the receiving side reads them into a
//! [`ConstructionPlan`] and realizes it into a frame. Argument count and
//! storage durations are part of the tuple type, so a constructor and its
//! argument list cannot disagree.
//!
//! ```
//! use rankcall::{Construct, Frame, Held, Slot, Temp};
//!
//! struct Gauge {
//!     scale: f64,
//!     reading: Slot<i32>,
//! }
//!
//! impl Construct for Gauge {
//!     type Args = (Temp<f64>, Held<i32>);
//!
//!     fn construct((scale, reading): (f64, Slot<i32>)) -> Self {
//!         Gauge { scale, reading }
//!     }
//!
//!     fn arguments(&self) -> (&f64, Slot<i32>) {
//!         (&self.scale, self.reading)
//!     }
//! }
//!
//! rankcall::construct_wire!(Gauge);
//!
//! let mut frame = Frame::new();
//! let gauge = frame.construct::<Gauge>((0.5, 40))?;
//! let reading = frame.get(gauge)?.reading;
//! assert_eq!(*frame.get(reading)?, 40);
//! # Ok::<(), rankcall::Error>(())
//! ```

mod frame;

use std::any::{Any, type_name};
use std::marker::PhantomData;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::layout::FieldSpec;
use crate::wire::{Marshal, MarshalCx, Unmarshal, UnmarshalCx, Unmarshalled, Wire};

pub use frame::{Bound, BoundMut, Frame, Reservation, Slot};

/// How long a constructor argument must live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageDuration {
    /// Only until the constructor returns.
    Constructor,
    /// Until the call that receives the aggregate completes.
    Call,
}

/// Constructor argument consumed by value.
pub struct Temp<T>(PhantomData<fn() -> T>);

/// Constructor argument kept in the frame beside the aggregate.
pub struct Held<T>(PhantomData<fn() -> T>);

/// Result of realizing one argument of a plan.
pub enum RealizedArg {
    /// A constructor-scoped value.
    Value(Box<dyn Any>),
    /// Index of a call-scoped value in the frame.
    Held(usize),
}

impl RealizedArg {
    pub fn into_value<T: 'static>(self) -> Result<T> {
        match self {
            Self::Value(value) => value
                .downcast::<T>()
                .map(|value| *value)
                .map_err(|_| Error::SlotType {
                    expected: type_name::<T>(),
                    found: "another constructor argument",
                }),
            Self::Held(_) => Err(Error::SlotType {
                expected: type_name::<T>(),
                found: "call-scoped slot",
            }),
        }
    }

    pub fn held_index(self) -> Result<usize> {
        match self {
            Self::Held(index) => Ok(index),
            Self::Value(_) => Err(Error::SlotType {
                expected: "call-scoped slot",
                found: "constructor-scoped value",
            }),
        }
    }
}

/// One constructor argument of the [`Construct::Args`] tuple.
pub trait CtorArg: 'static {
    /// The argument's value type.
    type Value: Marshal + Unmarshal;
    /// What the constructor receives.
    type Realized;
    /// What a caller supplies to [`Frame::construct`].
    type Source;
    /// What [`Construct::arguments`] returns for this position.
    type Ref<'a>;
    const DURATION: StorageDuration;

    fn marshal_ref(arg: Self::Ref<'_>, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()>;
    fn unmarshal_spec(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<ArgSpec>;
    fn realize(arg: RealizedArg, frame: &Frame) -> Result<Self::Realized>;
    fn place_source(source: Self::Source, frame: &mut Frame) -> Result<(Self::Realized, Option<usize>)>;
    /// Read the passed-back argument and return what the constructor receives.
    fn restore(
        arg: Self::Ref<'_>,
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
    ) -> Result<Self::Realized>;
}

impl<T: Marshal + Unmarshal> CtorArg for Temp<T> {
    type Value = T;
    type Realized = T;
    type Source = T;
    type Ref<'a> = &'a T;
    const DURATION: StorageDuration = StorageDuration::Constructor;

    fn marshal_ref(arg: &T, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        buf.push(arg, cx)
    }

    fn unmarshal_spec(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<ArgSpec> {
        Ok(ArgSpec::new(StorageDuration::Constructor, buf.pop::<T>(cx)?))
    }

    fn realize(arg: RealizedArg, _frame: &Frame) -> Result<T> {
        arg.into_value()
    }

    fn place_source(source: T, _frame: &mut Frame) -> Result<(T, Option<usize>)> {
        Ok((source, None))
    }

    fn restore(_arg: &T, cx: &UnmarshalCx<'_>, buf: &mut Buffer, frame: &mut Frame) -> Result<T> {
        buf.pop::<T>(cx)?.build(frame)
    }
}

impl<T: Marshal + Unmarshal> CtorArg for Held<T> {
    type Value = T;
    type Realized = Slot<T>;
    type Source = T;
    type Ref<'a> = Slot<T>;
    const DURATION: StorageDuration = StorageDuration::Call;

    fn marshal_ref(arg: Slot<T>, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        let frame = cx.frame().ok_or(Error::DetachedSlot(arg.index()))?;
        buf.push(frame.get(arg)?, cx)
    }

    fn unmarshal_spec(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<ArgSpec> {
        Ok(ArgSpec::new(StorageDuration::Call, buf.pop::<T>(cx)?))
    }

    fn realize(arg: RealizedArg, frame: &Frame) -> Result<Slot<T>> {
        frame.typed_slot(arg.held_index()?)
    }

    fn place_source(source: T, frame: &mut Frame) -> Result<(Slot<T>, Option<usize>)> {
        let slot = frame.emplace(source)?;
        Ok((slot, Some(slot.index())))
    }

    fn restore(
        arg: Slot<T>,
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
    ) -> Result<Slot<T>> {
        buf.realign(T::ALIGN)?;
        let mut value = frame.take(arg)?;
        let result = T::restore_in_place(&mut value, cx, buf, frame);
        frame.refill(arg, value)?;
        result.map(|()| arg)
    }
}

/// A constructor argument list: a tuple of [`Temp`] and [`Held`] markers.
pub trait CtorArgs: 'static {
    const ARITY: usize;
    type Realized;
    type Source;
    type Refs<'a>;

    /// Storage duration of every position, in declaration order.
    fn durations() -> Vec<StorageDuration>;
    fn marshal(refs: Self::Refs<'_>, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()>;
    fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Vec<ArgSpec>>;
    fn realize(args: Vec<RealizedArg>, frame: &Frame) -> Result<Self::Realized>;
    fn place_sources(sources: Self::Source, frame: &mut Frame) -> Result<(Self::Realized, Vec<usize>)>;
    fn restore(
        refs: Self::Refs<'_>,
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        frame: &mut Frame,
    ) -> Result<Self::Realized>;
}

impl CtorArgs for () {
    const ARITY: usize = 0;
    type Realized = ();
    type Source = ();
    type Refs<'a> = ();

    fn durations() -> Vec<StorageDuration> {
        Vec::new()
    }

    fn marshal(_refs: (), _cx: &MarshalCx<'_>, _buf: &mut Buffer) -> Result<()> {
        Ok(())
    }

    fn unmarshal(_cx: &UnmarshalCx<'_>, _buf: &mut Buffer) -> Result<Vec<ArgSpec>> {
        Ok(Vec::new())
    }

    fn realize(args: Vec<RealizedArg>, _frame: &Frame) -> Result<()> {
        check_arity(&args, 0)
    }

    fn place_sources(_sources: (), _frame: &mut Frame) -> Result<((), Vec<usize>)> {
        Ok(((), Vec::new()))
    }

    fn restore(
        _refs: (),
        _cx: &UnmarshalCx<'_>,
        _buf: &mut Buffer,
        _frame: &mut Frame,
    ) -> Result<()> {
        Ok(())
    }
}

fn check_arity(args: &[RealizedArg], arity: usize) -> Result<()> {
    if args.len() == arity {
        Ok(())
    } else {
        Err(Error::ArgumentIndex {
            index: args.len(),
            arity,
        })
    }
}

pub(crate) fn next_arg(
    args: &mut impl Iterator<Item = RealizedArg>,
    index: usize,
    arity: usize,
) -> Result<RealizedArg> {
    args.next().ok_or(Error::ArgumentIndex { index, arity })
}

macro_rules! impl_ctor_args {
    ($arity:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: CtorArg),+> CtorArgs for ($($name,)+) {
            const ARITY: usize = $arity;
            type Realized = ($($name::Realized,)+);
            type Source = ($($name::Source,)+);
            type Refs<'a> = ($($name::Ref<'a>,)+);

            fn durations() -> Vec<StorageDuration> {
                vec![$($name::DURATION),+]
            }

            fn marshal(refs: Self::Refs<'_>, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
                $( $name::marshal_ref(refs.$idx, cx, buf)?; )+
                Ok(())
            }

            fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Vec<ArgSpec>> {
                Ok(vec![$( $name::unmarshal_spec(cx, buf)? ),+])
            }

            fn realize(args: Vec<RealizedArg>, frame: &Frame) -> Result<Self::Realized> {
                check_arity(&args, $arity)?;
                let mut args = args.into_iter();
                Ok(($( $name::realize(next_arg(&mut args, $idx, $arity)?, frame)?, )+))
            }

            fn place_sources(
                sources: Self::Source,
                frame: &mut Frame,
            ) -> Result<(Self::Realized, Vec<usize>)> {
                let mut held = Vec::new();
                let realized = ($({
                    let (value, index) = $name::place_source(sources.$idx, frame)?;
                    held.extend(index);
                    value
                },)+);
                Ok((realized, held))
            }

            fn restore(
                refs: Self::Refs<'_>,
                cx: &UnmarshalCx<'_>,
                buf: &mut Buffer,
                frame: &mut Frame,
            ) -> Result<Self::Realized> {
                Ok(($( $name::restore(refs.$idx, cx, buf, frame)?, )+))
            }
        }
    };
}

impl_ctor_args!(1; A: 0);
impl_ctor_args!(2; A: 0, B: 1);
impl_ctor_args!(3; A: 0, B: 1, C: 2);
impl_ctor_args!(4; A: 0, B: 1, C: 2, D: 3);
impl_ctor_args!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_ctor_args!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_ctor_args!(7; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_ctor_args!(8; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// An aggregate rebuilt on the receiving side by calling its constructor.
///
/// Implement the wire traits for it with
/// [`construct_wire!`](crate::construct_wire).
pub trait Construct: Sized + 'static {
    /// Constructor argument list, e.g. `(Temp<f64>, Held<bool>)`.
    type Args: CtorArgs;

    /// Minimum alignment of the frame position the aggregate is realized into.
    const HOLDER_ALIGN: usize = std::mem::align_of::<Self>();

    fn construct(args: <Self::Args as CtorArgs>::Realized) -> Self;

    /// The arguments that rebuild an equivalent value, in declaration order.
    fn arguments(&self) -> <Self::Args as CtorArgs>::Refs<'_>;
}

/// Overwrite an aggregate with passed-back constructor arguments.
///
/// Call-scoped arguments are updated in place in `frame`, then the
/// aggregate is rebuilt from the passed-back values and those slots.
pub fn restore_aggregate<T: Construct + Wire>(
    target: &mut T,
    cx: &UnmarshalCx<'_>,
    buf: &mut Buffer,
    frame: Option<&mut Frame>,
) -> Result<()> {
    let realized = match frame {
        Some(frame) => <T::Args as CtorArgs>::restore(target.arguments(), cx, buf, frame)?,
        None => {
            let mut scratch = Frame::new();
            let realized = <T::Args as CtorArgs>::restore(target.arguments(), cx, buf, &mut scratch)?;
            if !scratch.is_empty() {
                return Err(Error::DetachedCallScoped(type_name::<T>()));
            }
            realized
        }
    };
    *target = T::construct(realized);
    Ok(())
}

type BuildFn = Box<dyn FnOnce(&mut Frame, Vec<RealizedArg>) -> Result<Box<dyn Any>>>;
type PlaceFn = fn(&mut Frame, Reservation, Box<dyn Any>) -> Result<usize>;

fn place_boxed<T: 'static>(frame: &mut Frame, at: Reservation, value: Box<dyn Any>) -> Result<usize> {
    let value = value.downcast::<T>().map_err(|_| Error::SlotType {
        expected: type_name::<T>(),
        found: "another constructor argument",
    })?;
    Ok(frame.emplace_at(at, *value)?.index())
}

pub(crate) struct ErasedPlan {
    pub(crate) target: &'static str,
    pub(crate) field: FieldSpec,
    pub(crate) args: Vec<ArgSpec>,
    pub(crate) build: BuildFn,
    pub(crate) place: PlaceFn,
}

pub(crate) enum ArgValue {
    Immediate(Box<dyn Any>),
    Nested(ErasedPlan),
}

/// One unmarshalled constructor argument of a plan.
pub struct ArgSpec {
    duration: StorageDuration,
    field: FieldSpec,
    value: ArgValue,
    place: PlaceFn,
}

impl ArgSpec {
    /// Wrap an unmarshalled argument value or its nested plan.
    pub fn new<T: Wire + 'static>(duration: StorageDuration, item: Unmarshalled<T>) -> Self {
        match item {
            Unmarshalled::Ready(value) => Self {
                duration,
                field: FieldSpec::of::<T>().with_min_align(T::ALIGN),
                value: ArgValue::Immediate(Box::new(value)),
                place: place_boxed::<T>,
            },
            Unmarshalled::Deferred(plan) => Self::nested(duration, plan),
        }
    }

    fn nested<T: 'static>(duration: StorageDuration, plan: ConstructionPlan<T>) -> Self {
        Self {
            duration,
            field: plan.field(),
            value: ArgValue::Nested(plan.into_erased()),
            place: place_boxed::<T>,
        }
    }

    pub fn duration(&self) -> StorageDuration {
        self.duration
    }

    /// Size and alignment of the argument's frame position.
    pub fn field(&self) -> FieldSpec {
        self.field
    }

    /// Whether the argument itself needs construction.
    pub fn is_nested(&self) -> bool {
        matches!(self.value, ArgValue::Nested(_))
    }
}

impl std::fmt::Debug for ArgSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgSpec")
            .field("duration", &self.duration)
            .field("field", &self.field)
            .field("nested", &self.is_nested())
            .finish()
    }
}

/// The recipe for constructing a `T`: its unmarshalled constructor
/// arguments and the constructor to run once they are in place.
pub struct ConstructionPlan<T> {
    erased: ErasedPlan,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> ConstructionPlan<T> {
    fn from_parts(args: Vec<ArgSpec>, field: FieldSpec, build: BuildFn) -> Self {
        Self {
            erased: ErasedPlan {
                target: type_name::<T>(),
                field,
                args,
                build,
                place: place_boxed::<T>,
            },
            _marker: PhantomData,
        }
    }

    /// Type name of the value the plan constructs.
    pub fn target(&self) -> &'static str {
        self.erased.target
    }

    pub fn arity(&self) -> usize {
        self.erased.args.len()
    }

    pub fn args(&self) -> &[ArgSpec] {
        &self.erased.args
    }

    pub fn durations(&self) -> Vec<StorageDuration> {
        self.erased.args.iter().map(ArgSpec::duration).collect()
    }

    /// Size and alignment of the position the value is realized into.
    pub fn field(&self) -> FieldSpec {
        self.erased.field
    }

    /// Require at least `alignment` for the realized value.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.erased.field = self.erased.field.with_min_align(alignment);
        self
    }

    pub(crate) fn into_erased(self) -> ErasedPlan {
        self.erased
    }

    /// A plan that builds a container from element values or plans.
    pub(crate) fn collect<E, F>(items: Vec<Unmarshalled<E>>, finish: F) -> Self
    where
        E: Wire + 'static,
        F: FnOnce(Vec<E>) -> Result<T> + 'static,
    {
        let args = items
            .into_iter()
            .map(|item| ArgSpec::new(StorageDuration::Constructor, item))
            .collect();
        let build: BuildFn = Box::new(move |_frame: &mut Frame, realized: Vec<RealizedArg>| {
            let values = realized
                .into_iter()
                .map(RealizedArg::into_value::<E>)
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(finish(values)?) as Box<dyn Any>)
        });
        Self::from_parts(args, FieldSpec::of::<T>(), build)
    }

    /// A plan that builds `T` from heterogeneous constructor-scoped parts.
    pub(crate) fn assemble<F>(args: Vec<ArgSpec>, finish: F) -> Self
    where
        F: FnOnce(Vec<RealizedArg>) -> Result<T> + 'static,
    {
        let build: BuildFn = Box::new(move |_frame: &mut Frame, realized: Vec<RealizedArg>| {
            Ok(Box::new(finish(realized)?) as Box<dyn Any>)
        });
        Self::from_parts(args, FieldSpec::of::<T>(), build)
    }

    /// A plan that converts this plan's result.
    pub(crate) fn map<U: 'static>(self, f: fn(T) -> U) -> ConstructionPlan<U> {
        let args = vec![ArgSpec::nested(StorageDuration::Constructor, self)];
        let build: BuildFn = Box::new(move |_frame: &mut Frame, realized: Vec<RealizedArg>| {
            let mut realized = realized.into_iter();
            let value = next_arg(&mut realized, 0, 1)?.into_value::<T>()?;
            Ok(Box::new(f(value)) as Box<dyn Any>)
        });
        ConstructionPlan::from_parts(args, FieldSpec::of::<U>(), build)
    }
}

impl<T: Construct> ConstructionPlan<T> {
    /// Read `T`'s constructor arguments, left to right.
    pub fn from_wire(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Self> {
        let args = <T::Args as CtorArgs>::unmarshal(cx, buf)?;
        let build: BuildFn = Box::new(|frame: &mut Frame, realized: Vec<RealizedArg>| {
            let realized = <T::Args as CtorArgs>::realize(realized, frame)?;
            Ok(Box::new(T::construct(realized)) as Box<dyn Any>)
        });
        Ok(Self::from_parts(
            args,
            FieldSpec::of::<T>().with_min_align(T::HOLDER_ALIGN),
            build,
        ))
    }
}

impl<T> std::fmt::Debug for ConstructionPlan<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstructionPlan")
            .field("target", &self.erased.target)
            .field("field", &self.erased.field)
            .field("args", &self.erased.args)
            .finish()
    }
}

/// Implement the wire traits for [`Construct`] types: marshal the
/// constructor arguments, unmarshal into a [`ConstructionPlan`].
#[macro_export]
macro_rules! construct_wire {
    ($($t:ty),+ $(,)?) => {$(
        impl $crate::Wire for $t {
            const ALIGN: usize = <$t as $crate::Construct>::HOLDER_ALIGN;
            const NAME: &'static str = stringify!($t);
            const CATEGORY: $crate::ArgCategory = $crate::ArgCategory::UserAggregate;
        }

        impl $crate::Marshal for $t {
            fn marshal(
                &self,
                cx: &$crate::MarshalCx<'_>,
                buf: &mut $crate::Buffer,
            ) -> $crate::Result<()> {
                <<$t as $crate::Construct>::Args as $crate::CtorArgs>::marshal(
                    $crate::Construct::arguments(self),
                    cx,
                    buf,
                )
            }
        }

        impl $crate::Unmarshal for $t {
            fn unmarshal(
                cx: &$crate::UnmarshalCx<'_>,
                buf: &mut $crate::Buffer,
            ) -> $crate::Result<$crate::Unmarshalled<Self>> {
                Ok($crate::Unmarshalled::Deferred(
                    $crate::ConstructionPlan::<$t>::from_wire(cx, buf)?,
                ))
            }

            fn restore_in_place(
                target: &mut Self,
                cx: &$crate::UnmarshalCx<'_>,
                buf: &mut $crate::Buffer,
                frame: &mut $crate::Frame,
            ) -> $crate::Result<()> {
                $crate::construct::restore_aggregate(target, cx, buf, Some(frame))
            }

            fn restore(
                target: &mut Self,
                cx: &$crate::UnmarshalCx<'_>,
                buf: &mut $crate::Buffer,
                frame: ::std::option::Option<&mut $crate::Frame>,
            ) -> $crate::Result<()> {
                buf.realign(<$t as $crate::Wire>::ALIGN)?;
                $crate::construct::restore_aggregate(target, cx, buf, frame)
            }
        }
    )+};
}
