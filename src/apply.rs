//! Applying a registered function to a marshalled argument list.
//!
//! The callee reserves one frame region laid out like the parameter list,
//! unmarshals the arguments into it left to right, runs the body, then
//! writes the return value followed by every passed-back argument in
//! declaration order. The frame is destroyed last, so call-scoped
//! constructor arguments outlive the values that refer to them.

use std::any::type_name;

use crate::buffer::Buffer;
use crate::classify::{ArgCategory, Arguments, ParamDesc, ParamList};
use crate::construct::{Frame, Slot};
use crate::error::{Error, Result};
use crate::layout::{DynLayout, FieldSpec};
use crate::logging::{debug, trace};
use crate::registry::{FnHandle, Registry};
use crate::wire::{Marshal, MarshalCx, Unmarshal, UnmarshalCx};

/// Parameter descriptions and return type of a registered function.
#[derive(Debug, Clone)]
pub struct Signature {
    name: &'static str,
    params: Vec<ParamDesc>,
    returns: &'static str,
}

impl Signature {
    pub fn of<P: ParamList, R>(name: &'static str) -> Self {
        Self {
            name,
            params: P::describe(),
            returns: type_name::<R>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &[ParamDesc] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn returns(&self) -> &'static str {
        self.returns
    }

    fn fields(&self) -> Vec<FieldSpec> {
        self.params.iter().map(|p| p.storage).collect()
    }

    /// Offsets of each parameter within the callee's parameter block.
    pub fn layout(&self) -> DynLayout {
        DynLayout::compute(0, &self.fields())
    }
}

/// The unmarshalled arguments of one call, as seen by the function body.
pub struct Args<'f> {
    frame: &'f mut Frame,
    slots: &'f [usize],
    params: &'f [ParamDesc],
}

impl<'f> Args<'f> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Category argument `index` was declared with.
    pub fn category(&self, index: usize) -> Option<ArgCategory> {
        self.params.get(index).map(|p| p.category)
    }

    /// Typed frame slot of argument `index`.
    pub fn slot<T: 'static>(&self, index: usize) -> Result<Slot<T>> {
        let arity = self.slots.len();
        let (entry, param) = self
            .slots
            .get(index)
            .zip(self.params.get(index))
            .ok_or(Error::ArgumentIndex { index, arity })?;
        self.frame
            .typed_slot::<T>(*entry)
            .map_err(|err| match err {
                Error::SlotType { .. } => Error::ArgumentType {
                    index,
                    expected: type_name::<T>(),
                    found: param.storage_name,
                },
                other => other,
            })
    }

    pub fn get<T: 'static>(&self, index: usize) -> Result<&T> {
        let slot = self.slot::<T>(index)?;
        self.frame.get(slot)
    }

    pub fn get_mut<T: 'static>(&mut self, index: usize) -> Result<&mut T> {
        let slot = self.slot::<T>(index)?;
        self.frame.get_mut(slot)
    }

    /// Move argument `index` out of the frame.
    ///
    /// A passed-back argument that was taken makes the reply fail with
    /// [`Error::SlotVacant`].
    pub fn take<T: 'static>(&mut self, index: usize) -> Result<T> {
        let slot = self.slot::<T>(index)?;
        self.frame.take(slot)
    }

    /// The call's frame, where constructor-held arguments live.
    pub fn frame(&self) -> &Frame {
        self.frame
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        self.frame
    }
}

impl std::fmt::Debug for Args<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Args")
            .field("params", &self.params)
            .field("slots", &self.slots)
            .finish()
    }
}

/// Apply `body` to the arguments marshalled in `input`.
///
/// Returns the reply: `reply` as passed in (empty, or holding a header the
/// transport reads first), then the return value when `get_return` is set,
/// then the passed-back arguments.
pub fn apply<R, F>(
    signature: &Signature,
    input: &mut Buffer,
    cx: &UnmarshalCx<'_>,
    get_return: bool,
    reply: Buffer,
    body: F,
) -> Result<Buffer>
where
    R: Marshal,
    F: FnOnce(&mut Args<'_>) -> Result<R>,
{
    debug!(
        function = signature.name(),
        arity = signature.arity(),
        get_return,
        "applying call"
    );
    let mut frame = Frame::new();
    let reply = apply_in(signature, input, cx, get_return, reply, body, &mut frame);
    frame.clear();
    reply
}

fn apply_in<R, F>(
    signature: &Signature,
    input: &mut Buffer,
    cx: &UnmarshalCx<'_>,
    get_return: bool,
    mut reply: Buffer,
    body: F,
    frame: &mut Frame,
) -> Result<Buffer>
where
    R: Marshal,
    F: FnOnce(&mut Args<'_>) -> Result<R>,
{
    let reservations = frame.reserve(&signature.fields())?;
    let mut slots = Vec::with_capacity(signature.arity());
    for (param, at) in signature.params().iter().zip(reservations) {
        trace!(
            param = param.type_name,
            category = %param.category,
            offset = at.offset(),
            "unmarshalling argument"
        );
        slots.push((param.unmarshal)(cx, input, frame, at)?);
    }

    let value = {
        let mut args = Args {
            frame: &mut *frame,
            slots: &slots,
            params: signature.params(),
        };
        body(&mut args)?
    };

    if get_return {
        reply.push(&value, &MarshalCx::with_frame(frame))?;
    }
    for (param, index) in signature.params().iter().zip(&slots) {
        if (param.marshal_back)(frame, *index, &mut reply)? {
            trace!(param = param.type_name, "passed back");
        }
    }
    Ok(reply)
}

/// Marshal `args` for a call to a function with parameters `P`.
pub fn marshal_call<P, A>(args: &A, buf: &mut Buffer) -> Result<()>
where
    P: ParamList,
    A: Arguments<P>,
{
    args.marshal_all(buf)
}

/// Read a reply produced by [`apply`]: the return value, then passed-back arguments.
///
/// A returned aggregate is rebuilt through its constructor; it cannot keep
/// call-scoped constructor arguments, since no caller frame outlives the call.
pub fn read_reply<P, R, A>(
    args: &mut A,
    cx: &UnmarshalCx<'_>,
    reply: &mut Buffer,
    get_return: bool,
) -> Result<Option<R>>
where
    P: ParamList,
    R: Unmarshal,
    A: Arguments<P>,
{
    let value = if get_return {
        Some(reply.pop::<R>(cx)?.build_detached()?)
    } else {
        None
    };
    args.restore_all(cx, reply)?;
    Ok(value)
}

/// Call a registered function in this process, through the full
/// marshal, apply and pass-back path.
pub fn call_local<P, R, A>(registry: &Registry, handle: &FnHandle<P, R>, mut args: A) -> Result<R>
where
    P: ParamList,
    R: Unmarshal,
    A: Arguments<P>,
{
    let entry = registry.function(handle.key())?;
    let mut input = Buffer::new();
    args.marshal_all(&mut input)?;
    input.rewind();
    let cx = registry.unmarshal_cx();
    let mut reply = entry.invoke(&mut input, &cx, true, Buffer::new())?;
    reply.rewind();
    read_reply::<P, R, A>(&mut args, &cx, &mut reply, true)?
        .ok_or_else(|| Error::transport("reply carried no return value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Mut, Slice};

    fn registry() -> (Registry, FnHandle<(i32, Mut<f64>), f64>) {
        let mut builder = Registry::builder();
        let scale = builder
            .function::<(i32, Mut<f64>), f64, _>("scale", |args| {
                let factor = f64::from(*args.get::<i32>(0)?);
                let value = args.get_mut::<f64>(1)?;
                *value *= factor;
                Ok(*value + 1.0)
            })
            .unwrap();
        (builder.build(), scale)
    }

    #[test]
    fn reply_carries_return_then_pass_back() {
        let (registry, scale) = registry();
        let mut value = 2.5;
        let out = call_local(&registry, &scale, (3, &mut value)).unwrap();
        assert_eq!(value, 7.5);
        assert_eq!(out, 8.5);
    }

    #[test]
    fn accessing_with_wrong_type_reports_argument() {
        let mut builder = Registry::builder();
        let wrong = builder
            .function::<(i32,), i32, _>("wrong", |args| {
                let value = args.get::<i64>(0)?;
                Ok(i32::try_from(*value).unwrap_or_default())
            })
            .unwrap();
        let registry = builder.build();
        let err = call_local(&registry, &wrong, (1,)).unwrap_err();
        assert!(matches!(err, Error::ArgumentType { index: 0, .. }), "{err}");
    }

    #[test]
    fn out_of_range_index() {
        let mut builder = Registry::builder();
        let probe = builder
            .function::<(), i32, _>("probe", |args| Ok(*args.get::<i32>(0)?))
            .unwrap();
        let registry = builder.build();
        let err = call_local(&registry, &probe, ()).unwrap_err();
        assert!(matches!(err, Error::ArgumentIndex { index: 0, arity: 0 }));
    }

    #[test]
    fn slices_are_copied_into_the_frame() {
        let mut builder = Registry::builder();
        let total = builder
            .function::<(Slice<u32>,), u64, _>("total", |args| {
                Ok(args.get::<Vec<u32>>(0)?.iter().map(|&v| u64::from(v)).sum())
            })
            .unwrap();
        let registry = builder.build();
        let values = [1u32, 2, 3, 4];
        assert_eq!(call_local(&registry, &total, (&values[..],)).unwrap(), 10);
    }

    #[test]
    fn layout_follows_storage_alignment() {
        let sig = Signature::of::<(u8, f64, u16), ()>("mixed");
        let layout = sig.layout();
        assert_eq!(layout.offset(0), Some(0));
        assert_eq!(layout.offset(1), Some(8));
        assert_eq!(layout.offset(2), Some(16));
    }
}
