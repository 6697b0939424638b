//! Frame arena: aligned storage for the values a call constructs.
//!
//! A frame owns regions laid out with [`DynLayout`] and an ordered list of
//! the values placed in them. Values are destroyed in reverse order of
//! placement when the frame is cleared or dropped, so an aggregate is always
//! destroyed before the call-scoped arguments it was built from.

use std::alloc::{self, Layout};
use std::any::{Any, TypeId, type_name};
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::{ArgSpec, ArgValue, ConstructionPlan, Construct, CtorArgs, ErasedPlan, RealizedArg, StorageDuration};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::layout::{DynLayout, FieldSpec, MAX_ALIGN, check_alignment};
use crate::logging::trace;
use crate::wire::{Unmarshal, UnmarshalCx};

struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
    occupied: Vec<bool>,
}

struct Entry {
    ptr: NonNull<u8>,
    type_id: TypeId,
    type_name: &'static str,
    drop_fn: Option<unsafe fn(*mut u8)>,
    live: bool,
    retained: Vec<usize>,
}

/// # Safety
///
/// `ptr` must point to a live, initialized `T`.
unsafe fn drop_value<T>(ptr: *mut u8) {
    // SAFETY: guaranteed by the caller.
    unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) }
}

/// A position reserved in a frame region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    region: usize,
    field_index: usize,
    offset: usize,
    field: FieldSpec,
}

impl Reservation {
    /// Offset from the start of the region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn field(&self) -> FieldSpec {
        self.field
    }
}

/// Typed handle to a value stored in a [`Frame`].
pub struct Slot<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    fn new(index: usize) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    /// Position of the value in its frame's placement order.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Slot<T> {}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slot<{}>({})", type_name::<T>(), self.index)
    }
}

/// Arena holding constructed values and their call-scoped arguments.
///
/// ```
/// use rankcall::Frame;
///
/// let mut frame = Frame::new();
/// let a = frame.emplace(1.5f64)?;
/// let b = frame.emplace(String::from("held"))?;
/// *frame.get_mut(a)? += 1.0;
/// assert_eq!(*frame.get(a)?, 2.5);
/// assert_eq!(frame.take(b)?, "held");
/// assert!(frame.get(b).is_err());
/// # Ok::<(), rankcall::Error>(())
/// ```
#[derive(Default)]
pub struct Frame {
    regions: Vec<Region>,
    entries: Vec<Entry>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("regions", &self.regions.len())
            .field("live", &self.len())
            .finish()
    }
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.live).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate one region holding `fields` laid out in order.
    ///
    /// The region is aligned to the largest field alignment, so every
    /// reservation's address honours its field's alignment.
    pub fn reserve(&mut self, fields: &[FieldSpec]) -> Result<Vec<Reservation>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        for field in fields {
            check_alignment(field.align)?;
        }
        let layout = DynLayout::compute(0, fields);
        let region_layout = Layout::from_size_align(layout.size.max(1), layout.align).map_err(
            |_| Error::InvalidAlignment {
                alignment: layout.align,
                max: MAX_ALIGN,
            },
        )?;
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc::alloc(region_layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(region_layout));
        let region = self.regions.len();
        self.regions.push(Region {
            ptr,
            layout: region_layout,
            occupied: vec![false; fields.len()],
        });
        trace!(region, size = layout.size, align = layout.align, "reserved frame region");
        Ok(layout
            .offsets
            .iter()
            .zip(fields)
            .enumerate()
            .map(|(field_index, (offset, field))| Reservation {
                region,
                field_index,
                offset: *offset,
                field: *field,
            })
            .collect())
    }

    /// Move `value` into a reserved position.
    pub fn emplace_at<T: 'static>(&mut self, at: Reservation, value: T) -> Result<Slot<T>> {
        let size = std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>();
        let mismatch = Error::LayoutMismatch {
            type_name: type_name::<T>(),
            size,
            align,
            slot_size: at.field.size,
            slot_align: at.field.align,
        };
        if size > at.field.size || align > at.field.align {
            return Err(mismatch);
        }
        let region = self.regions.get_mut(at.region).ok_or(mismatch)?;
        let occupied = region
            .occupied
            .get_mut(at.field_index)
            .ok_or(Error::SlotOccupied(at.offset))?;
        if *occupied || at.offset + size > region.layout.size() {
            return Err(Error::SlotOccupied(at.offset));
        }
        *occupied = true;
        // SAFETY: `offset + size` is inside the region, and the offset is a
        // multiple of the field alignment within a region aligned to at least
        // that much, so the pointer is valid and aligned for `T`.
        let ptr = unsafe {
            let ptr = region.ptr.add(at.offset);
            ptr.cast::<T>().write(value);
            ptr
        };
        let index = self.entries.len();
        self.entries.push(Entry {
            ptr,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            drop_fn: std::mem::needs_drop::<T>().then_some(drop_value::<T> as unsafe fn(*mut u8)),
            live: true,
            retained: Vec::new(),
        });
        Ok(Slot::new(index))
    }

    /// Place `value` in a region of its own.
    pub fn emplace<T: 'static>(&mut self, value: T) -> Result<Slot<T>> {
        let at = self.reserve_one(FieldSpec::of::<T>())?;
        self.emplace_at(at, value)
    }

    fn reserve_one(&mut self, field: FieldSpec) -> Result<Reservation> {
        self.reserve(&[field])?
            .into_iter()
            .next()
            .ok_or(Error::SlotOccupied(0))
    }

    fn entry(&self, index: usize) -> Result<&Entry> {
        self.entries
            .get(index)
            .filter(|e| e.live)
            .ok_or(Error::SlotVacant(index))
    }

    fn check_type<T: 'static>(entry: &Entry) -> Result<()> {
        if entry.type_id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(Error::SlotType {
                expected: type_name::<T>(),
                found: entry.type_name,
            })
        }
    }

    /// A typed handle for the value at `index`, checking its type.
    pub fn typed_slot<T: 'static>(&self, index: usize) -> Result<Slot<T>> {
        Self::check_type::<T>(self.entry(index)?)?;
        Ok(Slot::new(index))
    }

    /// Type name of the live value at `index`.
    pub fn type_name_at(&self, index: usize) -> Option<&'static str> {
        self.entry(index).ok().map(|e| e.type_name)
    }

    pub fn get<T: 'static>(&self, slot: Slot<T>) -> Result<&T> {
        let entry = self.entry(slot.index)?;
        Self::check_type::<T>(entry)?;
        // SAFETY: the entry is live and holds a `T` (checked above).
        Ok(unsafe { entry.ptr.cast::<T>().as_ref() })
    }

    pub fn get_mut<T: 'static>(&mut self, slot: Slot<T>) -> Result<&mut T> {
        let entry = self.entry(slot.index)?;
        Self::check_type::<T>(entry)?;
        let mut ptr = entry.ptr.cast::<T>();
        // SAFETY: the entry is live and holds a `T`; `&mut self` guarantees
        // exclusive access.
        Ok(unsafe { ptr.as_mut() })
    }

    /// Move the value out. The slot stays vacant until [`Frame::refill`].
    pub fn take<T: 'static>(&mut self, slot: Slot<T>) -> Result<T> {
        let entry = self
            .entries
            .get_mut(slot.index)
            .filter(|e| e.live)
            .ok_or(Error::SlotVacant(slot.index))?;
        Self::check_type::<T>(entry)?;
        entry.live = false;
        // SAFETY: the entry held a live `T`; marking it vacant first means it
        // is neither read nor dropped again.
        Ok(unsafe { entry.ptr.cast::<T>().read() })
    }

    /// Put a value back into a slot emptied by [`Frame::take`].
    pub fn refill<T: 'static>(&mut self, slot: Slot<T>, value: T) -> Result<()> {
        let entry = self
            .entries
            .get_mut(slot.index)
            .ok_or(Error::SlotVacant(slot.index))?;
        Self::check_type::<T>(entry)?;
        if entry.live {
            return Err(Error::SlotOccupied(slot.index));
        }
        // SAFETY: the position was laid out for a `T` and holds no live value.
        unsafe { entry.ptr.cast::<T>().write(value) };
        entry.live = true;
        Ok(())
    }

    /// Indices of the call-scoped arguments a realized value was built from,
    /// in declaration order.
    pub fn retained(&self, index: usize) -> Result<&[usize]> {
        Ok(&self.entry(index)?.retained)
    }

    /// Typed handle to the `position`-th call-scoped argument of `owner`.
    pub fn retained_slot<O, T: 'static>(&self, owner: Slot<O>, position: usize) -> Result<Slot<T>> {
        let retained = self.retained(owner.index)?;
        let index = retained.get(position).copied().ok_or(Error::ArgumentIndex {
            index: position,
            arity: retained.len(),
        })?;
        self.typed_slot(index)
    }

    /// Destroy every live value in reverse placement order and release all regions.
    pub fn clear(&mut self) {
        for entry in self.entries.drain(..).rev() {
            if let (true, Some(drop_fn)) = (entry.live, entry.drop_fn) {
                // SAFETY: the entry is live and `drop_fn` matches its type.
                unsafe { drop_fn(entry.ptr.as_ptr()) };
            }
        }
        for region in self.regions.drain(..) {
            // SAFETY: allocated in `reserve` with this layout.
            unsafe { alloc::dealloc(region.ptr.as_ptr(), region.layout) };
        }
    }

    /// Build `T` from constructor arguments supplied by value. Call-scoped
    /// arguments are placed in this frame first.
    pub fn construct<T: Construct>(
        &mut self,
        args: <T::Args as CtorArgs>::Source,
    ) -> Result<Slot<T>> {
        let (realized, held) = <T::Args as CtorArgs>::place_sources(args, self)?;
        let slot = self.emplace(T::construct(realized))?;
        if let Some(entry) = self.entries.get_mut(slot.index) {
            entry.retained = held;
        }
        Ok(slot)
    }

    /// Run a construction plan, placing the result in this frame.
    pub fn realize<T: 'static>(&mut self, plan: ConstructionPlan<T>) -> Result<Slot<T>> {
        let index = self.realize_erased(plan.into_erased(), None)?;
        self.typed_slot(index)
    }

    pub(crate) fn realize_at<T: 'static>(
        &mut self,
        plan: ConstructionPlan<T>,
        at: Reservation,
    ) -> Result<Slot<T>> {
        let index = self.realize_erased(plan.into_erased(), Some(at))?;
        self.typed_slot(index)
    }

    /// Run a construction plan and return the value itself. Its call-scoped
    /// arguments stay in this frame.
    pub fn build<T: 'static>(&mut self, plan: ConstructionPlan<T>) -> Result<T> {
        let target = plan.target();
        self.build_erased(plan.into_erased())?
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| Error::SlotType {
                expected: type_name::<T>(),
                found: target,
            })
    }

    /// Realize a plan into one region sized for the value and its
    /// call-scoped arguments (or only the arguments when `at` is given).
    fn realize_erased(&mut self, plan: ErasedPlan, at: Option<Reservation>) -> Result<usize> {
        let ErasedPlan {
            target,
            field,
            args,
            build,
            place,
        } = plan;
        let mut fields = Vec::with_capacity(args.len() + 1);
        if at.is_none() {
            fields.push(field);
        }
        fields.extend(held_fields(&args));
        let mut reserved = self.reserve(&fields)?.into_iter();
        let position = match at {
            Some(at) => at,
            None => reserved.next().ok_or(Error::LayoutMismatch {
                type_name: target,
                size: field.size,
                align: field.align,
                slot_size: 0,
                slot_align: 0,
            })?,
        };
        let (realized, held) = self.realize_args(args, &mut reserved)?;
        let value = build(self, realized)?;
        let index = place(self, position, value)?;
        if let Some(entry) = self.entries.get_mut(index) {
            entry.retained = held;
        }
        trace!(target, index, "realized construction plan");
        Ok(index)
    }

    fn build_erased(&mut self, plan: ErasedPlan) -> Result<Box<dyn Any>> {
        let ErasedPlan { args, build, .. } = plan;
        let fields: Vec<FieldSpec> = held_fields(&args).collect();
        let mut reserved = self.reserve(&fields)?.into_iter();
        let (realized, _) = self.realize_args(args, &mut reserved)?;
        build(self, realized)
    }

    /// Realize arguments left to right. Nested plans complete before the
    /// argument that contains them is handed on.
    fn realize_args(
        &mut self,
        args: Vec<ArgSpec>,
        reserved: &mut impl Iterator<Item = Reservation>,
    ) -> Result<(Vec<RealizedArg>, Vec<usize>)> {
        let mut realized = Vec::with_capacity(args.len());
        let mut held = Vec::new();
        for arg in args {
            match arg.duration {
                StorageDuration::Call => {
                    let at = reserved.next().ok_or(Error::LayoutMismatch {
                        type_name: "call-scoped argument",
                        size: arg.field.size,
                        align: arg.field.align,
                        slot_size: 0,
                        slot_align: 0,
                    })?;
                    let index = match arg.value {
                        ArgValue::Immediate(value) => (arg.place)(self, at, value)?,
                        ArgValue::Nested(plan) => self.realize_erased(plan, Some(at))?,
                    };
                    held.push(index);
                    realized.push(RealizedArg::Held(index));
                }
                StorageDuration::Constructor => {
                    let value = match arg.value {
                        ArgValue::Immediate(value) => value,
                        ArgValue::Nested(plan) => self.build_erased(plan)?,
                    };
                    realized.push(RealizedArg::Value(value));
                }
            }
        }
        Ok((realized, held))
    }

    /// Read-only view of a slot for marshalling.
    pub fn bind<T: 'static>(&self, slot: Slot<T>) -> Bound<'_, T> {
        Bound { frame: self, slot }
    }

    /// Mutable view of a slot; passed-back values are restored into it.
    pub fn bind_mut<T: 'static>(&mut self, slot: Slot<T>) -> BoundMut<'_, T> {
        BoundMut { frame: self, slot }
    }
}

fn held_fields(args: &[ArgSpec]) -> impl Iterator<Item = FieldSpec> + '_ {
    args.iter()
        .filter(|arg| arg.duration == StorageDuration::Call)
        .map(|arg| arg.field)
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A frame slot paired with its frame.
#[derive(Debug)]
pub struct Bound<'f, T> {
    frame: &'f Frame,
    slot: Slot<T>,
}

impl<'f, T: 'static> Bound<'f, T> {
    pub fn get(&self) -> Result<&'f T> {
        self.frame.get(self.slot)
    }

    pub fn frame(&self) -> &'f Frame {
        self.frame
    }

    pub fn slot(&self) -> Slot<T> {
        self.slot
    }
}

/// A frame slot paired with exclusive access to its frame.
#[derive(Debug)]
pub struct BoundMut<'f, T> {
    frame: &'f mut Frame,
    slot: Slot<T>,
}

impl<T: 'static> BoundMut<'_, T> {
    pub fn get(&self) -> Result<&T> {
        self.frame.get(self.slot)
    }

    pub fn get_mut(&mut self) -> Result<&mut T> {
        self.frame.get_mut(self.slot)
    }

    pub fn frame(&self) -> &Frame {
        self.frame
    }

    pub fn slot(&self) -> Slot<T> {
        self.slot
    }

    /// Overwrite the slot, and any call-scoped arguments it refers to, with
    /// passed-back values.
    pub(crate) fn restore(&mut self, cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<()>
    where
        T: Unmarshal,
    {
        let mut value = self.frame.take(self.slot)?;
        let result = T::restore(&mut value, cx, buf, Some(&mut *self.frame));
        self.frame.refill(self.slot, value)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    struct Noisy {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Drop for Noisy {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    #[test]
    fn values_drop_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let mut frame = Frame::new();
            for name in ["first", "second", "third"] {
                frame
                    .emplace(Noisy {
                        name,
                        log: log.clone(),
                    })
                    .unwrap();
            }
        }
        assert_eq!(*log.borrow(), vec!["third", "second", "first"]);
    }

    #[test]
    fn taken_values_are_not_dropped_twice() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut frame = Frame::new();
        let slot = frame
            .emplace(Noisy {
                name: "moved",
                log: log.clone(),
            })
            .unwrap();
        let value = frame.take(slot).unwrap();
        drop(frame);
        assert!(log.borrow().is_empty());
        drop(value);
        assert_eq!(*log.borrow(), vec!["moved"]);
    }

    #[test]
    fn reservations_honour_alignment() {
        let mut frame = Frame::new();
        let fields = [FieldSpec::new(1, 1), FieldSpec::new(8, 64), FieldSpec::new(4, 4)];
        let reserved = frame.reserve(&fields).unwrap();
        assert_eq!(
            reserved.iter().map(Reservation::offset).collect::<Vec<_>>(),
            vec![0, 64, 72]
        );
        let slot = frame.emplace_at(reserved[1], 7u64).unwrap();
        let addr = frame.get(slot).unwrap() as *const u64 as usize;
        assert_eq!(addr % 64, 0);
    }

    #[test]
    fn zero_alignment_is_rejected() {
        let mut frame = Frame::new();
        let err = frame.reserve(&[FieldSpec::new(4, 0)]).unwrap_err();
        assert!(matches!(err, Error::InvalidAlignment { alignment: 0, .. }));
    }

    #[test]
    fn wrong_type_and_double_fill_rejected() {
        let mut frame = Frame::new();
        let reserved = frame.reserve(&[FieldSpec::of::<u32>()]).unwrap();
        assert!(matches!(
            frame.emplace_at(reserved[0], 1u64).unwrap_err(),
            Error::LayoutMismatch { .. }
        ));
        let slot = frame.emplace_at(reserved[0], 1u32).unwrap();
        assert!(matches!(
            frame.emplace_at(reserved[0], 2u32).unwrap_err(),
            Error::SlotOccupied(_)
        ));
        assert!(matches!(
            frame.typed_slot::<i32>(slot.index()).unwrap_err(),
            Error::SlotType { .. }
        ));
    }

    #[test]
    fn refill_after_take() {
        let mut frame = Frame::new();
        let slot = frame.emplace(String::from("a")).unwrap();
        let mut value = frame.take(slot).unwrap();
        value.push('b');
        frame.refill(slot, value).unwrap();
        assert_eq!(frame.get(slot).unwrap(), "ab");
        assert!(frame.refill(slot, String::new()).is_err());
    }
}
