//! Alignment algebra shared by every component that places bytes.
//!
//! The buffer, the frame arena and the call applier all derive their offsets
//! from [`next_field_offset`]. The compile-time path ([`layout_fields`], usable
//! in `const` items) and the runtime path ([`DynLayout`], [`crate::Buffer`])
//! are the same function evaluated in two contexts, so a layout computed
//! ahead of time always matches the offsets a buffer reaches while writing.
//!
//! # Example
//!
//! ```
//! use rankcall::layout::{layout_fields, FieldSpec};
//!
//! const PAIR: rankcall::layout::FieldLayout<2> =
//!     layout_fields(0, [FieldSpec::of::<u8>(), FieldSpec::of::<u64>()]);
//!
//! assert_eq!(PAIR.offsets, [0, 8]);
//! assert_eq!(PAIR.size, 16);
//! ```

use crate::error::{Error, Result};

/// Largest alignment the wire buffer and the frame arena can honour.
///
/// Buffer blocks are allocated on this boundary, so a cursor that is a
/// multiple of any legal alignment is also a correctly aligned address.
pub const MAX_ALIGN: usize = 128;

/// Bytes needed to move `offset` up to the next multiple of `alignment`.
///
/// An alignment of zero needs no padding, like an alignment of one.
#[inline]
pub const fn padding(offset: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return 0;
    }
    (alignment - offset % alignment) % alignment
}

/// Round `offset` up to a multiple of `alignment`.
#[inline]
pub const fn align_to(offset: usize, alignment: usize) -> usize {
    offset + padding(offset, alignment)
}

/// Returns `true` when `alignment` is a legal wire/arena alignment.
#[inline]
pub const fn is_valid_alignment(alignment: usize) -> bool {
    alignment.is_power_of_two() && alignment <= MAX_ALIGN
}

/// Validate an alignment, reporting the offending value.
pub fn check_alignment(alignment: usize) -> Result<usize> {
    if is_valid_alignment(alignment) {
        Ok(alignment)
    } else {
        Err(Error::InvalidAlignment {
            alignment,
            max: MAX_ALIGN,
        })
    }
}

/// Size and alignment of one field in a composed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    pub size: usize,
    pub align: usize,
}

impl FieldSpec {
    /// A field of `size` bytes at `align`.
    ///
    /// Layouts place an alignment of zero like one; the frame arena rejects it
    /// with [`Error::InvalidAlignment`].
    pub const fn new(size: usize, align: usize) -> Self {
        Self { size, align }
    }

    /// The natural size and alignment of `T`.
    pub const fn of<T>() -> Self {
        Self {
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    /// Raise the alignment to at least `align`, never lowering it.
    pub const fn with_min_align(self, align: usize) -> Self {
        Self {
            size: self.size,
            align: if align > self.align { align } else { self.align },
        }
    }
}

/// Offset at which a field starts when the previous field ended at `cursor`.
///
/// This is the single alignment step every placement in the crate goes
/// through.
#[inline]
pub const fn next_field_offset(cursor: usize, field: FieldSpec) -> usize {
    align_to(cursor, field.align)
}

/// Layout of a fixed number of fields, computable at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout<const N: usize> {
    /// Start offset of every field.
    pub offsets: [usize; N],
    /// First byte after the last field, before trailing padding.
    pub end: usize,
    /// Total size including trailing padding to `align`.
    pub size: usize,
    /// Alignment of the aggregate (max of the field alignments).
    pub align: usize,
}

/// Lay out `fields` in order starting at `start`.
///
/// `start` lets a layout begin after a fixed header, for example when the
/// first bytes of a holder are taken by the constructed value itself.
#[allow(clippy::indexing_slicing)]
pub const fn layout_fields<const N: usize>(start: usize, fields: [FieldSpec; N]) -> FieldLayout<N> {
    let mut offsets = [0usize; N];
    let mut cursor = start;
    let mut align = 1;
    let mut i = 0;
    while i < N {
        let field = fields[i];
        let offset = next_field_offset(cursor, field);
        offsets[i] = offset;
        cursor = offset + field.size;
        if field.align > align {
            align = field.align;
        }
        i += 1;
    }
    FieldLayout {
        offsets,
        end: cursor,
        size: align_to(cursor, align),
        align,
    }
}

/// Layout of a field list whose length is only known at run time.
///
/// Produced by the same [`next_field_offset`] step as [`layout_fields`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DynLayout {
    pub offsets: Vec<usize>,
    pub end: usize,
    pub size: usize,
    pub align: usize,
}

impl DynLayout {
    pub fn compute(start: usize, fields: &[FieldSpec]) -> Self {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut cursor = start;
        let mut align = 1;
        for field in fields {
            let offset = next_field_offset(cursor, *field);
            offsets.push(offset);
            cursor = offset + field.size;
            align = align.max(field.align);
        }
        Self {
            offsets,
            end: cursor,
            size: align_to(cursor, align),
            align,
        }
    }

    /// Offset of field `index`, if it exists.
    pub fn offset(&self, index: usize) -> Option<usize> {
        self.offsets.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_matches_definition() {
        assert_eq!(padding(0, 8), 0);
        assert_eq!(padding(1, 8), 7);
        assert_eq!(padding(8, 8), 0);
        assert_eq!(padding(9, 4), 3);
        assert_eq!(padding(130, 128), 126);
        assert_eq!(align_to(33, 32), 64);
    }

    #[test]
    fn heterogeneous_fields_pack_without_waste() {
        const L: FieldLayout<4> = layout_fields(
            0,
            [
                FieldSpec::of::<u8>(),
                FieldSpec::of::<u16>(),
                FieldSpec::of::<u32>(),
                FieldSpec::of::<f64>(),
            ],
        );
        assert_eq!(L.offsets, [0, 2, 4, 8]);
        assert_eq!(L.end, 16);
        assert_eq!(L.size, 16);
        assert_eq!(L.align, 8);
    }

    #[test]
    fn trailing_padding_uses_aggregate_alignment() {
        let l = layout_fields(0, [FieldSpec::of::<u64>(), FieldSpec::of::<u8>()]);
        assert_eq!(l.end, 9);
        assert_eq!(l.size, 16);
    }

    #[test]
    fn start_offset_acts_as_header() {
        let l = layout_fields(3, [FieldSpec::new(4, 4), FieldSpec::new(1, 1)]);
        assert_eq!(l.offsets, [4, 8]);
    }

    #[test]
    fn runtime_and_const_layouts_agree() {
        let fields = [
            FieldSpec::new(1, 1),
            FieldSpec::new(8, 32),
            FieldSpec::new(3, 1),
            FieldSpec::new(16, 128),
            FieldSpec::new(4, 4),
        ];
        let fixed = layout_fields(5, fields);
        let dynamic = DynLayout::compute(5, &fields);
        assert_eq!(dynamic.offsets, fixed.offsets.to_vec());
        assert_eq!(dynamic.end, fixed.end);
        assert_eq!(dynamic.size, fixed.size);
        assert_eq!(dynamic.align, fixed.align);
    }

    #[test]
    fn min_align_never_lowers() {
        let f = FieldSpec::of::<u64>().with_min_align(4);
        assert_eq!(f.align, 8);
        let f = FieldSpec::of::<u8>().with_min_align(64);
        assert_eq!(f.align, 64);
    }

    #[test]
    fn zero_alignment_places_like_one() {
        assert_eq!(padding(5, 0), 0);
        let fields = [FieldSpec::new(3, 0), FieldSpec::new(4, 4)];
        let dynamic = DynLayout::compute(0, &fields);
        assert_eq!(dynamic.offsets, vec![0, 4]);
        assert_eq!(dynamic, DynLayout::compute(0, &[FieldSpec::new(3, 1), FieldSpec::new(4, 4)]));
        assert_eq!(layout_fields(0, fields).offsets, [0, 4]);
    }

    #[test]
    fn alignment_validation() {
        assert!(check_alignment(1).is_ok());
        assert!(check_alignment(128).is_ok());
        assert!(check_alignment(0).is_err());
        assert!(check_alignment(12).is_err());
        assert!(check_alignment(256).is_err());
    }
}
