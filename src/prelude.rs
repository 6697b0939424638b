//! Convenient re-exports for common usage patterns.
//!
//! ```
//! use rankcall::prelude::*;
//!
//! let mut builder = Registry::builder();
//! let add = builder.function::<(i32, i32), i32, _>("add", |args| {
//!     Ok(args.get::<i32>(0)? + args.get::<i32>(1)?)
//! })?;
//! let registry = builder.build();
//! assert_eq!(rankcall::apply::call_local(&registry, &add, (2, 3))?, 5);
//! # Ok::<(), rankcall::Error>(())
//! ```

// Unified error handling
pub use crate::error::{Error, Result};

// Buffers and the wire traits
pub use crate::buffer::Buffer;
pub use crate::wire::{
    Marshal, MarshalCx, Overaligned, Polymorphic, PtrWrapper, Unmarshal, UnmarshalCx,
    Unmarshalled, Wire,
};

// Aggregates built through constructors
pub use crate::construct::{Bound, BoundMut, Construct, Frame, Held, Slot, Temp};

// Parameter declarations
pub use crate::classify::{Array, ArrayMut, Mut, Owned, Ptr, Received, Ref, Slice, SliceMut, Val};

// Registration and dispatch
pub use crate::apply::Args;
pub use crate::dispatch::{LocalWorld, Node};
pub use crate::registry::{FnHandle, MethodHandle, ObjectRef, Registry, TypeKey};

// Macros
pub use crate::{construct_wire, pod_wire, polymorphic};
