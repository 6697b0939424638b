//! Type-directed argument marshalling for remote procedure calls between
//! process ranks.
//!
//! A function is registered once under a stable name with a declared
//! parameter list. Callers marshal an argument tuple into an aligned
//! [`Buffer`]; the callee unmarshals it into a [`Frame`], applies the
//! function, and replies with the return value and every argument whose
//! final value travels back.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use rankcall::prelude::*;
//!
//! let mut builder = Registry::builder();
//! let scale = builder.function::<(f64, Mut<f64>), f64, _>("scale", |args| {
//!     let factor = *args.get::<f64>(0)?;
//!     let value = args.get_mut::<f64>(1)?;
//!     *value *= factor;
//!     Ok(*value)
//! })?;
//! let registry = Arc::new(builder.build());
//!
//! let mut value = 1.5;
//! let out = rankcall::apply::call_local(&registry, &scale, (2.0, &mut value))?;
//! assert_eq!((out, value), (3.0, 3.0));
//! # Ok::<(), rankcall::Error>(())
//! ```
//!
//! # Modules
//!
//! - [`layout`] - Alignment arithmetic and field layouts
//! - [`buffer`] - Aligned byte buffer with separate write length and read cursor
//! - [`wire`] - How each type is written and read
//! - [`construct`] - Construction plans and the frames values are realized into
//! - [`classify`] - Parameter categories and caller-side argument conversion
//! - [`apply`] - Applying a registered function to marshalled arguments
//! - [`registry`] - Stable identifiers for functions, types and objects
//! - [`dispatch`] - Messages between ranks, object tables, in-process transport
//!
//! # Feature Flags
//!
//! - `logging` - Enable library-level tracing (consumers provide their own subscriber)
//! - `demo` - Build the `rankcall-loopback` binary
//! - `full` - Enable all features

pub mod alloc;
pub mod apply;
pub mod buffer;
pub mod classify;
pub mod config;
pub mod construct;
pub mod dispatch;
pub mod layout;
mod logging;
pub mod prelude;
pub mod registry;
#[cfg(feature = "demo")]
pub mod telemetry;
pub mod wire;

mod error;

pub use error::{Error, Result};

pub use alloc::{Allocator, CountingAllocator, SystemAllocator, TrackedVec};
pub use apply::{Args, Signature};
pub use buffer::Buffer;
pub use classify::{
    ArgCategory, Argument, Arguments, Array, ArrayMut, Mut, Owned, Param, ParamList, PassBack,
    Ptr, Received, Ref, Slice, SliceMut, Val,
};
pub use config::{Config, ConfigError};
pub use construct::{
    Bound, BoundMut, Construct, ConstructionPlan, CtorArg, CtorArgs, Frame, Held, Slot,
    StorageDuration, Temp,
};
pub use dispatch::{LocalEndpoint, LocalWorld, Node, Tag, Transport};
pub use layout::MAX_ALIGN;
pub use registry::{FnHandle, MethodHandle, ObjectRef, Registry, RegistryBuilder, TypeKey};
pub use wire::{
    Marshal, MarshalCx, Overaligned, Polymorphic, PtrWrapper, Unmarshal, UnmarshalCx,
    Unmarshalled, Wire,
};
