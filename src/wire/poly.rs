//! Polymorphic values: a type key followed by the fields of the dynamic type.

use std::any::Any;

use super::{Marshal, MarshalCx, Unmarshal, UnmarshalCx, Unmarshalled, Wire};
use crate::buffer::Buffer;
use crate::classify::ArgCategory;
use crate::error::Result;
use crate::registry::TypeKey;

/// A value sent behind a base-class handle.
///
/// The receiving side rebuilds the dynamic type through the factory
/// registered with [`crate::RegistryBuilder::polymorphic`] under
/// [`Polymorphic::type_key`]. Implement it with [`polymorphic!`](crate::polymorphic).
pub trait Polymorphic: Any {
    /// Stable key of the dynamic type, equal to `TypeKey::of::<Self>()`.
    fn type_key(&self) -> TypeKey;

    /// Write the fields of the dynamic type.
    fn marshal_fields(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn Polymorphic {
    /// Borrow the value as its dynamic type, if it is a `T`.
    pub fn downcast_ref<T: Polymorphic>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Polymorphic>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

impl std::fmt::Debug for dyn Polymorphic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Polymorphic")
            .field("type_key", &self.type_key())
            .finish_non_exhaustive()
    }
}

// [type key: u64][fields]; inside a pointer wrapper the key is in the header.

impl Wire for Box<dyn Polymorphic> {
    const ALIGN: usize = 8;
    const NAME: &'static str = "dyn Polymorphic";
    const CATEGORY: ArgCategory = ArgCategory::UserAggregate;
    const POLYMORPHIC: bool = true;
}

impl Marshal for Box<dyn Polymorphic> {
    fn marshal(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        buf.append_pod(&self.type_key().get(), 8)?;
        self.marshal_fields(cx, buf)
    }

    fn dynamic_key(&self) -> Option<TypeKey> {
        Some(self.type_key())
    }

    fn marshal_untagged(&self, cx: &MarshalCx<'_>, buf: &mut Buffer) -> Result<()> {
        self.marshal_fields(cx, buf)
    }
}

impl Unmarshal for Box<dyn Polymorphic> {
    fn unmarshal(cx: &UnmarshalCx<'_>, buf: &mut Buffer) -> Result<Unmarshalled<Self>> {
        let key = TypeKey::from_raw(buf.read_pod::<u64>(8)?);
        Self::unmarshal_tagged(cx, buf, key)
    }

    fn unmarshal_tagged(
        cx: &UnmarshalCx<'_>,
        buf: &mut Buffer,
        key: TypeKey,
    ) -> Result<Unmarshalled<Self>> {
        let factory = cx.registry().polymorphic_factory(key)?;
        factory(cx, buf)
    }
}

/// Implement [`Polymorphic`] for types that already implement the wire
/// traits, keyed by their [`Wire::NAME`].
#[macro_export]
macro_rules! polymorphic {
    ($($t:ty),+ $(,)?) => {$(
        impl $crate::Polymorphic for $t {
            fn type_key(&self) -> $crate::TypeKey {
                $crate::TypeKey::of::<$t>()
            }

            fn marshal_fields(
                &self,
                cx: &$crate::MarshalCx<'_>,
                buf: &mut $crate::Buffer,
            ) -> $crate::Result<()> {
                buf.push(self, cx)
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }
    )+};
}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};

    use super::*;
    use crate::error::Error;
    use crate::registry::Registry;

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Circle {
        radius: f64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Square {
        side: u32,
    }

    crate::pod_wire!(Circle, Square);
    crate::polymorphic!(Circle, Square);

    #[test]
    fn dynamic_type_survives_roundtrip() {
        let mut builder = Registry::builder();
        builder.polymorphic::<Circle>().unwrap();
        builder.polymorphic::<Square>().unwrap();
        let registry = builder.build();

        let shapes: Vec<Box<dyn Polymorphic>> =
            vec![Box::new(Circle { radius: 2.0 }), Box::new(Square { side: 3 })];
        let mut buf = Buffer::new();
        buf.push(&shapes, &MarshalCx::detached()).unwrap();
        buf.rewind();
        let out = buf
            .pop_ready::<Vec<Box<dyn Polymorphic>>>(&registry.unmarshal_cx())
            .unwrap();
        assert_eq!(out[0].downcast_ref::<Circle>(), Some(&Circle { radius: 2.0 }));
        assert_eq!(out[1].downcast_ref::<Square>(), Some(&Square { side: 3 }));
    }

    #[test]
    fn unregistered_dynamic_type_rejected() {
        let registry = Registry::builder().build();
        let shape: Box<dyn Polymorphic> = Box::new(Circle { radius: 1.0 });
        let mut buf = Buffer::new();
        buf.push(&shape, &MarshalCx::detached()).unwrap();
        buf.rewind();
        let err = buf
            .pop::<Box<dyn Polymorphic>>(&registry.unmarshal_cx())
            .unwrap_err();
        assert!(matches!(err, Error::UnregisteredType(_)));
    }
}
