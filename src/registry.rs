//! Registered functions, member functions, polymorphic factories and object types.
//!
//! Every rank builds the same [`Registry`] at startup. Entries are keyed by
//! stable identifiers derived from their names, so a handle created on one
//! rank names the same entry on every other rank.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use xxhash_rust::const_xxh64::xxh64;

use crate::alloc::{Allocator, SystemAllocator};
use crate::apply::{Args, Signature, apply};
use crate::buffer::Buffer;
use crate::classify::ParamList;
use crate::construct::Frame;
use crate::dispatch::objects::ObjectCell;
use crate::error::{Error, Result};
use crate::logging::debug;
use crate::wire::{Marshal, Polymorphic, Unmarshal, UnmarshalCx, Unmarshalled, Wire};

const KEY_SEED: u64 = 0;

/// Stable identifier of a type, a function or a member function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(u64);

impl TypeKey {
    /// Hash a name into a key. Equal names give equal keys on every rank.
    pub const fn named(name: &str) -> Self {
        Self(xxh64(name.as_bytes(), KEY_SEED))
    }

    pub const fn of<T: Wire + ?Sized>() -> Self {
        Self::named(T::NAME)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Typed handle to a registered free function taking `P` and returning `R`.
pub struct FnHandle<P, R> {
    key: TypeKey,
    name: &'static str,
    _marker: PhantomData<fn(P) -> R>,
}

impl<P, R> FnHandle<P, R> {
    /// Handle for the function registered under `name`.
    pub const fn named(name: &'static str) -> Self {
        Self {
            key: TypeKey::named(name),
            name,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<P, R> Clone for FnHandle<P, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, R> Copy for FnHandle<P, R> {}

impl<P, R> fmt::Debug for FnHandle<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandle")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}

/// Typed handle to a member function of objects of type `T`.
pub struct MethodHandle<T, P, R> {
    key: TypeKey,
    name: &'static str,
    _marker: PhantomData<fn(&mut T, P) -> R>,
}

impl<T, P, R> MethodHandle<T, P, R> {
    pub const fn named(name: &'static str) -> Self {
        Self {
            key: TypeKey::named(name),
            name,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T, P, R> Clone for MethodHandle<T, P, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, P, R> Copy for MethodHandle<T, P, R> {}

impl<T, P, R> fmt::Debug for MethodHandle<T, P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandle")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}

/// Reference to an object stored on a remote rank.
pub struct ObjectRef<T> {
    rank: usize,
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectRef<T> {
    pub(crate) fn new(rank: usize, id: u64) -> Self {
        Self {
            rank,
            id,
            _marker: PhantomData,
        }
    }

    /// Rank whose object table holds the object.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ObjectRef<T> {}

impl<T> PartialEq for ObjectRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.id == other.id
    }
}

impl<T> Eq for ObjectRef<T> {}

impl<T> fmt::Debug for ObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({}@{})", self.id, self.rank)
    }
}

type Invoker = Box<
    dyn Fn(&mut Buffer, &UnmarshalCx<'_>, bool, Buffer, Option<&mut ObjectCell>) -> Result<Buffer>
        + Send
        + Sync,
>;

type PolyFactory =
    fn(&UnmarshalCx<'_>, &mut Buffer) -> Result<Unmarshalled<Box<dyn Polymorphic>>>;

type ObjectFactory = fn(&UnmarshalCx<'_>, &mut Buffer) -> Result<ObjectCell>;

/// A registered function or member function.
pub struct FunctionEntry {
    name: &'static str,
    receiver: Option<&'static str>,
    signature: Signature,
    invoker: Invoker,
}

impl FunctionEntry {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name of the receiver, for member functions.
    pub fn receiver(&self) -> Option<&'static str> {
        self.receiver
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Apply the function to the arguments in `input`, appending the reply to `reply`.
    pub fn invoke(
        &self,
        input: &mut Buffer,
        cx: &UnmarshalCx<'_>,
        get_return: bool,
        reply: Buffer,
    ) -> Result<Buffer> {
        (self.invoker)(input, cx, get_return, reply, None)
    }

    /// Apply the member function to `target` and the arguments in `input`.
    pub fn invoke_member(
        &self,
        input: &mut Buffer,
        cx: &UnmarshalCx<'_>,
        get_return: bool,
        reply: Buffer,
        target: &mut ObjectCell,
    ) -> Result<Buffer> {
        (self.invoker)(input, cx, get_return, reply, Some(target))
    }
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("receiver", &self.receiver)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

struct PolyEntry {
    name: &'static str,
    factory: PolyFactory,
}

struct ObjectEntry {
    name: &'static str,
    factory: ObjectFactory,
}

/// The immutable set of entries shared by every node of a process.
pub struct Registry {
    functions: HashMap<TypeKey, FunctionEntry>,
    polymorphic: HashMap<TypeKey, PolyEntry>,
    objects: HashMap<TypeKey, ObjectEntry>,
    allocator: Arc<dyn Allocator>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Allocator received element blocks are accounted to.
    pub fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }

    pub fn unmarshal_cx(&self) -> UnmarshalCx<'_> {
        UnmarshalCx::new(self)
    }

    pub fn function(&self, key: TypeKey) -> Result<&FunctionEntry> {
        self.functions
            .get(&key)
            .ok_or_else(|| Error::UnregisteredFunction(key.to_string()))
    }

    pub fn contains_function(&self, key: TypeKey) -> bool {
        self.functions.contains_key(&key)
    }

    pub(crate) fn polymorphic_factory(&self, key: TypeKey) -> Result<PolyFactory> {
        self.polymorphic
            .get(&key)
            .map(|entry| entry.factory)
            .ok_or_else(|| Error::UnregisteredType(key.to_string()))
    }

    pub(crate) fn object_factory(&self, key: TypeKey) -> Result<ObjectFactory> {
        self.objects
            .get(&key)
            .map(|entry| entry.factory)
            .ok_or_else(|| Error::UnregisteredType(key.to_string()))
    }

    pub fn contains_object_type(&self, key: TypeKey) -> bool {
        self.objects.contains_key(&key)
    }

    /// Names of the registered polymorphic types, sorted.
    pub fn polymorphic_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.polymorphic.values().map(|e| e.name).collect();
        names.sort_unstable();
        names
    }

    /// Names of the types that can be created remotely, sorted.
    pub fn object_type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.objects.values().map(|e| e.name).collect();
        names.sort_unstable();
        names
    }

    /// Names of the registered functions and member functions, sorted.
    pub fn function_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.functions.values().map(|e| e.name).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("functions", &self.function_names())
            .field("polymorphic", &self.polymorphic_names())
            .field("objects", &self.object_type_names())
            .finish()
    }
}

/// Collects registrations before the registry is frozen.
pub struct RegistryBuilder {
    functions: HashMap<TypeKey, FunctionEntry>,
    polymorphic: HashMap<TypeKey, PolyEntry>,
    objects: HashMap<TypeKey, ObjectEntry>,
    allocator: Arc<dyn Allocator>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            functions: HashMap::new(),
            polymorphic: HashMap::new(),
            objects: HashMap::new(),
            allocator: Arc::new(SystemAllocator),
        }
    }
}

impl RegistryBuilder {
    /// Account received element blocks to `allocator`.
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    fn insert_function(&mut self, key: TypeKey, entry: FunctionEntry) -> Result<()> {
        if self.functions.contains_key(&key) {
            return Err(Error::DuplicateRegistration(entry.name.to_string()));
        }
        debug!(name = entry.name, key = %key, "registered function");
        self.functions.insert(key, entry);
        Ok(())
    }

    /// Register a free function under `name`.
    ///
    /// `body` reads its arguments from [`Args`] by position, as the types
    /// the parameter list `P` stores them.
    pub fn function<P, R, F>(&mut self, name: &'static str, body: F) -> Result<FnHandle<P, R>>
    where
        P: ParamList,
        R: Marshal + 'static,
        F: Fn(&mut Args<'_>) -> Result<R> + Send + Sync + 'static,
    {
        let handle = FnHandle::<P, R>::named(name);
        let signature = Signature::of::<P, R>(name);
        let applied = signature.clone();
        let invoker: Invoker = Box::new(
            move |input: &mut Buffer,
                  cx: &UnmarshalCx<'_>,
                  get_return: bool,
                  reply: Buffer,
                  _target: Option<&mut ObjectCell>| {
                apply(&applied, input, cx, get_return, reply, |args| body(args))
            },
        );
        self.insert_function(
            handle.key(),
            FunctionEntry {
                name,
                receiver: None,
                signature,
                invoker,
            },
        )?;
        Ok(handle)
    }

    /// Register a member function of objects of type `T` under `name`.
    pub fn method<T, P, R, F>(
        &mut self,
        name: &'static str,
        body: F,
    ) -> Result<MethodHandle<T, P, R>>
    where
        T: 'static,
        P: ParamList,
        R: Marshal + 'static,
        F: Fn(&mut T, &mut Args<'_>) -> Result<R> + Send + Sync + 'static,
    {
        let handle = MethodHandle::<T, P, R>::named(name);
        let signature = Signature::of::<P, R>(name);
        let applied = signature.clone();
        let invoker: Invoker = Box::new(
            move |input: &mut Buffer,
                  cx: &UnmarshalCx<'_>,
                  get_return: bool,
                  reply: Buffer,
                  target: Option<&mut ObjectCell>| {
                let cell = target.ok_or_else(|| Error::UnregisteredObject {
                    type_name: std::any::type_name::<T>().to_string(),
                    object_id: 0,
                })?;
                let object = cell.get_mut::<T>()?;
                apply(&applied, input, cx, get_return, reply, |args| {
                    body(object, args)
                })
            },
        );
        self.insert_function(
            handle.key(),
            FunctionEntry {
                name,
                receiver: Some(std::any::type_name::<T>()),
                signature,
                invoker,
            },
        )?;
        Ok(handle)
    }

    /// Register a factory for dynamic type `B` behind `Box<dyn Polymorphic>`.
    pub fn polymorphic<B>(&mut self) -> Result<TypeKey>
    where
        B: Polymorphic + Unmarshal,
    {
        let key = TypeKey::of::<B>();
        if self.polymorphic.contains_key(&key) {
            return Err(Error::DuplicateRegistration(B::NAME.to_string()));
        }
        let factory: PolyFactory = |cx, buf| Ok(buf.pop::<B>(cx)?.map(box_polymorphic::<B>));
        self.polymorphic.insert(
            key,
            PolyEntry {
                name: B::NAME,
                factory,
            },
        );
        debug!(name = B::NAME, key = %key, "registered polymorphic type");
        Ok(key)
    }

    /// Allow objects of type `T` to be created in a remote object table.
    pub fn object_type<T>(&mut self) -> Result<TypeKey>
    where
        T: Unmarshal,
    {
        let key = TypeKey::of::<T>();
        if self.objects.contains_key(&key) {
            return Err(Error::DuplicateRegistration(T::NAME.to_string()));
        }
        let factory: ObjectFactory = |cx, buf| {
            let mut frame = Frame::new();
            let slot = buf.pop::<T>(cx)?.realize(&mut frame)?;
            Ok(ObjectCell::new(frame, slot))
        };
        self.objects.insert(
            key,
            ObjectEntry {
                name: T::NAME,
                factory,
            },
        );
        debug!(name = T::NAME, key = %key, "registered object type");
        Ok(key)
    }

    pub fn build(self) -> Registry {
        Registry {
            functions: self.functions,
            polymorphic: self.polymorphic,
            objects: self.objects,
            allocator: self.allocator,
        }
    }
}

fn box_polymorphic<B: Polymorphic>(value: B) -> Box<dyn Polymorphic> {
    Box::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_hashes_of_names() {
        const KEY: TypeKey = TypeKey::named("sum");
        assert_eq!(KEY, TypeKey::named("sum"));
        assert_ne!(KEY, TypeKey::named("sum2"));
        assert_eq!(TypeKey::of::<u32>(), TypeKey::named("u32"));
        assert_eq!(TypeKey::from_raw(KEY.get()), KEY);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut builder = Registry::builder();
        builder
            .function::<(i32,), i32, _>("twice", |args| Ok(*args.get::<i32>(0)? * 2))
            .unwrap();
        let err = builder
            .function::<(i64,), i64, _>("twice", |args| Ok(*args.get::<i64>(0)? * 2))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(name) if name == "twice"));
    }

    #[test]
    fn lookups_report_misses() {
        let registry = Registry::builder().build();
        assert!(registry.function(TypeKey::named("nope")).unwrap_err().is_registry());
        assert!(registry.polymorphic_factory(TypeKey::named("nope")).is_err());
        assert!(registry.object_factory(TypeKey::of::<u8>()).is_err());
    }

    #[test]
    fn registry_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Registry>();
    }
}
