//! Dispatch boundary: invocation messages between ranks.
//!
//! Message payloads:
//!
//! ```text
//! Invoke        [function key: u64][reply mode: u8][arguments...]
//! InvokeMember  [receiver type key: u64][object id: u64][function key: u64][reply mode: u8][arguments...]
//! NewObject     [type key: u64][value]
//! Return        [status: u8] then either
//!                 status 0: [return value?][passed-back arguments...]
//!                 status 1: [error message: String]
//! Shutdown      (empty)
//! ```
//!
//! A successful reply's content is aligned relative to the start of the
//! payload, so the status byte costs at most the padding of the first value.
//!
//! A node waiting for a reply keeps serving incoming requests, so calls may
//! nest across ranks (a callee may call back into its caller).

mod local;
pub mod objects;

use std::sync::Arc;
use std::time::Duration;

use crate::apply::read_reply;
use crate::buffer::Buffer;
use crate::classify::{Argument, Arguments, ParamList, Val};
use crate::error::{Error, Result};
use crate::logging::{debug, error, info, warn};
use crate::registry::{FnHandle, MethodHandle, ObjectRef, Registry, TypeKey};
use crate::wire::{Marshal, MarshalCx, Unmarshal};

pub use local::{LocalEndpoint, LocalWorld};
pub use objects::{ObjectCell, ObjectTable};

const REPLY_NONE: u8 = 0;
const REPLY_PASS_BACK: u8 = 1;
const REPLY_RETURN: u8 = 2;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Kind of a message between ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Invoke = 1,
    InvokeMember = 2,
    Return = 3,
    NewObject = 4,
    Shutdown = 5,
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Invoke),
            2 => Ok(Self::InvokeMember),
            3 => Ok(Self::Return),
            4 => Ok(Self::NewObject),
            5 => Ok(Self::Shutdown),
            other => Err(Error::UnexpectedTag(other)),
        }
    }
}

/// A tagged message. `source` is filled in by the transport on send.
#[derive(Debug)]
pub struct Envelope {
    pub source: usize,
    pub tag: Tag,
    pub payload: Buffer,
}

impl Envelope {
    pub fn new(tag: Tag, payload: Buffer) -> Self {
        Self {
            source: 0,
            tag,
            payload,
        }
    }
}

/// Point-to-point delivery of envelopes between the ranks of a world.
pub trait Transport {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, dest: usize, envelope: Envelope) -> Result<()>;

    /// Block until an envelope arrives.
    fn recv(&self) -> Result<Envelope>;

    /// Wait at most `timeout` for an envelope.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let _ = timeout;
        self.recv().map(Some)
    }
}

/// Key of an object table entry's type, as checked by member calls.
fn receiver_key<O>() -> TypeKey {
    TypeKey::named(std::any::type_name::<O>())
}

/// A reply buffer holding the success status, ready for the reply content.
fn ok_reply() -> Result<Buffer> {
    let mut out = Buffer::new();
    out.append_pod(&STATUS_OK, 1)?;
    Ok(out)
}

/// Pass a successful reply through; replace a failure with its error reply.
fn encode_reply(result: Result<Buffer>) -> Result<Buffer> {
    match result {
        Ok(reply) => Ok(reply),
        Err(err) => {
            let mut out = Buffer::new();
            out.append_pod(&STATUS_ERROR, 1)?;
            out.push(&err.to_string(), &MarshalCx::detached())?;
            Ok(out)
        }
    }
}

/// Position the cursor after a reply's status, or surface the remote error.
fn decode_reply(mut payload: Buffer, registry: &Registry) -> Result<Buffer> {
    payload.rewind();
    match payload.read_pod::<u8>(1)? {
        STATUS_OK => Ok(payload),
        STATUS_ERROR => {
            let message = payload.pop_ready::<String>(&registry.unmarshal_cx())?;
            Err(Error::Remote(message))
        }
        other => Err(Error::UnexpectedTag(other)),
    }
}

/// One rank: sends calls, serves calls, and holds the rank's objects.
pub struct Node<T: Transport> {
    transport: T,
    registry: Arc<Registry>,
    objects: ObjectTable,
    shutdown: bool,
}

impl<T: Transport> Node<T> {
    pub fn new(transport: T, registry: Arc<Registry>) -> Self {
        info!(
            rank = transport.rank(),
            size = transport.size(),
            "node started"
        );
        Self {
            transport,
            registry,
            objects: ObjectTable::new(),
            shutdown: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Whether a shutdown request has been received.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown
    }

    fn check_rank(&self, dest: usize) -> Result<()> {
        let size = self.size();
        if dest >= size {
            return Err(Error::InvalidRank { rank: dest, size });
        }
        Ok(())
    }

    fn invoke_payload<P, A>(
        key: TypeKey,
        receiver: Option<(TypeKey, u64)>,
        mode: u8,
        args: &A,
    ) -> Result<Buffer>
    where
        P: ParamList,
        A: Arguments<P>,
    {
        let mut payload = Buffer::new();
        if let Some((type_key, id)) = receiver {
            payload.append_pod(&type_key.get(), 8)?;
            payload.append_pod(&id, 8)?;
        }
        payload.append_pod(&key.get(), 8)?;
        payload.append_pod(&mode, 1)?;
        args.marshal_all(&mut payload)?;
        Ok(payload)
    }

    /// Call `handle` on rank `dest` and wait for its return value.
    ///
    /// Arguments declared as passed back are updated from the reply.
    pub fn call<P, R, A>(&mut self, dest: usize, handle: &FnHandle<P, R>, mut args: A) -> Result<R>
    where
        P: ParamList,
        R: Unmarshal,
        A: Arguments<P>,
    {
        self.check_rank(dest)?;
        self.registry.function(handle.key())?;
        let payload = Self::invoke_payload::<P, A>(handle.key(), None, REPLY_RETURN, &args)?;
        debug!(
            function = handle.name(),
            dest,
            bytes = payload.len(),
            "sending invocation"
        );
        self.transport.send(dest, Envelope::new(Tag::Invoke, payload))?;
        let mut reply = self.wait_reply(dest)?;
        let registry = Arc::clone(&self.registry);
        read_reply::<P, R, A>(&mut args, &registry.unmarshal_cx(), &mut reply, true)?
            .ok_or_else(|| Error::transport("reply carried no return value"))
    }

    /// Call `handle` on rank `dest`, discarding its return value but
    /// applying passed-back arguments.
    pub fn call_discard<P, R, A>(
        &mut self,
        dest: usize,
        handle: &FnHandle<P, R>,
        mut args: A,
    ) -> Result<()>
    where
        P: ParamList,
        R: Unmarshal,
        A: Arguments<P>,
    {
        self.check_rank(dest)?;
        self.registry.function(handle.key())?;
        let payload = Self::invoke_payload::<P, A>(handle.key(), None, REPLY_PASS_BACK, &args)?;
        self.transport.send(dest, Envelope::new(Tag::Invoke, payload))?;
        let mut reply = self.wait_reply(dest)?;
        let registry = Arc::clone(&self.registry);
        read_reply::<P, R, A>(&mut args, &registry.unmarshal_cx(), &mut reply, false)?;
        Ok(())
    }

    /// Send a call to `dest` without waiting. No reply is produced, so
    /// passed-back arguments keep their values; callee failures are logged there.
    pub fn post<P, R, A>(&mut self, dest: usize, handle: &FnHandle<P, R>, args: A) -> Result<()>
    where
        P: ParamList,
        A: Arguments<P>,
    {
        self.check_rank(dest)?;
        self.registry.function(handle.key())?;
        let payload = Self::invoke_payload::<P, A>(handle.key(), None, REPLY_NONE, &args)?;
        debug!(function = handle.name(), dest, "posting invocation");
        self.transport.send(dest, Envelope::new(Tag::Invoke, payload))
    }

    /// Call a member function on an object stored by another (or this) rank.
    pub fn call_member<O, P, R, A>(
        &mut self,
        target: ObjectRef<O>,
        handle: &MethodHandle<O, P, R>,
        mut args: A,
    ) -> Result<R>
    where
        P: ParamList,
        R: Unmarshal,
        A: Arguments<P>,
    {
        self.check_rank(target.rank())?;
        self.registry.function(handle.key())?;
        let payload = Self::invoke_payload::<P, A>(
            handle.key(),
            Some((receiver_key::<O>(), target.id())),
            REPLY_RETURN,
            &args,
        )?;
        debug!(
            function = handle.name(),
            dest = target.rank(),
            object = target.id(),
            "sending member invocation"
        );
        self.transport
            .send(target.rank(), Envelope::new(Tag::InvokeMember, payload))?;
        let mut reply = self.wait_reply(target.rank())?;
        let registry = Arc::clone(&self.registry);
        read_reply::<P, R, A>(&mut args, &registry.unmarshal_cx(), &mut reply, true)?
            .ok_or_else(|| Error::transport("reply carried no return value"))
    }

    /// Create an object on rank `dest` from a copy of `value`.
    pub fn create_object<O, A>(&mut self, dest: usize, value: A) -> Result<ObjectRef<O>>
    where
        O: Marshal + Unmarshal,
        A: Argument<Val<O>>,
    {
        self.check_rank(dest)?;
        let key = TypeKey::of::<O>();
        if !self.registry.contains_object_type(key) {
            return Err(Error::UnregisteredType(O::NAME.to_string()));
        }
        let mut payload = Buffer::new();
        payload.append_pod(&key.get(), 8)?;
        value.marshal_arg(&mut payload)?;
        self.transport
            .send(dest, Envelope::new(Tag::NewObject, payload))?;
        let mut reply = self.wait_reply(dest)?;
        let id = reply.read_pod::<u64>(8)?;
        debug!(type_name = O::NAME, dest, id, "created remote object");
        Ok(ObjectRef::new(dest, id))
    }

    /// Store `value` in this rank's object table.
    pub fn insert_object<O: 'static>(&mut self, value: O) -> Result<ObjectRef<O>> {
        let id = self.objects.insert(ObjectCell::from_value(value)?);
        Ok(ObjectRef::new(self.rank(), id))
    }

    /// Borrow an object stored on this rank.
    pub fn object<O: 'static>(&self, target: ObjectRef<O>) -> Result<&O> {
        if target.rank() != self.rank() {
            return Err(Error::UnregisteredObject {
                type_name: std::any::type_name::<O>().to_string(),
                object_id: target.id(),
            });
        }
        self.objects.get(target.id())?.get::<O>()
    }

    pub fn remove_object<O>(&mut self, target: ObjectRef<O>) -> Result<()> {
        self.objects.remove(target.id())
    }

    /// Ask rank `dest` to leave its serve loop.
    pub fn shutdown(&self, dest: usize) -> Result<()> {
        self.check_rank(dest)?;
        self.transport
            .send(dest, Envelope::new(Tag::Shutdown, Buffer::new()))
    }

    /// Ask every other rank to leave its serve loop.
    pub fn shutdown_all(&self) -> Result<()> {
        (0..self.size())
            .filter(|&rank| rank != self.rank())
            .try_for_each(|rank| self.shutdown(rank))
    }

    fn wait_reply(&mut self, dest: usize) -> Result<Buffer> {
        loop {
            let envelope = self.transport.recv()?;
            if envelope.tag == Tag::Return {
                if envelope.source != dest {
                    return Err(Error::transport(format!(
                        "reply from rank {} while waiting for rank {dest}",
                        envelope.source
                    )));
                }
                return decode_reply(envelope.payload, &self.registry);
            }
            self.handle(envelope)?;
        }
    }

    /// Receive and handle one request. Returns `false` once shut down.
    pub fn serve_one(&mut self) -> Result<bool> {
        let envelope = self.transport.recv()?;
        if envelope.tag == Tag::Return {
            return Err(Error::UnexpectedTag(Tag::Return as u8));
        }
        self.handle(envelope)?;
        Ok(!self.shutdown)
    }

    /// Serve requests until a shutdown request arrives. A shutdown that
    /// arrived while waiting for a reply ends the loop immediately.
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown && self.serve_one()? {}
        info!(rank = self.rank(), "node shut down");
        Ok(())
    }

    fn handle(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope {
            source,
            tag,
            mut payload,
        } = envelope;
        payload.rewind();
        match tag {
            Tag::Invoke => self.handle_invoke(source, &mut payload),
            Tag::InvokeMember => self.handle_member(source, &mut payload),
            Tag::NewObject => self.handle_new_object(source, &mut payload),
            Tag::Shutdown => {
                debug!(rank = self.rank(), source, "shutdown requested");
                self.shutdown = true;
                Ok(())
            }
            Tag::Return => Err(Error::UnexpectedTag(tag as u8)),
        }
    }

    fn handle_invoke(&mut self, source: usize, payload: &mut Buffer) -> Result<()> {
        let key = TypeKey::from_raw(payload.read_pod::<u64>(8)?);
        let mode = payload.read_pod::<u8>(1)?;
        let registry = Arc::clone(&self.registry);
        let cx = registry.unmarshal_cx();
        let result = registry
            .function(key)
            .and_then(|entry| entry.invoke(payload, &cx, mode == REPLY_RETURN, ok_reply()?));
        self.finish(source, mode, result)
    }

    fn handle_member(&mut self, source: usize, payload: &mut Buffer) -> Result<()> {
        let receiver = TypeKey::from_raw(payload.read_pod::<u64>(8)?);
        let id = payload.read_pod::<u64>(8)?;
        let key = TypeKey::from_raw(payload.read_pod::<u64>(8)?);
        let mode = payload.read_pod::<u8>(1)?;
        let registry = Arc::clone(&self.registry);
        let cx = registry.unmarshal_cx();
        let objects = &mut self.objects;
        let result = registry.function(key).and_then(|entry| {
            let cell = objects.get_mut(id)?;
            if TypeKey::named(cell.type_name()) != receiver {
                return Err(Error::UnregisteredObject {
                    type_name: cell.type_name().to_string(),
                    object_id: id,
                });
            }
            entry.invoke_member(payload, &cx, mode == REPLY_RETURN, ok_reply()?, cell)
        });
        self.finish(source, mode, result)
    }

    fn handle_new_object(&mut self, source: usize, payload: &mut Buffer) -> Result<()> {
        let key = TypeKey::from_raw(payload.read_pod::<u64>(8)?);
        let registry = Arc::clone(&self.registry);
        let cx = registry.unmarshal_cx();
        let result = registry
            .object_factory(key)
            .and_then(|factory| factory(&cx, payload))
            .and_then(|cell| {
                let id = self.objects.insert(cell);
                let mut out = ok_reply()?;
                out.append_pod(&id, 8)?;
                Ok(out)
            });
        self.finish(source, REPLY_RETURN, result)
    }

    fn finish(&mut self, source: usize, mode: u8, result: Result<Buffer>) -> Result<()> {
        if mode == REPLY_NONE {
            if let Err(err) = result {
                warn!(source, error = %err, "posted call failed");
            }
            return Ok(());
        }
        if let Err(err) = &result {
            debug!(source, error = %err, "call failed, replying with error");
        }
        let reply = encode_reply(result)?;
        let sent = self
            .transport
            .send(source, Envelope::new(Tag::Return, reply));
        if let Err(err) = &sent {
            error!(source, error = %err, "failed to deliver reply");
        }
        sent
    }
}

impl<T: Transport> std::fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .field("objects", &self.objects.len())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip_through_bytes() {
        for tag in [
            Tag::Invoke,
            Tag::InvokeMember,
            Tag::Return,
            Tag::NewObject,
            Tag::Shutdown,
        ] {
            assert_eq!(Tag::try_from(tag as u8).unwrap(), tag);
        }
        assert!(matches!(Tag::try_from(9), Err(Error::UnexpectedTag(9))));
    }

    #[test]
    fn error_replies_become_remote_errors() {
        let registry = Registry::builder().build();
        let reply = encode_reply(Err(Error::UnregisteredFunction("f".into()))).unwrap();
        let err = decode_reply(reply, &registry).unwrap_err();
        assert!(err.is_remote());
        assert!(err.to_string().contains("Unregistered function: f"));
    }

    #[test]
    fn ok_replies_pad_only_to_the_first_value() {
        let registry = Registry::builder().build();
        let mut out = ok_reply().unwrap();
        out.append_pod(&7u64, 8).unwrap();
        let reply = encode_reply(Ok(out)).unwrap();
        assert_eq!(reply.len(), 16);
        let mut decoded = decode_reply(reply, &registry).unwrap();
        assert_eq!(decoded.cursor(), 1);
        assert_eq!(decoded.read_pod::<u64>(8).unwrap(), 7);
    }

    #[test]
    fn applied_reply_follows_the_status_byte() {
        let mut builder = Registry::builder();
        let add = builder
            .function::<(u8, u8), u8, _>("add", |args| {
                Ok(args.get::<u8>(0)? + args.get::<u8>(1)?)
            })
            .unwrap();
        let registry = builder.build();
        let mut input = Buffer::new();
        crate::apply::marshal_call::<(u8, u8), _>(&(2u8, 3u8), &mut input).unwrap();
        input.rewind();
        let reply = registry
            .function(add.key())
            .unwrap()
            .invoke(&mut input, &registry.unmarshal_cx(), true, ok_reply().unwrap())
            .unwrap();
        assert_eq!(reply.len(), 2);
        let mut decoded = decode_reply(reply, &registry).unwrap();
        assert_eq!(decoded.read_pod::<u8>(1).unwrap(), 5);
    }

    #[test]
    fn unregistered_handles_rejected_before_sending() {
        let registry = Arc::new(Registry::builder().build());
        let endpoint = LocalWorld::new(1).unwrap().into_endpoints().pop().unwrap();
        let mut node = Node::new(endpoint, registry);
        let missing = FnHandle::<(i32,), i32>::named("missing");
        let err = node.call(0, &missing, (1,)).unwrap_err();
        assert!(matches!(err, Error::UnregisteredFunction(_)));
        assert!(matches!(
            node.call(4, &missing, (1,)).unwrap_err(),
            Error::InvalidRank { rank: 4, size: 1 }
        ));
    }
}
