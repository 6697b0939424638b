//! Calls between ranks of an in-process world.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use bytemuck::{Pod, Zeroable};
use rankcall::{
    Error, FnHandle, LocalEndpoint, LocalWorld, MethodHandle, Mut, Node, Registry, SliceMut, Tag,
    Transport,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Accumulator {
    total: i64,
    calls: u64,
}

rankcall::pod_wire!(Accumulator);

struct Handles {
    add: FnHandle<(i32, i32), i32>,
    fill: FnHandle<(SliceMut<u16>, u16), usize>,
    bump: FnHandle<(Mut<u64>,), ()>,
    fail: FnHandle<(), ()>,
    record: FnHandle<(String,), ()>,
    accumulate: MethodHandle<Accumulator, (i64,), i64>,
    calls: MethodHandle<Accumulator, (), u64>,
}

fn build(log: Arc<Mutex<Vec<String>>>) -> Result<(Arc<Registry>, Handles), Error> {
    let mut builder = Registry::builder();
    let add = builder.function::<(i32, i32), i32, _>("add", |args| {
        Ok(args.get::<i32>(0)? + args.get::<i32>(1)?)
    })?;
    let fill = builder.function::<(SliceMut<u16>, u16), usize, _>("fill", |args| {
        let value = *args.get::<u16>(1)?;
        let target = args.get_mut::<Vec<u16>>(0)?;
        target.fill(value);
        Ok(target.len())
    })?;
    let bump = builder.function::<(Mut<u64>,), (), _>("bump", |args| {
        *args.get_mut::<u64>(0)? += 1;
        Ok(())
    })?;
    let fail = builder.function::<(), (), _>("fail", |_| Err(Error::transport("refused")))?;
    let record = builder.function::<(String,), (), _>("record", move |args| {
        let entry = args.get::<String>(0)?.clone();
        log.lock()
            .map_err(|_| Error::transport("log poisoned"))?
            .push(entry);
        Ok(())
    })?;
    let accumulate =
        builder.method::<Accumulator, (i64,), i64, _>("accumulator.add", |acc, args| {
            acc.total += *args.get::<i64>(0)?;
            acc.calls += 1;
            Ok(acc.total)
        })?;
    let calls = builder.method::<Accumulator, (), u64, _>("accumulator.calls", |acc, _| {
        Ok(acc.calls)
    })?;
    builder.object_type::<Accumulator>()?;
    let handles = Handles {
        add,
        fill,
        bump,
        fail,
        record,
        accumulate,
        calls,
    };
    Ok((Arc::new(builder.build()), handles))
}

/// Rank 0's node plus serving threads for every other rank.
fn world(
    size: usize,
    registry: &Arc<Registry>,
) -> Result<(Node<LocalEndpoint>, Vec<thread::JoinHandle<rankcall::Result<()>>>), Error> {
    let mut endpoints = LocalWorld::new(size)?.into_endpoints().into_iter();
    let root = endpoints
        .next()
        .ok_or(Error::InvalidRank { rank: 0, size })?;
    let workers = endpoints
        .map(|endpoint| {
            let registry = Arc::clone(registry);
            thread::spawn(move || Node::new(endpoint, registry).run())
        })
        .collect();
    Ok((Node::new(root, Arc::clone(registry)), workers))
}

fn finish(
    node: &Node<LocalEndpoint>,
    workers: Vec<thread::JoinHandle<rankcall::Result<()>>>,
) -> Result<(), anyhow::Error> {
    node.shutdown_all()?;
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("rank thread panicked"))??;
    }
    Ok(())
}

#[test]
fn remote_calls_return_values_and_pass_back() -> Result<(), anyhow::Error> {
    let (registry, handles) = build(Arc::default())?;
    let (mut node, workers) = world(3, &registry)?;

    for peer in 1..3 {
        assert_eq!(node.call(peer, &handles.add, (20, 22))?, 42);

        let mut samples = [0u16; 5];
        let filled = node.call(peer, &handles.fill, (&mut samples[..], 7u16))?;
        assert_eq!(filled, 5);
        assert_eq!(samples, [7; 5]);

        let mut ticks = 10u64;
        node.call_discard(peer, &handles.bump, (&mut ticks,))?;
        assert_eq!(ticks, 11);
    }

    finish(&node, workers)
}

#[test]
fn calls_to_self_are_served_while_waiting() -> Result<(), anyhow::Error> {
    let (registry, handles) = build(Arc::default())?;
    let mut endpoints = LocalWorld::new(1)?.into_endpoints();
    let endpoint = endpoints.pop().ok_or_else(|| anyhow::anyhow!("no endpoint"))?;
    let mut node = Node::new(endpoint, registry);

    assert_eq!(node.call(0, &handles.add, (1, 2))?, 3);
    let mut ticks = 0u64;
    node.call(0, &handles.bump, (&mut ticks,))?;
    assert_eq!(ticks, 1);
    Ok(())
}

#[test]
fn crossing_calls_do_not_deadlock() -> Result<(), anyhow::Error> {
    let (registry, handles) = build(Arc::default())?;
    let handles = Arc::new(handles);
    let mut endpoints = LocalWorld::new(2)?.into_endpoints().into_iter();
    let (Some(first), Some(second)) = (endpoints.next(), endpoints.next()) else {
        anyhow::bail!("two endpoints expected");
    };
    let barrier = Arc::new(Barrier::new(2));

    let spawn = |endpoint: LocalEndpoint, peer: usize| {
        let registry = Arc::clone(&registry);
        let handles = Arc::clone(&handles);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || -> rankcall::Result<i32> {
            let mut node = Node::new(endpoint, registry);
            barrier.wait();
            // Each request is served by a peer that is itself waiting for a reply.
            let sum = node.call(peer, &handles.add, (peer as i32, 100))?;
            node.shutdown(peer)?;
            node.run()?;
            Ok(sum)
        })
    };
    let a = spawn(first, 1);
    let b = spawn(second, 0);

    let a = a.join().map_err(|_| anyhow::anyhow!("rank 0 panicked"))??;
    let b = b.join().map_err(|_| anyhow::anyhow!("rank 1 panicked"))??;
    assert_eq!((a, b), (101, 100));
    Ok(())
}

#[test]
fn remote_objects_keep_state_between_calls() -> Result<(), anyhow::Error> {
    let (registry, handles) = build(Arc::default())?;
    let (mut node, workers) = world(2, &registry)?;

    let acc = node.create_object::<Accumulator, _>(1, &Accumulator::default())?;
    let other = node.create_object::<Accumulator, _>(1, &Accumulator { total: 100, calls: 0 })?;
    assert_eq!(acc.rank(), 1);
    assert_ne!(acc.id(), other.id());

    assert_eq!(node.call_member(acc, &handles.accumulate, (5i64,))?, 5);
    assert_eq!(node.call_member(acc, &handles.accumulate, (-2i64,))?, 3);
    assert_eq!(node.call_member(other, &handles.accumulate, (1i64,))?, 101);
    assert_eq!(node.call_member(acc, &handles.calls, ())?, 2);

    let local = node.insert_object(Accumulator { total: 1, calls: 0 })?;
    assert_eq!(node.call_member(local, &handles.accumulate, (1i64,))?, 2);
    assert_eq!(node.object(local)?.total, 2);

    finish(&node, workers)
}

#[test]
fn callee_failures_surface_as_remote_errors() -> Result<(), anyhow::Error> {
    let (registry, handles) = build(Arc::default())?;
    let (mut node, workers) = world(2, &registry)?;

    let err = node.call(1, &handles.fail, ());
    match err {
        Err(Error::Remote(message)) => assert!(message.contains("refused")),
        other => anyhow::bail!("expected a remote error, got {other:?}"),
    }

    let missing = node.insert_object(Accumulator::default())?;
    node.remove_object(missing)?;
    assert!(matches!(
        node.call_member(missing, &handles.calls, ()),
        Err(Error::Remote(_))
    ));

    // The serving rank keeps going after a failed call.
    assert_eq!(node.call(1, &handles.add, (1, 1))?, 2);
    finish(&node, workers)
}

#[test]
fn posted_calls_run_in_order() -> Result<(), anyhow::Error> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (registry, handles) = build(Arc::clone(&log))?;
    let (mut node, workers) = world(2, &registry)?;

    for i in 0..4 {
        node.post(1, &handles.record, (format!("entry {i}"),))?;
    }
    node.post(1, &handles.fail, ())?;
    // A synchronous call after the posts returns once they have been applied.
    assert_eq!(node.call(1, &handles.add, (0, 0))?, 0);

    let entries = log
        .lock()
        .map_err(|_| anyhow::anyhow!("log poisoned"))?
        .clone();
    assert_eq!(entries, ["entry 0", "entry 1", "entry 2", "entry 3"]);
    finish(&node, workers)
}

#[test]
fn requests_are_checked_before_sending() -> Result<(), anyhow::Error> {
    let (registry, handles) = build(Arc::default())?;
    let mut endpoints = LocalWorld::new(2)?.into_endpoints();
    let peer = endpoints.pop().ok_or_else(|| anyhow::anyhow!("no endpoint"))?;
    let endpoint = endpoints.pop().ok_or_else(|| anyhow::anyhow!("no endpoint"))?;
    let mut node = Node::new(endpoint, registry);

    assert!(matches!(
        node.call(5, &handles.add, (1, 1)),
        Err(Error::InvalidRank { rank: 5, size: 2 })
    ));
    let foreign = FnHandle::<(i32, i32), i32>::named("not registered");
    assert!(matches!(
        node.call(1, &foreign, (1, 1)),
        Err(Error::UnregisteredFunction(_))
    ));
    assert!(matches!(
        node.create_object::<u64, _>(1, &5u64),
        Err(Error::UnregisteredType(_))
    ));

    node.shutdown(1)?;
    let envelope = peer.recv()?;
    assert_eq!(envelope.tag, Tag::Shutdown);
    assert_eq!(envelope.source, 0);
    Ok(())
}
