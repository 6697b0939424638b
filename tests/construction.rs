//! Aggregates rebuilt through their constructors.

use std::cell::RefCell;
use std::sync::Arc;

use rankcall::apply::call_local;
use rankcall::{
    Buffer, Construct, Error, Frame, Held, LocalWorld, MarshalCx, Mut, Node, Ref, Registry, Slot,
    StorageDuration, Temp, Unmarshalled, Val,
};

/// Needs construction itself; deliberately not `Clone`.
#[derive(Debug, PartialEq)]
struct Inner {
    value: i32,
}

impl Construct for Inner {
    type Args = (Temp<i32>,);

    fn construct((value,): (i32,)) -> Self {
        Inner { value }
    }

    fn arguments(&self) -> (&i32,) {
        (&self.value,)
    }
}

rankcall::construct_wire!(Inner);

/// Holds a reference-like `flag` that must live as long as the call.
#[derive(Debug)]
struct Outer {
    v1: f64,
    v2: i32,
    v3: f32,
    flag: Slot<bool>,
    v5: i64,
    v6: i64,
    inner: Inner,
}

impl Outer {
    fn sum(&self) -> f64 {
        self.v1
            + f64::from(self.v2)
            + f64::from(self.v3)
            + self.v5 as f64
            + self.v6 as f64
            + f64::from(self.inner.value)
    }
}

impl Construct for Outer {
    type Args = (
        Temp<f64>,
        Temp<i32>,
        Temp<f32>,
        Held<bool>,
        Temp<i64>,
        Temp<i64>,
        Temp<Inner>,
    );

    fn construct((v1, v2, v3, flag, v5, v6, inner): (f64, i32, f32, Slot<bool>, i64, i64, Inner)) -> Self {
        Outer {
            v1,
            v2,
            v3,
            flag,
            v5,
            v6,
            inner,
        }
    }

    fn arguments(&self) -> (&f64, &i32, &f32, Slot<bool>, &i64, &i64, &Inner) {
        (
            &self.v1,
            &self.v2,
            &self.v3,
            self.flag,
            &self.v5,
            &self.v6,
            &self.inner,
        )
    }
}

rankcall::construct_wire!(Outer);

fn expected_sum() -> f64 {
    3.5 + 4.0 + f64::from(12.9f32) + 1004.0 + 21414.0 + 5.0
}

fn build_outer(frame: &mut Frame) -> Result<Slot<Outer>, rankcall::Error> {
    frame.construct::<Outer>((3.5, 4, 12.9f32, true, 1004, 21414, Inner { value: 5 }))
}

#[test]
fn nested_construction_roundtrips() -> Result<(), anyhow::Error> {
    let registry = Registry::builder().build();
    let mut caller = Frame::new();
    let outer = build_outer(&mut caller)?;
    assert_eq!(caller.get(outer)?.sum(), expected_sum());

    let mut buf = Buffer::new();
    buf.push(caller.get(outer)?, &MarshalCx::with_frame(&caller))?;
    buf.rewind();

    let plan = match buf.pop::<Outer>(&registry.unmarshal_cx())? {
        Unmarshalled::Deferred(plan) => plan,
        Unmarshalled::Ready(_) => anyhow::bail!("aggregate must defer construction"),
    };
    assert_eq!(plan.arity(), 7);
    assert!(plan.args().get(6).is_some_and(|arg| arg.is_nested()));

    let mut callee = Frame::new();
    let rebuilt = callee.realize(plan)?;
    let rebuilt = callee.get(rebuilt)?;
    assert_eq!(rebuilt.sum(), expected_sum());
    assert_eq!(rebuilt.inner, Inner { value: 5 });
    assert!(*callee.get(rebuilt.flag)?);
    assert_eq!(buf.remaining(), 0);
    Ok(())
}

#[test]
fn aggregate_arguments_through_apply() -> Result<(), anyhow::Error> {
    let mut builder = Registry::builder();
    let sum = builder.function::<(Ref<Outer>,), f64, _>("outer.sum", |args| {
        let outer = args.get::<Outer>(0)?;
        let flag = *args.frame().get(outer.flag)?;
        Ok(if flag { outer.sum() } else { -outer.sum() })
    })?;
    let toggle = builder.function::<(Mut<Outer>,), (), _>("outer.toggle", |args| {
        let flag = args.get::<Outer>(0)?.flag;
        let value = args.frame_mut().get_mut(flag)?;
        *value = !*value;
        Ok(())
    })?;
    let registry = builder.build();

    let mut caller = Frame::new();
    let outer = build_outer(&mut caller)?;
    assert_eq!(call_local(&registry, &sum, (caller.bind(outer),))?, expected_sum());

    call_local(&registry, &toggle, (caller.bind_mut(outer),))?;
    let flag = caller.get(outer)?.flag;
    assert!(!*caller.get(flag)?);
    assert_eq!(call_local(&registry, &sum, (caller.bind(outer),))?, -expected_sum());
    Ok(())
}

#[test]
fn aggregate_without_held_arguments_is_rebuilt_on_pass_back() -> Result<(), anyhow::Error> {
    let mut builder = Registry::builder();
    let bump = builder.function::<(Mut<Inner>,), (), _>("inner.bump", |args| {
        args.get_mut::<Inner>(0)?.value += 10;
        Ok(())
    })?;
    let registry = builder.build();

    let mut inner = Inner { value: 1 };
    call_local(&registry, &bump, (&mut inner,))?;
    assert_eq!(inner, Inner { value: 11 });
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Constructed(u32),
    Dropped(u32),
}

thread_local! {
    static EVENTS: RefCell<Vec<Event>> = const { RefCell::new(Vec::new()) };
}

fn record(event: Event) {
    EVENTS.with(|events| events.borrow_mut().push(event));
}

fn take_events() -> Vec<Event> {
    EVENTS.with(|events| std::mem::take(&mut *events.borrow_mut()))
}

/// Records its construction and destruction.
struct Tracker {
    id: u32,
}

impl Construct for Tracker {
    type Args = (Temp<u32>,);

    fn construct((id,): (u32,)) -> Self {
        record(Event::Constructed(id));
        Tracker { id }
    }

    fn arguments(&self) -> (&u32,) {
        (&self.id,)
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        record(Event::Dropped(self.id));
    }
}

rankcall::construct_wire!(Tracker);

fn expected_order(n: u32) -> Vec<Event> {
    (0..n)
        .map(Event::Constructed)
        .chain((0..n).rev().map(Event::Dropped))
        .collect()
}

#[test]
fn arguments_construct_in_order_and_drop_in_reverse() -> Result<(), anyhow::Error> {
    let mut builder = Registry::builder();
    let one = builder.function::<(Val<Tracker>,), (), _>("track1", |_| Ok(()))?;
    let two = builder.function::<(Val<Tracker>, Val<Tracker>), (), _>("track2", |_| Ok(()))?;
    let three = builder
        .function::<(Val<Tracker>, Val<Tracker>, Val<Tracker>), (), _>("track3", |_| Ok(()))?;
    let four = builder.function::<(Val<Tracker>, Val<Tracker>, Val<Tracker>, Val<Tracker>), (), _>(
        "track4",
        |_| Ok(()),
    )?;
    let registry = builder.build();

    let t: Vec<Tracker> = (0..4).map(|id| Tracker { id }).collect();
    let [t0, t1, t2, t3] = t.as_slice() else {
        anyhow::bail!("four trackers expected");
    };
    take_events();

    call_local(&registry, &one, (t0,))?;
    assert_eq!(take_events(), expected_order(1));

    call_local(&registry, &two, (t0, t1))?;
    assert_eq!(take_events(), expected_order(2));

    call_local(&registry, &three, (t0, t1, t2))?;
    assert_eq!(take_events(), expected_order(3));

    call_local(&registry, &four, (t0, t1, t2, t3))?;
    assert_eq!(take_events(), expected_order(4));

    drop(t);
    assert_eq!(take_events().len(), 4);
    Ok(())
}

#[test]
fn frame_destroys_values_in_reverse_order() -> Result<(), anyhow::Error> {
    let mut frame = Frame::new();
    for id in 0..3 {
        frame.construct::<Tracker>((id,))?;
    }
    assert_eq!(
        take_events(),
        vec![
            Event::Constructed(0),
            Event::Constructed(1),
            Event::Constructed(2)
        ]
    );
    frame.clear();
    assert_eq!(
        take_events(),
        vec![Event::Dropped(2), Event::Dropped(1), Event::Dropped(0)]
    );
    assert!(frame.is_empty());
    Ok(())
}

#[test]
fn aggregates_are_returned_through_their_constructor() -> Result<(), anyhow::Error> {
    let mut builder = Registry::builder();
    let make = builder.function::<(i32,), Inner, _>("inner.make", |args| {
        Ok(Inner {
            value: *args.get::<i32>(0)?,
        })
    })?;
    let pair = builder.function::<(i32,), (i32, Inner), _>("inner.pair", |args| {
        let value = *args.get::<i32>(0)?;
        Ok((value, Inner { value: value * 2 }))
    })?;
    let registry = Arc::new(builder.build());

    assert_eq!(call_local(&registry, &make, (7,))?, Inner { value: 7 });
    assert_eq!(call_local(&registry, &pair, (3,))?, (3, Inner { value: 6 }));

    let endpoint = LocalWorld::new(1)?
        .into_endpoints()
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no endpoint"))?;
    let mut node = Node::new(endpoint, Arc::clone(&registry));
    assert_eq!(node.call(0, &make, (9,))?, Inner { value: 9 });
    assert_eq!(node.call(0, &pair, (-1,))?, (-1, Inner { value: -2 }));
    Ok(())
}

#[test]
fn returned_aggregate_cannot_keep_call_scoped_arguments() -> Result<(), anyhow::Error> {
    let mut builder = Registry::builder();
    let make = builder.function::<(), Outer, _>("outer.make", |args| {
        let outer = build_outer(args.frame_mut())?;
        args.frame_mut().take(outer)
    })?;
    let registry = builder.build();

    assert!(matches!(
        call_local(&registry, &make, ()),
        Err(Error::DetachedCallScoped(_))
    ));
    Ok(())
}

const ANCHOR: u32 = 100;

/// Keeps its nested parts in the frame for the whole call.
struct Anchored {
    scale: f64,
    inner: Slot<Inner>,
    tracker: Slot<Tracker>,
}

impl Construct for Anchored {
    type Args = (Temp<f64>, Held<Inner>, Held<Tracker>);

    fn construct((scale, inner, tracker): (f64, Slot<Inner>, Slot<Tracker>)) -> Self {
        record(Event::Constructed(ANCHOR));
        Anchored {
            scale,
            inner,
            tracker,
        }
    }

    fn arguments(&self) -> (&f64, Slot<Inner>, Slot<Tracker>) {
        (&self.scale, self.inner, self.tracker)
    }
}

impl Drop for Anchored {
    fn drop(&mut self) {
        record(Event::Dropped(ANCHOR));
    }
}

rankcall::construct_wire!(Anchored);

fn anchored_sum(frame: &Frame, anchored: &Anchored) -> Result<f64, rankcall::Error> {
    Ok(anchored.scale + f64::from(frame.get(anchored.inner)?.value))
}

fn build_anchored(frame: &mut Frame) -> Result<Slot<Anchored>, rankcall::Error> {
    frame.construct::<Anchored>((1.5, Inner { value: 7 }, Tracker { id: 3 }))
}

#[test]
fn nested_plans_realize_into_call_scoped_slots() -> Result<(), anyhow::Error> {
    let registry = Registry::builder().build();
    let mut caller = Frame::new();
    let anchored = build_anchored(&mut caller)?;
    let mut buf = Buffer::new();
    buf.push(caller.get(anchored)?, &MarshalCx::with_frame(&caller))?;
    buf.rewind();
    take_events();

    let plan = match buf.pop::<Anchored>(&registry.unmarshal_cx())? {
        Unmarshalled::Deferred(plan) => plan,
        Unmarshalled::Ready(_) => anyhow::bail!("aggregate must defer construction"),
    };
    assert_eq!(
        plan.durations(),
        vec![
            StorageDuration::Constructor,
            StorageDuration::Call,
            StorageDuration::Call
        ]
    );
    assert!(plan.args().iter().skip(1).all(|arg| arg.is_nested()));

    let mut callee = Frame::new();
    let slot = callee.realize(plan)?;
    assert_eq!(
        take_events(),
        vec![Event::Constructed(3), Event::Constructed(ANCHOR)]
    );
    let received = callee.get(slot)?;
    assert_eq!(anchored_sum(&callee, received)?, 8.5);
    assert_eq!(callee.get(received.tracker)?.id, 3);
    assert_eq!(
        callee.retained(slot.index())?,
        &[received.inner.index(), received.tracker.index()]
    );

    callee.clear();
    assert_eq!(
        take_events(),
        vec![Event::Dropped(ANCHOR), Event::Dropped(3)]
    );
    Ok(())
}

#[test]
fn by_value_and_call_scoped_fields_both_pass_back() -> Result<(), anyhow::Error> {
    let mut builder = Registry::builder();
    let adjust = builder.function::<(Mut<Anchored>,), f64, _>("anchored.adjust", |args| {
        let inner = args.get::<Anchored>(0)?.inner;
        args.frame_mut().get_mut(inner)?.value += 10;
        args.get_mut::<Anchored>(0)?.scale = 4.0;
        let anchored = args.get::<Anchored>(0)?;
        anchored_sum(args.frame(), anchored)
    })?;
    let registry = builder.build();

    let mut caller = Frame::new();
    let anchored = build_anchored(&mut caller)?;
    let inner = caller.get(anchored)?.inner;
    assert_eq!(
        call_local(&registry, &adjust, (caller.bind_mut(anchored),))?,
        21.0
    );

    let restored = caller.get(anchored)?;
    assert_eq!(restored.scale, 4.0);
    assert_eq!(restored.inner, inner);
    assert_eq!(anchored_sum(&caller, restored)?, 21.0);
    assert_eq!(caller.get(restored.tracker)?.id, 3);
    Ok(())
}
