//! rankcall loopback demo: an in-process world of ranks calling each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use bytemuck::{Pod, Zeroable};
use clap::Parser;

use rankcall::{
    Config, FnHandle, LocalWorld, MethodHandle, Mut, Node, Registry, Slice, SliceMut, Transport,
};

/// rankcall loopback demo.
#[derive(Parser, Debug)]
#[command(name = "rankcall-loopback")]
#[command(about = "Run remote calls between in-process ranks")]
struct Args {
    /// Path to the configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of ranks.
    #[arg(short, long, env = "RANKCALL_RANKS")]
    ranks: Option<usize>,

    /// Calls made to each peer.
    #[arg(short, long, default_value_t = 3)]
    iterations: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Counter {
    total: u64,
}

rankcall::pod_wire!(Counter);

struct Handles {
    axpy: FnHandle<(f64, Slice<f64>, SliceMut<f64>), ()>,
    greet: FnHandle<(String, u32), String>,
    add: MethodHandle<Counter, (u64,), u64>,
}

fn build_registry() -> rankcall::Result<(Registry, Handles)> {
    let mut builder = Registry::builder();
    let axpy = builder.function::<(f64, Slice<f64>, SliceMut<f64>), (), _>("axpy", |args| {
        let a = *args.get::<f64>(0)?;
        let x = args.get::<Vec<f64>>(1)?.clone();
        for (y, x) in args.get_mut::<Vec<f64>>(2)?.iter_mut().zip(x) {
            *y += a * x;
        }
        Ok(())
    })?;
    let greet = builder.function::<(String, u32), String, _>("greet", |args| {
        let name = args.get::<String>(0)?;
        let round = *args.get::<u32>(1)?;
        Ok(format!("hello {name}, round {round}"))
    })?;
    let add = builder.method::<Counter, (u64,), u64, _>("counter.add", |counter, args| {
        counter.total += *args.get::<u64>(0)?;
        Ok(counter.total)
    })?;
    builder.object_type::<Counter>()?;
    Ok((builder.build(), Handles { axpy, greet, add }))
}

fn drive<T: Transport>(node: &mut Node<T>, handles: &Handles, iterations: u64) -> anyhow::Result<()> {
    for peer in 1..node.size() {
        let counter = node.create_object::<Counter, _>(peer, &Counter::default())?;
        for round in 0..iterations {
            let greeting = node.call(peer, &handles.greet, ("rank 0", round as u32))?;
            tracing::info!(peer, %greeting, "greeted");

            let x = [1.0, 2.0, 3.0];
            let mut y = [0.5, 0.5, 0.5];
            node.call(peer, &handles.axpy, (2.0, &x[..], &mut y[..]))?;
            tracing::info!(peer, ?y, "axpy result passed back");

            let total = node.call_member(counter, &handles.add, (round + 1,))?;
            tracing::info!(peer, total, "counter advanced");
        }
    }
    node.shutdown_all()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(ranks) = args.ranks {
        config.runtime.ranks = ranks;
    }
    rankcall::telemetry::init(&config.logging)?;

    let (registry, handles) = build_registry()?;
    let registry = Arc::new(registry);
    let mut endpoints = LocalWorld::from_config(&config.runtime)?
        .into_endpoints()
        .into_iter();
    let root = endpoints.next().context("world has no ranks")?;

    tracing::info!(ranks = config.runtime.ranks, "starting loopback world");
    let workers: Vec<_> = endpoints
        .map(|endpoint| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || Node::new(endpoint, registry).run())
        })
        .collect();

    let mut node = Node::new(root, Arc::clone(&registry));
    drive(&mut node, &handles, args.iterations)?;

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("rank thread panicked"))??;
    }
    tracing::info!("loopback world finished");
    Ok(())
}
