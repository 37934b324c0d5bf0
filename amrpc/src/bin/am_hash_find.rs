//! Distributed hash table benchmark over the in-process mesh.
//!
//! Every simulated process owns the keys that hash to its rank. Each
//! process first inserts `--num-ams` random keys with remote calls and
//! flushes, then looks all of them up again, flushing after every lookup,
//! and reports the average latency per active message.
//!
//! Run with:
//! ```bash
//! cargo run --release -p amrpc --bin am_hash_find --features bench-bin -- \
//!     --nprocs 4 --num-ams 100000 --key-space 1000000
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;
use zerocopy::{Immutable, IntoBytes};

use amrpc::{Context, ContextConfig, MeshNode, create_mesh};

#[derive(Parser, Debug)]
#[command(name = "am_hash_find")]
#[command(about = "Insert then find random keys in a distributed hash table")]
struct Args {
    /// Number of simulated processes
    #[arg(short = 'n', long, default_value = "4")]
    nprocs: usize,

    /// Active messages issued per process in each phase
    #[arg(short = 'a', long, default_value = "100000")]
    num_ams: usize,

    /// Keys are drawn from 0..key_space
    #[arg(short, long, default_value = "1000000")]
    key_space: u64,

    /// Base RNG seed; process r uses seed + r
    #[arg(short, long, default_value = "42")]
    seed: u64,
}

thread_local! {
    static TABLE: RefCell<HashMap<u64, u64>> = RefCell::new(HashMap::new());
}

/// Result of a remote lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable)]
#[repr(C)]
struct Lookup {
    found: u64,
    value: u64,
}

impl Lookup {
    fn hit(value: u64) -> Self {
        Self { found: 1, value }
    }
}

fn insert([key, value]: [u64; 2]) {
    TABLE.with(|t| t.borrow_mut().insert(key, value));
}

fn find(key: u64) -> Lookup {
    TABLE.with(|t| match t.borrow().get(&key) {
        Some(&value) => Lookup::hit(value),
        None => Lookup { found: 0, value: 0 },
    })
}

fn value_for(key: u64) -> u64 {
    key.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Arrives at a phase boundary while still serving other processes.
fn arrive(ctx: &Context<MeshNode>, arrived: &AtomicUsize, target: usize) {
    arrived.fetch_add(1, Ordering::AcqRel);
    while arrived.load(Ordering::Acquire) < target {
        ctx.progress();
        std::hint::spin_loop();
    }
}

fn run_process(
    ctx: Context<MeshNode>,
    args: &Args,
    arrived: &AtomicUsize,
) -> amrpc::Result<Duration> {
    let nprocs = ctx.nprocs();
    let owner = |key: u64| (key % nprocs as u64) as usize;

    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(ctx.rank() as u64));
    let keys: Vec<u64> = (0..args.num_ams)
        .map(|_| rng.random_range(0..args.key_space))
        .collect();

    for &key in &keys {
        let fut = ctx.rpc(owner(key), insert, [key, value_for(key)])?;
        ctx.flush()?;
        drop(fut);
    }
    arrive(&ctx, arrived, nprocs);
    tracing::debug!(rank = ctx.rank(), "insert phase done");

    let start = Instant::now();
    let mut misses = 0usize;
    for &key in &keys {
        let fut = ctx.rpc(owner(key), find, key)?;
        ctx.flush()?;
        if fut.wait() != Lookup::hit(value_for(key)) {
            misses += 1;
        }
    }
    let elapsed = start.elapsed();
    arrive(&ctx, arrived, 2 * nprocs);

    if misses > 0 {
        tracing::error!(rank = ctx.rank(), misses, "lookups returned wrong values");
    }
    tracing::debug!(rank = ctx.rank(), ?elapsed, "find phase done");
    Ok(elapsed)
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let args = Args::parse();
    if args.nprocs == 0 || args.key_space == 0 {
        eprintln!("--nprocs and --key-space must be positive");
        std::process::exit(1);
    }
    tracing::info!(?args, "starting");

    let args = Arc::new(args);
    let arrived = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = create_mesh(args.nprocs)
        .into_iter()
        .map(|node| {
            let args = Arc::clone(&args);
            let arrived = Arc::clone(&arrived);
            thread::spawn(move || {
                let ctx = Context::new(node, ContextConfig::default())?;
                run_process(ctx, &args, &arrived)
            })
        })
        .collect();

    let mut slowest = Duration::ZERO;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(elapsed)) => slowest = slowest.max(elapsed),
            Ok(Err(e)) => {
                eprintln!("process {} failed: {}", rank, e);
                std::process::exit(1);
            }
            Err(_) => {
                eprintln!("process {} panicked", rank);
                std::process::exit(1);
            }
        }
    }

    let per_am = slowest.as_secs_f64() * 1e6 / args.num_ams.max(1) as f64;
    println!(
        "nprocs={} num_ams={} find_time={:.3}s latency={:.3}us/AM",
        args.nprocs,
        args.num_ams,
        slowest.as_secs_f64(),
        per_am
    );
}
