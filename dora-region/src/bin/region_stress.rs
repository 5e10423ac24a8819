use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dora_region::flags::{parse_mem_size, MemSize};
use dora_region::{
    Address, AllocError, Class, GcReason, Heap, Mutator, RegionFlags, RootSet,
};

#[derive(Parser)]
#[command(
    name = "region-stress",
    version,
    about = "Allocates object graphs in nested regions while the collector runs"
)]
struct Cli {
    /// Number of mutator threads
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Top-level regions entered by every thread
    #[arg(long, default_value_t = 2000)]
    iterations: usize,

    /// Objects allocated per region
    #[arg(long, default_value_t = 200)]
    objects: usize,

    /// Maximum region nesting depth
    #[arg(long, default_value_t = 3)]
    depth: usize,

    /// Probability of entering a nested region after an allocation
    #[arg(long, default_value_t = 0.01)]
    nest_rate: f64,

    /// Probability that a region's list escapes into a global
    #[arg(long, default_value_t = 0.05)]
    escape_rate: f64,

    /// Probability that an allocation exceeds the large object threshold
    #[arg(long, default_value_t = 0.001)]
    large_rate: f64,

    /// Number of global root slots
    #[arg(long, default_value_t = 64)]
    globals: usize,

    /// Milliseconds between GC cycles
    #[arg(long, default_value_t = 5)]
    gc_interval: u64,

    /// Objects traced per concurrent mark step
    #[arg(long, default_value_t = 256)]
    mark_budget: usize,

    /// Seed for the workload
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Allocate everything in the general heap
    #[arg(long)]
    disable_regions: bool,

    #[arg(long, value_parser = parse_mem_size)]
    block_size: Option<MemSize>,

    #[arg(long, value_parser = parse_mem_size)]
    line_size: Option<MemSize>,

    #[arg(long, value_parser = parse_mem_size)]
    large_object_threshold: Option<MemSize>,

    #[arg(long, value_parser = parse_mem_size)]
    max_region_memory: Option<MemSize>,

    #[arg(long)]
    gc_workers: Option<usize>,

    #[arg(long)]
    gc_verbose: bool,

    #[arg(long)]
    gc_verify: bool,

    #[arg(long)]
    profile: bool,
}

impl Cli {
    fn flags(&self) -> RegionFlags {
        let mut flags = RegionFlags::from_env().unwrap_or_else(|err| {
            error!("ignoring invalid region options: {}", err);
            RegionFlags::default()
        });

        flags.enabled = !self.disable_regions;

        if let Some(size) = self.block_size {
            flags.block_size = *size;
        }

        if let Some(size) = self.line_size {
            flags.line_size = *size;
        }

        if let Some(size) = self.large_object_threshold {
            flags.large_object_threshold = *size;
        }

        if let Some(size) = self.max_region_memory {
            flags.max_region_memory = *size;
        }

        if let Some(workers) = self.gc_workers {
            flags.gc_workers = workers;
        }

        flags.gc_verbose |= self.gc_verbose;
        flags.gc_verify |= self.gc_verify;
        flags.profile |= self.profile;
        flags
    }
}

struct Workload<'a> {
    cli: &'a Cli,
    globals: &'a RootSet,
    node: &'static Class,
    large: &'static Class,
    rng: StdRng,
    escaped: usize,
}

impl<'a> Workload<'a> {
    /// Builds a list in a fresh region. The list may escape into `outer`,
    /// a node of the enclosing region, or into a global.
    fn run(
        &mut self,
        mutator: &mut Mutator,
        depth: usize,
        outer: Address,
    ) -> Result<(), AllocError> {
        mutator.enter_region(|m| {
            let mut head = Address::null();

            for _ in 0..self.cli.objects {
                let class = if self.rng.gen_bool(self.cli.large_rate) {
                    self.large
                } else {
                    self.node
                };

                let node = m.allocate(class)?;
                m.write_ref(node, 1, head);
                head = node;

                if depth < self.cli.depth && self.rng.gen_bool(self.cli.nest_rate) {
                    self.run(m, depth + 1, head)?;
                }
            }

            if outer.is_non_null() && self.rng.gen_bool(0.5) {
                // stores into the older region fade the list
                m.write_ref(outer, 2, head);
            } else if self.rng.gen_bool(self.cli.escape_rate) {
                let idx = self.rng.gen_range(0..self.globals.len());
                m.write_slot(self.globals.slot(idx), head);
                self.escaped += 1;
            }

            Ok(())
        })
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.gc_verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let flags = cli.flags();
    let large_size = flags.large_object_threshold + 2 * std::mem::size_of::<usize>();

    let heap = match Heap::new(flags) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("region-stress: {}", err);
            process::exit(1);
        }
    };

    let globals = RootSet::new(cli.globals.max(1));
    let node = Class::with_ref_fields("Node", 2);
    let large = Class::new("Large", large_size, &[1, 2]);

    // Workers hold this in read mode for each top-level region, a finished
    // iteration keeps all live objects reachable from the globals.
    let gate: RwLock<()> = RwLock::new(());
    let done = AtomicBool::new(false);
    let failures = AtomicUsize::new(0);
    let escaped = AtomicUsize::new(0);
    let cycles = AtomicUsize::new(0);

    thread::scope(|scope| {
        let workers: Vec<_> = (0..cli.threads.max(1))
            .map(|id| {
                let heap = heap.clone();
                let cli = &cli;
                let globals = &globals;
                let gate = &gate;
                let failures = &failures;
                let escaped = &escaped;

                scope.spawn(move || {
                    let mut mutator = Mutator::new(heap);
                    let mut workload = Workload {
                        cli,
                        globals,
                        node,
                        large,
                        rng: StdRng::seed_from_u64(cli.seed.wrapping_add(id as u64)),
                        escaped: 0,
                    };

                    for _ in 0..cli.iterations {
                        let _gate = gate.read();

                        if let Err(err) = workload.run(&mut mutator, 0, Address::null()) {
                            error!("thread {}: {}", id, err);
                            failures.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }

                    escaped.fetch_add(workload.escaped, Ordering::Relaxed);
                })
            })
            .collect();

        scope.spawn(|| {
            let roots = globals.slots();

            while !done.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(cli.gc_interval));

                if !heap.start_cycle(&roots, GcReason::Stress) {
                    continue;
                }

                while heap.mark_step(cli.mark_budget) > 0 {}

                let _gate = gate.write();
                heap.finish_cycle(&roots);
                cycles.fetch_add(1, Ordering::Relaxed);
            }
        });

        for worker in workers {
            if worker.join().is_err() {
                failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        done.store(true, Ordering::Release);
    });

    let summary = heap.collect(&globals.slots(), GcReason::ForceCollect);
    cycles.fetch_add(1, Ordering::Relaxed);

    info!(
        "final cycle {}: {} lines released, {} blocks freed",
        summary.cycle, summary.sweep.lines_released, summary.sweep.blocks_freed
    );

    let stats = heap.stats();
    println!("region-stress: {} GC cycles", cycles.load(Ordering::Relaxed));
    println!("region-stress: {} lists escaped", escaped.load(Ordering::Relaxed));
    println!(
        "region-stress: {} arenas, {} blocks carved, {} free, {} recyclable",
        stats.arenas, stats.carved_blocks, stats.free_blocks, stats.recyclable_blocks
    );
    println!("{}", heap.diagnostics().report());

    if failures.load(Ordering::Relaxed) > 0 {
        process::exit(1);
    }
}
