use clap::{arg, Parser, ValueEnum};
use crossbeam_utils::CachePadded;
use rand::{Rng, SeedableRng};
use refcounted::{make_counted, IntrusivePtr, RefCount, RefCounted};
use serde::Serialize;
use std::{
    hint::black_box,
    io::Write,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Barrier,
    },
    time::{Duration, Instant},
};

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
struct Cli {
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Duration of the measurement in milliseconds.
    #[arg(long, default_value_t = 2000)]
    duration: u64,

    /// Size of the payload carried by each object in bytes.
    #[arg(long, default_value_t = 8)]
    payload: usize,

    /// Number of pointers each thread keeps in the mixed workload. Must be
    /// at least 1.
    #[arg(
        long,
        default_value_t = 16,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..),
    )]
    slots: usize,

    /// Interval between progress reports in milliseconds.
    #[arg(long, default_value_t = 500)]
    report_interval: u64,

    #[arg(long, value_enum, default_value_t = WorkloadKind::CloneDrop)]
    workload: WorkloadKind,

    #[arg(long, required_if_eq("workload", "mixed"))]
    read_proportion: Option<f64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WorkloadKind {
    /// Every thread clones and drops a pointer to the same object.
    CloneDrop,
    /// Every thread creates and destroys its own objects.
    Alloc,
    /// Threads read through, share and release a set of pointers to the same
    /// object.
    Mixed,
}

struct Payload {
    rc: RefCount,
    data: Box<[u8]>,
}

impl Payload {
    fn new(size: usize) -> Self {
        Self {
            rc: RefCount::new(),
            data: vec![0; size].into_boxed_slice(),
        }
    }
}

unsafe impl RefCounted for Payload {
    fn ref_count(&self) -> &RefCount {
        &self.rc
    }
}

struct State {
    root: IntrusivePtr<Payload>,
    barrier: Barrier,
    is_running: AtomicBool,
    ops: Vec<CachePadded<AtomicU64>>,
}

impl State {
    fn total_ops(&self) -> u64 {
        self.ops.iter().map(|ops| ops.load(Ordering::Relaxed)).sum()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let read_proportion = cli.read_proportion.unwrap_or(0.0).clamp(0.0, 1.0);
    let state = Arc::new(State {
        root: make_counted(Payload::new(cli.payload)),
        barrier: Barrier::new(cli.threads + 1),
        is_running: true.into(),
        ops: (0..cli.threads).map(|_| Default::default()).collect(),
    });

    #[cfg(feature = "affinity")]
    let core_ids = core_affinity::get_core_ids().unwrap();
    #[cfg(feature = "affinity")]
    assert!(core_ids.len() >= cli.threads);

    log::info!("Spawning {} worker threads", cli.threads);
    let workers: Vec<_> = (0..cli.threads)
        .map(|i| {
            #[cfg(feature = "affinity")]
            let core_id = core_ids[i];
            let state = state.clone();
            let workload = cli.workload;
            let payload = cli.payload;
            let num_slots = cli.slots;
            std::thread::spawn(move || {
                #[cfg(feature = "affinity")]
                assert!(core_affinity::set_for_current(core_id));
                let ops = &state.ops[i];
                let mut rng = rand::rngs::SmallRng::from_entropy();
                let mut slots = vec![IntrusivePtr::<Payload>::null(); num_slots];

                state.barrier.wait();
                while state.is_running.load(Ordering::Relaxed) {
                    match workload {
                        WorkloadKind::CloneDrop => {
                            let copy = state.root.clone();
                            black_box(&copy);
                        }
                        WorkloadKind::Alloc => {
                            let object = make_counted(Payload::new(payload));
                            black_box(object.data.len());
                        }
                        WorkloadKind::Mixed => {
                            let slot = &mut slots[rng.gen_range(0..num_slots)];
                            if rng.gen_bool(read_proportion) {
                                black_box(slot.get().map(|object| object.data.len()));
                            } else if slot.is_null() {
                                slot.clone_from(&state.root);
                            } else {
                                slot.reset();
                            }
                        }
                    }
                    ops.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    log::info!("Start");
    state.barrier.wait();

    let start = Instant::now();
    let deadline = start + Duration::from_millis(cli.duration);
    let interval = Duration::from_millis(cli.report_interval.max(1));
    let mut last_report = (start, 0);
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(interval.min(deadline - now));

        let (prev_time, prev_ops) = last_report;
        let now = Instant::now();
        let ops = state.total_ops();
        let rate = (ops - prev_ops) as f64 / (now - prev_time).as_secs_f64();
        log::info!("{:.3?}\t{:.0} ops/s", now - start, rate);
        last_report = (now, ops);
    }
    state.is_running.store(false, Ordering::SeqCst);
    let elapsed = start.elapsed();

    for worker in workers {
        worker.join().unwrap();
    }

    let ops = state.total_ops();
    let ops_per_sec = (ops as f64 / elapsed.as_secs_f64()) as u64;
    log::info!("Finished");
    log::info!("Elapsed\t{:.3?}", elapsed);
    log::info!("Operations\t{}", ops);
    log::info!("Ops/s\t{}", ops_per_sec);

    // Every worker has released its pointers.
    assert!(state.root.unique());

    #[derive(Serialize)]
    struct Summary {
        etime: u64,
        ops: u64,
        ops_per_sec: u64,
        workload: String,
        threads: usize,
        payload: usize,
        read_proportion: Option<f64>,
    }
    let mut stdout = std::io::stdout().lock();
    serde_json::ser::to_writer_pretty(
        &mut stdout,
        &Summary {
            etime: elapsed.as_millis() as u64,
            ops,
            ops_per_sec,
            workload: format!("{:?}", cli.workload),
            threads: cli.threads,
            payload: cli.payload,
            read_proportion: cli.read_proportion,
        },
    )?;
    stdout.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Cli, WorkloadKind};
    use clap::{CommandFactory, Parser};

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rejects_zero_slots() {
        let args = ["bench", "--workload", "mixed", "--read-proportion", "0.5"];
        assert!(Cli::try_parse_from(args.iter().chain(&["--slots", "0"])).is_err());

        let cli = Cli::try_parse_from(args.iter().chain(&["--slots", "1"])).unwrap();
        assert_eq!(cli.slots, 1);
        assert!(matches!(cli.workload, WorkloadKind::Mixed));
        assert_eq!(Cli::try_parse_from(args).unwrap().slots, 16);
    }
}
