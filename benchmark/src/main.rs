use std::{
    collections::HashMap,
    num::{NonZeroU64, NonZeroUsize},
    ops::ControlFlow,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use clap::Parser;
use crossbeam_utils::CachePadded;
use drivers::{std_thread::DriverStdThread, tokio_tasks::DriverTokioTasks};
use hdrhistogram::Counter;
use itertools::Itertools;
use kv_async::{engine::mem::MemEngine, AsyncConfig, Error, OpHandle, Subsystem, SubsystemHandle};
use null_engine::NullEngine;
use rand::{Rng, RngCore};
use serde_with::serde_as;
use tracing::{error, info, warn};

mod drivers;
mod null_engine;

const TABLE: &str = "table:bench";

#[derive(serde::Serialize, clap::Parser, Clone)]
struct Args {
    num_clients: NonZeroU64,
    /// Distinct keys the clients pick from.
    key_space: NonZeroU64,
    value_size: NonZeroUsize,
    #[clap(long, default_value = "until-ctrl-c")]
    run_duration: RunDuration,
    #[clap(long, default_value = "4")]
    workers: NonZeroUsize,
    /// Ops a single client keeps in flight.
    #[clap(long, default_value = "32")]
    queue_depth: NonZeroUsize,
    #[clap(subcommand)]
    work_kind: WorkKind,
}

#[derive(Clone, serde::Serialize)]
enum RunDuration {
    UntilCtrlC,
    FixedDuration(Duration),
    FixedTotalOpCount(u64),
    FixedPerClientOpCount(u64),
}

fn parse_op_count(s: &str, suffix: &str) -> Result<u64, String> {
    let stripped = &s[..s.len() - suffix.len()];
    let (stripped, multiplier) = match stripped.strip_suffix("k-") {
        Some(rest) => (rest, 1000),
        None => match stripped.strip_suffix("m-") {
            Some(rest) => (rest, 1000 * 1000),
            None => (stripped.strip_suffix('-').unwrap_or(stripped), 1),
        },
    };
    match stripped.parse::<NonZeroU64>() {
        Ok(n) => Ok(n.get() * multiplier),
        Err(e) => Err(format!("invalid op count: {e}: {s:?}")),
    }
}

impl FromStr for RunDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "until-ctrl-c" => Ok(RunDuration::UntilCtrlC),
            x if x.ends_with("ops-total") => {
                parse_op_count(x, "ops-total").map(RunDuration::FixedTotalOpCount)
            }
            x if x.ends_with("ops-per-client") => {
                parse_op_count(x, "ops-per-client").map(RunDuration::FixedPerClientOpCount)
            }
            x => match humantime::parse_duration(x) {
                Ok(d) => Ok(RunDuration::FixedDuration(d)),
                Err(e) => Err(format!("invalid duration: {e}: {s:?}")),
            },
        }
    }
}

#[derive(Clone, Copy, clap::Subcommand, serde::Serialize)]
enum WorkKind {
    Put {
        #[clap(subcommand)]
        backend: BackendKind,
    },
    /// Searches over a preloaded key space.
    Search {
        #[clap(subcommand)]
        backend: BackendKind,
    },
    Mixed {
        read_percent: u8,
        #[clap(subcommand)]
        backend: BackendKind,
    },
}

impl WorkKind {
    fn backend(&self) -> &BackendKind {
        match self {
            WorkKind::Put { backend }
            | WorkKind::Search { backend }
            | WorkKind::Mixed { backend, .. } => backend,
        }
    }
}

#[derive(Clone, Copy, clap::Subcommand, serde::Serialize)]
enum BackendKind {
    Mem {
        #[clap(subcommand)]
        driver: DriverKind,
    },
    /// In-memory engine that sleeps before every cursor operation.
    Latency {
        micros: NonZeroU64,
        #[clap(subcommand)]
        driver: DriverKind,
    },
    /// Engine that does nothing; measures the subsystem's own overhead.
    Null {
        #[clap(subcommand)]
        driver: DriverKind,
    },
}

impl BackendKind {
    fn driver(&self) -> &DriverKind {
        match self {
            BackendKind::Mem { driver }
            | BackendKind::Latency { driver, .. }
            | BackendKind::Null { driver } => driver,
        }
    }
}

#[derive(Clone, Copy, clap::Subcommand, serde::Serialize)]
enum DriverKind {
    /// One OS thread per client, completions through a shared callback.
    StdThread,
    /// One tokio task per client, completions through `callback::channel`.
    TokioTasks,
}

struct StatsState {
    ops_in_last_second: Vec<CachePadded<AtomicU64>>,
    errors_in_last_second: Vec<CachePadded<AtomicU64>>,
    latencies_histo: Vec<CachePadded<Mutex<hdrhistogram::Histogram<u64>>>>,
}

impl StatsState {
    fn new(num_clients: usize) -> Self {
        StatsState {
            ops_in_last_second: (0..num_clients)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            errors_in_last_second: (0..num_clients)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            latencies_histo: (0..num_clients)
                .map(|_| CachePadded::new(Mutex::new(StatsState::make_latency_histogram())))
                .collect(),
        }
    }

    fn make_latency_histogram() -> hdrhistogram::Histogram<u64> {
        hdrhistogram::Histogram::new_with_bounds(1, 1_000_000_000, 3).unwrap()
    }

    fn record_op(&self, client_num: usize, latency: Duration, failed: bool) {
        self.ops_in_last_second[client_num].fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors_in_last_second[client_num].fetch_add(1, Ordering::Relaxed);
        }
        let mut h = self.latencies_histo[client_num].lock().unwrap();
        // saturate rather than lose outliers beyond the histogram bounds
        h.saturating_record(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX));
    }
}

trait Driver {
    fn run(
        self: Box<Self>,
        args: Arc<Args>,
        system: Arc<SubsystemHandle>,
        works: Vec<ClientWork>,
        clients_ready: Arc<tokio::sync::Barrier>,
        stop: Arc<AtomicBool>,
        stats_state: Arc<StatsState>,
    ) -> DriverRunResult;
}

struct DriverRunResult {
    client_run_times: Vec<Duration>,
}

const MONITOR_PERIOD: Duration = Duration::from_secs(1);

fn main() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter({
            tracing_subscriber::EnvFilter::try_from_default_env()
                .expect("must set RUST_LOG variable")
        })
        .init();

    kv_async::env_tunables::assert_no_unknown_env_vars();

    let args: Arc<Args> = Arc::new(Args::parse());

    let stop_driver = Arc::new(AtomicBool::new(false));
    let (stop_monitor_tx, mut stop_monitor_rx) = tokio::sync::oneshot::channel::<DriverRunResult>();

    let system = Arc::new(setup_system(&args));
    if let WorkKind::Search { .. } | WorkKind::Mixed { .. } = args.work_kind {
        preload(&args, &system);
    }

    let works = setup_client_works(&args);
    let driver = setup_driver(args.work_kind.backend().driver());
    let stats_state = Arc::new(StatsState::new(works.len()));

    match args.run_duration {
        RunDuration::UntilCtrlC => {}
        RunDuration::FixedDuration(duration) => {
            let stop_driver = Arc::clone(&stop_driver);
            std::thread::spawn(move || {
                std::thread::sleep(duration);
                info!("configured runtime expired, setting stop flag");
                stop_driver.store(true, Ordering::Relaxed);
            });
        }
        RunDuration::FixedTotalOpCount(_) | RunDuration::FixedPerClientOpCount(_) => {
            // done in setup_client_works
        }
    }

    ctrlc::set_handler({
        let stop_driver = Arc::clone(&stop_driver);
        move || {
            info!("ctrl-c, setting stop flag");
            if stop_driver.fetch_or(true, Ordering::Relaxed) {
                error!("stop flag was already set, aborting");
                std::process::abort();
            } else {
                info!("first ctrl-c, stop flag set");
            }
        }
    })
    .unwrap();

    let clients_and_monitor_ready = Arc::new(tokio::sync::Barrier::new(works.len() + 1));

    let monitor = std::thread::Builder::new()
        .name("monitor".to_owned())
        .spawn({
            let stats_state = Arc::clone(&stats_state);
            let args = Arc::clone(&args);
            let clients_and_monitor_ready = Arc::clone(&clients_and_monitor_ready);

            struct AggregatedStats {
                start: Instant,
                op_count: u64,
                error_count: u64,
                value_size: u64,
                latencies_histo: hdrhistogram::Histogram<u64>,
            }
            const LATENCY_PERCENTILES: [f64; 6] = [50.0, 90.0, 99.0, 99.9, 99.99, 99.999];
            fn latency_percentiles_serialize<S>(
                values: &[f64; LATENCY_PERCENTILES.len()],
                serializer: S,
            ) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serde::Serialize::serialize(
                    &LATENCY_PERCENTILES
                        .iter()
                        .map(|p| format!("p{p}"))
                        .zip(values.iter().cloned())
                        .collect::<HashMap<_, _>>(),
                    serializer,
                )
            }
            #[serde_as]
            #[derive(serde::Serialize)]
            struct AggregatedStatsSummary {
                #[serde_as(as = "serde_with::DurationMicroSeconds")]
                elapsed_us: Duration,
                throughput_ops: f64,
                throughput_value_mibps: f64,
                errors: u64,
                latency_min_us: f64,
                latency_mean_us: f64,
                latency_max_us: f64,
                #[serde(serialize_with = "latency_percentiles_serialize")]
                latency_percentiles: [f64; LATENCY_PERCENTILES.len()],
            }

            impl std::fmt::Display for AggregatedStatsSummary {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(
                        f,
                        "t{:.2} TP: ops={:.0} values={:.2}MiB/s errors={} LAT(us): min={:.0} mean={:.0} max={:.0} {}",
                        self.elapsed_us.as_secs_f64(),
                        self.throughput_ops,
                        self.throughput_value_mibps,
                        self.errors,
                        self.latency_min_us,
                        self.latency_mean_us,
                        self.latency_max_us,
                        self.latency_percentiles
                            .iter()
                            .zip(LATENCY_PERCENTILES.iter())
                            .map(|(v, p)| format!("p{p}={v:.0}"))
                            .join(" "),
                    )
                }
            }
            impl AggregatedStats {
                fn new(value_size: u64) -> Self {
                    Self {
                        start: Instant::now(),
                        op_count: 0,
                        error_count: 0,
                        value_size,
                        latencies_histo: StatsState::make_latency_histogram(),
                    }
                }
                fn reset(&mut self, start: Instant) {
                    self.start = start;
                    self.op_count = 0;
                    self.error_count = 0;
                    self.latencies_histo.clear();
                }
                fn summary_since_start(&self) -> AggregatedStatsSummary {
                    let elapsed = self.start.elapsed();
                    let elapsed_secs = elapsed.as_secs_f64();
                    let histo = &self.latencies_histo;
                    AggregatedStatsSummary {
                        elapsed_us: elapsed,
                        throughput_ops: (self.op_count as f64) / elapsed_secs,
                        throughput_value_mibps: (self.op_count as f64) * (self.value_size as f64)
                            / ((1 << 20) as f64)
                            / elapsed_secs,
                        errors: self.error_count,
                        latency_min_us: histo.min().as_f64() / 1000.0,
                        latency_mean_us: histo.mean() / 1000.0,
                        latency_max_us: histo.max().as_f64() / 1000.0,
                        latency_percentiles: LATENCY_PERCENTILES.map(|p| {
                            histo.value_at_percentile(p).as_f64() / 1000.0
                        }),
                    }
                }
            }

            #[derive(serde::Serialize)]
            struct BenchmarkOutput {
                args: Args,
                sorted_per_client_total_ops: Vec<u64>,
                sorted_per_client_runtimes_secs: Vec<f64>,
                totals: Vec<AggregatedStatsSummary>,
            }

            move || {
                let mut per_client_total_ops = HashMap::new();
                let value_size = args.value_size.get() as u64;
                let mut total = AggregatedStats::new(value_size);
                let mut total_summaries = Vec::new();
                let mut this_round = AggregatedStats::new(value_size);

                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap();

                rt.block_on(clients_and_monitor_ready.wait());

                let mut ticker = rt.block_on(async move { tokio::time::interval(MONITOR_PERIOD) });

                let mut exit: Option<DriverRunResult> = None;
                while exit.is_none() {
                    this_round.reset(Instant::now());
                    rt.block_on(async {
                        let ticker = &mut ticker;
                        tokio::select! {
                            _ = ticker.tick() => {}
                            msg = &mut stop_monitor_rx => {
                                exit = Some(msg.unwrap());
                            }
                        };
                    });

                    for (client, counter) in stats_state.ops_in_last_second.iter().enumerate() {
                        let ops = counter.swap(0, Ordering::Relaxed);
                        *per_client_total_ops.entry(client).or_insert(0) += ops;
                        this_round.op_count += ops;
                        total.op_count += ops;
                    }
                    for counter in &stats_state.errors_in_last_second {
                        let errors = counter.swap(0, Ordering::Relaxed);
                        this_round.error_count += errors;
                        total.error_count += errors;
                    }
                    for h in &stats_state.latencies_histo {
                        let mut h = h.lock().unwrap();
                        total.latencies_histo += &*h;
                        this_round.latencies_histo += &*h;
                        h.clear();
                    }

                    let this_round_summary = this_round.summary_since_start();
                    let total_summary = total.summary_since_start();

                    info!("{this_round_summary}");
                    info!("{total_summary}");

                    total_summaries.push(total_summary);
                }
                let exit = exit.unwrap();

                info!("monitor shutting down");

                // per-client totals show whether clients got a fair share of the pool
                let sorted_per_client_total_ops =
                    per_client_total_ops.values().cloned().sorted().collect();
                let sorted_per_client_runtimes_secs = exit
                    .client_run_times
                    .into_iter()
                    .sorted()
                    .map(|d| d.as_secs_f64())
                    .collect();
                let output = BenchmarkOutput {
                    args: args.as_ref().clone(),
                    sorted_per_client_total_ops,
                    sorted_per_client_runtimes_secs,
                    totals: total_summaries,
                };
                let outpath = std::path::PathBuf::from("benchmark.output.json");
                info!("writing results to {:?}", outpath);
                std::fs::write(&outpath, serde_json::to_string(&output).unwrap()).unwrap();

                let total_summary = total.summary_since_start();
                info!("total: {}", total_summary);
            }
        })
        .unwrap();

    let res = driver.run(
        Arc::clone(&args),
        Arc::clone(&system),
        works,
        clients_and_monitor_ready,
        stop_driver,
        stats_state,
    );
    stop_monitor_tx
        .send(res)
        .ok()
        .expect("monitor must not exit by itself");
    monitor.join().unwrap();

    if let Err(e) = system.flush() {
        warn!("final flush failed: {e}");
    }
    system.shutdown();
    info!(metrics = ?kv_async::metrics::global(), "subsystem stopped");
}

fn setup_system(args: &Args) -> SubsystemHandle {
    let engine: Arc<dyn kv_async::engine::Engine> = match args.work_kind.backend() {
        BackendKind::Mem { .. } => {
            let engine = MemEngine::new();
            engine.create_table(TABLE, "S", "S").unwrap();
            Arc::new(engine)
        }
        BackendKind::Latency { micros, .. } => {
            let engine = MemEngine::with_latency(Duration::from_micros(micros.get()));
            engine.create_table(TABLE, "S", "S").unwrap();
            Arc::new(engine)
        }
        BackendKind::Null { .. } => Arc::new(NullEngine),
    };
    let config = AsyncConfig {
        worker_count: args.workers.get(),
        ..AsyncConfig::default()
    };
    Subsystem::start(engine, config).unwrap()
}

/// Put every key of the key space so searches find something.
fn preload(args: &Args, system: &SubsystemHandle) {
    info!(keys = args.key_space.get(), "preloading");
    let start = Instant::now();
    let cb = kv_async::callback::from_fn(|_, result| {
        if let Err(e) = result {
            error!("preload put failed: {e}");
        }
    });
    let value = random_value(args.value_size.get());
    for n in 0..args.key_space.get() {
        let mut op = allocate_or_flush(system, &cb);
        op.set_key(key(n));
        op.set_value(value.clone());
        op.put().unwrap();
    }
    system.flush().unwrap();
    info!(elapsed = ?start.elapsed(), "preload done");
}

/// Allocate, flushing whenever the pool is exhausted.
fn allocate_or_flush(system: &SubsystemHandle, cb: &Arc<dyn kv_async::Callback>) -> OpHandle {
    loop {
        match system.allocate(TABLE, "", Arc::clone(cb)) {
            Ok(op) => return op,
            Err(Error::AllocationExhausted { .. }) => system.flush().unwrap(),
            Err(e) => panic!("allocate: {e}"),
        }
    }
}

fn key(n: u64) -> Bytes {
    Bytes::from(format!("key{n:012}"))
}

fn random_value(size: usize) -> Bytes {
    let mut value = vec![0; size];
    rand::thread_rng().fill_bytes(&mut value);
    Bytes::from(value)
}

#[derive(Clone)]
struct OpsLeft(Option<Arc<AtomicI64>>);

impl OpsLeft {
    fn take_one_op(&self) -> ControlFlow<()> {
        match &self.0 {
            None => (),
            Some(ops_left) => {
                let ops_left = ops_left.fetch_sub(1, Ordering::Relaxed);
                if ops_left <= 0 {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// What a client submits next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextOp {
    Put,
    Search,
}

struct ClientWork {
    ops_left: OpsLeft,
    key_space: u64,
    value: Bytes,
    read_percent: u8,
}

impl ClientWork {
    fn next_op(&self) -> (NextOp, Bytes) {
        let mut rng = rand::thread_rng();
        let kind = if rng.gen_range(0..100) < self.read_percent {
            NextOp::Search
        } else {
            NextOp::Put
        };
        (kind, key(rng.gen_range(0..self.key_space)))
    }

    /// Populate `op` and submit it.
    fn submit(&self, mut op: OpHandle, next: NextOp, key: Bytes) {
        op.set_key(key);
        let submitted = match next {
            NextOp::Put => {
                op.set_value(self.value.clone());
                op.put()
            }
            NextOp::Search => op.search(),
        };
        if let Err(rejected) = submitted {
            panic!("submit {next:?}: {rejected}");
        }
    }
}

fn setup_client_works(args: &Args) -> Vec<ClientWork> {
    let mut fixed_total_op_count_ops_left = None;
    let mut get_ops_left_for_client = || match args.run_duration {
        RunDuration::UntilCtrlC | RunDuration::FixedDuration(_) => OpsLeft(None),
        RunDuration::FixedTotalOpCount(total) => {
            let shared = fixed_total_op_count_ops_left
                .get_or_insert_with(|| Arc::new(AtomicI64::new(i64::try_from(total).unwrap())));
            OpsLeft(Some(Arc::clone(shared)))
        }
        RunDuration::FixedPerClientOpCount(per_client) => OpsLeft(Some(Arc::new(
            AtomicI64::new(i64::try_from(per_client).unwrap()),
        ))),
    };
    let read_percent = match args.work_kind {
        WorkKind::Put { .. } => 0,
        WorkKind::Search { .. } => 100,
        WorkKind::Mixed { read_percent, .. } => read_percent.min(100),
    };
    (0..args.num_clients.get())
        .map(|_| ClientWork {
            ops_left: get_ops_left_for_client(),
            key_space: args.key_space.get(),
            value: random_value(args.value_size.get()),
            read_percent,
        })
        .collect()
}

fn setup_driver(driver_kind: &DriverKind) -> Box<dyn Driver> {
    match driver_kind {
        DriverKind::StdThread => Box::new(DriverStdThread {}),
        DriverKind::TokioTasks => Box::new(DriverTokioTasks::new()),
    }
}
