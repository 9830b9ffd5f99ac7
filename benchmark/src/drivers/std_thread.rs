use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Instant,
};

use kv_async::{Callback, CompletedOp, OpResult, SubsystemHandle};
use tracing::info;

use crate::{Args, ClientWork, Driver, DriverRunResult, StatsState};

pub(crate) struct DriverStdThread {}

impl Driver for DriverStdThread {
    fn run(
        self: Box<Self>,
        args: Arc<Args>,
        system: Arc<SubsystemHandle>,
        works: Vec<ClientWork>,
        clients_ready: Arc<tokio::sync::Barrier>,
        stop: Arc<AtomicBool>,
        stats_state: Arc<StatsState>,
    ) -> DriverRunResult {
        std::thread::scope(|scope| {
            assert_eq!(works.len(), args.num_clients.get() as usize);
            let mut jhs = Vec::with_capacity(works.len());
            for (i, work) in works.into_iter().enumerate() {
                let stop = Arc::clone(&stop);
                let stats_state = Arc::clone(&stats_state);
                let system = Arc::clone(&system);
                let clients_ready = Arc::clone(&clients_ready);
                let queue_depth = args.queue_depth.get();
                jhs.push(scope.spawn(move || {
                    tokio::runtime::Builder::new_current_thread()
                        .build()
                        .unwrap()
                        .block_on(clients_ready.wait());
                    let start = Instant::now();
                    client(i, &system, work, queue_depth, &stop, stats_state);
                    start.elapsed()
                }));
            }
            let client_run_times = jhs.into_iter().map(|jh| jh.join().unwrap()).collect();
            DriverRunResult { client_run_times }
        })
    }
}

/// Completion side of one client thread.
struct ClientCompletions {
    client: usize,
    stats_state: Arc<StatsState>,
    submitted_at: Mutex<HashMap<u64, Instant>>,
    in_flight: Mutex<usize>,
    in_flight_changed: Condvar,
}

impl Callback for ClientCompletions {
    fn notify(&self, op: &CompletedOp<'_>, result: OpResult) {
        let submitted_at = self.submitted_at.lock().unwrap().remove(&op.id());
        let latency = submitted_at.map(|t| t.elapsed()).unwrap_or_default();
        self.stats_state
            .record_op(self.client, latency, super::is_failure(&result));
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight -= 1;
        self.in_flight_changed.notify_one();
    }
}

impl ClientCompletions {
    fn submitting(&self, id: u64) {
        self.submitted_at.lock().unwrap().insert(id, Instant::now());
        *self.in_flight.lock().unwrap() += 1;
    }

    fn wait_below(&self, limit: usize) {
        let in_flight = self.in_flight.lock().unwrap();
        let _in_flight = self
            .in_flight_changed
            .wait_while(in_flight, |n| *n >= limit)
            .unwrap();
    }
}

fn client(
    i: usize,
    system: &SubsystemHandle,
    work: ClientWork,
    queue_depth: usize,
    stop: &AtomicBool,
    stats_state: Arc<StatsState>,
) {
    info!("Client {i} starting");
    let completions = Arc::new(ClientCompletions {
        client: i,
        stats_state,
        submitted_at: Mutex::new(HashMap::new()),
        in_flight: Mutex::new(0),
        in_flight_changed: Condvar::new(),
    });
    let cb: Arc<dyn Callback> = completions.clone();
    while !stop.load(Ordering::Relaxed) {
        let ControlFlow::Continue(()) = work.ops_left.take_one_op() else {
            break;
        };
        completions.wait_below(queue_depth);
        let op = crate::allocate_or_flush(system, &cb);
        let (next, key) = work.next_op();
        completions.submitting(op.id());
        work.submit(op, next, key);
    }
    completions.wait_below(1);
    info!("Client {i} stopping");
}
