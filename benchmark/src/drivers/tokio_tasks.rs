use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use kv_async::{callback::CompletionReceiver, Error, SubsystemHandle};
use tracing::{debug, info};

use crate::{Args, ClientWork, Driver, DriverRunResult, StatsState, TABLE};

pub(crate) struct DriverTokioTasks {
    rt: tokio::runtime::Runtime,
}

impl DriverTokioTasks {
    pub fn new() -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        Self { rt }
    }
}

impl Driver for DriverTokioTasks {
    fn run(
        self: Box<Self>,
        args: Arc<Args>,
        system: Arc<SubsystemHandle>,
        works: Vec<ClientWork>,
        clients_ready: Arc<tokio::sync::Barrier>,
        stop: Arc<AtomicBool>,
        stats_state: Arc<StatsState>,
    ) -> DriverRunResult {
        let DriverTokioTasks { rt } = *self;

        rt.block_on(async move {
            let mut handles = Vec::new();
            for (i, work) in works.into_iter().enumerate() {
                let stop = Arc::clone(&stop);
                let stats_state = Arc::clone(&stats_state);
                let clients_ready = Arc::clone(&clients_ready);
                let system = Arc::clone(&system);
                let queue_depth = args.queue_depth.get();
                handles.push(tokio::spawn(async move {
                    clients_ready.wait().await;
                    let start = Instant::now();
                    client(i, &system, work, queue_depth, &stop, &stats_state).await;
                    start.elapsed()
                }));
            }
            // log which clients are still draining once stop is set
            let stopped_handles = Arc::new(
                (0..handles.len())
                    .map(|_| AtomicBool::new(false))
                    .collect::<Vec<_>>(),
            );
            let status_task = tokio::spawn({
                let stopped_handles = Arc::clone(&stopped_handles);
                let stop_clients = Arc::clone(&stop);
                async move {
                    loop {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        if !stop_clients.load(Ordering::Relaxed) {
                            debug!("waiting for clients to stop");
                            continue;
                        }
                        let not_stopped = stopped_handles
                            .iter()
                            .enumerate()
                            .filter(|(_, state)| !state.load(Ordering::Relaxed))
                            .map(|(i, _)| i)
                            .collect::<Vec<usize>>();
                        info!("clients not stopped: {not_stopped:?}");
                    }
                }
            });
            let mut client_run_times = Vec::new();
            for (i, handle) in handles.into_iter().enumerate() {
                let runtime = handle.await.unwrap();
                stopped_handles[i].store(true, Ordering::Relaxed);
                client_run_times.push(runtime);
            }
            status_task.abort();
            DriverRunResult { client_run_times }
        })
    }
}

struct InFlight {
    client: usize,
    submitted_at: HashMap<u64, Instant>,
}

impl InFlight {
    async fn reap_one(&mut self, completions: &mut CompletionReceiver, stats_state: &StatsState) {
        let done = completions
            .recv()
            .await
            .expect("the callback lives as long as the client");
        let latency = self
            .submitted_at
            .remove(&done.id)
            .map(|t| t.elapsed())
            .unwrap_or_default();
        stats_state.record_op(self.client, latency, super::is_failure(&done.result));
    }
}

#[tracing::instrument(skip_all, level = "trace", fields(client = %i))]
async fn client(
    i: usize,
    system: &SubsystemHandle,
    work: ClientWork,
    queue_depth: usize,
    stop: &AtomicBool,
    stats_state: &StatsState,
) {
    let (cb, mut completions) = kv_async::callback::channel();
    let mut in_flight = InFlight {
        client: i,
        submitted_at: HashMap::with_capacity(queue_depth),
    };
    while !stop.load(Ordering::Relaxed) {
        let ControlFlow::Continue(()) = work.ops_left.take_one_op() else {
            break;
        };
        while in_flight.submitted_at.len() >= queue_depth {
            in_flight.reap_one(&mut completions, stats_state).await;
        }
        let op = loop {
            match system.allocate(TABLE, "", Arc::clone(&cb)) {
                Ok(op) => break op,
                // other clients hold the pool; wait for our own ops instead of flushing
                Err(Error::AllocationExhausted { .. }) if !in_flight.submitted_at.is_empty() => {
                    in_flight.reap_one(&mut completions, stats_state).await;
                }
                Err(Error::AllocationExhausted { .. }) => tokio::task::yield_now().await,
                Err(e) => panic!("allocate: {e}"),
            }
        };
        let (next, key) = work.next_op();
        in_flight.submitted_at.insert(op.id(), Instant::now());
        work.submit(op, next, key);
    }
    while !in_flight.submitted_at.is_empty() {
        in_flight.reap_one(&mut completions, stats_state).await;
    }
    info!("Client {i} stopping");
}
