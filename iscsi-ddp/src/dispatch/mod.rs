//! Receive dispatch pool.
//!
//! A fixed set of worker threads, each with its own run list of active
//! connections. A connection is pinned to one worker when registered; the
//! first PDU on an idle connection puts it on that worker's run list, and the
//! worker drains it into the upper layer. PDUs that arrive mid-drain send the
//! connection back to the tail of the same run list, so per-connection order
//! holds without any cross-worker coordination.

mod connection;

pub use connection::{PduSink, RxConnection};

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::config::DispatchConfig;
use crate::error::Error;
use connection::Drain;

/// Upper bound on the worker count picked from the CPU count.
pub const MAX_WORKERS: usize = 32;

/// Run list entry.
pub(crate) enum Job {
    Drain(Arc<dyn Drain>),
    Stop,
}

/// Lifecycle of a dispatch worker.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Draining its run list.
    Running = 0,
    /// Run list empty, blocked waiting for work.
    Sleeping = 1,
    /// Stop received, finishing what is queued.
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Running,
            1 => WorkerState::Sleeping,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Set once shutdown begins. Enqueue holds the read side across its run
/// list send, so every accepted activation lands ahead of `Stop`.
pub(crate) type StopGate = Arc<RwLock<bool>>;

struct WorkerHandle {
    run_list: Sender<Job>,
    /// Receiver side kept for the post-shutdown leftover check.
    leftover: Receiver<Job>,
    state: Arc<AtomicU8>,
}

/// Pool of receive dispatch workers for one adapter.
///
/// Dropping the pool shuts it down.
pub struct DispatchPool {
    workers: Vec<WorkerHandle>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    ports: usize,
    rr: AtomicUsize,
    stopping: StopGate,
}

impl DispatchPool {
    /// Spawn the workers.
    pub fn start(config: &DispatchConfig) -> Result<Self, Error> {
        if config.ports == 0 {
            return Err(Error::Config("dispatch.ports must be > 0".into()));
        }
        let count = if config.workers == 0 {
            num_cpus().min(MAX_WORKERS)
        } else {
            config.workers
        };

        let mut pool = DispatchPool {
            workers: Vec::with_capacity(count),
            threads: Mutex::new(Vec::with_capacity(count)),
            ports: config.ports as usize,
            rr: AtomicUsize::new(0),
            stopping: Arc::new(RwLock::new(false)),
        };

        // On a spawn failure, dropping `pool` stops the workers already running.
        for id in 0..count {
            let (tx, rx) = crossbeam_channel::unbounded();
            let state = Arc::new(AtomicU8::new(WorkerState::Running as u8));
            let requeue = tx.clone();
            let worker_rx = rx.clone();
            let worker_state = state.clone();
            let handle = thread::Builder::new()
                .name(format!("ddp-rx-{id}"))
                .spawn(move || run_worker(id, worker_rx, requeue, worker_state))
                .map_err(Error::Io)?;
            pool.workers.push(WorkerHandle {
                run_list: tx,
                leftover: rx,
                state,
            });
            pool.threads.get_mut().push(handle);
        }

        tracing::info!(workers = count, ports = pool.ports, "receive dispatch started");
        Ok(pool)
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Register a connection on `port`, pinning it to a worker.
    pub fn register<S: PduSink>(
        &self,
        id: u64,
        port: u8,
        sink: S,
    ) -> Result<Arc<RxConnection<S>>, Error> {
        if *self.stopping.read() {
            return Err(Error::PoolStopped);
        }
        let worker = self.select_worker(port);
        tracing::debug!(conn = id, port, worker, "connection registered");
        Ok(Arc::new(RxConnection::new(
            id,
            worker,
            sink,
            self.workers[worker].run_list.clone(),
            self.stopping.clone(),
        )))
    }

    /// Each port owns a band of `workers / ports` workers, used round-robin.
    /// With more ports than workers every worker serves every port.
    fn select_worker(&self, port: u8) -> usize {
        let workers = self.workers.len();
        let rr = self.rr.fetch_add(1, Ordering::Relaxed);
        let band = workers / self.ports;
        if band > 0 {
            (port as usize % self.ports) * band + rr % band
        } else {
            rr % workers
        }
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers
            .iter()
            .map(|w| WorkerState::from_u8(w.state.load(Ordering::Acquire)))
            .collect()
    }

    /// Stop every worker and wait for it to exit. Work queued before the
    /// call is still delivered. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut stopping = self.stopping.write();
            if *stopping {
                return;
            }
            *stopping = true;
        }
        for worker in &self.workers {
            let _ = worker.run_list.send(Job::Stop);
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("dispatch worker panicked");
            }
        }

        let stranded = self.drain_leftovers();
        debug_assert_eq!(stranded, 0, "connections left on a stopped run list");
        tracing::info!(workers = self.workers.len(), "receive dispatch stopped");
    }

    /// Deliver anything still on a run list after the workers exited.
    /// Returns how many connections were found.
    fn drain_leftovers(&self) -> usize {
        let mut stranded = 0;
        for (id, worker) in self.workers.iter().enumerate() {
            while let Ok(job) = worker.leftover.try_recv() {
                if let Job::Drain(conn) = job {
                    stranded += 1;
                    tracing::error!(worker = id, conn = conn.id(), "connection enqueued after stop");
                    while conn.drain() {}
                }
            }
        }
        stranded
    }

    /// Connections waiting on run lists, `Stop` markers included.
    pub fn queued(&self) -> usize {
        self.workers.iter().map(|w| w.run_list.len()).sum()
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(id: usize, rx: Receiver<Job>, requeue: Sender<Job>, state: Arc<AtomicU8>) {
    let set = |s: WorkerState| state.store(s as u8, Ordering::Release);
    tracing::debug!(worker = id, "dispatch worker started");

    loop {
        let job = match rx.try_recv() {
            Ok(job) => job,
            Err(TryRecvError::Empty) => {
                set(WorkerState::Sleeping);
                let Ok(job) = rx.recv() else {
                    break;
                };
                set(WorkerState::Running);
                job
            }
            Err(TryRecvError::Disconnected) => break,
        };
        match job {
            Job::Drain(conn) => {
                if conn.drain() {
                    let _ = requeue.send(Job::Drain(conn));
                }
            }
            Job::Stop => break,
        }
    }

    set(WorkerState::Stopping);
    // Connections that raced the stop, including our own requeues.
    while let Ok(job) = rx.try_recv() {
        if let Job::Drain(conn) = job {
            tracing::debug!(worker = id, conn = conn.id(), "draining after stop");
            while conn.drain() {}
        }
    }
    set(WorkerState::Stopped);
    tracing::debug!(worker = id, "dispatch worker stopped");
}

/// Get the number of online CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}
