use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::{Job, StopGate};
use crate::error::Error;
use crate::metrics;

/// Upper protocol layer receiving PDUs for one connection.
pub trait PduSink: Send + Sync + 'static {
    type Pdu: Send + 'static;

    /// Called on the connection's worker thread, in arrival order.
    fn deliver(&self, pdu: Self::Pdu);
}

/// A connection a worker can drain.
pub(crate) trait Drain: Send + Sync {
    fn id(&self) -> u64;

    /// Deliver everything pending. Returns `true` if PDUs arrived during the
    /// drain and the connection has to go back on the run list.
    fn drain(&self) -> bool;
}

struct RxState<P> {
    pending: VecDeque<P>,
    /// On a run list or being drained.
    active: bool,
    closed: bool,
}

/// Receive side of one offloaded connection.
///
/// The transport appends PDUs with [`enqueue_received`](Self::enqueue_received);
/// the connection's worker hands them to the [`PduSink`] in order. The
/// connection sits on at most one run list entry at a time.
pub struct RxConnection<S: PduSink> {
    id: u64,
    worker: usize,
    sink: S,
    state: Mutex<RxState<S::Pdu>>,
    run_list: Sender<Job>,
    stopping: StopGate,
}

impl<S: PduSink> RxConnection<S> {
    pub(crate) fn new(
        id: u64,
        worker: usize,
        sink: S,
        run_list: Sender<Job>,
        stopping: StopGate,
    ) -> Self {
        RxConnection {
            id,
            worker,
            sink,
            state: Mutex::new(RxState {
                pending: VecDeque::new(),
                active: false,
                closed: false,
            }),
            run_list,
            stopping,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Worker this connection is pinned to.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Queue a received PDU, activating the connection if it was idle.
    pub fn enqueue_received(self: &Arc<Self>, pdu: S::Pdu) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        // Held until the send below: shutdown cannot slip its Stop in between.
        let stopping = self.stopping.read();
        if *stopping {
            drop(stopping);
            drop(state);
            tracing::error!(conn = self.id, "PDU enqueued during dispatch shutdown");
            return Err(Error::PoolStopped);
        }
        state.pending.push_back(pdu);
        if state.active {
            return Ok(());
        }

        // Flip and send under the lock so a finishing drain cannot miss us.
        state.active = true;
        let job = Job::Drain(self.clone());
        if self.run_list.send(job).is_err() {
            state.active = false;
            state.pending.pop_back();
            drop(stopping);
            drop(state);
            tracing::error!(conn = self.id, "dispatch worker gone");
            return Err(Error::PoolStopped);
        }
        metrics::RX_ACTIVATIONS.increment();
        Ok(())
    }

    /// Stop receiving. Pending PDUs are dropped by the next drain and later
    /// enqueues fail with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if !state.active {
            let dropped = mem::take(&mut state.pending).len();
            metrics::PDUS_DROPPED.add(dropped as u64);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// PDUs waiting for the worker.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl<S: PduSink> Drain for RxConnection<S> {
    fn id(&self) -> u64 {
        self.id
    }

    fn drain(&self) -> bool {
        let batch = {
            let mut state = self.state.lock();
            if state.closed {
                let dropped = mem::take(&mut state.pending).len();
                state.active = false;
                metrics::PDUS_DROPPED.add(dropped as u64);
                return false;
            }
            mem::take(&mut state.pending)
        };

        let delivered = batch.len();
        for pdu in batch {
            self.sink.deliver(pdu);
        }
        metrics::PDUS_DELIVERED.add(delivered as u64);

        let mut state = self.state.lock();
        if state.closed {
            let dropped = mem::take(&mut state.pending).len();
            metrics::PDUS_DROPPED.add(dropped as u64);
        }
        if state.pending.is_empty() {
            state.active = false;
            return false;
        }
        metrics::RX_REQUEUES.increment();
        tracing::trace!(conn = self.id, pending = state.pending.len(), "requeue");
        true
    }
}
