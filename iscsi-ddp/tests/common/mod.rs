#![allow(dead_code)]
//! Fakes for the adapter-side collaborators.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use iscsi_ddp::{
    Config, DdpAdapter, DdpManager, DmaMapError, DmaMapper, MemWrite, OffloadConn, PduSink,
    QueueFull, Segment, WorkQueue,
};
use parking_lot::Mutex;

pub const PAGE: usize = 4096;

pub const CONN: OffloadConn = OffloadConn {
    tid: 0x51,
    tx_queue: 3,
    port: 0,
};

/// Work queue that records every request, optionally refusing them.
#[derive(Default)]
pub struct RecordingQueue {
    pub requests: Mutex<Vec<MemWrite>>,
    pub full: AtomicBool,
}

impl WorkQueue for RecordingQueue {
    fn submit(&self, _conn: &OffloadConn, request: MemWrite) -> Result<(), QueueFull> {
        if self.full.load(Ordering::SeqCst) {
            return Err(QueueFull);
        }
        self.requests.lock().push(request);
        Ok(())
    }
}

impl RecordingQueue {
    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last(&self) -> Option<MemWrite> {
        self.requests.lock().last().cloned()
    }
}

/// DMA mapper that tracks live mappings and can fail after a budget.
pub struct CountingMapper {
    pub live: Mutex<HashSet<u64>>,
    pub maps: AtomicUsize,
    pub budget: AtomicUsize,
}

impl Default for CountingMapper {
    fn default() -> Self {
        CountingMapper {
            live: Mutex::new(HashSet::new()),
            maps: AtomicUsize::new(0),
            budget: AtomicUsize::new(usize::MAX),
        }
    }
}

impl CountingMapper {
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }
}

impl DmaMapper for CountingMapper {
    fn map(&self, page: u64, _len: usize) -> Result<u64, DmaMapError> {
        if self.maps.load(Ordering::SeqCst) >= self.budget.load(Ordering::SeqCst) {
            return Err(DmaMapError);
        }
        self.maps.fetch_add(1, Ordering::SeqCst);
        let bus = page | (1 << 48);
        self.live.lock().insert(bus);
        Ok(bus)
    }

    fn unmap(&self, bus_addr: u64, _len: usize) {
        assert!(self.live.lock().remove(&bus_addr), "double unmap");
    }
}

pub struct Rig {
    pub adapter: DdpAdapter,
    pub manager: Arc<DdpManager>,
    pub queue: Arc<RecordingQueue>,
    pub mapper: Arc<CountingMapper>,
}

/// Adapter with room for `pods` pod records (before the marker cut).
pub fn rig(pods: u32) -> Rig {
    let queue = Arc::new(RecordingQueue::default());
    let mapper = Arc::new(CountingMapper::default());
    let config = Config::builder()
        .pagepod_window(0x10_0000, 0x10_0000 + (pods << 6) - 1)
        .build()
        .unwrap();
    let adapter = DdpAdapter::new(config, mapper.clone(), queue.clone());
    let manager = adapter.activate().unwrap();
    Rig {
        adapter,
        manager,
        queue,
        mapper,
    }
}

/// A page-aligned buffer of `pages` pages at a distinct address per `n`.
pub fn buffer(n: u64, pages: usize) -> Vec<Segment> {
    vec![Segment::new(0x1000_0000 + n * 0x10_0000, pages * PAGE)]
}

/// Upper layer that collects PDUs tagged with the connection they came on.
#[derive(Default, Clone)]
pub struct Collector {
    pub seen: Arc<Mutex<Vec<(u64, u64)>>>,
}

pub struct ConnSink {
    pub conn: u64,
    pub seen: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl Collector {
    pub fn sink(&self, conn: u64) -> ConnSink {
        ConnSink {
            conn,
            seen: self.seen.clone(),
        }
    }

    pub fn for_conn(&self, conn: u64) -> Vec<u64> {
        self.seen
            .lock()
            .iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, p)| *p)
            .collect()
    }
}

impl PduSink for ConnSink {
    type Pdu = u64;

    fn deliver(&self, pdu: u64) {
        self.seen.lock().push((self.conn, pdu));
    }
}
