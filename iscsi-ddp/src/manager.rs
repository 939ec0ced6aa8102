//! Per-adapter placement manager.
//!
//! The manager owns the pagepod slot table and hands out placement tags.
//! Reservation runs in three phases:
//!
//! 1. under the slot lock: find a run, bump the color, record the gather list;
//! 2. without the lock: write the pods through the [`PagepodMap`];
//! 3. under the lock again: on failure free the run, on success advance the
//!    next-fit cursor.
//!
//! A registration is claimed while it is being programmed or torn down, so a
//! release racing either phase is ignored instead of freeing slots twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::{Config, ISCSI_PDU_NONPAYLOAD_LEN, ULP2_MAX_PKT_SIZE};
use crate::dma::DmaMapper;
use crate::error::{Error, Exhausted, Ineligible};
use crate::gather::{GatherList, Segment};
use crate::metrics;
use crate::pagepod::{
    OffloadConn, PagepodHeader, PagepodMap, PagepodProgrammer, WorkQueue, page_size_index,
};
use crate::slots::{Busy, SlotMap};
use crate::tag::{
    self, COLOR_BITS, MAX_INDEX_BITS, TagFormat, compose_tag, is_ddp_tag, mark_as_non_ddp,
    sw_tag_usable,
};

/// Snapshot of slot usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdpStats {
    /// Usable pagepod slots.
    pub nppods: usize,
    /// Slots currently holding a registration.
    pub in_use: usize,
    /// Start of the last allocation (`nppods` if none yet).
    pub idx_last: usize,
}

/// Placement tag and pagepod manager for one adapter.
///
/// Shared between sessions through `Arc`; dropped when the adapter has been
/// deactivated and the last session lets go. Dropping unmaps whatever is
/// still registered.
pub struct DdpManager {
    config: Config,
    format: TagFormat,
    nppods: usize,
    idx_mask: u32,
    rsvd_tag_mask: u32,
    page_size_idx: u8,
    max_tx_payload: usize,
    max_rx_payload: usize,
    slots: Mutex<SlotMap>,
    mapper: Arc<dyn DmaMapper>,
    pod_map: Arc<dyn PagepodMap>,
    deactivating: AtomicBool,
}

impl DdpManager {
    /// Size the slot table from the configured pagepod window.
    pub fn new(
        config: Config,
        mapper: Arc<dyn DmaMapper>,
        pod_map: Arc<dyn PagepodMap>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let page_size_idx = page_size_index(config.pagepod.page_size).ok_or_else(|| {
            Error::Config(format!("page size {} not supported", config.pagepod.page_size))
        })?;

        let ppmax = config.pagepod.ppmax();
        let bits = fls(ppmax).min(MAX_INDEX_BITS as u32) as u8;
        if bits < 2 {
            return Err(Error::Config(format!(
                "pagepod window holds {ppmax} pods, need at least 2"
            )));
        }
        let format = TagFormat::new(bits)?;
        // The top index value is the "not placed" marker.
        let nppods = (1usize << (bits - 1)) - 1;

        tracing::info!(
            ppmax,
            nppods,
            idx_bits = bits,
            page_size = config.pagepod.page_size,
            llimit = config.pagepod.llimit,
            "placement manager ready"
        );

        Ok(DdpManager {
            format,
            nppods,
            idx_mask: (1u32 << bits) - 1,
            rsvd_tag_mask: (1u32 << (bits + COLOR_BITS)) - 1,
            page_size_idx,
            max_tx_payload: payload_limit(config.max_tx_pdu),
            max_rx_payload: payload_limit(config.max_rx_pdu),
            slots: Mutex::new(SlotMap::new(nppods)),
            mapper,
            pod_map,
            deactivating: AtomicBool::new(false),
            config,
        })
    }

    pub fn format(&self) -> &TagFormat {
        &self.format
    }

    pub fn nppods(&self) -> usize {
        self.nppods
    }

    /// Mask of the index field, marker bit included.
    pub fn idx_mask(&self) -> u32 {
        self.idx_mask
    }

    /// Mask of the tag bits written into a pod header.
    pub fn rsvd_tag_mask(&self) -> u32 {
        self.rsvd_tag_mask
    }

    /// Largest data segment to send in one PDU.
    pub fn max_tx_payload(&self) -> usize {
        self.max_tx_payload
    }

    /// Largest data segment the adapter accepts in one PDU.
    pub fn max_rx_payload(&self) -> usize {
        self.max_rx_payload
    }

    pub fn is_deactivating(&self) -> bool {
        self.deactivating.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DdpStats {
        let slots = self.slots.lock();
        DdpStats {
            nppods: self.nppods,
            in_use: slots.in_use(),
            idx_last: slots.idx_last(),
        }
    }

    /// Register a mapped gather list and return its placement tag.
    ///
    /// On any error the list is dropped, which unmaps it, and no slot stays
    /// marked.
    pub fn reserve(&self, conn: &OffloadConn, sw_tag: u32, gl: GatherList) -> Result<u32, Error> {
        if self.is_deactivating() {
            return Err(Error::Deactivating);
        }
        if gl.length() <= self.config.ddp_threshold {
            return Err(Ineligible::TooSmall(gl.length()).into());
        }
        if gl.page_size() != self.config.pagepod.page_size {
            return Err(Error::InconsistentLayout(
                "gather list page size differs from adapter",
            ));
        }
        if !gl.is_mapped() {
            return Err(Error::InconsistentLayout("gather list not mapped"));
        }
        if !sw_tag_usable(&self.format, sw_tag) {
            return Err(Ineligible::SwTagTooWide.into());
        }

        let count = gl.pod_count();
        let (idx, gl) = {
            let mut slots = self.slots.lock();
            let idx = match slots.find_next_fit(count) {
                Ok(idx) => idx,
                Err(Busy) => {
                    drop(slots);
                    tracing::debug!(tid = conn.tid, pods = count, "no free pagepods");
                    metrics::exhausted(Exhausted::Slots);
                    return Err(Exhausted::Slots.into());
                }
            };
            let color = slots.next_color(idx);
            let mut gl = gl;
            gl.bind(compose_tag(idx as u32, color, &self.format, sw_tag), *conn);
            let gl = Arc::new(gl);
            gl.claim();
            slots.mark(idx, count, &gl);
            (idx, gl)
        };
        let tag = gl.tag();

        let header = PagepodHeader::new(
            conn.tid,
            tag & self.rsvd_tag_mask,
            self.page_size_idx,
            gl.length() as u32,
            gl.offset() as u32,
        );
        if let Err(err) = self.pod_map.set_map(conn, idx, &header, &gl) {
            let held = self.slots.lock().unmark(idx, count);
            drop(held);
            if let Error::ResourceExhausted(stage) = err {
                metrics::exhausted(stage);
            }
            tracing::debug!(tid = conn.tid, idx, pods = count, error = %err, "pagepod write failed");
            return Err(err);
        }

        self.slots.lock().set_last(idx);
        gl.unclaim();

        metrics::TAGS_RESERVED.increment();
        metrics::PODS_IN_USE.add(count as i64);
        tracing::trace!(tid = conn.tid, tag, idx, pods = count, "tag reserved");
        Ok(tag)
    }

    /// Build, map and register a buffer in one step.
    pub fn reserve_tag(
        &self,
        conn: &OffloadConn,
        sw_tag: u32,
        length: usize,
        segments: &[Segment],
    ) -> Result<u32, Error> {
        if self.is_deactivating() {
            return Err(Error::Deactivating);
        }
        if !sw_tag_usable(&self.format, sw_tag) {
            return Err(Ineligible::SwTagTooWide.into());
        }
        let mut gl = GatherList::build(
            length,
            segments,
            self.config.pagepod.page_size,
            self.config.ddp_threshold,
        )?;
        if let Err(err) = gl.map(&self.mapper) {
            if let Error::ResourceExhausted(stage) = err {
                metrics::exhausted(stage);
            }
            return Err(err);
        }
        self.reserve(conn, sw_tag, gl)
    }

    /// Tag for a task: a placement tag when the buffer can be placed,
    /// otherwise `sw_tag` marked as not placed.
    ///
    /// Only caller bugs ([`Error::InconsistentLayout`]) are returned.
    pub fn task_tag(
        &self,
        conn: &OffloadConn,
        sw_tag: u32,
        length: usize,
        segments: &[Segment],
    ) -> Result<u32, Error> {
        match self.reserve_tag(conn, sw_tag, length, segments) {
            Ok(tag) => Ok(tag),
            Err(err) if err.is_recoverable() => {
                tracing::trace!(tid = conn.tid, sw_tag, length, reason = %err, "placement skipped");
                metrics::TAG_FALLBACKS.increment();
                Ok(mark_as_non_ddp(&self.format, sw_tag))
            }
            Err(err) => Err(err),
        }
    }

    /// Release a placement tag.
    ///
    /// Software tags, out-of-range indices, free slots and tags that no
    /// longer match the slot's registration are ignored.
    pub fn release(&self, tag: u32) {
        if !is_ddp_tag(&self.format, tag) {
            return;
        }
        let idx = tag::slot_index(&self.format, tag) as usize;
        if idx >= self.nppods {
            metrics::STALE_RELEASES.increment();
            tracing::trace!(tag, idx, "release of out-of-range tag ignored");
            return;
        }

        let claimed = self
            .slots
            .lock()
            .get(idx)
            .filter(|gl| gl.tag() == tag && gl.claim())
            .cloned();
        let Some(gl) = claimed else {
            metrics::STALE_RELEASES.increment();
            tracing::trace!(tag, idx, "release of unregistered tag ignored");
            return;
        };

        let count = gl.pod_count();
        if let Some(conn) = gl.connection()
            && let Err(err) = self.pod_map.clear_map(conn, idx, count)
        {
            tracing::warn!(tid = conn.tid, tag, idx, pods = count, error = %err, "pagepod clear failed");
        }

        let held = self.slots.lock().unmark(idx, count);
        drop(held);
        drop(gl);

        metrics::TAGS_RELEASED.increment();
        metrics::PODS_IN_USE.sub(count as i64);
        tracing::trace!(tag, idx, pods = count, "tag released");
    }

    fn begin_deactivate(&self) {
        self.deactivating.store(true, Ordering::Release);
    }
}

impl Drop for DdpManager {
    fn drop(&mut self) {
        let in_use = self.slots.get_mut().in_use();
        if in_use > 0 {
            metrics::PODS_IN_USE.sub(in_use as i64);
            tracing::debug!(in_use, "placement manager dropped with live registrations");
        }
    }
}

/// Payload limit for a PDU size: framing removed, rounded down to 512.
fn payload_limit(max_pdu: usize) -> usize {
    (max_pdu.min(ULP2_MAX_PKT_SIZE) - ISCSI_PDU_NONPAYLOAD_LEN) & !511
}

/// 1-based position of the highest set bit, 0 for 0.
fn fls(x: u32) -> u32 {
    32 - x.leading_zeros()
}

/// Adapter-side lifecycle of the placement manager.
///
/// The first [`activate`](Self::activate) builds the manager; later calls
/// share it. [`deactivate`](Self::deactivate) stops new reservations and drops
/// the adapter's own reference.
pub struct DdpAdapter {
    config: Config,
    mapper: Arc<dyn DmaMapper>,
    pod_map: Arc<dyn PagepodMap>,
    active: Mutex<Option<Arc<DdpManager>>>,
}

impl DdpAdapter {
    /// Adapter whose pods are written as memory-write requests on `queue`.
    pub fn new<Q: WorkQueue>(config: Config, mapper: Arc<dyn DmaMapper>, queue: Q) -> Self {
        let pod_map = Arc::new(PagepodProgrammer::new(queue, config.pagepod.llimit));
        Self::with_pagepod_map(config, mapper, pod_map)
    }

    /// Adapter with a custom pod programming hook.
    pub fn with_pagepod_map(
        config: Config,
        mapper: Arc<dyn DmaMapper>,
        pod_map: Arc<dyn PagepodMap>,
    ) -> Self {
        DdpAdapter {
            config,
            mapper,
            pod_map,
            active: Mutex::new(None),
        }
    }

    /// Manager for a new session, created on first use.
    pub fn activate(&self) -> Result<Arc<DdpManager>, Error> {
        let mut active = self.active.lock();
        if let Some(manager) = active.as_ref() {
            return Ok(manager.clone());
        }
        let manager = Arc::new(
            DdpManager::new(self.config.clone(), self.mapper.clone(), self.pod_map.clone())
                .inspect_err(|err| tracing::error!(error = %err, "placement offload unavailable"))?,
        );
        *active = Some(manager.clone());
        tracing::info!(nppods = manager.nppods(), "placement offload activated");
        Ok(manager)
    }

    /// Stop new reservations. Sessions still holding the manager can
    /// release their tags.
    pub fn deactivate(&self) {
        let Some(manager) = self.active.lock().take() else {
            return;
        };
        manager.begin_deactivate();
        tracing::info!(
            sessions = Arc::strong_count(&manager) - 1,
            "placement offload deactivated"
        );
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }
}
