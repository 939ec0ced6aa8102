//! iscsi-ddp: direct data placement for iSCSI offload adapters.
//!
//! An offload adapter can write incoming Data-In/Data-Out payloads straight
//! into their final host buffers when the PDU's task tag names a registered
//! buffer. This crate manages that registration:
//!
//! - [`GatherList`] folds a buffer's scatter list into placement pages and
//!   maps them for the adapter;
//! - [`DdpManager`] allocates pagepod slots, writes the pods and hands out
//!   the placement tag;
//! - [`DispatchPool`] moves received PDUs to the upper layer on a fixed set
//!   of worker threads, in per-connection order.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iscsi_ddp::{
//!     Config, DdpAdapter, DmaMapError, DmaMapper, MemWrite, OffloadConn, QueueFull, Segment,
//!     WorkQueue,
//! };
//!
//! struct Iommu;
//! impl DmaMapper for Iommu {
//!     fn map(&self, page: u64, _len: usize) -> Result<u64, DmaMapError> { Ok(page) }
//!     fn unmap(&self, _bus_addr: u64, _len: usize) {}
//! }
//!
//! struct Ctrl;
//! impl WorkQueue for Ctrl {
//!     fn submit(&self, _conn: &OffloadConn, _wr: MemWrite) -> Result<(), QueueFull> { Ok(()) }
//! }
//!
//! fn main() -> Result<(), iscsi_ddp::Error> {
//!     let adapter = DdpAdapter::new(Config::default(), Arc::new(Iommu), Ctrl);
//!     let ddp = adapter.activate()?;
//!     let conn = OffloadConn { tid: 1, tx_queue: 0, port: 0 };
//!     let tag = ddp.task_tag(&conn, 0x10, 65536, &[Segment::new(0x10_0000, 65536)])?;
//!     // ... I/O completes ...
//!     ddp.release(tag);
//!     Ok(())
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod metrics;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod dispatch;
pub mod dma;
pub mod error;
pub mod gather;
pub mod manager;
pub mod pagepod;
pub mod slots;
pub mod tag;

// ── Re-exports: Placement ───────────────────────────────────────────────

/// Adapter-side manager lifecycle.
pub use manager::DdpAdapter;
/// Per-adapter tag and pagepod manager.
pub use manager::DdpManager;
/// Slot usage snapshot from [`DdpManager::stats`].
pub use manager::DdpStats;
/// Pages backing one buffer registration.
pub use gather::GatherList;
/// One `(address, length)` piece of a host buffer.
pub use gather::Segment;
/// Default placement threshold in bytes.
pub use gather::DDP_THRESHOLD;
/// Bit layout of placement tags.
pub use tag::TagFormat;

// ── Re-exports: Collaborator seams ──────────────────────────────────────

/// Platform bus-mapping service.
pub use dma::DmaMapper;
/// Failure returned by a [`DmaMapper`].
pub use dma::DmaMapError;
/// Offloaded connection identifiers.
pub use pagepod::OffloadConn;
/// Memory-write work request carrying pagepods.
pub use pagepod::MemWrite;
/// Hook that programs and clears pagepods.
pub use pagepod::PagepodMap;
/// [`PagepodMap`] writing through a [`WorkQueue`].
pub use pagepod::PagepodProgrammer;
/// Returned by a full [`WorkQueue`].
pub use pagepod::QueueFull;
/// Hardware work-request transport.
pub use pagepod::WorkQueue;

// ── Re-exports: Receive dispatch ────────────────────────────────────────

/// Fixed pool of receive workers.
pub use dispatch::DispatchPool;
/// Upper layer receiving PDUs.
pub use dispatch::PduSink;
/// Receive side of one connection.
pub use dispatch::RxConnection;
/// Worker lifecycle state.
pub use dispatch::WorkerState;

// ── Re-exports: Shared types ────────────────────────────────────────────

/// Adapter configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Receive pool configuration.
pub use config::DispatchConfig;
/// Pagepod window configuration.
pub use config::PagepodConfig;
/// Errors returned by this crate.
pub use error::Error;
/// Resource exhaustion stage.
pub use error::Exhausted;
/// Reason a transfer was not placed.
pub use error::Ineligible;
