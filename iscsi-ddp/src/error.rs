use std::io;

use thiserror::Error;

/// Errors returned by the placement manager and the receive dispatch pool.
#[derive(Debug, Error)]
pub enum Error {
    /// Transfer is not worth (or not able to be) placed directly.
    /// The caller falls back to a software tag.
    #[error("not eligible for direct placement: {0}")]
    Ineligible(#[from] Ineligible),
    /// A placement resource ran out. The stage is informational; callers
    /// treat every stage the same way.
    #[error("placement resources exhausted: {0}")]
    ResourceExhausted(#[from] Exhausted),
    /// The scatter list or gather list handed in violates its layout contract.
    #[error("inconsistent layout: {0}")]
    InconsistentLayout(&'static str),
    /// Adapter configuration cannot support placement.
    #[error("configuration: {0}")]
    Config(String),
    /// The manager was deactivated; no new reservations are accepted.
    #[error("placement manager is deactivating")]
    Deactivating,
    /// The connection can no longer receive.
    #[error("connection closed for receive")]
    ConnectionClosed,
    /// The dispatch pool has been shut down.
    #[error("dispatch pool stopped")]
    PoolStopped,
    /// Thread spawn or other OS failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the failure is a per-transfer condition the caller recovers
    /// from by using a software tag instead.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Ineligible(_) | Error::ResourceExhausted(_) | Error::Deactivating
        )
    }
}

/// Why a transfer was not placed directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ineligible {
    /// Transfer length does not exceed the placement threshold.
    #[error("{0} bytes is below the placement threshold")]
    TooSmall(usize),
    /// A page other than the last one is not used up to its end.
    #[error("inner page not fully used")]
    PartialPage,
    /// A page other than the first one does not start at offset 0.
    #[error("inner segment not page aligned")]
    Unaligned,
    /// The software tag overlaps the bits reserved for the hardware.
    #[error("software tag overlaps reserved bits")]
    SwTagTooWide,
}

/// Which stage ran out of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exhausted {
    /// No run of free pagepod slots large enough.
    #[error("no free pagepod slots")]
    Slots,
    /// The DMA layer could not map a page.
    #[error("DMA mapping failed")]
    DmaMapping,
    /// The work request queue refused the pagepod write.
    #[error("work request queue full")]
    Transport,
}
