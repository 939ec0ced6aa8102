//! Placement and receive-dispatch metrics.
//!
//! Process-wide; every adapter's manager and pool reports into the same
//! series.

use metriken::{Counter, Gauge, metric};

// ── Tags ─────────────────────────────────────────────────────────

#[metric(
    name = "iscsi_ddp/tags/reserved",
    description = "Placement tags handed out"
)]
pub static TAGS_RESERVED: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/tags/released",
    description = "Placement tags released"
)]
pub static TAGS_RELEASED: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/tags/stale_release",
    description = "Releases ignored for unknown, stale or duplicate tags"
)]
pub static STALE_RELEASES: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/tags/fallback",
    description = "Task tags issued without direct placement"
)]
pub static TAG_FALLBACKS: Counter = Counter::new();

// ── Exhaustion ───────────────────────────────────────────────────

#[metric(
    name = "iscsi_ddp/exhausted/slots",
    description = "Reservations refused for lack of free pagepods"
)]
pub static SLOTS_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/exhausted/dma",
    description = "Reservations refused because a page could not be mapped"
)]
pub static DMA_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/exhausted/transport",
    description = "Pagepod writes refused by the work request queue"
)]
pub static TRANSPORT_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/pods/in_use",
    description = "Pagepods currently holding a registration"
)]
pub static PODS_IN_USE: Gauge = Gauge::new();

// ── Receive dispatch ─────────────────────────────────────────────

#[metric(
    name = "iscsi_ddp/rx/delivered",
    description = "PDUs handed to the upper layer"
)]
pub static PDUS_DELIVERED: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/rx/dropped",
    description = "PDUs discarded on connections closed for receive"
)]
pub static PDUS_DROPPED: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/rx/activations",
    description = "Connections moved from idle to active"
)]
pub static RX_ACTIVATIONS: Counter = Counter::new();

#[metric(
    name = "iscsi_ddp/rx/requeues",
    description = "Connections re-appended after PDUs raced a drain"
)]
pub static RX_REQUEUES: Counter = Counter::new();

/// Count an exhaustion event against its stage.
pub(crate) fn exhausted(stage: crate::error::Exhausted) {
    use crate::error::Exhausted;
    match stage {
        Exhausted::Slots => SLOTS_EXHAUSTED.increment(),
        Exhausted::DmaMapping => DMA_EXHAUSTED.increment(),
        Exhausted::Transport => TRANSPORT_EXHAUSTED.increment(),
    };
}
