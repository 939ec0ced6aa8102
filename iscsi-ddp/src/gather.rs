//! Gather lists: the page-granular view of one buffer registration.
//!
//! A scatter list of `(address, length)` segments is folded into the list of
//! host pages it covers. Placement hardware describes a buffer as "offset into
//! the first page, then whole pages", so only layouts of that shape qualify:
//!
//! - the first page may start anywhere;
//! - every page except the last is used up to its end;
//! - every page except the first is used from offset 0.
//!
//! Segments that continue within the same page are coalesced; a segment that
//! crosses page boundaries is split.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::dma::{DmaMapper, DmaMapping};
use crate::error::{Error, Exhausted, Ineligible};
use crate::pagepod::{OffloadConn, PPOD_PAGES_MAX};

/// Default placement threshold. A transfer is placed only when its length
/// strictly exceeds the threshold; `length <= threshold` is ineligible.
pub const DDP_THRESHOLD: usize = 2048;

/// One contiguous piece of a host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Host address of the first byte.
    pub addr: u64,
    /// Length in bytes.
    pub len: usize,
}

impl Segment {
    pub fn new(addr: u64, len: usize) -> Self {
        Segment { addr, len }
    }
}

/// Pages backing one in-flight buffer registration.
pub struct GatherList {
    tag: u32,
    length: usize,
    offset: usize,
    page_size: usize,
    pages: Vec<u64>,
    conn: Option<OffloadConn>,
    dma: Option<DmaMapping>,
    claimed: AtomicBool,
}

impl GatherList {
    /// Fold `segments` into the pages covering the first `length` bytes.
    ///
    /// Segments past `length` are ignored. Returns [`Error::Ineligible`] for
    /// small transfers and for layouts the hardware cannot describe, and
    /// [`Error::InconsistentLayout`] when the segments cannot hold `length`
    /// bytes at all.
    pub fn build(
        length: usize,
        segments: &[Segment],
        page_size: usize,
        threshold: usize,
    ) -> Result<GatherList, Error> {
        debug_assert!(page_size.is_power_of_two());
        if length <= threshold {
            return Err(Ineligible::TooSmall(length).into());
        }
        let Some(first) = segments.first() else {
            return Err(Error::InconsistentLayout("empty scatter list"));
        };

        let mask = page_size as u64 - 1;
        let offset = (first.addr & mask) as usize;
        let npages = (length + offset).div_ceil(page_size);

        let mut pages: Vec<u64> = Vec::with_capacity(npages);
        // Offset within the current page just past the last byte seen.
        let mut page_end = 0usize;
        let mut remaining = length;

        for seg in segments {
            if remaining == 0 {
                break;
            }
            let mut addr = seg.addr;
            let mut len = seg.len.min(remaining);
            remaining -= len;

            while len > 0 {
                let page = addr & !mask;
                let in_page = (addr & mask) as usize;
                let chunk = len.min(page_size - in_page);

                match pages.last() {
                    Some(&cur) if cur == page => {
                        if in_page != page_end {
                            return Err(Ineligible::PartialPage.into());
                        }
                        page_end += chunk;
                    }
                    Some(_) => {
                        if page_end != page_size {
                            return Err(Ineligible::PartialPage.into());
                        }
                        if in_page != 0 {
                            return Err(Ineligible::Unaligned.into());
                        }
                        pages.push(page);
                        page_end = chunk;
                    }
                    None => {
                        pages.push(page);
                        page_end = in_page + chunk;
                    }
                }

                addr += chunk as u64;
                len -= chunk;
            }
        }

        if remaining > 0 {
            return Err(Error::InconsistentLayout(
                "scatter list shorter than transfer",
            ));
        }
        debug_assert_eq!(pages.len(), npages);

        Ok(GatherList {
            tag: 0,
            length,
            offset,
            page_size,
            pages,
            conn: None,
            dma: None,
            claimed: AtomicBool::new(false),
        })
    }

    /// Map every page for the adapter. On failure the pages mapped so far
    /// are unmapped again and the list stays unmapped.
    pub fn map(&mut self, mapper: &Arc<dyn DmaMapper>) -> Result<(), Error> {
        if self.dma.is_some() {
            return Ok(());
        }
        let mut mapping =
            DmaMapping::with_capacity(mapper.clone(), self.page_size, self.pages.len());
        for &page in &self.pages {
            if mapping.push(page).is_err() {
                tracing::debug!(
                    page,
                    mapped = mapping.bus_addrs().len(),
                    "page mapping failed, unwinding"
                );
                return Err(Exhausted::DmaMapping.into());
            }
        }
        self.dma = Some(mapping);
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        self.dma.is_some()
    }

    /// Transfer length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Byte offset of the transfer within the first page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Host page addresses, in transfer order.
    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    /// Bus addresses of the pages; empty while unmapped.
    pub fn bus_addrs(&self) -> &[u64] {
        self.dma.as_ref().map(|d| d.bus_addrs()).unwrap_or(&[])
    }

    /// Pagepods needed to describe this list.
    pub fn pod_count(&self) -> usize {
        self.pages.len().div_ceil(PPOD_PAGES_MAX)
    }

    /// Tag this list is registered under (0 until reserved).
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Connection the list is registered for, once reserved.
    pub fn connection(&self) -> Option<&OffloadConn> {
        self.conn.as_ref()
    }

    pub(crate) fn bind(&mut self, tag: u32, conn: OffloadConn) {
        self.tag = tag;
        self.conn = Some(conn);
    }

    /// Take exclusive ownership of this registration's slots. Only the first
    /// caller gets `true` until [`unclaim`](Self::unclaim).
    pub(crate) fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unclaim(&self) {
        self.claimed.store(false, Ordering::Release);
    }
}

impl fmt::Debug for GatherList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatherList")
            .field("tag", &format_args!("{:#x}", self.tag))
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("pages", &self.pages.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
