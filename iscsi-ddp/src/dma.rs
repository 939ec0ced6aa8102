use std::fmt;
use std::sync::Arc;

/// Error returned by a [`DmaMapper`] that could not map a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMapError;

impl fmt::Display for DmaMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DMA mapping failed")
    }
}

impl std::error::Error for DmaMapError {}

/// Bus-mapping service of the platform.
///
/// `map` makes one host page reachable by the adapter and returns the address
/// the hardware uses for it; `unmap` undoes exactly one successful `map`.
pub trait DmaMapper: Send + Sync + 'static {
    /// Map `len` bytes at host page address `page`.
    fn map(&self, page: u64, len: usize) -> Result<u64, DmaMapError>;
    /// Release a mapping previously returned by [`map`](Self::map).
    fn unmap(&self, bus_addr: u64, len: usize);
}

/// Bus addresses for the pages of one gather list.
///
/// Every address held here is unmapped when the value is dropped, so a
/// partially built mapping unwinds itself on the error path.
pub(crate) struct DmaMapping {
    mapper: Arc<dyn DmaMapper>,
    page_len: usize,
    bus_addrs: Vec<u64>,
}

impl DmaMapping {
    pub(crate) fn with_capacity(mapper: Arc<dyn DmaMapper>, page_len: usize, n: usize) -> Self {
        DmaMapping {
            mapper,
            page_len,
            bus_addrs: Vec::with_capacity(n),
        }
    }

    /// Map one more page and remember its bus address.
    pub(crate) fn push(&mut self, page: u64) -> Result<(), DmaMapError> {
        let addr = self.mapper.map(page, self.page_len)?;
        self.bus_addrs.push(addr);
        Ok(())
    }

    pub(crate) fn bus_addrs(&self) -> &[u64] {
        &self.bus_addrs
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        for &addr in &self.bus_addrs {
            self.mapper.unmap(addr, self.page_len);
        }
    }
}
