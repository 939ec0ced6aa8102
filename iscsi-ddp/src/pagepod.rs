//! Pagepod records and the memory-write requests that program them.
//!
//! A pagepod is the adapter's page-table entry for a placed buffer: a header
//! naming the connection and tag, followed by page addresses. The adapter
//! reads pods straight out of its memory window, so the record layout below
//! is fixed (all fields big-endian):
//!
//! ```text
//! offset  size  field
//!      0     4  vld_tid          VALID | tid
//!      4     4  pgsz_tag_color   page size index << 30 | index << 6 | color
//!      8     4  max_offset       transfer length
//!     12     4  page_offset      offset into the first page
//!     16     8  reserved
//!     24    40  addr[5]          bus addresses, addr[4] = next pod's addr[0]
//! ```

use std::mem;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Exhausted};
use crate::gather::GatherList;

/// Size of one pagepod record in bytes.
pub const PPOD_SIZE: usize = 64;
/// `log2(PPOD_SIZE)`.
pub const PPOD_SIZE_SHIFT: u32 = 6;
/// Pages owned by one pagepod.
pub const PPOD_PAGES_MAX: usize = 4;
/// Address slots per pod: the owned pages plus one lookahead.
const PPOD_ADDRS: usize = PPOD_PAGES_MAX + 1;

/// Header flag marking a pod as live.
pub const PPOD_VALID: u32 = 1 << 24;
/// Mask of the connection id in `vld_tid`.
pub const PPOD_TID_MASK: u32 = 0xff_ffff;
const PPOD_PGSZ_SHIFT: u32 = 30;

/// Page sizes the placement engine understands, by page size index.
pub const DDP_PAGE_SIZES: [usize; 4] = [4096, 8192, 16384, 65536];

/// Page size index for `page_size`, if the hardware supports it.
pub fn page_size_index(page_size: usize) -> Option<u8> {
    DDP_PAGE_SIZES
        .iter()
        .position(|&sz| sz == page_size)
        .map(|i| i as u8)
}

/// Offloaded connection a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffloadConn {
    /// Hardware connection id.
    pub tid: u32,
    /// Egress queue for work requests on this connection.
    pub tx_queue: u16,
    /// Adapter port the connection runs on.
    pub port: u8,
}

/// Header shared by every pod of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagepodHeader {
    pub vld_tid: u32,
    pub pgsz_tag_color: u32,
    pub max_offset: u32,
    pub page_offset: u32,
}

impl PagepodHeader {
    /// Header for a valid pod. `tag_bits` is the tag already masked down to
    /// the reserved field.
    pub fn new(
        tid: u32,
        tag_bits: u32,
        page_size_idx: u8,
        max_offset: u32,
        page_offset: u32,
    ) -> Self {
        PagepodHeader {
            vld_tid: PPOD_VALID | (tid & PPOD_TID_MASK),
            pgsz_tag_color: ((page_size_idx as u32) << PPOD_PGSZ_SHIFT) | tag_bits,
            max_offset,
            page_offset,
        }
    }
}

/// In-memory image of one pod record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagepod {
    pub header: PagepodHeader,
    pub rsvd: u64,
    pub addr: [u64; PPOD_ADDRS],
}

const _: () = assert!(mem::size_of::<Pagepod>() == PPOD_SIZE);

impl Pagepod {
    /// Pod covering `bus_addrs[first..first + 5]`, zero-filled past the end.
    pub fn new(header: PagepodHeader, bus_addrs: &[u64], first: usize) -> Self {
        let mut addr = [0u64; PPOD_ADDRS];
        for (j, slot) in addr.iter_mut().enumerate() {
            *slot = bus_addrs.get(first + j).copied().unwrap_or(0);
        }
        Pagepod {
            header,
            rsvd: 0,
            addr,
        }
    }

    /// Append the wire form of this pod to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.header.vld_tid);
        buf.put_u32(self.header.pgsz_tag_color);
        buf.put_u32(self.header.max_offset);
        buf.put_u32(self.header.page_offset);
        buf.put_u64(self.rsvd);
        for a in self.addr {
            buf.put_u64(a);
        }
    }
}

/// Adapter memory write carrying one or more consecutive pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemWrite {
    /// Destination in adapter memory, in 32-byte units.
    pub addr: u32,
    /// Number of pod records in `payload`.
    pub pods: usize,
    pub payload: Bytes,
}

impl MemWrite {
    /// Destination as a byte address.
    pub fn byte_addr(&self) -> u64 {
        (self.addr as u64) << 5
    }
}

/// Returned by a [`WorkQueue`] that cannot take another request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// Hardware work-request transport of an offloaded connection.
///
/// Submission is fire-and-forget: `Ok` means the request was queued, not
/// that the adapter has consumed it.
pub trait WorkQueue: Send + Sync + 'static {
    fn submit(&self, conn: &OffloadConn, request: MemWrite) -> Result<(), QueueFull>;
}

impl<T: WorkQueue + ?Sized> WorkQueue for Arc<T> {
    fn submit(&self, conn: &OffloadConn, request: MemWrite) -> Result<(), QueueFull> {
        (**self).submit(conn, request)
    }
}

/// Adapter-family hook that makes pods visible to (or hides them from) the
/// hardware. Injected into the manager at activation.
pub trait PagepodMap: Send + Sync + 'static {
    /// Program `gl.pod_count()` pods starting at `first_pod`.
    fn set_map(
        &self,
        conn: &OffloadConn,
        first_pod: usize,
        header: &PagepodHeader,
        gl: &GatherList,
    ) -> Result<(), Error>;

    /// Zero `count` pods starting at `first_pod`.
    fn clear_map(&self, conn: &OffloadConn, first_pod: usize, count: usize) -> Result<(), Error>;
}

/// [`PagepodMap`] that writes pods through memory-write work requests.
pub struct PagepodProgrammer<Q> {
    queue: Q,
    llimit: u32,
}

impl<Q: WorkQueue> PagepodProgrammer<Q> {
    /// Programmer for a pod window starting at adapter address `llimit`.
    pub fn new(queue: Q, llimit: u32) -> Self {
        PagepodProgrammer { queue, llimit }
    }

    /// Serialize `count` pods starting at `first_pod` into a single request.
    ///
    /// With `content = Some((header, gl, page))` pod `i` describes the
    /// list's pages from `page + 4 * i`; with `None` the pods are zeroed.
    pub fn write_pods(
        &self,
        conn: &OffloadConn,
        first_pod: usize,
        count: usize,
        content: Option<(&PagepodHeader, &GatherList, usize)>,
    ) -> Result<(), Error> {
        let mut buf = BytesMut::with_capacity(count * PPOD_SIZE);
        match content {
            Some((header, gl, page)) => {
                let addrs = gl.bus_addrs();
                for i in 0..count {
                    Pagepod::new(*header, addrs, page + i * PPOD_PAGES_MAX).encode(&mut buf);
                }
            }
            None => buf.put_bytes(0, count * PPOD_SIZE),
        }

        let byte_addr = self.llimit as u64 + ((first_pod as u64) << PPOD_SIZE_SHIFT);
        let request = MemWrite {
            addr: (byte_addr >> 5) as u32,
            pods: count,
            payload: buf.freeze(),
        };
        self.queue.submit(conn, request).map_err(|QueueFull| {
            tracing::debug!(tid = conn.tid, first_pod, count, "work request queue full");
            Error::ResourceExhausted(Exhausted::Transport)
        })
    }
}

impl<Q: WorkQueue> PagepodMap for PagepodProgrammer<Q> {
    fn set_map(
        &self,
        conn: &OffloadConn,
        first_pod: usize,
        header: &PagepodHeader,
        gl: &GatherList,
    ) -> Result<(), Error> {
        self.write_pods(conn, first_pod, gl.pod_count(), Some((header, gl, 0)))
    }

    fn clear_map(&self, conn: &OffloadConn, first_pod: usize, count: usize) -> Result<(), Error> {
        self.write_pods(conn, first_pod, count, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaMapError, DmaMapper};
    use crate::gather::{DDP_THRESHOLD, Segment};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<(OffloadConn, MemWrite)>>,
        full: bool,
    }

    impl WorkQueue for Recorder {
        fn submit(&self, conn: &OffloadConn, request: MemWrite) -> Result<(), QueueFull> {
            if self.full {
                return Err(QueueFull);
            }
            self.requests.lock().push((*conn, request));
            Ok(())
        }
    }

    struct Identity;

    impl DmaMapper for Identity {
        fn map(&self, page: u64, _len: usize) -> Result<u64, DmaMapError> {
            Ok(page)
        }
        fn unmap(&self, _bus_addr: u64, _len: usize) {}
    }

    const CONN: OffloadConn = OffloadConn {
        tid: 0x123,
        tx_queue: 2,
        port: 0,
    };

    fn be32(b: &[u8], at: usize) -> u32 {
        u32::from_be_bytes(b[at..at + 4].try_into().unwrap())
    }

    fn be64(b: &[u8], at: usize) -> u64 {
        u64::from_be_bytes(b[at..at + 8].try_into().unwrap())
    }

    fn mapped_list(pages: usize) -> GatherList {
        let mapper: Arc<dyn DmaMapper> = Arc::new(Identity);
        let len = pages * 4096;
        let mut gl =
            GatherList::build(len, &[Segment::new(0x100000, len)], 4096, DDP_THRESHOLD).unwrap();
        gl.map(&mapper).unwrap();
        gl
    }

    #[test]
    fn page_size_indices() {
        assert_eq!(page_size_index(4096), Some(0));
        assert_eq!(page_size_index(65536), Some(3));
        assert_eq!(page_size_index(2048), None);
    }

    #[test]
    fn header_fields() {
        let hdr = PagepodHeader::new(0x1ab_cdef, 0x145, 1, 9000, 512);
        assert_eq!(hdr.vld_tid, PPOD_VALID | 0xab_cdef);
        assert_eq!(hdr.pgsz_tag_color, (1 << 30) | 0x145);
        assert_eq!(hdr.max_offset, 9000);
        assert_eq!(hdr.page_offset, 512);
    }

    #[test]
    fn pod_wire_layout() {
        let hdr = PagepodHeader::new(7, 0x41, 0, 4096 * 6, 0);
        let addrs = [0x1000, 0x2000, 0x3000, 0x4000, 0x5000, 0x6000];
        let mut buf = BytesMut::new();
        Pagepod::new(hdr, &addrs, 4).encode(&mut buf);
        assert_eq!(buf.len(), PPOD_SIZE);
        assert_eq!(be32(&buf, 0), PPOD_VALID | 7);
        assert_eq!(be32(&buf, 4), 0x41);
        assert_eq!(be32(&buf, 8), 4096 * 6);
        assert_eq!(be32(&buf, 12), 0);
        assert_eq!(be64(&buf, 16), 0);
        assert_eq!(be64(&buf, 24), 0x5000);
        assert_eq!(be64(&buf, 32), 0x6000);
        assert_eq!(be64(&buf, 40), 0);
    }

    #[test]
    fn set_map_writes_all_pods_in_one_request() {
        let queue = Arc::new(Recorder::default());
        let programmer = PagepodProgrammer::new(queue.clone(), 0x8000);
        let gl = mapped_list(6);
        let hdr = PagepodHeader::new(CONN.tid, 0x80, 0, gl.length() as u32, 0);

        programmer.set_map(&CONN, 3, &hdr, &gl).unwrap();

        let requests = queue.requests.lock();
        assert_eq!(requests.len(), 1);
        let (conn, req) = &requests[0];
        assert_eq!(*conn, CONN);
        assert_eq!(req.pods, 2);
        assert_eq!(req.byte_addr(), 0x8000 + 3 * 64);
        assert_eq!(req.payload.len(), 2 * PPOD_SIZE);
        // Lookahead slot of pod 0 repeats the first page of pod 1.
        assert_eq!(be64(&req.payload, 24 + 4 * 8), 0x104000);
        assert_eq!(be64(&req.payload, 64 + 24), 0x104000);
        assert_eq!(be64(&req.payload, 64 + 24 + 8), 0x105000);
        assert_eq!(be64(&req.payload, 64 + 24 + 16), 0);
    }

    #[test]
    fn clear_map_zeroes_pods() {
        let queue = Arc::new(Recorder::default());
        let programmer = PagepodProgrammer::new(queue.clone(), 0);
        programmer.clear_map(&CONN, 10, 3).unwrap();

        let requests = queue.requests.lock();
        let (_, req) = &requests[0];
        assert_eq!(req.addr, (10 * 64) >> 5);
        assert_eq!(req.payload.len(), 3 * PPOD_SIZE);
        assert!(req.payload.iter().all(|&b| b == 0));
    }

    #[test]
    fn full_queue_is_exhaustion() {
        let queue = Recorder {
            full: true,
            ..Default::default()
        };
        let programmer = PagepodProgrammer::new(queue, 0);
        let err = programmer.clear_map(&CONN, 0, 1).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(Exhausted::Transport)));
    }
}
