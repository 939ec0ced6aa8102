use crate::error::Error;
use crate::gather::DDP_THRESHOLD;
use crate::pagepod::{PPOD_SIZE_SHIFT, page_size_index};

/// Largest PDU the adapter handles in either direction.
pub const ULP2_MAX_PKT_SIZE: usize = 16224;
/// Worst-case iSCSI framing overhead: BHS (48) + AHS (256) + two digests (8).
pub const ISCSI_PDU_NONPAYLOAD_LEN: usize = 312;

/// Configuration for one adapter's placement manager and receive pool.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hardware pagepod window and host page size.
    pub pagepod: PagepodConfig,
    /// Transfers of this many bytes or fewer are never placed directly.
    pub ddp_threshold: usize,
    /// Adapter transmit PDU limit in bytes (framing included).
    pub max_tx_pdu: usize,
    /// Adapter receive PDU limit in bytes (framing included).
    pub max_rx_pdu: usize,
    /// Receive dispatch pool sizing.
    pub dispatch: DispatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pagepod: PagepodConfig::default(),
            ddp_threshold: DDP_THRESHOLD,
            max_tx_pdu: ULP2_MAX_PKT_SIZE,
            max_rx_pdu: ULP2_MAX_PKT_SIZE,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        self.pagepod.validate()?;
        if self.max_tx_pdu <= ISCSI_PDU_NONPAYLOAD_LEN + 512
            || self.max_rx_pdu <= ISCSI_PDU_NONPAYLOAD_LEN + 512
        {
            return Err(Error::Config(format!(
                "max_tx_pdu and max_rx_pdu must exceed {} bytes",
                ISCSI_PDU_NONPAYLOAD_LEN + 512
            )));
        }
        if self.dispatch.ports == 0 {
            return Err(Error::Config("dispatch.ports must be > 0".into()));
        }
        Ok(())
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Location of the pagepod region in adapter memory.
#[derive(Debug, Clone)]
pub struct PagepodConfig {
    /// First byte of the pagepod region.
    pub llimit: u32,
    /// Last byte of the pagepod region (inclusive).
    pub ulimit: u32,
    /// Host page size used for placement. Must be 4K, 8K, 16K or 64K.
    pub page_size: usize,
}

impl Default for PagepodConfig {
    fn default() -> Self {
        // 8K pods.
        Self {
            llimit: 0,
            ulimit: (8192 << PPOD_SIZE_SHIFT) - 1,
            page_size: 4096,
        }
    }
}

impl PagepodConfig {
    /// Number of pod records the region can hold.
    pub fn ppmax(&self) -> u32 {
        if self.ulimit < self.llimit {
            return 0;
        }
        ((self.ulimit as u64 - self.llimit as u64 + 1) >> PPOD_SIZE_SHIFT) as u32
    }

    fn validate(&self) -> Result<(), Error> {
        if page_size_index(self.page_size).is_none() {
            return Err(Error::Config(format!(
                "page size {} not supported for placement",
                self.page_size
            )));
        }
        if self.ulimit < self.llimit {
            return Err(Error::Config(format!(
                "pagepod window {:#x}..={:#x} is empty",
                self.llimit, self.ulimit
            )));
        }
        if self.llimit & 31 != 0 {
            return Err(Error::Config(
                "pagepod window must start on a 32-byte boundary".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the receive dispatch pool.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of worker threads. 0 = online CPUs, capped at 32.
    pub workers: usize,
    /// Adapter ports; connections on one port share a band of workers.
    pub ports: u8,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            ports: 1,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use iscsi_ddp::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .pagepod_window(0x10_0000, 0x10_0000 + (4096 << 6) - 1)
///     .page_size(4096)
///     .workers(4)
///     .ports(2)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Placement settings ───────────────────────────────────────────

    /// Set the pagepod region `[llimit, ulimit]` in adapter memory.
    pub fn pagepod_window(mut self, llimit: u32, ulimit: u32) -> Self {
        self.config.pagepod.llimit = llimit;
        self.config.pagepod.ulimit = ulimit;
        self
    }

    /// Set the host page size used for placement.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.config.pagepod.page_size = page_size;
        self
    }

    pub fn ddp_threshold(mut self, threshold: usize) -> Self {
        self.config.ddp_threshold = threshold;
        self
    }

    /// Set the adapter PDU limits for transmit and receive.
    pub fn max_pdu(mut self, tx: usize, rx: usize) -> Self {
        self.config.max_tx_pdu = tx;
        self.config.max_rx_pdu = rx;
        self
    }

    // ── Dispatch settings ────────────────────────────────────────────

    /// Set the number of receive workers. 0 = online CPUs, capped at 32.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.dispatch.workers = n;
        self
    }

    pub fn ports(mut self, n: u8) -> Self {
        self.config.dispatch.ports = n;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
