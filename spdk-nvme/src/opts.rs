//! Session, environment, controller and queue pair options.

use crate::dma::DMA_ALIGNMENT;
use crate::error::{Error, Result};

/// The only namespace a session drives.
pub const DEFAULT_NAMESPACE_ID: u32 = 1;

/// Default environment name, used for hugepage files and logs.
pub const DEFAULT_ENV_NAME: &str = "spdk-nvme";

/// SPDK log levels (mirrors `enum spdk_log_level`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LogLevel {
    Disabled = -1,
    Error = 0,
    Warn = 1,
    Notice = 2,
    Info = 3,
    Debug = 4,
}

/// Environment (DMA memory subsystem) options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOpts {
    /// Process name, used for hugepage file names and logs
    pub name: String,
    /// Shared memory ID for multi-process mode (-1 = disabled)
    pub shm_id: i32,
    /// Hugepage memory to reserve in MB
    pub mem_size_mb: Option<i32>,
    /// Skip PCI scanning
    pub no_pci: bool,
    /// Use regular memory instead of hugepages
    pub no_huge: bool,
    /// SPDK print level
    pub log_level: Option<LogLevel>,
}

impl Default for EnvOpts {
    fn default() -> Self {
        Self {
            name: DEFAULT_ENV_NAME.to_string(),
            shm_id: 0,
            mem_size_mb: None,
            no_pci: false,
            no_huge: false,
            log_level: None,
        }
    }
}

/// NVMe controller options.
///
/// Applied to the driver's defaults in the probe callback, before the
/// controller is attached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CtrlrOpts {
    /// Number of I/O queues to request
    pub num_io_queues: Option<u32>,
    /// I/O queue depth
    pub io_queue_size: Option<u32>,
    /// Admin queue depth
    pub admin_queue_size: Option<u16>,
    /// Keep-alive timeout in ms (0 = disabled)
    pub keep_alive_timeout_ms: Option<u32>,
}

impl CtrlrOpts {
    /// Overlay the values set in `overrides` onto `self`.
    pub fn apply(&mut self, overrides: &CtrlrOpts) {
        if overrides.num_io_queues.is_some() {
            self.num_io_queues = overrides.num_io_queues;
        }
        if overrides.io_queue_size.is_some() {
            self.io_queue_size = overrides.io_queue_size;
        }
        if overrides.admin_queue_size.is_some() {
            self.admin_queue_size = overrides.admin_queue_size;
        }
        if overrides.keep_alive_timeout_ms.is_some() {
            self.keep_alive_timeout_ms = overrides.keep_alive_timeout_ms;
        }
    }
}

/// NVMe I/O queue pair options.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QpairOpts {
    /// Queue depth
    pub io_queue_size: Option<u32>,
    /// Queue requests
    pub io_queue_requests: Option<u32>,
    /// Batch submission doorbell writes (PCIe only)
    pub delay_pcie_doorbell: bool,
}

impl QpairOpts {
    /// Overlay the sizes set in `overrides` onto `self`.
    ///
    /// `delay_pcie_doorbell` is not carried over; the session decides it.
    pub fn apply(&mut self, overrides: &QpairOpts) {
        if overrides.io_queue_size.is_some() {
            self.io_queue_size = overrides.io_queue_size;
        }
        if overrides.io_queue_requests.is_some() {
            self.io_queue_requests = overrides.io_queue_requests;
        }
    }
}

/// Everything [`DeviceSession::initialize`](crate::DeviceSession::initialize) needs
/// besides the driver and the transport identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub env: EnvOpts,
    pub ctrlr: CtrlrOpts,
    pub qpair: QpairOpts,
    pub namespace_id: u32,
    pub dma_alignment: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            env: EnvOpts::default(),
            ctrlr: CtrlrOpts::default(),
            qpair: QpairOpts::default(),
            namespace_id: DEFAULT_NAMESPACE_ID,
            dma_alignment: DMA_ALIGNMENT,
        }
    }
}

impl SessionOptions {
    /// Create a new options builder.
    pub fn builder() -> SessionOptionsBuilder {
        SessionOptionsBuilder::new()
    }

    /// Check the options a driver cannot check for us.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOptions`] if `dma_alignment` is not a power of two or
    /// `namespace_id` is 0.
    pub fn validate(&self) -> Result<()> {
        if !self.dma_alignment.is_power_of_two() {
            return Err(Error::InvalidOptions(format!(
                "dma alignment {} is not a power of two",
                self.dma_alignment
            )));
        }
        if self.namespace_id == 0 {
            return Err(Error::InvalidOptions("namespace id 0 is reserved".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`SessionOptions`].
///
/// # Example
///
/// ```
/// use spdk_nvme::{LogLevel, SessionOptions};
///
/// let opts = SessionOptions::builder()
///     .name("bench")
///     .mem_size_mb(1024)
///     .log_level(LogLevel::Warn)
///     .io_queue_size(256)
///     .build();
/// assert_eq!(opts.env.name, "bench");
/// assert_eq!(opts.namespace_id, 1);
/// ```
#[derive(Debug, Default)]
pub struct SessionOptionsBuilder {
    opts: SessionOptions,
}

impl SessionOptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the environment name.
    pub fn name(mut self, name: &str) -> Self {
        self.opts.env.name = name.to_string();
        self
    }

    /// Set the shared memory ID for multi-process mode.
    ///
    /// Use -1 to disable shared memory (single process).
    pub fn shm_id(mut self, id: i32) -> Self {
        self.opts.env.shm_id = id;
        self
    }

    /// Set the amount of hugepage memory to reserve in MB.
    pub fn mem_size_mb(mut self, mb: i32) -> Self {
        self.opts.env.mem_size_mb = Some(mb);
        self
    }

    /// Disable PCI device scanning.
    pub fn no_pci(mut self, no_pci: bool) -> Self {
        self.opts.env.no_pci = no_pci;
        self
    }

    /// Disable hugepage allocation (use regular memory).
    pub fn no_huge(mut self, no_huge: bool) -> Self {
        self.opts.env.no_huge = no_huge;
        self
    }

    /// Set the log level for SPDK messages.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.opts.env.log_level = Some(level);
        self
    }

    /// Request a number of I/O queues from the controller.
    pub fn num_io_queues(mut self, n: u32) -> Self {
        self.opts.ctrlr.num_io_queues = Some(n);
        self
    }

    /// Set the controller keep-alive timeout.
    pub fn keep_alive_timeout_ms(mut self, ms: u32) -> Self {
        self.opts.ctrlr.keep_alive_timeout_ms = Some(ms);
        self
    }

    /// Set the I/O queue depth for the controller and the session's queue pair.
    pub fn io_queue_size(mut self, size: u32) -> Self {
        self.opts.ctrlr.io_queue_size = Some(size);
        self.opts.qpair.io_queue_size = Some(size);
        self
    }

    /// Set the number of request objects backing the queue pair.
    pub fn io_queue_requests(mut self, n: u32) -> Self {
        self.opts.qpair.io_queue_requests = Some(n);
        self
    }

    /// Set the DMA buffer alignment. Must be a power of two; 0 selects
    /// [`DMA_ALIGNMENT`].
    pub fn dma_alignment(mut self, align: usize) -> Self {
        self.opts.dma_alignment = if align == 0 { DMA_ALIGNMENT } else { align };
        self
    }

    /// Finish building.
    pub fn build(self) -> SessionOptions {
        self.opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SessionOptions::default();
        assert_eq!(opts.env.name, DEFAULT_ENV_NAME);
        assert_eq!(opts.env.shm_id, 0);
        assert_eq!(opts.namespace_id, 1);
        assert_eq!(opts.dma_alignment, 4096);
        assert!(!opts.qpair.delay_pcie_doorbell);
    }

    #[test]
    fn test_dma_alignment_validation() {
        let opts = SessionOptions::builder().dma_alignment(0).build();
        assert_eq!(opts.dma_alignment, DMA_ALIGNMENT);
        assert!(opts.validate().is_ok());

        let opts = SessionOptions::builder().dma_alignment(8192).build();
        assert_eq!(opts.dma_alignment, 8192);
        assert!(opts.validate().is_ok());

        let opts = SessionOptions {
            dma_alignment: 3000,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(Error::InvalidOptions(_))));

        let opts = SessionOptions {
            dma_alignment: 0,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn test_ctrlr_overlay_keeps_unset_fields() {
        let mut base = CtrlrOpts {
            num_io_queues: Some(8),
            io_queue_size: Some(128),
            admin_queue_size: Some(32),
            keep_alive_timeout_ms: Some(10_000),
        };
        base.apply(&CtrlrOpts {
            io_queue_size: Some(1024),
            ..Default::default()
        });
        assert_eq!(base.io_queue_size, Some(1024));
        assert_eq!(base.num_io_queues, Some(8));
        assert_eq!(base.keep_alive_timeout_ms, Some(10_000));
    }

    #[test]
    fn test_qpair_overlay_ignores_doorbell() {
        let mut base = QpairOpts {
            io_queue_size: Some(256),
            io_queue_requests: Some(512),
            delay_pcie_doorbell: true,
        };
        base.apply(&QpairOpts {
            io_queue_requests: Some(2048),
            delay_pcie_doorbell: false,
            ..Default::default()
        });
        assert_eq!(base.io_queue_size, Some(256));
        assert_eq!(base.io_queue_requests, Some(2048));
        assert!(base.delay_pcie_doorbell);
    }
}
