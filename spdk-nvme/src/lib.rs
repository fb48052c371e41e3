//! Single-controller NVMe access over SPDK's user-space driver.
//!
//! A [`DeviceSession`] attaches to one PCIe NVMe controller, selects its
//! first namespace and allocates one I/O queue pair. Reads and writes are
//! submitted asynchronously with a DMA buffer per request and reaped by
//! polling the queue pair.
//!
//! # Quick Start
//!
//! ```
//! use spdk_nvme::{DeviceSession, IoRequest, SessionOptions};
//! use spdk_nvme::backend::sim::{SimDriver, SimNamespace};
//!
//! # fn main() -> spdk_nvme::Result<()> {
//! let driver = SimDriver::new();
//! driver.add_controller("0000:01:00.0", [SimNamespace::new(1_000_000, 512)])?;
//!
//! let mut session = DeviceSession::initialize(
//!     driver,
//!     "trtype=PCIE traddr=0000:01:00.0",
//!     SessionOptions::default(),
//! )?;
//!
//! let data = vec![0xa5u8; 4096];
//! session.submit(&IoRequest::write(0, 8, 4096), Some(data.as_slice()))?;
//! for done in session.drain()? {
//!     assert!(done.is_success());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! With the `spdk` feature, [`backend::spdk::SpdkDriver`] drives real
//! hardware through `spdk-nvme-sys`.
//!
//! # Modules
//!
//! - [`session`] - Controller attach and teardown
//! - [`io`] - Request submission and completion polling
//! - [`driver`] - The driver primitives a session is built on
//! - [`backend`] - SPDK and in-memory drivers
//! - [`transport`] - Transport identifier parsing
//! - [`opts`] - Session, environment and queue options
//! - [`dma`] - DMA-capable buffer allocation
//! - [`complete`] - Callback-to-completion utilities
//! - [`error`] - Error types

pub mod backend;
pub mod complete;
pub mod dma;
pub mod driver;
pub mod error;
pub mod io;
pub mod opts;
pub mod session;
pub mod transport;

// Re-exports
pub use complete::{CompletionReceiver, CompletionSender, completion};
pub use dma::{DMA_ALIGNMENT, DmaBuf};
pub use driver::{Driver, DriverResult, IoCommand, ProbeHandler, completion_status};
pub use error::{Error, ErrorKind, Result};
pub use io::{CompletedIo, Completions, InFlightIo, IoKind, IoRequest, RawIoRequest, RequestId};
pub use opts::{CtrlrOpts, EnvOpts, LogLevel, QpairOpts, SessionOptions, SessionOptionsBuilder};
pub use session::DeviceSession;
pub use transport::{PciAddress, TransportId, TransportType};
