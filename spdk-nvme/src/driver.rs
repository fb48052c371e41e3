//! The NVMe driver contract a [`DeviceSession`](crate::DeviceSession) is built on.
//!
//! A [`Driver`] supplies the primitives: environment start-up, controller
//! probe/attach/detach, namespace queries, queue pair allocation, DMA memory
//! and command submission. The session only orchestrates them.
//!
//! Return codes follow SPDK conventions: `Err(rc)` carries a negative errno.
//!
//! Backends:
//! - [`SpdkDriver`](crate::backend::spdk::SpdkDriver) (feature `spdk`)
//! - [`SimDriver`](crate::backend::sim::SimDriver), an in-memory controller

use std::fmt;

use crate::complete::CompletionSender;
use crate::dma::DmaBuf;
use crate::error::{Error, Result};
use crate::io::IoKind;
use crate::opts::{CtrlrOpts, EnvOpts, QpairOpts};
use crate::transport::TransportId;

/// Result of a driver primitive; the error is a negative errno.
pub type DriverResult<T> = std::result::Result<T, i32>;

/// One read or write command handed to [`Driver::submit`].
///
/// `buf` points at `len` bytes of DMA memory owned by the session. It stays
/// valid until the command's completion sender fires or is dropped.
#[derive(Debug, Clone, Copy)]
pub struct IoCommand {
    pub kind: IoKind,
    pub buf: *mut u8,
    pub len: usize,
    pub lba: u64,
    pub lba_count: u32,
}

/// Receives the probe and attach callbacks of [`Driver::probe`].
pub trait ProbeHandler<D: Driver + ?Sized> {
    /// Decide whether to attach to a discovered controller. `opts` holds the
    /// driver defaults and may be adjusted before attaching.
    fn probe(&mut self, trid: &TransportId, opts: &mut CtrlrOpts) -> bool;

    /// A controller accepted by [`probe`](Self::probe) has been attached and
    /// its ownership passes to the handler.
    fn attach(&mut self, trid: &TransportId, ctrlr: D::Controller, opts: &CtrlrOpts);
}

/// Primitive NVMe driver operations.
///
/// Handles are opaque and `Copy`; the driver owns what they point to. Every
/// callback of [`probe`](Self::probe) runs before `probe` returns.
pub trait Driver {
    type Controller: Copy + PartialEq + fmt::Debug;
    type Namespace: Copy + PartialEq + fmt::Debug;
    type Qpair: Copy + PartialEq + fmt::Debug;

    /// Start the environment and DMA memory subsystem.
    fn init_env(&self, opts: &EnvOpts) -> DriverResult<()>;

    /// Enumerate controllers matching `trid`, calling back into `handler`.
    fn probe(&self, trid: &TransportId, handler: &mut dyn ProbeHandler<Self>) -> DriverResult<()>;

    /// Detach from a controller, releasing it.
    fn detach(&self, ctrlr: Self::Controller);

    /// Look up a namespace by id.
    fn namespace(&self, ctrlr: Self::Controller, nsid: u32) -> Option<Self::Namespace>;

    fn namespace_is_active(&self, ns: Self::Namespace) -> bool;

    /// Namespace size in logical blocks.
    fn namespace_num_sectors(&self, ns: Self::Namespace) -> u64;

    /// Logical block size in bytes.
    fn namespace_sector_size(&self, ns: Self::Namespace) -> u32;

    /// The controller's default I/O queue pair options.
    fn default_qpair_opts(&self, ctrlr: Self::Controller) -> QpairOpts;

    fn alloc_io_qpair(&self, ctrlr: Self::Controller, opts: &QpairOpts) -> Option<Self::Qpair>;

    /// Free a queue pair. Commands still outstanding on it are abandoned.
    fn free_io_qpair(&self, qpair: Self::Qpair);

    /// Allocate `size` bytes of DMA memory aligned to `align`.
    fn dma_alloc(&self, size: usize, align: usize) -> Option<DmaBuf>;

    /// Enqueue a command. `done` fires exactly once from within
    /// [`process_completions`](Self::process_completions), or is dropped if
    /// the command is abandoned. On `Err` the command was not enqueued.
    fn submit(
        &self,
        ns: Self::Namespace,
        qpair: Self::Qpair,
        cmd: IoCommand,
        done: CompletionSender<()>,
    ) -> DriverResult<()>;

    /// Reap up to `max_completions` completions (0 = unlimited). Returns the
    /// number processed.
    fn process_completions(&self, qpair: Self::Qpair, max_completions: u32) -> DriverResult<u32>;
}

/// Map an NVMe completion status to a result.
///
/// A command is successful iff both the status code type and the status
/// code are 0.
pub fn completion_status(sct: u8, sc: u8) -> Result<()> {
    if sct == 0 && sc == 0 {
        Ok(())
    } else {
        Err(Error::NvmeError { sct, sc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_status() {
        assert!(completion_status(0, 0).is_ok());
        assert!(matches!(
            completion_status(2, 0x81),
            Err(Error::NvmeError { sct: 2, sc: 0x81 })
        ));
    }
}
