//! In-memory NVMe driver.
//!
//! [`SimDriver`] models a set of PCIe controllers with namespaces backed by
//! memory. It behaves like the SPDK driver in the ways a session can
//! observe: probe invokes the callbacks synchronously, commands complete only
//! when the queue pair is polled, out-of-range I/O is accepted and completes
//! with *LBA Out of Range*, and freeing a queue pair abandons its outstanding
//! commands.
//!
//! Faults can be injected with [`SimFaults`], and the driver counts what it
//! has handed out so tests can check that everything comes back.
//!
//! ```
//! use spdk_nvme::backend::sim::{SimDriver, SimNamespace};
//!
//! let driver = SimDriver::new();
//! driver
//!     .add_controller("0000:01:00.0", [SimNamespace::new(1024, 512)])
//!     .unwrap();
//! assert_eq!(driver.live_controllers(), 0);
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::complete::CompletionSender;
use crate::dma::DmaBuf;
use crate::driver::{Driver, DriverResult, IoCommand, ProbeHandler, completion_status};
use crate::error::Result;
use crate::io::IoKind;
use crate::opts::{CtrlrOpts, EnvOpts, QpairOpts};
use crate::transport::{PciAddress, TransportId};

/// Geometry of a simulated namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimNamespace {
    pub num_sectors: u64,
    pub sector_size: u32,
    pub active: bool,
}

impl SimNamespace {
    /// An active namespace.
    pub fn new(num_sectors: u64, sector_size: u32) -> Self {
        Self {
            num_sectors,
            sector_size,
            active: true,
        }
    }

    /// Mark the namespace inactive.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Failures the simulator can be told to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// `init_env` fails with this code
    pub env_init_rc: Option<i32>,
    /// `probe` fails with this code without calling back
    pub probe_rc: Option<i32>,
    /// `alloc_io_qpair` returns nothing
    pub qpair_alloc: bool,
    /// `dma_alloc` returns nothing
    pub dma_alloc: bool,
    /// `submit` fails with this code
    pub submit_rc: Option<i32>,
    /// Commands complete with this (sct, sc) status
    pub completion_status: Option<(u8, u8)>,
    /// Commands never complete
    pub hold_completions: bool,
    /// Polling completes the most recently submitted commands first
    pub complete_newest_first: bool,
    /// Polling drops commands without completing them
    pub abandon_commands: bool,
}

/// Generic command status type.
pub const SCT_GENERIC: u8 = 0x0;

/// Generic status *LBA Out of Range*.
pub const SC_LBA_OUT_OF_RANGE: u8 = 0x80;

/// Simulated controller handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimCtrlr(usize);

/// Simulated namespace handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimNs {
    ctrlr: usize,
    nsid: u32,
}

/// Simulated queue pair handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimQpair(usize);

/// SPDK's stock controller defaults.
fn default_ctrlr_opts() -> CtrlrOpts {
    CtrlrOpts {
        num_io_queues: Some(1024),
        io_queue_size: Some(256),
        admin_queue_size: Some(32),
        keep_alive_timeout_ms: Some(10_000),
    }
}

struct Controller {
    addr: PciAddress,
    namespaces: Vec<SimNamespace>,
    /// Blocks that have been written, keyed by (nsid, lba).
    blocks: HashMap<(u32, u64), Vec<u8>>,
    attached: bool,
    opts: Option<CtrlrOpts>,
}

struct Pending {
    ns: SimNs,
    cmd: IoCommand,
    in_range: bool,
    done: CompletionSender<()>,
}

struct Qpair {
    ctrlr: usize,
    opts: QpairOpts,
    pending: VecDeque<Pending>,
}

#[derive(Default)]
struct State {
    controllers: Vec<Controller>,
    qpairs: Vec<Option<Qpair>>,
    env: Option<EnvOpts>,
    faults: SimFaults,
    dispatched: u64,
}

/// In-memory NVMe driver.
///
/// Clones share the same simulated hardware, so a test can keep a handle
/// while a session owns another.
#[derive(Default, Clone)]
pub struct SimDriver {
    state: Rc<RefCell<State>>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller at `addr` with namespaces numbered from 1.
    ///
    /// Several controllers may share an address; probing that address then
    /// attaches each of them in insertion order.
    pub fn add_controller(
        &self,
        addr: &str,
        namespaces: impl IntoIterator<Item = SimNamespace>,
    ) -> Result<SimCtrlr> {
        let addr = PciAddress::parse(addr)?;
        let mut state = self.state.borrow_mut();
        state.controllers.push(Controller {
            addr,
            namespaces: namespaces.into_iter().collect(),
            blocks: HashMap::new(),
            attached: false,
            opts: None,
        });
        Ok(SimCtrlr(state.controllers.len() - 1))
    }

    /// Replace the injected faults.
    pub fn set_faults(&self, faults: SimFaults) {
        self.state.borrow_mut().faults = faults;
    }

    /// Builder-style [`set_faults`](Self::set_faults).
    pub fn with_faults(self, faults: SimFaults) -> Self {
        self.set_faults(faults);
        self
    }

    /// Commands accepted by `submit` so far.
    pub fn dispatched(&self) -> u64 {
        self.state.borrow().dispatched
    }

    /// Controllers attached and not yet detached.
    pub fn live_controllers(&self) -> usize {
        self.state
            .borrow()
            .controllers
            .iter()
            .filter(|c| c.attached)
            .count()
    }

    /// Queue pairs allocated and not yet freed.
    pub fn live_qpairs(&self) -> usize {
        self.state.borrow().qpairs.iter().flatten().count()
    }

    /// Commands enqueued on `qpair` and not yet completed.
    pub fn outstanding(&self, qpair: SimQpair) -> usize {
        self.state
            .borrow()
            .qpairs
            .get(qpair.0)
            .and_then(Option::as_ref)
            .map_or(0, |q| q.pending.len())
    }

    /// Options `init_env` was called with.
    pub fn env_opts(&self) -> Option<EnvOpts> {
        self.state.borrow().env.clone()
    }

    /// Options a queue pair was allocated with.
    pub fn qpair_opts(&self, qpair: SimQpair) -> Option<QpairOpts> {
        self.state
            .borrow()
            .qpairs
            .get(qpair.0)
            .and_then(Option::as_ref)
            .map(|q| q.opts.clone())
    }

    /// Controller options chosen in the probe callback.
    pub fn controller_opts(&self, ctrlr: SimCtrlr) -> Option<CtrlrOpts> {
        self.state
            .borrow()
            .controllers
            .get(ctrlr.0)
            .and_then(|c| c.opts.clone())
    }

    /// Current contents of `count` blocks starting at `lba`. Unwritten
    /// blocks read as zeroes.
    pub fn read_blocks(&self, ctrlr: SimCtrlr, nsid: u32, lba: u64, count: u32) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let c = state.controllers.get(ctrlr.0)?;
        let ns = c.namespaces.get(nsid.checked_sub(1)? as usize)?;
        let ss = ns.sector_size as usize;

        let mut out = vec![0u8; ss * count as usize];
        for (i, chunk) in out.chunks_mut(ss).enumerate() {
            if let Some(block) = c.blocks.get(&(nsid, lba + i as u64)) {
                chunk.copy_from_slice(block);
            }
        }
        Some(out)
    }

    /// Store `data` (a whole number of blocks) at `lba`.
    pub fn write_blocks(&self, ctrlr: SimCtrlr, nsid: u32, lba: u64, data: &[u8]) -> Option<()> {
        let mut state = self.state.borrow_mut();
        let c = state.controllers.get_mut(ctrlr.0)?;
        let ns = c.namespaces.get(nsid.checked_sub(1)? as usize)?;
        let ss = ns.sector_size as usize;
        if data.len() % ss != 0 {
            return None;
        }
        for (i, chunk) in data.chunks(ss).enumerate() {
            c.blocks.insert((nsid, lba + i as u64), chunk.to_vec());
        }
        Some(())
    }

    fn ns_geometry(state: &State, ns: SimNs) -> Option<SimNamespace> {
        let c = state.controllers.get(ns.ctrlr)?;
        c.namespaces.get(ns.nsid.checked_sub(1)? as usize).copied()
    }

    /// Move data between a command's buffer and the backing blocks.
    fn execute(state: &mut State, p: &Pending) {
        let Some(geometry) = Self::ns_geometry(state, p.ns) else {
            return;
        };
        let ss = geometry.sector_size as usize;
        let Some(c) = state.controllers.get_mut(p.ns.ctrlr) else {
            return;
        };
        // SAFETY: the session keeps the buffer alive until the completion
        // fires, and submit checked that it covers lba_count blocks.
        let buf = unsafe { std::slice::from_raw_parts_mut(p.cmd.buf, p.cmd.len) };

        for (i, chunk) in buf.chunks_mut(ss).take(p.cmd.lba_count as usize).enumerate() {
            let key = (p.ns.nsid, p.cmd.lba + i as u64);
            match p.cmd.kind {
                IoKind::Write => {
                    c.blocks.insert(key, chunk.to_vec());
                }
                IoKind::Read => match c.blocks.get(&key) {
                    Some(block) => chunk.copy_from_slice(block),
                    None => chunk.fill(0),
                },
            }
        }
    }
}

impl Driver for SimDriver {
    type Controller = SimCtrlr;
    type Namespace = SimNs;
    type Qpair = SimQpair;

    fn init_env(&self, opts: &EnvOpts) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        if let Some(rc) = state.faults.env_init_rc {
            return Err(rc);
        }
        state.env = Some(opts.clone());
        Ok(())
    }

    fn probe(&self, trid: &TransportId, handler: &mut dyn ProbeHandler<Self>) -> DriverResult<()> {
        let matching: Vec<usize> = {
            let state = self.state.borrow();
            if let Some(rc) = state.faults.probe_rc {
                return Err(rc);
            }
            if state.env.is_none() {
                return Err(-libc::ENODEV);
            }
            state
                .controllers
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.attached && c.addr == trid.pci_address())
                .map(|(i, _)| i)
                .collect()
        };

        // Callbacks re-enter the driver, so no borrow is held across them.
        for idx in matching {
            let ctrlr_trid = TransportId::from_pci_address(trid.pci_address());
            let mut opts = default_ctrlr_opts();
            if !handler.probe(&ctrlr_trid, &mut opts) {
                continue;
            }
            {
                let mut state = self.state.borrow_mut();
                let c = &mut state.controllers[idx];
                c.attached = true;
                c.opts = Some(opts.clone());
            }
            handler.attach(&ctrlr_trid, SimCtrlr(idx), &opts);
        }
        Ok(())
    }

    fn detach(&self, ctrlr: SimCtrlr) {
        if let Some(c) = self.state.borrow_mut().controllers.get_mut(ctrlr.0) {
            c.attached = false;
        }
    }

    fn namespace(&self, ctrlr: SimCtrlr, nsid: u32) -> Option<SimNs> {
        let state = self.state.borrow();
        let c = state.controllers.get(ctrlr.0)?;
        if nsid == 0 || nsid as usize > c.namespaces.len() {
            return None;
        }
        Some(SimNs {
            ctrlr: ctrlr.0,
            nsid,
        })
    }

    fn namespace_is_active(&self, ns: SimNs) -> bool {
        Self::ns_geometry(&self.state.borrow(), ns).is_some_and(|g| g.active)
    }

    fn namespace_num_sectors(&self, ns: SimNs) -> u64 {
        Self::ns_geometry(&self.state.borrow(), ns).map_or(0, |g| g.num_sectors)
    }

    fn namespace_sector_size(&self, ns: SimNs) -> u32 {
        Self::ns_geometry(&self.state.borrow(), ns).map_or(0, |g| g.sector_size)
    }

    fn default_qpair_opts(&self, _ctrlr: SimCtrlr) -> QpairOpts {
        QpairOpts {
            io_queue_size: Some(256),
            io_queue_requests: Some(512),
            delay_pcie_doorbell: true,
        }
    }

    fn alloc_io_qpair(&self, ctrlr: SimCtrlr, opts: &QpairOpts) -> Option<SimQpair> {
        let mut state = self.state.borrow_mut();
        if state.faults.qpair_alloc || !state.controllers.get(ctrlr.0)?.attached {
            return None;
        }
        state.qpairs.push(Some(Qpair {
            ctrlr: ctrlr.0,
            opts: opts.clone(),
            pending: VecDeque::new(),
        }));
        Some(SimQpair(state.qpairs.len() - 1))
    }

    fn free_io_qpair(&self, qpair: SimQpair) {
        // Dropping the pending commands drops their completion senders.
        let freed = self
            .state
            .borrow_mut()
            .qpairs
            .get_mut(qpair.0)
            .and_then(Option::take);
        drop(freed);
    }

    fn dma_alloc(&self, size: usize, align: usize) -> Option<DmaBuf> {
        if self.state.borrow().faults.dma_alloc {
            return None;
        }
        DmaBuf::alloc_host(size, align).ok()
    }

    fn submit(
        &self,
        ns: SimNs,
        qpair: SimQpair,
        cmd: IoCommand,
        done: CompletionSender<()>,
    ) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        if let Some(rc) = state.faults.submit_rc {
            return Err(rc);
        }

        let geometry = Self::ns_geometry(&state, ns).ok_or(-libc::EINVAL)?;
        let in_range = cmd
            .lba
            .checked_add(u64::from(cmd.lba_count))
            .is_some_and(|end| end <= geometry.num_sectors);
        let covered = cmd.len as u64 >= u64::from(cmd.lba_count) * u64::from(geometry.sector_size);
        // Out-of-range commands are queued and fail at completion.
        if !geometry.active || cmd.lba_count == 0 || !covered {
            return Err(-libc::EINVAL);
        }

        let q = state
            .qpairs
            .get_mut(qpair.0)
            .and_then(Option::as_mut)
            .filter(|q| q.ctrlr == ns.ctrlr)
            .ok_or(-libc::EINVAL)?;
        q.pending.push_back(Pending {
            ns,
            cmd,
            in_range,
            done,
        });
        state.dispatched += 1;
        Ok(())
    }

    fn process_completions(&self, qpair: SimQpair, max_completions: u32) -> DriverResult<u32> {
        let mut state = self.state.borrow_mut();
        if state.faults.hold_completions {
            return Ok(0);
        }
        let faults = state.faults.clone();

        let q = state
            .qpairs
            .get_mut(qpair.0)
            .and_then(Option::as_mut)
            .ok_or(-libc::ENXIO)?;
        let n = match max_completions {
            0 => q.pending.len(),
            max => q.pending.len().min(max as usize),
        };
        let batch: Vec<Pending> = if faults.complete_newest_first {
            let len = q.pending.len();
            q.pending.drain(len - n..).rev().collect()
        } else {
            q.pending.drain(..n).collect()
        };

        if faults.abandon_commands {
            drop(state);
            // Dropping the senders cancels the commands.
            drop(batch);
            return Ok(n as u32);
        }

        let mut results = Vec::with_capacity(batch.len());
        for p in &batch {
            let result = match faults.completion_status {
                Some((sct, sc)) => completion_status(sct, sc),
                None if !p.in_range => completion_status(SCT_GENERIC, SC_LBA_OUT_OF_RANGE),
                None => {
                    Self::execute(&mut state, p);
                    Ok(())
                }
            };
            results.push(result);
        }
        drop(state);

        for (p, result) in batch.into_iter().zip(results) {
            p.done.complete(result);
        }
        Ok(n as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complete::completion;
    use crate::error::Error;

    struct AcceptAll {
        attached: Vec<SimCtrlr>,
    }

    impl ProbeHandler<SimDriver> for AcceptAll {
        fn probe(&mut self, _trid: &TransportId, _opts: &mut CtrlrOpts) -> bool {
            true
        }

        fn attach(&mut self, _trid: &TransportId, ctrlr: SimCtrlr, _opts: &CtrlrOpts) {
            self.attached.push(ctrlr);
        }
    }

    fn attached_driver() -> (SimDriver, SimCtrlr) {
        let driver = SimDriver::new();
        driver
            .add_controller("0000:01:00.0", [SimNamespace::new(64, 512)])
            .unwrap();
        driver.init_env(&EnvOpts::default()).unwrap();

        let mut handler = AcceptAll { attached: vec![] };
        let trid = TransportId::pcie("0000:01:00.0").unwrap();
        driver.probe(&trid, &mut handler).unwrap();
        assert_eq!(handler.attached.len(), 1);
        (driver, handler.attached[0])
    }

    #[test]
    fn test_probe_requires_env() {
        let driver = SimDriver::new();
        driver
            .add_controller("0000:01:00.0", [SimNamespace::new(64, 512)])
            .unwrap();
        let mut handler = AcceptAll { attached: vec![] };
        let trid = TransportId::pcie("0000:01:00.0").unwrap();
        assert_eq!(driver.probe(&trid, &mut handler), Err(-libc::ENODEV));
        assert!(handler.attached.is_empty());
    }

    #[test]
    fn test_attached_controller_not_probed_again() {
        let (driver, _ctrlr) = attached_driver();
        let mut handler = AcceptAll { attached: vec![] };
        let trid = TransportId::pcie("0000:01:00.0").unwrap();
        driver.probe(&trid, &mut handler).unwrap();
        assert!(handler.attached.is_empty());
        assert_eq!(driver.live_controllers(), 1);
    }

    #[test]
    fn test_free_qpair_cancels_outstanding() {
        let (driver, ctrlr) = attached_driver();
        let qpair = driver
            .alloc_io_qpair(ctrlr, &driver.default_qpair_opts(ctrlr))
            .unwrap();
        let ns = driver.namespace(ctrlr, 1).unwrap();

        let mut buf = DmaBuf::alloc_host(512, 4096).unwrap();
        let cmd = IoCommand {
            kind: IoKind::Read,
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            lba: 0,
            lba_count: 1,
        };
        let (tx, mut rx) = completion();
        driver.submit(ns, qpair, cmd, tx).unwrap();
        assert_eq!(driver.outstanding(qpair), 1);

        driver.free_io_qpair(qpair);
        assert!(matches!(rx.try_take(), Some(Err(Error::Cancelled))));
        assert_eq!(driver.live_qpairs(), 0);
    }
}
