//! Device session: one attached controller, one namespace, one queue pair.
//!
//! # Lifecycle
//!
//! ```text
//!  initialize(driver, "trtype=PCIE traddr=...", opts)
//!        │  parse transport id ──► Config error
//!        │  init env          ──► EnvInit error
//!        │  probe ─► probe cb (accept) ─► attach cb
//!        ▼                                  │ ns 1, active, geometry,
//!  DeviceSession (attached) ◄───────────────┘ qpair (doorbell delay off)
//!        │
//!        │  submit / process_completions   (see crate::io)
//!        ▼
//!  teardown(): free qpair, detach controller, release in-flight buffers
//! ```
//!
//! Dropping a session runs [`DeviceSession::teardown`].

use log::{debug, error, info, warn};

use crate::driver::{Driver, ProbeHandler};
use crate::error::{Error, Result};
use crate::io::IoQueue;
use crate::opts::{CtrlrOpts, SessionOptions};
use crate::transport::TransportId;

/// Controller, namespace and queue pair state of a session.
pub(crate) struct Attachment<D: Driver> {
    pub(crate) ctrlr: Option<D::Controller>,
    pub(crate) ctrlr_opts: Option<CtrlrOpts>,
    pub(crate) trid: Option<TransportId>,
    pub(crate) ns: Option<D::Namespace>,
    pub(crate) qpair: Option<D::Qpair>,
    pub(crate) namespace_size: u64,
    pub(crate) sector_size: u32,
}

impl<D: Driver> Attachment<D> {
    fn empty() -> Self {
        Self {
            ctrlr: None,
            ctrlr_opts: None,
            trid: None,
            ns: None,
            qpair: None,
            namespace_size: 0,
            sector_size: 0,
        }
    }

    /// Forget the namespace and its geometry.
    fn clear_namespace(&mut self) {
        self.ns = None;
        self.namespace_size = 0;
        self.sector_size = 0;
    }

    fn attach(
        &mut self,
        driver: &D,
        opts: &SessionOptions,
        trid: &TransportId,
        ctrlr: D::Controller,
        ctrlr_opts: &CtrlrOpts,
    ) -> Result<()> {
        if self.qpair.is_some() {
            warn!("Already attached to a qpair, rejecting controller at {}", trid.address());
            if self.ctrlr != Some(ctrlr) {
                driver.detach(ctrlr);
            }
            return Err(Error::AlreadyAttached);
        }

        self.clear_namespace();

        // A previous attach that failed part-way leaves its controller behind.
        if let Some(stale) = self.ctrlr.take()
            && stale != ctrlr
        {
            debug!("Detaching partially attached controller {:?}", stale);
            driver.detach(stale);
        }

        self.ctrlr = Some(ctrlr);
        self.ctrlr_opts = Some(ctrlr_opts.clone());
        self.trid = Some(trid.clone());

        let nsid = opts.namespace_id;
        let ns = driver.namespace(ctrlr, nsid).ok_or_else(|| {
            error!("Can't get namespace by id {}", nsid);
            Error::NamespaceNotFound(nsid)
        })?;

        if !driver.namespace_is_active(ns) {
            error!("Inactive namespace at id {}", nsid);
            return Err(Error::NamespaceInactive(nsid));
        }

        let num_sectors = driver.namespace_num_sectors(ns);
        let sector_size = driver.namespace_sector_size(ns);
        if num_sectors == 0 || sector_size == 0 {
            error!(
                "Unable to get namespace size for namespace {} ({} sectors of {} bytes)",
                nsid, num_sectors, sector_size
            );
            return Err(Error::InvalidGeometry {
                nsid,
                num_sectors,
                sector_size,
            });
        }
        let mut qpair_opts = driver.default_qpair_opts(ctrlr);
        qpair_opts.apply(&opts.qpair);
        qpair_opts.delay_pcie_doorbell = false;

        let qpair = driver.alloc_io_qpair(ctrlr, &qpair_opts).ok_or_else(|| {
            error!("Unable to allocate nvme qpair");
            Error::QpairAlloc
        })?;
        self.qpair = Some(qpair);
        self.ns = Some(ns);
        self.namespace_size = num_sectors;
        self.sector_size = sector_size;

        info!(
            "Attached to {} namespace {}: {} blocks of {} bytes",
            trid.address(),
            nsid,
            num_sectors,
            sector_size
        );
        Ok(())
    }
}

/// Forwards driver callbacks into the session being populated.
struct Prober<'a, D: Driver> {
    driver: &'a D,
    opts: &'a SessionOptions,
    state: &'a mut Attachment<D>,
    last_error: Option<Error>,
}

impl<D: Driver> ProbeHandler<D> for Prober<'_, D> {
    fn probe(&mut self, trid: &TransportId, opts: &mut CtrlrOpts) -> bool {
        debug!("Probing controller at {}", trid.address());
        opts.apply(&self.opts.ctrlr);
        true
    }

    fn attach(&mut self, trid: &TransportId, ctrlr: D::Controller, opts: &CtrlrOpts) {
        match self.state.attach(self.driver, self.opts, trid, ctrlr, opts) {
            Ok(()) => self.last_error = None,
            // Logged by attach. The session keeps its first queue pair.
            Err(Error::AlreadyAttached) => {}
            Err(e) => self.last_error = Some(e),
        }
    }
}

/// One attached NVMe controller with an active namespace and an I/O queue pair.
///
/// # Example
///
/// ```
/// use spdk_nvme::{DeviceSession, IoRequest, SessionOptions};
/// use spdk_nvme::backend::sim::{SimDriver, SimNamespace};
///
/// # fn main() -> spdk_nvme::Result<()> {
/// let driver = SimDriver::new();
/// driver.add_controller("0000:01:00.0", [SimNamespace::new(1_000_000, 512)])?;
///
/// let mut session = DeviceSession::initialize(
///     driver,
///     "trtype=PCIE traddr=0000:01:00.0",
///     SessionOptions::default(),
/// )?;
/// assert_eq!(session.namespace_size(), 1_000_000);
/// assert_eq!(session.sector_size(), 512);
///
/// let id = session.submit(&IoRequest::read(0, 8, 4096), None)?;
/// let done = session.wait(id)?;
/// assert!(done.status.is_ok());
///
/// session.teardown();
/// # Ok(())
/// # }
/// ```
pub struct DeviceSession<D: Driver> {
    pub(crate) driver: D,
    pub(crate) opts: SessionOptions,
    pub(crate) state: Attachment<D>,
    pub(crate) io: IoQueue,
}

impl<D: Driver> DeviceSession<D> {
    /// Create an empty, unattached session.
    ///
    /// Populate it with [`attach`](Self::attach), or use
    /// [`initialize`](Self::initialize) which probes for the controller.
    pub fn new(driver: D, opts: SessionOptions) -> Self {
        Self {
            driver,
            opts,
            state: Attachment::empty(),
            io: IoQueue::new(),
        }
    }

    /// Attach to the controller named by `trid` and set up namespace and queue pair.
    ///
    /// `trid` has the form `trtype=<type> traddr=<address>`; only PCIe is
    /// supported. The transport id is validated before anything is
    /// initialized, so a malformed one acquires no resources.
    ///
    /// # Errors
    ///
    /// - configuration errors for a malformed or unsupported `trid`, or
    ///   options rejected by [`SessionOptions::validate`]
    /// - [`Error::EnvInit`] if the environment could not start
    /// - [`Error::ProbeFailed`] / [`Error::ControllerNotFound`] from discovery
    /// - the attach error of the matched controller
    ///
    /// On error every resource acquired so far has been released.
    pub fn initialize(driver: D, trid: &str, opts: SessionOptions) -> Result<Self> {
        let trid = TransportId::parse(trid).inspect_err(|e| {
            error!("Failed to parse transport type and device {}: {}", trid, e);
        })?;
        opts.validate().inspect_err(|e| error!("{}", e))?;

        let mut session = Self::new(driver, opts);

        session.driver.init_env(&session.opts.env).map_err(|rc| {
            error!("Unable to initialize spdk environment (rc {})", rc);
            Error::EnvInit(format!("env init failed with error code {rc}"))
        })?;

        session.probe(&trid)?;
        Ok(session)
    }

    fn probe(&mut self, trid: &TransportId) -> Result<()> {
        let mut prober = Prober {
            driver: &self.driver,
            opts: &self.opts,
            state: &mut self.state,
            last_error: None,
        };

        if let Err(rc) = self.driver.probe(trid, &mut prober) {
            error!("spdk_nvme_probe() failed for {} (rc {})", trid, rc);
            return Err(Error::ProbeFailed(rc));
        }
        let last_error = prober.last_error;

        if self.is_attached() {
            return Ok(());
        }
        match last_error {
            Some(e) => Err(e),
            None => {
                error!("No NVMe controller found at {}", trid.address());
                Err(Error::ControllerNotFound)
            }
        }
    }

    /// Complete session population for an attached controller.
    ///
    /// Records the controller, options and transport id, selects the
    /// configured namespace (1 by default), checks it is active and has a
    /// valid geometry, and allocates the queue pair with doorbell delay
    /// disabled. The session supports exactly one queue pair: a second attach
    /// returns [`Error::AlreadyAttached`] and leaves the existing one untouched.
    ///
    /// The session takes ownership of `ctrlr`; it is released by
    /// [`teardown`](Self::teardown), or immediately if rejected.
    pub fn attach(&mut self, trid: &TransportId, ctrlr: D::Controller, opts: &CtrlrOpts) -> Result<()> {
        if let Err(e) = self.opts.validate() {
            error!("Rejecting controller at {}: {}", trid.address(), e);
            if self.state.ctrlr != Some(ctrlr) {
                self.driver.detach(ctrlr);
            }
            return Err(e);
        }
        self.state.attach(&self.driver, &self.opts, trid, ctrlr, opts)
    }

    /// Release the queue pair and detach the controller.
    ///
    /// Safe to call on a partially populated or already torn down session.
    /// Buffers of requests still in flight are released after the queue pair
    /// is freed.
    pub fn teardown(&mut self) {
        if let Some(qpair) = self.state.qpair.take() {
            self.driver.free_io_qpair(qpair);
        }
        if let Some(ctrlr) = self.state.ctrlr.take() {
            self.driver.detach(ctrlr);
            info!(
                "Detached controller at {}",
                self.state.trid.as_ref().map_or("<unknown>", |t| t.address())
            );
        }
        self.state.clear_namespace();

        let abandoned = self.io.release_all();
        if abandoned > 0 {
            warn!("Released {} in-flight request buffers at teardown", abandoned);
        }
    }

    /// Whether the session holds a namespace and a queue pair.
    pub fn is_attached(&self) -> bool {
        self.state.qpair.is_some() && self.state.ns.is_some()
    }

    /// The attached controller.
    pub fn controller(&self) -> Option<D::Controller> {
        self.state.ctrlr
    }

    /// Controller options the controller was attached with.
    pub fn controller_opts(&self) -> Option<&CtrlrOpts> {
        self.state.ctrlr_opts.as_ref()
    }

    /// Transport id of the attached controller.
    pub fn transport_id(&self) -> Option<&TransportId> {
        self.state.trid.as_ref()
    }

    pub fn namespace(&self) -> Option<D::Namespace> {
        self.state.ns
    }

    pub fn qpair(&self) -> Option<D::Qpair> {
        self.state.qpair
    }

    /// Namespace size in blocks (0 unless attached).
    pub fn namespace_size(&self) -> u64 {
        self.state.namespace_size
    }

    /// Sector size in bytes (0 unless attached).
    pub fn sector_size(&self) -> u32 {
        self.state.sector_size
    }

    pub fn options(&self) -> &SessionOptions {
        &self.opts
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: Driver> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<D: Driver> std::fmt::Debug for DeviceSession<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("ctrlr", &self.state.ctrlr)
            .field("trid", &self.state.trid)
            .field("ns", &self.state.ns)
            .field("qpair", &self.state.qpair)
            .field("namespace_size", &self.state.namespace_size)
            .field("sector_size", &self.state.sector_size)
            .field("in_flight", &self.io.pending())
            .finish()
    }
}
