//! SPDK NVMe driver backend.
//!
//! Binds the [`Driver`] primitives to SPDK's user-space NVMe driver:
//! `spdk_env_init`, `spdk_nvme_probe` with probe/attach callbacks,
//! namespace queries, `spdk_nvme_ctrlr_alloc_io_qpair` and
//! `spdk_nvme_ns_cmd_read` / `spdk_nvme_ns_cmd_write`.
//!
//! # Thread Safety
//!
//! Handles are `!Send + !Sync`: a controller's queue pair must be used from
//! the thread that allocated it.

use std::ffi::{CString, c_char, c_void};
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, warn};
use spdk_nvme_sys::*;

use crate::complete::CompletionSender;
use crate::dma::DmaBuf;
use crate::driver::{Driver, DriverResult, IoCommand, ProbeHandler, completion_status};
use crate::io::IoKind;
use crate::opts::{CtrlrOpts, EnvOpts, QpairOpts};
use crate::transport::{PciAddress, TransportId};

/// The SPDK environment can only be started once per process.
static ENV_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Attached controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdkController(NonNull<spdk_nvme_ctrlr>);

/// Namespace of an attached controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdkNamespace(NonNull<spdk_nvme_ns>);

/// I/O queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdkQpair(NonNull<spdk_nvme_qpair>);

/// SPDK-backed [`Driver`].
#[derive(Debug, Default)]
pub struct SpdkDriver {
    _private: (),
}

impl SpdkDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Context threaded through `spdk_nvme_probe` to the callbacks.
struct ProbeCtx<'a> {
    handler: &'a mut dyn ProbeHandler<SpdkDriver>,
}

fn native_trid(trid: &TransportId) -> DriverResult<spdk_nvme_transport_id> {
    let mut native: spdk_nvme_transport_id = unsafe { MaybeUninit::zeroed().assume_init() };
    native.trtype = spdk_nvme_transport_type_SPDK_NVME_TRANSPORT_PCIE;
    copy_to_field(&mut native.trstring, "PCIe")?;
    copy_to_field(&mut native.traddr, trid.address())?;
    Ok(native)
}

fn trid_from_native(native: &spdk_nvme_transport_id) -> Option<TransportId> {
    let addr = field_to_string(&native.traddr);
    PciAddress::parse(&addr)
        .ok()
        .map(TransportId::from_pci_address)
}

/// Copy a string into a fixed-size, NUL-terminated char array.
fn copy_to_field(field: &mut [c_char], value: &str) -> DriverResult<()> {
    let bytes = value.as_bytes();
    if bytes.len() >= field.len() {
        return Err(-libc::EINVAL);
    }
    for (dst, &byte) in field.iter_mut().zip(bytes) {
        *dst = byte as c_char;
    }
    field[bytes.len()] = 0;
    Ok(())
}

fn field_to_string(field: &[c_char]) -> String {
    let bytes: Vec<u8> = field
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn ctrlr_opts_from_native(native: &spdk_nvme_ctrlr_opts) -> CtrlrOpts {
    CtrlrOpts {
        num_io_queues: Some(native.num_io_queues),
        io_queue_size: Some(native.io_queue_size),
        admin_queue_size: Some(native.admin_queue_size),
        keep_alive_timeout_ms: Some(native.keep_alive_timeout_ms),
    }
}

fn apply_ctrlr_opts(native: &mut spdk_nvme_ctrlr_opts, opts: &CtrlrOpts) {
    if let Some(num_io_queues) = opts.num_io_queues {
        native.num_io_queues = num_io_queues;
    }
    if let Some(io_queue_size) = opts.io_queue_size {
        native.io_queue_size = io_queue_size;
    }
    if let Some(admin_queue_size) = opts.admin_queue_size {
        native.admin_queue_size = admin_queue_size;
    }
    if let Some(keep_alive_timeout_ms) = opts.keep_alive_timeout_ms {
        native.keep_alive_timeout_ms = keep_alive_timeout_ms;
    }
}

unsafe extern "C" fn probe_cb(
    cb_ctx: *mut c_void,
    trid: *const spdk_nvme_transport_id,
    opts: *mut spdk_nvme_ctrlr_opts,
) -> bool {
    let ctx = unsafe { &mut *(cb_ctx as *mut ProbeCtx<'_>) };
    let (native_trid, native_opts) = unsafe { (&*trid, &mut *opts) };

    let Some(trid) = trid_from_native(native_trid) else {
        warn!(
            "Skipping controller with unparseable address {}",
            field_to_string(&native_trid.traddr)
        );
        return false;
    };

    let mut opts = ctrlr_opts_from_native(native_opts);
    let accept = ctx.handler.probe(&trid, &mut opts);
    apply_ctrlr_opts(native_opts, &opts);
    accept
}

unsafe extern "C" fn attach_cb(
    cb_ctx: *mut c_void,
    trid: *const spdk_nvme_transport_id,
    ctrlr: *mut spdk_nvme_ctrlr,
    opts: *const spdk_nvme_ctrlr_opts,
) {
    let ctx = unsafe { &mut *(cb_ctx as *mut ProbeCtx<'_>) };
    let Some(ctrlr) = NonNull::new(ctrlr) else {
        return;
    };
    let (native_trid, native_opts) = unsafe { (&*trid, &*opts) };

    match trid_from_native(native_trid) {
        Some(trid) => {
            let opts = ctrlr_opts_from_native(native_opts);
            ctx.handler.attach(&trid, SpdkController(ctrlr), &opts);
        }
        None => {
            error!("Attached controller has an unparseable address, detaching");
            unsafe { spdk_nvme_detach(ctrlr.as_ptr()) };
        }
    }
}

/// C callback for NVMe I/O completion.
unsafe extern "C" fn nvme_io_complete(ctx: *mut c_void, cpl: *const spdk_nvme_cpl) {
    let tx = unsafe { CompletionSender::<()>::from_raw(ctx) };

    let cpl = unsafe { &*cpl };

    // SCT (Status Code Type) is in bits 9:11, SC (Status Code) is in bits 1:8
    let status_raw = unsafe { cpl.__bindgen_anon_1.status_raw };
    let sct = ((status_raw >> 9) & 0x7) as u8;
    let sc = ((status_raw >> 1) & 0xff) as u8;

    tx.complete(completion_status(sct, sc));
}

fn default_native_qpair_opts(ctrlr: SpdkController) -> spdk_nvme_io_qpair_opts {
    let mut native: spdk_nvme_io_qpair_opts = unsafe { MaybeUninit::zeroed().assume_init() };
    unsafe {
        spdk_nvme_ctrlr_get_default_io_qpair_opts(
            ctrlr.0.as_ptr(),
            &mut native,
            std::mem::size_of::<spdk_nvme_io_qpair_opts>(),
        );
    }
    native
}

impl Driver for SpdkDriver {
    type Controller = SpdkController;
    type Namespace = SpdkNamespace;
    type Qpair = SpdkQpair;

    fn init_env(&self, opts: &EnvOpts) -> DriverResult<()> {
        if ENV_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let name = CString::new(opts.name.as_str()).map_err(|_| {
            ENV_INITIALIZED.store(false, Ordering::SeqCst);
            -libc::EINVAL
        })?;

        let rc = unsafe {
            let mut env_opts: spdk_env_opts = MaybeUninit::zeroed().assume_init();
            env_opts.opts_size = std::mem::size_of::<spdk_env_opts>();
            spdk_env_opts_init(&mut env_opts);

            env_opts.name = name.as_ptr();
            env_opts.shm_id = opts.shm_id;
            if let Some(mem_size) = opts.mem_size_mb {
                env_opts.mem_size = mem_size;
            }
            env_opts.no_pci = opts.no_pci;
            env_opts.no_huge = opts.no_huge;

            spdk_env_init(&env_opts)
        };

        if rc < 0 {
            ENV_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(rc);
        }

        if let Some(level) = opts.log_level {
            unsafe { spdk_log_set_print_level(level as spdk_log_level) };
        }
        Ok(())
    }

    fn probe(&self, trid: &TransportId, handler: &mut dyn ProbeHandler<Self>) -> DriverResult<()> {
        let native = native_trid(trid)?;
        let mut ctx = ProbeCtx { handler };

        let rc = unsafe {
            spdk_nvme_probe(
                &native,
                &mut ctx as *mut ProbeCtx<'_> as *mut c_void,
                Some(probe_cb),
                Some(attach_cb),
                None,
            )
        };
        if rc != 0 { Err(rc) } else { Ok(()) }
    }

    fn detach(&self, ctrlr: SpdkController) {
        let rc = unsafe { spdk_nvme_detach(ctrlr.0.as_ptr()) };
        if rc != 0 {
            error!("spdk_nvme_detach() failed (rc {})", rc);
        }
    }

    fn namespace(&self, ctrlr: SpdkController, nsid: u32) -> Option<SpdkNamespace> {
        let num_ns = unsafe { spdk_nvme_ctrlr_get_num_ns(ctrlr.0.as_ptr()) };
        if nsid == 0 || nsid > num_ns {
            return None;
        }
        let ns = unsafe { spdk_nvme_ctrlr_get_ns(ctrlr.0.as_ptr(), nsid) };
        NonNull::new(ns).map(SpdkNamespace)
    }

    fn namespace_is_active(&self, ns: SpdkNamespace) -> bool {
        unsafe { spdk_nvme_ns_is_active(ns.0.as_ptr()) }
    }

    fn namespace_num_sectors(&self, ns: SpdkNamespace) -> u64 {
        unsafe { spdk_nvme_ns_get_num_sectors(ns.0.as_ptr()) }
    }

    fn namespace_sector_size(&self, ns: SpdkNamespace) -> u32 {
        unsafe { spdk_nvme_ns_get_sector_size(ns.0.as_ptr()) }
    }

    fn default_qpair_opts(&self, ctrlr: SpdkController) -> QpairOpts {
        let native = default_native_qpair_opts(ctrlr);
        QpairOpts {
            io_queue_size: Some(native.io_queue_size),
            io_queue_requests: Some(native.io_queue_requests),
            delay_pcie_doorbell: native.delay_cmd_submit,
        }
    }

    fn alloc_io_qpair(&self, ctrlr: SpdkController, opts: &QpairOpts) -> Option<SpdkQpair> {
        let mut native = default_native_qpair_opts(ctrlr);
        if let Some(io_queue_size) = opts.io_queue_size {
            native.io_queue_size = io_queue_size;
        }
        if let Some(io_queue_requests) = opts.io_queue_requests {
            native.io_queue_requests = io_queue_requests;
        }
        native.delay_cmd_submit = opts.delay_pcie_doorbell;

        let qpair = unsafe {
            spdk_nvme_ctrlr_alloc_io_qpair(
                ctrlr.0.as_ptr(),
                &native,
                std::mem::size_of::<spdk_nvme_io_qpair_opts>(),
            )
        };
        NonNull::new(qpair).map(SpdkQpair)
    }

    fn free_io_qpair(&self, qpair: SpdkQpair) {
        let rc = unsafe { spdk_nvme_ctrlr_free_io_qpair(qpair.0.as_ptr()) };
        if rc != 0 {
            error!("spdk_nvme_ctrlr_free_io_qpair() failed (rc {})", rc);
        }
    }

    fn dma_alloc(&self, size: usize, align: usize) -> Option<DmaBuf> {
        DmaBuf::alloc(size, align).ok()
    }

    fn submit(
        &self,
        ns: SpdkNamespace,
        qpair: SpdkQpair,
        cmd: IoCommand,
        done: CompletionSender<()>,
    ) -> DriverResult<()> {
        let cb_arg = done.into_raw();

        let rc = unsafe {
            match cmd.kind {
                IoKind::Read => spdk_nvme_ns_cmd_read(
                    ns.0.as_ptr(),
                    qpair.0.as_ptr(),
                    cmd.buf as *mut c_void,
                    cmd.lba,
                    cmd.lba_count,
                    Some(nvme_io_complete),
                    cb_arg,
                    0, // io_flags
                ),
                IoKind::Write => spdk_nvme_ns_cmd_write(
                    ns.0.as_ptr(),
                    qpair.0.as_ptr(),
                    cmd.buf as *mut c_void,
                    cmd.lba,
                    cmd.lba_count,
                    Some(nvme_io_complete),
                    cb_arg,
                    0, // io_flags
                ),
            }
        };

        if rc != 0 {
            // Not enqueued, so the callback will never reclaim the sender.
            drop(unsafe { CompletionSender::<()>::from_raw(cb_arg) });
            return Err(rc);
        }
        Ok(())
    }

    fn process_completions(&self, qpair: SpdkQpair, max_completions: u32) -> DriverResult<u32> {
        let rc = unsafe { spdk_nvme_qpair_process_completions(qpair.0.as_ptr(), max_completions) };
        if rc < 0 { Err(rc) } else { Ok(rc as u32) }
    }
}
