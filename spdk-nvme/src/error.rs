//! Error types for spdk-nvme

/// Result type for spdk-nvme operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for spdk-nvme operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed transport identifier
    #[error("Invalid transport id: {0}")]
    InvalidTransportId(String),

    /// Well-formed transport identifier for a transport other than PCIe
    #[error("Unsupported transport type: {0}")]
    UnsupportedTransport(String),

    /// Transport address is not a PCI BDF
    #[error("Invalid device address: {0}")]
    InvalidPciAddress(String),

    /// Session options are inconsistent
    #[error("Invalid session options: {0}")]
    InvalidOptions(String),

    /// Environment / DMA memory subsystem failed to start
    #[error("SPDK environment initialization failed: {0}")]
    EnvInit(String),

    /// The probe call itself failed
    #[error("NVMe probe failed with error code {0}")]
    ProbeFailed(i32),

    /// Probe completed without attaching any controller
    #[error("NVMe controller not found")]
    ControllerNotFound,

    /// Controller has no namespace with the requested id
    #[error("Namespace {0} not found")]
    NamespaceNotFound(u32),

    /// Namespace exists but is not active
    #[error("Namespace {0} is inactive")]
    NamespaceInactive(u32),

    /// Namespace reported a zero sector count or sector size
    #[error("Namespace {nsid} reports invalid geometry ({num_sectors} sectors of {sector_size} bytes)")]
    InvalidGeometry {
        nsid: u32,
        num_sectors: u64,
        sector_size: u32,
    },

    /// I/O queue pair allocation failed
    #[error("I/O queue pair allocation failed")]
    QpairAlloc,

    /// The session already holds a queue pair
    #[error("Session is already attached to a queue pair")]
    AlreadyAttached,

    /// I/O was issued on a session without a queue pair and namespace
    #[error("Session is not attached")]
    NotAttached,

    /// DMA buffer allocation failed
    #[error("DMA buffer allocation of {0} bytes failed")]
    DmaAlloc(usize),

    /// Operation tag does not name a known I/O type
    #[error("Unknown I/O type {0}")]
    UnknownIoType(u32),

    /// Buffer size disagrees with lba_count * sector_size
    #[error("Buffer size {buf_size} does not match {lba_count} blocks of {sector_size} bytes")]
    BufferSizeMismatch {
        buf_size: usize,
        lba_count: u32,
        sector_size: u32,
    },

    /// The driver refused to enqueue a command
    #[error("Command submission failed with error code {0}")]
    SubmitFailed(i32),

    /// Request id is not in flight on this session
    #[error("Request {0} is not in flight")]
    UnknownRequest(u64),

    /// Invalid argument provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),


    /// Command completed with an NVMe error status
    #[error("NVMe error: SCT={sct}, SC={sc}")]
    NvmeError { sct: u8, sc: u8 },

    /// Completion context dropped before the command completed
    #[error("Operation cancelled")]
    Cancelled,

    /// OS error with errno
    #[error("OS error: {0}")]
    Os(i32),
}

/// Where in the session lifecycle an [`Error`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unsupported transport identifier
    Configuration,
    /// Memory/env subsystem failed to start
    Environment,
    /// No controller found, or the probe call failed
    Discovery,
    /// Namespace missing/inactive, qpair allocation failed, duplicate attach
    Attach,
    /// DMA buffer allocation failed
    Allocation,
    /// Command rejected, or not submittable
    Submission,
    /// Command completed unsuccessfully
    Completion,
}

impl Error {
    /// Create from SPDK return code (negative errno)
    pub fn from_rc(rc: i32) -> Self {
        if rc < 0 {
            Error::Os(-rc)
        } else {
            Error::Os(rc)
        }
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidTransportId(_)
            | Error::UnsupportedTransport(_)
            | Error::InvalidPciAddress(_)
            | Error::InvalidOptions(_) => ErrorKind::Configuration,
            Error::EnvInit(_) => ErrorKind::Environment,
            Error::ProbeFailed(_) | Error::ControllerNotFound => ErrorKind::Discovery,
            Error::NamespaceNotFound(_)
            | Error::NamespaceInactive(_)
            | Error::InvalidGeometry { .. }
            | Error::QpairAlloc
            | Error::AlreadyAttached => ErrorKind::Attach,
            Error::DmaAlloc(_) => ErrorKind::Allocation,
            Error::NotAttached
            | Error::UnknownIoType(_)
            | Error::BufferSizeMismatch { .. }
            | Error::SubmitFailed(_)
            | Error::UnknownRequest(_)
            | Error::InvalidArgument(_)
            | Error::Os(_) => ErrorKind::Submission,
            Error::NvmeError { .. } | Error::Cancelled => ErrorKind::Completion,
        }
    }
}
