//! I/O submission and completion polling.
//!
//! Every request gets a fresh DMA buffer, aligned to the session's DMA
//! alignment, which the request owns while it is in flight. Submission
//! returns as soon as the command is enqueued; completions are observed by
//! polling with [`DeviceSession::process_completions`], which hands each
//! request's buffer back to the caller.
//!
//! ```text
//!  submit(req, data) ── alloc DmaBuf ── copy data (Write) ── driver.submit
//!        │                                                       │
//!        ▼                                                       ▼
//!   RequestId            in_flight[id] = { req, buf, rx }   hardware queue
//!                                                                │
//!  process_completions() ── driver.process_completions ◄─────────┘
//!        │  rx fired? move to ready
//!        ▼
//!  Completions: CompletedIo { id, request, status, buf }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use log::{debug, error, trace};

use crate::complete::{CompletionReceiver, completion};
use crate::dma::DmaBuf;
use crate::driver::{Driver, IoCommand};
use crate::error::{Error, Result};
use crate::session::DeviceSession;

/// I/O operation kind.
///
/// Wire tags: `0 = Write`, `1 = Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    Write,
    Read,
}

impl TryFrom<u32> for IoKind {
    type Error = Error;

    fn try_from(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(IoKind::Write),
            1 => Ok(IoKind::Read),
            other => Err(Error::UnknownIoType(other)),
        }
    }
}

impl From<IoKind> for u32 {
    fn from(kind: IoKind) -> u32 {
        match kind {
            IoKind::Write => 0,
            IoKind::Read => 1,
        }
    }
}

/// Identifier of a submitted request, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Description of one read or write.
///
/// `buf_size` must equal `lba_count * sector_size` of the session's
/// namespace; [`DeviceSession::submit`] rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub kind: IoKind,
    pub buf_size: usize,
    pub lba: u64,
    pub lba_count: u32,
}

impl IoRequest {
    pub fn read(lba: u64, lba_count: u32, buf_size: usize) -> Self {
        Self {
            kind: IoKind::Read,
            buf_size,
            lba,
            lba_count,
        }
    }

    pub fn write(lba: u64, lba_count: u32, buf_size: usize) -> Self {
        Self {
            kind: IoKind::Write,
            buf_size,
            lba,
            lba_count,
        }
    }

    /// Build a request covering `len` bytes at byte `offset`.
    ///
    /// Offset and length must both be multiples of `sector_size`.
    pub fn from_byte_range(kind: IoKind, offset: u64, len: usize, sector_size: u32) -> Result<Self> {
        if sector_size == 0 {
            return Err(Error::InvalidArgument("sector size must be > 0".to_string()));
        }
        let ss = u64::from(sector_size);
        if offset % ss != 0 {
            return Err(Error::InvalidArgument(format!(
                "offset {offset} not sector aligned"
            )));
        }
        if len as u64 % ss != 0 {
            return Err(Error::InvalidArgument(format!(
                "length {len} not a multiple of sector size {sector_size}"
            )));
        }
        let lba_count = u32::try_from(len as u64 / ss)
            .map_err(|_| Error::InvalidArgument(format!("length {len} too large")))?;

        Ok(Self {
            kind,
            buf_size: len,
            lba: offset / ss,
            lba_count,
        })
    }
}

/// Untyped request descriptor, as produced by callers that carry the
/// operation as a numeric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawIoRequest {
    pub op: u32,
    pub buf_size: usize,
    pub lba: u64,
    pub lba_count: u32,
}

impl TryFrom<RawIoRequest> for IoRequest {
    type Error = Error;

    fn try_from(raw: RawIoRequest) -> Result<Self> {
        Ok(Self {
            kind: IoKind::try_from(raw.op)?,
            buf_size: raw.buf_size,
            lba: raw.lba,
            lba_count: raw.lba_count,
        })
    }
}

/// A submitted request that has not completed yet.
pub struct InFlightIo {
    request: IoRequest,
    buf: DmaBuf,
    rx: CompletionReceiver<()>,
}

impl InFlightIo {
    pub fn request(&self) -> &IoRequest {
        &self.request
    }

    /// The request's DMA buffer. For a write this is the data being written.
    pub fn buffer(&self) -> &DmaBuf {
        &self.buf
    }
}

impl fmt::Debug for InFlightIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightIo")
            .field("request", &self.request)
            .field("buf", &self.buf)
            .finish()
    }
}

/// A finished request, returning ownership of its buffer.
#[derive(Debug)]
pub struct CompletedIo {
    pub id: RequestId,
    pub request: IoRequest,
    pub status: Result<()>,
    buf: DmaBuf,
}

impl CompletedIo {
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    /// The request's buffer. Holds the data read for a successful read.
    pub fn buffer(&self) -> &DmaBuf {
        &self.buf
    }

    /// Take the buffer; dropping it frees the DMA memory.
    pub fn into_buffer(self) -> DmaBuf {
        self.buf
    }
}

/// Completed requests returned by [`DeviceSession::process_completions`].
///
/// Yields in request id order, whatever order the device completed them in.
/// Items not consumed stay queued and are returned, merged with newer
/// completions, by the next call.
pub struct Completions<'a> {
    ready: &'a mut VecDeque<CompletedIo>,
    remaining: usize,
}

impl Iterator for Completions<'_> {
    type Item = CompletedIo;

    fn next(&mut self) -> Option<CompletedIo> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.ready.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Completions<'_> {}

/// Per-session request bookkeeping.
pub(crate) struct IoQueue {
    next_id: u64,
    in_flight: BTreeMap<RequestId, InFlightIo>,
    ready: VecDeque<CompletedIo>,
}

impl IoQueue {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            in_flight: BTreeMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.in_flight.len()
    }

    fn insert(&mut self, io: InFlightIo) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.in_flight.insert(id, io);
        id
    }

    /// Move requests whose completion fired to the ready queue.
    fn reap(&mut self) -> usize {
        let mut finished = Vec::new();
        for (id, io) in self.in_flight.iter_mut() {
            if let Some(status) = io.rx.try_take() {
                finished.push((*id, status));
            }
        }

        let reaped = finished.len();
        for (id, status) in finished {
            if let Some(io) = self.in_flight.remove(&id) {
                match &status {
                    Ok(()) => trace!("Request {} completed", id),
                    Err(e) => debug!("Request {} failed: {}", id, e),
                }
                // Devices complete out of order; keep the queue sorted by id.
                let pos = self.ready.partition_point(|c| c.id < id);
                self.ready.insert(
                    pos,
                    CompletedIo {
                        id,
                        request: io.request,
                        status,
                        buf: io.buf,
                    },
                );
            }
        }
        reaped
    }

    fn take_ready(&mut self, id: RequestId) -> Option<CompletedIo> {
        let pos = self.ready.iter().position(|c| c.id == id)?;
        self.ready.remove(pos)
    }

    /// Drop every in-flight and unclaimed request. Returns how many were in flight.
    pub(crate) fn release_all(&mut self) -> usize {
        let abandoned = self.in_flight.len();
        self.in_flight.clear();
        self.ready.clear();
        abandoned
    }
}

impl<D: Driver> DeviceSession<D> {
    /// Submit a read or write.
    ///
    /// Allocates a DMA buffer of `request.buf_size` bytes, copies the first
    /// `buf_size` bytes of `data` into it for a write (ignored for a read), and
    /// enqueues the command. Success means the command was accepted by the
    /// hardware queue, not that it completed.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAttached`] if the session has no namespace or queue pair
    /// - [`Error::BufferSizeMismatch`] unless `buf_size == lba_count * sector_size`
    /// - [`Error::InvalidArgument`] for an empty request, or write data
    ///   shorter than `buf_size`
    /// - [`Error::DmaAlloc`] if the buffer could not be allocated
    /// - [`Error::SubmitFailed`] with the driver's return code
    pub fn submit(&mut self, request: &IoRequest, data: Option<&[u8]>) -> Result<RequestId> {
        let (ns, qpair) = match (self.state.ns, self.state.qpair) {
            (Some(ns), Some(qpair)) => (ns, qpair),
            _ => {
                error!("Cannot submit I/O: session is not attached");
                return Err(Error::NotAttached);
            }
        };

        if request.lba_count == 0 {
            return Err(Error::InvalidArgument("lba_count must be > 0".to_string()));
        }
        let sector_size = self.state.sector_size;
        if request.buf_size as u64 != u64::from(request.lba_count) * u64::from(sector_size) {
            error!(
                "Buffer size {} does not cover {} blocks of {} bytes",
                request.buf_size, request.lba_count, sector_size
            );
            return Err(Error::BufferSizeMismatch {
                buf_size: request.buf_size,
                lba_count: request.lba_count,
                sector_size,
            });
        }

        let source = match request.kind {
            IoKind::Write => match data {
                Some(data) if data.len() >= request.buf_size => Some(&data[..request.buf_size]),
                Some(data) => {
                    return Err(Error::InvalidArgument(format!(
                        "write data has {} bytes, request needs {}",
                        data.len(),
                        request.buf_size
                    )));
                }
                None => return Err(Error::InvalidArgument("write without data".to_string())),
            },
            IoKind::Read => None,
        };

        let mut buf = self
            .driver
            .dma_alloc(request.buf_size, self.opts.dma_alignment)
            .ok_or_else(|| {
                error!("Unable to allocate {} byte DMA buffer", request.buf_size);
                Error::DmaAlloc(request.buf_size)
            })?;
        if let Some(source) = source {
            buf.as_mut_slice().copy_from_slice(source);
        }

        let cmd = IoCommand {
            kind: request.kind,
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            lba: request.lba,
            lba_count: request.lba_count,
        };
        let (tx, rx) = completion();
        self.driver.submit(ns, qpair, cmd, tx).map_err(|rc| {
            error!(
                "Unable to queue {:?} of {} blocks at lba {} (rc {})",
                request.kind, request.lba_count, request.lba, rc
            );
            Error::SubmitFailed(rc)
        })?;

        let id = self.io.insert(InFlightIo {
            request: *request,
            buf,
            rx,
        });
        trace!(
            "Queued {:?} {} of {} blocks at lba {}",
            request.kind, id, request.lba_count, request.lba
        );
        Ok(id)
    }

    /// Submit an untyped request. Unknown operation tags are rejected with
    /// [`Error::UnknownIoType`] before anything is allocated or dispatched.
    pub fn submit_raw(&mut self, raw: &RawIoRequest, data: Option<&[u8]>) -> Result<RequestId> {
        let request = IoRequest::try_from(*raw).inspect_err(|_| {
            error!("Unknown io type {}", raw.op);
        })?;
        self.submit(&request, data)
    }

    /// Drive the queue pair and return the requests that have completed.
    ///
    /// `max_completions` bounds how many completions the driver reaps in this
    /// call (0 = unlimited). Completed requests hand their buffer back; drop
    /// the [`CompletedIo`] or its buffer to free the DMA memory.
    pub fn process_completions(&mut self, max_completions: u32) -> Result<Completions<'_>> {
        self.poll_once(max_completions)?;
        let remaining = self.io.ready.len();
        Ok(Completions {
            ready: &mut self.io.ready,
            remaining,
        })
    }

    fn poll_once(&mut self, max_completions: u32) -> Result<usize> {
        let qpair = self.state.qpair.ok_or(Error::NotAttached)?;
        self.driver
            .process_completions(qpair, max_completions)
            .map_err(|rc| {
                error!("Processing completions failed (rc {})", rc);
                Error::from_rc(rc)
            })?;
        Ok(self.io.reap())
    }

    /// Poll until request `id` completes and return it.
    ///
    /// Other requests completing meanwhile stay queued for
    /// [`process_completions`](Self::process_completions). There is no
    /// timeout: a hung device keeps this spinning.
    pub fn wait(&mut self, id: RequestId) -> Result<CompletedIo> {
        loop {
            if let Some(done) = self.io.take_ready(id) {
                return Ok(done);
            }
            if !self.io.in_flight.contains_key(&id) {
                return Err(Error::UnknownRequest(id.as_u64()));
            }
            self.poll_once(0)?;
        }
    }

    /// Poll until nothing is in flight and return every completed request.
    pub fn drain(&mut self) -> Result<Vec<CompletedIo>> {
        while !self.io.in_flight.is_empty() {
            self.poll_once(0)?;
        }
        Ok(self.io.ready.drain(..).collect())
    }

    /// A request that has been submitted and not yet completed.
    pub fn in_flight(&self, id: RequestId) -> Option<&InFlightIo> {
        self.io.in_flight.get(&id)
    }

    /// Number of requests in flight.
    pub fn pending(&self) -> usize {
        self.io.pending()
    }
}
