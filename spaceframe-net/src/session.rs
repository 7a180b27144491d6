//! Per-connection session engine.
//!
//! One session owns a connected socket, a read ring fed by the I/O loop
//! and drained by its worker loop, a write ring fed by the pipeline and
//! drained back into the socket, and the pipeline between them.
//!
//! The socket is driven by two pumps spawned onto the session's I/O loop
//! (split-pump design): the read pump reads into an owned chunk, commits
//! it to the read ring, and posts one decode job per read onto the
//! session's worker loop; the write pump sleeps on a wake channel and
//! flushes the write ring whenever bytes are pending. Binding every
//! decode job to one worker loop serializes pipeline runs per session.
//!
//! The close barrier is a set of counters: `reading` and `writing` mark
//! in-flight socket operations, `work_read_count` counts posted decode
//! jobs, and `close_flag` marks intent. Whoever observes the flag with
//! everything else quiescent finalizes the session, and an atomic swap
//! makes finalization (and the embedder's `on_close`) fire exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use spaceframe_core::buffer::SharedBuffer;

use crate::msg::Msg;
use crate::options::SessionOptions;
use crate::pipeline::{Pipeline, PipelineBuilder, SessionLink};
use crate::pool::LoopHandle;
use crate::tcp::{self, ShutdownHandle};

/// Hook that attaches handlers to a session's pipeline before it starts.
pub type InitHandlers = Arc<dyn Fn(&mut PipelineBuilder) + Send + Sync>;

/// Invoked exactly once when a session reaches its end of life.
pub(crate) type CloseHandler = Box<dyn Fn(u32) + Send + Sync>;

/// Invoked when an enqueue pushes the write ring past the configured
/// high-water mark. Receives the session id and the ring's writable count.
pub type WritePressureHandler = Arc<dyn Fn(u32, usize) + Send + Sync>;

/// Largest single chunk handed to one socket write.
const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// Runtime state of a single TCP connection.
pub struct Session {
    id: u32,
    options: SessionOptions,
    read_buf: SharedBuffer,
    write_buf: SharedBuffer,
    pending_write: AtomicUsize,

    reading: AtomicBool,
    writing: AtomicBool,
    close_flag: AtomicBool,
    work_read_count: AtomicU32,
    handle_count: AtomicU32,
    closed: AtomicBool,

    io_loop: LoopHandle,
    worker_loop: LoopHandle,

    wake_write_tx: flume::Sender<()>,
    wake_write_rx: Mutex<Option<flume::Receiver<()>>>,
    resume_read_tx: flume::Sender<()>,
    resume_read_rx: Mutex<Option<flume::Receiver<()>>>,

    pipeline: OnceLock<Arc<Pipeline>>,
    shutdown: Mutex<Option<ShutdownHandle>>,
    close_handler: Mutex<Option<CloseHandler>>,

    read_hwm: AtomicUsize,
    write_hwm: AtomicUsize,
    write_hwm_handler: Mutex<Option<WritePressureHandler>>,
}

impl Session {
    /// Create a session bound to one I/O loop and one worker loop.
    #[must_use]
    pub fn new(
        id: u32,
        io_loop: LoopHandle,
        worker_loop: LoopHandle,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (wake_write_tx, wake_write_rx) = flume::unbounded();
        let (resume_read_tx, resume_read_rx) = flume::unbounded();
        Arc::new(Self {
            id,
            read_buf: SharedBuffer::new(options.buffer_block_size),
            write_buf: SharedBuffer::new(options.buffer_block_size),
            options,
            pending_write: AtomicUsize::new(0),
            reading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            close_flag: AtomicBool::new(false),
            work_read_count: AtomicU32::new(0),
            handle_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            io_loop,
            worker_loop,
            wake_write_tx,
            wake_write_rx: Mutex::new(Some(wake_write_rx)),
            resume_read_tx,
            resume_read_rx: Mutex::new(Some(resume_read_rx)),
            pipeline: OnceLock::new(),
            shutdown: Mutex::new(None),
            close_handler: Mutex::new(None),
            read_hwm: AtomicUsize::new(0),
            write_hwm: AtomicUsize::new(0),
            write_hwm_handler: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bytes enqueued for the socket but not yet written.
    #[must_use]
    pub fn pending_write_len(&self) -> usize {
        self.pending_write.load(Ordering::Acquire)
    }

    /// The idle sweep's probe: true when no read completed since the
    /// previous probe. Resets the activity count.
    #[must_use]
    pub fn check_idle(&self) -> bool {
        self.handle_count.swap(0, Ordering::AcqRel) == 0
    }

    pub fn set_read_high_water_mark(&self, mark: usize) {
        self.read_hwm.store(mark, Ordering::Relaxed);
    }

    pub fn set_write_high_water_mark_handler(&self, handler: WritePressureHandler, mark: usize) {
        self.write_hwm.store(mark, Ordering::Relaxed);
        *self.write_hwm_handler.lock() = Some(handler);
    }

    pub(crate) fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock() = Some(handler);
    }

    /// The session's pipeline, once started.
    #[must_use]
    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.get().cloned()
    }

    /// Attach the socket and bring the session up: build the pipeline
    /// from `init_handlers`, fire `connect` through it, then spawn the
    /// read and write pumps onto the I/O loop.
    pub fn start(self: &Arc<Self>, stream: compio::net::TcpStream, init_handlers: Option<InitHandlers>) {
        let mut builder = Pipeline::builder();
        if let Some(init) = init_handlers {
            init(&mut builder);
        }

        let weak_notify: Weak<Self> = Arc::downgrade(self);
        let weak_close: Weak<Self> = Arc::downgrade(self);
        let link = SessionLink::new(
            self.id,
            self.read_buf.clone(),
            self.write_buf.clone(),
            Box::new(move |len| {
                if let Some(session) = weak_notify.upgrade() {
                    session.notify_write(len);
                }
            }),
            Box::new(move || {
                if let Some(session) = weak_close.upgrade() {
                    session.close();
                }
            }),
        );
        let pipeline = builder.build(link);
        let _ = self.pipeline.set(Arc::clone(&pipeline));

        match tcp::shutdown_handle(&stream) {
            Ok(handle) => *self.shutdown.lock() = Some(handle),
            Err(e) => debug!(session_id = self.id, error = %e, "no shutdown handle for session"),
        }

        pipeline.fire_connect();

        let session = Arc::clone(self);
        self.io_loop.post(move || {
            let (reader, writer) = compio::io::split(stream);
            compio::runtime::spawn(Arc::clone(&session).read_pump(reader)).detach();
            compio::runtime::spawn(session.write_pump(writer)).detach();
        });
    }

    /// Enqueue an outbound message. It is posted onto the session's
    /// worker loop and injected at the pipeline tail, so it traverses
    /// every handler's `encode` before the head serializes it.
    pub fn write(self: &Arc<Self>, msg: Msg) {
        let session = Arc::clone(self);
        self.worker_loop.post(move || {
            let Some(pipeline) = session.pipeline.get() else {
                debug!(session_id = session.id, "write before start dropped");
                return;
            };
            if let Err(e) = pipeline.write(msg) {
                error!(session_id = session.id, error = %e, "outbound write failed");
            }
        });
    }

    /// Convenience for [`write`](Self::write) with raw bytes.
    pub fn write_bytes(self: &Arc<Self>, data: impl Into<Vec<u8>>) {
        self.write(Msg::from(data.into()));
    }

    /// Request teardown. Pending writes are flushed first; a blocked
    /// read is aborted when there is nothing to flush.
    pub fn close(&self) {
        self.close_flag.store(true, Ordering::SeqCst);
        let _ = self.wake_write_tx.send(());
        let _ = self.resume_read_tx.send(());
        if !self.writing.load(Ordering::SeqCst) && self.pending_write.load(Ordering::Acquire) == 0
        {
            if let Some(handle) = self.shutdown.lock().as_ref() {
                let _ = handle.shutdown_both();
            }
        }
        self.run_close_check();
    }

    /// Called by the pipeline head after serializing `len` bytes into the
    /// write ring: account them, wake the write pump, and surface write
    /// pressure.
    pub(crate) fn notify_write(&self, len: usize) {
        self.pending_write.fetch_add(len, Ordering::Release);
        let _ = self.wake_write_tx.send(());

        let mark = self.write_hwm.load(Ordering::Relaxed);
        if mark > 0 {
            let writable = self.write_buf.writable_bytes();
            if writable > mark {
                let handler = self.write_hwm_handler.lock().clone();
                if let Some(handler) = handler {
                    handler(self.id, writable);
                }
            }
        }
    }

    /// Kernel → read ring. One task per session, living on the I/O loop.
    async fn read_pump(self: Arc<Self>, mut reader: impl AsyncRead + Unpin) {
        let Some(resume_rx) = self.resume_read_rx.lock().take() else {
            return;
        };
        let chunk_size = self.options.read_chunk_size.max(1);

        loop {
            if self.close_flag.load(Ordering::SeqCst) {
                break;
            }

            self.reading.store(true, Ordering::SeqCst);
            let chunk: Vec<u8> = Vec::with_capacity(chunk_size);
            let BufResult(result, chunk) = reader.read(chunk).await;
            self.reading.store(false, Ordering::SeqCst);
            self.handle_count.fetch_add(1, Ordering::AcqRel);

            match result {
                Ok(0) => {
                    debug!(session_id = self.id, "peer closed the stream");
                    self.close_flag.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    if self.close_flag.load(Ordering::SeqCst) {
                        debug!(session_id = self.id, error = %e, "read aborted by close");
                    } else {
                        error!(session_id = self.id, error = %e, "read failed");
                    }
                    self.close_flag.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(n) => {
                    trace!(session_id = self.id, bytes = n, "read committed");
                    self.read_buf.append(&chunk);

                    if self.close_flag.load(Ordering::SeqCst)
                        && !self.writing.load(Ordering::SeqCst)
                    {
                        break;
                    }

                    let suspended = self.arm_read_suspension();
                    self.post_decode();

                    if suspended {
                        trace!(session_id = self.id, "read suspended at high-water mark");
                        if resume_rx.recv_async().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        // Make sure the write pump notices the flag even with nothing
        // pending.
        let _ = self.wake_write_tx.send(());
        self.run_close_check();
    }

    /// Arm the read ring's drain notifier when the high-water mark is
    /// reached. The check and the arming share the ring lock, so a
    /// concurrent decode cannot drain the ring between them and strand
    /// the pump.
    fn arm_read_suspension(&self) -> bool {
        let mark = self.read_hwm.load(Ordering::Relaxed);
        if mark == 0 {
            return false;
        }
        let resume = self.resume_read_tx.clone();
        let mut ring = self.read_buf.lock();
        if ring.readable_bytes() < mark {
            return false;
        }
        ring.arm_drain_notifier(mark, move || {
            let _ = resume.send(());
        });
        true
    }

    /// Count the decode and hand it to the worker loop. The count is
    /// bumped before the post so the close barrier can never miss an
    /// in-flight job.
    fn post_decode(self: &Arc<Self>) {
        self.work_read_count.fetch_add(1, Ordering::SeqCst);
        let session = Arc::clone(self);
        let posted = self.worker_loop.post(move || {
            if let Some(pipeline) = session.pipeline.get() {
                if let Err(e) = pipeline.fire_read() {
                    error!(session_id = session.id, error = %e, "pipeline decode failed");
                }
            }
            session.work_read_count.fetch_sub(1, Ordering::SeqCst);
            session.run_close_check();
        });
        if !posted {
            self.work_read_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Write ring → kernel. At most one socket write is in flight, and
    /// bytes leave in enqueue order.
    async fn write_pump(self: Arc<Self>, mut writer: impl AsyncWrite + Unpin) {
        let Some(wake_rx) = self.wake_write_rx.lock().take() else {
            return;
        };

        loop {
            if self.pending_write.load(Ordering::Acquire) == 0
                && !self.close_flag.load(Ordering::SeqCst)
            {
                if wake_rx.recv_async().await.is_err() {
                    break;
                }
            }

            while self.pending_write.load(Ordering::Acquire) > 0 {
                let available = self.write_buf.readable_bytes().min(MAX_WRITE_CHUNK);
                if available == 0 {
                    break;
                }
                self.writing.store(true, Ordering::SeqCst);
                let chunk = self.write_buf.peek(available);
                let len = chunk.len();
                let BufResult(result, _) = writer.write_all(chunk.into_vec()).await;
                self.writing.store(false, Ordering::SeqCst);

                match result {
                    Ok(()) => {
                        self.write_buf.retrieve(len);
                        self.pending_write.fetch_sub(len, Ordering::AcqRel);
                        trace!(session_id = self.id, bytes = len, "write flushed");
                    }
                    Err(e) => {
                        error!(session_id = self.id, error = %e, "write failed");
                        self.close_flag.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }

            if self.close_flag.load(Ordering::SeqCst) {
                if let Some(handle) = self.shutdown.lock().as_ref() {
                    let _ = handle.shutdown_both();
                }
                let _ = self.resume_read_tx.send(());
                break;
            }
        }

        self.run_close_check();
    }

    /// The close barrier: finalize once the flag is set and no socket
    /// operation or decode job is in flight.
    fn run_close_check(&self) {
        if self.close_flag.load(Ordering::SeqCst)
            && !self.reading.load(Ordering::SeqCst)
            && !self.writing.load(Ordering::SeqCst)
            && self.work_read_count.load(Ordering::SeqCst) == 0
        {
            self.finalize();
        }
    }

    /// Tear the session down exactly once: shut the socket, announce the
    /// closure through the pipeline, and tell the owner.
    fn finalize(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.shutdown.lock().take() {
            let _ = handle.shutdown_both();
        }
        if let Some(pipeline) = self.pipeline.get() {
            pipeline.fire_closed();
        }
        let handler = self.close_handler.lock().take();
        if let Some(handler) = handler {
            handler(self.id);
        }
        debug!(session_id = self.id, "session closed");
    }
}
