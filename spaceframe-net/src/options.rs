//! Session and server configuration options.

use std::time::Duration;

/// Tunables applied to every accepted or connected session.
///
/// # Examples
///
/// ```
/// use spaceframe_net::options::SessionOptions;
///
/// let opts = SessionOptions::default()
///     .with_read_high_water_mark(64 * 1024)
///     .with_read_chunk_size(4096);
/// ```
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Block size for the session's read and write rings (rounded up to a
    /// 512 multiple by the buffer).
    /// - Default: 512
    pub buffer_block_size: usize,

    /// Size of the owned chunk each socket read lands in before being
    /// committed to the read ring.
    /// - Default: 8192 (8KB) - balanced for most workloads
    pub read_chunk_size: usize,

    /// Read high-water mark (bytes).
    ///
    /// Socket reads suspend while the read ring holds at least this many
    /// unconsumed bytes, and resume once the worker drains below it.
    /// - Default: 0 (no suspension)
    pub read_high_water_mark: usize,

    /// Write high-water mark (bytes).
    ///
    /// Crossing it after an enqueue invokes the server's write-pressure
    /// handler; stopping further enqueues is the embedder's job.
    /// - Default: 0 (no notification)
    pub write_high_water_mark: usize,

    /// SO_LINGER applied on accept and connect.
    /// - Default: 30 seconds
    pub linger: Option<Duration>,

    /// TCP_NODELAY applied on accept and connect.
    /// - Default: true
    pub nodelay: bool,

    /// Period of the server's idle sweep and of the host's timer tick.
    /// - Default: 30 seconds
    pub sweep_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_block_size: 512,
            read_chunk_size: 8192,
            read_high_water_mark: 0,
            write_high_water_mark: 0,
            linger: Some(Duration::from_secs(30)),
            nodelay: true,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl SessionOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ring block size.
    #[must_use]
    pub fn with_buffer_block_size(mut self, size: usize) -> Self {
        self.buffer_block_size = size;
        self
    }

    /// Set the socket read chunk size.
    #[must_use]
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Set the read high-water mark; 0 disables suspension.
    #[must_use]
    pub fn with_read_high_water_mark(mut self, mark: usize) -> Self {
        self.read_high_water_mark = mark;
        self
    }

    /// Set the write high-water mark; 0 disables notification.
    #[must_use]
    pub fn with_write_high_water_mark(mut self, mark: usize) -> Self {
        self.write_high_water_mark = mark;
        self
    }

    /// Set SO_LINGER; `None` leaves the OS default.
    #[must_use]
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// Enable or disable TCP_NODELAY.
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set the idle-sweep period.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
