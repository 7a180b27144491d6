//! Framed TCP client.
//!
//! One loop, one session. Resolution is synchronous and takes the first
//! record; the connect itself is asynchronous on the client's loop, and
//! on success the session starts exactly like an accepted one.

use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::options::SessionOptions;
use crate::pool::LoopPool;
use crate::session::{InitHandlers, Session, WritePressureHandler};
use crate::tcp;

static CLIENT_SESSION_IDS: AtomicU32 = AtomicU32::new(0);

/// An outbound connection plus the loop that runs it.
pub struct Client {
    pool: LoopPool,
    session: Arc<Session>,
    address: String,
    port: u16,
    options: SessionOptions,
    init_handlers: Mutex<Option<InitHandlers>>,
}

impl Client {
    /// Configure a client for `address:port`.
    ///
    /// # Errors
    ///
    /// [`EngineError::EmptyPool`] never in practice (the pool size is
    /// fixed at one); surfaced for uniformity with [`crate::server::Server`].
    pub fn new(address: impl Into<String>, port: u16) -> Result<Self> {
        Self::with_options(address, port, SessionOptions::default())
    }

    /// Like [`new`](Self::new) with explicit session options.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_options(
        address: impl Into<String>,
        port: u16,
        options: SessionOptions,
    ) -> Result<Self> {
        let pool = LoopPool::new(1, "client_pool")?;
        let session_id = CLIENT_SESSION_IDS.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Session::new(
            session_id,
            pool.next_loop(),
            pool.next_loop(),
            options.clone(),
        );
        Ok(Self {
            pool,
            session,
            address: address.into(),
            port,
            options,
            init_handlers: Mutex::new(None),
        })
    }

    /// Hook that attaches handlers to the session's pipeline.
    pub fn set_init_handlers(&self, init: InitHandlers) {
        *self.init_handlers.lock() = Some(init);
    }

    pub fn set_read_high_water_mark(&self, mark: usize) {
        self.session.set_read_high_water_mark(mark);
    }

    pub fn set_write_high_water_mark_handler(&self, handler: WritePressureHandler, mark: usize) {
        self.session.set_write_high_water_mark_handler(handler, mark);
    }

    /// The session handle, valid before and after the connect completes.
    #[must_use]
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Spawn the loop thread, resolve synchronously, and connect.
    /// Returns once the connection is up and the session started.
    ///
    /// # Errors
    ///
    /// [`EngineError::Resolve`] when resolution yields no address, or the
    /// connect failure. There is no retry.
    pub fn run(&self) -> Result<()> {
        self.pool.run();

        let target = (self.address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                warn!(address = %self.address, port = self.port, error = %e, "resolve failed");
                EngineError::Resolve(format!("{}:{}", self.address, self.port))
            })?
            .next()
            .ok_or_else(|| {
                warn!(address = %self.address, port = self.port, "no address records");
                EngineError::Resolve(format!("{}:{}", self.address, self.port))
            })?;

        let session = Arc::clone(&self.session);
        let options = self.options.clone();
        let init = self.init_handlers.lock().clone();
        let (done_tx, done_rx) = flume::bounded(1);
        self.pool.next_loop().post(move || {
            compio::runtime::spawn(async move {
                match compio::net::TcpStream::connect(target).await {
                    Ok(stream) => {
                        if let Err(e) = tcp::configure_stream(&stream, &options) {
                            warn!(session_id = session.id(), error = %e,
                                "socket options not fully applied");
                        }
                        session.start(stream, init);
                        debug!(session_id = session.id(), peer = %target, "connected");
                        let _ = done_tx.send(Ok(()));
                    }
                    Err(e) => {
                        warn!(peer = %target, error = %e, "connect failed");
                        let _ = done_tx.send(Err(e));
                    }
                }
            })
            .detach();
        });

        match done_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Io(e)),
            Err(_) => Err(EngineError::NotRunning),
        }
    }

    /// Stop the loop and join its thread.
    pub fn stop(&self) {
        self.pool.stop();
    }
}
