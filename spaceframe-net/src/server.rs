//! Framed TCP server.
//!
//! Owns three pools: a one-loop accept pool, an I/O pool driving socket
//! pumps, and a worker pool running pipeline decodes. The accept loop
//! hands each new connection a session wired to one I/O loop and one
//! worker loop (round-robin), and a periodic sweep on the accept loop
//! reclaims connections that stayed idle across a whole sweep period.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use spaceframe_core::rwlock::WriterFirstLock;

use crate::error::{EngineError, Result};
use crate::options::SessionOptions;
use crate::pool::LoopPool;
use crate::session::{InitHandlers, Session, WritePressureHandler};
use crate::tcp;

#[derive(Default)]
struct SessionMaps {
    sessions: HashMap<u32, Arc<Session>>,
    /// Closed by the sweep but still waiting for their close callback.
    wait_remove: HashMap<u32, Arc<Session>>,
}

struct ServerInner {
    address: SocketAddr,
    accept_pool: LoopPool,
    io_pool: LoopPool,
    worker_pool: LoopPool,
    options: Mutex<SessionOptions>,
    init_handlers: Mutex<Option<InitHandlers>>,
    write_hwm_handler: Mutex<Option<WritePressureHandler>>,
    session_ids: AtomicU32,
    maps: WriterFirstLock<SessionMaps>,
}

/// Accepting endpoint plus the pools that run its sessions.
///
/// Lifecycle: construct, `set_init_handlers`, optionally the high-water
/// setters, `run()` (spawns the threads and binds), external stop
/// signal, `stop()`.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Configure a server for `address:port` with `pool_size` I/O loops
    /// and as many worker loops.
    ///
    /// # Errors
    ///
    /// [`EngineError::Resolve`] for an unparsable address and
    /// [`EngineError::EmptyPool`] for a zero pool size.
    pub fn new(address: &str, port: u16, pool_size: usize) -> Result<Self> {
        Self::with_options(address, port, pool_size, SessionOptions::default())
    }

    /// Like [`new`](Self::new) with one I/O and one worker loop per
    /// available core.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_default_pool(address: &str, port: u16) -> Result<Self> {
        Self::new(address, port, num_cpus::get())
    }

    /// Like [`new`](Self::new) with explicit session options.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_options(
        address: &str,
        port: u16,
        pool_size: usize,
        options: SessionOptions,
    ) -> Result<Self> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| EngineError::Resolve(address.to_owned()))?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                address: SocketAddr::new(ip, port),
                accept_pool: LoopPool::new(1, "accept_pool")?,
                io_pool: LoopPool::new(pool_size, "io_pool")?,
                worker_pool: LoopPool::new(pool_size, "work_pool")?,
                options: Mutex::new(options),
                init_handlers: Mutex::new(None),
                write_hwm_handler: Mutex::new(None),
                session_ids: AtomicU32::new(0),
                maps: WriterFirstLock::new(SessionMaps::default()),
            }),
        })
    }

    /// Hook that attaches handlers to each new session's pipeline.
    pub fn set_init_handlers(&self, init: InitHandlers) {
        *self.inner.init_handlers.lock() = Some(init);
    }

    /// Suspend socket reads for sessions whose read ring holds at least
    /// `mark` bytes. Applies to sessions accepted from now on.
    pub fn set_read_high_water_mark(&self, mark: usize) {
        self.inner.options.lock().read_high_water_mark = mark;
    }

    /// Register the write-pressure handler and its mark.
    pub fn set_write_high_water_mark_handler(&self, handler: WritePressureHandler, mark: usize) {
        self.inner.options.lock().write_high_water_mark = mark;
        *self.inner.write_hwm_handler.lock() = Some(handler);
    }

    /// The port the server was configured with.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.address.port()
    }

    /// Spawn the pool threads, bind the listener, and start accepting.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure.
    pub fn run(&self) -> Result<()> {
        self.inner.accept_pool.run();
        self.inner.io_pool.run();
        self.inner.worker_pool.run();

        let (ready_tx, ready_rx) = flume::bounded(1);
        let inner = Arc::clone(&self.inner);
        self.inner.accept_pool.next_loop().post(move || {
            let accept_inner = Arc::clone(&inner);
            compio::runtime::spawn(accept_loop(accept_inner, ready_tx)).detach();
            compio::runtime::spawn(sweep_loop(inner)).detach();
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(address = %self.inner.address, "server listening");
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::Io(e)),
            Err(_) => Err(EngineError::NotRunning),
        }
    }

    /// Stop the loops, then join their threads.
    pub fn stop(&self) {
        self.inner.accept_pool.stop();
        self.inner.io_pool.stop();
        self.inner.worker_pool.stop();
        let mut maps = self.inner.maps.write_guard();
        maps.sessions.clear();
        maps.wait_remove.clear();
    }

    /// Look a live session up by id.
    #[must_use]
    pub fn session(&self, session_id: u32) -> Option<Arc<Session>> {
        self.inner.maps.read_guard().sessions.get(&session_id).cloned()
    }

    /// Number of sessions currently tracked.
    #[must_use]
    pub fn session_count(&self) -> usize {
        let maps = self.inner.maps.read_guard();
        maps.sessions.len() + maps.wait_remove.len()
    }

    /// Drop a session from whichever map still holds it.
    pub fn close_session(&self, session_id: u32) {
        self.inner.remove_session(session_id);
    }
}

impl ServerInner {
    fn remove_session(&self, session_id: u32) {
        let mut maps = self.maps.write_guard();
        let removed = maps
            .wait_remove
            .remove(&session_id)
            .or_else(|| maps.sessions.remove(&session_id));
        if removed.is_some() {
            debug!(session_id, "session removed from the registry");
        }
    }

    fn handle_accept(self: &Arc<Self>, stream: compio::net::TcpStream, peer: SocketAddr) {
        let options = self.options.lock().clone();
        let session_id = self.session_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Session::new(
            session_id,
            self.io_pool.next_loop(),
            self.worker_pool.next_loop(),
            options.clone(),
        );

        if let Err(e) = tcp::configure_stream(&stream, &options) {
            warn!(session_id, error = %e, "socket options not fully applied");
        }
        if options.read_high_water_mark > 0 {
            session.set_read_high_water_mark(options.read_high_water_mark);
        }
        if options.write_high_water_mark > 0 {
            if let Some(handler) = self.write_hwm_handler.lock().clone() {
                session.set_write_high_water_mark_handler(handler, options.write_high_water_mark);
            }
        }

        let owner = Arc::downgrade(self);
        session.set_close_handler(Box::new(move |id| {
            if let Some(inner) = owner.upgrade() {
                inner.remove_session(id);
            }
        }));

        {
            let mut maps = self.maps.write_guard();
            maps.sessions.insert(session_id, Arc::clone(&session));
        }

        let init = self.init_handlers.lock().clone();
        session.start(stream, init);
        debug!(session_id, peer = %peer, "accepted connection");
    }
}

/// Bind, signal readiness, then accept forever. Accept errors are logged
/// and the loop re-arms unconditionally.
async fn accept_loop(inner: Arc<ServerInner>, ready: flume::Sender<std::io::Result<()>>) {
    let listener = match compio::net::TcpListener::bind(inner.address).await {
        Ok(listener) => {
            let _ = ready.send(Ok(()));
            listener
        }
        Err(e) => {
            error!(address = %inner.address, error = %e, "bind failed");
            let _ = ready.send(Err(e));
            return;
        }
    };

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => inner.handle_accept(stream, peer),
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

/// Every sweep period, close the sessions whose activity probe says they
/// were idle for the whole period.
async fn sweep_loop(inner: Arc<ServerInner>) {
    loop {
        let interval = inner.options.lock().sweep_interval;
        compio::time::sleep(interval).await;

        let idle: Vec<Arc<Session>> = {
            let mut maps = inner.maps.write_guard();
            let idle_ids: Vec<u32> = maps
                .sessions
                .iter()
                .filter(|(_, session)| session.check_idle())
                .map(|(id, _)| *id)
                .collect();
            idle_ids
                .into_iter()
                .filter_map(|id| {
                    maps.sessions.remove(&id).map(|session| {
                        maps.wait_remove.insert(id, Arc::clone(&session));
                        session
                    })
                })
                .collect()
        };

        // Close outside the guard: the close callback re-enters the maps.
        for session in idle {
            info!(session_id = session.id(), "closing idle session");
            session.close();
        }
    }
}
