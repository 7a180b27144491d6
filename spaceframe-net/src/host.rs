//! Embedder facade.
//!
//! The engine is built to sit under an embedded application host (a
//! scripting runtime, a game loop). The host side implements
//! [`Embedder`]; the engine calls upward on connection events and the
//! embedder calls downward through [`EngineHost`] to write, close, and
//! manage timers. A [`HostHandler`] placed at the end of a session's
//! pipeline is the bridge: it registers the session on connect, forwards
//! every decoded frame, and deregisters on close.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use spaceframe_core::wheel::{TimerKind, TimerService};

use crate::error::{EngineError, Result};
use crate::handler::Handler;
use crate::msg::Msg;
use crate::pipeline::{Context, PipelineHandle};
use crate::pool::LoopPool;

/// Upward callback surface the engine exposes to an embedder.
///
/// `on_close` is delivered exactly once for every session that completed
/// `on_connect`.
pub trait Embedder: Send + Sync + 'static {
    /// A session finished its pipeline `connect`.
    fn on_connect(&self, session_id: u32);

    /// One decoded application message.
    fn on_message(&self, session_id: u32, data: &[u8]);

    /// The session is gone.
    fn on_close(&self, session_id: u32);

    /// A timer registered through [`EngineHost::add_timer`] expired;
    /// `token` is the value the embedder registered it with.
    fn on_timer(&self, token: u64) {
        let _ = token;
    }
}

/// Downward surface: session registry plus the engine-wide timer.
///
/// An explicit value rather than process state; construct one, `init()`
/// it, share it with every server or client that should report into the
/// embedder, and `close()` it on the way out.
pub struct EngineHost {
    embedder: Arc<dyn Embedder>,
    contexts: DashMap<u32, PipelineHandle>,
    timers: TimerService,
    timer_pool: LoopPool,
    tick_interval: Duration,
}

impl EngineHost {
    /// Default timer-tick cadence, matching the server's idle sweep.
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

    /// # Errors
    ///
    /// Pool construction never fails for the fixed one-loop timer pool;
    /// surfaced for uniformity.
    pub fn new(embedder: Arc<dyn Embedder>) -> Result<Arc<Self>> {
        Self::with_tick_interval(embedder, Self::DEFAULT_TICK_INTERVAL)
    }

    /// Override the timer-tick cadence (tests use a short one).
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_tick_interval(embedder: Arc<dyn Embedder>, tick: Duration) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            embedder,
            contexts: DashMap::new(),
            timers: TimerService::new(),
            timer_pool: LoopPool::new(1, "timer_pool")?,
            tick_interval: tick,
        }))
    }

    /// Start the timer loop. Idempotent per host.
    pub fn init(self: &Arc<Self>) {
        self.timer_pool.run();
        let host = Arc::clone(self);
        self.timer_pool.next_loop().post(move || {
            compio::runtime::spawn(async move {
                loop {
                    compio::time::sleep(host.tick_interval).await;
                    host.timers.tick();
                }
            })
            .detach();
        });
    }

    /// Stop the timer loop and drop every registration.
    pub fn close(&self) {
        self.timer_pool.stop();
        self.contexts.clear();
    }

    /// The bridge handler to install at the end of each pipeline.
    #[must_use]
    pub fn handler(self: &Arc<Self>) -> Arc<HostHandler> {
        Arc::new(HostHandler {
            host: Arc::clone(self),
        })
    }

    /// Number of sessions currently registered.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.contexts.len()
    }

    /// Send raw bytes out through a session's pipeline.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownSession`] when the id has no live
    /// registration.
    pub fn write_message(&self, session_id: u32, data: &[u8]) -> Result<()> {
        let Some(handle) = self.contexts.get(&session_id).map(|h| h.value().clone()) else {
            return Err(EngineError::UnknownSession(session_id));
        };
        handle.write(Msg::Bytes(bytes::Bytes::copy_from_slice(data)))
    }

    /// Close a session by id. A no-op (with a warning) for ids that are
    /// not registered; the lookup is explicit so a stale id can never be
    /// acted on.
    pub fn close_connection(&self, session_id: u32) -> bool {
        match self.contexts.remove(&session_id) {
            Some((_, handle)) => {
                handle.close();
                true
            }
            None => {
                warn!(session_id, "close requested for an unknown session");
                false
            }
        }
    }

    /// Schedule `on_timer(token)` after `interval_ms` (once or
    /// periodically). Returns the timer id.
    pub fn add_timer(&self, interval_ms: u64, kind: TimerKind, token: u64) -> u32 {
        let embedder = Arc::clone(&self.embedder);
        self.timers
            .add_task(interval_ms, kind, move || embedder.on_timer(token))
    }

    /// Cancel a timer before it fires. Returns whether it was pending.
    pub fn remove_timer(&self, timer_id: u32) -> bool {
        self.timers.remove_task(timer_id)
    }

    /// Advance the timer immediately (driven by the tick task; exposed
    /// for embedders that pump the engine themselves).
    pub fn tick_timers(&self) {
        self.timers.tick();
    }
}

/// Pipeline bridge into an [`EngineHost`].
pub struct HostHandler {
    host: Arc<EngineHost>,
}

impl Handler for HostHandler {
    fn connect(&self, ctx: &Context<'_>) {
        let session_id = ctx.session_id();
        self.host.contexts.insert(session_id, ctx.pipeline_handle());
        self.host.embedder.on_connect(session_id);
        ctx.fire_connect();
    }

    fn decode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
        match msg {
            Msg::Bytes(data) => {
                self.host.embedder.on_message(ctx.session_id(), &data);
                Ok(())
            }
            Msg::Str(text) => {
                self.host.embedder.on_message(ctx.session_id(), text.as_bytes());
                Ok(())
            }
            other => Err(EngineError::BadMessageType(other.kind())),
        }
    }

    fn notify_closed(&self, ctx: &Context<'_>) {
        let session_id = ctx.session_id();
        if self.host.contexts.remove(&session_id).is_some() {
            debug!(session_id, "session deregistered from host");
        }
        self.host.embedder.on_close(session_id);
        ctx.fire_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, SessionLink};
    use parking_lot::Mutex;
    use spaceframe_core::buffer::SharedBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        connects: AtomicUsize,
        closes: AtomicUsize,
        messages: Mutex<Vec<Vec<u8>>>,
        timer_tokens: Mutex<Vec<u64>>,
    }

    impl Embedder for Recorder {
        fn on_connect(&self, _session_id: u32) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, _session_id: u32, data: &[u8]) {
            self.messages.lock().push(data.to_vec());
        }

        fn on_close(&self, _session_id: u32) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_timer(&self, token: u64) {
            self.timer_tokens.lock().push(token);
        }
    }

    /// Turns the whole readable region into one frame, so the host
    /// handler behind it sees `Msg::Bytes`.
    struct DrainDecoder;

    impl Handler for DrainDecoder {
        fn decode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
            let Msg::Buffer(buffer) = msg else {
                return ctx.fire_read(msg);
            };
            let frame = {
                let mut ring = buffer.lock();
                let len = ring.readable_bytes();
                ring.read(len)
            };
            if frame.is_empty() {
                return Ok(());
            }
            ctx.fire_read(Msg::Bytes(bytes::Bytes::from(frame.into_vec())))
        }
    }

    fn host_pipeline(
        host: &Arc<EngineHost>,
        write_buf: SharedBuffer,
    ) -> Arc<Pipeline> {
        let mut builder = Pipeline::builder();
        builder
            .add_handler("drain", Arc::new(DrainDecoder))
            .add_handler("host", host.handler());
        let link = SessionLink::new(
            9,
            SharedBuffer::new(512),
            write_buf,
            Box::new(|_| {}),
            Box::new(|| {}),
        );
        builder.build(link)
    }

    #[test]
    fn registers_forwards_and_deregisters() {
        let recorder = Arc::new(Recorder::default());
        let host = EngineHost::new(recorder.clone()).unwrap();
        let write_buf = SharedBuffer::new(512);
        let pipeline = host_pipeline(&host, write_buf.clone());

        pipeline.fire_connect();
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        assert_eq!(host.session_count(), 1);

        // Inbound frame reaches the embedder.
        pipeline.read_buffer().append(b"ping");
        pipeline.fire_read().unwrap();
        assert_eq!(*recorder.messages.lock(), vec![b"ping".to_vec()]);

        // Host writes route back out through the pipeline head.
        host.write_message(9, b"pong").unwrap();
        assert_eq!(write_buf.readable_bytes(), 4);

        pipeline.fire_closed();
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert_eq!(host.session_count(), 0);
        assert!(matches!(
            host.write_message(9, b"late"),
            Err(EngineError::UnknownSession(9))
        ));
    }

    #[test]
    fn close_connection_requires_a_live_registration() {
        let recorder = Arc::new(Recorder::default());
        let host = EngineHost::new(recorder).unwrap();
        assert!(!host.close_connection(404));

        let pipeline = host_pipeline(&host, SharedBuffer::new(512));
        pipeline.fire_connect();
        assert!(host.close_connection(9));
        assert_eq!(host.session_count(), 0);
    }

    #[test]
    fn timers_carry_tokens_to_the_embedder() {
        let recorder = Arc::new(Recorder::default());
        let host = EngineHost::new(recorder.clone()).unwrap();

        let keep = host.add_timer(0, TimerKind::Once, 7);
        let cancel = host.add_timer(0, TimerKind::Once, 8);
        assert_ne!(keep, cancel);
        assert!(host.remove_timer(cancel));

        std::thread::sleep(Duration::from_millis(30));
        host.tick_timers();
        assert_eq!(*recorder.timer_tokens.lock(), vec![7]);
    }
}
