//! The bidirectional handler pipeline.
//!
//! An ordered chain of contexts between two sentinels. Inbound decodings
//! travel head → tail, outbound encodings travel tail → head, and the head
//! is the terminal writer: it serializes the final message into the
//! session's write buffer and schedules a socket write.
//!
//! The chain is an arena — a vector of nodes addressed by index, with the
//! head at 0 and the tail at the end — so traversal needs no link
//! pointers and the sentinel invariants hold by construction. Handlers
//! are added through [`PipelineBuilder`] before the session starts;
//! afterwards the chain is immutable.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use spaceframe_core::buffer::SharedBuffer;

use crate::error::{EngineError, Result};
use crate::handler::Handler;
use crate::msg::Msg;

/// Opaque value shared by every context of one pipeline.
pub type UserData = Arc<dyn Any + Send + Sync>;

pub(crate) type NotifyWriteFn = Box<dyn Fn(usize) + Send + Sync>;
pub(crate) type CloseFn = Box<dyn Fn() + Send + Sync>;

/// What the pipeline needs from its session: the two buffers, the id, and
/// callbacks into the session's write scheduling and close path.
pub(crate) struct SessionLink {
    pub(crate) id: u32,
    pub(crate) read_buf: SharedBuffer,
    pub(crate) write_buf: SharedBuffer,
    pub(crate) notify_write: NotifyWriteFn,
    pub(crate) close: CloseFn,
}

impl SessionLink {
    pub(crate) fn new(
        id: u32,
        read_buf: SharedBuffer,
        write_buf: SharedBuffer,
        notify_write: NotifyWriteFn,
        close: CloseFn,
    ) -> Self {
        Self {
            id,
            read_buf,
            write_buf,
            notify_write,
            close,
        }
    }
}

enum NodeKind {
    Head,
    Tail,
    Handler(Arc<dyn Handler>),
}

struct Node {
    name: String,
    kind: NodeKind,
}

/// Collects named handlers before the pipeline is frozen.
///
/// Handlers run in insertion order on the inbound path and reverse order
/// on the outbound path.
#[derive(Default)]
pub struct PipelineBuilder {
    entries: Vec<(String, Arc<dyn Handler>)>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler immediately before the tail sentinel.
    pub fn add_handler(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.entries.push((name.into(), handler));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn build(self, link: SessionLink) -> Arc<Pipeline> {
        Arc::new_cyclic(|weak| {
            let mut nodes = Vec::with_capacity(self.entries.len() + 2);
            nodes.push(Node {
                name: "head".to_owned(),
                kind: NodeKind::Head,
            });
            for (name, handler) in self.entries {
                nodes.push(Node {
                    name,
                    kind: NodeKind::Handler(handler),
                });
            }
            nodes.push(Node {
                name: "tail".to_owned(),
                kind: NodeKind::Tail,
            });
            Pipeline {
                nodes,
                link,
                user_data: Mutex::new(None),
                self_ref: weak.clone(),
            }
        })
    }
}

/// The frozen handler chain of one session.
pub struct Pipeline {
    nodes: Vec<Node>,
    link: SessionLink,
    user_data: Mutex<Option<UserData>>,
    self_ref: Weak<Pipeline>,
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.link.id
    }

    /// The session's inbound buffer.
    #[must_use]
    pub fn read_buffer(&self) -> SharedBuffer {
        self.link.read_buf.clone()
    }

    /// The session's outbound buffer.
    #[must_use]
    pub fn write_buffer(&self) -> SharedBuffer {
        self.link.write_buf.clone()
    }

    pub fn set_user_data(&self, data: UserData) {
        *self.user_data.lock() = Some(data);
    }

    #[must_use]
    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.lock().clone()
    }

    /// Run `connect` through the chain, head to tail.
    pub fn fire_connect(&self) {
        self.node_connect(0);
    }

    /// Wrap the session's read buffer and run it down the decode chain.
    ///
    /// # Errors
    ///
    /// The first handler error aborts this run and surfaces to the caller
    /// (the worker-task boundary).
    pub fn fire_read(&self) -> Result<()> {
        self.node_read(0, Msg::Buffer(self.link.read_buf.clone()))
    }

    /// Inject an outbound message at the tail so it traverses every
    /// handler's `encode` on the way to the terminal writer.
    ///
    /// # Errors
    ///
    /// Encode failures and non-writable terminal messages surface here.
    pub fn write(&self, msg: Msg) -> Result<()> {
        self.node_write(self.nodes.len() - 1, msg)
    }

    /// Run a close request from the tail toward the head.
    pub fn close(&self) {
        self.node_close(self.nodes.len() - 1);
    }

    /// Announce the session's end, head to tail.
    pub fn fire_closed(&self) {
        self.node_closed(0);
    }

    fn node_connect(&self, index: usize) {
        match &self.nodes[index].kind {
            NodeKind::Head => self.node_connect(index + 1),
            NodeKind::Tail => {}
            NodeKind::Handler(handler) => handler.connect(&Context {
                pipeline: self,
                index,
            }),
        }
    }

    fn node_read(&self, index: usize, msg: Msg) -> Result<()> {
        match &self.nodes[index].kind {
            NodeKind::Head => self.node_read(index + 1, msg),
            // The tail drops reads nobody claimed.
            NodeKind::Tail => {
                trace!(session_id = self.link.id, kind = msg.kind(), "message reached tail");
                Ok(())
            }
            NodeKind::Handler(handler) => handler.decode(
                &Context {
                    pipeline: self,
                    index,
                },
                msg,
            ),
        }
    }

    fn node_write(&self, index: usize, msg: Msg) -> Result<()> {
        match &self.nodes[index].kind {
            NodeKind::Head => self.terminal_write(msg),
            NodeKind::Tail => self.node_write(index - 1, msg),
            NodeKind::Handler(handler) => handler.encode(
                &Context {
                    pipeline: self,
                    index,
                },
                msg,
            ),
        }
    }

    fn node_close(&self, index: usize) {
        match &self.nodes[index].kind {
            NodeKind::Head => (self.link.close)(),
            NodeKind::Tail => self.node_close(index - 1),
            NodeKind::Handler(handler) => handler.close(&Context {
                pipeline: self,
                index,
            }),
        }
    }

    fn node_closed(&self, index: usize) {
        match &self.nodes[index].kind {
            NodeKind::Head => self.node_closed(index + 1),
            NodeKind::Tail => {}
            NodeKind::Handler(handler) => handler.notify_closed(&Context {
                pipeline: self,
                index,
            }),
        }
    }

    /// Serialize the final outbound message into the write buffer and
    /// notify the session, by message type:
    /// fixed-width integers and floats go through the endian-aware writer
    /// in network order, strings and byte runs go out raw.
    fn terminal_write(&self, msg: Msg) -> Result<()> {
        let buf = &self.link.write_buf;
        let len = match msg {
            Msg::Bytes(bytes) => {
                buf.append(&bytes);
                bytes.len()
            }
            Msg::Str(text) => {
                buf.append(text.as_bytes());
                text.len()
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Msg::Int {
                width,
                signed,
                value,
            } => {
                match (width, signed) {
                    (1, false) => buf.append_scalar_endian(value as u8, true),
                    (2, false) => buf.append_scalar_endian(value as u16, true),
                    (4, false) => buf.append_scalar_endian(value as u32, true),
                    (8, false) => buf.append_scalar_endian(value as u64, true),
                    (1, true) => buf.append_scalar_endian(value as i8, true),
                    (2, true) => buf.append_scalar_endian(value as i16, true),
                    (4, true) => buf.append_scalar_endian(value as i32, true),
                    (8, true) => buf.append_scalar_endian(value, true),
                    _ => {
                        return Err(EngineError::BadMessageType(
                            "integer width must be 1, 2, 4 or 8",
                        ))
                    }
                }
                width as usize
            }
            #[allow(clippy::cast_possible_truncation)]
            Msg::Float { width, value } => {
                match width {
                    4 => buf.append_scalar_endian(value as f32, true),
                    8 => buf.append_scalar_endian(value, true),
                    _ => return Err(EngineError::BadMessageType("float width must be 4 or 8")),
                }
                width as usize
            }
            Msg::Buffer(_) => {
                return Err(EngineError::BadMessageType("buffer handles only flow inbound"))
            }
        };
        (self.link.notify_write)(len);
        Ok(())
    }
}

/// A handler's view of its place in the chain.
///
/// Borrowed for the duration of one hook invocation; `fire_*` methods
/// advance the event to the neighboring node in its direction of travel.
pub struct Context<'a> {
    pipeline: &'a Pipeline,
    index: usize,
}

impl Context<'_> {
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.pipeline.session_id()
    }

    /// This context's registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.pipeline.nodes[self.index].name
    }

    /// Forward `connect` to the next node.
    pub fn fire_connect(&self) {
        self.pipeline.node_connect(self.index + 1);
    }

    /// Forward an inbound message to the next node.
    ///
    /// # Errors
    ///
    /// Propagates the downstream handler's failure.
    pub fn fire_read(&self, msg: Msg) -> Result<()> {
        self.pipeline.node_read(self.index + 1, msg)
    }

    /// Send an outbound message toward the head.
    ///
    /// # Errors
    ///
    /// Propagates encode and terminal-write failures.
    pub fn fire_write(&self, msg: Msg) -> Result<()> {
        self.pipeline.node_write(self.index - 1, msg)
    }

    /// Send a close request toward the head.
    pub fn fire_close(&self) {
        self.pipeline.node_close(self.index - 1);
    }

    /// Forward the closed notification to the next node.
    pub fn fire_closed(&self) {
        self.pipeline.node_closed(self.index + 1);
    }

    pub fn set_user_data(&self, data: UserData) {
        self.pipeline.set_user_data(data);
    }

    #[must_use]
    pub fn user_data(&self) -> Option<UserData> {
        self.pipeline.user_data()
    }

    /// A detachable handle to this context, usable from outside the
    /// pipeline (e.g. an application registry routing writes by id).
    #[must_use]
    pub fn pipeline_handle(&self) -> PipelineHandle {
        PipelineHandle {
            pipeline: self.pipeline.self_ref.clone(),
            index: self.index,
            session_id: self.pipeline.session_id(),
        }
    }
}

/// Cloneable, weakly-held entry point into one context.
#[derive(Clone)]
pub struct PipelineHandle {
    pipeline: Weak<Pipeline>,
    index: usize,
    session_id: u32,
}

impl PipelineHandle {
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Inject an outbound message at this context, as if its handler had
    /// called `fire_write`.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownSession`] once the pipeline is gone;
    /// otherwise whatever the encode path returns.
    pub fn write(&self, msg: Msg) -> Result<()> {
        let pipeline = self
            .pipeline
            .upgrade()
            .ok_or(EngineError::UnknownSession(self.session_id))?;
        pipeline.node_write(self.index - 1, msg)
    }

    /// Send a close request toward the head from this context.
    ///
    /// Returns `false` once the pipeline is gone.
    pub fn close(&self) -> bool {
        match self.pipeline.upgrade() {
            Some(pipeline) => {
                pipeline.node_close(self.index - 1);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Handler for Recorder {
        fn decode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
            self.log.lock().push(format!("{}:decode", self.tag));
            ctx.fire_read(msg)
        }

        fn encode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
            self.log.lock().push(format!("{}:encode", self.tag));
            ctx.fire_write(msg)
        }

        fn close(&self, ctx: &Context<'_>) {
            self.log.lock().push(format!("{}:close", self.tag));
            ctx.fire_close();
        }
    }

    fn test_pipeline(
        entries: &[(&'static str, Arc<dyn Handler>)],
    ) -> (Arc<Pipeline>, SharedBuffer, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let read_buf = SharedBuffer::new(512);
        let write_buf = SharedBuffer::new(512);
        let notified = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let mut builder = Pipeline::builder();
        for (name, handler) in entries {
            builder.add_handler(*name, Arc::clone(handler));
        }
        let notify = Arc::clone(&notified);
        let close_count = Arc::clone(&closes);
        let link = SessionLink::new(
            7,
            read_buf,
            write_buf.clone(),
            Box::new(move |len| {
                notify.fetch_add(len, Ordering::SeqCst);
            }),
            Box::new(move || {
                close_count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (builder.build(link), write_buf, notified, closes)
    }

    #[test]
    fn inbound_runs_in_insertion_order_outbound_reversed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Handler> = Arc::new(Recorder {
            tag: "a",
            log: Arc::clone(&log),
        });
        let b: Arc<dyn Handler> = Arc::new(Recorder {
            tag: "b",
            log: Arc::clone(&log),
        });
        let (pipeline, _, _, _) = test_pipeline(&[("a", a), ("b", b)]);

        pipeline.link.read_buf.append(b"x");
        pipeline.fire_read().unwrap();
        pipeline.write(Msg::from("y")).unwrap();

        assert_eq!(
            *log.lock(),
            vec!["a:decode", "b:decode", "b:encode", "a:encode"]
        );
    }

    #[test]
    fn close_reaches_head_exactly_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Handler> = Arc::new(Recorder {
            tag: "a",
            log: Arc::clone(&log),
        });
        let b: Arc<dyn Handler> = Arc::new(Recorder {
            tag: "b",
            log: Arc::clone(&log),
        });
        let (pipeline, _, _, closes) = test_pipeline(&[("a", a), ("b", b)]);

        pipeline.close();
        assert_eq!(*log.lock(), vec!["b:close", "a:close"]);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_write_serializes_by_type() {
        let (pipeline, write_buf, notified, _) = test_pipeline(&[]);

        pipeline.write(Msg::from(0x000Cu16)).unwrap();
        pipeline.write(Msg::from("AB")).unwrap();
        pipeline.write(Msg::from(vec![0xFFu8])).unwrap();
        pipeline.write(Msg::from(-2i8)).unwrap();
        pipeline.write(Msg::from(1.5f32)).unwrap();

        let mut ring = write_buf.lock();
        let len = ring.readable_bytes();
        let written = ring.read(len);
        let mut expect = vec![0x00, 0x0C, b'A', b'B', 0xFF, 0xFE];
        expect.extend_from_slice(&1.5f32.to_be_bytes());
        assert_eq!(written.as_slice(), &expect[..]);
        assert_eq!(notified.load(Ordering::SeqCst), expect.len());
    }

    #[test]
    fn buffer_handles_are_not_writable() {
        let (pipeline, _, notified, _) = test_pipeline(&[]);
        let err = pipeline
            .write(Msg::Buffer(SharedBuffer::new(512)))
            .unwrap_err();
        assert!(matches!(err, EngineError::BadMessageType(_)));
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn user_data_is_shared_between_contexts() {
        struct Setter;
        impl Handler for Setter {
            fn decode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
                ctx.set_user_data(Arc::new(41u32));
                ctx.fire_read(msg)
            }
        }
        struct Getter {
            seen: Arc<Mutex<Option<u32>>>,
        }
        impl Handler for Getter {
            fn decode(&self, ctx: &Context<'_>, _msg: Msg) -> Result<()> {
                let data = ctx.user_data().expect("set upstream");
                *self.seen.lock() = data.downcast_ref::<u32>().copied();
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let setter: Arc<dyn Handler> = Arc::new(Setter);
        let getter: Arc<dyn Handler> = Arc::new(Getter {
            seen: Arc::clone(&seen),
        });
        let (pipeline, _, _, _) = test_pipeline(&[("set", setter), ("get", getter)]);
        pipeline.link.read_buf.append(b"x");
        pipeline.fire_read().unwrap();
        assert_eq!(*seen.lock(), Some(41));
    }

    #[test]
    fn handle_outlives_borrow_and_dies_with_pipeline() {
        struct Keep {
            slot: Arc<Mutex<Option<PipelineHandle>>>,
        }
        impl Handler for Keep {
            fn connect(&self, ctx: &Context<'_>) {
                *self.slot.lock() = Some(ctx.pipeline_handle());
                ctx.fire_connect();
            }
        }

        let slot = Arc::new(Mutex::new(None));
        let keep: Arc<dyn Handler> = Arc::new(Keep {
            slot: Arc::clone(&slot),
        });
        let (pipeline, write_buf, _, _) = test_pipeline(&[("keep", keep)]);
        pipeline.fire_connect();

        let handle = slot.lock().take().expect("captured on connect");
        assert_eq!(handle.session_id(), 7);
        handle.write(Msg::from("hi")).unwrap();
        assert_eq!(write_buf.readable_bytes(), 2);

        drop(pipeline);
        assert!(matches!(
            handle.write(Msg::from("late")),
            Err(EngineError::UnknownSession(7))
        ));
        assert!(!handle.close());
    }
}
