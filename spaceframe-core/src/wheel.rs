//! Hierarchical timing wheel.
//!
//! Five cascading wheels (256 + 64 + 64 + 64 + 64 spokes) at 10 ms
//! granularity. Wheel 0 resolves the next 2.56 s directly; longer
//! intervals park on an outer wheel and cascade inward as the inner
//! wheel wraps. The maximum representable interval is
//! `2^(8 + 4*6) * 10 ms`, about seven years.
//!
//! [`TimerWheel`] is clock-agnostic: every mutating call takes `now_ms`,
//! which keeps the tick math deterministic under test. [`TimerService`]
//! binds the wheel to the system clock and a mutex, and runs due
//! callbacks only after the lock is released so a callback may freely
//! add or cancel timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::trace;

/// Tick length in milliseconds.
pub const GRANULARITY_MS: u64 = 10;

const WHEEL_BITS1: u32 = 8;
const WHEEL_BITS2: u32 = 6;
const WHEEL_SIZE1: usize = 1 << WHEEL_BITS1;
const WHEEL_SIZE2: usize = 1 << WHEEL_BITS2;
const WHEEL_MASK1: u64 = (WHEEL_SIZE1 - 1) as u64;
const WHEEL_MASK2: u64 = (WHEEL_SIZE2 - 1) as u64;
const WHEEL_COUNT: usize = 5;

const THRESHOLD1: u64 = 1 << WHEEL_BITS1;
const THRESHOLD2: u64 = 1 << (WHEEL_BITS1 + WHEEL_BITS2);
const THRESHOLD3: u64 = 1 << (WHEEL_BITS1 + 2 * WHEEL_BITS2);
const THRESHOLD4: u64 = 1 << (WHEEL_BITS1 + 3 * WHEEL_BITS2);

/// Whether a task fires once or re-arms itself after every expiry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerKind {
    Once,
    Periodic,
}

/// Shared expiry callback.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerNode {
    interval_ms: u64,
    kind: TimerKind,
    deadline_ms: u64,
    callback: TimerCallback,
}

struct Wheel {
    spokes: Vec<Vec<u32>>,
    cursor: usize,
}

impl Wheel {
    fn new(size: usize) -> Self {
        Self {
            spokes: (0..size).map(|_| Vec::new()).collect(),
            cursor: 0,
        }
    }
}

/// The five-wheel timer core.
///
/// Spokes hold task ids; the nodes live in an id map so cancellation is a
/// map removal and stale spoke entries are skipped when their spoke
/// drains. Within one tick, expiries run in insertion order.
pub struct TimerWheel {
    wheels: Vec<Wheel>,
    check_time_ms: u64,
    nodes: HashMap<u32, TimerNode>,
}

impl TimerWheel {
    /// Create a wheel anchored at `now_ms`.
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        let mut wheels = Vec::with_capacity(WHEEL_COUNT);
        wheels.push(Wheel::new(WHEEL_SIZE1));
        for _ in 1..WHEEL_COUNT {
            wheels.push(Wheel::new(WHEEL_SIZE2));
        }
        Self {
            wheels,
            check_time_ms: now_ms,
            nodes: HashMap::new(),
        }
    }

    /// Number of live (not yet expired, not cancelled) tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Register `callback` to fire `interval_ms` from `now_ms` under the
    /// caller-supplied id.
    pub fn add_task(
        &mut self,
        id: u32,
        now_ms: u64,
        interval_ms: u64,
        kind: TimerKind,
        callback: TimerCallback,
    ) {
        let node = TimerNode {
            interval_ms,
            kind,
            deadline_ms: now_ms + interval_ms,
            callback,
        };
        self.insert(id, interval_ms, node);
    }

    /// Cancel a task. Returns whether it was still pending. The spoke
    /// entry is left in place and skipped when its spoke drains.
    pub fn remove_task(&mut self, id: u32) -> bool {
        self.nodes.remove(&id).is_some()
    }

    /// Advance to `now_ms`, draining every spoke the elapsed ticks cover,
    /// and return the due callbacks in expiry order. Periodic tasks are
    /// re-armed with a fresh deadline before their callback is returned.
    #[must_use]
    pub fn tick(&mut self, now_ms: u64) -> Vec<TimerCallback> {
        let loops = if now_ms > self.check_time_ms {
            (now_ms - self.check_time_ms) / GRANULARITY_MS
        } else {
            0
        };

        let mut ready: Vec<u32> = Vec::new();
        for _ in 0..loops {
            let cursor = self.wheels[0].cursor;
            let drained = std::mem::take(&mut self.wheels[0].spokes[cursor]);
            for id in drained {
                if self.nodes.contains_key(&id) {
                    ready.push(id);
                }
            }
            self.wheels[0].cursor += 1;
            if self.wheels[0].cursor >= WHEEL_SIZE1 {
                self.wheels[0].cursor = 0;
                self.cascade(1, now_ms, &mut ready);
            }
            self.check_time_ms += GRANULARITY_MS;
        }

        self.collect_ready(ready, now_ms)
    }

    fn insert(&mut self, id: u32, delay_ms: u64, node: TimerNode) {
        let ticks = delay_ms / GRANULARITY_MS;
        let (wheel, spoke) = self.spoke_for(ticks);
        self.wheels[wheel].spokes[spoke].push(id);
        self.nodes.insert(id, node);
    }

    /// Pick the wheel and spoke for an interval of `ticks` granules,
    /// relative to each wheel's current cursor.
    fn spoke_for(&self, ticks: u64) -> (usize, usize) {
        let cursor = |w: usize| self.wheels[w].cursor as u64;
        if ticks < THRESHOLD1 {
            (0, ((ticks + cursor(0)) & WHEEL_MASK1) as usize)
        } else if ticks < THRESHOLD2 {
            let index = ((ticks - THRESHOLD1 + cursor(1) * THRESHOLD1) >> WHEEL_BITS1) & WHEEL_MASK2;
            (1, index as usize)
        } else if ticks < THRESHOLD3 {
            let index = ((ticks - THRESHOLD2 + cursor(2) * THRESHOLD2)
                >> (WHEEL_BITS1 + WHEEL_BITS2))
                & WHEEL_MASK2;
            (2, index as usize)
        } else if ticks < THRESHOLD4 {
            let index = ((ticks - THRESHOLD3 + cursor(3) * THRESHOLD3)
                >> (WHEEL_BITS1 + 2 * WHEEL_BITS2))
                & WHEEL_MASK2;
            (3, index as usize)
        } else {
            let index = ((ticks - THRESHOLD4 + cursor(4) * THRESHOLD4)
                >> (WHEEL_BITS1 + 3 * WHEEL_BITS2))
                & WHEEL_MASK2;
            (4, index as usize)
        }
    }

    /// Drain the current spoke of wheel `index`, promoting nodes inward
    /// by their remaining time; recurses outward when this wheel wraps.
    /// An out-of-range index is a no-op.
    fn cascade(&mut self, index: usize, now_ms: u64, ready: &mut Vec<u32>) {
        if index < 1 || index >= WHEEL_COUNT {
            return;
        }
        let cursor = self.wheels[index].cursor;
        let drained = std::mem::take(&mut self.wheels[index].spokes[cursor]);
        self.wheels[index].cursor += 1;

        for id in drained {
            let Some(node) = self.nodes.remove(&id) else {
                continue; // cancelled while parked
            };
            if node.deadline_ms <= now_ms {
                self.nodes.insert(id, node);
                ready.push(id);
            } else {
                let remaining = node.deadline_ms - now_ms;
                self.insert(id, remaining, node);
            }
        }

        if self.wheels[index].cursor >= self.wheels[index].spokes.len() {
            self.wheels[index].cursor = 0;
            self.cascade(index + 1, now_ms, ready);
        }
    }

    fn collect_ready(&mut self, ready: Vec<u32>, now_ms: u64) -> Vec<TimerCallback> {
        let mut callbacks = Vec::with_capacity(ready.len());
        for id in ready {
            let Some(node) = self.nodes.remove(&id) else {
                continue;
            };
            callbacks.push(Arc::clone(&node.callback));
            if node.kind == TimerKind::Periodic {
                let interval = node.interval_ms;
                let node = TimerNode {
                    deadline_ms: now_ms + interval,
                    ..node
                };
                self.insert(id, interval, node);
            }
        }
        if !callbacks.is_empty() {
            trace!(due = callbacks.len(), "timer tick expired tasks");
        }
        callbacks
    }
}

/// Milliseconds since the Unix epoch, the wheel's clock domain.
#[must_use]
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Thread-safe wheel bound to the system clock.
///
/// Callbacks collected by a tick run after the internal lock is
/// released, so they may schedule or cancel timers without deadlocking.
pub struct TimerService {
    wheel: Mutex<TimerWheel>,
    ids: AtomicU32,
}

impl TimerService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            wheel: Mutex::new(TimerWheel::new(epoch_millis())),
            ids: AtomicU32::new(0),
        }
    }

    /// Schedule a callback; returns its task id.
    pub fn add_task(
        &self,
        interval_ms: u64,
        kind: TimerKind,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> u32 {
        let id = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        self.wheel
            .lock()
            .add_task(id, epoch_millis(), interval_ms, kind, Arc::new(callback));
        id
    }

    /// Cancel a task before it fires. Returns whether it was pending.
    pub fn remove_task(&self, id: u32) -> bool {
        self.wheel.lock().remove_task(id)
    }

    /// Advance the wheel to the current time and run everything due.
    pub fn tick(&self) {
        let callbacks = self.wheel.lock().tick(epoch_millis());
        for callback in callbacks {
            callback();
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}
