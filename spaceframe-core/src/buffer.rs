//! Segmented session buffer.
//!
//! A growable ring of fixed-size blocks with independent read and write
//! cursors. One of these sits on each side of a session: the socket side
//! appends raw bytes, the decode side peels frames off. Consumed head
//! blocks are rotated to the tail and reused instead of freed, growth adds
//! blocks in whole units, and sustained low utilization shrinks the tail.
//!
//! # Shapes
//!
//! - [`SegmentedRing`] is the single-threaded core holding the block ring
//!   and all cursor arithmetic.
//! - [`SharedBuffer`] wraps a ring for the session's
//!   single-producer/single-consumer split: the I/O side appends, the
//!   worker side consumes, each entering a short critical section.
//!
//! # Tradeoffs
//!
//! - Appends and commits never fail; the ring grows until the bytes fit.
//! - `peek`/`read` copy into an exact-length [`Block`], so frames handed
//!   to handlers never alias ring memory.
//! - A one-shot drain notifier supports read-side high-water suspension:
//!   armed with a mark, it fires exactly once when a consume brings the
//!   readable count below the mark.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::trace;

use crate::block::{round_to_unit, Block, BLOCK_UNIT};
use crate::endian::Scalar;

/// Default block size for buffers constructed with [`SegmentedRing::default`].
pub const INITIAL_BLOCK_SIZE: usize = BLOCK_UNIT;

/// A block is appended early when the trailing free run of the current
/// write block drops below `block_size / REMAIN_RATIO`.
pub const REMAIN_RATIO: usize = 8;

/// Consecutive low-utilization append cycles before the tail shrinks.
pub const LOW_USE_CEIL: usize = 10;

/// One-shot callback armed by [`SegmentedRing::arm_drain_notifier`].
pub type DrainNotifier = Box<dyn FnOnce() + Send>;

/// Growable chunked byte ring with separate read and write cursors.
///
/// Starts in an inactive state holding a single placeholder byte; the
/// first append swaps in two full-sized blocks. From then on the first
/// block always exists and fully-consumed head blocks rotate to the tail
/// on the next append.
///
/// `readable_bytes() + writable_bytes() == total_bytes()` holds between
/// calls: consumes credit the writable count immediately, while the
/// internal growth decisions use the actual free run behind the write
/// cursor.
pub struct SegmentedRing {
    blocks: VecDeque<Block>,
    read_block: usize,
    read_offset: usize,
    write_block: usize,
    write_offset: usize,
    block_size: usize,
    readable: usize,
    writable: usize,
    total: usize,
    low_use_count: usize,
    active: bool,
    drain_mark: usize,
    drain_notifier: Option<DrainNotifier>,
}

impl SegmentedRing {
    /// Create a ring whose blocks are `initial_size` rounded up to a
    /// multiple of [`BLOCK_UNIT`].
    #[must_use]
    pub fn new(initial_size: usize) -> Self {
        let mut blocks = VecDeque::new();
        blocks.push_back(Block::new(1));
        Self {
            blocks,
            read_block: 0,
            read_offset: 0,
            write_block: 0,
            write_offset: 0,
            block_size: round_to_unit(initial_size),
            readable: 0,
            writable: 1,
            total: 1,
            low_use_count: 0,
            active: false,
            drain_mark: 0,
            drain_notifier: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.readable
    }

    #[inline]
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.writable
    }

    #[inline]
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Arm the one-shot drain notifier: `notify` runs the first time a
    /// consume leaves fewer than `mark` readable bytes.
    pub fn arm_drain_notifier(&mut self, mark: usize, notify: impl FnOnce() + Send + 'static) {
        self.drain_mark = mark;
        self.drain_notifier = Some(Box::new(notify));
    }

    /// Append `data` through the write cursor, growing as needed.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.check_active();
        self.adjust_buffer(data.len());
        self.copy_in(data);
        self.advance_write(data.len());
        self.readable += data.len();
        self.writable -= data.len();
    }

    /// Append a fixed-width value in the given byte order.
    pub fn append_scalar_endian<T: Scalar>(&mut self, value: T, big_endian: bool) {
        let mut raw = [0u8; 8];
        value.put(big_endian, &mut raw);
        self.append(&raw[..T::SIZE]);
    }

    /// Append a fixed-width value in network byte order.
    pub fn append_scalar<T: Scalar>(&mut self, value: T) {
        self.append_scalar_endian(value, true);
    }

    /// Commit `len` bytes written directly into the free chunks returned by
    /// [`writable_chunks`](Self::writable_chunks).
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable);
        let len = len.min(self.writable);
        if len == 0 {
            return;
        }
        self.check_active();
        self.adjust_buffer(len);
        self.advance_write(len);
        self.readable += len;
        self.writable -= len;
    }

    /// Copy the next `len` readable bytes without consuming them.
    ///
    /// Saturates to the readable count in release builds; asserts in debug.
    #[must_use]
    pub fn peek(&self, len: usize) -> Block {
        debug_assert!(len <= self.readable);
        let len = len.min(self.readable);
        let mut out = vec![0u8; len];
        self.copy_out(0, &mut out);
        Block::from(out)
    }

    /// Copy and consume the next `len` readable bytes.
    #[must_use]
    pub fn read(&mut self, len: usize) -> Block {
        let block = self.peek(len);
        self.retrieve(block.len());
        block
    }

    /// Decode a fixed-width value at `index` bytes past the read cursor
    /// without consuming anything.
    #[must_use]
    pub fn peek_scalar_at<T: Scalar>(&self, index: usize, big_endian: bool) -> T {
        debug_assert!(self.readable >= index + T::SIZE);
        let mut raw = [0u8; 8];
        let avail = self.readable.saturating_sub(index).min(T::SIZE);
        self.copy_out(index, &mut raw[..avail]);
        T::get(big_endian, &raw[..T::SIZE])
    }

    /// Read one byte at `index` past the read cursor without consuming.
    #[must_use]
    pub fn byte_at(&self, index: usize) -> u8 {
        debug_assert!(index < self.readable);
        if index >= self.readable {
            return 0;
        }
        let mut raw = [0u8; 1];
        self.copy_out(index, &mut raw);
        raw[0]
    }

    /// Consume a fixed-width value in the given byte order.
    #[must_use]
    pub fn read_scalar_endian<T: Scalar>(&mut self, big_endian: bool) -> T {
        debug_assert!(self.readable >= T::SIZE);
        let block = self.read(T::SIZE);
        let got = block.len().min(T::SIZE);
        let mut raw = [0u8; 8];
        raw[..got].copy_from_slice(&block[..got]);
        T::get(big_endian, &raw[..T::SIZE])
    }

    /// Consume a fixed-width value in network byte order.
    #[must_use]
    pub fn read_scalar<T: Scalar>(&mut self) -> T {
        self.read_scalar_endian(true)
    }

    /// Advance the read cursor by `len` bytes.
    ///
    /// Fires the drain notifier inline when armed and the consume crosses
    /// below the mark.
    pub fn retrieve(&mut self, len: usize) {
        if let Some(notify) = self.retrieve_deferred(len) {
            notify();
        }
    }

    /// Consume like [`retrieve`](Self::retrieve) but hand the fired
    /// notifier back to the caller instead of running it, so a lock
    /// wrapping the ring can be released first.
    pub fn retrieve_deferred(&mut self, len: usize) -> Option<DrainNotifier> {
        debug_assert!(len <= self.readable);
        let len = len.min(self.readable);
        self.advance_read(len);
        self.readable -= len;
        self.writable += len;
        if self.drain_notifier.is_some() && self.readable < self.drain_mark {
            self.drain_mark = 0;
            return self.drain_notifier.take();
        }
        None
    }

    /// Free-space scatter view: the residual of the current write block
    /// followed by every block after it. Recomputed on each call.
    pub fn writable_chunks(&mut self) -> SmallVec<[&mut [u8]; 4]> {
        let write_block = self.write_block;
        let write_offset = self.write_offset;
        let mut out = SmallVec::new();
        for (i, block) in self.blocks.iter_mut().enumerate().skip(write_block) {
            let slice = block.as_mut_slice();
            if i == write_block {
                let (_, free) = slice.split_at_mut(write_offset);
                out.push(free);
            } else {
                out.push(slice);
            }
        }
        out
    }

    /// Readable gather view: from the read cursor to the write cursor.
    #[must_use]
    pub fn readable_chunks(&self) -> SmallVec<[&[u8]; 4]> {
        let mut out = SmallVec::new();
        if self.read_block == self.write_block {
            out.push(&self.blocks[self.read_block].as_slice()[self.read_offset..self.write_offset]);
            return out;
        }
        out.push(&self.blocks[self.read_block].as_slice()[self.read_offset..]);
        for block in self
            .blocks
            .iter()
            .take(self.write_block)
            .skip(self.read_block + 1)
        {
            out.push(block.as_slice());
        }
        out.push(&self.blocks[self.write_block].as_slice()[..self.write_offset]);
        out
    }

    /// Replace the placeholder with two full-sized blocks on first use.
    fn check_active(&mut self) {
        if self.active {
            return;
        }
        self.blocks[0] = Block::new(self.block_size);
        self.blocks.push_back(Block::new(self.block_size));
        self.writable = 2 * self.block_size;
        self.total = 2 * self.block_size;
        self.active = true;
    }

    /// Free capacity behind the write cursor, in ring order.
    fn free_tail(&self) -> usize {
        let mut free = self.blocks[self.write_block].len() - self.write_offset;
        for block in self.blocks.iter().skip(self.write_block + 1) {
            free += block.len();
        }
        free
    }

    /// Rotate fully-consumed head blocks to the tail so their capacity
    /// rejoins the free run.
    fn rotate_consumed(&mut self) {
        while self.read_block != 0 {
            let block = self.blocks.pop_front().expect("ring is never empty");
            self.blocks.push_back(block);
            self.read_block -= 1;
            self.write_block -= 1;
        }
    }

    fn add_block(&mut self) -> usize {
        self.blocks.push_back(Block::new(self.block_size));
        self.writable += self.block_size;
        self.total += self.block_size;
        self.block_size
    }

    /// Keep a healthy trailing run: append a block when fewer than
    /// `block_size / REMAIN_RATIO` bytes would remain after the write.
    fn check_to_add_block(&mut self, len: usize) {
        let free = self.free_tail();
        debug_assert!(len <= free);
        let len = len.min(free);
        if free - len < self.block_size / REMAIN_RATIO {
            self.add_block();
        }
    }

    /// Make room for `len` bytes: reclaim rotated blocks, grow if the free
    /// tail is short, and track sustained under-utilization for shrinking.
    fn adjust_buffer(&mut self, len: usize) {
        self.rotate_consumed();

        if self.free_tail() >= len {
            self.check_to_add_block(len);

            if self.blocks.len() > 3 && (self.readable + self.writable) / 2 < self.total {
                self.low_use_count += 1;
            }
            if self.low_use_count >= LOW_USE_CEIL {
                self.shrink_tail();
                self.low_use_count = 0;
            }
            return;
        }

        self.low_use_count = 0;

        let mut remain = len - self.free_tail();
        while remain > 0 {
            let added = self.add_block();
            remain = remain.saturating_sub(added);
        }
        self.check_to_add_block(len);
    }

    /// Release roughly a quarter of the capacity from the tail. Stops at
    /// the write cursor's block and never drops below the two-block
    /// active baseline.
    fn shrink_tail(&mut self) {
        let mut reduce = self.total / 4;
        let mut released = 0usize;
        while self.blocks.len() > 2
            && self.write_block < self.blocks.len() - 1
            && reduce >= self.blocks.back().expect("ring is never empty").len()
        {
            let block = self.blocks.pop_back().expect("ring is never empty");
            reduce -= block.len();
            self.total -= block.len();
            self.writable -= block.len();
            released += block.len();
        }
        if released > 0 {
            trace!(released, total = self.total, "buffer shrank tail");
        }
    }

    fn copy_in(&mut self, data: &[u8]) {
        let mut src = data;
        let mut block_index = self.write_block;
        let mut offset = self.write_offset;
        while !src.is_empty() {
            let block = &mut self.blocks[block_index];
            let space = block.len() - offset;
            let take = space.min(src.len());
            block.as_mut_slice()[offset..offset + take].copy_from_slice(&src[..take]);
            src = &src[take..];
            block_index += 1;
            offset = 0;
        }
    }

    /// Copy readable bytes starting `skip` past the read cursor.
    ///
    /// Callers guarantee `skip + dst.len() <= readable`.
    fn copy_out(&self, skip: usize, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }
        let mut block_index = self.read_block;
        let mut offset = self.read_offset;

        let mut skip = skip;
        while skip > 0 {
            let run = self.blocks[block_index].len() - offset;
            if run > skip {
                offset += skip;
                break;
            }
            skip -= run;
            block_index += 1;
            offset = 0;
        }

        let mut written = 0;
        while written < dst.len() {
            let block = &self.blocks[block_index];
            let run = block.len() - offset;
            let take = run.min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&block.as_slice()[offset..offset + take]);
            written += take;
            block_index += 1;
            offset = 0;
        }
    }

    fn advance_write(&mut self, len: usize) {
        let mut len = len;
        while len > 0 {
            let run = self.blocks[self.write_block].len() - self.write_offset;
            if run > len {
                self.write_offset += len;
                return;
            }
            len -= run;
            self.write_block += 1;
            self.write_offset = 0;
        }
    }

    fn advance_read(&mut self, len: usize) {
        let mut len = len;
        while len > 0 {
            let run = self.blocks[self.read_block].len() - self.read_offset;
            if run > len {
                self.read_offset += len;
                return;
            }
            len -= run;
            self.read_block += 1;
            self.read_offset = 0;
        }
    }
}

impl Default for SegmentedRing {
    fn default() -> Self {
        Self::new(INITIAL_BLOCK_SIZE)
    }
}

/// A [`SegmentedRing`] behind a short mutex, cloneable across threads.
///
/// Contract: exactly one side appends and one side consumes. The session
/// engine holds that by construction (I/O pump appends, worker consumes);
/// the mutex makes the cursor handoff sound and keeps every critical
/// section to one bounded copy. Notifiers fired by a consume through this
/// wrapper run after the lock is released.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<Mutex<SegmentedRing>>,
}

impl SharedBuffer {
    #[must_use]
    pub fn new(initial_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SegmentedRing::new(initial_size))),
        }
    }

    /// Lock the underlying ring for a compound section, e.g. a decoder
    /// scanning and consuming in one pass.
    pub fn lock(&self) -> MutexGuard<'_, SegmentedRing> {
        self.inner.lock()
    }

    pub fn append(&self, data: &[u8]) {
        self.inner.lock().append(data);
    }

    pub fn append_scalar_endian<T: Scalar>(&self, value: T, big_endian: bool) {
        self.inner.lock().append_scalar_endian(value, big_endian);
    }

    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.inner.lock().readable_bytes()
    }

    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.inner.lock().writable_bytes()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes()
    }

    #[must_use]
    pub fn peek(&self, len: usize) -> Block {
        self.inner.lock().peek(len)
    }

    #[must_use]
    pub fn read(&self, len: usize) -> Block {
        let (block, notify) = {
            let mut ring = self.inner.lock();
            let block = ring.peek(len);
            let notify = ring.retrieve_deferred(block.len());
            (block, notify)
        };
        if let Some(notify) = notify {
            notify();
        }
        block
    }

    pub fn retrieve(&self, len: usize) {
        let notify = self.inner.lock().retrieve_deferred(len);
        if let Some(notify) = notify {
            notify();
        }
    }

    pub fn arm_drain_notifier(&self, mark: usize, notify: impl FnOnce() + Send + 'static) {
        self.inner.lock().arm_drain_notifier(mark, notify);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn starts_inactive_with_placeholder() {
        let ring = SegmentedRing::new(512);
        assert!(!ring.is_active());
        assert_eq!(ring.block_count(), 1);
        assert_eq!(ring.readable_bytes(), 0);
        assert_eq!(ring.writable_bytes(), 1);
        assert_eq!(ring.total_bytes(), 1);
    }

    #[test]
    fn first_append_activates() {
        let mut ring = SegmentedRing::new(512);
        ring.append(b"abc");
        assert!(ring.is_active());
        assert_eq!(ring.block_count(), 2);
        assert_eq!(ring.total_bytes(), 1024);
        assert_eq!(ring.readable_bytes(), 3);
        assert_eq!(
            ring.readable_bytes() + ring.writable_bytes(),
            ring.total_bytes()
        );
    }

    #[test]
    fn rounds_block_size_up() {
        let ring = SegmentedRing::new(600);
        assert_eq!(ring.block_size(), 1024);
    }

    #[test]
    fn fifo_and_peek_equals_read() {
        let mut ring = SegmentedRing::default();
        ring.append(b"hello ");
        ring.append(b"world");
        let peeked = ring.peek(11);
        let read = ring.read(11);
        assert_eq!(peeked.as_slice(), read.as_slice());
        assert_eq!(read.as_slice(), b"hello world");
        assert_eq!(ring.readable_bytes(), 0);
    }

    #[test]
    fn append_crosses_block_boundaries() {
        let mut ring = SegmentedRing::new(512);
        let data: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        ring.append(&data);
        assert_eq!(ring.read(600).as_slice(), &data[..]);
    }

    #[test]
    fn accounting_law_over_random_ops() {
        let mut ring = SegmentedRing::new(512);
        let mut mirror: Vec<u8> = Vec::new();
        let mut next_byte = 0u8;
        let mut seed = 0x2545_F491u64;

        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let n = (seed >> 33) as usize % 700;
            if seed & 1 == 0 {
                let chunk: Vec<u8> = (0..n)
                    .map(|_| {
                        next_byte = next_byte.wrapping_add(1);
                        next_byte
                    })
                    .collect();
                ring.append(&chunk);
                mirror.extend_from_slice(&chunk);
            } else {
                let take = n.min(ring.readable_bytes());
                let got = ring.read(take);
                let expect: Vec<u8> = mirror.drain(..take).collect();
                assert_eq!(got.as_slice(), &expect[..]);
            }
            assert_eq!(
                ring.readable_bytes() + ring.writable_bytes(),
                ring.total_bytes()
            );
            assert_eq!(ring.readable_bytes(), mirror.len());
        }
    }

    #[test]
    fn endian_round_trip_all_scalars() {
        for &be in &[true, false] {
            let mut ring = SegmentedRing::default();
            ring.append_scalar_endian(0xABu8, be);
            ring.append_scalar_endian(0xBEEFu16, be);
            ring.append_scalar_endian(0xDEAD_BEEFu32, be);
            ring.append_scalar_endian(0x0123_4567_89AB_CDEFu64, be);
            ring.append_scalar_endian(-7i8, be);
            ring.append_scalar_endian(-300i16, be);
            ring.append_scalar_endian(-70_000i32, be);
            ring.append_scalar_endian(-5_000_000_000i64, be);
            ring.append_scalar_endian(1.5f32, be);
            ring.append_scalar_endian(-2.25f64, be);

            assert_eq!(ring.read_scalar_endian::<u8>(be), 0xAB);
            assert_eq!(ring.read_scalar_endian::<u16>(be), 0xBEEF);
            assert_eq!(ring.read_scalar_endian::<u32>(be), 0xDEAD_BEEF);
            assert_eq!(ring.read_scalar_endian::<u64>(be), 0x0123_4567_89AB_CDEF);
            assert_eq!(ring.read_scalar_endian::<i8>(be), -7);
            assert_eq!(ring.read_scalar_endian::<i16>(be), -300);
            assert_eq!(ring.read_scalar_endian::<i32>(be), -70_000);
            assert_eq!(ring.read_scalar_endian::<i64>(be), -5_000_000_000);
            assert_eq!(ring.read_scalar_endian::<f32>(be), 1.5);
            assert_eq!(ring.read_scalar_endian::<f64>(be), -2.25);
            assert_eq!(ring.readable_bytes(), 0);
        }
    }

    #[test]
    fn peek_scalar_at_offset() {
        let mut ring = SegmentedRing::default();
        ring.append(&[0xCA, 0xFE, 0x00, 0x0C]);
        assert_eq!(ring.peek_scalar_at::<u16>(2, true), 12);
        assert_eq!(ring.peek_scalar_at::<u16>(0, true), 0xCAFE);
        // Peeking never consumes.
        assert_eq!(ring.readable_bytes(), 4);
        assert_eq!(ring.byte_at(1), 0xFE);
    }

    #[test]
    fn drain_notifier_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut ring = SegmentedRing::default();
        ring.append(&[0u8; 100]);

        let counter = Arc::clone(&fired);
        ring.arm_drain_notifier(50, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ring.retrieve(40);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "still at the mark");
        ring.retrieve(20);
        assert_eq!(fired.load(Ordering::SeqCst), 1, "crossed below the mark");
        ring.retrieve(40);
        assert_eq!(fired.load(Ordering::SeqCst), 1, "one-shot");
    }

    #[test]
    fn consumed_blocks_rotate_instead_of_growing() {
        let mut ring = SegmentedRing::new(512);
        let payload = vec![7u8; 1024];
        ring.append(&payload);
        let blocks_after_first = ring.block_count();
        for _ in 0..20 {
            let got = ring.read(1024);
            assert_eq!(got.len(), 1024);
            ring.append(&payload);
            assert_eq!(ring.block_count(), blocks_after_first);
        }
    }

    #[test]
    fn sustained_low_use_shrinks_tail() {
        let mut ring = SegmentedRing::new(512);
        ring.append(&vec![1u8; 4096]);
        let grown_total = ring.total_bytes();
        assert!(grown_total >= 4096);
        ring.retrieve(4096);

        for _ in 0..LOW_USE_CEIL {
            ring.append(&[2u8; 16]);
        }

        assert!(
            ring.total_bytes() < grown_total,
            "expected shrink: {} -> {}",
            grown_total,
            ring.total_bytes()
        );
        assert_eq!(
            ring.readable_bytes() + ring.writable_bytes(),
            ring.total_bytes()
        );
        // The retained bytes survive the shrink.
        let kept = ring.read(16 * LOW_USE_CEIL);
        assert!(kept.iter().all(|&b| b == 2));
    }

    #[test]
    fn scatter_commit_round_trip() {
        let mut ring = SegmentedRing::new(512);
        ring.append(b"seed");
        {
            let mut chunks = ring.writable_chunks();
            assert!(!chunks.is_empty());
            chunks[0][..5].copy_from_slice(b"hello");
        }
        ring.has_written(5);
        assert_eq!(ring.read(9).as_slice(), b"seedhello");
    }

    #[test]
    fn gather_view_covers_readable_region() {
        let mut ring = SegmentedRing::new(512);
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 241) as u8).collect();
        ring.append(&data);
        let mut gathered = Vec::new();
        for chunk in ring.readable_chunks() {
            gathered.extend_from_slice(chunk);
        }
        assert_eq!(gathered, data);
    }

    #[test]
    fn shared_buffer_spsc_round_trip() {
        let buf = SharedBuffer::new(512);
        let producer = buf.clone();

        let handle = std::thread::spawn(move || {
            let mut value = 0u32;
            for _ in 0..100 {
                let chunk: Vec<u8> = (0..100)
                    .map(|_| {
                        value = value.wrapping_add(1);
                        (value % 251) as u8
                    })
                    .collect();
                producer.append(&chunk);
            }
        });

        let mut seen = 0usize;
        let mut value = 0u32;
        while seen < 10_000 {
            let available = buf.readable_bytes();
            if available == 0 {
                std::thread::yield_now();
                continue;
            }
            let block = buf.read(available);
            for &b in block.iter() {
                value = value.wrapping_add(1);
                assert_eq!(b, (value % 251) as u8);
            }
            seen += block.len();
        }
        handle.join().unwrap();
        assert_eq!(buf.readable_bytes(), 0);
    }
}
