//! Writer-priority read/write lock.
//!
//! Guards the server's session maps, where reads (routing a write to a
//! session) vastly outnumber writes (accept, close, idle sweep) but a
//! queued writer must not wait behind a stream of readers: new readers
//! block while any writer is active *or waiting*. When the last writer
//! releases, all parked readers are admitted together.
//!
//! # Safety
//!
//! The data cell is the one unsafe element here. The guard discipline
//! enforces the usual aliasing rules: a [`WriteGuard`] exists only while
//! `writer_active` is set and no reader is inside, and [`ReadGuard`]s
//! only exist while no writer is active.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct State {
    readers: usize,
    /// Writers active plus writers parked. Readers check this, which is
    /// what gives writers priority over late-arriving readers.
    writers: usize,
    writer_active: bool,
}

/// A read/write lock that admits waiting writers before new readers.
#[derive(Default)]
pub struct WriterFirstLock<T> {
    state: Mutex<State>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by the guard protocol; shared
// guards only hand out `&T` and the exclusive guard is unique.
unsafe impl<T: Send> Send for WriterFirstLock<T> {}
unsafe impl<T: Send + Sync> Sync for WriterFirstLock<T> {}

impl<T> WriterFirstLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(State::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire shared access; blocks while a writer is active or queued.
    pub fn read_guard(&self) -> ReadGuard<'_, T> {
        let mut state = self.state.lock();
        while state.writers > 0 {
            self.readers_cv.wait(&mut state);
        }
        state.readers += 1;
        ReadGuard { lock: self }
    }

    /// Acquire exclusive access; blocks until current readers drain and
    /// any active writer releases.
    pub fn write_guard(&self) -> WriteGuard<'_, T> {
        let mut state = self.state.lock();
        state.writers += 1;
        while state.readers > 0 || state.writer_active {
            self.writers_cv.wait(&mut state);
        }
        state.writer_active = true;
        WriteGuard { lock: self }
    }

    fn read_unlock(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 && state.writers > 0 {
            self.writers_cv.notify_one();
        }
    }

    fn write_unlock(&self) {
        let mut state = self.state.lock();
        state.writers -= 1;
        state.writer_active = false;
        if state.writers == 0 {
            self.readers_cv.notify_all();
        } else {
            self.writers_cv.notify_one();
        }
    }
}

/// RAII shared access. Dropping releases.
pub struct ReadGuard<'a, T> {
    lock: &'a WriterFirstLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: no writer is active while any ReadGuard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// RAII exclusive access. Dropping releases.
pub struct WriteGuard<'a, T> {
    lock: &'a WriterFirstLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard is the only access while writer_active.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard is the only access while writer_active.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
