//! # Sequence Lock
//!
//! Versioned reader/writer lock for small, read-mostly records such as the
//! jiffies baseline and the per-CPU idle statistics.
//!
//! ```text
//!   sequence:   0 ──▶ 1 ──────────▶ 2 ──▶ 3 ──────────▶ 4
//!                     │  writer     │     │  writer     │
//!                     └─ active ────┘     └─ active ────┘
//!
//!   reader:  s = read_begin()   (spins while odd)
//!            copy data
//!            read_retry(s)?     (sequence moved → copy again)
//! ```
//!
//! Readers never block a writer and never take a lock; they retry when a
//! write overlapped their copy. Writers are serialized by a spinlock so
//! at most one of them bumps the sequence at a time.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

/// Sequence-protected value
pub struct SeqLock<T: Copy> {
    sequence: AtomicU64,
    writer: Mutex<()>,
    data: UnsafeCell<T>,
}

// SAFETY: writers are serialized by `writer`; readers only copy `T` out and
// discard copies that raced with a writer.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    /// Create a new sequence lock
    pub const fn new(value: T) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            writer: Mutex::new(()),
            data: UnsafeCell::new(value),
        }
    }

    /// Start an optimistic read section, waiting out an active writer
    #[inline]
    pub fn read_begin(&self) -> u64 {
        loop {
            let seq = self.sequence.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            core::hint::spin_loop();
        }
    }

    /// Did a writer run since `start`?
    #[inline]
    pub fn read_retry(&self, start: u64) -> bool {
        fence(Ordering::Acquire);
        self.sequence.load(Ordering::Relaxed) != start
    }

    /// Copy the protected value out, retrying on writer conflicts
    pub fn read(&self) -> T {
        loop {
            let seq = self.read_begin();
            // SAFETY: a torn copy is possible only while a writer is active,
            // in which case `read_retry` fails and the copy is dropped.
            let value = unsafe { core::ptr::read_volatile(self.data.get()) };
            if !self.read_retry(seq) {
                return value;
            }
        }
    }

    /// Current sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Enter the write section
    pub fn write(&self) -> SeqLockWriteGuard<'_, T> {
        let guard = self.writer.lock();
        self.sequence.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        SeqLockWriteGuard {
            lock: self,
            _writer: guard,
        }
    }
}

impl<T: Copy + Default> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for SeqLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqLock")
            .field("sequence", &self.sequence())
            .field("data", &self.read())
            .finish()
    }
}

/// Exclusive write access; the sequence becomes even again on drop
pub struct SeqLockWriteGuard<'a, T: Copy> {
    lock: &'a SeqLock<T>,
    _writer: MutexGuard<'a, ()>,
}

impl<T: Copy> Deref for SeqLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer mutex is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: Copy> DerefMut for SeqLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer mutex is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: Copy> Drop for SeqLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.sequence.fetch_add(1, Ordering::Release);
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for SeqLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SeqLockWriteGuard").field(&**self).finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    struct Pair {
        a: u64,
        b: u64,
    }

    #[test]
    fn test_write_bumps_sequence_twice() {
        let lock = SeqLock::new(Pair::default());
        assert_eq!(lock.sequence(), 0);

        {
            let mut guard = lock.write();
            assert_eq!(lock.sequence() & 1, 1);
            guard.a = 7;
        }

        assert_eq!(lock.sequence(), 2);
        assert_eq!(lock.read().a, 7);
    }

    #[test]
    fn test_retry_detects_writer() {
        let lock = SeqLock::new(Pair::default());
        let seq = lock.read_begin();
        lock.write().b = 3;
        assert!(lock.read_retry(seq));

        let seq = lock.read_begin();
        assert!(!lock.read_retry(seq));
    }

    #[test]
    fn test_readers_never_see_torn_values() {
        let lock = Arc::new(SeqLock::new(Pair::default()));
        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for i in 1..=10_000u64 {
                    let mut guard = lock.write();
                    guard.a = i;
                    guard.b = i * 2;
                }
            })
        };

        let readers: std::vec::Vec<_> = (0..3)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let pair = lock.read();
                        assert_eq!(pair.b, pair.a * 2);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(lock.read(), Pair { a: 10_000, b: 20_000 });
    }
}
