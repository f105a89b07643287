//! Bounded scratch-buffer pool.
//!
//! Per-request tag buffers come from a fixed set so that a burst of
//! requests cannot balloon memory. When the set is empty the caller
//! blocks; the wait is serialized by a separate allocation lock so that
//! many starving requests queue up one at a time instead of deadlocking
//! against each other.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::{POOL_BUFFERS, POOL_BUFFER_LEN};

struct Shared {
    free: Mutex<Vec<Vec<u8>>>,
    available: Condvar,
    alloc_lock: Mutex<()>,
}

/// Bounded pool of fixed-size scratch buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
    buf_len: usize,
}

impl BufferPool {
    pub fn new(buffers: usize, buf_len: usize) -> Self {
        let free = (0..buffers).map(|_| vec![0u8; buf_len]).collect();
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(free),
                available: Condvar::new(),
                alloc_lock: Mutex::new(()),
            }),
            buf_len,
        }
    }

    /// Pool sized for full carrier-run tag areas.
    pub fn for_tags() -> Self {
        Self::new(POOL_BUFFERS, POOL_BUFFER_LEN)
    }

    /// Take a zeroed buffer, blocking until one is free.
    pub fn get(&self) -> PoolBuf {
        {
            let mut free = self.shared.free.lock();
            if let Some(mut buf) = free.pop() {
                buf.fill(0);
                return PoolBuf {
                    pool: self.clone(),
                    buf: Some(buf),
                };
            }
        }
        // Exhausted: only one request at a time may sit in the blocking
        // path, mirroring the allocation-lock discipline of the page pool.
        let _alloc = self.shared.alloc_lock.lock();
        let mut free = self.shared.free.lock();
        while free.is_empty() {
            self.shared.available.wait(&mut free);
        }
        let mut buf = free.pop().unwrap_or_else(|| vec![0u8; self.buf_len]);
        buf.fill(0);
        PoolBuf {
            pool: self.clone(),
            buf: Some(buf),
        }
    }

    /// Buffers currently free (diagnostics and tests).
    pub fn free_buffers(&self) -> usize {
        self.shared.free.lock().len()
    }

    fn put_back(&self, buf: Vec<u8>) {
        let mut free = self.shared.free.lock();
        free.push(buf);
        self.shared.available.notify_one();
    }
}

/// A pooled buffer; returns itself to the pool on drop.
pub struct PoolBuf {
    pool: BufferPool,
    buf: Option<Vec<u8>>,
}

impl std::ops::Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl std::ops::DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn buffers_cycle_through_the_pool() {
        let pool = BufferPool::new(2, 8);
        let a = pool.get();
        let _b = pool.get();
        assert_eq!(pool.free_buffers(), 0);
        drop(a);
        assert_eq!(pool.free_buffers(), 1);
    }

    #[test]
    fn exhaustion_blocks_until_release() {
        let pool = BufferPool::new(1, 8);
        let held = pool.get();
        let pool2 = pool.clone();
        let waiter = thread::spawn(move || {
            let buf = pool2.get();
            buf.len()
        });
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap(), 8);
    }

    #[test]
    fn buffers_come_back_zeroed() {
        let pool = BufferPool::new(1, 4);
        {
            let mut buf = pool.get();
            buf.copy_from_slice(&[1, 2, 3, 4]);
        }
        let buf = pool.get();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }
}
