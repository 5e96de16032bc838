//! Size-tiered buffer pool for copy loops and packet scratch space.
//!
//! Buffers are pooled per capacity tier (1 KiB, 2 KiB, 5 KiB, 16 KiB, plus
//! a tier for anything smaller) and returned on drop. Tiers are bounded;
//! surplus buffers are simply freed.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

const TIER_1K: usize = 1024;
const TIER_2K: usize = 2 * 1024;
const TIER_5K: usize = 5 * 1024;
const TIER_16K: usize = 16 * 1024;

const MAX_POOLED_PER_TIER: usize = 32;

static POOLS: [Mutex<Vec<Vec<u8>>>; 5] = [
    Mutex::new(Vec::new()),
    Mutex::new(Vec::new()),
    Mutex::new(Vec::new()),
    Mutex::new(Vec::new()),
    Mutex::new(Vec::new()),
];

fn tier(size: usize) -> usize {
    if size >= TIER_16K {
        4
    } else if size >= TIER_5K {
        3
    } else if size >= TIER_2K {
        2
    } else if size >= TIER_1K {
        1
    } else {
        0
    }
}

/// Returns a zeroed buffer of exactly `size` bytes, reusing a pooled
/// allocation when one with sufficient capacity exists.
pub fn get(size: usize) -> PooledBuf {
    let mut buf = POOLS[tier(size)]
        .lock()
        .expect("buffer pool lock")
        .pop()
        .unwrap_or_default();
    if buf.capacity() < size {
        buf = Vec::with_capacity(size);
    }
    buf.clear();
    buf.resize(size, 0);
    PooledBuf { buf }
}

fn put(mut buf: Vec<u8>) {
    let idx = tier(buf.capacity());
    buf.clear();
    let mut pool = POOLS[idx].lock().expect("buffer pool lock");
    if pool.len() < MAX_POOLED_PER_TIER {
        pool.push(buf);
    }
}

/// A pooled buffer; dereferences to `[u8]` and returns to its capacity
/// tier on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
}

impl PooledBuf {
    /// Returns the capacity of the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_have_requested_length() {
        for size in [0, 1, 512, 1024, 4096, 16 * 1024, 64 * 1024] {
            let buf = get(size);
            assert_eq!(buf.len(), size);
        }
    }

    #[test]
    fn returned_capacity_is_reused() {
        let size = 16 * 1024;
        drop(get(size));
        let buf = get(size);
        assert!(buf.capacity() >= size);
    }

    #[test]
    fn larger_request_than_pooled_capacity_allocates_fresh() {
        drop(get(1024));
        let buf = get(2047);
        // Tier 1 held a 1 KiB buffer; a 2047-byte request must not shrink.
        assert!(buf.len() == 2047);
    }

    #[test]
    fn concurrent_use_is_safe() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..100 {
                        let mut buf = get(16 * 1024);
                        buf[0] = 0xAB;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
