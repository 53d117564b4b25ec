// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::sync::Mutex;

/// Server-wide byte budget for large upload staging buffers.
///
/// Connections that stream uploads claim their staging buffer from this
/// budget and give it back when the request completes, so a burst of large
/// uploads degrades into smaller staging buffers instead of unbounded
/// allocation. `claim` and `reclaim` are the only operations; the mutex is
/// uncontended outside multi-threaded run modes.
#[derive(Debug)]
pub struct BufferPool {
    total: u64,
    remaining: Mutex<u64>,
}

impl BufferPool {
    pub fn new(total: u64) -> BufferPool {
        BufferPool {
            total,
            remaining: Mutex::new(total),
        }
    }

    /// Attempts to claim `n` bytes from the budget.
    pub fn claim(&self, n: u64) -> bool {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining >= n {
            *remaining -= n;
            true
        } else {
            false
        }
    }

    /// Returns `n` previously claimed bytes to the budget.
    pub fn reclaim(&self, n: u64) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = (*remaining + n).min(self.total);
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> u64 {
        *self.remaining.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::BufferPool;

    #[test]
    fn claim_and_reclaim() {
        let pool = BufferPool::new(100);
        assert!(pool.claim(60));
        assert!(!pool.claim(60));
        assert!(pool.claim(40));
        assert_eq!(pool.remaining(), 0);
        pool.reclaim(60);
        assert_eq!(pool.remaining(), 60);
    }

    #[test]
    fn reclaim_never_exceeds_total() {
        let pool = BufferPool::new(10);
        pool.reclaim(50);
        assert_eq!(pool.remaining(), 10);
    }
}
