//! Execution-scoped memory accounting.

use std::sync::atomic::{AtomicUsize, Ordering};

use common_error::{RivuletError, RivuletResult};

/// Tracks the live bytes of one query and enforces its memory limit.
///
/// Builder caches allocate through this so per-query limits hold across all
/// transformations of a plan. Accounting only; there is no spill-to-disk.
#[derive(Debug)]
pub struct Allocator {
    used: AtomicUsize,
    limit: usize,
}

impl Allocator {
    /// Create an allocator with a limit in bytes. Zero means unlimited.
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    /// Create an accounting-only allocator.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Account for an allocation. Fails when the limit would be exceeded.
    pub fn account(&self, bytes: usize) -> RivuletResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let new = current.saturating_add(bytes);
            if self.limit > 0 && new > self.limit {
                return Err(RivuletError::resource_exhausted(format!(
                    "memory limit exceeded: {current} + {bytes} > {} bytes",
                    self.limit
                )));
            }
            match self
                .used
                .compare_exchange_weak(current, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Release previously accounted bytes.
    pub fn free(&self, bytes: usize) {
        if bytes > 0 {
            self.used.fetch_sub(bytes.min(self.used()), Ordering::SeqCst);
        }
    }

    /// Current live bytes.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// The limit in bytes. Zero means unlimited.
    pub const fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounting() {
        let alloc = Allocator::unlimited();
        alloc.account(100).unwrap();
        alloc.account(50).unwrap();
        assert_eq!(alloc.used(), 150);
        alloc.free(50);
        assert_eq!(alloc.used(), 100);
    }

    #[test]
    fn test_limit_enforced() {
        let alloc = Allocator::new(128);
        alloc.account(100).unwrap();
        let err = alloc.account(100).unwrap_err();
        assert!(matches!(err, RivuletError::ResourceExhausted(_)));
        // Failed accounting does not change usage.
        assert_eq!(alloc.used(), 100);
    }
}
