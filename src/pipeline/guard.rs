// src/pipeline/guard.rs

//! Single-flight guard for externally triggered operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{AppError, Result};

/// Rejects a second invocation while one is in flight.
///
/// Clones share the same flag, so a guard stored in a cloned component
/// still guards the one operation.
#[derive(Debug, Clone)]
pub struct RunGuard {
    name: &'static str,
    running: Arc<AtomicBool>,
}

/// Held for the duration of an operation; releases the guard on drop.
#[derive(Debug)]
pub struct RunLease {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the lease, or fail with `AlreadyRunning`.
    pub fn try_acquire(&self) -> Result<RunLease> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AppError::AlreadyRunning(self.name))?;
        Ok(RunLease {
            running: Arc::clone(&self.running),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
