//! Cooperative cancellation tokens.
//!
//! Every blocking operation in the reasoning loop (LLM calls, tool calls,
//! backoff sleeps) receives a `CancelToken` and polls it at suspension
//! points. Cancellation is one-shot: once set it stays set for the life of
//! the token, and the first recorded reason wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation token that can be checked at every suspension point.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Signal cancellation. Idempotent; the first reason is retained.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut guard = self.reason.lock();
            if guard.is_none() {
                *guard = Some(reason.into());
            }
        }
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The reason recorded by the first `cancel` call, if any.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
