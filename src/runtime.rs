//! Process-wide library lifecycle
//!
//! `initialize()` may be called any number of times before `shutdown()`;
//! repeated calls are no-ops. After `shutdown()` the library cannot be
//! re-initialized and session opens fail with [`Dnp3Error::Lifecycle`].

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Dnp3Error, Dnp3Result};

const UNINITIALIZED: u8 = 0;
const ACTIVE: u8 = 1;
const TORN_DOWN: u8 = 2;

/// Lifecycle state cell
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
        }
    }

    /// Returns `Ok(true)` on the first successful call, `Ok(false)` afterwards.
    pub fn initialize(&self) -> Dnp3Result<bool> {
        match self
            .state
            .compare_exchange(UNINITIALIZED, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(true),
            Err(ACTIVE) => Ok(false),
            Err(_) => Err(Dnp3Error::lifecycle(
                "initialize() called after shutdown()",
            )),
        }
    }

    pub fn shutdown(&self) {
        self.state.store(TORN_DOWN, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Initialize lazily, failing only after teardown.
    pub fn ensure_active(&self) -> Dnp3Result<()> {
        self.initialize().map(|_| ())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

static LIFECYCLE: Lifecycle = Lifecycle::new();

/// Initialize the library for this process.
///
/// Safe to call repeatedly; fails once [`shutdown`] has run.
pub fn initialize() -> Dnp3Result<()> {
    if LIFECYCLE.initialize()? {
        tracing::debug!("voltage_dnp3 v{} initialized", crate::VERSION);
    }
    Ok(())
}

/// Tear the library down. Sessions opened afterwards fail.
pub fn shutdown() {
    LIFECYCLE.shutdown();
}

pub fn is_initialized() -> bool {
    LIFECYCLE.is_active()
}

pub(crate) fn ensure_active() -> Dnp3Result<()> {
    LIFECYCLE.ensure_active()
}
