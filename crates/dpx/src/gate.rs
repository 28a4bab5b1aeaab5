//! 🚧 The Busy Gate: one job at a time, no exceptions, no VIP list.
//!
//! A bool behind a mutex. Test-and-set to get in, a [`GatePass`] to prove you're in,
//! and the pass's `Drop` lets the next one through, whether the job finished, failed,
//! or panicked halfway through a bulk request.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

/// 🚧 Shared token guarding ingestion and deletion jobs. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct BusyGate {
    busy: Arc<Mutex<bool>>,
    poll_interval: Duration,
}

/// 🎫 Proof of holding the gate. Dropping it releases the gate.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the pass is dropped"]
pub struct GatePass {
    busy: Arc<Mutex<bool>>,
}

// 🧯 a panic while holding the flag lock leaves a plain bool behind, still perfectly usable
fn lock_flag(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BusyGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            busy: Arc::new(Mutex::new(false)),
            poll_interval,
        }
    }

    /// 🎯 Test-and-set. `None` if somebody else is in.
    pub fn try_acquire(&self) -> Option<GatePass> {
        let mut busy = lock_flag(&self.busy);
        if *busy {
            return None;
        }
        *busy = true;
        Some(GatePass {
            busy: Arc::clone(&self.busy),
        })
    }

    /// ⏳ Poll until the gate is free, then take it. No timeout: a waiting job waits.
    pub async fn acquire(&self) -> GatePass {
        loop {
            if let Some(pass) = self.try_acquire() {
                return pass;
            }
            trace!("🚧 gate busy, waiting {:?}", self.poll_interval);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn is_busy(&self) -> bool {
        *lock_flag(&self.busy)
    }
}

impl Drop for GatePass {
    fn drop(&mut self) {
        *lock_flag(&self.busy) = false;
    }
}
