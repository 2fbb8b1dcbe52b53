//! Execution counters and admission control.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::result::ExecutionState;

/// Point-in-time view of the sandbox counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SandboxStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub killed: u64,
    /// Executions running right now
    pub concurrent: u32,
    /// Highest concurrency observed
    pub max_concurrent: u32,
}

/// Lock-free terminal-state counters.
#[derive(Debug, Default)]
pub struct StatsCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    killed: AtomicU64,
}

impl StatsCounters {
    /// Counts one terminal execution. Call exactly once per execution.
    pub fn record(&self, state: ExecutionState) {
        let counter = match state {
            ExecutionState::Completed => &self.succeeded,
            ExecutionState::Timeout => &self.timed_out,
            ExecutionState::Killed => &self.killed,
            // Non-terminal states never reach here; count them as failures
            // so the totals still add up.
            ExecutionState::Failed | ExecutionState::Pending | ExecutionState::Running => {
                &self.failed
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, gate: &AdmissionGate) -> SandboxStats {
        SandboxStats {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
            concurrent: gate.active(),
            max_concurrent: gate.max_observed(),
        }
    }
}

#[derive(Debug)]
struct GateState {
    active: AtomicU32,
    max_observed: AtomicU32,
    limit: u32,
}

/// Hard ceiling on concurrent executions. Never queues.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    state: Arc<GateState>,
}

impl AdmissionGate {
    pub fn new(limit: u32) -> Self {
        Self {
            state: Arc::new(GateState {
                active: AtomicU32::new(0),
                max_observed: AtomicU32::new(0),
                limit,
            }),
        }
    }

    /// Takes a slot, or `None` when the ceiling is reached. The live count
    /// never exceeds the limit, even transiently.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        let state = &self.state;
        let mut current = state.active.load(Ordering::Acquire);
        loop {
            if current >= state.limit {
                return None;
            }
            match state.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    state.max_observed.fetch_max(current + 1, Ordering::AcqRel);
                    return Some(AdmissionPermit {
                        state: Arc::clone(&self.state),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active(&self) -> u32 {
        self.state.active.load(Ordering::Acquire)
    }

    pub fn max_observed(&self) -> u32 {
        self.state.max_observed.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u32 {
        self.state.limit
    }
}

/// A held execution slot, released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    state: Arc<GateState>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
    }
}
