/// Bounded, FIFO admission for server-side requests
///
/// Every request takes a ticket. A ticket is served only when it is the
/// oldest waiting one and a slot is free, so requests start in arrival order.
use crate::config::loader::AdmissionPolicy;
use crate::config::types::{CodeboxError, Result};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    next_ticket: u64,
    now_serving: u64,
}

/// Concurrency ceiling shared by all callers of a coordinator
#[derive(Debug)]
pub struct AdmissionGate {
    limit: usize,
    policy: AdmissionPolicy,
    state: Mutex<GateState>,
    freed: Condvar,
}

/// A held execution slot; released on drop
#[derive(Debug)]
pub struct Permit<'a> {
    gate: &'a AdmissionGate,
}

impl AdmissionGate {
    pub fn new(limit: usize, policy: AdmissionPolicy) -> Self {
        Self {
            limit: limit.max(1),
            policy,
            state: Mutex::new(GateState::default()),
            freed: Condvar::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Requests currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Take a slot, waiting in line under `Queue` or failing fast under
    /// `Reject`.
    pub fn admit(&self) -> Result<Permit<'_>> {
        let mut state = self.lock();

        if self.policy == AdmissionPolicy::Reject {
            let queued = state.next_ticket != state.now_serving;
            if queued || state.in_flight >= self.limit {
                return Err(CodeboxError::Capacity(state.in_flight));
            }
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while ticket != state.now_serving || state.in_flight >= self.limit {
            state = self
                .freed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.now_serving += 1;
        state.in_flight += 1;
        drop(state);

        // The next ticket may also fit.
        self.freed.notify_all();
        Ok(Permit { gate: self })
    }

    fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.freed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
