//! Exclusive-mode run gate.
//!
//! The gate records which session currently holds the execution slot. It is
//! owned by [`crate::state::AppState`] and mutated only through the methods
//! below; every effective transition is reported to an optional listener
//! while the gate lock is held, so listeners observe transitions in the same
//! order they were applied.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateTransition {
    Started(String),
    Ended(String),
}

/// A transition together with the gate state right after it.
#[derive(Debug, Clone)]
pub struct GateEvent {
    pub transition: GateTransition,
    pub is_exclusive: bool,
    pub running_session_id: Option<String>,
    /// Epoch milliseconds, strictly increasing across events of one gate.
    pub timestamp: u64,
}

impl GateEvent {
    pub fn can_accept_new_request(&self) -> bool {
        !self.is_exclusive || self.running_session_id.is_none()
    }
}

/// Receives gate transitions. Called with the gate lock held, so
/// implementations must not call back into the gate.
pub trait GateListener: Send + Sync {
    fn on_transition(&self, event: &GateEvent);
}

#[derive(Debug, Default)]
struct GateInner {
    running_session_id: Option<String>,
    last_timestamp: u64,
}

pub struct ExclusivityGate {
    exclusive: bool,
    inner: Mutex<GateInner>,
    listener: Option<Arc<dyn GateListener>>,
}

impl ExclusivityGate {
    pub fn new(exclusive: bool) -> Self {
        Self {
            exclusive,
            inner: Mutex::new(GateInner::default()),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn GateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn can_accept_new_request(&self) -> bool {
        !self.exclusive || self.lock().running_session_id.is_none()
    }

    pub fn running_session_id(&self) -> Option<String> {
        self.lock().running_session_id.clone()
    }

    /// Records `id` as the running session. No-op outside exclusive mode.
    pub fn set_running_session(&self, id: &str) {
        if !self.exclusive {
            return;
        }
        let mut inner = self.lock();
        inner.running_session_id = Some(id.to_string());
        self.emit(&mut inner, GateTransition::Started(id.to_string()));
    }

    /// Atomically claims the slot for `id` if it is free (or already held by
    /// `id`). On refusal returns the id of the session holding the slot.
    ///
    /// Outside exclusive mode this always succeeds and leaves the slot empty.
    pub fn try_set_running_session(&self, id: &str) -> Result<(), String> {
        if !self.exclusive {
            return Ok(());
        }
        let mut inner = self.lock();
        match inner.running_session_id.as_deref() {
            Some(current) if current != id => return Err(current.to_string()),
            Some(_) => return Ok(()),
            None => {}
        }
        inner.running_session_id = Some(id.to_string());
        self.emit(&mut inner, GateTransition::Started(id.to_string()));
        Ok(())
    }

    /// Frees the slot only when it is held by `id`. Returns whether the
    /// clear took effect; a stale clear from another session is ignored.
    pub fn clear_running_session(&self, id: &str) -> bool {
        let mut inner = self.lock();
        if inner.running_session_id.as_deref() != Some(id) {
            debug!(session_id = %id, "ignoring clear for session not holding the run slot");
            return false;
        }
        inner.running_session_id = None;
        self.emit(&mut inner, GateTransition::Ended(id.to_string()));
        true
    }

    fn emit(&self, inner: &mut GateInner, transition: GateTransition) {
        let timestamp = now_millis().max(inner.last_timestamp + 1);
        inner.last_timestamp = timestamp;

        let Some(listener) = &self.listener else {
            return;
        };
        listener.on_transition(&GateEvent {
            transition,
            is_exclusive: self.exclusive,
            running_session_id: inner.running_session_id.clone(),
            timestamp,
        });
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<GateEvent>>,
    }

    impl GateListener for Recorder {
        fn on_transition(&self, event: &GateEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn recorded_gate(exclusive: bool) -> (ExclusivityGate, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let gate = ExclusivityGate::new(exclusive).with_listener(recorder.clone());
        (gate, recorder)
    }

    #[test]
    fn exclusive_gate_blocks_while_running() {
        let gate = ExclusivityGate::new(true);
        assert!(gate.is_exclusive());
        assert!(gate.can_accept_new_request());

        gate.set_running_session("S1");
        assert_eq!(gate.running_session_id().as_deref(), Some("S1"));
        assert!(!gate.can_accept_new_request());

        assert!(gate.clear_running_session("S1"));
        assert_eq!(gate.running_session_id(), None);
        assert!(gate.can_accept_new_request());
    }

    #[test]
    fn stale_clear_does_not_free_another_sessions_slot() {
        let gate = ExclusivityGate::new(true);
        gate.set_running_session("original");

        assert!(!gate.clear_running_session("other"));
        assert_eq!(gate.running_session_id().as_deref(), Some("original"));
        assert!(!gate.can_accept_new_request());

        assert!(gate.clear_running_session("original"));
        assert!(gate.can_accept_new_request());
    }

    #[test]
    fn non_exclusive_gate_never_records_a_session() {
        let (gate, recorder) = recorded_gate(false);
        gate.set_running_session("S1");
        assert_eq!(gate.running_session_id(), None);
        assert!(gate.can_accept_new_request());
        assert!(gate.try_set_running_session("S2").is_ok());
        assert_eq!(gate.running_session_id(), None);
        assert!(!gate.clear_running_session("S1"));
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn double_clear_equals_single_clear() {
        let (gate, recorder) = recorded_gate(true);
        gate.set_running_session("S1");
        assert!(gate.clear_running_session("S1"));
        assert!(!gate.clear_running_session("S1"));
        assert_eq!(gate.running_session_id(), None);

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].transition, GateTransition::Ended("S1".into()));
    }

    #[test]
    fn try_set_refuses_a_second_session() {
        let gate = ExclusivityGate::new(true);
        assert!(gate.try_set_running_session("S1").is_ok());
        assert_eq!(gate.try_set_running_session("S2"), Err("S1".to_string()));
        assert!(gate.try_set_running_session("S1").is_ok());
        assert_eq!(gate.running_session_id().as_deref(), Some("S1"));
    }

    #[test]
    fn transitions_carry_increasing_timestamps() {
        let (gate, recorder) = recorded_gate(true);
        for id in ["a", "b", "c"] {
            gate.set_running_session(id);
            gate.clear_running_session(id);
        }

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 6);
        for pair in events.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
        assert_eq!(events[0].running_session_id.as_deref(), Some("a"));
        assert!(!events[0].can_accept_new_request());
        assert_eq!(events[1].running_session_id, None);
        assert!(events[1].can_accept_new_request());
    }

    #[test]
    fn arbitrary_sequences_keep_at_most_one_runner() {
        let gate = ExclusivityGate::new(true);
        let ids = ["s0", "s1", "s2", "s3"];
        // Deterministic pseudo-random walk over set/clear calls.
        let mut seed: u32 = 17;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let id = ids[(seed >> 16) as usize % ids.len()];
            let before = gate.running_session_id();
            if seed & 1 == 0 {
                gate.set_running_session(id);
                assert_eq!(gate.running_session_id().as_deref(), Some(id));
            } else {
                let cleared = gate.clear_running_session(id);
                assert_eq!(cleared, before.as_deref() == Some(id));
                if !cleared {
                    assert_eq!(gate.running_session_id(), before);
                }
            }
            let running = gate.running_session_id();
            assert_eq!(gate.can_accept_new_request(), running.is_none());
        }
    }
}
