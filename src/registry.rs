use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::GradeId;

#[derive(Debug, Default)]
struct RegistryState {
    active: HashSet<GradeId>,
    suspended: bool,
}

/// Thread-safe record of which grades currently have a live search, plus a
/// global suspend flag. Every optimizer run polls this through a predicate
/// bound to its grade; a run must keep going only while the grade is active
/// and the registry is not suspended.
///
/// Cloning shares the underlying state, so the scheduler and the trigger
/// surface can hold handles to the same registry. Tests construct their own
/// isolated instances.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, grade: GradeId) {
        self.lock().active.insert(grade);
    }

    /// Idempotent; safe to call for a grade that was never begun.
    pub fn end(&self, grade: GradeId) {
        self.lock().active.remove(&grade);
    }

    pub fn is_active(&self, grade: GradeId) -> bool {
        self.lock().active.contains(&grade)
    }

    /// Sets the global suspend flag and clears every active grade, so all
    /// in-flight runs observe a stop signal.
    pub fn suspend_all(&self) {
        let mut state = self.lock();
        state.active.clear();
        state.suspended = true;
    }

    pub fn resume(&self) {
        self.lock().suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// The cancellation predicate for one grade's run.
    pub fn should_stop(&self, grade: GradeId) -> bool {
        let state = self.lock();
        state.suspended || !state.active.contains(&grade)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panicked worker must not wedge cancellation for everyone else.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_end_cycle() {
        let registry = CancellationRegistry::new();
        assert!(!registry.is_active(1));
        assert!(registry.should_stop(1));

        registry.begin(1);
        assert!(registry.is_active(1));
        assert!(!registry.should_stop(1));
        assert!(registry.should_stop(2));

        registry.end(1);
        assert!(!registry.is_active(1));
        assert!(registry.should_stop(1));
    }

    #[test]
    fn test_end_is_idempotent() {
        let registry = CancellationRegistry::new();
        registry.end(7);
        registry.begin(7);
        registry.end(7);
        registry.end(7);
        assert!(!registry.is_active(7));
    }

    #[test]
    fn test_suspend_clears_active_grades() {
        let registry = CancellationRegistry::new();
        registry.begin(1);
        registry.begin(2);

        registry.suspend_all();
        assert!(registry.is_suspended());
        assert!(!registry.is_active(1));
        assert!(!registry.is_active(2));
        assert!(registry.should_stop(1));

        registry.resume();
        assert!(!registry.is_suspended());
        // Suspension cleared the active set; grades stay cancelled until
        // a new run registers them.
        assert!(registry.should_stop(1));
        registry.begin(1);
        assert!(!registry.should_stop(1));
    }

    #[test]
    fn test_suspend_overrides_active_grade() {
        let registry = CancellationRegistry::new();
        registry.begin(3);
        registry.suspend_all();
        registry.begin(3);
        // Still suspended, so the predicate says stop even for a re-begun grade.
        assert!(registry.should_stop(3));
        registry.resume();
        assert!(!registry.should_stop(3));
    }

    #[test]
    fn test_clones_share_state() {
        let registry = CancellationRegistry::new();
        let other = registry.clone();
        registry.begin(5);
        assert!(other.is_active(5));
        other.end(5);
        assert!(!registry.is_active(5));
    }
}
