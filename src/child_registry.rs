//! Child registry: admission, lookup, and removal of the tracees a
//! session currently controls. Kept as its own type so the event loop
//! core doesn't own tracee bookkeeping directly.

use crate::tracee::Tracee;
use nix::unistd::Pid;
use std::collections::HashMap;

/// Owns every tracee currently under control, keyed by pid.
#[derive(Default)]
pub struct ChildRegistry {
    tracees: HashMap<Pid, Tracee>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        ChildRegistry {
            tracees: HashMap::new(),
        }
    }

    /// Admits a new tracee. A pid may be admitted at most once until it
    /// is forgotten. Returns `false`, leaving the existing entry
    /// untouched, if `pid` is already registered.
    pub fn admit(&mut self, tracee: Tracee) -> bool {
        if self.tracees.contains_key(&tracee.pid) {
            return false;
        }
        self.tracees.insert(tracee.pid, tracee);
        true
    }

    /// Removes and returns a tracee, e.g. after it has exited or been
    /// killed. `None` if `pid` was never admitted or was already forgotten.
    pub fn forget(&mut self, pid: Pid) -> Option<Tracee> {
        self.tracees.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Tracee> {
        self.tracees.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.tracees.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.tracees.contains_key(&pid)
    }

    pub fn count(&self) -> usize {
        self.tracees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracees.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = &Pid> {
        self.tracees.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Pid, &Tracee)> {
        self.tracees.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Pid, &mut Tracee)> {
        self.tracees.iter_mut()
    }

    /// The first admitted tracee still on record, in arbitrary order;
    /// used as the initial tracee after a fork-and-exec launch.
    pub fn first(&self) -> Option<&Tracee> {
        self.tracees.values().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_rejects_duplicate_pid() {
        let mut registry = ChildRegistry::new();
        assert!(registry.admit(Tracee::new(Pid::from_raw(1), false)));
        assert!(!registry.admit(Tracee::new(Pid::from_raw(1), false)));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn forget_removes_and_returns() {
        let mut registry = ChildRegistry::new();
        registry.admit(Tracee::new(Pid::from_raw(7), false));
        let tracee = registry.forget(Pid::from_raw(7));
        assert!(tracee.is_some());
        assert!(!registry.contains(Pid::from_raw(7)));
        assert!(registry.forget(Pid::from_raw(7)).is_none());
    }

    #[test]
    fn count_and_is_empty_track_admissions() {
        let mut registry = ChildRegistry::new();
        assert!(registry.is_empty());
        registry.admit(Tracee::new(Pid::from_raw(1), false));
        registry.admit(Tracee::new(Pid::from_raw(2), false));
        assert_eq!(registry.count(), 2);
        assert!(!registry.is_empty());
    }
}
