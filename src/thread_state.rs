use crate::address::RelocatedAddress;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;

/// Per-OS-thread state machine, as tracked by the waitpid worker (C9) and
/// consulted by the callbacks queue (C12) and the façade's
/// `stop_all_native_threads`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Running,
    Stopped,
    StoppedEventDetected,
    StoppedEventInProgress,
    StoppedOnEventAsNativeThread,
    StoppedAtBreakpointPendingStepOver,
}

/// Bookkeeping kept per tracked OS thread in addition to its coarse state.
#[derive(Clone, Debug)]
pub struct ThreadRecord {
    pub pid: Pid,
    pub state: ThreadState,
    pub stop_signal: Option<Signal>,
    pub ptrace_event: Option<i32>,
    /// Set when a signal aborted a previous step-over of this address; the
    /// worker must finish the step-over before delivering a fresh stop.
    pub addr_step_over_breakpoint_failed: Option<RelocatedAddress>,
}

impl ThreadRecord {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: ThreadState::Stopped,
            stop_signal: None,
            ptrace_event: None,
            addr_step_over_breakpoint_failed: None,
        }
    }
}

/// The full per-process set of tracked OS threads. A thin, explicit registry
/// rather than a bag of free globals, per the design note that file-scope
/// mutables are modeled as fields of a single owning instance.
#[derive(Default)]
pub struct ThreadTable {
    threads: HashMap<Pid, ThreadRecord>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: Pid) -> &mut ThreadRecord {
        self.threads.entry(pid).or_insert_with(|| ThreadRecord::new(pid))
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ThreadRecord> {
        self.threads.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&ThreadRecord> {
        self.threads.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ThreadRecord> {
        self.threads.get_mut(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.threads.keys().copied()
    }

    pub fn snapshot(&self) -> Vec<ThreadRecord> {
        self.threads.values().cloned().collect()
    }

    /// Invariant check (spec §8 invariant 3): a `Running` thread must never
    /// be present in a caller-supplied `changed` set.
    pub fn assert_running_not_changed(&self, changed: &[Pid]) -> bool {
        changed.iter().all(|pid| {
            !matches!(
                self.threads.get(pid).map(|t| t.state),
                Some(ThreadState::Running)
            )
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut table = ThreadTable::new();
        let pid = Pid::from_raw(123);
        table.insert(pid);
        assert!(table.get(pid).is_some());
        assert_eq!(table.get(pid).unwrap().state, ThreadState::Stopped);
        table.remove(pid);
        assert!(table.get(pid).is_none());
    }

    #[test]
    fn test_running_invariant() {
        let mut table = ThreadTable::new();
        let pid = Pid::from_raw(7);
        table.insert(pid).state = ThreadState::Running;
        assert!(table.assert_running_not_changed(&[]));
        assert!(!table.assert_running_not_changed(&[pid]));
    }
}
