//! Callbacks Queue (C12): a single FIFO feeding the outer protocol, filled by
//! managed-runtime callbacks and by the waitpid worker's `ParseThreadsEvents`
//! step. No direct analog in a debugger that drives its own CLI loop
//! directly; patterned on `tracer.rs`'s single-`Mutex`-guarded-state style
//! and the `try_lock`-and-requeue discipline it uses around
//! `group_stop_guard`, applied here to the lock-ordering rule in spec §4.12:
//! `callbacks_mu` is acquired before `waitpid_mu`, never the reverse.

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum CallbackEvent {
    Breakpoint { tid: Pid, addr: u64, bp_id: u32 },
    Step { tid: Pid },
    Signal { tid: Pid, addr: u64, name: Signal },
    Exception { tid: Pid, description: String },
    ModuleLoad { name: String },
    ModuleUnload { name: String },
    ThreadStarted { tid: Pid },
    ThreadExited { tid: Pid },
}

/// The FIFO itself. `callbacks_mu` in the design's lock lattice maps to the
/// inner `Mutex`; callers must never acquire `waitpid_mu` while holding it.
#[derive(Default)]
pub struct CallbackQueue {
    queue: Mutex<VecDeque<CallbackEvent>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: CallbackEvent) {
        self.queue.lock().unwrap().push_back(event);
    }

    pub fn pop(&self) -> Option<CallbackEvent> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Used by C9's `ParseThreadsEvents`: a failed `try_lock` means the
    /// callback worker is mid-drain, so the caller re-queues its work for the
    /// next waitpid-loop iteration rather than blocking.
    pub fn try_push(&self, event: CallbackEvent) -> bool {
        match self.queue.try_lock() {
            Ok(mut guard) => {
                guard.push_back(event);
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&self) -> std::sync::MutexGuard<'_, VecDeque<CallbackEvent>> {
        self.queue.lock().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = CallbackQueue::new();
        q.push(CallbackEvent::ThreadStarted { tid: Pid::from_raw(1) });
        q.push(CallbackEvent::ThreadExited { tid: Pid::from_raw(1) });
        assert!(matches!(q.pop(), Some(CallbackEvent::ThreadStarted { .. })));
        assert!(matches!(q.pop(), Some(CallbackEvent::ThreadExited { .. })));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_try_push_succeeds_when_unlocked() {
        let q = CallbackQueue::new();
        assert!(q.try_push(CallbackEvent::ThreadStarted { tid: Pid::from_raw(2) }));
        assert_eq!(q.len(), 1);
    }
}
