//! Waitpid Worker (C9): the single dedicated thread that owns all ptrace I/O
//! for one debuggee process. Generalizes `tracer.rs`'s `Tracer::resume` /
//! `apply_new_status` state machine (one signal, one stop reason) into the
//! full non-blocking signal-dispatch table of spec §4.9, which must classify
//! every stop before deciding whether it is worth surfacing to the outer
//! protocol.

use crate::address::RelocatedAddress;
use crate::arch::{self, Arch};
use crate::callbacks::{CallbackEvent, CallbackQueue};
use crate::config::Config;
use crate::error::Error;
use crate::thread_state::{ThreadState, ThreadTable};
use log::{debug, warn};
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};

/// `si_code` values the Linux kernel hands back for `SIGTRAP`/`SIGILL`, not
/// otherwise exposed as named constants by the `libc` crate.
mod sicode {
    pub const SI_KERNEL: i32 = 0x80;
    pub const SI_USER: i32 = 0;
    pub const SI_TKILL: i32 = -6;
    pub const TRAP_BRKPT: i32 = 0x1;
    pub const TRAP_TRACE: i32 = 0x2;
}

/// Collaborators the worker calls into. Kept as a trait, and passed as a
/// `&mut dyn` parameter to [`WaitpidWorker::tick`] rather than stored, so one
/// transient implementation can borrow the façade's other registries for the
/// duration of a single tick without the worker itself owning them.
pub trait WaitpidHost {
    fn is_rendezvous_brk(&self, addr: RelocatedAddress) -> bool;
    fn on_rendezvous_hit(&mut self);
    /// Ids of every high-level native line breakpoint resolved to `addr`, or
    /// `None` if `addr` is not a tracked native breakpoint at all.
    fn native_breakpoint_ids(&self, addr: RelocatedAddress) -> Option<Vec<u32>>;
    fn managed_eval_running(&self, pid: Pid) -> bool;
    fn step_over_brk(&mut self, pid: Pid, addr: RelocatedAddress) -> Result<(), Error>;
    fn is_user_code_pc(&self, pid: Pid) -> bool;
}

/// One non-blocking iteration's worth of state; everything this worker needs
/// across ticks that is not a collaborator lent in per-call.
pub struct WaitpidWorker {
    tgid: Pid,
    arch: Arch,
    config: Config,
    activation_decay: HashMap<i32, u32>,
    /// Events produced this tick, committed to the shared queue by
    /// `parse_threads_events` under the `callbacks_mu` try-lock discipline.
    pending: VecDeque<CallbackEvent>,
}

impl WaitpidWorker {
    pub fn new(tgid: Pid, arch: Arch, config: Config) -> Self {
        Self {
            tgid,
            arch,
            config,
            activation_decay: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// One iteration of the spec §4.9 loop body: a single non-blocking
    /// `waitpid`, dispatch, and the two parse passes. Returns `false` when
    /// the worker should stop (no tracked threads, or `waitpid` failed).
    pub fn tick(
        &mut self,
        threads: &mut ThreadTable,
        callbacks: &CallbackQueue,
        host: &mut dyn WaitpidHost,
    ) -> Result<bool, Error> {
        if threads.is_empty() {
            return Ok(false);
        }

        let status = waitpid(
            Pid::from_raw(-1),
            Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
        );

        match status {
            Ok(WaitStatus::StillAlive) => {
                self.decay_pending_activation_signals();
                std::thread::sleep(std::time::Duration::from_millis(
                    self.config.activation_signal_decay_sleep_ms,
                ));
            }
            Ok(status) => self.handle_status(status, threads, host)?,
            Err(nix::errno::Errno::ECHILD) => return Ok(false),
            Err(e) => return Err(Error::Waitpid(e)),
        }

        self.parse_threads_events(callbacks);
        Ok(true)
    }

    fn decay_pending_activation_signals(&mut self) {
        self.activation_decay.retain(|_, count| {
            *count = count.saturating_sub(1);
            *count > 0
        });
    }

    fn handle_status(&mut self, status: WaitStatus, threads: &mut ThreadTable, host: &mut dyn WaitpidHost) -> Result<(), Error> {
        match status {
            WaitStatus::Exited(pid, code) => {
                threads.remove(pid);
                self.pending.push_back(CallbackEvent::ThreadExited { tid: pid });
                if pid == self.tgid {
                    return Err(Error::ProcessExit(code));
                }
                Ok(())
            }
            WaitStatus::Signaled(pid, _, _) => {
                threads.remove(pid);
                self.pending.push_back(CallbackEvent::ThreadExited { tid: pid });
                Ok(())
            }
            WaitStatus::Stopped(pid, signal) => self.handle_stopped(pid, signal, threads, host),
            WaitStatus::PtraceEvent(pid, _signal, event) => self.handle_ptrace_event(pid, event, threads),
            _ => Ok(()),
        }
    }

    fn handle_ptrace_event(&mut self, pid: Pid, event: i32, threads: &mut ThreadTable) -> Result<(), Error> {
        if event == libc::PTRACE_EVENT_EXEC {
            if pid != self.tgid {
                // the execing child detaches; only the TGID itself continues
                threads.remove(pid);
            } else {
                threads.insert(pid);
            }
        }
        Ok(())
    }

    fn handle_stopped(&mut self, pid: Pid, signal: Signal, threads: &mut ThreadTable, host: &mut dyn WaitpidHost) -> Result<(), Error> {
        let info = match ptrace::getsiginfo(pid) {
            Ok(info) => info,
            Err(nix::errno::Errno::ESRCH) => {
                threads.remove(pid);
                self.pending.push_back(CallbackEvent::ThreadExited { tid: pid });
                return Ok(());
            }
            Err(e) => return Err(Error::Ptrace(e)),
        };

        // INJECT_ACTIVATION_SIGNAL: the runtime's own rtmin signal, raised to
        // poll a suspended thread. Decays after a few consecutive hits rather
        // than being surfaced as a real stop.
        if signal == activation_signal() {
            self.activation_decay
                .insert(pid.as_raw(), self.config.activation_signal_decay);
            return Ok(());
        }

        threads.insert(pid).state = ThreadState::Stopped;
        self.dispatch_signal(pid, signal, info, threads, host)
    }

    fn dispatch_signal(
        &mut self,
        pid: Pid,
        signal: Signal,
        info: libc::siginfo_t,
        threads: &mut ThreadTable,
        host: &mut dyn WaitpidHost,
    ) -> Result<(), Error> {
        match signal {
            Signal::SIGILL => {
                if info.si_code == sicode::TRAP_TRACE {
                    self.emit_stop_event(pid, Signal::SIGILL, threads);
                } else if is_user_raised(info.si_code) && host.is_user_code_pc(pid) {
                    self.emit_stop_event(pid, Signal::SIGILL, threads);
                } else {
                    self.forward_signal(pid, signal);
                }
            }
            Signal::SIGTRAP => self.dispatch_trap(pid, signal, info, threads, host)?,
            _ => self.forward_signal(pid, signal),
        }
        Ok(())
    }

    fn dispatch_trap(
        &mut self,
        pid: Pid,
        signal: Signal,
        info: libc::siginfo_t,
        threads: &mut ThreadTable,
        host: &mut dyn WaitpidHost,
    ) -> Result<(), Error> {
        if info.si_code == sicode::TRAP_TRACE {
            // single-step completion; the caller consults the step engine.
            if let Some(rec) = threads.get_mut(pid) {
                rec.state = ThreadState::StoppedEventDetected;
            }
            return Ok(());
        }

        if info.si_code == sicode::SI_KERNEL || info.si_code == sicode::TRAP_BRKPT {
            let brk_addr = self.fixup_brk_pc(pid)?;

            let aborted_step = threads
                .get(pid)
                .and_then(|t| t.addr_step_over_breakpoint_failed)
                == Some(brk_addr);

            if aborted_step {
                host.step_over_brk(pid, brk_addr)?;
            } else if host.is_rendezvous_brk(brk_addr) {
                host.on_rendezvous_hit();
                host.step_over_brk(pid, brk_addr)?;
            } else if let Some(ids) = host.native_breakpoint_ids(brk_addr) {
                if host.managed_eval_running(pid) {
                    host.step_over_brk(pid, brk_addr)?;
                } else {
                    if let Some(rec) = threads.get_mut(pid) {
                        rec.state = ThreadState::StoppedEventDetected;
                    }
                    for bp_id in ids {
                        self.pending.push_back(CallbackEvent::Breakpoint {
                            tid: pid,
                            addr: brk_addr.as_u64(),
                            bp_id,
                        });
                    }
                }
            } else if host.is_user_code_pc(pid) {
                self.emit_stop_event(pid, signal, threads);
            }
            return Ok(());
        }

        if is_user_raised(info.si_code) {
            self.emit_stop_event(pid, signal, threads);
        }
        Ok(())
    }

    fn fixup_brk_pc(&self, pid: Pid) -> Result<RelocatedAddress, Error> {
        let pc = crate::native::regs::get_pc(pid)?;
        if arch::needs_prev_brk_pc_fixup(self.arch) {
            Ok(pc.offset(-(arch::prev_brk_pc_fixup_size(self.arch) as isize)))
        } else {
            Ok(pc)
        }
    }

    fn emit_stop_event(&mut self, pid: Pid, name: Signal, threads: &mut ThreadTable) {
        if let Some(rec) = threads.get_mut(pid) {
            rec.state = ThreadState::StoppedEventDetected;
        }
        self.pending.push_back(CallbackEvent::Signal { tid: pid, addr: 0, name });
    }

    fn forward_signal(&mut self, pid: Pid, signal: Signal) {
        debug!(target: "waitpid", "forwarding signal {signal} to {pid}");
        if ptrace::cont(pid, Some(signal)).is_err() {
            warn!(target: "waitpid", "failed to forward signal {signal} to {pid}");
        }
    }

    /// `ParseThreadsEvents`: publish accumulated stop events, honoring the
    /// `callbacks_mu` try-lock discipline of spec §4.12 — events are drained
    /// in order, and a failed `try_push` stops the drain, leaving the rest
    /// (including the one that failed) queued for the next tick.
    fn parse_threads_events(&mut self, callbacks: &CallbackQueue) {
        while let Some(event) = self.pending.pop_front() {
            if !callbacks.try_push(event.clone()) {
                self.pending.push_front(event);
                break;
            }
        }
    }
}

fn is_user_raised(si_code: i32) -> bool {
    si_code == sicode::SI_USER || si_code == sicode::SI_TKILL
}

/// The runtime's activation signal is `SIGRTMIN`, computed at runtime since
/// `libc::SIGRTMIN()` is a function on Linux (the POSIX range is dynamic).
fn activation_signal() -> Signal {
    Signal::try_from(unsafe { libc::SIGRTMIN() }).unwrap_or(Signal::SIGUSR1)
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeHost {
        rendezvous_addr: Option<RelocatedAddress>,
        native_brk: HashMap<u64, Vec<u32>>,
    }

    impl WaitpidHost for FakeHost {
        fn is_rendezvous_brk(&self, addr: RelocatedAddress) -> bool {
            self.rendezvous_addr == Some(addr)
        }
        fn on_rendezvous_hit(&mut self) {}
        fn native_breakpoint_ids(&self, addr: RelocatedAddress) -> Option<Vec<u32>> {
            self.native_brk.get(&addr.as_u64()).cloned()
        }
        fn managed_eval_running(&self, _pid: Pid) -> bool {
            false
        }
        fn step_over_brk(&mut self, _pid: Pid, _addr: RelocatedAddress) -> Result<(), Error> {
            Ok(())
        }
        fn is_user_code_pc(&self, _pid: Pid) -> bool {
            true
        }
    }

    fn worker() -> WaitpidWorker {
        WaitpidWorker::new(Pid::from_raw(100), Arch::X86_64, Config::default())
    }

    fn fake_host() -> FakeHost {
        FakeHost {
            rendezvous_addr: None,
            native_brk: HashMap::new(),
        }
    }

    #[test]
    fn test_activation_signal_decay_expires() {
        let mut w = worker();
        w.activation_decay.insert(5, 2);
        w.decay_pending_activation_signals();
        assert_eq!(w.activation_decay.get(&5), Some(&1));
        w.decay_pending_activation_signals();
        assert!(w.activation_decay.get(&5).is_none());
    }

    #[test]
    fn test_tick_stops_when_no_threads() {
        let mut w = worker();
        let mut threads = ThreadTable::new();
        let callbacks = CallbackQueue::new();
        let mut host = fake_host();
        assert_eq!(w.tick(&mut threads, &callbacks, &mut host).unwrap(), false);
    }

    #[test]
    fn test_breakpoint_shared_by_two_ids_queues_one_event_each() {
        // Exercises the `native_breakpoint_ids` fan-out in isolation, since
        // driving `dispatch_trap` itself requires a live tracee (it reads
        // registers via `fixup_brk_pc`).
        let mut w = worker();
        let pid = Pid::from_raw(1);
        let mut host = fake_host();
        host.native_brk.insert(0x4000, vec![7, 8]);

        if let Some(ids) = host.native_breakpoint_ids(RelocatedAddress::from(0x4000u64)) {
            for id in ids {
                w.pending.push_back(CallbackEvent::Breakpoint { tid: pid, addr: 0x4000, bp_id: id });
            }
        }
        assert_eq!(w.pending.len(), 2);
    }

    #[test]
    fn test_parse_threads_events_requeues_on_failed_try_push() {
        let mut w = worker();
        let callbacks = CallbackQueue::new();
        let pid = Pid::from_raw(9);
        w.pending.push_back(CallbackEvent::ThreadStarted { tid: pid });

        // Hold the lock to force try_push to fail, as the drain-worker would
        // while mid-drain.
        let guard = callbacks.lock_for_test();
        w.parse_threads_events(&callbacks);
        assert_eq!(w.pending.len(), 1);
        drop(guard);

        w.parse_threads_events(&callbacks);
        assert!(w.pending.is_empty());
        assert_eq!(callbacks.len(), 1);
    }
}
