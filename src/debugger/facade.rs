use crate::address::RelocatedAddress;
use crate::arch::Arch;
use crate::breakpoints::managed_func::{self, ManagedFuncBreakpoints};
use crate::breakpoints::managed_line::{self, ManagedLineBreakpoints, RuntimeBreakpointApi};
use crate::breakpoints::native_line::{self, AddressResolver, NativeLineBreakpoints};
use crate::breakpoints::EntryBreakpoint;
use crate::callbacks::CallbackQueue;
use crate::config::Config;
use crate::error::Error;
use crate::native::library_index::Library;
use crate::native::mem_breakpoints::MemBreakpoints;
use crate::native::rendezvous::Rendezvous;
use crate::native::singlestep::{RegisterSnapshot, SingleStepEngine};
use crate::native::waitpid_worker::{WaitpidHost, WaitpidWorker};
use crate::symbols::{SymbolIndex, SymbolReader};
use crate::thread_state::{ThreadState, ThreadTable};
use crate::unwind::{self, ManagedStackWalker, NativeUnwinder};
use crate::{print_warns, weak_error};
use indexmap::IndexMap;
use log::info;
use nix::sys::ptrace;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StepKind {
    In,
    Over,
    Out,
}

/// The managed debugging API's stepper surface (spec §6: "steppers with
/// range-and-intercept-mask"), plus whatever native single-step driving the
/// concrete implementation needs when the thread is not in managed code —
/// both are external collaborators, modeled only by call shape.
pub trait Stepper {
    fn step(&self, thread: Pid, kind: StepKind) -> Result<(), Error>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NativeThreadClassification {
    BelongsToStopEvent,
    UserVisible,
}

#[derive(Debug, Default)]
pub struct StopAllResult {
    pub interrupted: Vec<Pid>,
    pub belongs_to_event: Vec<Pid>,
    pub user_visible: Vec<Pid>,
}

/// Aggregate owning every per-process registry this crate builds: the
/// symbol/module index (C1), the native library index (C2), the memory
/// breakpoint table (C3), the rendezvous tracker (C4), the three breakpoint
/// managers (C5-C8), the thread table, and the callback queue (C12). Mirrors
/// `debugger/mod.rs`'s `Debugger` in shape, not in the registries it owns.
pub struct Debugger {
    config: Config,
    arch: Arch,
    pid: Option<Pid>,
    symbol_index: SymbolIndex,
    libraries: IndexMap<String, Library>,
    mem_breakpoints: Option<MemBreakpoints>,
    native_line_bps: NativeLineBreakpoints,
    managed_line_bps: ManagedLineBreakpoints,
    managed_func_bps: ManagedFuncBreakpoints,
    entry_bp: Option<EntryBreakpoint>,
    rendezvous: Option<Rendezvous>,
    threads: ThreadTable,
    callbacks: CallbackQueue,
    singlestep: SingleStepEngine,
    /// Owns ptrace I/O for this process once [`Self::init`] has run (C9).
    /// `None` only before `init` or after `shutdown`.
    waitpid: Option<WaitpidWorker>,
    /// Threads the managed runtime has reported as mid-`FuncEval`; while a
    /// thread is in this set, the waitpid worker silently steps it over any
    /// native breakpoint it stops on instead of surfacing a stop event
    /// (spec §4.9). Set by the outer protocol via
    /// [`Self::begin_managed_eval`]/[`Self::end_managed_eval`].
    managed_eval_threads: HashSet<Pid>,
}

impl Debugger {
    pub fn new(config: Config, arch: Arch) -> Self {
        Self {
            singlestep: SingleStepEngine::new(arch),
            config,
            arch,
            pid: None,
            symbol_index: SymbolIndex::new(),
            libraries: IndexMap::new(),
            mem_breakpoints: None,
            native_line_bps: NativeLineBreakpoints::new(),
            managed_line_bps: ManagedLineBreakpoints::new(),
            managed_func_bps: ManagedFuncBreakpoints::new(),
            entry_bp: None,
            rendezvous: None,
            threads: ThreadTable::new(),
            callbacks: CallbackQueue::new(),
            waitpid: None,
            managed_eval_threads: HashSet::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn symbol_index(&self) -> &SymbolIndex {
        &self.symbol_index
    }

    pub fn symbol_index_mut(&mut self) -> &mut SymbolIndex {
        &mut self.symbol_index
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn callbacks(&self) -> &CallbackQueue {
        &self.callbacks
    }

    pub fn native_line_breakpoints(&self) -> &NativeLineBreakpoints {
        &self.native_line_bps
    }

    pub fn managed_line_breakpoints(&self) -> &ManagedLineBreakpoints {
        &self.managed_line_bps
    }

    pub fn managed_func_breakpoints(&self) -> &ManagedFuncBreakpoints {
        &self.managed_func_bps
    }

    pub fn entry_breakpoint(&self) -> Option<&EntryBreakpoint> {
        self.entry_bp.as_ref()
    }

    /// Seizes the new debuggee's main thread and readies the registries this
    /// process's registries depend on. The managed runtime's own attach
    /// (process enumerate/attach, spec §6) is a separate external call the
    /// caller makes before or after this, depending on launch-vs-attach mode.
    pub fn init(&mut self, pid: Pid) -> Result<(), Error> {
        if self.pid.is_some() {
            return Err(Error::AlreadyRun);
        }
        info!(target: "debugger", "attaching to pid {pid}, arch={}", self.arch);
        self.pid = Some(pid);
        self.mem_breakpoints = Some(MemBreakpoints::new(pid, self.arch));
        self.waitpid = Some(WaitpidWorker::new(pid, self.arch, self.config.clone()));
        self.threads.insert(pid);
        Ok(())
    }

    /// Marks `thread` as running a managed-side `FuncEval`, so the waitpid
    /// worker steps it silently over any native breakpoint it hits (spec
    /// §4.9) instead of surfacing a stop. The outer protocol calls this
    /// around its own calls into the managed evaluator.
    pub fn begin_managed_eval(&mut self, thread: Pid) {
        self.managed_eval_threads.insert(thread);
    }

    pub fn end_managed_eval(&mut self, thread: Pid) {
        self.managed_eval_threads.remove(&thread);
    }

    /// One non-blocking iteration of C9's waitpid loop, driving this
    /// `Debugger`'s own thread table and callback queue through the worker
    /// constructed in [`Self::init`]. Returns `false` once there are no
    /// tracked threads left (the worker has nothing more to wait on).
    pub fn poll(&mut self) -> Result<bool, Error> {
        let worker = self.waitpid.as_mut().ok_or(Error::ProcessNotStarted)?;
        let mut host = DebuggerWaitpidHost {
            rendezvous: &mut self.rendezvous,
            native_line_bps: &self.native_line_bps,
            mem_breakpoints: &self.mem_breakpoints,
            libraries: &self.libraries,
            managed_eval_threads: &self.managed_eval_threads,
        };
        worker.tick(&mut self.threads, &self.callbacks, &mut host)
    }

    /// Advances `thread` exactly one native instruction (C10), using the
    /// hardware single-step facility where available and falling back to
    /// the decode-and-temporary-breakpoint path of spec §4.10 once hardware
    /// stepping has returned `EIO` for this thread, or always on RISC-V64.
    pub fn native_single_step(&self, thread: Pid) -> Result<(), Error> {
        if !self.singlestep.uses_software_path(thread) {
            match ptrace::step(thread, None) {
                Ok(()) => {
                    waitpid(thread, None).map_err(Error::Waitpid)?;
                    return Ok(());
                }
                Err(nix::errno::Errno::EIO) => {
                    self.singlestep.mark_hardware_disabled(thread);
                }
                Err(e) => return Err(Error::Ptrace(e)),
            }
        }
        self.software_single_step(thread)
    }

    fn software_single_step(&self, thread: Pid) -> Result<(), Error> {
        let mem = self.mem_breakpoints.as_ref().ok_or(Error::ProcessNotStarted)?;
        let snapshot = crate::native::regs::read_software_step_snapshot(self.arch, thread)?;
        let pc = crate::native::regs::get_pc(thread)?;
        let word = ptrace::read(thread, pc.as_usize() as *mut nix::libc::c_void).map_err(Error::Ptrace)? as u64;
        let code = word.to_le_bytes();

        let next_pcs = self.singlestep.software_next_pcs(&snapshot, &code, &|addr| {
            ptrace::read(thread, addr as usize as *mut nix::libc::c_void)
                .ok()
                .map(|w| w as u64 as u32)
        })?;
        let is_thumb = matches!(&snapshot, RegisterSnapshot::Arm32(regs) if regs.itstate & 0x80 != 0);

        for addr in &next_pcs {
            mem.add(RelocatedAddress::from(*addr), is_thumb, || {})?;
        }
        let result = (|| {
            ptrace::cont(thread, None).map_err(Error::Ptrace)?;
            waitpid(thread, None).map_err(Error::Waitpid)?;
            Ok(())
        })();
        for addr in &next_pcs {
            mem.remove(RelocatedAddress::from(*addr), || {}, |_| {})?;
        }
        result
    }

    /// Attaches the rendezvous tracker (C4) once the executable's `.dynamic`
    /// section offset is known, e.g. after the first native library (the
    /// executable itself) is registered via [`Self::register_library`].
    pub fn attach_rendezvous(&mut self, mapping_offset: usize, sections: &HashMap<String, u64>) -> Result<(), Error> {
        let pid = self.pid.ok_or(Error::ProcessNotStarted)?;
        self.rendezvous = Some(Rendezvous::new(pid, mapping_offset, sections)?);
        Ok(())
    }

    pub fn rendezvous(&self) -> Option<&Rendezvous> {
        self.rendezvous.as_ref()
    }

    pub fn register_library(&mut self, name: String, library: Library) {
        self.libraries.insert(name, library);
    }

    pub fn library(&self, name: &str) -> Option<&Library> {
        self.libraries.get(name)
    }

    pub fn unregister_library(&mut self, name: &str) -> Option<Library> {
        self.libraries.remove(name)
    }

    /// Re-resolves every registered library's `[start_addr, end_addr)` range
    /// against the current link-map (spec §4.4), called after a load/unload
    /// event settles. A library with no matching link-map entry (e.g. it was
    /// just unloaded and `on_rendezvous_hit` hasn't been told yet) is left
    /// with its previous range and reported rather than failing the batch.
    pub fn refresh_library_ranges(&mut self) -> Result<(), Error> {
        let rendezvous = self.rendezvous.as_ref().ok_or(Error::ProcessNotStarted)?;
        let link_maps = rendezvous.link_maps()?;

        let mut errors: Vec<anyhow::Error> = Vec::new();
        for (name, lib) in self.libraries.iter_mut() {
            let basename = std::path::Path::new(name).file_name().and_then(|f| f.to_str());
            match link_maps
                .iter()
                .find(|lm| std::path::Path::new(&lm.name).file_name().and_then(|f| f.to_str()) == basename)
            {
                Some(lm) => {
                    lib.start_addr = lm.start_addr;
                    lib.end_addr = lm.end_addr;
                }
                None => errors.push(anyhow::anyhow!("no link-map entry found for library {name}")),
            }
        }
        print_warns!(errors);
        Ok(())
    }

    /// Publishes a newly loaded managed module, re-resolves any pending
    /// native line breakpoints against the supplied resolver, and installs
    /// the one-shot entry breakpoint the first time a module carries an
    /// entry-point token (spec §4.8).
    #[allow(clippy::too_many_arguments)]
    pub fn on_module_load(
        &mut self,
        resolver: &dyn AddressResolver,
        reader: &dyn SymbolReader,
        runtime: &dyn RuntimeBreakpointApi,
        stop_all_threads_cb: &dyn Fn(),
    ) -> Result<Vec<u32>, Error> {
        let became_verified = match &self.mem_breakpoints {
            Some(mem) => self.native_line_bps.load_module(resolver, mem, stop_all_threads_cb)?,
            None => Vec::new(),
        };

        if self.entry_bp.is_none() {
            self.entry_bp = crate::breakpoints::entry::install(&mut self.symbol_index, reader, runtime);
        }

        Ok(became_verified)
    }

    pub fn set_native_line_breakpoints(
        &mut self,
        source: &str,
        requests: &[native_line::LineBreakpointRequest],
        resolver: &dyn AddressResolver,
        stop_all_threads_cb: &dyn Fn(),
        fix_all_threads_cb: &dyn Fn(RelocatedAddress),
    ) -> Result<Vec<native_line::BreakpointReport>, Error> {
        let mem = self.mem_breakpoints.as_ref().ok_or(Error::ProcessNotStarted)?;
        self.native_line_bps.set_line_breakpoints(source, requests, resolver, mem, stop_all_threads_cb, fix_all_threads_cb)
    }

    pub fn set_managed_line_breakpoints(
        &mut self,
        source: &str,
        requests: &[managed_line::LineBreakpointRequest],
        reader: &dyn SymbolReader,
        runtime: &dyn RuntimeBreakpointApi,
    ) -> Vec<managed_line::BreakpointReport> {
        self.managed_line_bps.set_line_breakpoints(source, requests, &mut self.symbol_index, reader, runtime)
    }

    pub fn set_func_breakpoints(
        &mut self,
        requests: &[managed_func::FuncBreakpointRequest],
        runtime: &dyn RuntimeBreakpointApi,
    ) -> Vec<managed_func::BreakpointReport> {
        self.managed_func_bps.set_func_breakpoints(requests, &self.symbol_index, runtime)
    }

    pub fn all_breakpoints_activate(&mut self, active: bool, runtime: &dyn RuntimeBreakpointApi) {
        self.native_line_bps.set_all_enabled(active);
        self.managed_line_bps.set_all_enabled(active, runtime);
        self.managed_func_bps.set_all_enabled(active, runtime);
    }

    /// `id`s across the three managers are independent namespaces; the
    /// caller is expected to know which kind an id belongs to (the outer
    /// protocol tracks this per the `Breakpoint` records it handed out).
    pub fn breakpoint_activate_native(&mut self, id: u32, active: bool) -> bool {
        self.native_line_bps.set_enabled(id, active)
    }

    pub fn breakpoint_activate_managed_line(&mut self, id: u32, active: bool, runtime: &dyn RuntimeBreakpointApi) -> bool {
        self.managed_line_bps.set_enabled(id, active, runtime)
    }

    pub fn breakpoint_activate_managed_func(&mut self, id: u32, active: bool, runtime: &dyn RuntimeBreakpointApi) -> bool {
        self.managed_func_bps.set_enabled(id, active, runtime)
    }

    pub fn delete_all_breakpoints(
        &mut self,
        runtime: &dyn RuntimeBreakpointApi,
        stop_all_threads_cb: &dyn Fn(),
        fix_all_threads_cb: &dyn Fn(RelocatedAddress),
    ) -> Result<(), Error> {
        if let Some(mem) = &self.mem_breakpoints {
            self.native_line_bps.clear_all(mem, stop_all_threads_cb, fix_all_threads_cb)?;
        }
        self.managed_line_bps.clear_all(runtime);
        self.managed_func_bps.clear_all(runtime);
        Ok(())
    }

    /// `cont_cb` performs the actual `PTRACE_CONT`; a per-thread failure is
    /// logged and skipped rather than aborting the whole resume.
    pub fn continue_all(&self, cont_cb: &dyn Fn(Pid) -> Result<(), Error>) {
        for pid in self.threads.pids().collect::<Vec<_>>() {
            weak_error!(cont_cb(pid));
        }
    }

    pub fn interrupt_all(&self, interrupt_cb: &dyn Fn(Pid) -> Result<(), Error>) {
        for pid in self.threads.pids().collect::<Vec<_>>() {
            weak_error!(interrupt_cb(pid));
        }
    }

    pub fn step(&self, thread: Pid, kind: StepKind, stepper: &dyn Stepper) -> Result<(), Error> {
        if self.threads.get(thread).is_none() {
            return Err(Error::TraceeNotFound(thread));
        }
        stepper.step(thread, kind)
    }

    pub fn stack_frames(
        &self,
        walker: &mut dyn ManagedStackWalker,
        native: &dyn NativeUnwinder,
        exception_active: bool,
    ) -> Vec<unwind::Frame> {
        let mut frames = Vec::new();
        unwind::walk_frames(walker, native, exception_active, |f| frames.push(f));
        frames
    }

    /// Required before each managed stop event (spec §4.13). `managed_tids`
    /// comes from the runtime's thread enumeration; any tracked thread not
    /// in that set is native. Threads mid-signal
    /// (`StoppedEventInProgress`) keep their pending event and are skipped.
    pub fn stop_all_native_threads(
        &self,
        managed_tids: &[Pid],
        interrupt_cb: &dyn Fn(Pid),
        classify_top_frame: &dyn Fn(Pid) -> NativeThreadClassification,
    ) -> StopAllResult {
        let mut result = StopAllResult::default();
        for pid in self.threads.pids() {
            if managed_tids.contains(&pid) {
                continue;
            }
            let Some(record) = self.threads.get(pid) else {
                continue;
            };
            if record.state == ThreadState::Running {
                interrupt_cb(pid);
                result.interrupted.push(pid);
            }
            if record.state == ThreadState::StoppedEventInProgress {
                continue;
            }
            match classify_top_frame(pid) {
                NativeThreadClassification::BelongsToStopEvent => result.belongs_to_event.push(pid),
                NativeThreadClassification::UserVisible => result.user_visible.push(pid),
            }
        }
        result
    }

    /// Symmetric to `init`: waits up to `config.shutdown_exit_timeout` for
    /// `exit_notified` to report the debuggee gone, then removes native
    /// breakpoints, detaches every tracked thread, and drops all registries.
    pub fn shutdown(
        &mut self,
        exit_notified: &dyn Fn() -> bool,
        detach_cb: &dyn Fn(Pid),
        stop_all_threads_cb: &dyn Fn(),
        fix_all_threads_cb: &dyn Fn(RelocatedAddress),
    ) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.shutdown_exit_timeout;
        while Instant::now() < deadline {
            if exit_notified() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        if let Some(mem) = &self.mem_breakpoints {
            self.native_line_bps.clear_all(mem, stop_all_threads_cb, fix_all_threads_cb)?;
        }

        for pid in self.threads.pids().collect::<Vec<_>>() {
            detach_cb(pid);
            self.threads.remove(pid);
        }

        self.libraries.clear();
        self.rendezvous = None;
        self.mem_breakpoints = None;
        self.entry_bp = None;
        self.waitpid = None;
        self.managed_eval_threads.clear();
        self.pid = None;
        Ok(())
    }
}

/// Transient [`WaitpidHost`] borrowing `Debugger`'s own collaborators for the
/// duration of one [`Debugger::poll`] call. Exists only so `WaitpidWorker`
/// never has to own the registries it classifies stops against.
struct DebuggerWaitpidHost<'a> {
    rendezvous: &'a mut Option<Rendezvous>,
    native_line_bps: &'a NativeLineBreakpoints,
    mem_breakpoints: &'a Option<MemBreakpoints>,
    libraries: &'a IndexMap<String, Library>,
    managed_eval_threads: &'a HashSet<Pid>,
}

impl<'a> WaitpidHost for DebuggerWaitpidHost<'a> {
    fn is_rendezvous_brk(&self, addr: RelocatedAddress) -> bool {
        self.rendezvous.as_ref().map(|r| r.r_brk() == addr).unwrap_or(false)
    }

    /// Advances the rendezvous state machine. Library (un)registration off
    /// the resulting diff is the outer protocol's job, driven through
    /// [`Debugger::register_library`]/[`Debugger::unregister_library`] once
    /// it re-reads `/proc/<pid>/maps`.
    fn on_rendezvous_hit(&mut self) {
        if let Some(r) = self.rendezvous.as_mut() {
            let _ = r.on_rendezvous_hit();
        }
    }

    fn native_breakpoint_ids(&self, addr: RelocatedAddress) -> Option<Vec<u32>> {
        self.native_line_bps
            .is_line_breakpoint(addr)
            .map(|reports| reports.iter().map(|r| r.id).collect())
    }

    fn managed_eval_running(&self, pid: Pid) -> bool {
        self.managed_eval_threads.contains(&pid)
    }

    fn step_over_brk(&mut self, pid: Pid, addr: RelocatedAddress) -> Result<(), Error> {
        let mem = self.mem_breakpoints.as_ref().ok_or(Error::ProcessNotStarted)?;
        mem.step_over_brk(addr, || {
            ptrace::step(pid, None).map_err(Error::Ptrace)?;
            waitpid(pid, None).map_err(Error::Waitpid)?;
            Ok(())
        })
    }

    fn is_user_code_pc(&self, pid: Pid) -> bool {
        let Ok(pc) = crate::native::regs::get_pc(pid) else {
            return false;
        };
        self.libraries
            .values()
            .any(|lib| !lib.is_runtime_lib && pc >= lib.start_addr && pc < lib.end_addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_init_then_double_init_fails() {
        let mut dbg = Debugger::new(Config::default(), Arch::X86_64);
        dbg.init(Pid::from_raw(42)).unwrap();
        assert!(matches!(dbg.init(Pid::from_raw(43)), Err(Error::AlreadyRun)));
    }

    #[test]
    fn test_step_on_unknown_thread_is_invalid_operation() {
        struct NoopStepper;
        impl Stepper for NoopStepper {
            fn step(&self, _thread: Pid, _kind: StepKind) -> Result<(), Error> {
                Ok(())
            }
        }
        let dbg = Debugger::new(Config::default(), Arch::X86_64);
        let err = dbg.step(Pid::from_raw(99), StepKind::In, &NoopStepper).unwrap_err();
        assert!(matches!(err, Error::TraceeNotFound(_)));
    }

    #[test]
    fn test_shutdown_detaches_all_threads() {
        let mut dbg = Debugger::new(Config::default(), Arch::X86_64);
        dbg.init(Pid::from_raw(7)).unwrap();
        let detached = std::cell::RefCell::new(Vec::new());
        dbg.shutdown(
            &|| true,
            &|pid| detached.borrow_mut().push(pid),
            &|| {},
            &|_| {},
        )
        .unwrap();
        assert_eq!(detached.borrow().as_slice(), &[Pid::from_raw(7)]);
        assert!(dbg.pid().is_none());
    }

    #[test]
    fn test_init_constructs_waitpid_worker() {
        let mut dbg = Debugger::new(Config::default(), Arch::X86_64);
        assert!(dbg.waitpid.is_none());
        dbg.init(Pid::from_raw(123)).unwrap();
        assert!(dbg.waitpid.is_some());
    }

    #[test]
    fn test_poll_before_init_is_process_not_started() {
        let mut dbg = Debugger::new(Config::default(), Arch::X86_64);
        assert!(matches!(dbg.poll(), Err(Error::ProcessNotStarted)));
    }

    #[test]
    fn test_refresh_library_ranges_before_rendezvous_is_process_not_started() {
        let mut dbg = Debugger::new(Config::default(), Arch::X86_64);
        dbg.init(Pid::from_raw(321)).unwrap();
        assert!(matches!(dbg.refresh_library_ranges(), Err(Error::ProcessNotStarted)));
    }

    #[test]
    fn test_managed_eval_tracking() {
        let mut dbg = Debugger::new(Config::default(), Arch::X86_64);
        let pid = Pid::from_raw(55);
        assert!(!dbg.managed_eval_threads.contains(&pid));
        dbg.begin_managed_eval(pid);
        assert!(dbg.managed_eval_threads.contains(&pid));
        dbg.end_managed_eval(pid);
        assert!(!dbg.managed_eval_threads.contains(&pid));
    }

    #[test]
    fn test_debugger_waitpid_host_managed_eval_running_reflects_set() {
        let mut dbg = Debugger::new(Config::default(), Arch::X86_64);
        let active = Pid::from_raw(9);
        dbg.begin_managed_eval(active);
        let host = DebuggerWaitpidHost {
            rendezvous: &mut dbg.rendezvous,
            native_line_bps: &dbg.native_line_bps,
            mem_breakpoints: &dbg.mem_breakpoints,
            libraries: &dbg.libraries,
            managed_eval_threads: &dbg.managed_eval_threads,
        };
        assert!(WaitpidHost::managed_eval_running(&host, active));
        assert!(!WaitpidHost::managed_eval_running(&host, Pid::from_raw(1)));
    }

    #[test]
    fn test_stop_all_native_threads_skips_managed_and_mid_signal() {
        let mut dbg = Debugger::new(Config::default(), Arch::X86_64);
        dbg.init(Pid::from_raw(1)).unwrap();
        let native_running = Pid::from_raw(2);
        let native_mid_signal = Pid::from_raw(3);
        dbg.threads.insert(native_running).state = ThreadState::Running;
        dbg.threads.insert(native_mid_signal).state = ThreadState::StoppedEventInProgress;

        let interrupted = std::cell::RefCell::new(Vec::new());
        let result = dbg.stop_all_native_threads(
            &[Pid::from_raw(1)],
            &|pid| interrupted.borrow_mut().push(pid),
            &|_pid| NativeThreadClassification::UserVisible,
        );

        assert_eq!(interrupted.borrow().as_slice(), &[native_running]);
        assert_eq!(result.user_visible, vec![native_running]);
        assert!(!result.user_visible.contains(&native_mid_signal));
    }
}
