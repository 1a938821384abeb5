use crate::native::rendezvous::RendezvousError;
use nix::unistd::Pid;

/// Engine-wide error type. Variants are grouped by concern, mirroring the
/// error *kinds* (not necessarily one variant per kind) described in the
/// design's error handling section.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("debugee already running")]
    AlreadyRun,
    #[error("program is not being started")]
    ProcessNotStarted,
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] std::string::FromUtf8Error),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("no debug information for {0}")]
    NoDebugInformation(&'static str),
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(u32),
    #[error("thread {0} not found")]
    TraceeNotFound(Pid),
    #[error("frame number {0} not found")]
    FrameNotFound(u32),
    #[error("section \"{0}\" not found")]
    SectionNotFound(&'static str),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("unknown address")]
    UnknownAddress,
    #[error("memory region not found for library: {0}")]
    MappingNotFound(String),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("multiple syscall errors {0:?}")]
    MultipleErrors(Vec<Self>),
    #[error("process_vm_readv error: {0}")]
    RemoteRead(nix::Error),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("elf file has no .dynamic section")]
    DynamicSectionNotFound,

    // --------------------------------- unwind errors ---------------------------------------------
    #[error("unwind: no unwind context")]
    UnwindNoContext,
    #[error("unwind: too deep frame number (possible cycle)")]
    UnwindTooDeepFrame,
    #[error("unwind: managed frame has no known stack walker result")]
    UnwindNoManagedFrame,

    // --------------------------------- rendezvous / interop library errors -----------------------
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    // --------------------------------- debugee process errors ------------------------------------
    #[error("debugee process exited with code {0}")]
    ProcessExit(i32),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    // --------------------------------- managed runtime collaborator errors ------------------------
    #[error("managed runtime API error: {0}")]
    RuntimeApi(String),
    #[error("managed runtime API fatal initialization error: {0}")]
    FatalRuntimeInit(String),
    #[error("symbol reader error: {0}")]
    SymbolReader(String),
    #[error("condition evaluation error: {0}")]
    ConditionEval(String),
}

impl Error {
    /// Return a hint to the outer protocol: should the whole debugger session
    /// be torn down, or can the current operation simply be reported as failed
    /// while debugging continues. See the error handling design: only
    /// `FatalRuntimeError`/`FatalProcessExit`-shaped failures are fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::FatalRuntimeInit(_) | Error::ProcessExit(_) | Error::Syscall(_, _)
        )
    }
}

/// Transforms a `Result` into an `Option`, logging the error if it occurs, and
/// always returning `None` (`Result` discarded as per `UnresolvedBreakpoint`
/// / `ConditionEvalError` handling: not an error to the caller).
pub fn not_hit<T>(res: Result<T, Error>, context: &'static str) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(e) => {
            log::debug!(target: "debugger", "{context}: {e:#}");
            None
        }
    }
}
