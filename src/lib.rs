//! `clrdbg` coordinates a managed-runtime debuggee (CoreCLR-style) through
//! an in-process debugging API, optionally interleaved with native
//! ptrace-based debugging of the same OS process ("interop debugging").
//!
//! This crate is the coordination middle layer only: the outer protocol
//! (MI/DAP text I/O), CLI flag parsing, the managed expression evaluator and
//! variable pretty-printer, and the managed debugging API itself are all
//! external collaborators whose interfaces are named but not implemented
//! here.

pub mod address;
pub mod arch;
pub mod breakpoints;
pub mod callbacks;
pub mod config;
pub mod debugger;
pub mod error;
pub mod log_init;
pub mod native;
pub mod symbols;
pub mod thread_state;
pub mod unwind;

pub use debugger::Debugger;
pub use error::Error;

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and puts the error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Logs a list of errors as warnings, used when a batch operation partially fails.
#[macro_export]
macro_rules! print_warns {
    ($errors:expr) => {
        $errors.iter().for_each(|e| {
            log::warn!(target: "debugger", "{:#}", e);
        })
    };
}
