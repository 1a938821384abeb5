//! Breakpoint managers: native line breakpoints (C5), managed line
//! breakpoints (C6), managed function breakpoints (C7), and the one-shot
//! managed entry breakpoint (C8).

pub mod entry;
pub mod managed_func;
pub mod managed_line;
pub mod native_line;

pub use entry::EntryBreakpoint;
pub use managed_func::{ManagedFuncBreakpoint, ManagedFuncBreakpoints};
pub use managed_line::{ManagedLineBreakpoint, ManagedLineBreakpoints, RuntimeBreakpointApi, RuntimeHandle};
pub use native_line::{NativeLineBreakpoint, NativeLineBreakpoints};
