//! Debugger Façade (C13): the aggregate owning every registry this crate
//! builds, and the command surface spec §4.13 names. Grounded on
//! `debugger/mod.rs`'s `Debugger` (owning tracer + registries + presenting
//! the command surface), generalized from a single native-DWARF `Debugee`
//! to the split native/managed registries this crate builds.

pub mod facade;

pub use facade::{Debugger, NativeThreadClassification, StepKind, StopAllResult};
