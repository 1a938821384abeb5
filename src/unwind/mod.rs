//! Stack Unwinder (C11): interleaves managed frames (walked through the
//! managed debugging API's `ICorDebugStackWalk`) with native frames, unwound
//! libunwind-style over ptrace accessors, per spec §4.11. Grounded on
//! `debugee/dwarf/unwind.rs`'s pure DWARF/CFI unwinder, which has no managed
//! side to interleave with; its register-rule evaluation loop is generalized
//! here into a remote accessor trait instead of linking libunwind directly
//! (the `unwind` crate is dropped, see DESIGN.md).

use crate::address::{IlOffset, MethodToken};
use crate::symbols::ModuleId;

pub const MAX_FRAMES: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeContext {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeFrameInfo {
    pub pc: u64,
    pub sp: u64,
}

/// One step of the managed debugging API's stack walker. `sp`/`fp` and
/// `is_optimized` are whatever the runtime reports for the managed frame;
/// this module does not compute them.
#[derive(Clone, Debug, PartialEq)]
pub enum RawStackFrame {
    Native { pc: u64, sp: u64 },
    RuntimeUnwindable,
    Managed { module: ModuleId, method_token: MethodToken, il_offset: IlOffset, sp: u64, fp: u64, is_optimized: bool },
    ClrNative { pc: u64, sp: u64 },
    EndOfStack,
}

pub trait ManagedStackWalker {
    fn next(&mut self) -> RawStackFrame;
}

/// libunwind-style remote unwind over ptrace accessors (spec §4.11). A
/// `stop_at` address ends the walk when reached; otherwise the walk stops
/// naturally at the first frame whose pc belongs to no known library.
pub trait NativeUnwinder {
    fn unwind_native(&self, ctx: &NativeContext, stop_at: Option<u64>, skip_first: bool) -> (Vec<NativeFrameInfo>, bool);
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Managed { module: ModuleId, method_token: MethodToken, il_offset: IlOffset },
    Native { pc: u64 },
    ClrNative { pc: u64 },
    /// Appended when a leftover native chain did not reach a natural stop
    /// before the frame cap or the walk's end.
    UnknownNativeChain,
}

/// Walks one thread's stack, interleaving managed and native frames per
/// spec §4.11's algorithm, emitting each [`Frame`] via `emit` in unwind
/// order (innermost first). `exception_active` corresponds to "thread
/// stopped by managed exception" — when set, the walk never proceeds past
/// the first managed frame.
pub fn walk_frames(
    walker: &mut dyn ManagedStackWalker,
    native: &dyn NativeUnwinder,
    exception_active: bool,
    mut emit: impl FnMut(Frame),
) {
    let mut ctx_unmanaged_chain: Option<NativeContext> = None;
    let mut first = true;
    let mut emitted = 0usize;

    loop {
        if emitted >= MAX_FRAMES {
            return;
        }

        match walker.next() {
            RawStackFrame::EndOfStack => break,
            RawStackFrame::RuntimeUnwindable => continue,
            RawStackFrame::Native { pc, sp } => {
                ctx_unmanaged_chain = Some(NativeContext { pc, sp, fp: 0 });
                continue;
            }
            RawStackFrame::Managed { module, method_token, il_offset, sp, fp, is_optimized } => {
                let effective_fp = if first && sp != 0 && fp == 0 { sp } else { fp };

                if let Some(chain_ctx) = ctx_unmanaged_chain.take() {
                    let (frames, _) = native.unwind_native(&chain_ctx, None, !first);
                    for f in frames {
                        if emitted >= MAX_FRAMES {
                            return;
                        }
                        emit(Frame::Native { pc: f.pc });
                        emitted += 1;
                    }
                }

                if first && is_optimized {
                    let ctx = NativeContext { pc: 0, sp, fp: effective_fp };
                    let (frames, _) = native.unwind_native(&ctx, None, false);
                    for f in frames {
                        if emitted >= MAX_FRAMES {
                            return;
                        }
                        emit(Frame::Native { pc: f.pc });
                        emitted += 1;
                    }
                }

                emit(Frame::Managed { module, method_token, il_offset });
                emitted += 1;
                let was_first = first;
                first = false;

                if was_first && exception_active {
                    return;
                }
            }
            RawStackFrame::ClrNative { pc, sp } => {
                if !first {
                    continue;
                }
                let ctx = NativeContext { pc, sp, fp: 0 };
                let (frames, _) = native.unwind_native(&ctx, None, false);
                for f in frames {
                    if emitted >= MAX_FRAMES {
                        return;
                    }
                    emit(Frame::Native { pc: f.pc });
                    emitted += 1;
                }
                emit(Frame::ClrNative { pc });
                emitted += 1;
                first = false;
            }
        }
    }

    if let Some(chain_ctx) = ctx_unmanaged_chain {
        let (frames, stopped_naturally) = native.unwind_native(&chain_ctx, None, false);
        for f in frames {
            if emitted >= MAX_FRAMES {
                return;
            }
            emit(Frame::Native { pc: f.pc });
            emitted += 1;
        }
        if !stopped_naturally && emitted < MAX_FRAMES {
            emit(Frame::UnknownNativeChain);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;

    struct ScriptedWalker {
        steps: RefCell<std::vec::IntoIter<RawStackFrame>>,
    }
    impl ScriptedWalker {
        fn new(steps: Vec<RawStackFrame>) -> Self {
            Self { steps: RefCell::new(steps.into_iter()) }
        }
    }
    impl ManagedStackWalker for ScriptedWalker {
        fn next(&mut self) -> RawStackFrame {
            self.steps.borrow_mut().next().unwrap_or(RawStackFrame::EndOfStack)
        }
    }

    struct FixedNative {
        frames: Vec<NativeFrameInfo>,
        stopped_naturally: bool,
    }
    impl NativeUnwinder for FixedNative {
        fn unwind_native(&self, _ctx: &NativeContext, _stop_at: Option<u64>, skip_first: bool) -> (Vec<NativeFrameInfo>, bool) {
            let frames = if skip_first && !self.frames.is_empty() { self.frames[1..].to_vec() } else { self.frames.clone() };
            (frames, self.stopped_naturally)
        }
    }

    #[test]
    fn test_pure_managed_stack_no_native_chain() {
        let mut walker = ScriptedWalker::new(vec![
            RawStackFrame::Managed { module: ModuleId::for_test(0), method_token: MethodToken(1), il_offset: IlOffset(0), sp: 0x1000, fp: 0, is_optimized: false },
            RawStackFrame::Managed { module: ModuleId::for_test(0), method_token: MethodToken(2), il_offset: IlOffset(0), sp: 0x2000, fp: 0x1000, is_optimized: false },
            RawStackFrame::EndOfStack,
        ]);
        let native = FixedNative { frames: vec![], stopped_naturally: true };
        let mut frames = Vec::new();
        walk_frames(&mut walker, &native, false, |f| frames.push(f));

        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Managed { method_token, .. } if *method_token == MethodToken(1)));
    }

    #[test]
    fn test_mixed_stack_interleaves_native_and_managed() {
        let mut walker = ScriptedWalker::new(vec![
            RawStackFrame::Native { pc: 0x500, sp: 0x100 },
            RawStackFrame::Managed { module: ModuleId::for_test(0), method_token: MethodToken(1), il_offset: IlOffset(0), sp: 0x1000, fp: 0, is_optimized: false },
            RawStackFrame::EndOfStack,
        ]);
        let native = FixedNative { frames: vec![NativeFrameInfo { pc: 0x500, sp: 0x100 }], stopped_naturally: true };
        let mut frames = Vec::new();
        walk_frames(&mut walker, &native, false, |f| frames.push(f));

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Native { pc: 0x500 }));
        assert!(matches!(&frames[1], Frame::Managed { method_token, .. } if *method_token == MethodToken(1)));
    }

    #[test]
    fn test_leftover_chain_without_natural_stop_appends_unknown() {
        let mut walker = ScriptedWalker::new(vec![RawStackFrame::Native { pc: 0x900, sp: 0x100 }, RawStackFrame::EndOfStack]);
        let native = FixedNative { frames: vec![NativeFrameInfo { pc: 0x900, sp: 0x100 }], stopped_naturally: false };
        let mut frames = Vec::new();
        walk_frames(&mut walker, &native, false, |f| frames.push(f));

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Native { pc: 0x900 }));
        assert!(matches!(frames[1], Frame::UnknownNativeChain));
    }

    #[test]
    fn test_exception_active_stops_after_first_managed_frame() {
        let mut walker = ScriptedWalker::new(vec![
            RawStackFrame::Managed { module: ModuleId::for_test(0), method_token: MethodToken(1), il_offset: IlOffset(0), sp: 0x1000, fp: 0, is_optimized: false },
            RawStackFrame::Managed { module: ModuleId::for_test(0), method_token: MethodToken(2), il_offset: IlOffset(0), sp: 0x2000, fp: 0x1000, is_optimized: false },
            RawStackFrame::EndOfStack,
        ]);
        let native = FixedNative { frames: vec![], stopped_naturally: true };
        let mut frames = Vec::new();
        walk_frames(&mut walker, &native, true, |f| frames.push(f));

        assert_eq!(frames.len(), 1);
    }
}
