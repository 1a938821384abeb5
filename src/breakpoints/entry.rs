//! Entry Breakpoint (C8): one-shot stop at the managed entry point, with the
//! async-`Main` rewrite to `<Main>d__N.MoveNext` (spec §4.8). No analog in a
//! native-only debugger, which debugs binaries with no single managed
//! entry-point concept; grounded on the C6/C7 runtime-handle shape.

use crate::address::{IlOffset, MethodToken, MethodVersion};
use crate::breakpoints::managed_line::{RuntimeBreakpointApi, RuntimeHandle};
use crate::symbols::{ModuleId, SymbolIndex, SymbolReader};

#[derive(Debug)]
pub struct EntryBreakpoint {
    pub module: ModuleId,
    pub method_token: MethodToken,
    pub il_offset: IlOffset,
    pub native_handle: RuntimeHandle,
    pub hit: bool,
}

/// Finds the entry method's `MoveNext` state machine when `Main` was
/// compiled as `async`: a sibling method named `MoveNext` on a nested class
/// whose name starts with `<Main>d__`.
fn find_async_main_move_next(index: &SymbolIndex, module: ModuleId) -> Option<(ModuleId, MethodToken)> {
    index
        .resolve_function(None, "MoveNext", None)
        .into_iter()
        .find(|(m, t)| {
            *m == module
                && index
                    .method_info(*m, *t)
                    .map(|info| info.qualified_name.contains("<Main>d__"))
                    .unwrap_or(false)
        })
}

fn is_main_entry_method(index: &SymbolIndex, module: ModuleId, token: MethodToken) -> bool {
    index
        .method_info(module, token)
        .map(|info| info.qualified_name.rsplit(['.', ':']).next() == Some("Main") || info.qualified_name.ends_with("<Main>"))
        .unwrap_or(false)
}

/// Installs the one-shot entry breakpoint on the first module carrying an
/// entry-point token. Returns `None` when no loaded module has one yet (the
/// caller retries on the next module load).
pub fn install(
    index: &mut SymbolIndex,
    reader: &dyn SymbolReader,
    runtime: &dyn RuntimeBreakpointApi,
) -> Option<EntryBreakpoint> {
    let (module, entry_token) = index.first_entry_point_module()?;

    let (target_module, target_token) = if is_main_entry_method(index, module, entry_token) {
        find_async_main_move_next(index, module).unwrap_or((module, entry_token))
    } else {
        (module, entry_token)
    };

    let il_offset = index.next_user_code_il_offset(target_module, target_token, MethodVersion(1), IlOffset(0), reader);
    let handle = runtime.create_function_breakpoint(target_module, target_token, il_offset);
    runtime.activate(handle, true);

    Some(EntryBreakpoint { module: target_module, method_token: target_token, il_offset, native_handle: handle, hit: false })
}

impl EntryBreakpoint {
    /// Called by the façade when the runtime reports a hit on this handle.
    /// Deactivates on first hit per spec §4.8; subsequent calls are no-ops.
    pub fn on_hit(&mut self, runtime: &dyn RuntimeBreakpointApi) {
        if self.hit {
            return;
        }
        self.hit = true;
        runtime.activate(self.native_handle, false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::symbols::index::MethodInfo;
    use crate::symbols::reader::{MemoryLayout, ReadMemoryFn, RawSequencePoint, SymbolReaderHandle};
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeReader {
        points: Vec<RawSequencePoint>,
    }
    impl SymbolReader for FakeReader {
        fn load_symbols_for_module(&self, _n: &str, _l: &MemoryLayout, _r: &ReadMemoryFn) -> Option<SymbolReaderHandle> {
            Some(SymbolReaderHandle(1))
        }
        fn resolve_sequence_point(&self, _h: SymbolReaderHandle, _f: &str, _l: u32) -> Vec<(MethodToken, IlOffset)> {
            vec![]
        }
        fn get_line_by_il_offset(&self, _h: SymbolReaderHandle, _t: MethodToken, _o: IlOffset) -> Option<(u32, String)> {
            None
        }
        fn get_step_ranges_from_ip(&self, _h: SymbolReaderHandle, _ip: u64, _t: MethodToken) -> Option<(IlOffset, IlOffset)> {
            None
        }
        fn get_sequence_points(&self, _h: SymbolReaderHandle, token: MethodToken) -> Vec<RawSequencePoint> {
            self.points.iter().filter(|sp| sp.il_offset.0 / 0x10 + 1 == token.0).cloned().collect()
        }
        fn get_local_variable_name_and_scope(&self, _h: SymbolReaderHandle, _t: MethodToken, _i: u32) -> Option<(String, IlOffset, IlOffset)> {
            None
        }
        fn parse_expression(&self, _t: &str, _ty: &str) -> Result<Vec<u8>, String> {
            Err("n/a".into())
        }
        fn eval_expression(&self, _t: &str, _g: &dyn Fn(&str) -> Option<u64>) -> Result<(Vec<u8>, u32, u64), String> {
            Err("n/a".into())
        }
        fn dispose(&self, _h: SymbolReaderHandle) {}
    }

    struct FakeRuntime {
        activations: RefCell<HashMap<RuntimeHandle, bool>>,
        next: RefCell<u64>,
    }
    impl FakeRuntime {
        fn new() -> Self {
            Self { activations: RefCell::new(HashMap::new()), next: RefCell::new(1) }
        }
    }
    impl RuntimeBreakpointApi for FakeRuntime {
        fn create_function_breakpoint(&self, _m: ModuleId, _t: MethodToken, _o: IlOffset) -> RuntimeHandle {
            let mut n = self.next.borrow_mut();
            let h = RuntimeHandle(*n);
            *n += 1;
            h
        }
        fn activate(&self, handle: RuntimeHandle, active: bool) {
            self.activations.borrow_mut().insert(handle, active);
        }
    }

    fn layout() -> MemoryLayout {
        MemoryLayout { pe_addr: 0, pe_size: 0, pdb_addr: 0, pdb_size: 0 }
    }

    #[test]
    fn test_install_on_plain_main_uses_entry_token_directly() {
        let reader = FakeReader { points: vec![] };
        let runtime = FakeRuntime::new();
        let mut index = SymbolIndex::new();
        let read_memory: &ReadMemoryFn = &|_a, _b| false;
        let module = index.try_load_module_symbols("Prog.dll", 0, 0, Some(MethodToken(7)), &reader, &layout(), read_memory);
        index.register_method(module, MethodToken(7), MethodInfo { qualified_name: "Program.Main".into(), param_types: vec![] });

        let entry = install(&mut index, &reader, &runtime).unwrap();
        assert_eq!(entry.method_token, MethodToken(7));
        assert_eq!(*runtime.activations.borrow().get(&entry.native_handle).unwrap(), true);
    }

    #[test]
    fn test_install_on_async_main_rewrites_to_move_next() {
        let reader = FakeReader { points: vec![] };
        let runtime = FakeRuntime::new();
        let mut index = SymbolIndex::new();
        let read_memory: &ReadMemoryFn = &|_a, _b| false;
        let module = index.try_load_module_symbols("Prog.dll", 0, 0, Some(MethodToken(7)), &reader, &layout(), read_memory);
        index.register_method(module, MethodToken(7), MethodInfo { qualified_name: "Program.Main".into(), param_types: vec![] });
        index.register_method(
            module,
            MethodToken(8),
            MethodInfo { qualified_name: "Program.<Main>d__0.MoveNext".into(), param_types: vec![] },
        );

        let entry = install(&mut index, &reader, &runtime).unwrap();
        assert_eq!(entry.method_token, MethodToken(8));
    }

    #[test]
    fn test_on_hit_deactivates_once() {
        let reader = FakeReader { points: vec![] };
        let runtime = FakeRuntime::new();
        let mut index = SymbolIndex::new();
        let read_memory: &ReadMemoryFn = &|_a, _b| false;
        let module = index.try_load_module_symbols("Prog.dll", 0, 0, Some(MethodToken(7)), &reader, &layout(), read_memory);
        index.register_method(module, MethodToken(7), MethodInfo { qualified_name: "Program.Main".into(), param_types: vec![] });

        let mut entry = install(&mut index, &reader, &runtime).unwrap();
        entry.on_hit(&runtime);
        assert_eq!(*runtime.activations.borrow().get(&entry.native_handle).unwrap(), false);
        assert!(entry.hit);
    }
}
