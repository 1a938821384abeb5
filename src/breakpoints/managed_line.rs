//! Managed Line Breakpoints (C6): source+line → `(module, method, IL offset)`
//! resolved against C1, with the "one active per line" rule of spec §4.6.
//! No analog in a native-only debugger; grounded on `debugger/breakpoint.rs`'s
//! enable/disable shape, generalized to a runtime function-breakpoint handle
//! instead of a raw memory patch.

use crate::address::{IlOffset, MethodToken};
use crate::symbols::{ModuleId, SymbolIndex, SymbolReader};
use std::collections::HashMap;

/// Opaque handle to a function breakpoint created on the managed debugging
/// API; owned exclusively by the `ResolvedEntry` that created it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RuntimeHandle(pub u64);

/// The managed debugging API surface this component drives; named but
/// unspecified beyond its call shape in spec §6.
pub trait RuntimeBreakpointApi {
    fn create_function_breakpoint(&self, module: ModuleId, token: MethodToken, il_offset: IlOffset) -> RuntimeHandle;
    fn activate(&self, handle: RuntimeHandle, active: bool);
}

#[derive(Clone, Debug)]
pub struct ResolvedEntry {
    pub module: ModuleId,
    pub method_token: MethodToken,
    pub il_offset: IlOffset,
    pub resolved_source_path: String,
    pub resolved_line: u32,
    pub end_line: u32,
    pub native_handle: RuntimeHandle,
}

#[derive(Debug)]
pub struct ManagedLineBreakpoint {
    pub id: u32,
    pub user_source_path: String,
    pub user_line: u32,
    pub condition: Option<String>,
    pub module_filter: Option<String>,
    pub enabled: bool,
    pub resolved: Vec<ResolvedEntry>,
}

#[derive(Clone, Debug)]
pub struct BreakpointReport {
    pub id: u32,
    pub line: u32,
    pub verified: bool,
}

impl From<&ManagedLineBreakpoint> for BreakpointReport {
    fn from(bp: &ManagedLineBreakpoint) -> Self {
        BreakpointReport { id: bp.id, line: bp.user_line, verified: !bp.resolved.is_empty() }
    }
}

#[derive(Clone, Debug)]
pub struct LineBreakpointRequest {
    pub line: u32,
    pub condition: Option<String>,
    pub module_filter: Option<String>,
    pub enabled: bool,
}

#[derive(Default)]
pub struct ManagedLineBreakpoints {
    next_id: u32,
    breakpoints: HashMap<u32, ManagedLineBreakpoint>,
    by_source: HashMap<String, Vec<u32>>,
    fullname_index: HashMap<String, u32>,
    next_fullname_index: u32,
}

impl ManagedLineBreakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn fullname_index_for(&mut self, source: &str) -> u32 {
        if let Some(idx) = self.fullname_index.get(source) {
            return *idx;
        }
        let idx = self.next_fullname_index;
        self.next_fullname_index += 1;
        self.fullname_index.insert(source.to_string(), idx);
        idx
    }

    pub fn get(&self, id: u32) -> Option<&ManagedLineBreakpoint> {
        self.breakpoints.get(&id)
    }

    /// Resolves each request against C1, creates one runtime handle per
    /// constructor/copy found, then re-applies the one-active rule across
    /// every breakpoint sharing a `(source, line)` key.
    pub fn set_line_breakpoints(
        &mut self,
        source: &str,
        requests: &[LineBreakpointRequest],
        index: &mut SymbolIndex,
        reader: &dyn SymbolReader,
        runtime: &dyn RuntimeBreakpointApi,
    ) -> Vec<BreakpointReport> {
        let previous_ids = self.by_source.remove(source).unwrap_or_default();
        let mut previous_by_line: HashMap<u32, u32> = HashMap::new();
        for id in previous_ids {
            if let Some(bp) = self.breakpoints.get(&id) {
                previous_by_line.insert(bp.user_line, id);
            }
        }

        let requested_lines: std::collections::HashSet<u32> = requests.iter().map(|r| r.line).collect();
        for (line, id) in previous_by_line.iter() {
            if !requested_lines.contains(line) {
                if let Some(bp) = self.breakpoints.remove(id) {
                    for entry in &bp.resolved {
                        runtime.activate(entry.native_handle, false);
                    }
                }
            }
        }

        let mut new_ids = Vec::with_capacity(requests.len());
        for req in requests {
            let id = if let Some(&existing) = previous_by_line.get(&req.line) {
                let bp = self.breakpoints.get_mut(&existing).unwrap();
                bp.condition = req.condition.clone();
                bp.enabled = req.enabled;
                existing
            } else {
                let id = self.next_id;
                self.next_id += 1;
                let resolved = index
                    .resolve_breakpoint(req.module_filter.as_deref(), source, req.line, reader)
                    .into_iter()
                    .map(|r| ResolvedEntry {
                        module: r.module,
                        method_token: r.method_token,
                        il_offset: r.il_offset,
                        resolved_source_path: source.to_string(),
                        resolved_line: r.start_line,
                        end_line: r.end_line,
                        native_handle: runtime.create_function_breakpoint(r.module, r.method_token, r.il_offset),
                    })
                    .collect();
                self.breakpoints.insert(
                    id,
                    ManagedLineBreakpoint {
                        id,
                        user_source_path: source.to_string(),
                        user_line: req.line,
                        condition: req.condition.clone(),
                        module_filter: req.module_filter.clone(),
                        enabled: req.enabled,
                        resolved,
                    },
                );
                id
            };
            new_ids.push(id);
        }

        self.by_source.insert(source.to_string(), new_ids.clone());
        self.apply_one_active_rule(runtime);
        new_ids.iter().map(|id| BreakpointReport::from(&self.breakpoints[id])).collect()
    }

    /// Spec §4.6's one-active rule: among all resolved entries sharing a
    /// `(source_index, line)` key, exactly the first *enabled* parent's
    /// handle stays `Activate(true)`; the rest are `Activate(false)`. Ties
    /// break by ascending breakpoint id, which is the order breakpoints were
    /// created in — there is no other ordering signal in the model.
    fn apply_one_active_rule(&mut self, runtime: &dyn RuntimeBreakpointApi) {
        let mut groups: HashMap<(u32, u32), Vec<(u32, usize)>> = HashMap::new();
        let mut ids: Vec<u32> = self.breakpoints.keys().copied().collect();
        ids.sort_unstable();

        for id in &ids {
            let bp = &self.breakpoints[id];
            let source_idx = {
                if let Some(idx) = self.fullname_index.get(&bp.user_source_path) {
                    *idx
                } else {
                    continue;
                }
            };
            for (entry_idx, entry) in bp.resolved.iter().enumerate() {
                groups.entry((source_idx, entry.resolved_line)).or_default().push((*id, entry_idx));
            }
        }

        for members in groups.values() {
            let active_member = members.iter().find(|(id, _)| self.breakpoints[id].enabled).copied();
            for &(id, entry_idx) in members {
                let handle = self.breakpoints[&id].resolved[entry_idx].native_handle;
                let should_activate = active_member == Some((id, entry_idx));
                runtime.activate(handle, should_activate);
            }
        }
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool, runtime: &dyn RuntimeBreakpointApi) -> bool {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        bp.enabled = enabled;
        self.apply_one_active_rule(runtime);
        true
    }

    pub fn set_all_enabled(&mut self, enabled: bool, runtime: &dyn RuntimeBreakpointApi) {
        for bp in self.breakpoints.values_mut() {
            bp.enabled = enabled;
        }
        self.apply_one_active_rule(runtime);
    }

    /// Deactivates every runtime handle and drops all records; used by
    /// `delete_all_breakpoints`.
    pub fn clear_all(&mut self, runtime: &dyn RuntimeBreakpointApi) {
        for bp in self.breakpoints.values() {
            for entry in &bp.resolved {
                runtime.activate(entry.native_handle, false);
            }
        }
        self.breakpoints.clear();
        self.by_source.clear();
    }

    pub fn find_by_handle(&self, handle: RuntimeHandle) -> Option<(&ManagedLineBreakpoint, &ResolvedEntry)> {
        self.breakpoints.values().find_map(|bp| bp.resolved.iter().find(|e| e.native_handle == handle).map(|e| (bp, e)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::symbols::index::SymbolIndex;
    use crate::symbols::reader::{MemoryLayout, ReadMemoryFn, RawSequencePoint, SymbolReaderHandle};
    use std::cell::RefCell;

    struct FakeReader {
        points: Vec<RawSequencePoint>,
    }
    impl SymbolReader for FakeReader {
        fn load_symbols_for_module(&self, _n: &str, _l: &MemoryLayout, _r: &ReadMemoryFn) -> Option<SymbolReaderHandle> {
            Some(SymbolReaderHandle(1))
        }
        fn resolve_sequence_point(&self, _h: SymbolReaderHandle, file: &str, line: u32) -> Vec<(MethodToken, IlOffset)> {
            self.points
                .iter()
                .filter(|sp| sp.document_path == file && sp.start_line >= line)
                .map(|sp| (MethodToken(sp.il_offset.0 + 1), sp.il_offset))
                .collect()
        }
        fn get_line_by_il_offset(&self, _h: SymbolReaderHandle, _t: MethodToken, _o: IlOffset) -> Option<(u32, String)> {
            None
        }
        fn get_step_ranges_from_ip(&self, _h: SymbolReaderHandle, _ip: u64, _t: MethodToken) -> Option<(IlOffset, IlOffset)> {
            None
        }
        fn get_sequence_points(&self, _h: SymbolReaderHandle, token: MethodToken) -> Vec<RawSequencePoint> {
            self.points.iter().filter(|sp| sp.il_offset.0 + 1 == token.0).cloned().collect()
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
    fn test_multi_constructor_exactly_one_active() {
        let reader = FakeReader {
            points: vec![
                RawSequencePoint { start_line: 10, start_column: 1, end_line: 10, end_column: 5, il_offset: IlOffset(0x10), document_path: "Foo.cs".into() },
                RawSequencePoint { start_line: 10, start_column: 1, end_line: 10, end_column: 5, il_offset: IlOffset(0x20), document_path: "Foo.cs".into() },
                RawSequencePoint { start_line: 10, start_column: 1, end_line: 10, end_column: 5, il_offset: IlOffset(0x30), document_path: "Foo.cs".into() },
            ],
        };
        let mut index = SymbolIndex::new();
        let read_memory: &ReadMemoryFn = &|_a, _b| false;
        index.try_load_module_symbols("Foo.dll", 0, 0, None, &reader, &layout(), read_memory);

        let runtime = FakeRuntime::new();
        let mut bps = ManagedLineBreakpoints::new();
        let reports = bps.set_line_breakpoints(
            "Foo.cs",
            &[LineBreakpointRequest { line: 10, condition: None, module_filter: None, enabled: true }],
            &mut index,
            &reader,
            &runtime,
        );
        assert_eq!(reports.len(), 1);
        assert!(reports[0].verified);

        let active_count = runtime.activations.borrow().values().filter(|v| **v).count();
        assert_eq!(active_count, 1);
    }
}
