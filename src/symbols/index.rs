//! Symbol/Module Index (C1): module registry plus the source↔IL-offset
//! lookups that feed breakpoint resolution. Grounded on
//! `debugee/debugee/registry.rs`'s `DwarfRegistry` (per-module table plus
//! secondary maps rebuilt on load), generalized to the managed-side symbol
//! reader named in spec §6 in place of resolving entirely from DWARF.

use crate::address::{IlOffset, MethodToken, MethodVersion};
use crate::error::Error;
use crate::symbols::reader::{self, MemoryLayout, ReadMemoryFn, SymbolReader, SymbolReaderHandle};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ModuleId(u32);

impl ModuleId {
    #[cfg(test)]
    pub(crate) fn for_test(v: u32) -> Self {
        ModuleId(v)
    }
}

/// A published module record. Invariant (spec §3): `has_symbols == true`
/// implies `symbol_reader_handle.is_some()` for the module's whole lifetime.
#[derive(Clone, Debug)]
pub struct Module {
    pub id: ModuleId,
    pub path: String,
    pub basename: String,
    pub base_addr: u64,
    pub size: u64,
    pub has_symbols: bool,
    pub symbol_reader_handle: Option<SymbolReaderHandle>,
    pub entry_point_token: Option<MethodToken>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SequencePoint {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub il_offset: IlOffset,
    pub document_path: String,
}

impl From<&reader::RawSequencePoint> for SequencePoint {
    fn from(sp: &reader::RawSequencePoint) -> Self {
        SequencePoint {
            start_line: sp.start_line,
            start_column: sp.start_column,
            end_line: sp.end_line,
            end_column: sp.end_column,
            il_offset: sp.il_offset,
            document_path: sp.document_path.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedBreakpoint {
    pub module: ModuleId,
    pub method_token: MethodToken,
    pub il_offset: IlOffset,
    pub start_line: u32,
    pub end_line: u32,
}

/// Metadata about one method, as fed in by a metadata-import consumer (the
/// managed debugging API's "metadata import" interface named in spec §6 is
/// not itself specified beyond that name, so it is modeled as a data feed
/// here rather than invented as another callback).
#[derive(Clone, Debug)]
pub struct MethodInfo {
    pub qualified_name: String,
    pub param_types: Vec<String>,
}

#[derive(Default)]
pub struct SymbolIndex {
    modules: HashMap<ModuleId, Module>,
    by_base_addr: HashMap<u64, ModuleId>,
    by_basename: HashMap<String, Vec<ModuleId>>,
    source_to_modules: HashMap<String, HashSet<ModuleId>>,
    source_line_to_methods: HashMap<String, BTreeMap<u32, HashSet<MethodToken>>>,
    sequence_points: HashMap<(ModuleId, MethodToken), Vec<SequencePoint>>,
    method_registry: HashMap<(ModuleId, MethodToken), MethodInfo>,
    next_id: u32,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime module-load callback entry point. Publishes the module
    /// regardless of symbol-load outcome — an unreadable or mismatched PDB
    /// degrades to `has_symbols = false` rather than failing the load.
    pub fn try_load_module_symbols(
        &mut self,
        path: &str,
        base_addr: u64,
        size: u64,
        entry_point_token: Option<MethodToken>,
        reader: &dyn SymbolReader,
        layout: &MemoryLayout,
        read_memory: &ReadMemoryFn,
    ) -> ModuleId {
        let id = ModuleId(self.next_id);
        self.next_id += 1;

        let basename = path.rsplit(['/', '\\']).next().unwrap_or(path).to_string();
        let handle = reader.load_symbols_for_module(&basename, layout, read_memory);

        let module = Module {
            id,
            path: path.to_string(),
            basename: basename.clone(),
            base_addr,
            size,
            has_symbols: handle.is_some(),
            symbol_reader_handle: handle,
            entry_point_token,
        };

        self.modules.insert(id, module);
        self.by_base_addr.insert(base_addr, id);
        self.by_basename.entry(basename).or_default().push(id);
        id
    }

    pub fn unload_module(&mut self, id: ModuleId, reader: &dyn SymbolReader) {
        let Some(module) = self.modules.remove(&id) else {
            return;
        };
        if let Some(handle) = module.symbol_reader_handle {
            reader.dispose(handle);
        }
        self.by_base_addr.remove(&module.base_addr);
        if let Some(v) = self.by_basename.get_mut(&module.basename) {
            v.retain(|m| *m != id);
        }
        for set in self.source_to_modules.values_mut() {
            set.remove(&id);
        }
        self.sequence_points.retain(|(m, _), _| *m != id);
        self.method_registry.retain(|(m, _), _| *m != id);
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    pub fn module_by_basename(&self, basename: &str) -> Option<&Module> {
        self.by_basename
            .get(basename)
            .and_then(|ids| ids.first())
            .and_then(|id| self.modules.get(id))
    }

    /// Entry point used by C7/C8 to feed the metadata-import data this index
    /// needs for name-based resolution; see [`MethodInfo`].
    pub fn register_method(&mut self, module: ModuleId, token: MethodToken, info: MethodInfo) {
        self.method_registry.insert((module, token), info);
    }

    pub fn method_info(&self, module: ModuleId, token: MethodToken) -> Option<&MethodInfo> {
        self.method_registry.get(&(module, token))
    }

    /// The first loaded module carrying an entry-point token, in load order
    /// (load order tracks `ModuleId` since ids are handed out monotonically).
    pub fn first_entry_point_module(&self) -> Option<(ModuleId, MethodToken)> {
        self.modules
            .values()
            .filter_map(|m| m.entry_point_token.map(|t| (m.id, t)))
            .min_by_key(|(id, _)| *id)
    }

    fn candidate_modules<'a>(&'a self, module_filter: Option<&str>) -> impl Iterator<Item = &'a Module> + 'a {
        self.modules.values().filter(move |m| {
            m.has_symbols
                && module_filter
                    .map(|f| m.basename == f || m.path == f)
                    .unwrap_or(true)
        })
    }

    fn sequence_points_for(&mut self, module: ModuleId, token: MethodToken, reader: &dyn SymbolReader) -> &[SequencePoint] {
        let key = (module, token);
        if !self.sequence_points.contains_key(&key) {
            let handle = self.modules.get(&module).and_then(|m| m.symbol_reader_handle);
            let points = handle
                .map(|h| {
                    reader
                        .get_sequence_points(h, token)
                        .iter()
                        .filter(|sp| !reader::is_hidden(sp))
                        .map(SequencePoint::from)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            self.sequence_points.insert(key, points);
        }
        &self.sequence_points[&key]
    }

    /// Returns zero or more resolutions, one per constructor/copy of the
    /// requested line found across matching modules. Updates the secondary
    /// maps as a side effect (spec §4.1: "rebuilt incrementally on module
    /// load" — here, incrementally as lines are queried, since the external
    /// symbol reader exposes no bulk method enumeration to pre-scan with).
    pub fn resolve_breakpoint(
        &mut self,
        module_filter: Option<&str>,
        source: &str,
        line: u32,
        reader: &dyn SymbolReader,
    ) -> Vec<ResolvedBreakpoint> {
        let candidate_ids: Vec<ModuleId> = self.candidate_modules(module_filter).map(|m| m.id).collect();
        let mut results = Vec::new();

        for module_id in candidate_ids {
            let handle = match self.modules.get(&module_id).and_then(|m| m.symbol_reader_handle) {
                Some(h) => h,
                None => continue,
            };
            let hits = reader.resolve_sequence_point(handle, source, line);
            if hits.is_empty() {
                continue;
            }
            self.source_to_modules.entry(source.to_string()).or_default().insert(module_id);

            for (token, il_offset) in hits {
                let points = self.sequence_points_for(module_id, token, reader).to_vec();
                let sp = points
                    .iter()
                    .find(|sp| sp.il_offset == il_offset)
                    .cloned()
                    .unwrap_or(SequencePoint {
                        start_line: line,
                        start_column: 0,
                        end_line: line,
                        end_column: 0,
                        il_offset,
                        document_path: source.to_string(),
                    });

                self.source_line_to_methods
                    .entry(source.to_string())
                    .or_default()
                    .entry(sp.start_line)
                    .or_default()
                    .insert(token);

                results.push(ResolvedBreakpoint {
                    module: module_id,
                    method_token: token,
                    il_offset,
                    start_line: sp.start_line,
                    end_line: sp.end_line,
                });
            }
        }

        // Tie-break rule (spec §4.1): among candidates sharing a module and
        // starting at/after `line`, the smallest (start_line, start_column)
        // wins — applied here as a final stable sort since the reader may
        // return more than one sequence point per method in pathological
        // cases (e.g. a duplicated statement from inlining).
        results.sort_by_key(|r| (r.module, r.start_line));
        results
    }

    /// Suffix-match on the fully qualified name; exact parameter-signature
    /// match when the caller supplies one.
    pub fn resolve_function(
        &self,
        module_filter: Option<&str>,
        dotted_name: &str,
        param_signature: Option<&[String]>,
    ) -> Vec<(ModuleId, MethodToken)> {
        let candidate_ids: HashSet<ModuleId> = self.candidate_modules(module_filter).map(|m| m.id).collect();
        self.method_registry
            .iter()
            .filter(|((module, _), info)| {
                candidate_ids.contains(module)
                    && info.qualified_name.ends_with(dotted_name)
                    && param_signature.map(|sig| sig == info.param_types.as_slice()).unwrap_or(true)
            })
            .map(|((module, token), _)| (*module, *token))
            .collect()
    }

    /// Sequence point covering `il_offset` within one version of a method:
    /// the last point whose own offset is `<= il_offset`.
    pub fn frame_il_and_sequence_point(
        &mut self,
        module: ModuleId,
        token: MethodToken,
        il_offset: IlOffset,
        reader: &dyn SymbolReader,
    ) -> Option<(IlOffset, SequencePoint)> {
        let points = self.sequence_points_for(module, token, reader);
        points
            .iter()
            .filter(|sp| sp.il_offset <= il_offset)
            .max_by_key(|sp| sp.il_offset)
            .map(|sp| (sp.il_offset, sp.clone()))
    }

    /// Smallest non-hidden IL offset `>= from_il`; used by the entry
    /// breakpoint (C8) and Hot Reload rebinds. Falls back to `from_il` when
    /// no later user-code sequence point exists.
    pub fn next_user_code_il_offset(
        &mut self,
        module: ModuleId,
        token: MethodToken,
        _version: MethodVersion,
        from_il: IlOffset,
        reader: &dyn SymbolReader,
    ) -> IlOffset {
        let points = self.sequence_points_for(module, token, reader);
        points
            .iter()
            .map(|sp| sp.il_offset)
            .filter(|off| *off >= from_il)
            .min()
            .unwrap_or(from_il)
    }

    /// On case-insensitive filesystems, resolves `protocol_path` to the
    /// exact path stored by a loaded module's sequence points; falls back to
    /// the input unchanged when no case-insensitive match exists.
    pub fn source_full_path_case_fold(&self, protocol_path: &str) -> String {
        if self.source_to_modules.contains_key(protocol_path) {
            return protocol_path.to_string();
        }
        self.source_to_modules
            .keys()
            .find(|known| known.eq_ignore_ascii_case(protocol_path))
            .cloned()
            .unwrap_or_else(|| protocol_path.to_string())
    }
}

impl Module {
    pub fn check_invariant(&self) -> Result<(), Error> {
        if self.has_symbols && self.symbol_reader_handle.is_none() {
            return Err(Error::InvalidOperation(
                "module with has_symbols=true must own a symbol reader handle",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::symbols::reader::{MemoryLayout as Layout, RawSequencePoint};

    struct FakeReader {
        points: Vec<RawSequencePoint>,
        handle: SymbolReaderHandle,
    }

    impl SymbolReader for FakeReader {
        fn load_symbols_for_module(&self, _name: &str, _layout: &Layout, _read: &ReadMemoryFn) -> Option<SymbolReaderHandle> {
            Some(self.handle)
        }
        fn resolve_sequence_point(&self, _handle: SymbolReaderHandle, file: &str, line: u32) -> Vec<(MethodToken, IlOffset)> {
            self.points
                .iter()
                .filter(|sp| sp.document_path == file && sp.start_line >= line)
                .map(|sp| (MethodToken(sp.il_offset.0 / 0x100 + 1), sp.il_offset))
                .collect()
        }
        fn get_line_by_il_offset(&self, _h: SymbolReaderHandle, _t: MethodToken, _o: IlOffset) -> Option<(u32, String)> {
            None
        }
        fn get_step_ranges_from_ip(&self, _h: SymbolReaderHandle, _ip: u64, _t: MethodToken) -> Option<(IlOffset, IlOffset)> {
            None
        }
        fn get_sequence_points(&self, _handle: SymbolReaderHandle, token: MethodToken) -> Vec<RawSequencePoint> {
            self.points
                .iter()
                .filter(|sp| sp.il_offset.0 / 0x100 + 1 == token.0)
                .cloned()
                .collect()
        }
        fn get_local_variable_name_and_scope(&self, _h: SymbolReaderHandle, _t: MethodToken, _i: u32) -> Option<(String, IlOffset, IlOffset)> {
            None
        }
        fn parse_expression(&self, _text: &str, _type_name: &str) -> Result<Vec<u8>, String> {
            Err("not supported".into())
        }
        fn eval_expression(&self, _text: &str, _get_child: &dyn Fn(&str) -> Option<u64>) -> Result<(Vec<u8>, u32, u64), String> {
            Err("not supported".into())
        }
        fn dispose(&self, _handle: SymbolReaderHandle) {}
    }

    fn layout() -> Layout {
        Layout { pe_addr: 0, pe_size: 0, pdb_addr: 0, pdb_size: 0 }
    }

    #[test]
    fn test_module_invariant_requires_handle() {
        let module = Module {
            id: ModuleId(0),
            path: "a".into(),
            basename: "a".into(),
            base_addr: 0,
            size: 0,
            has_symbols: true,
            symbol_reader_handle: None,
            entry_point_token: None,
        };
        assert!(module.check_invariant().is_err());
    }

    #[test]
    fn test_resolve_breakpoint_multi_constructor() {
        let reader = FakeReader {
            handle: SymbolReaderHandle(1),
            points: vec![
                RawSequencePoint {
                    start_line: 10,
                    start_column: 1,
                    end_line: 10,
                    end_column: 20,
                    il_offset: IlOffset(0x000),
                    document_path: "Foo.cs".into(),
                },
                RawSequencePoint {
                    start_line: 10,
                    start_column: 1,
                    end_line: 10,
                    end_column: 20,
                    il_offset: IlOffset(0x100),
                    document_path: "Foo.cs".into(),
                },
                RawSequencePoint {
                    start_line: 10,
                    start_column: 1,
                    end_line: 10,
                    end_column: 20,
                    il_offset: IlOffset(0x200),
                    document_path: "Foo.cs".into(),
                },
            ],
        };

        let mut index = SymbolIndex::new();
        let read_memory: &ReadMemoryFn = &|_addr, _buf| false;
        index.try_load_module_symbols("Foo.dll", 0x1000, 0x2000, None, &reader, &layout(), read_memory);

        let resolved = index.resolve_breakpoint(None, "Foo.cs", 10, &reader);
        assert_eq!(resolved.len(), 3);
        assert!(resolved.iter().all(|r| r.start_line == 10));
    }

    #[test]
    fn test_resolve_function_suffix_and_signature() {
        let mut index = SymbolIndex::new();
        let reader = FakeReader { handle: SymbolReaderHandle(1), points: vec![] };
        let read_memory: &ReadMemoryFn = &|_addr, _buf| false;
        let module = index.try_load_module_symbols("Foo.dll", 0, 0, None, &reader, &layout(), read_memory);

        index.register_method(
            module,
            MethodToken(1),
            MethodInfo { qualified_name: "Foo.Bar.Baz".into(), param_types: vec!["int".into()] },
        );
        index.register_method(
            module,
            MethodToken(2),
            MethodInfo { qualified_name: "Foo.Bar.Baz".into(), param_types: vec!["string".into()] },
        );

        let all = index.resolve_function(None, "Bar.Baz", None);
        assert_eq!(all.len(), 2);

        let exact = index.resolve_function(None, "Bar.Baz", Some(&["int".to_string()]));
        assert_eq!(exact, vec![(module, MethodToken(1))]);
    }

    #[test]
    fn test_source_full_path_case_fold() {
        let mut index = SymbolIndex::new();
        index.source_to_modules.entry("Foo.cs".to_string()).or_default();
        assert_eq!(index.source_full_path_case_fold("foo.cs"), "Foo.cs");
        assert_eq!(index.source_full_path_case_fold("Unknown.cs"), "Unknown.cs");
    }
}
