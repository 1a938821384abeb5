//! Managed Function Breakpoints (C7): qualified name (± parameter signature)
//! → all matching `(module, method)` resolutions, Hot-Reload aware. Unlike
//! C6 there is no one-active rule — every resolution is activated. Grounded
//! on `debugger/breakpoint.rs`'s enable/disable shape, reused verbatim for
//! "create and activate every resolution" rather than choosing one.

use crate::address::{MethodToken, MethodVersion};
use crate::breakpoints::managed_line::{RuntimeBreakpointApi, RuntimeHandle};
use crate::symbols::{ModuleId, SymbolIndex};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct FuncBreakpointRequest {
    pub module_filter: Option<String>,
    pub name: String,
    pub param_signature: Option<Vec<String>>,
    pub condition: Option<String>,
    pub enabled: bool,
}

#[derive(Clone, Debug)]
pub struct ResolvedFuncEntry {
    pub module: ModuleId,
    pub method_token: MethodToken,
    pub method_version: MethodVersion,
    pub native_handle: RuntimeHandle,
}

#[derive(Debug)]
pub struct ManagedFuncBreakpoint {
    pub id: u32,
    pub module_filter: Option<String>,
    pub name: String,
    pub param_signature: Option<Vec<String>>,
    pub condition: Option<String>,
    pub enabled: bool,
    pub resolved: Vec<ResolvedFuncEntry>,
}

#[derive(Clone, Debug)]
pub struct BreakpointReport {
    pub id: u32,
    pub verified: bool,
}

impl From<&ManagedFuncBreakpoint> for BreakpointReport {
    fn from(bp: &ManagedFuncBreakpoint) -> Self {
        BreakpointReport { id: bp.id, verified: !bp.resolved.is_empty() }
    }
}

#[derive(Default)]
pub struct ManagedFuncBreakpoints {
    next_id: u32,
    breakpoints: HashMap<u32, ManagedFuncBreakpoint>,
}

impl ManagedFuncBreakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<&ManagedFuncBreakpoint> {
        self.breakpoints.get(&id)
    }

    fn resolve_one(
        &self,
        req: &FuncBreakpointRequest,
        index: &SymbolIndex,
        runtime: &dyn RuntimeBreakpointApi,
    ) -> Vec<ResolvedFuncEntry> {
        let canonical_sig: Option<Vec<String>> = req
            .param_signature
            .as_ref()
            .map(|sig| sig.iter().map(|t| canonicalize_type_name(t)).collect());

        index
            .resolve_function(req.module_filter.as_deref(), &req.name, canonical_sig.as_deref())
            .into_iter()
            .map(|(module, token)| ResolvedFuncEntry {
                module,
                method_token: token,
                method_version: MethodVersion(1),
                native_handle: runtime.create_function_breakpoint(module, token, 0.into()),
            })
            .collect()
    }

    pub fn set_func_breakpoints(
        &mut self,
        requests: &[FuncBreakpointRequest],
        index: &SymbolIndex,
        runtime: &dyn RuntimeBreakpointApi,
    ) -> Vec<BreakpointReport> {
        for bp in self.breakpoints.values() {
            for entry in &bp.resolved {
                runtime.activate(entry.native_handle, false);
            }
        }
        self.breakpoints.clear();

        let mut reports = Vec::with_capacity(requests.len());
        for req in requests {
            let id = self.next_id;
            self.next_id += 1;
            let resolved = self.resolve_one(req, index, runtime);
            for entry in &resolved {
                runtime.activate(entry.native_handle, req.enabled);
            }
            self.breakpoints.insert(
                id,
                ManagedFuncBreakpoint {
                    id,
                    module_filter: req.module_filter.clone(),
                    name: req.name.clone(),
                    param_signature: req.param_signature.clone(),
                    condition: req.condition.clone(),
                    enabled: req.enabled,
                    resolved,
                },
            );
            reports.push(BreakpointReport::from(&self.breakpoints[&id]));
        }
        reports
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool, runtime: &dyn RuntimeBreakpointApi) -> bool {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        bp.enabled = enabled;
        for entry in &bp.resolved {
            runtime.activate(entry.native_handle, enabled);
        }
        true
    }

    pub fn set_all_enabled(&mut self, enabled: bool, runtime: &dyn RuntimeBreakpointApi) {
        for bp in self.breakpoints.values_mut() {
            bp.enabled = enabled;
            for entry in &bp.resolved {
                runtime.activate(entry.native_handle, enabled);
            }
        }
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
    }

    /// Hot Reload may add new method versions or previously-missing matches;
    /// re-resolve every breakpoint that is still unresolved (or whose module
    /// filter might now match a freshly loaded module) and activate any
    /// fresh matches. Returns ids that gained at least one new resolution.
    pub fn re_resolve(&mut self, index: &SymbolIndex, runtime: &dyn RuntimeBreakpointApi) -> Vec<u32> {
        let ids: Vec<u32> = self.breakpoints.keys().copied().collect();
        let mut changed = Vec::new();
        for id in ids {
            let req = {
                let bp = &self.breakpoints[&id];
                FuncBreakpointRequest {
                    module_filter: bp.module_filter.clone(),
                    name: bp.name.clone(),
                    param_signature: bp.param_signature.clone(),
                    condition: bp.condition.clone(),
                    enabled: bp.enabled,
                }
            };
            let known: std::collections::HashSet<(ModuleId, MethodToken)> =
                self.breakpoints[&id].resolved.iter().map(|e| (e.module, e.method_token)).collect();
            let fresh: Vec<ResolvedFuncEntry> = self
                .resolve_one(&req, index, runtime)
                .into_iter()
                .filter(|e| !known.contains(&(e.module, e.method_token)))
                .collect();
            if !fresh.is_empty() {
                for entry in &fresh {
                    runtime.activate(entry.native_handle, req.enabled);
                }
                self.breakpoints.get_mut(&id).unwrap().resolved.extend(fresh);
                changed.push(id);
            }
        }
        changed
    }
}

/// CLR↔C# canonical primitive renaming table (spec §4.7); anything else
/// passes through with `+`→`.` nesting and, for generic types, the arity
/// suffix rewritten as `<T, T, …>` — concrete type-argument substitution
/// from the enclosing type context is not modeled, since no caller of this
/// module currently has that context available.
pub fn canonicalize_type_name(name: &str) -> String {
    if let Some(primitive) = clr_primitive_to_csharp(name) {
        return primitive.to_string();
    }
    strip_generic_arity(&name.replace('+', "."))
}

fn clr_primitive_to_csharp(name: &str) -> Option<&'static str> {
    Some(match name {
        "System.Boolean" => "bool",
        "System.Byte" => "byte",
        "System.SByte" => "sbyte",
        "System.Int16" => "short",
        "System.UInt16" => "ushort",
        "System.Int32" => "int",
        "System.UInt32" => "uint",
        "System.Int64" => "long",
        "System.UInt64" => "ulong",
        "System.Single" => "float",
        "System.Double" => "double",
        "System.Decimal" => "decimal",
        "System.Char" => "char",
        "System.String" => "string",
        "System.Object" => "object",
        "System.Void" => "void",
        _ => return None,
    })
}

fn strip_generic_arity(name: &str) -> String {
    let Some(pos) = name.find('`') else {
        return name.to_string();
    };
    let (base, rest) = name.split_at(pos);
    let digits: String = rest[1..].chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<usize>() {
        Ok(n) if n > 0 => format!("{base}<{}>", vec!["T"; n].join(", ")),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonicalize_primitive() {
        assert_eq!(canonicalize_type_name("System.Int32"), "int");
        assert_eq!(canonicalize_type_name("System.UInt16"), "ushort");
    }

    #[test]
    fn test_canonicalize_nested_type_replaces_plus() {
        assert_eq!(canonicalize_type_name("Outer+Inner"), "Outer.Inner");
    }

    #[test]
    fn test_canonicalize_generic_arity() {
        assert_eq!(canonicalize_type_name("System.Collections.Generic.List`1"), "System.Collections.Generic.List<T>");
    }

    #[test]
    fn test_non_primitive_passthrough() {
        assert_eq!(canonicalize_type_name("MyNamespace.Foo"), "MyNamespace.Foo");
    }
}
