//! Native Line Breakpoints (C5): source+line → resolved address, possibly
//! pending until a matching library loads. Generalizes `debugger/breakpoint.rs`'s
//! single `Breakpoint` (one address, no source-line bookkeeping) with the
//! resolve/pending/re-resolve lifecycle of spec §4.5, grounded on that same
//! file's enable/disable-via-`MemBreakpoints` shape.

use crate::address::RelocatedAddress;
use crate::error::Error;
use crate::native::mem_breakpoints::MemBreakpoints;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug)]
pub struct LineBreakpointRequest {
    pub line: u32,
    pub condition: Option<String>,
    pub enabled: bool,
}

#[derive(Debug)]
pub struct NativeLineBreakpoint {
    pub id: u32,
    pub module_name: Option<String>,
    pub user_source: String,
    pub user_line: u32,
    pub condition: Option<String>,
    pub resolved_addr: Option<RelocatedAddress>,
    pub is_thumb: bool,
    pub enabled: bool,
    pub hit_count: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct BreakpointReport {
    pub id: u32,
    pub line: u32,
    pub verified: bool,
    pub message: Option<String>,
}

impl From<&NativeLineBreakpoint> for BreakpointReport {
    fn from(bp: &NativeLineBreakpoint) -> Self {
        BreakpointReport {
            id: bp.id,
            line: bp.user_line,
            verified: bp.resolved_addr.is_some(),
            message: (bp.resolved_addr.is_none()).then(|| "pending: no loaded library contains this line yet".to_string()),
        }
    }
}

/// Resolves a source line to a debuggee address; implemented by whatever
/// aggregates the loaded libraries (C2 instances), since one line breakpoint
/// may match a library not yet loaded at request time.
pub trait AddressResolver {
    fn addr_for_source_line(&self, source: &str, line: u32) -> Option<(RelocatedAddress, bool)>;
}

#[derive(Default)]
pub struct NativeLineBreakpoints {
    next_id: u32,
    resolved: HashMap<RelocatedAddress, Vec<u32>>,
    mapping: HashMap<String, Vec<u32>>,
    records: HashMap<u32, NativeLineBreakpoint>,
}

impl NativeLineBreakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<&NativeLineBreakpoint> {
        self.records.get(&id)
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn try_resolve_and_patch(
        &mut self,
        id: u32,
        resolver: &dyn AddressResolver,
        mem: &MemBreakpoints,
        stop_all_threads_cb: &dyn Fn(),
    ) -> Result<bool, Error> {
        let (source, line) = {
            let bp = &self.records[&id];
            (bp.user_source.clone(), bp.user_line)
        };
        let Some((addr, is_thumb)) = resolver.addr_for_source_line(&source, line) else {
            return Ok(false);
        };
        mem.add(addr, is_thumb, || stop_all_threads_cb())?;
        let bp = self.records.get_mut(&id).unwrap();
        bp.resolved_addr = Some(addr);
        bp.is_thumb = is_thumb;
        self.resolved.entry(addr).or_default().push(id);
        Ok(true)
    }

    /// Steps 1-3 of spec §4.5: drop mappings no longer requested, reuse ids
    /// for lines still requested, allocate and resolve fresh ones.
    pub fn set_line_breakpoints(
        &mut self,
        source: &str,
        requests: &[LineBreakpointRequest],
        resolver: &dyn AddressResolver,
        mem: &MemBreakpoints,
        stop_all_threads_cb: &dyn Fn(),
        fix_all_threads_cb: &dyn Fn(RelocatedAddress),
    ) -> Result<Vec<BreakpointReport>, Error> {
        let previous_ids = self.mapping.remove(source).unwrap_or_default();
        let mut previous_by_line: HashMap<u32, u32> = HashMap::new();
        for id in previous_ids {
            if let Some(bp) = self.records.get(&id) {
                previous_by_line.insert(bp.user_line, id);
            }
        }

        let requested_lines: std::collections::HashSet<u32> = requests.iter().map(|r| r.line).collect();
        let stale_ids: Vec<u32> = previous_by_line
            .iter()
            .filter(|(line, _)| !requested_lines.contains(line))
            .map(|(_, id)| *id)
            .collect();
        for id in stale_ids {
            self.drop_record(id, mem, stop_all_threads_cb, fix_all_threads_cb)?;
        }

        let mut new_ids = Vec::with_capacity(requests.len());
        for req in requests {
            let id = if let Some(&existing) = previous_by_line.get(&req.line) {
                let bp = self.records.get_mut(&existing).unwrap();
                bp.condition = req.condition.clone();
                bp.enabled = req.enabled;
                existing
            } else {
                let id = self.alloc_id();
                self.records.insert(
                    id,
                    NativeLineBreakpoint {
                        id,
                        module_name: None,
                        user_source: source.to_string(),
                        user_line: req.line,
                        condition: req.condition.clone(),
                        resolved_addr: None,
                        is_thumb: false,
                        enabled: req.enabled,
                        hit_count: AtomicU64::new(0),
                    },
                );
                self.try_resolve_and_patch(id, resolver, mem, stop_all_threads_cb)?;
                id
            };
            new_ids.push(id);
        }

        self.mapping.insert(source.to_string(), new_ids.clone());
        Ok(new_ids.iter().map(|id| BreakpointReport::from(&self.records[id])).collect())
    }

    fn drop_record(
        &mut self,
        id: u32,
        mem: &MemBreakpoints,
        stop_all_threads_cb: &dyn Fn(),
        fix_all_threads_cb: &dyn Fn(RelocatedAddress),
    ) -> Result<(), Error> {
        if let Some(bp) = self.records.remove(&id) {
            if let Some(addr) = bp.resolved_addr {
                if let Some(ids) = self.resolved.get_mut(&addr) {
                    ids.retain(|i| *i != id);
                }
                mem.remove(addr, || stop_all_threads_cb(), |a| fix_all_threads_cb(a))?;
            }
        }
        Ok(())
    }

    /// Re-resolve every pending record against a newly loaded library; return
    /// the ids that became verified so the caller can emit `BreakpointChanged`.
    pub fn load_module(
        &mut self,
        resolver: &dyn AddressResolver,
        mem: &MemBreakpoints,
        stop_all_threads_cb: &dyn Fn(),
    ) -> Result<Vec<u32>, Error> {
        let pending: Vec<u32> = self
            .records
            .values()
            .filter(|bp| bp.resolved_addr.is_none())
            .map(|bp| bp.id)
            .collect();

        let mut became_verified = Vec::new();
        for id in pending {
            if self.try_resolve_and_patch(id, resolver, mem, stop_all_threads_cb)? {
                became_verified.push(id);
            }
        }
        Ok(became_verified)
    }

    /// Drop every resolved record whose address falls in `[start, end)`;
    /// return the ids that became unverified. Memory itself is wiped via the
    /// caller's separate `mem.unload_module` call (the mapping is gone, no
    /// restore needed).
    pub fn unload_module(&mut self, start: RelocatedAddress, end: RelocatedAddress) -> Vec<u32> {
        let addrs: Vec<RelocatedAddress> = self.resolved.keys().filter(|a| **a >= start && **a < end).copied().collect();
        let mut changed = Vec::new();
        for addr in addrs {
            if let Some(ids) = self.resolved.remove(&addr) {
                for id in ids {
                    if let Some(bp) = self.records.get_mut(&id) {
                        bp.resolved_addr = None;
                        changed.push(id);
                    }
                }
            }
        }
        changed
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> bool {
        match self.records.get_mut(&id) {
            Some(bp) => {
                bp.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_all_enabled(&mut self, enabled: bool) {
        for bp in self.records.values_mut() {
            bp.enabled = enabled;
        }
    }

    /// Drops every record and its memory patch; used by `delete_all_breakpoints`.
    pub fn clear_all(
        &mut self,
        mem: &MemBreakpoints,
        stop_all_threads_cb: &dyn Fn(),
        fix_all_threads_cb: &dyn Fn(RelocatedAddress),
    ) -> Result<(), Error> {
        let ids: Vec<u32> = self.records.keys().copied().collect();
        for id in ids {
            self.drop_record(id, mem, stop_all_threads_cb, fix_all_threads_cb)?;
        }
        self.mapping.clear();
        Ok(())
    }

    /// Called by C9 on a native `SIGTRAP`; increments hit counts atomically
    /// for every high-level breakpoint sharing this address.
    pub fn is_line_breakpoint(&self, addr: RelocatedAddress) -> Option<Vec<BreakpointReport>> {
        let ids = self.resolved.get(&addr)?;
        if ids.is_empty() {
            return None;
        }
        for id in ids {
            if let Some(bp) = self.records.get(id) {
                bp.hit_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        Some(ids.iter().filter_map(|id| self.records.get(id)).map(BreakpointReport::from).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use nix::unistd::Pid;

    struct FixedResolver(Option<(RelocatedAddress, bool)>);
    impl AddressResolver for FixedResolver {
        fn addr_for_source_line(&self, _source: &str, _line: u32) -> Option<(RelocatedAddress, bool)> {
            self.0
        }
    }

    fn mem() -> MemBreakpoints {
        MemBreakpoints::new(Pid::from_raw(0), Arch::X86_64)
    }

    #[test]
    fn test_pending_then_resolves_on_reuse() {
        let mut bps = NativeLineBreakpoints::new();
        let resolver = FixedResolver(None);
        let reports = bps
            .set_line_breakpoints(
                "Foo.cs",
                &[LineBreakpointRequest { line: 10, condition: None, enabled: true }],
                &resolver,
                &mem(),
                &|| {},
                &|_| {},
            )
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].verified);
    }

    #[test]
    fn test_idempotent_ids_preserved_across_calls() {
        let mut bps = NativeLineBreakpoints::new();
        let resolver = FixedResolver(None);
        let requests = vec![LineBreakpointRequest { line: 10, condition: None, enabled: true }];
        let first = bps
            .set_line_breakpoints("Foo.cs", &requests, &resolver, &mem(), &|| {}, &|_| {})
            .unwrap();
        let second = bps
            .set_line_breakpoints("Foo.cs", &requests, &resolver, &mem(), &|| {}, &|_| {})
            .unwrap();
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_is_line_breakpoint_increments_hit_count() {
        // Exercises only the bookkeeping, not `MemBreakpoints`'s real ptrace
        // I/O: a resolved record is inserted directly, as it would be after
        // a successful `try_resolve_and_patch` against a live process.
        let mut bps = NativeLineBreakpoints::new();
        let addr = RelocatedAddress::from(0x4000usize);
        let id = bps.alloc_id();
        bps.records.insert(
            id,
            NativeLineBreakpoint {
                id,
                module_name: None,
                user_source: "Foo.cs".into(),
                user_line: 10,
                condition: None,
                resolved_addr: Some(addr),
                is_thumb: false,
                enabled: true,
                hit_count: AtomicU64::new(0),
            },
        );
        bps.resolved.insert(addr, vec![id]);

        let hit = bps.is_line_breakpoint(addr);
        assert!(hit.is_some());
        assert_eq!(bps.records[&id].hit_count.load(Ordering::SeqCst), 1);
    }
}
