//! Dynamic-linker rendezvous tracking (spec §4.4). Locates `DT_DEBUG` in the
//! executable's `.dynamic` section, reads `r_debug`, and walks `r_map` to
//! enumerate loaded libraries. Extends `debugee/dwarf/rendezvous.rs`'s
//! one-shot link-map walk with `r_state` transition tracking so load/unload
//! events fire at the correct moment (the next `RT_CONSISTENT` after a
//! non-consistent state).

use crate::address::RelocatedAddress;
use nix::libc;
use nix::unistd::Pid;
use object::elf::DT_DEBUG;
use proc_maps::MapRange;
use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error(".dynamic section not found")]
    DynamicSectNotFound,
    #[error("read from remote process: {0}")]
    PtraceRead(#[from] nix::Error),
    #[error("rendezvous not found")]
    NotFound,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RState {
    Consistent,
    Add,
    Delete,
}

impl RState {
    fn from_raw(v: i32) -> Self {
        match v {
            1 => RState::Add,
            2 => RState::Delete,
            _ => RState::Consistent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkMap {
    pub addr: RelocatedAddress,
    pub name: String,
    /// Lowest/highest mapped VAS addresses for this library's segments, per
    /// `/proc/<pid>/maps`. `start_addr == end_addr` when no mapping for
    /// `name` could be found (e.g. the main executable's own `link_map`
    /// entry sometimes carries an empty name resolved elsewhere).
    pub start_addr: RelocatedAddress,
    pub end_addr: RelocatedAddress,
}

/// Diff result produced when the tracker observes a fresh `RT_CONSISTENT`
/// following a non-consistent state: which libraries appeared or vanished
/// from the link-map chain since the last consistent snapshot.
#[derive(Debug, Default)]
pub struct LibraryDiff {
    pub loaded: Vec<LinkMap>,
    pub unloaded: Vec<LinkMap>,
}

pub struct Rendezvous {
    pid: Pid,
    inner: ffi::r_debug,
    /// Address `r_debug` was found at in the debuggee's address space, kept
    /// so `refresh_state` can re-read the live struct on every hit.
    r_debug_addr: usize,
    last_state: RState,
    /// Snapshot of the link-map chain as of the last `RT_CONSISTENT`,
    /// keyed by name for cheap set-diffing.
    known: HashMap<String, LinkMap>,
}

impl Rendezvous {
    pub fn new(
        proc_pid: Pid,
        mapping_offset: usize,
        sections: &HashMap<String, u64>,
    ) -> Result<Self, RendezvousError> {
        let dyn_sect_addr = sections
            .get(".dynamic")
            .copied()
            .ok_or(RendezvousError::DynamicSectNotFound)? as usize;

        let mut addr = dyn_sect_addr + mapping_offset;
        let mut val = ffi::read_val::<usize>(proc_pid, &mut addr)?;

        while val != 0 {
            if val == DT_DEBUG as usize {
                let rend_addr = ffi::read_val::<usize>(proc_pid, &mut addr)?;
                let rendezvous = ffi::read_val::<ffi::r_debug>(proc_pid, &mut { rend_addr })?;
                let mut this = Self {
                    pid: proc_pid,
                    inner: rendezvous,
                    r_debug_addr: rend_addr,
                    last_state: RState::from_raw(rendezvous.r_state),
                    known: HashMap::new(),
                };
                let initial = this.link_maps().unwrap_or_default();
                this.known = initial.into_iter().map(|lm| (lm.name.clone(), lm)).collect();
                return Ok(this);
            }
            val = ffi::read_val::<usize>(proc_pid, &mut addr)?;
        }

        Err(RendezvousError::NotFound)
    }

    pub fn link_map_main(&self) -> RelocatedAddress {
        RelocatedAddress::from(self.inner.link_map as usize)
    }

    pub fn link_maps(&self) -> Result<Vec<LinkMap>, RendezvousError> {
        let mut result = vec![];
        let mut next_link_map_addr = usize::from(self.link_map_main()) as *const libc::c_void;

        // Best-effort: a failed proc_maps read (e.g. the process just exited)
        // shouldn't fail the whole link-map walk, only leave ranges unresolved.
        let proc_maps: Vec<MapRange> = proc_maps::get_process_maps(self.pid.as_raw()).unwrap_or_default();

        while !next_link_map_addr.is_null() {
            let lm = ffi::read_val::<ffi::link_map>(self.pid, &mut (next_link_map_addr as usize))?;
            let name = ffi::read_string(self.pid, lm.l_name as usize)?;

            // vDSO and the other anonymous entries have an empty name; ignore.
            if !name.is_empty() {
                let (start_addr, end_addr) = resolve_range(&proc_maps, &name);
                result.push(LinkMap {
                    addr: RelocatedAddress::from(next_link_map_addr as usize),
                    name,
                    start_addr,
                    end_addr,
                });
            }
            next_link_map_addr = lm.l_next;
        }

        Ok(result)
    }

    /// Address of the reporting routine the dynamic linker calls on every
    /// mapping change; this is where C4 installs its native breakpoint.
    pub fn r_brk(&self) -> RelocatedAddress {
        RelocatedAddress::from(self.inner.r_brk)
    }

    /// Re-read the whole `r_debug` struct from the live process, so
    /// `link_map` stays in sync with any change alongside `r_state`. Call on
    /// every `r_brk` hit.
    fn refresh_state(&mut self) -> Result<RState, RendezvousError> {
        self.inner = ffi::read_val::<ffi::r_debug>(self.pid, &mut { self.r_debug_addr })?;
        Ok(RState::from_raw(self.inner.r_state))
    }

    /// Called on every `r_brk` hit. Returns `Some(diff)` only when this call
    /// observed the transition into a fresh `RT_CONSISTENT` from a
    /// non-consistent state — the moment the new library set is trustworthy.
    pub fn on_rendezvous_hit(&mut self) -> Result<Option<LibraryDiff>, RendezvousError> {
        let prior = self.last_state;
        let now = self.refresh_state()?;
        self.last_state = now;

        if now != RState::Consistent || prior == RState::Consistent {
            return Ok(None);
        }

        let current = self.link_maps()?;
        let current_names: HashSet<&str> = current.iter().map(|lm| lm.name.as_str()).collect();

        let unloaded: Vec<LinkMap> = self
            .known
            .values()
            .filter(|lm| !current_names.contains(lm.name.as_str()))
            .cloned()
            .collect();
        let loaded: Vec<LinkMap> = current
            .iter()
            .filter(|lm| !self.known.contains_key(&lm.name))
            .cloned()
            .collect();

        self.known = current.into_iter().map(|lm| (lm.name.clone(), lm)).collect();

        Ok(Some(LibraryDiff { loaded, unloaded }))
    }
}

/// Resolve the `[start, end)` virtual-address range a library's segments
/// occupy, by cross-referencing its `link_map` name against the process's
/// current `/proc/<pid>/maps` entries. `l_name` may be a bare soname or a
/// full path depending on how the dynamic linker recorded it, so entries are
/// matched by filename rather than full-path equality.
fn resolve_range(proc_maps: &[MapRange], name: &str) -> (RelocatedAddress, RelocatedAddress) {
    let segments: Vec<(Option<&std::path::Path>, usize, usize)> = proc_maps
        .iter()
        .map(|map| (map.filename(), map.start(), map.size()))
        .collect();
    resolve_range_from_segments(&segments, name)
}

/// Pure matching logic behind [`resolve_range`], taking plain
/// `(path, start, size)` tuples so it can be exercised without constructing
/// real `proc_maps::MapRange` values (which have no public constructor).
fn resolve_range_from_segments(
    segments: &[(Option<&std::path::Path>, usize, usize)],
    name: &str,
) -> (RelocatedAddress, RelocatedAddress) {
    let base = std::path::Path::new(name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(name);

    let matches: Vec<&(Option<&std::path::Path>, usize, usize)> = segments
        .iter()
        .filter(|(path, _, _)| {
            path.and_then(|p| p.file_name())
                .and_then(|f| f.to_str())
                == Some(base)
        })
        .collect();

    let Some(lower) = matches.iter().min_by_key(|(_, start, _)| *start) else {
        return (RelocatedAddress::from(0usize), RelocatedAddress::from(0usize));
    };
    let higher = matches
        .iter()
        .max_by_key(|(_, start, _)| *start)
        .expect("at least one mapping must exist alongside lower");

    (
        RelocatedAddress::from(lower.1),
        RelocatedAddress::from(higher.1 + higher.2),
    )
}

mod ffi {
    #![allow(non_camel_case_types)]

    use nix::libc;
    use nix::sys::uio;
    use nix::sys::uio::RemoteIoVec;
    use nix::unistd::Pid;
    use std::io::IoSliceMut;
    use std::mem;
    use std::str::from_utf8;

    #[repr(C)]
    #[derive(Clone, Copy, Debug)]
    pub(super) struct r_debug {
        pub(super) r_version: i32,
        pub(super) link_map: *const libc::c_void,
        pub(super) r_brk: usize,
        /// `RT_CONSISTENT` (0) / `RT_ADD` (1) / `RT_DELETE` (2).
        pub(super) r_state: i32,
        pub(super) r_ldbase: usize,
    }

    #[derive(Debug, Clone, Copy)]
    #[repr(C)]
    pub(super) struct link_map {
        pub(super) l_addr: *mut libc::c_void,
        pub(super) l_name: *const libc::c_char,
        pub(super) l_ld: *mut libc::c_void,
        pub(super) l_next: *mut libc::c_void,
        pub(super) l_prev: *mut libc::c_void,
    }

    pub(super) fn read_val<T: Copy>(pid: Pid, addr: &mut usize) -> nix::Result<T> {
        let size = mem::size_of::<T>();
        let mut buff = vec![0u8; size];
        let local_iov = IoSliceMut::new(buff.as_mut_slice());
        let remote_iov = RemoteIoVec {
            base: *addr,
            len: size,
        };
        let local_iov_slice = &mut [local_iov];

        uio::process_vm_readv(pid, local_iov_slice.as_mut_slice(), &[remote_iov])?;

        let ptr = local_iov_slice[0].as_ptr();
        let val = unsafe { *(ptr.cast::<T>()) };

        *addr += size;
        Ok(val)
    }

    pub(super) fn read_string(pid: Pid, mut addr: usize) -> nix::Result<String> {
        let mut buff = vec![];
        'outer: loop {
            let word = read_val::<usize>(pid, &mut addr)?;
            for b in word.to_ne_bytes() {
                if b == 0 {
                    break 'outer;
                }
                buff.push(b);
            }
        }
        Ok(from_utf8(&buff).unwrap_or_default().to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rstate_from_raw() {
        assert_eq!(RState::from_raw(0), RState::Consistent);
        assert_eq!(RState::from_raw(1), RState::Add);
        assert_eq!(RState::from_raw(2), RState::Delete);
    }

    #[test]
    fn test_resolve_range_empty_maps_yields_zero_range() {
        let (start, end) = resolve_range_from_segments(&[], "libc.so.6");
        assert_eq!(start, RelocatedAddress::from(0usize));
        assert_eq!(end, RelocatedAddress::from(0usize));
    }

    #[test]
    fn test_resolve_range_matches_by_basename_not_full_path() {
        // `l_name` may carry a bare soname while /proc/.../maps always has
        // the full resolved path; matching must fall back to basename.
        let path = std::path::Path::new("/usr/lib/libfoo.so.1");
        let segments = [(Some(path), 0x1000usize, 0x2000usize)];
        let (start, end) = resolve_range_from_segments(&segments, "libfoo.so.1");
        assert_eq!(start, RelocatedAddress::from(0x1000usize));
        assert_eq!(end, RelocatedAddress::from(0x3000usize));
    }

    #[test]
    fn test_resolve_range_spans_multiple_segments() {
        let path = std::path::Path::new("/usr/lib/libfoo.so.1");
        let segments = [
            (Some(path), 0x2000usize, 0x1000usize),
            (Some(path), 0x1000usize, 0x1000usize),
        ];
        let (start, end) = resolve_range_from_segments(&segments, "/some/other/prefix/libfoo.so.1");
        assert_eq!(start, RelocatedAddress::from(0x1000usize));
        assert_eq!(end, RelocatedAddress::from(0x3000usize));
    }
}
