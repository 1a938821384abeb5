//! Refcounted software-breakpoint patch table (spec §4.3 / §9 "reference
//! counted memory patches"). Generalizes `debugger/breakpoint.rs`'s single
//! enable/disable breakpoint (one saved byte, x86_64 only) into a multi-arch,
//! multi-owner table: several high-level breakpoints can share one physical
//! patch.

use crate::address::RelocatedAddress;
use crate::arch::{self, Arch, Word};
use crate::error::Error;
use nix::libc::c_void;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::ThreadId;

struct Entry {
    refcount: u32,
    saved_word: Word,
    is_thumb: bool,
}

/// A mutex that may be re-entered by the same OS thread, matching `mem_brk_mu`
/// in the design's lock lattice: add/remove callbacks can themselves patch
/// memory on the same call stack. Ownership is tracked by thread id; once a
/// thread holds it, nested `with` calls bypass the wait loop and access the
/// data directly, since exclusivity across threads is still enforced by the
/// owner check.
struct ReentrantCell<T> {
    owner: std::sync::Mutex<Option<ThreadId>>,
    depth: AtomicU32,
    inner: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for ReentrantCell<T> {}

impl<T> ReentrantCell<T> {
    fn new(inner: T) -> Self {
        Self {
            owner: std::sync::Mutex::new(None),
            depth: AtomicU32::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let this_thread = std::thread::current().id();
        {
            let mut owner = self.owner.lock().unwrap();
            if *owner != Some(this_thread) {
                while owner.is_some() {
                    drop(owner);
                    std::thread::yield_now();
                    owner = self.owner.lock().unwrap();
                }
                *owner = Some(this_thread);
            }
        }
        self.depth.fetch_add(1, Ordering::SeqCst);

        // Safe: only the thread currently recorded in `owner` ever reaches
        // here, and that assignment is exclusive across threads.
        let result = f(unsafe { &mut *self.inner.get() });

        if self.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.owner.lock().unwrap() = None;
        }
        result
    }
}

/// Table of refcounted software-breakpoint patches, one per process.
pub struct MemBreakpoints {
    pid: Pid,
    arch: Arch,
    table: ReentrantCell<HashMap<RelocatedAddress, Entry>>,
}

impl MemBreakpoints {
    pub fn new(pid: Pid, arch: Arch) -> Self {
        Self {
            pid,
            arch,
            table: ReentrantCell::new(HashMap::new()),
        }
    }

    fn read_word(&self, addr: RelocatedAddress) -> Result<Word, Error> {
        let data = ptrace::read(self.pid, addr.as_usize() as *mut c_void)
            .map_err(Error::Ptrace)?;
        Ok(data as u64 as Word)
    }

    fn write_word(&self, addr: RelocatedAddress, word: Word) -> Result<(), Error> {
        unsafe {
            ptrace::write(self.pid, addr.as_usize() as *mut c_void, word as i64 as *mut c_void)
                .map_err(Error::Ptrace)
        }
    }

    /// Patch `addr` with the architecture's breakpoint opcode, or bump the
    /// refcount if already patched. `stop_all_threads_cb` is invoked only on
    /// the 0 -> 1 transition, mirroring spec §4.3.
    pub fn add(
        &self,
        addr: RelocatedAddress,
        is_thumb: bool,
        stop_all_threads_cb: impl FnOnce(),
    ) -> Result<(), Error> {
        let needs_patch = self.table.with(|t| match t.get_mut(&addr) {
            Some(e) => {
                e.refcount += 1;
                false
            }
            None => true,
        });

        if needs_patch {
            stop_all_threads_cb();
            let original = self.read_word(addr)?;
            let patched = arch::encode_brk_opcode(self.arch, original, is_thumb);
            self.write_word(addr, patched)?;
            self.table.with(|t| {
                t.insert(
                    addr,
                    Entry {
                        refcount: 1,
                        saved_word: original,
                        is_thumb,
                    },
                );
            });
        }
        Ok(())
    }

    /// Decrement the refcount; restore the saved word on reaching zero.
    /// `fix_all_threads_cb` steps back any thread whose PC indicates it just
    /// stopped on this breakpoint, before the opcode is actually removed.
    pub fn remove(
        &self,
        addr: RelocatedAddress,
        stop_all_threads_cb: impl FnOnce(),
        fix_all_threads_cb: impl FnOnce(RelocatedAddress),
    ) -> Result<(), Error> {
        let should_restore = self.table.with(|t| match t.get_mut(&addr) {
            Some(e) if e.refcount > 1 => {
                e.refcount -= 1;
                None
            }
            Some(_) => Some(()),
            None => None,
        });

        if should_restore.is_some() {
            stop_all_threads_cb();
            fix_all_threads_cb(addr);
            let saved = self.table.with(|t| t.remove(&addr).map(|e| e.saved_word));
            if let Some(saved) = saved {
                let current = self.read_word(addr)?;
                let restored = arch::restore_opcode(self.arch, current, saved);
                self.write_word(addr, restored)?;
            }
        }
        Ok(())
    }

    /// Restore the saved word, run `single_step_cb`, then re-patch. Used when
    /// a thread stopped directly on a live breakpoint must advance past it.
    pub fn step_over_brk(
        &self,
        addr: RelocatedAddress,
        single_step_cb: impl FnOnce() -> Result<(), Error>,
    ) -> Result<(), Error> {
        let (saved, is_thumb) = self
            .table
            .with(|t| t.get(&addr).map(|e| (e.saved_word, e.is_thumb)))
            .ok_or(Error::UnknownAddress)?;

        let current = self.read_word(addr)?;
        let restored = arch::restore_opcode(self.arch, current, saved);
        self.write_word(addr, restored)?;

        single_step_cb()?;

        let current = self.read_word(addr)?;
        let patched = arch::encode_brk_opcode(self.arch, current, is_thumb);
        self.write_word(addr, patched)
    }

    pub fn is_breakpoint(&self, addr: RelocatedAddress) -> bool {
        self.table.with(|t| t.contains_key(&addr))
    }

    /// Drop every entry whose address falls in `[start, end)`, e.g. on shared
    /// library unload. Does not restore memory (the mapping is gone).
    pub fn unload_module(&self, start: RelocatedAddress, end: RelocatedAddress) {
        self.table.with(|t| {
            t.retain(|addr, _| !(*addr >= start && *addr < end));
        });
    }

    pub fn saved_word(&self, addr: RelocatedAddress) -> Option<Word> {
        self.table.with(|t| t.get(&addr).map(|e| e.saved_word))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reentrant_cell_allows_same_thread_reentry() {
        let cell = ReentrantCell::new(0u32);
        cell.with(|v| {
            *v += 1;
            cell.with(|inner| {
                *inner += 1;
            });
        });
        cell.with(|v| assert_eq!(*v, 2));
    }
}
