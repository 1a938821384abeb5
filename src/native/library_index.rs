//! Interop Library Index (spec §4.2): per-shared-library ELF/DWARF state used
//! to resolve native addresses to symbols and source lines, and to find
//! addresses for native line breakpoints. Generalizes `debugee/debugee/registry.rs`'s
//! `DwarfRegistry` (one debug-info set for the debugged Rust binary) to "one
//! entry per loaded native library", with the lazy-open/fallback-path search
//! order spec'd in §4.2.

use crate::address::{GlobalAddress, RelocatedAddress};
use crate::config::Config;
use crate::error::Error;
use gimli::{EndianArcSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type GimliReader = EndianArcSlice<RunTimeEndian>;
pub type Dwarf = gimli::Dwarf<GimliReader>;

/// One entry of the sorted-by-address procedure table (`.symtab`/`.dynsym`
/// function symbols), the fallback source for `data_for_addr` when no DWARF
/// line entry covers the address.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub start: GlobalAddress,
    pub size: u64,
    pub mangled_name: String,
}

/// A disjoint `[start, end)` Thumb-code region (ARM32 only), derived from
/// `$t`/`$a`/`$d` mapping symbols.
#[derive(Debug, Clone, Copy)]
pub struct ThumbRegion {
    pub start: u64,
    pub end: u64,
}

pub struct Library {
    pub full_path: PathBuf,
    pub load_name: String,
    pub start_addr: RelocatedAddress,
    pub end_addr: RelocatedAddress,
    pub is_runtime_lib: bool,
    dwarf: Option<Dwarf>,
    proc_table: Vec<Procedure>,
    thumb_regions: Vec<ThumbRegion>,
}

pub struct SourceLineMatch {
    pub addr: GlobalAddress,
    pub resolved_line: u32,
    pub resolved_path: String,
    pub is_thumb: bool,
}

pub struct AddrData {
    pub library_name: String,
    pub library_start: RelocatedAddress,
    pub proc_name: String,
    pub proc_start: RelocatedAddress,
    pub source_path: Option<String>,
    pub line: Option<u32>,
}

impl Library {
    /// Open `path`, lazily building the DWARF parser, procedure table, and
    /// (on ARM32) Thumb region set. Debug info is searched in-file first,
    /// then the progressively more indirect locations from spec §4.2.
    pub fn open(
        path: &Path,
        load_name: String,
        start_addr: RelocatedAddress,
        end_addr: RelocatedAddress,
        config: &Config,
    ) -> Result<Self, Error> {
        let basename = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let is_runtime_lib = config.is_runtime_library(&basename);

        let debug_path = find_debug_file(path);
        let file = std::fs::File::open(&debug_path)?;
        // Safety: the mapping is read-only and dropped at the end of this
        // function, after every byte it exposes has been copied out into
        // owned `Dwarf`/`Procedure`/`ThumbRegion` state below.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object_file = object::File::parse(&*mmap)
            .map_err(Error::ObjParsing)?;

        let endian = if object_file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = gimli::Dwarf::load(|id| load_section(&object_file, id, endian))
            .map_err(Error::DwarfParsing)?;
        let has_debug_info = object_file.section_by_name(".debug_info").is_some();

        let mut proc_table: Vec<Procedure> = object_file
            .symbols()
            .chain(object_file.dynamic_symbols())
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.size() > 0)
            .map(|sym| Procedure {
                start: GlobalAddress::from(sym.address()),
                size: sym.size(),
                mangled_name: sym.name().unwrap_or("").to_string(),
            })
            .collect();
        proc_table.sort_unstable_by_key(|p| u64::from(p.start));
        proc_table.dedup_by_key(|p| u64::from(p.start));

        let thumb_regions = derive_thumb_regions(&object_file);

        Ok(Self {
            full_path: debug_path,
            load_name,
            start_addr,
            end_addr,
            is_runtime_lib,
            dwarf: has_debug_info.then_some(dwarf),
            proc_table,
            thumb_regions,
        })
    }

    fn bias(&self) -> usize {
        self.start_addr.as_usize()
    }

    /// `addr_for_source_line` (§4.2): scan each CU for a matching file entry,
    /// pick the line-table row with the smallest `(line, column) >= line`.
    pub fn addr_for_source_line(&self, filename: &str, line: u32) -> Option<SourceLineMatch> {
        let dwarf = self.dwarf.as_ref()?;
        let mut best: Option<(u32, u32, u64, String)> = None;

        let mut units = dwarf.units();
        while let Ok(Some(header)) = units.next() {
            let Ok(unit) = dwarf.unit(header) else { continue };
            let Some(line_program) = unit.line_program.clone() else { continue };
            let mut rows = line_program.rows();
            while let Ok(Some((header, row))) = rows.next_row() {
                let Some(file) = row.file(header) else { continue };
                let Ok(file_name) = dwarf.attr_string(&unit, file.path_name()) else { continue };
                let Ok(file_name) = file_name.to_string_lossy().map(|s| s.into_owned()) else { continue };
                if !file_name.ends_with(filename) {
                    continue;
                }
                let Some(row_line) = row.line() else { continue };
                let row_line = row_line.get() as u32;
                if row_line < line {
                    continue;
                }
                let row_col = match row.column() {
                    gimli::ColumnType::Column(c) => c.get() as u32,
                    gimli::ColumnType::LeftEdge => 0,
                };
                let candidate = (row_line, row_col, row.address(), file_name);
                best = Some(match best {
                    None => candidate,
                    Some(cur) if (candidate.0, candidate.1) < (cur.0, cur.1) => candidate,
                    Some(cur) => cur,
                });
            }
        }

        best.map(|(resolved_line, _, addr, resolved_path)| SourceLineMatch {
            addr: GlobalAddress::from(addr),
            resolved_line,
            resolved_path,
            is_thumb: self.is_thumb_code_global(addr),
        })
    }

    /// `data_for_addr` (§4.2): debug-info lookup preferred, procedure table
    /// as fallback.
    pub fn data_for_addr(&self, addr: RelocatedAddress) -> Option<AddrData> {
        let global = addr.remove_bias(self.bias());
        let raw = u64::from(global);

        let (proc_name, proc_start) = self.lookup_procedure(raw)?;
        let demangled = demangle(&proc_name);

        let (source_path, line) = self.lookup_source_line(raw).unzip();

        Some(AddrData {
            library_name: self.load_name.clone(),
            library_start: self.start_addr,
            proc_name: demangled,
            proc_start: GlobalAddress::from(proc_start).relocate(self.bias()),
            source_path,
            line,
        })
    }

    fn lookup_procedure(&self, addr: u64) -> Option<(String, u64)> {
        let idx = self
            .proc_table
            .partition_point(|p| u64::from(p.start) <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = &self.proc_table[idx - 1];
        let start = u64::from(candidate.start);
        if addr < start + candidate.size {
            Some((candidate.mangled_name.clone(), start))
        } else {
            None
        }
    }

    fn lookup_source_line(&self, addr: u64) -> Option<(String, u32)> {
        let dwarf = self.dwarf.as_ref()?;
        let mut units = dwarf.units();
        while let Ok(Some(header)) = units.next() {
            let Ok(unit) = dwarf.unit(header) else { continue };
            let Some(line_program) = unit.line_program.clone() else { continue };
            let mut rows = line_program.rows();
            let mut best: Option<(u64, u32, String)> = None;
            while let Ok(Some((header, row))) = rows.next_row() {
                if row.address() > addr {
                    continue;
                }
                let Some(file) = row.file(header) else { continue };
                let Ok(name_attr) = dwarf.attr_string(&unit, file.path_name()) else { continue };
                let Ok(name) = name_attr.to_string_lossy().map(|s| s.into_owned()) else { continue };
                let Some(line_num) = row.line() else { continue };
                best = match best {
                    Some((best_addr, _, _)) if best_addr >= row.address() => best,
                    _ => Some((row.address(), line_num.get() as u32, name)),
                };
            }
            if let Some((_, line, name)) = best {
                return Some((name, line));
            }
        }
        None
    }

    pub fn is_thumb_code(&self, addr: RelocatedAddress) -> bool {
        self.is_thumb_code_global(u64::from(addr.remove_bias(self.bias())))
    }

    fn is_thumb_code_global(&self, addr: u64) -> bool {
        self.thumb_regions
            .binary_search_by(|r| {
                if addr < r.start {
                    std::cmp::Ordering::Greater
                } else if addr >= r.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn has_debug_info(&self) -> bool {
        self.dwarf.is_some()
    }
}

fn load_section(
    file: &object::File,
    id: gimli::SectionId,
    endian: RunTimeEndian,
) -> Result<GimliReader, gimli::Error> {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
}

/// Search order from spec §4.2: in-file, `<file>.debug`, `./.debug/<file>.debug`,
/// `/usr/lib/debug/<path>/<file>.debug`. Returns the first candidate that
/// exists, or the original path if none of the side-car locations do.
fn find_debug_file(path: &Path) -> PathBuf {
    let basename = path.file_name().unwrap_or_default();

    let sibling = path.with_extension("debug");
    if sibling.exists() {
        return sibling;
    }
    let local_debug_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(".debug")
        .join(format!("{}.debug", basename.to_string_lossy()));
    if local_debug_dir.exists() {
        return local_debug_dir;
    }
    if let Ok(canon) = path.canonicalize() {
        let system_debug = PathBuf::from("/usr/lib/debug").join(
            canon
                .strip_prefix("/")
                .unwrap_or(&canon)
                .with_extension("debug"),
        );
        if system_debug.exists() {
            return system_debug;
        }
    }
    path.to_path_buf()
}

/// ARM32 Thumb region derivation from ELF mapping symbols (`$t`, `$a`, `$d`):
/// a `$t` symbol starts a Thumb region, `$a`/`$d` end it, per §3.
fn derive_thumb_regions(file: &object::File) -> Vec<ThumbRegion> {
    let mut markers: Vec<(u64, bool)> = file
        .symbols()
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            match name {
                "$t" | "$t.0" => Some((sym.address(), true)),
                "$a" | "$a.0" | "$d" | "$d.0" => Some((sym.address(), false)),
                _ => None,
            }
        })
        .collect();
    markers.sort_unstable_by_key(|(addr, _)| *addr);

    let mut regions = vec![];
    let mut open: Option<u64> = None;
    for (addr, is_thumb_start) in markers {
        match (open, is_thumb_start) {
            (None, true) => open = Some(addr),
            (Some(start), false) => {
                regions.push(ThumbRegion { start, end: addr });
                open = None;
            }
            _ => {}
        }
    }
    regions
}

/// Best-effort demangling: Rust via `rustc_demangle` first (it leaves
/// non-Rust mangling unchanged, so a no-op result means try the next
/// scheme), then Itanium C++ via `cpp_demangle` for the `_Z`-mangled symbols
/// a C++ runtime component contributes.
fn demangle(mangled: &str) -> String {
    let rust_demangled = rustc_demangle::demangle(mangled).to_string();
    if rust_demangled != mangled {
        return rust_demangled;
    }
    if let Ok(symbol) = cpp_demangle::Symbol::new(mangled) {
        if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
            return demangled;
        }
    }
    mangled.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_demangle_passthrough_for_unmangled() {
        assert_eq!(demangle("main"), "main");
    }

    #[test]
    fn test_demangle_itanium_symbol() {
        assert_eq!(demangle("_ZN7Greeter5GreetEi"), "Greeter::Greet(int)");
    }

    #[test]
    fn test_demangle_itanium_unparseable_passes_through() {
        assert_eq!(demangle("_Znotreal"), "_Znotreal");
    }

    #[test]
    fn test_thumb_region_binary_search() {
        let lib = Library {
            full_path: PathBuf::new(),
            load_name: "libtest.so".into(),
            start_addr: RelocatedAddress::from(0x1000usize),
            end_addr: RelocatedAddress::from(0x2000usize),
            is_runtime_lib: false,
            dwarf: None,
            proc_table: vec![],
            thumb_regions: vec![ThumbRegion { start: 0x10, end: 0x20 }],
        };
        assert!(lib.is_thumb_code_global(0x15));
        assert!(!lib.is_thumb_code_global(0x25));
    }

    #[test]
    fn test_procedure_lookup_boundaries() {
        let lib = Library {
            full_path: PathBuf::new(),
            load_name: "libtest.so".into(),
            start_addr: RelocatedAddress::from(0usize),
            end_addr: RelocatedAddress::from(0x2000usize),
            is_runtime_lib: false,
            dwarf: None,
            proc_table: vec![Procedure {
                start: GlobalAddress::from(0x100u64),
                size: 0x10,
                mangled_name: "foo".into(),
            }],
            thumb_regions: vec![],
        };
        assert_eq!(lib.lookup_procedure(0x105).unwrap().0, "foo");
        assert!(lib.lookup_procedure(0x200).is_none());
    }
}
