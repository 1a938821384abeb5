//! The managed-side symbol reader: an auxiliary assembly loaded by the
//! runtime's host and called through function pointers. No analog in a
//! debugger that reads DWARF directly; grounded on spec §6's external
//! interface list and modeled the way `debugger/debugee/rendezvous.rs`'s
//! `ffi` module models its own external collaborator: a narrow trait at
//! the boundary, opaque handles, nothing
//! asserted about the callee's internals.

use crate::address::{IlOffset, MethodToken};

/// Opaque handle returned by `load_symbols_for_module`, freed by `dispose`.
/// Owned exclusively by the `Module` it was created for; never duplicated or
/// shared, which breaks the cyclic reference the source's raw ownership
/// would otherwise create.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SymbolReaderHandle(pub u64);

/// Sequence point as read back from the symbol reader, pre-filtering. The
/// index applies the hidden-sequence-point rule before this type ever
/// reaches a caller.
#[derive(Clone, Debug)]
pub struct RawSequencePoint {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub il_offset: IlOffset,
    pub document_path: String,
}

/// `start_line` the runtime uses to mark a sequence point that should never
/// be shown to a user (compiler-generated prologue/epilogue bookkeeping).
pub const HIDDEN_SEQUENCE_POINT_LINE: u32 = 0xFEEFEE;

pub struct MemoryLayout {
    pub pe_addr: u64,
    pub pe_size: u64,
    pub pdb_addr: u64,
    pub pdb_size: u64,
}

/// A callback the reader uses to pull bytes out of the debuggee's address
/// space on demand, rather than requiring the whole PE/PDB image upfront.
pub type ReadMemoryFn<'a> = dyn Fn(u64, &mut [u8]) -> bool + 'a;

/// The semantic contract named in spec §6; callers import this as a trait
/// object so a managed-hosting shim can be substituted in tests.
pub trait SymbolReader {
    fn load_symbols_for_module(
        &self,
        name: &str,
        layout: &MemoryLayout,
        read_memory: &ReadMemoryFn,
    ) -> Option<SymbolReaderHandle>;

    fn resolve_sequence_point(
        &self,
        handle: SymbolReaderHandle,
        file: &str,
        line: u32,
    ) -> Vec<(MethodToken, IlOffset)>;

    fn get_line_by_il_offset(
        &self,
        handle: SymbolReaderHandle,
        token: MethodToken,
        il_offset: IlOffset,
    ) -> Option<(u32, String)>;

    fn get_step_ranges_from_ip(
        &self,
        handle: SymbolReaderHandle,
        ip: u64,
        token: MethodToken,
    ) -> Option<(IlOffset, IlOffset)>;

    fn get_sequence_points(&self, handle: SymbolReaderHandle, token: MethodToken) -> Vec<RawSequencePoint>;

    fn get_local_variable_name_and_scope(
        &self,
        handle: SymbolReaderHandle,
        token: MethodToken,
        index: u32,
    ) -> Option<(String, IlOffset, IlOffset)>;

    fn parse_expression(&self, text: &str, type_name: &str) -> Result<Vec<u8>, String>;

    fn eval_expression(
        &self,
        text: &str,
        get_child: &dyn Fn(&str) -> Option<u64>,
    ) -> Result<(Vec<u8>, u32, u64), String>;

    fn dispose(&self, handle: SymbolReaderHandle);
}

/// Strip a sequence point the runtime marked hidden; used by the index
/// whenever it ingests points fresh off the reader.
pub fn is_hidden(sp: &RawSequencePoint) -> bool {
    sp.start_line == HIDDEN_SEQUENCE_POINT_LINE
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_hidden_detects_feefee() {
        let sp = RawSequencePoint {
            start_line: HIDDEN_SEQUENCE_POINT_LINE,
            start_column: 0,
            end_line: HIDDEN_SEQUENCE_POINT_LINE,
            end_column: 0,
            il_offset: IlOffset(0),
            document_path: String::new(),
        };
        assert!(is_hidden(&sp));
    }

    #[test]
    fn test_is_hidden_false_for_real_line() {
        let sp = RawSequencePoint {
            start_line: 42,
            start_column: 1,
            end_line: 42,
            end_column: 10,
            il_offset: IlOffset(0),
            document_path: "Foo.cs".into(),
        };
        assert!(!is_hidden(&sp));
    }
}
