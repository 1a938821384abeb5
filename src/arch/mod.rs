//! Architecture-specific breakpoint-opcode encoding, PC fixup, and software
//! single-step instruction decoding. Register *access* (reading/writing the
//! live ptrace register set) is necessarily host-arch-specific and lives in
//! `native::regs`; the logic in this module is pure and arch-selected at
//! runtime by an [`Arch`] tag, so it is unit-testable without a live tracee.

pub mod arm32;
pub mod riscv64;

use bit_field::BitField;
use strum_macros::Display;

/// Debuggee instruction-set architecture, as derived from an ELF `e_machine`
/// field (see `native::library_index`).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Arch {
    X86_64,
    I386,
    Aarch64,
    Arm32,
    Riscv64,
}

/// A raw code word read from/written to debuggee memory at a breakpoint
/// address. x86/ARM64/ARM32-arm/RISC-V use a single `u64`-sized read; ARM32
/// thumb addresses may only need the low 16 or 32 bits rewritten, which the
/// encode/restore functions below express via masking rather than width.
pub type Word = u64;

/// Whether a PC-fixup is required after a software-breakpoint trap: x86
/// architectures leave PC one byte past the trap (`int3` is a 1-byte trap
/// instruction executed before the CPU delivers the signal); ARM/AArch64/
/// RISC-V instead raise the trap for the faulting instruction itself and
/// leave PC pointing at it.
pub fn needs_prev_brk_pc_fixup(arch: Arch) -> bool {
    matches!(arch, Arch::X86_64 | Arch::I386)
}

/// Amount (in bytes) PC must be stepped back by after a software-breakpoint
/// trap, for architectures where `needs_prev_brk_pc_fixup` is true.
pub fn prev_brk_pc_fixup_size(arch: Arch) -> u64 {
    match arch {
        Arch::X86_64 | Arch::I386 => 1,
        _ => 0,
    }
}

/// Detect a 32-bit Thumb-2 instruction by inspecting the first halfword: the
/// high 5 bits `11101`/`11110`/`11111` identify a 32-bit encoding: per spec.
pub fn is_thumb32_opcode(first_halfword: u16) -> bool {
    let top5 = first_halfword.get_bits(11..16);
    matches!(top5, 0b11101 | 0b11110 | 0b11111)
}

/// Encode the architecture's software-breakpoint opcode into `data`, the raw
/// word currently at the breakpoint address. `thumb` only matters for
/// `Arch::Arm32`.
pub fn encode_brk_opcode(arch: Arch, data: Word, thumb: bool) -> Word {
    match arch {
        Arch::X86_64 | Arch::I386 => (data & !0xff) | 0xCC,
        Arch::Aarch64 => (data & !0xFFFF_FFFF) | 0xD420_0000,
        Arch::Arm32 => {
            if !thumb {
                0x07F0_01F0
            } else if is_thumb32_opcode(data as u16) {
                0xA000_F7F0
            } else {
                (data & !0xFFFF) | 0xDE01
            }
        }
        Arch::Riscv64 => {
            // c.ebreak (16-bit) if the existing instruction is itself
            // compressed (low two bits != 0b11), else the 4-byte ebreak.
            if data as u8 & 0b11 != 0b11 {
                (data & !0xFFFF) | 0x9002
            } else {
                (data & !0xFFFF_FFFF) | 0x0010_0073
            }
        }
    }
}

/// Invert `encode_brk_opcode`: given the word currently holding the
/// breakpoint encoding and the originally-saved word, produce the word to
/// restore.
pub fn restore_opcode(arch: Arch, data_with_brk: Word, saved: Word) -> Word {
    match arch {
        Arch::X86_64 | Arch::I386 => (data_with_brk & !0xff) | (saved & 0xff),
        Arch::Aarch64 => (data_with_brk & !0xFFFF_FFFF) | (saved & 0xFFFF_FFFF),
        Arch::Arm32 => {
            if data_with_brk == 0x07F0_01F0 || data_with_brk == 0xA000_F7F0 {
                saved
            } else {
                (data_with_brk & !0xFFFF) | (saved & 0xFFFF)
            }
        }
        Arch::Riscv64 => {
            if data_with_brk as u32 & 0xFFFF_FFFF == 0x0010_0073 {
                (data_with_brk & !0xFFFF_FFFF) | (saved & 0xFFFF_FFFF)
            } else {
                (data_with_brk & !0xFFFF) | (saved & 0xFFFF)
            }
        }
    }
}
