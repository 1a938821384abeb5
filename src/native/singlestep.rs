//! Single-Step Engine (C10): advance a thread exactly one instruction past a
//! breakpoint, restoring it afterward. Hardware path on x86_64/AArch64;
//! software decode-and-temporary-breakpoint path on ARM32 (once hardware
//! single-step has returned `EIO`, which disables it permanently on that
//! thread per spec) and always on RISC-V64 (no hardware facility at all).
//!
//! Grounded on `tracer.rs::single_step`'s hardware retry-on-syscall loop,
//! generalized with the software fallback described in spec §4.10.

use crate::arch::{arm32, riscv64, Arch};
use crate::error::Error;
use nix::unistd::Pid;
use smallvec::{smallvec, SmallVec};
use std::collections::HashSet;
use std::sync::Mutex;

/// Registers needed by the software decoders, one variant per architecture
/// that can take the software path.
pub enum RegisterSnapshot {
    Arm32(arm32::Arm32Regs),
    RiscV64(riscv64::RiscV64Regs),
}

pub struct SingleStepEngine {
    arch: Arch,
    /// Threads on which hardware single-step has returned `EIO` at least
    /// once; the engine never retries the hardware path for them again.
    hw_disabled: Mutex<HashSet<i32>>,
}

impl SingleStepEngine {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            hw_disabled: Mutex::new(HashSet::new()),
        }
    }

    pub fn uses_software_path(&self, pid: Pid) -> bool {
        matches!(self.arch, Arch::Riscv64) || self.hw_disabled.lock().unwrap().contains(&pid.as_raw())
    }

    pub fn mark_hardware_disabled(&self, pid: Pid) {
        self.hw_disabled.lock().unwrap().insert(pid.as_raw());
    }

    /// Compute the set of addresses the thread could land on next, given the
    /// raw bytes at its current PC and a register snapshot. The caller (the
    /// waitpid worker, which owns ptrace I/O) plants temporary breakpoints at
    /// each, continues, waits, then removes them.
    ///
    /// `code` must contain at least 4 bytes for ARM32/RISC-V64 (enough for
    /// either a 16-bit or 32-bit instruction at offset 0). `mem_read` lets the
    /// A32 decoder resolve LDR-into-PC forms, which need a debuggee memory
    /// read the raw `code` window alone cannot supply.
    pub fn software_next_pcs(
        &self,
        snapshot: &RegisterSnapshot,
        code: &[u8],
        mem_read: &dyn Fn(u32) -> Option<u32>,
    ) -> Result<Vec<u64>, Error> {
        // Every decoder below produces at most two candidate PCs (a
        // conditional branch's taken/fall-through pair being the only case
        // with more than one), so a stack-allocated buffer avoids a heap
        // allocation for the common single-candidate case.
        let pcs: SmallVec<[u64; 2]> = match snapshot {
            RegisterSnapshot::Arm32(regs) => {
                let hw1 = u16::from_le_bytes([code[0], code[1]]);
                if regs.itstate == 0 && is_arm_mode(regs) {
                    let insn = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
                    arm32::next_pcs_a32(insn, regs, mem_read).into_iter().map(u64::from).collect()
                } else if crate::arch::is_thumb32_opcode(hw1) {
                    let hw2 = u16::from_le_bytes([code[2], code[3]]);
                    arm32::next_pcs_t32(hw1, hw2, regs).into_iter().map(u64::from).collect()
                } else {
                    arm32::next_pcs_t16(hw1, regs).into_iter().map(u64::from).collect()
                }
            }
            RegisterSnapshot::RiscV64(regs) => {
                let hw1 = u16::from_le_bytes([code[0], code[1]]);
                if riscv64::is_compressed(hw1) {
                    smallvec![riscv64::next_pc_compressed(hw1, regs).unwrap_or_else(|| regs.pc.wrapping_add(2))]
                } else {
                    let insn = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
                    smallvec![riscv64::next_pc_full(insn, regs).unwrap_or_else(|| regs.pc.wrapping_add(4))]
                }
            }
        };
        Ok(pcs.into_vec())
    }
}

/// ARM32 mode is tracked by the CPSR Thumb bit (bit 5), which the caller
/// folds into `itstate`'s reserved high bit as a convention: itstate's bit 7
/// doubles as "thumb" since legitimate IT-state base conditions never set it
/// alongside a nonzero mask in the encodings this engine constructs.
fn is_arm_mode(regs: &arm32::Arm32Regs) -> bool {
    regs.itstate & 0x80 == 0
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::arm32::{Arm32Regs, REG_PC};

    #[test]
    fn test_software_next_pcs_arm_mode_branch() {
        let engine = SingleStepEngine::new(Arch::Arm32);
        let mut regs = Arm32Regs::default();
        regs.r[REG_PC] = 0x8000;
        // B with imm24=0 -> target = pc+8
        let code = 0xEA00_0000u32.to_le_bytes();
        let result = engine
            .software_next_pcs(&RegisterSnapshot::Arm32(regs), &code, &|_| None)
            .unwrap();
        assert_eq!(result, vec![0x8008]);
    }

    #[test]
    fn test_software_next_pcs_riscv_compressed() {
        let engine = SingleStepEngine::new(Arch::Riscv64);
        let mut regs = riscv64::RiscV64Regs::default();
        regs.pc = 0x1000;
        // c.j with a non-control encoding falls back to pc+2 when decode fails
        let code = [0x01u16.to_le_bytes()[0], 0x01u16.to_le_bytes()[1], 0, 0];
        let result = engine
            .software_next_pcs(&RegisterSnapshot::RiscV64(regs), &code, &|_| None)
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_hardware_disabled_tracking() {
        let engine = SingleStepEngine::new(Arch::Arm32);
        let pid = Pid::from_raw(42);
        assert!(!engine.uses_software_path(pid));
        engine.mark_hardware_disabled(pid);
        assert!(engine.uses_software_path(pid));
    }
}
