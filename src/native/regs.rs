//! Host-architecture-specific live register access. Unlike `arch` (pure,
//! cross-arch-testable opcode tables), reading/writing the ptrace register
//! set necessarily depends on the host's own `libc::user_regs_struct` layout,
//! so only the build's native architecture is compiled in.

use crate::address::RelocatedAddress;
use crate::arch::arm32::Arm32Regs;
use crate::arch::riscv64::RiscV64Regs;
use crate::arch::Arch;
use crate::error::Error;
use crate::native::singlestep::RegisterSnapshot;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Get the current program counter for `pid` via `PTRACE_GETREGSET`
/// (`NT_PRSTATUS`).
pub fn get_pc(pid: Pid) -> Result<RelocatedAddress, Error> {
    let regs = ptrace::getregs(pid).map_err(Error::Ptrace)?;
    Ok(RelocatedAddress::from(pc_from_regs(&regs)))
}

/// Set the program counter for `pid` via `PTRACE_SETREGSET`.
pub fn set_pc(pid: Pid, addr: RelocatedAddress) -> Result<(), Error> {
    let mut regs = ptrace::getregs(pid).map_err(Error::Ptrace)?;
    set_pc_in_regs(&mut regs, addr.as_u64());
    ptrace::setregs(pid, regs).map_err(Error::Ptrace)
}

#[cfg(target_arch = "x86_64")]
fn pc_from_regs(regs: &nix::libc::user_regs_struct) -> u64 {
    regs.rip
}

#[cfg(target_arch = "x86_64")]
fn set_pc_in_regs(regs: &mut nix::libc::user_regs_struct, pc: u64) {
    regs.rip = pc;
}

#[cfg(target_arch = "aarch64")]
fn pc_from_regs(regs: &nix::libc::user_regs_struct) -> u64 {
    regs.pc
}

#[cfg(target_arch = "aarch64")]
fn set_pc_in_regs(regs: &mut nix::libc::user_regs_struct, pc: u64) {
    regs.pc = pc;
}

#[cfg(target_arch = "arm")]
fn pc_from_regs(regs: &nix::libc::user_regs_struct) -> u64 {
    // regs[15] is PC in the classic ARM EABI `user_regs` layout.
    regs.uregs[15] as u64
}

#[cfg(target_arch = "arm")]
fn set_pc_in_regs(regs: &mut nix::libc::user_regs_struct, pc: u64) {
    regs.uregs[15] = pc as u32;
}

#[cfg(target_arch = "riscv64")]
fn pc_from_regs(regs: &nix::libc::user_regs_struct) -> u64 {
    regs.pc
}

#[cfg(target_arch = "riscv64")]
fn set_pc_in_regs(regs: &mut nix::libc::user_regs_struct, pc: u64) {
    regs.pc = pc;
}

/// Full register snapshot for the software single-step decoders (C10). Only
/// meaningful on ARM32/RISC-V64, the two architectures `SingleStepEngine` can
/// take the software path on; asking for a snapshot on a hardware-steppable
/// architecture is a caller bug.
pub fn read_software_step_snapshot(arch: Arch, pid: Pid) -> Result<RegisterSnapshot, Error> {
    match arch {
        Arch::Arm32 => Ok(RegisterSnapshot::Arm32(read_arm32_regs(pid)?)),
        Arch::Riscv64 => Ok(RegisterSnapshot::RiscV64(read_riscv64_regs(pid)?)),
        Arch::X86_64 | Arch::I386 | Arch::Aarch64 => {
            Err(Error::InvalidOperation("software step snapshot requested on a hardware-steppable arch"))
        }
    }
}

#[cfg(target_arch = "arm")]
fn read_arm32_regs(pid: Pid) -> Result<Arm32Regs, Error> {
    let raw = ptrace::getregs(pid).map_err(Error::Ptrace)?;
    let cpsr = raw.uregs[16];

    let mut r = [0u32; 16];
    r.copy_from_slice(&raw.uregs[..16]);

    // Real ITSTATE[7:2]/[1:0] per the ARM ARM; an IT block can only be open
    // in Thumb state, so a nonzero value here already implies Thumb and the
    // `is_arm_mode` bit-7 convention in `native::singlestep` is preserved
    // unmodified. Outside an IT block the low bits are 0 in both states, so
    // the Thumb flag is folded in only then.
    let it7_2 = (cpsr >> 10) & 0b0011_1111;
    let it1_0 = (cpsr >> 25) & 0b11;
    let real_itstate = ((it7_2 << 2) | it1_0) as u8;
    let thumb = cpsr & (1 << 5) != 0;
    let itstate = if real_itstate != 0 {
        real_itstate
    } else if thumb {
        0x80
    } else {
        0
    };

    Ok(Arm32Regs {
        r,
        n: cpsr & (1 << 31) != 0,
        z: cpsr & (1 << 30) != 0,
        c: cpsr & (1 << 29) != 0,
        v: cpsr & (1 << 28) != 0,
        itstate,
    })
}

#[cfg(not(target_arch = "arm"))]
fn read_arm32_regs(_pid: Pid) -> Result<Arm32Regs, Error> {
    Err(Error::InvalidOperation("not running on an arm32 host"))
}

#[cfg(target_arch = "riscv64")]
fn read_riscv64_regs(pid: Pid) -> Result<RiscV64Regs, Error> {
    let raw = ptrace::getregs(pid).map_err(Error::Ptrace)?;
    Ok(RiscV64Regs {
        x: [
            0, raw.ra, raw.sp, raw.gp, raw.tp, raw.t0, raw.t1, raw.t2, raw.s0, raw.s1, raw.a0,
            raw.a1, raw.a2, raw.a3, raw.a4, raw.a5, raw.a6, raw.a7, raw.s2, raw.s3, raw.s4,
            raw.s5, raw.s6, raw.s7, raw.s8, raw.s9, raw.s10, raw.s11, raw.t3, raw.t4, raw.t5,
            raw.t6,
        ],
        pc: raw.pc,
    })
}

#[cfg(not(target_arch = "riscv64"))]
fn read_riscv64_regs(_pid: Pid) -> Result<RiscV64Regs, Error> {
    Err(Error::InvalidOperation("not running on a riscv64 host"))
}
