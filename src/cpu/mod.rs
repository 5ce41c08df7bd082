//! Hart: one RISC-V hardware thread
//!
//! Holds the integer register file (PC at index 32), the current XLEN
//! and privilege mode, the CSR bank and the TLB. The run loop follows
//! the wait_event protocol: each cycle arms the flag, executes the hot
//! loop until a trap or an external break clears it, then applies the
//! trap-vector rule to PC.

pub mod csr;
mod exec;
mod exec_c;
pub mod mmu;
pub mod trap;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::machine::{HartSignals, Machine};
use csr::{CsrBank, CSR_MISA_RV64};
use mmu::{TlbEntry, SATP_MODE_PHYS, TLB_SIZE};

pub const REG_ZERO: u32 = 0;
pub const REG_SP: u32 = 2;
/// PC lives at register index 32
pub const REG_PC: usize = 32;

/// Privilege levels. The hypervisor level is not implemented; its slot
/// exists so the delegation arrays line up with the architectural
/// numbering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Privilege {
    User = 0,
    Supervisor = 1,
    Hypervisor = 2,
    Machine = 3,
}

impl From<u8> for Privilege {
    fn from(val: u8) -> Self {
        match val & 3 {
            0 => Privilege::User,
            1 => Privilege::Supervisor,
            2 => Privilege::Hypervisor,
            _ => Privilege::Machine,
        }
    }
}

/// Rounding mode the FP data path should use, kept in sync with
/// fcsr.frm by the CSR file
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum RoundingMode {
    NearestEven,
    TowardZero,
    Down,
    Up,
}

pub struct Hart {
    /// x0..x31 plus PC
    pub registers: [u64; 33],
    /// Current XLEN: true for 64-bit operation
    pub rv64: bool,
    pub priv_mode: Privilege,
    pub csr: CsrBank,
    pub(crate) tlb: [TlbEntry; TLB_SIZE],
    /// Active satp translation mode
    pub mmu_mode: u8,
    pub root_page_table: u64,
    /// Shared with devices and the timer thread
    pub signals: Arc<HartSignals>,
    pub(crate) machine: Arc<Machine>,
    /// Set by trap() so the run loop applies the vector rule exactly once
    pub(crate) trap_taken: bool,
    /// LR/SC reservation address
    pub(crate) reservation: Option<u64>,
    /// FP exception flags accumulated by the FP data path
    pub(crate) fpu_flags: u32,
    pub(crate) fpu_round: RoundingMode,
}

// The TLB holds raw pointers into the machine's RAM mapping, which is
// alive and pinned for as long as the Arc is.
unsafe impl Send for Hart {}

impl Hart {
    pub fn new(machine: Arc<Machine>, hartid: usize) -> Self {
        let rv64 = machine.rv64();
        let signals = machine.signals(hartid);
        let mut hart = Hart {
            registers: [0; 33],
            rv64,
            priv_mode: Privilege::Machine,
            csr: CsrBank::new(hartid as u64, rv64),
            tlb: [TlbEntry::invalid(); TLB_SIZE],
            mmu_mode: SATP_MODE_PHYS,
            root_page_table: 0,
            signals,
            machine,
            trap_taken: false,
            reservation: None,
            fpu_flags: 0,
            fpu_round: RoundingMode::NearestEven,
        };
        hart.registers[REG_PC] = hart.machine.mem().begin();
        hart
    }

    /// Read an integer register; x0 always reads zero
    #[inline(always)]
    pub fn read_reg(&self, reg: u32) -> u64 {
        if reg == 0 {
            0
        } else {
            self.registers[reg as usize & 0x1F]
        }
    }

    /// Write an integer register; x0 writes are discarded
    #[inline(always)]
    pub fn write_reg(&mut self, reg: u32, value: u64) {
        if reg != 0 {
            self.registers[reg as usize & 0x1F] = value;
        }
    }

    /// Register write with the value narrowed to the current XLEN;
    /// 32-bit results are kept sign-extended in the 64-bit file
    #[inline(always)]
    pub fn write_reg_xlen(&mut self, reg: u32, value: u64) {
        let value = if self.rv64 {
            value
        } else {
            value as u32 as i32 as i64 as u64
        };
        self.write_reg(reg, value);
    }

    /// Truncate an address or PC to the current XLEN
    #[inline(always)]
    pub(crate) fn xlen_mask(&self, value: u64) -> u64 {
        if self.rv64 {
            value
        } else {
            value & 0xFFFF_FFFF
        }
    }

    /// Switch XLEN after a misa width change; every cached translation
    /// is sized for the old width
    pub(crate) fn update_xlen(&mut self) {
        self.rv64 = self.csr.isa & CSR_MISA_RV64 != 0;
        self.tlb_flush();
    }

    /// Privilege transitions invalidate the TLB's permission tags
    pub(crate) fn set_priv(&mut self, priv_mode: Privilege) {
        if priv_mode != self.priv_mode {
            self.priv_mode = priv_mode;
            self.tlb_flush();
        }
    }

    /// WFI: stall until an interrupt is latched or raised, or the hart is
    /// broken out
    pub(crate) fn wfi(&mut self) {
        while self.signals.wait_event.load(Ordering::Relaxed) != 0
            && (self.signals.ip.load(Ordering::Acquire) | self.interrupts_raised()) & self.csr.ie
                == 0
        {
            std::thread::yield_now();
        }
    }

    /// Run until the machine shuts down. Slices are bounded so a shutdown
    /// racing with the wait_event re-arm is still observed promptly.
    pub fn run(&mut self) {
        while self.machine.is_running() {
            self.run_slice(0x10000);
        }
    }

    /// One wait_event cycle: deliver pending interrupts, execute until an
    /// event (or the instruction budget runs out), then set PC from the
    /// trap vector if a trap was taken. Returns instructions executed.
    pub fn run_slice(&mut self, budget: u64) -> u64 {
        self.signals.wait_event.store(1, Ordering::Release);
        self.dispatch_interrupts();
        let executed = self.run_till_event(budget);

        if self.trap_taken {
            self.trap_taken = false;
            let target = self.priv_mode as usize;
            let tvec = self.csr.tvec[target];
            let cause = self.csr.cause[target];
            let int_mask = self.interrupt_mask();
            let pc = if cause & int_mask != 0 && tvec & 1 != 0 {
                // Vectored: base + cause * 4
                (tvec & !3).wrapping_add((cause & !int_mask) << 2)
            } else {
                tvec & !3
            };
            self.registers[REG_PC] = self.xlen_mask(pc);
        }
        executed
    }

    /// The hot loop. Instruction fetch goes through the TLB fast path
    /// when the entry allows execution and the fetch stays inside one
    /// page; compiled blocks are entered when the code cache has a clean
    /// one for the physical PC.
    fn run_till_event(&mut self, budget: u64) -> u64 {
        let mut executed = 0;
        while executed < budget && self.signals.wait_event.load(Ordering::Relaxed) != 0 {
            self.registers[REG_ZERO as usize] = 0;
            let pc = self.xlen_mask(self.registers[REG_PC]);

            match self.fetch_insn(pc) {
                Ok((inst, phys_pc)) => {
                    if let Some(jit) = self.machine.jit() {
                        if let Some(block) = jit.block_lookup(phys_pc) {
                            unsafe { block(self as *mut Hart as *mut core::ffi::c_void) };
                            executed += 1;
                            continue;
                        }
                    }
                    match self.exec_instruction(inst, pc) {
                        Ok(next) => self.registers[REG_PC] = next,
                        Err(trap) => self.trap(trap.cause, trap.tval),
                    }
                }
                Err(trap) => self.trap(trap.cause, trap.tval),
            }
            executed += 1;
        }
        executed
    }
}

#[cfg(test)]
pub(crate) fn test_hart(rv64: bool) -> Hart {
    use crate::machine::{Machine, MachineConfig};
    let machine = Machine::new(MachineConfig {
        mem_base: 0x8000_0000,
        mem_size: 0x10000,
        smp: 1,
        rv64,
        jit: false,
        jit_heap_size: 0,
    })
    .unwrap();
    Hart::new(Arc::new(machine), 0)
}

#[cfg(test)]
mod tests {
    use super::csr::{MIP_MTIP, MSTATUS_MIE};
    use super::trap::{INTERRUPT_MTIMER, TRAP_ENVCALL_M};
    use super::*;

    const RAM: u64 = 0x8000_0000;

    #[test]
    fn test_hart_creation() {
        let hart = test_hart(true);
        assert_eq!(hart.registers[REG_PC], RAM);
        assert_eq!(hart.priv_mode, Privilege::Machine);
        assert_eq!(hart.read_reg(0), 0);
    }

    #[test]
    fn test_x0_always_zero() {
        let mut hart = test_hart(true);
        hart.write_reg(0, 0xDEAD_BEEF);
        assert_eq!(hart.read_reg(0), 0);
        hart.write_reg(1, 0x1234_5678);
        assert_eq!(hart.read_reg(1), 0x1234_5678);
    }

    #[test]
    fn test_run_executes_instructions() {
        let mut hart = test_hart(true);
        // addi x1, x0, 7 ; addi x1, x1, 1
        hart.machine.write_ram(RAM, &0x0070_0093u32.to_le_bytes());
        hart.machine
            .write_ram(RAM + 4, &0x0010_8093u32.to_le_bytes());
        let executed = hart.run_slice(2);
        assert_eq!(executed, 2);
        assert_eq!(hart.read_reg(1), 8);
        assert_eq!(hart.registers[REG_PC], RAM + 8);
    }

    #[test]
    fn test_ecall_vectors_to_mtvec() {
        let mut hart = test_hart(true);
        hart.csr.tvec[Privilege::Machine as usize] = RAM + 0x100;
        hart.machine.write_ram(RAM, &0x0000_0073u32.to_le_bytes()); // ecall
        hart.run_slice(10);
        let m = Privilege::Machine as usize;
        assert_eq!(hart.csr.cause[m], TRAP_ENVCALL_M);
        assert_eq!(hart.csr.epc[m], RAM);
        assert_eq!(hart.registers[REG_PC], RAM + 0x100);
    }

    #[test]
    fn test_vectored_interrupt() {
        let mut hart = test_hart(true);
        hart.csr.tvec[Privilege::Machine as usize] = 0x1000 | 1;
        hart.csr.ie = MIP_MTIP;
        hart.csr.status |= MSTATUS_MIE;
        hart.interrupt(INTERRUPT_MTIMER);

        hart.run_slice(0);

        assert_eq!(hart.registers[REG_PC], 0x1000 + 4 * 7);
        assert_eq!(
            hart.csr.cause[Privilege::Machine as usize],
            0x8000_0000_0000_0007
        );
    }

    #[test]
    fn test_vectored_interrupt_rv32_cause() {
        let mut hart = test_hart(false);
        hart.csr.tvec[Privilege::Machine as usize] = 0x1000 | 1;
        hart.csr.ie = MIP_MTIP;
        hart.csr.status |= MSTATUS_MIE;
        hart.interrupt(INTERRUPT_MTIMER);

        hart.run_slice(0);

        assert_eq!(hart.registers[REG_PC], 0x101C);
        assert_eq!(hart.csr.cause[Privilege::Machine as usize], 0x8000_0007);
    }

    #[test]
    fn test_illegal_instruction_rolls_back_pc() {
        let mut hart = test_hart(true);
        hart.csr.tvec[Privilege::Machine as usize] = RAM + 0x200;
        hart.machine.write_ram(RAM, &0xFFFF_FFFFu32.to_le_bytes());
        hart.run_slice(10);
        let m = Privilege::Machine as usize;
        assert_eq!(hart.csr.epc[m], RAM);
        assert_eq!(hart.csr.tval[m], 0xFFFF_FFFF);
    }
}
