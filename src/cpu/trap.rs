//! Trap and interrupt delivery
//!
//! Synchronous exceptions and interrupts funnel through `Hart::trap`,
//! which walks the delegation registers from machine mode down to the
//! current privilege, saves the trap frame at the target level and exits
//! the hot loop. The outer run loop then applies the vectored/direct
//! trap-vector rule.

use std::sync::atomic::Ordering;

use super::csr::{MSTATUS_MIE, MSTATUS_SIE};
use super::{Hart, Privilege, REG_PC};
use crate::bitops::{bit_cut, bit_replace};

// Exception causes
pub const TRAP_INSTR_MISALIGN: u64 = 0;
pub const TRAP_INSTR_FETCH: u64 = 1;
pub const TRAP_ILL_INSTR: u64 = 2;
pub const TRAP_BREAKPOINT: u64 = 3;
pub const TRAP_LOAD_MISALIGN: u64 = 4;
pub const TRAP_LOAD_FAULT: u64 = 5;
pub const TRAP_STORE_MISALIGN: u64 = 6;
pub const TRAP_STORE_FAULT: u64 = 7;
pub const TRAP_ENVCALL_U: u64 = 8;
pub const TRAP_ENVCALL_S: u64 = 9;
pub const TRAP_ENVCALL_M: u64 = 11;
pub const TRAP_INSTR_PAGEFAULT: u64 = 12;
pub const TRAP_LOAD_PAGEFAULT: u64 = 13;
pub const TRAP_STORE_PAGEFAULT: u64 = 15;

// Interrupt causes
pub const INTERRUPT_SSOFT: u64 = 1;
pub const INTERRUPT_MSOFT: u64 = 3;
pub const INTERRUPT_STIMER: u64 = 5;
pub const INTERRUPT_MTIMER: u64 = 7;
pub const INTERRUPT_SEXT: u64 = 9;
pub const INTERRUPT_MEXT: u64 = 11;

/// A pending guest-visible fault, raised where it happens and delivered
/// at the hot-loop boundary so the faulting instruction never retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub cause: u64,
    pub tval: u64,
}

impl Trap {
    pub fn new(cause: u64, tval: u64) -> Self {
        Trap { cause, tval }
    }
}

impl Hart {
    /// High bit of the cause register for the current XLEN
    #[inline(always)]
    pub fn interrupt_mask(&self) -> u64 {
        if self.rv64 {
            1 << 63
        } else {
            1 << 31
        }
    }

    /// Deliver a trap: pick the target privilege via the delegation walk,
    /// save the frame, stack the interrupt-enable state and leave the hot
    /// loop at the next instruction boundary.
    pub fn trap(&mut self, cause: u64, tval: u64) {
        let int_mask = self.interrupt_mask();
        let is_irq = cause & int_mask != 0;
        let code = (cause & !int_mask) & 63;
        let deleg = if is_irq {
            &self.csr.ideleg
        } else {
            &self.csr.edeleg
        };

        // Walk down from machine mode; the first level that does not
        // delegate this cause takes the trap
        let mut target = Privilege::Machine as usize;
        while target > self.priv_mode as usize {
            if deleg[target] & (1u64 << code) == 0 {
                break;
            }
            target -= 1;
        }

        log::trace!(
            "hart{}: trap pc={:#x} priv {}->{} cause={:#x} tval={:#x}",
            self.csr.hartid,
            self.registers[REG_PC],
            self.priv_mode as u8,
            target,
            cause,
            tval
        );

        self.csr.epc[target] = self.registers[REG_PC];
        self.csr.cause[target] = cause;
        self.csr.tval[target] = tval;

        // Save current privilege to xPP, xIE to xPIE, disable interrupts
        let status = self.csr.status;
        if target == Privilege::Machine as usize {
            let status = bit_replace(status, 11, 2, self.priv_mode as u64);
            let status = bit_replace(status, 7, 1, bit_cut(status, 3, 1));
            self.csr.status = status & !MSTATUS_MIE;
        } else {
            let status = bit_replace(status, 8, 1, self.priv_mode as u64);
            let status = bit_replace(status, 5, 1, bit_cut(status, 1, 1));
            self.csr.status = status & !MSTATUS_SIE;
        }

        self.set_priv(Privilege::from(target as u8));
        self.trap_taken = true;
        self.signals.wait_event.store(0, Ordering::Release);
    }

    /// Latch an interrupt cause into ip and wake the hart
    pub fn interrupt(&mut self, cause: u64) {
        self.signals.ip.fetch_or(1 << cause, Ordering::AcqRel);
        self.signals.wait_event.store(0, Ordering::Release);
    }

    pub fn interrupt_clear(&mut self, cause: u64) {
        self.signals.ip.fetch_and(!(1u64 << cause), Ordering::AcqRel);
    }

    /// Level-triggered lines currently asserted by devices. These are
    /// visible on every ip read and interrupt check but never latched;
    /// they drop when the device deasserts.
    pub fn interrupts_raised(&self) -> u64 {
        self.signals.raised.load(Ordering::Acquire)
    }

    /// Highest-priority interrupt that can be taken right now
    fn select_pending_interrupt(&self) -> Option<u64> {
        let pending =
            (self.signals.ip.load(Ordering::Acquire) | self.interrupts_raised()) & self.csr.ie;
        if pending == 0 {
            return None;
        }
        let status = self.csr.status;
        let ideleg = self.csr.ideleg[Privilege::Machine as usize];

        let m_pending = pending & !ideleg;
        let m_enabled =
            self.priv_mode < Privilege::Machine || status & MSTATUS_MIE != 0;
        if m_enabled && m_pending != 0 {
            for cause in [INTERRUPT_MEXT, INTERRUPT_MSOFT, INTERRUPT_MTIMER] {
                if m_pending & (1 << cause) != 0 {
                    return Some(cause);
                }
            }
        }

        let s_pending = pending & ideleg;
        let s_enabled = self.priv_mode < Privilege::Supervisor
            || (self.priv_mode == Privilege::Supervisor && status & MSTATUS_SIE != 0);
        if s_enabled && s_pending != 0 {
            for cause in [INTERRUPT_SEXT, INTERRUPT_SSOFT, INTERRUPT_STIMER] {
                if s_pending & (1 << cause) != 0 {
                    return Some(cause);
                }
            }
        }
        None
    }

    /// Wake the hart if an enabled interrupt is pending; delivery happens
    /// at the next instruction boundary
    pub fn check_interrupts(&mut self) {
        if self.select_pending_interrupt().is_some() {
            self.signals.wait_event.store(0, Ordering::Relaxed);
        }
    }

    /// Deliver the highest-priority pending interrupt, if any. Called at
    /// instruction boundaries only, so epc lands on a clean PC.
    pub(crate) fn dispatch_interrupts(&mut self) {
        if let Some(cause) = self.select_pending_interrupt() {
            let cause = self.interrupt_mask() | cause;
            self.trap(cause, 0);
        }
    }

    pub(crate) fn mret(&mut self) {
        let status = self.csr.status;
        let mpp = bit_cut(status, 11, 2) as u8;
        let status = bit_replace(status, 3, 1, bit_cut(status, 7, 1)); // MIE = MPIE
        let status = bit_replace(status, 7, 1, 1); // MPIE = 1
        let status = bit_replace(status, 11, 2, 0); // MPP = U
        self.csr.status = status;
        self.registers[REG_PC] = self.csr.epc[Privilege::Machine as usize];
        self.set_priv(Privilege::from(mpp));
        self.check_interrupts();
    }

    pub(crate) fn sret(&mut self) {
        let status = self.csr.status;
        let spp = bit_cut(status, 8, 1) as u8;
        let status = bit_replace(status, 1, 1, bit_cut(status, 5, 1)); // SIE = SPIE
        let status = bit_replace(status, 5, 1, 1); // SPIE = 1
        let status = bit_replace(status, 8, 1, 0); // SPP = U
        self.csr.status = status;
        self.registers[REG_PC] = self.csr.epc[Privilege::Supervisor as usize];
        self.set_priv(Privilege::from(spp));
        self.check_interrupts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::csr::{MIP_MTIP, MSTATUS_MPIE, MSTATUS_SPIE};
    use crate::cpu::test_hart;

    #[test]
    fn test_trap_to_machine() {
        let mut hart = test_hart(true);
        hart.priv_mode = Privilege::User;
        hart.csr.status = MSTATUS_MIE;
        hart.registers[REG_PC] = 0x8000_0040;

        hart.trap(TRAP_ILL_INSTR, 0xDEAD);

        let m = Privilege::Machine as usize;
        assert_eq!(hart.priv_mode, Privilege::Machine);
        assert_eq!(hart.csr.epc[m], 0x8000_0040);
        assert_eq!(hart.csr.cause[m], TRAP_ILL_INSTR);
        assert_eq!(hart.csr.tval[m], 0xDEAD);
        // MPP = U, MPIE = old MIE, MIE = 0
        assert_eq!(bit_cut(hart.csr.status, 11, 2), 0);
        assert_ne!(hart.csr.status & MSTATUS_MPIE, 0);
        assert_eq!(hart.csr.status & MSTATUS_MIE, 0);
        assert!(hart.trap_taken);
    }

    #[test]
    fn test_trap_delegated_to_supervisor() {
        let mut hart = test_hart(true);
        hart.priv_mode = Privilege::User;
        hart.csr.status = MSTATUS_SIE;
        hart.csr.edeleg[Privilege::Machine as usize] = 1 << TRAP_ENVCALL_U;
        hart.registers[REG_PC] = 0x8000_1000;

        hart.trap(TRAP_ENVCALL_U, 0);

        let s = Privilege::Supervisor as usize;
        assert_eq!(hart.priv_mode, Privilege::Supervisor);
        assert_eq!(hart.csr.epc[s], 0x8000_1000);
        assert_eq!(hart.csr.cause[s], TRAP_ENVCALL_U);
        assert_eq!(hart.csr.tval[s], 0);
        // SPP = U, SPIE = old SIE, SIE = 0
        assert_eq!(bit_cut(hart.csr.status, 8, 1), 0);
        assert_ne!(hart.csr.status & MSTATUS_SPIE, 0);
        assert_eq!(hart.csr.status & MSTATUS_SIE, 0);
    }

    #[test]
    fn test_delegation_never_below_current_priv() {
        let mut hart = test_hart(true);
        hart.priv_mode = Privilege::Machine;
        hart.csr.edeleg[Privilege::Machine as usize] = u64::MAX & 0xF7FF;

        hart.trap(TRAP_ILL_INSTR, 0);
        assert_eq!(hart.priv_mode, Privilege::Machine);
        assert_eq!(hart.csr.cause[Privilege::Machine as usize], TRAP_ILL_INSTR);
    }

    #[test]
    fn test_interrupt_dispatch_priority() {
        let mut hart = test_hart(true);
        hart.csr.status = MSTATUS_MIE;
        hart.csr.ie = MIP_MTIP | (1 << INTERRUPT_MEXT);
        hart.interrupt(INTERRUPT_MTIMER);
        hart.interrupt(INTERRUPT_MEXT);

        hart.dispatch_interrupts();
        // External beats timer
        assert_eq!(
            hart.csr.cause[Privilege::Machine as usize],
            (1 << 63) | INTERRUPT_MEXT
        );
    }

    #[test]
    fn test_raised_line_delivered_without_latching() {
        use crate::cpu::csr::MIP_MEIP;
        let mut hart = test_hart(true);
        hart.csr.status = MSTATUS_MIE;
        hart.csr.ie = MIP_MEIP;
        hart.machine.raise_irq(0, INTERRUPT_MEXT);

        hart.dispatch_interrupts();

        assert_eq!(
            hart.csr.cause[Privilege::Machine as usize],
            (1 << 63) | INTERRUPT_MEXT
        );
        // Delivery never latched the level line into ip
        assert_eq!(
            hart.signals.ip.load(std::sync::atomic::Ordering::Acquire) & MIP_MEIP,
            0
        );
    }

    #[test]
    fn test_interrupt_masked_by_mie() {
        let mut hart = test_hart(true);
        hart.csr.ie = MIP_MTIP;
        hart.interrupt(INTERRUPT_MTIMER);
        // MIE clear in M-mode: nothing deliverable
        hart.dispatch_interrupts();
        assert!(!hart.trap_taken);
    }

    #[test]
    fn test_mret_restores() {
        let mut hart = test_hart(true);
        hart.csr.status = bit_replace(MSTATUS_MPIE, 11, 2, Privilege::Supervisor as u64);
        hart.csr.epc[Privilege::Machine as usize] = 0x8000_2000;

        hart.mret();

        assert_eq!(hart.priv_mode, Privilege::Supervisor);
        assert_eq!(hart.registers[REG_PC], 0x8000_2000);
        assert_ne!(hart.csr.status & MSTATUS_MIE, 0);
        assert_eq!(bit_cut(hart.csr.status, 11, 2), 0);
    }

    #[test]
    fn test_sret_restores() {
        let mut hart = test_hart(true);
        hart.priv_mode = Privilege::Supervisor;
        hart.csr.status = MSTATUS_SPIE; // SPP = U
        hart.csr.epc[Privilege::Supervisor as usize] = 0x8000_3000;

        hart.sret();

        assert_eq!(hart.priv_mode, Privilege::User);
        assert_eq!(hart.registers[REG_PC], 0x8000_3000);
        assert_ne!(hart.csr.status & MSTATUS_SIE, 0);
    }
}
