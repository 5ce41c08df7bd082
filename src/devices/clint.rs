//! Core Local Interruptor
//!
//! SiFive CLINT layout: per-hart msip words at 0x0, per-hart mtimecmp at
//! 0x4000, mtime at 0xBFF8. Drives the machine timer and software
//! interrupt lines; the machine's timer thread calls `tick` to keep MTIP
//! level-accurate between guest accesses.

use std::sync::atomic::{AtomicU64, Ordering};

use super::MmioDevice;
use crate::cpu::trap::{INTERRUPT_MSOFT, INTERRUPT_MTIMER};
use crate::machine::Machine;

pub const CLINT_SIZE: u64 = 0x10000;

const CLINT_MSIP: u64 = 0x0;
const CLINT_MTIMECMP: u64 = 0x4000;
const CLINT_MTIME: u64 = 0xBFF8;

pub struct Clint {
    mtimecmp: Vec<AtomicU64>,
}

impl Clint {
    pub fn new(smp: u32) -> Self {
        Clint {
            mtimecmp: (0..smp).map(|_| AtomicU64::new(u64::MAX)).collect(),
        }
    }

    fn update_mtip(&self, machine: &Machine, hartid: usize) {
        if machine.timer().get() >= self.mtimecmp[hartid].load(Ordering::Acquire) {
            machine.interrupt(hartid, INTERRUPT_MTIMER);
        } else {
            machine.interrupt_clear(hartid, INTERRUPT_MTIMER);
        }
    }

    fn reg_read(&self, machine: &Machine, offset: u64) -> Option<u64> {
        let harts = self.mtimecmp.len() as u64;
        if offset < CLINT_MSIP + harts * 4 {
            let hartid = ((offset - CLINT_MSIP) / 4) as usize;
            return Some(machine.ip_pending(hartid, INTERRUPT_MSOFT) as u64);
        }
        if (CLINT_MTIMECMP..CLINT_MTIMECMP + harts * 8).contains(&offset) {
            let hartid = ((offset - CLINT_MTIMECMP) / 8) as usize;
            return Some(self.mtimecmp[hartid].load(Ordering::Acquire));
        }
        if offset == CLINT_MTIME {
            return Some(machine.timer().get());
        }
        None
    }
}

impl MmioDevice for Clint {
    fn read(&self, machine: &Machine, offset: u64, buf: &mut [u8]) -> bool {
        let size = buf.len();
        if size != 4 && size != 8 {
            return false;
        }
        // 32-bit accesses to 64-bit registers hit the aligned halves
        let reg = offset & !7;
        let value = match self.reg_read(machine, if offset >= CLINT_MTIMECMP { reg } else { offset })
        {
            Some(v) => v,
            None => return false,
        };
        let value = if size == 4 && offset & 4 != 0 {
            value >> 32
        } else {
            value
        };
        buf.copy_from_slice(&value.to_le_bytes()[..size]);
        true
    }

    fn write(&self, machine: &Machine, offset: u64, buf: &[u8]) -> bool {
        let size = buf.len();
        if size != 4 && size != 8 {
            return false;
        }
        let mut bytes = [0u8; 8];
        bytes[..size].copy_from_slice(buf);
        let value = u64::from_le_bytes(bytes);

        if offset < CLINT_MSIP + self.mtimecmp.len() as u64 * 4 {
            let hartid = (offset / 4) as usize;
            if value & 1 != 0 {
                machine.interrupt(hartid, INTERRUPT_MSOFT);
            } else {
                machine.interrupt_clear(hartid, INTERRUPT_MSOFT);
            }
            return true;
        }

        if (CLINT_MTIMECMP..CLINT_MTIMECMP + self.mtimecmp.len() as u64 * 8).contains(&offset) {
            let hartid = ((offset - CLINT_MTIMECMP) / 8) as usize;
            let cmp = &self.mtimecmp[hartid];
            let new = match size {
                8 => value,
                _ if offset & 4 != 0 => {
                    let old = cmp.load(Ordering::Acquire);
                    (old & 0xFFFF_FFFF) | (value << 32)
                }
                _ => {
                    let old = cmp.load(Ordering::Acquire);
                    (old & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF)
                }
            };
            cmp.store(new, Ordering::Release);
            self.update_mtip(machine, hartid);
            return true;
        }

        if offset & !7 == CLINT_MTIME {
            let now = machine.timer().get();
            let new = match size {
                8 => value,
                _ if offset & 4 != 0 => (now & 0xFFFF_FFFF) | (value << 32),
                _ => (now & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF),
            };
            machine.timer().rebase(new);
            return true;
        }
        false
    }

    fn tick(&self, machine: &Machine) {
        for hartid in 0..self.mtimecmp.len() {
            // Only raise; lowering happens on mtimecmp writes
            if machine.timer().get() >= self.mtimecmp[hartid].load(Ordering::Acquire) {
                machine.interrupt(hartid, INTERRUPT_MTIMER);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn machine() -> Arc<Machine> {
        Arc::new(
            Machine::new(crate::machine::MachineConfig {
                mem_base: 0x8000_0000,
                mem_size: 0x10000,
                smp: 2,
                rv64: true,
                jit: false,
                jit_heap_size: 0,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_msip_posts_software_interrupt() {
        let m = machine();
        let clint = Clint::new(2);
        clint.write(&m, CLINT_MSIP + 4, &1u32.to_le_bytes());
        assert!(m.ip_pending(1, INTERRUPT_MSOFT));
        assert!(!m.ip_pending(0, INTERRUPT_MSOFT));
        clint.write(&m, CLINT_MSIP + 4, &0u32.to_le_bytes());
        assert!(!m.ip_pending(1, INTERRUPT_MSOFT));
    }

    #[test]
    fn test_mtimecmp_level() {
        let m = machine();
        let clint = Clint::new(2);
        // Expired comparator raises MTIP immediately
        clint.write(&m, CLINT_MTIMECMP, &0u64.to_le_bytes());
        assert!(m.ip_pending(0, INTERRUPT_MTIMER));
        // Pushing it into the future lowers it
        clint.write(&m, CLINT_MTIMECMP, &u64::MAX.to_le_bytes());
        assert!(!m.ip_pending(0, INTERRUPT_MTIMER));
    }

    #[test]
    fn test_mtime_read_and_rebase() {
        let m = machine();
        let clint = Clint::new(2);
        let mut buf = [0u8; 8];
        assert!(clint.read(&m, CLINT_MTIME, &mut buf));
        let t0 = u64::from_le_bytes(buf);
        clint.write(&m, CLINT_MTIME, &(t0 + 1_000_000_000).to_le_bytes());
        clint.read(&m, CLINT_MTIME, &mut buf);
        assert!(u64::from_le_bytes(buf) >= t0 + 1_000_000_000);
    }

    #[test]
    fn test_tick_raises_mtip() {
        let m = machine();
        let clint = Clint::new(2);
        clint.mtimecmp[0].store(0, Ordering::Release);
        clint.tick(&m);
        assert!(m.ip_pending(0, INTERRUPT_MTIMER));
        assert!(!m.ip_pending(1, INTERRUPT_MTIMER));
    }
}
