//! Machine: shared state and lifecycle
//!
//! Owns guest RAM, the timer, the MMIO map and the optional JIT cache.
//! Harts run on their own OS threads and reach everything shared through
//! an `Arc<Machine>`; cross-hart signalling (interrupt pending bits,
//! wait_event, the supervisor timer comparator) lives in per-hart
//! `HartSignals` blocks so devices and other harts can poke them without
//! touching hart-private state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cpu::Hart;
use crate::devices::MmioDevice;
use crate::jit::JitCache;
use crate::mem::PhysMem;
use crate::timer::{RvTimer, Timecmp, TIMER_FREQ};

pub struct MachineConfig {
    pub mem_base: u64,
    pub mem_size: usize,
    pub smp: u32,
    pub rv64: bool,
    pub jit: bool,
    pub jit_heap_size: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            mem_base: 0x8000_0000,
            mem_size: 256 << 20,
            smp: 1,
            rv64: false,
            jit: true,
            jit_heap_size: 16 << 20,
        }
    }
}

/// Cross-thread hart state: anything another hart, a device or the timer
/// thread may touch while the hart is running.
pub struct HartSignals {
    /// Latched interrupt-pending bitmask
    pub ip: AtomicU64,
    /// Level-triggered lines currently asserted by devices; visible on ip
    /// reads and to interrupt delivery without ever being latched
    pub raised: AtomicU64,
    /// Cleared to break the hart out of its hot loop
    pub wait_event: AtomicU32,
    /// Supervisor timer comparator (sstc)
    pub stimecmp: Timecmp,
}

struct MmioZone {
    base: u64,
    size: u64,
    dev: Arc<dyn MmioDevice>,
}

pub struct Machine {
    mem: PhysMem,
    timer: RvTimer,
    rv64: bool,
    smp: u32,
    mmio: Vec<MmioZone>,
    jit: Option<JitCache>,
    signals: Vec<Arc<HartSignals>>,
    running: AtomicBool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Machine, String> {
        if config.smp == 0 || config.smp > 1024 {
            return Err(format!("invalid hart count: {}", config.smp));
        }
        let mem = PhysMem::new(config.mem_base, config.mem_size)?;
        let jit = if config.jit {
            match JitCache::new(config.jit_heap_size, config.mem_size) {
                Ok(jit) => Some(jit),
                Err(err) => {
                    // Boot-time failure only disables the translator
                    log::warn!("{}, running interpreter-only", err);
                    None
                }
            }
        } else {
            None
        };
        let signals = (0..config.smp)
            .map(|_| {
                Arc::new(HartSignals {
                    ip: AtomicU64::new(0),
                    raised: AtomicU64::new(0),
                    wait_event: AtomicU32::new(0),
                    stimecmp: Timecmp::new(),
                })
            })
            .collect();
        Ok(Machine {
            mem,
            timer: RvTimer::new(TIMER_FREQ),
            rv64: config.rv64,
            smp: config.smp,
            mmio: Vec::new(),
            jit,
            signals,
            running: AtomicBool::new(false),
        })
    }

    #[inline(always)]
    pub fn rv64(&self) -> bool {
        self.rv64
    }

    pub fn smp(&self) -> u32 {
        self.smp
    }

    #[inline(always)]
    pub fn mem(&self) -> &PhysMem {
        &self.mem
    }

    #[inline(always)]
    pub fn timer(&self) -> &RvTimer {
        &self.timer
    }

    #[inline(always)]
    pub fn jit(&self) -> Option<&JitCache> {
        self.jit.as_ref()
    }

    #[inline(always)]
    pub fn jit_mark_dirty(&self, paddr: u64, size: usize) {
        if let Some(jit) = &self.jit {
            jit.mark_dirty_mem(paddr, size);
        }
    }

    pub fn signals(&self, hartid: usize) -> Arc<HartSignals> {
        self.signals[hartid].clone()
    }

    /// Map a device at `[base, base + size)`. Devices are attached before
    /// the machine starts; the map is immutable afterwards.
    pub fn attach_mmio(&mut self, base: u64, size: u64, dev: Arc<dyn MmioDevice>) {
        self.mmio.push(MmioZone { base, size, dev });
    }

    pub fn mmio_read(&self, paddr: u64, buf: &mut [u8]) -> bool {
        for zone in &self.mmio {
            if paddr >= zone.base && paddr + buf.len() as u64 <= zone.base + zone.size {
                return zone.dev.read(self, paddr - zone.base, buf);
            }
        }
        false
    }

    pub fn mmio_write(&self, paddr: u64, buf: &[u8]) -> bool {
        for zone in &self.mmio {
            if paddr >= zone.base && paddr + buf.len() as u64 <= zone.base + zone.size {
                return zone.dev.write(self, paddr - zone.base, buf);
            }
        }
        false
    }

    /// Host-side physical read, bounded by the RAM window
    pub fn read_ram(&self, paddr: u64, buf: &mut [u8]) -> bool {
        self.mem.read(paddr, buf)
    }

    /// Host-side physical write. Invalidates any compiled code over the
    /// touched pages.
    pub fn write_ram(&self, paddr: u64, buf: &[u8]) -> bool {
        if !self.mem.write(paddr, buf) {
            return false;
        }
        self.jit_mark_dirty(paddr, buf.len());
        true
    }

    /// Post an interrupt cause to a hart and wake it
    pub fn interrupt(&self, hartid: usize, cause: u64) {
        let signals = &self.signals[hartid];
        let old = signals.ip.fetch_or(1 << cause, Ordering::AcqRel);
        if old & (1 << cause) == 0 {
            signals.wait_event.store(0, Ordering::Release);
        }
    }

    pub fn interrupt_clear(&self, hartid: usize, cause: u64) {
        self.signals[hartid]
            .ip
            .fetch_and(!(1u64 << cause), Ordering::AcqRel);
    }

    /// Assert a level-triggered interrupt line. The hart sees it on every
    /// ip read and interrupt check until the device lowers it again; the
    /// line is never latched into ip.
    pub fn raise_irq(&self, hartid: usize, cause: u64) {
        let signals = &self.signals[hartid];
        let old = signals.raised.fetch_or(1 << cause, Ordering::AcqRel);
        if old & (1 << cause) == 0 {
            signals.wait_event.store(0, Ordering::Release);
        }
    }

    pub fn lower_irq(&self, hartid: usize, cause: u64) {
        self.signals[hartid]
            .raised
            .fetch_and(!(1u64 << cause), Ordering::AcqRel);
    }

    /// Interrupt lines currently asserted by devices for this hart
    pub fn raised_interrupts(&self, hartid: usize) -> u64 {
        self.signals[hartid].raised.load(Ordering::Acquire)
    }

    pub fn ip_pending(&self, hartid: usize, cause: u64) -> bool {
        self.signals[hartid].ip.load(Ordering::Acquire) & (1 << cause) != 0
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn one thread per hart plus the timer thread. Harts start at
    /// the RAM base with the DTB address (if any) in a1.
    pub fn start(self: &Arc<Self>, dtb_addr: Option<u64>) -> Vec<JoinHandle<()>> {
        self.running.store(true, Ordering::Release);
        let mut handles = Vec::new();
        for hartid in 0..self.smp as usize {
            let machine = self.clone();
            handles.push(std::thread::spawn(move || {
                let mut hart = Hart::new(machine, hartid);
                if let Some(dtb) = dtb_addr {
                    hart.registers[11] = dtb; // a1
                }
                hart.run();
            }));
        }
        let machine = self.clone();
        handles.push(std::thread::spawn(move || machine.timer_loop()));
        handles
    }

    /// Stop all harts at their next instruction boundary
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for signals in &self.signals {
            signals.wait_event.store(0, Ordering::Release);
        }
    }

    fn timer_loop(&self) {
        use crate::cpu::trap::INTERRUPT_STIMER;
        while self.is_running() {
            for (hartid, signals) in self.signals.iter().enumerate() {
                if signals.stimecmp.pending(&self.timer) {
                    self.interrupt(hartid, INTERRUPT_STIMER);
                }
            }
            for zone in &self.mmio {
                zone.dev.tick(self);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine::new(MachineConfig {
            mem_base: 0x8000_0000,
            mem_size: 0x10000,
            smp: 2,
            rv64: true,
            jit: true,
            jit_heap_size: 0x10000,
        })
        .unwrap()
    }

    #[test]
    fn test_smp_bounds() {
        let mut cfg = MachineConfig::default();
        cfg.smp = 0;
        assert!(Machine::new(cfg).is_err());
        let mut cfg = MachineConfig::default();
        cfg.mem_size = 0x10000;
        cfg.smp = 1025;
        assert!(Machine::new(cfg).is_err());
    }

    #[test]
    fn test_ram_window() {
        let m = machine();
        assert!(m.write_ram(0x8000_0000, &[1, 2, 3]));
        let mut buf = [0u8; 3];
        assert!(m.read_ram(0x8000_0000, &mut buf));
        assert_eq!(buf, [1, 2, 3]);
        assert!(!m.write_ram(0x8000_FFFF, &[0, 0]));
        assert!(!m.read_ram(0x7FFF_FFFF, &mut buf));
    }

    #[test]
    fn test_write_ram_invalidates_blocks() {
        let m = machine();
        let jit = m.jit().unwrap();
        let mut block = crate::jit::JitBlock::new();
        block.init(0x8000_0000);
        block.emit(&[0xC3]);
        jit.block_finalize(&mut block).unwrap();

        m.write_ram(0x8000_0010, &[0]);
        assert!(jit.block_lookup(0x8000_0000).is_none());
    }

    #[test]
    fn test_interrupt_posting_wakes_hart() {
        let m = machine();
        m.signals(1).wait_event.store(1, Ordering::Release);
        m.interrupt(1, 7);
        assert!(m.ip_pending(1, 7));
        assert_eq!(m.signals(1).wait_event.load(Ordering::Acquire), 0);

        // Re-posting a latched cause does not wake again
        m.signals(1).wait_event.store(1, Ordering::Release);
        m.interrupt(1, 7);
        assert_eq!(m.signals(1).wait_event.load(Ordering::Acquire), 1);

        m.interrupt_clear(1, 7);
        assert!(!m.ip_pending(1, 7));
    }

    #[test]
    fn test_raised_lines_track_device_state() {
        let m = machine();
        m.signals(0).wait_event.store(1, Ordering::Release);
        m.raise_irq(0, 9);
        assert_ne!(m.raised_interrupts(0) & (1 << 9), 0);
        assert_eq!(m.signals(0).wait_event.load(Ordering::Acquire), 0);
        // The line never reaches the latch
        assert!(!m.ip_pending(0, 9));

        m.lower_irq(0, 9);
        assert_eq!(m.raised_interrupts(0), 0);
    }

    #[test]
    fn test_mmio_dispatch() {
        use crate::cpu::trap::INTERRUPT_MEXT;
        use crate::devices::Uart;
        let mut m = machine();
        let uart = Arc::new(Uart::new(INTERRUPT_MEXT));
        m.attach_mmio(0x1000_0000, 0x1000, uart.clone());

        assert!(m.mmio_write(0x1000_0000, &[b'!']));
        assert_eq!(uart.drain_output(), b"!");
        let mut buf = [0u8];
        assert!(m.mmio_read(0x1000_0005, &mut buf));
        // Unmapped hole
        assert!(!m.mmio_read(0x2000_0000, &mut buf));
    }
}
