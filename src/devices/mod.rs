//! Device models
//!
//! Only the peripherals the core needs to be driven end to end live here:
//! an NS16550A-compatible UART for the console and the CLINT for timer
//! and software interrupts. Everything else belongs to the host embedder.

pub mod clint;
pub mod uart;

pub use clint::Clint;
pub use uart::Uart;

use crate::machine::Machine;

/// A memory-mapped device. Offsets are relative to the zone base; a
/// handler returns false for accesses it does not implement, which the
/// core turns into an access fault.
pub trait MmioDevice: Send + Sync {
    fn read(&self, machine: &Machine, offset: u64, buf: &mut [u8]) -> bool;
    fn write(&self, machine: &Machine, offset: u64, buf: &[u8]) -> bool;

    /// Called periodically from the machine's timer thread
    fn tick(&self, _machine: &Machine) {}
}
