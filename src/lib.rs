//! riscvm — RISC-V system emulator core
//!
//! A hart interpreter with the full privileged plumbing: CSR file,
//! SV32/SV39/SV48/SV57 page walker behind a direct-mapped TLB,
//! trap/interrupt delivery with machine-to-supervisor delegation, and a
//! code cache for an optional block-level binary translator that shares
//! the physical address space with the interpreter.

pub mod atomics;
pub mod bitops;
pub mod blkio;
pub mod cpu;
pub mod devices;
pub mod jit;
pub mod machine;
pub mod mem;
pub mod snapshot;
pub mod spinlock;
pub mod timer;

pub use cpu::{Hart, Privilege};
pub use machine::{Machine, MachineConfig};
