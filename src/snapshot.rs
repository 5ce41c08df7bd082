//! Machine snapshots
//!
//! Captures architectural state only: registers, CSR bank, translation
//! registers, RAM and the timer. The TLB and the JIT heap are caches and
//! come back cold after a restore. Harts must be stopped while a snapshot
//! is taken or applied.

use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::cpu::csr::CsrBank;
use crate::cpu::{Hart, Privilege, REG_PC};
use crate::machine::Machine;

#[derive(Serialize, Deserialize)]
pub struct HartSnapshot {
    pub pc: u64,
    pub regs: [u64; 32],
    pub rv64: bool,
    pub priv_mode: Privilege,
    pub csr: CsrBank,
    pub mmu_mode: u8,
    pub root_page_table: u64,
    pub ip: u64,
    pub stimecmp: u64,
}

impl HartSnapshot {
    pub fn capture(hart: &Hart) -> Self {
        let mut regs = [0u64; 32];
        regs.copy_from_slice(&hart.registers[..32]);
        HartSnapshot {
            pc: hart.registers[REG_PC],
            regs,
            rv64: hart.rv64,
            priv_mode: hart.priv_mode,
            csr: hart.csr.clone(),
            mmu_mode: hart.mmu_mode,
            root_page_table: hart.root_page_table,
            ip: hart.signals.ip.load(Ordering::Acquire),
            stimecmp: hart.signals.stimecmp.get(),
        }
    }

    pub fn apply(&self, hart: &mut Hart) {
        hart.registers[..32].copy_from_slice(&self.regs);
        hart.registers[REG_PC] = self.pc;
        hart.rv64 = self.rv64;
        hart.priv_mode = self.priv_mode;
        hart.csr = self.csr.clone();
        hart.mmu_mode = self.mmu_mode;
        hart.root_page_table = self.root_page_table;
        hart.signals.ip.store(self.ip, Ordering::Release);
        hart.signals.stimecmp.set(self.stimecmp);
        hart.tlb_flush();
    }
}

#[derive(Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub version: u32,
    pub mem_base: u64,
    pub timer: u64,
    pub harts: Vec<HartSnapshot>,
    pub ram: Vec<u8>,
}

impl MachineSnapshot {
    pub const VERSION: u32 = 1;

    pub fn capture(machine: &Machine, harts: &[Hart]) -> Result<Self, String> {
        let mem = machine.mem();
        let mut ram = vec![0u8; mem.size()];
        if !mem.read(mem.begin(), &mut ram) {
            return Err("failed to read guest RAM".into());
        }
        Ok(MachineSnapshot {
            version: Self::VERSION,
            mem_base: mem.begin(),
            timer: machine.timer().get(),
            harts: harts.iter().map(HartSnapshot::capture).collect(),
            ram,
        })
    }

    pub fn restore(&self, machine: &Machine, harts: &mut [Hart]) -> Result<(), String> {
        if self.version != Self::VERSION {
            return Err(format!("unsupported snapshot version {}", self.version));
        }
        let mem = machine.mem();
        if self.mem_base != mem.begin() || self.ram.len() != mem.size() {
            return Err("snapshot RAM layout does not match this machine".into());
        }
        if self.harts.len() != harts.len() {
            return Err("snapshot hart count does not match this machine".into());
        }
        // Goes through write_ram so compiled code over restored pages dies
        if !machine.write_ram(mem.begin(), &self.ram) {
            return Err("failed to restore guest RAM".into());
        }
        machine.timer().rebase(self.timer);
        for (snapshot, hart) in self.harts.iter().zip(harts.iter_mut()) {
            snapshot.apply(hart);
        }
        Ok(())
    }

    /// Serialize, zstd-compressed
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        let serialized =
            bincode::serialize(self).map_err(|err| format!("serialization error: {}", err))?;
        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|err| format!("compression error: {}", err))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        let decompressed = zstd::stream::decode_all(data)
            .map_err(|err| format!("decompression error: {}", err))?;
        bincode::deserialize(&decompressed).map_err(|err| format!("deserialization error: {}", err))
    }
}
