use alloc::vec::Vec;

use log::{debug, error};

use super::adma::{AdmaDesc, AdmaTable, read_desc};
use super::{AdmaAddressing, AdmaQuirks, DmaMemory, DmaRegion};
use crate::common::commands::{DataDir, SgEntry};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;

const CMD_DESC_SIZE: usize = 8;
const CMD_DESCS_PER_REQ: usize = 4;
const CMD_BLOCK_SIZE: usize = CMD_DESC_SIZE * CMD_DESCS_PER_REQ;

static_assertions::const_assert_eq!(CMD_BLOCK_SIZE, 32);
static_assertions::const_assert!(ADMA3_MAX_DEPTH <= 32);

/// Register values one queued request is programmed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adma3Command {
    pub blocks: u32,
    pub blksz: u32,
    pub arg: u32,
    pub command: u16,
    pub mode: u16,
}

/// ADMA3 batch: per request a command descriptor set immediately followed
/// by its ADMA2 chain, plus one integrated descriptor per request.
#[derive(Debug)]
pub struct Adma3Table {
    addressing: AdmaAddressing,
    slots: Vec<(DmaRegion, AdmaTable)>,
    integrated: DmaRegion,
    count: usize,
}

impl Adma3Table {
    pub fn new(
        mem: &dyn DmaMemory,
        addressing: AdmaAddressing,
        depth: usize,
        max_segs: usize,
        quirks: AdmaQuirks,
    ) -> MmcResult<Self> {
        if depth == 0 || depth > ADMA3_MAX_DEPTH {
            return Err(MmcError::InvalidValue);
        }
        let chain_bytes = AdmaTable::desc_bytes(addressing, max_segs);
        let mut slots = Vec::with_capacity(depth);
        for _ in 0..depth {
            let region = mem.alloc(CMD_BLOCK_SIZE + chain_bytes, 8)?;
            let chain_region = DmaRegion {
                addr: region.addr + CMD_BLOCK_SIZE as u64,
                len: chain_bytes,
                align: 8,
            };
            let chain = AdmaTable::with_desc_region(mem, chain_region, addressing, max_segs, quirks)?;
            slots.push((region, chain));
        }
        let integrated = mem.alloc(depth * Self::integrated_stride(addressing), 8)?;
        Ok(Self {
            addressing,
            slots,
            integrated,
            count: 0,
        })
    }

    fn integrated_stride(addressing: AdmaAddressing) -> usize {
        if addressing.is_64bit() { 16 } else { 8 }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Address written to the ADMA3 integrated descriptor register.
    pub fn bus_addr(&self) -> u64 {
        self.integrated.addr
    }

    /// Appends one request to the batch.
    pub fn push(
        &mut self,
        mem: &dyn DmaMemory,
        command: Adma3Command,
        sg: &[SgEntry],
        dir: DataDir,
    ) -> MmcResult<()> {
        if self.is_full() {
            return Err(MmcError::NoMemory);
        }
        let region = self.slots[self.count].0;
        let words = [
            command.blocks,
            command.blksz,
            command.arg,
            ((command.command as u32) << 16) | command.mode as u32,
        ];
        for (i, word) in words.iter().enumerate() {
            let mut raw = [0u8; CMD_DESC_SIZE];
            raw[0..2].copy_from_slice(&ADMA3_CMD_VALID.to_le_bytes());
            raw[4..8].copy_from_slice(&word.to_le_bytes());
            mem.write(region.addr + (i * CMD_DESC_SIZE) as u64, &raw);
        }
        self.slots[self.count].1.build(mem, sg, dir)?;
        self.write_integrated(mem, self.count, ADMA3_INTEGRATED_VALID, region.addr);
        self.count += 1;
        Ok(())
    }

    fn write_integrated(&self, mem: &dyn DmaMemory, index: usize, attr: u16, addr: u64) {
        let stride = Self::integrated_stride(self.addressing);
        let mut raw = [0u8; 16];
        raw[0..2].copy_from_slice(&attr.to_le_bytes());
        if self.addressing.is_64bit() {
            raw[4..12].copy_from_slice(&addr.to_le_bytes());
        } else {
            raw[4..8].copy_from_slice(&(addr as u32).to_le_bytes());
        }
        mem.write(self.integrated.addr + (index * stride) as u64, &raw[..stride]);
    }

    /// Rewrites the final integrated entry with the END attribute. Called
    /// right before the batch is handed to the controller.
    pub fn mark_end(&mut self, mem: &dyn DmaMemory) -> MmcResult<()> {
        let Some(last) = self.count.checked_sub(1) else {
            return Err(MmcError::InvalidValue);
        };
        let addr = self.slots[last].0.addr;
        self.write_integrated(mem, last, ADMA3_INTEGRATED_END, addr);
        debug!("ADMA3 batch of {} sealed at {:#x}", self.count, self.integrated.addr);
        Ok(())
    }

    pub fn integrated_entries(&self, mem: &dyn DmaMemory) -> Vec<AdmaDesc> {
        let stride = Self::integrated_stride(self.addressing) as u64;
        // integrated entries share the ADMA2 32/64-bit address layout
        let layout = if self.addressing.is_64bit() {
            AdmaAddressing::Bits64
        } else {
            AdmaAddressing::Bits32
        };
        (0..self.count as u64)
            .map(|i| read_desc(mem, layout, self.integrated.addr + i * stride))
            .collect()
    }

    /// The four command descriptor words of batch entry `index`.
    pub fn command_words(&self, mem: &dyn DmaMemory, index: usize) -> Option<[u32; 4]> {
        let (region, _) = self.slots.get(index).filter(|_| index < self.count)?;
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut raw = [0u8; CMD_DESC_SIZE];
            mem.read(region.addr + (i * CMD_DESC_SIZE) as u64, &mut raw);
            *word = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        }
        Some(words)
    }

    /// Copies read heads back for entry `index`.
    pub fn finish(&self, mem: &dyn DmaMemory, index: usize, sg: &[SgEntry], dir: DataDir) {
        if let Some((_, chain)) = self.slots.get(index) {
            chain.finish(mem, sg, dir);
        }
    }

    pub fn dump(&self, mem: &dyn DmaMemory) {
        for (i, entry) in self.integrated_entries(mem).iter().enumerate() {
            error!("ADMA3 integrated[{}]: addr {:#x}, attr {:#04x}", i, entry.addr, entry.attr);
            self.slots[i].1.dump(mem);
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}
