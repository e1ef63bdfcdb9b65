use alloc::vec;
use alloc::vec::Vec;

use log::{error, trace};

use super::{AdmaAddressing, AdmaQuirks, DmaMemory, DmaRegion, zero_region};
use crate::common::commands::{DataDir, SgEntry};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;

/// Bytes reserved per scatter entry for its misaligned prefix.
const ALIGN_SLOT: usize = 4;

/// A decoded ADMA descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmaDesc {
    pub attr: u16,
    pub len: u16,
    pub addr: u64,
}

impl AdmaDesc {
    /// Transfer length, with the zero field standing for 64 KiB.
    pub fn byte_len(&self) -> u32 {
        if self.len == 0 && self.attr & 0x30 == 0x20 {
            ADMA_MAX_DESC_LEN
        } else {
            self.len as u32
        }
    }

    pub fn is_tran(&self) -> bool {
        self.attr & 0x30 == 0x20
    }
}

pub(crate) fn write_desc(
    mem: &dyn DmaMemory,
    addressing: AdmaAddressing,
    at: u64,
    attr: u16,
    len: u16,
    addr: u64,
) {
    let mut raw = [0u8; 16];
    raw[0..2].copy_from_slice(&attr.to_le_bytes());
    raw[2..4].copy_from_slice(&len.to_le_bytes());
    if addressing.is_64bit() {
        raw[4..12].copy_from_slice(&addr.to_le_bytes());
    } else {
        raw[4..8].copy_from_slice(&(addr as u32).to_le_bytes());
    }
    mem.write(at, &raw[..addressing.desc_stride()]);
}

pub(crate) fn read_desc(mem: &dyn DmaMemory, addressing: AdmaAddressing, at: u64) -> AdmaDesc {
    let mut raw = [0u8; 16];
    mem.read(at, &mut raw[..addressing.desc_stride()]);
    let addr = if addressing.is_64bit() {
        u64::from_le_bytes([raw[4], raw[5], raw[6], raw[7], raw[8], raw[9], raw[10], raw[11]])
    } else {
        u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as u64
    };
    AdmaDesc {
        attr: u16::from_le_bytes([raw[0], raw[1]]),
        len: u16::from_le_bytes([raw[2], raw[3]]),
        addr,
    }
}

/// An ADMA2 descriptor chain plus the align buffer holding the unaligned
/// head of each scatter entry.
#[derive(Debug)]
pub struct AdmaTable {
    addressing: AdmaAddressing,
    quirks: AdmaQuirks,
    desc: DmaRegion,
    align: DmaRegion,
    max_segs: usize,
    count: usize,
}

impl AdmaTable {
    /// Bytes of descriptor memory needed for `max_segs` scatter entries.
    pub fn desc_bytes(addressing: AdmaAddressing, max_segs: usize) -> usize {
        (max_segs * 2 + 1) * addressing.desc_stride()
    }

    pub fn new(
        mem: &dyn DmaMemory,
        addressing: AdmaAddressing,
        max_segs: usize,
        quirks: AdmaQuirks,
    ) -> MmcResult<Self> {
        let desc = mem.alloc(Self::desc_bytes(addressing, max_segs), 8)?;
        Self::with_desc_region(mem, desc, addressing, max_segs, quirks)
    }

    /// Builds a table whose descriptors live in a caller-provided region.
    pub fn with_desc_region(
        mem: &dyn DmaMemory,
        desc: DmaRegion,
        addressing: AdmaAddressing,
        max_segs: usize,
        quirks: AdmaQuirks,
    ) -> MmcResult<Self> {
        if desc.len < Self::desc_bytes(addressing, max_segs) {
            return Err(MmcError::InvalidValue);
        }
        let align = mem.alloc(max_segs * ALIGN_SLOT, ALIGN_SLOT)?;
        Ok(Self {
            addressing,
            quirks,
            desc,
            align,
            max_segs,
            count: 0,
        })
    }

    pub fn addressing(&self) -> AdmaAddressing {
        self.addressing
    }

    /// Bus address the controller is pointed at.
    pub fn bus_addr(&self) -> u64 {
        self.desc.addr
    }

    pub fn align_addr(&self) -> u64 {
        self.align.addr
    }

    /// Descriptors written by the last [`AdmaTable::build`], terminator included.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Writes the descriptor chain for `sg`.
    ///
    /// A scatter entry starting off a 4-byte boundary is split: its first
    /// `(4 - addr % 4) % 4` bytes go through the align buffer, the rest is
    /// described in place. Writes copy the head into the align buffer now;
    /// reads copy it back in [`AdmaTable::finish`].
    pub fn build(&mut self, mem: &dyn DmaMemory, sg: &[SgEntry], dir: DataDir) -> MmcResult<()> {
        if sg.is_empty() {
            return Err(MmcError::InvalidValue);
        }
        if sg.len() > self.max_segs {
            return Err(MmcError::Overflow);
        }
        let stride = self.addressing.desc_stride() as u64;
        let max_len = self.quirks.max_desc_len();
        let mut at = self.desc.addr;
        let mut align_addr = self.align.addr;
        self.count = 0;

        for entry in sg {
            let mut addr = entry.addr;
            let mut len = entry.len;

            let offset = (((4 - (addr & 0x3)) & 0x3) as u32).min(len);
            if offset > 0 {
                if dir == DataDir::Write {
                    let mut head = [0u8; ALIGN_SLOT];
                    mem.read(addr, &mut head[..offset as usize]);
                    mem.write(align_addr, &head[..offset as usize]);
                }
                write_desc(mem, self.addressing, at, ADMA2_TRAN_VALID, offset as u16, align_addr);
                at += stride;
                self.count += 1;
                addr += offset as u64;
                len -= offset;
            }
            align_addr += ALIGN_SLOT as u64;

            if len == 0 {
                continue;
            }
            if len > max_len {
                error!("ADMA segment of {} bytes exceeds descriptor limit {}", len, max_len);
                return Err(MmcError::Overflow);
            }
            // A length of 65536 is encoded as zero.
            write_desc(mem, self.addressing, at, ADMA2_TRAN_VALID, len as u16, addr);
            at += stride;
            self.count += 1;
        }

        if self.count == 0 {
            error!("ADMA table at {:#x}: scatter list carries no data", self.desc.addr);
            return Err(MmcError::InvalidValue);
        }
        if self.quirks.no_endattr_in_nopdesc {
            let last = at - stride;
            let desc = read_desc(mem, self.addressing, last);
            write_desc(mem, self.addressing, last, desc.attr | ADMA2_NOP_END_VALID, desc.len, desc.addr);
        } else {
            write_desc(mem, self.addressing, at, ADMA2_NOP_END_VALID, 0, 0);
            self.count += 1;
        }
        trace!("ADMA table at {:#x}: {} descriptors", self.desc.addr, self.count);
        Ok(())
    }

    /// Post-transfer fixup: copies the misaligned heads of a read back into
    /// the caller's buffers.
    pub fn finish(&self, mem: &dyn DmaMemory, sg: &[SgEntry], dir: DataDir) {
        if dir != DataDir::Read {
            return;
        }
        let mut align_addr = self.align.addr;
        for entry in sg {
            let offset = (((4 - (entry.addr & 0x3)) & 0x3) as u32).min(entry.len) as usize;
            if offset > 0 {
                let mut head = [0u8; ALIGN_SLOT];
                mem.read(align_addr, &mut head[..offset]);
                mem.write(entry.addr, &head[..offset]);
            }
            align_addr += ALIGN_SLOT as u64;
        }
    }

    pub fn descriptors(&self, mem: &dyn DmaMemory) -> Vec<AdmaDesc> {
        let stride = self.addressing.desc_stride() as u64;
        (0..self.count as u64)
            .map(|i| read_desc(mem, self.addressing, self.desc.addr + i * stride))
            .collect()
    }

    /// Logs the chain, used when the controller flags an ADMA error.
    pub fn dump(&self, mem: &dyn DmaMemory) {
        for (i, desc) in self.descriptors(mem).iter().enumerate() {
            error!(
                "ADMA desc[{}]: addr {:#x}, len {:#06x}, attr {:#04x}",
                i, desc.addr, desc.len, desc.attr
            );
        }
    }

    pub fn clear(&mut self, mem: &dyn DmaMemory) {
        zero_region(mem, &self.desc);
        mem.write(self.align.addr, &vec![0u8; self.align.len]);
        self.count = 0;
    }

    pub fn release(self, mem: &dyn DmaMemory) {
        mem.free(self.desc);
        mem.free(self.align);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::ram::RamMemory;

    fn table(mem: &RamMemory, addressing: AdmaAddressing, quirks: AdmaQuirks) -> AdmaTable {
        AdmaTable::new(mem, addressing, 8, quirks).unwrap()
    }

    #[test]
    fn misaligned_entries_get_prefix_descriptor() {
        let mem = RamMemory::new();
        let mut t = table(&mem, AdmaAddressing::Bits32, AdmaQuirks::default());
        let sg: Vec<SgEntry> = (1..=3)
            .map(|mis| SgEntry::new(mem.buffer(1000, mis), 1000))
            .chain([SgEntry::new(mem.buffer(512, 0), 512)])
            .collect();
        t.build(&mem, &sg, DataDir::Read).unwrap();

        let descs = t.descriptors(&mem);
        // three split entries, one aligned entry, one terminator
        assert_eq!(descs.len(), 3 * 2 + 1 + 1);
        for (i, entry) in sg.iter().take(3).enumerate() {
            let head = descs[i * 2];
            let body = descs[i * 2 + 1];
            let offset = (4 - (entry.addr & 3)) & 3;
            assert_eq!(head.attr, ADMA2_TRAN_VALID);
            assert_eq!(head.len as u64, offset);
            assert_eq!(head.addr, t.align_addr() + 4 * i as u64);
            assert_eq!(body.addr, entry.addr + offset);
            assert_eq!(body.addr % 4, 0);
            assert_eq!(head.byte_len() + body.byte_len(), entry.len);
        }
        let total: u32 = descs.iter().filter(|d| d.is_tran()).map(|d| d.byte_len()).sum();
        assert_eq!(total, 1000 * 3 + 512);
        assert_eq!(descs.last().unwrap().attr, ADMA2_NOP_END_VALID);
    }

    #[test]
    fn write_heads_are_staged_and_read_heads_copied_back() {
        let mem = RamMemory::new();
        let mut t = table(&mem, AdmaAddressing::Bits64, AdmaQuirks::default());
        let buf = mem.buffer(16, 1);
        mem.fill(buf, &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4, 5, 6]);
        let sg = [SgEntry::new(buf, 16)];

        t.build(&mem, &sg, DataDir::Write).unwrap();
        assert_eq!(mem.dump(t.align_addr(), 3), [9, 8, 7]);

        t.build(&mem, &sg, DataDir::Read).unwrap();
        mem.fill(t.align_addr(), &[0xAA, 0xBB, 0xCC]);
        t.finish(&mem, &sg, DataDir::Read);
        assert_eq!(mem.dump(buf, 4), [0xAA, 0xBB, 0xCC, 6]);
    }

    #[test]
    fn end_attribute_moves_onto_last_descriptor() {
        let mem = RamMemory::new();
        let quirks = AdmaQuirks {
            no_endattr_in_nopdesc: true,
            broken_zerolen_desc: false,
        };
        let mut t = table(&mem, AdmaAddressing::Bits64V4, quirks);
        let sg = [SgEntry::new(mem.buffer(512, 0), 512), SgEntry::new(mem.buffer(64, 2), 64)];
        t.build(&mem, &sg, DataDir::Write).unwrap();

        let descs = t.descriptors(&mem);
        assert_eq!(descs.len(), 3);
        assert_eq!(descs[2].attr, ADMA2_TRAN_VALID | ADMA2_NOP_END_VALID);
        assert_eq!(descs[2].len, 62);
    }

    #[test]
    fn empty_scatter_entries_leave_memory_before_the_table_alone() {
        let mem = RamMemory::new();
        let quirks = AdmaQuirks {
            no_endattr_in_nopdesc: true,
            broken_zerolen_desc: false,
        };
        let mut t = table(&mem, AdmaAddressing::Bits64, quirks);
        let sg = [SgEntry::new(mem.buffer(512, 0), 0)];
        assert_eq!(t.build(&mem, &sg, DataDir::Write), Err(MmcError::InvalidValue));
        assert!(t.descriptors(&mem).is_empty());

        let mut t = table(&mem, AdmaAddressing::Bits32, AdmaQuirks::default());
        assert_eq!(t.build(&mem, &sg, DataDir::Read), Err(MmcError::InvalidValue));
    }

    #[test]
    fn oversized_segment_overflows() {
        let mem = RamMemory::new();
        let quirks = AdmaQuirks {
            no_endattr_in_nopdesc: false,
            broken_zerolen_desc: true,
        };
        let mut t = table(&mem, AdmaAddressing::Bits32, quirks);
        let sg = [SgEntry::new(RAM_BASE_ALIGNED, 65536)];
        assert_eq!(t.build(&mem, &sg, DataDir::Read), Err(MmcError::Overflow));

        let mut t = table(&mem, AdmaAddressing::Bits32, AdmaQuirks::default());
        t.build(&mem, &sg, DataDir::Read).unwrap();
        assert_eq!(t.descriptors(&mem)[0].len, 0);
        assert_eq!(t.descriptors(&mem)[0].byte_len(), 65536);

        let many: Vec<SgEntry> = (0..9).map(|i| SgEntry::new(RAM_BASE_ALIGNED + i * 512, 512)).collect();
        assert_eq!(t.build(&mem, &many, DataDir::Read), Err(MmcError::Overflow));
    }

    const RAM_BASE_ALIGNED: u64 = crate::dma::ram::RAM_BASE;
}
