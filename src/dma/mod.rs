//! DMA descriptor construction: ADMA2 chains, ADMA3 batches and the
//! whole-transfer bounce buffer.

pub mod adma;
pub mod adma3;
pub mod bounce;

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec;

use crate::common::commands::SgEntry;
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;

/// A span of DMA-visible memory, addressed as the controller sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub addr: u64,
    pub len: usize,
    pub align: usize,
}

/// CPU access to DMA-visible memory by bus address.
pub trait DmaMemory: Send + Sync {
    fn read(&self, addr: u64, buf: &mut [u8]);
    fn write(&self, addr: u64, data: &[u8]);
    fn alloc(&self, len: usize, align: usize) -> MmcResult<DmaRegion>;
    fn free(&self, region: DmaRegion);
}

/// Identity-mapped memory: bus addresses are CPU addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysMemory;

impl DmaMemory for PhysMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        unsafe {
            ::core::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len());
        }
    }

    fn write(&self, addr: u64, data: &[u8]) {
        unsafe {
            ::core::ptr::copy_nonoverlapping(data.as_ptr(), addr as usize as *mut u8, data.len());
        }
    }

    fn alloc(&self, len: usize, align: usize) -> MmcResult<DmaRegion> {
        let layout = Layout::from_size_align(len.max(1), align).map_err(|_| MmcError::InvalidValue)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MmcError::NoMemory);
        }
        Ok(DmaRegion {
            addr: ptr as usize as u64,
            len,
            align,
        })
    }

    fn free(&self, region: DmaRegion) {
        if let Ok(layout) = Layout::from_size_align(region.len.max(1), region.align) {
            unsafe { dealloc(region.addr as usize as *mut u8, layout) };
        }
    }
}

/// Gathers the bytes described by `sg` into `buf`. Returns the count copied.
pub fn sg_copy_to_buffer(mem: &dyn DmaMemory, sg: &[SgEntry], buf: &mut [u8]) -> usize {
    let mut off = 0;
    for entry in sg {
        if off >= buf.len() {
            break;
        }
        let n = (entry.len as usize).min(buf.len() - off);
        mem.read(entry.addr, &mut buf[off..off + n]);
        off += n;
    }
    off
}

/// Scatters `data` into the buffers described by `sg`.
pub fn sg_copy_from_buffer(mem: &dyn DmaMemory, sg: &[SgEntry], data: &[u8]) -> usize {
    let mut off = 0;
    for entry in sg {
        if off >= data.len() {
            break;
        }
        let n = (entry.len as usize).min(data.len() - off);
        mem.write(entry.addr, &data[off..off + n]);
        off += n;
    }
    off
}

pub(crate) fn zero_region(mem: &dyn DmaMemory, region: &DmaRegion) {
    mem.write(region.addr, &vec![0u8; region.len]);
}

/// Descriptor address width, fixed for one controller reset cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmaAddressing {
    Bits32,
    Bits64,
    /// 64-bit descriptors padded to 16 bytes (host version 4 mode).
    Bits64V4,
}

impl AdmaAddressing {
    /// Picks the addressing mode from the capability register and the
    /// platform overrides.
    pub fn select(caps: u32, support_64bit: bool, v4_mode: bool) -> Self {
        if !support_64bit || caps & SDHCI_CAN_64BIT == 0 {
            AdmaAddressing::Bits32
        } else if v4_mode {
            AdmaAddressing::Bits64V4
        } else {
            AdmaAddressing::Bits64
        }
    }

    pub fn desc_stride(self) -> usize {
        match self {
            AdmaAddressing::Bits32 => 8,
            AdmaAddressing::Bits64 => 12,
            AdmaAddressing::Bits64V4 => 16,
        }
    }

    pub fn is_64bit(self) -> bool {
        self != AdmaAddressing::Bits32
    }
}

/// Controller descriptor quirks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmaQuirks {
    /// Mark the last real descriptor END instead of appending a NOP.
    pub no_endattr_in_nopdesc: bool,
    /// A zero length field is not read as 65536.
    pub broken_zerolen_desc: bool,
}

impl AdmaQuirks {
    pub fn max_desc_len(&self) -> u32 {
        if self.broken_zerolen_desc {
            ADMA_MAX_DESC_LEN - 1
        } else {
            ADMA_MAX_DESC_LEN
        }
    }
}
