use alloc::vec;
use alloc::vec::Vec;

use log::info;

use super::{DmaMemory, DmaRegion, sg_copy_from_buffer, sg_copy_to_buffer};
use crate::common::commands::{DataDir, SgEntry};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;

/// Bounce size for a host that takes a single segment per request, or
/// `None` when bouncing would not help.
pub fn bounce_size(max_req_size: u32, max_seg_size: u32, max_blk_count: u32) -> Option<u32> {
    let size = MMC_QUEUE_BOUNCESZ
        .min(max_req_size)
        .min(max_seg_size)
        .min(max_blk_count.saturating_mul(MMC_SECTOR_SIZE));
    (size > MMC_SECTOR_SIZE).then_some(size)
}

/// A host-owned staging buffer standing in for the whole scatter list.
#[derive(Debug)]
pub struct BounceBuffer {
    region: DmaRegion,
}

impl BounceBuffer {
    pub fn new(mem: &dyn DmaMemory, size: u32) -> MmcResult<Self> {
        if size == 0 {
            return Err(MmcError::InvalidValue);
        }
        let region = mem.alloc(size as usize, 4)?;
        info!("bounce buffer of {} bytes at {:#x}", size, region.addr);
        Ok(Self { region })
    }

    pub fn size(&self) -> u32 {
        self.region.len as u32
    }

    pub fn sectors(&self) -> u32 {
        self.size() / MMC_SECTOR_SIZE
    }

    /// The one-entry scatter list the controller sees for `len` bytes.
    pub fn sg(&self, len: u32) -> MmcResult<Vec<SgEntry>> {
        if len > self.size() {
            return Err(MmcError::Overflow);
        }
        Ok(vec![SgEntry::new(self.region.addr, len)])
    }

    /// Stages the caller's data before a write.
    pub fn pre(&self, mem: &dyn DmaMemory, orig: &[SgEntry], len: u32, dir: DataDir) {
        if dir != DataDir::Write {
            return;
        }
        let mut staged = vec![0u8; len as usize];
        let n = sg_copy_to_buffer(mem, orig, &mut staged);
        mem.write(self.region.addr, &staged[..n]);
    }

    /// Hands read data back to the caller's buffers.
    pub fn post(&self, mem: &dyn DmaMemory, orig: &[SgEntry], len: u32, dir: DataDir) {
        if dir != DataDir::Read {
            return;
        }
        let mut staged = vec![0u8; len as usize];
        mem.read(self.region.addr, &mut staged);
        sg_copy_from_buffer(mem, orig, &staged);
    }

    pub fn release(self, mem: &dyn DmaMemory) {
        mem.free(self.region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::ram::RamMemory;

    #[test]
    fn size_is_bounded_by_every_limit() {
        assert_eq!(bounce_size(u32::MAX, u32::MAX, 65535), Some(65536));
        assert_eq!(bounce_size(131072, 4096, 65535), Some(4096));
        assert_eq!(bounce_size(131072, 65536, 1), None);
    }

    #[test]
    fn both_directions_are_lossless() {
        let mem = RamMemory::new();
        let bounce = BounceBuffer::new(&mem, 4096).unwrap();
        let a = mem.buffer(700, 3);
        let b = mem.buffer(324, 1);
        let orig = [SgEntry::new(a, 700), SgEntry::new(b, 324)];
        let pattern: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        sg_copy_from_buffer(&mem, &orig, &pattern);

        bounce.pre(&mem, &orig, 1024, DataDir::Write);
        assert_eq!(mem.dump(bounce.sg(1024).unwrap()[0].addr, 1024), pattern);

        sg_copy_from_buffer(&mem, &orig, &[0u8; 1024]);
        bounce.post(&mem, &orig, 1024, DataDir::Read);
        let mut back = vec![0u8; 1024];
        sg_copy_to_buffer(&mem, &orig, &mut back);
        assert_eq!(back, pattern);

        assert_eq!(bounce.sg(8192), Err(MmcError::Overflow));
    }
}
