use alloc::vec::Vec;

use log::info;

use crate::block::BlkRequest;
use crate::block::rw::RwProgress;
use crate::common::err::MmcResult;
use crate::dma::DmaMemory;
use crate::dma::bounce::BounceBuffer;

/// Index of a slot in a [`SlotArena`]. In command queue mode it doubles
/// as the task tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A block request the queue has taken on, with its retry state.
pub struct QueueSlot {
    pub req: BlkRequest,
    pub progress: RwProgress,
}

impl QueueSlot {
    pub fn new(req: BlkRequest) -> Self {
        Self {
            req,
            progress: RwProgress::default(),
        }
    }
}

/// Fixed set of request slots. Each position may own a bounce buffer
/// that stays with the position across requests.
pub struct SlotArena {
    slots: Vec<Option<QueueSlot>>,
    bounce: Vec<Option<BounceBuffer>>,
}

impl SlotArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            bounce: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Gives every slot a bounce buffer of `size` bytes.
    pub fn with_bounce(mut self, mem: &dyn DmaMemory, size: u32) -> MmcResult<Self> {
        for bounce in self.bounce.iter_mut() {
            *bounce = Some(BounceBuffer::new(mem, size)?);
        }
        info!("{} bounce buffers of {} bytes", self.bounce.len(), size);
        Ok(self)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Puts `req` in the lowest free slot.
    pub fn insert(&mut self, req: BlkRequest) -> Option<SlotId> {
        let idx = self.slots.iter().position(Option::is_none)?;
        self.slots[idx] = Some(QueueSlot::new(req));
        Some(SlotId(idx))
    }

    /// Puts a slot back at a position the caller reserved.
    pub fn insert_at(&mut self, id: SlotId, slot: QueueSlot) -> bool {
        match self.slots.get_mut(id.0) {
            Some(entry @ None) => {
                *entry = Some(slot);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&QueueSlot> {
        self.slots.get(id.0)?.as_ref()
    }

    /// The slot together with the bounce buffer of its position.
    pub fn entry(&mut self, id: SlotId) -> Option<(&mut QueueSlot, Option<&BounceBuffer>)> {
        let slot = self.slots.get_mut(id.0)?.as_mut()?;
        Some((slot, self.bounce.get(id.0).and_then(Option::as_ref)))
    }

    pub fn remove(&mut self, id: SlotId) -> Option<QueueSlot> {
        self.slots.get_mut(id.0)?.take()
    }

    /// Frees the bounce buffers. Slots still holding requests are dropped
    /// without completing them.
    pub fn release(&mut self, mem: &dyn DmaMemory) {
        for bounce in self.bounce.iter_mut() {
            if let Some(bounce) = bounce.take() {
                bounce.release(mem);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::block::BlkOp;
    use crate::dma::ram::RamMemory;

    fn req(sector: u64) -> BlkRequest {
        BlkRequest::new(BlkOp::Read, sector, 1, vec![])
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut arena = SlotArena::new(2);
        let a = arena.insert(req(1)).unwrap();
        let b = arena.insert(req(2)).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert!(arena.insert(req(3)).is_none());

        let slot = arena.remove(a).unwrap();
        assert_eq!(slot.req.sector, 1);
        assert_eq!(arena.in_use(), 1);
        assert_eq!(arena.insert(req(4)), Some(a));
        assert_eq!(arena.get(a).unwrap().req.sector, 4);
    }

    #[test]
    fn reserved_position_takes_a_slot_back() {
        let mut arena = SlotArena::new(4);
        let id = SlotId(2);
        assert!(arena.insert_at(id, QueueSlot::new(req(7))));
        assert!(!arena.insert_at(id, QueueSlot::new(req(8))));
        assert!(!arena.insert_at(SlotId(9), QueueSlot::new(req(8))));
        assert_eq!(arena.insert(req(1)), Some(SlotId(0)));
    }

    #[test]
    fn bounce_buffers_stay_with_their_position() -> MmcResult<()> {
        let mem = RamMemory::new();
        let mut arena = SlotArena::new(2).with_bounce(&mem, 4096)?;
        let a = arena.insert(req(0)).unwrap();
        let b = arena.insert(req(1)).unwrap();
        let first = arena.entry(a).unwrap().1.unwrap().sg(512)?;
        let second = arena.entry(b).unwrap().1.unwrap().sg(512)?;
        assert_ne!(first, second);

        arena.remove(a);
        let again = arena.insert(req(2)).unwrap();
        assert_eq!(arena.entry(again).unwrap().1.unwrap().sg(512)?, first);
        arena.release(&mem);
        Ok(())
    }
}
