//! Double-buffered dispatch: the next request is prepared while the
//! previous one is on the wire.

use alloc::boxed::Box;

use log::{trace, warn};

use super::slots::{SlotArena, SlotId};
use super::{ClaimState, Feeder, issue_special};
use crate::block::rw::RwNext;
use crate::block::{BlkStatus, MmcBlkDevice};
use crate::common::commands::MmcRequest;
use crate::common::err::MmcError;
use crate::dma::DmaMemory;
use crate::host::MmcHostOps;
use crate::osa::{Completion, completion};

pub struct PlainEngine {
    arena: SlotArena,
    prev: Option<(SlotId, Completion<MmcRequest>)>,
}

fn start<T: MmcHostOps>(dev: &MmcBlkDevice<T>, mrq: MmcRequest) -> Completion<MmcRequest> {
    let (tx, rx) = completion();
    dev.host().start_request(
        mrq,
        Box::new(move |mrq| {
            tx.complete(mrq);
        }),
    );
    rx
}

impl PlainEngine {
    pub fn new(arena: SlotArena) -> Self {
        Self { arena, prev: None }
    }

    pub fn in_flight(&self) -> bool {
        self.prev.is_some()
    }

    pub fn release(&mut self, mem: &dyn DmaMemory) {
        self.arena.release(mem);
    }

    pub(crate) fn run<T: MmcHostOps>(&mut self, dev: &MmcBlkDevice<T>, feeder: &Feeder<'_>, claim: &mut ClaimState) -> bool {
        let Some(req) = feeder.next() else {
            if self.prev.is_none() {
                return false;
            }
            self.finish_prev(dev, None);
            return true;
        };
        claim.hold(dev.host());

        if req.op.is_special() {
            self.finish_prev(dev, None);
            issue_special(dev, req);
            return true;
        }

        if self.arena.in_use() == self.arena.capacity() {
            self.finish_prev(dev, None);
        }
        let Some(id) = self.arena.insert(req) else {
            return true;
        };
        let prepped = self
            .arena
            .entry(id)
            .map(|(slot, bounce)| dev.rw_rq_prep(&slot.req, slot.progress.disable_multi, bounce));
        let cur = match prepped {
            Some(Ok(mrq)) => Some((id, mrq)),
            Some(Err(e)) => {
                if let Some(mut slot) = self.arena.remove(id) {
                    warn!("{}: cannot issue {:?}: {}", dev.name(), slot.req, e);
                    slot.req.end_all(Some(e));
                }
                None
            }
            None => None,
        };
        self.finish_prev(dev, cur);
        true
    }

    /// Waits for the request on the wire and judges it, then starts `cur`.
    /// `cur` goes out as soon as the previous request is known good, and
    /// only after any recovery of the previous request otherwise.
    fn finish_prev<T: MmcHostOps>(&mut self, dev: &MmcBlkDevice<T>, cur: Option<(SlotId, MmcRequest)>) {
        let mut cur = cur;
        let mut started = None;

        if let Some((id, done)) = self.prev.take() {
            if let Some((slot, bounce)) = self.arena.entry(id) {
                match done.wait() {
                    Some(mrq) => {
                        let (mrq, status) = dev.check_rw(&mut slot.req, mrq, bounce);
                        if status == BlkStatus::Success {
                            if let Some((cid, cmrq)) = cur.take() {
                                started = Some((cid, start(dev, cmrq)));
                            }
                        }
                        if dev.handle_rw(&mut slot.req, &mut slot.progress, &mrq, status) == RwNext::Reissue {
                            trace!("{}: recovering sector {} in line", dev.name(), slot.req.sector);
                            dev.issue_rw_from(&mut slot.req, &mut slot.progress, bounce);
                        }
                    }
                    None => slot.req.end_all(Some(MmcError::Io)),
                }
            }
            self.arena.remove(id);
        }

        if let Some((cid, cmrq)) = cur {
            started = Some((cid, start(dev, cmrq)));
        }
        self.prev = started;
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    use super::super::testing::*;
    use super::super::{QueueConfig, QueueMode};
    use crate::block::{BlkOp, BlkRequest};
    use crate::common::commands::SgEntry;
    use crate::constants::*;
    use crate::core::testing::{emmc, emmc_ext};
    use crate::host::HostLimits;
    use crate::host::sim::data_fault;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    fn data_cmds(sim: &crate::host::sim::SimHost) -> Vec<(u8, u32)> {
        sim.log()
            .iter()
            .filter(|c| {
                matches!(
                    c.opcode,
                    MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK | MMC_WRITE_BLOCK | MMC_WRITE_MULTIPLE_BLOCK
                )
            })
            .map(|c| (c.opcode, c.arg))
            .collect()
    }

    #[test]
    fn requests_finish_in_submission_order() {
        let (mut q, list, sim, mem) = queue(emmc(emmc_ext()), |_| {}, QueueConfig::default());
        assert_eq!(q.mode(), QueueMode::Plain);
        let data = pattern(16 * 512, 3);
        sim.write_sectors(0, &data);

        let book: Book = Arc::new(Mutex::new(Vec::new()));
        let bufs: Vec<u64> = (0..4).map(|_| mem.buffer(4 * 512, 0)).collect();
        for (i, buf) in bufs.iter().enumerate() {
            list.push(booked(&book, i, BlkOp::Read, i as u64 * 4, 4, vec![SgEntry::new(*buf, 2048)]));
        }
        q.run_until_idle();

        assert_eq!(finished(&book), [0, 1, 2, 3]);
        assert!(book.lock().unwrap().iter().all(|(_, c)| c.error.is_none()));
        for (i, buf) in bufs.iter().enumerate() {
            assert_eq!(mem.dump(*buf, 2048), data[i * 2048..(i + 1) * 2048]);
        }
        assert!(!q.in_flight());
    }

    #[test]
    fn failed_request_is_recovered_before_the_next_goes_out() {
        let (mut q, list, sim, mem) = queue(emmc(emmc_ext()), |_| {}, QueueConfig::default());
        data_fault(&sim, MMC_READ_MULTIPLE_BLOCK, Some(0), crate::MmcError::DataCrc, 0, 1);

        let book: Book = Arc::new(Mutex::new(Vec::new()));
        list.push(booked(&book, 0, BlkOp::Read, 0, 4, vec![SgEntry::new(mem.buffer(2048, 0), 2048)]));
        list.push(booked(&book, 1, BlkOp::Read, 8, 4, vec![SgEntry::new(mem.buffer(2048, 0), 2048)]));
        q.run_until_idle();

        assert_eq!(
            data_cmds(&sim),
            [
                (MMC_READ_MULTIPLE_BLOCK, 0),
                (MMC_READ_SINGLE_BLOCK, 0),
                (MMC_READ_SINGLE_BLOCK, 1),
                (MMC_READ_SINGLE_BLOCK, 2),
                (MMC_READ_SINGLE_BLOCK, 3),
                (MMC_READ_MULTIPLE_BLOCK, 8),
            ]
        );
        assert_eq!(finished(&book), [0, 1]);
        assert!(book.lock().unwrap().iter().all(|(_, c)| c.error.is_none()));
    }

    #[test]
    fn special_request_waits_for_the_one_on_the_wire() {
        let (mut q, list, sim, mem) = queue(emmc(emmc_ext()), |_| {}, QueueConfig::default());
        let book: Book = Arc::new(Mutex::new(Vec::new()));
        list.push(booked(&book, 0, BlkOp::Write, 0, 2, vec![SgEntry::new(mem.buffer(1024, 0), 1024)]));
        list.push(booked(&book, 1, BlkOp::Discard, 64, 64, vec![]));
        list.push(booked(&book, 2, BlkOp::Read, 0, 2, vec![SgEntry::new(mem.buffer(1024, 0), 1024)]));
        q.run_until_idle();

        assert_eq!(finished(&book), [0, 1, 2]);
        assert_eq!(sim.erases().len(), 1);
    }

    #[test]
    fn unpreparable_request_fails_alone() {
        let (mut q, list, _sim, mem) = queue(emmc(emmc_ext()), |_| {}, QueueConfig::default());
        let book: Book = Arc::new(Mutex::new(Vec::new()));
        list.push(booked(&book, 0, BlkOp::Read, 0, 1, vec![SgEntry::new(mem.buffer(512, 0), 512)]));
        list.push(booked(&book, 1, BlkOp::Read, 4, 0, vec![]));
        list.push(booked(&book, 2, BlkOp::Read, 8, 1, vec![SgEntry::new(mem.buffer(512, 0), 512)]));
        q.run_until_idle();

        let book = book.lock().unwrap();
        let errors: Vec<(usize, Option<crate::MmcError>)> = book.iter().map(|(i, c)| (*i, c.error)).collect();
        assert!(errors.contains(&(1, Some(crate::MmcError::InvalidValue))));
        assert!(errors.contains(&(0, None)));
        assert!(errors.contains(&(2, None)));
    }

    #[test]
    fn single_segment_host_bounces_through_queue_slots() {
        let (mut q, list, sim, mem) = queue(
            emmc(emmc_ext()),
            |sim| {
                sim.set_limits(HostLimits {
                    max_segs: 1,
                    max_seg_size: 4096,
                    ..HostLimits::default()
                })
            },
            QueueConfig::default(),
        );
        let data = pattern(12 * 512, 40);
        let a = mem.buffer(5000, 1);
        let b = mem.buffer(12 * 512 - 5000, 3);
        mem.fill(a, &data[..5000]);
        mem.fill(b, &data[5000..]);
        let book: Book = Arc::new(Mutex::new(Vec::new()));
        list.push(booked(
            &book,
            0,
            BlkOp::Write,
            100,
            12,
            vec![SgEntry::new(a, 5000), SgEntry::new(b, 12 * 512 - 5000)],
        ));
        q.run_until_idle();
        assert_eq!(sim.read_sectors(100, 12), data);

        // 4 KiB bounce slots: 8 + 4 sectors
        let blocks: Vec<u32> = sim
            .log()
            .iter()
            .filter(|c| c.opcode == MMC_WRITE_MULTIPLE_BLOCK)
            .map(|c| c.blocks)
            .collect();
        assert_eq!(blocks, [8, 4]);

        let back = mem.buffer(12 * 512, 2);
        list.push(BlkRequest::new(BlkOp::Read, 100, 12, vec![SgEntry::new(back, 12 * 512)]));
        q.run_until_idle();
        assert_eq!(mem.dump(back, 12 * 512), data);
    }
}
