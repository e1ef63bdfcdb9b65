//! ADMA3 batching: read/write requests are chained into the host's
//! pending descriptor table and started together.
//!
//! A batch is flushed when it is full, before a special request, and
//! whenever the source runs dry. The controller reports one status for
//! the whole chain, so a failed batch is replayed a request at a time.

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::{debug, warn};

use super::slots::{SlotArena, SlotId};
use super::{ClaimState, Feeder, issue_special};
use crate::block::rw::RwNext;
use crate::block::{BlkRequest, MmcBlkDevice};
use crate::common::commands::MmcRequest;
use crate::host::MmcHostOps;
use crate::osa::completion;

pub struct Adma3Engine {
    depth: usize,
    arena: SlotArena,
    /// Slots in the pending batch, in table order.
    batch: Vec<SlotId>,
}

impl Adma3Engine {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            arena: SlotArena::new(depth),
            batch: Vec::with_capacity(depth),
        }
    }

    pub fn in_flight(&self) -> bool {
        !self.batch.is_empty()
    }

    pub(crate) fn run<T: MmcHostOps>(&mut self, dev: &MmcBlkDevice<T>, feeder: &Feeder<'_>, claim: &mut ClaimState) -> bool {
        let mut progressed = false;
        loop {
            if self.batch.len() >= self.depth {
                self.flush(dev);
            }
            let Some(req) = feeder.next() else {
                break;
            };
            claim.hold(dev.host());
            progressed = true;
            if req.op.is_special() {
                self.flush(dev);
                issue_special(dev, req);
                continue;
            }
            self.enqueue(dev, req);
        }
        if self.in_flight() {
            self.flush(dev);
            progressed = true;
        }
        progressed
    }

    fn enqueue<T: MmcHostOps>(&mut self, dev: &MmcBlkDevice<T>, req: BlkRequest) {
        let Some(id) = self.arena.insert(req) else {
            return;
        };
        let prepped = self
            .arena
            .entry(id)
            .map(|(slot, _)| dev.rw_rq_prep(&slot.req, slot.progress.disable_multi, None));
        match prepped {
            Some(Ok(mrq)) => match dev.host().adma3_enqueue(mrq) {
                Ok(()) => self.batch.push(id),
                Err((e, _)) => {
                    debug!("{}: ADMA3 table refused request ({}), going direct", dev.name(), e);
                    self.flush(dev);
                    if let Some(mut slot) = self.arena.remove(id) {
                        dev.issue_rw_from(&mut slot.req, &mut slot.progress, None);
                    }
                }
            },
            Some(Err(e)) => {
                if let Some(mut slot) = self.arena.remove(id) {
                    warn!("{}: cannot batch {:?}: {}", dev.name(), slot.req, e);
                    slot.req.end_all(Some(e));
                }
            }
            None => {}
        }
    }

    /// Starts the pending batch and finishes every request in it.
    fn flush<T: MmcHostOps>(&mut self, dev: &MmcBlkDevice<T>) {
        let ids = core::mem::take(&mut self.batch);
        if ids.is_empty() {
            return;
        }
        let (tx, rx) = completion::<Vec<MmcRequest>>();
        let done = match dev.host().adma3_flush(Box::new(move |mrqs| {
            tx.complete(mrqs);
        })) {
            Ok(()) => rx.wait(),
            Err(e) => {
                warn!("{}: ADMA3 flush failed to start: {}", dev.name(), e);
                None
            }
        };

        match done {
            Some(mrqs) if mrqs.len() == ids.len() && !mrqs.iter().any(MmcRequest::has_error) => {
                for (id, mrq) in ids.into_iter().zip(mrqs) {
                    if let Some(mut slot) = self.arena.remove(id) {
                        if dev.complete_rw(&mut slot.req, &mut slot.progress, mrq, None) == RwNext::Reissue {
                            dev.issue_rw_from(&mut slot.req, &mut slot.progress, None);
                        }
                    }
                }
            }
            _ => {
                warn!("{}: ADMA3 batch of {} failed, replaying one by one", dev.name(), ids.len());
                for id in ids {
                    if let Some(mut slot) = self.arena.remove(id) {
                        dev.issue_rw(&mut slot.req, None);
                    }
                }
            }
        }
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
    use crate::MmcError;
    use crate::block::BlkOp;
    use crate::common::commands::SgEntry;
    use crate::constants::*;
    use crate::core::testing::{emmc, emmc_ext};
    use crate::host::MmcHostCaps;
    use crate::host::sim::{SimHost, data_fault};

    fn adma3_caps(sim: &SimHost) {
        sim.set_caps(MmcHostCaps::CMD23 | MmcHostCaps::ERASE | MmcHostCaps::HW_RESET | MmcHostCaps::ADMA3);
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed)).collect()
    }

    #[test]
    fn twenty_requests_go_out_as_sixteen_and_four() {
        let (mut q, list, sim, mem) = queue(emmc(emmc_ext()), adma3_caps, QueueConfig::default());
        assert_eq!(q.mode(), QueueMode::Adma3Batch);
        let data = pattern(20 * 1024, 1);
        sim.write_sectors(0, &data);

        let book: Book = Arc::new(Mutex::new(Vec::new()));
        let bufs: Vec<u64> = (0..20).map(|_| mem.buffer(1024, 0)).collect();
        for (i, buf) in bufs.iter().enumerate() {
            list.push(booked(&book, i, BlkOp::Read, i as u64 * 2, 2, vec![SgEntry::new(*buf, 1024)]));
        }
        q.run_until_idle();

        assert_eq!(sim.batches(), [16, 4]);
        assert_eq!(finished(&book), (0..20).collect::<Vec<_>>());
        let book = book.lock().unwrap();
        assert!(book.iter().all(|(_, c)| c.error.is_none() && c.bytes == 1024));
        for (i, buf) in bufs.iter().enumerate() {
            assert_eq!(mem.dump(*buf, 1024), data[i * 1024..(i + 1) * 1024]);
        }
    }

    #[test]
    fn failed_batch_is_replayed_request_by_request() {
        let (mut q, list, sim, mem) = queue(emmc(emmc_ext()), adma3_caps, QueueConfig::default());
        data_fault(&sim, MMC_READ_MULTIPLE_BLOCK, Some(8), MmcError::DataCrc, 0, 1);

        let book: Book = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            list.push(booked(&book, i, BlkOp::Read, i as u64 * 4, 4, vec![SgEntry::new(mem.buffer(2048, 0), 2048)]));
        }
        q.run_until_idle();

        assert_eq!(sim.batches(), [3]);
        let reads = sim.opcodes().iter().filter(|&&op| op == MMC_READ_MULTIPLE_BLOCK).count();
        assert_eq!(reads, 6);
        assert_eq!(finished(&book), [0, 1, 2]);
        assert!(book.lock().unwrap().iter().all(|(_, c)| c.error.is_none()));
    }

    #[test]
    fn special_request_flushes_the_pending_batch() {
        let (mut q, list, sim, mem) = queue(emmc(emmc_ext()), adma3_caps, QueueConfig::default());
        let book: Book = Arc::new(Mutex::new(Vec::new()));
        list.push(booked(&book, 0, BlkOp::Write, 0, 2, vec![SgEntry::new(mem.buffer(1024, 0), 1024)]));
        list.push(booked(&book, 1, BlkOp::Write, 2, 2, vec![SgEntry::new(mem.buffer(1024, 0), 1024)]));
        list.push(booked(&book, 2, BlkOp::Discard, 128, 64, vec![]));
        list.push(booked(&book, 3, BlkOp::Read, 0, 2, vec![SgEntry::new(mem.buffer(1024, 0), 1024)]));
        q.run_until_idle();

        assert_eq!(sim.batches(), [2, 1]);
        assert_eq!(finished(&book), [0, 1, 2, 3]);
        assert_eq!(sim.erases().len(), 1);
    }

    #[test]
    fn deeper_queue_than_the_table_goes_direct_on_refusal() {
        let config = QueueConfig {
            adma3_depth: 20,
            ..QueueConfig::default()
        };
        let (mut q, list, sim, mem) = queue(emmc(emmc_ext()), adma3_caps, config);
        let book: Book = Arc::new(Mutex::new(Vec::new()));
        for i in 0..18 {
            list.push(booked(&book, i, BlkOp::Read, i as u64, 1, vec![SgEntry::new(mem.buffer(512, 0), 512)]));
        }
        q.run_until_idle();

        // the 17th is refused: the table is flushed and it goes alone
        assert_eq!(sim.batches(), [ADMA3_MAX_DEPTH, 1]);
        assert_eq!(finished(&book).len(), 18);
    }
}
