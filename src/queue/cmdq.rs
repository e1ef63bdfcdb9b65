//! Command queue dispatch.
//!
//! Each read/write request gets a task tag and goes to the host as CMD44
//! (task parameters), CMD45 (task address) and CMD46/47 (execute). The
//! completion path retires tasks and wakes the worker; the worker only
//! dispatches. A failed task is recovered once every other task has
//! left the wire: the card's queue is discarded and the failed request
//! finishes through the ordinary read/write path with its retry policy.
//! Discard and flush run only when no task holds a tag.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kspin::SpinNoIrq;
use log::{debug, warn};

use super::slots::{SlotArena, SlotId};
use super::{ClaimState, Feeder, QueueHandle, issue_special};
use crate::block::{BlkRequest, MmcBlkDevice, ReqFlags};
use crate::common::commands::{DataDir, MmcCommand, MmcRequest, RspFlags};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::host::{MmcHostOps, RequestDone};

/// Task tag allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagSet {
    depth: u32,
    reserved_rt: u32,
    used: u64,
}

impl TagSet {
    /// `reserved_rt` tags are kept back for real-time requests; at least
    /// one tag always stays open to everyone.
    pub fn new(depth: u32, reserved_rt: u32) -> Self {
        let depth = depth.min(MMC_CQ_MAX_DEPTH);
        Self {
            depth,
            reserved_rt: reserved_rt.min(depth.saturating_sub(1)),
            used: 0,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn in_use(&self) -> u32 {
        self.used.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self, rt: bool) -> bool {
        let limit = if rt { self.depth } else { self.depth - self.reserved_rt };
        self.in_use() >= limit
    }

    /// Takes the smallest free tag.
    pub fn alloc(&mut self, rt: bool) -> Option<u32> {
        if self.is_full(rt) {
            return None;
        }
        let tag = (!self.used).trailing_zeros();
        if tag >= self.depth {
            return None;
        }
        self.used |= 1 << tag;
        Some(tag)
    }

    pub fn release(&mut self, tag: u32) {
        self.used &= !(1u64 << tag);
    }
}

struct CqInner {
    /// Slot index is the task tag.
    arena: SlotArena,
    tags: TagSet,
    failed: Vec<(u32, MmcError)>,
    /// Tasks that completed part of their request and go out again.
    resubmit: Vec<u32>,
}

impl CqInner {
    fn on_wire(&self) -> usize {
        self.tags.in_use() as usize - self.failed.len() - self.resubmit.len()
    }
}

struct CqShared {
    inner: SpinNoIrq<CqInner>,
}

pub struct CqEngine {
    shared: Arc<CqShared>,
    /// Fetched but waiting: a special for the tags to drain, or a request
    /// for a free tag.
    held: Option<BlkRequest>,
}

/// Turns the ordinary exchange for the front of `req` into a queued task.
fn task_request<T: MmcHostOps>(dev: &MmcBlkDevice<T>, req: &BlkRequest, tag: u32) -> MmcResult<MmcRequest> {
    let mut mrq = dev.rw_rq_prep(req, false, None)?;
    let (blocks, read) = match mrq.data.as_ref() {
        Some(data) => (data.blocks, data.dir == DataDir::Read),
        None => return Err(MmcError::InvalidValue),
    };
    let mut params = (blocks & 0xFFFF) | (tag << MMC_CQ_TASK_SHIFT);
    if read {
        params |= MMC_CQ_DATA_DIRECTION;
    }
    if req.flags.contains(ReqFlags::RT) {
        params |= 1 << MMC_CQ_TASK_PRIORITY_SHIFT;
    }
    if !read && req.flags.intersects(ReqFlags::FUA | ReqFlags::META) && dev.rel_write() {
        params |= MMC_CQ_RELIABLE_WRITE;
    }
    let opcode = if read {
        MMC_EXECUTE_READ_TASK
    } else {
        MMC_EXECUTE_WRITE_TASK
    };
    mrq.sbc = Some(MmcCommand::new(MMC_QUEUED_TASK_PARAMS, params, RspFlags::R1));
    mrq.task_addr = Some(MmcCommand::new(MMC_QUEUED_TASK_ADDRESS, mrq.cmd.arg, RspFlags::R1));
    mrq.cmd = MmcCommand::new(opcode, tag << MMC_CQ_TASK_SHIFT, RspFlags::R1);
    mrq.stop = None;
    Ok(mrq)
}

fn task_done(shared: Arc<CqShared>, handle: QueueHandle, tag: u32) -> RequestDone {
    Box::new(move |mrq: MmcRequest| {
        let error = match mrq.first_error() {
            Some((_, e)) => Some(e),
            None if mrq.bytes_xfered() == 0 => Some(MmcError::Io),
            None => None,
        };
        if let Some(e) = error {
            debug!("task {} failed: {}", tag, e);
            shared.inner.lock().failed.push((tag, e));
            handle.request_fn();
            return;
        }

        let id = SlotId(tag as usize);
        let slot = shared.inner.lock().arena.remove(id);
        if let Some(mut slot) = slot {
            let more = slot.req.end(None, mrq.bytes_xfered());
            let mut inner = shared.inner.lock();
            if more {
                inner.arena.insert_at(id, slot);
                inner.resubmit.push(tag);
            } else {
                inner.tags.release(tag);
            }
        }
        handle.request_fn();
    })
}

impl CqEngine {
    pub fn new(tags: TagSet) -> Self {
        let arena = SlotArena::new(tags.depth() as usize);
        Self {
            shared: Arc::new(CqShared {
                inner: SpinNoIrq::new(CqInner {
                    arena,
                    tags,
                    failed: Vec::new(),
                    resubmit: Vec::new(),
                }),
            }),
            held: None,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.held.is_some() || !self.shared.inner.lock().tags.is_empty()
    }

    pub(crate) fn run<T: MmcHostOps>(
        &mut self,
        dev: &MmcBlkDevice<T>,
        feeder: &Feeder<'_>,
        claim: &mut ClaimState,
        handle: &QueueHandle,
    ) -> bool {
        let mut progressed = false;

        let (failed, waiting) = {
            let mut inner = self.shared.inner.lock();
            if inner.failed.is_empty() {
                (Vec::new(), false)
            } else if inner.on_wire() > 0 {
                (Vec::new(), true)
            } else {
                (core::mem::take(&mut inner.failed), false)
            }
        };
        if waiting {
            return false;
        }
        if !failed.is_empty() {
            self.recover(dev, failed);
            progressed = true;
        }

        let resubmit = core::mem::take(&mut self.shared.inner.lock().resubmit);
        for tag in resubmit {
            self.dispatch(dev, tag, handle);
            progressed = true;
        }

        if let Some(req) = self.held.take() {
            match self.place(dev, req, handle) {
                Some(req) => {
                    self.held = Some(req);
                    return progressed;
                }
                None => progressed = true,
            }
        }

        loop {
            let rt = feeder.peek_rt();
            if self.shared.inner.lock().tags.is_full(rt) {
                break;
            }
            let Some(req) = feeder.next() else {
                break;
            };
            claim.hold(dev.host());
            progressed = true;
            if let Some(req) = self.place(dev, req, handle) {
                self.held = Some(req);
                break;
            }
        }
        progressed
    }

    /// Issues `req` if it can go now, else hands it back.
    fn place<T: MmcHostOps>(&mut self, dev: &MmcBlkDevice<T>, req: BlkRequest, handle: &QueueHandle) -> Option<BlkRequest> {
        if req.op.is_special() {
            if !self.shared.inner.lock().tags.is_empty() {
                return Some(req);
            }
            issue_special(dev, req);
            return None;
        }
        let rt = req.flags.contains(ReqFlags::RT);
        let tag = {
            let mut inner = self.shared.inner.lock();
            let Some(tag) = inner.tags.alloc(rt) else {
                return Some(req);
            };
            inner.arena.insert_at(SlotId(tag as usize), super::QueueSlot::new(req));
            tag
        };
        self.dispatch(dev, tag, handle);
        None
    }

    fn dispatch<T: MmcHostOps>(&self, dev: &MmcBlkDevice<T>, tag: u32, handle: &QueueHandle) {
        let id = SlotId(tag as usize);
        let prepped = {
            let inner = self.shared.inner.lock();
            inner.arena.get(id).map(|slot| task_request(dev, &slot.req, tag))
        };
        match prepped {
            Some(Ok(mrq)) => {
                dev.host()
                    .start_cmdq(tag, mrq, task_done(self.shared.clone(), handle.clone(), tag));
            }
            Some(Err(e)) => {
                let slot = {
                    let mut inner = self.shared.inner.lock();
                    inner.tags.release(tag);
                    inner.arena.remove(id)
                };
                if let Some(mut slot) = slot {
                    warn!("{}: cannot queue {:?}: {}", dev.name(), slot.req, e);
                    slot.req.end_all(Some(e));
                }
            }
            None => self.shared.inner.lock().tags.release(tag),
        }
    }

    fn recover<T: MmcHostOps>(&self, dev: &MmcBlkDevice<T>, failed: Vec<(u32, MmcError)>) {
        let discard = MmcCommand::new(MMC_CMDQ_TASK_MGMT, MMC_CQ_DISCARD_QUEUE, RspFlags::R1B);
        if let Err(e) = dev.host().wait_for_cmd(discard) {
            warn!("{}: discarding the card queue failed: {}", dev.name(), e);
        }
        for (tag, err) in failed {
            let id = SlotId(tag as usize);
            let slot = self.shared.inner.lock().arena.remove(id);
            if let Some(mut slot) = slot {
                warn!(
                    "{}: task {} ({} sectors from {}) failed with {}, reissuing",
                    dev.name(),
                    tag,
                    slot.req.nr_sectors,
                    slot.req.sector,
                    err
                );
                dev.issue_rw_from(&mut slot.req, &mut slot.progress, None);
            }
            self.shared.inner.lock().tags.release(tag);
        }
    }
}
