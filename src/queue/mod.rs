//! Request queue: pulls block requests from a source and keeps the card
//! busy with them.
//!
//! A queue runs in one of three modes chosen when it is created:
//!
//! - [`QueueMode::Plain`]: one request on the wire while the next one is
//!   prepared, the classic double buffer.
//! - [`QueueMode::Cq`]: tagged tasks for cards and hosts with a command
//!   queue engine.
//! - [`QueueMode::Adma3Batch`]: up to a batch worth of requests chained
//!   into one ADMA3 descriptor table.
//!
//! Whatever the mode, a single worker owns the queue and calls
//! [`MmcQueue::run_once`]; producers only touch the [`QueueHandle`].

pub mod adma3;
pub mod cmdq;
pub mod plain;
pub mod slots;
#[cfg(feature = "std")]
pub mod worker;

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use kspin::SpinNoIrq;
use log::{debug, info, warn};

pub use cmdq::TagSet;
pub use slots::{QueueSlot, SlotArena, SlotId};

use crate::block::{BlkArea, BlkOp, BlkRequest, MmcBlkDevice, ReqFlags};
use crate::card::MmcCard;
use crate::common::err::{MmcError, MmcResult};
use crate::core::MmcHost;
use crate::dma::bounce::bounce_size;
use crate::host::{MmcHostCaps, MmcHostOps};

use adma3::Adma3Engine;
use cmdq::CqEngine;
use plain::PlainEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Plain,
    Cq,
    Adma3Batch,
}

impl QueueMode {
    /// Command queueing when both ends can do it, else ADMA3 batching
    /// when the host can, else plain.
    pub fn select(card: &MmcCard, caps: MmcHostCaps) -> Self {
        if card.cmdq_capable() && caps.contains(MmcHostCaps::HW_CQ) {
            QueueMode::Cq
        } else if caps.contains(MmcHostCaps::ADMA3) {
            QueueMode::Adma3Batch
        } else {
            QueueMode::Plain
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Sleeping,
    Fetching,
    Issuing,
    Stopped,
}

/// Queue tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Requests chained per ADMA3 flush.
    pub adma3_depth: usize,
    /// Command queue tags only real-time requests may take.
    pub reserved_rt_tags: u32,
    /// Stage transfers through a bounce buffer on single-segment hosts.
    pub bounce: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            adma3_depth: crate::constants::ADMA3_MAX_DEPTH,
            reserved_rt_tags: 2,
            bounce: true,
        }
    }
}

/// Where a queue gets its block requests from.
pub trait RequestSource: Send + Sync {
    fn fetch(&self) -> Option<BlkRequest>;

    /// Whether the next request is real-time.
    fn peek_rt(&self) -> bool {
        false
    }
}

/// A FIFO of block requests.
#[derive(Default)]
pub struct RequestList {
    reqs: SpinNoIrq<VecDeque<BlkRequest>>,
}

impl RequestList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, req: BlkRequest) {
        self.reqs.lock().push_back(req);
    }

    pub fn len(&self) -> usize {
        self.reqs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.lock().is_empty()
    }
}

impl RequestSource for RequestList {
    fn fetch(&self) -> Option<BlkRequest> {
        self.reqs.lock().pop_front()
    }

    fn peek_rt(&self) -> bool {
        self.reqs
            .lock()
            .front()
            .is_some_and(|r| r.flags.contains(ReqFlags::RT))
    }
}

struct WakeState {
    new_request: bool,
    state: WorkerState,
    suspended: bool,
    stop: bool,
}

type Waker = Arc<dyn Fn() + Send + Sync>;

struct QueueShared {
    wake: SpinNoIrq<WakeState>,
    waker: SpinNoIrq<Option<Waker>>,
}

/// The producer side of a queue.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<QueueShared>,
}

impl QueueHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                wake: SpinNoIrq::new(WakeState {
                    new_request: false,
                    state: WorkerState::Sleeping,
                    suspended: false,
                    stop: false,
                }),
                waker: SpinNoIrq::new(None),
            }),
        }
    }

    /// Tells the worker there is something to do.
    pub fn request_fn(&self) {
        self.shared.wake.lock().new_request = true;
        let waker = self.shared.waker.lock().clone();
        if let Some(waker) = waker {
            waker();
        }
    }

    /// Installs what wakes the worker up.
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self.shared.waker.lock() = Some(Arc::new(waker));
    }

    /// Stops the worker fetching new requests. Work already taken on
    /// runs to completion.
    pub fn suspend(&self) {
        self.shared.wake.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.shared.wake.lock().suspended = false;
        self.request_fn();
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.wake.lock().suspended
    }

    pub fn state(&self) -> WorkerState {
        self.shared.wake.lock().state
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.shared.wake.lock().state = state;
    }

    pub fn stop(&self) {
        self.shared.wake.lock().stop = true;
        self.request_fn();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.wake.lock().stop
    }

    /// Checked by the worker under the wake lock before it parks, so a
    /// request posted after its last fetch is never slept through.
    pub(crate) fn prepare_sleep(&self) -> bool {
        let mut wake = self.shared.wake.lock();
        if wake.new_request || wake.stop {
            wake.new_request = false;
            return false;
        }
        wake.state = WorkerState::Sleeping;
        true
    }
}

/// Hands out requests to a mode engine, killing the ones that cannot be
/// served.
pub(crate) struct Feeder<'a> {
    source: &'a dyn RequestSource,
    handle: &'a QueueHandle,
    card: &'a MmcCard,
    area: BlkArea,
}

impl Feeder<'_> {
    pub(crate) fn next(&self) -> Option<BlkRequest> {
        loop {
            if self.handle.is_suspended() {
                return None;
            }
            let mut req = self.source.fetch()?;
            if self.card.is_removed() {
                req.flags |= ReqFlags::QUIET;
                req.end_all(Some(MmcError::MediumRemoved));
                continue;
            }
            if self.area == BlkArea::Rpmb {
                // the partition is only reachable through the ioctl
                debug!("dropping {:?} request on RPMB partition", req.op);
                req.end_all(Some(MmcError::Io));
                continue;
            }
            return Some(req);
        }
    }

    pub(crate) fn peek_rt(&self) -> bool {
        self.source.peek_rt()
    }
}

/// Tracks the long-lived host claim a queue takes while it has work.
#[derive(Default)]
pub(crate) struct ClaimState {
    held: bool,
}

impl ClaimState {
    pub(crate) fn hold<T: MmcHostOps>(&mut self, host: &MmcHost<T>) {
        if !self.held {
            host.claim_host();
            self.held = true;
        }
    }

    pub(crate) fn release<T: MmcHostOps>(&mut self, host: &MmcHost<T>) {
        if self.held {
            host.release_host();
            self.held = false;
        }
    }
}

/// Runs a discard, secure discard or flush to the end.
pub(crate) fn issue_special<T: MmcHostOps>(dev: &MmcBlkDevice<T>, mut req: BlkRequest) {
    match req.op {
        BlkOp::Discard => dev.issue_discard(&mut req),
        BlkOp::SecDiscard => dev.issue_secdiscard(&mut req),
        BlkOp::Flush => dev.issue_flush(&mut req),
        BlkOp::Read | BlkOp::Write => dev.issue_rw(&mut req, None),
    }
}

enum Engine {
    Plain(PlainEngine),
    Cq(CqEngine),
    Adma3(Adma3Engine),
}

/// A card's request queue.
pub struct MmcQueue<T: MmcHostOps> {
    name: String,
    dev: Arc<MmcBlkDevice<T>>,
    source: Arc<dyn RequestSource>,
    handle: QueueHandle,
    mode: QueueMode,
    engine: Engine,
    claim: ClaimState,
}

impl<T: MmcHostOps> MmcQueue<T> {
    pub fn new(dev: Arc<MmcBlkDevice<T>>, source: Arc<dyn RequestSource>, config: QueueConfig) -> MmcResult<Self> {
        let host = dev.host();
        let card = dev.card();
        let mode = QueueMode::select(card, host.caps());
        let engine = match mode {
            QueueMode::Plain => {
                let limits = host.limits();
                let mut arena = SlotArena::new(2);
                if config.bounce && limits.max_segs == 1 {
                    if let Some(size) = bounce_size(limits.max_req_size, limits.max_seg_size, limits.max_blk_count) {
                        arena = arena.with_bounce(&**dev.mem(), size)?;
                    }
                }
                Engine::Plain(PlainEngine::new(arena))
            }
            QueueMode::Cq => {
                let tags = TagSet::new(card.cmdq_depth(), config.reserved_rt_tags);
                Engine::Cq(CqEngine::new(tags))
            }
            QueueMode::Adma3Batch => {
                if config.adma3_depth == 0 {
                    return Err(MmcError::InvalidValue);
                }
                Engine::Adma3(Adma3Engine::new(config.adma3_depth))
            }
        };
        let name = dev.name().to_string();
        info!("{}: {:?} queue", name, mode);
        Ok(Self {
            name,
            dev,
            source,
            handle: QueueHandle::new(),
            mode,
            engine,
            claim: ClaimState::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn device(&self) -> &Arc<MmcBlkDevice<T>> {
        &self.dev
    }

    /// Whether requests are on the wire or held back for later.
    pub fn in_flight(&self) -> bool {
        match &self.engine {
            Engine::Plain(e) => e.in_flight(),
            Engine::Cq(e) => e.in_flight(),
            Engine::Adma3(e) => e.in_flight(),
        }
    }

    /// One round of work. Returns false when there was nothing to do and
    /// the worker may sleep until woken.
    pub fn run_once(&mut self) -> bool {
        self.handle.set_state(WorkerState::Fetching);
        let feeder = Feeder {
            source: &*self.source,
            handle: &self.handle,
            card: self.dev.card(),
            area: self.dev.area(),
        };
        let dev = &*self.dev;
        let progressed = match &mut self.engine {
            Engine::Plain(e) => e.run(dev, &feeder, &mut self.claim),
            Engine::Cq(e) => e.run(dev, &feeder, &mut self.claim, &self.handle),
            Engine::Adma3(e) => e.run(dev, &feeder, &mut self.claim),
        };
        if progressed {
            self.handle.set_state(WorkerState::Issuing);
        }
        if !self.in_flight() {
            self.claim.release(self.dev.host());
        }
        progressed
    }

    /// Runs until the source is empty and nothing is in flight.
    pub fn run_until_idle(&mut self) {
        loop {
            if self.run_once() {
                continue;
            }
            if !self.in_flight() {
                break;
            }
            crate::osa::usleep_range(50, 200);
        }
    }

    /// Stops fetching and finishes everything already taken on.
    pub fn drain(&mut self) {
        self.handle.suspend();
        while self.in_flight() {
            if !self.run_once() {
                crate::osa::usleep_range(50, 200);
            }
        }
        self.claim.release(self.dev.host());
    }
}

impl<T: MmcHostOps> Drop for MmcQueue<T> {
    fn drop(&mut self) {
        if self.in_flight() {
            warn!("{}: queue dropped with requests in flight", self.name);
        }
        self.claim.release(self.dev.host());
        if let Engine::Plain(e) = &mut self.engine {
            e.release(&**self.dev.mem());
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    use super::*;
    use crate::block::BlkCompletion;
    use crate::block::testing::device;
    use crate::common::commands::SgEntry;
    use crate::dma::ram::RamMemory;
    use crate::host::sim::SimHost;

    pub type SimQueue = MmcQueue<Arc<SimHost>>;

    /// Completions of every request, keyed by the request's index.
    pub type Book = Arc<Mutex<Vec<(usize, BlkCompletion)>>>;

    pub fn queue(
        card: Arc<MmcCard>,
        setup: impl FnOnce(&SimHost),
        config: QueueConfig,
    ) -> (SimQueue, Arc<RequestList>, Arc<SimHost>, Arc<RamMemory>) {
        let (dev, sim, mem) = device(card);
        setup(&sim);
        let list = Arc::new(RequestList::new());
        let q = MmcQueue::new(Arc::new(dev), list.clone(), config).unwrap();
        (q, list, sim, mem)
    }

    /// An eMMC with command queueing enabled.
    pub fn cq_card() -> Arc<MmcCard> {
        let ext = crate::card::MmcExtCsd {
            cmdq_support: true,
            cmdq_mode_en: true,
            cmdq_depth: 16,
            ..crate::core::testing::emmc_ext()
        };
        crate::core::testing::emmc(ext)
    }

    /// A request whose completions are recorded in `book` under `idx`.
    pub fn booked(book: &Book, idx: usize, op: BlkOp, sector: u64, nr: u32, sg: Vec<SgEntry>) -> BlkRequest {
        let book = book.clone();
        BlkRequest::new(op, sector, nr, sg).with_end_io(move |c| book.lock().unwrap().push((idx, c)))
    }

    /// Indices of requests that finished, in finishing order.
    pub fn finished(book: &Book) -> Vec<usize> {
        book.lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.finished)
            .map(|(i, _)| *i)
            .collect()
    }
}
