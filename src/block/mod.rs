//! Block device personality of a card.
//!
//! Turns block requests into MMC requests, judges what came back and
//! decides between retrying, falling back to single sectors, resetting
//! the card or failing sectors. Discard, flush and the raw command ioctl
//! live here as well.

pub mod erase;
pub mod ioctl;
pub mod minors;
pub mod recovery;
pub mod rw;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use kspin::SpinNoIrq;
use log::{debug, info};

pub use minors::MinorAllocator;
pub use recovery::{BlkStatus, RecoveryAction};

use crate::card::MmcCard;
use crate::common::commands::{SgEntry, sg_advance};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::core::MmcHost;
use crate::dma::DmaMemory;
use crate::host::{MmcHostCaps, MmcHostOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkOp {
    Read,
    Write,
    Discard,
    SecDiscard,
    Flush,
}

impl BlkOp {
    /// Discard, secure discard and flush go through their own issue path.
    pub fn is_special(self) -> bool {
        matches!(self, BlkOp::Discard | BlkOp::SecDiscard | BlkOp::Flush)
    }

    pub fn is_rw(self) -> bool {
        matches!(self, BlkOp::Read | BlkOp::Write)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReqFlags: u32 {
        /// Forced unit access: written with a reliable write when the card has one.
        const FUA = 1 << 0;
        const META = 1 << 1;
        /// Real-time request, may use the reserved command queue tags.
        const RT = 1 << 2;
        /// Don't log failures, the medium is gone.
        const QUIET = 1 << 3;
    }
}

/// One completion report for part of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkCompletion {
    pub error: Option<MmcError>,
    pub bytes: u32,
    /// Nothing of the request is left outstanding.
    pub finished: bool,
}

pub type EndIo = Box<dyn FnMut(BlkCompletion) + Send>;

/// A request from the block layer. It is completed from the front, a
/// span of bytes at a time, until nothing is left.
pub struct BlkRequest {
    pub op: BlkOp,
    pub sector: u64,
    pub nr_sectors: u32,
    pub sg: Vec<SgEntry>,
    pub flags: ReqFlags,
    end_io: Option<EndIo>,
    finished: bool,
}

impl core::fmt::Debug for BlkRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlkRequest")
            .field("op", &self.op)
            .field("sector", &self.sector)
            .field("nr_sectors", &self.nr_sectors)
            .field("flags", &self.flags)
            .finish()
    }
}

impl BlkRequest {
    pub fn new(op: BlkOp, sector: u64, nr_sectors: u32, sg: Vec<SgEntry>) -> Self {
        Self {
            op,
            sector,
            nr_sectors,
            sg,
            flags: ReqFlags::empty(),
            end_io: None,
            finished: false,
        }
    }

    pub fn flush() -> Self {
        Self::new(BlkOp::Flush, 0, 0, Vec::new())
    }

    pub fn with_flags(mut self, flags: ReqFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_end_io(mut self, end_io: impl FnMut(BlkCompletion) + Send + 'static) -> Self {
        self.end_io = Some(Box::new(end_io));
        self
    }

    /// Bytes still outstanding.
    pub fn bytes(&self) -> u64 {
        self.nr_sectors as u64 * MMC_SECTOR_SIZE as u64
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Completes `bytes` from the front of the request with `error`.
    /// Returns true while part of the request is still outstanding.
    pub fn end(&mut self, error: Option<MmcError>, bytes: u32) -> bool {
        if self.finished {
            return false;
        }
        let bytes = (bytes as u64).min(self.bytes()) as u32;
        let sectors = bytes / MMC_SECTOR_SIZE;
        self.sector += sectors as u64;
        self.nr_sectors -= sectors;
        sg_advance(&mut self.sg, bytes as u64);
        self.finished = self.nr_sectors == 0;

        if bytes != 0 || self.finished {
            if let Some(end_io) = self.end_io.as_mut() {
                end_io(BlkCompletion {
                    error,
                    bytes,
                    finished: self.finished,
                });
            }
        }
        !self.finished
    }

    /// Completes whatever is left.
    pub fn end_all(&mut self, error: Option<MmcError>) {
        let bytes = self.bytes().min(u32::MAX as u64) as u32;
        while self.end(error, bytes) {}
    }
}

/// Retry budgets and waits of the block layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkConfig {
    /// Reissues of a request that came back with a retryable error.
    pub rw_retries: u32,
    /// Tries at fetching the card status during recovery.
    pub status_tries: u32,
    /// SEND_STATUS polls after an RPMB ioctl.
    pub rpmb_poll_retries: u32,
    /// SEND_STATUS polls after a combo ioctl.
    pub combo_poll_retries: u32,
    pub busy_timeout_ms: u32,
}

impl Default for BlkConfig {
    fn default() -> Self {
        Self {
            rw_retries: 5,
            status_tries: 3,
            rpmb_poll_retries: 5,
            combo_poll_retries: 5000,
            busy_timeout_ms: MMC_BLK_TIMEOUT_MS,
        }
    }
}

/// Kinds of request that get one card reset each between successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    Read,
    Write,
    Discard,
    SecDiscard,
}

impl ResetType {
    fn bit(self) -> u8 {
        match self {
            ResetType::Read => 1 << 0,
            ResetType::Write => 1 << 1,
            ResetType::Discard => 1 << 2,
            ResetType::SecDiscard => 1 << 3,
        }
    }

    pub fn of(op: BlkOp) -> Self {
        match op {
            BlkOp::Read => ResetType::Read,
            BlkOp::Discard => ResetType::Discard,
            BlkOp::SecDiscard => ResetType::SecDiscard,
            BlkOp::Write | BlkOp::Flush => ResetType::Write,
        }
    }
}

/// Which hardware partition a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkArea {
    Main,
    /// Replay protected memory block: reachable through the ioctl only.
    Rpmb,
}

/// A card's block device.
pub struct MmcBlkDevice<T: MmcHostOps> {
    name: String,
    host: Arc<MmcHost<T>>,
    card: Arc<MmcCard>,
    mem: Arc<dyn DmaMemory>,
    config: BlkConfig,
    area: BlkArea,
    minor: u32,
    minors: Arc<MinorAllocator>,
    reset_done: SpinNoIrq<u8>,
}

impl<T: MmcHostOps> MmcBlkDevice<T> {
    pub fn new(
        host: Arc<MmcHost<T>>,
        mem: Arc<dyn DmaMemory>,
        minors: Arc<MinorAllocator>,
        area: BlkArea,
        config: BlkConfig,
    ) -> MmcResult<Self> {
        let card = host.card().ok_or(MmcError::MediumRemoved)?;
        let minor = minors.alloc().ok_or(MmcError::NoMemory)?;
        let name = match area {
            BlkArea::Main => format!("mmcblk{}", minor),
            BlkArea::Rpmb => format!("mmcblk{}rpmb", minor),
        };
        info!(
            "{}: {} {:?} card, {} sectors{}",
            name,
            host.name(),
            card.card_type(),
            card.capacity_sectors(),
            if card.has_cache() { ", cache" } else { "" }
        );
        Ok(Self {
            name,
            host,
            card,
            mem,
            config,
            area,
            minor,
            minors,
            reset_done: SpinNoIrq::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Arc<MmcHost<T>> {
        &self.host
    }

    pub fn card(&self) -> &Arc<MmcCard> {
        &self.card
    }

    pub fn mem(&self) -> &Arc<dyn DmaMemory> {
        &self.mem
    }

    pub fn config(&self) -> &BlkConfig {
        &self.config
    }

    pub fn area(&self) -> BlkArea {
        self.area
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// CMD23 framing: the host can send it and the card accepts it.
    pub fn use_cmd23(&self) -> bool {
        self.host.caps().contains(MmcHostCaps::CMD23) && self.card.supports_cmd23()
    }

    /// Reliable writes are available for FUA/META writes.
    pub fn rel_write(&self) -> bool {
        self.card.is_mmc() && (self.card.rel_write_enhanced() || self.card.rel_sectors() > 0)
    }

    /// Resets the card once per request type until that type succeeds
    /// again.
    pub fn reset(&self, ty: ResetType) -> MmcResult {
        {
            let mut done = self.reset_done.lock();
            if *done & ty.bit() != 0 {
                debug!("{}: {:?} reset already tried", self.name, ty);
                return Err(MmcError::Io);
            }
            *done |= ty.bit();
        }
        self.host.hw_reset()
    }

    pub fn reset_success(&self, ty: ResetType) {
        *self.reset_done.lock() &= !ty.bit();
    }
}

impl<T: MmcHostOps> Drop for MmcBlkDevice<T> {
    fn drop(&mut self) {
        self.minors.release(self.minor);
        debug!("{}: released", self.name);
    }
}


#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::testing::*;
    use super::*;
    use crate::core::testing::{emmc, emmc_ext};

    #[test]
    fn request_ends_from_the_front() {
        let (mut req, log) = logged(
            BlkOp::Read,
            100,
            4,
            vec![SgEntry::new(0x1000, 1024), SgEntry::new(0x8000, 1024)],
        );
        assert!(req.end(None, 1536));
        assert_eq!((req.sector, req.nr_sectors), (103, 1));
        assert_eq!(req.sg, vec![SgEntry::new(0x8000 + 512, 512)]);
        assert!(!req.end(Some(MmcError::DataCrc), 4096));
        assert!(req.is_finished());
        assert!(!req.end(None, 512));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], BlkCompletion { error: Some(MmcError::DataCrc), bytes: 512, finished: true });
    }

    #[test]
    fn empty_request_finishes_once() {
        let (mut req, log) = logged(BlkOp::Flush, 0, 0, vec![]);
        req.end_all(None);
        req.end_all(None);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn reset_happens_once_per_type() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        dev.reset(ResetType::Write).unwrap();
        assert_eq!(dev.reset(ResetType::Write), Err(MmcError::Io));
        dev.reset(ResetType::Read).unwrap();
        assert_eq!(sim.resets(), 2);

        dev.reset_success(ResetType::Write);
        dev.reset(ResetType::Write).unwrap();
        assert_eq!(sim.resets(), 3);
    }

    #[test]
    fn minors_come_back_on_drop() {
        let (host, _sim, mem) = crate::core::testing::sim_host(emmc(emmc_ext()));
        let minors = Arc::new(MinorAllocator::new(2));
        let a = MmcBlkDevice::new(host.clone(), mem.clone(), minors.clone(), BlkArea::Main, BlkConfig::default()).unwrap();
        let b = MmcBlkDevice::new(host.clone(), mem.clone(), minors.clone(), BlkArea::Rpmb, BlkConfig::default()).unwrap();
        assert_eq!(b.name(), "mmcblk1rpmb");
        assert!(MmcBlkDevice::new(host.clone(), mem.clone(), minors.clone(), BlkArea::Main, BlkConfig::default()).is_err());
        drop(a);
        let c = MmcBlkDevice::new(host, mem, minors, BlkArea::Main, BlkConfig::default()).unwrap();
        assert_eq!(c.minor(), 0);
    }
}
