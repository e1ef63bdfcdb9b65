pub mod sdhci;
#[cfg(test)]
pub(crate) mod sim;

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::common::commands::MmcRequest;
use crate::common::err::{MmcError, MmcResult};

/// Called exactly once when a request reaches a terminal state.
pub type RequestDone = Box<dyn FnOnce(MmcRequest) + Send>;

/// Called once with every request of a flushed ADMA3 batch, in queue order.
pub type BatchDone = Box<dyn FnOnce(Vec<MmcRequest>) + Send>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmcHostCaps: u32 {
        const CMD23 = 1 << 0;
        const HW_CQ = 1 << 1;
        const ADMA3 = 1 << 2;
        const HW_RESET = 1 << 3;
        const ERASE = 1 << 4;
        const SPI = 1 << 5;
        const NONREMOVABLE = 1 << 6;
        const WAIT_WHILE_BUSY = 1 << 7;
        const INFINITE_ERASE_TIMEOUT = 1 << 8;
        const BUS_WIDTH_8 = 1 << 9;
        const HS200 = 1 << 10;
    }
}

/// Transfer geometry the host can take in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLimits {
    pub max_blk_count: u32,
    pub max_blk_size: u32,
    pub max_req_size: u32,
    pub max_segs: u32,
    pub max_seg_size: u32,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_blk_count: 65535,
            max_blk_size: 512,
            max_req_size: 512 * 1024,
            max_segs: 128,
            max_seg_size: 65536,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    Width1,
    Width4,
    Width8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    Legacy,
    MmcHs,
    SdHs,
    UhsSdr12,
    UhsSdr25,
    UhsSdr50,
    UhsSdr104,
    UhsDdr50,
    MmcDdr52,
    MmcHs200,
    MmcHs400,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalVoltage {
    V330,
    V180,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmcIos {
    pub clock: u32,
    pub bus_width: BusWidth,
    pub timing: Timing,
    pub signal_voltage: SignalVoltage,
}

impl Default for MmcIos {
    fn default() -> Self {
        Self {
            clock: 400_000,
            bus_width: BusWidth::Width1,
            timing: Timing::Legacy,
            signal_voltage: SignalVoltage::V330,
        }
    }
}

/// What the protocol layer needs from a host controller driver.
///
/// `request` starts the exchange and returns; the driver calls `done`
/// from its completion context once every leg has a result.
pub trait MmcHostOps: Send + Sync {
    fn request(&self, mrq: MmcRequest, done: RequestDone);

    fn set_ios(&self, ios: &MmcIos) -> MmcResult;

    fn get_cd(&self) -> bool;

    fn get_ro(&self) -> bool;

    fn execute_tuning(&self, opcode: u8) -> MmcResult;

    fn hw_reset(&self) -> MmcResult {
        Err(MmcError::Unsupported)
    }

    fn limits(&self) -> HostLimits;

    fn caps(&self) -> MmcHostCaps;

    /// Queues a tagged task. Hosts without a command queue engine run it
    /// like any other request.
    fn cmdq_request(&self, tag: u32, mrq: MmcRequest, done: RequestDone) {
        let _ = tag;
        self.request(mrq, done);
    }

    /// Adds a request to the pending ADMA3 batch. On failure the request
    /// is handed back untouched.
    fn adma3_enqueue(&self, mrq: MmcRequest) -> Result<(), (MmcError, MmcRequest)> {
        Err((MmcError::Unsupported, mrq))
    }

    /// Fires the pending ADMA3 batch.
    fn adma3_flush(&self, done: BatchDone) -> MmcResult {
        drop(done);
        Err(MmcError::Unsupported)
    }
}

impl<T: MmcHostOps + ?Sized> MmcHostOps for alloc::sync::Arc<T> {
    fn request(&self, mrq: MmcRequest, done: RequestDone) {
        (**self).request(mrq, done)
    }

    fn set_ios(&self, ios: &MmcIos) -> MmcResult {
        (**self).set_ios(ios)
    }

    fn get_cd(&self) -> bool {
        (**self).get_cd()
    }

    fn get_ro(&self) -> bool {
        (**self).get_ro()
    }

    fn execute_tuning(&self, opcode: u8) -> MmcResult {
        (**self).execute_tuning(opcode)
    }

    fn hw_reset(&self) -> MmcResult {
        (**self).hw_reset()
    }

    fn limits(&self) -> HostLimits {
        (**self).limits()
    }

    fn caps(&self) -> MmcHostCaps {
        (**self).caps()
    }

    fn cmdq_request(&self, tag: u32, mrq: MmcRequest, done: RequestDone) {
        (**self).cmdq_request(tag, mrq, done)
    }

    fn adma3_enqueue(&self, mrq: MmcRequest) -> Result<(), (MmcError, MmcRequest)> {
        (**self).adma3_enqueue(mrq)
    }

    fn adma3_flush(&self, done: BatchDone) -> MmcResult {
        (**self).adma3_flush(done)
    }
}
