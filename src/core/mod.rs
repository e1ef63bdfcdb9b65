pub mod erase;
pub mod status;
pub mod transfer;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use kspin::SpinNoIrq;
use log::{debug, info, trace, warn};

pub use transfer::Outcome;

use crate::card::MmcCard;
use crate::common::commands::{MmcCommand, MmcRequest, R1Status, RspFlags};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::host::{BatchDone, HostLimits, MmcHostCaps, MmcHostOps, MmcIos, RequestDone};
use crate::osa::{Semaphore, completion};

/// Protocol-level view of one host controller and the card behind it.
///
/// Everything that talks to the card goes through here: the block layer,
/// the queue workers and the ioctl surface. Exclusive use of the bus is
/// taken with [`MmcHost::claim`].
pub struct MmcHost<T: MmcHostOps> {
    name: String,
    ops: T,
    card: SpinNoIrq<Option<Arc<MmcCard>>>,
    claim: Semaphore,
    ios: SpinNoIrq<MmcIos>,
}

/// Exclusive use of the bus until dropped.
pub struct HostClaim<'a, T: MmcHostOps> {
    host: &'a MmcHost<T>,
}

impl<T: MmcHostOps> Drop for HostClaim<'_, T> {
    fn drop(&mut self) {
        self.host.release_host();
    }
}

impl<T: MmcHostOps> MmcHost<T> {
    pub fn new(name: &str, ops: T) -> Self {
        info!("{}: host registered", name);
        MmcHost {
            name: name.to_string(),
            ops,
            card: SpinNoIrq::new(None),
            claim: Semaphore::new(),
            ios: SpinNoIrq::new(MmcIos::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ops(&self) -> &T {
        &self.ops
    }

    pub fn caps(&self) -> MmcHostCaps {
        self.ops.caps()
    }

    pub fn limits(&self) -> HostLimits {
        self.ops.limits()
    }

    pub fn is_spi(&self) -> bool {
        self.caps().contains(MmcHostCaps::SPI)
    }

    pub fn add_card(&self, card: Arc<MmcCard>) {
        info!(
            "{}: new {:?} card at address {:04x}",
            self.name,
            card.card_type(),
            card.rca()
        );
        *self.card.lock() = Some(card);
    }

    pub fn remove_card(&self) -> Option<Arc<MmcCard>> {
        let card = self.card.lock().take();
        if let Some(card) = card.as_ref() {
            card.set_removed(true);
            info!("{}: card {:04x} removed", self.name, card.rca());
        }
        card
    }

    pub fn card(&self) -> Option<Arc<MmcCard>> {
        self.card.lock().clone()
    }

    fn card_or_err(&self) -> MmcResult<Arc<MmcCard>> {
        self.card().ok_or(MmcError::MediumRemoved)
    }

    /// Blocks until this caller owns the bus.
    pub fn claim(&self) -> HostClaim<'_, T> {
        self.claim_host();
        HostClaim { host: self }
    }

    /// Long-lived claim for owners that cannot hold a guard, such as a
    /// queue worker between requests. Pair with [`MmcHost::release_host`].
    pub fn claim_host(&self) {
        self.claim.down();
    }

    pub fn release_host(&self) {
        self.claim.up();
    }

    pub fn ios(&self) -> MmcIos {
        *self.ios.lock()
    }

    pub fn set_ios(&self, ios: MmcIos) -> MmcResult {
        self.ops.set_ios(&ios)?;
        *self.ios.lock() = ios;
        Ok(())
    }

    /// A card that vanished from the slot is marked removed so that
    /// queued work fails fast.
    pub fn detect_card_removed(&self) -> bool {
        let Some(card) = self.card() else {
            return true;
        };
        if card.is_removed() {
            return true;
        }
        if !self.caps().contains(MmcHostCaps::NONREMOVABLE) && !self.ops.get_cd() {
            card.set_removed(true);
            warn!("{}: card {:04x} no longer present", self.name, card.rca());
            return true;
        }
        false
    }

    pub fn hw_reset(&self) -> MmcResult {
        match self.ops.hw_reset() {
            Ok(()) => {
                info!("{}: hardware reset done", self.name);
                Ok(())
            }
            Err(e) => {
                debug!("{}: hardware reset: {}", self.name, e);
                Err(e)
            }
        }
    }

    /// Hands `mrq` to the controller. `done` runs in completion context.
    pub fn start_request(&self, mut mrq: MmcRequest, done: RequestDone) {
        if self.card().is_some_and(|card| card.is_removed()) {
            mrq.cmd.error = Some(MmcError::MediumRemoved);
            done(mrq);
            return;
        }
        trace!(
            "{}: starting CMD{} arg {:#010x} flags {:?}",
            self.name, mrq.cmd.opcode, mrq.cmd.arg, mrq.cmd.flags
        );
        if let Some(data) = mrq.data.as_ref() {
            trace!(
                "{}: blksz {} blocks {} {:?} timeout {} ns + {} clks",
                self.name, data.blksz, data.blocks, data.dir, data.timeout_ns, data.timeout_clks
            );
        }
        self.ops.request(mrq, done);
    }

    /// Hands a tagged task to the command queue engine.
    pub fn start_cmdq(&self, tag: u32, mut mrq: MmcRequest, done: RequestDone) {
        if self.card().is_some_and(|card| card.is_removed()) {
            mrq.cmd.error = Some(MmcError::MediumRemoved);
            done(mrq);
            return;
        }
        trace!("{}: task {} CMD{} arg {:#010x}", self.name, tag, mrq.cmd.opcode, mrq.cmd.arg);
        self.ops.cmdq_request(tag, mrq, done);
    }

    /// Adds `mrq` to the pending ADMA3 batch, handing it back on failure.
    pub fn adma3_enqueue(&self, mrq: MmcRequest) -> Result<(), (MmcError, MmcRequest)> {
        self.ops.adma3_enqueue(mrq)
    }

    pub fn adma3_flush(&self, done: BatchDone) -> MmcResult {
        trace!("{}: flushing ADMA3 batch", self.name);
        self.ops.adma3_flush(done)
    }

    /// Runs `mrq` and blocks until the controller hands it back.
    pub fn wait_for_req(&self, mrq: MmcRequest) -> MmcResult<MmcRequest> {
        let (tx, rx) = completion();
        self.start_request(
            mrq,
            Box::new(move |mrq| {
                tx.complete(mrq);
            }),
        );
        rx.wait().ok_or(MmcError::Io)
    }

    /// Sends a command without data, retrying up to `cmd.retries` times
    /// unless the card is gone.
    pub fn wait_for_cmd(&self, cmd: MmcCommand) -> MmcResult<MmcCommand> {
        let mut retries = cmd.retries;
        let mut cmd = cmd;
        loop {
            cmd.error = None;
            let done = self.wait_for_req(MmcRequest::new(cmd))?;
            cmd = done.cmd;
            match cmd.error {
                None => return Ok(cmd),
                Some(MmcError::MediumRemoved) => return Err(MmcError::MediumRemoved),
                Some(e) if retries == 0 => {
                    debug!("{}: CMD{} failed: {}", self.name, cmd.opcode, e);
                    return Err(e);
                }
                Some(e) => {
                    debug!("{}: CMD{} error {}, {} retries left", self.name, cmd.opcode, e, retries);
                    retries -= 1;
                }
            }
        }
    }

    /// CMD55 ahead of an application command.
    pub fn app_cmd(&self, card: &MmcCard) -> MmcResult {
        let cmd = self.wait_for_cmd(MmcCommand::new(MMC_APP_CMD, card.rca_arg(), RspFlags::R1))?;
        if !cmd.r1().contains(R1Status::APP_CMD) {
            warn!("{}: card did not accept APP_CMD", self.name);
            return Err(MmcError::Unsupported);
        }
        Ok(())
    }

    /// CMD23 ahead of a transfer whose length the card must know up front.
    pub fn set_blockcount(&self, blocks: u32, reliable: bool) -> MmcResult {
        let mut arg = blocks & 0xFFFF;
        if reliable {
            arg |= MMC_SBC_RELIABLE_WRITE;
        }
        self.wait_for_cmd(MmcCommand::new(MMC_SET_BLOCK_COUNT, arg, RspFlags::R1).with_retries(5))?;
        Ok(())
    }

    /// Writes one EXT_CSD byte and waits for the card to leave programming.
    pub fn switch(&self, index: u32, value: u8, busy_timeout_ms: u32) -> MmcResult {
        let card = self.card_or_err()?;
        let cmd = MmcCommand::switch(index, value, busy_timeout_ms).with_retries(0);
        debug!("{}: SWITCH index {} value {:#x}", self.name, index, value);
        self.wait_for_cmd(cmd)?;
        if self.is_spi() {
            return Ok(());
        }
        let timeout = if busy_timeout_ms == 0 {
            MMC_BLK_TIMEOUT_MS
        } else {
            busy_timeout_ms
        };
        let status = self.poll_for_busy(&card, timeout)?;
        if status.contains(R1Status::SWITCH_ERROR) {
            warn!("{}: switch error on index {}", self.name, index);
            return Err(MmcError::Io);
        }
        Ok(())
    }
}
