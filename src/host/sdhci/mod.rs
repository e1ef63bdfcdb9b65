//! SD Host Controller driver: the register-level half of the transfer
//! state machine.
//!
//! A request is bound to the host under `lock`, its commands are written
//! to the controller one leg at a time and the interrupt handler walks it
//! through the phases of [`TransferState`]. Completion callbacks are
//! collected while the lock is held and invoked after it is dropped.

mod clock;
mod cmd;
mod irq;
pub mod quirks;
pub mod regs;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use kspin::SpinNoIrq;
use log::{debug, error, info, warn};

pub use quirks::{SdhciConfig, SdhciQuirks, SdhciVariant};
pub use regs::{IntStatus, SdhciOps, SdhciReset};

use crate::common::commands::{MmcCommand, MmcRequest};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::dma::adma::AdmaTable;
use crate::dma::adma3::Adma3Table;
use crate::dma::{AdmaAddressing, DmaMemory};
use crate::host::{BatchDone, HostLimits, MmcHostCaps, MmcHostOps, MmcIos, RequestDone};

/// Phase of the request currently bound to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    CommandSent,
    ResponseReceived,
    DataInFlight,
    BusyWait,
    Complete,
    Error,
}

/// The command of a request that is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmdLeg {
    Sbc,
    /// CMD45 ahead of a queued task's execute command.
    TaskAddr,
    Cmd,
    Stop,
}

impl CmdLeg {
    fn of(self, mrq: &MmcRequest) -> Option<&MmcCommand> {
        match self {
            CmdLeg::Sbc => mrq.sbc.as_ref(),
            CmdLeg::TaskAddr => mrq.task_addr.as_ref(),
            CmdLeg::Cmd => Some(&mrq.cmd),
            CmdLeg::Stop => mrq.stop.as_ref(),
        }
    }

    fn of_mut(self, mrq: &mut MmcRequest) -> Option<&mut MmcCommand> {
        match self {
            CmdLeg::Sbc => mrq.sbc.as_mut(),
            CmdLeg::TaskAddr => mrq.task_addr.as_mut(),
            CmdLeg::Cmd => Some(&mut mrq.cmd),
            CmdLeg::Stop => mrq.stop.as_mut(),
        }
    }
}

struct Pending {
    mrq: MmcRequest,
    done: RequestDone,
}

struct Adma3State {
    table: Adma3Table,
    queued: Vec<MmcRequest>,
    inflight: Option<(Vec<MmcRequest>, BatchDone)>,
}

/// A terminal result waiting to be handed back once `lock` is released.
pub(crate) enum Finished {
    Request(MmcRequest, RequestDone),
    Batch(Vec<MmcRequest>, BatchDone),
}

impl Finished {
    fn complete(self) {
        match self {
            Finished::Request(mrq, done) => done(mrq),
            Finished::Batch(batch, done) => done(batch),
        }
    }
}

fn complete_all(finished: Vec<Finished>) {
    for f in finished {
        f.complete();
    }
}

pub(crate) struct SdhciState {
    phase: TransferState,
    pending: Option<Pending>,
    leg: Option<CmdLeg>,
    data_bound: bool,
    busy_handle: bool,
    /// Transfer complete arrived before the command response.
    data_early: bool,
    adma: AdmaTable,
    adma3: Option<Adma3State>,
    watchdog: Option<Duration>,
    /// Card clock actually programmed, in Hz.
    clock: u32,
    ios: MmcIos,
}

pub struct SdhciHost<R: SdhciOps> {
    name: &'static str,
    regs: R,
    quirks: SdhciQuirks,
    config: SdhciConfig,
    mem: Arc<dyn DmaMemory>,
    addressing: AdmaAddressing,
    version: u16,
    max_clk: u32,
    /// Timeout clock in kHz.
    timeout_clk: u32,
    lock: SpinNoIrq<SdhciState>,
}

impl<R: SdhciOps> SdhciHost<R> {
    /// Resets the controller, reads its capabilities and allocates the
    /// descriptor tables.
    pub fn new(name: &'static str, regs: R, mem: Arc<dyn DmaMemory>, config: SdhciConfig) -> MmcResult<Self> {
        let quirks = config.effective_quirks();
        info!("{}: init SDHCI controller ({:?})", name, config.variant);

        if quirks.clock_before_reset {
            let clk = regs.read_reg16(SDHCI_CLOCK_CONTROL);
            regs.write_reg16(SDHCI_CLOCK_CONTROL, clk | SDHCI_CLOCK_INT_EN | SDHCI_CLOCK_CARD_EN);
        }
        regs.reset(SdhciReset::ALL)?;

        let version = regs.read_reg16(SDHCI_HOST_VERSION) & SDHCI_SPEC_VER_MASK;
        let caps = regs.read_reg32(SDHCI_CAPABILITIES);
        info!("{}: version {:#x}, capabilities {:#010x}", name, version, caps);

        if caps & SDHCI_CAN_DO_ADMA2 == 0 {
            error!("{}: controller has no ADMA2 engine", name);
            return Err(MmcError::Unsupported);
        }

        let max_clk = match config.max_clk {
            0 => ((caps & SDHCI_CLOCK_V3_BASE_MASK) >> SDHCI_CLOCK_BASE_SHIFT) * 1_000_000,
            clk => clk,
        };
        if max_clk == 0 {
            error!("{}: hardware doesn't specify base clock frequency", name);
            return Err(MmcError::Unsupported);
        }

        let mut timeout_clk = config.timeout_clk;
        if timeout_clk == 0 {
            timeout_clk = caps & SDHCI_TIMEOUT_CLK_MASK;
            if caps & SDHCI_TIMEOUT_CLK_UNIT != 0 {
                timeout_clk *= 1000;
            }
        }
        if timeout_clk == 0 && !quirks.data_timeout_uses_sdclk {
            error!("{}: hardware doesn't specify timeout clock frequency", name);
            return Err(MmcError::Unsupported);
        }

        let addressing = quirks.addressing(caps, version);
        if addressing == AdmaAddressing::Bits64V4 {
            let ctrl2 = regs.read_reg16(SDHCI_HOST_CONTROL2);
            regs.write_reg16(SDHCI_HOST_CONTROL2, ctrl2 | SDHCI_CTRL_V4_MODE | SDHCI_CTRL_64BIT_ADDR);
        }

        let adma = AdmaTable::new(&*mem, addressing, config.adma_max_segs, quirks.adma())?;
        let adma3 = if quirks.adma3 {
            let table = Adma3Table::new(&*mem, addressing, config.adma3_depth, config.adma_max_segs, quirks.adma())?;
            Some(Adma3State {
                table,
                queued: Vec::new(),
                inflight: None,
            })
        } else {
            None
        };

        let ier = (IntStatus::CMD_MASK | IntStatus::DATA_MASK | IntStatus::CARD_MASK).bits();
        regs.write_reg32(SDHCI_INT_ENABLE, ier);
        regs.write_reg32(SDHCI_SIGNAL_ENABLE, ier);

        info!(
            "{}: base clock {} Hz, timeout clock {} kHz, {:?} descriptors",
            name, max_clk, timeout_clk, addressing
        );

        Ok(Self {
            name,
            regs,
            quirks,
            config,
            mem,
            addressing,
            version,
            max_clk,
            timeout_clk,
            lock: SpinNoIrq::new(SdhciState {
                phase: TransferState::Idle,
                pending: None,
                leg: None,
                data_bound: false,
                busy_handle: false,
                data_early: false,
                adma,
                adma3,
                watchdog: None,
                clock: 0,
                ios: MmcIos::default(),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn quirks(&self) -> &SdhciQuirks {
        &self.quirks
    }

    pub fn addressing(&self) -> AdmaAddressing {
        self.addressing
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn transfer_state(&self) -> TransferState {
        self.lock.lock().phase
    }

    fn card_present(&self) -> bool {
        self.config.caps.contains(MmcHostCaps::NONREMOVABLE) || self.regs.card_present()
    }

    /// Binds `mrq` to the controller and puts its first command on the wire.
    pub fn request(&self, mut mrq: MmcRequest, done: RequestDone) {
        let mut finished = Vec::new();
        {
            let mut guard = self.lock.lock();
            let st = &mut *guard;
            if st.pending.is_some() || st.adma3.as_ref().is_some_and(|a| a.inflight.is_some()) {
                warn!("{}: request CMD{} while the controller is busy", self.name, mrq.cmd.opcode);
                mrq.cmd.error = Some(MmcError::NotReady);
                finished.push(Finished::Request(mrq, done));
            } else if !self.card_present() {
                mrq.cmd.error = Some(MmcError::MediumRemoved);
                finished.push(Finished::Request(mrq, done));
            } else {
                let leg = if mrq.sbc.is_some() && !self.auto_cmd23(&mrq) {
                    CmdLeg::Sbc
                } else if mrq.task_addr.is_some() {
                    CmdLeg::TaskAddr
                } else {
                    CmdLeg::Cmd
                };
                st.phase = TransferState::Idle;
                st.pending = Some(Pending { mrq, done });
                self.start_leg(st, leg, &mut finished);
            }
        }
        complete_all(finished);
    }

    /// Sends `leg`, failing the request in place if it cannot go out.
    fn start_leg(&self, st: &mut SdhciState, leg: CmdLeg, finished: &mut Vec<Finished>) {
        if let Err(err) = self.send_command(st, leg) {
            if let Some(cmd) = st.pending.as_mut().and_then(|p| leg.of_mut(&mut p.mrq)) {
                cmd.error = Some(err);
            }
            self.finish_request(st, finished);
        }
    }

    /// Queues a data request into the pending ADMA3 batch.
    pub fn adma3_enqueue(&self, mrq: MmcRequest) -> Result<(), (MmcError, MmcRequest)> {
        let mut guard = self.lock.lock();
        let st = &mut *guard;
        let Some(a3) = st.adma3.as_mut() else {
            return Err((MmcError::Unsupported, mrq));
        };
        if a3.inflight.is_some() {
            return Err((MmcError::NotReady, mrq));
        }
        let entry = match self.adma3_command(&mrq) {
            Ok(entry) => entry,
            Err(err) => return Err((err, mrq)),
        };
        let Some(data) = mrq.data.as_ref() else {
            return Err((MmcError::InvalidValue, mrq));
        };
        if let Err(err) = a3.table.push(&*self.mem, entry, &data.sg, data.dir) {
            return Err((err, mrq));
        }
        a3.queued.push(mrq);
        Ok(())
    }

    /// Seals the pending batch and points the controller at it.
    pub fn adma3_flush(&self, done: BatchDone) -> MmcResult {
        let mut finished = Vec::new();
        {
            let mut guard = self.lock.lock();
            let st = &mut *guard;
            if st.pending.is_some() {
                return Err(MmcError::NotReady);
            }
            let a3 = st.adma3.as_mut().ok_or(MmcError::Unsupported)?;
            if a3.inflight.is_some() {
                return Err(MmcError::NotReady);
            }
            if a3.queued.is_empty() {
                finished.push(Finished::Batch(Vec::new(), done));
            } else {
                a3.table.mark_end(&*self.mem)?;
                let addr = a3.table.bus_addr();
                let batch = core::mem::take(&mut a3.queued);
                debug!("{}: ADMA3 flush of {} requests at {:#x}", self.name, batch.len(), addr);
                a3.inflight = Some((batch, done));

                st.phase = TransferState::DataInFlight;
                st.watchdog = Some(crate::osa::now() + Duration::from_millis(self.config.watchdog_ms));
                if self.addressing.is_64bit() {
                    self.regs.write_reg32(SDHCI_ADMA3_ADDRESS_HI, (addr >> 32) as u32);
                }
                // the low half starts the engine
                self.regs.write_reg32(SDHCI_ADMA3_ADDRESS, addr as u32);
            }
        }
        complete_all(finished);
        Ok(())
    }

    /// Logs the controller state after a failure.
    pub fn dump_regs(&self) {
        error!("{}: ============ SDHCI REGISTER DUMP ============", self.name);
        error!(
            "{}: present {:#010x} | host ctl {:#04x} | clock {:#06x}",
            self.name,
            self.regs.read_reg32(SDHCI_PRESENT_STATE),
            self.regs.read_reg8(SDHCI_HOST_CONTROL),
            self.regs.read_reg16(SDHCI_CLOCK_CONTROL)
        );
        error!(
            "{}: int stat {:#010x} | int enab {:#010x} | acmd err {:#06x}",
            self.name,
            self.regs.read_reg32(SDHCI_INT_STATUS),
            self.regs.read_reg32(SDHCI_INT_ENABLE),
            self.regs.read_reg16(SDHCI_ACMD12_ERR)
        );
        error!(
            "{}: blk size {:#06x} | blk cnt {:#06x} | xfer mode {:#06x} | adma err {:#010x}",
            self.name,
            self.regs.read_reg16(SDHCI_BLOCK_SIZE),
            self.regs.read_reg16(SDHCI_BLOCK_COUNT),
            self.regs.read_reg16(SDHCI_TRANSFER_MODE),
            self.regs.read_reg32(SDHCI_ADMA_ERROR)
        );
    }
}

impl<R: SdhciOps> MmcHostOps for SdhciHost<R> {
    fn request(&self, mrq: MmcRequest, done: RequestDone) {
        SdhciHost::request(self, mrq, done)
    }

    fn set_ios(&self, ios: &MmcIos) -> MmcResult {
        SdhciHost::set_ios(self, ios)
    }

    fn get_cd(&self) -> bool {
        self.card_present()
    }

    fn get_ro(&self) -> bool {
        self.regs.get_ro(self.quirks.inverted_write_protect)
    }

    fn execute_tuning(&self, opcode: u8) -> MmcResult {
        SdhciHost::execute_tuning(self, opcode)
    }

    fn limits(&self) -> HostLimits {
        HostLimits {
            max_segs: self.config.adma_max_segs as u32,
            max_seg_size: self.quirks.adma().max_desc_len(),
            ..HostLimits::default()
        }
    }

    fn caps(&self) -> MmcHostCaps {
        self.config.caps | self.quirks.host_caps()
    }

    fn adma3_enqueue(&self, mrq: MmcRequest) -> Result<(), (MmcError, MmcRequest)> {
        SdhciHost::adma3_enqueue(self, mrq)
    }

    fn adma3_flush(&self, done: BatchDone) -> MmcResult {
        SdhciHost::adma3_flush(self, done)
    }
}
