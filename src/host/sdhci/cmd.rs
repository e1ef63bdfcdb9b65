use core::time::Duration;

use log::{debug, error, trace};

use super::{CmdLeg, Finished, SdhciHost, SdhciOps, SdhciState, TransferState};
use crate::common::commands::{MmcCommand, MmcData, MmcRequest, RspFlags, r2_from_raw};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::dma::adma::AdmaTable;
use crate::dma::adma3::Adma3Command;
use crate::osa::{msleep, now};

/// Command register value for `cmd`.
pub(crate) fn command_word(cmd: &MmcCommand, with_data: bool) -> MmcResult<u16> {
    if cmd.is_long() && cmd.has_busy() {
        error!("CMD{}: unsupported response type (long with busy)", cmd.opcode);
        return Err(MmcError::InvalidValue);
    }

    let mut flags = if !cmd.flags.contains(RspFlags::PRESENT) {
        SDHCI_CMD_RESP_NONE
    } else if cmd.is_long() {
        SDHCI_CMD_RESP_LONG
    } else if cmd.has_busy() {
        SDHCI_CMD_RESP_SHORT_BUSY
    } else {
        SDHCI_CMD_RESP_SHORT
    };
    if cmd.flags.contains(RspFlags::CRC) {
        flags |= SDHCI_CMD_CRC;
    }
    if cmd.flags.contains(RspFlags::OPCODE) {
        flags |= SDHCI_CMD_INDEX;
    }
    if with_data || matches!(cmd.opcode, MMC_SEND_TUNING_BLOCK | MMC_SEND_TUNING_BLOCK_HS200) {
        flags |= SDHCI_CMD_DATA;
    }
    Ok(((cmd.opcode as u16) << 8) | flags)
}

fn is_multi_opcode(opcode: u8) -> bool {
    matches!(opcode, MMC_READ_MULTIPLE_BLOCK | MMC_WRITE_MULTIPLE_BLOCK)
}

impl<R: SdhciOps> SdhciHost<R> {
    /// The controller issues CMD12 itself after the data phase.
    pub(crate) fn auto_cmd12(&self, mrq: &MmcRequest) -> bool {
        self.quirks.auto_cmd12 && mrq.sbc.is_none() && mrq.stop.is_some()
    }

    /// The controller issues CMD23 itself before the command.
    pub(crate) fn auto_cmd23(&self, mrq: &MmcRequest) -> bool {
        self.quirks.auto_cmd23 && mrq.sbc.as_ref().is_some_and(|c| c.opcode == MMC_SET_BLOCK_COUNT)
    }

    /// Transfer mode register value for a data request.
    pub(crate) fn transfer_mode(&self, mrq: &MmcRequest) -> u16 {
        let Some(data) = mrq.data.as_ref() else {
            return 0;
        };
        let mut mode = SDHCI_TRNS_BLK_CNT_EN | SDHCI_TRNS_DMA;
        if is_multi_opcode(mrq.cmd.opcode) || data.blocks > 1 {
            mode |= SDHCI_TRNS_MULTI;
            if self.auto_cmd12(mrq) {
                mode |= SDHCI_TRNS_AUTO_CMD12;
            } else if self.auto_cmd23(mrq) {
                mode |= SDHCI_TRNS_AUTO_CMD23;
            }
        }
        if data.is_read() {
            mode |= SDHCI_TRNS_READ;
        }
        mode
    }

    /// Software watchdog for one command, in milliseconds.
    pub(crate) fn watchdog_ms(&self, cmd: &MmcCommand, with_data: bool) -> u64 {
        if cmd.is_sanitize() {
            self.config.sanitize_watchdog_ms
        } else if !with_data && cmd.busy_timeout_ms > SDHCI_LONG_BUSY_THRESHOLD_MS {
            (cmd.busy_timeout_ms.div_ceil(1000) as u64 + 1) * 1000
        } else {
            self.config.watchdog_ms
        }
    }

    /// Data/busy timeout counter: the smallest power-of-two multiple of
    /// 2^13 timeout clocks covering the requested time.
    pub(crate) fn calc_timeout(&self, cmd: &MmcCommand, data: Option<&MmcData>, clock: u32) -> u8 {
        if self.quirks.broken_timeout_val {
            return SDHCI_MAX_TIMEOUT_COUNT;
        }

        let target_us = match data {
            Some(data) => {
                let mut us = data.timeout_ns / 1000;
                if clock != 0 {
                    us += data.timeout_clks as u64 * 1_000_000 / clock as u64;
                }
                us
            }
            None if cmd.has_busy() && cmd.busy_timeout_ms != 0 => cmd.busy_timeout_ms as u64 * 1000,
            None => return SDHCI_MAX_TIMEOUT_COUNT,
        };

        let timeout_clk = if self.quirks.data_timeout_uses_sdclk {
            clock / 1000
        } else {
            self.timeout_clk
        };
        if timeout_clk == 0 {
            return SDHCI_MAX_TIMEOUT_COUNT;
        }

        let mut count: u8 = 0;
        let mut current_us = (1u64 << 13) * 1000 / timeout_clk as u64;
        while current_us < target_us {
            count += 1;
            current_us <<= 1;
            if count >= 0xF {
                break;
            }
        }
        if count >= 0xF {
            debug!(
                "{}: too large timeout {} us requested for CMD{}",
                self.name, target_us, cmd.opcode
            );
            count = SDHCI_MAX_TIMEOUT_COUNT;
        }
        count
    }

    fn wait_inhibit(&self, mask: u32) -> MmcResult {
        let mut timeout = SDHCI_INHIBIT_TIMEOUT_MS;
        while self.regs.read_reg32(SDHCI_PRESENT_STATE) & mask != 0 {
            if timeout == 0 {
                error!("{}: controller never released inhibit bit(s) {:#x}", self.name, mask);
                self.dump_regs();
                return Err(MmcError::Io);
            }
            timeout -= 1;
            msleep(1);
        }
        Ok(())
    }

    /// Builds the ADMA2 chain and programs block geometry.
    fn prepare_data(&self, adma: &mut AdmaTable, data: &MmcData) -> MmcResult {
        adma.build(&*self.mem, &data.sg, data.dir)?;

        let addr = adma.bus_addr();
        self.regs.write_reg32(SDHCI_ADMA_ADDRESS, addr as u32);
        if self.addressing.is_64bit() {
            self.regs.write_reg32(SDHCI_ADMA_ADDRESS_HI, (addr >> 32) as u32);
        }

        let mut ctrl = self.regs.read_reg8(SDHCI_HOST_CONTROL) & !SDHCI_CTRL_DMA_MASK;
        ctrl |= if self.addressing.is_64bit() {
            SDHCI_CTRL_ADMA64
        } else {
            SDHCI_CTRL_ADMA32
        };
        self.regs.write_reg8(SDHCI_HOST_CONTROL, ctrl);

        self.regs.write_reg16(SDHCI_BLOCK_SIZE, (7 << 12) | (data.blksz as u16 & 0xFFF));
        self.regs.write_reg16(SDHCI_BLOCK_COUNT, data.blocks as u16);
        Ok(())
    }

    /// Puts one leg of the bound request on the wire.
    pub(crate) fn send_command(&self, st: &mut SdhciState, leg: CmdLeg) -> MmcResult {
        let pending = st.pending.as_ref().ok_or(MmcError::InvalidValue)?;
        let mrq = &pending.mrq;
        let cmd = leg.of(mrq).ok_or(MmcError::InvalidValue)?;
        let data = if leg == CmdLeg::Cmd { mrq.data.as_ref() } else { None };

        let mut mask = SDHCI_CMD_INHIBIT;
        if (data.is_some() || cmd.has_busy()) && leg != CmdLeg::Stop {
            mask |= SDHCI_DATA_INHIBIT;
        }
        self.wait_inhibit(mask)?;

        let command = command_word(cmd, data.is_some())?;
        let watchdog = self.watchdog_ms(cmd, data.is_some());
        st.watchdog = Some(now() + Duration::from_millis(watchdog));

        if let Some(data) = data {
            self.prepare_data(&mut st.adma, data)?;
        }
        if data.is_some() || cmd.has_busy() {
            self.regs
                .write_reg8(SDHCI_TIMEOUT_CONTROL, self.calc_timeout(cmd, data, st.clock));
        }

        if data.is_some() {
            if self.auto_cmd23(mrq) {
                if let Some(sbc) = mrq.sbc.as_ref() {
                    self.regs.write_reg32(SDHCI_ARGUMENT2, sbc.arg);
                }
            }
            self.regs.write_reg16(SDHCI_TRANSFER_MODE, self.transfer_mode(mrq));
        } else {
            let mode = self.regs.read_reg16(SDHCI_TRANSFER_MODE);
            self.regs
                .write_reg16(SDHCI_TRANSFER_MODE, mode & !(SDHCI_TRNS_AUTO_CMD12 | SDHCI_TRNS_AUTO_CMD23));
        }

        trace!(
            "{}: CMD{} arg {:#010x} command {:#06x} ({:?})",
            self.name, cmd.opcode, cmd.arg, command, leg
        );
        self.regs.write_reg32(SDHCI_ARGUMENT, cmd.arg);

        let with_data = data.is_some();
        st.leg = Some(leg);
        st.phase = TransferState::CommandSent;
        st.busy_handle = false;
        st.data_early = false;
        st.data_bound = with_data;

        self.regs.write_reg16(SDHCI_COMMAND, command);
        Ok(())
    }

    /// Whether the leg's completion is signalled by transfer complete.
    pub(crate) fn waits_for_busy(&self, cmd: &MmcCommand, leg: CmdLeg) -> bool {
        let busy = cmd.has_busy() || (leg == CmdLeg::Stop && self.quirks.stop_with_tc);
        busy && !self.quirks.no_busy_irq
    }

    /// Reads the response of the leg on the wire and moves the request on.
    pub(crate) fn finish_command(&self, st: &mut SdhciState, finished: &mut alloc::vec::Vec<Finished>) {
        let Some(leg) = st.leg else {
            return;
        };
        let Some(pending) = st.pending.as_mut() else {
            return;
        };
        let has_data = pending.mrq.data.is_some();
        let has_task = pending.mrq.task_addr.is_some();
        let Some(cmd) = leg.of_mut(&mut pending.mrq) else {
            return;
        };

        if cmd.is_long() {
            let raw = [
                self.regs.read_reg32(SDHCI_RESPONSE),
                self.regs.read_reg32(SDHCI_RESPONSE + 4),
                self.regs.read_reg32(SDHCI_RESPONSE + 8),
                self.regs.read_reg32(SDHCI_RESPONSE + 12),
            ];
            cmd.resp = r2_from_raw(raw);
        } else if cmd.flags.contains(RspFlags::PRESENT) {
            cmd.resp[0] = self.regs.read_reg32(SDHCI_RESPONSE);
        }
        let busy = self.waits_for_busy(cmd, leg);
        st.phase = TransferState::ResponseReceived;

        match leg {
            CmdLeg::Sbc if has_task => self.start_leg(st, CmdLeg::TaskAddr, finished),
            CmdLeg::Sbc | CmdLeg::TaskAddr => self.start_leg(st, CmdLeg::Cmd, finished),
            CmdLeg::Cmd if has_data => {
                if st.data_early {
                    self.finish_data(st, finished);
                } else {
                    st.phase = TransferState::DataInFlight;
                }
            }
            CmdLeg::Cmd | CmdLeg::Stop => {
                if busy && !st.data_early {
                    st.busy_handle = true;
                    st.phase = TransferState::BusyWait;
                } else {
                    self.finish_request(st, finished);
                }
            }
        }
    }

    /// Register values for one ADMA3 batch entry.
    pub(crate) fn adma3_command(&self, mrq: &MmcRequest) -> MmcResult<Adma3Command> {
        let data = mrq.data.as_ref().ok_or(MmcError::InvalidValue)?;
        Ok(Adma3Command {
            blocks: data.blocks,
            blksz: data.blksz,
            arg: mrq.cmd.arg,
            command: command_word(&mrq.cmd, true)?,
            mode: self.transfer_mode(mrq),
        })
    }
}
