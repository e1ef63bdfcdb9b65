use alloc::vec::Vec;

use log::{debug, error, info, trace, warn};

use super::{CmdLeg, Finished, IntStatus, SdhciHost, SdhciOps, SdhciReset, SdhciState, TransferState, complete_all};
use crate::common::err::MmcError;
use crate::constants::*;
use crate::osa::now;

/// Error of the command leg, if the status word carries one.
fn command_error(status: IntStatus) -> Option<MmcError> {
    if status.contains(IntStatus::TIMEOUT) {
        Some(MmcError::CommandTimeout)
    } else if status.contains(IntStatus::CRC) {
        Some(MmcError::CommandCrc)
    } else if status.contains(IntStatus::END_BIT) {
        Some(MmcError::CommandEndBit)
    } else if status.contains(IntStatus::INDEX) {
        Some(MmcError::CommandIndex)
    } else {
        None
    }
}

/// Auto CMD12/CMD23 error register to an error kind.
fn auto_cmd_error(acmd: u16) -> MmcError {
    if acmd & 0x02 != 0 {
        MmcError::CommandTimeout
    } else if acmd & 0x04 != 0 {
        MmcError::CommandCrc
    } else if acmd & 0x08 != 0 {
        MmcError::CommandEndBit
    } else if acmd & 0x10 != 0 {
        MmcError::CommandIndex
    } else {
        MmcError::Io
    }
}

impl<R: SdhciOps> SdhciHost<R> {
    /// Interrupt entry point. Returns whether the controller had anything
    /// pending.
    pub fn irq(&self) -> bool {
        let mut finished = Vec::new();
        let mut handled = false;
        {
            let mut guard = self.lock.lock();
            let st = &mut *guard;
            let mut loops = 0;
            loop {
                let raw = self.regs.read_reg32(SDHCI_INT_STATUS);
                let status = IntStatus::from_bits_truncate(raw);
                if status.is_empty() {
                    break;
                }
                if loops >= SDHCI_MAX_IRQ_LOOPS {
                    error!("{}: too many interrupts, status {:#010x}", self.name, raw);
                    self.dump_regs();
                    break;
                }
                self.regs.write_reg32(SDHCI_INT_STATUS, raw);
                handled = true;
                trace!("{}: irq status {:?}", self.name, status);

                if status.intersects(IntStatus::CARD_MASK) {
                    self.card_event(st, status, &mut finished);
                }
                if status.intersects(IntStatus::CMD_MASK) {
                    self.cmd_irq(st, status & IntStatus::CMD_MASK, &mut finished);
                }
                if status.intersects(IntStatus::DATA_MASK) {
                    self.data_irq(st, status & IntStatus::DATA_MASK, &mut finished);
                }
                loops += 1;
            }
        }
        complete_all(finished);
        handled
    }

    fn card_event(&self, st: &mut SdhciState, status: IntStatus, finished: &mut Vec<Finished>) {
        if status.contains(IntStatus::CARD_INSERT) {
            info!("{}: card inserted", self.name);
        }
        if !status.contains(IntStatus::CARD_REMOVE) {
            return;
        }
        info!("{}: card removed", self.name);
        if let Some(pending) = st.pending.as_mut() {
            error!("{}: card removed during transfer, failing CMD{}", self.name, pending.mrq.cmd.opcode);
            pending.mrq.cmd.error = Some(MmcError::MediumRemoved);
            self.finish_request(st, finished);
        } else if st.adma3.as_ref().is_some_and(|a| a.inflight.is_some()) {
            self.adma3_complete(st, Some(MmcError::MediumRemoved), finished);
        }
    }

    fn cmd_irq(&self, st: &mut SdhciState, status: IntStatus, finished: &mut Vec<Finished>) {
        if st.adma3.as_ref().is_some_and(|a| a.inflight.is_some()) {
            if let Some(err) = command_error(status) {
                self.adma3_complete(st, Some(err), finished);
            }
            return;
        }
        let (Some(leg), Some(pending)) = (st.leg, st.pending.as_mut()) else {
            warn!("{}: got command interrupt {:?} even though no command operation was in progress", self.name, status);
            return;
        };

        if let Some(err) = command_error(status) {
            debug!("{}: CMD{} {:?} failed: {}", self.name, pending.mrq.cmd.opcode, leg, err);
            if let Some(cmd) = leg.of_mut(&mut pending.mrq) {
                cmd.error = Some(err);
            }
            self.finish_request(st, finished);
            return;
        }

        if status.contains(IntStatus::ACMD12ERR) {
            let err = auto_cmd_error(self.regs.read_reg16(SDHCI_ACMD12_ERR));
            warn!("{}: auto command error: {}", self.name, err);
            let mrq = &mut pending.mrq;
            let auto_leg = if mrq.sbc.is_some() { mrq.sbc.as_mut() } else { mrq.stop.as_mut() };
            match auto_leg {
                Some(cmd) => cmd.error = Some(err),
                None => mrq.cmd.error = Some(err),
            }
            self.finish_request(st, finished);
            return;
        }

        if status.contains(IntStatus::RESPONSE) {
            self.finish_command(st, finished);
        }
    }

    fn data_irq(&self, st: &mut SdhciState, status: IntStatus, finished: &mut Vec<Finished>) {
        if st.adma3.as_ref().is_some_and(|a| a.inflight.is_some()) {
            if let Some(err) = self.data_error(st, status) {
                self.adma3_complete(st, Some(err), finished);
            } else if status.contains(IntStatus::DATA_END) {
                self.adma3_complete(st, None, finished);
            }
            return;
        }

        if !st.data_bound {
            if st.pending.is_none() {
                trace!("{}: data interrupt {:?} with nothing bound", self.name, status);
                return;
            }
            if st.busy_handle {
                if status.contains(IntStatus::DATA_TIMEOUT) {
                    if let (Some(leg), Some(pending)) = (st.leg, st.pending.as_mut()) {
                        if let Some(cmd) = leg.of_mut(&mut pending.mrq) {
                            cmd.error = Some(MmcError::CommandTimeout);
                        }
                    }
                    self.finish_request(st, finished);
                } else if status.contains(IntStatus::DATA_END) {
                    st.busy_handle = false;
                    self.finish_request(st, finished);
                }
                return;
            }
            // busy end seen before the response was processed
            if st.phase == TransferState::CommandSent && status.contains(IntStatus::DATA_END) {
                st.data_early = true;
            }
            return;
        }

        if let Some(err) = self.data_error(st, status) {
            if let Some(data) = st.pending.as_mut().and_then(|p| p.mrq.data.as_mut()) {
                data.error = Some(err);
            }
            self.finish_data(st, finished);
            return;
        }

        if status.contains(IntStatus::DATA_END) {
            if st.leg == Some(CmdLeg::Cmd) && st.phase == TransferState::CommandSent {
                st.data_early = true;
            } else {
                self.finish_data(st, finished);
            }
        } else if status.contains(IntStatus::DMA_END) {
            trace!("{}: DMA boundary", self.name);
        }
    }

    fn data_error(&self, st: &SdhciState, status: IntStatus) -> Option<MmcError> {
        let opcode = st.pending.as_ref().map(|p| p.mrq.cmd.opcode);
        if status.contains(IntStatus::DATA_TIMEOUT) {
            Some(MmcError::DataTimeout)
        } else if status.contains(IntStatus::DATA_END_BIT) {
            Some(MmcError::DataEndBit)
        } else if status.contains(IntStatus::DATA_CRC) && opcode != Some(MMC_BUS_TEST_R) {
            Some(MmcError::DataCrc)
        } else if status.contains(IntStatus::ADMA_ERROR) {
            error!(
                "{}: ADMA error, status {:#010x}",
                self.name,
                self.regs.read_reg32(SDHCI_ADMA_ERROR)
            );
            match st.adma3.as_ref().filter(|a| a.inflight.is_some()) {
                Some(a3) => a3.table.dump(&*self.mem),
                None => st.adma.dump(&*self.mem),
            }
            Some(MmcError::AdmaError)
        } else {
            None
        }
    }

    /// Data phase over: account bytes, then stop or complete.
    pub(crate) fn finish_data(&self, st: &mut SdhciState, finished: &mut Vec<Finished>) {
        st.data_bound = false;
        let Some(pending) = st.pending.as_mut() else {
            return;
        };
        let auto12 = self.auto_cmd12(&pending.mrq);
        let mrq = &mut pending.mrq;
        let Some(data) = mrq.data.as_mut() else {
            self.finish_request(st, finished);
            return;
        };

        st.adma.finish(&*self.mem, &data.sg, data.dir);
        let failed = data.error.is_some();
        data.bytes_xfered = if failed { 0 } else { data.len() };

        if auto12 && !failed {
            if let Some(stop) = mrq.stop.as_mut() {
                stop.resp[0] = self.regs.read_reg32(SDHCI_RESPONSE + 12);
            }
        }

        let need_stop = mrq.stop.is_some() && (failed || (mrq.sbc.is_none() && !auto12));
        if !need_stop {
            self.finish_request(st, finished);
            return;
        }
        if failed {
            // the controller must be idle before the stop goes out
            self.reset(SdhciReset::CMD);
            self.reset(SdhciReset::DATA);
        }
        self.start_leg(st, CmdLeg::Stop, finished);
    }

    fn reset(&self, mask: SdhciReset) {
        if let Err(err) = self.regs.reset(mask) {
            error!("{}: reset {:?} failed: {}", self.name, mask, err);
            self.dump_regs();
        }
    }

    fn reset_for_recovery(&self, cmd_only: bool) {
        if self.quirks.clock_before_reset {
            let clk = self.regs.read_reg16(SDHCI_CLOCK_CONTROL);
            self.regs
                .write_reg16(SDHCI_CLOCK_CONTROL, clk | SDHCI_CLOCK_INT_EN | SDHCI_CLOCK_CARD_EN);
        }
        if !cmd_only {
            self.reset(SdhciReset::DATA);
        }
        self.reset(SdhciReset::CMD);
    }

    /// Unbinds the request, resetting the controller when a leg failed.
    pub(crate) fn finish_request(&self, st: &mut SdhciState, finished: &mut Vec<Finished>) {
        st.watchdog = None;
        st.leg = None;
        st.busy_handle = false;
        st.data_bound = false;
        st.data_early = false;

        let Some(pending) = st.pending.take() else {
            return;
        };
        let mrq = &pending.mrq;
        let failed = mrq.has_error();
        if failed || self.quirks.reset_after_request {
            let data_side = mrq.data.is_some()
                || mrq.stop.as_ref().is_some_and(|s| s.error.is_some());
            self.reset_for_recovery(!data_side);
        }
        if let Some((leg, err)) = mrq.first_error() {
            debug!("{}: CMD{} done with {:?} error {}", self.name, mrq.cmd.opcode, leg, err);
        }
        st.phase = if failed {
            TransferState::Error
        } else {
            TransferState::Complete
        };
        finished.push(Finished::Request(pending.mrq, pending.done));
    }

    fn adma3_complete(&self, st: &mut SdhciState, err: Option<MmcError>, finished: &mut Vec<Finished>) {
        st.watchdog = None;
        let Some(a3) = st.adma3.as_mut() else {
            return;
        };
        let Some((mut batch, done)) = a3.inflight.take() else {
            return;
        };

        for (i, mrq) in batch.iter_mut().enumerate() {
            match err {
                Some(e) if e.is_command_leg() => mrq.cmd.error = Some(e),
                Some(e) => {
                    if let Some(data) = mrq.data.as_mut() {
                        data.error = Some(e);
                        data.bytes_xfered = 0;
                    }
                }
                None => {
                    if let Some(data) = mrq.data.as_mut() {
                        a3.table.finish(&*self.mem, i, &data.sg, data.dir);
                        data.bytes_xfered = data.len();
                    }
                }
            }
        }
        a3.table.reset();

        if let Some(e) = err {
            warn!("{}: ADMA3 batch of {} failed: {}", self.name, batch.len(), e);
            self.reset_for_recovery(false);
            st.phase = TransferState::Error;
        } else {
            st.phase = TransferState::Complete;
        }
        finished.push(Finished::Batch(batch, done));
    }

    /// Software watchdog. The platform calls this from a timer; a request
    /// whose deadline has passed is failed with a timeout and the
    /// controller reset. Returns whether it fired.
    pub fn check_timeout(&self) -> bool {
        let mut finished = Vec::new();
        {
            let mut guard = self.lock.lock();
            let st = &mut *guard;
            match st.watchdog {
                Some(deadline) if now() >= deadline => {}
                _ => return false,
            }
            st.watchdog = None;
            error!("{}: timeout waiting for hardware interrupt", self.name);
            self.dump_regs();

            if st.adma3.as_ref().is_some_and(|a| a.inflight.is_some()) {
                self.adma3_complete(st, Some(MmcError::DataTimeout), &mut finished);
            } else if st.data_bound {
                if let Some(data) = st.pending.as_mut().and_then(|p| p.mrq.data.as_mut()) {
                    data.error = Some(MmcError::DataTimeout);
                }
                self.finish_data(st, &mut finished);
            } else if let Some(pending) = st.pending.as_mut() {
                let leg = st.leg.unwrap_or(CmdLeg::Cmd);
                if let Some(cmd) = leg.of_mut(&mut pending.mrq) {
                    cmd.error = Some(MmcError::CommandTimeout);
                }
                self.finish_request(st, &mut finished);
            }
        }
        complete_all(finished);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{SdhciConfig, SdhciReset, TransferState};
    use super::*;
    use crate::common::commands::{DataDir, Leg, MmcCommand, MmcData, MmcRequest, RspFlags, SgEntry};

    fn write(mem: &crate::dma::ram::RamMemory, blocks: u32) -> MmcRequest {
        let buf = mem.buffer((blocks * 512) as usize, 0);
        let data = MmcData::new(512, blocks, DataDir::Write, vec![SgEntry::new(buf, blocks * 512)]);
        MmcRequest::new(MmcCommand::new(MMC_WRITE_MULTIPLE_BLOCK, 0x40, RspFlags::R1))
            .with_data(data)
            .with_stop(MmcCommand::new(MMC_STOP_TRANSMISSION, 0, RspFlags::R1B))
    }

    #[test]
    fn error_bits_map_to_distinct_kinds() {
        assert_eq!(command_error(IntStatus::TIMEOUT | IntStatus::CRC), Some(MmcError::CommandTimeout));
        assert_eq!(command_error(IntStatus::CRC), Some(MmcError::CommandCrc));
        assert_eq!(command_error(IntStatus::END_BIT), Some(MmcError::CommandEndBit));
        assert_eq!(command_error(IntStatus::INDEX), Some(MmcError::CommandIndex));
        assert_eq!(command_error(IntStatus::RESPONSE), None);
        assert_eq!(auto_cmd_error(0x02), MmcError::CommandTimeout);
        assert_eq!(auto_cmd_error(0x01), MmcError::Io);
    }

    #[test]
    fn command_timeout_resets_only_the_command_line() {
        let (host, _mem) = host();
        let rx = submit(&host, MmcRequest::new(MmcCommand::new(MMC_SEND_STATUS, 0, RspFlags::R1)));
        interrupt(&host, IntStatus::ERROR | IntStatus::TIMEOUT);
        let mrq = rx.try_wait().unwrap();
        assert_eq!(mrq.cmd.error, Some(MmcError::CommandTimeout));
        assert_eq!(host.regs().resets(), vec![SdhciReset::CMD.bits()]);
        assert_eq!(host.transfer_state(), TransferState::Error);
    }

    #[test]
    fn data_crc_sends_stop_and_resets_both_lines() {
        let (host, mem) = host_with(SdhciConfig::tegra(), SDHCI_SPEC_300);
        let rx = submit(&host, write(&mem, 8));
        interrupt(&host, IntStatus::RESPONSE);
        interrupt(&host, IntStatus::ERROR | IntStatus::DATA_CRC);

        // stop went out manually after a CMD+DATA reset
        assert_eq!(host.regs().commands(), vec![MMC_WRITE_MULTIPLE_BLOCK, MMC_STOP_TRANSMISSION]);
        assert_eq!(host.regs().resets(), vec![SdhciReset::CMD.bits(), SdhciReset::DATA.bits()]);
        assert!(rx.try_wait().is_none());

        interrupt(&host, IntStatus::RESPONSE);
        assert_eq!(host.transfer_state(), TransferState::BusyWait);
        interrupt(&host, IntStatus::DATA_END);

        let mrq = rx.try_wait().unwrap();
        assert_eq!(mrq.leg_error(Leg::Data), Some(MmcError::DataCrc));
        assert_eq!(mrq.bytes_xfered(), 0);
        assert_eq!(mrq.leg_error(Leg::Stop), None);
        assert_eq!(
            host.regs().resets(),
            vec![
                SdhciReset::CMD.bits(),
                SdhciReset::DATA.bits(),
                SdhciReset::DATA.bits(),
                SdhciReset::CMD.bits()
            ]
        );
    }

    #[test]
    fn crc_on_bus_test_is_ignored() {
        let (host, mem) = host();
        let buf = mem.buffer(8, 0);
        let data = MmcData::new(8, 1, DataDir::Read, vec![SgEntry::new(buf, 8)]);
        let mrq = MmcRequest::new(MmcCommand::new(MMC_BUS_TEST_R, 0, RspFlags::R1)).with_data(data);
        let rx = submit(&host, mrq);
        interrupt(&host, IntStatus::RESPONSE);
        interrupt(&host, IntStatus::DATA_CRC | IntStatus::DATA_END);
        assert!(!rx.try_wait().unwrap().has_error());
    }

    #[test]
    fn adma_error_is_reported_on_the_data_leg() {
        let (host, mem) = host();
        let rx = submit(&host, write(&mem, 2));
        host.regs().poke32(SDHCI_ADMA_ERROR, 0x5);
        interrupt(&host, IntStatus::RESPONSE | IntStatus::ADMA_ERROR);
        // auto CMD12 is off once the data failed; the stop goes out by hand
        interrupt(&host, IntStatus::RESPONSE | IntStatus::DATA_END);
        let mrq = rx.try_wait().unwrap();
        assert_eq!(mrq.leg_error(Leg::Data), Some(MmcError::AdmaError));
    }

    #[test]
    fn removal_fails_the_bound_request() {
        let (host, mem) = host();
        let rx = submit(&host, write(&mem, 4));
        interrupt(&host, IntStatus::CARD_REMOVE);
        let mrq = rx.try_wait().unwrap();
        assert_eq!(mrq.cmd.error, Some(MmcError::MediumRemoved));
        assert_eq!(host.regs().resets(), vec![SdhciReset::DATA.bits(), SdhciReset::CMD.bits()]);
        // nothing left to complete
        interrupt(&host, IntStatus::DATA_END);
    }

    #[test]
    fn watchdog_fails_a_stalled_transfer() {
        let config = SdhciConfig {
            watchdog_ms: 0,
            ..Default::default()
        };
        let (host, mem) = host_with(config, SDHCI_SPEC_300);
        let rx = submit(&host, write(&mem, 1));
        interrupt(&host, IntStatus::RESPONSE);
        assert!(host.check_timeout());
        // the data timeout sends a stop, which stalls too
        assert!(host.check_timeout());
        let mrq = rx.try_wait().unwrap();
        assert_eq!(mrq.leg_error(Leg::Data), Some(MmcError::DataTimeout));
        assert_eq!(mrq.leg_error(Leg::Stop), Some(MmcError::CommandTimeout));
        assert!(!host.check_timeout());
    }

    #[test]
    fn watchdog_on_a_command_reports_command_timeout() {
        let config = SdhciConfig {
            watchdog_ms: 0,
            ..Default::default()
        };
        let (host, _mem) = host_with(config, SDHCI_SPEC_300);
        let rx = submit(&host, MmcRequest::new(MmcCommand::new(MMC_SEND_STATUS, 0, RspFlags::R1)));
        assert!(host.check_timeout());
        assert_eq!(rx.try_wait().unwrap().cmd.error, Some(MmcError::CommandTimeout));
    }

    #[test]
    fn spurious_interrupts_are_harmless() {
        let (host, _mem) = host();
        interrupt(&host, IntStatus::RESPONSE | IntStatus::DATA_END);
        assert!(!host.irq());
        assert_eq!(host.transfer_state(), TransferState::Idle);
    }
}
