//! Classification of a finished read/write request and the card-side
//! recovery steps taken before the dispatcher decides what to do next.

use alloc::vec;

use log::{error, warn};

use super::{BlkOp, BlkRequest, MmcBlkDevice, ReqFlags};
use crate::common::commands::{CardState, DataDir, MmcCommand, MmcData, MmcRequest, R1Status, RspFlags, SgEntry};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::core::Outcome;
use crate::core::transfer::set_data_timeout;
use crate::host::MmcHostOps;

/// What the card-side recovery concluded about a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    Abort,
    NoMedium,
    /// Only data or stop failed; let the data checks decide.
    Continue,
}

/// Verdict on one read/write exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkStatus {
    Success,
    /// Some bytes made it, more of the request remains.
    Partial,
    CmdErr,
    Retry,
    Abort,
    DataErr,
    EccErr,
    NoMedium,
}

/// How a failed sbc or r/w command should be handled, given the status
/// fetched afterwards.
fn classify_cmd_error(name: &str, leg: &str, err: MmcError, status_valid: bool, status: R1Status) -> RecoveryAction {
    if err.is_ilseq() {
        warn!("{}: {} response CRC error sending r/w cmd, retrying", name, leg);
        return RecoveryAction::Retry;
    }
    if err.is_timeout() {
        warn!(
            "{}: {} timed out sending r/w cmd, card status {:#x}",
            name,
            leg,
            status.bits()
        );
        // the status fetch itself struggled, so it may not describe this command
        if !status_valid {
            return RecoveryAction::Retry;
        }
        if status.intersects(R1Status::COM_CRC_ERROR | R1Status::ILLEGAL_COMMAND) {
            return RecoveryAction::Retry;
        }
        return RecoveryAction::Abort;
    }
    error!("{}: unknown error {} sending {}, card status {:#x}", name, err, leg, status.bits());
    RecoveryAction::Abort
}

impl<T: MmcHostOps> MmcBlkDevice<T> {
    fn send_stop(&self) -> MmcResult<R1Status> {
        let cmd = MmcCommand::new(MMC_STOP_TRANSMISSION, 0, RspFlags::R1B).with_retries(5);
        Ok(self.host.wait_for_cmd(cmd)?.r1())
    }

    /// Brings the card back to the transfer state after a failed exchange
    /// and decides whether the request is worth another go.
    pub fn cmd_recovery(
        &self,
        req: &mut BlkRequest,
        mrq: &mut MmcRequest,
        ecc_err: &mut bool,
        gen_err: &mut bool,
    ) -> RecoveryAction {
        if self.card.is_removed() {
            req.flags |= ReqFlags::QUIET;
            return RecoveryAction::NoMedium;
        }

        let mut status_valid = true;
        let mut status = Err(MmcError::Io);
        for left in (0..self.config.status_tries).rev() {
            status = self.host.get_card_status(&self.card, 0);
            match status {
                Ok(_) => break,
                Err(e) => {
                    status_valid = false;
                    error!(
                        "{}: error {} sending status command, {}",
                        self.name,
                        e,
                        if left > 0 { "retrying" } else { "aborting" }
                    );
                }
            }
        }
        let status = match status {
            Ok(status) => status,
            Err(_) => {
                if self.host.detect_card_removed() {
                    return RecoveryAction::NoMedium;
                }
                return RecoveryAction::Abort;
            }
        };

        let stop_resp = mrq.stop.as_ref().map_or(R1Status::empty(), |s| s.r1());
        if (status | stop_resp | mrq.cmd.r1()).contains(R1Status::CARD_ECC_FAILED) {
            *ecc_err = true;
        }
        let is_write = req.op == BlkOp::Write;
        if is_write && !self.host.is_spi() && (status | stop_resp).contains(R1Status::ERROR) {
            error!(
                "{}: general error sending stop or status command, stop cmd response {:#x}, card status {:#x}",
                self.name,
                stop_resp.bits(),
                status.bits()
            );
            *gen_err = true;
        }

        // Still sending or receiving data: tell it to stop.
        let mut stop_status = R1Status::empty();
        if matches!(status.current_state(), CardState::Data | CardState::Receive) {
            match self.send_stop() {
                Ok(s) => stop_status = s,
                Err(e) => {
                    error!("{}: error {} sending stop command", self.name, e);
                    return RecoveryAction::Abort;
                }
            }
            if stop_status.contains(R1Status::CARD_ECC_FAILED) {
                *ecc_err = true;
            }
            if is_write && !self.host.is_spi() && stop_status.contains(R1Status::ERROR) {
                error!(
                    "{}: general error sending stop command, stop cmd response {:#x}",
                    self.name,
                    stop_status.bits()
                );
                *gen_err = true;
            }
        }

        if let Some(err) = mrq.sbc.as_ref().and_then(|c| c.error) {
            return classify_cmd_error(&self.name, "SET_BLOCK_COUNT", err, status_valid, status);
        }
        if let Some(err) = mrq.cmd.error {
            return classify_cmd_error(&self.name, "r/w cmd", err, status_valid, status);
        }

        let Some(stop) = mrq.stop.as_mut() else {
            return RecoveryAction::Continue;
        };
        let Some(err) = stop.error else {
            return RecoveryAction::Continue;
        };
        // Stop errors don't fail the transfer; our own stop's status
        // describes what happened during it.
        error!(
            "{}: error {} sending stop command, original cmd response {:#x}, card status {:#x}",
            self.name,
            err,
            mrq.cmd.resp[0],
            status.bits()
        );
        stop.resp[0] = stop_status.bits();
        stop.error = None;
        RecoveryAction::Continue
    }

    /// Judges a finished read/write exchange.
    pub fn err_check(&self, req: &mut BlkRequest, mrq: &mut MmcRequest, outcome: &Outcome) -> BlkStatus {
        let mut ecc_err = false;
        let mut gen_err = outcome.gen_err;

        if mrq.has_error() {
            match self.cmd_recovery(req, mrq, &mut ecc_err, &mut gen_err) {
                RecoveryAction::Retry => return BlkStatus::Retry,
                RecoveryAction::Abort => return BlkStatus::Abort,
                RecoveryAction::NoMedium => return BlkStatus::NoMedium,
                RecoveryAction::Continue => {}
            }
        }

        if mrq.cmd.r1().intersects(R1Status::CMD_ERRORS) {
            error!("{}: r/w command failed, status = {:#x}", self.name, mrq.cmd.resp[0]);
            return BlkStatus::Abort;
        }

        let is_write = req.op == BlkOp::Write;
        if is_write && !self.host.is_spi() {
            if mrq.stop.as_ref().is_some_and(|s| s.r1().contains(R1Status::ERROR)) {
                error!("{}: general error sending stop command", self.name);
                gen_err = true;
            }
            if outcome.busy_err {
                return BlkStatus::CmdErr;
            }
        }

        if gen_err {
            warn!("{}: retrying write for general error", self.name);
            return BlkStatus::Retry;
        }

        let Some(data) = mrq.data.as_ref() else {
            return BlkStatus::Abort;
        };
        if let Some(err) = data.error {
            if !req.flags.contains(ReqFlags::QUIET) {
                error!(
                    "{}: error {} transferring data, sector {}, nr {}, cmd response {:#x}, card status {:#x}",
                    self.name,
                    err,
                    req.sector,
                    req.nr_sectors,
                    mrq.cmd.resp[0],
                    mrq.stop.as_ref().map_or(0, |s| s.resp[0])
                );
            }
            return match (data.dir, ecc_err || err == MmcError::CardEccFailed) {
                (DataDir::Read, true) => BlkStatus::EccErr,
                (DataDir::Read, false) => BlkStatus::DataErr,
                (DataDir::Write, _) => BlkStatus::CmdErr,
            };
        }

        if data.bytes_xfered == 0 {
            return BlkStatus::Retry;
        }
        if req.bytes() != data.bytes_xfered as u64 {
            return BlkStatus::Partial;
        }
        BlkStatus::Success
    }

    /// Number of blocks an SD card reports written by the last write.
    pub fn sd_num_wr_blocks(&self) -> MmcResult<u32> {
        self.host.app_cmd(&self.card)?;

        let region = self.mem.alloc(4, 4)?;
        let mut data = MmcData::new(4, 1, DataDir::Read, vec![SgEntry::new(region.addr, 4)]);
        set_data_timeout(&mut data, &self.card);
        let mrq = MmcRequest::new(MmcCommand::new(SD_APP_SEND_NUM_WR_BLKS, 0, RspFlags::R1)).with_data(data);
        let done = self.host.wait_for_req(mrq);

        let mut raw = [0u8; 4];
        self.mem.read(region.addr, &mut raw);
        self.mem.free(region);

        let done = done?;
        if let Some((_, err)) = done.first_error() {
            warn!("{}: ACMD22 failed: {}", self.name, err);
            return Err(err);
        }
        Ok(u32::from_be_bytes(raw))
    }

    /// Completes the part of a failed write the card is known to hold.
    /// Returns true while part of the request is still outstanding.
    pub fn cmd_err(&self, req: &mut BlkRequest, mrq: &MmcRequest) -> bool {
        if self.card.is_removed() {
            req.flags |= ReqFlags::QUIET;
        }
        let is_write = mrq.data.as_ref().is_some_and(|d| !d.is_read());
        if self.card.is_sd() && is_write {
            match self.sd_num_wr_blocks() {
                Ok(blocks) => {
                    let issued = mrq.data.as_ref().map_or(0, |d| d.blocks);
                    req.end(None, blocks.min(issued) << 9)
                }
                Err(_) => !req.is_finished(),
            }
        } else {
            req.end(None, mrq.bytes_xfered())
        }
    }
}
