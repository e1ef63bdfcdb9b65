//! Read/write requests: building the MMC request for what is left of a
//! block request, and the retry policy applied to each result.

use log::{debug, error, warn};

use super::{BlkOp, BlkRequest, BlkStatus, MmcBlkDevice, ReqFlags, ResetType};
use crate::card::CardQuirks;
use crate::common::commands::{DataDir, MmcCommand, MmcData, MmcRequest, RspFlags, sg_truncate};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::core::transfer::set_data_timeout;
use crate::dma::bounce::BounceBuffer;
use crate::host::MmcHostOps;

/// Retry state of one block request, kept across reissues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RwProgress {
    /// Go one block at a time for the rest of the request.
    pub disable_multi: bool,
    pub retry: u32,
}

/// What to do with a block request after handling one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwNext {
    Done,
    Reissue,
}

impl<T: MmcHostOps> MmcBlkDevice<T> {
    /// Builds the next exchange for the front of `req`.
    pub fn rw_rq_prep(
        &self,
        req: &BlkRequest,
        disable_multi: bool,
        bounce: Option<&BounceBuffer>,
    ) -> MmcResult<MmcRequest> {
        let dir = match req.op {
            BlkOp::Read => DataDir::Read,
            BlkOp::Write => DataDir::Write,
            _ => return Err(MmcError::InvalidValue),
        };
        let limits = self.host.limits();
        let is_read = dir == DataDir::Read;
        let do_rel_wr = !is_read && req.flags.intersects(ReqFlags::FUA | ReqFlags::META) && self.rel_write();

        let mut blocks = req.nr_sectors.min(limits.max_blk_count);
        if let Some(bounce) = bounce {
            blocks = blocks.min(bounce.sectors());
        }
        if blocks > 1 && disable_multi {
            blocks = 1;
        }
        if blocks == 0 {
            return Err(MmcError::InvalidValue);
        }

        let arg = self.card.data_address(req.sector);
        let multi = blocks > 1 || do_rel_wr;
        let opcode = match (is_read, multi) {
            (true, true) => MMC_READ_MULTIPLE_BLOCK,
            (true, false) => MMC_READ_SINGLE_BLOCK,
            (false, true) => MMC_WRITE_MULTIPLE_BLOCK,
            (false, false) => MMC_WRITE_BLOCK,
        };

        if do_rel_wr && !self.card.rel_write_enhanced() {
            // legacy reliable writes go in whole rel_sectors chunks or singly
            let rel = self.card.rel_sectors().max(1);
            if req.sector % rel as u64 != 0 {
                blocks = 1;
            }
            if blocks > rel {
                blocks = rel;
            } else if blocks < rel {
                blocks = 1;
            }
        }

        let len = blocks * MMC_SECTOR_SIZE;
        let orig = sg_truncate(&req.sg, len as u64);
        let sg = match bounce {
            Some(bounce) => {
                bounce.pre(&*self.mem, &orig, len, dir);
                bounce.sg(len)?
            }
            None => orig,
        };

        let mut data = MmcData::new(MMC_SECTOR_SIZE, blocks, dir, sg);
        set_data_timeout(&mut data, &self.card);
        let mut mrq = MmcRequest::new(MmcCommand::new(opcode, arg, RspFlags::R1)).with_data(data);

        // SPI multi-block writes end with a token, not CMD12
        if multi && (!self.host.is_spi() || is_read) {
            let flags = if is_read { RspFlags::R1 } else { RspFlags::R1B };
            mrq = mrq.with_stop(MmcCommand::new(MMC_STOP_TRANSMISSION, 0, flags));
        }

        if self.use_cmd23() && multi && (do_rel_wr || !self.card.quirks().contains(CardQuirks::BLK_NO_CMD23)) {
            let mut sbc_arg = blocks;
            if do_rel_wr {
                sbc_arg |= MMC_SBC_RELIABLE_WRITE;
            }
            mrq = mrq.with_sbc(MmcCommand::new(MMC_SET_BLOCK_COUNT, sbc_arg, RspFlags::R1));
        }
        Ok(mrq)
    }

    /// Copies bounced read data back into the request's own buffers.
    pub fn rw_rq_post(&self, req: &BlkRequest, mrq: &MmcRequest, bounce: Option<&BounceBuffer>) {
        let (Some(bounce), Some(data)) = (bounce, mrq.data.as_ref()) else {
            return;
        };
        let orig = sg_truncate(&req.sg, data.len() as u64);
        bounce.post(&*self.mem, &orig, data.bytes_xfered, data.dir);
    }

    /// Card-side checks and the verdict on an exchange the controller
    /// handed back.
    pub fn check_rw(
        &self,
        req: &mut BlkRequest,
        mrq: MmcRequest,
        bounce: Option<&BounceBuffer>,
    ) -> (MmcRequest, BlkStatus) {
        let (mut mrq, outcome) = self.host.finish_transfer(mrq);
        self.rw_rq_post(req, &mrq, bounce);
        let mut status = self.err_check(req, &mut mrq, &outcome);
        if outcome.retry_single && !matches!(status, BlkStatus::Success | BlkStatus::Partial | BlkStatus::NoMedium) {
            // reported separately so the dispatcher drops to single blocks
            // before spending a reset
            status = BlkStatus::EccErr;
        }
        (mrq, status)
    }

    /// Fails everything left of `req`, one sector at a time.
    fn abort_rw(&self, req: &mut BlkRequest, err: MmcError) {
        if self.card.is_removed() {
            req.flags |= ReqFlags::QUIET;
        }
        if !req.flags.contains(ReqFlags::QUIET) {
            error!(
                "{}: failing {} sectors from {}: {}",
                self.name, req.nr_sectors, req.sector, err
            );
        }
        while req.end(Some(err), MMC_SECTOR_SIZE) {}
    }

    /// Applies the retry policy to one verdict.
    pub fn handle_rw(
        &self,
        req: &mut BlkRequest,
        progress: &mut RwProgress,
        mrq: &MmcRequest,
        status: BlkStatus,
    ) -> RwNext {
        let ty = ResetType::of(req.op);
        let err = match status {
            BlkStatus::NoMedium => MmcError::MediumRemoved,
            _ => mrq.first_error().map_or(MmcError::Io, |(_, e)| e),
        };
        let blocks = mrq.data.as_ref().map_or(0, |d| d.blocks);

        let more = match status {
            BlkStatus::Success | BlkStatus::Partial => {
                self.reset_success(ty);
                let more = req.end(None, mrq.bytes_xfered());
                if status == BlkStatus::Success && more {
                    error!(
                        "{}: transfer of {} bytes reported complete with {} bytes left",
                        self.name,
                        mrq.bytes_xfered(),
                        req.bytes()
                    );
                    self.abort_rw(req, MmcError::Io);
                    return RwNext::Done;
                }
                more
            }
            BlkStatus::CmdErr => {
                let more = self.cmd_err(req, mrq);
                if self.reset(ty).is_err() {
                    self.abort_rw(req, err);
                    return RwNext::Done;
                }
                more
            }
            BlkStatus::Retry | BlkStatus::Abort => {
                if status == BlkStatus::Retry && progress.retry < self.config.rw_retries {
                    progress.retry += 1;
                    debug!("{}: retry {} of sector {}", self.name, progress.retry, req.sector);
                    true
                } else if self.reset(ty).is_ok() {
                    true
                } else {
                    self.abort_rw(req, err);
                    return RwNext::Done;
                }
            }
            BlkStatus::DataErr | BlkStatus::EccErr => {
                if status == BlkStatus::DataErr {
                    match self.reset(ty) {
                        Ok(()) => return RwNext::Reissue,
                        Err(MmcError::MediumRemoved) => {
                            self.abort_rw(req, err);
                            return RwNext::Done;
                        }
                        Err(_) => {}
                    }
                }
                if blocks > 1 {
                    warn!("{}: retrying using single block read", self.name);
                    progress.disable_multi = true;
                    true
                } else {
                    // already single: this sector is lost
                    req.end(Some(err), MMC_SECTOR_SIZE)
                }
            }
            BlkStatus::NoMedium => {
                self.abort_rw(req, err);
                return RwNext::Done;
            }
        };
        if more { RwNext::Reissue } else { RwNext::Done }
    }

    pub fn complete_rw(
        &self,
        req: &mut BlkRequest,
        progress: &mut RwProgress,
        mrq: MmcRequest,
        bounce: Option<&BounceBuffer>,
    ) -> RwNext {
        let (mrq, status) = self.check_rw(req, mrq, bounce);
        self.handle_rw(req, progress, &mrq, status)
    }

    /// Runs a read/write request to the end, blocking. The caller holds
    /// the host claim.
    pub fn issue_rw(&self, req: &mut BlkRequest, bounce: Option<&BounceBuffer>) {
        let mut progress = RwProgress::default();
        self.issue_rw_from(req, &mut progress, bounce);
    }

    /// Continues a request that has already been through the dispatcher.
    pub fn issue_rw_from(&self, req: &mut BlkRequest, progress: &mut RwProgress, bounce: Option<&BounceBuffer>) {
        while !req.is_finished() {
            if self.card.is_removed() {
                self.abort_rw(req, MmcError::MediumRemoved);
                return;
            }
            let mrq = match self.rw_rq_prep(req, progress.disable_multi, bounce) {
                Ok(mrq) => mrq,
                Err(e) => {
                    self.abort_rw(req, e);
                    return;
                }
            };
            let mrq = match self.host.wait_for_req(mrq) {
                Ok(mrq) => mrq,
                Err(e) => {
                    self.abort_rw(req, e);
                    return;
                }
            };
            if self.complete_rw(req, progress, mrq, bounce) == RwNext::Done {
                return;
            }
        }
    }
}
