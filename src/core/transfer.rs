//! Protocol half of the transfer state machine: what happens around one
//! read/write exchange once the controller hands it back.

use log::{debug, warn};

use super::MmcHost;
use crate::card::MmcCard;
use crate::common::commands::{Leg, MmcData, MmcRequest, R1Status};
use crate::common::err::MmcError;
use crate::constants::*;
use crate::host::MmcHostOps;

/// Result of one exchange as the retry policy sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    pub success: bool,
    pub bytes_transferred: u32,
    pub error: Option<MmcError>,
    /// The leg `error` came from.
    pub leg: Option<Leg>,
    /// A multi-block read failed; the rest of the request should go one
    /// block at a time.
    pub retry_single: bool,
    /// The card flagged a general error while finishing a write.
    pub gen_err: bool,
    /// Waiting for the card to leave programming failed.
    pub busy_err: bool,
}

/// Data timeout from the card's access time, clamped to what a host can
/// reasonably wait for.
pub fn set_data_timeout(data: &mut MmcData, card: &MmcCard) {
    data.timeout_ns = card.tacc_ns() as u64 * 100;
    data.timeout_clks = card.tacc_clks().saturating_mul(100);
    if data.timeout_ns > MMC_DATA_TIMEOUT_LIMIT_NS {
        data.timeout_ns = MMC_DATA_TIMEOUT_LIMIT_NS;
        data.timeout_clks = 0;
    }
}

const ECC_BITS: R1Status = R1Status::CARD_ECC_FAILED.union(R1Status::COM_CRC_ERROR);

impl<T: MmcHostOps> MmcHost<T> {
    /// Issues `mrq` and blocks until it has been through every leg, then
    /// folds in the card-side results. The caller holds the host claim.
    pub fn execute(&self, mrq: MmcRequest) -> (MmcRequest, Outcome) {
        let mut fallback = mrq.clone();
        match self.wait_for_req(mrq) {
            Ok(done) => self.finish_transfer(done),
            Err(e) => {
                fallback.cmd.error = Some(e);
                let outcome = Outcome {
                    error: Some(e),
                    leg: Some(Leg::Cmd),
                    ..Default::default()
                };
                (fallback, outcome)
            }
        }
    }

    /// Post-processing for a read/write request the controller completed.
    pub fn finish_transfer(&self, mut mrq: MmcRequest) -> (MmcRequest, Outcome) {
        let card = self.card();
        let mut outcome = Outcome::default();

        // The card can report ECC trouble in the R1 of the command or stop
        // even when the controller saw clean data.
        if let Some(data) = mrq.data.as_mut() {
            for status in [Some(mrq.cmd.r1()), mrq.stop.as_ref().map(|s| s.r1())]
                .into_iter()
                .flatten()
            {
                if status.intersects(ECC_BITS) {
                    if let Some(prev) = data.error {
                        debug!("{}: ECC status replaces data error {}", self.name, prev);
                    }
                    data.error = Some(MmcError::CardEccFailed);
                }
            }
        }

        if let Some(card) = card.as_ref() {
            if card.is_mmc() && mrq.cmd.r1().contains(R1Status::URGENT_BKOPS) {
                debug!("{}: card asks for background operations", self.name);
                card.set_need_bkops(true);
            }
        }

        if let Some((leg, err)) = mrq.first_error() {
            outcome.leg = Some(leg);
            outcome.error = Some(err);
            if err != MmcError::MediumRemoved
                && mrq.data.as_ref().is_some_and(|d| d.is_read() && d.blocks > 1)
            {
                outcome.retry_single = true;
            }
        }

        let is_write = mrq.data.as_ref().is_some_and(|d| !d.is_read());
        let cmd_failed = mrq.sbc.as_ref().is_some_and(|c| c.error.is_some()) || mrq.cmd.error.is_some();
        if is_write && !cmd_failed && !self.is_spi() {
            if let Some(card) = card.as_ref() {
                if let Err(e) = self.busy_detect(card, MMC_BLK_TIMEOUT_MS, &mut outcome.gen_err) {
                    warn!("{}: write did not complete: {}", self.name, e);
                    outcome.busy_err = true;
                }
            }
        }

        outcome.bytes_transferred = mrq.bytes_xfered();
        outcome.success = outcome.error.is_none() && !outcome.busy_err && !outcome.gen_err;
        (mrq, outcome)
    }
}
