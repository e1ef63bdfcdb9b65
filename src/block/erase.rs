use log::{debug, warn};

use super::{BlkRequest, MmcBlkDevice, ResetType};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::host::MmcHostOps;

/// First sector of an erase range. Erase commands carry 32-bit sector
/// addresses, so the whole range must sit below 2^32.
fn erase_start(req: &BlkRequest) -> MmcResult<u32> {
    let end = req.sector.checked_add(req.nr_sectors as u64).ok_or(MmcError::Overflow)?;
    if end > u32::MAX as u64 + 1 {
        return Err(MmcError::Overflow);
    }
    u32::try_from(req.sector).map_err(|_| MmcError::Overflow)
}

impl<T: MmcHostOps> MmcBlkDevice<T> {
    /// Discards the request's range with the gentlest erase the card has.
    pub fn issue_discard(&self, req: &mut BlkRequest) {
        let result = erase_start(req).and_then(|from| self.discard(from, req.nr_sectors));
        if let Err(e) = result {
            warn!("{}: discard of {} sectors from {} failed: {}", self.name, req.nr_sectors, req.sector, e);
        }
        req.end_all(result.err());
    }

    fn discard(&self, from: u32, nr: u32) -> MmcResult {
        if !self.card.can_erase() {
            return Err(MmcError::Unsupported);
        }
        let arg = if self.card.can_discard() {
            MMC_DISCARD_ARG
        } else if self.card.can_trim() {
            MMC_TRIM_ARG
        } else {
            MMC_ERASE_ARG
        };
        loop {
            match self.host.erase(&self.card, from, nr, arg) {
                Err(MmcError::Io) if self.reset(ResetType::Discard).is_ok() => continue,
                Err(e) => return Err(e),
                Ok(()) => {
                    self.reset_success(ResetType::Discard);
                    return Ok(());
                }
            }
        }
    }

    /// Erases the request's range so the old data cannot be recovered.
    ///
    /// Cards with sanitize get a plain erase or trim followed by a
    /// sanitize pass. Other cards get a secure erase, or the two phase
    /// secure trim when the range is not erase-group aligned; the second
    /// phase is only sent once the first has succeeded.
    pub fn issue_secdiscard(&self, req: &mut BlkRequest) {
        let result = erase_start(req).and_then(|from| self.secure_discard(from, req.nr_sectors));
        if let Err(e) = result {
            warn!(
                "{}: secure discard of {} sectors from {} failed: {}",
                self.name, req.nr_sectors, req.sector, e
            );
        }
        req.end_all(result.err());
    }

    fn secure_discard(&self, from: u32, nr: u32) -> MmcResult {
        let card = &self.card;
        let sanitize = card.can_sanitize();
        if !(card.can_secure_erase_trim() || sanitize) {
            return Err(MmcError::Unsupported);
        }
        let (erase_arg, trim_arg) = if sanitize {
            (MMC_ERASE_ARG, MMC_TRIM_ARG)
        } else {
            (MMC_SECURE_ERASE_ARG, MMC_SECURE_TRIM1_ARG)
        };
        let arg = if card.erase_group_aligned(from as u64, nr as u64) {
            erase_arg
        } else if card.can_trim() {
            trim_arg
        } else {
            return Err(MmcError::InvalidValue);
        };

        loop {
            let err = match self.secure_discard_once(from, nr, arg, sanitize) {
                Ok(()) => {
                    self.reset_success(ResetType::SecDiscard);
                    return Ok(());
                }
                Err(e) => e,
            };
            if err != MmcError::Io || self.reset(ResetType::SecDiscard).is_err() {
                return Err(err);
            }
            debug!("{}: retrying secure discard after reset", self.name);
        }
    }

    fn secure_discard_once(&self, from: u32, nr: u32, arg: u32, sanitize: bool) -> MmcResult {
        self.host.erase(&self.card, from, nr, arg)?;
        if arg == MMC_SECURE_TRIM1_ARG {
            self.host.erase(&self.card, from, nr, MMC_SECURE_TRIM2_ARG)?;
        }
        if sanitize {
            self.host
                .switch(EXT_CSD_SANITIZE_START, 1, MMC_SANITIZE_REQ_TIMEOUT_MS)
                .map_err(|_| MmcError::Io)?;
        }
        Ok(())
    }

    /// Writes the card's volatile cache back to flash.
    pub fn issue_flush(&self, req: &mut BlkRequest) {
        let mut result = Ok(());
        if self.card.has_cache() {
            result = self.host.switch(EXT_CSD_FLUSH_CACHE, 1, 0).map_err(|e| {
                warn!("{}: cache flush failed: {}", self.name, e);
                MmcError::Io
            });
        }
        req.end_all(result.err());
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use super::super::BlkOp;
    use super::super::testing::*;
    use super::*;
    use crate::card::{CardExt, CardType, CmdClass, MmcCard, MmcExtCsd};
    use crate::common::commands::MmcCommand;
    use crate::core::testing::{emmc, emmc_ext};
    use crate::host::MmcHostCaps;
    use crate::host::sim::FaultKind;

    fn switch_arg(index: u32) -> u32 {
        MmcCommand::switch(index, 1, 0).arg
    }

    #[test]
    fn discard_prefers_trim_over_erase() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        let (mut req, log) = logged(BlkOp::Discard, 3, 10, vec![]);
        dev.issue_discard(&mut req);

        let erases = sim.erases();
        assert_eq!(erases.len(), 1);
        assert_eq!((erases[0].start, erases[0].end, erases[0].arg), (3, 12, MMC_TRIM_ARG));
        let log = log.lock().unwrap();
        assert_eq!((log[0].error, log[0].bytes, log[0].finished), (None, 5120, true));
    }

    #[test]
    fn discard_uses_discard_when_available() {
        let ext = MmcExtCsd {
            feature_support_discard: true,
            ..emmc_ext()
        };
        let (dev, sim, _mem) = device(emmc(ext));
        let (mut req, _log) = logged(BlkOp::Discard, 0, 8, vec![]);
        dev.issue_discard(&mut req);
        assert_eq!(sim.erases()[0].arg, MMC_DISCARD_ARG);
    }

    #[test]
    fn discard_without_erase_support_is_refused() {
        let card = Arc::new(MmcCard::new(CardType::Mmc, 1).with_ext(CardExt::Mmc(emmc_ext())));
        let (dev, sim, _mem) = device(card);
        let (mut req, log) = logged(BlkOp::Discard, 0, 8, vec![]);
        dev.issue_discard(&mut req);
        assert!(sim.opcodes().is_empty());
        assert_eq!(log.lock().unwrap()[0].error, Some(MmcError::Unsupported));
    }

    #[test]
    fn ranges_past_32_bit_sectors_are_refused() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        let (mut req, log) = logged(BlkOp::Discard, 1 << 32, 8, vec![]);
        dev.issue_discard(&mut req);
        let (mut req, _) = logged(BlkOp::SecDiscard, u32::MAX as u64 - 3, 8, vec![]);
        dev.issue_secdiscard(&mut req);
        assert!(sim.opcodes().is_empty());
        assert_eq!(log.lock().unwrap()[0].error, Some(MmcError::Overflow));
    }

    #[test]
    fn failed_discard_is_retried_after_one_reset() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        sim.inject(MMC_ERASE, None, FaultKind::Cmd(MmcError::CommandTimeout), 1);
        let (mut req, log) = logged(BlkOp::Discard, 0, 8, vec![]);
        dev.issue_discard(&mut req);
        assert_eq!(sim.resets(), 1);
        assert_eq!(sim.erases().len(), 1);
        assert_eq!(log.lock().unwrap()[0].error, None);

        // a second failure in a row gets no second reset
        sim.inject(MMC_ERASE, None, FaultKind::Cmd(MmcError::CommandTimeout), 2);
        let (mut req, log) = logged(BlkOp::Discard, 0, 8, vec![]);
        dev.issue_discard(&mut req);
        assert_eq!(sim.resets(), 2);
        assert_eq!(log.lock().unwrap()[0].error, Some(MmcError::Io));
    }

    #[test]
    fn aligned_secure_discard_is_one_secure_erase() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        let (mut req, log) = logged(BlkOp::SecDiscard, 128, 64, vec![]);
        dev.issue_secdiscard(&mut req);
        let erases = sim.erases();
        assert_eq!(erases.len(), 1);
        assert_eq!(erases[0].arg, MMC_SECURE_ERASE_ARG);
        assert!(sim.switches().is_empty());
        assert_eq!(log.lock().unwrap()[0].error, None);
    }

    #[test]
    fn secure_trim_runs_both_phases_in_order() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        let (mut req, _log) = logged(BlkOp::SecDiscard, 5, 3, vec![]);
        dev.issue_secdiscard(&mut req);
        let args: vec::Vec<u32> = sim.erases().iter().map(|e| e.arg).collect();
        assert_eq!(args, [MMC_SECURE_TRIM1_ARG, MMC_SECURE_TRIM2_ARG]);
    }

    #[test]
    fn failed_first_phase_never_sends_the_second() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        sim.set_caps(MmcHostCaps::CMD23 | MmcHostCaps::ERASE);
        sim.inject(
            MMC_ERASE,
            Some(MMC_SECURE_TRIM1_ARG),
            FaultKind::Cmd(MmcError::CommandTimeout),
            1,
        );
        let (mut req, log) = logged(BlkOp::SecDiscard, 5, 3, vec![]);
        dev.issue_secdiscard(&mut req);
        assert!(sim.log().iter().all(|c| c.arg != MMC_SECURE_TRIM2_ARG));
        assert_eq!(log.lock().unwrap()[0].error, Some(MmcError::Io));
    }

    #[test]
    fn first_phase_failure_retries_from_the_top() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        sim.inject(
            MMC_ERASE,
            Some(MMC_SECURE_TRIM1_ARG),
            FaultKind::Cmd(MmcError::CommandTimeout),
            1,
        );
        let (mut req, log) = logged(BlkOp::SecDiscard, 5, 3, vec![]);
        dev.issue_secdiscard(&mut req);
        let args: vec::Vec<u32> = sim.erases().iter().map(|e| e.arg).collect();
        assert_eq!(args, [MMC_SECURE_TRIM1_ARG, MMC_SECURE_TRIM2_ARG]);
        assert_eq!(sim.resets(), 1);
        assert_eq!(log.lock().unwrap()[0].error, None);
    }

    #[test]
    fn sanitize_cards_erase_then_sanitize() {
        let ext = MmcExtCsd {
            sec_feature_support: EXT_CSD_SEC_GB_CL_EN | EXT_CSD_SEC_SANITIZE,
            ..MmcExtCsd::default()
        };
        let (dev, sim, _mem) = device(emmc(ext));
        let (mut req, _log) = logged(BlkOp::SecDiscard, 1, 2, vec![]);
        dev.issue_secdiscard(&mut req);
        assert_eq!(sim.erases()[0].arg, MMC_TRIM_ARG);
        assert_eq!(sim.switches(), [switch_arg(EXT_CSD_SANITIZE_START)]);
    }

    #[test]
    fn unaligned_secure_discard_without_trim_is_invalid() {
        let ext = MmcExtCsd {
            sec_feature_support: EXT_CSD_SEC_ER_EN,
            ..MmcExtCsd::default()
        };
        let (dev, sim, _mem) = device(emmc(ext));
        let (mut req, log) = logged(BlkOp::SecDiscard, 1, 2, vec![]);
        dev.issue_secdiscard(&mut req);
        assert!(sim.erases().is_empty());
        assert_eq!(log.lock().unwrap()[0].error, Some(MmcError::InvalidValue));
    }

    #[test]
    fn flush_only_talks_to_cards_with_a_cache() {
        let (dev, sim, _mem) = device(emmc(emmc_ext()));
        let mut req = BlkRequest::flush();
        dev.issue_flush(&mut req);
        assert!(req.is_finished());
        assert!(sim.opcodes().is_empty());

        let ext = MmcExtCsd {
            cache_size: 1024,
            cache_ctrl: true,
            ..emmc_ext()
        };
        let card = Arc::new(
            MmcCard::new(CardType::Mmc, 1)
                .with_cmd_classes(CmdClass::BASIC)
                .with_ext(CardExt::Mmc(ext)),
        );
        let (dev, sim, _mem) = device(card);
        let (mut req, log) = logged(BlkOp::Flush, 0, 0, vec![]);
        dev.issue_flush(&mut req);
        assert_eq!(sim.switches(), [switch_arg(EXT_CSD_FLUSH_CACHE)]);
        assert_eq!(log.lock().unwrap()[0].error, None);
    }
}
