//! SEND_STATUS based waits.

use core::time::Duration;

use log::{error, trace, warn};

use super::MmcHost;
use crate::card::MmcCard;
use crate::common::commands::{CardState, MmcCommand, R1Status, RspFlags};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::host::MmcHostOps;
use crate::osa::{now, usleep_range};

impl<T: MmcHostOps> MmcHost<T> {
    pub fn get_card_status(&self, card: &MmcCard, retries: u32) -> MmcResult<R1Status> {
        let arg = if self.is_spi() { 0 } else { card.rca_arg() };
        let cmd = MmcCommand::new(MMC_SEND_STATUS, arg, RspFlags::R1).with_retries(retries);
        let cmd = self.wait_for_cmd(cmd)?;
        trace!("{}: card status {:#010x}", self.name, cmd.resp[0]);
        Ok(cmd.r1())
    }

    /// Polls until the card is ready for data and out of programming, or
    /// `timeout_ms` runs out.
    pub fn poll_for_busy(&self, card: &MmcCard, timeout_ms: u32) -> MmcResult<R1Status> {
        let deadline = now() + Duration::from_millis(timeout_ms as u64);
        loop {
            let status = self.get_card_status(card, 5)?;
            if status.is_ready() {
                return Ok(status);
            }
            if now() > deadline {
                error!(
                    "{}: card stuck in programming state, status {:#010x}",
                    self.name,
                    status.bits()
                );
                return Err(MmcError::CommandTimeout);
            }
        }
    }

    /// Waits out the busy period after a write. A general error seen in
    /// any status along the way is reported through `gen_err`.
    pub fn busy_detect(&self, card: &MmcCard, timeout_ms: u32, gen_err: &mut bool) -> MmcResult {
        let deadline = now() + Duration::from_millis(timeout_ms as u64);
        loop {
            let status = match self.get_card_status(card, 5) {
                Ok(status) => status,
                Err(e) => {
                    error!("{}: error {} requesting status", self.name, e);
                    return Err(e);
                }
            };
            if status.contains(R1Status::ERROR) {
                warn!(
                    "{}: general error in card status {:#010x}",
                    self.name,
                    status.bits()
                );
                *gen_err = true;
            }
            if status.is_ready() {
                return Ok(());
            }
            if now() > deadline {
                error!(
                    "{}: card stuck in programming state, status {:#010x}",
                    self.name,
                    status.bits()
                );
                return Err(MmcError::CommandTimeout);
            }
        }
    }

    /// Polls SEND_STATUS with a short random sleep between tries until the
    /// card reports no error bits and has left programming. Running out of
    /// tries is reported as [`MmcError::RetryExhausted`].
    pub fn status_poll(&self, card: &MmcCard, retries: u32) -> MmcResult<R1Status> {
        let mut last = R1Status::empty();
        for _ in 0..retries {
            last = self.get_card_status(card, 5)?;
            if !last.has_errors() && last.current_state() != CardState::Programming {
                return Ok(last);
            }
            usleep_range(1000, 5000);
        }
        warn!(
            "{}: card status {:#010x} after {} polls",
            self.name,
            last.bits(),
            retries
        );
        Err(MmcError::RetryExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::common::commands::R1Status;
    use crate::common::err::{MmcError, MmcResult};
    use crate::constants::*;
    use crate::host::sim::FaultKind;

    #[test]
    fn busy_detect_flags_general_error() -> MmcResult<()> {
        let card = emmc(emmc_ext());
        let (host, sim, _mem) = sim_host(card.clone());
        sim.set_busy_polls(2);
        sim.inject(MMC_SEND_STATUS, None, FaultKind::Status(R1Status::ERROR.bits()), 1);
        let mut gen_err = false;
        host.busy_detect(&card, 1000, &mut gen_err)?;
        assert!(gen_err);
        assert_eq!(sim.opcodes().len(), 3);
        Ok(())
    }

    #[test]
    fn status_poll_budget_is_its_own_error() {
        let card = emmc(emmc_ext());
        let (host, sim, _mem) = sim_host(card.clone());
        sim.set_busy_polls(10);
        assert_eq!(host.status_poll(&card, 3).unwrap_err(), MmcError::RetryExhausted);

        sim.set_busy_polls(1);
        let status = host.status_poll(&card, 3).unwrap();
        assert!(status.is_ready());
    }

    #[test]
    fn status_poll_keeps_going_through_error_bits() -> MmcResult<()> {
        let card = emmc(emmc_ext());
        let (host, sim, _mem) = sim_host(card.clone());
        sim.inject(MMC_SEND_STATUS, None, FaultKind::Status(R1Status::ADDRESS_ERROR.bits()), 2);
        host.status_poll(&card, 5)?;
        assert_eq!(sim.opcodes(), [MMC_SEND_STATUS; 3]);
        Ok(())
    }

    #[test]
    fn status_command_failure_propagates() {
        let card = emmc(emmc_ext());
        let (host, sim, _mem) = sim_host(card.clone());
        sim.inject(MMC_SEND_STATUS, None, FaultKind::Cmd(MmcError::CommandTimeout), 10);
        let mut gen_err = false;
        assert_eq!(
            host.busy_detect(&card, 1000, &mut gen_err).unwrap_err(),
            MmcError::CommandTimeout
        );
    }
}
