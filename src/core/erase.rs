use log::{debug, error};

use super::MmcHost;
use crate::card::MmcCard;
use crate::common::commands::{MmcCommand, RspFlags};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::host::{MmcHostCaps, MmcHostOps};

impl<T: MmcHostOps> MmcHost<T> {
    /// Busy timeout for erasing `nr` sectors, 0 when the host has no
    /// upper bound on erase busy time.
    fn erase_timeout(&self, card: &MmcCard, nr: u32) -> u32 {
        if self.caps().contains(MmcHostCaps::INFINITE_ERASE_TIMEOUT) {
            return 0;
        }
        let groups = nr.div_ceil(card.erase_size().max(1));
        groups.saturating_mul(MMC_ERASE_GROUP_TIMEOUT_MS).max(MMC_ERASE_GROUP_TIMEOUT_MS)
    }

    /// Erases `nr` sectors from `from` with erase argument `arg`.
    ///
    /// A plain erase is shrunk to whole erase groups; a range with no whole
    /// group in it is a no-op. Any command failure is reported as
    /// [`MmcError::Io`].
    pub fn erase(&self, card: &MmcCard, from: u32, nr: u32, arg: u32) -> MmcResult {
        if !card.can_erase() {
            return Err(MmcError::Unsupported);
        }
        if arg & MMC_SECURE_ARGS != 0 && !card.can_secure_erase_trim() {
            return Err(MmcError::Unsupported);
        }
        if arg & MMC_TRIM_ARGS != 0 && !card.can_trim() {
            return Err(MmcError::Unsupported);
        }
        if arg == MMC_DISCARD_ARG && !card.can_discard() {
            return Err(MmcError::Unsupported);
        }

        let (mut from, mut nr) = (from, nr);
        if arg == MMC_ERASE_ARG {
            let size = card.erase_size();
            let rem = from % size;
            if rem != 0 {
                let skip = size - rem;
                from += skip;
                if nr > skip {
                    nr -= skip;
                } else {
                    return Ok(());
                }
            }
            nr -= nr % size;
            if nr == 0 {
                return Ok(());
            }
        }
        if nr == 0 {
            return Err(MmcError::InvalidValue);
        }

        let timeout = self.erase_timeout(card, nr);
        let mut start = from;
        let mut end = from + nr - 1;
        if !card.is_blockaddr() {
            start <<= 9;
            end <<= 9;
        }
        let (start_op, end_op) = if card.is_sd() {
            (SD_ERASE_WR_BLK_START, SD_ERASE_WR_BLK_END)
        } else {
            (MMC_ERASE_GROUP_START, MMC_ERASE_GROUP_END)
        };
        debug!(
            "{}: erase {:#x}..={:#x} arg {:#010x} timeout {} ms",
            self.name, start, end, arg, timeout
        );

        for (opcode, addr) in [(start_op, start), (end_op, end)] {
            if let Err(e) = self.wait_for_cmd(MmcCommand::new(opcode, addr, RspFlags::R1)) {
                error!("{}: CMD{} for erase failed: {}", self.name, opcode, e);
                return Err(MmcError::Io);
            }
        }

        let cmd = MmcCommand::new(MMC_ERASE, arg, RspFlags::R1B).with_busy_timeout(timeout);
        if let Err(e) = self.wait_for_cmd(cmd) {
            error!("{}: erase failed: {}, arg {:#010x}", self.name, e, arg);
            return Err(MmcError::Io);
        }

        if self.is_spi() {
            return Ok(());
        }
        let poll_ms = if timeout == 0 { MMC_BLK_TIMEOUT_MS } else { timeout };
        self.poll_for_busy(card, poll_ms).map_err(|e| {
            error!("{}: waiting for erase to finish: {}", self.name, e);
            MmcError::Io
        })?;
        Ok(())
    }
}
