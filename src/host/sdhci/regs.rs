use bitflags::bitflags;
use log::{debug, error, warn};

use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::host::{BusWidth, Timing};
use crate::osa::msleep;
use crate::regs::RegisterIo;

bitflags! {
    /// Normal and error interrupt status, as one 32-bit word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntStatus: u32 {
        const RESPONSE = 1 << 0;
        const DATA_END = 1 << 1;
        const DMA_END = 1 << 3;
        const SPACE_AVAIL = 1 << 4;
        const DATA_AVAIL = 1 << 5;
        const CARD_INSERT = 1 << 6;
        const CARD_REMOVE = 1 << 7;
        const ERROR = 1 << 15;
        const TIMEOUT = 1 << 16;
        const CRC = 1 << 17;
        const END_BIT = 1 << 18;
        const INDEX = 1 << 19;
        const DATA_TIMEOUT = 1 << 20;
        const DATA_CRC = 1 << 21;
        const DATA_END_BIT = 1 << 22;
        const ACMD12ERR = 1 << 24;
        const ADMA_ERROR = 1 << 25;
    }
}

impl IntStatus {
    pub const CMD_MASK: IntStatus = IntStatus::RESPONSE
        .union(IntStatus::TIMEOUT)
        .union(IntStatus::CRC)
        .union(IntStatus::END_BIT)
        .union(IntStatus::INDEX)
        .union(IntStatus::ACMD12ERR);

    pub const DATA_MASK: IntStatus = IntStatus::DATA_END
        .union(IntStatus::DMA_END)
        .union(IntStatus::DATA_AVAIL)
        .union(IntStatus::SPACE_AVAIL)
        .union(IntStatus::DATA_TIMEOUT)
        .union(IntStatus::DATA_CRC)
        .union(IntStatus::DATA_END_BIT)
        .union(IntStatus::ADMA_ERROR);

    pub const CARD_MASK: IntStatus = IntStatus::CARD_INSERT.union(IntStatus::CARD_REMOVE);
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdhciReset: u8 {
        const ALL = 0x01;
        const CMD = 0x02;
        const DATA = 0x04;
    }
}

/// Register-level controller operations. Every method has the standard
/// SDHCI behaviour; vendor register windows override what differs.
pub trait SdhciOps: RegisterIo {
    fn reset(&self, mask: SdhciReset) -> MmcResult {
        self.write_reg8(SDHCI_SOFTWARE_RESET, mask.bits());

        let mut timeout = SDHCI_RESET_TIMEOUT_MS;
        while self.read_reg8(SDHCI_SOFTWARE_RESET) & mask.bits() != 0 {
            if timeout == 0 {
                error!("SDHCI reset {:?} never completed", mask);
                return Err(MmcError::ResetTimeout);
            }
            timeout -= 1;
            msleep(1);
        }
        Ok(())
    }

    /// Programs the SD clock divider. Returns the resulting card clock.
    fn set_clock(&self, clock: u32, max_clk: u32) -> MmcResult<u32> {
        self.write_reg16(SDHCI_CLOCK_CONTROL, 0);
        if clock == 0 {
            return Ok(0);
        }

        let mut div: u32 = 0;
        if max_clk > clock {
            div = 2;
            while div < SDHCI_MAX_DIV_SPEC_300 && max_clk / div > clock {
                div += 2;
            }
        }
        let actual = if div == 0 { max_clk } else { max_clk / div };
        div >>= 1;

        let mut clk = ((div as u16) & SDHCI_DIV_MASK) << SDHCI_DIVIDER_SHIFT;
        clk |= (((div as u16) & SDHCI_DIV_HI_MASK) >> SDHCI_DIVIDER_SHIFT) << SDHCI_DIVIDER_HI_SHIFT;
        clk |= SDHCI_CLOCK_INT_EN;
        self.write_reg16(SDHCI_CLOCK_CONTROL, clk);

        let mut timeout = SDHCI_CLOCK_STABLE_TIMEOUT_MS;
        while self.read_reg16(SDHCI_CLOCK_CONTROL) & SDHCI_CLOCK_INT_STABLE == 0 {
            if timeout == 0 {
                error!("SDHCI internal clock never stabilised");
                return Err(MmcError::Io);
            }
            timeout -= 1;
            msleep(1);
        }

        clk |= SDHCI_CLOCK_CARD_EN;
        self.write_reg16(SDHCI_CLOCK_CONTROL, clk);
        debug!("SD clock {} Hz (requested {}, divider {})", actual, clock, div);
        Ok(actual)
    }

    fn set_bus_width(&self, width: BusWidth) {
        let mut ctrl = self.read_reg8(SDHCI_HOST_CONTROL);
        ctrl &= !(SDHCI_CTRL_4BITBUS | SDHCI_CTRL_8BITBUS);
        match width {
            BusWidth::Width8 => ctrl |= SDHCI_CTRL_8BITBUS,
            BusWidth::Width4 => ctrl |= SDHCI_CTRL_4BITBUS,
            BusWidth::Width1 => {}
        }
        self.write_reg8(SDHCI_HOST_CONTROL, ctrl);
    }

    fn set_uhs_signaling(&self, timing: Timing) {
        let mut ctrl2 = self.read_reg16(SDHCI_HOST_CONTROL2) & !SDHCI_CTRL_UHS_MASK;
        ctrl2 |= match timing {
            Timing::MmcHs200 | Timing::UhsSdr104 => SDHCI_CTRL_UHS_SDR104,
            Timing::UhsSdr12 => SDHCI_CTRL_UHS_SDR12,
            Timing::UhsSdr25 | Timing::SdHs | Timing::MmcHs => SDHCI_CTRL_UHS_SDR25,
            Timing::UhsSdr50 => SDHCI_CTRL_UHS_SDR50,
            Timing::UhsDdr50 | Timing::MmcDdr52 => SDHCI_CTRL_UHS_DDR50,
            Timing::MmcHs400 => SDHCI_CTRL_HS400,
            Timing::Legacy => SDHCI_CTRL_UHS_SDR12,
        };
        self.write_reg16(SDHCI_HOST_CONTROL2, ctrl2);
    }

    fn get_ro(&self, inverted: bool) -> bool {
        let wp = self.read_reg32(SDHCI_PRESENT_STATE) & SDHCI_WRITE_PROTECT != 0;
        // the bit reads 1 when writes are allowed
        if inverted { wp } else { !wp }
    }

    fn card_present(&self) -> bool {
        self.read_reg32(SDHCI_PRESENT_STATE) & SDHCI_CARD_PRESENT != 0
    }

    /// Polled sampling-clock tuning: issue the tuning command until the
    /// controller drops EXEC_TUNING, then check it selected a tuned clock.
    fn execute_tuning(&self, opcode: u8, blksz: u16) -> MmcResult {
        let saved_signal = self.read_reg32(SDHCI_SIGNAL_ENABLE);
        self.write_reg32(SDHCI_SIGNAL_ENABLE, 0);

        let mut ctrl2 = self.read_reg16(SDHCI_HOST_CONTROL2);
        ctrl2 |= SDHCI_CTRL_EXEC_TUNING;
        self.write_reg16(SDHCI_HOST_CONTROL2, ctrl2);

        let command = ((opcode as u16) << 8) | SDHCI_CMD_RESP_SHORT | SDHCI_CMD_CRC | SDHCI_CMD_INDEX | SDHCI_CMD_DATA;
        let mut loops = 0;
        while loops < SDHCI_MAX_TUNING_LOOP {
            self.write_reg16(SDHCI_BLOCK_SIZE, (7 << 12) | blksz);
            self.write_reg16(SDHCI_TRANSFER_MODE, SDHCI_TRNS_READ);
            self.write_reg32(SDHCI_ARGUMENT, 0);
            self.write_reg16(SDHCI_COMMAND, command);

            let mut wait = 50;
            while self.read_reg32(SDHCI_INT_STATUS) & IntStatus::DATA_AVAIL.bits() == 0 {
                if wait == 0 {
                    break;
                }
                wait -= 1;
                msleep(1);
            }
            self.write_reg32(SDHCI_INT_STATUS, IntStatus::DATA_AVAIL.bits() | IntStatus::RESPONSE.bits());

            ctrl2 = self.read_reg16(SDHCI_HOST_CONTROL2);
            if ctrl2 & SDHCI_CTRL_EXEC_TUNING == 0 {
                break;
            }
            loops += 1;
        }
        self.write_reg32(SDHCI_SIGNAL_ENABLE, saved_signal);

        if ctrl2 & SDHCI_CTRL_EXEC_TUNING == 0 && ctrl2 & SDHCI_CTRL_TUNED_CLK != 0 {
            debug!("tuning with CMD{} done after {} loops", opcode, loops + 1);
            return Ok(());
        }
        warn!("tuning with CMD{} failed, falling back to fixed sampling clock", opcode);
        ctrl2 &= !(SDHCI_CTRL_EXEC_TUNING | SDHCI_CTRL_TUNED_CLK);
        self.write_reg16(SDHCI_HOST_CONTROL2, ctrl2);
        Err(MmcError::Io)
    }
}

impl SdhciOps for crate::regs::MmioRegs {}
