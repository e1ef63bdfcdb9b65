use log::{debug, info};

use super::{SdhciHost, SdhciOps};
use crate::common::err::MmcResult;
use crate::constants::*;
use crate::host::{BusWidth, MmcIos, SignalVoltage};

impl<R: SdhciOps> SdhciHost<R> {
    /// Applies bus settings. The clock is only reprogrammed when it changes.
    pub fn set_ios(&self, ios: &MmcIos) -> MmcResult {
        let mut st = self.lock.lock();

        if ios.clock != st.ios.clock || st.clock == 0 {
            st.clock = self.regs.set_clock(ios.clock, self.max_clk)?;
        }

        self.regs.set_bus_width(ios.bus_width);
        self.regs.set_uhs_signaling(ios.timing);

        let ctrl2 = self.regs.read_reg16(SDHCI_HOST_CONTROL2);
        let ctrl2 = match ios.signal_voltage {
            SignalVoltage::V180 => ctrl2 | SDHCI_CTRL_VDD_180,
            SignalVoltage::V330 => ctrl2 & !SDHCI_CTRL_VDD_180,
        };
        self.regs.write_reg16(SDHCI_HOST_CONTROL2, ctrl2);

        if st.ios != *ios {
            info!(
                "{}: clock {} Hz (actual {}), {:?}, {:?}, {:?}",
                self.name, ios.clock, st.clock, ios.bus_width, ios.timing, ios.signal_voltage
            );
        }
        st.ios = *ios;
        Ok(())
    }

    pub fn execute_tuning(&self, opcode: u8) -> MmcResult {
        let width = self.lock.lock().ios.bus_width;
        let blksz = if opcode == MMC_SEND_TUNING_BLOCK_HS200 && width == BusWidth::Width8 {
            128
        } else {
            64
        };
        debug!("{}: tuning with CMD{} ({} byte block)", self.name, opcode, blksz);
        self.regs.execute_tuning(opcode, blksz)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::constants::*;
    use crate::host::{BusWidth, MmcIos, SignalVoltage, Timing};
    use crate::regs::RegisterIo;

    #[test]
    fn ios_programs_divider_width_and_voltage() {
        let (host, _mem) = host();
        let ios = MmcIos {
            clock: 50_000_000,
            bus_width: BusWidth::Width4,
            timing: Timing::SdHs,
            signal_voltage: SignalVoltage::V180,
        };
        host.set_ios(&ios).unwrap();
        assert_eq!(host.lock.lock().clock, 50_000_000);

        let clk = host.regs().read_reg16(SDHCI_CLOCK_CONTROL);
        // 200 MHz / 4: divider register holds 2
        assert_eq!((clk >> SDHCI_DIVIDER_SHIFT) & SDHCI_DIV_MASK, 2);
        assert_ne!(clk & SDHCI_CLOCK_CARD_EN, 0);
        assert_eq!(host.regs().read_reg8(SDHCI_HOST_CONTROL) & SDHCI_CTRL_4BITBUS, SDHCI_CTRL_4BITBUS);
        let ctrl2 = host.regs().read_reg16(SDHCI_HOST_CONTROL2);
        assert_eq!(ctrl2 & SDHCI_CTRL_UHS_MASK, SDHCI_CTRL_UHS_SDR25);
        assert_ne!(ctrl2 & SDHCI_CTRL_VDD_180, 0);

        // same clock again: the divider is left alone
        let before = host.regs().writes_to(SDHCI_CLOCK_CONTROL).len();
        host.set_ios(&ios).unwrap();
        assert_eq!(host.regs().writes_to(SDHCI_CLOCK_CONTROL).len(), before);
    }

    #[test]
    fn identification_clock_uses_large_divider() {
        let (host, _mem) = host();
        host.set_ios(&MmcIos::default()).unwrap();
        let actual = host.lock.lock().clock;
        assert!(actual <= 400_000 && actual > 300_000, "{}", actual);
    }

    #[test]
    fn tuning_succeeds_once_tuned_clock_is_selected() {
        let (host, _mem) = host();
        let ios = MmcIos {
            clock: 200_000_000,
            bus_width: BusWidth::Width8,
            timing: Timing::MmcHs200,
            signal_voltage: SignalVoltage::V180,
        };
        host.set_ios(&ios).unwrap();
        host.execute_tuning(MMC_SEND_TUNING_BLOCK_HS200).unwrap();

        let blk = host.regs().writes_to(SDHCI_BLOCK_SIZE);
        assert_eq!(blk.len(), 1);
        assert_eq!(blk[0] & 0xFFF, 128);
        assert_eq!(host.regs().commands(), vec![MMC_SEND_TUNING_BLOCK_HS200]);
        // interrupt signalling is restored afterwards
        assert_ne!(host.regs().read_reg32(SDHCI_SIGNAL_ENABLE), 0);
    }
}
