use crate::constants::*;
use crate::dma::{AdmaAddressing, AdmaQuirks};
use crate::host::MmcHostCaps;

/// Controller family a host is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SdhciVariant {
    #[default]
    Generic,
    Tegra,
}

/// Capability descriptor for one controller variant. Chosen once at bind
/// time; the transfer machine reads these instead of testing raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SdhciQuirks {
    /// The data timeout counter is unreliable; always program the maximum.
    pub broken_timeout_val: bool,
    /// The data timeout counter ticks on SDCLK rather than TMCLK.
    pub data_timeout_uses_sdclk: bool,
    pub broken_adma_zerolen_desc: bool,
    pub no_endattr_in_nopdesc: bool,
    pub support_64bit_dma: bool,
    /// Version 4 addressing: 16-byte descriptors and 64-bit ADMA pointers.
    pub use_64bit_addr: bool,
    pub auto_cmd12: bool,
    pub auto_cmd23: bool,
    /// Busy end is not signalled through DATA_END.
    pub no_busy_irq: bool,
    pub clock_before_reset: bool,
    pub reset_after_request: bool,
    pub inverted_write_protect: bool,
    /// Stop commands complete on transfer complete rather than response.
    pub stop_with_tc: bool,
    pub infinite_erase_timeout: bool,
    pub adma3: bool,
}

impl SdhciQuirks {
    pub fn for_variant(variant: SdhciVariant) -> Self {
        match variant {
            SdhciVariant::Generic => Self {
                auto_cmd12: true,
                auto_cmd23: true,
                support_64bit_dma: true,
                ..Default::default()
            },
            SdhciVariant::Tegra => Self {
                broken_timeout_val: true,
                data_timeout_uses_sdclk: true,
                broken_adma_zerolen_desc: true,
                no_endattr_in_nopdesc: true,
                support_64bit_dma: true,
                use_64bit_addr: true,
                auto_cmd12: true,
                // CMD23 goes out as a separate command on this controller
                auto_cmd23: false,
                no_busy_irq: false,
                clock_before_reset: true,
                reset_after_request: false,
                inverted_write_protect: false,
                stop_with_tc: true,
                infinite_erase_timeout: true,
                adma3: true,
            },
        }
    }

    pub fn adma(&self) -> AdmaQuirks {
        AdmaQuirks {
            no_endattr_in_nopdesc: self.no_endattr_in_nopdesc,
            broken_zerolen_desc: self.broken_adma_zerolen_desc,
        }
    }

    /// Version 4 addressing is only honoured on a version 4 controller.
    pub fn addressing(&self, caps: u32, version: u16) -> AdmaAddressing {
        let v4 = self.use_64bit_addr && version >= SDHCI_SPEC_400;
        AdmaAddressing::select(caps, self.support_64bit_dma, v4)
    }

    /// Host capabilities the quirks add on top of the platform ones.
    pub fn host_caps(&self) -> MmcHostCaps {
        let mut caps = MmcHostCaps::CMD23;
        if self.adma3 {
            caps |= MmcHostCaps::ADMA3;
        }
        if self.infinite_erase_timeout {
            caps |= MmcHostCaps::INFINITE_ERASE_TIMEOUT;
        }
        caps
    }
}

/// Bind-time configuration of an SDHCI host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdhciConfig {
    pub variant: SdhciVariant,
    /// Overrides the variant's quirk set.
    pub quirks: Option<SdhciQuirks>,
    /// Platform capabilities (bus width, removability, HW reset line).
    pub caps: MmcHostCaps,
    /// Base clock in Hz, 0 to read it from the capability register.
    pub max_clk: u32,
    /// Timeout clock in kHz, 0 to read it from the capability register.
    pub timeout_clk: u32,
    pub watchdog_ms: u64,
    pub sanitize_watchdog_ms: u64,
    /// Scatter entries one ADMA2 table can describe.
    pub adma_max_segs: usize,
    pub adma3_depth: usize,
}

impl Default for SdhciConfig {
    fn default() -> Self {
        Self {
            variant: SdhciVariant::Generic,
            quirks: None,
            caps: MmcHostCaps::WAIT_WHILE_BUSY | MmcHostCaps::ERASE,
            max_clk: 0,
            timeout_clk: 0,
            watchdog_ms: SDHCI_DEFAULT_WATCHDOG_MS,
            sanitize_watchdog_ms: SDHCI_SANITIZE_WATCHDOG_MS,
            adma_max_segs: 128,
            adma3_depth: ADMA3_MAX_DEPTH,
        }
    }
}

impl SdhciConfig {
    pub fn tegra() -> Self {
        Self {
            variant: SdhciVariant::Tegra,
            ..Default::default()
        }
    }

    pub fn effective_quirks(&self) -> SdhciQuirks {
        self.quirks.unwrap_or_else(|| SdhciQuirks::for_variant(self.variant))
    }
}
