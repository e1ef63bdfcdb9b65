use core::fmt::Debug;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use crate::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Mmc,
    SdV1,
    SdV2,
}

bitflags! {
    /// Card command classes from the CSD CCC field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdClass: u32 {
        const BASIC = 1 << 0;
        const STREAM_READ = 1 << 1;
        const BLOCK_READ = 1 << 2;
        const STREAM_WRITE = 1 << 3;
        const BLOCK_WRITE = 1 << 4;
        const ERASE = 1 << 5;
        const WRITE_PROT = 1 << 6;
        const LOCK_CARD = 1 << 7;
        const APP_SPEC = 1 << 8;
        const IO_MODE = 1 << 9;
        const SWITCH = 1 << 10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CardQuirks: u32 {
        /// Skip CMD23 for plain multi-block transfers.
        const BLK_NO_CMD23 = 1 << 0;
        /// Trim and discard must not be used.
        const TRIM_BROKEN = 1 << 1;
    }
}

/// The EXT_CSD fields the engine consults. Parsing the raw register is
/// the card-init code's job.
#[derive(Debug, Clone, Default)]
pub struct MmcExtCsd {
    pub cmdq_support: bool,
    pub cmdq_depth: u32,
    pub cmdq_mode_en: bool,
    pub packed_support: bool,
    pub cache_size: u32,
    pub cache_ctrl: bool,
    pub sec_feature_support: u8,
    pub feature_support_discard: bool,
    pub rel_param: u8,
    pub rel_sectors: u32,
    pub erase_group_def: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SdScr {
    pub cmd23: bool,
}

#[derive(Debug, Clone)]
pub enum CardExt {
    Mmc(MmcExtCsd),
    Sd(SdScr),
}

impl CardExt {
    pub fn new(card_type: CardType) -> Self {
        match card_type {
            CardType::Mmc => CardExt::Mmc(MmcExtCsd::default()),
            CardType::SdV1 | CardType::SdV2 => CardExt::Sd(SdScr::default()),
        }
    }

    pub fn as_mmc(&self) -> Option<&MmcExtCsd> {
        if let CardExt::Mmc(ext) = self {
            Some(ext)
        } else {
            None
        }
    }

    pub fn as_sd(&self) -> Option<&SdScr> {
        if let CardExt::Sd(ext) = self {
            Some(ext)
        } else {
            None
        }
    }

    pub fn as_mut_mmc(&mut self) -> Option<&mut MmcExtCsd> {
        if let CardExt::Mmc(ext) = self {
            Some(ext)
        } else {
            None
        }
    }
}

/// Card metadata consumed by the engine.
///
/// Everything except the removal and BKOPS flags is fixed once the card
/// has been initialised, so the card is shared by reference between the
/// host, its queues and the ioctl surface.
#[derive(Debug)]
pub struct MmcCard {
    card_type: CardType,
    rca: u16,
    block_addressed: bool,
    capacity_sectors: u64,
    /// Erase group size in sectors.
    erase_size: u32,
    cmd_classes: CmdClass,
    tacc_ns: u32,
    tacc_clks: u32,
    quirks: CardQuirks,
    ext: CardExt,
    removed: AtomicBool,
    need_bkops: AtomicBool,
}

impl MmcCard {
    pub fn new(card_type: CardType, rca: u16) -> Self {
        MmcCard {
            card_type,
            rca,
            block_addressed: true,
            capacity_sectors: 0,
            erase_size: 0,
            cmd_classes: CmdClass::BASIC | CmdClass::BLOCK_READ | CmdClass::BLOCK_WRITE,
            tacc_ns: 0,
            tacc_clks: 0,
            quirks: CardQuirks::empty(),
            ext: CardExt::new(card_type),
            removed: AtomicBool::new(false),
            need_bkops: AtomicBool::new(false),
        }
    }

    pub fn with_capacity(mut self, sectors: u64) -> Self {
        self.capacity_sectors = sectors;
        self
    }

    pub fn with_block_addressing(mut self, block_addressed: bool) -> Self {
        self.block_addressed = block_addressed;
        self
    }

    pub fn with_erase_size(mut self, sectors: u32) -> Self {
        self.erase_size = sectors;
        self
    }

    pub fn with_cmd_classes(mut self, classes: CmdClass) -> Self {
        self.cmd_classes = classes;
        self
    }

    pub fn with_tacc(mut self, tacc_ns: u32, tacc_clks: u32) -> Self {
        self.tacc_ns = tacc_ns;
        self.tacc_clks = tacc_clks;
        self
    }

    pub fn with_quirks(mut self, quirks: CardQuirks) -> Self {
        self.quirks = quirks;
        self
    }

    pub fn with_ext(mut self, ext: CardExt) -> Self {
        self.ext = ext;
        self
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn is_sd(&self) -> bool {
        matches!(self.card_type, CardType::SdV1 | CardType::SdV2)
    }

    pub fn is_mmc(&self) -> bool {
        self.card_type == CardType::Mmc
    }

    pub fn rca(&self) -> u16 {
        self.rca
    }

    /// CMD13 / CMD55 argument.
    pub fn rca_arg(&self) -> u32 {
        (self.rca as u32) << 16
    }

    pub fn is_blockaddr(&self) -> bool {
        self.block_addressed
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn erase_size(&self) -> u32 {
        self.erase_size
    }

    pub fn cmd_classes(&self) -> CmdClass {
        self.cmd_classes
    }

    pub fn tacc_ns(&self) -> u32 {
        self.tacc_ns
    }

    pub fn tacc_clks(&self) -> u32 {
        self.tacc_clks
    }

    pub fn quirks(&self) -> CardQuirks {
        self.quirks
    }

    pub fn ext(&self) -> &CardExt {
        &self.ext
    }

    pub fn ext_csd(&self) -> Option<&MmcExtCsd> {
        self.ext.as_mmc()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn set_removed(&self, removed: bool) {
        self.removed.store(removed, Ordering::Release);
    }

    pub fn need_bkops(&self) -> bool {
        self.need_bkops.load(Ordering::Acquire)
    }

    pub fn set_need_bkops(&self, need: bool) {
        self.need_bkops.store(need, Ordering::Release);
    }

    /// Converts a sector number to the address form the card expects.
    pub fn data_address(&self, sector: u64) -> u32 {
        if self.block_addressed {
            sector as u32
        } else {
            (sector << 9) as u32
        }
    }

    pub fn can_erase(&self) -> bool {
        self.cmd_classes.contains(CmdClass::ERASE) && self.erase_size > 0
    }

    pub fn can_trim(&self) -> bool {
        !self.quirks.contains(CardQuirks::TRIM_BROKEN)
            && self
                .ext_csd()
                .is_some_and(|ext| ext.sec_feature_support & EXT_CSD_SEC_GB_CL_EN != 0)
    }

    pub fn can_discard(&self) -> bool {
        !self.quirks.contains(CardQuirks::TRIM_BROKEN)
            && self.ext_csd().is_some_and(|ext| ext.feature_support_discard)
    }

    pub fn can_secure_erase_trim(&self) -> bool {
        self.ext_csd()
            .is_some_and(|ext| ext.sec_feature_support & EXT_CSD_SEC_ER_EN != 0)
    }

    pub fn can_sanitize(&self) -> bool {
        self.can_trim()
            && self
                .ext_csd()
                .is_some_and(|ext| ext.sec_feature_support & EXT_CSD_SEC_SANITIZE != 0)
    }

    pub fn erase_group_aligned(&self, from: u64, nr: u64) -> bool {
        let size = self.erase_size as u64;
        size != 0 && from % size == 0 && nr % size == 0
    }

    /// CMD23 support on the card side.
    pub fn supports_cmd23(&self) -> bool {
        match &self.ext {
            CardExt::Mmc(_) => true,
            CardExt::Sd(scr) => scr.cmd23,
        }
    }

    pub fn has_cache(&self) -> bool {
        self.ext_csd()
            .is_some_and(|ext| ext.cache_size > 0 && ext.cache_ctrl)
    }

    pub fn cmdq_capable(&self) -> bool {
        self.ext_csd()
            .is_some_and(|ext| ext.cmdq_support && ext.cmdq_mode_en && ext.cmdq_depth > 0)
    }

    pub fn cmdq_depth(&self) -> u32 {
        self.ext_csd()
            .map_or(0, |ext| ext.cmdq_depth.min(MMC_CQ_MAX_DEPTH))
    }

    pub fn rel_write_enhanced(&self) -> bool {
        self.ext_csd()
            .is_some_and(|ext| ext.rel_param & EXT_CSD_WR_REL_PARAM_EN != 0)
    }

    pub fn rel_sectors(&self) -> u32 {
        self.ext_csd().map_or(0, |ext| ext.rel_sectors)
    }
}
