// MMC / SD protocol command opcodes
pub const MMC_GO_IDLE_STATE: u8 = 0;
pub const MMC_SEND_OP_COND: u8 = 1;
pub const MMC_ALL_SEND_CID: u8 = 2;
pub const MMC_SET_RELATIVE_ADDR: u8 = 3;
pub const MMC_SWITCH: u8 = 6;
pub const MMC_SELECT_CARD: u8 = 7;
pub const MMC_SEND_EXT_CSD: u8 = 8;
pub const MMC_SEND_CSD: u8 = 9;
pub const MMC_STOP_TRANSMISSION: u8 = 12;
pub const MMC_SEND_STATUS: u8 = 13;
pub const MMC_BUS_TEST_R: u8 = 14;
pub const MMC_SET_BLOCKLEN: u8 = 16;
pub const MMC_READ_SINGLE_BLOCK: u8 = 17;
pub const MMC_READ_MULTIPLE_BLOCK: u8 = 18;
pub const MMC_SEND_TUNING_BLOCK: u8 = 19;
pub const MMC_SEND_TUNING_BLOCK_HS200: u8 = 21;
pub const MMC_SET_BLOCK_COUNT: u8 = 23;
pub const MMC_WRITE_BLOCK: u8 = 24;
pub const MMC_WRITE_MULTIPLE_BLOCK: u8 = 25;
pub const SD_ERASE_WR_BLK_START: u8 = 32;
pub const SD_ERASE_WR_BLK_END: u8 = 33;
pub const MMC_ERASE_GROUP_START: u8 = 35;
pub const MMC_ERASE_GROUP_END: u8 = 36;
pub const MMC_ERASE: u8 = 38;
pub const MMC_QUEUED_TASK_PARAMS: u8 = 44;
pub const MMC_QUEUED_TASK_ADDRESS: u8 = 45;
pub const MMC_EXECUTE_READ_TASK: u8 = 46;
pub const MMC_EXECUTE_WRITE_TASK: u8 = 47;
pub const MMC_CMDQ_TASK_MGMT: u8 = 48;
pub const MMC_APP_CMD: u8 = 55;
pub const SD_APP_SEND_NUM_WR_BLKS: u8 = 22;

// Erase / trim arguments for CMD38
pub const MMC_ERASE_ARG: u32 = 0x0000_0000;
pub const MMC_SECURE_ERASE_ARG: u32 = 0x8000_0000;
pub const MMC_TRIM_ARG: u32 = 0x0000_0001;
pub const MMC_DISCARD_ARG: u32 = 0x0000_0003;
pub const MMC_SECURE_TRIM1_ARG: u32 = 0x8000_0001;
pub const MMC_SECURE_TRIM2_ARG: u32 = 0x8000_8000;
pub const MMC_SECURE_ARGS: u32 = 0x8000_0000;
pub const MMC_TRIM_ARGS: u32 = 0x0000_8001;

// CMD6 (SWITCH) argument layout
pub const MMC_SWITCH_MODE_WRITE_BYTE: u32 = 0x03;
pub const EXT_CSD_CMD_SET_NORMAL: u32 = 1 << 0;
pub const EXT_CSD_FLUSH_CACHE: u32 = 32;
pub const EXT_CSD_SANITIZE_START: u32 = 165;
pub const EXT_CSD_PART_CONFIG: u32 = 179;

// EXT_CSD feature bits
pub const EXT_CSD_SEC_ER_EN: u8 = 1 << 0;
pub const EXT_CSD_SEC_GB_CL_EN: u8 = 1 << 4;
pub const EXT_CSD_SEC_SANITIZE: u8 = 1 << 6;
pub const EXT_CSD_WR_REL_PARAM_EN: u8 = 1 << 2;

// CMD44 (queued task parameters) argument layout
pub const MMC_CQ_TASK_SHIFT: u32 = 16;
pub const MMC_CQ_TASK_PRIORITY_SHIFT: u32 = 23;
pub const MMC_CQ_DATA_DIRECTION: u32 = 1 << 30;
pub const MMC_CQ_MAX_DEPTH: u32 = 32;
pub const MMC_CQ_RELIABLE_WRITE: u32 = 1 << 31;
/// CMD48 argument: discard every task in the card's queue.
pub const MMC_CQ_DISCARD_QUEUE: u32 = 1;

// CMD23 argument flags
pub const MMC_SBC_RELIABLE_WRITE: u32 = 1 << 31;

// Limits
pub const MMC_SECTOR_SIZE: u32 = 512;
pub const MMC_IOC_MAX_BYTES: u32 = 512 * 256;
pub const MMC_BLK_TIMEOUT_MS: u32 = 10 * 60 * 1000;
pub const MMC_DATA_TIMEOUT_LIMIT_NS: u64 = 100_000_000;
pub const MMC_QUEUE_BOUNCESZ: u32 = 65536;
pub const MMC_SANITIZE_REQ_TIMEOUT_MS: u32 = 240_000;
pub const MMC_ERASE_GROUP_TIMEOUT_MS: u32 = 300;

// SDHCI register offsets
pub const SDHCI_DMA_ADDRESS: u32 = 0x00;
pub const SDHCI_ARGUMENT2: u32 = SDHCI_DMA_ADDRESS;
pub const SDHCI_BLOCK_SIZE: u32 = 0x04;
pub const SDHCI_BLOCK_COUNT: u32 = 0x06;
pub const SDHCI_ARGUMENT: u32 = 0x08;
pub const SDHCI_TRANSFER_MODE: u32 = 0x0C;
pub const SDHCI_COMMAND: u32 = 0x0E;
pub const SDHCI_RESPONSE: u32 = 0x10;
pub const SDHCI_BUFFER: u32 = 0x20;
pub const SDHCI_PRESENT_STATE: u32 = 0x24;
pub const SDHCI_HOST_CONTROL: u32 = 0x28;
pub const SDHCI_POWER_CONTROL: u32 = 0x29;
pub const SDHCI_CLOCK_CONTROL: u32 = 0x2C;
pub const SDHCI_TIMEOUT_CONTROL: u32 = 0x2E;
pub const SDHCI_SOFTWARE_RESET: u32 = 0x2F;
pub const SDHCI_INT_STATUS: u32 = 0x30;
pub const SDHCI_INT_ENABLE: u32 = 0x34;
pub const SDHCI_SIGNAL_ENABLE: u32 = 0x38;
pub const SDHCI_ACMD12_ERR: u32 = 0x3C;
pub const SDHCI_HOST_CONTROL2: u32 = 0x3E;
pub const SDHCI_CAPABILITIES: u32 = 0x40;
pub const SDHCI_CAPABILITIES_1: u32 = 0x44;
pub const SDHCI_ADMA_ERROR: u32 = 0x54;
pub const SDHCI_ADMA_ADDRESS: u32 = 0x58;
pub const SDHCI_ADMA_ADDRESS_HI: u32 = 0x5C;
pub const SDHCI_ADMA3_ADDRESS: u32 = 0x78;
pub const SDHCI_ADMA3_ADDRESS_HI: u32 = 0x7C;
pub const SDHCI_HOST_VERSION: u32 = 0xFE;

// Command register
pub const SDHCI_CMD_RESP_NONE: u16 = 0x00;
pub const SDHCI_CMD_RESP_LONG: u16 = 0x01;
pub const SDHCI_CMD_RESP_SHORT: u16 = 0x02;
pub const SDHCI_CMD_RESP_SHORT_BUSY: u16 = 0x03;
pub const SDHCI_CMD_CRC: u16 = 0x08;
pub const SDHCI_CMD_INDEX: u16 = 0x10;
pub const SDHCI_CMD_DATA: u16 = 0x20;

// Transfer mode register
pub const SDHCI_TRNS_DMA: u16 = 0x01;
pub const SDHCI_TRNS_BLK_CNT_EN: u16 = 0x02;
pub const SDHCI_TRNS_AUTO_CMD12: u16 = 0x04;
pub const SDHCI_TRNS_AUTO_CMD23: u16 = 0x08;
pub const SDHCI_TRNS_READ: u16 = 0x10;
pub const SDHCI_TRNS_MULTI: u16 = 0x20;

// Present state register
pub const SDHCI_CMD_INHIBIT: u32 = 0x0000_0001;
pub const SDHCI_DATA_INHIBIT: u32 = 0x0000_0002;
pub const SDHCI_CARD_PRESENT: u32 = 0x0001_0000;
pub const SDHCI_WRITE_PROTECT: u32 = 0x0008_0000;

// Host control register
pub const SDHCI_CTRL_4BITBUS: u8 = 0x02;
pub const SDHCI_CTRL_DMA_MASK: u8 = 0x18;
pub const SDHCI_CTRL_ADMA32: u8 = 0x10;
pub const SDHCI_CTRL_ADMA64: u8 = 0x18;
pub const SDHCI_CTRL_8BITBUS: u8 = 0x20;

// Host control 2 register
pub const SDHCI_CTRL_UHS_MASK: u16 = 0x0007;
pub const SDHCI_CTRL_UHS_SDR12: u16 = 0x0000;
pub const SDHCI_CTRL_UHS_SDR25: u16 = 0x0001;
pub const SDHCI_CTRL_UHS_SDR50: u16 = 0x0002;
pub const SDHCI_CTRL_UHS_SDR104: u16 = 0x0003;
pub const SDHCI_CTRL_UHS_DDR50: u16 = 0x0004;
pub const SDHCI_CTRL_HS400: u16 = 0x0005;
pub const SDHCI_CTRL_VDD_180: u16 = 0x0008;
pub const SDHCI_CTRL_EXEC_TUNING: u16 = 0x0040;
pub const SDHCI_CTRL_TUNED_CLK: u16 = 0x0080;
pub const SDHCI_CTRL_V4_MODE: u16 = 0x1000;
pub const SDHCI_CTRL_64BIT_ADDR: u16 = 0x2000;

// Clock control register
pub const SDHCI_CLOCK_INT_EN: u16 = 0x0001;
pub const SDHCI_CLOCK_INT_STABLE: u16 = 0x0002;
pub const SDHCI_CLOCK_CARD_EN: u16 = 0x0004;
pub const SDHCI_DIVIDER_SHIFT: u16 = 8;
pub const SDHCI_DIVIDER_HI_SHIFT: u16 = 6;
pub const SDHCI_DIV_MASK: u16 = 0xFF;
pub const SDHCI_DIV_HI_MASK: u16 = 0x300;
pub const SDHCI_MAX_DIV_SPEC_300: u32 = 2046;

// Capabilities register
pub const SDHCI_TIMEOUT_CLK_MASK: u32 = 0x0000_003F;
pub const SDHCI_TIMEOUT_CLK_UNIT: u32 = 0x0000_0080;
pub const SDHCI_CLOCK_V3_BASE_MASK: u32 = 0x0000_FF00;
pub const SDHCI_CLOCK_BASE_SHIFT: u32 = 8;
pub const SDHCI_CAN_DO_ADMA2: u32 = 0x0008_0000;
pub const SDHCI_CAN_64BIT: u32 = 0x1000_0000;

pub const SDHCI_SPEC_VER_MASK: u16 = 0x00FF;
pub const SDHCI_SPEC_300: u16 = 2;
pub const SDHCI_SPEC_400: u16 = 3;

// Timeouts
pub const SDHCI_MAX_TIMEOUT_COUNT: u8 = 0xE;
pub const SDHCI_INHIBIT_TIMEOUT_MS: u32 = 10;
pub const SDHCI_RESET_TIMEOUT_MS: u32 = 100;
pub const SDHCI_CLOCK_STABLE_TIMEOUT_MS: u32 = 20;
pub const SDHCI_MAX_IRQ_LOOPS: u32 = 16;
pub const SDHCI_MAX_TUNING_LOOP: u32 = 40;
pub const SDHCI_DEFAULT_WATCHDOG_MS: u64 = 10_000;
pub const SDHCI_SANITIZE_WATCHDOG_MS: u64 = 600_000;
pub const SDHCI_LONG_BUSY_THRESHOLD_MS: u32 = 9000;

// ADMA descriptor attributes
pub const ADMA2_TRAN_VALID: u16 = 0x21;
pub const ADMA2_NOP_END_VALID: u16 = 0x03;
pub const ADMA2_END: u16 = 0x02;
pub const ADMA3_CMD_VALID: u16 = 0x09;
pub const ADMA3_INTEGRATED_VALID: u16 = 0x39;
pub const ADMA3_INTEGRATED_END: u16 = 0x3B;
pub const ADMA3_MAX_DEPTH: usize = 16;
pub const ADMA_MAX_DESC_LEN: u32 = 65536;
