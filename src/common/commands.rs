use alloc::vec::Vec;

use bitflags::bitflags;
use log::trace;

use crate::common::err::MmcError;
use crate::constants::*;

bitflags! {
    /// Expected response shape of a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RspFlags: u32 {
        const PRESENT = 1 << 0;
        const LONG = 1 << 1;
        const CRC = 1 << 2;
        const BUSY = 1 << 3;
        const OPCODE = 1 << 4;
    }
}

impl RspFlags {
    pub const NONE: RspFlags = RspFlags::empty();
    pub const R1: RspFlags = RspFlags::PRESENT.union(RspFlags::CRC).union(RspFlags::OPCODE);
    pub const R1B: RspFlags = RspFlags::R1.union(RspFlags::BUSY);
    pub const R2: RspFlags = RspFlags::PRESENT.union(RspFlags::LONG).union(RspFlags::CRC);
    pub const R3: RspFlags = RspFlags::PRESENT;
}

bitflags! {
    /// R1 card status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R1Status: u32 {
        const OUT_OF_RANGE = 1 << 31;
        const ADDRESS_ERROR = 1 << 30;
        const BLOCK_LEN_ERROR = 1 << 29;
        const ERASE_SEQ_ERROR = 1 << 28;
        const ERASE_PARAM = 1 << 27;
        const WP_VIOLATION = 1 << 26;
        const CARD_IS_LOCKED = 1 << 25;
        const LOCK_UNLOCK_FAILED = 1 << 24;
        const COM_CRC_ERROR = 1 << 23;
        const ILLEGAL_COMMAND = 1 << 22;
        const CARD_ECC_FAILED = 1 << 21;
        const CC_ERROR = 1 << 20;
        const ERROR = 1 << 19;
        const CURRENT_STATE = 0xF << 9;
        const READY_FOR_DATA = 1 << 8;
        const SWITCH_ERROR = 1 << 7;
        const URGENT_BKOPS = 1 << 6;
        const APP_CMD = 1 << 5;
    }
}

impl R1Status {
    /// Errors that mean the r/w command itself was rejected.
    pub const CMD_ERRORS: R1Status = R1Status::OUT_OF_RANGE
        .union(R1Status::ADDRESS_ERROR)
        .union(R1Status::BLOCK_LEN_ERROR)
        .union(R1Status::WP_VIOLATION)
        .union(R1Status::CC_ERROR)
        .union(R1Status::ERROR);

    /// Every status bit from 13 upwards.
    pub const STATUS_ERRORS: u32 = 0xFFFF_E000;

    pub fn current_state(self) -> CardState {
        CardState::from_bits((self.bits() >> 9) & 0xF)
    }

    pub fn has_errors(self) -> bool {
        self.bits() & Self::STATUS_ERRORS != 0
    }

    /// Ready for the next data command: not programming and buffer free.
    pub fn is_ready(self) -> bool {
        self.contains(R1Status::READY_FOR_DATA) && self.current_state() != CardState::Programming
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Ident,
    Standby,
    Transfer,
    Data,
    Receive,
    Programming,
    Disconnect,
    Reserved(u32),
}

impl CardState {
    pub fn from_bits(bits: u32) -> Self {
        match bits {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Standby,
            4 => CardState::Transfer,
            5 => CardState::Data,
            6 => CardState::Receive,
            7 => CardState::Programming,
            8 => CardState::Disconnect,
            other => CardState::Reserved(other),
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            CardState::Idle => 0,
            CardState::Ready => 1,
            CardState::Ident => 2,
            CardState::Standby => 3,
            CardState::Transfer => 4,
            CardState::Data => 5,
            CardState::Receive => 6,
            CardState::Programming => 7,
            CardState::Disconnect => 8,
            CardState::Reserved(bits) => bits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDir {
    Read,
    Write,
}

/// One scatter list segment, as a bus address. The backing memory belongs
/// to whoever issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
}

impl SgEntry {
    pub fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

pub fn sg_total_len(sg: &[SgEntry]) -> u64 {
    sg.iter().map(|e| e.len as u64).sum()
}

/// Trims `sg` so it describes exactly `len` bytes.
pub fn sg_truncate(sg: &[SgEntry], len: u64) -> Vec<SgEntry> {
    let mut out = Vec::with_capacity(sg.len());
    let mut left = len;
    for entry in sg {
        if left == 0 {
            break;
        }
        let take = (entry.len as u64).min(left);
        out.push(SgEntry::new(entry.addr, take as u32));
        left -= take;
    }
    out
}

/// Drops the first `bytes` bytes from the front of `sg`.
pub fn sg_advance(sg: &mut Vec<SgEntry>, bytes: u64) {
    let mut left = bytes;
    while left > 0 && !sg.is_empty() {
        let first = &mut sg[0];
        if first.len as u64 <= left {
            left -= first.len as u64;
            sg.remove(0);
        } else {
            first.addr += left;
            first.len -= left as u32;
            left = 0;
        }
    }
}

#[derive(Debug, Clone)]
pub struct MmcCommand {
    pub opcode: u8,
    pub arg: u32,
    pub flags: RspFlags,
    pub resp: [u32; 4],
    pub error: Option<MmcError>,
    pub retries: u32,
    /// Busy timeout for R1B commands, 0 means none.
    pub busy_timeout_ms: u32,
}

impl MmcCommand {
    pub fn new(opcode: u8, arg: u32, flags: RspFlags) -> Self {
        Self {
            opcode,
            arg,
            flags,
            resp: [0; 4],
            error: None,
            retries: 0,
            busy_timeout_ms: 0,
        }
    }

    pub fn with_busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn r1(&self) -> R1Status {
        R1Status::from_bits_retain(self.resp[0])
    }

    pub fn has_busy(&self) -> bool {
        self.flags.contains(RspFlags::BUSY)
    }

    pub fn is_long(&self) -> bool {
        self.flags.contains(RspFlags::LONG)
    }

    /// Arguments of a CMD6 write-byte access.
    pub fn switch(index: u32, value: u8, busy_timeout_ms: u32) -> Self {
        let arg = (MMC_SWITCH_MODE_WRITE_BYTE << 24)
            | (index << 16)
            | ((value as u32) << 8)
            | EXT_CSD_CMD_SET_NORMAL;
        Self::new(MMC_SWITCH, arg, RspFlags::R1B).with_busy_timeout(busy_timeout_ms)
    }

    pub fn is_sanitize(&self) -> bool {
        self.opcode == MMC_SWITCH && ((self.arg >> 16) & 0xFF) == EXT_CSD_SANITIZE_START
    }
}

/// Rebuilds a 136-bit response from the four SDHCI response registers,
/// which drop the CRC byte and so are shifted right by 8 bits.
pub fn r2_from_raw(raw: [u32; 4]) -> [u32; 4] {
    let mut response = [0; 4];
    for i in 0..4 {
        response[i] = raw[3 - i] << 8;
        if i != 3 {
            response[i] |= raw[3 - i - 1] >> 24;
        }
    }
    trace!(
        "R2 response: {:#x} {:#x} {:#x} {:#x}",
        response[0], response[1], response[2], response[3]
    );
    response
}

#[derive(Debug, Clone)]
pub struct MmcData {
    pub blksz: u32,
    pub blocks: u32,
    pub dir: DataDir,
    pub sg: Vec<SgEntry>,
    pub timeout_ns: u64,
    pub timeout_clks: u32,
    pub bytes_xfered: u32,
    pub error: Option<MmcError>,
}

impl MmcData {
    pub fn new(blksz: u32, blocks: u32, dir: DataDir, sg: Vec<SgEntry>) -> Self {
        Self {
            blksz,
            blocks,
            dir,
            sg,
            timeout_ns: 0,
            timeout_clks: 0,
            bytes_xfered: 0,
            error: None,
        }
    }

    pub fn len(&self) -> u32 {
        self.blksz * self.blocks
    }

    pub fn is_read(&self) -> bool {
        self.dir == DataDir::Read
    }
}

/// Which command of a request an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Sbc,
    TaskAddr,
    Cmd,
    Data,
    Stop,
}

/// One protocol exchange: optional CMD23, the main command, optional data
/// and optional stop.
#[derive(Debug, Clone)]
pub struct MmcRequest {
    pub sbc: Option<MmcCommand>,
    /// CMD45 task address for queued tasks.
    pub task_addr: Option<MmcCommand>,
    pub cmd: MmcCommand,
    pub data: Option<MmcData>,
    pub stop: Option<MmcCommand>,
}

impl MmcRequest {
    pub fn new(cmd: MmcCommand) -> Self {
        Self {
            sbc: None,
            task_addr: None,
            cmd,
            data: None,
            stop: None,
        }
    }

    pub fn with_data(mut self, data: MmcData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_stop(mut self, stop: MmcCommand) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_sbc(mut self, sbc: MmcCommand) -> Self {
        self.sbc = Some(sbc);
        self
    }

    pub fn leg_error(&self, leg: Leg) -> Option<MmcError> {
        match leg {
            Leg::Sbc => self.sbc.as_ref().and_then(|c| c.error),
            Leg::TaskAddr => self.task_addr.as_ref().and_then(|c| c.error),
            Leg::Cmd => self.cmd.error,
            Leg::Data => self.data.as_ref().and_then(|d| d.error),
            Leg::Stop => self.stop.as_ref().and_then(|c| c.error),
        }
    }

    /// First failing leg in wire order.
    pub fn first_error(&self) -> Option<(Leg, MmcError)> {
        [Leg::Sbc, Leg::TaskAddr, Leg::Cmd, Leg::Data, Leg::Stop]
            .into_iter()
            .find_map(|leg| self.leg_error(leg).map(|e| (leg, e)))
    }

    pub fn has_error(&self) -> bool {
        self.first_error().is_some()
    }

    pub fn bytes_xfered(&self) -> u32 {
        self.data.as_ref().map_or(0, |d| d.bytes_xfered)
    }

    /// Clears every result field so the request can go on the wire again.
    pub fn reset_results(&mut self) {
        for cmd in [&mut self.sbc, &mut self.task_addr, &mut self.stop]
            .into_iter()
            .flatten()
        {
            cmd.error = None;
            cmd.resp = [0; 4];
        }
        self.cmd.error = None;
        self.cmd.resp = [0; 4];
        if let Some(data) = self.data.as_mut() {
            data.error = None;
            data.bytes_xfered = 0;
        }
    }
}
