//! Raw command passthrough for user space, single and combined.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, error, warn};

use super::{BlkArea, MmcBlkDevice};
use crate::common::commands::{DataDir, MmcCommand, MmcData, MmcRequest, RspFlags, SgEntry};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::core::transfer::set_data_timeout;
use crate::host::MmcHostOps;
use crate::osa::usleep_range;

/// One raw command as user space describes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MmcIocCmd {
    pub opcode: u8,
    pub arg: u32,
    pub flags: RspFlags,
    /// Send CMD55 first.
    pub is_acmd: bool,
    /// Non-zero for a write; bit 31 asks RPMB for a reliable write.
    pub write_flag: u32,
    pub blksz: u32,
    pub blocks: u32,
    /// Overrides the data timeout derived from the card when non-zero.
    pub data_timeout_ns: u64,
    pub cmd_timeout_ms: u32,
    pub postsleep_min_us: u32,
    pub postsleep_max_us: u32,
    /// Filled in from the card's response.
    pub response: [u32; 4],
    /// Data to write, or the buffer reads land in.
    pub data: Vec<u8>,
}

impl MmcIocCmd {
    pub fn new(opcode: u8, arg: u32, flags: RspFlags) -> Self {
        Self {
            opcode,
            arg,
            flags,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, blksz: u32, blocks: u32, write_flag: u32, data: Vec<u8>) -> Self {
        self.blksz = blksz;
        self.blocks = blocks;
        self.write_flag = write_flag;
        self.data = data;
        self
    }

    pub fn is_write(&self) -> bool {
        self.write_flag != 0
    }

    fn data_len(&self) -> u64 {
        self.blksz as u64 * self.blocks as u64
    }
}

/// What the opener of the device is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoctlCaller {
    /// Privileged for raw I/O.
    pub raw_io: bool,
    /// Opened the whole device rather than a partition.
    pub whole_device: bool,
}

impl IoctlCaller {
    pub const PRIVILEGED: IoctlCaller = IoctlCaller {
        raw_io: true,
        whole_device: true,
    };
}

fn check_ioctl(caller: IoctlCaller, ic: &MmcIocCmd) -> MmcResult {
    if !(caller.raw_io && caller.whole_device) {
        return Err(MmcError::PermissionDenied);
    }
    if ic.data_len() > MMC_IOC_MAX_BYTES as u64 {
        return Err(MmcError::Overflow);
    }
    Ok(())
}

impl<T: MmcHostOps> MmcBlkDevice<T> {
    /// Runs one raw command.
    pub fn ioctl_cmd(&self, caller: IoctlCaller, ic: &mut MmcIocCmd) -> MmcResult {
        check_ioctl(caller, ic)?;
        let _claim = self.host.claim();
        self.ioctl_cmd_locked(ic)
    }

    /// Runs several raw commands back to back under one claim of the
    /// host, then waits for the card to settle. The first failing command
    /// ends the sequence.
    pub fn ioctl_combo(&self, caller: IoctlCaller, cmds: &mut [MmcIocCmd]) -> MmcResult {
        if cmds.is_empty() {
            return Err(MmcError::InvalidValue);
        }
        for ic in cmds.iter() {
            check_ioctl(caller, ic)?;
        }
        let _claim = self.host.claim();
        for (i, ic) in cmds.iter_mut().enumerate() {
            if let Err(e) = self.ioctl_cmd_locked(ic) {
                warn!("{}: combo command {} (CMD{}) failed: {}", self.name, i, ic.opcode, e);
                return Err(e);
            }
        }
        self.host
            .status_poll(&self.card, self.config.combo_poll_retries)
            .map_err(|e| {
                error!("{}: card did not settle after combo: {}", self.name, e);
                e
            })?;
        Ok(())
    }

    fn ioctl_cmd_locked(&self, ic: &mut MmcIocCmd) -> MmcResult {
        let is_rpmb = self.area == BlkArea::Rpmb;
        let mut cmd = MmcCommand::new(ic.opcode, ic.arg, ic.flags);
        cmd.busy_timeout_ms = ic.cmd_timeout_ms;

        if cmd.is_sanitize() {
            return self.ioctl_sanitize();
        }

        let len = ic.data_len() as usize;
        let region = if len > 0 {
            Some(self.mem.alloc(len, 4)?)
        } else {
            None
        };
        let mut mrq = MmcRequest::new(cmd);
        if let Some(region) = region {
            let dir = if ic.is_write() { DataDir::Write } else { DataDir::Read };
            if dir == DataDir::Write {
                ic.data.resize(len, 0);
                self.mem.write(region.addr, &ic.data);
            }
            let mut data = MmcData::new(ic.blksz, ic.blocks, dir, vec![SgEntry::new(region.addr, len as u32)]);
            set_data_timeout(&mut data, &self.card);
            if ic.data_timeout_ns != 0 {
                data.timeout_ns = ic.data_timeout_ns;
            }
            if ic.flags.contains(RspFlags::R1B) {
                data.timeout_ns = ic.cmd_timeout_ms as u64 * 1_000_000;
            }
            mrq = mrq.with_data(data);
        }

        let result = self.ioctl_exchange(ic, mrq, is_rpmb);
        if let Some(region) = region {
            if result.is_ok() && !ic.is_write() {
                ic.data.resize(len, 0);
                self.mem.read(region.addr, &mut ic.data);
            }
            self.mem.free(region);
        }
        result
    }

    fn ioctl_exchange(&self, ic: &mut MmcIocCmd, mrq: MmcRequest, is_rpmb: bool) -> MmcResult {
        if ic.is_acmd {
            self.host.app_cmd(&self.card)?;
        }
        if is_rpmb {
            self.host
                .set_blockcount(ic.blocks, ic.write_flag & MMC_SBC_RELIABLE_WRITE != 0)?;
        }

        let done = self.host.wait_for_req(mrq)?;
        if let Some(err) = done.cmd.error {
            debug!("{}: ioctl CMD{} error {}", self.name, ic.opcode, err);
            return Err(err);
        }
        if let Some(err) = done.data.as_ref().and_then(|d| d.error) {
            debug!("{}: ioctl CMD{} data error {}", self.name, ic.opcode, err);
            return Err(err);
        }

        // some commands need the card left alone for a while afterwards
        if ic.postsleep_min_us != 0 {
            usleep_range(ic.postsleep_min_us as u64, ic.postsleep_max_us as u64);
        }
        ic.response = done.cmd.resp;

        if is_rpmb {
            self.host
                .status_poll(&self.card, self.config.rpmb_poll_retries)
                .map_err(|e| {
                    error!("{}: card did not leave programming after RPMB access: {}", self.name, e);
                    e
                })?;
        }
        Ok(())
    }

    fn ioctl_sanitize(&self) -> MmcResult {
        if !self.card.can_sanitize() {
            warn!("{}: sanitize not supported", self.name);
            return Err(MmcError::Unsupported);
        }
        debug!("{}: sanitize in progress", self.name);
        self.host
            .switch(EXT_CSD_SANITIZE_START, 1, MMC_SANITIZE_REQ_TIMEOUT_MS)
            .inspect_err(|e| error!("{}: sanitize failed: {}", self.name, e))
    }
}
