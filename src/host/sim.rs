//! A simulated card behind a simulated host, for protocol-level tests.
//!
//! Commands are executed against an in-memory sector store. Faults can be
//! armed per opcode (and optionally per argument) to fail a command leg,
//! cut a data transfer short or raise bits in the card status.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use std::vec::Vec;

use crate::common::commands::{DataDir, MmcCommand, MmcRequest, R1Status};
use crate::common::err::{MmcError, MmcResult};
use crate::constants::*;
use crate::dma::ram::RamMemory;
use crate::dma::{DmaMemory, sg_copy_from_buffer, sg_copy_to_buffer};
use crate::host::{BatchDone, HostLimits, MmcHostCaps, MmcHostOps, MmcIos, RequestDone};
use crate::osa::jitter;

const STATE_TRAN: u32 = 4 << 9;
const STATE_PRG: u32 = 7 << 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultKind {
    /// The command itself fails.
    Cmd(MmcError),
    /// The data leg fails after `good_blocks` blocks reached the card.
    Data { err: MmcError, good_blocks: u32 },
    /// Extra bits in the command's R1 response.
    Status(u32),
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    opcode: u8,
    arg: Option<u32>,
    kind: FaultKind,
    remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SimCmd {
    pub opcode: u8,
    pub arg: u32,
    pub blocks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SimErase {
    pub start: u32,
    pub end: u32,
    pub arg: u32,
}

struct SimInner {
    storage: Vec<u8>,
    sd: bool,
    block_addressed: bool,
    faults: Vec<Fault>,
    log: Vec<SimCmd>,
    wr_blocks_last: u32,
    app_cmd: bool,
    erase_start: Option<u32>,
    erase_end: Option<u32>,
    erases: Vec<SimErase>,
    switches: Vec<u32>,
    busy_polls: u32,
    removed: bool,
    adma3: Vec<MmcRequest>,
    batches: Vec<usize>,
    cq_async: bool,
    cq_inflight: BTreeSet<u32>,
    cq_peak: usize,
    tag_clashes: u32,
    resets: u32,
}

pub(crate) struct SimHost {
    mem: Arc<RamMemory>,
    caps: Mutex<MmcHostCaps>,
    limits: Mutex<HostLimits>,
    inner: Arc<Mutex<SimInner>>,
}

impl SimHost {
    pub fn new(mem: Arc<RamMemory>, sectors: usize) -> Self {
        Self {
            mem,
            caps: Mutex::new(MmcHostCaps::CMD23 | MmcHostCaps::ERASE | MmcHostCaps::HW_RESET),
            limits: Mutex::new(HostLimits::default()),
            inner: Arc::new(Mutex::new(SimInner {
                storage: std::vec![0u8; sectors * MMC_SECTOR_SIZE as usize],
                sd: false,
                block_addressed: true,
                faults: Vec::new(),
                log: Vec::new(),
                wr_blocks_last: 0,
                app_cmd: false,
                erase_start: None,
                erase_end: None,
                erases: Vec::new(),
                switches: Vec::new(),
                busy_polls: 0,
                removed: false,
                adma3: Vec::new(),
                batches: Vec::new(),
                cq_async: false,
                cq_inflight: BTreeSet::new(),
                cq_peak: 0,
                tag_clashes: 0,
                resets: 0,
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap()
    }

    pub fn mem(&self) -> &Arc<RamMemory> {
        &self.mem
    }

    pub fn set_caps(&self, caps: MmcHostCaps) {
        *self.caps.lock().unwrap() = caps;
    }

    pub fn set_limits(&self, limits: HostLimits) {
        *self.limits.lock().unwrap() = limits;
    }

    /// Behave as an SD card: ACMD22 and CMD32/33 erase addressing.
    pub fn set_sd(&self, sd: bool) {
        self.inner().sd = sd;
    }

    pub fn set_block_addressed(&self, block_addressed: bool) {
        self.inner().block_addressed = block_addressed;
    }

    /// Answer the next `polls` SEND_STATUS commands with the card still
    /// programming.
    pub fn set_busy_polls(&self, polls: u32) {
        self.inner().busy_polls = polls;
    }

    pub fn set_cq_async(&self, on: bool) {
        self.inner().cq_async = on;
    }

    pub fn remove_card(&self) {
        self.inner().removed = true;
    }

    pub fn inject(&self, opcode: u8, arg: Option<u32>, kind: FaultKind, count: u32) {
        self.inner().faults.push(Fault {
            opcode,
            arg,
            kind,
            remaining: count,
        });
    }

    pub fn log(&self) -> Vec<SimCmd> {
        self.inner().log.clone()
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.inner().log.iter().map(|c| c.opcode).collect()
    }

    pub fn clear_log(&self) {
        self.inner().log.clear();
    }

    pub fn erases(&self) -> Vec<SimErase> {
        self.inner().erases.clone()
    }

    pub fn switches(&self) -> Vec<u32> {
        self.inner().switches.clone()
    }

    pub fn batches(&self) -> Vec<usize> {
        self.inner().batches.clone()
    }

    pub fn resets(&self) -> u32 {
        self.inner().resets
    }

    pub fn cq_peak(&self) -> usize {
        self.inner().cq_peak
    }

    pub fn tag_clashes(&self) -> u32 {
        self.inner().tag_clashes
    }

    pub fn write_sectors(&self, sector: usize, data: &[u8]) {
        let off = sector * MMC_SECTOR_SIZE as usize;
        self.inner().storage[off..off + data.len()].copy_from_slice(data);
    }

    pub fn read_sectors(&self, sector: usize, count: usize) -> Vec<u8> {
        let off = sector * MMC_SECTOR_SIZE as usize;
        self.inner().storage[off..off + count * MMC_SECTOR_SIZE as usize].to_vec()
    }
}

impl SimInner {
    fn take_fault(&mut self, opcode: u8, arg: u32) -> Option<FaultKind> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.opcode == opcode && f.arg.is_none_or(|a| a == arg) && f.remaining > 0)?;
        fault.remaining -= 1;
        Some(fault.kind)
    }

    fn status_word(&mut self) -> u32 {
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            STATE_PRG
        } else {
            STATE_TRAN | R1Status::READY_FOR_DATA.bits()
        }
    }

    fn sector_of(&self, arg: u32) -> usize {
        if self.block_addressed {
            arg as usize
        } else {
            (arg >> 9) as usize
        }
    }

    /// Runs one command leg. Returns false when the leg failed.
    fn command(&mut self, cmd: &mut MmcCommand, blocks: u32) -> bool {
        self.log.push(SimCmd {
            opcode: cmd.opcode,
            arg: cmd.arg,
            blocks,
        });
        let app = core::mem::take(&mut self.app_cmd);
        let mut extra = 0;
        match self.take_fault(cmd.opcode, cmd.arg) {
            Some(FaultKind::Cmd(err)) => {
                cmd.error = Some(err);
                return false;
            }
            Some(FaultKind::Status(bits)) => extra = bits,
            _ => {}
        }

        cmd.resp[0] = match cmd.opcode {
            MMC_SEND_STATUS => self.status_word(),
            MMC_APP_CMD => {
                self.app_cmd = true;
                STATE_TRAN | R1Status::READY_FOR_DATA.bits() | R1Status::APP_CMD.bits()
            }
            SD_ERASE_WR_BLK_START | MMC_ERASE_GROUP_START => {
                self.erase_start = Some(cmd.arg);
                STATE_TRAN
            }
            SD_ERASE_WR_BLK_END | MMC_ERASE_GROUP_END => {
                self.erase_end = Some(cmd.arg);
                STATE_TRAN
            }
            MMC_ERASE => {
                if let (Some(start), Some(end)) = (self.erase_start.take(), self.erase_end.take()) {
                    self.erases.push(SimErase {
                        start,
                        end,
                        arg: cmd.arg,
                    });
                }
                STATE_TRAN
            }
            MMC_SWITCH => {
                self.switches.push(cmd.arg);
                STATE_TRAN
            }
            SD_APP_SEND_NUM_WR_BLKS if app => STATE_TRAN | R1Status::APP_CMD.bits(),
            _ => STATE_TRAN | R1Status::READY_FOR_DATA.bits(),
        } | extra;
        true
    }

    fn execute(&mut self, mem: &dyn DmaMemory, mrq: &mut MmcRequest) {
        if self.removed {
            mrq.cmd.error = Some(MmcError::MediumRemoved);
            return;
        }
        let blocks = mrq.data.as_ref().map_or(0, |d| d.blocks);
        if let Some(sbc) = mrq.sbc.as_mut() {
            if !self.command(sbc, 0) {
                return;
            }
        }
        if let Some(addr) = mrq.task_addr.as_mut() {
            if !self.command(addr, 0) {
                return;
            }
        }
        // ACMD22 is only recognised right after CMD55
        let app = self.app_cmd;
        if !self.command(&mut mrq.cmd, blocks) {
            return;
        }

        if let Some(data) = mrq.data.as_mut() {
            let start = match mrq.cmd.opcode {
                MMC_EXECUTE_READ_TASK | MMC_EXECUTE_WRITE_TASK => {
                    mrq.task_addr.as_ref().map_or(0, |c| self.sector_of(c.arg))
                }
                _ => self.sector_of(mrq.cmd.arg),
            };
            let fault = self.take_fault(mrq.cmd.opcode | 0x80, mrq.cmd.arg);
            let good = match fault {
                Some(FaultKind::Data { good_blocks, .. }) => good_blocks.min(data.blocks),
                _ => data.blocks,
            };
            let len = (good * data.blksz) as usize;

            if mrq.cmd.opcode == SD_APP_SEND_NUM_WR_BLKS && app {
                sg_copy_from_buffer(mem, &data.sg, &self.wr_blocks_last.to_be_bytes());
            } else {
                let off = start * MMC_SECTOR_SIZE as usize;
                match data.dir {
                    DataDir::Read => {
                        let end = (off + len).min(self.storage.len());
                        let chunk = self.storage[off.min(end)..end].to_vec();
                        sg_copy_from_buffer(mem, &data.sg, &chunk);
                    }
                    DataDir::Write => {
                        let mut chunk = std::vec![0u8; len];
                        let n = sg_copy_to_buffer(mem, &data.sg, &mut chunk);
                        let end = (off + n).min(self.storage.len());
                        let n = end.saturating_sub(off);
                        self.storage[off..off + n].copy_from_slice(&chunk[..n]);
                        self.wr_blocks_last = good;
                    }
                }
            }

            match fault {
                Some(FaultKind::Data { err, .. }) => {
                    data.error = Some(err);
                    data.bytes_xfered = 0;
                }
                _ => data.bytes_xfered = data.len(),
            }
        }

        if let Some(stop) = mrq.stop.as_mut() {
            self.command(stop, 0);
        }
    }
}

/// Marks a data-leg fault for `opcode`: the transfer stops after
/// `good_blocks` blocks and the data leg reports `err`.
pub(crate) fn data_fault(host: &SimHost, opcode: u8, arg: Option<u32>, err: MmcError, good_blocks: u32, count: u32) {
    host.inject(opcode | 0x80, arg, FaultKind::Data { err, good_blocks }, count);
}

impl MmcHostOps for SimHost {
    fn request(&self, mut mrq: MmcRequest, done: RequestDone) {
        self.inner().execute(&*self.mem, &mut mrq);
        done(mrq);
    }

    fn set_ios(&self, _ios: &MmcIos) -> MmcResult {
        Ok(())
    }

    fn get_cd(&self) -> bool {
        !self.inner().removed
    }

    fn get_ro(&self) -> bool {
        false
    }

    fn execute_tuning(&self, _opcode: u8) -> MmcResult {
        Ok(())
    }

    fn hw_reset(&self) -> MmcResult {
        if !self.caps().contains(MmcHostCaps::HW_RESET) {
            return Err(MmcError::Unsupported);
        }
        self.inner().resets += 1;
        Ok(())
    }

    fn limits(&self) -> HostLimits {
        *self.limits.lock().unwrap()
    }

    fn caps(&self) -> MmcHostCaps {
        *self.caps.lock().unwrap()
    }

    fn cmdq_request(&self, tag: u32, mut mrq: MmcRequest, done: RequestDone) {
        let asynchronous = {
            let mut inner = self.inner();
            if !inner.cq_inflight.insert(tag) {
                inner.tag_clashes += 1;
            }
            inner.cq_peak = inner.cq_peak.max(inner.cq_inflight.len());
            inner.cq_async
        };
        let inner = self.inner.clone();
        let mem = self.mem.clone();
        let run = move || {
            let mut guard = inner.lock().unwrap();
            guard.execute(&*mem, &mut mrq);
            guard.cq_inflight.remove(&tag);
            drop(guard);
            done(mrq);
        };
        if asynchronous {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_micros(jitter(0, 300)));
                run();
            });
        } else {
            run();
        }
    }

    fn adma3_enqueue(&self, mrq: MmcRequest) -> Result<(), (MmcError, MmcRequest)> {
        if !self.caps().contains(MmcHostCaps::ADMA3) {
            return Err((MmcError::Unsupported, mrq));
        }
        let mut inner = self.inner();
        if inner.adma3.len() >= ADMA3_MAX_DEPTH {
            return Err((MmcError::NoMemory, mrq));
        }
        inner.adma3.push(mrq);
        Ok(())
    }

    fn adma3_flush(&self, done: BatchDone) -> MmcResult {
        let mut inner = self.inner();
        let mut batch = core::mem::take(&mut inner.adma3);
        inner.batches.push(batch.len());
        for mrq in batch.iter_mut() {
            inner.execute(&*self.mem, mrq);
        }
        // the controller reports one status for the whole chain
        if let Some((_, err)) = batch.iter().find_map(|m| m.first_error()) {
            for mrq in batch.iter_mut() {
                if let Some(data) = mrq.data.as_mut() {
                    data.error = Some(err);
                    data.bytes_xfered = 0;
                }
            }
        }
        drop(inner);
        done(batch);
        Ok(())
    }
}
