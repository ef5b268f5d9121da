//! In-memory controller model.
//!
//! Implements the [`Transport`] contract against plain byte vectors so the
//! whole rig — locking, command log, verification, workers — can run
//! end-to-end without hardware. Commands queue at submit and execute
//! during [`Transport::poll`], FIFO per queue, mirroring a device that
//! completes in order with negligible latency.

use std::collections::{BTreeMap, VecDeque};

use nvr_proto::{opcode, CmdImage, CplImage, DsmRange, NvmOp, Status};
use tracing::debug;

use crate::dma::DmaRef;
use crate::intc::IntcRef;
use crate::transport::{NamespaceInfo, Transport, TransportError};

const REG_SPACE: usize = 0x1400;

struct MemNamespace {
    info: NamespaceInfo,
    data: Vec<u8>,
}

struct MemQueue {
    depth: u32,
    intr_vector: Option<u16>,
    pending: VecDeque<(CmdImage, Option<DmaRef>)>,
}

pub struct MemDevice {
    namespaces: Vec<MemNamespace>,
    queues: BTreeMap<u16, MemQueue>,
    max_transfer: usize,
    regs: Vec<u8>,
    intc: Option<IntcRef>,
}

impl MemDevice {
    pub fn new(sector_size: u32, nsectors: u64) -> MemDevice {
        Self::with_namespaces(&[(sector_size, nsectors)])
    }

    pub fn with_namespaces(geometry: &[(u32, u64)]) -> MemDevice {
        let namespaces = geometry
            .iter()
            .enumerate()
            .map(|(i, &(sector_size, nsectors))| MemNamespace {
                info: NamespaceInfo {
                    nsid: i as u32 + 1,
                    sector_size,
                    nsectors,
                    eui64: 0x002538_0000_0000_01 + i as u64,
                },
                data: vec![0u8; (nsectors * sector_size as u64) as usize],
            })
            .collect();

        let mut queues = BTreeMap::new();
        queues.insert(
            0,
            MemQueue {
                depth: 32,
                intr_vector: Some(0),
                pending: VecDeque::new(),
            },
        );

        let mut regs = vec![0u8; REG_SPACE];
        // CAP: MQES=1023, TO=20, CSS=NVM.
        let cap: u64 = 1023 | (20 << 24) | (1 << 37);
        regs[0..8].copy_from_slice(&cap.to_le_bytes());
        // VS: 1.4.0
        regs[8..12].copy_from_slice(&0x0001_0400u32.to_le_bytes());

        MemDevice {
            namespaces,
            queues,
            max_transfer: 2 * 1024 * 1024,
            regs,
            intc: None,
        }
    }

    pub fn set_max_transfer_size(&mut self, bytes: usize) {
        self.max_transfer = bytes;
    }

    /// Bind the interrupt-control block completions are signalled through.
    pub fn set_intc(&mut self, intc: IntcRef) {
        self.intc = Some(intc);
    }

    /// Test hook: flip bits of one stored byte behind the driver's back.
    pub fn corrupt(&mut self, nsid: u32, lba: u64, offset: usize, xor: u8) {
        let ns = &mut self.namespaces[nsid as usize - 1];
        let pos = (lba * ns.info.sector_size as u64) as usize + offset;
        ns.data[pos] ^= xor;
    }

    /// Test hook: raw view of a namespace's storage.
    pub fn storage(&self, nsid: u32) -> &[u8] {
        &self.namespaces[nsid as usize - 1].data
    }

    fn ns(&mut self, nsid: u32) -> Option<&mut MemNamespace> {
        if nsid == 0 {
            return None;
        }
        self.namespaces.get_mut(nsid as usize - 1)
    }

    fn execute_io(&mut self, cmd: &CmdImage, data: Option<DmaRef>) -> Status {
        let max_transfer = self.max_transfer;
        let Some(ns) = self.ns(cmd.nsid) else {
            return Status::new(0x0, 0x0b); // invalid namespace or format
        };
        let sector = ns.info.sector_size as usize;
        let nsectors = ns.info.nsectors;

        let check_range = |slba: u64, nlb: u32| -> Option<Status> {
            if slba + nlb as u64 > nsectors {
                return Some(Status::LBA_OUT_OF_RANGE);
            }
            if nlb as usize * sector > max_transfer {
                return Some(Status::INVALID_FIELD);
            }
            None
        };

        match cmd.nvm_op() {
            NvmOp::Flush => Status::SUCCESS,
            NvmOp::Read { slba, nlb } => {
                if let Some(st) = check_range(slba, nlb) {
                    return st;
                }
                let Some(buf) = data else {
                    return Status::INVALID_FIELD;
                };
                let start = slba as usize * sector;
                let len = nlb as usize * sector;
                unsafe { buf.as_mut_slice()[..len].copy_from_slice(&ns.data[start..start + len]) };
                Status::SUCCESS
            }
            NvmOp::Write { slba, nlb } | NvmOp::Compare { slba, nlb } => {
                if let Some(st) = check_range(slba, nlb) {
                    return st;
                }
                let Some(buf) = data else {
                    return Status::INVALID_FIELD;
                };
                let start = slba as usize * sector;
                let len = nlb as usize * sector;
                let host = unsafe { &buf.as_slice()[..len] };
                if cmd.opc() == opcode::nvm::COMPARE {
                    if host != &ns.data[start..start + len] {
                        return Status::COMPARE_FAILURE;
                    }
                } else {
                    ns.data[start..start + len].copy_from_slice(host);
                }
                Status::SUCCESS
            }
            NvmOp::WriteUncorr { slba, nlb } => {
                // Storage keeps its stale contents; the integrity layer is
                // responsible for trapping subsequent reads.
                check_range(slba, nlb).unwrap_or(Status::SUCCESS)
            }
            NvmOp::WriteZeroes { slba, nlb } => {
                if let Some(st) = check_range(slba, nlb) {
                    return st;
                }
                let start = slba as usize * sector;
                ns.data[start..start + nlb as usize * sector].fill(0);
                Status::SUCCESS
            }
            NvmOp::Deallocate { nr } => {
                let Some(buf) = data else {
                    return Status::INVALID_FIELD;
                };
                if (cmd.cdw11 & 0x4) == 0 {
                    // No AD bit: hints only, accepted as a no-op.
                    return Status::SUCCESS;
                }
                let payload = unsafe { buf.as_slice() };
                if payload.len() < nr as usize * 16 {
                    return Status::INVALID_FIELD;
                }
                let ranges = DsmRange::parse(payload, nr);
                for r in &ranges {
                    if r.slba + r.nlb as u64 > nsectors {
                        return Status::LBA_OUT_OF_RANGE;
                    }
                }
                for r in &ranges {
                    let start = r.slba as usize * sector;
                    ns.data[start..start + r.nlb as usize * sector].fill(0);
                }
                Status::SUCCESS
            }
            NvmOp::Other(op) => {
                debug!(op, "unhandled nvm opcode");
                Status::new(0x0, 0x01) // invalid opcode
            }
        }
    }

    fn execute_admin(&mut self, cmd: &CmdImage, data: Option<DmaRef>) -> Status {
        match cmd.opc() {
            opcode::admin::IDENTIFY => {
                // Enough of an identify page for scripts that zero-check.
                if let Some(buf) = data {
                    unsafe { buf.as_mut_slice().fill(0) };
                }
                Status::SUCCESS
            }
            opcode::admin::FORMAT_NVM => match self.ns(cmd.nsid) {
                Some(ns) => {
                    ns.data.fill(0);
                    Status::SUCCESS
                }
                None => Status::new(0x0, 0x0b),
            },
            opcode::admin::SANITIZE => {
                for ns in &mut self.namespaces {
                    ns.data.fill(0);
                }
                Status::SUCCESS
            }
            opcode::admin::SET_FEATURES | opcode::admin::GET_FEATURES => Status::SUCCESS,
            opcode::admin::CREATE_IO_SQ
            | opcode::admin::CREATE_IO_CQ
            | opcode::admin::DELETE_IO_SQ
            | opcode::admin::DELETE_IO_CQ => Status::SUCCESS,
            op => {
                debug!(op, "unhandled admin opcode");
                Status::SUCCESS
            }
        }
    }
}

impl Transport for MemDevice {
    fn max_transfer_size(&self) -> usize {
        self.max_transfer
    }

    fn num_namespaces(&self) -> u32 {
        self.namespaces.len() as u32
    }

    fn namespace_info(&self, nsid: u32) -> Option<NamespaceInfo> {
        if nsid == 0 {
            return None;
        }
        self.namespaces.get(nsid as usize - 1).map(|ns| ns.info)
    }

    fn create_queue(
        &mut self,
        qid: u16,
        depth: u32,
        intr_vector: Option<u16>,
    ) -> Result<(), TransportError> {
        if self.queues.contains_key(&qid) {
            return Err(TransportError::QueueExists(qid));
        }
        self.queues.insert(
            qid,
            MemQueue {
                depth,
                intr_vector,
                pending: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn destroy_queue(&mut self, qid: u16) -> Result<(), TransportError> {
        self.queues
            .remove(&qid)
            .map(|_| ())
            .ok_or(TransportError::InvalidQueue(qid))
    }

    fn submit(
        &mut self,
        qid: u16,
        cmd: &CmdImage,
        data: Option<DmaRef>,
    ) -> Result<(), TransportError> {
        let queue = self
            .queues
            .get_mut(&qid)
            .ok_or(TransportError::InvalidQueue(qid))?;
        if queue.pending.len() >= queue.depth as usize {
            return Err(TransportError::QueueFull(qid));
        }
        queue.pending.push_back((*cmd, data));
        Ok(())
    }

    fn poll(
        &mut self,
        qid: u16,
        max: u32,
        sink: &mut dyn FnMut(CplImage),
    ) -> Result<u32, TransportError> {
        let intr_vector = self
            .queues
            .get(&qid)
            .ok_or(TransportError::InvalidQueue(qid))?
            .intr_vector;
        let budget = if max == 0 { u32::MAX } else { max };

        let mut reaped = 0;
        while reaped < budget {
            let Some((cmd, data)) = self.queues.get_mut(&qid).unwrap().pending.pop_front() else {
                break;
            };
            let status = if qid == 0 {
                self.execute_admin(&cmd, data)
            } else {
                self.execute_io(&cmd, data)
            };
            let mut cpl = CplImage::success(cmd.cid());
            cpl.set_status(status);
            sink(cpl);
            reaped += 1;
        }

        if reaped > 0 {
            if let (Some(intc), Some(vec)) = (&self.intc, intr_vector) {
                intc.raise(vec);
            }
        }
        Ok(reaped)
    }

    fn read_reg32(&self, offset: u32) -> Result<u32, TransportError> {
        let off = offset as usize;
        if off + 4 > self.regs.len() {
            return Err(TransportError::InvalidRegister(offset));
        }
        Ok(u32::from_le_bytes(self.regs[off..off + 4].try_into().unwrap()))
    }

    fn write_reg32(&mut self, offset: u32, value: u32) -> Result<(), TransportError> {
        let off = offset as usize;
        if off + 4 > self.regs.len() {
            return Err(TransportError::InvalidRegister(offset));
        }
        self.regs[off..off + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaBuf, PatternType};

    fn poll_one(dev: &mut MemDevice, qid: u16) -> CplImage {
        let mut out = None;
        dev.poll(qid, 0, &mut |cpl| out = Some(cpl)).unwrap();
        out.expect("one completion")
    }

    fn io_cmd(opc: u8, nsid: u32, slba: u64, nlb: u32) -> CmdImage {
        let mut cmd = CmdImage::new(opc, nsid);
        cmd.set_slba(slba);
        cmd.cdw12 = nlb - 1;
        cmd
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut dev = MemDevice::new(512, 64);
        dev.create_queue(1, 16, None).unwrap();
        let mut buf = DmaBuf::alloc(512, PatternType::Word32, 0xabab_abab).unwrap();

        dev.submit(1, &io_cmd(opcode::nvm::WRITE, 1, 3, 1), Some(buf.dma_ref()))
            .unwrap();
        assert!(!poll_one(&mut dev, 1).is_error());

        buf.as_mut_slice().fill(0);
        dev.submit(1, &io_cmd(opcode::nvm::READ, 1, 3, 1), Some(buf.dma_ref()))
            .unwrap();
        assert!(!poll_one(&mut dev, 1).is_error());
        assert!(buf.as_slice().iter().all(|&b| b == 0xab));
    }

    #[test]
    fn reads_past_capacity_are_rejected() {
        let mut dev = MemDevice::new(512, 16);
        dev.create_queue(1, 16, None).unwrap();
        let buf = DmaBuf::alloc(1024, PatternType::Zero, 0).unwrap();
        dev.submit(1, &io_cmd(opcode::nvm::READ, 1, 15, 2), Some(buf.dma_ref()))
            .unwrap();
        assert_eq!(poll_one(&mut dev, 1).status(), Status::LBA_OUT_OF_RANGE);
    }

    #[test]
    fn queue_depth_is_enforced() {
        let mut dev = MemDevice::new(512, 16);
        dev.create_queue(1, 2, None).unwrap();
        let cmd = CmdImage::new(opcode::nvm::FLUSH, 1);
        dev.submit(1, &cmd, None).unwrap();
        dev.submit(1, &cmd, None).unwrap();
        assert!(matches!(
            dev.submit(1, &cmd, None),
            Err(TransportError::QueueFull(1))
        ));
    }

    #[test]
    fn compare_mismatch_fails_with_media_error() {
        let mut dev = MemDevice::new(512, 16);
        dev.create_queue(1, 16, None).unwrap();
        let buf = DmaBuf::alloc(512, PatternType::Zero, 1).unwrap(); // all-ones
        dev.submit(1, &io_cmd(opcode::nvm::COMPARE, 1, 0, 1), Some(buf.dma_ref()))
            .unwrap();
        assert_eq!(poll_one(&mut dev, 1).status(), Status::COMPARE_FAILURE);
    }

    #[test]
    fn dsm_deallocate_zero_fills_ranges() {
        let mut dev = MemDevice::new(512, 64);
        dev.create_queue(1, 16, None).unwrap();

        let mut data = DmaBuf::alloc(512, PatternType::Zero, 1).unwrap();
        dev.submit(1, &io_cmd(opcode::nvm::WRITE, 1, 8, 1), Some(data.dma_ref()))
            .unwrap();
        poll_one(&mut dev, 1);

        DsmRange {
            cattr: 0,
            nlb: 1,
            slba: 8,
        }
        .write_to(&mut data.as_mut_slice()[..16]);
        let mut cmd = CmdImage::new(opcode::nvm::DSM, 1);
        cmd.cdw10 = 0; // one range
        cmd.cdw11 = 0x4; // deallocate
        dev.submit(1, &cmd, Some(data.dma_ref())).unwrap();
        assert!(!poll_one(&mut dev, 1).is_error());
        assert!(dev.storage(1)[8 * 512..9 * 512].iter().all(|&b| b == 0));
    }

    #[test]
    fn format_clears_namespace() {
        let mut dev = MemDevice::new(512, 16);
        dev.create_queue(1, 16, None).unwrap();
        let buf = DmaBuf::alloc(512, PatternType::Zero, 1).unwrap();
        dev.submit(1, &io_cmd(opcode::nvm::WRITE, 1, 0, 1), Some(buf.dma_ref()))
            .unwrap();
        poll_one(&mut dev, 1);

        let fmt = CmdImage::new(opcode::admin::FORMAT_NVM, 1);
        dev.submit(0, &fmt, None).unwrap();
        assert!(!poll_one(&mut dev, 0).is_error());
        assert!(dev.storage(1).iter().all(|&b| b == 0));
    }

    #[test]
    fn corruption_hook_flips_stored_bytes() {
        let mut dev = MemDevice::new(512, 16);
        dev.corrupt(1, 2, 10, 0xff);
        assert_eq!(dev.storage(1)[2 * 512 + 10], 0xff);
    }
}
