//! Controller, queue pairs, namespaces.
//!
//! One [`Controller`] wraps one transport. Every submission funnels
//! through the per-queue hooks: LBA-lock acquisition (conflicts park the
//! request on a retry queue), command-log capture, then the transport.
//! Completions run the inverse: log stamping, integrity update or
//! verification, lock release, caller callback. All of it on the caller's
//! thread; progress happens only inside [`Controller::process_completions`].

use std::collections::{HashMap, VecDeque};

use nvr_integrity::IntegrityTable;
use nvr_proto::{opcode, CmdImage, CplImage, DsmRange, IoFlags, NvmOp};
use nvr_shm::Registry;
use nvr_time::{Clock, ClockRef};
use tracing::{debug, info, warn};

use crate::cmdlog::{CmdLog, EntryData, LogAttach};
use crate::dma::{stamp_write_blocks, DmaRef};
use crate::driver::{ConfigWord, Driver, DriverConfig, IoToken, ProcessRole};
use crate::intc::{IntcBlock, IntcRef};
use crate::transport::{NamespaceInfo, Transport, TransportError, TransportId};

#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("queue {0} does not exist")]
    InvalidQueue(u16),
    #[error("queue {0} is full")]
    QueueFull(u16),
    #[error("namespace {0} unknown")]
    UnknownNamespace(u32),
    #[error("buffer too small: need {need}, got {got}")]
    BufferTooSmall { need: usize, got: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type CmdCallback = Box<dyn FnOnce(&CplImage)>;

struct Request {
    cmd: CmdImage,
    data: Option<DmaRef>,
    cb: Option<CmdCallback>,
    attach: LogAttach,
    /// LBA ranges locked at submission, released exactly once at
    /// completion.
    locks: Vec<(u64, u64)>,
}

pub struct QueuePair {
    qid: u16,
    depth: u32,
    cmdlog: CmdLog,
    inflight: HashMap<u16, Request>,
    /// Commands rejected by the LBA locker, retried one per sweep.
    queued: VecDeque<Request>,
    next_cid: u16,
    intr_vector: Option<u16>,
}

impl QueuePair {
    fn cid_in_use(&self, cid: u16) -> bool {
        self.inflight.contains_key(&cid) || self.queued.iter().any(|r| r.cmd.cid() == cid)
    }

    fn assign_cid(&mut self, cmd: &mut CmdImage) {
        while self.cid_in_use(self.next_cid) {
            self.next_cid = self.next_cid.wrapping_add(1);
        }
        cmd.set_cid(self.next_cid);
        self.next_cid = self.next_cid.wrapping_add(1);
    }
}

pub struct Namespace {
    info: NamespaceInfo,
    table: Option<IntegrityTable>,
}

impl Namespace {
    pub fn nsid(&self) -> u32 {
        self.info.nsid
    }

    pub fn sector_size(&self) -> u32 {
        self.info.sector_size
    }

    pub fn num_sectors(&self) -> u64 {
        self.info.nsectors
    }

    pub fn eui64(&self) -> u64 {
        self.info.eui64
    }

    pub fn table(&self) -> Option<&IntegrityTable> {
        self.table.as_ref()
    }

    /// Enable or disable inline read verification. Returns false when no
    /// table memory was ever allocated (verification impossible).
    pub fn verify_enable(&self, enable: bool) -> bool {
        match &self.table {
            Some(t) => {
                t.set_enabled(enable);
                true
            }
            None => false,
        }
    }
}

fn crc_table_name(traddr: &str, nsid: u32, eui64: u64) -> String {
    format!("ns_crc32_table_{traddr}_{nsid}_{eui64:x}")
}

fn cmdlog_name(traddr: &str, qid: u16, pid: u32, subnqn: &str) -> String {
    format!("cmdlog_table_{traddr}_{qid}_{pid}_{subnqn}")
}

pub struct Controller<T: Transport> {
    id: TransportId,
    transport: T,
    role: ProcessRole,
    registry: Registry,
    clock: ClockRef,
    config: ConfigWord,
    token: IoToken,
    pid: u32,
    queues: HashMap<u16, QueuePair>,
    namespaces: HashMap<u32, Namespace>,
    intc: Option<IntcRef>,
}

impl<T: Transport> Controller<T> {
    /// Attach to a device. The admin queue pair (id 0) and its command log
    /// come up immediately; namespaces are enumerated but their integrity
    /// tables wait for [`Controller::ns_init`].
    pub fn attach(id: TransportId, transport: T, driver: &Driver) -> Result<Self, CmdError> {
        let mut ctrlr = Controller {
            intc: None,
            role: driver.role(),
            registry: driver.registry().clone(),
            clock: driver.clock(),
            config: driver.config(),
            token: driver.token(),
            pid: driver.process_tag(),
            queues: HashMap::new(),
            namespaces: HashMap::new(),
            id,
            transport,
        };

        if ctrlr.id.is_pcie() {
            let intc = if ctrlr.role.is_primary() {
                IntcBlock::create(&ctrlr.registry, ctrlr.id.traddr())
            } else {
                IntcBlock::attach(&ctrlr.registry, ctrlr.id.traddr())
            };
            match intc {
                Ok(b) => ctrlr.intc = Some(b),
                Err(e) => warn!(error = %e, "no interrupt-control block"),
            }
        }

        ctrlr.add_queue(0, 32, None)?;

        for nsid in 1..=ctrlr.transport.num_namespaces() {
            if let Some(info) = ctrlr.transport.namespace_info(nsid) {
                ctrlr.namespaces.insert(nsid, Namespace { info, table: None });
            }
        }

        info!(traddr = ctrlr.id.traddr(), "controller attached");
        Ok(ctrlr)
    }

    fn add_queue(&mut self, qid: u16, depth: u32, intr_vector: Option<u16>) -> Result<(), CmdError> {
        if qid != 0 {
            self.transport.create_queue(qid, depth, intr_vector)?;
        }
        let name = cmdlog_name(self.id.traddr(), qid, self.pid, self.id.subnqn());
        let cmdlog = CmdLog::create(&self.registry, &name)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        if let Some(vec) = intr_vector {
            cmdlog.set_intr(vec, true);
        }
        self.queues.insert(
            qid,
            QueuePair {
                qid,
                depth,
                cmdlog,
                inflight: HashMap::new(),
                queued: VecDeque::new(),
                next_cid: 0,
                intr_vector,
            },
        );
        Ok(())
    }

    /// Create an I/O queue pair; returns its id.
    pub fn create_io_qpair(
        &mut self,
        depth: u32,
        intr_vector: Option<u16>,
    ) -> Result<u16, CmdError> {
        let qid = (1..u16::MAX)
            .find(|q| !self.queues.contains_key(q))
            .expect("queue ids exhausted");
        self.add_queue(qid, depth, intr_vector)?;
        debug!(qid, depth, "io qpair created");
        Ok(qid)
    }

    pub fn free_qpair(&mut self, qid: u16) -> Result<(), CmdError> {
        if qid == 0 {
            return Err(CmdError::InvalidQueue(0));
        }
        self.queues
            .remove(&qid)
            .ok_or(CmdError::InvalidQueue(qid))?;
        self.transport.destroy_queue(qid)?;
        Ok(())
    }

    pub fn qpair_depth(&self, qid: u16) -> Option<u32> {
        self.queues.get(&qid).map(|q| q.depth)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn ns(&self, nsid: u32) -> Option<&Namespace> {
        self.namespaces.get(&nsid)
    }

    pub fn num_namespaces(&self) -> u32 {
        self.transport.num_namespaces()
    }

    pub fn max_transfer_size(&self) -> usize {
        self.transport.max_transfer_size()
    }

    pub fn read_reg32(&self, offset: u32) -> Result<u32, CmdError> {
        Ok(self.transport.read_reg32(offset)?)
    }

    pub fn write_reg32(&mut self, offset: u32, value: u32) -> Result<(), CmdError> {
        Ok(self.transport.write_reg32(offset, value)?)
    }

    pub fn read_reg64(&self, offset: u32) -> Result<u64, CmdError> {
        Ok(self.transport.read_reg64(offset)?)
    }

    /// Set up integrity tracking for a namespace. `nlba_verify` bounds the
    /// verified prefix (0 = whole namespace). Table allocation failure is
    /// not fatal: the namespace stays usable with verification disabled.
    pub fn ns_init(&mut self, nsid: u32, nlba_verify: u64) -> Result<&Namespace, CmdError> {
        let ns = self
            .namespaces
            .get_mut(&nsid)
            .ok_or(CmdError::UnknownNamespace(nsid))?;

        let mut nlba = ns.info.nsectors;
        if nlba_verify > 0 {
            nlba = nlba.min(nlba_verify);
        }

        let name = crc_table_name(self.id.traddr(), nsid, ns.info.eui64);
        let table = if self.role.is_primary() {
            IntegrityTable::create(&self.registry, &name, nlba)
        } else {
            IntegrityTable::attach(&self.registry, &name)
        };
        ns.table = match table {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(nsid, error = %e, "no integrity table; data verification disabled");
                None
            }
        };
        Ok(ns)
    }

    /// Re-read namespace geometry after a format and reinitialize the
    /// table, preserving the verify-enabled flag.
    pub fn ns_refresh(&mut self, nsid: u32) -> Result<(), CmdError> {
        let info = self
            .transport
            .namespace_info(nsid)
            .ok_or(CmdError::UnknownNamespace(nsid))?;
        let ns = self
            .namespaces
            .get_mut(&nsid)
            .ok_or(CmdError::UnknownNamespace(nsid))?;
        ns.info = info;
        if let Some(table) = &ns.table {
            table.reset();
        }
        Ok(())
    }

    /// Clear every lock bit of every namespace (recovery after a script
    /// abandons in-flight commands).
    pub fn unlock_all(&self) {
        for ns in self.namespaces.values() {
            if let Some(table) = &ns.table {
                table.unlock_all();
            }
        }
    }

    // -- submission ------------------------------------------------------

    /// Submit a raw command. The cid field is assigned here; everything
    /// else is the caller's. `data` must stay valid until the completion
    /// callback has run.
    pub fn submit_raw(
        &mut self,
        qid: u16,
        mut cmd: CmdImage,
        data: Option<DmaRef>,
        cb: Option<CmdCallback>,
    ) -> Result<(), CmdError> {
        let qp = self
            .queues
            .get_mut(&qid)
            .ok_or(CmdError::InvalidQueue(qid))?;
        if qp.inflight.len() + qp.queued.len() >= qp.depth as usize {
            return Err(CmdError::QueueFull(qid));
        }
        qp.assign_cid(&mut cmd);
        let req = Request {
            cmd,
            data,
            cb,
            attach: LogAttach::None,
            locks: Vec::new(),
        };
        self.submit_req(qid, req)
    }

    /// Admin-queue convenience.
    pub fn submit_admin(
        &mut self,
        cmd: CmdImage,
        data: Option<DmaRef>,
        cb: Option<CmdCallback>,
    ) -> Result<(), CmdError> {
        self.submit_raw(0, cmd, data, cb)
    }

    /// Format and submit one NVM command the way scripts do: slba/count in
    /// CDW10..12, trims rewritten to a single-range DSM, write payloads
    /// stamped with lba and token.
    pub fn submit_io(
        &mut self,
        qid: u16,
        nsid: u32,
        opc: u8,
        buf: DmaRef,
        lba: u64,
        lba_count: u32,
        io_flags: IoFlags,
        cb: Option<CmdCallback>,
    ) -> Result<(), CmdError> {
        let ns = self
            .namespaces
            .get(&nsid)
            .ok_or(CmdError::UnknownNamespace(nsid))?;
        let sector = ns.info.sector_size as usize;
        let bytes = lba_count as usize * sector;

        let mut cmd = CmdImage::new(opc, nsid);
        cmd.set_slba(lba);

        let mut flags = io_flags;
        let cfg = self.config.get();
        if opc == opcode::nvm::READ && cfg.contains(DriverConfig::FUA_READ) {
            flags |= IoFlags::FUA;
        }
        if opc == opcode::nvm::WRITE && cfg.contains(DriverConfig::FUA_WRITE) {
            flags |= IoFlags::FUA;
        }
        cmd.cdw12 = flags.bits() | (lba_count - 1);

        // Transfer direction lives in the opcode's low bits; opcodes with
        // neither direction carry no data.
        let data = if opc & 0x3 == 0 {
            None
        } else {
            if buf.len() < bytes && opc != opcode::nvm::DSM {
                return Err(CmdError::BufferTooSmall {
                    need: bytes,
                    got: buf.len(),
                });
            }
            Some(buf.truncated(bytes))
        };

        let data = if opc == opcode::nvm::DSM {
            if buf.len() < 16 {
                return Err(CmdError::BufferTooSmall {
                    need: 16,
                    got: buf.len(),
                });
            }
            // Single-range trim: the range list replaces the data payload.
            DsmRange {
                cattr: 0,
                nlb: lba_count,
                slba: lba,
            }
            .write_to(unsafe { &mut buf.as_mut_slice()[..16] });
            cmd.cdw10 = 0; // one range
            cmd.cdw11 = 0x4; // deallocate
            cmd.cdw12 = 0;
            Some(buf.truncated(sector))
        } else {
            data
        };

        if opc == opcode::nvm::WRITE {
            let token = self.token.advance(lba_count);
            stamp_write_blocks(
                unsafe { &mut buf.as_mut_slice()[..bytes] },
                lba,
                lba_count,
                sector,
                token,
            );
        }

        self.submit_raw(qid, cmd, data, cb)
    }

    /// The submission-side hook chain. Also the retry path for
    /// LBA-conflicted commands.
    fn submit_req(&mut self, qid: u16, mut req: Request) -> Result<(), CmdError> {
        let now = self.clock.now_us();
        let qp = self
            .queues
            .get_mut(&qid)
            .ok_or(CmdError::InvalidQueue(qid))?;

        // 1. Per-LBA locks (I/O queues only; flush and friends bypass).
        if qid != 0 {
            if let Some(table) = self
                .namespaces
                .get(&req.cmd.nsid)
                .and_then(|ns| ns.table.as_ref())
            {
                let op = req.cmd.nvm_op();
                if op.needs_lba_locks() {
                    let ranges = lock_ranges_of(op, req.data.as_ref());
                    if !table.try_lock_ranges(&ranges) {
                        debug!(qid, cid = req.cmd.cid(), "lba conflict, queued for retry");
                        qp.queued.push_back(req);
                        return Ok(());
                    }
                    req.locks = ranges;
                }
            }
        }

        // 2. Command log, detaching a still-in-flight prior occupant.
        let (attach, detached) = qp.cmdlog.on_submit(&req.cmd, now);
        req.attach = attach;
        if let Some(prior) = detached {
            if let Some(old) = qp.inflight.get_mut(&prior.cid) {
                if matches!(old.attach, LogAttach::Slot { epoch, .. } if epoch == prior.epoch) {
                    old.attach = LogAttach::Owned(prior.entry);
                }
            }
        }

        // 3. Hand to the device.
        if let Err(e) = self.transport.submit(qid, &req.cmd, req.data) {
            qp.cmdlog.forget(&req.attach);
            if !req.locks.is_empty() {
                if let Some(table) = self
                    .namespaces
                    .get(&req.cmd.nsid)
                    .and_then(|ns| ns.table.as_ref())
                {
                    table.unlock_ranges(&req.locks);
                }
            }
            return Err(e.into());
        }

        qp.inflight.insert(req.cmd.cid(), req);
        Ok(())
    }

    // -- completion ------------------------------------------------------

    /// Poll the transport for up to `max` completions (0 = all available),
    /// run the completion hooks, then retry at most one LBA-queued
    /// command. Returns the number of completions processed.
    pub fn process_completions(&mut self, qid: u16, max: u32) -> Result<u32, CmdError> {
        let mut cpls = Vec::new();
        self.transport.poll(qid, max, &mut |cpl| cpls.push(cpl))?;
        let reaped = cpls.len() as u32;
        for cpl in cpls {
            self.complete_one(qid, cpl);
        }

        if let Some(req) = self
            .queues
            .get_mut(&qid)
            .and_then(|qp| qp.queued.pop_front())
        {
            self.submit_req(qid, req)?;
        }
        Ok(reaped)
    }

    fn complete_one(&mut self, qid: u16, mut cpl: CplImage) {
        let now = self.clock.now_us();
        let Some(qp) = self.queues.get_mut(&qid) else {
            return;
        };
        let Some(mut req) = qp.inflight.remove(&cpl.cid) else {
            // Not tracked (e.g. aborted before logging); nothing to do.
            return;
        };

        qp.cmdlog.on_complete(&mut req.attach, &cpl, now);

        // Integrity bookkeeping runs for successful commands, and for
        // write-uncorrectable regardless: the device marks the blocks bad
        // even when it reports an error-like status.
        let success_like =
            !cpl.status().is_error() || (qid != 0 && req.cmd.opc() == opcode::nvm::WRITE_UNCORR);
        if success_like {
            if qid == 0 {
                self.admin_integrity_update(&req.cmd);
            } else {
                self.io_integrity_update(&req.cmd, req.data.as_ref(), &mut cpl);
            }
        }

        if !req.locks.is_empty() {
            if let Some(table) = self
                .namespaces
                .get(&req.cmd.nsid)
                .and_then(|ns| ns.table.as_ref())
            {
                table.unlock_ranges(&req.locks);
            }
        }

        if let Some(cb) = req.cb.take() {
            cb(&cpl);
        }
    }

    fn admin_integrity_update(&self, cmd: &CmdImage) {
        match cmd.opc() {
            // Format: the table is rebuilt in ns_refresh because the LBA
            // format may have changed.
            opcode::admin::FORMAT_NVM => {}
            opcode::admin::SANITIZE => {
                for ns in self.namespaces.values() {
                    if let Some(table) = &ns.table {
                        table.reset();
                    }
                }
            }
            _ => {}
        }
    }

    fn io_integrity_update(&self, cmd: &CmdImage, data: Option<&DmaRef>, cpl: &mut CplImage) {
        let Some(ns) = self.namespaces.get(&cmd.nsid) else {
            return;
        };
        let Some(table) = &ns.table else {
            return;
        };
        let sector = ns.info.sector_size as usize;

        match cmd.nvm_op() {
            NvmOp::Write { slba, nlb } => {
                if let Some(buf) = data {
                    table.record_write(unsafe { buf.as_slice() }, slba, nlb, sector);
                }
            }
            NvmOp::WriteUncorr { slba, nlb } => table.clear_range(slba, nlb as u64, true),
            NvmOp::WriteZeroes { slba, nlb } => table.clear_range(slba, nlb as u64, false),
            NvmOp::Deallocate { nr } => {
                if let Some(buf) = data {
                    for r in DsmRange::parse(unsafe { buf.as_slice() }, nr) {
                        table.clear_range(r.slba, r.nlb as u64, false);
                    }
                }
            }
            NvmOp::Read { slba, nlb } => {
                if self.config.get().contains(DriverConfig::VERIFY_READ) {
                    if let Some(buf) = data {
                        if let Err(failure) =
                            table.verify_read(unsafe { buf.as_slice() }, slba, nlb, sector)
                        {
                            warn!(%failure, original = ?cpl, "read verification failed");
                            cpl.set_status(nvr_proto::Status::VERIFY_FAILED);
                        }
                    }
                }
            }
            NvmOp::Compare { .. } | NvmOp::Flush | NvmOp::Other(_) => {}
        }
    }

    // -- introspection ---------------------------------------------------

    pub fn latest_cid(&self, qid: u16) -> Option<u16> {
        self.queues.get(&qid).map(|q| q.cmdlog.latest_cid())
    }

    pub fn latest_latency_us(&self, qid: u16) -> Option<u32> {
        self.queues.get(&qid).map(|q| q.cmdlog.latest_latency_us())
    }

    pub fn cmdlog_dump(&self, qid: u16, max: usize) -> Vec<(u32, EntryData)> {
        self.queues
            .get(&qid)
            .map(|q| q.cmdlog.dump(max))
            .unwrap_or_default()
    }

    pub fn outstanding(&self, qid: u16) -> usize {
        self.queues
            .get(&qid)
            .map(|q| q.inflight.len() + q.queued.len())
            .unwrap_or(0)
    }

    // -- interrupts ------------------------------------------------------

    fn qpair_vector(&self, qid: u16) -> Option<(IntcRef, u16)> {
        let vec = self.queues.get(&qid)?.intr_vector?;
        Some((self.intc.clone()?, vec))
    }

    pub fn intc_isset(&self, qid: u16) -> bool {
        self.qpair_vector(qid)
            .map(|(intc, vec)| intc.is_set(vec))
            .unwrap_or(false)
    }

    pub fn intc_clear(&self, qid: u16) {
        if let Some((intc, vec)) = self.qpair_vector(qid) {
            intc.clear(vec);
        }
    }

    pub fn intc_mask(&self, qid: u16) {
        if let Some((intc, vec)) = self.qpair_vector(qid) {
            intc.mask(vec);
        }
    }

    pub fn intc_unmask(&self, qid: u16) {
        if let Some((intc, vec)) = self.qpair_vector(qid) {
            intc.unmask(vec);
        }
    }

    pub fn intc(&self) -> Option<IntcRef> {
        self.intc.clone()
    }
}

/// The LBA ranges a command must hold locks over. DSM reads its range list
/// out of the payload; everything else is the contiguous CDW10..12 range.
fn lock_ranges_of(op: NvmOp, data: Option<&DmaRef>) -> Vec<(u64, u64)> {
    let mut ranges = match op {
        NvmOp::Deallocate { nr } => match data {
            Some(buf) if buf.len() >= nr as usize * 16 => {
                DsmRange::parse(unsafe { buf.as_slice() }, nr)
                    .into_iter()
                    .map(|r| (r.slba, r.nlb as u64))
                    .collect()
            }
            _ => Vec::new(),
        },
        _ => op
            .lba_range()
            .map(|(slba, nlb)| vec![(slba, nlb as u64)])
            .unwrap_or_default(),
    };
    ranges.retain(|&(_, n)| n > 0);
    // Acquisition is ordered by LBA so concurrent lockers converge.
    ranges.sort_unstable_by_key(|&(s, _)| s);
    ranges
}
