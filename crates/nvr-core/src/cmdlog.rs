//! Per-queue command log.
//!
//! A fixed-depth ring in shared memory captures every command submitted on
//! a queue: the 64-byte command image, the submission timestamp, and (once
//! the command completes) the completion image and measured latency. The
//! ring wraps; a slot can be reused while its previous occupant is still
//! in flight, in which case the old contents are *detached* into an owned
//! entry carried by the prior request so its completion still runs exactly
//! once against the original image.
//!
//! Slots are addressed by `(index, epoch)`: every submission gets a fresh
//! epoch, and a completion whose epoch no longer matches the slot knows it
//! was displaced. No pointers cross the shared region.

use nvr_proto::{CmdImage, CplImage};
use nvr_shm::{Region, Registry, ShmError};
use std::sync::atomic::Ordering;
use tracing::debug;

pub const CMD_LOG_DEPTH: usize = 2048;

const ENTRY_SIZE: usize = 128;
const E_CMD: usize = 0;
const E_TIME: usize = 64;
const E_CPL: usize = 72;
const E_LATENCY: usize = 88;

const HDR: usize = CMD_LOG_DEPTH * ENTRY_SIZE;
const H_HEAD: usize = HDR;
const H_TAIL: usize = HDR + 4;
const H_LATEST_LATENCY: usize = HDR + 8;
const H_CID_VEC: usize = HDR + 12; // latest_cid u16 | intr_vec u16
const H_INTR_ENABLED: usize = HDR + 16;
const REGION_SIZE: usize = HDR + 64; // header padded to a cacheline

/// Snapshot of one log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryData {
    pub cmd: CmdImage,
    pub time_submit_us: u64,
    pub cpl: CplImage,
    /// 0 while the command is in flight.
    pub latency_us: u32,
}

/// How an in-flight request is attached to the log.
#[derive(Debug, Default)]
pub enum LogAttach {
    /// Not tracked (submission failed before logging).
    #[default]
    None,
    /// Lives in ring slot `index`, valid while the slot's epoch matches.
    Slot { index: u32, epoch: u64 },
    /// Displaced from the ring by a later submission; the entry moved out
    /// of the slot into this owned copy.
    Owned(Box<EntryData>),
}

/// The prior occupant of a reused slot, to be re-attached to its request.
#[derive(Debug)]
pub struct DetachedPrior {
    pub cid: u16,
    pub epoch: u64,
    pub entry: Box<EntryData>,
}

#[derive(Debug, Clone, Copy)]
struct Occupant {
    cid: u16,
    epoch: u64,
}

pub struct CmdLog {
    region: Region,
    // Process-local: which slots hold a still-in-flight command.
    occupants: Vec<Option<Occupant>>,
    next_epoch: u64,
}

impl CmdLog {
    pub fn create(registry: &Registry, name: &str) -> Result<CmdLog, ShmError> {
        let region = registry.create(name, REGION_SIZE)?;
        Ok(CmdLog {
            region,
            occupants: vec![None; CMD_LOG_DEPTH],
            next_epoch: 1,
        })
    }

    /// Read-only attachment for introspection from another process. The
    /// producer keeps running; torn entries are acceptable in dumps.
    pub fn attach(registry: &Registry, name: &str) -> Result<CmdLog, ShmError> {
        let region = registry.lookup_sized(name, REGION_SIZE)?;
        Ok(CmdLog {
            region,
            occupants: vec![None; CMD_LOG_DEPTH],
            next_epoch: 1,
        })
    }

    fn entry_base(&self, index: usize) -> *mut u8 {
        debug_assert!(index < CMD_LOG_DEPTH);
        unsafe { self.region.as_ptr().add(index * ENTRY_SIZE) }
    }

    fn read_entry(&self, index: usize) -> EntryData {
        let base = self.entry_base(index);
        unsafe {
            let mut cmd = [0u8; 64];
            std::ptr::copy_nonoverlapping(base.add(E_CMD), cmd.as_mut_ptr(), 64);
            let mut cpl = [0u8; 16];
            std::ptr::copy_nonoverlapping(base.add(E_CPL), cpl.as_mut_ptr(), 16);
            EntryData {
                cmd: CmdImage::from_bytes(&cmd),
                time_submit_us: (base.add(E_TIME) as *const u64).read(),
                cpl: std::ptr::read_unaligned(cpl.as_ptr() as *const CplImage),
                latency_us: (base.add(E_LATENCY) as *const u32).read(),
            }
        }
    }

    fn write_submit(&self, index: usize, cmd: &CmdImage, now_us: u64) {
        let base = self.entry_base(index);
        unsafe {
            std::ptr::copy_nonoverlapping(cmd.as_bytes().as_ptr(), base.add(E_CMD), 64);
            (base.add(E_TIME) as *mut u64).write(now_us);
            std::ptr::write_bytes(base.add(E_CPL), 0, 16);
            (base.add(E_LATENCY) as *mut u32).write(0);
        }
    }

    fn write_completion(&self, index: usize, cpl: &CplImage, latency_us: u32) {
        let base = self.entry_base(index);
        unsafe {
            std::ptr::copy_nonoverlapping(cpl.as_bytes().as_ptr(), base.add(E_CPL), 16);
            (base.add(E_LATENCY) as *mut u32).write(latency_us);
        }
    }

    pub fn head(&self) -> u32 {
        self.region.atomic_u32(H_HEAD).load(Ordering::Relaxed)
    }

    pub fn tail(&self) -> u32 {
        self.region.atomic_u32(H_TAIL).load(Ordering::Relaxed)
    }

    pub fn latest_latency_us(&self) -> u32 {
        self.region
            .atomic_u32(H_LATEST_LATENCY)
            .load(Ordering::Relaxed)
    }

    pub fn latest_cid(&self) -> u16 {
        (self.region.atomic_u32(H_CID_VEC).load(Ordering::Relaxed) & 0xffff) as u16
    }

    fn set_latest_cid(&self, cid: u16) {
        let w = self.region.atomic_u32(H_CID_VEC);
        let old = w.load(Ordering::Relaxed);
        w.store((old & 0xffff_0000) | cid as u32, Ordering::Relaxed);
    }

    pub fn intr_vec(&self) -> u16 {
        (self.region.atomic_u32(H_CID_VEC).load(Ordering::Relaxed) >> 16) as u16
    }

    pub fn intr_enabled(&self) -> bool {
        self.region.atomic_u32(H_INTR_ENABLED).load(Ordering::Relaxed) != 0
    }

    pub fn set_intr(&self, vec: u16, enabled: bool) {
        let w = self.region.atomic_u32(H_CID_VEC);
        let old = w.load(Ordering::Relaxed);
        w.store((old & 0xffff) | ((vec as u32) << 16), Ordering::Relaxed);
        self.region
            .atomic_u32(H_INTR_ENABLED)
            .store(enabled as u32, Ordering::Relaxed);
    }

    /// Submission hook. Records the command at the tail and returns the new
    /// attachment, plus the detached prior occupant when the slot was
    /// reused mid-flight.
    pub fn on_submit(
        &mut self,
        cmd: &CmdImage,
        now_us: u64,
    ) -> (LogAttach, Option<DetachedPrior>) {
        let tail = self.tail() as usize;

        let detached = self.occupants[tail].take().map(|occ| {
            debug!(slot = tail, cid = occ.cid, "cmdlog slot reused in flight, detaching");
            DetachedPrior {
                cid: occ.cid,
                epoch: occ.epoch,
                entry: Box::new(self.read_entry(tail)),
            }
        });

        self.write_submit(tail, cmd, now_us);
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.occupants[tail] = Some(Occupant {
            cid: cmd.cid(),
            epoch,
        });
        self.set_latest_cid(cmd.cid());

        let next_tail = ((tail + 1) % CMD_LOG_DEPTH) as u32;
        self.region
            .atomic_u32(H_TAIL)
            .store(next_tail, Ordering::Relaxed);
        // Oldest entry overwritten next: keep head one ahead of tail.
        if next_tail == self.head() {
            self.region
                .atomic_u32(H_HEAD)
                .store((next_tail + 1) % CMD_LOG_DEPTH as u32, Ordering::Relaxed);
        }

        (
            LogAttach::Slot {
                index: tail as u32,
                epoch,
            },
            detached,
        )
    }

    /// Completion hook. Stamps latency and the completion image into
    /// whichever entry the request is attached to. Returns the measured
    /// latency, or `None` for untracked requests.
    pub fn on_complete(
        &mut self,
        attach: &mut LogAttach,
        cpl: &CplImage,
        now_us: u64,
    ) -> Option<u32> {
        let latency = |submit_us: u64| now_us.saturating_sub(submit_us).min(u32::MAX as u64) as u32;

        match std::mem::take(attach) {
            LogAttach::None => None,
            LogAttach::Slot { index, epoch } => {
                let i = index as usize;
                match self.occupants[i] {
                    Some(occ) if occ.epoch == epoch => {
                        let lat = latency(self.read_entry(i).time_submit_us);
                        self.write_completion(i, cpl, lat);
                        self.occupants[i] = None;
                        self.set_latest_latency(lat);
                        Some(lat)
                    }
                    // Displaced by a later submission: the slot no longer
                    // describes this command. Ignore.
                    _ => {
                        tracing::warn!(index, epoch, "stale cmdlog attachment ignored");
                        None
                    }
                }
            }
            LogAttach::Owned(entry) => {
                let lat = latency(entry.time_submit_us);
                self.set_latest_latency(lat);
                Some(lat)
            }
        }
    }

    /// Abandon an attachment whose command never reached the device.
    /// The recorded entry stays (latency 0); the slot is free to reuse.
    pub fn forget(&mut self, attach: &LogAttach) {
        if let LogAttach::Slot { index, epoch } = attach {
            let i = *index as usize;
            if matches!(self.occupants[i], Some(occ) if occ.epoch == *epoch) {
                self.occupants[i] = None;
            }
        }
    }

    fn set_latest_latency(&self, latency_us: u32) {
        self.region
            .atomic_u32(H_LATEST_LATENCY)
            .store(latency_us, Ordering::Relaxed);
    }

    /// Snapshot one slot (diagnostics, tests).
    pub fn entry(&self, index: u32) -> EntryData {
        self.read_entry(index as usize % CMD_LOG_DEPTH)
    }

    /// Walk backwards from the tail over at most `max` recorded entries.
    /// Purely read-only; runs without synchronising against the producer.
    pub fn dump(&self, max: usize) -> Vec<(u32, EntryData)> {
        let max = if max == 0 || max > CMD_LOG_DEPTH {
            CMD_LOG_DEPTH
        } else {
            max
        };
        let head = self.head() as usize;
        let tail = self.tail() as usize;
        // The submit hook keeps head one ahead of tail once the ring has
        // wrapped, so head == tail only when nothing was ever recorded.
        let recorded = (tail + CMD_LOG_DEPTH - head) % CMD_LOG_DEPTH;

        let mut out = Vec::with_capacity(max.min(recorded));
        let mut index = tail;
        for _ in 0..max.min(recorded) {
            index = (index + CMD_LOG_DEPTH - 1) % CMD_LOG_DEPTH;
            out.push((index as u32, self.read_entry(index)));
        }
        out
    }
}

impl std::fmt::Debug for CmdLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdLog")
            .field("region", &self.region.name())
            .field("head", &self.head())
            .field("tail", &self.tail())
            .finish()
    }
}
