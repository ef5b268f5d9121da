//! Self-pacing workload generator.
//!
//! One worker drives one queue pair against one namespace from a single
//! thread: a busy dispatch loop submits pending I/Os whose due time has
//! arrived, polls the transport for completions, and lets the completion
//! callbacks refill the pending list. Mixed op/size/region workloads come
//! from lookup tables built at start; pacing (IOPS throttle or trace
//! replay) is a per-slot due time.

mod tables;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use nvr_core::{
    CmdError, Controller, DmaBuf, DmaError, Driver, DriverConfig, PatternType, Transport,
    CMD_LOG_DEPTH,
};
use nvr_proto::{opcode, CplImage, IoFlags};
use nvr_time::{elapsed_ms_ceil, Clock, ClockRef, US_PER_S};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use tables::{align_down, align_up, Section};

/// Largest duration a worker will run: 1000 hours.
pub const MAX_SECONDS: u32 = 1000 * 3600;
/// Latency histogram resolution: one bucket per microsecond up to 1 s.
pub const LATENCY_BUCKETS: usize = 1_000_000;

/// One entry of a replayed trace.
#[derive(Debug, Clone, Copy)]
pub struct IoSeqEntry {
    /// Offset from worker start at which to issue this I/O.
    pub timestamp_us: u64,
    pub op: u8,
    pub slba: u64,
    pub nlba: u32,
}

/// One record of the worker-side command trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdRecord {
    pub lba: u64,
    pub count: u32,
    pub opcode: u8,
}

#[derive(Debug, Clone)]
pub struct WorkerArgs {
    /// Starting LBA for sequential runs (defaults to `region_start`).
    pub lba_start: Option<u64>,
    /// Signed stride between sequential I/Os; defaults to the command's
    /// block count.
    pub lba_step: Option<i64>,
    pub region_start: u64,
    /// Exclusive region end; clamped to the namespace size.
    pub region_end: u64,
    /// Percentage of I/Os with a randomly chosen LBA (0..=100).
    pub lba_random: u32,
    /// Opcodes with matching percentage weights summing to 100.
    pub op_list: Vec<u8>,
    pub op_weights: Vec<u32>,
    /// Parallel arrays: block counts, slot ratios (sum <= 10000), LBA
    /// alignments (powers of two).
    pub lba_size_list: Vec<u32>,
    pub lba_size_ratios: Vec<u32>,
    pub lba_size_aligns: Vec<u32>,
    /// Empty, or 100 section weights summing to 10000.
    pub distribution: Vec<u32>,
    /// Target IOPS; 0 = unthrottled.
    pub iops: u32,
    /// Stop after this many I/Os; 0 = no count limit.
    pub io_count: u64,
    /// Stop after this many seconds; 0 or more than [`MAX_SECONDS`] caps
    /// at [`MAX_SECONDS`].
    pub seconds: u32,
    /// Outstanding commands (one slot is held back, so effective depth is
    /// `qdepth - 1`).
    pub qdepth: u32,
    pub ptype: PatternType,
    pub pvalue: u32,
    /// When non-empty, replaces the generator with exact replay.
    pub io_sequence: Vec<IoSeqEntry>,
    /// Size of the `cmdlog_list` output ring (0 = off).
    pub cmdlog_list_len: usize,
    pub collect_per_second: bool,
    pub collect_latency_histogram: bool,
}

impl Default for WorkerArgs {
    fn default() -> Self {
        WorkerArgs {
            lba_start: None,
            lba_step: None,
            region_start: 0,
            region_end: u64::MAX,
            lba_random: 100,
            op_list: vec![opcode::nvm::READ],
            op_weights: vec![100],
            lba_size_list: vec![8],
            lba_size_ratios: vec![1],
            lba_size_aligns: vec![8],
            distribution: Vec::new(),
            iops: 0,
            io_count: 0,
            seconds: 0,
            qdepth: 64,
            ptype: PatternType::Zero,
            pvalue: 0,
            io_sequence: Vec::new(),
            cmdlog_list_len: 0,
            collect_per_second: false,
            collect_latency_histogram: false,
        }
    }
}

impl WorkerArgs {
    /// The legacy read/write mix shorthand.
    pub fn with_read_percentage(mut self, read_percentage: u32) -> Self {
        self.op_list = vec![opcode::nvm::READ, opcode::nvm::WRITE];
        self.op_weights = vec![read_percentage, 100 - read_percentage];
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerRets {
    pub io_count_read: u64,
    pub io_count_nonread: u64,
    pub mseconds: u32,
    pub latency_max_us: u32,
    pub latency_average_us: u32,
    /// First NVMe error observed (`sct << 8 | sc`), 0 if none.
    pub error: u16,
    pub cpu_usage_ms: u32,
    /// Completions per wall-clock second (when collected).
    pub io_counter_per_second: Vec<u32>,
    /// Completions per microsecond of latency (when collected).
    pub io_counter_per_latency: Vec<u64>,
    /// Completions per `op_list` entry.
    pub op_counter: Vec<u64>,
    /// The last `cmdlog_list_len` I/Os, oldest first.
    pub cmdlog_list: Vec<CmdRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid worker configuration: {0}")]
    InvalidConfig(&'static str),
    /// The largest configured I/O exceeds the controller's max transfer
    /// size; carries NVMe status 0x0002 (invalid field).
    #[error("io size exceeds controller max transfer size")]
    TransferTooLarge { status: u16 },
    #[error("worker buffer pool allocation failed: {0}")]
    BufferAlloc(#[from] DmaError),
    /// The dispatch loop overran its deadline by 30 s; partial statistics
    /// are preserved.
    #[error("worker timed out")]
    Timeout(Box<WorkerRets>),
    #[error(transparent)]
    Cmd(#[from] CmdError),
}

/// Values fixed for the whole run.
struct Plan {
    start_us: u64,
    due_time_us: u64,
    delay_us: u64,
    io_count: u64,
    replay: Vec<IoSeqEntry>,
    cmdlog_list_len: usize,
    collect_per_second: bool,
    collect_latency_histogram: bool,
    clock: ClockRef,
}

/// Everything the dispatch loop and the completion callbacks share.
struct Shared {
    rets: WorkerRets,
    io_count_sent: u64,
    io_count_cplt: u64,
    flag_finish: bool,
    latency_total_us: u64,
    io_due_time_us: u64,
    time_next_sec_us: u64,
    io_count_till_last_sec: u64,
    last_sec: usize,
    pending: VecDeque<usize>,
    /// Pacing deadline while pending, actual submit time once sent.
    slot_time_sent: Vec<u64>,
    /// Replay entry assigned to each slot.
    slot_seq: Vec<usize>,
    replay_next: usize,
    cmdlog_cursor: usize,
}

impl Shared {
    fn check_finish(&self, plan: &Plan, now_us: u64) -> bool {
        if self.io_count_sent >= plan.io_count {
            return true;
        }
        now_us > plan.due_time_us
    }
}

/// Run one workload to completion. Progress is made entirely on this
/// thread; the function returns when the limits (count, time, sequence,
/// first error, or the global `IOW_TERM` flag) are reached.
pub fn ioworker_entry<T: Transport>(
    driver: &Driver,
    ctrlr: &mut Controller<T>,
    qid: u16,
    nsid: u32,
    args: &WorkerArgs,
) -> Result<WorkerRets, WorkerError> {
    let ns = ctrlr
        .ns(nsid)
        .ok_or(WorkerError::InvalidConfig("unknown namespace"))?;
    let sector_size = ns.sector_size() as usize;
    let nsze = ns.num_sectors();
    let clock = driver.clock();
    let config = driver.config();
    let mut rng = StdRng::seed_from_u64(driver.next_seed());

    // -- validate --------------------------------------------------------

    if args.lba_random > 100 {
        return Err(WorkerError::InvalidConfig("lba_random over 100"));
    }
    if args.region_start >= args.region_end {
        return Err(WorkerError::InvalidConfig("empty region"));
    }
    if args.qdepth < 2 || args.qdepth as usize > CMD_LOG_DEPTH / 2 {
        return Err(WorkerError::InvalidConfig("qdepth out of range"));
    }
    if let Some(depth) = ctrlr.qpair_depth(qid) {
        if args.qdepth > depth {
            return Err(WorkerError::InvalidConfig("qdepth exceeds queue depth"));
        }
    } else {
        return Err(WorkerError::InvalidConfig("unknown queue"));
    }
    if args.op_list.is_empty() || args.op_list.len() != args.op_weights.len() {
        return Err(WorkerError::InvalidConfig("op list/weight mismatch"));
    }
    if args.op_weights.iter().sum::<u32>() != 100 {
        return Err(WorkerError::InvalidConfig("op weights must sum to 100"));
    }
    if args.lba_size_list.is_empty()
        || args.lba_size_list.len() != args.lba_size_ratios.len()
        || args.lba_size_list.len() != args.lba_size_aligns.len()
    {
        return Err(WorkerError::InvalidConfig("size list shape mismatch"));
    }
    if args.lba_size_list.iter().any(|&s| s == 0) {
        return Err(WorkerError::InvalidConfig("zero io size"));
    }
    if args
        .lba_size_aligns
        .iter()
        .any(|&a| a == 0 || !a.is_power_of_two())
    {
        return Err(WorkerError::InvalidConfig("alignment not a power of two"));
    }
    let ratio_sum: u32 = args.lba_size_ratios.iter().sum();
    if ratio_sum == 0 || ratio_sum > 10_000 {
        return Err(WorkerError::InvalidConfig("size ratio sum out of range"));
    }
    if !args.distribution.is_empty() {
        if args.distribution.len() != 100 || args.distribution.iter().sum::<u32>() != 10_000 {
            return Err(WorkerError::InvalidConfig("distribution must be 100 weights summing to 10000"));
        }
    }

    let max_size = *args.lba_size_list.iter().max().unwrap() as u64;
    let max_align = *args.lba_size_aligns.iter().max().unwrap() as u64;
    let max_io_bytes = max_size as usize * sector_size;
    if max_io_bytes > ctrlr.max_transfer_size() {
        warn!(
            max_io_bytes,
            max_transfer = ctrlr.max_transfer_size(),
            "io size exceeds max transfer size"
        );
        return Err(WorkerError::TransferTooLarge { status: 0x0002 });
    }

    // -- revise ----------------------------------------------------------

    let replay = !args.io_sequence.is_empty();
    let mut io_count = if args.io_count == 0 {
        u64::MAX
    } else {
        args.io_count
    };
    if replay {
        io_count = io_count.min(args.io_sequence.len() as u64);
    }
    let seconds = match args.seconds {
        0 => MAX_SECONDS,
        s => s.min(MAX_SECONDS),
    };

    let region_start = align_up(args.region_start, max_align);
    let mut region_end = args.region_end.min(nsze);
    region_end = align_down(region_end, max_align);
    if region_start >= region_end {
        return Err(WorkerError::InvalidConfig("region collapsed by alignment"));
    }

    let mut qdepth = args.qdepth as u64;
    if io_count < qdepth {
        qdepth = io_count + 1;
    }
    // One slot is reserved; effective depth is qdepth - 1.
    let qdepth = (qdepth - 1) as usize;

    let sequential_start = args.lba_start.unwrap_or(region_start).max(region_start);

    debug!(
        region_start,
        region_end, qdepth, io_count, seconds, replay, "ioworker start"
    );

    // -- lookup tables ---------------------------------------------------

    let op_table = tables::build_op_table(&args.op_weights);
    let sl_table = tables::build_size_table(&args.lba_size_ratios);
    let dl_table = if args.distribution.is_empty() {
        Vec::new()
    } else {
        tables::build_distribution_table(&args.distribution, nsze, region_end)
    };

    // -- buffers: one pool, a read and a write half per slot -------------

    let pool = DmaBuf::alloc(2 * qdepth * max_io_bytes, args.ptype, args.pvalue)?;

    // -- shared state ----------------------------------------------------

    let start_us = clock.now_us();
    let delay_us = if args.iops > 0 {
        US_PER_S / args.iops as u64
    } else {
        0
    };

    let plan = Rc::new(Plan {
        start_us,
        due_time_us: start_us + seconds as u64 * US_PER_S,
        delay_us,
        io_count,
        replay: args.io_sequence.clone(),
        cmdlog_list_len: args.cmdlog_list_len,
        collect_per_second: args.collect_per_second,
        collect_latency_histogram: args.collect_latency_histogram,
        clock: clock.clone(),
    });

    let mut rets = WorkerRets {
        op_counter: vec![0; args.op_list.len()],
        ..Default::default()
    };
    if args.collect_per_second {
        rets.io_counter_per_second = vec![0; seconds as usize + 1];
    }
    if args.collect_latency_histogram {
        rets.io_counter_per_latency = vec![0; LATENCY_BUCKETS];
    }
    if args.cmdlog_list_len > 0 {
        rets.cmdlog_list = vec![
            CmdRecord {
                lba: 0,
                count: 0,
                opcode: 0
            };
            args.cmdlog_list_len
        ];
    }

    let shared = Rc::new(RefCell::new(Shared {
        rets,
        io_count_sent: 0,
        io_count_cplt: 0,
        flag_finish: false,
        latency_total_us: 0,
        io_due_time_us: start_us,
        time_next_sec_us: start_us + US_PER_S,
        io_count_till_last_sec: 0,
        last_sec: 0,
        pending: VecDeque::with_capacity(qdepth),
        slot_time_sent: vec![0; qdepth],
        slot_seq: vec![0; qdepth],
        replay_next: 0,
        cmdlog_cursor: 0,
    }));

    // Queue the first batch; every slot gets its own due time so the
    // throttle paces the very first I/Os too.
    {
        let mut s = shared.borrow_mut();
        for slot in 0..qdepth {
            let due = if replay {
                s.slot_seq[slot] = slot;
                start_us + plan.replay[slot].timestamp_us
            } else if delay_us > 0 {
                s.io_due_time_us += delay_us;
                s.io_due_time_us
            } else {
                start_us
            };
            s.slot_time_sent[slot] = due;
            s.pending.push_back(slot);
            s.io_count_sent += 1;
        }
        s.replay_next = qdepth;
    }

    // -- dispatch loop ---------------------------------------------------

    let mut sequential_lba = sequential_start;
    let mut cpu_time_us: u64 = 0;
    let watchdog_us = (seconds as u64 + 30) * US_PER_S;

    loop {
        let now = clock.now_us();

        // Submit the head of the pending list once it is due.
        let head = {
            let s = shared.borrow();
            s.pending
                .front()
                .copied()
                .filter(|&slot| s.slot_time_sent[slot] <= now)
        };
        if let Some(slot) = head {
            let _ = shared.borrow_mut().pending.pop_front();
            submit_one(
                ctrlr,
                qid,
                nsid,
                slot,
                &pool,
                max_io_bytes,
                args,
                &plan,
                &shared,
                &op_table,
                &sl_table,
                &dl_table,
                region_start,
                region_end,
                &mut sequential_lba,
                &mut rng,
            )?;
            cpu_time_us += clock.now_us().saturating_sub(now);
        }

        // Watchdog: well past the configured duration means the device
        // stopped completing; abandon with partial statistics.
        if now.saturating_sub(start_us) > watchdog_us {
            let mut s = shared.borrow_mut();
            warn!(
                sent = s.io_count_sent,
                cplt = s.io_count_cplt,
                "ioworker timeout"
            );
            finalize(&mut s, &plan, cpu_time_us, clock.now_us());
            return Err(WorkerError::Timeout(Box::new(std::mem::take(&mut s.rets))));
        }

        // External terminate request.
        if config.get().contains(DriverConfig::IOW_TERM) {
            info!("ioworker observed IOW_TERM");
            break;
        }

        // Reap completions; the callbacks refill the pending list. One
        // LBA-conflicted retry is resubmitted per sweep inside.
        let t0 = clock.now_us();
        let reaped = ctrlr.process_completions(qid, 0)?;
        if reaped > 0 {
            cpu_time_us += clock.now_us().saturating_sub(t0);
        }

        let s = shared.borrow();
        if s.io_count_sent == s.io_count_cplt && s.flag_finish && s.pending.is_empty() {
            break;
        }
    }

    let mut s = shared.borrow_mut();
    finalize(&mut s, &plan, cpu_time_us, clock.now_us());
    Ok(std::mem::take(&mut s.rets))
}

/// Select parameters for one I/O and hand it to the namespace layer.
#[allow(clippy::too_many_arguments)]
fn submit_one<T: Transport>(
    ctrlr: &mut Controller<T>,
    qid: u16,
    nsid: u32,
    slot: usize,
    pool: &DmaBuf,
    max_io_bytes: usize,
    args: &WorkerArgs,
    plan: &Rc<Plan>,
    shared: &Rc<RefCell<Shared>>,
    op_table: &[u32],
    sl_table: &[u32],
    dl_table: &[Section],
    region_start: u64,
    region_end: u64,
    sequential_lba: &mut u64,
    rng: &mut StdRng,
) -> Result<(), WorkerError> {
    let (opc, op_idx, lba, count) = if !plan.replay.is_empty() {
        let entry = plan.replay[shared.borrow().slot_seq[slot]];
        let op_idx = args.op_list.iter().position(|&o| o == entry.op);
        (entry.op, op_idx, entry.slba, entry.nlba)
    } else {
        let op_idx = op_table[rng.gen_range(0..100u32) as usize] as usize;
        let opc = args.op_list[op_idx];

        let size_idx = sl_table[rng.gen_range(0..sl_table.len() as u32) as usize] as usize;
        let count = args.lba_size_list[size_idx];
        let align = args.lba_size_aligns[size_idx] as u64;

        let is_random = rng.gen_range(0..100) < args.lba_random;
        let raw_lba = if is_random {
            let (start, end) = if dl_table.is_empty() {
                (region_start, region_end)
            } else {
                let section = dl_table[rng.gen_range(0..10_000u32) as usize];
                (section.lba_start, section.lba_end)
            };
            if end > start {
                rng.gen_range(start..end)
            } else {
                start
            }
        } else {
            let mut lba = *sequential_lba;
            if lba >= region_end {
                lba = region_start;
            }
            let step = args.lba_step.unwrap_or(count as i64);
            *sequential_lba = lba.wrapping_add_signed(step);
            lba
        };

        let aligned = align_up(raw_lba, align);
        let lba = if aligned >= region_end {
            align_down(raw_lba, align)
        } else {
            aligned
        };
        (opc, Some(op_idx), lba, count)
    };

    // Keep the transfer inside the region. Replay entries may point past
    // it; those go to the device as-is and fail there.
    let count = if lba < region_end {
        let room = u32::try_from(region_end - lba).unwrap_or(u32::MAX);
        count.min(room).max(1)
    } else {
        count.max(1)
    };

    // Writes stamp their payload, so they must not alias a buffer a
    // pending read may still land in.
    let offset = slot * 2 * max_io_bytes;
    let buf = if opc == opcode::nvm::WRITE || opc == opcode::nvm::DSM {
        pool.dma_range(offset + max_io_bytes, max_io_bytes)
    } else {
        pool.dma_range(offset, max_io_bytes)
    };

    let now = plan.clock.now_us();
    shared.borrow_mut().slot_time_sent[slot] = now;

    let cb = {
        let shared = shared.clone();
        let plan = plan.clone();
        let is_read = opc == opcode::nvm::READ;
        Box::new(move |cpl: &CplImage| {
            completion(&shared, &plan, slot, op_idx, is_read, lba, count, opc, cpl);
        })
    };

    let result = ctrlr.submit_io(qid, nsid, opc, buf, lba, count, IoFlags::empty(), Some(cb));
    if let Err(e) = result {
        // The slot was scheduled but never reached the device; settle the
        // books so the loop can drain and report.
        let mut s = shared.borrow_mut();
        s.io_count_sent -= 1;
        s.flag_finish = true;
        warn!(error = %e, "ioworker submit failed");
        return Err(e.into());
    }
    Ok(())
}

/// Per-I/O completion bookkeeping; runs inside `process_completions`.
#[allow(clippy::too_many_arguments)]
fn completion(
    shared: &Rc<RefCell<Shared>>,
    plan: &Rc<Plan>,
    slot: usize,
    op_idx: Option<usize>,
    is_read: bool,
    lba: u64,
    count: u32,
    opc: u8,
    cpl: &CplImage,
) {
    let now = plan.clock.now_us();
    let mut s = shared.borrow_mut();
    s.io_count_cplt += 1;

    let latency = now
        .saturating_sub(s.slot_time_sent[slot])
        .min(u32::MAX as u64) as u32;
    s.latency_total_us += latency as u64;
    s.rets.latency_max_us = s.rets.latency_max_us.max(latency);
    if plan.collect_latency_histogram {
        s.rets.io_counter_per_latency[(latency as usize).min(LATENCY_BUCKETS - 1)] += 1;
    }
    if is_read {
        s.rets.io_count_read += 1;
    } else {
        s.rets.io_count_nonread += 1;
    }
    if let Some(idx) = op_idx {
        s.rets.op_counter[idx] += 1;
    }

    if plan.collect_per_second && now > s.time_next_sec_us {
        let cum = s.io_count_cplt;
        let sec = s.last_sec;
        if sec < s.rets.io_counter_per_second.len() {
            s.rets.io_counter_per_second[sec] = (cum - s.io_count_till_last_sec) as u32;
        }
        s.last_sec += 1;
        s.io_count_till_last_sec = cum;
        s.time_next_sec_us += US_PER_S;
    }

    // First device error terminates the run.
    if cpl.is_error() {
        let code = cpl.status().code();
        warn!(code, "ioworker error completion");
        s.flag_finish = true;
        if s.rets.error == 0 {
            s.rets.error = code;
        }
    }

    if plan.cmdlog_list_len > 0 {
        let cursor = s.cmdlog_cursor;
        let idx = cursor % plan.cmdlog_list_len;
        s.rets.cmdlog_list[idx] = CmdRecord {
            lba,
            count,
            opcode: opc,
        };
        s.cmdlog_cursor = cursor + 1;
    }

    if !s.flag_finish {
        s.flag_finish = s.check_finish(plan, now);
    }

    if !s.flag_finish {
        // Requeue this slot with its next due time.
        let next_time = if !plan.replay.is_empty() {
            if s.replay_next >= plan.replay.len() {
                s.flag_finish = true;
                return;
            }
            s.slot_seq[slot] = s.replay_next;
            s.replay_next += 1;
            plan.start_us + plan.replay[s.slot_seq[slot]].timestamp_us
        } else if plan.delay_us > 0 {
            s.io_due_time_us += plan.delay_us;
            s.io_due_time_us
        } else {
            now
        };
        s.slot_time_sent[slot] = next_time;
        s.pending.push_back(slot);
        s.io_count_sent += 1;
    }
}

fn finalize(s: &mut Shared, plan: &Plan, cpu_time_us: u64, now_us: u64) {
    s.rets.mseconds = elapsed_ms_ceil(plan.start_us, now_us);
    s.rets.cpu_usage_ms = (cpu_time_us / 1000) as u32;
    if s.io_count_cplt > 0 {
        s.rets.latency_average_us = (s.latency_total_us / s.io_count_cplt) as u32;
    }
    if plan.collect_per_second {
        // Only fully elapsed seconds carry a sample.
        s.rets.io_counter_per_second.truncate(s.last_sec);
    }
    if plan.cmdlog_list_len > 0 {
        // The ring was written head-advancing; rotate so the oldest entry
        // sits at index 0.
        if s.cmdlog_cursor >= plan.cmdlog_list_len {
            let split = s.cmdlog_cursor % plan.cmdlog_list_len;
            s.rets.cmdlog_list.rotate_left(split);
        } else {
            s.rets.cmdlog_list.truncate(s.cmdlog_cursor);
        }
    }
    debug!(
        cplt = s.io_count_cplt,
        mseconds = s.rets.mseconds,
        error = s.rets.error,
        "ioworker done"
    );
}
