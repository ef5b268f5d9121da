//! End-to-end IO-worker runs against the in-memory device with a stepping
//! clock, so pacing and deadlines are deterministic.

use std::sync::Arc;

use nvr_core::{
    CmdError, Controller, Driver, DriverConfig, MemDevice, ProcessRole, Transport, TransportError,
    TransportId,
};
use nvr_ioworker::{ioworker_entry, CmdRecord, IoSeqEntry, WorkerArgs, WorkerError};
use nvr_proto::opcode;
use nvr_shm::Registry;
use nvr_time::SteppingClock;

const SECTOR: usize = 512;

struct Rig {
    _dir: tempfile::TempDir,
    driver: Driver,
}

fn rig(step_us: u64) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::with_base(dir.path());
    let driver = Driver::init_with(
        ProcessRole::Primary,
        registry,
        Arc::new(SteppingClock::new(step_us)),
    )
    .unwrap();
    Rig { _dir: dir, driver }
}

fn controller(rig: &Rig, nsectors: u64) -> (Controller<MemDevice>, u16) {
    let dev = MemDevice::new(SECTOR as u32, nsectors);
    let mut ctrlr = Controller::attach(
        TransportId::Pcie {
            traddr: "0000:03:00.0".into(),
        },
        dev,
        &rig.driver,
    )
    .unwrap();
    ctrlr.ns_init(1, 0).unwrap();
    let qid = ctrlr.create_io_qpair(256, None).unwrap();
    (ctrlr, qid)
}

#[test]
fn fixed_io_count_runs_to_completion() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 4096);
    let args = WorkerArgs {
        op_list: vec![opcode::nvm::WRITE],
        op_weights: vec![100],
        io_count: 100,
        qdepth: 8,
        region_end: 4096,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    assert_eq!(rets.error, 0);
    assert_eq!(rets.io_count_nonread, 100);
    assert_eq!(rets.io_count_read, 0);
    assert_eq!(rets.op_counter, vec![100]);
    assert!(rets.mseconds >= 1);
    assert!(rets.latency_max_us >= rets.latency_average_us);
}

#[test]
fn mixed_op_ratio_tracks_weights() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 8192);
    let args = WorkerArgs {
        op_list: vec![opcode::nvm::READ, opcode::nvm::WRITE, opcode::nvm::DSM],
        op_weights: vec![70, 20, 10],
        io_count: 10_000,
        qdepth: 16,
        region_end: 8192,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    assert_eq!(rets.error, 0);
    let total: u64 = rets.op_counter.iter().sum();
    assert_eq!(total, 10_000);
    // Weighted selection; allow 3% absolute drift.
    assert!((rets.op_counter[0] as i64 - 7_000).abs() < 300, "{:?}", rets.op_counter);
    assert!((rets.op_counter[1] as i64 - 2_000).abs() < 300, "{:?}", rets.op_counter);
    assert!((rets.op_counter[2] as i64 - 1_000).abs() < 300, "{:?}", rets.op_counter);
    assert_eq!(rets.io_count_read, rets.op_counter[0]);
    assert_eq!(rets.io_count_nonread, rets.op_counter[1] + rets.op_counter[2]);
}

#[test]
fn sequential_step_walks_and_wraps() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 4096);
    let args = WorkerArgs {
        lba_random: 0,
        lba_start: Some(0),
        lba_step: Some(8),
        region_end: 64,
        lba_size_list: vec![4],
        lba_size_ratios: vec![1],
        lba_size_aligns: vec![4],
        op_list: vec![opcode::nvm::READ],
        op_weights: vec![100],
        io_count: 12,
        qdepth: 2,
        cmdlog_list_len: 16,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    let lbas: Vec<u64> = rets.cmdlog_list.iter().map(|r| r.lba).collect();
    assert_eq!(lbas, vec![0, 8, 16, 24, 32, 40, 48, 56, 0, 8, 16, 24]);
    assert!(rets.cmdlog_list.iter().all(|r| r.count == 4));
    assert!(rets
        .cmdlog_list
        .iter()
        .all(|r| r.opcode == opcode::nvm::READ));
}

#[test]
fn iops_throttle_hits_target_rate() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 4096);
    let args = WorkerArgs {
        op_list: vec![opcode::nvm::READ],
        op_weights: vec![100],
        iops: 1_000,
        seconds: 2,
        qdepth: 8,
        region_end: 4096,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    let total = rets.io_count_read + rets.io_count_nonread;
    // 1000 IOPS for 2 simulated seconds, within 5%.
    assert!((1900..=2100).contains(&total), "completed {total}");
}

#[test]
fn per_second_counters_cover_elapsed_seconds() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 4096);
    let args = WorkerArgs {
        op_list: vec![opcode::nvm::READ],
        op_weights: vec![100],
        iops: 500,
        seconds: 3,
        qdepth: 4,
        region_end: 4096,
        collect_per_second: true,
        collect_latency_histogram: true,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    assert!(rets.io_counter_per_second.len() >= 2);
    for &per_sec in &rets.io_counter_per_second {
        assert!((450..=550).contains(&per_sec), "{:?}", rets.io_counter_per_second);
    }
    let histogram_total: u64 = rets.io_counter_per_latency.iter().sum();
    assert_eq!(histogram_total, rets.io_count_read + rets.io_count_nonread);
}

#[test]
fn iow_term_returns_within_one_iteration() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 4096);
    rig.driver.config().insert(DriverConfig::IOW_TERM);
    let args = WorkerArgs {
        io_count: 1_000_000,
        qdepth: 8,
        region_end: 4096,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    assert_eq!(rets.error, 0);
    assert!(rets.io_count_read + rets.io_count_nonread < 8);
}

#[test]
fn first_device_error_terminates_the_run() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 4096);
    // Compare against storage that holds zeros while the buffers hold a
    // pattern: every compare fails at the device.
    let args = WorkerArgs {
        op_list: vec![opcode::nvm::COMPARE],
        op_weights: vec![100],
        io_count: 1_000,
        qdepth: 4,
        region_end: 4096,
        ptype: nvr_core::PatternType::Word32,
        pvalue: 0xffff_ffff,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    assert_eq!(rets.error, 0x0285, "compare failure status");
    let total = rets.io_count_read + rets.io_count_nonread;
    assert!(total < 1_000);
}

#[test]
fn distribution_confines_random_lbas_to_hot_section() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 20_000);
    let mut distribution = vec![0u32; 100];
    distribution[5] = 10_000; // all traffic in [1000, 1200)
    let args = WorkerArgs {
        distribution,
        op_list: vec![opcode::nvm::READ],
        op_weights: vec![100],
        lba_size_list: vec![1],
        lba_size_ratios: vec![1],
        lba_size_aligns: vec![1],
        io_count: 2_000,
        qdepth: 8,
        region_end: 20_000,
        cmdlog_list_len: 2_000,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    assert_eq!(rets.cmdlog_list.len(), 2_000);
    assert!(rets
        .cmdlog_list
        .iter()
        .all(|r| (1_000..1_200).contains(&r.lba)));
}

#[test]
fn replay_reissues_the_exact_sequence() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 4096);
    let seq = vec![
        IoSeqEntry { timestamp_us: 0, op: opcode::nvm::WRITE, slba: 10, nlba: 2 },
        IoSeqEntry { timestamp_us: 50, op: opcode::nvm::READ, slba: 10, nlba: 2 },
        IoSeqEntry { timestamp_us: 100, op: opcode::nvm::WRITE, slba: 50, nlba: 1 },
        IoSeqEntry { timestamp_us: 150, op: opcode::nvm::READ, slba: 50, nlba: 1 },
        IoSeqEntry { timestamp_us: 200, op: opcode::nvm::FLUSH, slba: 0, nlba: 1 },
    ];
    let args = WorkerArgs {
        io_sequence: seq.clone(),
        op_list: vec![opcode::nvm::WRITE, opcode::nvm::READ, opcode::nvm::FLUSH],
        op_weights: vec![40, 40, 20],
        qdepth: 2,
        region_end: 4096,
        cmdlog_list_len: 8,
        ..Default::default()
    };
    let rets = ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args).unwrap();
    assert_eq!(rets.io_count_read + rets.io_count_nonread, 5);
    let replayed: Vec<CmdRecord> = rets.cmdlog_list.clone();
    for (record, entry) in replayed.iter().zip(&seq) {
        assert_eq!(record.opcode, entry.op);
        assert_eq!(record.lba, entry.slba);
        if entry.op != opcode::nvm::FLUSH {
            assert_eq!(record.count, entry.nlba);
        }
    }
}

#[test]
fn invalid_configurations_are_rejected() {
    let rig = rig(1);
    let (mut ctrlr, qid) = controller(&rig, 4096);

    let bad_depth = WorkerArgs {
        qdepth: 1,
        region_end: 4096,
        ..Default::default()
    };
    assert!(matches!(
        ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &bad_depth),
        Err(WorkerError::InvalidConfig(_))
    ));

    let bad_random = WorkerArgs {
        lba_random: 101,
        region_end: 4096,
        ..Default::default()
    };
    assert!(matches!(
        ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &bad_random),
        Err(WorkerError::InvalidConfig(_))
    ));

    let bad_weights = WorkerArgs {
        op_list: vec![opcode::nvm::READ],
        op_weights: vec![90],
        region_end: 4096,
        ..Default::default()
    };
    assert!(matches!(
        ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &bad_weights),
        Err(WorkerError::InvalidConfig(_))
    ));

    // Larger than the controller's max transfer size: NVMe invalid-field.
    let oversized = WorkerArgs {
        lba_size_list: vec![8192],
        lba_size_ratios: vec![1],
        lba_size_aligns: vec![8],
        region_end: 4096,
        ..Default::default()
    };
    match ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &oversized) {
        Err(WorkerError::TransferTooLarge { status }) => assert_eq!(status, 0x0002),
        other => panic!("expected TransferTooLarge, got {other:?}"),
    }
}

/// Accepts submissions and never completes them.
struct StuckDevice {
    inner: MemDevice,
}

impl Transport for StuckDevice {
    fn max_transfer_size(&self) -> usize {
        self.inner.max_transfer_size()
    }
    fn num_namespaces(&self) -> u32 {
        self.inner.num_namespaces()
    }
    fn namespace_info(&self, nsid: u32) -> Option<nvr_core::NamespaceInfo> {
        self.inner.namespace_info(nsid)
    }
    fn create_queue(
        &mut self,
        qid: u16,
        depth: u32,
        intr_vector: Option<u16>,
    ) -> Result<(), TransportError> {
        self.inner.create_queue(qid, depth, intr_vector)
    }
    fn destroy_queue(&mut self, qid: u16) -> Result<(), TransportError> {
        self.inner.destroy_queue(qid)
    }
    fn submit(
        &mut self,
        _qid: u16,
        _cmd: &nvr_proto::CmdImage,
        _data: Option<nvr_core::DmaRef>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
    fn poll(
        &mut self,
        _qid: u16,
        _max: u32,
        _sink: &mut dyn FnMut(nvr_proto::CplImage),
    ) -> Result<u32, TransportError> {
        Ok(0)
    }
    fn read_reg32(&self, offset: u32) -> Result<u32, TransportError> {
        self.inner.read_reg32(offset)
    }
    fn write_reg32(&mut self, offset: u32, value: u32) -> Result<(), TransportError> {
        self.inner.write_reg32(offset, value)
    }
}

#[test]
fn stuck_device_trips_the_watchdog_with_partial_stats() {
    let rig = rig(200);
    let dev = StuckDevice {
        inner: MemDevice::new(SECTOR as u32, 4096),
    };
    let mut ctrlr = Controller::attach(
        TransportId::Pcie {
            traddr: "0000:04:00.0".into(),
        },
        dev,
        &rig.driver,
    )
    .unwrap();
    ctrlr.ns_init(1, 0).unwrap();
    let qid = ctrlr.create_io_qpair(64, None).unwrap();

    let args = WorkerArgs {
        seconds: 1,
        qdepth: 4,
        region_end: 4096,
        ..Default::default()
    };
    match ioworker_entry(&rig.driver, &mut ctrlr, qid, 1, &args) {
        Err(WorkerError::Timeout(rets)) => {
            assert_eq!(rets.io_count_read + rets.io_count_nonread, 0);
            assert!(rets.mseconds >= 31_000);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn worker_error_type_converts_from_cmd_error() {
    // The dispatch loop propagates controller errors verbatim.
    let err: WorkerError = CmdError::InvalidQueue(9).into();
    assert!(matches!(err, WorkerError::Cmd(CmdError::InvalidQueue(9))));
}
