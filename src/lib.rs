//! User-space NVMe test rig.
//!
//! Facade over the workspace crates: raw command access with per-queue
//! command logging, per-LBA data-integrity tracking in shared memory, and
//! a self-pacing workload generator. See the individual crates for the
//! details; scripts normally only need these re-exports.

pub use nvr_core::{
    CmdError, CmdLog, Controller, DmaAllocator, DmaBuf, DmaError, DmaRef, Driver, DriverConfig,
    EntryData, HeapAllocator, IntcBlock, IoToken, MemDevice, Namespace, NamespaceInfo,
    PatternType, ProcessRole, Transport, TransportError, TransportId, CMD_LOG_DEPTH,
};
pub use nvr_integrity::{fingerprint, IntegrityTable, VerifyFailure, VerifyKind};
pub use nvr_ioworker::{
    ioworker_entry, CmdRecord, IoSeqEntry, WorkerArgs, WorkerError, WorkerRets,
};
pub use nvr_proto::{opcode, CmdImage, CplImage, DsmRange, IoFlags, NvmOp, Status};
pub use nvr_shm::{Region, Registry, ShmError};
pub use nvr_time::{Clock, ClockRef, FakeClock, MonotonicClock, SteppingClock};
