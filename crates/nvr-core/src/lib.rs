//! Core of the NVMe test rig: driver lifecycle, DMA buffers, the
//! per-queue command log, controller/queue/namespace plumbing, and the
//! in-memory device model used to exercise all of it without hardware.

pub mod cmdlog;
pub mod ctrlr;
pub mod dma;
pub mod driver;
pub mod intc;
pub mod memdev;
pub mod transport;

pub use cmdlog::{CmdLog, EntryData, LogAttach, CMD_LOG_DEPTH};
pub use ctrlr::{CmdCallback, CmdError, Controller, Namespace};
pub use dma::{
    stamp_write_blocks, DmaAllocator, DmaBuf, DmaError, DmaRef, HeapAllocator, PatternType,
    DMA_ALIGN,
};
pub use driver::{Driver, DriverConfig, ConfigWord, IoToken, ProcessRole};
pub use intc::{IntcBlock, IntcRef, INTC_MAX_VECTORS};
pub use memdev::MemDevice;
pub use transport::{NamespaceInfo, Transport, TransportError, TransportId};
