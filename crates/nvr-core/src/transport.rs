//! The contract the rig consumes from an underlying NVMe transport.
//!
//! A transport owns the actual queue plumbing (PCIe BAR + doorbells, or a
//! TCP connection). The rig drives it with raw 64-byte commands and polls
//! it for completions; everything above (locking, logging, verification)
//! is transport-agnostic.

use nvr_proto::{CmdImage, CplImage};

use crate::dma::DmaRef;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("queue {0} does not exist")]
    InvalidQueue(u16),
    #[error("queue {0} is full")]
    QueueFull(u16),
    #[error("queue {0} already exists")]
    QueueExists(u16),
    #[error("register offset {0:#x} out of range")]
    InvalidRegister(u32),
    #[error("transport failure: {0}")]
    Other(String),
}

/// Identity and geometry of one namespace, as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub nsid: u32,
    pub sector_size: u32,
    pub nsectors: u64,
    pub eui64: u64,
}

impl NamespaceInfo {
    pub fn bytes(&self) -> u64 {
        self.nsectors * self.sector_size as u64
    }
}

/// How the rig addresses a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportId {
    Pcie { traddr: String },
    Tcp { traddr: String, port: u16, subnqn: String },
}

impl TransportId {
    pub fn traddr(&self) -> &str {
        match self {
            TransportId::Pcie { traddr } => traddr,
            TransportId::Tcp { traddr, .. } => traddr,
        }
    }

    pub fn subnqn(&self) -> &str {
        match self {
            TransportId::Pcie { .. } => "",
            TransportId::Tcp { subnqn, .. } => subnqn,
        }
    }

    pub fn is_pcie(&self) -> bool {
        matches!(self, TransportId::Pcie { .. })
    }
}

/// Raw command access to one controller. Implementations complete commands
/// only from within [`Transport::poll`]; the data plane stays cooperative.
pub trait Transport {
    /// Largest data transfer one command may carry, in bytes.
    fn max_transfer_size(&self) -> usize;

    /// Highest valid namespace id (namespaces are 1..=n).
    fn num_namespaces(&self) -> u32;

    fn namespace_info(&self, nsid: u32) -> Option<NamespaceInfo>;

    /// Create the device-side queue pair. Queue 0 exists from reset.
    fn create_queue(
        &mut self,
        qid: u16,
        depth: u32,
        intr_vector: Option<u16>,
    ) -> Result<(), TransportError>;

    fn destroy_queue(&mut self, qid: u16) -> Result<(), TransportError>;

    /// Hand one command to the device. `data` is the DMA target for
    /// data-bearing commands and stays valid until the completion for this
    /// command is delivered by `poll`.
    fn submit(
        &mut self,
        qid: u16,
        cmd: &CmdImage,
        data: Option<DmaRef>,
    ) -> Result<(), TransportError>;

    /// Deliver up to `max` completions for `qid` (0 = no limit) to `sink`.
    /// Returns the number delivered.
    fn poll(
        &mut self,
        qid: u16,
        max: u32,
        sink: &mut dyn FnMut(CplImage),
    ) -> Result<u32, TransportError>;

    /// Controller register access (BAR0 for PCIe, property get/set for
    /// fabrics).
    fn read_reg32(&self, offset: u32) -> Result<u32, TransportError>;
    fn write_reg32(&mut self, offset: u32, value: u32) -> Result<(), TransportError>;

    fn read_reg64(&self, offset: u32) -> Result<u64, TransportError> {
        let lo = self.read_reg32(offset)? as u64;
        let hi = self.read_reg32(offset + 4)? as u64;
        Ok(lo | (hi << 32))
    }

    fn write_reg64(&mut self, offset: u32, value: u64) -> Result<(), TransportError> {
        self.write_reg32(offset, value as u32)?;
        self.write_reg32(offset + 4, (value >> 32) as u32)
    }
}
