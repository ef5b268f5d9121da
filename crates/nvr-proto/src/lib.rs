//! NVMe wire-level types shared across the rig.
//!
//! A submission queue entry is always handled as a 64-byte [`CmdImage`] and a
//! completion queue entry as a 16-byte [`CplImage`]; higher layers that need
//! to dispatch on the command (locking, integrity update, verification) go
//! through the tagged [`NvmOp`] view instead of re-decoding opcodes at every
//! site.

use bitflags::bitflags;

pub mod opcode {
    //! Opcode constants. Admin and NVM opcodes live in disjoint spaces.

    /// NVM command set (I/O queues).
    pub mod nvm {
        pub const FLUSH: u8 = 0x00;
        pub const WRITE: u8 = 0x01;
        pub const READ: u8 = 0x02;
        pub const WRITE_UNCORR: u8 = 0x04;
        pub const COMPARE: u8 = 0x05;
        pub const WRITE_ZEROES: u8 = 0x08;
        pub const DSM: u8 = 0x09;
    }

    /// Admin command set (queue 0).
    pub mod admin {
        pub const DELETE_IO_SQ: u8 = 0x00;
        pub const CREATE_IO_SQ: u8 = 0x01;
        pub const DELETE_IO_CQ: u8 = 0x04;
        pub const CREATE_IO_CQ: u8 = 0x05;
        pub const IDENTIFY: u8 = 0x06;
        pub const SET_FEATURES: u8 = 0x09;
        pub const GET_FEATURES: u8 = 0x0a;
        pub const FORMAT_NVM: u8 = 0x80;
        pub const SANITIZE: u8 = 0x84;
    }
}

bitflags! {
    /// Upper-half CDW12 flags for read/write-family commands. The low 16
    /// bits of CDW12 carry the 0-based block count and must stay clear here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u32 {
        /// Force unit access.
        const FUA = 1 << 30;
        /// Limited retry.
        const LIMITED_RETRY = 1 << 31;
    }
}

/// 64-byte NVMe submission queue entry.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CmdImage {
    /// OPC | FUSE/PSDT flags << 8 | CID << 16.
    pub cdw0: u32,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(core::mem::size_of::<CmdImage>() == 64);

impl Default for CmdImage {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl CmdImage {
    pub const fn zeroed() -> Self {
        CmdImage {
            cdw0: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub fn new(opc: u8, nsid: u32) -> Self {
        let mut cmd = Self::zeroed();
        cmd.cdw0 = opc as u32;
        cmd.nsid = nsid;
        cmd
    }

    pub fn opc(&self) -> u8 {
        (self.cdw0 & 0xff) as u8
    }

    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    pub fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0x0000_ffff) | ((cid as u32) << 16);
    }

    /// Starting LBA of a read/write-family command (CDW10/CDW11).
    pub fn slba(&self) -> u64 {
        self.cdw10 as u64 | ((self.cdw11 as u64) << 32)
    }

    pub fn set_slba(&mut self, slba: u64) {
        self.cdw10 = slba as u32;
        self.cdw11 = (slba >> 32) as u32;
    }

    /// 1-based block count of a read/write-family command.
    pub fn nlb(&self) -> u32 {
        (self.cdw12 & 0xffff) + 1
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        // repr(C), no padding: the dword layout is exactly the wire image.
        unsafe { &*(self as *const CmdImage as *const [u8; 64]) }
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const CmdImage) }
    }

    /// Classify an I/O-queue command for locking and integrity dispatch.
    pub fn nvm_op(&self) -> NvmOp {
        use opcode::nvm::*;
        let slba = self.slba();
        let nlb = self.nlb();
        match self.opc() {
            FLUSH => NvmOp::Flush,
            WRITE => NvmOp::Write { slba, nlb },
            READ => NvmOp::Read { slba, nlb },
            WRITE_UNCORR => NvmOp::WriteUncorr { slba, nlb },
            COMPARE => NvmOp::Compare { slba, nlb },
            WRITE_ZEROES => NvmOp::WriteZeroes { slba, nlb },
            // NR is 0-based; the same decode feeds both the lock and the
            // unlock/update sites.
            DSM => NvmOp::Deallocate {
                nr: (self.cdw10 & 0xff) + 1,
            },
            other => NvmOp::Other(other),
        }
    }
}

impl core::fmt::Debug for CmdImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "CmdImage {{ opc: {:#04x}, cid: {}, nsid: {}, cdw10: {:#x}, cdw11: {:#x}, cdw12: {:#x} }}",
            self.opc(),
            self.cid(),
            self.nsid,
            self.cdw10,
            self.cdw11,
            self.cdw12
        )
    }
}

/// Tagged view of an NVM command, so locking and integrity code dispatch on
/// one decode instead of comparing opcodes at three different sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmOp {
    Flush,
    Write { slba: u64, nlb: u32 },
    Read { slba: u64, nlb: u32 },
    WriteUncorr { slba: u64, nlb: u32 },
    Compare { slba: u64, nlb: u32 },
    WriteZeroes { slba: u64, nlb: u32 },
    /// Dataset management; `nr` ranges are carried in the data buffer.
    Deallocate { nr: u32 },
    Other(u8),
}

impl NvmOp {
    /// Whether the command moves data or modifies the medium and therefore
    /// participates in per-LBA locking.
    pub fn needs_lba_locks(&self) -> bool {
        !matches!(self, NvmOp::Flush | NvmOp::Other(_))
    }

    /// The contiguous LBA range of a non-DSM data command.
    pub fn lba_range(&self) -> Option<(u64, u32)> {
        match *self {
            NvmOp::Write { slba, nlb }
            | NvmOp::Read { slba, nlb }
            | NvmOp::WriteUncorr { slba, nlb }
            | NvmOp::Compare { slba, nlb }
            | NvmOp::WriteZeroes { slba, nlb } => Some((slba, nlb)),
            _ => None,
        }
    }
}

/// 16-byte NVMe completion queue entry.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CplImage {
    pub cdw0: u32,
    pub rsvd: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// Phase tag in bit 0, then SC (8 bits), SCT (3 bits), CRD, M, DNR.
    pub status_raw: u16,
}

const _: () = assert!(core::mem::size_of::<CplImage>() == 16);

impl CplImage {
    pub fn success(cid: u16) -> Self {
        CplImage {
            cid,
            ..Default::default()
        }
    }

    pub fn error(cid: u16, status: Status) -> Self {
        CplImage {
            cid,
            status_raw: status.to_raw(),
            ..Default::default()
        }
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.status_raw)
    }

    pub fn set_status(&mut self, status: Status) {
        // Preserve the phase tag.
        self.status_raw = status.to_raw() | (self.status_raw & 1);
    }

    pub fn is_error(&self) -> bool {
        self.status().is_error()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        unsafe { &*(self as *const CplImage as *const [u8; 16]) }
    }
}

impl core::fmt::Debug for CplImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "CplImage {{ cid: {}, sct: {:#x}, sc: {:#04x}, cdw0: {:#x} }}",
            self.cid,
            self.status().sct(),
            self.status().sc(),
            self.cdw0
        )
    }
}

/// Completion status without the phase tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u16);

impl Status {
    pub const SUCCESS: Status = Status(0);
    /// Generic status: invalid field in command.
    pub const INVALID_FIELD: Status = Status::new(0x0, 0x02);
    /// Generic status: LBA out of range.
    pub const LBA_OUT_OF_RANGE: Status = Status::new(0x0, 0x80);
    /// Media error: compare failure.
    pub const COMPARE_FAILURE: Status = Status::new(0x2, 0x85);
    /// Vendor specific: unrecovered read error, reported by the integrity
    /// engine when read data does not match the recorded fingerprint.
    pub const VERIFY_FAILED: Status = Status::new(0x7, 0x81);

    pub const fn new(sct: u8, sc: u8) -> Self {
        Status(((sct as u16 & 0x7) << 9) | ((sc as u16) << 1))
    }

    pub fn from_raw(raw: u16) -> Self {
        Status(raw & !1)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn sc(self) -> u8 {
        ((self.0 >> 1) & 0xff) as u8
    }

    pub fn sct(self) -> u8 {
        ((self.0 >> 9) & 0x7) as u8
    }

    pub fn is_error(self) -> bool {
        self.sc() != 0 || self.sct() != 0
    }

    /// 11-bit `sct:sc` value, the shape scripts historically consume.
    pub fn code(self) -> u16 {
        ((self.sct() as u16) << 8) | self.sc() as u16
    }
}

/// One 16-byte dataset-management range descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DsmRange {
    pub cattr: u32,
    /// Length in logical blocks (1-based on the wire for our purposes; the
    /// rig always writes the real count).
    pub nlb: u32,
    pub slba: u64,
}

pub const DSM_RANGE_SIZE: usize = 16;

const _: () = assert!(core::mem::size_of::<DsmRange>() == DSM_RANGE_SIZE);

impl DsmRange {
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.cattr.to_le_bytes());
        out[4..8].copy_from_slice(&self.nlb.to_le_bytes());
        out[8..16].copy_from_slice(&self.slba.to_le_bytes());
    }

    pub fn read_from(bytes: &[u8]) -> Self {
        DsmRange {
            cattr: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            nlb: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            slba: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }

    /// Parse the first `count` descriptors out of a DSM payload.
    pub fn parse(buf: &[u8], count: u32) -> Vec<DsmRange> {
        (0..count as usize)
            .map(|i| DsmRange::read_from(&buf[i * DSM_RANGE_SIZE..]))
            .collect()
    }
}
