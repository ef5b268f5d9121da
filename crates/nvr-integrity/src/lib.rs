//! Per-namespace data-integrity table.
//!
//! One 32-bit word per verified LBA, in a named shared-memory region so
//! every process attached to the device sees the same state:
//!
//! - bit 31: lock bit, set while an in-flight command covers the LBA;
//! - bits 30..0: fingerprint, with `0` reserved for "no mapping recorded"
//!   and `0x7fff_ffff` for "marked uncorrectable".
//!
//! The table is truncated at construction time (`nlba_verify`): LBAs past
//! the verified prefix get no locking and no verification.

use std::sync::atomic::{AtomicU32, Ordering};

use crc::{Crc, CRC_32_ISCSI};
use nvr_shm::{Region, Registry, ShmError};
use tracing::warn;

pub const LOCK_BIT: u32 = 0x8000_0000;
pub const FP_MASK: u32 = 0x7fff_ffff;
pub const NO_MAPPING: u32 = 0;
pub const UNCORRECTABLE: u32 = 0x7fff_ffff;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// 31-bit fingerprint of one logical block.
///
/// CRC-32C shifted right one bit (bit 31 is the lock flag), with the two
/// reserved encodings remapped to neighbours.
pub fn fingerprint(block: &[u8]) -> u32 {
    match CRC32C.checksum(block) >> 1 {
        NO_MAPPING => 1,
        UNCORRECTABLE => 0x7fff_fffe,
        crc => crc,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyKind {
    /// Stored fingerprint says the LBA was written uncorrectable.
    Uncorrectable,
    /// Block contents do not match the recorded fingerprint.
    Crc,
    /// Block carries a valid fingerprint for a different LBA (mapping
    /// error in the device).
    LbaMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("verify failure at lba {lba:#x}: {kind:?}")]
pub struct VerifyFailure {
    pub lba: u64,
    pub kind: VerifyKind,
}

// Region layout (fixed; shared with external tooling):
//   offset 0  : u64 size of the data array in bytes
//   offset 8  : u32 enabled flag
//   offset 12 : padding
//   offset 16 : u32 data[size/4]
const OFF_SIZE: usize = 0;
const OFF_ENABLED: usize = 8;
const OFF_DATA: usize = 16;

pub struct IntegrityTable {
    region: Region,
    nlba: u64,
}

impl IntegrityTable {
    /// Reserve a table covering `nlba` LBAs (primary process). A namespace
    /// too large for the table to be addressable fails like any other
    /// allocation failure; the caller degrades to verification disabled.
    pub fn create(registry: &Registry, name: &str, nlba: u64) -> Result<Self, ShmError> {
        let total = nlba
            .checked_mul(4)
            .and_then(|b| b.checked_add(OFF_DATA as u64))
            .and_then(|b| usize::try_from(b).ok())
            .ok_or_else(|| ShmError::TooLarge(name.to_string()))?;
        let region = registry.create(name, total)?;
        region
            .atomic_u64(OFF_SIZE)
            .store((total - OFF_DATA) as u64, Ordering::SeqCst);
        Ok(IntegrityTable { region, nlba })
    }

    /// Attach to a table created by the primary (secondary process).
    pub fn attach(registry: &Registry, name: &str) -> Result<Self, ShmError> {
        let region = registry.lookup_sized(name, OFF_DATA)?;
        let data_bytes = region.atomic_u64(OFF_SIZE).load(Ordering::SeqCst);
        let region = registry.lookup_sized(name, OFF_DATA + data_bytes as usize)?;
        Ok(IntegrityTable {
            region,
            nlba: data_bytes / 4,
        })
    }

    /// Number of LBAs in the verified prefix.
    pub fn nlba(&self) -> u64 {
        self.nlba
    }

    pub fn enabled(&self) -> bool {
        self.region.atomic_u32(OFF_ENABLED).load(Ordering::SeqCst) != 0
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.region
            .atomic_u32(OFF_ENABLED)
            .store(enabled as u32, Ordering::SeqCst);
    }

    fn entries(&self) -> &[AtomicU32] {
        self.region.atomic_u32_slice(OFF_DATA, self.nlba as usize)
    }

    /// Clamp `[slba, slba+nlb)` to the verified prefix. Empty when the
    /// range starts past the table.
    fn clamp(&self, slba: u64, nlb: u64) -> std::ops::Range<usize> {
        let start = slba.min(self.nlba) as usize;
        let end = slba.saturating_add(nlb).min(self.nlba) as usize;
        start..end
    }

    pub fn entry(&self, lba: u64) -> Option<u32> {
        (lba < self.nlba).then(|| self.entries()[lba as usize].load(Ordering::SeqCst))
    }

    /// Record fingerprints for blocks just written. The lock bit is held by
    /// the completing command, so preserve it; it is cleared separately at
    /// lock release.
    pub fn record_write(&self, data: &[u8], slba: u64, nlb: u32, lba_size: usize) {
        let entries = self.entries();
        for (i, lba) in (slba..slba + nlb as u64).enumerate() {
            if lba >= self.nlba {
                break;
            }
            let fp = fingerprint(&data[i * lba_size..(i + 1) * lba_size]);
            entries[lba as usize]
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some((v & LOCK_BIT) | fp)
                })
                .ok();
        }
    }

    /// Reset a range to "no mapping" (deallocate, write-zeroes) or
    /// "uncorrectable" (write-uncorrectable acknowledged).
    pub fn clear_range(&self, slba: u64, nlb: u64, uncorr: bool) {
        let fill = if uncorr { UNCORRECTABLE } else { NO_MAPPING };
        let entries = self.entries();
        for i in self.clamp(slba, nlb) {
            entries[i]
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some((v & LOCK_BIT) | fill)
                })
                .ok();
        }
    }

    /// Drop every recorded fingerprint (format/sanitize completed). Lock
    /// bits are cleared too; nothing can be in flight across a format.
    pub fn reset(&self) {
        for e in self.entries() {
            e.store(0, Ordering::SeqCst);
        }
    }

    fn any_locked(&self, slba: u64, nlb: u64) -> bool {
        let entries = self.entries();
        self.clamp(slba, nlb)
            .any(|i| entries[i].load(Ordering::SeqCst) & LOCK_BIT != 0)
    }

    fn set_locks(&self, slba: u64, nlb: u64, lock: bool) {
        let entries = self.entries();
        for i in self.clamp(slba, nlb) {
            if lock {
                entries[i].fetch_or(LOCK_BIT, Ordering::SeqCst);
            } else {
                entries[i].fetch_and(!LOCK_BIT, Ordering::SeqCst);
            }
        }
    }

    /// Try to lock every LBA of every range, all-or-nothing. Returns false
    /// (and locks nothing) when any covered LBA is already locked.
    pub fn try_lock_ranges(&self, ranges: &[(u64, u64)]) -> bool {
        if ranges.iter().any(|&(s, n)| self.any_locked(s, n)) {
            return false;
        }
        for &(s, n) in ranges {
            self.set_locks(s, n, true);
        }
        true
    }

    pub fn unlock_ranges(&self, ranges: &[(u64, u64)]) {
        for &(s, n) in ranges {
            self.set_locks(s, n, false);
        }
    }

    /// Clear every lock bit (crash recovery for scripts).
    pub fn unlock_all(&self) {
        self.set_locks(0, self.nlba, false);
    }

    /// Advance `slba` past uncorrectable-marked entries.
    pub fn skip_uncorr(&self, mut slba: u64) -> u64 {
        while let Some(e) = self.entry(slba) {
            if e & FP_MASK != UNCORRECTABLE {
                break;
            }
            slba += 1;
        }
        slba
    }

    /// Verify read data against recorded fingerprints. The caller holds the
    /// lock bits for the whole range until after this returns.
    pub fn verify_read(
        &self,
        data: &[u8],
        slba: u64,
        nlb: u32,
        lba_size: usize,
    ) -> Result<(), VerifyFailure> {
        if !self.enabled() {
            return Ok(());
        }

        for (i, lba) in (slba..slba + nlb as u64).enumerate() {
            if lba >= self.nlba {
                break;
            }
            let expected = self.entries()[lba as usize].load(Ordering::SeqCst) & FP_MASK;
            if expected == NO_MAPPING {
                continue;
            }
            if expected == UNCORRECTABLE {
                warn!(lba, "read of uncorrectable lba");
                return Err(VerifyFailure {
                    lba,
                    kind: VerifyKind::Uncorrectable,
                });
            }

            let block = &data[i * lba_size..(i + 1) * lba_size];
            let fp = fingerprint(block);
            let stamp = u64::from_le_bytes(block[0..8].try_into().unwrap());

            // Writes stamp the first word of every block with its LBA.
            // `0` and all-ones are excluded: deallocated blocks legally
            // read back as either.
            if stamp == lba || stamp == 0 || stamp == u64::MAX {
                if fp != expected {
                    warn!(lba, expected, got = fp, "crc mismatch");
                    return Err(VerifyFailure {
                        lba,
                        kind: VerifyKind::Crc,
                    });
                }
            } else {
                // Wrong stamp: check the contents against the stamped
                // LBA instead. A match, or an unmapped stamped entry
                // (nothing recorded there to refute), means the data is
                // intact but belongs elsewhere: a mapping error. Anything
                // else is plain corruption.
                let kind = match self.entry(stamp) {
                    Some(e) if e & FP_MASK == NO_MAPPING => VerifyKind::LbaMismatch,
                    Some(e) if e & FP_MASK == fp => VerifyKind::LbaMismatch,
                    _ => VerifyKind::Crc,
                };
                warn!(lba, stamp, ?kind, "lba stamp mismatch");
                return Err(VerifyFailure { lba, kind });
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for IntegrityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityTable")
            .field("region", &self.region.name())
            .field("nlba", &self.nlba)
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(nlba: u64) -> (tempfile::TempDir, IntegrityTable) {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::with_base(dir.path());
        let t = IntegrityTable::create(&reg, "t", nlba).unwrap();
        t.set_enabled(true);
        (dir, t)
    }

    fn block(lba: u64, fill: u8, lba_size: usize) -> Vec<u8> {
        let mut b = vec![fill; lba_size];
        b[0..8].copy_from_slice(&lba.to_le_bytes());
        b
    }

    #[test]
    fn fingerprint_avoids_reserved_encodings() {
        // Spot-check plus the remap rules themselves.
        for payload in [&b"hello"[..], &[0u8; 512], &[0xff; 4096]] {
            let fp = fingerprint(payload);
            assert_ne!(fp, NO_MAPPING);
            assert_ne!(fp, UNCORRECTABLE);
            assert_eq!(fp & LOCK_BIT, 0);
        }
    }

    #[test]
    fn write_then_verify_round_trip() {
        let (_d, t) = table(16);
        let data = block(5, 0xab, 512);
        t.try_lock_ranges(&[(5, 1)]);
        t.record_write(&data, 5, 1, 512);
        t.unlock_ranges(&[(5, 1)]);
        assert!(t.verify_read(&data, 5, 1, 512).is_ok());
    }

    #[test]
    fn corrupted_block_reports_crc() {
        let (_d, t) = table(16);
        let mut data = block(5, 0xab, 512);
        t.record_write(&data, 5, 1, 512);
        data[100] ^= 1;
        assert_eq!(
            t.verify_read(&data, 5, 1, 512).unwrap_err().kind,
            VerifyKind::Crc
        );
    }

    #[test]
    fn stale_block_from_other_lba_reports_mapping_error() {
        let (_d, t) = table(16);
        let data7 = block(7, 0x11, 512);
        t.record_write(&data7, 7, 1, 512);
        // Device returns LBA 7's (intact) data for a read of LBA 3.
        t.record_write(&block(3, 0x22, 512), 3, 1, 512);
        assert_eq!(
            t.verify_read(&data7, 3, 1, 512).unwrap_err().kind,
            VerifyKind::LbaMismatch
        );
    }

    #[test]
    fn stale_block_with_unmapped_stamp_is_mapping_error() {
        let (_d, t) = table(16);
        t.record_write(&block(3, 0x22, 512), 3, 1, 512);
        // Device returns a block stamped for LBA 5, which was never
        // written: nothing recorded there refutes the data, so this is a
        // mapping error, not corruption.
        assert_eq!(
            t.verify_read(&block(5, 0x33, 512), 3, 1, 512).unwrap_err().kind,
            VerifyKind::LbaMismatch
        );

        // Same when the stamped LBA was written and then trimmed.
        t.record_write(&block(8, 0x44, 512), 8, 1, 512);
        t.clear_range(8, 1, false);
        assert_eq!(
            t.verify_read(&block(8, 0x44, 512), 3, 1, 512).unwrap_err().kind,
            VerifyKind::LbaMismatch
        );
    }

    #[test]
    fn stale_block_failing_its_own_stamp_is_crc_error() {
        let (_d, t) = table(16);
        t.record_write(&block(3, 0x22, 512), 3, 1, 512);
        t.record_write(&block(5, 0x33, 512), 5, 1, 512);
        // Stamp points at a mapped LBA whose fingerprint the contents do
        // not match either: corruption, not a mapping error.
        let mut stale = block(5, 0x33, 512);
        stale[100] ^= 1;
        assert_eq!(
            t.verify_read(&stale, 3, 1, 512).unwrap_err().kind,
            VerifyKind::Crc
        );
    }

    #[test]
    fn oversized_table_fails_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::with_base(dir.path());
        assert!(matches!(
            IntegrityTable::create(&reg, "huge", u64::MAX / 2),
            Err(nvr_shm::ShmError::TooLarge(_))
        ));
    }

    #[test]
    fn uncorrectable_marker_traps_reads() {
        let (_d, t) = table(16);
        t.clear_range(2, 1, true);
        let data = block(2, 0, 512);
        assert_eq!(
            t.verify_read(&data, 2, 1, 512).unwrap_err().kind,
            VerifyKind::Uncorrectable
        );
        assert_eq!(t.skip_uncorr(2), 3);
    }

    #[test]
    fn deallocated_range_skips_verification() {
        let (_d, t) = table(16);
        t.record_write(&block(4, 0x5a, 512), 4, 1, 512);
        t.clear_range(4, 1, false);
        // Arbitrary garbage passes: no mapping recorded.
        assert!(t.verify_read(&vec![0x77u8; 512], 4, 1, 512).is_ok());
    }

    #[test]
    fn disabled_table_skips_all_verification() {
        let (_d, t) = table(16);
        t.record_write(&block(1, 0x42, 512), 1, 1, 512);
        t.set_enabled(false);
        assert!(t.verify_read(&vec![0u8; 512], 1, 1, 512).is_ok());
    }

    #[test]
    fn lock_is_all_or_nothing_across_ranges() {
        let (_d, t) = table(64);
        assert!(t.try_lock_ranges(&[(0, 4), (10, 4)]));
        // Second range overlaps a held lock: nothing is acquired.
        assert!(!t.try_lock_ranges(&[(20, 4), (12, 2)]));
        assert_eq!(t.entry(20).unwrap() & LOCK_BIT, 0);
        t.unlock_ranges(&[(0, 4), (10, 4)]);
        assert!(t.try_lock_ranges(&[(20, 4), (12, 2)]));
    }

    #[test]
    fn lock_release_preserves_fingerprint() {
        let (_d, t) = table(16);
        let data = block(6, 0x99, 512);
        assert!(t.try_lock_ranges(&[(6, 1)]));
        t.record_write(&data, 6, 1, 512);
        assert_ne!(t.entry(6).unwrap() & LOCK_BIT, 0);
        t.unlock_ranges(&[(6, 1)]);
        assert_eq!(t.entry(6).unwrap(), fingerprint(&data));
    }

    #[test]
    fn ranges_past_the_verified_prefix_are_unchecked() {
        let (_d, t) = table(8);
        // Locks trivially succeed and clears are no-ops beyond the table.
        assert!(t.try_lock_ranges(&[(100, 4)]));
        t.clear_range(100, 4, true);
        t.unlock_ranges(&[(100, 4)]);
        // A range straddling the boundary only touches the prefix.
        t.record_write(&[0xaau8; 4096], 6, 8, 512);
        assert!(t.entry(7).is_some());
        assert!(t.entry(8).is_none());
    }

    #[test]
    fn unlock_all_clears_every_lock_bit() {
        let (_d, t) = table(32);
        assert!(t.try_lock_ranges(&[(0, 8), (16, 8)]));
        t.unlock_all();
        for lba in 0..32 {
            assert_eq!(t.entry(lba).unwrap() & LOCK_BIT, 0);
        }
    }

    #[test]
    fn attach_sees_creator_state() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::with_base(dir.path());
        let t = IntegrityTable::create(&reg, "ns1", 16).unwrap();
        t.set_enabled(true);
        t.record_write(&block(3, 1, 512), 3, 1, 512);

        let t2 = IntegrityTable::attach(&reg, "ns1").unwrap();
        assert_eq!(t2.nlba(), 16);
        assert!(t2.enabled());
        assert_eq!(t2.entry(3), t.entry(3));
    }

    #[test]
    fn reset_clears_mappings_and_locks() {
        let (_d, t) = table(8);
        t.record_write(&block(0, 9, 512), 0, 1, 512);
        t.try_lock_ranges(&[(1, 2)]);
        t.reset();
        for lba in 0..8 {
            assert_eq!(t.entry(lba).unwrap(), 0);
        }
        assert!(t.enabled());
    }
}
