//! Driver lifecycle: process role, the shared config word and IO token.
//!
//! Nothing here is a file-scope global. The [`Driver`] owns handles onto
//! the two fixed-name shared regions and clones them out to controllers
//! and workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use nvr_shm::{Region, Registry, ShmError};
use nvr_time::{Clock, ClockRef, MonotonicClock};
use tracing::{debug, info};

pub const DRIVER_IO_TOKEN_NAME: &str = "driver_io_token";
pub const DRIVER_GLOBAL_CONFIG_NAME: &str = "driver_global_config";

bitflags! {
    /// Global configuration word, shared by every attached process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DriverConfig: u64 {
        /// Integrity-verify every read completion.
        const VERIFY_READ = 1 << 0;
        /// Prefer MSI-X over MSI on PCIe devices supporting both.
        const ENABLE_MSIX = 1 << 1;
        /// Default force-unit-access on reads.
        const FUA_READ = 1 << 2;
        /// Default force-unit-access on writes.
        const FUA_WRITE = 1 << 3;
        /// Terminate signal observed by every running IO-worker.
        const IOW_TERM = 1 << 4;
    }
}

/// Which side of the multi-process protocol this process plays. The
/// primary creates shared state and drives device lifecycle; secondaries
/// only look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Primary,
    Secondary,
}

impl ProcessRole {
    pub fn is_primary(self) -> bool {
        matches!(self, ProcessRole::Primary)
    }
}

/// Cloneable handle to the shared config word.
#[derive(Debug, Clone)]
pub struct ConfigWord {
    region: Arc<Region>,
}

impl ConfigWord {
    fn word(&self) -> &AtomicU64 {
        self.region.atomic_u64(0)
    }

    pub fn get(&self) -> DriverConfig {
        DriverConfig::from_bits_retain(self.word().load(Ordering::SeqCst))
    }

    /// Latest writer wins; returns what was written.
    pub fn set(&self, cfg: DriverConfig) -> DriverConfig {
        self.word().store(cfg.bits(), Ordering::SeqCst);
        cfg
    }

    pub fn insert(&self, flags: DriverConfig) {
        self.word().fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn remove(&self, flags: DriverConfig) {
        self.word().fetch_and(!flags.bits(), Ordering::SeqCst);
    }
}

/// Cloneable handle to the shared, monotonically increasing IO token.
///
/// Every write advances the counter by its block count, so each
/// block-sized payload ever written by any process carries a unique final
/// word. The counter starts at 1: a token is never zero.
#[derive(Debug, Clone)]
pub struct IoToken {
    region: Arc<Region>,
}

impl IoToken {
    /// Claim `lba_count` consecutive token values; returns the first.
    pub fn advance(&self, lba_count: u32) -> u64 {
        self.region
            .atomic_u64(0)
            .fetch_add(lba_count as u64, Ordering::SeqCst)
    }

    pub fn peek(&self) -> u64 {
        self.region.atomic_u64(0).load(Ordering::SeqCst)
    }
}

/// Process-wide driver state. Created once per process via [`Driver::init`]
/// (or [`Driver::init_with`] in tests, pointing at a scratch registry).
pub struct Driver {
    role: ProcessRole,
    registry: Registry,
    clock: ClockRef,
    config: ConfigWord,
    token: IoToken,
    rng_seed: AtomicU64,
    /// Distinguishes this process's per-queue regions; the OS pid unless
    /// overridden (tests run both roles inside one process).
    process_tag: u32,
}

impl Driver {
    pub fn init(role: ProcessRole) -> Result<Driver, ShmError> {
        Self::init_with(role, Registry::system(), Arc::new(MonotonicClock::new()))
    }

    pub fn init_with(
        role: ProcessRole,
        registry: Registry,
        clock: ClockRef,
    ) -> Result<Driver, ShmError> {
        let (config_region, token_region) = match role {
            ProcessRole::Primary => {
                let config = registry.create(DRIVER_GLOBAL_CONFIG_NAME, 8)?;
                let token = registry.create(DRIVER_IO_TOKEN_NAME, 8)?;
                // Token 0 is reserved.
                token.atomic_u64(0).store(1, Ordering::SeqCst);
                (config, token)
            }
            ProcessRole::Secondary => (
                registry.lookup_sized(DRIVER_GLOBAL_CONFIG_NAME, 8)?,
                registry.lookup_sized(DRIVER_IO_TOKEN_NAME, 8)?,
            ),
        };

        info!(?role, "driver initialized");
        Ok(Driver {
            role,
            registry,
            clock,
            config: ConfigWord {
                region: Arc::new(config_region),
            },
            token: IoToken {
                region: Arc::new(token_region),
            },
            rng_seed: AtomicU64::new(0x9e37_79b9_7f4a_7c15),
            process_tag: std::process::id(),
        })
    }

    pub fn process_tag(&self) -> u32 {
        self.process_tag
    }

    pub fn set_process_tag(&mut self, tag: u32) {
        self.process_tag = tag;
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn clock(&self) -> ClockRef {
        self.clock.clone()
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    pub fn config(&self) -> ConfigWord {
        self.config.clone()
    }

    pub fn token(&self) -> IoToken {
        self.token.clone()
    }

    /// Fix the base seed so subsequent workers run reproducibly.
    pub fn seed_rng(&self, seed: u64) {
        debug!(seed, "rng seeded");
        self.rng_seed.store(seed, Ordering::SeqCst);
    }

    /// Derive a fresh seed; each call yields a distinct stream.
    pub fn next_seed(&self) -> u64 {
        self.rng_seed
            .fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("role", &self.role)
            .field("config", &self.config.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::with_base(dir.path());
        (dir, reg)
    }

    fn init(role: ProcessRole, reg: &Registry) -> Driver {
        Driver::init_with(role, reg.clone(), Arc::new(MonotonicClock::new())).unwrap()
    }

    #[test]
    fn primary_creates_secondary_attaches() {
        let (_d, reg) = scratch();
        let primary = init(ProcessRole::Primary, &reg);
        let secondary = init(ProcessRole::Secondary, &reg);

        primary
            .config()
            .set(DriverConfig::VERIFY_READ | DriverConfig::FUA_WRITE);
        assert_eq!(
            secondary.config().get(),
            DriverConfig::VERIFY_READ | DriverConfig::FUA_WRITE
        );
    }

    #[test]
    fn secondary_without_primary_fails() {
        let (_d, reg) = scratch();
        assert!(Driver::init_with(
            ProcessRole::Secondary,
            reg.clone(),
            Arc::new(MonotonicClock::new())
        )
        .is_err());
    }

    #[test]
    fn token_starts_at_one_and_advances_by_block_count() {
        let (_d, reg) = scratch();
        let primary = init(ProcessRole::Primary, &reg);
        let secondary = init(ProcessRole::Secondary, &reg);

        let t1 = primary.token().advance(8);
        let t2 = secondary.token().advance(4);
        let t3 = primary.token().advance(1);
        assert_eq!(t1, 1);
        assert_eq!(t2, 9);
        assert_eq!(t3, 13);
    }

    #[test]
    fn iow_term_flag_round_trips() {
        let (_d, reg) = scratch();
        let driver = init(ProcessRole::Primary, &reg);
        let cfg = driver.config();
        cfg.insert(DriverConfig::IOW_TERM);
        assert!(cfg.get().contains(DriverConfig::IOW_TERM));
        cfg.remove(DriverConfig::IOW_TERM);
        assert!(!cfg.get().contains(DriverConfig::IOW_TERM));
    }

    #[test]
    fn seeded_rng_streams_are_reproducible() {
        let (_d, reg) = scratch();
        let driver = init(ProcessRole::Primary, &reg);
        driver.seed_rng(42);
        let a = driver.next_seed();
        driver.seed_rng(42);
        let b = driver.next_seed();
        assert_eq!(a, b);
    }
}
