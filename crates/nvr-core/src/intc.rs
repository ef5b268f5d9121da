//! Software interrupt-control block for PCIe controllers.
//!
//! A small shared region records, per vector, a pending bit (the PBA
//! analogue) and a fired bit the data plane tests and clears. Masking a
//! vector keeps deliveries pending until unmask. Vector table programming
//! itself belongs to the transport; this block is only the state scripts
//! and queue pairs observe.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nvr_shm::{Region, Registry, ShmError};

pub const INTC_MAX_VECTORS: usize = 64;

// Layout: three u32 words per vector: fired, masked, pending.
const STRIDE: usize = 12;
const REGION_SIZE: usize = INTC_MAX_VECTORS * STRIDE;

pub fn intc_region_name(traddr: &str) -> String {
    format!("intc_ctrl_name{traddr}")
}

pub struct IntcBlock {
    region: Region,
}

pub type IntcRef = Arc<IntcBlock>;

impl IntcBlock {
    pub fn create(registry: &Registry, traddr: &str) -> Result<IntcRef, ShmError> {
        let region = registry.create(&intc_region_name(traddr), REGION_SIZE)?;
        Ok(Arc::new(IntcBlock { region }))
    }

    pub fn attach(registry: &Registry, traddr: &str) -> Result<IntcRef, ShmError> {
        let region = registry.lookup_sized(&intc_region_name(traddr), REGION_SIZE)?;
        Ok(Arc::new(IntcBlock { region }))
    }

    fn word(&self, vector: u16, slot: usize) -> &std::sync::atomic::AtomicU32 {
        assert!((vector as usize) < INTC_MAX_VECTORS, "vector out of range");
        self.region.atomic_u32(vector as usize * STRIDE + slot * 4)
    }

    /// Device side: a completion was posted to a queue bound to `vector`.
    pub fn raise(&self, vector: u16) {
        self.word(vector, 2).store(1, Ordering::SeqCst);
        if self.word(vector, 1).load(Ordering::SeqCst) == 0 {
            self.word(vector, 0).store(1, Ordering::SeqCst);
        }
    }

    pub fn is_set(&self, vector: u16) -> bool {
        self.word(vector, 0).load(Ordering::SeqCst) != 0
    }

    pub fn clear(&self, vector: u16) {
        self.word(vector, 0).store(0, Ordering::SeqCst);
        self.word(vector, 2).store(0, Ordering::SeqCst);
    }

    pub fn mask(&self, vector: u16) {
        self.word(vector, 1).store(1, Ordering::SeqCst);
    }

    /// Unmask; a delivery held pending while masked fires now.
    pub fn unmask(&self, vector: u16) {
        self.word(vector, 1).store(0, Ordering::SeqCst);
        if self.word(vector, 2).load(Ordering::SeqCst) != 0 {
            self.word(vector, 0).store(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for IntcBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntcBlock")
            .field("region", &self.region.name())
            .finish()
    }
}
