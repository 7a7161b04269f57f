use core::sync::atomic::{AtomicU64, Ordering};
use spin::Once;

use crate::config::BootConfig;

// Store the High Half Direct Map offset globally
pub static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Settings read from `kairos.cfg` (or the defaults) at boot.
pub static BOOT_CONFIG: Once<BootConfig> = Once::new();

pub fn hhdm() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Kernel-visible address of physical memory at `phys`.
pub fn phys_to_virt(phys: u64) -> u64 {
    phys + hhdm()
}

pub fn boot_config() -> BootConfig {
    BOOT_CONFIG.get().copied().unwrap_or_default()
}
