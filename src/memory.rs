use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, PageTable, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::state;

const PAGE_SIZE: u64 = 4096;
const MAX_REGIONS: usize = 64;
// Leave the first megabyte alone; Limine protects kernel and modules.
const LOW_MEMORY_END: u64 = 0x100_000;

static FRAME_ALLOCATOR: Mutex<BootFrameAllocator> = Mutex::new(BootFrameAllocator::empty());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    OutOfFrames,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::OutOfFrames => f.write_str("out of physical frames"),
        }
    }
}

/// Bump allocator over the usable regions of the boot memory map. Frames
/// are never freed.
pub struct BootFrameAllocator {
    regions: [(u64, u64); MAX_REGIONS],
    region_count: usize,
    region: usize,
    offset: u64,
}

impl BootFrameAllocator {
    pub const fn empty() -> Self {
        BootFrameAllocator {
            regions: [(0, 0); MAX_REGIONS],
            region_count: 0,
            region: 0,
            offset: 0,
        }
    }

    /// Takes `(base, length)` pairs of usable RAM. Regions are trimmed to
    /// whole pages above the first megabyte; extras beyond the table size
    /// are ignored.
    pub fn from_regions(regions: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut allocator = Self::empty();
        for (base, length) in regions {
            let start = base.max(LOW_MEMORY_END).next_multiple_of(PAGE_SIZE);
            let end = (base + length) & !(PAGE_SIZE - 1);
            if end <= start {
                continue;
            }
            if allocator.region_count == MAX_REGIONS {
                break;
            }
            allocator.regions[allocator.region_count] = (start, end - start);
            allocator.region_count += 1;
        }
        allocator
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        while self.region < self.region_count {
            let (base, length) = self.regions[self.region];
            if self.offset < length {
                let addr = base + self.offset;
                self.offset += PAGE_SIZE;
                return Some(PhysFrame::containing_address(PhysAddr::new(addr)));
            }
            self.region += 1;
            self.offset = 0;
        }
        None
    }
}

pub fn init(hhdm_offset: u64, memmap: &limine::response::MemoryMapResponse) {
    use limine::memory_map::EntryType;

    state::HHDM_OFFSET.store(hhdm_offset, core::sync::atomic::Ordering::Relaxed);
    let usable = memmap
        .entries()
        .iter()
        .filter(|e| e.entry_type == EntryType::USABLE)
        .map(|e| (e.base, e.length));
    *FRAME_ALLOCATOR.lock() = BootFrameAllocator::from_regions(usable);
}

/// Gets a fresh, zeroed physical frame.
pub fn alloc_frame() -> Option<PhysAddr> {
    let frame = FRAME_ALLOCATOR.lock().allocate_frame()?;
    let phys = frame.start_address();
    unsafe { zero_frame(phys.as_u64()) };
    Some(phys)
}

/// Maps a page the user may touch, opening up every level above it.
pub unsafe fn map_user_page(virt: u64, phys: u64) -> Result<(), MapError> {
    map_page(virt, phys, PageTableFlags::USER_ACCESSIBLE)
}

/// Maps a kernel page (No Ring 3 access). Uncached, for MMIO.
pub unsafe fn map_mmio_page(virt: u64, phys: u64) -> Result<(), MapError> {
    map_page(virt, phys, PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH)
}

unsafe fn map_page(virt: u64, phys: u64, extra: PageTableFlags) -> Result<(), MapError> {
    let addr = VirtAddr::new(virt);
    let user = extra & PageTableFlags::USER_ACCESSIBLE;
    let table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | user;

    let (l4_frame, _) = x86_64::registers::control::Cr3::read();
    let mut table = table_at(l4_frame.start_address().as_u64());

    // Walk levels 4, 3, 2, creating or widening each entry.
    for index in [addr.p4_index(), addr.p3_index(), addr.p2_index()] {
        let entry = &mut table[index];
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            // Already covered by a large boot mapping.
            return Ok(());
        }
        if entry.is_unused() {
            let frame = alloc_frame().ok_or(MapError::OutOfFrames)?;
            entry.set_addr(frame, table_flags);
        } else if !user.is_empty() {
            entry.set_flags(entry.flags() | table_flags);
        }
        table = table_at(entry.addr().as_u64());
    }

    table[addr.p1_index()].set_addr(
        PhysAddr::new(phys),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | extra,
    );
    x86_64::instructions::tlb::flush(addr);
    Ok(())
}

/// Walks the active tables for `virt`. True only if every level is present
/// and open to ring 3.
pub fn user_page_accessible(virt: u64) -> bool {
    let Ok(addr) = VirtAddr::try_new(virt) else {
        return false;
    };
    let required = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;

    let (l4_frame, _) = x86_64::registers::control::Cr3::read();
    let mut table: &PageTable = unsafe { table_at(l4_frame.start_address().as_u64()) };
    let indices = [addr.p4_index(), addr.p3_index(), addr.p2_index(), addr.p1_index()];
    for (level, index) in indices.into_iter().enumerate() {
        let entry = &table[index];
        if !entry.flags().contains(required) {
            return false;
        }
        // Level 1 always ends the walk; levels 3 and 2 may map a large page.
        if level == 3 || (level > 0 && entry.flags().contains(PageTableFlags::HUGE_PAGE)) {
            return true;
        }
        table = unsafe { table_at(entry.addr().as_u64()) };
    }
    false
}

unsafe fn table_at(phys: u64) -> &'static mut PageTable {
    &mut *(state::phys_to_virt(phys) as *mut PageTable)
}

unsafe fn zero_frame(phys: u64) {
    let ptr = state::phys_to_virt(phys) as *mut u64;
    for i in 0..(PAGE_SIZE as usize / 8) {
        core::ptr::write_volatile(ptr.add(i), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take_all(allocator: &mut BootFrameAllocator) -> Vec<u64> {
        core::iter::from_fn(|| allocator.allocate_frame())
            .map(|f| f.start_address().as_u64())
            .collect()
    }

    #[test]
    fn skips_low_memory_and_partial_pages() {
        let mut allocator = BootFrameAllocator::from_regions([
            (0x1000, 0x3000),           // below 1 MiB
            (0x0f_f000, 0x3000),        // straddles 1 MiB
            (0x20_0800, 0x2000),        // unaligned
        ]);
        assert_eq!(take_all(&mut allocator), [0x10_0000, 0x10_1000, 0x20_1000]);
    }

    #[test]
    fn exhausted_allocator_keeps_returning_none() {
        let mut allocator = BootFrameAllocator::from_regions([(0x10_0000, 0x1000)]);
        assert!(allocator.allocate_frame().is_some());
        assert!(allocator.allocate_frame().is_none());
        assert!(allocator.allocate_frame().is_none());
    }
}
