use core::ptr::addr_of_mut;
use linked_list_allocator::LockedHeap;

// 1. DEFINE THE HEAP
// Host test builds keep the system allocator.
#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// 2. DEFINE THE MEMORY REGION
// A chunk of BSS inside the kernel image. Process kernel stacks and the
// log history come out of here.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

static mut HEAP_MEM: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

// 3. INITIALIZE
pub fn init_heap() {
    unsafe {
        let heap_start = addr_of_mut!(HEAP_MEM) as *mut u8;
        ALLOCATOR.lock().init(heap_start, HEAP_SIZE);
    }
}

/// (used, total) bytes.
pub fn heap_usage() -> (usize, usize) {
    let heap = ALLOCATOR.lock();
    (heap.used(), heap.size())
}
