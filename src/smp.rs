//! Multiprocessor bring-up through the Limine MP request.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use limine::mp::Cpu;
use limine::response::MpResponse;

use crate::hal::X86Machine;
use crate::percpu::{CoreId, MAX_CORES};
use crate::scheduler::SCHEDULER;
use crate::{apic, gdt, interrupts, percpu, syscall, userspace};

/// Per-core stack for the run loop and every trap handler.
pub const CORE_STACK_SIZE: usize = 64 * 1024;

// How long the BSP waits for APs to report in.
const HANDSHAKE_SPINS: u64 = 50_000_000;

#[repr(C, align(16))]
struct CoreStack(UnsafeCell<[u8; CORE_STACK_SIZE]>);

// SAFETY: stack N is only ever used by core N.
unsafe impl Sync for CoreStack {}

static CORE_STACKS: [CoreStack; MAX_CORES] =
    [const { CoreStack(UnsafeCell::new([0; CORE_STACK_SIZE])) }; MAX_CORES];

/// Cores that finished bring-up.
static ONLINE: AtomicUsize = AtomicUsize::new(0);

pub fn online_cores() -> usize {
    ONLINE.load(Ordering::Acquire)
}

pub fn core_stack_top(core: CoreId) -> u64 {
    CORE_STACKS[core.index()].0.get() as u64 + CORE_STACK_SIZE as u64
}

/// Registers every core Limine reports, BSP first so it gets index 0.
/// Duplicated APIC ids are skipped; so is everything past `max_cores`.
pub fn register_cores(mp: &MpResponse, max_cores: usize) -> Option<CoreId> {
    let bsp_lapic = mp.bsp_lapic_id();
    let cpus = mp.cpus();
    let bsp = cpus.iter().find(|cpu| cpu.lapic_id == bsp_lapic)?;
    let bsp_core = SCHEDULER.register_core(bsp.lapic_id, bsp.id)?;

    for cpu in cpus.iter().filter(|cpu| cpu.lapic_id != bsp_lapic) {
        if SCHEDULER.cores().find_by_hw_id(cpu.lapic_id).is_some() {
            klog_warn!("MP: duplicate APIC id {:#x}, ignored", cpu.lapic_id);
            continue;
        }
        if SCHEDULER.cores().registered_count() >= max_cores {
            klog_info!("MP: max_cores = {} reached, leaving the rest parked", max_cores);
            break;
        }
        SCHEDULER.register_core(cpu.lapic_id, cpu.id);
    }

    klog_info!(
        "MP: {} CPUs reported, {} registered, BSP APIC {:#x}",
        cpus.len(),
        SCHEDULER.cores().registered_count(),
        bsp_lapic
    );
    Some(bsp_core)
}

/// Per-core hardware setup, run on the core itself.
pub fn bring_up_core(core: CoreId) {
    gdt::install(core);
    interrupts::init_idt();
    percpu::publish(core, core_stack_top(core));
    syscall::init();
    apic::enable();
    apic::arm_timer();
    ONLINE.fetch_add(1, Ordering::AcqRel);
}

/// Starts every registered AP and waits (bounded) for them to come online.
pub fn start_aps(mp: &MpResponse) {
    let bsp_lapic = mp.bsp_lapic_id();
    let mut started = 0usize;

    for cpu in mp.cpus().iter().filter(|cpu| cpu.lapic_id != bsp_lapic) {
        let Some(core) = SCHEDULER.cores().find_by_hw_id(cpu.lapic_id) else {
            continue;
        };
        cpu.extra.store(core.index() as u64, Ordering::Release);
        cpu.goto_address.write(ap_entry);
        started += 1;
    }

    let expected = started + 1;
    let mut spins = 0u64;
    while online_cores() < expected && spins < HANDSHAKE_SPINS {
        core::hint::spin_loop();
        spins += 1;
    }
    if online_cores() < expected {
        klog_warn!("MP: only {} of {} cores came online", online_cores(), expected);
    } else {
        klog_info!("MP: {} cores online", expected);
    }
}

unsafe extern "C" fn ap_entry(cpu: &Cpu) -> ! {
    x86_64::instructions::interrupts::disable();
    let index = cpu.extra.load(Ordering::Acquire);
    // Leave the bootstrap stack Limine gave us for the core's own.
    let top = core_stack_top(CoreId::from_index(index as usize));
    userspace::enter_on_stack(top, ap_main, index)
}

extern "C" fn ap_main(index: u64) -> ! {
    let core = CoreId::from_index(index as usize);
    bring_up_core(core);
    klog_info!("MP: core {} online (APIC {:#x})", core.index(), apic::id());
    SCHEDULER.run(core, &X86Machine)
}
