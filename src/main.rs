#![no_std]
#![no_main]

// --- EXTERNAL CRATES ---
extern crate alloc;

use core::fmt::Write as _;

use limine::BaseRevision;
use limine::request::{FramebufferRequest, HhdmRequest, MemoryMapRequest, ModuleRequest, MpRequest};

use kairos::config::BootConfig;
use kairos::hal::X86Machine;
use kairos::scheduler::SCHEDULER;
use kairos::{allocator, apic, interrupts, klog_info, klog_warn, logger, memory, programs, serial, smp, state, userspace, writer};

// --- LIMINE BOOTLOADER REQUESTS ---
#[used]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

#[used]
static MP_REQUEST: MpRequest = MpRequest::new();

const CONFIG_MODULE_SUFFIX: &str = "kairos.cfg";

// --- PANIC HANDLER ---
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    apic::disarm_timer();
    serial::write_fmt_forced(format_args!("\n[KERNEL PANIC] {}\n", info));

    writer::print("\n\n!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!\n");
    writer::print("[KERNEL PANIC]\n");
    if let Some(location) = info.location() {
        let mut line = heapless_line();
        let _ = write!(line, "Source: {}:{}\n", location.file(), location.line());
        writer::print(line.as_str());
    }
    writer::print("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!\n");
    loop {
        x86_64::instructions::hlt();
    }
}

/// Fixed buffer for formatting in the panic path, where the heap may be
/// the thing that broke.
struct PanicLine {
    buf: [u8; 160],
    len: usize,
}

impl PanicLine {
    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("?")
    }
}

impl core::fmt::Write for PanicLine {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn heapless_line() -> PanicLine {
    PanicLine { buf: [0; 160], len: 0 }
}

// --- KERNEL ENTRY POINT ---
#[no_mangle]
pub extern "C" fn _start() -> ! {
    x86_64::instructions::interrupts::disable();

    // -----------------------------------------------------------------------
    // 1. MEMORY
    // -----------------------------------------------------------------------
    allocator::init_heap();
    let Some(hhdm) = HHDM_REQUEST.get_response() else {
        halt_forever("no HHDM response from bootloader");
    };
    let Some(memmap) = MEMMAP_REQUEST.get_response() else {
        halt_forever("no memory map from bootloader");
    };
    memory::init(hhdm.offset(), memmap);

    // -----------------------------------------------------------------------
    // 2. VIDEO
    // -----------------------------------------------------------------------
    let framebuffer = FRAMEBUFFER_REQUEST
        .get_response()
        .and_then(|response| response.framebuffers().next());
    if let Some(fb) = &framebuffer {
        writer::Writer::init(
            fb.addr() as *mut u32,
            fb.width() as usize,
            fb.height() as usize,
            fb.pitch() as usize / 4,
        );
    }

    // -----------------------------------------------------------------------
    // 3. CONFIGURATION
    // -----------------------------------------------------------------------
    let boot = state::BOOT_CONFIG.call_once(load_boot_config);
    logger::set_level(boot.log_level);
    apic::set_timer_initial_count(boot.timer_initial_count);
    klog_info!("Kairos: booting ({:?})", boot);
    if framebuffer.is_none() {
        klog_warn!("no framebuffer; logging to serial only");
    }

    if boot.color_demo {
        if let Some(fb) = &framebuffer {
            color_ramp(fb.addr() as *mut u32, fb.width() as usize, fb.height() as usize, fb.pitch() as usize / 4);
        }
    }

    // -----------------------------------------------------------------------
    // 4. BOOTSTRAP PROCESSOR
    // -----------------------------------------------------------------------
    interrupts::disable_legacy_pic();
    if let Err(e) = apic::init() {
        halt_forever_fmt(format_args!("local APIC unusable: {}", e));
    }

    let mp = MP_REQUEST.get_response();
    let bsp = match mp {
        Some(mp) => smp::register_cores(mp, boot.max_cores),
        None => {
            klog_warn!("MP: no response from bootloader, running on the BSP alone");
            None
        }
    };
    // Without an MP response the BSP still needs a slot.
    let bsp = match bsp.or_else(|| SCHEDULER.register_core(apic::id(), 0)) {
        Some(core) => core,
        None => halt_forever("could not register the bootstrap core"),
    };
    smp::bring_up_core(bsp);
    klog_info!("BSP: core {} up, APIC {:#x}", bsp.index(), apic::id());

    // -----------------------------------------------------------------------
    // 5. APPLICATION PROCESSORS
    // -----------------------------------------------------------------------
    if let Some(mp) = mp {
        smp::start_aps(mp);
    }

    // -----------------------------------------------------------------------
    // 6. WORKLOAD
    // -----------------------------------------------------------------------
    let spawned = programs::spawn_demo(boot.demo_processes, &X86Machine);
    let (used, total) = allocator::heap_usage();
    klog_info!(
        "{} demo processes on {} cores, heap {}/{} KiB",
        spawned,
        smp::online_cores(),
        used / 1024,
        total / 1024
    );

    // -----------------------------------------------------------------------
    // 7. SCHEDULE
    // -----------------------------------------------------------------------
    userspace::enter_on_stack(smp::core_stack_top(bsp), bsp_main, bsp.index() as u64)
}

extern "C" fn bsp_main(index: u64) -> ! {
    SCHEDULER.run(kairos::percpu::CoreId::from_index(index as usize), &X86Machine)
}

fn load_boot_config() -> BootConfig {
    let Some(response) = MODULE_REQUEST.get_response() else {
        return BootConfig::default();
    };
    for module in response.modules() {
        let path = module.path().to_str().unwrap_or("");
        if !path.ends_with(CONFIG_MODULE_SUFFIX) {
            continue;
        }
        let bytes = unsafe { core::slice::from_raw_parts(module.addr() as *const u8, module.size() as usize) };
        return match core::str::from_utf8(bytes) {
            Ok(text) => BootConfig::load(text),
            Err(_) => {
                klog_warn!("config: {} is not UTF-8, using defaults", path);
                BootConfig::default()
            }
        };
    }
    BootConfig::default()
}

/// Full-screen color ramp. Debug scaffolding for checking the framebuffer
/// format.
fn color_ramp(video_ptr: *mut u32, width: usize, height: usize, pitch: usize) {
    for y in 0..height {
        for x in 0..width {
            let r = (x * 255 / width.max(1)) as u32;
            let g = (y * 255 / height.max(1)) as u32;
            let b = 255 - r;
            unsafe { *video_ptr.add(y * pitch + x) = (r << 16) | (g << 8) | b };
        }
    }
    for _ in 0..20_000_000 {
        core::hint::spin_loop();
    }
    if let Some(console) = writer::WRITER.lock().as_mut() {
        console.clear();
    }
    // Put back the boot log the ramp painted over.
    for line in logger::drain() {
        writer::print(&line);
        writer::print("\n");
    }
}

fn halt_forever(reason: &str) -> ! {
    halt_forever_fmt(format_args!("{}", reason))
}

fn halt_forever_fmt(reason: core::fmt::Arguments) -> ! {
    kairos::klog_error!("boot halted: {}", reason);
    apic::disarm_timer();
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
