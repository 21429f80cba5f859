use crate::{
    arch::cpu,
    boot::{multiboot, KernelLayout},
    interrupts, logging, memory, processes,
};

/// Brings the core up in dependency order: logging, descriptor tables,
/// interrupt routing, the frame allocator and page tables, then the
/// scheduler. Interrupts are still masked when this returns.
pub fn init(magic: u32, info_addr: u32, layout: KernelLayout) {
    logging::init();
    log::info!("Booting kaos...");
    cpu::log_summary(&cpu::probe());

    #[cfg(target_arch = "x86")]
    interrupts::gdt::init();
    interrupts::init();

    let boot_info = match unsafe { multiboot::from_multiboot(magic, info_addr, layout) } {
        Ok(info) => info,
        Err(err) => panic!("Boot information unusable: {}", err),
    };
    log::info!(
        "Kernel image {:#x}-{:#x}, boot stack {:#x}-{:#x}",
        layout.image_start,
        layout.image_end,
        layout.stack_start,
        layout.stack_end
    );

    if let Err(err) = memory::init_paging(&boot_info) {
        panic!("Memory initialization failed: {}", err);
    }
    if let Err(err) = memory::enable_paging() {
        panic!("Enabling paging failed: {}", err);
    }

    processes::init();
}
