#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use kaos::boot::KernelLayout;
use kaos::constants::memory::BOOT_STACK_TOP;
use kaos::memory::paging::PageTableFlags;
use kaos::memory::{self, PhysAddr};
use kaos::{idle_loop, interrupts, processes, serial_println};

// Multiboot header: page-align modules, request a memory map.
core::arch::global_asm!(
    ".section .multiboot, \"a\"",
    ".balign 4",
    ".long 0x1BADB002",
    ".long 0x00000003",
    ".long -(0x1BADB002 + 0x00000003)",
    ".section .text",
    ".global _start",
    "_start:",
    "    cli",
    "    mov esp, {stack_top}",
    "    push ebx",
    "    push eax",
    "    call kmain",
    "1:",
    "    hlt",
    "    jmp 1b",
    stack_top = const BOOT_STACK_TOP,
);

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
    static __user_start: u8;
    static __user_end: u8;
}

const USER_TASKS: usize = 2;
const USER_STACK_SIZE: usize = 4096;

#[repr(C, align(4096))]
struct UserStack([u8; USER_STACK_SIZE]);

#[link_section = ".user_data"]
static mut USER_STACKS: [UserStack; USER_TASKS] =
    [UserStack([0; USER_STACK_SIZE]), UserStack([0; USER_STACK_SIZE])];

/// Progress of each user task, bumped from ring 3.
#[link_section = ".user_data"]
static USER_COUNTERS: [AtomicU32; USER_TASKS] = [AtomicU32::new(0), AtomicU32::new(0)];

#[link_section = ".user_text"]
#[inline(never)]
extern "C" fn user_spin(counter: &AtomicU32) -> ! {
    loop {
        counter.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }
}

#[link_section = ".user_text"]
extern "C" fn user0() -> ! {
    user_spin(&USER_COUNTERS[0])
}

#[link_section = ".user_text"]
extern "C" fn user1() -> ! {
    user_spin(&USER_COUNTERS[1])
}

/// Kernel thread reporting user task progress about once a second.
extern "C" fn monitor() -> ! {
    let mut last = 0;
    loop {
        let ticks = interrupts::timer::ticks();
        if ticks / 100 != last {
            last = ticks / 100;
            log::info!(
                "[{}s] task {:?}: user0 {} user1 {}",
                last,
                processes::current(),
                USER_COUNTERS[0].load(Ordering::Relaxed),
                USER_COUNTERS[1].load(Ordering::Relaxed)
            );
        }
        kaos::arch::halt();
    }
}

#[no_mangle]
extern "C" fn kmain(magic: u32, info_addr: u32) -> ! {
    let layout = unsafe {
        KernelLayout::new(
            &__kernel_start as *const u8 as u32,
            &__kernel_end as *const u8 as u32,
        )
    };
    kaos::init::init(magic, info_addr, layout);

    let (user_start, user_end) =
        unsafe { (&__user_start as *const u8 as u32, &__user_end as *const u8 as u32) };
    if let Err(err) = memory::identity_map(
        PhysAddr::new(user_start),
        PhysAddr::new(user_end),
        PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
    ) {
        panic!("Mapping user pages failed: {}", err);
    }

    let entries: [extern "C" fn() -> !; USER_TASKS] = [user0, user1];
    for (n, entry) in entries.iter().enumerate() {
        let stack_top = unsafe {
            core::ptr::addr_of!(USER_STACKS[n]) as u32 + USER_STACK_SIZE as u32
        };
        let name = if n == 0 { "user0" } else { "user1" };
        if let Err(err) = processes::create_task(*entry as usize as u32, stack_top, name) {
            panic!("Creating {} failed: {}", name, err);
        }
    }
    if let Err(err) = processes::create_kernel_task(monitor, "monitor") {
        panic!("Creating monitor failed: {}", err);
    }

    processes::start()
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    interrupts::disable();
    serial_println!("Kernel panic: {}", info);
    idle_loop();
}
