//! An example exercising the heap allocator alongside three tasks that all
//! run once per tick, rather than delaying

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]

use defmt_semihosting as _;

const SYSTICKS_PER_SCHED_TICK: u32 = 100_000;

#[repr(align(8))]
struct Ram([u8; 8192]);

static mut RAM: Ram = Ram([0u8; 8192]);

#[cortex_m_rt::entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().unwrap();
    defmt::info!("Hello!");

    // SAFETY: RAM is a single static, never aliased anywhere else in this
    // binary, and init() is only called this once before any task runs.
    let heap_base = core::ptr::addr_of_mut!(RAM) as *mut u8;
    let ram_top = unsafe { heap_base.add(core::mem::size_of::<Ram>()) };

    unsafe { vole::init(heap_base, ram_top, init_task, cp.SYST, SYSTICKS_PER_SCHED_TICK) }
}

fn init_task() -> ! {
    vole::spawn(rabbits, vole::DEFAULT_STACK_SIZE);
    vole::spawn(hamsters, vole::DEFAULT_STACK_SIZE);
    vole::spawn(cats, vole::DEFAULT_STACK_SIZE);
    loop {
        vole::delay(0);
    }
}

/// Our 'rabbit' task
fn rabbits() -> ! {
    loop {
        defmt::info!("Rabbit!");
        vole::delay(0);
    }
}

/// Our 'hamster' task: allocates a small buffer from the shared heap every
/// tick, writes a pattern into it, then frees it again, to show the heap
/// staying in a single coalesced chunk across repeated use
fn hamsters() -> ! {
    loop {
        let p = vole::allocate(16);
        if !p.is_null() {
            // SAFETY: `p` is a freshly allocated 16-byte buffer owned by
            // this task; nothing else can touch it before it is freed.
            unsafe {
                core::ptr::write_bytes(p, 0xAA, 16);
            }
            vole::free(p);
        }
        defmt::info!("Hamster!");
        vole::delay(0);
    }
}

/// Our 'cat' task
fn cats() -> ! {
    loop {
        defmt::info!("Cat!");
        vole::delay(0);
    }
}

// End of File
