//! A simple example showing how to use vole
//!
//! `init_task` spawns three tasks, each of which periodically prints a
//! defmt log and then yields. All three share one flat RAM region with the
//! kernel heap, carved out of a single static array since this target has
//! no board-specific linker script wired up.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]

use defmt_semihosting as _;

const SYSTICKS_PER_SCHED_TICK: u32 = 100_000;

/// RAM set aside for the kernel heap and every spawned task's stack
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

/// The kernel's very first task: spawn everything else, then idle
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

/// Our 'hamster' task
fn hamsters() -> ! {
    loop {
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
