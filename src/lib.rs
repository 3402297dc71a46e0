//! A minimal pre-emptive multitasking kernel core for memory-constrained
//! microcontrollers
//!
//! One flat region of RAM is shared between a heap, which grows up from a
//! base address, and task stacks, which grow down from the top of RAM as
//! tasks are [`spawn`]ed. A round-robin [`scheduler`] pre-empts tasks on a
//! SysTick-driven schedule using full register-context switches through
//! PendSV, and a millisecond [`clock`] backs [`delay`].
//!
//! Logging, output, input, and the board's error indicator are all outside
//! this crate's scope (see [`error::ErrorSink`]); this crate owns the heap,
//! the scheduler, and the clock, and nothing else.

#![cfg_attr(not(test), no_std)]

pub mod allocator;
pub mod clock;
pub mod critical;
pub mod error;
pub mod pcb;
mod scheduler;
mod stack_pusher;

#[cfg(target_arch = "arm")]
mod asm;

pub use error::{ErrorKind, ErrorSink, set_error_sink};
pub use pcb::{Pid, Program};

/// A reasonable default stack size for a spawned task, sized for the
/// register context this kernel saves on every switch
pub const DEFAULT_STACK_SIZE: usize = scheduler::Scheduler::DEFAULT_STACK_SIZE;

/// Bring up the kernel and start running tasks
///
/// Initialises the clock and the heap, places the root process-control
/// block at the top of RAM, spawns `init_task` as the first task, arms
/// SysTick, and fires the first context switch. Never returns.
///
/// Call this once, from `fn main()`, after configuring any board
/// peripherals and registering an [`ErrorSink`] with [`set_error_sink`] if
/// you want fatal errors to reach something other than `defmt`.
///
/// # Safety
///
/// `heap_base` and `ram_top` must describe two disjoint, non-overlapping
/// sub-regions of RAM not otherwise in use, with `heap_base < ram_top`,
/// and neither may alias memory already claimed by the board (the stack
/// `main` itself runs on, static data, etc).
pub unsafe fn init(
    heap_base: *mut u8,
    ram_top: *mut u8,
    init_task: Program,
    syst: cortex_m::peripheral::SYST,
    systicks_per_sched_tick: u32,
) -> ! {
    clock::init();
    // SAFETY: caller guarantees heap_base is valid, unused RAM, disjoint
    // from the `ram_top`-rooted PCB chain.
    unsafe { allocator::init(heap_base) };
    // SAFETY: caller guarantees ram_top leaves room for the PCB chain and
    // does not overlap the heap.
    unsafe {
        scheduler::SCHEDULER.init(
            ram_top,
            init_task,
            DEFAULT_STACK_SIZE,
            syst,
            systicks_per_sched_tick,
        )
    }
}

/// Create a new task running `program`, with at least `min_stack_size`
/// bytes of stack
///
/// Returns [`Pid::NULL`] if there is no room left between the heap and the
/// task stacks to satisfy the request.
pub fn spawn(program: Program, min_stack_size: usize) -> Pid {
    scheduler::SCHEDULER.spawn(program, min_stack_size)
}

/// The identity of the currently running task
pub fn current_pid() -> Pid {
    scheduler::SCHEDULER.current_pid()
}

/// Allocate `count` bytes from the kernel heap, owned by the current task
///
/// Returns a null pointer if no chunk is free and big enough.
pub fn allocate(count: usize) -> *mut u8 {
    allocator::allocate(count)
}

/// Free a pointer previously returned by [`allocate`]
pub fn free(ptr: *mut u8) {
    allocator::free(ptr);
}

/// Milliseconds elapsed since [`init`]
pub fn time_since_init() -> u32 {
    clock::time_since_init()
}

/// An alias for [`time_since_init`]
pub fn now() -> u32 {
    clock::time_since_init()
}

/// Block the calling task for at least `ms` milliseconds
pub fn delay(ms: u32) {
    clock::delay(ms);
}

/// SysTick Handler
///
/// Call-compatible with `cortex-m-rt`'s exception table: wire this symbol
/// up as the board's `SysTick` handler. Drives the scheduler's quantum, not
/// the millisecond clock — those tick independently, the same way the
/// original two-timer design keeps scheduling cadence and wall-clock time
/// decoupled. The board should wire a separate millisecond-rate timer
/// interrupt to call [`clock::tick`].
#[unsafe(no_mangle)]
extern "C" fn SysTick() {
    if let Some(scheduler) = scheduler::Scheduler::get_scheduler() {
        scheduler.sched_tick();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    defmt::println!("PANIC: {}", defmt::Debug2Format(info));
    cortex_m::asm::udf();
}

#[cfg(target_arch = "arm")]
#[cortex_m_rt::exception]
unsafe fn HardFault(info: &cortex_m_rt::ExceptionFrame) -> ! {
    defmt::println!("FAULT: {}", defmt::Debug2Format(info));
    cortex_m::asm::udf();
}

defmt::timestamp!("{=u32:010}", now());

// End of File
