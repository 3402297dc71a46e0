//! Contains the [`Scheduler`] type

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::critical;
use crate::error::{self, ErrorKind};
use crate::pcb::{Pcb, Pid, Program, TaskState};
use crate::stack_pusher::StackPusher;

/// The location of our one and only [`Scheduler`] object
///
/// We need this so that the free-standing PendSV handler knows where all
/// our system state is.
pub(crate) static SCHEDULER_PTR: AtomicPtr<Scheduler> = AtomicPtr::new(core::ptr::null_mut());

/// The one scheduler for this kernel
pub(crate) static SCHEDULER: Scheduler = Scheduler::new();

/// A pre-emptive task-switching scheduler
///
/// It time slices tasks in a round-robin fashion, whether or not they have
/// work to do. Tasks are arranged in an address-descending singly linked
/// chain of [`Pcb`]s, rooted at `root` and growing down from the top of
/// RAM; [`crate::spawn`] either recycles an unused PCB already in the
/// chain or extends the chain one PCB further down.
///
/// The Arm hardware pushes {xPSR, PC, LR, R12, R3, R2, R1, R0} to PSP when
/// an exception occurs. We push the rest ({R4-R11, LR}) ourselves.
#[repr(C)]
pub struct Scheduler {
    /// The PCB of the task currently running
    current: AtomicPtr<Pcb>,
    /// The PCB PendSV should switch to next
    next: AtomicPtr<Pcb>,
    /// The top of the PCB chain (the highest address, closest to RAM_TOP)
    root: AtomicPtr<Pcb>,
    /// Tick count, incremented once per scheduler tick
    ticks: AtomicU32,
}

impl Scheduler {
    /// The offset, in bytes, to the `current` field
    pub(crate) const CURRENT_OFFSET: usize = core::mem::offset_of!(Scheduler, current);

    /// The offset, in bytes, to the `next` field
    pub(crate) const NEXT_OFFSET: usize = core::mem::offset_of!(Scheduler, next);

    /// The size, in bytes, of a saved context: the eight words the hardware
    /// stacks automatically ({xPSR, PC, LR, R12, R3, R2, R1, R0}) plus the
    /// nine words we stack ourselves ({R4-R11, LR})
    pub const CONTEXT_SIZE: usize = (8 + 9) * 4;

    /// The minimum stack we can support for a task, given the context we
    /// need to save, plus a little headroom
    pub const MIN_STACK_SIZE: usize = Self::CONTEXT_SIZE + 8;

    /// A reasonable default stack size for a spawned task
    pub const DEFAULT_STACK_SIZE: usize = 256;

    /// The value of the Processor Status Register when a task starts
    ///
    /// The only bit we need to set is the T bit, to indicate that the task
    /// should run in Thumb mode (the only supported mode on Armv7-M).
    const DEFAULT_XPSR: u32 = 1 << 24;

    /// The EXC_RETURN value a never-yet-run task resumes into: return to
    /// Thread mode, use PSP, no floating-point state stacked
    const DEFAULT_EXC_RETURN: u32 = 0xFFFF_FFFD;

    /// Build the scheduler
    const fn new() -> Scheduler {
        Scheduler {
            current: AtomicPtr::new(core::ptr::null_mut()),
            next: AtomicPtr::new(core::ptr::null_mut()),
            root: AtomicPtr::new(core::ptr::null_mut()),
            ticks: AtomicU32::new(0),
        }
    }

    /// Start the kernel
    ///
    /// Places the root PCB at the top of RAM, spawns `init_task` as the
    /// first (and, for now, only) task, arms SysTick, and fires the first
    /// PendSV. You may only call this once, from `fn main()`, once all your
    /// hardware is configured and the allocator has been initialised.
    ///
    /// # Safety
    ///
    /// `ram_top` must point one-past-the-end of RAM not otherwise in use,
    /// with at least `size_of::<Pcb>()` bytes free below it, and must not
    /// overlap the heap region passed to [`crate::allocator::Allocator::init`].
    pub(crate) unsafe fn init(
        &'static self,
        ram_top: *mut u8,
        init_task: Program,
        default_stack_size: usize,
        mut syst: cortex_m::peripheral::SYST,
        systicks_per_sched_tick: u32,
    ) -> ! {
        if !self.root.load(Ordering::SeqCst).is_null() {
            panic!("tried to re-init the scheduler");
        }

        let root_addr = (ram_top as usize).saturating_sub(core::mem::size_of::<Pcb>());
        // SAFETY: caller guarantees `ram_top` leaves room for one Pcb.
        let root = unsafe { Pcb::write_tail(root_addr as *mut Pcb) };
        self.root.store(root, Ordering::Release);

        defmt::info!("root PCB @ {=usize:08x}", root_addr);

        let init_pid = self.spawn(init_task, default_stack_size);
        if init_pid.is_null() {
            error::fatal(ErrorKind::OutOfMemory);
        }
        self.next.store(init_pid.0, Ordering::Release);

        // Remember where this object is - it cannot move, because we never
        // exit this function. Must do this /before/ arming SysTick, because
        // the SysTick and PendSV handlers read SCHEDULER_PTR.
        let self_addr = self as *const Scheduler as *mut Scheduler;
        defmt::info!("SCHEDULER_PTR -> {=usize:08x}", self_addr as usize);
        SCHEDULER_PTR.store(self_addr, Ordering::Release);

        syst.set_reload(systicks_per_sched_tick);
        syst.clear_current();
        syst.enable_counter();
        syst.enable_interrupt();

        defmt::debug!("hit PendSV");
        cortex_m::peripheral::SCB::set_pendsv();
        // Flush the pipeline to ensure PendSV fires before we reach the end
        // of this function.
        cortex_m::asm::isb();
        // impossible to get here
        unreachable!();
    }

    /// Create a new task
    ///
    /// Recycles the first [`TaskState::Unused`] PCB in the chain whose
    /// stack is big enough for `min_stack_size`, or extends the chain one
    /// PCB further down if none qualifies. Returns [`Pid::NULL`] if
    /// extending the chain would collide with the heap.
    pub(crate) fn spawn(&self, program: Program, min_stack_size: usize) -> Pid {
        critical::with(|| unsafe { self.spawn_locked(program, min_stack_size) })
    }

    /// # Safety
    /// Must be called from inside a critical section.
    unsafe fn spawn_locked(&self, program: Program, min_stack_size: usize) -> Pid {
        let root = self.root.load(Ordering::Relaxed);
        if root.is_null() {
            panic!("scheduler not initialised");
        }
        // SAFETY: root is always a valid Pcb once stored.
        let root_pcb = unsafe { &*root };
        let pcb = root_pcb.find_first_unused(min_stack_size, Self::CONTEXT_SIZE);

        if pcb.next().is_null() {
            // `pcb` is the tail of the chain; extend it one PCB further down.
            let pcb_addr = pcb as *const Pcb as usize;
            let needed = min_stack_size + Self::CONTEXT_SIZE + core::mem::size_of::<Pcb>();
            let new_tail_addr = match pcb_addr.checked_sub(needed) {
                Some(addr) => addr,
                None => return Pid::NULL,
            };
            if new_tail_addr <= crate::allocator::top_of_heap() as usize {
                return Pid::NULL;
            }
            // SAFETY: new_tail_addr sits strictly above the heap and below
            // `pcb`, in RAM not otherwise in use.
            let new_tail = unsafe { Pcb::write_tail(new_tail_addr as *mut Pcb) };
            pcb.set_next(new_tail);
        }

        let stack_top_init = pcb as *const Pcb as *mut u32;
        // SAFETY: the region below `stack_top_init` down to `pcb.next()` is
        // this task's reserved stack, guaranteed >= min_stack_size +
        // CONTEXT_SIZE bytes by `find_first_unused` / the extension above.
        let mut pusher = unsafe { StackPusher::new(stack_top_init) };

        // Hardware-stacked frame
        pusher.push(Self::DEFAULT_XPSR);
        pusher.push(program as usize as u32);
        pusher.push(0); // LR
        pusher.push(0); // R12
        pusher.push(0); // R3
        pusher.push(0); // R2
        pusher.push(0); // R1
        pusher.push(0); // R0

        // Software-saved frame
        pusher.push(Self::DEFAULT_EXC_RETURN); // LR (our own, software one)
        pusher.push(0); // R11
        pusher.push(0); // R10
        pusher.push(0); // R9
        pusher.push(0); // R8
        pusher.push(0); // R7
        pusher.push(0); // R6
        pusher.push(0); // R5
        pusher.push(0); // R4

        pcb.set_stack_top(pusher.current());
        pcb.set_state(TaskState::Ready);

        pcb.pid()
    }

    /// The address of the lowest PCB in the chain: the boundary between the
    /// heap and the task stacks
    pub(crate) fn beginning_of_stacks(&self) -> *mut u8 {
        let root = self.root.load(Ordering::Relaxed);
        if root.is_null() {
            return core::ptr::null_mut();
        }
        let mut cursor = root;
        loop {
            // SAFETY: cursor always a valid Pcb, reached by following
            // `next` pointers from `root`.
            let pcb = unsafe { &*cursor };
            let next = pcb.next();
            if next.is_null() {
                return cursor as *mut u8;
            }
            cursor = next;
        }
    }

    /// The identity of the currently running task
    pub(crate) fn current_pid(&self) -> Pid {
        Pid(self.current.load(Ordering::Relaxed))
    }

    /// Call periodically, to get the scheduler to adjust which task should
    /// run next
    ///
    /// Currently a round-robin with no priorities. Ideally call this from a
    /// SysTick handler.
    pub(crate) fn sched_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.pick_next_task();
        cortex_m::peripheral::SCB::set_pendsv();
    }

    /// Get the handle to the global scheduler
    pub(crate) fn get_scheduler() -> Option<&'static Scheduler> {
        let scheduler_ptr = SCHEDULER_PTR.load(Ordering::Relaxed);
        if scheduler_ptr.is_null() {
            None
        } else {
            // SAFETY: Only [`Scheduler::init`] writes to [`SCHEDULER_PTR`]
            // and it always sets it to a valid, non-moving `&'static
            // Scheduler`.
            Some(unsafe { &*scheduler_ptr })
        }
    }

    /// Select the next task to run
    ///
    /// Walks the PCB chain starting just after `current`, wrapping back to
    /// `root`, until it finds a [`TaskState::Ready`] PCB or comes back
    /// around to `current` (meaning nothing else is runnable, so we keep
    /// running the same task). Updates `self.next` but doesn't trigger a
    /// task switch; set PendSV to do that.
    fn pick_next_task(&self) {
        critical::with(|| {
            let current = self.current.load(Ordering::Relaxed);
            let root = self.root.load(Ordering::Relaxed);
            if root.is_null() {
                return;
            }

            let start = if current.is_null() {
                root
            } else {
                // SAFETY: current, when non-null, is always a valid Pcb.
                let next = unsafe { &*current }.next();
                if next.is_null() { root } else { next }
            };

            let mut cursor = start;
            loop {
                if !current.is_null() && cursor == current {
                    break;
                }
                // SAFETY: cursor is always a valid Pcb, reached via `root`
                // or `.next()` chains.
                let pcb = unsafe { &*cursor };
                if pcb.state() == TaskState::Ready {
                    break;
                }
                let next = pcb.next();
                cursor = if next.is_null() { root } else { next };
            }

            self.next.store(cursor, Ordering::Relaxed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny simulated RAM region, large enough to host a handful of PCBs,
    /// used to exercise the round-robin picker on the host without any
    /// real hardware or the global [`SCHEDULER`] singleton.
    #[repr(align(8))]
    struct Ram([u8; 512]);

    fn pcb_at(ram: &mut Ram, offset: usize) -> *mut Pcb {
        (ram.0.as_mut_ptr() as usize + offset) as *mut Pcb
    }

    /// Build a chain of three ready PCBs plus a tail, wire them into a
    /// fresh [`Scheduler`], and return (scheduler, [pcb0, pcb1, pcb2]) with
    /// pcb0 at the highest address (the root).
    fn three_task_chain(ram: &mut Ram) -> (Scheduler, [*mut Pcb; 3]) {
        let tail = pcb_at(ram, 384);
        unsafe { Pcb::write_tail(tail) };

        let pcb2 = pcb_at(ram, 256);
        unsafe { Pcb::write_tail(pcb2) };
        unsafe { &*pcb2 }.set_next(tail);
        unsafe { &*pcb2 }.set_state(TaskState::Ready);

        let pcb1 = pcb_at(ram, 128);
        unsafe { Pcb::write_tail(pcb1) };
        unsafe { &*pcb1 }.set_next(pcb2);
        unsafe { &*pcb1 }.set_state(TaskState::Ready);

        let pcb0 = pcb_at(ram, 0);
        unsafe { Pcb::write_tail(pcb0) };
        unsafe { &*pcb0 }.set_next(pcb1);
        unsafe { &*pcb0 }.set_state(TaskState::Ready);

        let scheduler = Scheduler::new();
        scheduler.root.store(pcb0, Ordering::Relaxed);
        (scheduler, [pcb0, pcb1, pcb2])
    }

    #[test]
    fn round_robin_advances_in_chain_order() {
        let mut ram = Ram([0u8; 512]);
        let (scheduler, pcbs) = three_task_chain(&mut ram);

        scheduler.current.store(pcbs[0], Ordering::Relaxed);
        scheduler.pick_next_task();
        assert_eq!(scheduler.next.load(Ordering::Relaxed), pcbs[1]);

        scheduler.current.store(pcbs[1], Ordering::Relaxed);
        scheduler.pick_next_task();
        assert_eq!(scheduler.next.load(Ordering::Relaxed), pcbs[2]);
    }

    #[test]
    fn round_robin_wraps_at_tail_back_to_root() {
        let mut ram = Ram([0u8; 512]);
        let (scheduler, pcbs) = three_task_chain(&mut ram);

        scheduler.current.store(pcbs[2], Ordering::Relaxed);
        scheduler.pick_next_task();
        assert_eq!(scheduler.next.load(Ordering::Relaxed), pcbs[0]);
    }

    #[test]
    fn round_robin_skips_unused_slots() {
        let mut ram = Ram([0u8; 512]);
        let (scheduler, pcbs) = three_task_chain(&mut ram);
        unsafe { &*pcbs[1] }.set_state(TaskState::Unused);

        scheduler.current.store(pcbs[0], Ordering::Relaxed);
        scheduler.pick_next_task();
        assert_eq!(scheduler.next.load(Ordering::Relaxed), pcbs[2]);
    }

    #[test]
    fn current_task_keeps_running_when_nothing_else_is_ready() {
        let mut ram = Ram([0u8; 512]);
        let (scheduler, pcbs) = three_task_chain(&mut ram);
        unsafe { &*pcbs[1] }.set_state(TaskState::Unused);
        unsafe { &*pcbs[2] }.set_state(TaskState::Unused);

        scheduler.current.store(pcbs[0], Ordering::Relaxed);
        scheduler.pick_next_task();
        assert_eq!(scheduler.next.load(Ordering::Relaxed), pcbs[0]);
    }

    #[test]
    fn first_pick_with_no_current_task_starts_at_root() {
        let mut ram = Ram([0u8; 512]);
        let (scheduler, pcbs) = three_task_chain(&mut ram);

        // current is still null: this models the very first scheduler tick
        // before any task has ever run.
        scheduler.pick_next_task();
        assert_eq!(scheduler.next.load(Ordering::Relaxed), pcbs[0]);
    }
}

// End of File
