//! Holds the [`Pcb`] type, task identity, and process state

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::mem::size_of;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::error::{self, ErrorKind};

/// The function signature for our task entry functions.
///
/// Our tasks run forever and take no arguments.
pub type Program = fn() -> !;

/// The state of a process control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Not currently running anything; eligible to be recycled by [`crate::spawn`]
    Unused = 0,
    /// Eligible to be selected by the scheduler
    Ready = 1,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Unused,
            1 => TaskState::Ready,
            _ => error::fatal(ErrorKind::Unreachable),
        }
    }
}

/// The identity of a task: the address of its [`Pcb`]
///
/// A distinguished null value, [`Pid::NULL`], means "no task" and is what
/// [`crate::spawn`] returns when there is no RAM left to create a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pid(pub(crate) *mut Pcb);

impl Pid {
    /// The sentinel "no task" identity
    pub const NULL: Pid = Pid(core::ptr::null_mut());

    /// True if this is the [`Pid::NULL`] sentinel
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

// SAFETY: a Pid is an opaque, Copy identity value. It is only ever
// dereferenced by the scheduler, which does so inside its own critical
// sections.
unsafe impl Send for Pid {}
unsafe impl Sync for Pid {}

/// A process control block
///
/// PCBs form an address-descending singly linked chain rooted at the
/// [`crate::scheduler::Scheduler`]'s `root` pointer. The tail PCB (the one
/// whose `next` is null) is always [`TaskState::Unused`] and reserves no
/// stack space; the bytes between a PCB and the next-lower PCB are that
/// task's stack plus its saved context frame.
///
/// The struct only ever exposes atomic field accesses, so sharing `&Pcb`
/// between a task, the scheduler tick, and the PendSV handler is sound.
#[repr(C)]
pub struct Pcb {
    next: AtomicPtr<Pcb>,
    state: AtomicU8,
    stack_top: AtomicPtr<u32>,
}

impl Pcb {
    /// The offset, in bytes, to the `stack_top` field
    ///
    /// Used by the naked PendSV handlers to load/store a task's saved
    /// stack pointer without going through safe field access.
    pub(crate) const STACK_TOP_OFFSET: usize = core::mem::offset_of!(Pcb, stack_top);

    /// Placement-construct a fresh, [`TaskState::Unused`] tail PCB at `addr`
    ///
    /// # Safety
    ///
    /// `addr` must be validly aligned for a [`Pcb`] and point to memory that
    /// is not otherwise in use and will not be reused for anything else
    /// while this PCB is live.
    pub(crate) unsafe fn write_tail(addr: *mut Pcb) -> *mut Pcb {
        unsafe {
            addr.write(Pcb {
                next: AtomicPtr::new(core::ptr::null_mut()),
                state: AtomicU8::new(TaskState::Unused as u8),
                stack_top: AtomicPtr::new(core::ptr::null_mut()),
            });
        }
        addr
    }

    pub(crate) fn next(&self) -> *mut Pcb {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, next: *mut Pcb) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn stack_top(&self) -> *mut u32 {
        self.stack_top.load(Ordering::Relaxed)
    }

    pub(crate) fn set_stack_top(&self, sp: *mut u32) {
        self.stack_top.store(sp, Ordering::Relaxed);
    }

    /// This PCB's own identity
    pub(crate) fn pid(&self) -> Pid {
        Pid(self as *const Pcb as *mut Pcb)
    }

    /// The usable stack size in bytes, or 0 if this is the tail PCB
    ///
    /// `this - next - sizeof(Pcb) - CONTEXT_SIZE`, per the shared RAM
    /// layout invariant: a PCB's stack spans down to the next-lower PCB.
    pub(crate) fn stack_size(&self, context_size: usize) -> usize {
        let next = self.next();
        if next.is_null() {
            return 0;
        }
        let this_addr = self as *const Pcb as usize;
        let next_addr = next as usize;
        this_addr
            .saturating_sub(next_addr)
            .saturating_sub(size_of::<Pcb>())
            .saturating_sub(context_size)
    }

    /// Walk the chain starting at (and including) `self` for the first
    /// PCB that is [`TaskState::Unused`] and either is the tail or has a
    /// stack at least `min_stack_size` bytes
    ///
    /// The tail PCB always qualifies (its `stack_size` reads as 0), so this
    /// search cannot fail to find a candidate.
    pub(crate) fn find_first_unused(&self, min_stack_size: usize, context_size: usize) -> &Pcb {
        let mut cursor: *const Pcb = self;
        loop {
            // SAFETY: `cursor` starts at `self` and only ever advances
            // along `next` pointers written by `spawn`, which are always
            // either valid PCBs or null.
            let pcb = unsafe { &*cursor };
            let size = pcb.stack_size(context_size);
            if pcb.state() == TaskState::Unused && (size == 0 || size >= min_stack_size) {
                return pcb;
            }
            let next = pcb.next();
            if next.is_null() {
                error::fatal(ErrorKind::Unreachable);
            }
            cursor = next;
        }
    }
}

// SAFETY: Pcb only exposes atomic field access.
unsafe impl Sync for Pcb {}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny simulated RAM region, large enough to host a handful of PCBs
    /// with small stacks, used to exercise the chain logic on the host.
    #[repr(align(8))]
    struct Ram([u8; 512]);

    fn pcb_at(ram: &mut Ram, offset: usize) -> *mut Pcb {
        (ram.0.as_mut_ptr() as usize + offset) as *mut Pcb
    }

    #[test]
    fn tail_is_always_a_candidate() {
        let mut ram = Ram([0u8; 512]);
        let tail = pcb_at(&mut ram, 256);
        unsafe { Pcb::write_tail(tail) };
        let tail_ref = unsafe { &*tail };
        assert_eq!(tail_ref.stack_size(68), 0);
        let found = tail_ref.find_first_unused(9999, 68);
        assert!(core::ptr::eq(found, tail_ref));
    }

    #[test]
    fn recycles_unused_pcb_with_big_enough_stack() {
        let mut ram = Ram([0u8; 512]);
        // tail at 256, an unused non-tail pcb at 128 with 100 bytes of stack
        // down to the tail (100 = 256 - 128 - sizeof(Pcb) - context_size)
        let tail = pcb_at(&mut ram, 256);
        unsafe { Pcb::write_tail(tail) };

        let middle_offset = 256 - size_of::<Pcb>() - 68 - 100;
        let middle = pcb_at(&mut ram, middle_offset);
        unsafe {
            middle.write(Pcb {
                next: AtomicPtr::new(tail),
                state: AtomicU8::new(TaskState::Unused as u8),
                stack_top: AtomicPtr::new(core::ptr::null_mut()),
            });
        }
        let middle_ref = unsafe { &*middle };
        assert_eq!(middle_ref.stack_size(68), 100);

        let found = middle_ref.find_first_unused(64, 68);
        assert!(core::ptr::eq(found, middle_ref));
    }

    #[test]
    fn skips_ready_pcb_too_small_for_request() {
        let mut ram = Ram([0u8; 512]);
        let tail = pcb_at(&mut ram, 256);
        unsafe { Pcb::write_tail(tail) };

        let middle_offset = 256 - size_of::<Pcb>() - 68 - 32;
        let middle = pcb_at(&mut ram, middle_offset);
        unsafe {
            middle.write(Pcb {
                next: AtomicPtr::new(tail),
                state: AtomicU8::new(TaskState::Unused as u8),
                stack_top: AtomicPtr::new(core::ptr::null_mut()),
            });
        }
        let middle_ref = unsafe { &*middle };

        // requesting more than the 32 bytes available in `middle` should
        // skip it and land on the tail instead
        let found = middle_ref.find_first_unused(64, 68);
        assert!(core::ptr::eq(found, unsafe { &*tail }));
    }
}

// End of File
