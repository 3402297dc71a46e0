//! Fatal error reporting
//!
//! The four error kinds below are the only ones the kernel core itself can
//! raise. Each one is unrecoverable: a board that hits one of these has a
//! corrupted chunk list, a PCB chain it cannot satisfy, or a reachable
//! assertion the kernel considers a logic bug, so we log it and halt rather
//! than try to carry on.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::cell::UnsafeCell;

use crate::critical;

/// A fatal kernel error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    /// A path the kernel believes to be unreachable was reached
    Unreachable = 1,
    /// A PCB's own stack frame does not leave enough room to save a
    /// context in
    IsrStackTooSmall = 2,
    /// The allocator or the scheduler could not satisfy a request within
    /// the shared RAM region
    OutOfMemory = 3,
    /// A board-level assertion failed
    AssertionFailed = 4,
}

/// Implemented by the board support code for whatever hardware indicates a
/// fatal error (an LED, a UART, a debug probe signal); out of scope for
/// this crate beyond the trait itself
pub trait ErrorSink: Sync {
    /// Called once, from inside a critical section, right before the
    /// kernel halts
    fn indicate(&self, kind: ErrorKind);
}

struct DefmtSink;

impl ErrorSink for DefmtSink {
    fn indicate(&self, kind: ErrorKind) {
        defmt::error!("fatal kernel error: {=u8}", kind as u8);
    }
}

static DEFAULT_SINK: DefmtSink = DefmtSink;

struct SinkCell(UnsafeCell<&'static dyn ErrorSink>);

// SAFETY: the inner reference is only ever written from `set_error_sink`,
// which runs inside a critical section, and only ever read from `fatal`,
// which also runs inside a critical section.
unsafe impl Sync for SinkCell {}

static SINK: SinkCell = SinkCell(UnsafeCell::new(&DEFAULT_SINK));

/// Register the board's error indicator
///
/// Call this during board init, before interrupts are enabled. Until it is
/// called, fatal errors are only reported via `defmt`.
pub fn set_error_sink(sink: &'static dyn ErrorSink) {
    critical::with(|| unsafe {
        *SINK.0.get() = sink;
    });
}

/// Report a fatal error and halt
///
/// Logs `kind` through the registered [`ErrorSink`], then disables
/// interrupts and spins forever. Never returns.
pub fn fatal(kind: ErrorKind) -> ! {
    critical::with(|| {
        // SAFETY: see SinkCell's safety comment.
        let sink = unsafe { *SINK.0.get() };
        sink.indicate(kind);
    });

    // Tests can't observe a function that never returns, so on the host we
    // turn a fatal error into a panic instead of spinning forever.
    #[cfg(test)]
    {
        panic!("fatal kernel error: {kind:?}");
    }

    #[cfg(not(test))]
    {
        #[cfg(target_arch = "arm")]
        cortex_m::interrupt::disable();
        loop {
            #[cfg(target_arch = "arm")]
            cortex_m::asm::nop();
            #[cfg(not(target_arch = "arm"))]
            core::hint::spin_loop();
        }
    }
}

// End of File
