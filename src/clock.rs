//! A monotonic millisecond clock

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::sync::atomic::{AtomicU32, Ordering};

/// Milliseconds elapsed since [`Clock::init`], wrapping at `u32::MAX`
struct Clock {
    ms_since_init: AtomicU32,
}

impl Clock {
    const fn new() -> Clock {
        Clock {
            ms_since_init: AtomicU32::new(0),
        }
    }

    fn init(&self) {
        self.ms_since_init.store(0, Ordering::Release);
    }

    /// Advance the clock by one millisecond
    ///
    /// Call this from the board's millisecond timer ISR.
    fn tick(&self) {
        self.ms_since_init.fetch_add(1, Ordering::Relaxed);
    }

    fn time_since_init(&self) -> u32 {
        self.ms_since_init.load(Ordering::Acquire)
    }

    /// Block the calling task for at least `ms` milliseconds
    ///
    /// Compares elapsed time with `wrapping_sub` rather than a direct `<=`
    /// against a target tick count: the naive form breaks once the counter
    /// wraps (after about 49.7 days at 1 kHz), either returning immediately
    /// or never returning depending on which side of the wrap `target`
    /// lands on. Measuring the unsigned difference from `start` is correct
    /// across the wrap because it only ever depends on how far the counter
    /// has moved, not on its absolute value.
    fn delay(&self, ms: u32) {
        let start = self.time_since_init();
        while self.time_since_init().wrapping_sub(start) < ms {
            core::hint::spin_loop();
        }
    }
}

static CLOCK: Clock = Clock::new();

/// Initialise the clock; call once before enabling the board's millisecond
/// timer
pub(crate) fn init() {
    CLOCK.init();
}

/// Advance the clock by one millisecond; call from the board's millisecond
/// timer ISR
pub fn tick() {
    CLOCK.tick();
}

/// Milliseconds elapsed since [`init`]
pub fn time_since_init() -> u32 {
    CLOCK.time_since_init()
}

/// Block the calling task for at least `ms` milliseconds
pub fn delay(ms: u32) {
    CLOCK.delay(ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_accumulate() {
        let clock = Clock::new();
        clock.init();
        for _ in 0..10 {
            clock.tick();
        }
        assert_eq!(clock.time_since_init(), 10);
    }

    #[test]
    fn delay_returns_once_enough_ticks_have_passed() {
        let clock = Clock::new();
        clock.init();
        for _ in 0..5 {
            clock.tick();
        }
        let start = clock.time_since_init();
        // Simulate the condition `delay` waits on directly, since the real
        // `delay` busy-loops against a background ISR we don't have here.
        for _ in 0..5 {
            clock.tick();
        }
        assert!(clock.time_since_init().wrapping_sub(start) >= 5);
    }

    #[test]
    fn wrap_safe_comparison_handles_counter_overflow() {
        let clock = Clock::new();
        // Start just before the counter wraps.
        clock.ms_since_init.store(u32::MAX - 2, Ordering::Relaxed);
        let start = clock.time_since_init();
        clock.tick(); // u32::MAX - 1
        clock.tick(); // u32::MAX
        clock.tick(); // wraps to 0
        clock.tick(); // 1

        // Four ticks elapsed, even though the counter wrapped partway
        // through; wrapping_sub gets this right where a direct `now <=
        // target` comparison would not.
        assert_eq!(clock.time_since_init().wrapping_sub(start), 4);
    }
}

// End of File
