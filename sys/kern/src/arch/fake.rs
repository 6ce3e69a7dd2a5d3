// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Not-a-real-machine architecture support, for simulation and for running
//! the kernel's unit tests on the build host.
//!
//! Register access and exception plumbing collapse to inert stubs. Stack
//! frames are not written anywhere (the "stack bands" are just numbers
//! here), but the arithmetic matches the real layout so the portable code
//! above computes identical pointers and thresholds.

/// Bytes a fresh stack loses to its synthetic frame: eight callee-saved
/// registers plus the eight-word hardware frame.
pub const FRAME_SIZE: u32 = 64;

/// Layout-only stand-in for the frame writer: returns the stack pointer a
/// real target would end up with.
pub fn init_task_stack(band_top: u32, _entry: fn()) -> u32 {
    assert!(band_top & 0x3 == 0);
    band_top - FRAME_SIZE
}

/// There is no process stack here; zero means "no task has run", which the
/// stack monitor already treats as "nothing to check".
pub fn read_process_sp() -> u32 {
    0
}

pub fn read_and_disable_interrupts() -> u32 {
    0
}

pub fn restore_interrupts(_saved_mask: u32) {}

pub fn pend_context_switch() {}

pub fn svc_reschedule() {}

pub fn system_reset() -> ! {
    panic!("SYSTEM RESET");
}

pub fn enable_fault_handlers() {}

pub fn start_first_task(_tick_divisor: u32, _idle_psp: u32, _entry: fn()) -> ! {
    panic!("entering userland");
}
