// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel's one-way exit.
//!
//! [`die`] is the single point every unrecoverable condition funnels
//! through: authorisation violations and stack overflows (via
//! `err::fatal`), architectural faults (via the arch fault handlers), and
//! `panic!` anywhere in kernel code. It stops the scheduler for good,
//! records what happened where tooling can find it, and parks the core.
//!
//! The debugger-facing interface:
//!
//! - `KERNEL_FAILURE_STAGE` is a byte: 0 while the kernel is healthy, 1
//!   once a failure report has begun, 2 once the epitaph below is complete.
//!   A core parked at stage 1 failed again *while* reporting.
//! - `KERNEL_EPITAPH` holds the failure description as NUL-padded UTF-8,
//!   truncated to its fixed size.
//!
//! On the host (simulation and unit tests) there is nothing to park, so
//! [`die`] still disables scheduling and then hands the description to an
//! ordinary panic for the test runner to catch.

#[cfg(target_os = "none")]
use core::{
    fmt::{Display, Write},
    sync::atomic::{AtomicU8, Ordering},
};

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

#[cfg(target_os = "none")]
#[no_mangle]
static KERNEL_FAILURE_STAGE: AtomicU8 = AtomicU8::new(STAGE_HEALTHY);

#[cfg(target_os = "none")]
const STAGE_HEALTHY: u8 = 0;
#[cfg(target_os = "none")]
const STAGE_REPORTING: u8 = 1;
#[cfg(target_os = "none")]
const STAGE_RECORDED: u8 = 2;

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Records `msg` as the kernel's last words and halts forever. Scheduling
/// is disabled first, so no task runs after the report regardless of how
/// the caller got here.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    crate::sched::GATE.disable_scheduling();

    // Stage advances healthy -> reporting exactly once; a failure raised
    // while reporting (say, a fault inside the formatting below) parks
    // immediately rather than fighting over the buffer.
    if KERNEL_FAILURE_STAGE
        .compare_exchange(
            STAGE_HEALTHY,
            STAGE_REPORTING,
            Ordering::Relaxed,
            Ordering::Relaxed,
        )
        .is_err()
    {
        park();
    }

    // Safety: the stage exchange above admits exactly one writer, and the
    // core never leaves this function afterwards.
    let buf = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) };
    let mut epitaph = Epitaph { buf, used: 0 };
    write!(epitaph, "{msg}").ok();

    KERNEL_FAILURE_STAGE.store(STAGE_RECORDED, Ordering::Relaxed);
    park();
}

#[cfg(target_os = "none")]
fn park() -> ! {
    loop {
        // Platform-independent NOP.
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// Byte-at-a-time writer into the epitaph buffer; overflow is dropped.
#[cfg(target_os = "none")]
struct Epitaph {
    buf: &'static mut [u8; EPITAPH_LEN],
    used: usize,
}

#[cfg(target_os = "none")]
impl Write for Epitaph {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &byte in s.as_bytes() {
            if self.used == EPITAPH_LEN {
                break;
            }
            self.buf[self.used] = byte;
            self.used += 1;
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}

/// Host stand-in: same scheduler shutdown, then the test runner wants its
/// panic back.
#[cfg(not(target_os = "none"))]
pub fn die(msg: impl core::fmt::Display) -> ! {
    crate::sched::GATE.disable_scheduling();
    panic!("kernel died: {msg}");
}
