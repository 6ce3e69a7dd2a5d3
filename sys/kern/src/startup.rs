// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the kernel singleton.
//!
//! The expected boot sequence on a real target:
//!
//! 1. Board code does clock/pin bring-up, then calls
//!    [`crate::hooks::configure_platform`].
//! 2. [`init`] prepares the idle task, enables the fault handlers, and runs
//!    the platform and application init hooks.
//! 3. The application registers its tasks.
//! 4. [`start`] performs the first dispatch into the idle task and never
//!    returns. From that point on, all task code runs unprivileged on the
//!    process stack.

use vigil_abi::Code;

use crate::sched::Kernel;

struct KernelCell(core::cell::UnsafeCell<Kernel>);

// Safety: see `with_kernel`.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(core::cell::UnsafeCell::new(Kernel::new()));

/// Runs `f` with exclusive access to the kernel singleton.
///
/// Exclusivity argument: this is only called from thread-mode startup code
/// (before the first dispatch), from the kernel's own exception handlers
/// (SysTick, PendSV, SVCall, all configured to the same priority so they
/// cannot preempt one another), and from the idle loop inside an atomic
/// region with interrupts masked. At most one of those contexts executes at
/// any instant on this single core, so the `&mut` below never aliases.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    // Safety: per above.
    let k = unsafe { &mut *KERNEL.0.get() };
    f(k)
}

/// Initializes the kernel: installs the idle task's first-dispatch frame,
/// arms the fault handlers, and runs the platform/application init hooks.
/// Failures accumulate sticky-first into the returned code.
pub fn init() -> Code {
    with_kernel(|k| k.install_idle_frame());
    crate::arch::enable_fault_handlers();

    let mut result = Code::Success;
    result = result.combine(crate::err::trace_init(
        "platform drivers",
        crate::hooks::platform_init(),
    ));
    result = result.combine(crate::err::trace_init(
        "application init",
        crate::hooks::app_init(),
    ));
    crate::err::trace_init("kernel init", result)
}

/// Starts scheduling and never returns.
///
/// `tick_divisor` is the number of CPU cycles per kernel tick (one
/// millisecond), used to program the system tick timer.
pub fn start(tick_divisor: u32) -> ! {
    let idle_psp = with_kernel(|k| {
        k.reset_timer_baseline();
        k.current_psp()
    });
    crate::arch::start_first_task(tick_divisor, idle_psp, crate::sched::idle_main)
}
