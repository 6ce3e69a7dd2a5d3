// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hook points and the platform table.
//!
//! The kernel is SoC-independent; everything it needs from the outside world
//! arrives through function pointers registered here.
//!
//! Two different lifetimes are in play:
//!
//! - The *hook slots* (swap, idle, tick, privileged-mode, and the two signal
//!   subscriptions) are write-once: the first registration wins, later ones
//!   fail, and there is no unregistration. Readers take a plain copy and
//!   treat "unset" as a no-op.
//! - The *platform table* is a single `&'static` struct of functions the
//!   board support code supplies at startup (microsecond timer read-back,
//!   trace sink, wall-clock tick, init hooks). You can install it more than
//!   once if you need to, though that seems odd at first glance.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use vigil_abi::{Code, TaskId};

use crate::err::KernError;

/// A write-once cell holding a callback.
///
/// Slot state advances `EMPTY -> CLAIMED -> READY` exactly once. Readers see
/// either nothing or the fully written value; a registration that loses the
/// claim race fails cleanly.
pub struct HookSlot<F> {
    state: AtomicU8,
    cell: UnsafeCell<Option<F>>,
}

const EMPTY: u8 = 0;
const CLAIMED: u8 = 1;
const READY: u8 = 2;

// Safety: the cell is written once, before `state` becomes READY, and only
// read (by copy) afterwards. The state machine provides the ordering.
unsafe impl<F: Copy + Send> Sync for HookSlot<F> {}

impl<F: Copy> HookSlot<F> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            cell: UnsafeCell::new(None),
        }
    }

    /// Installs `f`. Fails if any callback, including `f` itself, has
    /// already been installed.
    pub fn register(&self, f: F) -> Result<(), KernError> {
        self.state
            .compare_exchange(EMPTY, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| KernError::HookInUse)?;
        // Safety: the exchange above admits exactly one writer, and no
        // reader looks at the cell until the READY store below.
        unsafe {
            *self.cell.get() = Some(f);
        }
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Copies out the callback, or `None` if nothing is registered yet.
    pub fn get(&self) -> Option<F> {
        if self.state.load(Ordering::Acquire) == READY {
            // Safety: READY means the single write has completed and nothing
            // will ever write again.
            unsafe { *self.cell.get() }
        } else {
            None
        }
    }
}

/// Called by the scheduler on every committed swap, with interrupts masked.
/// Keep it short.
pub static SWAP_HOOK: HookSlot<fn(TaskId, TaskId)> = HookSlot::new();

/// Called by the idle task on every pass.
pub static IDLE_HOOK: HookSlot<fn()> = HookSlot::new();

/// Called from the tick interrupt after the reschedule request.
pub static SYS_TICK_HOOK: HookSlot<fn()> = HookSlot::new();

/// Called once after a privileged-mode request has been honored.
pub static PRIVILEGED_HOOK: HookSlot<fn()> = HookSlot::new();

/// Signal handler invoked when a task is deleted, with the dead task's id.
pub static TASK_DELETE_SIGNAL: HookSlot<fn(TaskId)> = HookSlot::new();

/// Signal handler invoked when a diagnostic dump completes, with the sender
/// kind.
pub static DUMP_READY_SIGNAL: HookSlot<fn(u16)> = HookSlot::new();

pub fn register_swap_hook(f: fn(TaskId, TaskId)) -> Result<(), KernError> {
    SWAP_HOOK.register(f)
}

pub fn register_idle_hook(f: fn()) -> Result<(), KernError> {
    IDLE_HOOK.register(f)
}

pub fn register_sys_tick_hook(f: fn()) -> Result<(), KernError> {
    SYS_TICK_HOOK.register(f)
}

pub fn register_privileged_hook(f: fn()) -> Result<(), KernError> {
    PRIVILEGED_HOOK.register(f)
}

pub fn subscribe_task_delete_signal(f: fn(TaskId)) -> Result<(), KernError> {
    TASK_DELETE_SIGNAL.register(f)
}

pub fn subscribe_dump_ready_signal(f: fn(u16)) -> Result<(), KernError> {
    DUMP_READY_SIGNAL.register(f)
}

/// Services the board support code must supply for full kernel operation.
///
/// Every member must be populated. To stub one out, the simplest method is
/// a no-op closure coerced to a function, e.g. `time_tick: || ()`.
pub struct PlatformTable {
    /// Reads a free-running 16-bit microsecond timer. CPU-time accounting
    /// takes wrapping differences of consecutive readings.
    pub sys_timer_read: fn() -> u16,
    /// Sink for all kernel trace output (error reports, init lines, dumps).
    pub trace_write: fn(&str),
    /// Upward call into the wall-clock time service, made once per tick.
    pub time_tick: fn(),
    /// One-shot platform driver initialization, run by kernel init.
    pub platform_init: fn() -> Code,
    /// One-shot application initialization, run by kernel init.
    pub app_init: fn() -> Code,
}

/// Internal pointer written by `configure_platform` and read by `table`.
/// Null means no platform table has been provided.
///
/// All accesses use `Relaxed` ordering: the pointer is written once during
/// single-threaded startup and read many times after, and memory barriers
/// have non-zero cost.
static PLATFORM: AtomicPtr<PlatformTable> =
    AtomicPtr::new(core::ptr::null_mut());

/// Supplies the kernel with the platform table.
pub fn configure_platform(table: &'static PlatformTable) {
    PLATFORM.store(table as *const _ as *mut _, Ordering::Relaxed);
}

fn table() -> Option<&'static PlatformTable> {
    let p = PLATFORM.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only ever store valid `&'static` references in PLATFORM, and we
        // hand out a shared reference, so this should be ok...
        unsafe { Some(&*p) }
    }
}

/// Current reading of the platform microsecond timer, or 0 before the
/// platform table is installed.
pub(crate) fn platform_micros() -> u16 {
    table().map(|t| (t.sys_timer_read)()).unwrap_or(0)
}

/// Advances the external wall clock by one millisecond.
pub(crate) fn wall_clock_tick() {
    if let Some(t) = table() {
        (t.time_tick)()
    }
}

pub(crate) fn platform_init() -> Code {
    table().map(|t| (t.platform_init)()).unwrap_or(Code::Success)
}

pub(crate) fn app_init() -> Code {
    table().map(|t| (t.app_init)()).unwrap_or(Code::Success)
}

/// `fmt::Write` adapter over the trace sink. Output before the platform
/// table is installed is discarded.
pub struct TraceSink;

impl core::fmt::Write for TraceSink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if let Some(t) = table() {
            (t.trace_write)(s)
        }
        Ok(())
    }
}

/// Formats `args` into the trace sink.
pub(crate) fn trace_args(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;
    TraceSink.write_fmt(args).ok();
}
