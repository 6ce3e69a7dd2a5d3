// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler and everything that protects it.
//!
//! Three nestable counters gate all kernel state ([`Gate`]): a scheduler
//! disable count, an ISR nesting count, and an atomic-region count that
//! additionally masks interrupts while outstanding. They are plain counters,
//! not locks; the single-core execution model makes that sufficient, and the
//! contract is strict pairing of enter/exit.
//!
//! Selection itself ([`Kernel::select_next_task`]) is a single pass over the
//! table: expire sleep and block timers, pick the most important `Ready`
//! task that is not the current one and is under its CPU quota, then fall
//! back to idle when the global load cap is exceeded. It runs from the
//! pending-switch exception, never inline in the task that asked for it.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use vigil_abi::{Priority, Runtime, TaskState, BLOCK_FOREVER, CPU_LOAD_SCALE};

use crate::config;
use crate::err::KernError;
use crate::task::TaskSet;

/// The critical-section gate: three nestable counters plus the interrupt
/// mask saved by the outermost atomic entry.
///
/// The counters are atomics only for interior mutability; every mutation
/// happens with interrupts masked or from a single-threaded context, so
/// plain load/store pairs with `Relaxed` ordering are enough.
pub struct Gate {
    sched_disable: AtomicU8,
    isr_nesting: AtomicU8,
    atomic_nesting: AtomicU8,
    saved_mask: AtomicU32,
}

impl Gate {
    pub const fn new() -> Self {
        Self {
            sched_disable: AtomicU8::new(0),
            isr_nesting: AtomicU8::new(0),
            atomic_nesting: AtomicU8::new(0),
            saved_mask: AtomicU32::new(0),
        }
    }

    /// Suppresses scheduling until the matching `enable_scheduling`.
    pub fn disable_scheduling(&self) {
        let n = self.sched_disable.load(Ordering::Relaxed);
        self.sched_disable.store(n.saturating_add(1), Ordering::Relaxed);
    }

    /// Undoes one `disable_scheduling`. Saturates at zero; a stray extra
    /// enable cannot turn the scheduler on early.
    pub fn enable_scheduling(&self) {
        let n = self.sched_disable.load(Ordering::Relaxed);
        if n > 0 {
            self.sched_disable.store(n - 1, Ordering::Relaxed);
        }
    }

    pub fn scheduling_enabled(&self) -> bool {
        self.sched_disable.load(Ordering::Relaxed) == 0
    }

    /// Marks entry into an interrupt service routine. The outermost entry
    /// also disables scheduling. Every ISR must pair this with `isr_exit`.
    pub fn isr_enter(&self) {
        let n = self.isr_nesting.load(Ordering::Relaxed);
        if n == 0 {
            self.disable_scheduling();
        }
        self.isr_nesting.store(n.saturating_add(1), Ordering::Relaxed);
    }

    /// Marks exit from an interrupt service routine; the outermost exit
    /// re-enables scheduling.
    pub fn isr_exit(&self) {
        let n = self.isr_nesting.load(Ordering::Relaxed);
        if n > 0 {
            self.isr_nesting.store(n - 1, Ordering::Relaxed);
        }
        if self.isr_nesting.load(Ordering::Relaxed) == 0 {
            self.enable_scheduling();
        }
    }

    pub fn in_isr(&self) -> bool {
        self.isr_nesting.load(Ordering::Relaxed) > 0
    }

    /// Enters an atomic region: the outermost entry captures the interrupt
    /// mask and masks interrupts, every entry disables scheduling. The
    /// returned guard undoes both on drop, restoring the captured mask only
    /// at the outermost exit.
    pub fn atomic(&self) -> AtomicGuard<'_> {
        let n = self.atomic_nesting.load(Ordering::Relaxed);
        if n == 0 {
            let mask = crate::arch::read_and_disable_interrupts();
            self.saved_mask.store(mask, Ordering::Relaxed);
        }
        self.atomic_nesting.store(n.saturating_add(1), Ordering::Relaxed);
        self.disable_scheduling();
        AtomicGuard { gate: self }
    }

    #[cfg(test)]
    pub(crate) fn atomic_depth(&self) -> u8 {
        self.atomic_nesting.load(Ordering::Relaxed)
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII half of [`Gate::atomic`].
#[must_use]
pub struct AtomicGuard<'a> {
    gate: &'a Gate,
}

impl Drop for AtomicGuard<'_> {
    fn drop(&mut self) {
        let n = self.gate.atomic_nesting.load(Ordering::Relaxed);
        if n > 0 {
            self.gate.atomic_nesting.store(n - 1, Ordering::Relaxed);
        }
        if self.gate.atomic_nesting.load(Ordering::Relaxed) == 0 {
            crate::arch::restore_interrupts(
                self.gate.saved_mask.load(Ordering::Relaxed),
            );
        }
        self.gate.enable_scheduling();
    }
}

/// The kernel-wide gate, shared by the exception entry points, the task API
/// glue, and driver ISRs.
pub static GATE: Gate = Gate::new();

/// Convenience wrapper over [`GATE`] for driver interrupt handlers.
pub fn isr_enter() {
    GATE.isr_enter();
}

/// Convenience wrapper over [`GATE`] for driver interrupt handlers.
pub fn isr_exit() {
    GATE.isr_exit();
}

/// Checks whether the caller is running in interrupt context.
pub fn is_caller_isr() -> bool {
    GATE.in_isr()
}

/// Execution level to perform a reschedule request at.
///
/// Sparse encodings, same reasoning as the task states.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ExecLevel {
    /// Caller already runs privileged (kernel, ISR): pend the context
    /// switch directly.
    Privileged = 0b10110,
    /// Caller runs unprivileged: hop through the supervisor call, which
    /// pends the switch on its behalf.
    Unprivileged = 0b01001,
}

/// Requests a reschedule. The switch itself always happens in the
/// pending-switch exception, never here.
pub fn request_reschedule(level: ExecLevel) {
    match level {
        ExecLevel::Privileged => crate::arch::pend_context_switch(),
        ExecLevel::Unprivileged => crate::arch::svc_reschedule(),
    }
}

/// Set when a task has asked for privileged thread mode; the next
/// pending-switch invocation honors it instead of switching.
static PRIVILEGED_MODE_PENDING: AtomicBool = AtomicBool::new(false);

/// Set when a processor reset has been requested; the supervisor handler
/// honors it before anything else.
static RESET_PENDING: AtomicBool = AtomicBool::new(false);

/// Consumes a pending privileged-mode request. For the pending-switch
/// handler.
pub fn take_privileged_mode_request() -> bool {
    PRIVILEGED_MODE_PENDING.swap(false, Ordering::Relaxed)
}

/// Consumes a pending reset request. For the supervisor handler.
pub fn take_reset_request() -> bool {
    RESET_PENDING.swap(false, Ordering::Relaxed)
}

/// Raises the calling task to privileged thread mode, then runs the
/// registered privileged hook.
///
/// There is no demotion path: the latch stays privileged until the caller
/// arranges otherwise (typically by resetting).
pub fn enter_privileged_mode() {
    PRIVILEGED_MODE_PENDING.store(true, Ordering::Relaxed);
    request_reschedule(ExecLevel::Unprivileged);
    // Back here, thread mode is privileged; let the requester do whatever
    // needed the privilege.
    if let Some(hook) = crate::hooks::PRIVILEGED_HOOK.get() {
        hook();
    }
}

/// Requests a processor reset through the supervisor exception, which runs
/// privileged and can issue the architectural reset sequence.
pub fn request_system_reset() {
    RESET_PENDING.store(true, Ordering::Relaxed);
    request_reschedule(ExecLevel::Unprivileged);
}

/// Scheduler and accounting state. One instance exists on a live system
/// (see `startup::with_kernel`); tests build their own.
pub struct Kernel {
    pub(crate) tasks: TaskSet,
    /// Index of the running task. Always a valid, in-use slot.
    pub(crate) current: usize,
    /// Millisecond tick counter. Wraps.
    pub(crate) ticks: u32,
    /// Tick value latched by the last completed selection.
    pub(crate) previous_tick: u32,
    /// Microsecond timer reading latched by the last selection.
    pub(crate) timer_baseline: u16,
    /// Rolling CPU-time accumulator for the whole system.
    pub(crate) monitoring_time: Runtime,
    /// Global CPU load cap in hundredths of a percent.
    pub(crate) cpu_cap: u16,
    /// Source of microsecond timestamps for accounting.
    pub(crate) time_source: fn() -> u16,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            tasks: TaskSet::new(),
            current: 0,
            ticks: 0,
            previous_tick: 0,
            timer_baseline: 0,
            monitoring_time: Runtime::ZERO,
            cpu_cap: CPU_LOAD_SCALE,
            time_source: crate::hooks::platform_micros,
        }
    }

    /// Builds a kernel that reads time from `f` instead of the platform
    /// table. Selection and accounting behave identically.
    pub fn with_time_source(f: fn() -> u16) -> Self {
        Self {
            time_source: f,
            ..Self::new()
        }
    }

    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Kernel tick count (milliseconds since start, modulo 2^32).
    pub fn sys_ticks(&self) -> u32 {
        self.ticks
    }

    /// One millisecond has elapsed. Called from the tick interrupt.
    ///
    /// Order matters: the counter first, then the upward call into the wall
    /// clock, then the stack check on whoever is running, then the
    /// reschedule request, then the application tick hook.
    pub fn tick(&mut self, gate: &Gate) {
        self.ticks = self.ticks.wrapping_add(1);
        crate::hooks::wall_clock_tick();
        self.check_task_stack(crate::arch::read_process_sp());
        if cfg!(not(feature = "cooperative")) && gate.scheduling_enabled() {
            crate::arch::pend_context_switch();
        }
        if let Some(hook) = crate::hooks::SYS_TICK_HOOK.get() {
            hook();
        }
    }

    /// Picks the task to run next and commits it as current.
    ///
    /// `live_sp` is the caller's reading of the process stack pointer, used
    /// for the overflow check; pass 0 when no task has run yet.
    ///
    /// Does nothing at all while scheduling is disabled: timers neither
    /// expire nor advance, they catch up through the elapsed-tick delta on
    /// the next opportunity.
    pub fn select_next_task(&mut self, gate: &Gate, live_sp: u32) {
        self.check_task_stack(live_sp);
        if !gate.scheduling_enabled() {
            return;
        }

        let elapsed = self.ticks.wrapping_sub(self.previous_tick);
        let mut next = 0usize;
        let mut best = Priority::IDLE;

        for index in 0..config::TASK_TABLE_SIZE {
            let task = self.tasks.task_mut(index);
            if !task.is_in_use() {
                break;
            }

            match task.state {
                TaskState::Sleeping => {
                    task.sleep_tick_counter =
                        task.sleep_tick_counter.wrapping_add(elapsed);
                    if task.sleep_tick_counter >= task.sleep_ticks {
                        task.state = TaskState::Ready;
                    }
                }
                TaskState::Blocked if task.block_ticks != BLOCK_FOREVER => {
                    task.block_tick_counter =
                        task.block_tick_counter.wrapping_add(elapsed);
                    if task.block_tick_counter >= task.block_ticks {
                        task.state = TaskState::Ready;
                    }
                }
                _ => {}
            }

            if index != self.current
                && task.state == TaskState::Ready
                && task.priority.is_more_important_than(best)
                && task.cpu_monitoring_usage < task.cpu_usage_limit
                && task.cpu_usage < task.cpu_usage_limit
            {
                next = index;
                best = task.priority;
            }
        }

        // A system over its global load cap runs idle regardless of what
        // the scan found.
        if self.overall_cpu_usage() > self.cpu_cap {
            next = 0;
        }

        if next != self.current {
            if let Some(hook) = crate::hooks::SWAP_HOOK.get() {
                hook(
                    self.tasks.task(self.current).id(),
                    self.tasks.task(next).id(),
                );
            }
            let outgoing = self.tasks.task_mut(self.current);
            outgoing.cs_counter = outgoing.cs_counter.wrapping_add(1);
            let incoming = self.tasks.task_mut(next);
            incoming.run_counter = incoming.run_counter.wrapping_add(1);
        }

        // Attribute the time since the previous selection to the outgoing
        // task and to the system as a whole, then take a fresh baseline.
        let sample = (self.time_source)();
        let delta = sample.wrapping_sub(self.timer_baseline);
        self.monitoring_time.add_microseconds(delta);
        self.tasks
            .task_mut(self.current)
            .monitoring_run_time
            .add_microseconds(delta);
        self.timer_baseline = (self.time_source)();

        self.current = next;
        self.previous_tick = self.ticks;
    }

    /// Checks the running task's live stack pointer against its overflow
    /// threshold and updates its peak-usage figure.
    ///
    /// `sp == 0` means "no process stack yet" and is ignored.
    pub fn check_task_stack(&mut self, sp: u32) {
        if sp == 0 {
            return;
        }
        let task = self.tasks.task_mut(self.current);
        if sp < task.overflow_threshold {
            let overflow = task.overflow_threshold - sp;
            crate::err::fatal(format_args!(
                "stack overflow detected in <{}>: PSP {:#010x} overflown by {} bytes",
                task.name_str(),
                sp,
                overflow,
            ));
        }
        let band_top = task
            .overflow_threshold
            .wrapping_add(task.stack_size)
            .wrapping_sub(config::STACK_GUARD_BAND);
        let used = band_top.saturating_sub(sp);
        if used > task.stack_peak_usage {
            task.stack_peak_usage = used;
        }
    }

    /// Overall CPU load: everything the idle task did not consume.
    pub fn overall_cpu_usage(&self) -> u16 {
        CPU_LOAD_SCALE.saturating_sub(self.tasks.task(0).cpu_monitoring_usage)
    }

    /// Lowers (or restores) the global CPU load cap.
    pub fn set_max_cpu_load(&mut self, cap: u16) -> Result<(), KernError> {
        if cap == 0 || cap > CPU_LOAD_SCALE {
            return Err(KernError::BadArgument);
        }
        self.cpu_cap = cap;
        Ok(())
    }

    pub fn max_cpu_load(&self) -> u16 {
        self.cpu_cap
    }

    /// Stores the outgoing task's stack pointer. Called by the context
    /// switcher after it has pushed the callee-saved registers.
    pub fn save_current_psp(&mut self, psp: u32) {
        self.tasks.task_mut(self.current).psp = psp;
    }

    /// The saved stack pointer of the (new) current task, for the context
    /// switcher to restore from.
    pub fn current_psp(&self) -> u32 {
        self.tasks.task(self.current).psp
    }

    /// Re-reads the microsecond timer so accounting starts from "now".
    pub(crate) fn reset_timer_baseline(&mut self) {
        self.timer_baseline = (self.time_source)();
    }

    #[cfg(test)]
    pub(crate) fn force_current(&mut self, index: usize) {
        self.current = index;
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// The idle task: slot 0, always ready, lowest priority. Hosts the periodic
/// CPU-usage bookkeeping and the idle hook, then offers the CPU back.
pub fn idle_main() {
    crate::err::trace_init("scheduler online", vigil_abi::Code::Success);
    loop {
        if let Some(hook) = crate::hooks::IDLE_HOOK.get() {
            hook();
        }
        {
            // The recompute walks the whole table; mask out the tick while
            // it runs.
            let _atomic = GATE.atomic();
            crate::startup::with_kernel(|k| k.recompute_usages(false));
        }
        crate::task::task_yield();
    }
}
