// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks: the descriptor table and the task API.
//!
//! Slot 0 of the table always holds the idle task; it is populated at build
//! time and can neither be re-registered nor deleted. User tasks fill the
//! remaining slots in registration order and keep their slot for life: the
//! only exit is deletion, which parks the slot as a `Zombie` without
//! reclaiming it.
//!
//! Every mutating operation follows the same shape: bracket the descriptor
//! access with an atomic region, validate the id, check authorisation, make
//! the single state change, and, if the change affects the running task,
//! request an unprivileged reschedule after leaving the atomic region.
//! Authorisation violations are not errors, they are the end of the world
//! (see `err::fatal`).

use vigil_abi::{
    Priority, Privilege, Runtime, TaskId, TaskSnapshot, TaskState,
    CPU_LOAD_SCALE, TASK_NAME_LEN,
};

use crate::config;
use crate::descs::TaskDesc;
use crate::err::KernError;
use crate::sched::{request_reschedule, ExecLevel, Gate, Kernel};

/// Internal representation of a task.
///
/// Fields are `pub(crate)` so the scheduler and accounting code can walk the
/// table directly; outside the kernel only [`TaskSnapshot`] copies escape.
#[derive(Debug)]
pub struct Task {
    /// Entry point. `None` marks a slot that has never been registered.
    pub(crate) entry: Option<fn()>,
    pub(crate) state: TaskState,
    /// State to restore when a `Suspended` task is resumed. Always one of
    /// `Ready`/`Sleeping`/`Blocked` while suspended.
    pub(crate) previous_state: TaskState,
    pub(crate) priority: Priority,
    /// Registration-time priority; never touched by timing events.
    pub(crate) original_priority: Priority,
    pub(crate) privileges: Privilege,
    pub(crate) name: [u8; TASK_NAME_LEN],
    pub(crate) id: TaskId,
    /// Sleep budget in ticks and the ticks slept so far.
    pub(crate) sleep_ticks: u32,
    pub(crate) sleep_tick_counter: u32,
    /// Block budget in ticks (`BLOCK_FOREVER` disables the timeout) and the
    /// ticks blocked so far.
    pub(crate) block_ticks: u32,
    pub(crate) block_tick_counter: u32,
    /// Saved process stack pointer.
    pub(crate) psp: u32,
    pub(crate) stack_size: u32,
    /// Lowest legal stack address plus the guard band; the monitor faults
    /// the system when the live stack pointer drops below this.
    pub(crate) overflow_threshold: u32,
    /// Dispatch count.
    pub(crate) run_counter: u32,
    /// Times this task was the outgoing side of a swap.
    pub(crate) cs_counter: u32,
    /// Peak observed stack usage in bytes.
    pub(crate) stack_peak_usage: u32,
    /// Cumulative run time, kept for reporting.
    pub(crate) run_time: Runtime,
    /// Rolling run time consumed (and cleared) by the usage computation.
    pub(crate) monitoring_run_time: Runtime,
    /// Quota and the three usage figures, all in hundredths of a percent.
    pub(crate) cpu_usage_limit: u16,
    pub(crate) cpu_usage: u16,
    pub(crate) cpu_usage_peak: u16,
    pub(crate) cpu_monitoring_usage: u16,
}

pub(crate) const fn name_bytes(s: &str) -> [u8; TASK_NAME_LEN] {
    let bytes = s.as_bytes();
    let mut out = [0u8; TASK_NAME_LEN];
    let mut i = 0;
    while i < bytes.len() {
        out[i] = bytes[i];
        i += 1;
    }
    out
}

impl Task {
    const UNUSED: Task = Task {
        entry: None,
        state: TaskState::Suspended,
        previous_state: TaskState::Suspended,
        priority: Priority::IDLE,
        original_priority: Priority::IDLE,
        privileges: Privilege::empty(),
        name: [0; TASK_NAME_LEN],
        id: TaskId::INVALID,
        sleep_ticks: 0,
        sleep_tick_counter: 0,
        block_ticks: 0,
        block_tick_counter: 0,
        psp: 0,
        stack_size: 0,
        overflow_threshold: 0,
        run_counter: 0,
        cs_counter: 0,
        stack_peak_usage: 0,
        run_time: Runtime::ZERO,
        monitoring_run_time: Runtime::ZERO,
        cpu_usage_limit: 0,
        cpu_usage: 0,
        cpu_usage_peak: 0,
        cpu_monitoring_usage: 0,
    };

    const IDLE: Task = Task {
        entry: Some(crate::sched::idle_main),
        state: TaskState::Ready,
        previous_state: TaskState::Ready,
        priority: Priority::IDLE,
        original_priority: Priority::IDLE,
        privileges: Privilege::KERNEL,
        name: name_bytes("idle"),
        id: TaskId::IDLE,
        sleep_ticks: 0,
        sleep_tick_counter: 0,
        block_ticks: 0,
        block_tick_counter: 0,
        psp: 0,
        stack_size: config::IDLE_TASK_STACK_SIZE,
        overflow_threshold: 0,
        run_counter: 0,
        cs_counter: 0,
        stack_peak_usage: 0,
        run_time: Runtime::ZERO,
        monitoring_run_time: Runtime::ZERO,
        cpu_usage_limit: CPU_LOAD_SCALE,
        cpu_usage: 0,
        cpu_usage_peak: 0,
        cpu_monitoring_usage: 0,
    };

    /// Checks if this slot has ever been registered.
    pub fn is_in_use(&self) -> bool {
        self.entry.is_some()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task name as text, NUL padding trimmed.
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("<non-utf8>")
    }

    /// By-value copy of the reportable fields.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name,
            state: self.state,
            previous_state: self.previous_state,
            priority: self.priority,
            original_priority: self.original_priority,
            privileges: self.privileges,
            stack_size: self.stack_size,
            stack_peak_usage: self.stack_peak_usage,
            run_counter: self.run_counter,
            cs_counter: self.cs_counter,
            run_time: self.run_time,
            cpu_usage: self.cpu_usage,
            cpu_usage_peak: self.cpu_usage_peak,
            cpu_usage_limit: self.cpu_usage_limit,
            cpu_monitoring_usage: self.cpu_monitoring_usage,
        }
    }
}

/// The fixed task table.
pub struct TaskSet {
    tasks: [Task; config::TASK_TABLE_SIZE],
}

impl TaskSet {
    pub(crate) const fn new() -> Self {
        let mut tasks = [Task::UNUSED; config::TASK_TABLE_SIZE];
        tasks[0] = Task::IDLE;
        Self { tasks }
    }

    pub fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub(crate) fn task_mut(&mut self, index: usize) -> &mut Task {
        &mut self.tasks[index]
    }

    /// Iterates the registered prefix of the table. Registration is
    /// contiguous and slots are never vacated, so the first unused slot ends
    /// the walk.
    pub fn iter_in_use(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().take_while(|t| t.is_in_use())
    }
}

impl Kernel {
    /// Maps a caller-supplied id to a table index.
    ///
    /// The idle task's id is deliberately outside the accepted range: no API
    /// operation may name it.
    fn check_id(&self, id: TaskId) -> Result<usize, KernError> {
        if id.0 > TaskId::IDLE.0 && id.index() < config::TASK_TABLE_SIZE {
            Ok(id.index())
        } else {
            Err(KernError::BadTaskId)
        }
    }

    fn may_manipulate(&self, gate: &Gate, target: usize, self_ok: bool) -> bool {
        gate.in_isr()
            || self
                .tasks
                .task(self.current)
                .privileges
                .contains(Privilege::TASK_MANIPULATE)
            || (self_ok && target == self.current)
    }

    fn auth_violation(&self, target: usize, op: &str) -> ! {
        crate::err::fatal(format_args!(
            "<{}> has no privilege to {} <{}>!",
            self.tasks.task(self.current).name_str(),
            op,
            self.tasks.task(target).name_str(),
        ))
    }

    /// Registers a task, returning its assigned id.
    ///
    /// Stack bands are carved out of RAM top-down in registration order:
    /// each new task's band sits directly below the bands of everything
    /// registered before it (the idle task included), below the global
    /// reserve. The band top gets the synthetic first-dispatch frame.
    pub fn register(&mut self, desc: &TaskDesc) -> Result<TaskId, KernError> {
        desc.validate()?;

        let mut stack_offset = config::GLOBAL_STACK_RESERVE;
        let mut slot = None;
        for index in 0..config::TASK_TABLE_SIZE {
            let task = self.tasks.task(index);
            if !task.is_in_use() {
                slot = Some(index);
                break;
            }
            stack_offset += task.stack_size;
        }
        let index = slot.ok_or(KernError::TableFull)?;

        let band_top = config::MAIN_STACK_TOP - stack_offset;
        let psp = crate::arch::init_task_stack(band_top, desc.entry);

        let limit = match desc.cpu_usage_limit {
            0 => CPU_LOAD_SCALE,
            n => n.min(CPU_LOAD_SCALE),
        };

        let id = TaskId::for_index(index);
        *self.tasks.task_mut(index) = Task {
            entry: Some(desc.entry),
            state: TaskState::Ready,
            previous_state: TaskState::Ready,
            priority: desc.priority,
            original_priority: desc.priority,
            privileges: desc.privileges,
            name: name_bytes(desc.name),
            id,
            sleep_ticks: 0,
            sleep_tick_counter: 0,
            block_ticks: 0,
            block_tick_counter: 0,
            psp,
            stack_size: desc.stack_size,
            overflow_threshold: band_top - desc.stack_size
                + config::STACK_GUARD_BAND,
            run_counter: 0,
            cs_counter: 0,
            stack_peak_usage: 0,
            run_time: Runtime::ZERO,
            monitoring_run_time: Runtime::ZERO,
            cpu_usage_limit: limit,
            cpu_usage: 0,
            cpu_usage_peak: 0,
            cpu_monitoring_usage: 0,
        };
        Ok(id)
    }

    /// Registers a batch of tasks, stopping at the first failure.
    pub fn register_many(&mut self, descs: &[TaskDesc]) -> Result<(), KernError> {
        for desc in descs {
            self.register(desc)?;
        }
        Ok(())
    }

    /// Installs the idle task's first-dispatch frame and stack threshold.
    /// Runs once, from kernel init.
    pub(crate) fn install_idle_frame(&mut self) {
        let band_top = config::MAIN_STACK_TOP - config::GLOBAL_STACK_RESERVE;
        let psp = crate::arch::init_task_stack(band_top, crate::sched::idle_main);
        let idle = self.tasks.task_mut(0);
        idle.psp = psp;
        idle.overflow_threshold =
            band_top - idle.stack_size + config::STACK_GUARD_BAND;
    }

    /// Puts the calling task to sleep for `ticks`. Only a non-idle task may
    /// sleep, and only on itself.
    pub fn task_sleep(&mut self, gate: &Gate, ticks: u32) -> Result<(), KernError> {
        if self.current == 0 {
            return Err(KernError::IdleRestricted);
        }
        {
            let _atomic = gate.atomic();
            let task = self.tasks.task_mut(self.current);
            if task.state != TaskState::Ready {
                return Err(KernError::WrongState);
            }
            task.state = TaskState::Sleeping;
            task.sleep_ticks = ticks;
            task.sleep_tick_counter = 0;
        }
        request_reschedule(ExecLevel::Unprivileged);
        Ok(())
    }

    /// Wakes a sleeping task before its budget elapses.
    pub fn task_wake(&mut self, gate: &Gate, id: TaskId) -> Result<(), KernError> {
        let _atomic = gate.atomic();
        let index = self.check_id(id)?;
        if !self.may_manipulate(gate, index, false) {
            self.auth_violation(index, "wake up");
        }
        let task = self.tasks.task_mut(index);
        if task.state == TaskState::Sleeping {
            task.state = TaskState::Ready;
            Ok(())
        } else {
            Err(KernError::WrongState)
        }
    }

    /// Suspends a task, remembering what it was doing so `task_resume` can
    /// put it back. Self-suspension needs no privilege.
    pub fn task_suspend(&mut self, gate: &Gate, id: TaskId) -> Result<(), KernError> {
        let index;
        {
            let _atomic = gate.atomic();
            index = self.check_id(id)?;
            if !self.may_manipulate(gate, index, true) {
                self.auth_violation(index, "suspend");
            }
            let task = self.tasks.task_mut(index);
            match task.state {
                TaskState::Ready
                | TaskState::Sleeping
                | TaskState::Blocked => {
                    task.previous_state = task.state;
                    task.state = TaskState::Suspended;
                }
                _ => return Err(KernError::WrongState),
            }
        }
        if index == self.current {
            request_reschedule(ExecLevel::Unprivileged);
        }
        Ok(())
    }

    /// Returns a suspended task to whatever it was doing before.
    pub fn task_resume(&mut self, gate: &Gate, id: TaskId) -> Result<(), KernError> {
        let _atomic = gate.atomic();
        let index = self.check_id(id)?;
        if !self.may_manipulate(gate, index, false) {
            self.auth_violation(index, "resume");
        }
        let task = self.tasks.task_mut(index);
        if task.state == TaskState::Suspended {
            task.state = task.previous_state;
            Ok(())
        } else {
            Err(KernError::WrongState)
        }
    }

    /// Blocks a task with a tick budget; `BLOCK_FOREVER` disables the
    /// timeout. Self-blocking needs no privilege.
    pub fn task_block(
        &mut self,
        gate: &Gate,
        id: TaskId,
        ticks: u32,
    ) -> Result<(), KernError> {
        let index;
        {
            let _atomic = gate.atomic();
            index = self.check_id(id)?;
            if !self.may_manipulate(gate, index, true) {
                self.auth_violation(index, "block");
            }
            let task = self.tasks.task_mut(index);
            if task.state != TaskState::Ready {
                return Err(KernError::WrongState);
            }
            task.state = TaskState::Blocked;
            task.block_ticks = ticks;
            task.block_tick_counter = 0;
        }
        if index == self.current {
            request_reschedule(ExecLevel::Unprivileged);
        }
        Ok(())
    }

    /// Unblocks a blocked task. A task that was suspended while blocked has
    /// its restore state promoted to `Ready` instead, so resuming it does
    /// not re-block it on a resource that has since been released.
    pub fn task_unblock(&mut self, gate: &Gate, id: TaskId) -> Result<(), KernError> {
        let _atomic = gate.atomic();
        let index = self.check_id(id)?;
        if !self.may_manipulate(gate, index, false) {
            self.auth_violation(index, "unblock");
        }
        let task = self.tasks.task_mut(index);
        match (task.state, task.previous_state) {
            (TaskState::Blocked, _) => {
                task.state = TaskState::Ready;
                Ok(())
            }
            (TaskState::Suspended, TaskState::Blocked) => {
                task.previous_state = TaskState::Ready;
                Ok(())
            }
            _ => Err(KernError::WrongState),
        }
    }

    /// Deletes a task. The slot becomes a `Zombie` and is never reused. The
    /// task-delete signal fires with the dead task's id; if the caller does
    /// not hold signaling privilege, it is granted for exactly the duration
    /// of the signal call.
    pub fn task_delete(&mut self, gate: &Gate, id: TaskId) -> Result<(), KernError> {
        let index;
        {
            let _atomic = gate.atomic();
            index = self.check_id(id)?;
            if !self.may_manipulate(gate, index, true) {
                self.auth_violation(index, "delete");
            }
            if self.tasks.task(index).state == TaskState::Zombie {
                return Err(KernError::WrongState);
            }
            self.tasks.task_mut(index).state = TaskState::Zombie;

            let caller = self.current;
            let had_signaling = self
                .tasks
                .task(caller)
                .privileges
                .contains(Privilege::SIGNALING);
            if !had_signaling {
                self.tasks
                    .task_mut(caller)
                    .privileges
                    .insert(Privilege::SIGNALING);
            }
            if let Some(f) = crate::hooks::TASK_DELETE_SIGNAL.get() {
                f(id);
            }
            if !had_signaling {
                self.tasks
                    .task_mut(caller)
                    .privileges
                    .remove(Privilege::SIGNALING);
            }
        }
        if index == self.current {
            request_reschedule(ExecLevel::Unprivileged);
        }
        Ok(())
    }

    /// Changes a task's current priority.
    pub fn task_set_priority(
        &mut self,
        gate: &Gate,
        id: TaskId,
        priority: Priority,
    ) -> Result<(), KernError> {
        let _atomic = gate.atomic();
        let index = self.check_id(id)?;
        if !priority.is_user() {
            return Err(KernError::BadPriority);
        }
        if !self.may_change_priority(gate) {
            self.auth_violation(index, "set the priority of");
        }
        self.tasks.task_mut(index).priority = priority;
        Ok(())
    }

    /// Changes a task's original (registration-time) priority.
    pub fn task_set_original_priority(
        &mut self,
        gate: &Gate,
        id: TaskId,
        priority: Priority,
    ) -> Result<(), KernError> {
        let _atomic = gate.atomic();
        let index = self.check_id(id)?;
        if !priority.is_user() {
            return Err(KernError::BadPriority);
        }
        if !self.may_change_priority(gate) {
            self.auth_violation(index, "set the priority of");
        }
        self.tasks.task_mut(index).original_priority = priority;
        Ok(())
    }

    fn may_change_priority(&self, gate: &Gate) -> bool {
        gate.in_isr()
            || self
                .tasks
                .task(self.current)
                .privileges
                .contains(Privilege::PRIO_CHANGE)
    }

    pub fn task_priority(&self, id: TaskId) -> Result<Priority, KernError> {
        Ok(self.tasks.task(self.check_id(id)?).priority)
    }

    pub fn task_original_priority(&self, id: TaskId) -> Result<Priority, KernError> {
        Ok(self.tasks.task(self.check_id(id)?).original_priority)
    }

    /// Grants privilege bits. Granting anything in the kernel byte requires
    /// task-manipulation privilege; user flag bits are free game.
    pub fn task_add_privileges(
        &mut self,
        gate: &Gate,
        id: TaskId,
        privileges: Privilege,
    ) -> Result<(), KernError> {
        let _atomic = gate.atomic();
        let index = self.check_id(id)?;
        if privileges.intersects(!Privilege::USER_FLAGS)
            && !self.may_manipulate(gate, index, false)
        {
            self.auth_violation(index, "grant privileges to");
        }
        self.tasks.task_mut(index).privileges.insert(privileges);
        Ok(())
    }

    /// Revokes privilege bits.
    pub fn task_remove_privileges(
        &mut self,
        gate: &Gate,
        id: TaskId,
        privileges: Privilege,
    ) -> Result<(), KernError> {
        let _atomic = gate.atomic();
        let index = self.check_id(id)?;
        self.tasks.task_mut(index).privileges.remove(privileges);
        Ok(())
    }

    /// Replaces the privilege set wholesale. Same grant rule as
    /// `task_add_privileges`.
    pub fn task_set_privileges(
        &mut self,
        gate: &Gate,
        id: TaskId,
        privileges: Privilege,
    ) -> Result<(), KernError> {
        let _atomic = gate.atomic();
        let index = self.check_id(id)?;
        if privileges.intersects(!Privilege::USER_FLAGS)
            && !self.may_manipulate(gate, index, false)
        {
            self.auth_violation(index, "grant privileges to");
        }
        self.tasks.task_mut(index).privileges = privileges;
        Ok(())
    }

    pub fn task_privileges(&self, id: TaskId) -> Result<Privilege, KernError> {
        Ok(self.tasks.task(self.check_id(id)?).privileges)
    }

    pub fn task_name(&self, id: TaskId) -> Result<&str, KernError> {
        Ok(self.tasks.task(self.check_id(id)?).name_str())
    }

    /// Finds a task id by name.
    pub fn task_id_by_name(&self, name: &str) -> Result<TaskId, KernError> {
        self.tasks
            .iter_in_use()
            .find(|t| t.name_str() == name)
            .map(|t| t.id)
            .ok_or(KernError::NotFound)
    }

    /// The id of the running task.
    pub fn current_task_id(&self) -> TaskId {
        TaskId::for_index(self.current)
    }

    /// Copies out a task's descriptor fields.
    pub fn task_data(&self, id: TaskId) -> Result<TaskSnapshot, KernError> {
        Ok(self.tasks.task(self.check_id(id)?).snapshot())
    }

    /// Copies out a slot's descriptor fields by raw index, idle included.
    /// Reserved for holders of the kernel privilege byte.
    pub fn task_data_by_index(
        &self,
        gate: &Gate,
        index: usize,
    ) -> Result<TaskSnapshot, KernError> {
        if index >= config::TASK_TABLE_SIZE {
            return Err(KernError::BadTaskId);
        }
        let allowed = gate.in_isr()
            || self
                .tasks
                .task(self.current)
                .privileges
                .contains(Privilege::KERNEL);
        if !allowed {
            self.auth_violation(index, "inspect");
        }
        let task = self.tasks.task(index);
        if !task.is_in_use() {
            return Err(KernError::BadTaskId);
        }
        Ok(task.snapshot())
    }
}

/// Unconditionally requests an unprivileged reschedule.
pub fn task_yield() {
    request_reschedule(ExecLevel::Unprivileged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_abi::BLOCK_FOREVER;

    fn spin_a() {}
    fn spin_b() {}
    fn spin_c() {}

    fn desc(entry: fn(), name: &'static str, prio: u8) -> TaskDesc {
        TaskDesc {
            entry,
            name,
            priority: Priority(prio),
            privileges: Privilege::USER,
            stack_size: 0x400,
            cpu_usage_limit: 0,
        }
    }

    fn kernel_with(descs: &[TaskDesc]) -> (Kernel, Gate) {
        let mut k = Kernel::new();
        k.install_idle_frame();
        for d in descs {
            k.register(d).expect("registration failed in test setup");
        }
        (k, Gate::new())
    }

    /// Kernel with one supervisor task (slot 1, the default current after
    /// `force_current`) and one plain user task (slot 2).
    fn two_task_kernel() -> (Kernel, Gate, TaskId, TaskId) {
        let mut boss = desc(spin_a, "boss", 50);
        boss.privileges = Privilege::SUPERVISOR;
        let worker = desc(spin_b, "worker", 60);
        let (mut k, gate) = kernel_with(&[boss, worker]);
        k.force_current(1);
        (k, gate, TaskId::for_index(1), TaskId::for_index(2))
    }

    #[test]
    fn registration_assigns_ids_and_copies_fields() {
        let d = desc(spin_a, "alpha", 17);
        let (k, _gate) = kernel_with(&[d]);
        let id = k.task_id_by_name("alpha").unwrap();
        assert_eq!(id, TaskId::for_index(1));

        let snap = k.task_data(id).unwrap();
        assert_eq!(snap.id, id);
        assert_eq!(snap.name_str(), "alpha");
        assert_eq!(snap.priority, Priority(17));
        assert_eq!(snap.original_priority, Priority(17));
        assert_eq!(snap.privileges, Privilege::USER);
        assert_eq!(snap.stack_size, 0x400);
        assert_eq!(snap.state, TaskState::Ready);
        // Zero quota reads back as "no limit".
        assert_eq!(snap.cpu_usage_limit, CPU_LOAD_SCALE);
    }

    #[test]
    fn stack_bands_stack_downward() {
        let (k, _gate) =
            kernel_with(&[desc(spin_a, "a", 10), desc(spin_b, "b", 10)]);
        let top0 = config::MAIN_STACK_TOP - config::GLOBAL_STACK_RESERVE;
        let top1 = top0 - config::IDLE_TASK_STACK_SIZE;
        let top2 = top1 - 0x400;

        // Saved PSP sits below the 16-word first-dispatch frame.
        assert_eq!(k.tasks.task(1).psp, top1 - 64);
        assert_eq!(k.tasks.task(2).psp, top2 - 64);

        // Threshold leaves the guard band above the band floor.
        assert_eq!(
            k.tasks.task(1).overflow_threshold,
            top1 - 0x400 + config::STACK_GUARD_BAND
        );
        // Invariant: the threshold is strictly inside the band.
        let t = k.tasks.task(1);
        assert!(t.overflow_threshold > top1 - 0x400);
        assert!(t.overflow_threshold < t.psp);
    }

    #[test]
    fn table_fills_and_then_refuses() {
        let mut k = Kernel::new();
        k.install_idle_frame();
        let mut small = desc(spin_a, "filler", 9);
        small.stack_size = config::TASK_MIN_STACK_SIZE;
        for _ in 1..config::TASK_TABLE_SIZE {
            k.register(&small).unwrap();
        }
        assert_eq!(k.register(&small), Err(KernError::TableFull));
    }

    #[test]
    fn register_many_short_circuits() {
        let mut k = Kernel::new();
        k.install_idle_frame();
        let good = desc(spin_a, "good", 10);
        let mut bad = desc(spin_b, "bad", 10);
        bad.stack_size = 6; // misaligned and undersized
        let also_good = desc(spin_c, "also-good", 10);

        assert_eq!(
            k.register_many(&[good, bad, also_good]),
            Err(KernError::BadStackSize)
        );
        assert!(k.task_id_by_name("good").is_ok());
        assert_eq!(k.task_id_by_name("also-good"), Err(KernError::NotFound));
    }

    #[test]
    fn idle_is_unaddressable_through_the_api() {
        let (mut k, gate, ..) = two_task_kernel();
        assert_eq!(k.task_wake(&gate, TaskId::IDLE), Err(KernError::BadTaskId));
        assert_eq!(
            k.task_delete(&gate, TaskId::IDLE),
            Err(KernError::BadTaskId)
        );
        assert_eq!(
            k.task_data(TaskId::INVALID),
            Err(KernError::BadTaskId)
        );
        assert_eq!(
            k.task_data(TaskId(TaskId::IDLE.0 + 200)),
            Err(KernError::BadTaskId)
        );
    }

    #[test]
    fn sleep_wake_round_trip() {
        let (mut k, gate, boss, _) = two_task_kernel();
        assert!(k.task_sleep(&gate, 10).is_ok());
        assert_eq!(k.task_data(boss).unwrap().state, TaskState::Sleeping);
        // Sleeping task cannot sleep again.
        assert_eq!(k.task_sleep(&gate, 10), Err(KernError::WrongState));

        // Waking yourself is impossible in practice; here boss holds the
        // manipulation bit, so the kernel lets it wake anyone, itself
        // included.
        assert!(k.task_wake(&gate, boss).is_ok());
        assert_eq!(k.task_data(boss).unwrap().state, TaskState::Ready);
        // Waking a task that is not sleeping fails.
        assert_eq!(k.task_wake(&gate, boss), Err(KernError::WrongState));
    }

    #[test]
    fn sleep_is_refused_from_idle() {
        let (mut k, gate) = kernel_with(&[]);
        assert_eq!(k.task_sleep(&gate, 5), Err(KernError::IdleRestricted));
    }

    #[test]
    fn suspend_remembers_and_resume_restores() {
        let (mut k, gate, _, worker) = two_task_kernel();

        // Ready -> Suspended -> Ready.
        assert!(k.task_suspend(&gate, worker).is_ok());
        let snap = k.task_data(worker).unwrap();
        assert_eq!(snap.state, TaskState::Suspended);
        assert_eq!(snap.previous_state, TaskState::Ready);
        assert!(k.task_resume(&gate, worker).is_ok());
        assert_eq!(k.task_data(worker).unwrap().state, TaskState::Ready);

        // Blocked -> Suspended -> Blocked.
        assert!(k.task_block(&gate, worker, 100).is_ok());
        assert!(k.task_suspend(&gate, worker).is_ok());
        let snap = k.task_data(worker).unwrap();
        assert_eq!(snap.previous_state, TaskState::Blocked);
        assert!(k.task_resume(&gate, worker).is_ok());
        assert_eq!(k.task_data(worker).unwrap().state, TaskState::Blocked);

        // Double suspend and double resume both fail.
        assert!(k.task_suspend(&gate, worker).is_ok());
        assert_eq!(k.task_suspend(&gate, worker), Err(KernError::WrongState));
        assert!(k.task_resume(&gate, worker).is_ok());
        assert_eq!(k.task_resume(&gate, worker), Err(KernError::WrongState));
    }

    #[test]
    fn unblock_promotes_suspended_blockers() {
        let (mut k, gate, _, worker) = two_task_kernel();
        assert!(k.task_block(&gate, worker, BLOCK_FOREVER).is_ok());
        assert!(k.task_suspend(&gate, worker).is_ok());
        assert!(k.task_unblock(&gate, worker).is_ok());

        // Still suspended, but resuming now lands in Ready, not Blocked.
        let snap = k.task_data(worker).unwrap();
        assert_eq!(snap.state, TaskState::Suspended);
        assert_eq!(snap.previous_state, TaskState::Ready);
        assert!(k.task_resume(&gate, worker).is_ok());
        assert_eq!(k.task_data(worker).unwrap().state, TaskState::Ready);

        // Unblocking a plain Ready task fails.
        assert_eq!(k.task_unblock(&gate, worker), Err(KernError::WrongState));
    }

    #[test]
    fn block_requires_ready() {
        let (mut k, gate, _, worker) = two_task_kernel();
        assert!(k.task_suspend(&gate, worker).is_ok());
        assert_eq!(
            k.task_block(&gate, worker, 10),
            Err(KernError::WrongState)
        );
    }

    #[test]
    fn zombie_is_terminal() {
        let (mut k, gate, _, worker) = two_task_kernel();
        assert!(k.task_delete(&gate, worker).is_ok());
        assert_eq!(k.task_data(worker).unwrap().state, TaskState::Zombie);

        // No operation brings it back.
        assert_eq!(k.task_delete(&gate, worker), Err(KernError::WrongState));
        assert_eq!(k.task_wake(&gate, worker), Err(KernError::WrongState));
        assert_eq!(k.task_suspend(&gate, worker), Err(KernError::WrongState));
        assert_eq!(k.task_resume(&gate, worker), Err(KernError::WrongState));
        assert_eq!(
            k.task_block(&gate, worker, 5),
            Err(KernError::WrongState)
        );
        assert_eq!(k.task_unblock(&gate, worker), Err(KernError::WrongState));
    }

    #[test]
    fn every_transition_stays_inside_the_permitted_set() {
        // Drives each mutating operation against each reachable starting
        // state and checks the destination against the allowed table.
        use TaskState::*;
        let states = [Ready, Sleeping, Blocked, Suspended, Zombie];

        for &start in &states {
            for op in 0..6 {
                let (mut k, gate, _, worker) = two_task_kernel();
                // Maneuver worker into `start`.
                match start {
                    Ready => {}
                    Sleeping => {
                        k.force_current(2);
                        k.task_sleep(&gate, 50).unwrap();
                        k.force_current(1);
                    }
                    Blocked => {
                        k.task_block(&gate, worker, 50).unwrap();
                    }
                    Suspended => {
                        k.task_suspend(&gate, worker).unwrap();
                    }
                    Zombie => {
                        k.task_delete(&gate, worker).unwrap();
                    }
                }
                let result = match op {
                    0 => k.task_wake(&gate, worker),
                    1 => k.task_suspend(&gate, worker),
                    2 => k.task_resume(&gate, worker),
                    3 => k.task_block(&gate, worker, 5),
                    4 => k.task_unblock(&gate, worker),
                    _ => k.task_delete(&gate, worker),
                };
                let end = k.task_data(worker).unwrap().state;

                if start == Zombie {
                    // Nothing leaves Zombie.
                    assert_eq!(end, Zombie);
                    assert!(result.is_err());
                }
                if end == Zombie && start != Zombie {
                    // Only delete reaches Zombie.
                    assert_eq!(op, 5, "op {op} reached Zombie from {start:?}");
                }
                if result.is_err() && start != Zombie {
                    // Failed operations leave the state alone.
                    assert_eq!(end, start);
                }
            }
        }
    }

    #[test]
    fn delete_fires_the_signal_with_a_temporary_grant() {
        use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
        static DELETED: AtomicU32 = AtomicU32::new(0);
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn on_delete(id: TaskId) {
            DELETED.store(u32::from(id.0), Ordering::Relaxed);
            CALLS.fetch_add(1, Ordering::Relaxed);
        }

        // The delete-signal hook is global and write-once; this is the only
        // test that registers it.
        crate::hooks::subscribe_task_delete_signal(on_delete).unwrap();

        let (mut k, gate, boss, worker) = two_task_kernel();
        // Drop boss's signaling bit so the temporary grant path runs.
        k.task_remove_privileges(&gate, boss, Privilege::SIGNALING)
            .unwrap();
        assert!(k.task_delete(&gate, worker).is_ok());

        assert_eq!(DELETED.load(Ordering::Relaxed), u32::from(worker.0));
        assert!(CALLS.load(Ordering::Relaxed) >= 1);
        // The grant was revoked after the signal.
        assert!(!k
            .task_privileges(boss)
            .unwrap()
            .contains(Privilege::SIGNALING));
    }

    #[test]
    fn priority_changes_honor_the_idle_ceiling() {
        let (mut k, gate, _, worker) = two_task_kernel();
        assert!(k.task_set_priority(&gate, worker, Priority(3)).is_ok());
        assert_eq!(k.task_priority(worker).unwrap(), Priority(3));
        // The original priority is untouched by the current-priority change.
        assert_eq!(k.task_original_priority(worker).unwrap(), Priority(60));

        assert!(k
            .task_set_original_priority(&gate, worker, Priority(4))
            .is_ok());
        assert_eq!(k.task_original_priority(worker).unwrap(), Priority(4));

        assert_eq!(
            k.task_set_priority(&gate, worker, Priority::IDLE),
            Err(KernError::BadPriority)
        );
    }

    #[test]
    fn privilege_editing_round_trips() {
        let (mut k, gate, _, worker) = two_task_kernel();
        assert_eq!(k.task_privileges(worker).unwrap(), Privilege::USER);

        // Kernel-byte grant from a supervisor caller.
        assert!(k
            .task_add_privileges(&gate, worker, Privilege::TRACE)
            .is_ok());
        assert!(k.task_privileges(worker).unwrap().contains(Privilege::TRACE));

        assert!(k
            .task_remove_privileges(&gate, worker, Privilege::TRACE)
            .is_ok());
        assert!(!k.task_privileges(worker).unwrap().contains(Privilege::TRACE));

        assert!(k
            .task_set_privileges(&gate, worker, Privilege::PRIVILEGED_USER)
            .is_ok());
        assert_eq!(
            k.task_privileges(worker).unwrap(),
            Privilege::PRIVILEGED_USER
        );
    }

    #[test]
    #[should_panic]
    fn unprivileged_suspend_of_another_task_is_fatal() {
        let (mut k, gate, _, worker) = two_task_kernel();
        // Make the unprivileged worker the caller and aim at slot 1.
        k.force_current(2);
        let boss_id = TaskId::for_index(1);
        let _ = k.task_suspend(&gate, boss_id);
        let _ = worker;
    }

    #[test]
    #[should_panic]
    fn unprivileged_kernel_byte_grant_is_fatal() {
        let (mut k, gate, _, worker) = two_task_kernel();
        k.force_current(2);
        let _ = k.task_add_privileges(&gate, worker, Privilege::TASK_MANIPULATE);
    }

    #[test]
    fn isr_context_stands_in_for_privilege() {
        let (mut k, gate, _, worker) = two_task_kernel();
        k.force_current(2); // unprivileged caller
        gate.isr_enter();
        // Inside an ISR the same operation is allowed.
        assert!(k.task_suspend(&gate, TaskId::for_index(1)).is_ok());
        gate.isr_exit();
        let _ = worker;
    }

    #[test]
    fn data_by_index_requires_the_kernel_byte() {
        let (k, gate, ..) = two_task_kernel();
        // Boss is SUPERVISOR, which includes the kernel byte; idle at index
        // 0 is visible to it.
        let idle = k.task_data_by_index(&gate, 0).unwrap();
        assert_eq!(idle.id, TaskId::IDLE);
        assert_eq!(idle.name_str(), "idle");
        assert_eq!(
            k.task_data_by_index(&gate, config::TASK_TABLE_SIZE),
            Err(KernError::BadTaskId)
        );
        // Unused slot.
        assert_eq!(
            k.task_data_by_index(&gate, 5),
            Err(KernError::BadTaskId)
        );
    }

    #[test]
    #[should_panic]
    fn data_by_index_without_kernel_byte_is_fatal() {
        let (mut k, gate, ..) = two_task_kernel();
        k.force_current(2);
        let _ = k.task_data_by_index(&gate, 0);
    }
}
