// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor type used to register tasks.

use vigil_abi::{Priority, Privilege, TASK_NAME_LEN};

use crate::config;
use crate::err::KernError;

/// Record describing a task to be registered.
///
/// This is the caller-facing half of registration: the kernel validates it,
/// assigns a table slot and a stack band, and keeps its own copy of the
/// fields. The descriptor itself can live anywhere, including the caller's
/// stack.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    /// The task's entry point. Executed on first dispatch with a fresh
    /// register file; must never return.
    pub entry: fn(),
    /// Human-readable name, at most [`TASK_NAME_LEN`] bytes. Must be unique
    /// if id-by-name lookup is to be useful; the kernel does not check.
    pub name: &'static str,
    /// Scheduling priority. Must be below the reserved idle priority.
    pub priority: Priority,
    /// Privilege bit-set. Must not be empty.
    pub privileges: Privilege,
    /// Private stack size in bytes; a multiple of four within the configured
    /// bounds.
    pub stack_size: u32,
    /// Per-task CPU quota in hundredths of a percent. Zero means no quota
    /// (treated as full scale).
    pub cpu_usage_limit: u16,
}

impl TaskDesc {
    /// Checks the descriptor against the registration rules.
    pub(crate) fn validate(&self) -> Result<(), KernError> {
        if self.privileges.is_empty() {
            return Err(KernError::NoPrivileges);
        }
        if !self.priority.is_user() {
            return Err(KernError::BadPriority);
        }
        if core::ptr::fn_addr_eq(self.entry, crate::sched::idle_main as fn())
        {
            return Err(KernError::IdleEntry);
        }
        if self.stack_size < config::TASK_MIN_STACK_SIZE
            || self.stack_size > config::TASK_MAX_STACK_SIZE
            || self.stack_size % 4 != 0
        {
            return Err(KernError::BadStackSize);
        }
        if self.name.len() > TASK_NAME_LEN {
            return Err(KernError::BadName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() {}

    fn base_desc() -> TaskDesc {
        TaskDesc {
            entry: noop,
            name: "worker",
            priority: Priority(100),
            privileges: Privilege::USER,
            stack_size: 0x400,
            cpu_usage_limit: 0,
        }
    }

    #[test]
    fn a_reasonable_descriptor_passes() {
        assert!(base_desc().validate().is_ok());
    }

    #[test]
    fn rejects_empty_privileges() {
        let mut d = base_desc();
        d.privileges = Privilege::empty();
        assert_eq!(d.validate(), Err(KernError::NoPrivileges));
    }

    #[test]
    fn rejects_idle_priority() {
        let mut d = base_desc();
        d.priority = Priority::IDLE;
        assert_eq!(d.validate(), Err(KernError::BadPriority));
    }

    #[test]
    fn rejects_idle_entry_point() {
        let mut d = base_desc();
        d.entry = crate::sched::idle_main;
        assert_eq!(d.validate(), Err(KernError::IdleEntry));
    }

    #[test]
    fn rejects_bad_stack_sizes() {
        for size in [
            0,
            config::TASK_MIN_STACK_SIZE - 4,
            config::TASK_MAX_STACK_SIZE + 4,
            config::TASK_MIN_STACK_SIZE + 2, // misaligned
        ] {
            let mut d = base_desc();
            d.stack_size = size;
            assert_eq!(d.validate(), Err(KernError::BadStackSize), "{size}");
        }
    }

    #[test]
    fn rejects_oversized_name() {
        let mut d = base_desc();
        d.name = "a-name-well-beyond-the-thirty-two-byte-limit";
        assert_eq!(d.validate(), Err(KernError::BadName));
    }
}
