// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel configuration.
//!
//! Everything here is a constant so that the task table, the stack layout,
//! and all bounds checks are fixed at build time. There is no dynamic
//! allocation anywhere in the kernel.

/// Number of slots in the task table, including slot 0, which permanently
/// holds the idle task.
pub const TASK_TABLE_SIZE: usize = 36;

/// Smallest stack a task may declare, in bytes.
pub const TASK_MIN_STACK_SIZE: u32 = 0x200;

/// Largest stack a task may declare, in bytes.
pub const TASK_MAX_STACK_SIZE: u32 = 0x4000;

/// Stack reserved for the idle task.
pub const IDLE_TASK_STACK_SIZE: u32 = 0x300;

/// Base address of SRAM on the reference part.
pub const RAM_BASE: u32 = 0x2000_0000;

/// SRAM size on the reference part (128 kiB).
pub const RAM_SIZE: u32 = 128 * 1024;

/// Top of the Main stack, used by the kernel and by exception handlers.
pub const MAIN_STACK_TOP: u32 = RAM_BASE + RAM_SIZE;

/// Bytes below `MAIN_STACK_TOP` reserved for the Main stack and startup
/// code. Task stack bands are laid out downward from the bottom of this
/// region, in registration order.
pub const GLOBAL_STACK_RESERVE: u32 = 0x1200;

/// Bytes between a stack band's low address and its overflow threshold. The
/// monitor trips while an errant stack is still inside its own band, before
/// it can reach the band below.
pub const STACK_GUARD_BAND: u32 = 64;

const _: () = assert!(TASK_TABLE_SIZE >= 2);
const _: () = assert!(TASK_MIN_STACK_SIZE % 4 == 0);
const _: () = assert!(IDLE_TASK_STACK_SIZE >= TASK_MIN_STACK_SIZE);
const _: () = assert!(STACK_GUARD_BAND < TASK_MIN_STACK_SIZE);
