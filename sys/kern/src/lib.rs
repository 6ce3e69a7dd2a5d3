// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vigil kernel.
//!
//! A preemptive, priority-based kernel for single-core ARMv7-M parts. Each
//! task gets a private process stack, a priority, a privilege bit-set, and
//! a CPU quota; the kernel owns processor time, the millisecond tick, stack
//! integrity, and per-task CPU accounting. Everything else (wall-clock
//! time, signals, queues, transports, drivers) lives outside and talks to
//! the kernel through the hook seams in [`hooks`].
//!
//! # Design principles
//!
//! 1. Static configuration. The task table, stack layout, and every bound
//!    are fixed at compile time; the kernel never allocates.
//! 2. A strong preference for safe code. `unsafe` is confined to the `arch`
//!    layer and two well-commented cells, and each use states its
//!    exclusivity argument.
//! 3. Simple and clear algorithms over fast and clever ones. Selection is
//!    one linear scan; the critical-section gate is three counters.
//! 4. Host testability. The portable core compiles and runs against the
//!    `arch::fake` stubs, so the state machines are exercised by ordinary
//!    `cargo test` without a target board.

// Allow std-y things to be used in test. Note that this attribute is a bit
// of a trap for the programmer, because rust-analyzer by default seems to
// build things with test set. This means it's easy to introduce code
// incompatible with no_std without your editor hassling you about it.
// Beware.
#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod descs;
pub mod dump;
pub mod err;
pub mod fail;
pub mod hooks;
pub mod sched;
pub mod startup;
pub mod task;
pub mod time;
pub mod usage;
