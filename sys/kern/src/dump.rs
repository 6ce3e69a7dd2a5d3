// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diagnostic dump: three formatted tables pushed into the trace sink.
//!
//! The output is meant for a human on the other end of a serial line, so it
//! is fixed-width text, one row per registered task.

use core::fmt::Write;

use crate::hooks::TraceSink;
use crate::sched::Kernel;

/// Sender kind reported to the dump-ready signal when the kernel itself
/// produced the dump.
pub const SENDER_KERNEL: u16 = 0;

const TASK_DUMP_SEPARATOR: &str = "+--------+------------------------------+------+------------------+---------+-----------+\r\n";
const MAX_CPU_DUMP_SEPARATOR: &str = "+--------+------------------------------+-------------+\r\n";
const STACK_STATS_SEPARATOR: &str = "+--------+------------------------------+--------+----------------+-----------+\r\n";

/// Writes the task summary, CPU peak, and stack statistics tables to the
/// trace sink, then fires the dump-ready signal.
pub fn dump(k: &Kernel) {
    let mut out = TraceSink;

    // Per-task runtime summary.
    out.write_str("Task dump:\r\n").ok();
    out.write_str(TASK_DUMP_SEPARATOR).ok();
    writeln!(
        out,
        "| {:>6} | {:>28} | {:>4} | {:>16} | {:>7} | {:>9} |\r",
        "tid", "name", "prio", "privileges", "cpu [%]", "state"
    )
    .ok();
    out.write_str(TASK_DUMP_SEPARATOR).ok();
    for task in k.tasks().iter_in_use() {
        let snap = task.snapshot();
        writeln!(
            out,
            "| 0x{:04X} | {:>28} | {:>4} | {:016b} | {:>4}.{:02} | {:>9} |\r",
            snap.id.0,
            snap.name_str(),
            snap.priority.0,
            snap.privileges.bits(),
            snap.cpu_usage / 100,
            snap.cpu_usage % 100,
            snap.state.as_str(),
        )
        .ok();
    }
    out.write_str(TASK_DUMP_SEPARATOR).ok();
    out.write_str("\n").ok();

    // Per-task CPU peaks.
    out.write_str("CPU max loads:\r\n").ok();
    out.write_str(MAX_CPU_DUMP_SEPARATOR).ok();
    writeln!(
        out,
        "| {:>6} | {:>28} | {:>11} |\r",
        "tid", "name", "max cpu [%]"
    )
    .ok();
    out.write_str(MAX_CPU_DUMP_SEPARATOR).ok();
    for task in k.tasks().iter_in_use() {
        let snap = task.snapshot();
        writeln!(
            out,
            "| 0x{:04X} | {:>28} | {:>8}.{:02} |\r",
            snap.id.0,
            snap.name_str(),
            snap.cpu_usage_peak / 100,
            snap.cpu_usage_peak % 100,
        )
        .ok();
    }
    out.write_str(MAX_CPU_DUMP_SEPARATOR).ok();
    out.write_str("\n").ok();

    // Per-task stack statistics.
    out.write_str("Stack statistics:\r\n").ok();
    out.write_str(STACK_STATS_SEPARATOR).ok();
    writeln!(
        out,
        "| {:>6} | {:>28} | {:>6} | {:>14} | {:>9} |\r",
        "tid", "name", "stack", "max stack use", "stack [%]"
    )
    .ok();
    out.write_str(STACK_STATS_SEPARATOR).ok();
    for task in k.tasks().iter_in_use() {
        let snap = task.snapshot();
        let permille =
            10_000u64 * u64::from(snap.stack_peak_usage) / u64::from(snap.stack_size);
        writeln!(
            out,
            "| 0x{:04X} | {:>28} | 0x{:04X} | 0x{:<12X} | {:>6}.{:02} |\r",
            snap.id.0,
            snap.name_str(),
            snap.stack_size,
            snap.stack_peak_usage,
            permille / 100,
            permille % 100,
        )
        .ok();
    }
    out.write_str(STACK_STATS_SEPARATOR).ok();
    out.write_str("\n").ok();

    if let Some(f) = crate::hooks::DUMP_READY_SIGNAL.get() {
        f(SENDER_KERNEL);
    }
}
