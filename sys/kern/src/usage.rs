// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CPU-usage accounting.
//!
//! Each task carries two time accumulators. The *cumulative* one is a plain
//! stopwatch for reporting and is never cleared. The *monitoring* one is
//! rolling: the scheduler adds every execution interval to it (and to a
//! kernel-wide twin), and the recompute below converts the pair into a
//! usage percentage, committing and clearing once at least a second of
//! system time has been observed.
//!
//! The recompute runs from the idle task, so the figures refresh exactly as
//! often as the system has slack to refresh them.

use vigil_abi::CPU_LOAD_SCALE;

use crate::config;
use crate::sched::Kernel;

impl Kernel {
    /// Recomputes every task's CPU-usage figures from the monitoring
    /// accumulators.
    ///
    /// The rolling percentage updates on every call. The committed
    /// percentage, the cumulative run time, and the peak update only once
    /// the monitoring window has covered at least one second (or when
    /// `force_reset` asks for an early commit), after which the window
    /// starts over.
    pub fn recompute_usages(&mut self, force_reset: bool) {
        let system_us = self.monitoring_time.to_microseconds();
        let commit = force_reset || self.monitoring_time.seconds > 0;

        for index in 0..config::TASK_TABLE_SIZE {
            let task = self.tasks.task_mut(index);
            if !task.is_in_use() {
                break;
            }
            if system_us == 0 {
                continue;
            }

            let task_us = task.monitoring_run_time.to_microseconds();
            let share = (u64::from(CPU_LOAD_SCALE) * u64::from(task_us)
                / u64::from(system_us)) as u16;
            task.cpu_monitoring_usage = share;

            if commit {
                task.cpu_usage = share;

                // Fold the monitoring window into the cumulative stopwatch,
                // then open a fresh window.
                task.run_time
                    .add_microseconds(task.monitoring_run_time.microseconds);
                task.run_time.add_milliseconds(
                    u32::from(task.monitoring_run_time.milliseconds)
                        + u32::from(task.monitoring_run_time.seconds) * 1000,
                );
                task.monitoring_run_time = vigil_abi::Runtime::ZERO;

                if task.cpu_usage > task.cpu_usage_peak {
                    task.cpu_usage_peak = task.cpu_usage;
                }
            }
        }

        if commit {
            self.monitoring_time = vigil_abi::Runtime::ZERO;
        }
    }
}

/// Spins for `us` microseconds against the platform microsecond timer.
pub fn delay_us(us: u16) {
    let start = crate::hooks::platform_micros();
    while crate::hooks::platform_micros().wrapping_sub(start) < us {
        core::hint::spin_loop();
    }
}

/// Spins for `ms` milliseconds against the kernel tick counter.
pub fn delay_ms(ms: u32) {
    let start = crate::startup::with_kernel(|k| k.sys_ticks());
    loop {
        let now = crate::startup::with_kernel(|k| k.sys_ticks());
        if crate::time::elapsed(now, start) >= ms {
            break;
        }
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descs::TaskDesc;
    use vigil_abi::{Priority, Privilege, Runtime};

    fn spin_a() {}
    fn spin_b() {}

    fn kernel_with_two() -> Kernel {
        let mut k = Kernel::new();
        k.install_idle_frame();
        for (entry, name) in [(spin_a as fn(), "a"), (spin_b as fn(), "b")] {
            k.register(&TaskDesc {
                entry,
                name,
                priority: Priority(10),
                privileges: Privilege::USER,
                stack_size: 0x400,
                cpu_usage_limit: 0,
            })
            .unwrap();
        }
        k
    }

    fn runtime_us(us: u32) -> Runtime {
        let mut rt = Runtime::ZERO;
        rt.add_milliseconds(us / 1000);
        rt.add_microseconds((us % 1000) as u16);
        rt
    }

    #[test]
    fn rolling_usage_updates_without_commit() {
        let mut k = kernel_with_two();
        k.monitoring_time = runtime_us(800_000); // under a second
        k.tasks.task_mut(1).monitoring_run_time = runtime_us(200_000);
        k.tasks.task_mut(2).monitoring_run_time = runtime_us(600_000);

        k.recompute_usages(false);

        assert_eq!(k.tasks().task(1).snapshot().cpu_monitoring_usage, 2500);
        assert_eq!(k.tasks().task(2).snapshot().cpu_monitoring_usage, 7500);
        // No commit: committed figure untouched, window still open.
        assert_eq!(k.tasks().task(1).snapshot().cpu_usage, 0);
        assert_eq!(k.monitoring_time, runtime_us(800_000));
        assert_eq!(
            k.tasks.task(1).monitoring_run_time,
            runtime_us(200_000)
        );
    }

    #[test]
    fn a_full_second_commits_and_resets_the_window() {
        let mut k = kernel_with_two();
        k.monitoring_time = runtime_us(1_200_000);
        k.tasks.task_mut(1).monitoring_run_time = runtime_us(300_000);

        k.recompute_usages(false);

        let snap = k.tasks().task(1).snapshot();
        assert_eq!(snap.cpu_usage, 2500);
        assert_eq!(snap.cpu_usage_peak, 2500);
        // The window folded into the cumulative stopwatch and closed.
        assert_eq!(snap.run_time, runtime_us(300_000));
        assert_eq!(k.tasks.task(1).monitoring_run_time, Runtime::ZERO);
        assert_eq!(k.monitoring_time, Runtime::ZERO);
    }

    #[test]
    fn forced_reset_commits_early() {
        let mut k = kernel_with_two();
        k.monitoring_time = runtime_us(100_000);
        k.tasks.task_mut(1).monitoring_run_time = runtime_us(50_000);

        k.recompute_usages(true);

        assert_eq!(k.tasks().task(1).snapshot().cpu_usage, 5000);
        assert_eq!(k.monitoring_time, Runtime::ZERO);
    }

    #[test]
    fn peak_only_rises() {
        let mut k = kernel_with_two();
        k.monitoring_time = runtime_us(1_000_000);
        k.tasks.task_mut(1).monitoring_run_time = runtime_us(400_000);
        k.recompute_usages(true);
        assert_eq!(k.tasks().task(1).snapshot().cpu_usage_peak, 4000);

        k.monitoring_time = runtime_us(1_000_000);
        k.tasks.task_mut(1).monitoring_run_time = runtime_us(100_000);
        k.recompute_usages(true);
        let snap = k.tasks().task(1).snapshot();
        assert_eq!(snap.cpu_usage, 1000);
        assert_eq!(snap.cpu_usage_peak, 4000, "peak must not decay");
    }

    #[test]
    fn shares_sum_to_at_most_full_scale() {
        let mut k = kernel_with_two();
        // Uneven split with rounding losses.
        k.monitoring_time = runtime_us(1_000_003);
        k.tasks.task_mut(0).monitoring_run_time = runtime_us(333_334);
        k.tasks.task_mut(1).monitoring_run_time = runtime_us(333_334);
        k.tasks.task_mut(2).monitoring_run_time = runtime_us(333_335);

        k.recompute_usages(false);

        let total: u32 = (0..3)
            .map(|i| u32::from(k.tasks().task(i).snapshot().cpu_monitoring_usage))
            .sum();
        assert!(total <= u32::from(CPU_LOAD_SCALE));
        assert!(total >= u32::from(CPU_LOAD_SCALE) - 3, "rounding only");
    }

    #[test]
    fn overall_usage_is_what_idle_did_not_get() {
        let mut k = kernel_with_two();
        k.monitoring_time = runtime_us(500_000);
        k.tasks.task_mut(0).monitoring_run_time = runtime_us(150_000);
        k.recompute_usages(false);
        assert_eq!(k.tasks().task(0).snapshot().cpu_monitoring_usage, 3000);
        assert_eq!(k.overall_cpu_usage(), 7000);
    }

    #[test]
    fn delay_ms_waits_for_kernel_ticks() {
        use core::sync::atomic::{AtomicBool, Ordering};
        static DONE: AtomicBool = AtomicBool::new(false);

        // Tick the kernel singleton from a second context, standing in for
        // the tick interrupt, until the delay below has seen enough time.
        let ticker = std::thread::spawn(|| {
            let gate = crate::sched::Gate::new();
            while !DONE.load(Ordering::Relaxed) {
                crate::startup::with_kernel(|k| k.tick(&gate));
                std::thread::yield_now();
            }
        });

        delay_ms(10);
        DONE.store(true, Ordering::Relaxed);
        ticker.join().unwrap();
    }

    #[test]
    fn empty_window_changes_nothing() {
        let mut k = kernel_with_two();
        k.tasks.task_mut(1).cpu_monitoring_usage = 1234;
        k.recompute_usages(false);
        // With zero observed system time there is nothing to divide by.
        assert_eq!(k.tasks().task(1).snapshot().cpu_monitoring_usage, 1234);
    }
}
