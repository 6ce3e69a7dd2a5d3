// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time arithmetic.
//!
//! The kernel counts time in millisecond ticks held in a single 32-bit
//! counter, owned by the kernel state and advanced by
//! [`crate::sched::Kernel::tick`]; [`crate::sched::Kernel::sys_ticks`] is
//! the read-back. The counter wraps about every 49.7 days, so consumers
//! must never order two tick values with `<`; the only legal comparison is
//! the unsigned subtraction below, which stays correct across wrap.

/// Number of ticks from `since` to `now`, assuming `now` is not older than
/// `since`. Correct across counter wrap.
pub fn elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_survives_wraparound() {
        assert_eq!(elapsed(5, 3), 2);
        assert_eq!(elapsed(2, u32::MAX - 1), 4);
        assert_eq!(elapsed(0, u32::MAX), 1);
        assert_eq!(elapsed(7, 7), 0);
    }
}
