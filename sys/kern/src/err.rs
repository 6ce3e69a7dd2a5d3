// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Two kinds of failure flow through the kernel and they are handled very
//! differently:
//!
//! - *Validation* failures (a bad id, a malformed descriptor, a state that
//!   does not permit the requested transition) are ordinary and are returned
//!   to the caller as `Err(KernError)`. Nothing is logged.
//! - *Authorisation* failures and faults are not ordinary. A task that calls
//!   an operation it holds no privilege for is either corrupt or hostile, so
//!   the response is terminal: trace the actors, disable scheduling, and
//!   halt. See [`fatal`].

use core::fmt;

use vigil_abi::Code;

/// Failure modes of the fallible kernel operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernError {
    /// Task id outside the valid range, or naming an unused slot.
    BadTaskId,
    /// No task registered under the requested name.
    NotFound,
    /// The target task's state does not permit the requested transition.
    WrongState,
    /// No free slot in the task table.
    TableFull,
    /// Priority at or above the reserved idle priority.
    BadPriority,
    /// Stack size out of bounds or not a multiple of four.
    BadStackSize,
    /// Task name too long for the fixed name field.
    BadName,
    /// Attempt to register the idle entry point as a user task.
    IdleEntry,
    /// Descriptor with an empty privilege set.
    NoPrivileges,
    /// Operation not available from the idle task.
    IdleRestricted,
    /// Argument out of its documented range.
    BadArgument,
    /// A write-once hook slot already holds a callback.
    HookInUse,
}

impl From<KernError> for Code {
    fn from(_: KernError) -> Code {
        Code::Error
    }
}

/// Severity of a reported error.
///
/// Like the other persistent encodings, the discriminants are sparse so that
/// a flipped bit in a stored level cannot silently demote a fatal error to a
/// warning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ErrorLevel {
    /// Kernel-level error. Scheduling stops, the system halts.
    OsFatal = 0b110100,
    /// Kernel-level condition worth tracing; execution continues.
    OsWarning = 0b101110,
    /// Application-requested stop.
    UserFatal = 0b011010,
    /// Application-level warning; execution continues.
    UserWarning = 0b111010,
}

impl ErrorLevel {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorLevel::OsFatal | ErrorLevel::UserFatal)
    }

    fn banner(self) -> &'static str {
        match self {
            ErrorLevel::OsFatal => "OS-level error - system stopped",
            ErrorLevel::OsWarning => "OS-level error - warning",
            ErrorLevel::UserFatal => "User-level error - system stopped",
            ErrorLevel::UserWarning => "User-level error - warning",
        }
    }
}

/// Traces an error report at the given level.
#[track_caller]
fn report(level: ErrorLevel, args: fmt::Arguments<'_>) {
    let loc = core::panic::Location::caller();
    crate::hooks::trace_args(format_args!(
        "{}\r\nat: <{}>, line: {}\r\n{}\r\n",
        level.banner(),
        loc.file(),
        loc.line(),
        args
    ));
}

/// Reports a kernel-level fatal error and halts. `fail::die` disables
/// scheduling on the way down, so no further task, however privileged,
/// runs after the report.
#[track_caller]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    report(ErrorLevel::OsFatal, args);
    crate::fail::die(args)
}

/// Reports an application-requested fatal error and halts, like [`fatal`].
#[track_caller]
pub fn user_fatal(args: fmt::Arguments<'_>) -> ! {
    report(ErrorLevel::UserFatal, args);
    crate::fail::die(args)
}

/// Traces a kernel-level warning and returns.
#[track_caller]
pub fn warning(args: fmt::Arguments<'_>) {
    report(ErrorLevel::OsWarning, args);
}

/// Traces an application-level warning and returns.
#[track_caller]
pub fn user_warning(args: fmt::Arguments<'_>) {
    report(ErrorLevel::UserWarning, args);
}

/// Traces a one-line initialization report and passes `result` through, so
/// startup code can write
/// `result = result.combine(trace_init("timers", timer_init()))`.
pub fn trace_init(what: &str, result: Code) -> Code {
    let verdict = if result.is_success() { " OK  " } else { "ERROR" };
    crate::hooks::trace_args(format_args!("{what:<48} [ {verdict} ]\r\n"));
    result
}
