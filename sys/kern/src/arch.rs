// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names. The `fake` module is the not-a-real-machine variant used
//! for simulation and for running the kernel's unit tests on the build
//! host: register access collapses to inert stubs while the table, the
//! scheduler, and the accounting above it stay bit-for-bit the same.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
