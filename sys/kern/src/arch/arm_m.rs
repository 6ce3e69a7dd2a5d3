// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # Exception cast
//!
//! Three handlers carry the kernel:
//!
//! - `SysTick` fires every millisecond, advances kernel time, runs the
//!   stack monitor, and *requests* a reschedule by pending `PendSV`.
//! - `SVCall` implements the `SVC #0xFF` hop that unprivileged code uses to
//!   request a reschedule (and the reset request, which must execute
//!   privileged). It does not switch contexts itself; it pends `PendSV`.
//! - `PendSV` is the pending-switch exception, configured at the lowest
//!   priority so it tail-chains after whatever ISR asked for it. It saves
//!   the outgoing task's callee-saved registers on that task's process
//!   stack, runs the selector, and restores the incoming task. It also
//!   doubles as the privileged-mode gate: when a privilege raise is
//!   pending, it flips `CONTROL.nPRIV` and returns without switching.
//!
//! All three run at the same (lowest) exception priority, so they never
//! preempt one another; fault handlers sit above them.
//!
//! # First dispatch
//!
//! Every task stack is born with a synthetic exception frame, so the
//! restore path in `PendSV` works identically for a task that has never run
//! and one that has. `start_first_task` itself does not go through an
//! exception: it loads the process stack pointer, drops thread mode to
//! unprivileged, and branches straight into the idle task.

use core::arch::{asm, global_asm};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::sched::GATE;
use crate::startup::with_kernel;

/// Unwrapping without dragging the error's `Debug` formatting into the
/// image; `#[track_caller]` still points the panic at the call site.
trait UnwrapLite {
    type Output;
    fn unwrap_lite(self) -> Self::Output;
}

impl<T, E> UnwrapLite for Result<T, E> {
    type Output = T;

    #[track_caller]
    #[inline(always)]
    fn unwrap_lite(self) -> Self::Output {
        match self {
            Ok(x) => x,
            Err(_) => panic!(),
        }
    }
}

/// Hardware-stacked half of an exception frame.
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct HwFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// The full synthetic frame written to a fresh task stack: the callee-saved
/// registers the context switcher pops, followed by the hardware frame the
/// exception return pops.
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct InitialFrame {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    hw: HwFrame,
}

/// Bytes a fresh stack loses to its synthetic frame.
pub const FRAME_SIZE: u32 = core::mem::size_of::<InitialFrame>() as u32;

const _: () = assert!(FRAME_SIZE == 64);

/// Initial xPSR: just the Thumb state bit.
const INITIAL_XPSR: u32 = 1 << 24;

/// EXC_RETURN selecting "thread mode, process stack".
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Writes the synthetic first-dispatch frame at the top of a task's stack
/// band and returns the resulting stack pointer.
pub fn init_task_stack(band_top: u32, entry: fn()) -> u32 {
    // Stack bands are laid out in 4-byte granules; a misaligned band means
    // the layout arithmetic is corrupt, which is worth dying over.
    assert!(band_top & 0x3 == 0);

    let frame = InitialFrame {
        // Recognizable register-number patterns, for reading raw stack
        // dumps.
        r4: 0x0404_0404,
        r5: 0x0505_0505,
        r6: 0x0606_0606,
        r7: 0x0707_0707,
        r8: 0x0808_0808,
        r9: 0x0909_0909,
        r10: 0x1010_1010,
        r11: 0x1111_1111,
        hw: HwFrame {
            r0: 0x0000_0000,
            r1: 0x0101_0101,
            r2: 0x0202_0202,
            r3: 0x0303_0303,
            r12: 0x1212_1212,
            // The value the task's LR register holds on entry; returning
            // from the entry function lands on an EXC_RETURN pattern in
            // thread mode and faults, which is the intended trap.
            lr: EXC_RETURN_THREAD_PSP,
            pc: entry as usize as u32 | 1, // thumb
            xpsr: INITIAL_XPSR,
        },
    };

    let psp = band_top - FRAME_SIZE;
    // Safety: the band was carved out of the task stack area by the
    // registration layout; nothing else lives there yet.
    let dst = unsafe {
        core::slice::from_raw_parts_mut(psp as *mut u8, FRAME_SIZE as usize)
    };
    frame.write_to(dst).unwrap_lite();
    psp
}

/// Reads the live process stack pointer. Zero before the first dispatch.
pub fn read_process_sp() -> u32 {
    cortex_m::register::psp::read()
}

/// Captures the interrupt mask and masks interrupts. Returns nonzero if
/// interrupts were already masked.
pub fn read_and_disable_interrupts() -> u32 {
    let was_masked = cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
    was_masked as u32
}

/// Restores the interrupt mask captured by `read_and_disable_interrupts`.
pub fn restore_interrupts(saved_mask: u32) {
    if saved_mask == 0 {
        // Safety: symmetric with the disable in the atomic gate; we only
        // reopen what was open at entry.
        unsafe { cortex_m::interrupt::enable() };
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Pends the context-switch exception. The switch happens once the current
/// handler (if any) unwinds.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Requests a reschedule from unprivileged code by trapping into the
/// supervisor call.
pub fn svc_reschedule() {
    unsafe {
        asm!("svc #0xFF");
    }
}

/// Issues the architectural reset sequence and waits for it to take.
pub fn system_reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

/// Splits the configurable faults out of HardFault and arranges the
/// exception priorities: faults highest, kernel entry points (SVCall,
/// PendSV, SysTick) lowest, so the kernel is never preempted by itself.
pub fn enable_fault_handlers() {
    // Safety: we are only lowering priorities from their reset defaults and
    // enabling fault reporting; neither can cause surprise preemption.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // MEMFAULT, BUSFAULT, USGFAULT enable.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // Usage, Bus, MemManage at the highest configurable priority.
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall, SysTick, PendSV at the lowest.
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // Trap on divide by zero instead of quietly producing 0.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);
    }
}

/// Programs the tick timer and performs the first dispatch: process stack
/// loaded from the idle task, thread mode dropped to unprivileged, straight
/// branch into the idle entry point.
pub fn start_first_task(tick_divisor: u32, idle_psp: u32, entry: fn()) -> ! {
    // Safety: standard SysTick bring-up; safe in practice, unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(tick_divisor - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt.
        syst.csr.modify(|v| v | 0b111);
    }

    // Safety: writing PSP has no effect while we run on the Main stack,
    // which we do until the CONTROL write below.
    unsafe {
        cortex_m::register::psp::write(idle_psp);
    }

    // Safety: this is the point of no return into user code. CONTROL = 0b11
    // switches thread mode to the process stack and sheds privilege; the
    // ISB makes both take effect before the branch.
    unsafe {
        asm!(
            "msr CONTROL, {control}",
            "isb",
            "bx {entry}",
            control = in(reg) 0b11u32,
            entry = in(reg) entry as usize as u32 | 1,
            options(noreturn),
        )
    }
}

/// Millisecond tick. Hands straight off to the portable tick path, which
/// advances kernel time and pends a context switch when scheduling is
/// enabled.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    with_kernel(|k| k.tick(&GATE));
}

// The pending-switch exception. The assembly half stacks r4-r11 on the
// outgoing task's process stack and passes the resulting pointer to
// `pendsv_entry`, which returns the stack pointer to resume from; the
// assembly half then unstacks r4-r11 from it and exception-returns, letting
// the hardware pop the rest.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        mrs r0, psp
        stmdb r0!, {{r4-r11}}
        push {{lr}}
        bl pendsv_entry
        pop {{lr}}
        ldmia r0!, {{r4-r11}}
        msr psp, r0
        bx lr
"}

/// Rust half of PendSV.
///
/// Takes the outgoing stack pointer (after the r4-r11 push), returns the
/// stack pointer to restore from. When a privileged-mode request is
/// pending, this honors it instead of switching: thread mode gets its
/// privilege back and the same task resumes.
#[no_mangle]
unsafe extern "C" fn pendsv_entry(psp: u32) -> u32 {
    if crate::sched::take_privileged_mode_request() {
        let mut control = cortex_m::register::control::read();
        control.set_npriv(cortex_m::register::control::Npriv::Privileged);
        // Safety: raising thread-mode privilege is exactly the documented
        // purpose of this gate.
        unsafe {
            cortex_m::register::control::write(control);
        }
        cortex_m::asm::isb();
        return psp;
    }

    with_kernel(|k| {
        k.save_current_psp(psp);
        k.select_next_task(&GATE, psp);
        k.current_psp()
    })
}

// Supervisor call. The only service implemented is `SVC #0xFF`, the
// reschedule hop for unprivileged callers; the reset request rides the same
// trap because the reset sequence must execute privileged.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        tst lr, #4
        ite eq
        mrseq r0, msp
        mrsne r0, psp
        b svcall_entry
"}

/// Rust half of SVCall. `sp` is the stack the caller's frame was pushed to;
/// the stacked PC at offset 6 leads back to the SVC opcode and its
/// immediate.
#[no_mangle]
unsafe extern "C" fn svcall_entry(sp: *const u32) {
    if crate::sched::take_reset_request() {
        system_reset();
    }

    // Safety: the frame was pushed by exception entry on this very stack;
    // reading the stacked PC and the two opcode bytes below it is sound.
    let svc_num = unsafe {
        let pc = *sp.add(6);
        *((pc - 2) as *const u8)
    };

    if svc_num == 0xFF {
        pend_context_switch();
    }
}

fn fault_halt(what: &str) -> ! {
    crate::fail::die(what)
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn NMI() -> ! {
    fault_halt("NMI")
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn HardFault() -> ! {
    fault_halt("hard fault")
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn MemoryManagement() -> ! {
    fault_halt("memory management fault")
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn BusFault() -> ! {
    fault_halt("bus fault")
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn UsageFault() -> ! {
    fault_halt("usage fault")
}
