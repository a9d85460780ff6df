// =============================================================================
// NanoCore — Trap Stubs and Task Trampoline
// =============================================================================
//
// A reschedule is an interrupt: either the timer, or the software vector
// `RESCHEDULE_VECTOR` raised by a yielding task. Both stubs build a
// `CpuSaveState` on the interrupted stack, hand it to the kernel, and
// `iretq` out of whatever the kernel left in it.
//
// STACK LAYOUT AT THE CALL (low addresses first, matching CpuSaveState):
//
//   rsp →  cr3
//          r15 r14 r13 r12 r11 r10 r9 r8
//          rbp rdi rsi rdx rcx rbx rax      ← pushed by the stub
//          rip cs rflags rsp ss             ← pushed by the CPU
//
// The CPU aligns RSP to 16 before pushing its 5-word frame; 16 more words
// leave RSP at 8 mod 16, so the stub pads by 8 before the call.
//
// Restoring writes the incoming task's snapshot over this frame. `iretq`
// then loads the incoming RSP, which moves execution onto its stack. The
// saved CR3 slot is informational: the kernel installs the address space
// itself.
//
// =============================================================================

use core::arch::global_asm;

use crate::arch::CpuSaveState;
use crate::task::tcb::Task;

use super::{KERNEL, exit, with_kernel};

/// Software interrupt vector a yielding task raises.
pub const RESCHEDULE_VECTOR: u8 = 0x81;

macro_rules! trap_stub {
    ($name:literal, $handler:literal) => {
        global_asm!(
            concat!(".global ", $name),
            concat!($name, ":"),
            "push rax",
            "push rbx",
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push rbp",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov rax, cr3",
            "push rax",
            "mov rdi, rsp",
            "sub rsp, 8",
            "cld",
            concat!("call ", $handler),
            "add rsp, 16",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rbp",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "iretq",
        );
    };
}

trap_stub!("nanocore_reschedule_stub", "nanocore_on_reschedule");
trap_stub!("nanocore_timer_stub", "nanocore_on_timer");

unsafe extern "C" {
    fn nanocore_reschedule_stub();
    fn nanocore_timer_stub();
}

/// Address to install in the IDT at `RESCHEDULE_VECTOR`.
pub fn reschedule_stub() -> u64 {
    nanocore_reschedule_stub as usize as u64
}

/// Address to install in the IDT at the timer vector.
pub fn timer_stub() -> u64 {
    nanocore_timer_stub as usize as u64
}

static TIMER_EOI: spin::Once<fn()> = spin::Once::new();

/// Register the end-of-interrupt acknowledgement for the timer.
pub fn set_timer_eoi(eoi: fn()) {
    TIMER_EOI.call_once(|| eoi);
}

#[unsafe(no_mangle)]
extern "C" fn nanocore_on_reschedule(live: &mut CpuSaveState) {
    super::cpu::RESCHEDULE_PENDING.store(false, core::sync::atomic::Ordering::Release);
    if let Some(kernel) = KERNEL.lock().as_mut() {
        kernel.reschedule(live);
    }
}

#[unsafe(no_mangle)]
extern "C" fn nanocore_on_timer(live: &mut CpuSaveState) {
    if let Some(eoi) = TIMER_EOI.get() {
        eoi();
    }
    if let Some(kernel) = KERNEL.lock().as_mut() {
        kernel.timer_tick(live);
    }
}

/// First code a new task runs. The slot arrives in RDI (see
/// `CpuSaveState::initial`).
pub(super) extern "C" fn task_trampoline(slot: usize) -> ! {
    let entry = with_kernel(|k| k.tasks().by_slot(slot).map(Task::entry)).flatten();
    match entry {
        Some((entry, argument)) => entry(argument),
        None => log::error!("task slot {} started empty", slot),
    }
    exit()
}
