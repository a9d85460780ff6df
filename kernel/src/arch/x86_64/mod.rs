// =============================================================================
// NanoCore — x86_64 Backend
// =============================================================================
//
// Everything bare-metal lives here; the rest of the core is plain safe Rust
// written against `Platform`.
//
//   cpu.rs     — the `Platform` implementation and `X86Irq`
//   switch.rs  — trap stubs, the reschedule vector, the task trampoline
//   serial.rs  — COM1 log sink
//   boot.rs    — Limine requests and `boot`
//
// THE GLOBAL KERNEL:
//   One `Kernel<X86_64>` lives in `KERNEL`, behind an interrupt-masking spin
//   lock. Task code reaches it through `with_kernel`; the trap handlers
//   lock it directly (interrupts are already off inside a trap).
//
// BLOCKING:
//   A task never waits while holding the lock. Each blocking call below
//   registers its wait, releases the lock, raises the reschedule trap, and
//   polls again when it is resumed (`spin_until`). A reschedule requested
//   while the lock was held is raised the moment it is released.
//
// =============================================================================

pub mod boot;
pub mod cpu;
pub mod serial;
pub mod switch;

use core::panic::Location;
use core::sync::atomic::Ordering;
use core::task::Poll;

use crate::error::{LockError, TaskError};
use crate::kernel::Kernel;
use crate::sync::irq::IrqSpinLock;
use crate::sync::lock::{Owner, SafeLock};
use crate::task::process::ProcessHandle;
use crate::task::tcb::{TaskHandle, WaitObject};
use crate::task::wait::{WaitHandle, spin_until};

pub use cpu::{X86_64, X86Irq};
pub use switch::{RESCHEDULE_VECTOR, reschedule_stub, set_timer_eoi, timer_stub};

/// The kernel instance, `None` until `boot::boot` has run.
pub static KERNEL: IrqSpinLock<X86Irq, Option<Kernel<X86_64>>> = IrqSpinLock::new(None);

/// Run `f` on the global kernel; `None` before boot.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<X86_64>) -> R) -> Option<R> {
    let result = KERNEL.lock().as_mut().map(f);
    if cpu::RESCHEDULE_PENDING.load(Ordering::Acquire) {
        yield_now();
    }
    result
}

/// Raise the reschedule trap now.
pub fn yield_now() {
    cpu::RESCHEDULE_PENDING.store(false, Ordering::Release);
    // SAFETY: the vector's IDT gate points at `reschedule_stub`.
    unsafe { core::arch::asm!("int {v}", v = const RESCHEDULE_VECTOR) };
}

/// Take `lock`, yielding between attempts.
#[track_caller]
pub fn acquire(lock: &SafeLock) {
    let site = Location::caller();
    spin_until(
        || {
            let taken = with_kernel(|k| k.try_acquire_at(lock, site))
                .unwrap_or_else(|| lock.try_acquire(Owner::Kernel, site));
            if taken { Poll::Ready(()) } else { Poll::Pending }
        },
        yield_now,
    );
}

pub fn release(lock: &SafeLock) -> Result<(), LockError> {
    with_kernel(|k| k.release_lock(lock)).unwrap_or_else(|| lock.release(Owner::Kernel))
}

fn block_on(begin: impl FnOnce(&mut Kernel<X86_64>) -> Result<WaitHandle, TaskError>) -> Result<(), TaskError> {
    let wait = with_kernel(begin).ok_or(TaskError::NotInTask)??;
    spin_until(
        || with_kernel(|k| k.poll_wait(&wait)).unwrap_or(Poll::Ready(())),
        yield_now,
    );
    Ok(())
}

pub fn sleep_ms(ms: u64) -> Result<(), TaskError> {
    block_on(|k| k.wait_ms(ms))
}

/// Wait for `task` to exit, then reap it.
pub fn join(task: TaskHandle) -> Result<(), TaskError> {
    block_on(|k| k.wait_for_task_exit(task))?;
    match with_kernel(|k| k.reap(task)) {
        Some(Err(TaskError::NotZombie(_))) => Err(TaskError::NotZombie(task)),
        _ => Ok(()),
    }
}

pub fn wait_for_process(process: ProcessHandle) -> Result<(), TaskError> {
    block_on(|k| k.wait_for_process_exit(process))
}

pub fn wait_pipe_readable(pipe: WaitObject) -> Result<(), TaskError> {
    block_on(|k| k.wait_for_pipe_readable(pipe))
}

pub fn wait_pipe_writable(pipe: WaitObject) -> Result<(), TaskError> {
    block_on(|k| k.wait_for_pipe_writable(pipe))
}

pub fn wait_event(object: WaitObject) -> Result<(), TaskError> {
    block_on(|k| k.wait_for_event(object))
}

pub fn wait_compositor_tick() -> Result<(), TaskError> {
    block_on(|k| k.wait_for_compositor_tick())
}

/// End the calling task. From the kernel context this halts.
pub fn exit() -> ! {
    with_kernel(|k| k.exit_current());
    loop {
        yield_now();
    }
}
