// =============================================================================
// NanoCore — Interrupt Masking
// =============================================================================
//
// Two tools for keeping an interrupt handler out of a critical section:
//
//   SavedIrq     — mask interrupts through a `Platform`, remember whether
//                  they were enabled, restore exactly that state afterwards.
//                  Used by the kernel façade around every table mutation.
//
//   IrqSpinLock  — a ticket spinlock that masks interrupts while held.
//                  Holds the single kernel instance on bare metal, where the
//                  timer trap and task code both need to reach it.
//
// IRQ SAFETY:
//   Interrupts must be masked BEFORE the lock is taken. Otherwise:
//     1. Task code holds the lock with interrupts enabled
//     2. The timer fires on the same core
//     3. The handler tries to take the lock
//     4. DEADLOCK — the task can't release until the handler returns
//
//   Nested sections work because each one restores the state it found.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::Platform;

/// Interrupt state captured when a critical section was entered.
#[must_use = "interrupts stay masked until the state is restored"]
pub struct SavedIrq {
    was_enabled: bool,
}

impl SavedIrq {
    /// Mask interrupts, remembering whether they were enabled.
    pub fn mask<P: Platform + ?Sized>(platform: &mut P) -> Self {
        let was_enabled = platform.interrupts_enabled();
        platform.disable_interrupts();
        Self { was_enabled }
    }

    /// Re-enable interrupts if they were enabled before `mask`.
    pub fn restore<P: Platform + ?Sized>(self, platform: &mut P) {
        if self.was_enabled {
            platform.enable_interrupts();
        }
    }
}

/// Global interrupt control, for locks that live in statics and cannot
/// carry a platform reference.
pub trait IrqControl {
    /// Disable interrupts and return whether they were enabled.
    fn save_and_disable() -> bool;
    fn restore(was_enabled: bool);
}

/// A ticket spinlock that disables interrupts while held.
pub struct IrqSpinLock<M: IrqControl, T> {
    /// The next ticket to be dispensed.
    next_ticket: AtomicU32,
    /// The ticket number currently being served.
    now_serving: AtomicU32,
    data: UnsafeCell<T>,
    _mask: PhantomData<fn() -> M>,
}

// SAFETY: the ticket protocol gives one holder at a time exclusive access to T.
unsafe impl<M: IrqControl, T: Send> Send for IrqSpinLock<M, T> {}
unsafe impl<M: IrqControl, T: Send> Sync for IrqSpinLock<M, T> {}

impl<M: IrqControl, T> IrqSpinLock<M, T> {
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
            _mask: PhantomData,
        }
    }

    /// Acquires the lock, disabling interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, M, T> {
        let irq_was_enabled = M::save_and_disable();
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            core::hint::spin_loop();
        }
        IrqSpinLockGuard { lock: self, irq_was_enabled }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// A trap handler that finds the lock held uses this to back off
    /// instead of deadlocking against the code it interrupted.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, M, T>> {
        let irq_was_enabled = M::save_and_disable();
        let current = self.now_serving.load(Ordering::Relaxed);
        match self.next_ticket.compare_exchange(current, current.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Some(IrqSpinLockGuard { lock: self, irq_was_enabled }),
            Err(_) => {
                M::restore(irq_was_enabled);
                None
            }
        }
    }
}

/// RAII guard for a held [`IrqSpinLock`]. Dropping it releases the lock and
/// restores the previous interrupt state.
pub struct IrqSpinLockGuard<'a, M: IrqControl, T> {
    lock: &'a IrqSpinLock<M, T>,
    irq_was_enabled: bool,
}

impl<M: IrqControl, T> Deref for IrqSpinLockGuard<'_, M, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<M: IrqControl, T> DerefMut for IrqSpinLockGuard<'_, M, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<M: IrqControl, T> Drop for IrqSpinLockGuard<'_, M, T> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        M::restore(self.irq_was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::HostedPlatform;
    use std::cell::Cell;
    use std::sync::Arc;

    thread_local! {
        static ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    struct ThreadMask;

    impl IrqControl for ThreadMask {
        fn save_and_disable() -> bool {
            ENABLED.with(|e| e.replace(false))
        }

        fn restore(was_enabled: bool) {
            ENABLED.with(|e| e.set(was_enabled));
        }
    }

    fn enabled() -> bool {
        ENABLED.with(Cell::get)
    }

    #[test]
    fn saved_state_nests() {
        let mut hw = HostedPlatform::new();
        let outer = SavedIrq::mask(&mut hw);
        let inner = SavedIrq::mask(&mut hw);
        inner.restore(&mut hw);
        assert!(!hw.interrupts_enabled());
        outer.restore(&mut hw);
        assert!(hw.interrupts_enabled());
    }

    #[test]
    fn guard_masks_interrupts_while_held() {
        let lock: IrqSpinLock<ThreadMask, u32> = IrqSpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(!enabled());
            assert!(lock.try_lock().is_none());
            assert!(!enabled());
        }
        assert!(enabled());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn threads_never_lose_an_update() {
        let lock: Arc<IrqSpinLock<ThreadMask, u64>> = Arc::new(IrqSpinLock::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}
