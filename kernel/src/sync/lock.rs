// =============================================================================
// NanoCore — SafeLock
// =============================================================================
//
// A mutual-exclusion lock that knows who holds it. Unlike the ticket lock in
// irq.rs it does not spin with interrupts masked: a waiter gives up its
// time slice and retries, so the holder can be preempted and still make
// progress.
//
// HOW IT WORKS:
//   - `held` flips false → true with a compare-exchange; the winner then
//     records its identity and the source location it acquired from.
//   - A failed attempt bumps a retry counter. Every LOCK_STALL_THRESHOLD
//     failures a stall report is logged naming the holder and its site,
//     and `stall_reports` is incremented so tests can observe it.
//   - Only the recorded owner may release. Anyone else gets `NotOwner`
//     and the lock stays held.
//
// The owner of a lock taken from the kernel context (no task running) is
// `Owner::Kernel`.
//
// =============================================================================

use core::fmt;
use core::panic::Location;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::config::LOCK_STALL_THRESHOLD;
use crate::error::LockError;
use crate::task::tcb::TaskId;

/// Identity of a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Kernel,
    Task(TaskId),
}

const NO_OWNER: u64 = 0;
const KERNEL_OWNER: u64 = u64::MAX;

impl Owner {
    fn encode(self) -> u64 {
        match self {
            Owner::Kernel => KERNEL_OWNER,
            Owner::Task(id) => id.get(),
        }
    }

    fn decode(raw: u64) -> Option<Self> {
        match raw {
            NO_OWNER => None,
            KERNEL_OWNER => Some(Owner::Kernel),
            id => TaskId::new(id).map(Owner::Task),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Kernel => write!(f, "kernel"),
            Owner::Task(id) => write!(f, "{id}"),
        }
    }
}

pub struct SafeLock {
    held: AtomicBool,
    owner: AtomicU64,
    site: AtomicPtr<Location<'static>>,
    /// Failed attempts since the last successful acquisition.
    retries: AtomicU32,
    stalls: AtomicU32,
    stall_threshold: u32,
}

impl SafeLock {
    pub const fn new() -> Self {
        Self::with_stall_threshold(LOCK_STALL_THRESHOLD)
    }

    /// A lock that reports a stall every `threshold` failed attempts.
    pub const fn with_stall_threshold(threshold: u32) -> Self {
        Self {
            held: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            site: AtomicPtr::new(ptr::null_mut()),
            retries: AtomicU32::new(0),
            stalls: AtomicU32::new(0),
            stall_threshold: if threshold == 0 { 1 } else { threshold },
        }
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self, owner: Owner, site: &'static Location<'static>) -> bool {
        if self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(owner.encode(), Ordering::Relaxed);
            self.site.store(ptr::from_ref(site).cast_mut(), Ordering::Relaxed);
            self.retries.store(0, Ordering::Relaxed);
            return true;
        }

        let failed = self.retries.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if failed % self.stall_threshold == 0 {
            self.stalls.fetch_add(1, Ordering::Relaxed);
            match (self.holder(), self.acquired_at()) {
                (Some(holder), Some(at)) => log::warn!(
                    "lock stalled: {} waiting {} tries, held by {} since {}:{}",
                    owner,
                    failed,
                    holder,
                    at.file(),
                    at.line()
                ),
                _ => log::warn!("lock stalled: {} waiting {} tries", owner, failed),
            }
        }
        false
    }

    /// Take the lock, calling `relax` between attempts.
    ///
    /// In the kernel `relax` yields the time slice; on the host it can be
    /// `std::thread::yield_now`.
    #[track_caller]
    pub fn acquire_with(&self, owner: Owner, mut relax: impl FnMut()) {
        let site = Location::caller();
        while !self.try_acquire(owner, site) {
            relax();
        }
    }

    /// Release the lock on behalf of `caller`.
    pub fn release(&self, caller: Owner) -> Result<(), LockError> {
        if !self.held.load(Ordering::Acquire) {
            log::warn!("{} released a lock nobody holds", caller);
            return Err(LockError::NotHeld);
        }
        match self.holder() {
            Some(holder) if holder == caller => {
                self.owner.store(NO_OWNER, Ordering::Relaxed);
                self.site.store(ptr::null_mut(), Ordering::Relaxed);
                self.held.store(false, Ordering::Release);
                Ok(())
            }
            holder => {
                let holder = holder.unwrap_or(Owner::Kernel);
                log::warn!("{} tried to release a lock held by {}", caller, holder);
                Err(LockError::NotOwner { holder, caller })
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub fn holder(&self) -> Option<Owner> {
        Owner::decode(self.owner.load(Ordering::Relaxed))
    }

    /// Where the current holder acquired the lock.
    pub fn acquired_at(&self) -> Option<&'static Location<'static>> {
        let site = self.site.load(Ordering::Relaxed);
        // SAFETY: the pointer is either null or came from a `&'static Location`.
        unsafe { site.as_ref() }
    }

    /// Number of stall reports logged so far.
    pub fn stall_reports(&self) -> u32 {
        self.stalls.load(Ordering::Relaxed)
    }
}

impl Default for SafeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SafeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeLock")
            .field("holder", &self.holder())
            .field("acquired_at", &self.acquired_at())
            .field("stalls", &self.stall_reports())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn task(id: u64) -> Owner {
        Owner::Task(TaskId::new(id).unwrap())
    }

    #[test]
    fn holder_and_site_are_recorded() {
        let lock = SafeLock::new();
        let here = Location::caller();
        assert!(lock.try_acquire(task(7), here));
        assert_eq!(lock.holder(), Some(task(7)));
        assert_eq!(lock.acquired_at(), Some(here));
        assert!(!lock.try_acquire(task(8), here));
        lock.release(task(7)).unwrap();
        assert!(!lock.is_held());
        assert_eq!(lock.holder(), None);
        assert_eq!(lock.acquired_at(), None);
    }

    #[test]
    fn only_the_owner_can_release() {
        let lock = SafeLock::new();
        lock.acquire_with(Owner::Kernel, || unreachable!());
        assert_eq!(
            lock.release(task(3)),
            Err(LockError::NotOwner { holder: Owner::Kernel, caller: task(3) })
        );
        assert!(lock.is_held());
        lock.release(Owner::Kernel).unwrap();
        assert_eq!(lock.release(Owner::Kernel), Err(LockError::NotHeld));
    }

    #[test]
    fn stalls_are_reported_every_threshold_failures() {
        let lock = SafeLock::with_stall_threshold(4);
        let here = Location::caller();
        assert!(lock.try_acquire(task(1), here));
        for _ in 0..9 {
            assert!(!lock.try_acquire(task(2), here));
        }
        assert_eq!(lock.stall_reports(), 2);
        lock.release(task(1)).unwrap();
        assert!(lock.try_acquire(task(2), here));
    }

    #[test]
    fn threads_are_mutually_excluded() {
        const ROUNDS: usize = 5_000;
        let lock = Arc::new(SafeLock::with_stall_threshold(1 << 30));
        let inside = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (1..=4u64)
            .map(|id| {
                let (lock, inside, counter) = (Arc::clone(&lock), Arc::clone(&inside), Arc::clone(&counter));
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        lock.acquire_with(task(id), std::thread::yield_now);
                        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                        // Deliberately non-atomic read-modify-write.
                        let seen = counter.load(Ordering::Relaxed);
                        counter.store(seen + 1, Ordering::Relaxed);
                        inside.store(false, Ordering::SeqCst);
                        lock.release(task(id)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4 * ROUNDS);
    }
}
