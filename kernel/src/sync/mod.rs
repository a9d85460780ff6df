// =============================================================================
// NanoCore — Synchronization
// =============================================================================
//
// Two primitives, for two different callers:
//
//   irq.rs   interrupt masking. `SavedIrq` brackets the kernel's critical
//            sections; `IrqSpinLock` guards the one global kernel instance
//            on bare metal, so a trap can never deadlock against the code
//            it interrupted.
//   lock.rs  SafeLock, the only lock tasks take against each other. It
//            never blocks inside the kernel: callers retry and yield.
//
// Lock ordering: a SafeLock may be held while the kernel is entered; the
// kernel's own lock is never held across a yield.
// =============================================================================

pub mod irq;
pub mod lock;
