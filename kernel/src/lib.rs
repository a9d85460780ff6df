// =============================================================================
// NanoCore — Kernel Core
// =============================================================================
//
// The memory and concurrency core of a small single-CPU x86_64 kernel:
//
//   memory/   bitmap frame allocator and page-granular slot heaps, one per
//             address space (a kernel window plus any number of user ones)
//   task/     fixed task table, round-robin scheduler, wait states,
//             processes, zombie reaping
//   sync/     SafeLock (owner-tracked busy-retry lock) and interrupt masking
//   arch/     the Platform trait; a hosted simulation for tests and the
//             bare-metal x86_64 backend
//   diag.rs   task and allocation dump for leak / hang triage
//
// Crate-level attributes:
//
// `no_std` outside tests: the core runs on bare metal with only `core` and
// `alloc`. Under `cargo test` it links `std` so the harness and host threads
// are available; the embedding kernel binary supplies the global allocator.
//
// =============================================================================

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod diag;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod sync;
pub mod task;

pub use config::KernelConfig;
pub use error::{KernelError, LockError, MemoryError, TaskError};
pub use kernel::{Kernel, NoReclaimer, ResourceReclaimer};
pub use sync::lock::{Owner, SafeLock};
pub use task::wait::{WaitHandle, spin_until};
