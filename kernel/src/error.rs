//! Error types shared across the core.
//!
//! Plain enums with hand-written `Display`, propagated with `?`. Misuse that
//! the kernel can detect (a stale free, a foreign lock release, a dead task
//! handle) comes back as an error instead of silently corrupting state.

use core::fmt;

use crate::memory::address::{Frame, VirtAddr};
use crate::memory::space::SpaceId;
use crate::sync::lock::Owner;
use crate::task::process::ProcessHandle;
use crate::task::tcb::TaskHandle;

/// Failures of the frame allocator and the slot heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
	/// No free physical frame was left.
	OutOfMemory,
	/// The slot table has no run of `pages` consecutive free slots.
	Fragmented { pages: usize },
	/// The pointer was not returned by `allocate`, or was already freed.
	InvalidFree(VirtAddr),
	/// The pointer belongs to a different address space than the active one.
	ForeignAddressSpace(VirtAddr),
	NoSuchAddressSpace(SpaceId),
	/// The requested slot table would not fit in one window.
	HeapTooLarge { slots: usize },
	/// The kernel address space cannot be destroyed.
	KernelSpace,
	/// A task or process still runs in the address space.
	AddressSpaceInUse(SpaceId),
	FrameOutOfRange(Frame),
	DoubleFree(Frame),
}

impl fmt::Display for MemoryError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::OutOfMemory => write!(f, "out of physical frames"),
			Self::Fragmented { pages } => write!(f, "no run of {pages} free slots"),
			Self::InvalidFree(addr) => write!(f, "{addr} is not a live allocation"),
			Self::ForeignAddressSpace(addr) => write!(f, "{addr} belongs to another address space"),
			Self::NoSuchAddressSpace(id) => write!(f, "address space {id} does not exist"),
			Self::HeapTooLarge { slots } => write!(f, "a heap of {slots} slots does not fit in one window"),
			Self::KernelSpace => write!(f, "the kernel address space cannot be destroyed"),
			Self::AddressSpaceInUse(id) => write!(f, "address space {id} is still in use"),
			Self::FrameOutOfRange(frame) => write!(f, "frame {frame} is outside managed memory"),
			Self::DoubleFree(frame) => write!(f, "frame {frame} is already free"),
		}
	}
}

/// Failures of task, process and wait operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
	TooManyTasks,
	StackAllocationFailed(MemoryError),
	/// The process is full, dying, or gone.
	CannotAttachToProcess,
	NoSuchTask(TaskHandle),
	/// No task occupies the table slot.
	EmptySlot(usize),
	/// The caller runs in the kernel context, which cannot block.
	NotInTask,
	/// A task cannot wait for its own exit.
	WaitOnSelf,
	NotZombie(TaskHandle),
	AlreadyExited(TaskHandle),
	TooManyProcesses,
	NoSuchProcess(ProcessHandle),
}

impl fmt::Display for TaskError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::TooManyTasks => write!(f, "task table is full"),
			Self::StackAllocationFailed(cause) => write!(f, "cannot allocate task stack: {cause}"),
			Self::CannotAttachToProcess => write!(f, "cannot attach task to process"),
			Self::NoSuchTask(task) => write!(f, "{task} does not exist"),
			Self::EmptySlot(slot) => write!(f, "task slot {slot} is empty"),
			Self::NotInTask => write!(f, "the kernel context cannot wait"),
			Self::WaitOnSelf => write!(f, "a task cannot wait for itself"),
			Self::NotZombie(task) => write!(f, "{task} has not exited"),
			Self::AlreadyExited(task) => write!(f, "{task} has already exited"),
			Self::TooManyProcesses => write!(f, "process table is full"),
			Self::NoSuchProcess(process) => write!(f, "{process} does not exist"),
		}
	}
}

/// Failures of `SafeLock` release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
	NotHeld,
	NotOwner { holder: Owner, caller: Owner },
}

impl fmt::Display for LockError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NotHeld => write!(f, "lock is not held"),
			Self::NotOwner { holder, caller } => {
				write!(f, "lock is held by {holder}, not by {caller}")
			}
		}
	}
}

/// Any error the kernel façade can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
	Memory(MemoryError),
	Task(TaskError),
	Lock(LockError),
}

impl fmt::Display for KernelError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Memory(e) => write!(f, "memory: {e}"),
			Self::Task(e) => write!(f, "task: {e}"),
			Self::Lock(e) => write!(f, "lock: {e}"),
		}
	}
}

impl From<MemoryError> for KernelError {
	fn from(e: MemoryError) -> Self {
		Self::Memory(e)
	}
}

impl From<TaskError> for KernelError {
	fn from(e: TaskError) -> Self {
		Self::Task(e)
	}
}

impl From<LockError> for KernelError {
	fn from(e: LockError) -> Self {
		Self::Lock(e)
	}
}
