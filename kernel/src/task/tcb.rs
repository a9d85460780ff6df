//! Task control block.
//!
//! A task is a kernel-mode thread of execution: a dedicated stack, a saved
//! register and FPU snapshot, a suspension state, and the ambient context
//! that follows it across switches.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;
use core::num::NonZeroU64;
use core::panic::Location;

use crate::arch::{CpuSaveState, FpuState};
use crate::config::TAG_MAX;
use crate::memory::address::VirtAddr;
use crate::memory::space::SpaceId;
use crate::task::ambient::AmbientContext;
use crate::task::process::ProcessHandle;

/// Entry point of a task. Receives the argument given at spawn.
pub type TaskEntry = fn(usize);

/// Identity of a task, unique for the lifetime of the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

impl TaskId {
	pub const fn new(raw: u64) -> Option<Self> {
		match NonZeroU64::new(raw) {
			Some(id) => Some(Self(id)),
			None => None,
		}
	}

	pub(crate) const fn from_nonzero(id: NonZeroU64) -> Self {
		Self(id)
	}

	pub const fn get(self) -> u64 {
		self.0.get()
	}
}

impl fmt::Debug for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "T{}", self.0)
	}
}

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "T{}", self.0)
	}
}

/// Reference to a task: its table slot plus its identity.
///
/// A handle outlives the task it names; once the slot is reused the
/// identity no longer matches and lookups fail instead of reaching the
/// new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
	slot: u16,
	id: TaskId,
}

impl TaskHandle {
	pub(crate) const fn new(slot: usize, id: TaskId) -> Self {
		Self { slot: slot as u16, id }
	}

	pub const fn slot(self) -> usize {
		self.slot as usize
	}

	pub const fn id(self) -> TaskId {
		self.id
	}
}

impl fmt::Display for TaskHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "task {} ({})", self.slot, self.id)
	}
}

/// Opaque key of a pipe or wait object owned by a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitObject(pub usize);

/// Why a task is, or is not, eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
	Runnable,
	/// Not scheduled until released explicitly. New tasks start here.
	FullySuspended,
	/// Runnable again once the tick count reaches `deadline`.
	UntilTimer { deadline: u64 },
	UntilTaskExit(TaskHandle),
	UntilProcessExit(ProcessHandle),
	UntilPipeReadable(WaitObject),
	UntilPipeWritable(WaitObject),
	UntilEvent(WaitObject),
	UntilCompositorTick,
	/// Exited, kept until a waiter reaps it.
	Zombie,
}

impl Suspension {
	/// True for the states a wake-up sweep or the timer can clear.
	pub fn is_waiting(self) -> bool {
		!matches!(self, Self::Runnable | Self::FullySuspended | Self::Zombie)
	}
}

impl fmt::Display for Suspension {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Runnable => write!(f, "runnable"),
			Self::FullySuspended => write!(f, "suspended"),
			Self::UntilTimer { deadline } => write!(f, "sleeping until tick {deadline}"),
			Self::UntilTaskExit(task) => write!(f, "waiting for {task}"),
			Self::UntilProcessExit(process) => write!(f, "waiting for {process}"),
			Self::UntilPipeReadable(pipe) => write!(f, "waiting to read pipe {:#x}", pipe.0),
			Self::UntilPipeWritable(pipe) => write!(f, "waiting to write pipe {:#x}", pipe.0),
			Self::UntilEvent(object) => write!(f, "waiting for object {:#x}", object.0),
			Self::UntilCompositorTick => write!(f, "waiting for compositor"),
			Self::Zombie => write!(f, "zombie"),
		}
	}
}

/// A task's dedicated stack: a run of slots in one address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
	pub space: SpaceId,
	pub base: VirtAddr,
	pub size: usize,
}

impl StackRegion {
	pub fn top(&self) -> VirtAddr {
		self.base + self.size as u64
	}
}

pub struct Task {
	handle: TaskHandle,
	pub(crate) entry: TaskEntry,
	pub(crate) argument: usize,
	pub(crate) state: CpuSaveState,
	pub(crate) fpu: Box<FpuState>,
	pub(crate) stack: Option<StackRegion>,
	pub(crate) suspension: Suspension,
	/// Some other task is waiting for this one and will reap it.
	pub(crate) attached: bool,
	pub(crate) marked_for_deletion: bool,
	pub(crate) process: Option<ProcessHandle>,
	/// Snapshot of the ambient context; live in the kernel while running.
	pub(crate) ambient: AmbientContext,
	created_at: &'static Location<'static>,
	created_tick: u64,
	tag: String,
	pub(crate) cpu_time: u64,
}

impl Task {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		handle: TaskHandle,
		entry: TaskEntry,
		argument: usize,
		state: CpuSaveState,
		stack: StackRegion,
		process: Option<ProcessHandle>,
		ambient: AmbientContext,
		created_at: &'static Location<'static>,
		created_tick: u64,
	) -> Self {
		Self {
			handle,
			entry,
			argument,
			state,
			fpu: Box::new(FpuState::initial()),
			stack: Some(stack),
			suspension: Suspension::FullySuspended,
			attached: false,
			marked_for_deletion: false,
			process,
			ambient,
			created_at,
			created_tick,
			tag: String::new(),
			cpu_time: 0,
		}
	}

	pub fn handle(&self) -> TaskHandle {
		self.handle
	}

	pub fn id(&self) -> TaskId {
		self.handle.id
	}

	pub fn entry(&self) -> (TaskEntry, usize) {
		(self.entry, self.argument)
	}

	pub fn suspension(&self) -> Suspension {
		self.suspension
	}

	pub fn state(&self) -> &CpuSaveState {
		&self.state
	}

	pub fn stack(&self) -> Option<StackRegion> {
		self.stack
	}

	pub fn process(&self) -> Option<ProcessHandle> {
		self.process
	}

	pub fn is_attached(&self) -> bool {
		self.attached
	}

	pub fn is_marked_for_deletion(&self) -> bool {
		self.marked_for_deletion
	}

	pub fn is_zombie(&self) -> bool {
		self.suspension == Suspension::Zombie
	}

	/// Runnable and not on its way out.
	pub fn is_eligible(&self) -> bool {
		self.suspension == Suspension::Runnable && !self.marked_for_deletion
	}

	pub fn created_at(&self) -> &'static Location<'static> {
		self.created_at
	}

	pub fn created_tick(&self) -> u64 {
		self.created_tick
	}

	/// Cycles spent running, up to the last switch away from this task.
	pub fn cpu_time(&self) -> u64 {
		self.cpu_time
	}

	/// Saved ambient context. While the task runs the live copy is held by
	/// the kernel instead; `Kernel::ambient_of` picks the right one.
	pub fn ambient(&self) -> &AmbientContext {
		&self.ambient
	}

	/// The tag in brackets, or `<kernel task>` if none was assigned.
	pub fn tag(&self) -> &str {
		if self.tag.is_empty() { "<kernel task>" } else { &self.tag }
	}

	pub(crate) fn set_tag(&mut self, text: &str) {
		let mut tag = String::with_capacity(TAG_MAX + 2);
		tag.push('[');
		tag.extend(text.chars().take(TAG_MAX));
		tag.push(']');
		self.tag = tag;
	}
}

impl fmt::Debug for Task {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Task")
			.field("handle", &self.handle)
			.field("suspension", &self.suspension)
			.field("attached", &self.attached)
			.field("marked_for_deletion", &self.marked_for_deletion)
			.field("process", &self.process)
			.field("tag", &self.tag)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_is_not_an_identity() {
		assert!(TaskId::new(0).is_none());
		assert_eq!(TaskId::new(9).map(TaskId::get), Some(9));
	}

	#[test]
	fn only_waits_count_as_waiting() {
		assert!(Suspension::UntilTimer { deadline: 5 }.is_waiting());
		assert!(Suspension::UntilCompositorTick.is_waiting());
		assert!(!Suspension::Runnable.is_waiting());
		assert!(!Suspension::FullySuspended.is_waiting());
		assert!(!Suspension::Zombie.is_waiting());
	}
}
