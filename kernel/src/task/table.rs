//! Fixed-capacity task table.
//!
//! Slots are reused, identities are not: every lookup by handle checks the
//! stored identity so a stale handle cannot reach a newer task.

use alloc::vec::Vec;

use crate::task::tcb::{Suspension, Task, TaskHandle, TaskId};

pub struct TaskTable {
	slots: Vec<Option<Task>>,
}

impl TaskTable {
	pub fn new(capacity: usize) -> Self {
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, || None);
		Self { slots }
	}

	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Lowest empty slot. Zombies keep their slot until reaped.
	pub fn free_slot(&self) -> Option<usize> {
		self.slots.iter().position(Option::is_none)
	}

	pub(crate) fn insert(&mut self, task: Task) {
		let slot = task.handle().slot();
		debug_assert!(self.slots[slot].is_none(), "slot {slot} is occupied");
		self.slots[slot] = Some(task);
	}

	pub(crate) fn remove(&mut self, slot: usize) -> Option<Task> {
		self.slots.get_mut(slot).and_then(Option::take)
	}

	pub fn get(&self, handle: TaskHandle) -> Option<&Task> {
		self.by_slot(handle.slot()).filter(|t| t.id() == handle.id())
	}

	pub(crate) fn get_mut(&mut self, handle: TaskHandle) -> Option<&mut Task> {
		self.by_slot_mut(handle.slot()).filter(|t| t.id() == handle.id())
	}

	pub fn by_slot(&self, slot: usize) -> Option<&Task> {
		self.slots.get(slot).and_then(Option::as_ref)
	}

	pub(crate) fn by_slot_mut(&mut self, slot: usize) -> Option<&mut Task> {
		self.slots.get_mut(slot).and_then(Option::as_mut)
	}

	pub fn find(&self, id: TaskId) -> Option<TaskHandle> {
		self.iter().find(|t| t.id() == id).map(Task::handle)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
		self.slots.iter().flatten()
	}

	pub fn live_count(&self) -> usize {
		self.iter().count()
	}

	/// Make every task whose suspension matches `waiting` runnable.
	///
	/// Returns how many were woken.
	pub(crate) fn wake_where(&mut self, mut waiting: impl FnMut(&Suspension) -> bool) -> usize {
		let mut woken = 0;
		for task in self.slots.iter_mut().flatten() {
			if waiting(&task.suspension) {
				task.suspension = Suspension::Runnable;
				woken += 1;
			}
		}
		woken
	}

	/// Slots marked for deletion, except those in `keep`.
	pub(crate) fn marked_for_deletion(&self, keep: [Option<usize>; 2]) -> Vec<usize> {
		self.slots
			.iter()
			.enumerate()
			.filter(|(slot, t)| {
				t.as_ref().is_some_and(Task::is_marked_for_deletion) && !keep.contains(&Some(*slot))
			})
			.map(|(slot, _)| slot)
			.collect()
	}

	/// Pick the next task to run.
	///
	/// Expired timer sleeps become runnable first. The scan starts just
	/// after `after` and wraps around once, so `after` itself is the last
	/// candidate; with no `after` it starts at slot 0.
	pub(crate) fn select_next(&mut self, after: Option<usize>, now: u64) -> Option<usize> {
		self.wake_where(|s| matches!(*s, Suspension::UntilTimer { deadline } if now >= deadline));

		let n = self.slots.len();
		if n == 0 {
			return None;
		}
		let start = after.map_or(0, |i| (i + 1) % n);
		(0..n)
			.map(|k| (start + k) % n)
			.find(|&slot| self.slots[slot].as_ref().is_some_and(Task::is_eligible))
	}
}
