//! Processes: groups of tasks sharing one user address space.
//!
//! A process owns its address space and holds up to
//! `MAX_THREADS_PER_PROCESS` tasks. When the last one leaves, the process is
//! marked dying; the scheduler disposes of it (destroying the address space
//! and releasing anyone waiting on it) at the next reschedule.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{MAX_THREADS_PER_PROCESS, PROCESS_NAME_MAX};
use crate::error::TaskError;
use crate::memory::space::SpaceId;
use crate::task::tcb::TaskHandle;

// ── Process identifiers ─────────────────────────────────────────

/// Reference to a process: its table slot plus its unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    slot: u16,
    id: u64,
}

impl ProcessHandle {
    pub const fn slot(self) -> usize {
        self.slot as usize
    }

    pub const fn id(self) -> u64 {
        self.id
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process {} (P{})", self.slot, self.id)
    }
}

// ── Process Control Block ───────────────────────────────────────

#[derive(Debug)]
pub struct Process {
    handle: ProcessHandle,
    name: String,
    space: SpaceId,
    threads: Vec<TaskHandle>,
    dying: bool,
}

impl Process {
    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn threads(&self) -> &[TaskHandle] {
        &self.threads
    }

    /// The last thread has left; disposal is pending.
    pub fn is_dying(&self) -> bool {
        self.dying
    }
}

// ── Process table ───────────────────────────────────────────────

pub struct ProcessTable {
    slots: Vec<Option<Process>>,
    next_id: u64,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, next_id: 1 }
    }

    pub(crate) fn create(&mut self, name: &str, space: SpaceId) -> Result<ProcessHandle, TaskError> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(TaskError::TooManyProcesses)?;
        let handle = ProcessHandle { slot: slot as u16, id: self.next_id };
        self.next_id += 1;
        self.slots[slot] = Some(Process {
            handle,
            name: name.chars().take(PROCESS_NAME_MAX).collect(),
            space,
            threads: Vec::with_capacity(MAX_THREADS_PER_PROCESS),
            dying: false,
        });
        Ok(handle)
    }

    pub fn get(&self, handle: ProcessHandle) -> Option<&Process> {
        self.slots
            .get(handle.slot())
            .and_then(Option::as_ref)
            .filter(|p| p.handle == handle)
    }

    fn get_mut(&mut self, handle: ProcessHandle) -> Option<&mut Process> {
        self.slots
            .get_mut(handle.slot())
            .and_then(Option::as_mut)
            .filter(|p| p.handle == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> + '_ {
        self.slots.iter().flatten()
    }

    /// Add `task` to the process. Fails if the process is full, dying or gone.
    pub(crate) fn attach(&mut self, handle: ProcessHandle, task: TaskHandle) -> Result<(), TaskError> {
        match self.get_mut(handle) {
            Some(p) if !p.dying && p.threads.len() < MAX_THREADS_PER_PROCESS => {
                p.threads.push(task);
                Ok(())
            }
            _ => Err(TaskError::CannotAttachToProcess),
        }
    }

    /// Remove `task` from the process.
    ///
    /// Returns `true` if this emptied the process, which is then dying.
    pub(crate) fn detach(&mut self, handle: ProcessHandle, task: TaskHandle) -> bool {
        let Some(p) = self.get_mut(handle) else {
            return false;
        };
        p.threads.retain(|t| *t != task);
        if p.threads.is_empty() && !p.dying {
            p.dying = true;
            return true;
        }
        false
    }

    pub(crate) fn dying(&self) -> Vec<ProcessHandle> {
        self.iter().filter(|p| p.dying).map(Process::handle).collect()
    }

    pub(crate) fn remove(&mut self, handle: ProcessHandle) -> Option<Process> {
        self.get(handle)?;
        self.slots[handle.slot()].take()
    }

    /// Process owning the address space `space`, if any.
    pub fn owner_of(&self, space: SpaceId) -> Option<ProcessHandle> {
        self.iter().find(|p| p.space == space).map(Process::handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tcb::TaskId;

    fn task(slot: usize, id: u64) -> TaskHandle {
        TaskHandle::new(slot, TaskId::new(id).unwrap())
    }

    #[test]
    fn a_process_holds_at_most_four_threads() {
        let mut table = ProcessTable::new(4);
        let p = table.create("shell", SpaceId::KERNEL).unwrap();
        for i in 0..MAX_THREADS_PER_PROCESS {
            table.attach(p, task(i, i as u64 + 1)).unwrap();
        }
        assert_eq!(table.attach(p, task(9, 99)), Err(TaskError::CannotAttachToProcess));
        assert_eq!(table.get(p).unwrap().threads().len(), MAX_THREADS_PER_PROCESS);
    }

    #[test]
    fn last_detach_marks_the_process_dying() {
        let mut table = ProcessTable::new(4);
        let p = table.create("init", SpaceId::KERNEL).unwrap();
        let (a, b) = (task(0, 1), task(1, 2));
        table.attach(p, a).unwrap();
        table.attach(p, b).unwrap();
        assert!(!table.detach(p, a));
        assert!(table.detach(p, b));
        assert!(!table.detach(p, b));
        assert_eq!(table.dying(), [p]);
        assert_eq!(table.attach(p, a), Err(TaskError::CannotAttachToProcess));
        assert!(table.remove(p).is_some());
        assert!(table.get(p).is_none());
    }

    #[test]
    fn full_table_and_stale_handles() {
        let mut table = ProcessTable::new(1);
        let p = table.create("a", SpaceId::KERNEL).unwrap();
        assert_eq!(table.create("b", SpaceId::KERNEL), Err(TaskError::TooManyProcesses));
        table.remove(p);
        let q = table.create("c", SpaceId::KERNEL).unwrap();
        assert_eq!(p.slot(), q.slot());
        assert!(table.get(p).is_none());
        assert_eq!(table.get(q).unwrap().name(), "c");
    }
}
