//! Task and process lifecycle: spawn, release, suspend, kill, exit, reap.
//!
//! A task that ends is only marked for deletion; the scheduler retires it on
//! a later reschedule, once nothing is running on its stack. Retiring frees
//! the stack and either removes the slot or, when some live task still waits
//! on it, turns it into a zombie that the waiter reaps.

use alloc::vec::Vec;
use core::num::NonZeroU64;
use core::panic::Location;

use crate::arch::{CpuSaveState, Platform};
use crate::error::{KernelError, TaskError};
use crate::kernel::Kernel;
use crate::memory::space::{AddressSpace, SpaceId};
use crate::task::process::ProcessHandle;
use crate::task::tcb::{StackRegion, Suspension, Task, TaskEntry, TaskHandle, TaskId};

impl<P: Platform> Kernel<P> {
    /// Create a task running `entry(argument)`.
    ///
    /// The task starts fully suspended; `release` makes it runnable. Its
    /// stack comes from the active address space and it inherits a copy of
    /// the running context's ambient state.
    #[track_caller]
    pub fn spawn(&mut self, entry: TaskEntry, argument: usize) -> Result<TaskHandle, TaskError> {
        self.spawn_at(None, entry, argument, Location::caller())
    }

    /// Like [`spawn`](Self::spawn), as a thread of `process`.
    #[track_caller]
    pub fn spawn_in(
        &mut self,
        process: ProcessHandle,
        entry: TaskEntry,
        argument: usize,
    ) -> Result<TaskHandle, TaskError> {
        self.spawn_at(Some(process), entry, argument, Location::caller())
    }

    pub fn spawn_at(
        &mut self,
        process: Option<ProcessHandle>,
        entry: TaskEntry,
        argument: usize,
        site: &'static Location<'static>,
    ) -> Result<TaskHandle, TaskError> {
        let handle = self.masked(|k| k.spawn_masked(process, entry, argument, site))?;
        log::debug!("spawned {} from {}:{}", handle, site.file(), site.line());
        Ok(handle)
    }

    fn spawn_masked(
        &mut self,
        process: Option<ProcessHandle>,
        entry: TaskEntry,
        argument: usize,
        site: &'static Location<'static>,
    ) -> Result<TaskHandle, TaskError> {
        let space = self.memory.active();
        let size = self.config.task_stack_size;
        let base = self
            .memory
            .allocate_in(space, size, site, &mut self.platform)
            .map_err(TaskError::StackAllocationFailed)?;
        let stack = StackRegion { space, base, size };

        let Some(slot) = self.tasks.free_slot() else {
            self.release_stack(stack);
            return Err(TaskError::TooManyTasks);
        };
        let handle = TaskHandle::new(slot, self.next_task_id());

        let mut ambient = self.ambient.clone();
        ambient.address_space = space;
        ambient.syscall_number = 0;
        if let Some(p) = process {
            if let Err(e) = self.processes.attach(p, handle) {
                self.release_stack(stack);
                return Err(e);
            }
            if let Some(owner) = self.processes.get(p) {
                ambient.address_space = owner.space();
            }
        }

        let root = self
            .memory
            .space(ambient.address_space)
            .map_or_else(|| self.memory.kernel().root(), AddressSpace::root);
        let state = CpuSaveState::initial(self.platform.entry_trampoline(), stack.top().as_u64(), root, slot);
        self.tasks
            .insert(Task::new(handle, entry, argument, state, stack, process, ambient, site, self.ticks));
        Ok(handle)
    }

    /// Fresh identity: the creation tick, bumped past the last one issued.
    fn next_task_id(&mut self) -> TaskId {
        let id = NonZeroU64::MIN.saturating_add(self.ticks.max(self.last_task_id));
        self.last_task_id = id.get();
        TaskId::from_nonzero(id)
    }

    fn release_stack(&mut self, stack: StackRegion) {
        if let Err(e) = self.memory.free_in(stack.space, stack.base, &mut self.platform) {
            log::warn!("stack at {} in {} not freed: {}", stack.base, stack.space, e);
        }
    }

    /// Make a task runnable, whatever it was waiting for.
    pub fn release(&mut self, task: TaskHandle) -> Result<(), TaskError> {
        self.set_suspension(task, Suspension::Runnable)
    }

    /// Take a task off the run queue until it is released.
    ///
    /// Suspending the running task takes effect at the next reschedule.
    pub fn suspend(&mut self, task: TaskHandle) -> Result<(), TaskError> {
        self.set_suspension(task, Suspension::FullySuspended)
    }

    fn set_suspension(&mut self, task: TaskHandle, suspension: Suspension) -> Result<(), TaskError> {
        self.masked(|k| {
            let t = k.tasks.get_mut(task).ok_or_else(|| stale(task))?;
            if t.is_zombie() || t.marked_for_deletion {
                return Err(TaskError::AlreadyExited(task));
            }
            let previous = t.suspension;
            t.suspension = suspension;
            if let Suspension::UntilTaskExit(target) = previous {
                k.refresh_attachment(target);
            }
            Ok(())
        })
    }

    /// Terminate a task.
    ///
    /// Killing the running task is an exit. Any other task is retired on
    /// the spot: its stack is freed and its waiters are released.
    pub fn kill(&mut self, task: TaskHandle) -> Result<(), TaskError> {
        let t = self.tasks.get(task).ok_or_else(|| stale(task))?;
        if t.is_zombie() || t.marked_for_deletion {
            return Err(TaskError::AlreadyExited(task));
        }
        self.reclaimer.release_task_resources(task);
        if self.current_task() == Some(task) {
            self.exit_current();
            return Ok(());
        }
        self.masked(|k| {
            k.leave_process(task);
            k.retire(task.slot());
        });
        log::debug!("killed {}", task);
        Ok(())
    }

    /// Kill whatever task occupies `slot`.
    pub fn kill_slot(&mut self, slot: usize) -> Result<(), TaskError> {
        let task = self.tasks.by_slot(slot).map(Task::handle).ok_or(TaskError::EmptySlot(slot))?;
        self.kill(task)
    }

    /// End the running task.
    ///
    /// The task is marked for deletion and a reschedule is requested; it is
    /// never selected again. Called from the kernel context, which has
    /// nothing to exit to, this halts the machine.
    pub fn exit_current(&mut self) {
        let Some(task) = self.current_task() else {
            log::error!("exit requested by the kernel context, halting");
            self.platform.halt();
        };
        self.masked(|k| {
            k.leave_process(task);
            if let Some(t) = k.tasks.get_mut(task) {
                t.marked_for_deletion = true;
            }
        });
        log::debug!("{} exiting", task);
        self.platform.request_reschedule();
    }

    /// Free the slot of a zombie. Returns `NotZombie` for a live task.
    pub fn reap(&mut self, task: TaskHandle) -> Result<(), TaskError> {
        self.masked(|k| {
            let t = k.tasks.get(task).ok_or(TaskError::NoSuchTask(task))?;
            if !t.is_zombie() {
                return Err(TaskError::NotZombie(task));
            }
            k.tasks.remove(task.slot());
            Ok(())
        })
    }

    fn leave_process(&mut self, task: TaskHandle) {
        let Some(process) = self.tasks.get(task).and_then(Task::process) else {
            return;
        };
        if self.processes.detach(process, task) {
            log::debug!("{} lost its last thread", process);
            self.reclaimer.on_process_death(process);
        }
    }

    /// Free a finished task's stack and wake its waiters.
    ///
    /// The task stays behind as a zombie only while a live task is still
    /// waiting for it.
    pub(crate) fn retire(&mut self, slot: usize) {
        let Some(handle) = self.tasks.by_slot(slot).map(Task::handle) else {
            return;
        };
        let awaited = self.is_awaited(handle);
        let Some(task) = self.tasks.by_slot_mut(slot) else {
            return;
        };
        let stack = task.stack.take();
        let waited_on = match task.suspension {
            Suspension::UntilTaskExit(target) => Some(target),
            _ => None,
        };
        task.attached = awaited;
        if awaited {
            task.suspension = Suspension::Zombie;
            task.marked_for_deletion = false;
        }

        if let Some(stack) = stack {
            self.release_stack(stack);
        }
        if awaited {
            log::trace!("{} is a zombie", handle);
        } else {
            self.tasks.remove(slot);
            log::trace!("{} removed", handle);
        }
        self.tasks.wake_where(|s| *s == Suspension::UntilTaskExit(handle));
        if let Some(target) = waited_on {
            self.refresh_attachment(target);
        }
    }

    /// Whether a live task other than `target` waits for it to exit.
    fn is_awaited(&self, target: TaskHandle) -> bool {
        self.tasks.iter().any(|t| {
            t.handle() != target
                && !t.is_zombie()
                && !t.marked_for_deletion
                && t.suspension() == Suspension::UntilTaskExit(target)
        })
    }

    /// Drop the attachment of `target` once its last waiter is gone.
    fn refresh_attachment(&mut self, target: TaskHandle) {
        let awaited = self.is_awaited(target);
        if let Some(t) = self.tasks.get_mut(target) {
            t.attached = awaited;
        }
    }

    // ── Processes ───────────────────────────────────────────────

    /// Create a process with a fresh user heap of `heap_slots` pages and a
    /// first thread running `entry(argument)`.
    ///
    /// Nothing is left behind on failure.
    #[track_caller]
    pub fn create_process(
        &mut self,
        name: &str,
        heap_slots: usize,
        entry: TaskEntry,
        argument: usize,
    ) -> Result<(ProcessHandle, TaskHandle), KernelError> {
        let site = Location::caller();
        let space = self.masked(|k| k.memory.create_address_space_at(heap_slots, site, &mut k.platform))?;
        let process = match self.processes.create(name, space) {
            Ok(process) => process,
            Err(e) => {
                self.discard_space(space);
                return Err(e.into());
            }
        };
        match self.spawn_at(Some(process), entry, argument, site) {
            Ok(task) => {
                log::info!("created {} '{}' in {}", process, name, space);
                Ok((process, task))
            }
            Err(e) => {
                self.processes.remove(process);
                self.discard_space(space);
                Err(e.into())
            }
        }
    }

    /// Kill every thread of a process, the caller's own thread last.
    pub fn kill_process(&mut self, process: ProcessHandle) -> Result<(), TaskError> {
        let threads: Vec<TaskHandle> = self
            .processes
            .get(process)
            .ok_or(TaskError::NoSuchProcess(process))?
            .threads()
            .to_vec();
        let me = self.current_task();
        for &task in threads.iter().filter(|&&t| Some(t) != me) {
            if let Err(e) = self.kill(task) {
                log::debug!("{}: {}", process, e);
            }
        }
        if let Some(me) = me.filter(|me| threads.contains(me)) {
            self.kill(me)?;
        }
        Ok(())
    }

    /// Tear down processes whose last thread has left.
    ///
    /// A process is kept while one of its threads is still waiting to be
    /// retired, and while any live task still has its stack in the
    /// process's heap or would resume there.
    pub(crate) fn dispose_dying_processes(&mut self) {
        for process in self.processes.dying() {
            let Some(space) = self.processes.get(process).map(|p| p.space()) else {
                continue;
            };
            let pending = self
                .tasks
                .iter()
                .any(|t| t.process() == Some(process) && t.is_marked_for_deletion());
            if pending || self.space_needed_by_tasks(space) {
                continue;
            }
            let Some(dead) = self.processes.remove(process) else {
                continue;
            };
            self.discard_space(dead.space());
            let woken = self.tasks.wake_where(|s| *s == Suspension::UntilProcessExit(process));
            log::debug!("disposed of {} '{}', {} waiter(s) released", process, dead.name(), woken);
        }
    }

    fn discard_space(&mut self, space: SpaceId) {
        if let Err(e) = self.memory.destroy_address_space(space, &mut self.platform) {
            log::warn!("{} not destroyed: {}", space, e);
        }
        if self.ambient.address_space == space {
            self.ambient.address_space = self.memory.active();
        }
    }
}

fn stale(task: TaskHandle) -> TaskError {
    log::warn!("{} does not refer to a live task", task);
    TaskError::NoSuchTask(task)
}

#[cfg(test)]
mod tests {
    use crate::arch::hosted::HostedPlatform;
    use crate::config::KernelConfig;
    use crate::error::TaskError;
    use crate::kernel::Kernel;
    use crate::memory::pmm::FrameAllocator;
    use crate::task::tcb::Suspension;

    fn idle(_: usize) {}

    fn kernel() -> Kernel<HostedPlatform> {
        let config = KernelConfig::new().with_kernel_heap_slots(2048).with_max_tasks(8);
        Kernel::new(HostedPlatform::new(), FrameAllocator::new(4096), config).unwrap()
    }

    #[test]
    fn new_tasks_start_suspended_with_unique_ids() {
        let mut k = kernel();
        let a = k.spawn(idle, 1).unwrap();
        let b = k.spawn(idle, 2).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(k.task(a).unwrap().suspension(), Suspension::FullySuspended);
        assert_eq!(k.task(b).unwrap().entry().1, 2);
        k.release(a).unwrap();
        assert!(k.task(a).unwrap().is_eligible());
    }

    #[test]
    fn spawn_failure_leaves_no_stack_behind() {
        let mut k = kernel();
        for _ in 0..8 {
            k.spawn(idle, 0).unwrap();
        }
        let used = k.memory().frames().used_frames();
        assert_eq!(k.spawn(idle, 0), Err(TaskError::TooManyTasks));
        assert_eq!(k.memory().frames().used_frames(), used);
    }

    #[test]
    fn killing_a_suspended_task_frees_its_slot_and_stack() {
        let mut k = kernel();
        let before = k.memory().frames().used_frames();
        let t = k.spawn(idle, 0).unwrap();
        k.kill(t).unwrap();
        assert!(k.task(t).is_none());
        assert_eq!(k.memory().frames().used_frames(), before);
        assert_eq!(k.kill(t), Err(TaskError::NoSuchTask(t)));
        assert_eq!(k.kill_slot(t.slot()), Err(TaskError::EmptySlot(t.slot())));
    }

    #[test]
    fn stale_handles_do_not_reach_reused_slots() {
        let mut k = kernel();
        let old = k.spawn(idle, 0).unwrap();
        k.kill(old).unwrap();
        let new = k.spawn(idle, 0).unwrap();
        assert_eq!(old.slot(), new.slot());
        assert_eq!(k.release(old), Err(TaskError::NoSuchTask(old)));
        assert!(k.release(new).is_ok());
    }

    #[test]
    fn reap_refuses_live_tasks() {
        let mut k = kernel();
        let t = k.spawn(idle, 0).unwrap();
        assert_eq!(k.reap(t), Err(TaskError::NotZombie(t)));
    }

    #[test]
    fn tags_are_bracketed_and_truncated() {
        let mut k = kernel();
        let t = k.spawn(idle, 0).unwrap();
        assert_eq!(k.task_tag(t), Some("<kernel task>"));
        k.assign_tag(t, "0123456789012345678901234567890123456789").unwrap();
        assert_eq!(k.task_tag(t), Some("[012345678901234567890123456789]"));
    }
}
