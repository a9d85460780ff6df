// =============================================================================
// NanoCore — Kernel
// =============================================================================
//
// The kernel instance: one value owning the heaps, the task and process
// tables, the scheduler cursor, and the platform it drives. Every operation
// is a method on it; the bare-metal backend keeps the single instance behind
// an interrupt-masking spin lock.
//
// The methods are split by concern:
//
//   kernel.rs          construction, heaps, locks, ambient, accessors
//   task/lifecycle.rs  spawn, release, suspend, kill, exit, reap, processes
//   task/wait.rs       wait registration, polling, wake-up sweeps
//   task/scheduler.rs  reschedule, timer tick
//   diag.rs            dump
//
// Internal state is only touched with interrupts masked (`masked`), so a
// timer tick never observes a half-updated table.
//
// =============================================================================

use alloc::boxed::Box;
use core::panic::Location;

use crate::arch::{CpuSaveState, FpuState, Platform};
use crate::config::KernelConfig;
use crate::error::{KernelError, LockError, MemoryError, TaskError};
use crate::memory::address::VirtAddr;
use crate::memory::heap::HeapManager;
use crate::memory::pmm::FrameAllocator;
use crate::memory::space::SpaceId;
use crate::sync::irq::SavedIrq;
use crate::sync::lock::{Owner, SafeLock};
use crate::task::ambient::AmbientContext;
use crate::task::process::{Process, ProcessHandle, ProcessTable};
use crate::task::table::TaskTable;
use crate::task::tcb::{Task, TaskHandle, TaskId};

/// Hooks for subsystems that hold per-task or per-process resources.
///
/// Called with the kernel state already updated; implementations must not
/// call back into the kernel.
pub trait ResourceReclaimer {
    /// A task is being killed; drop whatever it holds outside the core.
    fn release_task_resources(&mut self, _task: TaskHandle) {}

    /// The last thread of a process has left.
    fn on_process_death(&mut self, _process: ProcessHandle) {}
}

/// Reclaimer for a kernel with no collaborating subsystems.
#[derive(Debug, Default)]
pub struct NoReclaimer;

impl ResourceReclaimer for NoReclaimer {}

/// Saved state of the kernel context: the flow of control that booted the
/// kernel, which runs whenever no task is selected.
pub(crate) struct KernelContext {
    pub(crate) state: CpuSaveState,
    pub(crate) fpu: Box<FpuState>,
    pub(crate) ambient: AmbientContext,
    pub(crate) cpu_time: u64,
}

pub struct Kernel<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: KernelConfig,
    pub(crate) memory: HeapManager,
    pub(crate) tasks: TaskTable,
    pub(crate) processes: ProcessTable,
    /// Slot of the running task, `None` while the kernel context runs.
    pub(crate) current: Option<usize>,
    /// Slot the round-robin scan continues after.
    pub(crate) cursor: Option<usize>,
    pub(crate) kernel_context: KernelContext,
    /// Ambient context of whatever is running right now.
    pub(crate) ambient: AmbientContext,
    pub(crate) ticks: u64,
    pub(crate) last_task_id: u64,
    pub(crate) last_switch_at: u64,
    pub(crate) force_kernel_next: bool,
    pub(crate) switches: u64,
    pub(crate) reclaimer: Box<dyn ResourceReclaimer + Send>,
}

impl<P: Platform> Kernel<P> {
    /// Bring the kernel up on `platform` with the given physical frames.
    ///
    /// The caller's own flow of control becomes the kernel context.
    pub fn new(mut platform: P, frames: FrameAllocator, config: KernelConfig) -> Result<Self, KernelError> {
        let irq = SavedIrq::mask(&mut platform);
        let memory = HeapManager::new(frames, config.kernel_heap_slots, &mut platform);
        irq.restore(&mut platform);
        let memory = memory?;
        let last_switch_at = platform.cycle_counter();
        log::info!(
            "kernel up: {} task slots, {} byte stacks, {} Hz timer",
            config.max_tasks,
            config.task_stack_size,
            config.timer_hz,
        );
        Ok(Self {
            platform,
            config,
            memory,
            tasks: TaskTable::new(config.max_tasks),
            processes: ProcessTable::new(crate::config::MAX_PROCESSES),
            current: None,
            cursor: None,
            kernel_context: KernelContext {
                state: CpuSaveState::default(),
                fpu: Box::new(FpuState::initial()),
                ambient: AmbientContext::default(),
                cpu_time: 0,
            },
            ambient: AmbientContext::default(),
            ticks: 0,
            last_task_id: 0,
            last_switch_at,
            force_kernel_next: false,
            switches: 0,
            reclaimer: Box::new(NoReclaimer),
        })
    }

    pub fn set_reclaimer(&mut self, reclaimer: Box<dyn ResourceReclaimer + Send>) {
        self.reclaimer = reclaimer;
    }

    /// Run `f` with interrupts masked, restoring the previous state after.
    pub(crate) fn masked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let irq = SavedIrq::mask(&mut self.platform);
        let result = f(self);
        irq.restore(&mut self.platform);
        result
    }

    // ── Slot heaps ──────────────────────────────────────────────

    /// Allocate `size` bytes, rounded up to whole pages, in the active
    /// address space.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<VirtAddr, MemoryError> {
        let site = Location::caller();
        self.masked(|k| {
            let active = k.memory.active();
            k.memory.allocate_in(active, size, site, &mut k.platform)
        })
    }

    /// Free an allocation of the active address space by its exact pointer.
    pub fn free(&mut self, ptr: VirtAddr) -> Result<(), MemoryError> {
        self.masked(|k| k.memory.free(ptr, &mut k.platform))
    }

    /// Resize an allocation of the active address space.
    ///
    /// The result may differ from `ptr` when the run had to move; `ptr`
    /// must not be used after that.
    #[track_caller]
    pub fn reallocate(&mut self, ptr: VirtAddr, size: usize) -> Result<VirtAddr, MemoryError> {
        let site = Location::caller();
        self.masked(|k| k.memory.reallocate(ptr, size, site, &mut k.platform))
    }

    /// Allocate from the kernel heap whichever space is active.
    #[track_caller]
    pub fn allocate_kernel(&mut self, size: usize) -> Result<VirtAddr, MemoryError> {
        let site = Location::caller();
        self.masked(|k| k.memory.allocate_in(SpaceId::KERNEL, size, site, &mut k.platform))
    }

    pub fn free_kernel(&mut self, ptr: VirtAddr) -> Result<(), MemoryError> {
        self.masked(|k| k.memory.free_in(SpaceId::KERNEL, ptr, &mut k.platform))
    }

    #[track_caller]
    pub fn create_address_space(&mut self, slot_count: usize) -> Result<SpaceId, MemoryError> {
        let site = Location::caller();
        self.masked(|k| k.memory.create_address_space_at(slot_count, site, &mut k.platform))
    }

    /// Destroy a user address space nobody runs in.
    ///
    /// Refused while a process owns it or a live task has its stack there
    /// or runs in it. Destroying the active space switches to the kernel
    /// heap.
    pub fn destroy_address_space(&mut self, id: SpaceId) -> Result<(), MemoryError> {
        if id.is_kernel() {
            return Err(MemoryError::KernelSpace);
        }
        if self.processes.owner_of(id).is_some() || self.space_needed_by_tasks(id) {
            return Err(MemoryError::AddressSpaceInUse(id));
        }
        self.masked(|k| {
            k.memory.destroy_address_space(id, &mut k.platform)?;
            k.ambient.address_space = k.memory.active();
            Ok(())
        })
    }

    /// Whether a live task has its stack in `id` or resumes in it.
    pub(crate) fn space_needed_by_tasks(&self, id: SpaceId) -> bool {
        self.tasks.iter().filter(|t| !t.is_zombie()).any(|t| {
            let resumes_in = self.ambient_of(t.handle()).is_some_and(|a| a.address_space == id);
            resumes_in || t.stack.is_some_and(|s| s.space == id)
        })
    }

    pub fn use_address_space(&mut self, id: SpaceId) -> Result<(), MemoryError> {
        self.masked(|k| {
            k.memory.use_address_space(id, &mut k.platform)?;
            k.ambient.address_space = id;
            Ok(())
        })
    }

    pub fn use_kernel_space(&mut self) {
        self.masked(|k| {
            k.memory.use_kernel_space(&mut k.platform);
            k.ambient.address_space = SpaceId::KERNEL;
        });
    }

    pub fn memory(&self) -> &HeapManager {
        &self.memory
    }

    // ── Locks ───────────────────────────────────────────────────

    /// Who a lock taken right now would be owned by.
    pub fn lock_owner(&self) -> Owner {
        self.current_task().map_or(Owner::Kernel, |t| Owner::Task(t.id()))
    }

    /// One acquisition attempt on behalf of the running task.
    #[track_caller]
    pub fn try_acquire(&mut self, lock: &SafeLock) -> bool {
        self.try_acquire_at(lock, Location::caller())
    }

    pub fn try_acquire_at(&mut self, lock: &SafeLock, site: &'static Location<'static>) -> bool {
        let owner = self.lock_owner();
        self.masked(|_| lock.try_acquire(owner, site))
    }

    pub fn release_lock(&mut self, lock: &SafeLock) -> Result<(), LockError> {
        let owner = self.lock_owner();
        self.masked(|_| lock.release(owner))
    }

    // ── Ambient context ─────────────────────────────────────────

    /// Ambient context of whatever is running.
    pub fn ambient(&self) -> &AmbientContext {
        &self.ambient
    }

    pub fn ambient_mut(&mut self) -> &mut AmbientContext {
        &mut self.ambient
    }

    /// Ambient context of `task`: the live copy if it is running, its
    /// saved snapshot otherwise.
    pub fn ambient_of(&self, task: TaskHandle) -> Option<&AmbientContext> {
        let t = self.tasks.get(task)?;
        if self.current == Some(task.slot()) {
            Some(&self.ambient)
        } else {
            Some(&t.ambient)
        }
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn current_task(&self) -> Option<TaskHandle> {
        self.current.and_then(|slot| self.tasks.by_slot(slot)).map(Task::handle)
    }

    pub fn current_process(&self) -> Option<ProcessHandle> {
        self.current.and_then(|slot| self.tasks.by_slot(slot)).and_then(Task::process)
    }

    pub fn task(&self, handle: TaskHandle) -> Option<&Task> {
        self.tasks.get(handle)
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn find_task(&self, id: TaskId) -> Option<TaskHandle> {
        self.tasks.find(id)
    }

    pub fn process(&self, handle: ProcessHandle) -> Option<&Process> {
        self.processes.get(handle)
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// Timer ticks since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn switch_count(&self) -> u64 {
        self.switches
    }

    /// Cycles the kernel context has run, up to the last switch away.
    pub fn kernel_cpu_time(&self) -> u64 {
        self.kernel_context.cpu_time
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Tag a task for diagnostics. Longer text is cut at `TAG_MAX` chars.
    pub fn assign_tag(&mut self, task: TaskHandle, text: &str) -> Result<(), TaskError> {
        let t = self.tasks.get_mut(task).ok_or(TaskError::NoSuchTask(task))?;
        t.set_tag(text);
        Ok(())
    }

    pub fn task_tag(&self, task: TaskHandle) -> Option<&str> {
        self.tasks.get(task).map(Task::tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::HostedPlatform;

    fn kernel() -> Kernel<HostedPlatform> {
        let config = KernelConfig::new().with_kernel_heap_slots(1024);
        Kernel::new(HostedPlatform::new(), FrameAllocator::new(4096), config).unwrap()
    }

    #[test]
    fn allocations_record_their_call_site() {
        let mut k = kernel();
        let ptr = k.allocate(100).unwrap();
        let line = line!() - 1;
        let kernel = k.memory().kernel();
        let site = kernel.slot_of(ptr).and_then(|s| kernel.allocation_site(s)).unwrap();
        assert_eq!(site.line(), line);
        assert!(site.file().ends_with("kernel.rs"));
        k.free(ptr).unwrap();
    }

    #[test]
    fn kernel_context_owns_locks_as_kernel() {
        let mut k = kernel();
        let lock = SafeLock::new();
        assert_eq!(k.lock_owner(), Owner::Kernel);
        assert!(k.try_acquire(&lock));
        assert_eq!(lock.holder(), Some(Owner::Kernel));
        k.release_lock(&lock).unwrap();
        assert_eq!(k.release_lock(&lock), Err(LockError::NotHeld));
    }

    #[test]
    fn heap_operations_leave_interrupts_as_they_were() {
        let mut k = kernel();
        let ptr = k.allocate(4096 * 3).unwrap();
        assert!(k.platform().interrupts_enabled());
        k.platform_mut().disable_interrupts();
        k.free(ptr).unwrap();
        assert!(!k.platform().interrupts_enabled());
    }

    #[test]
    fn switching_spaces_follows_the_ambient_context() {
        let mut k = kernel();
        let id = k.create_address_space(200).unwrap();
        k.use_address_space(id).unwrap();
        assert_eq!(k.ambient().address_space, id);
        assert_eq!(k.memory().active(), id);
        assert_eq!(k.destroy_address_space(SpaceId::KERNEL), Err(MemoryError::KernelSpace));
        k.destroy_address_space(id).unwrap();
        assert_eq!(k.memory().active(), SpaceId::KERNEL);
        assert_eq!(k.ambient().address_space, SpaceId::KERNEL);
    }

    #[test]
    fn reallocation_records_the_resizing_site() {
        let mut k = kernel();
        let ptr = k.allocate(4096).unwrap();
        let grown = k.reallocate(ptr, 2 * 4096).unwrap();
        let line = line!() - 1;
        assert_eq!(grown, ptr);
        let kernel = k.memory().kernel();
        let tail = kernel.slot_of(ptr).unwrap() + 1;
        assert_eq!(kernel.allocation_site(tail).unwrap().line(), line);
        assert_eq!(k.platform().unmasked_writes(), 0);
    }

    #[test]
    fn the_kernel_heap_is_reachable_from_a_user_space() {
        let mut k = kernel();
        let id = k.create_address_space(128).unwrap();
        k.use_address_space(id).unwrap();
        let ptr = k.allocate_kernel(4096).unwrap();
        assert!(k.memory().kernel().contains(ptr));
        assert_eq!(k.free(ptr), Err(MemoryError::ForeignAddressSpace(ptr)));
        k.free_kernel(ptr).unwrap();
        assert_eq!(k.free_kernel(ptr), Err(MemoryError::InvalidFree(ptr)));
    }
}
