//! Leak and hang triage.
//!
//! [`Kernel::dump`] snapshots every live task and every live allocation into
//! a [`DiagnosticReport`]; [`Kernel::log_dump`] writes it to the log, one line
//! per entry.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::panic::Location;

use crate::arch::Platform;
use crate::kernel::Kernel;
use crate::memory::address::{Frame, VirtAddr};
use crate::memory::space::SpaceId;
use crate::task::tcb::{Suspension, TaskHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub handle: TaskHandle,
    pub tag: String,
    pub suspension: Suspension,
    /// Saved instruction pointer; stale for the running task.
    pub rip: u64,
    pub rsp: u64,
    pub created_at: &'static Location<'static>,
    pub cpu_time: u64,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub space: SpaceId,
    pub slot: usize,
    pub address: VirtAddr,
    pub frame: Frame,
    pub pages: usize,
    pub site: Option<&'static Location<'static>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticReport {
    pub tasks: Vec<TaskRecord>,
    pub allocations: Vec<AllocationRecord>,
    pub used_frames: usize,
    pub total_frames: usize,
    pub ticks: u64,
    pub switches: u64,
    pub kernel_cpu_time: u64,
}

impl fmt::Display for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {} rip={:#x} rsp={:#x} cpu={} {} created at {}:{}",
            if self.running { "*" } else { " " },
            self.handle,
            self.tag,
            self.rip,
            self.rsp,
            self.cpu_time,
            self.suspension,
            self.created_at.file(),
            self.created_at.line(),
        )
    }
}

impl fmt::Display for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} slot {} {} -> {} x{}", self.space, self.slot, self.address, self.frame, self.pages)?;
        match self.site {
            Some(site) => write!(f, " from {}:{}", site.file(), site.line()),
            None => write!(f, " from <unknown>"),
        }
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "tick {}, {} switches, kernel cpu {}, frames {}/{}",
            self.ticks, self.switches, self.kernel_cpu_time, self.used_frames, self.total_frames,
        )?;
        writeln!(f, "{} task(s):", self.tasks.len())?;
        for task in &self.tasks {
            writeln!(f, "  {task}")?;
        }
        writeln!(f, "{} allocation(s):", self.allocations.len())?;
        for allocation in &self.allocations {
            writeln!(f, "  {allocation}")?;
        }
        Ok(())
    }
}

impl<P: Platform> Kernel<P> {
    /// Snapshot all live tasks and all live allocations.
    ///
    /// Only the head slot of each allocation run is listed.
    pub fn dump(&self) -> DiagnosticReport {
        let tasks = self
            .tasks
            .iter()
            .map(|t| TaskRecord {
                handle: t.handle(),
                tag: t.tag().into(),
                suspension: t.suspension(),
                rip: t.state().rip,
                rsp: t.state().rsp,
                created_at: t.created_at(),
                cpu_time: t.cpu_time(),
                running: self.current == Some(t.handle().slot()),
            })
            .collect();
        let allocations = self
            .memory
            .live_slots()
            .filter(|(_, view)| view.run > 0)
            .map(|(space, view)| AllocationRecord {
                space,
                slot: view.slot,
                address: view.address,
                frame: view.frame,
                pages: view.run,
                site: view.site,
            })
            .collect();
        let frames = self.memory.frames();
        DiagnosticReport {
            tasks,
            allocations,
            used_frames: frames.used_frames(),
            total_frames: frames.total_frames(),
            ticks: self.ticks,
            switches: self.switches,
            kernel_cpu_time: self.kernel_context.cpu_time,
        }
    }

    /// Write the dump to the log at `info`.
    pub fn log_dump(&self) {
        let report = self.dump();
        log::info!(
            "tick {}, {} switches, frames {}/{}",
            report.ticks,
            report.switches,
            report.used_frames,
            report.total_frames,
        );
        for task in &report.tasks {
            log::info!("{}", task);
        }
        for allocation in &report.allocations {
            log::info!("{}", allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::arch::hosted::HostedPlatform;
    use crate::config::KernelConfig;
    use crate::kernel::Kernel;
    use crate::memory::pmm::FrameAllocator;

    fn idle(_: usize) {}

    #[test]
    fn dump_lists_tasks_and_allocation_heads() {
        let config = KernelConfig::new().with_kernel_heap_slots(1024).with_task_stack_size(2 * 4096);
        let mut k = Kernel::new(HostedPlatform::new(), FrameAllocator::new(2048), config).unwrap();
        let t = k.spawn(idle, 0).unwrap();
        k.assign_tag(t, "worker").unwrap();
        let buf = k.allocate(3 * 4096).unwrap();

        let report = k.dump();
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.tasks[0].tag, "[worker]");
        assert!(report.tasks[0].created_at.file().ends_with("diag.rs"));
        assert_eq!(report.allocations.len(), 2);
        let heap = report.allocations.iter().find(|a| a.address == buf).unwrap();
        assert_eq!(heap.pages, 3);
        assert!(heap.site.is_some_and(|s| s.file().ends_with("diag.rs")));

        let text = alloc::format!("{report}");
        assert!(text.contains("1 task(s)"));
        assert!(text.contains("2 allocation(s)"));
        assert!(text.contains("[worker]"));
    }
}
