//! Poll-on-yield waiting.
//!
//! A wait is split in two: the kernel records the suspension and hands back
//! a [`WaitHandle`]; the waiting code then yields until polling the handle
//! reports ready. The kernel instance is never borrowed across a yield, so
//! the reschedule trap can always reach it.

use core::task::Poll;

use crate::arch::Platform;
use crate::error::TaskError;
use crate::kernel::Kernel;
use crate::task::process::ProcessHandle;
use crate::task::tcb::{Suspension, Task, TaskHandle, WaitObject};

/// A pending wait of one task.
///
/// Ready once the task's suspension no longer equals the one recorded here:
/// a wake-up sweep, the timer, an explicit release, or the task going away.
#[must_use = "a wait does nothing unless it is polled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitHandle {
    task: TaskHandle,
    reason: Suspension,
}

impl WaitHandle {
    pub(crate) const fn new(task: TaskHandle, reason: Suspension) -> Self {
        Self { task, reason }
    }

    pub fn task(&self) -> TaskHandle {
        self.task
    }

    pub fn reason(&self) -> Suspension {
        self.reason
    }

    /// Decide readiness from the task's current suspension, `None` if the
    /// task no longer exists.
    pub fn poll_with(&self, current: Option<Suspension>) -> Poll<()> {
        match current {
            Some(s) if s == self.reason => Poll::Pending,
            _ => Poll::Ready(()),
        }
    }
}

/// Poll until ready, calling `relax` (a yield) after every pending poll.
pub fn spin_until<R>(mut poll: impl FnMut() -> Poll<R>, mut relax: impl FnMut()) -> R {
    loop {
        if let Poll::Ready(value) = poll() {
            return value;
        }
        relax();
    }
}

impl<P: Platform> Kernel<P> {
    /// Record that the running task waits for `reason`.
    fn begin_wait(&mut self, reason: Suspension) -> Result<WaitHandle, TaskError> {
        let task = self.current_task().ok_or(TaskError::NotInTask)?;
        self.masked(|k| {
            if let Some(t) = k.tasks.get_mut(task) {
                t.suspension = reason;
            }
        });
        Ok(WaitHandle::new(task, reason))
    }

    /// Sleep the running task for at least `ms` milliseconds.
    pub fn wait_ms(&mut self, ms: u64) -> Result<WaitHandle, TaskError> {
        let deadline = self.ticks + self.config.ms_to_ticks(ms);
        self.begin_wait(Suspension::UntilTimer { deadline })
    }

    /// Wait for `target` to exit.
    ///
    /// The target is attached: when it ends it stays behind as a zombie for
    /// the caller to `reap`. A target that is already gone yields a handle
    /// that is ready at once.
    pub fn wait_for_task_exit(&mut self, target: TaskHandle) -> Result<WaitHandle, TaskError> {
        let me = self.current_task().ok_or(TaskError::NotInTask)?;
        if target == me {
            return Err(TaskError::WaitOnSelf);
        }
        let reason = Suspension::UntilTaskExit(target);
        let alive = self.masked(|k| match k.tasks.get_mut(target) {
            Some(t) if !t.is_zombie() => {
                t.attached = true;
                true
            }
            _ => false,
        });
        if !alive {
            return Ok(WaitHandle::new(me, reason));
        }
        self.begin_wait(reason)
    }

    /// Wait until `process` has been disposed of.
    pub fn wait_for_process_exit(&mut self, process: ProcessHandle) -> Result<WaitHandle, TaskError> {
        let me = self.current_task().ok_or(TaskError::NotInTask)?;
        let reason = Suspension::UntilProcessExit(process);
        if self.processes.get(process).is_none() {
            return Ok(WaitHandle::new(me, reason));
        }
        self.begin_wait(reason)
    }

    pub fn wait_for_pipe_readable(&mut self, pipe: WaitObject) -> Result<WaitHandle, TaskError> {
        self.begin_wait(Suspension::UntilPipeReadable(pipe))
    }

    pub fn wait_for_pipe_writable(&mut self, pipe: WaitObject) -> Result<WaitHandle, TaskError> {
        self.begin_wait(Suspension::UntilPipeWritable(pipe))
    }

    pub fn wait_for_event(&mut self, object: WaitObject) -> Result<WaitHandle, TaskError> {
        self.begin_wait(Suspension::UntilEvent(object))
    }

    pub fn wait_for_compositor_tick(&mut self) -> Result<WaitHandle, TaskError> {
        self.begin_wait(Suspension::UntilCompositorTick)
    }

    pub fn poll_wait(&self, wait: &WaitHandle) -> Poll<()> {
        wait.poll_with(self.tasks.get(wait.task()).map(Task::suspension))
    }

    // ── Wake-up sweeps ──────────────────────────────────────────

    pub fn unsuspend_tasks_waiting_for_pipe_read(&mut self, pipe: WaitObject) -> usize {
        self.wake(Suspension::UntilPipeReadable(pipe))
    }

    pub fn unsuspend_tasks_waiting_for_pipe_write(&mut self, pipe: WaitObject) -> usize {
        self.wake(Suspension::UntilPipeWritable(pipe))
    }

    pub fn unsuspend_tasks_waiting_for_event(&mut self, object: WaitObject) -> usize {
        self.wake(Suspension::UntilEvent(object))
    }

    pub fn unsuspend_tasks_waiting_for_compositor(&mut self) -> usize {
        self.wake(Suspension::UntilCompositorTick)
    }

    fn wake(&mut self, reason: Suspension) -> usize {
        self.masked(|k| k.tasks.wake_where(|s| *s == reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tcb::TaskId;

    #[test]
    fn pending_only_while_the_suspension_is_unchanged() {
        let task = TaskHandle::new(3, TaskId::new(11).unwrap());
        let wait = WaitHandle::new(task, Suspension::UntilCompositorTick);
        assert_eq!(wait.poll_with(Some(Suspension::UntilCompositorTick)), Poll::Pending);
        assert_eq!(wait.poll_with(Some(Suspension::Runnable)), Poll::Ready(()));
        assert_eq!(wait.poll_with(Some(Suspension::UntilTimer { deadline: 1 })), Poll::Ready(()));
        assert_eq!(wait.poll_with(None), Poll::Ready(()));
    }

    #[test]
    fn spin_until_yields_between_polls() {
        let mut polls = 0;
        let mut yields = 0;
        let value = spin_until(
            || {
                polls += 1;
                if polls == 4 { Poll::Ready(polls * 10) } else { Poll::Pending }
            },
            || yields += 1,
        );
        assert_eq!((value, polls, yields), (40, 4, 3));
    }
}
