// =============================================================================
// NanoCore — Round-Robin Scheduler
// =============================================================================
//
// Runs from the reschedule trap (timer interrupt or an explicit yield) with
// the interrupted register file in `live`:
//
//   1. charge the elapsed cycles to whatever was running and save its
//      registers, FPU image and ambient context
//   2. pick the next eligible task after the cursor, waking expired timer
//      sleeps first; with none eligible, or when forced, the kernel context
//   3. retire tasks marked for deletion, except the outgoing and incoming
//      ones, then dispose of processes left without threads
//   4. restore the incoming context into `live` and install its address
//      space
//
// The trap stub then returns into whatever `live` now holds.
//
// =============================================================================

use core::mem;

use crate::arch::{CpuSaveState, Platform};
use crate::kernel::Kernel;
use crate::memory::space::SpaceId;
use crate::sync::irq::SavedIrq;

impl<P: Platform> Kernel<P> {
    /// Switch from whatever `live` holds to the next task.
    pub fn reschedule(&mut self, live: &mut CpuSaveState) {
        let irq = SavedIrq::mask(&mut self.platform);

        let now = self.platform.cycle_counter();
        let elapsed = now.saturating_sub(self.last_switch_at);
        self.last_switch_at = now;

        let outgoing = self.current;
        self.save_outgoing(outgoing, live, elapsed);

        let incoming = if mem::take(&mut self.force_kernel_next) {
            None
        } else {
            self.tasks.select_next(self.cursor, self.ticks)
        };

        for slot in self.tasks.marked_for_deletion([outgoing, incoming]) {
            self.retire(slot);
        }
        self.dispose_dying_processes();

        self.restore_incoming(incoming, live);
        self.switches += 1;

        irq.restore(&mut self.platform);
    }

    /// Timer interrupt: advance the clock, then reschedule.
    pub fn timer_tick(&mut self, live: &mut CpuSaveState) {
        self.ticks += 1;
        self.reschedule(live);
    }

    /// Ask the platform for a reschedule at the next opportunity.
    pub fn yield_now(&mut self) {
        self.platform.request_reschedule();
    }

    /// Make the next reschedule resume the kernel context regardless of
    /// what is runnable.
    pub fn force_kernel_next(&mut self) {
        self.force_kernel_next = true;
    }

    fn save_outgoing(&mut self, outgoing: Option<usize>, live: &CpuSaveState, elapsed: u64) {
        self.ambient.address_space = self.memory.active();
        let ambient = self.ambient.clone();

        match outgoing {
            Some(slot) => {
                if let Some(task) = self.tasks.by_slot_mut(slot) {
                    self.platform.save_context(live, &mut task.state, &mut task.fpu);
                    task.ambient = ambient;
                    task.cpu_time += elapsed;
                }
            }
            None => {
                let k = &mut self.kernel_context;
                self.platform.save_context(live, &mut k.state, &mut k.fpu);
                k.ambient = ambient;
                k.cpu_time += elapsed;
            }
        }
    }

    fn restore_incoming(&mut self, incoming: Option<usize>, live: &mut CpuSaveState) {
        let resumed = incoming.and_then(|slot| self.tasks.by_slot_mut(slot));
        let mut ambient = match resumed {
            Some(task) => {
                self.platform.restore_context(&task.state, &task.fpu, live);
                mem::take(&mut task.ambient)
            }
            None => {
                let k = &mut self.kernel_context;
                self.platform.restore_context(&k.state, &k.fpu, live);
                mem::take(&mut k.ambient)
            }
        };

        let space = ambient.address_space;
        if space != self.memory.active() {
            if let Err(e) = self.memory.use_address_space(space, &mut self.platform) {
                log::warn!("cannot resume in {}: {}, using the kernel heap", space, e);
                self.memory.use_kernel_space(&mut self.platform);
            }
        }
        ambient.address_space = self.memory.active();
        live.cr3 = self
            .memory
            .space(ambient.address_space)
            .or_else(|| self.memory.space(SpaceId::KERNEL))
            .map_or(live.cr3, |s| s.root().as_u64());

        self.ambient = ambient;
        self.current = incoming;
        if incoming.is_some() {
            self.cursor = incoming;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::arch::CpuSaveState;
    use crate::arch::hosted::{HOSTED_TRAMPOLINE, HostedPlatform};
    use crate::config::KernelConfig;
    use crate::kernel::Kernel;
    use crate::memory::pmm::FrameAllocator;

    fn idle(_: usize) {}

    fn kernel() -> Kernel<HostedPlatform> {
        let config = KernelConfig::new().with_kernel_heap_slots(2048).with_max_tasks(8);
        Kernel::new(HostedPlatform::new(), FrameAllocator::new(4096), config).unwrap()
    }

    #[test]
    fn nothing_runnable_keeps_the_kernel_context() {
        let mut k = kernel();
        let mut live = CpuSaveState { rip: 0x1234, ..Default::default() };
        k.reschedule(&mut live);
        assert_eq!(k.current_task(), None);
        assert_eq!(live.rip, 0x1234);
        assert_eq!(k.switch_count(), 1);
    }

    #[test]
    fn first_switch_enters_through_the_trampoline() {
        let mut k = kernel();
        let t = k.spawn(idle, 0).unwrap();
        k.release(t).unwrap();
        let mut live = CpuSaveState { rip: 0x1234, ..Default::default() };
        k.reschedule(&mut live);
        assert_eq!(k.current_task(), Some(t));
        assert_eq!(live.rip, HOSTED_TRAMPOLINE);
        assert_eq!(live.rdi, t.slot() as u64);

        k.force_kernel_next();
        k.reschedule(&mut live);
        assert_eq!(k.current_task(), None);
        assert_eq!(live.rip, 0x1234);
    }

    #[test]
    fn the_timer_advances_the_clock() {
        let mut k = kernel();
        let mut live = CpuSaveState::default();
        for _ in 0..5 {
            k.timer_tick(&mut live);
        }
        assert_eq!(k.ticks(), 5);
        assert_eq!(k.switch_count(), 5);
    }
}
