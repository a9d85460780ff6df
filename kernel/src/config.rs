// =============================================================================
// NanoCore — Kernel Configuration
// =============================================================================
//
// Compile-time limits and the layout of the two slot windows.
//
// VIRTUAL LAYOUT:
//   Each slot window sits inside a single 1 GiB-aligned region so that its
//   paging structure is exactly one PDPT entry → one PD → N leaf tables.
//
//   USER_HEAP_BASE    0x0000_0000_4000_0000  PML4[0]   PDPT[1]
//   KERNEL_HEAP_BASE  0xFFFF_8080_0000_0000  PML4[257] PDPT[0]
//
//   The kernel window lives in the upper half, so copying PML4 entries
//   256..512 into a user root makes every kernel slot visible there too.
//
// =============================================================================

use crate::memory::address::PAGE_SIZE;
use crate::memory::paging::ENTRIES_PER_TABLE;

/// Size of one frame, and of one heap slot.
pub const FRAME_SIZE: usize = PAGE_SIZE as usize;

/// Capacity of the task table.
pub const MAX_TASKS: usize = 64;

/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 64;

/// Tasks a single process can hold.
pub const MAX_THREADS_PER_PROCESS: usize = 4;

/// Default size of a task's dedicated stack (32 KiB).
pub const TASK_STACK_SIZE: usize = FRAME_SIZE * 8;

/// Start of the kernel slot window.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_8080_0000_0000;

/// Start of every user slot window.
pub const USER_HEAP_BASE: u64 = 0x0000_0000_4000_0000;

/// Kernel slot table size: 65536 slots = 256 MiB of address space.
pub const KERNEL_HEAP_SLOTS: usize = 65536;

/// Smallest user slot table; smaller requests are rounded up.
pub const MIN_USER_HEAP_SLOTS: usize = 128;

/// Largest user slot table (128 leaf tables).
pub const MAX_USER_HEAP_SLOTS: usize = 128 * ENTRIES_PER_TABLE;

/// A window may span at most one page directory.
pub const MAX_WINDOW_SLOTS: usize = ENTRIES_PER_TABLE * ENTRIES_PER_TABLE;

/// First PML4 index of the kernel half, shared by every root.
pub const KERNEL_HALF_START: usize = ENTRIES_PER_TABLE / 2;

/// Longest working-directory path an ambient context keeps.
pub const PATH_MAX: usize = 260;

/// Longest task tag, excluding the surrounding brackets.
pub const TAG_MAX: usize = 30;

/// Longest process name.
pub const PROCESS_NAME_MAX: usize = 250;

/// Failed lock retries between two stall reports.
pub const LOCK_STALL_THRESHOLD: u32 = 1 << 20;

/// Timer interrupt frequency. At 1000 Hz one tick is one millisecond.
pub const TIMER_HZ: u32 = 1000;

const _: () = assert!(KERNEL_HEAP_BASE % (1 << 30) == 0);
const _: () = assert!(USER_HEAP_BASE % (1 << 30) == 0);
const _: () = assert!(KERNEL_HEAP_SLOTS <= MAX_WINDOW_SLOTS);
const _: () = assert!(MAX_USER_HEAP_SLOTS <= MAX_WINDOW_SLOTS);

/// Runtime-tunable kernel parameters.
///
/// The defaults match the constants above; tests shrink the kernel heap and
/// the stack size so a whole kernel fits in a few megabytes of simulated RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_tasks: usize,
    pub task_stack_size: usize,
    pub kernel_heap_slots: usize,
    pub timer_hz: u32,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            max_tasks: MAX_TASKS,
            task_stack_size: TASK_STACK_SIZE,
            kernel_heap_slots: KERNEL_HEAP_SLOTS,
            timer_hz: TIMER_HZ,
        }
    }

    pub const fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub const fn with_task_stack_size(mut self, bytes: usize) -> Self {
        self.task_stack_size = bytes;
        self
    }

    pub const fn with_kernel_heap_slots(mut self, slots: usize) -> Self {
        self.kernel_heap_slots = slots;
        self
    }

    pub const fn with_timer_hz(mut self, hz: u32) -> Self {
        self.timer_hz = hz;
        self
    }

    /// Converts a millisecond delay into timer ticks, rounding up.
    pub const fn ms_to_ticks(&self, ms: u64) -> u64 {
        (ms * self.timer_hz as u64).div_ceil(1000)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tick_is_one_millisecond() {
        let config = KernelConfig::default();
        assert_eq!(config.ms_to_ticks(100), 100);
        assert_eq!(config.ms_to_ticks(0), 0);
    }

    #[test]
    fn slower_timer_rounds_delays_up() {
        let config = KernelConfig::new().with_timer_hz(100);
        assert_eq!(config.ms_to_ticks(1), 1);
        assert_eq!(config.ms_to_ticks(25), 3);
    }
}
