// =============================================================================
// NanoCore — Architecture Abstraction
// =============================================================================
//
// The rest of the core never touches hardware directly. Everything it needs
// from the CPU goes through the `Platform` trait below:
//
//   interrupts     — query, mask and unmask (critical sections)
//   time           — a monotonically increasing cycle counter
//   FPU            — save / restore the extended register image
//   context        — copy a task snapshot out of / into the trap frame
//   paging         — read and write table entries, flush, install a root
//   control        — entry trampoline address, reschedule trap, halt
//
// Backends:
//   hosted.rs      — deterministic simulation, used by every test
//   x86_64/        — real hardware, bare-metal targets only
// =============================================================================

pub mod context;
pub mod hosted;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

use crate::memory::address::{Frame, PhysAddr, VirtAddr};
use crate::memory::paging::PageTableEntry;

pub use context::{CpuSaveState, FpuState};

/// Hardware services the kernel core depends on.
///
/// Every method is called with interrupts already masked by the caller,
/// except the interrupt-mask methods themselves and `request_reschedule`.
pub trait Platform {
    // ── Interrupts ──────────────────────────────────────────────

    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&mut self);
    fn enable_interrupts(&mut self);

    // ── Time ────────────────────────────────────────────────────

    /// A monotonically increasing cycle counter (TSC on x86_64).
    fn cycle_counter(&mut self) -> u64;

    // ── FPU / SIMD state ────────────────────────────────────────

    fn save_fpu(&mut self, into: &mut FpuState);
    fn restore_fpu(&mut self, from: &FpuState);

    // ── Context ─────────────────────────────────────────────────

    /// Capture the interrupted context (`live`) and the FPU into a task record.
    fn save_context(&mut self, live: &CpuSaveState, into: &mut CpuSaveState, fpu: &mut FpuState) {
        *into = *live;
        self.save_fpu(fpu);
    }

    /// Load a task record into the trap frame that will be resumed.
    fn restore_context(&mut self, from: &CpuSaveState, fpu: &FpuState, live: &mut CpuSaveState) {
        self.restore_fpu(fpu);
        *live = *from;
    }

    // ── Paging ──────────────────────────────────────────────────

    /// The page-table root the boot loader left active, if any.
    fn active_root(&self) -> Option<PhysAddr>;

    fn zero_frame(&mut self, frame: Frame);
    fn read_table_entry(&self, table: PhysAddr, index: usize) -> PageTableEntry;
    fn write_table_entry(&mut self, table: PhysAddr, index: usize, entry: PageTableEntry);
    fn invalidate_page(&mut self, page: VirtAddr);

    /// Make `root` the active translation root.
    fn install_address_space(&mut self, root: PhysAddr);

    // ── Control transfer ────────────────────────────────────────

    /// Address new tasks start executing at. The trampoline receives the
    /// task slot in the first argument register, runs the task's entry
    /// function and exits the task when it returns.
    fn entry_trampoline(&self) -> u64;

    /// Note that a reschedule is wanted. The backend raises the trap once
    /// the kernel instance is no longer borrowed, since the trap re-enters it.
    fn request_reschedule(&mut self);

    /// Stop the machine.
    fn halt(&mut self) -> !;
}
