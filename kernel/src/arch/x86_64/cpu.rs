// =============================================================================
// NanoCore — x86_64 Platform
// =============================================================================
//
// The `Platform` implementation for real hardware. Thin wrappers around
// privileged instructions, mostly through the `x86_64` crate:
//
//   interrupts   — RFLAGS.IF via cli / sti
//   time         — RDTSC
//   FPU          — FXSAVE64 / FXRSTOR64 into a 512-byte, 16-aligned image
//   paging       — table frames are reached through the HHDM window Limine
//                  maps over all physical memory; CR3 installs a root,
//                  INVLPG flushes one page
//   control      — the reschedule trap is raised lazily (see mod.rs), HLT
//
// Only one core runs the kernel; SMP bring-up is not part of this core.
//
// =============================================================================

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::{hlt, interrupts, tlb};
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;

use crate::arch::{FpuState, Platform};
use crate::memory::address::{Frame, PAGE_SIZE, PhysAddr, VirtAddr};
use crate::memory::paging::{ENTRIES_PER_TABLE, PageTableEntry};
use crate::sync::irq::IrqControl;

/// Set by `request_reschedule`; the trap is raised once the global kernel
/// lock has been released.
pub(super) static RESCHEDULE_PENDING: AtomicBool = AtomicBool::new(false);

/// The bare-metal platform.
pub struct X86_64 {
    /// Virtual address at which physical address 0 is mapped.
    hhdm_offset: u64,
}

impl X86_64 {
    /// # Safety
    ///
    /// `hhdm_offset` must map all physical memory, as reported by the boot
    /// loader. Every page-table access goes through it.
    pub const unsafe fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    fn table(&self, table: PhysAddr) -> *mut PageTableEntry {
        (self.hhdm_offset + table.as_u64()) as *mut PageTableEntry
    }
}

impl Platform for X86_64 {
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn disable_interrupts(&mut self) {
        interrupts::disable();
    }

    fn enable_interrupts(&mut self) {
        interrupts::enable();
    }

    fn cycle_counter(&mut self) -> u64 {
        // SAFETY: RDTSC is available on every x86_64 CPU and has no side
        // effects.
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn save_fpu(&mut self, into: &mut FpuState) {
        // SAFETY: FpuState is 512 bytes and 16-byte aligned, as FXSAVE
        // requires.
        unsafe {
            core::arch::asm!(
                "fxsave64 [{}]",
                in(reg) into.bytes.as_mut_ptr(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn restore_fpu(&mut self, from: &FpuState) {
        // SAFETY: the image was produced by FXSAVE or `FpuState::initial`,
        // both of which hold valid reserved bits.
        unsafe {
            core::arch::asm!(
                "fxrstor64 [{}]",
                in(reg) from.bytes.as_ptr(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn active_root(&self) -> Option<PhysAddr> {
        let (frame, _) = Cr3::read();
        Some(PhysAddr::new(frame.start_address().as_u64()))
    }

    fn zero_frame(&mut self, frame: Frame) {
        let page = (self.hhdm_offset + frame.start_address().as_u64()) as *mut u8;
        // SAFETY: the frame is owned by the caller and mapped through the
        // HHDM window.
        unsafe { ptr::write_bytes(page, 0, PAGE_SIZE as usize) };
    }

    fn read_table_entry(&self, table: PhysAddr, index: usize) -> PageTableEntry {
        debug_assert!(index < ENTRIES_PER_TABLE);
        // SAFETY: `table` is a page-table frame and `index` is in range.
        unsafe { ptr::read_volatile(self.table(table).add(index)) }
    }

    fn write_table_entry(&mut self, table: PhysAddr, index: usize, entry: PageTableEntry) {
        debug_assert!(index < ENTRIES_PER_TABLE);
        // SAFETY: as above; the caller masks interrupts and flushes the TLB.
        unsafe { ptr::write_volatile(self.table(table).add(index), entry) }
    }

    fn invalidate_page(&mut self, page: VirtAddr) {
        tlb::flush(x86_64::VirtAddr::new(page.as_u64()));
    }

    fn install_address_space(&mut self, root: PhysAddr) {
        let (current, flags) = Cr3::read();
        if current.start_address().as_u64() == root.as_u64() {
            return;
        }
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
        // SAFETY: every root built by the heap manager shares the kernel's
        // upper half, so the code executing this stays mapped.
        unsafe { Cr3::write(frame, flags) };
    }

    fn entry_trampoline(&self) -> u64 {
        super::switch::task_trampoline as usize as u64
    }

    fn request_reschedule(&mut self) {
        RESCHEDULE_PENDING.store(true, Ordering::Release);
    }

    fn halt(&mut self) -> ! {
        loop {
            interrupts::disable();
            hlt();
        }
    }
}

/// Interrupt control for the statically allocated kernel lock.
pub struct X86Irq;

impl IrqControl for X86Irq {
    fn save_and_disable() -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }

    fn restore(was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }
}
