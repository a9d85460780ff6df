// =============================================================================
// NanoCore — Hosted Platform
// =============================================================================
//
// A deterministic stand-in for the CPU, used to run the whole core under the
// host test harness:
//
//   - page tables live in a map keyed by (table frame, index)
//   - the cycle counter advances by a fixed step on every read
//   - each FPU save produces a distinct image, so tests can see which
//     image was restored on a switch
//   - halting panics, which `#[should_panic]` tests observe
//
// It also records what the core asked of the hardware (installed roots,
// reschedule requests, table writes made with interrupts enabled) so tests
// can assert on it.
//
// =============================================================================

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::{FpuState, Platform};
use crate::memory::address::{Frame, PhysAddr, VirtAddr};
use crate::memory::paging::{self, PageTableEntry};

/// Trampoline address reported to new tasks.
pub const HOSTED_TRAMPOLINE: u64 = 0xFFFF_FFFF_8000_0000;

/// Cycles added per `cycle_counter` read.
pub const CYCLES_PER_READ: u64 = 1000;

#[derive(Debug, Default)]
pub struct HostedPlatform {
    interrupts: bool,
    cycles: u64,
    tables: BTreeMap<(u64, usize), PageTableEntry>,
    installed: Vec<PhysAddr>,
    invalidations: usize,
    reschedule_requests: usize,
    unmasked_writes: usize,
    fpu_generation: u32,
    last_restored_fpu: Option<u32>,
}

impl HostedPlatform {
    /// A platform with interrupts enabled, as after boot.
    pub fn new() -> Self {
        Self {
            interrupts: true,
            ..Self::default()
        }
    }

    /// Translate through the simulated tables rooted at `root`.
    pub fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        paging::translate(self, root, virt)
    }

    /// The root most recently installed.
    pub fn installed_root(&self) -> Option<PhysAddr> {
        self.installed.last().copied()
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations
    }

    pub fn reschedule_requests(&self) -> usize {
        self.reschedule_requests
    }

    /// Page-table writes performed while interrupts were enabled.
    pub fn unmasked_writes(&self) -> usize {
        self.unmasked_writes
    }

    /// Generation stamp stored in an image produced by `save_fpu`.
    pub fn fpu_generation(fpu: &FpuState) -> u32 {
        u32::from_le_bytes([fpu.bytes[160], fpu.bytes[161], fpu.bytes[162], fpu.bytes[163]])
    }

    /// Generation of the image most recently restored, `0` for a power-on image.
    pub fn last_restored_fpu(&self) -> Option<u32> {
        self.last_restored_fpu
    }

    /// Number of table entries currently present, across all tables.
    pub fn present_entries(&self) -> usize {
        self.tables.values().filter(|e| e.is_present()).count()
    }
}

impl Platform for HostedPlatform {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    fn disable_interrupts(&mut self) {
        self.interrupts = false;
    }

    fn enable_interrupts(&mut self) {
        self.interrupts = true;
    }

    fn cycle_counter(&mut self) -> u64 {
        self.cycles += CYCLES_PER_READ;
        self.cycles
    }

    fn save_fpu(&mut self, into: &mut FpuState) {
        // XMM0 lives at offset 160 in the fxsave image.
        self.fpu_generation += 1;
        into.bytes[160..164].copy_from_slice(&self.fpu_generation.to_le_bytes());
    }

    fn restore_fpu(&mut self, from: &FpuState) {
        self.last_restored_fpu = Some(Self::fpu_generation(from));
    }

    fn active_root(&self) -> Option<PhysAddr> {
        None
    }

    fn zero_frame(&mut self, frame: Frame) {
        let table = frame.start_address().as_u64();
        self.tables.retain(|&(t, _), _| t != table);
    }

    fn read_table_entry(&self, table: PhysAddr, index: usize) -> PageTableEntry {
        self.tables
            .get(&(table.as_u64(), index))
            .copied()
            .unwrap_or(PageTableEntry::EMPTY)
    }

    fn write_table_entry(&mut self, table: PhysAddr, index: usize, entry: PageTableEntry) {
        if self.interrupts {
            self.unmasked_writes += 1;
        }
        if entry.is_present() {
            self.tables.insert((table.as_u64(), index), entry);
        } else {
            self.tables.remove(&(table.as_u64(), index));
        }
    }

    fn invalidate_page(&mut self, _page: VirtAddr) {
        self.invalidations += 1;
    }

    fn install_address_space(&mut self, root: PhysAddr) {
        self.installed.push(root);
    }

    fn entry_trampoline(&self) -> u64 {
        HOSTED_TRAMPOLINE
    }

    fn request_reschedule(&mut self) {
        self.reschedule_requests += 1;
    }

    fn halt(&mut self) -> ! {
        panic!("system halted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::PageTableFlags;

    #[test]
    fn translate_walks_all_four_levels() {
        let mut hw = HostedPlatform::new();
        let virt = VirtAddr::new(0x4000_0000 + 3 * 4096 + 0x20);
        let [pt, pd, pdpt, pml4] = virt.page_table_indices();
        let flags = PageTableFlags::INTERMEDIATE_USER;
        hw.write_table_entry(PhysAddr::new(0x1000), pml4 as usize, PageTableEntry::new(PhysAddr::new(0x2000), flags));
        hw.write_table_entry(PhysAddr::new(0x2000), pdpt as usize, PageTableEntry::new(PhysAddr::new(0x3000), flags));
        hw.write_table_entry(PhysAddr::new(0x3000), pd as usize, PageTableEntry::new(PhysAddr::new(0x4000), flags));
        hw.write_table_entry(PhysAddr::new(0x4000), pt as usize, PageTableEntry::new(PhysAddr::new(0x9000), PageTableFlags::HEAP_SLOT));

        assert_eq!(hw.translate(PhysAddr::new(0x1000), virt), Some(PhysAddr::new(0x9020)));
        assert_eq!(hw.translate(PhysAddr::new(0x1000), virt + 4096), None);
        assert_eq!(hw.unmasked_writes(), 4);
    }

    #[test]
    fn zeroing_a_frame_drops_its_entries() {
        let mut hw = HostedPlatform::new();
        hw.disable_interrupts();
        let entry = PageTableEntry::new(PhysAddr::new(0x5000), PageTableFlags::HEAP_SLOT);
        hw.write_table_entry(PhysAddr::new(0x1000), 7, entry);
        assert_eq!(hw.present_entries(), 1);
        hw.zero_frame(Frame::from_number(1));
        assert_eq!(hw.read_table_entry(PhysAddr::new(0x1000), 7), PageTableEntry::EMPTY);
        assert_eq!(hw.unmasked_writes(), 0);
    }

    #[test]
    fn every_fpu_save_is_distinguishable() {
        let mut hw = HostedPlatform::new();
        let mut a = FpuState::initial();
        let mut b = FpuState::initial();
        hw.save_fpu(&mut a);
        hw.save_fpu(&mut b);
        assert_ne!(HostedPlatform::fpu_generation(&a), HostedPlatform::fpu_generation(&b));
        hw.restore_fpu(&a);
        assert_eq!(hw.last_restored_fpu(), Some(HostedPlatform::fpu_generation(&a)));
    }

    #[test]
    #[should_panic(expected = "system halted")]
    fn halt_is_fatal() {
        HostedPlatform::new().halt();
    }
}
