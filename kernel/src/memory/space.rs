// =============================================================================
// NanoCore — Address Spaces and Slot Tables
// =============================================================================
//
// An address space is a slot window: a fixed array of page-sized slots at a
// fixed virtual base, each either empty or mapped to one physical frame.
//
//   slot i  ↔  virtual address  base + i * 4096
//
// The slot table doubles as the leaf page tables of the window. Every
// change to a slot descriptor is written through to the platform so that
// the hardware view and the shadow copy here never disagree.
//
// An allocation covers a run of consecutive slots. The run length is stored
// on the first slot only; the other slots of the run record 0.
//
// PAGING STRUCTURE:
//   The window sits inside one 1 GiB-aligned region, so it needs exactly
//   one PDPT entry in the root, one PD, and ceil(slots / 512) leaf tables:
//
//     root[pml4] → PDPT[pdpt] → PD[pd + i] → table i → slots 512*i ..
//
// =============================================================================

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::panic::Location;

use crate::arch::Platform;
use crate::memory::address::{Frame, PAGE_SIZE, PhysAddr, VirtAddr};
use crate::memory::paging::{ENTRIES_PER_TABLE, PageTableEntry, PageTableFlags};

/// Handle of an address space in the heap manager's arena.
///
/// The generation changes every time an arena entry is reused, so a handle
/// to a destroyed space never resolves to its successor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId {
    index: u32,
    generation: u32,
}

impl SpaceId {
    /// The kernel address space. It exists from boot and is never destroyed.
    pub const KERNEL: SpaceId = SpaceId { index: 0, generation: 0 };

    pub(crate) const fn new(index: usize, generation: u32) -> Self {
        Self { index: index as u32, generation }
    }

    pub const fn index(self) -> usize {
        self.index as usize
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }

    pub const fn is_kernel(self) -> bool {
        self.index == 0
    }
}

impl Default for SpaceId {
    fn default() -> Self {
        Self::KERNEL
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_kernel() {
            write!(f, "kernel-heap")
        } else {
            write!(f, "heap#{}.{}", self.index, self.generation)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotInfo {
    /// Pages in the allocation this slot starts, 0 if it does not start one.
    run: usize,
    site: Option<&'static Location<'static>>,
}

/// One present slot, as reported by [`AddressSpace::slots`].
#[derive(Debug, Clone, Copy)]
pub struct SlotView {
    pub slot: usize,
    pub address: VirtAddr,
    pub frame: Frame,
    pub flags: PageTableFlags,
    pub run: usize,
    pub site: Option<&'static Location<'static>>,
}

pub struct AddressSpace {
    kind: SpaceKind,
    base: VirtAddr,
    root: PhysAddr,
    tables: Vec<PhysAddr>,
    /// Kernel-heap pages backing this space's own paging structures.
    backing: Vec<VirtAddr>,
    entries: Vec<PageTableEntry>,
    info: Vec<SlotInfo>,
    present: usize,
}

impl AddressSpace {
    pub(crate) fn new(
        kind: SpaceKind,
        base: VirtAddr,
        slot_count: usize,
        root: PhysAddr,
        tables: Vec<PhysAddr>,
        backing: Vec<VirtAddr>,
    ) -> Self {
        debug_assert!(tables.len() * ENTRIES_PER_TABLE >= slot_count);
        Self {
            kind,
            base,
            root,
            tables,
            backing,
            entries: vec![PageTableEntry::EMPTY; slot_count],
            info: vec![SlotInfo::default(); slot_count],
            present: 0,
        }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Physical address of the translation root.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    pub fn present_slots(&self) -> usize {
        self.present
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.slot_of(addr).is_some()
    }

    /// Slot index covering `addr`, if it falls inside the window.
    pub fn slot_of(&self, addr: VirtAddr) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let slot = ((addr - self.base) / PAGE_SIZE) as usize;
        (slot < self.entries.len()).then_some(slot)
    }

    pub fn address_of(&self, slot: usize) -> VirtAddr {
        self.base + slot as u64 * PAGE_SIZE
    }

    pub fn entry(&self, slot: usize) -> PageTableEntry {
        self.entries[slot]
    }

    pub fn is_present(&self, slot: usize) -> bool {
        self.entries[slot].is_present()
    }

    /// Pages in the allocation starting at `slot`, or 0.
    pub fn run_length(&self, slot: usize) -> usize {
        self.info[slot].run
    }

    pub fn allocation_site(&self, slot: usize) -> Option<&'static Location<'static>> {
        self.info[slot].site
    }

    pub(crate) fn find_free_slot(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_present())
    }

    /// First run of `pages` consecutive free slots.
    pub(crate) fn find_free_run(&self, pages: usize) -> Option<usize> {
        let pages = pages.max(1);
        let mut start = 0;
        while start + pages <= self.entries.len() {
            // Skip past the last taken slot in the candidate run.
            match (start..start + pages).rev().find(|&s| self.entries[s].is_present()) {
                Some(taken) => start = taken + 1,
                None => return Some(start),
            }
        }
        None
    }

    /// Map `slot` to `frame` and write the descriptor through to the hardware table.
    pub(crate) fn map_slot<P: Platform + ?Sized>(
        &mut self,
        slot: usize,
        frame: Frame,
        site: &'static Location<'static>,
        platform: &mut P,
    ) {
        debug_assert!(!self.entries[slot].is_present(), "slot {slot} is already mapped");
        let entry = PageTableEntry::new(frame.start_address(), PageTableFlags::HEAP_SLOT);
        self.entries[slot] = entry;
        self.info[slot] = SlotInfo { run: 0, site: Some(site) };
        self.present += 1;
        self.write_through(slot, platform);
    }

    /// Clear `slot`, returning the frame it held.
    pub(crate) fn unmap_slot<P: Platform + ?Sized>(&mut self, slot: usize, platform: &mut P) -> Option<Frame> {
        let entry = self.entries[slot];
        if !entry.is_present() {
            return None;
        }
        self.entries[slot] = PageTableEntry::EMPTY;
        self.info[slot] = SlotInfo::default();
        self.present -= 1;
        self.write_through(slot, platform);
        Some(entry.frame())
    }

    pub(crate) fn set_run(&mut self, slot: usize, pages: usize) {
        self.info[slot].run = pages;
    }

    fn write_through<P: Platform + ?Sized>(&self, slot: usize, platform: &mut P) {
        let table = self.tables[slot / ENTRIES_PER_TABLE];
        platform.write_table_entry(table, slot % ENTRIES_PER_TABLE, self.entries[slot]);
        platform.invalidate_page(self.address_of(slot));
    }

    /// Every present slot, in slot order.
    pub fn slots(&self) -> impl Iterator<Item = SlotView> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_present())
            .map(|(slot, e)| SlotView {
                slot,
                address: self.address_of(slot),
                frame: e.frame(),
                flags: e.flags(),
                run: self.info[slot].run,
                site: self.info[slot].site,
            })
    }

    /// Frames held by every present slot. Used when the whole space is torn
    /// down, so the hardware tables are not updated.
    pub(crate) fn drain_frames(&mut self) -> Vec<Frame> {
        let frames = self.entries.iter().filter(|e| e.is_present()).map(|e| e.frame()).collect();
        self.entries.fill(PageTableEntry::EMPTY);
        self.info.fill(SlotInfo::default());
        self.present = 0;
        frames
    }

    pub(crate) fn backing(&self) -> &[VirtAddr] {
        &self.backing
    }

    /// Link root → PDPT → PD → leaf tables for this window.
    ///
    /// All four kinds of table must already be zeroed.
    pub(crate) fn install_hierarchy<P: Platform + ?Sized>(&self, pdpt: PhysAddr, pd: PhysAddr, platform: &mut P) {
        let [_, pd_index, pdpt_index, pml4_index] = self.base.page_table_indices();
        let flags = match self.kind {
            SpaceKind::Kernel => PageTableFlags::INTERMEDIATE,
            SpaceKind::User => PageTableFlags::INTERMEDIATE_USER,
        };
        platform.write_table_entry(self.root, pml4_index as usize, PageTableEntry::new(pdpt, flags));
        platform.write_table_entry(pdpt, pdpt_index as usize, PageTableEntry::new(pd, flags));
        for (i, table) in self.tables.iter().enumerate() {
            // Leaf tables are reachable from ring 3 in both windows; the
            // slot descriptors decide the final permission.
            let entry = PageTableEntry::new(*table, PageTableFlags::INTERMEDIATE_USER);
            platform.write_table_entry(pd, pd_index as usize + i, entry);
        }
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("root", &self.root)
            .field("slots", &self.entries.len())
            .field("present", &self.present)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::HostedPlatform;

    fn space(slots: usize) -> AddressSpace {
        let tables = (0..slots.div_ceil(ENTRIES_PER_TABLE))
            .map(|i| PhysAddr::new(0x10_0000 + i as u64 * PAGE_SIZE))
            .collect();
        AddressSpace::new(SpaceKind::User, VirtAddr::new(0x4000_0000), slots, PhysAddr::new(0x1000), tables, Vec::new())
    }

    #[test]
    fn window_arithmetic() {
        let s = space(600);
        assert_eq!(s.slot_of(VirtAddr::new(0x4000_0000)), Some(0));
        assert_eq!(s.slot_of(VirtAddr::new(0x4000_0000 + 599 * 4096 + 12)), Some(599));
        assert_eq!(s.slot_of(VirtAddr::new(0x4000_0000 + 600 * 4096)), None);
        assert_eq!(s.slot_of(VirtAddr::new(0x3FFF_F000)), None);
        assert_eq!(s.address_of(2), VirtAddr::new(0x4000_2000));
    }

    #[test]
    fn free_run_skips_past_taken_slots() {
        let mut hw = HostedPlatform::new();
        let mut s = space(16);
        let here = Location::caller();
        for slot in [2, 5, 6] {
            s.map_slot(slot, Frame::from_number(100 + slot as u64), here, &mut hw);
        }
        assert_eq!(s.find_free_slot(), Some(0));
        assert_eq!(s.find_free_run(2), Some(0));
        assert_eq!(s.find_free_run(3), Some(7));
        assert_eq!(s.find_free_run(9), Some(7));
        assert_eq!(s.find_free_run(10), None);
    }

    #[test]
    fn slot_descriptor_reaches_the_leaf_table() {
        let mut hw = HostedPlatform::new();
        let mut s = space(1024);
        let here = Location::caller();
        s.map_slot(513, Frame::from_number(42), here, &mut hw);
        let leaf = hw.read_table_entry(PhysAddr::new(0x10_1000), 1);
        assert_eq!(leaf.frame(), Frame::from_number(42));
        assert_eq!(s.present_slots(), 1);

        assert_eq!(s.unmap_slot(513, &mut hw), Some(Frame::from_number(42)));
        assert!(!hw.read_table_entry(PhysAddr::new(0x10_1000), 1).is_present());
        assert_eq!(s.unmap_slot(513, &mut hw), None);
        assert_eq!(hw.invalidations(), 2);
    }

    #[test]
    fn hierarchy_translates_slot_addresses() {
        let mut hw = HostedPlatform::new();
        let mut s = space(1024);
        let (pdpt, pd) = (PhysAddr::new(0x2000), PhysAddr::new(0x3000));
        s.install_hierarchy(pdpt, pd, &mut hw);
        s.map_slot(700, Frame::from_number(77), Location::caller(), &mut hw);
        let addr = s.address_of(700) + 0x44;
        assert_eq!(hw.translate(s.root(), addr), Some(PhysAddr::new(77 * 4096 + 0x44)));
    }
}
