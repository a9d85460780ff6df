// =============================================================================
// NanoCore — Page Table Entries
// =============================================================================
//
// Types for the x86_64 4-level page table format. The core never touches
// table memory directly: every read and write goes through the platform
// (`Platform::read_table_entry` / `write_table_entry`), which on bare metal
// reaches the table through the HHDM and in the hosted build keeps a map.
//
//   ```text
//   63  62..52  51..12       11..9   8   7   6   5   4   3   2   1   0
//   ┌───┬──────┬────────────┬───────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//   │NXE│ Avail│ Phys Addr  │ Avail │ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//   └───┴──────┴────────────┴───────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//   ```
//
// A heap slot descriptor IS a leaf entry: present + writable + user plus the
// frame address. The slot tables keep a shadow copy so the core can scan for
// free runs without walking hardware tables.
//
// =============================================================================

use bitflags::bitflags;

use crate::arch::Platform;
use crate::memory::address::{Frame, PhysAddr, VirtAddr};

/// Entries in one table at any level.
pub const ENTRIES_PER_TABLE: usize = 512;

bitflags! {
    /// x86_64 page table entry flags.
    ///
    /// Intermediate tables are permissive; restrictions live at the leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Page is present in physical memory.
        const PRESENT       = 1 << 0;
        /// Page is writable. If clear, writes cause a page fault.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (Ring 3).
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        /// Set by the CPU on any access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on a write.
        const DIRTY         = 1 << 6;
        /// 2 MiB page in a PD entry, 1 GiB page in a PDPT entry.
        const HUGE_PAGE     = 1 << 7;
        /// TLB entry survives CR3 switches.
        const GLOBAL        = 1 << 8;
        /// Instruction fetches cause a page fault.
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageTableFlags {
    /// Flags for a heap slot. Both windows are user-accessible: tasks of a
    /// process call straight into kernel-heap objects.
    pub const HEAP_SLOT: Self =
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Flags for an intermediate (non-leaf) entry in the kernel half.
    pub const INTERMEDIATE: Self =
        Self::PRESENT.union(Self::WRITABLE);

    /// Same as INTERMEDIATE but also allows user-mode access.
    pub const INTERMEDIATE_USER: Self =
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

/// A single entry in an x86_64 page table.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

/// Bits 12 through 51 hold the physical page frame number.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    /// A non-present (zeroed) entry.
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub fn new(addr: PhysAddr, flags: PageTableFlags) -> Self {
        let mut entry = Self::EMPTY;
        entry.set(addr, flags);
        entry
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Physical address stored in this entry. Only meaningful if present.
    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn frame(self) -> Frame {
        Frame::containing(self.addr())
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
    }

    /// Sets this entry to map `addr` with the given `flags`.
    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(
            addr.is_page_aligned(),
            "page table entry address must be page-aligned"
        );
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

/// In-memory layout of one table, for backends that access tables directly.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Walks the page tables rooted at `root` and translates `virt`.
///
/// # Returns
/// `Some(PhysAddr)` — the physical address (including page offset).
/// `None` — the address is not mapped.
pub fn translate<P: Platform + ?Sized>(platform: &P, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let indices = virt.page_table_indices();

    let pml4_entry = platform.read_table_entry(root, indices[3] as usize);
    if !pml4_entry.is_present() {
        return None;
    }

    let pdpt_entry = platform.read_table_entry(pml4_entry.addr(), indices[2] as usize);
    if !pdpt_entry.is_present() {
        return None;
    }
    if pdpt_entry.is_huge() {
        let gib_offset = virt.as_u64() & 0x3FFF_FFFF;
        return Some(PhysAddr::new((pdpt_entry.addr().as_u64() & !0x3FFF_FFFF) + gib_offset));
    }

    let pd_entry = platform.read_table_entry(pdpt_entry.addr(), indices[1] as usize);
    if !pd_entry.is_present() {
        return None;
    }
    if pd_entry.is_huge() {
        let mib_offset = virt.as_u64() & 0x1F_FFFF;
        return Some(PhysAddr::new((pd_entry.addr().as_u64() & !0x1F_FFFF) + mib_offset));
    }

    let pt_entry = platform.read_table_entry(pd_entry.addr(), indices[0] as usize);
    if !pt_entry.is_present() {
        return None;
    }

    Some(pt_entry.addr() + virt.page_offset() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keeps_address_and_flags_apart() {
        let entry = PageTableEntry::new(PhysAddr::new(0x7000), PageTableFlags::HEAP_SLOT);
        assert!(entry.is_present());
        assert_eq!(entry.addr(), PhysAddr::new(0x7000));
        assert_eq!(entry.frame().number(), 7);
        assert_eq!(entry.flags(), PageTableFlags::HEAP_SLOT);
        assert_eq!(entry.raw(), 0x7007);
    }

    #[test]
    fn cleared_entry_is_not_present() {
        let mut entry = PageTableEntry::new(PhysAddr::new(0x1000), PageTableFlags::INTERMEDIATE);
        entry.clear();
        assert!(!entry.is_present());
        assert_eq!(entry, PageTableEntry::EMPTY);
    }

    #[test]
    fn no_execute_survives_the_address_mask() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x2000),
            PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE,
        );
        assert_eq!(entry.addr(), PhysAddr::new(0x2000));
        assert!(entry.flags().contains(PageTableFlags::NO_EXECUTE));
    }
}
