// =============================================================================
// NanoCore — Physical and Virtual Address Types
// =============================================================================
//
// Confusing a physical address with a virtual one is the classic kernel
// memory bug: the write lands somewhere unrelated and the crash shows up
// much later. PhysAddr, VirtAddr and Frame are separate newtypes so the
// compiler rejects those mix-ups; converting requires an explicit call.
//
// x86_64 ADDRESS SPACE:
//   - Physical: 52 bits max
//   - Virtual: 48 bits used (the "canonical" range), 16 bits sign-extended
//     - Lower half: 0x0000_0000_0000_0000 — 0x0000_7FFF_FFFF_FFFF (user slots)
//     - Upper half: 0xFFFF_8000_0000_0000 — 0xFFFF_FFFF_FFFF_FFFF (kernel slots)
//
// =============================================================================

use core::fmt;

/// Size of a standard page (4 KiB).
pub const PAGE_SIZE: u64 = 4096;

const PAGE_SHIFT: u64 = 12;

// =============================================================================
// PhysAddr — A physical memory address
// =============================================================================

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Creates a new physical address.
    ///
    /// # Panics
    /// Debug-asserts that the address fits in 52 bits.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(
            addr & 0xFFF0_0000_0000_0000 == 0,
            "Physical address exceeds 52-bit limit"
        );
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }
}

/// The `P:` prefix distinguishes physical addresses in log output.
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

// =============================================================================
// VirtAddr — A virtual memory address
// =============================================================================

/// A virtual memory address.
///
/// Virtual addresses go through the page table translation
/// (PML4 → PDPT → PD → PT) to produce a physical address. Bits 48-63 must
/// be copies of bit 47; anything else faults when used.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Creates a new virtual address.
    ///
    /// # Panics
    /// Debug-asserts that the address is canonical.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        // Sign-extend bit 47 across bits 48-63 and compare.
        let canonical = ((addr << 16) as i64 >> 16) as u64;
        debug_assert!(addr == canonical, "Non-canonical virtual address");
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns true if this is a kernel-space address (upper half).
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= 0xFFFF_8000_0000_0000
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }

    /// Extracts the page table indices from this virtual address.
    ///
    /// ```text
    /// 63       48 47    39 38    30 29    21 20    12 11       0
    /// ┌──────────┬────────┬────────┬────────┬────────┬─────────┐
    /// │ sign ext │ PML4   │  PDPT  │   PD   │   PT   │ Offset  │
    /// └──────────┴────────┴────────┴────────┴────────┴─────────┘
    ///              idx[3]   idx[2]   idx[1]   idx[0]
    /// ```
    ///
    /// # Returns
    /// `[PT index, PD index, PDPT index, PML4 index]`
    #[inline]
    pub const fn page_table_indices(self) -> [u16; 4] {
        [
            ((self.0 >> 12) & 0x1FF) as u16,
            ((self.0 >> 21) & 0x1FF) as u16,
            ((self.0 >> 30) & 0x1FF) as u16,
            ((self.0 >> 39) & 0x1FF) as u16,
        ]
    }

    #[inline]
    pub const fn page_offset(self) -> u16 {
        (self.0 & 0xFFF) as u16
    }
}

/// Display a virtual address with `V:` prefix to distinguish from physical.
impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl core::ops::Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: VirtAddr) -> u64 {
        self.0 - other.0
    }
}

// =============================================================================
// Frame — A 4 KiB physical page frame
// =============================================================================

/// A physical page frame, identified by its frame number.
///
/// Frame `n` covers physical bytes `n * 4096 .. (n + 1) * 4096`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Frame(u64);

impl Frame {
    #[inline]
    pub const fn from_number(number: u64) -> Self {
        Self(number)
    }

    /// The frame that contains `addr`.
    #[inline]
    pub const fn containing(addr: PhysAddr) -> Self {
        Self(addr.as_u64() >> PAGE_SHIFT)
    }

    #[inline]
    pub const fn number(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn start_address(self) -> PhysAddr {
        PhysAddr::new(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame#{}({})", self.0, self.start_address())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_window_indices() {
        let addr = VirtAddr::new(0xFFFF_8080_0000_0000 + 513 * PAGE_SIZE + 0x10);
        assert_eq!(addr.page_table_indices(), [1, 1, 0, 257]);
        assert_eq!(addr.page_offset(), 0x10);
        assert!(addr.is_kernel());
    }

    #[test]
    fn frame_round_trips_through_physical_address() {
        let frame = Frame::containing(PhysAddr::new(0x5123));
        assert_eq!(frame.number(), 5);
        assert_eq!(frame.start_address(), PhysAddr::new(0x5000));
    }

    #[test]
    fn log_prefixes() {
        assert_eq!(format!("{}", PhysAddr::new(0x1000)), "P:0x00001000");
        assert_eq!(format!("{}", VirtAddr::new(0x4000_0000)), "V:0x0000000040000000");
    }
}
