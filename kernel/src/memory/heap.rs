// =============================================================================
// NanoCore — Slot Heap Manager
// =============================================================================
//
// Owns the frame allocator and every address space, and implements the
// page-granular allocator on top of them:
//
//   allocate(size)  → ceil(size / 4096) consecutive free slots in the
//                     active space, each backed by a fresh frame
//   free(ptr)       → unmap the run that starts at ptr, return its frames
//
// FRAME ACCOUNTING:
//   The kernel window's own paging structures are taken straight from the
//   frame allocator at bring-up and never returned (the boot baseline).
//   After that, every used frame belongs to exactly one present slot:
//
//     used_frames == boot_reserved_frames + Σ present slots
//
//   User address spaces keep that true by building their paging structures
//   out of single-page kernel-heap allocations.
//
// Allocation is all-or-nothing: if the frames run out halfway through a
// run, the slots mapped so far are rolled back.
//
// =============================================================================

use alloc::vec::Vec;
use core::panic::Location;

use crate::arch::Platform;
use crate::config::{
    KERNEL_HALF_START, KERNEL_HEAP_BASE, MAX_USER_HEAP_SLOTS, MAX_WINDOW_SLOTS, MIN_USER_HEAP_SLOTS,
    USER_HEAP_BASE,
};
use crate::error::MemoryError;
use crate::memory::address::{Frame, PAGE_SIZE, PhysAddr, VirtAddr};
use crate::memory::paging::ENTRIES_PER_TABLE;
use crate::memory::pmm::FrameAllocator;
use crate::memory::space::{AddressSpace, SlotView, SpaceId, SpaceKind};

/// Pages needed to hold `size` bytes; a zero-byte request still takes one.
pub fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE as usize).max(1)
}

pub struct HeapManager {
    frames: FrameAllocator,
    /// Arena of address spaces; index 0 is the kernel.
    spaces: Vec<Option<AddressSpace>>,
    generations: Vec<u32>,
    active: SpaceId,
    boot_reserved: usize,
}

impl HeapManager {
    /// Bring up the kernel slot window.
    ///
    /// The kernel root is the one the boot loader left active, or a fresh
    /// frame when the platform has none (hosted).
    pub fn new<P: Platform + ?Sized>(
        mut frames: FrameAllocator,
        kernel_slots: usize,
        platform: &mut P,
    ) -> Result<Self, MemoryError> {
        if kernel_slots == 0 || kernel_slots > MAX_WINDOW_SLOTS {
            return Err(MemoryError::HeapTooLarge { slots: kernel_slots });
        }

        let mut take = |platform: &mut P| -> Result<PhysAddr, MemoryError> {
            let frame = frames.alloc().ok_or(MemoryError::OutOfMemory)?;
            platform.zero_frame(frame);
            Ok(frame.start_address())
        };

        let root = match platform.active_root() {
            Some(root) => root,
            None => take(platform)?,
        };
        let pdpt = take(platform)?;
        let pd = take(platform)?;
        let tables = (0..kernel_slots.div_ceil(ENTRIES_PER_TABLE))
            .map(|_| take(platform))
            .collect::<Result<Vec<_>, _>>()?;

        let kernel = AddressSpace::new(
            SpaceKind::Kernel,
            VirtAddr::new(KERNEL_HEAP_BASE),
            kernel_slots,
            root,
            tables,
            Vec::new(),
        );
        kernel.install_hierarchy(pdpt, pd, platform);
        platform.install_address_space(root);

        let boot_reserved = frames.used_frames();
        log::info!(
            "kernel heap: {} slots at {}, root {}, {} frames reserved at boot",
            kernel_slots,
            kernel.base(),
            root,
            boot_reserved,
        );

        let mut spaces = Vec::new();
        spaces.push(Some(kernel));
        Ok(Self {
            frames,
            spaces,
            generations: alloc::vec![0],
            active: SpaceId::KERNEL,
            boot_reserved,
        })
    }

    // ── Introspection ───────────────────────────────────────────

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// Frames in use before the first slot was mapped.
    pub fn boot_reserved_frames(&self) -> usize {
        self.boot_reserved
    }

    pub fn active(&self) -> SpaceId {
        self.active
    }

    pub fn space(&self, id: SpaceId) -> Option<&AddressSpace> {
        self.spaces
            .get(id.index())
            .filter(|_| self.generations[id.index()] == id.generation())
            .and_then(Option::as_ref)
    }

    pub fn kernel(&self) -> &AddressSpace {
        match self.spaces.first() {
            Some(Some(kernel)) => kernel,
            _ => unreachable!("kernel address space is never removed"),
        }
    }

    /// Present slots across every live address space.
    pub fn present_slots(&self) -> usize {
        self.spaces.iter().flatten().map(AddressSpace::present_slots).sum()
    }

    /// Every live address space with its handle.
    pub fn spaces(&self) -> impl Iterator<Item = (SpaceId, &AddressSpace)> + '_ {
        self.spaces
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (SpaceId::new(i, self.generations[i]), s)))
    }

    /// Every present slot of every space.
    pub fn live_slots(&self) -> impl Iterator<Item = (SpaceId, SlotView)> + '_ {
        self.spaces().flat_map(|(id, space)| space.slots().map(move |view| (id, view)))
    }

    fn space_mut<'a>(
        spaces: &'a mut [Option<AddressSpace>],
        generations: &[u32],
        id: SpaceId,
    ) -> Result<&'a mut AddressSpace, MemoryError> {
        match spaces.get_mut(id.index()) {
            Some(Some(space)) if generations[id.index()] == id.generation() => Ok(space),
            _ => Err(MemoryError::NoSuchAddressSpace(id)),
        }
    }

    // ── Allocation ──────────────────────────────────────────────

    /// Allocate `size` bytes in the active address space.
    #[track_caller]
    pub fn allocate<P: Platform + ?Sized>(&mut self, size: usize, platform: &mut P) -> Result<VirtAddr, MemoryError> {
        self.allocate_in(self.active, size, Location::caller(), platform)
    }

    /// Allocate `size` bytes in a specific space, recording `site` on each slot.
    pub fn allocate_in<P: Platform + ?Sized>(
        &mut self,
        id: SpaceId,
        size: usize,
        site: &'static Location<'static>,
        platform: &mut P,
    ) -> Result<VirtAddr, MemoryError> {
        let pages = pages_for(size);
        let frames = &mut self.frames;
        let space = Self::space_mut(&mut self.spaces, &self.generations, id)?;

        let first = if pages == 1 {
            space.find_free_slot()
        } else {
            space.find_free_run(pages)
        }
        .ok_or(MemoryError::Fragmented { pages })?;

        for i in 0..pages {
            let Some(frame) = frames.alloc() else {
                for slot in first..first + i {
                    if let Some(frame) = space.unmap_slot(slot, platform) {
                        frames.free(frame)?;
                    }
                }
                return Err(MemoryError::OutOfMemory);
            };
            space.map_slot(first + i, frame, site, platform);
        }
        space.set_run(first, pages);
        Ok(space.address_of(first))
    }

    /// Free an allocation of the active address space.
    pub fn free<P: Platform + ?Sized>(&mut self, ptr: VirtAddr, platform: &mut P) -> Result<(), MemoryError> {
        self.check_window(ptr)?;
        self.free_in(self.active, ptr, platform)
    }

    /// Reject a pointer from the other window than the active space's.
    fn check_window(&self, ptr: VirtAddr) -> Result<(), MemoryError> {
        let active = self.active;
        let foreign = if active.is_kernel() {
            ptr.as_u64() >= USER_HEAP_BASE && ptr.as_u64() < USER_HEAP_BASE + (MAX_USER_HEAP_SLOTS as u64) * PAGE_SIZE
        } else {
            self.kernel().contains(ptr)
        };
        if foreign {
            log::warn!("{} does not belong to the active {}", ptr, active);
            return Err(MemoryError::ForeignAddressSpace(ptr));
        }
        Ok(())
    }

    /// Free the run starting exactly at `ptr` in a specific space.
    pub fn free_in<P: Platform + ?Sized>(
        &mut self,
        id: SpaceId,
        ptr: VirtAddr,
        platform: &mut P,
    ) -> Result<(), MemoryError> {
        let frames = &mut self.frames;
        let space = Self::space_mut(&mut self.spaces, &self.generations, id)?;
        let Some(slot) = live_run(space, ptr) else {
            log::warn!("free of {} in {}: not a live allocation", ptr, id);
            return Err(MemoryError::InvalidFree(ptr));
        };
        let run = space.run_length(slot);
        for s in slot..slot + run {
            if let Some(frame) = space.unmap_slot(s, platform) {
                frames.free(frame)?;
            }
        }
        Ok(())
    }

    /// Resize an allocation of the active address space.
    pub fn reallocate<P: Platform + ?Sized>(
        &mut self,
        ptr: VirtAddr,
        size: usize,
        site: &'static Location<'static>,
        platform: &mut P,
    ) -> Result<VirtAddr, MemoryError> {
        self.check_window(ptr)?;
        self.reallocate_in(self.active, ptr, size, site, platform)
    }

    /// Resize the run starting exactly at `ptr` in a specific space.
    ///
    /// Shrinking unmaps the tail. Growing maps fresh frames right after the
    /// run when those slots are free; otherwise the run's frames are
    /// remapped at the start of a large enough free run, so the contents
    /// move without a copy and `ptr` is no longer valid. A failed grow
    /// leaves the allocation as it was.
    pub fn reallocate_in<P: Platform + ?Sized>(
        &mut self,
        id: SpaceId,
        ptr: VirtAddr,
        size: usize,
        site: &'static Location<'static>,
        platform: &mut P,
    ) -> Result<VirtAddr, MemoryError> {
        let pages = pages_for(size);
        let frames = &mut self.frames;
        let space = Self::space_mut(&mut self.spaces, &self.generations, id)?;
        let Some(head) = live_run(space, ptr) else {
            log::warn!("reallocation of {} in {}: not a live allocation", ptr, id);
            return Err(MemoryError::InvalidFree(ptr));
        };
        let old = space.run_length(head);

        if pages <= old {
            for slot in head + pages..head + old {
                if let Some(frame) = space.unmap_slot(slot, platform) {
                    frames.free(frame)?;
                }
            }
            space.set_run(head, pages);
            return Ok(ptr);
        }

        let in_place = head + pages <= space.slot_count() && (head + old..head + pages).all(|s| !space.is_present(s));
        let first = if in_place {
            head
        } else {
            space.find_free_run(pages).ok_or(MemoryError::Fragmented { pages })?
        };

        let mut fresh = Vec::with_capacity(pages - old);
        for _ in old..pages {
            let Some(frame) = frames.alloc() else {
                for frame in fresh {
                    frames.free(frame)?;
                }
                return Err(MemoryError::OutOfMemory);
            };
            fresh.push(frame);
        }

        if first != head {
            for i in 0..old {
                let moved_site = space.allocation_site(head + i).unwrap_or(site);
                if let Some(frame) = space.unmap_slot(head + i, platform) {
                    space.map_slot(first + i, frame, moved_site, platform);
                }
            }
        }
        for (i, frame) in fresh.into_iter().enumerate() {
            space.map_slot(first + old + i, frame, site, platform);
        }
        space.set_run(first, pages);
        Ok(space.address_of(first))
    }

    /// Allocate one page in the kernel space and report its backing frame.
    fn allocate_kernel_page<P: Platform + ?Sized>(
        &mut self,
        site: &'static Location<'static>,
        platform: &mut P,
    ) -> Result<(VirtAddr, Frame), MemoryError> {
        let addr = self.allocate_in(SpaceId::KERNEL, PAGE_SIZE as usize, site, platform)?;
        let kernel = self.kernel();
        let frame = kernel
            .slot_of(addr)
            .map(|slot| kernel.entry(slot).frame())
            .ok_or(MemoryError::InvalidFree(addr))?;
        Ok((addr, frame))
    }

    // ── Address spaces ──────────────────────────────────────────

    /// Make `id` the active space and install its root.
    pub fn use_address_space<P: Platform + ?Sized>(&mut self, id: SpaceId, platform: &mut P) -> Result<(), MemoryError> {
        let root = self.space(id).ok_or(MemoryError::NoSuchAddressSpace(id))?.root();
        self.active = id;
        platform.install_address_space(root);
        Ok(())
    }

    pub fn use_kernel_space<P: Platform + ?Sized>(&mut self, platform: &mut P) {
        self.active = SpaceId::KERNEL;
        platform.install_address_space(self.kernel().root());
    }

    /// Create a user address space with `slot_count` slots.
    ///
    /// Requests below the minimum are rounded up. The new root maps the
    /// whole kernel half, so kernel slots stay reachable after a switch.
    /// The active space is not changed.
    #[track_caller]
    pub fn create_address_space<P: Platform + ?Sized>(
        &mut self,
        slot_count: usize,
        platform: &mut P,
    ) -> Result<SpaceId, MemoryError> {
        self.create_address_space_at(slot_count, Location::caller(), platform)
    }

    pub fn create_address_space_at<P: Platform + ?Sized>(
        &mut self,
        slot_count: usize,
        site: &'static Location<'static>,
        platform: &mut P,
    ) -> Result<SpaceId, MemoryError> {
        let slots = slot_count.max(MIN_USER_HEAP_SLOTS);
        if slots > MAX_USER_HEAP_SLOTS {
            return Err(MemoryError::HeapTooLarge { slots });
        }

        // root + PDPT + PD + leaf tables
        let needed = 3 + slots.div_ceil(ENTRIES_PER_TABLE);
        let mut backing: Vec<(VirtAddr, Frame)> = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.allocate_kernel_page(site, platform) {
                Ok(page) => backing.push(page),
                Err(e) => {
                    for (addr, _) in backing {
                        self.free_in(SpaceId::KERNEL, addr, platform)?;
                    }
                    return Err(e);
                }
            }
        }
        for (_, frame) in &backing {
            platform.zero_frame(*frame);
        }

        let root = backing[0].1.start_address();
        let pdpt = backing[1].1.start_address();
        let pd = backing[2].1.start_address();
        let tables = backing[3..].iter().map(|(_, f)| f.start_address()).collect();

        let kernel_root = self.kernel().root();
        for index in KERNEL_HALF_START..ENTRIES_PER_TABLE {
            let entry = platform.read_table_entry(kernel_root, index);
            if entry.is_present() {
                platform.write_table_entry(root, index, entry);
            }
        }

        let space = AddressSpace::new(
            SpaceKind::User,
            VirtAddr::new(USER_HEAP_BASE),
            slots,
            root,
            tables,
            backing.iter().map(|(addr, _)| *addr).collect(),
        );
        space.install_hierarchy(pdpt, pd, platform);

        let id = self.insert(space);
        log::debug!("created {} with {} slots, root {}", id, slots, root);
        Ok(id)
    }

    fn insert(&mut self, space: AddressSpace) -> SpaceId {
        match self.spaces.iter().skip(1).position(Option::is_none) {
            Some(hole) => {
                let index = hole + 1;
                self.spaces[index] = Some(space);
                SpaceId::new(index, self.generations[index])
            }
            None => {
                self.spaces.push(Some(space));
                self.generations.push(0);
                SpaceId::new(self.spaces.len() - 1, 0)
            }
        }
    }

    /// Release every frame of `id`, then its paging structures.
    ///
    /// If `id` is active the kernel space becomes active first.
    pub fn destroy_address_space<P: Platform + ?Sized>(&mut self, id: SpaceId, platform: &mut P) -> Result<(), MemoryError> {
        if id.is_kernel() {
            return Err(MemoryError::KernelSpace);
        }
        Self::space_mut(&mut self.spaces, &self.generations, id)?;
        if self.active == id {
            self.use_kernel_space(platform);
        }

        let Some(mut space) = self.spaces[id.index()].take() else {
            return Err(MemoryError::NoSuchAddressSpace(id));
        };
        self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);

        let released = space.present_slots();
        for frame in space.drain_frames() {
            self.frames.free(frame)?;
        }
        for addr in space.backing() {
            self.free_in(SpaceId::KERNEL, *addr, platform)?;
        }
        log::debug!("destroyed {}: {} slots released", id, released);
        Ok(())
    }
}

/// Head slot of the live run starting exactly at `ptr`.
fn live_run(space: &AddressSpace, ptr: VirtAddr) -> Option<usize> {
    space
        .slot_of(ptr)
        .filter(|&slot| ptr.is_page_aligned() && space.is_present(slot) && space.run_length(slot) > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::HostedPlatform;

    const KERNEL_SLOTS: usize = 1024;

    fn setup(total_frames: usize) -> (HeapManager, HostedPlatform) {
        let mut hw = HostedPlatform::new();
        let heap = HeapManager::new(FrameAllocator::new(total_frames), KERNEL_SLOTS, &mut hw).unwrap();
        (heap, hw)
    }

    fn assert_accounting(heap: &HeapManager) {
        assert_eq!(
            heap.frames().used_frames(),
            heap.boot_reserved_frames() + heap.present_slots()
        );
    }

    #[test]
    fn bring_up_reserves_the_kernel_structures() {
        let (heap, hw) = setup(512);
        // null frame + root + PDPT + PD + 2 leaf tables
        assert_eq!(heap.boot_reserved_frames(), 6);
        assert_eq!(heap.present_slots(), 0);
        assert_eq!(hw.installed_root(), Some(heap.kernel().root()));
    }

    #[test]
    fn freed_slot_is_reused() {
        let (mut heap, mut hw) = setup(512);
        let a = heap.allocate(4096, &mut hw).unwrap();
        let b = heap.allocate(4096, &mut hw).unwrap();
        assert_eq!(b, a + PAGE_SIZE);
        heap.free(a, &mut hw).unwrap();
        assert_eq!(heap.allocate(4096, &mut hw).unwrap(), a);
        assert_accounting(&heap);
    }

    #[test]
    fn run_is_recorded_on_its_first_slot() {
        let (mut heap, mut hw) = setup(512);
        let ptr = heap.allocate(3 * 4096 + 1, &mut hw).unwrap();
        let kernel = heap.kernel();
        let slot = kernel.slot_of(ptr).unwrap();
        assert_eq!(kernel.run_length(slot), 4);
        assert_eq!(kernel.run_length(slot + 1), 0);
        assert_eq!(kernel.present_slots(), 4);
        assert!(kernel.allocation_site(slot).unwrap().file().ends_with("heap.rs"));

        heap.free(ptr, &mut hw).unwrap();
        assert_eq!(heap.present_slots(), 0);
        assert_accounting(&heap);
    }

    #[test]
    fn allocation_is_visible_through_the_page_tables() {
        let (mut heap, mut hw) = setup(512);
        let ptr = heap.allocate(8192, &mut hw).unwrap();
        let kernel = heap.kernel();
        let second = kernel.entry(kernel.slot_of(ptr).unwrap() + 1).frame();
        assert_eq!(
            hw.translate(kernel.root(), ptr + PAGE_SIZE + 8),
            Some(second.start_address() + 8)
        );
    }

    #[test]
    fn stale_and_interior_frees_are_rejected() {
        let (mut heap, mut hw) = setup(512);
        let ptr = heap.allocate(2 * 4096, &mut hw).unwrap();
        assert_eq!(heap.free(ptr + PAGE_SIZE, &mut hw), Err(MemoryError::InvalidFree(ptr + PAGE_SIZE)));
        assert_eq!(heap.free(ptr + 16, &mut hw), Err(MemoryError::InvalidFree(ptr + 16)));
        heap.free(ptr, &mut hw).unwrap();
        assert_eq!(heap.free(ptr, &mut hw), Err(MemoryError::InvalidFree(ptr)));
        assert_accounting(&heap);
    }

    #[test]
    fn out_of_frames_rolls_back_a_partial_run() {
        let (mut heap, mut hw) = setup(16);
        let free_before = heap.frames().free_frames();
        assert_eq!(free_before, 10);
        assert_eq!(heap.allocate(11 * 4096, &mut hw), Err(MemoryError::OutOfMemory));
        assert_eq!(heap.frames().free_frames(), free_before);
        assert_eq!(heap.present_slots(), 0);
    }

    #[test]
    fn fragmentation_is_distinct_from_exhaustion() {
        let mut hw = HostedPlatform::new();
        let mut heap = HeapManager::new(FrameAllocator::new(512), 8, &mut hw).unwrap();
        let slots: Vec<_> = (0..8).map(|_| heap.allocate(1, &mut hw).unwrap()).collect();
        for ptr in slots.iter().step_by(2) {
            heap.free(*ptr, &mut hw).unwrap();
        }
        // four free slots, frames to spare, but no two adjacent
        assert_eq!(heap.allocate(2 * 4096, &mut hw), Err(MemoryError::Fragmented { pages: 2 }));
        assert!(heap.allocate(4096, &mut hw).is_ok());
    }

    #[test]
    fn create_then_destroy_restores_the_bitmap() {
        let (mut heap, mut hw) = setup(1024);
        let used = heap.frames().used_frames();
        let id = heap.create_address_space(200, &mut hw).unwrap();
        assert_eq!(heap.space(id).unwrap().slot_count(), 200);
        assert_accounting(&heap);

        heap.use_address_space(id, &mut hw).unwrap();
        let p = heap.allocate(3 * 4096, &mut hw).unwrap();
        assert_eq!(p, VirtAddr::new(USER_HEAP_BASE));
        assert_accounting(&heap);

        heap.destroy_address_space(id, &mut hw).unwrap();
        assert_eq!(heap.frames().used_frames(), used);
        assert_eq!(heap.active(), SpaceId::KERNEL);
        assert!(heap.space(id).is_none());
        assert_eq!(
            heap.destroy_address_space(id, &mut hw),
            Err(MemoryError::NoSuchAddressSpace(id))
        );
    }

    #[test]
    fn small_requests_get_the_minimum_heap() {
        let (mut heap, mut hw) = setup(1024);
        let id = heap.create_address_space(1, &mut hw).unwrap();
        assert_eq!(heap.space(id).unwrap().slot_count(), MIN_USER_HEAP_SLOTS);
        assert_eq!(
            heap.create_address_space(MAX_USER_HEAP_SLOTS + 1, &mut hw),
            Err(MemoryError::HeapTooLarge { slots: MAX_USER_HEAP_SLOTS + 1 })
        );
    }

    #[test]
    fn user_root_sees_kernel_slots() {
        let (mut heap, mut hw) = setup(1024);
        let kptr = heap.allocate(4096, &mut hw).unwrap();
        let id = heap.create_address_space(128, &mut hw).unwrap();
        let user_root = heap.space(id).unwrap().root();
        let kernel_root = heap.kernel().root();
        assert_ne!(user_root, kernel_root);
        assert_eq!(hw.translate(user_root, kptr), hw.translate(kernel_root, kptr));
        assert!(hw.translate(user_root, kptr).is_some());
    }

    #[test]
    fn frees_are_routed_by_window() {
        let (mut heap, mut hw) = setup(1024);
        let kptr = heap.allocate(4096, &mut hw).unwrap();
        let id = heap.create_address_space(128, &mut hw).unwrap();
        heap.use_address_space(id, &mut hw).unwrap();
        let uptr = heap.allocate(4096, &mut hw).unwrap();

        assert_eq!(heap.free(kptr, &mut hw), Err(MemoryError::ForeignAddressSpace(kptr)));
        heap.use_kernel_space(&mut hw);
        assert_eq!(heap.free(uptr, &mut hw), Err(MemoryError::ForeignAddressSpace(uptr)));
        heap.free_in(id, uptr, &mut hw).unwrap();
        heap.free(kptr, &mut hw).unwrap();
        assert_accounting(&heap);
    }

    #[test]
    fn stale_space_handle_does_not_resolve_to_its_successor() {
        let (mut heap, mut hw) = setup(1024);
        let first = heap.create_address_space(128, &mut hw).unwrap();
        heap.destroy_address_space(first, &mut hw).unwrap();
        let second = heap.create_address_space(128, &mut hw).unwrap();
        assert_eq!(first.index(), second.index());
        assert!(heap.space(first).is_none());
        assert_eq!(
            heap.use_address_space(first, &mut hw),
            Err(MemoryError::NoSuchAddressSpace(first))
        );
        assert_eq!(heap.destroy_address_space(SpaceId::KERNEL, &mut hw), Err(MemoryError::KernelSpace));
    }

    #[test]
    fn shrinking_returns_the_tail_frames() {
        let (mut heap, mut hw) = setup(512);
        let ptr = heap.allocate(4 * 4096, &mut hw).unwrap();
        let free_before = heap.frames().free_frames();
        assert_eq!(heap.reallocate(ptr, 4096, Location::caller(), &mut hw), Ok(ptr));
        let kernel = heap.kernel();
        assert_eq!(kernel.run_length(kernel.slot_of(ptr).unwrap()), 1);
        assert_eq!(heap.present_slots(), 1);
        assert_eq!(heap.frames().free_frames(), free_before + 3);
        assert_accounting(&heap);
    }

    #[test]
    fn growing_into_free_slots_keeps_the_pointer() {
        let (mut heap, mut hw) = setup(512);
        let ptr = heap.allocate(4096, &mut hw).unwrap();
        let root = heap.kernel().root();
        let first = hw.translate(root, ptr).unwrap();

        assert_eq!(heap.reallocate(ptr, 3 * 4096, Location::caller(), &mut hw), Ok(ptr));
        let kernel = heap.kernel();
        assert_eq!(kernel.run_length(kernel.slot_of(ptr).unwrap()), 3);
        assert_eq!(hw.translate(root, ptr), Some(first));
        assert!(hw.translate(root, ptr + 2 * PAGE_SIZE).is_some());
        assert_eq!(heap.present_slots(), 3);
        assert_accounting(&heap);
    }

    #[test]
    fn growing_past_a_neighbour_moves_the_frames() {
        let (mut heap, mut hw) = setup(512);
        let ptr = heap.allocate(2 * 4096, &mut hw).unwrap();
        let neighbour = heap.allocate(4096, &mut hw).unwrap();
        assert_eq!(neighbour, ptr + 2 * PAGE_SIZE);
        let root = heap.kernel().root();
        let second = hw.translate(root, ptr + PAGE_SIZE + 8).unwrap();

        let moved = heap.reallocate(ptr, 4 * 4096, Location::caller(), &mut hw).unwrap();
        assert_eq!(moved, ptr + 3 * PAGE_SIZE);
        assert_eq!(hw.translate(root, moved + PAGE_SIZE + 8), Some(second));
        assert_eq!(hw.translate(root, ptr), None);
        assert_eq!(heap.free(ptr, &mut hw), Err(MemoryError::InvalidFree(ptr)));
        assert_eq!(heap.present_slots(), 5);
        assert_accounting(&heap);
    }

    #[test]
    fn a_failed_grow_leaves_the_allocation_intact() {
        let (mut heap, mut hw) = setup(16);
        let ptr = heap.allocate(4096, &mut hw).unwrap();
        let free_before = heap.frames().free_frames();
        assert_eq!(
            heap.reallocate(ptr, 11 * 4096, Location::caller(), &mut hw),
            Err(MemoryError::OutOfMemory)
        );
        assert_eq!(heap.frames().free_frames(), free_before);
        let kernel = heap.kernel();
        assert_eq!(kernel.run_length(kernel.slot_of(ptr).unwrap()), 1);
        assert_eq!(heap.present_slots(), 1);
        assert_eq!(
            heap.reallocate(ptr + 16, 4096, Location::caller(), &mut hw),
            Err(MemoryError::InvalidFree(ptr + 16))
        );
    }
}
