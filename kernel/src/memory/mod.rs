//! Physical frames, page tables and the slot heaps built on them.

pub mod address;
pub mod heap;
pub mod paging;
pub mod pmm;
pub mod space;

pub use address::{Frame, PhysAddr, VirtAddr};
pub use heap::HeapManager;
pub use pmm::{FrameAllocator, MemoryRegion};
pub use space::{AddressSpace, SpaceId, SpaceKind};
