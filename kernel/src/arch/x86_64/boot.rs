// =============================================================================
// NanoCore — Limine Boot
// =============================================================================
//
// Limine fills in request structures placed in the `.limine_requests`
// section before jumping to the kernel. The core needs two answers from it:
//
//   HHDM offset  — where all physical memory is mapped, so page tables can
//                  be edited through plain pointers
//   memory map   — which physical ranges are free RAM
//
// `boot` turns those into a frame allocator and the global kernel. The
// embedding binary owns the entry point, the IDT and the global allocator;
// it calls `boot` once, before enabling interrupts.
//
// =============================================================================

use alloc::vec::Vec;
use core::fmt;

use limine::BaseRevision;
use limine::memory_map::EntryType;
use limine::request::{HhdmRequest, MemoryMapRequest};

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::memory::pmm::{FrameAllocator, MemoryRegion};

use super::KERNEL;
use super::cpu::X86_64;
use super::serial::SERIAL_SINK;

#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[derive(Debug)]
pub enum BootError {
    /// Limine does not speak the protocol revision we were built for.
    UnsupportedRevision,
    /// Limine left a request unanswered.
    MissingResponse(&'static str),
    Kernel(KernelError),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedRevision => write!(f, "unsupported Limine base revision"),
            Self::MissingResponse(what) => write!(f, "no Limine {what} response"),
            Self::Kernel(e) => write!(f, "{e}"),
        }
    }
}

impl From<KernelError> for BootError {
    fn from(e: KernelError) -> Self {
        Self::Kernel(e)
    }
}

/// Bring up logging and the global kernel from Limine's answers.
pub fn boot(config: KernelConfig, level: log::LevelFilter) -> Result<(), BootError> {
    SERIAL_SINK.init();
    // A second call finds the logger installed; nothing to do then.
    let _ = klog::init(&SERIAL_SINK, level);

    if !BASE_REVISION.is_supported() {
        return Err(BootError::UnsupportedRevision);
    }
    let hhdm = HHDM_REQUEST
        .get_response()
        .ok_or(BootError::MissingResponse("HHDM"))?
        .offset();
    let regions: Vec<MemoryRegion> = MEMORY_MAP_REQUEST
        .get_response()
        .ok_or(BootError::MissingResponse("memory map"))?
        .entries()
        .iter()
        .map(|entry| MemoryRegion {
            base: entry.base,
            length: entry.length,
            usable: entry.entry_type == EntryType::USABLE,
        })
        .collect();

    let frames = FrameAllocator::from_regions(&regions);
    // SAFETY: the offset comes straight from the boot loader.
    let platform = unsafe { X86_64::new(hhdm) };
    let kernel = Kernel::new(platform, frames, config)?;
    *KERNEL.lock() = Some(kernel);
    log::info!("boot complete, HHDM at {:#x}", hhdm);
    Ok(())
}
