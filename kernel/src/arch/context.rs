//! Saved CPU state of a task.
//!
//! `CpuSaveState` matches the frame the x86_64 trap stub builds on the
//! stack: CR3, the fifteen general-purpose registers pushed by the stub,
//! then the five words the CPU pushed on interrupt entry. The stub passes a
//! pointer to this frame into the scheduler, which overwrites it in place
//! with the incoming task's snapshot before `iretq`.

use crate::memory::address::PhysAddr;

/// Ring 0 code selector loaded by the boot GDT.
pub const KERNEL_CODE_SELECTOR: u64 = 0x08;
/// Ring 0 data / stack selector.
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;
/// IF set, reserved bit 1 set.
pub const DEFAULT_RFLAGS: u64 = 0x202;

/// Full register snapshot of a suspended context.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSaveState {
	pub cr3: u64,
	pub r15: u64,
	pub r14: u64,
	pub r13: u64,
	pub r12: u64,
	pub r11: u64,
	pub r10: u64,
	pub r9: u64,
	pub r8: u64,
	pub rbp: u64,
	pub rdi: u64,
	pub rsi: u64,
	pub rdx: u64,
	pub rcx: u64,
	pub rbx: u64,
	pub rax: u64,
	// Pushed by the CPU.
	pub rip: u64,
	pub cs: u64,
	pub rflags: u64,
	pub rsp: u64,
	pub ss: u64,
}

const _: () = assert!(core::mem::size_of::<CpuSaveState>() == 21 * 8);

impl CpuSaveState {
	/// Snapshot a freshly created task resumes from.
	///
	/// Execution starts at `trampoline` with the task slot in `rdi`, on a
	/// 16-byte aligned stack ending at `stack_top`, with interrupts enabled.
	/// Unused registers carry recognisable filler so a stray read shows up
	/// in a register dump.
	pub fn initial(trampoline: u64, stack_top: u64, root: PhysAddr, slot: usize) -> Self {
		Self {
			cr3: root.as_u64(),
			r15: 0xF1F1_F1F1,
			r14: 0xE1E1_E1E1,
			r13: 0xD1D1_D1D1,
			r12: 0xC1C1_C1C1,
			r11: 0xB1B1_B1B1,
			r10: 0xA1A1_A1A1,
			r9: 0x9191_9191,
			r8: 0x8181_8181,
			rbp: 0,
			rdi: slot as u64,
			rsi: 0x5151_5151,
			rdx: 0x1234_5678,
			rcx: 0x0123_4567,
			rbx: 0x2345_6789,
			rax: slot as u64,
			rip: trampoline,
			cs: KERNEL_CODE_SELECTOR,
			rflags: DEFAULT_RFLAGS,
			// Leave room for the return-address slot the ABI expects on entry.
			rsp: (stack_top & !0xF) - 8,
			ss: KERNEL_DATA_SELECTOR,
		}
	}
}

/// `fxsave` image of the x87/SSE state.
#[repr(C, align(16))]
#[derive(Clone, PartialEq, Eq)]
pub struct FpuState {
	pub bytes: [u8; 512],
}

impl FpuState {
	/// Power-on state: all exceptions masked, round to nearest.
	pub fn initial() -> Self {
		let mut bytes = [0u8; 512];
		// FCW at offset 0
		bytes[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
		// MXCSR at offset 24
		bytes[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
		Self { bytes }
	}

	pub fn control_word(&self) -> u16 {
		u16::from_le_bytes([self.bytes[0], self.bytes[1]])
	}

	pub fn mxcsr(&self) -> u32 {
		u32::from_le_bytes([self.bytes[24], self.bytes[25], self.bytes[26], self.bytes[27]])
	}
}

impl Default for FpuState {
	fn default() -> Self {
		Self::initial()
	}
}

impl core::fmt::Debug for FpuState {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("FpuState")
			.field("fcw", &format_args!("{:#06x}", self.control_word()))
			.field("mxcsr", &format_args!("{:#010x}", self.mxcsr()))
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn initial_snapshot_enters_trampoline_with_slot() {
		let state = CpuSaveState::initial(0xFFFF_FFFF_8000_1000, 0xFFFF_8080_0000_8000, PhysAddr::new(0x3000), 5);
		assert_eq!(state.rip, 0xFFFF_FFFF_8000_1000);
		assert_eq!(state.rdi, 5);
		assert_eq!(state.rsp % 16, 8);
		assert!(state.rsp < 0xFFFF_8080_0000_8000);
		assert_eq!(state.rflags & 0x200, 0x200);
		assert_eq!(state.cr3, 0x3000);
	}

	#[test]
	fn fpu_power_on_image() {
		let fpu = FpuState::initial();
		assert_eq!(fpu.control_word(), 0x037F);
		assert_eq!(fpu.mxcsr(), 0x1F80);
	}
}
