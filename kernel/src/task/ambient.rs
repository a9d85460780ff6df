//! Per-task ambient context.
//!
//! State that conceptually belongs to "whoever is running right now" and is
//! swapped on every context switch: the active heap, the console and font
//! the task draws with, its working directory, and the system call it is in
//! the middle of. Consoles, fonts and filesystem nodes belong to other
//! subsystems; the core only carries their handles.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use crate::config::PATH_MAX;
use crate::memory::space::SpaceId;

/// Handle of a console owned by the terminal subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsoleId(pub usize);

/// Handle of a font owned by the graphics subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FontId(pub usize);

/// A filesystem node a working directory can point at.
pub trait FsNode: Send + Sync {
	fn name(&self) -> &str;
}

#[derive(Clone, Default)]
pub struct AmbientContext {
	pub address_space: SpaceId,
	pub console: Option<ConsoleId>,
	pub font: Option<FontId>,
	cwd: String,
	pub cwd_node: Option<Arc<dyn FsNode>>,
	pub syscall_number: u32,
}

impl AmbientContext {
	pub fn cwd(&self) -> &str {
		if self.cwd.is_empty() { "/" } else { &self.cwd }
	}

	/// Set the working directory path, truncated to `PATH_MAX` bytes on a
	/// character boundary.
	pub fn set_cwd(&mut self, path: &str, node: Option<Arc<dyn FsNode>>) {
		let mut end = path.len().min(PATH_MAX);
		while !path.is_char_boundary(end) {
			end -= 1;
		}
		self.cwd.clear();
		self.cwd.push_str(&path[..end]);
		self.cwd_node = node;
	}
}

impl fmt::Debug for AmbientContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AmbientContext")
			.field("address_space", &self.address_space)
			.field("console", &self.console)
			.field("font", &self.font)
			.field("cwd", &self.cwd())
			.field("cwd_node", &self.cwd_node.as_ref().map(|n| n.name()))
			.field("syscall_number", &self.syscall_number)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Dir(&'static str);

	impl FsNode for Dir {
		fn name(&self) -> &str {
			self.0
		}
	}

	#[test]
	fn default_directory_is_root() {
		let ambient = AmbientContext::default();
		assert_eq!(ambient.cwd(), "/");
		assert!(ambient.address_space.is_kernel());
	}

	#[test]
	fn long_paths_are_truncated_on_a_char_boundary() {
		let mut ambient = AmbientContext::default();
		let path = "é".repeat(PATH_MAX);
		ambient.set_cwd(&path, Some(Arc::new(Dir("deep"))));
		assert_eq!(ambient.cwd().len(), PATH_MAX);
		assert_eq!(ambient.cwd_node.as_ref().map(|n| n.name()), Some("deep"));
	}
}
