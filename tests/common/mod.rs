//! Shared helpers for the end-to-end tests: scratch images under the system
//! temporary directory, removed when dropped.

use std::env;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;
use waynefs::{format, FormatOptions, WayneFs};

/// A formatted scratch image, removed when dropped.
pub struct TempImage {
	/// Path to the image file.
	pub path: PathBuf,
}

impl TempImage {
	/// Creates a formatted scratch image with the given geometry.
	pub fn new(size_mb: u32, block_size: u32, inode_count: u32) -> Self {
		let path = env::temp_dir().join(format!("waynefs-e2e-{}.img", Uuid::new_v4()));
		format(
			&path,
			&FormatOptions {
				size_mb,
				block_size,
				inode_count,
			},
		)
		.expect("cannot format scratch image");
		Self {
			path,
		}
	}

	/// The reference geometry: 128 MB, 4096 B blocks, 1024 inodes.
	pub fn reference() -> Self {
		Self::new(128, 4096, 1024)
	}

	/// Mounts the image.
	pub fn mount(&self) -> WayneFs {
		WayneFs::mount(&self.path).expect("cannot mount scratch image")
	}
}

impl Drop for TempImage {
	fn drop(&mut self) {
		let _ = fs::remove_file(&self.path);
	}
}
