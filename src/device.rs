/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of WayneFS.
 *
 * WayneFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * WayneFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * WayneFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! The block device is a thin wrapper over the image file, providing
//! positional I/O on fixed-size blocks and a durability barrier.
//!
//! The image is pre-sized by the formatter; the device never grows the file.

use crate::errno::EResult;
use crate::errno;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;

/// A block device backed by the image file.
///
/// The device takes an advisory exclusive lock on the image, released when
/// the device is dropped. A single mounted instance owns the image.
pub struct BlockDevice {
	/// The image file.
	file: File,
	/// The size of a block in bytes.
	blk_size: u32,
	/// The total number of blocks.
	blk_count: u32,
}

impl BlockDevice {
	/// Creates a device over the given open image file.
	///
	/// Arguments:
	/// - `file` is the image file, opened for reading and writing
	/// - `blk_size` is the size of a block in bytes
	/// - `blk_count` is the total number of blocks
	///
	/// If another process holds the image, the function returns [`EBUSY`].
	pub fn new(file: File, blk_size: u32, blk_count: u32) -> EResult<Self> {
		let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
		if res < 0 {
			return Err(errno!(EBUSY));
		}
		Ok(Self {
			file,
			blk_size,
			blk_count,
		})
	}

	/// Returns the size of a block in bytes.
	pub fn block_size(&self) -> u32 {
		self.blk_size
	}

	/// Returns the total number of blocks.
	pub fn block_count(&self) -> u32 {
		self.blk_count
	}

	/// Reads the block `bno` into `buf`.
	///
	/// `buf` must be exactly one block long. If `bno` is out of range, the
	/// function returns [`ENXIO`].
	pub fn read_block(&mut self, bno: u32, buf: &mut [u8]) -> EResult<()> {
		if bno >= self.blk_count || buf.len() != self.blk_size as usize {
			return Err(errno!(ENXIO));
		}
		let off = bno as u64 * self.blk_size as u64;
		self.file.read_exact_at(buf, off)?;
		Ok(())
	}

	/// Writes `buf` to the block `bno`.
	///
	/// `buf` must be exactly one block long. If `bno` is out of range, the
	/// function returns [`ENXIO`].
	pub fn write_block(&mut self, bno: u32, buf: &[u8]) -> EResult<()> {
		if bno >= self.blk_count || buf.len() != self.blk_size as usize {
			return Err(errno!(ENXIO));
		}
		let off = bno as u64 * self.blk_size as u64;
		self.file.write_all_at(buf, off)?;
		Ok(())
	}

	/// Durability barrier: every prior write is on stable storage when the
	/// function returns.
	pub fn sync(&mut self) -> EResult<()> {
		self.file.sync_data()?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::test_util::TempImage;
	use std::fs::OpenOptions;

	fn open_dev(img: &TempImage) -> BlockDevice {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.open(&img.path)
			.unwrap();
		BlockDevice::new(file, 4096, 8 * 256).unwrap()
	}

	#[test]
	fn read_write_roundtrip() {
		let img = TempImage::small();
		let mut dev = open_dev(&img);
		let mut buf = vec![0u8; 4096];
		buf[0] = 0xab;
		buf[4095] = 0xcd;
		dev.write_block(100, &buf).unwrap();
		let mut out = vec![0u8; 4096];
		dev.read_block(100, &mut out).unwrap();
		assert_eq!(buf, out);
	}

	#[test]
	fn out_of_range() {
		let img = TempImage::small();
		let mut dev = open_dev(&img);
		let mut buf = vec![0u8; 4096];
		assert_eq!(
			dev.read_block(8 * 256, &mut buf),
			Err(errno!(ENXIO))
		);
		assert_eq!(dev.write_block(u32::MAX, &buf), Err(errno!(ENXIO)));
		// Wrong buffer size
		let mut small = vec![0u8; 512];
		assert_eq!(dev.read_block(0, &mut small), Err(errno!(ENXIO)));
	}

	#[test]
	fn exclusive_lock() {
		let img = TempImage::small();
		let _dev = open_dev(&img);
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.open(&img.path)
			.unwrap();
		assert_eq!(
			BlockDevice::new(file, 4096, 8 * 256).err(),
			Some(errno!(EBUSY))
		);
	}
}
