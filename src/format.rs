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

//! Creates a fresh filesystem image: superblock, zeroed bitmaps, zeroed inode
//! table, an empty journal and the root directory.

use crate::device::BlockDevice;
use crate::errno::EResult;
use crate::errno;
use crate::fs::dirent;
use crate::fs::inode::{Inode, INODE_SIZE};
use crate::fs::journal;
use crate::fs::{FileType, Superblock, MAGIC, ROOT_INO, SUPERBLOCK_SIZE};
use bytemuck::bytes_of;
use log::info;
use std::fs::OpenOptions;
use std::path::Path;

/// Geometry of the image to create.
#[derive(Clone, Debug)]
pub struct FormatOptions {
	/// The total size of the image in MB.
	pub size_mb: u32,
	/// The size of a block in bytes. A power of two.
	pub block_size: u32,
	/// The total number of inodes.
	pub inode_count: u32,
}

impl Default for FormatOptions {
	fn default() -> Self {
		Self {
			size_mb: 128,
			block_size: 4096,
			inode_count: 1024,
		}
	}
}

/// Creates a filesystem image at `path` with the given geometry.
///
/// The resulting image mounts with an empty journal and a root directory
/// holding only `.` and `..`.
pub fn format(path: &Path, opts: &FormatOptions) -> EResult<()> {
	let b = opts.block_size;
	if !b.is_power_of_two() || !(512..=65536).contains(&b) {
		return Err(errno!(EINVAL));
	}
	// Inode 0 is reserved and inode 1 is the root
	if opts.size_mb == 0 || opts.inode_count < 2 {
		return Err(errno!(EINVAL));
	}
	let total_blocks = opts.size_mb as u64 * 1024 * 1024 / b as u64;
	let total_blocks: u32 = total_blocks.try_into().map_err(|_| errno!(EINVAL))?;
	let bits_per_blk = b * 8;
	let inode_bitmap_blks = opts.inode_count.div_ceil(bits_per_blk);
	let inode_table_blks = opts.inode_count.div_ceil(b / INODE_SIZE as u32);
	// A single transaction stages up to a handful of metadata blocks (both
	// bitmaps, the superblock, inode table and directory blocks), plus the
	// descriptor and commit records: keep a comfortable floor
	let journal_len = (total_blocks / 64).clamp(32, 1024);
	let fixed = 1 + inode_bitmap_blks + inode_table_blks + journal_len;
	if total_blocks <= fixed + 2 {
		return Err(errno!(EINVAL));
	}
	// The data bitmap sizes itself against the data region, which shrinks as
	// the bitmap grows: iterate to the fixpoint
	let mut data_bitmap_blks = (total_blocks - fixed).div_ceil(bits_per_blk);
	loop {
		let need = (total_blocks - fixed - data_bitmap_blks).div_ceil(bits_per_blk);
		if need == data_bitmap_blks {
			break;
		}
		data_bitmap_blks = need;
	}
	let inode_bitmap_start = 1;
	let data_bitmap_start = inode_bitmap_start + inode_bitmap_blks;
	let inode_table_start = data_bitmap_start + data_bitmap_blks;
	let journal_start = inode_table_start + inode_table_blks;
	let data_start = journal_start + journal_len;
	if data_start + 1 >= total_blocks {
		return Err(errno!(EINVAL));
	}
	let data_blocks = total_blocks - data_start;
	// Size the image; truncation leaves every region zeroed
	let file = OpenOptions::new()
		.read(true)
		.write(true)
		.create(true)
		.truncate(true)
		.open(path)?;
	file.set_len(total_blocks as u64 * b as u64)?;
	let mut dev = BlockDevice::new(file, b, total_blocks)?;
	// Root directory content: `.` and `..`, both pointing at the root
	let root_block = data_start;
	let mut buf = vec![0u8; b as usize];
	let rec = dirent::record_len(2);
	dirent::encode(&mut buf, ROOT_INO, rec as u16, FileType::Directory.indicator(), b".")?;
	dirent::encode(
		&mut buf[rec..],
		ROOT_INO,
		rec as u16,
		FileType::Directory.indicator(),
		b"..",
	)?;
	dirent::fill_free_entries(&mut buf[(2 * rec)..])?;
	dev.write_block(root_block, &buf)?;
	// Root inode
	let mut root = Inode::new(FileType::Directory, 0o755, 0, 0, 2);
	root.size = b as u64;
	root.blocks[0] = root_block;
	let mut buf = vec![0u8; b as usize];
	let off = ROOT_INO as usize * INODE_SIZE;
	buf[off..(off + INODE_SIZE)].copy_from_slice(bytes_of(&root));
	dev.write_block(inode_table_start, &buf)?;
	// Inode bitmap: the reserved inode 0 and the root
	let mut buf = vec![0u8; b as usize];
	buf[0] = 0b11;
	dev.write_block(inode_bitmap_start, &buf)?;
	// Data bitmap: the root directory's block
	let mut buf = vec![0u8; b as usize];
	buf[0] = 0b1;
	dev.write_block(data_bitmap_start, &buf)?;
	journal::init_journal(&mut dev, journal_start)?;
	let sp = Superblock {
		magic: MAGIC,
		block_size: b,
		total_blocks,
		inode_count: opts.inode_count,
		inode_bitmap_start,
		data_bitmap_start,
		inode_table_start,
		journal_start,
		journal_len,
		data_start,
		free_inodes: opts.inode_count - 2,
		free_blocks: data_blocks - 1,
		_reserved: [0; 16],
	};
	let mut buf = vec![0u8; b as usize];
	buf[..SUPERBLOCK_SIZE].copy_from_slice(bytes_of(&sp));
	dev.write_block(0, &buf)?;
	dev.sync()?;
	info!(
		"formatted {path}: {total_blocks} blocks of {b} bytes, {inodes} inodes, {journal_len} journal blocks",
		path = path.display(),
		inodes = opts.inode_count,
	);
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::test_util::TempImage;
	use crate::WayneFs;

	#[test]
	fn formatted_image_is_consistent() {
		let img = TempImage::new(16, 4096, 512);
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.check_consistency().unwrap();
		let entries = fs.readdir("/").unwrap();
		let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
		assert_eq!(names, vec![".", ".."]);
		let stat = fs.getattr("/").unwrap();
		assert_eq!(stat.nlink, 2);
		assert_eq!(stat.mode, 0o755);
	}

	#[test]
	fn geometry_regions_are_disjoint() {
		let img = TempImage::new(64, 1024, 4096);
		let fs = WayneFs::mount(&img.path).unwrap();
		// `validate` ran at mount; spot-check the bitmap sizing
		let sp = fs.sp;
		let bits = sp.block_size * 8;
		assert!(sp.data_bitmap_start - sp.inode_bitmap_start >= sp.inode_count.div_ceil(bits));
		assert!(
			sp.inode_table_start - sp.data_bitmap_start >= sp.data_block_count().div_ceil(bits)
		);
		assert_eq!(sp.journal_start + sp.journal_len, sp.data_start);
	}

	#[test]
	fn rejects_bad_geometry() {
		let dir = std::env::temp_dir();
		let path = dir.join(format!("waynefs-bad-{}.img", uuid::Uuid::new_v4()));
		// Block size not a power of two
		let res = format(
			&path,
			&FormatOptions {
				size_mb: 8,
				block_size: 3000,
				inode_count: 64,
			},
		);
		assert_eq!(res, Err(errno!(EINVAL)));
		// Inode table alone would not fit the image
		let res = format(
			&path,
			&FormatOptions {
				size_mb: 1,
				block_size: 4096,
				inode_count: 4_000_000,
			},
		);
		assert_eq!(res, Err(errno!(EINVAL)));
		let _ = std::fs::remove_file(&path);
	}
}
