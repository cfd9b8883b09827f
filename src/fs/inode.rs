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

//! An inode represents a file in the filesystem.
//!
//! The access to an inode's content goes through block pointers, each
//! overflowing on the next when full:
//! - Direct pointers: slots `0..10` point straight at content blocks
//! - Single indirect: slot `10` points at a block of pointers to content
//!   blocks
//! - Double indirect: slot `11` points at a block of pointers to single
//!   indirect blocks
//!
//! With a block size of `n` bytes, the maximum size of a file is
//! `(10 + n/4 + (n/4)^2) * n`.
//!
//! Index blocks are zero-filled on allocation; a zero pointer marks a hole,
//! which reads as zeros.

use crate::cache::page::RcPage;
use crate::errno::EResult;
use crate::errno;
use crate::fs::{FileType, Stat, WayneFs};
use bytemuck::{Pod, Zeroable};

/// The number of direct block pointers in an inode.
pub const DIRECT_BLOCKS_COUNT: usize = 10;
/// The slot of the single indirect block pointer.
pub const SINGLE_INDIRECT_SLOT: usize = 10;
/// The slot of the double indirect block pointer.
pub const DOUBLE_INDIRECT_SLOT: usize = 11;

/// The size of the on-disk inode record in bytes.
pub const INODE_SIZE: usize = 128;

/// An on-disk inode.
///
/// The name of the file is not stored in the inode but in the directory
/// entries pointing at it, since several entries can refer to the same inode
/// (hard links).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Inode {
	/// The size of the file in bytes.
	pub size: u64,
	/// Timestamp of the last access.
	pub atime: u64,
	/// Timestamp of the last content modification.
	pub mtime: u64,
	/// Timestamp of the last metadata modification.
	pub ctime: u64,
	/// The owner user ID.
	pub uid: u32,
	/// The owner group ID.
	pub gid: u32,
	/// The number of hard links to this inode.
	pub nlink: u32,
	/// The permission bits.
	pub mode: u16,
	/// The type of the file, as an on-disk type indicator.
	pub kind: u8,
	/// Reserved. Zero on write, ignored on read.
	pub _pad: u8,
	/// Block pointers. Slots `0..10` are direct, slot `10` is single
	/// indirect, slot `11` is double indirect.
	pub blocks: [u32; 12],
	/// Reserved. Zero on write, ignored on read.
	pub _reserved: [u8; 32],
}

impl Inode {
	/// Creates a fresh inode record of the given type.
	pub fn new(kind: FileType, mode: u16, uid: u32, gid: u32, nlink: u32) -> Self {
		let ts = super::now_sec();
		Self {
			size: 0,
			atime: ts,
			mtime: ts,
			ctime: ts,
			uid,
			gid,
			nlink,
			mode,
			kind: kind.indicator(),
			_pad: 0,
			blocks: [0; 12],
			_reserved: [0; 32],
		}
	}

	/// Returns the type of the file, or `None` if the record is corrupted.
	pub fn file_type(&self) -> Option<FileType> {
		FileType::from_indicator(self.kind)
	}

	/// Returns the file's status.
	pub fn stat(&self) -> EResult<Stat> {
		let kind = self.file_type().ok_or_else(|| errno!(EUCLEAN))?;
		Ok(Stat {
			kind,
			mode: self.mode,
			uid: self.uid,
			gid: self.gid,
			nlink: self.nlink,
			size: self.size,
			atime: self.atime,
			mtime: self.mtime,
			ctime: self.ctime,
		})
	}

	/// Stamps a metadata modification, and a content modification if `content`
	/// is set.
	pub fn touch(&mut self, content: bool) {
		let ts = super::now_sec();
		self.ctime = ts;
		if content {
			self.mtime = ts;
		}
	}

	/// Translates the file block offset `off` to a physical block number.
	///
	/// If the block is a hole, the function returns `None`.
	pub fn translate_blk_off(&self, off: u32, fs: &mut WayneFs) -> EResult<Option<u32>> {
		let (depth, offsets) = indirection_offsets(off, fs.sp.entries_per_block_log())?;
		let mut bno = self.blocks[offsets[0]];
		if bno == 0 {
			return Ok(None);
		}
		check_blk(bno, fs)?;
		// Perform indirections
		for off in &offsets[1..depth] {
			let page = fs.block(bno)?;
			let next = index_entry(&page, *off);
			if next == 0 {
				return Ok(None);
			}
			check_blk(next, fs)?;
			bno = next;
		}
		Ok(Some(bno))
	}

	/// Allocates a block for the file block offset `off`, together with any
	/// missing index block on the way.
	///
	/// If a block is already allocated, the function returns it unchanged.
	/// The content of a newly allocated block is zero-filled. The caller must
	/// write the inode back afterwards, since the direct slots may change.
	///
	/// On success, the function returns the physical block number.
	pub fn alloc_content_blk(&mut self, off: u32, fs: &mut WayneFs) -> EResult<u32> {
		let (depth, offsets) = indirection_offsets(off, fs.sp.entries_per_block_log())?;
		let mut bno = self.blocks[offsets[0]];
		if bno == 0 {
			bno = fs.alloc_block()?;
			if depth > 1 {
				fs.zero_meta_block(bno)?;
			} else {
				fs.pages.get_zeroed(bno);
			}
			self.blocks[offsets[0]] = bno;
		}
		// Perform indirections
		for (i, off) in offsets[1..depth].iter().enumerate() {
			let page = fs.block(bno)?;
			let mut next = index_entry(&page, *off);
			if next == 0 {
				next = fs.alloc_block()?;
				let is_index = i + 2 < depth;
				if is_index {
					fs.zero_meta_block(next)?;
				} else {
					fs.pages.get_zeroed(next);
				}
				let page = fs.block(bno)?;
				set_index_entry(&page, *off, next);
				fs.stage_block(bno)?;
			}
			bno = next;
		}
		Ok(bno)
	}

	/// Frees the content block at the file block offset `off`, together with
	/// any index block left empty by the removal.
	///
	/// If the block is a hole, the function does nothing. The caller must
	/// write the inode back afterwards.
	pub fn free_content_blk(&mut self, off: u32, fs: &mut WayneFs) -> EResult<()> {
		let (depth, offsets) = indirection_offsets(off, fs.sp.entries_per_block_log())?;
		let bno = self.blocks[offsets[0]];
		if bno == 0 {
			return Ok(());
		}
		if Self::free_subtree(fs, bno, &offsets[1..depth])? {
			self.blocks[offsets[0]] = 0;
			fs.free_block(bno)?;
		}
		Ok(())
	}

	/// Frees the leaf reached through `bno` by the index offsets `offsets`.
	///
	/// The function returns `true` when the block `bno` itself no longer
	/// holds anything and should be freed by the caller.
	fn free_subtree(fs: &mut WayneFs, bno: u32, offsets: &[usize]) -> EResult<bool> {
		let Some((off, rest)) = offsets.split_first() else {
			// `bno` is the leaf itself
			return Ok(true);
		};
		let page = fs.block(bno)?;
		let child = index_entry(&page, *off);
		drop(page);
		if child == 0 {
			return Ok(false);
		}
		if !Self::free_subtree(fs, child, rest)? {
			return Ok(false);
		}
		let page = fs.block(bno)?;
		set_index_entry(&page, *off, 0);
		let empty = page.slice().iter().all(|b| *b == 0);
		drop(page);
		fs.stage_block(bno)?;
		fs.free_block(child)?;
		Ok(empty)
	}

	/// Frees every content and index block of the inode.
	pub fn free_content(&mut self, fs: &mut WayneFs) -> EResult<()> {
		for slot in 0..DIRECT_BLOCKS_COUNT {
			let bno = self.blocks[slot];
			if bno != 0 {
				fs.free_block(bno)?;
			}
		}
		let single = self.blocks[SINGLE_INDIRECT_SLOT];
		if single != 0 {
			for bno in fs.index_entries(single)? {
				fs.free_block(bno)?;
			}
			fs.free_block(single)?;
		}
		let double = self.blocks[DOUBLE_INDIRECT_SLOT];
		if double != 0 {
			for mid in fs.index_entries(double)? {
				for bno in fs.index_entries(mid)? {
					fs.free_block(bno)?;
				}
				fs.free_block(mid)?;
			}
			fs.free_block(double)?;
		}
		self.blocks = [0; 12];
		self.size = 0;
		Ok(())
	}

	/// Resizes the file to `new_size` bytes.
	///
	/// Shrinking frees the blocks past the new end; growing only updates the
	/// size, leaving a hole that materializes on write. The caller must write
	/// the inode back afterwards.
	pub fn truncate_to(&mut self, new_size: u64, fs: &mut WayneFs) -> EResult<()> {
		let blk_size = fs.sp.block_size as u64;
		let old_size = self.size;
		if new_size < old_size {
			let start = new_size.div_ceil(blk_size) as u32;
			let end = old_size.div_ceil(blk_size) as u32;
			for off in start..end {
				self.free_content_blk(off, fs)?;
			}
			// Zero the tail of the last kept block, so growing the file again
			// exposes zeros instead of the old content
			let tail = (new_size % blk_size) as usize;
			if tail != 0 {
				if let Some(bno) = self.translate_blk_off((new_size / blk_size) as u32, fs)? {
					let page = fs.block(bno)?;
					page.slice_mut()[tail..].fill(0);
					page.mark_dirty();
					fs.add_ordered(bno)?;
				}
			}
		}
		self.size = new_size;
		Ok(())
	}
}

/// Computes the slot and index offsets to reach the file block at offset
/// `off`.
///
/// `ent_per_blk_log` is the log2 of the number of pointers in a block.
///
/// On success, the function returns the number of offsets together with the
/// offsets themselves: the first indexes [`Inode::blocks`], the others index
/// the index blocks on the way down.
///
/// If the offset is out of bounds, the function returns [`EOVERFLOW`].
fn indirection_offsets(mut off: u32, ent_per_blk_log: u32) -> EResult<(usize, [usize; 3])> {
	let mut offsets = [0usize; 3];
	if off < DIRECT_BLOCKS_COUNT as u32 {
		offsets[0] = off as usize;
		return Ok((1, offsets));
	}
	off -= DIRECT_BLOCKS_COUNT as u32;
	let ent_per_blk = 1u32 << ent_per_blk_log;
	if off < ent_per_blk {
		offsets[0] = SINGLE_INDIRECT_SLOT;
		offsets[1] = off as usize;
		return Ok((2, offsets));
	}
	off -= ent_per_blk;
	if (off as u64) < (ent_per_blk as u64 * ent_per_blk as u64) {
		offsets[0] = DOUBLE_INDIRECT_SLOT;
		offsets[1] = (off >> ent_per_blk_log) as usize;
		offsets[2] = (off & (ent_per_blk - 1)) as usize;
		return Ok((3, offsets));
	}
	Err(errno!(EOVERFLOW))
}

/// Checks for a block number pointing outside the data region.
fn check_blk(bno: u32, fs: &WayneFs) -> EResult<()> {
	if bno < fs.sp.data_start || bno >= fs.sp.total_blocks {
		return Err(errno!(EUCLEAN));
	}
	Ok(())
}

/// Reads the `off`-th pointer of the index block `page`.
fn index_entry(page: &RcPage, off: usize) -> u32 {
	let buf = page.slice();
	let i = off * 4;
	u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
}

/// Writes the `off`-th pointer of the index block `page` and marks the page
/// dirty.
fn set_index_entry(page: &RcPage, off: usize, bno: u32) {
	let mut buf = page.slice_mut();
	let i = off * 4;
	buf[i..(i + 4)].copy_from_slice(&bno.to_le_bytes());
	drop(buf);
	page.mark_dirty();
}

#[cfg(test)]
mod test {
	use super::*;

	// 4096-byte blocks: 1024 pointers per block
	const LOG: u32 = 10;
	const P: u32 = 1 << LOG;

	#[test]
	fn offsets_direct() {
		assert_eq!(indirection_offsets(0, LOG), Ok((1, [0, 0, 0])));
		assert_eq!(indirection_offsets(9, LOG), Ok((1, [9, 0, 0])));
	}

	#[test]
	fn offsets_single() {
		assert_eq!(indirection_offsets(10, LOG), Ok((2, [10, 0, 0])));
		assert_eq!(
			indirection_offsets(10 + P - 1, LOG),
			Ok((2, [10, (P - 1) as usize, 0]))
		);
	}

	#[test]
	fn offsets_double() {
		assert_eq!(indirection_offsets(10 + P, LOG), Ok((3, [11, 0, 0])));
		assert_eq!(
			indirection_offsets(10 + P + P + 1, LOG),
			Ok((3, [11, 1, 1]))
		);
		assert_eq!(
			indirection_offsets(10 + P + P * P - 1, LOG),
			Ok((3, [11, (P - 1) as usize, (P - 1) as usize]))
		);
	}

	#[test]
	fn offsets_overflow() {
		assert_eq!(
			indirection_offsets(10 + P + P * P, LOG),
			Err(errno!(EOVERFLOW))
		);
	}

	#[test]
	fn record_layout() {
		use std::mem::{align_of, size_of};
		assert_eq!(size_of::<Inode>(), INODE_SIZE);
		assert_eq!(align_of::<Inode>(), 8);
	}
}
