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

//! Filesystem core: the superblock, the allocation bitmaps and the inode
//! table, together with the mounted filesystem state.
//!
//! The image is divided into regions, in a fixed order starting at block 0:
//! superblock, inode bitmap, data bitmap, inode table, journal, data. The
//! superblock records the exact boundaries so the formatter and the mounter
//! agree bit-for-bit.

pub mod dirent;
pub mod inode;
pub mod journal;

use crate::cache::dentry::DentryCache;
use crate::cache::page::{PageCache, RcPage};
use crate::device::BlockDevice;
use crate::errno::EResult;
use crate::errno;
use crate::fs::inode::{Inode, INODE_SIZE};
use crate::fs::journal::Journal;
use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use log::{error, info};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// The filesystem's magic number, `WAYN` in little-endian.
pub const MAGIC: u32 = 0x4e594157;
/// The inode of the root directory. Inode `0` is reserved invalid.
pub const ROOT_INO: u32 = 1;

/// The size of the on-disk superblock record in bytes.
pub const SUPERBLOCK_SIZE: usize = size_of::<Superblock>();

/// Returns the current timestamp in seconds since the Unix epoch.
pub fn now_sec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// The type of a filesystem object.
///
/// The discriminants are the on-disk type indicators, shared by the inode
/// record and the directory entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FileType {
	/// A regular file.
	Regular = 1,
	/// A directory.
	Directory = 2,
	/// A symbolic link.
	Link = 7,
}

impl FileType {
	/// Returns the type matching the on-disk indicator `kind`.
	pub fn from_indicator(kind: u8) -> Option<Self> {
		match kind {
			1 => Some(Self::Regular),
			2 => Some(Self::Directory),
			7 => Some(Self::Link),
			_ => None,
		}
	}

	/// Returns the on-disk indicator for the type.
	pub fn indicator(self) -> u8 {
		self as u8
	}
}

/// The status of a file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Stat {
	/// The type of the file.
	pub kind: FileType,
	/// The permission bits.
	pub mode: u16,
	/// The owner user ID.
	pub uid: u32,
	/// The owner group ID.
	pub gid: u32,
	/// The number of hard links.
	pub nlink: u32,
	/// The size of the file in bytes.
	pub size: u64,
	/// Timestamp of the last access.
	pub atime: u64,
	/// Timestamp of the last content modification.
	pub mtime: u64,
	/// Timestamp of the last metadata modification.
	pub ctime: u64,
}

/// An entry returned by `readdir`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
	/// The inode the entry points to.
	pub ino: u32,
	/// The type of the entry, as hinted by the directory.
	pub kind: FileType,
	/// The name of the entry.
	pub name: String,
}

/// Filesystem usage statistics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Statfs {
	/// The size of a block in bytes.
	pub block_size: u32,
	/// The total number of blocks.
	pub total_blocks: u32,
	/// The number of unallocated data blocks.
	pub free_blocks: u32,
	/// The total number of inodes.
	pub total_inodes: u32,
	/// The number of unallocated inodes.
	pub free_inodes: u32,
	/// The maximum length of a name.
	pub name_max: u32,
}

/// The on-disk superblock.
///
/// All integers are little-endian. The record sits at the beginning of block
/// 0; the remainder of the block is zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Superblock {
	/// The filesystem's magic number.
	pub magic: u32,
	/// The size of a block in bytes. A power of two.
	pub block_size: u32,
	/// The total number of blocks in the image.
	pub total_blocks: u32,
	/// The total number of inodes.
	pub inode_count: u32,
	/// The first block of the inode bitmap.
	pub inode_bitmap_start: u32,
	/// The first block of the data bitmap.
	pub data_bitmap_start: u32,
	/// The first block of the inode table.
	pub inode_table_start: u32,
	/// The first block of the journal.
	pub journal_start: u32,
	/// The number of blocks in the journal.
	pub journal_len: u32,
	/// The first block of the data region.
	pub data_start: u32,
	/// The number of unallocated inodes.
	pub free_inodes: u32,
	/// The number of unallocated data blocks.
	pub free_blocks: u32,

	/// Reserved. Zero on write, ignored on read.
	pub _reserved: [u8; 16],
}

impl Superblock {
	/// Validates the superblock's magic number and geometry.
	///
	/// An inconsistency returns [`EINVAL`].
	pub fn validate(&self) -> EResult<()> {
		if self.magic != MAGIC {
			return Err(errno!(EINVAL));
		}
		let b = self.block_size;
		if !b.is_power_of_two() || !(512..=65536).contains(&b) {
			return Err(errno!(EINVAL));
		}
		if self.inode_count == 0 {
			return Err(errno!(EINVAL));
		}
		// Regions must be ordered, disjoint and inside the image
		let ordered = 0 < self.inode_bitmap_start
			&& self.inode_bitmap_start < self.data_bitmap_start
			&& self.data_bitmap_start < self.inode_table_start
			&& self.inode_table_start < self.journal_start
			&& self.journal_start < self.data_start
			&& self.data_start < self.total_blocks;
		if !ordered {
			return Err(errno!(EINVAL));
		}
		if self.journal_len < 2
			|| self.journal_start.checked_add(self.journal_len) != Some(self.data_start)
		{
			return Err(errno!(EINVAL));
		}
		// Each region must be large enough for what it indexes
		let bits_per_blk = b * 8;
		let inode_bitmap_blks = self.inode_count.div_ceil(bits_per_blk);
		let data_bitmap_blks = self.data_block_count().div_ceil(bits_per_blk);
		let inode_table_blks = self
			.inode_count
			.div_ceil(b / INODE_SIZE as u32);
		if self.data_bitmap_start - self.inode_bitmap_start < inode_bitmap_blks
			|| self.inode_table_start - self.data_bitmap_start < data_bitmap_blks
			|| self.journal_start - self.inode_table_start < inode_table_blks
		{
			return Err(errno!(EINVAL));
		}
		if self.free_inodes > self.inode_count || self.free_blocks > self.data_block_count() {
			return Err(errno!(EINVAL));
		}
		Ok(())
	}

	/// Returns the number of blocks in the data region.
	pub fn data_block_count(&self) -> u32 {
		self.total_blocks - self.data_start
	}

	/// Returns the log2 of the number of 32-bit block pointers per block.
	pub fn entries_per_block_log(&self) -> u32 {
		// A pointer is 4 bytes (`log2(4) == 2`)
		self.block_size.trailing_zeros() - 2
	}

	/// Returns the maximum size of a file in bytes.
	pub fn max_file_size(&self) -> u64 {
		let p = (self.block_size / 4) as u64;
		(inode::DIRECT_BLOCKS_COUNT as u64 + p + p * p) * self.block_size as u64
	}
}

/// A mounted filesystem instance.
///
/// The instance owns every manager: the block device, the in-memory
/// superblock, both caches and the journal. It is created by [`mount`] and
/// destroyed by [`unmount`]; requests are dispatched one at a time.
///
/// [`mount`]: WayneFs::mount
/// [`unmount`]: WayneFs::unmount
pub struct WayneFs {
	/// The underlying block device.
	pub(crate) dev: BlockDevice,
	/// The in-memory copy of the superblock.
	pub(crate) sp: Superblock,
	/// The page cache.
	pub(crate) pages: PageCache,
	/// The dentry cache.
	pub(crate) dentries: DentryCache,
	/// The journal.
	pub(crate) journal: Journal,
	/// Open handle counts, keyed by inode number.
	pub(crate) open_inodes: HashMap<u32, u32>,
}

impl WayneFs {
	/// Mounts the filesystem stored in the image at `path`.
	///
	/// Mounting validates the superblock, replays the journal if a crash left
	/// committed transactions in it, and takes an exclusive advisory lock on
	/// the image.
	pub fn mount(path: &Path) -> EResult<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		// Probe the superblock to learn the geometry
		let mut probe = [0u8; SUPERBLOCK_SIZE];
		file.read_exact_at(&mut probe, 0)?;
		let sp: Superblock = pod_read_unaligned(&probe);
		sp.validate()?;
		let mut dev = BlockDevice::new(file, sp.block_size, sp.total_blocks)?;
		let (head, sequence) = Journal::recover(&mut dev, &sp)?;
		// Recovery may have replayed a newer superblock
		let mut buf = vec![0u8; sp.block_size as usize];
		dev.read_block(0, &mut buf)?;
		let sp: Superblock = pod_read_unaligned(&buf[..SUPERBLOCK_SIZE]);
		sp.validate()?;
		info!(
			"mounted image {path}: {blocks} blocks of {bsize} bytes, {inodes} inodes",
			path = path.display(),
			blocks = sp.total_blocks,
			bsize = sp.block_size,
			inodes = sp.inode_count,
		);
		Ok(Self {
			pages: PageCache::new(sp.block_size),
			dentries: DentryCache::new(),
			journal: Journal::new(&sp, head, sequence),
			dev,
			sp,
			open_inodes: HashMap::new(),
		})
	}

	/// Unmounts the filesystem, flushing every dirty page.
	pub fn unmount(mut self) -> EResult<()> {
		self.pages.flush_all(&mut self.dev)?;
		self.dev.sync()?;
		info!("unmounted");
		Ok(())
	}

	/// Returns filesystem usage statistics.
	pub fn statfs(&self) -> Statfs {
		Statfs {
			block_size: self.sp.block_size,
			total_blocks: self.sp.total_blocks,
			free_blocks: self.sp.free_blocks,
			total_inodes: self.sp.inode_count,
			free_inodes: self.sp.free_inodes,
			name_max: crate::limits::NAME_MAX as u32,
		}
	}

	/// Returns the cached page for block `bno`, loading it on a miss.
	pub(crate) fn block(&mut self, bno: u32) -> EResult<RcPage> {
		self.pages.get(&mut self.dev, bno)
	}

	/// Snapshots the cached block `bno` into the current transaction's
	/// metadata set.
	///
	/// Every metadata mutation must be followed by a call to this function so
	/// the transaction carries the final buffer contents.
	pub(crate) fn stage_block(&mut self, bno: u32) -> EResult<()> {
		let page = self.pages.get(&mut self.dev, bno)?;
		let buf = page.slice().to_vec().into_boxed_slice();
		self.journal.stage_meta(bno, buf)
	}

	/// Adds the data block `bno` to the current transaction's ordered set.
	pub(crate) fn add_ordered(&mut self, bno: u32) -> EResult<()> {
		self.journal.add_ordered(bno)
	}

	/// Returns a zeroed, staged page for the freshly allocated metadata block
	/// `bno`.
	pub(crate) fn zero_meta_block(&mut self, bno: u32) -> EResult<RcPage> {
		let page = self.pages.get_zeroed(bno);
		self.stage_block(bno)?;
		Ok(page)
	}

	/// Writes the in-memory superblock into its block and stages it.
	pub(crate) fn flush_superblock(&mut self) -> EResult<()> {
		let sp = self.sp;
		let page = self.block(0)?;
		page.slice_mut()[..SUPERBLOCK_SIZE].copy_from_slice(bytes_of(&sp));
		page.mark_dirty();
		self.stage_block(0)
	}

	/// Runs `f` inside a journal transaction.
	///
	/// On success the transaction is committed before returning; on error it
	/// is aborted and the staged metadata discarded from the page cache. In
	/// both failure cases the in-memory superblock is reloaded, since the
	/// aborted transaction may have mutated its counters.
	pub(crate) fn run_txn<T, F: FnOnce(&mut Self) -> EResult<T>>(&mut self, f: F) -> EResult<T> {
		self.journal.begin()?;
		let res = f(self);
		match res {
			Ok(val) => {
				let Self {
					journal,
					dev,
					pages,
					..
				} = self;
				match journal.commit(dev, pages) {
					Ok(()) => Ok(val),
					Err(e) => {
						self.reload_superblock(e)?;
						Err(e)
					}
				}
			}
			Err(e) => {
				let Self {
					journal,
					pages,
					..
				} = self;
				journal.abort(pages);
				self.reload_superblock(e)?;
				Err(e)
			}
		}
	}

	/// Reloads the in-memory superblock from the page cache after a failed
	/// transaction.
	///
	/// `cause` is the error that triggered the rollback, logged for context.
	/// A reload failure leaves the filesystem unusable and propagates.
	fn reload_superblock(&mut self, cause: crate::errno::Errno) -> EResult<()> {
		let res = (|| -> EResult<()> {
			let page = self.block(0)?;
			let sp: Superblock = pod_read_unaligned(&page.slice()[..SUPERBLOCK_SIZE]);
			sp.validate()?;
			drop(page);
			self.sp = sp;
			Ok(())
		})();
		if let Err(e) = res {
			error!("superblock reload after failed transaction {cause}: {e}");
			return Err(e);
		}
		Ok(())
	}

	/// Finds a `0` bit in the bitmap starting at block `start_blk`, flips it,
	/// and returns its index.
	///
	/// `bits` is the number of indexable bits. If every bit is set, the
	/// function returns `None`.
	fn bitmap_alloc(&mut self, start_blk: u32, bits: u32) -> EResult<Option<u32>> {
		let bits_per_blk = self.sp.block_size * 8;
		let blk_count = bits.div_ceil(bits_per_blk);
		for i in 0..blk_count {
			let page = self.block(start_blk + i)?;
			let found = {
				let mut buf = page.slice_mut();
				let mut found = None;
				for (byte_off, byte) in buf.iter_mut().enumerate() {
					if *byte == 0xff {
						continue;
					}
					let bit = byte.trailing_ones();
					let index = i * bits_per_blk + byte_off as u32 * 8 + bit;
					if index >= bits {
						break;
					}
					*byte |= 1 << bit;
					found = Some(index);
					break;
				}
				found
			};
			if let Some(index) = found {
				page.mark_dirty();
				self.stage_block(start_blk + i)?;
				return Ok(Some(index));
			}
		}
		Ok(None)
	}

	/// Clears the bit `index` in the bitmap starting at block `start_blk`.
	///
	/// The function returns the previous value of the bit.
	fn bitmap_free(&mut self, start_blk: u32, index: u32) -> EResult<bool> {
		let bits_per_blk = self.sp.block_size * 8;
		let bno = start_blk + index / bits_per_blk;
		let page = self.block(bno)?;
		let prev = {
			let mut buf = page.slice_mut();
			let byte = &mut buf[(index % bits_per_blk) as usize / 8];
			let mask = 1 << (index % 8);
			let prev = *byte & mask != 0;
			*byte &= !mask;
			prev
		};
		page.mark_dirty();
		self.stage_block(bno)?;
		Ok(prev)
	}

	/// Reads the bit `index` in the bitmap starting at block `start_blk`.
	pub(crate) fn bitmap_test(&mut self, start_blk: u32, index: u32) -> EResult<bool> {
		let bits_per_blk = self.sp.block_size * 8;
		let page = self.block(start_blk + index / bits_per_blk)?;
		let buf = page.slice();
		Ok(buf[(index % bits_per_blk) as usize / 8] & (1 << (index % 8)) != 0)
	}

	/// Tells whether the inode `ino` is allocated.
	pub(crate) fn inode_allocated(&mut self, ino: u32) -> EResult<bool> {
		if ino == 0 || ino >= self.sp.inode_count {
			return Ok(false);
		}
		self.bitmap_test(self.sp.inode_bitmap_start, ino)
	}

	/// Allocates an inode number.
	///
	/// If no inode is left, the function returns [`ENOSPC`].
	pub(crate) fn alloc_inode_num(&mut self) -> EResult<u32> {
		if self.sp.free_inodes == 0 {
			return Err(errno!(ENOSPC));
		}
		let start = self.sp.inode_bitmap_start;
		let count = self.sp.inode_count;
		let Some(ino) = self.bitmap_alloc(start, count)? else {
			return Err(errno!(ENOSPC));
		};
		self.sp.free_inodes -= 1;
		self.flush_superblock()?;
		Ok(ino)
	}

	/// Marks the inode `ino` as free.
	pub(crate) fn free_inode_num(&mut self, ino: u32) -> EResult<()> {
		if ino == 0 || ino >= self.sp.inode_count {
			return Err(errno!(EUCLEAN));
		}
		let prev = self.bitmap_free(self.sp.inode_bitmap_start, ino)?;
		// Guard against counter overflow on a corrupted filesystem
		if prev {
			self.sp.free_inodes += 1;
			self.flush_superblock()?;
		}
		Ok(())
	}

	/// Allocates a data block and returns its physical block number.
	///
	/// If no block is left, the function returns [`ENOSPC`].
	pub(crate) fn alloc_block(&mut self) -> EResult<u32> {
		if self.sp.free_blocks == 0 {
			return Err(errno!(ENOSPC));
		}
		let start = self.sp.data_bitmap_start;
		let count = self.sp.data_block_count();
		let Some(index) = self.bitmap_alloc(start, count)? else {
			return Err(errno!(ENOSPC));
		};
		self.sp.free_blocks -= 1;
		self.flush_superblock()?;
		Ok(self.sp.data_start + index)
	}

	/// Marks the data block `bno` as free and drops its cached page.
	pub(crate) fn free_block(&mut self, bno: u32) -> EResult<()> {
		if bno < self.sp.data_start || bno >= self.sp.total_blocks {
			return Err(errno!(EUCLEAN));
		}
		let prev = self.bitmap_free(self.sp.data_bitmap_start, bno - self.sp.data_start)?;
		// Guard against counter overflow on a corrupted filesystem
		if prev {
			self.sp.free_blocks += 1;
			self.flush_superblock()?;
		}
		self.pages.discard(bno);
		Ok(())
	}

	/// Returns the block and byte offset at which the inode `ino` is stored.
	fn inode_pos(&self, ino: u32) -> EResult<(u32, usize)> {
		if ino == 0 || ino >= self.sp.inode_count {
			return Err(errno!(EINVAL));
		}
		let per_blk = self.sp.block_size / INODE_SIZE as u32;
		let bno = self.sp.inode_table_start + ino / per_blk;
		let off = (ino % per_blk) as usize * INODE_SIZE;
		Ok((bno, off))
	}

	/// Reads the inode `ino` from the inode table.
	pub(crate) fn read_inode(&mut self, ino: u32) -> EResult<Inode> {
		let (bno, off) = self.inode_pos(ino)?;
		let page = self.block(bno)?;
		let buf = page.slice();
		Ok(pod_read_unaligned(&buf[off..(off + INODE_SIZE)]))
	}

	/// Writes the inode `ino` into the inode table and stages the containing
	/// block.
	pub(crate) fn write_inode(&mut self, ino: u32, inode: &Inode) -> EResult<()> {
		let (bno, off) = self.inode_pos(ino)?;
		let page = self.block(bno)?;
		page.slice_mut()[off..(off + INODE_SIZE)].copy_from_slice(bytes_of(inode));
		page.mark_dirty();
		self.stage_block(bno)
	}

	/// Checks the allocation invariants of the filesystem.
	///
	/// The set of bits set in each bitmap must equal the set of objects
	/// reachable from live inodes, and the superblock's free counters must
	/// match the zero-bit population of the bitmaps. A violation returns
	/// [`EUCLEAN`].
	pub fn check_consistency(&mut self) -> EResult<()> {
		let sp = self.sp;
		let mut inode_used = vec![false; sp.inode_count as usize];
		let mut block_used = vec![false; sp.data_block_count() as usize];
		// Inode 0 is reserved
		inode_used[0] = true;
		// Walk from the root, plus open unlinked inodes kept alive by their
		// handles
		let mut stack = vec![ROOT_INO];
		stack.extend(self.open_inodes.keys().copied());
		while let Some(ino) = stack.pop() {
			let Some(used) = inode_used.get(ino as usize).copied() else {
				error!("directory entry references the out-of-range inode {ino}");
				return Err(errno!(EUCLEAN));
			};
			if used {
				continue;
			}
			inode_used[ino as usize] = true;
			let inode = self.read_inode(ino)?;
			self.mark_content_blocks(&inode, &mut block_used)?;
			if inode.file_type() == Some(FileType::Directory) {
				let mut children = Vec::new();
				inode.for_each_dirent(self, |_, ent| {
					if ent.ino != 0 && ent.name != b"." && ent.name != b".." {
						children.push(ent.ino);
					}
					true
				})?;
				stack.extend(children);
			}
		}
		// Compare with the bitmaps
		let mut free_inodes = 0;
		for (ino, used) in inode_used.iter().enumerate() {
			let bit = self.bitmap_test(sp.inode_bitmap_start, ino as u32)?;
			if bit != *used {
				error!("inode {ino}: bitmap bit {bit}, reachability {used}");
				return Err(errno!(EUCLEAN));
			}
			if !bit {
				free_inodes += 1;
			}
		}
		let mut free_blocks = 0;
		for (index, used) in block_used.iter().enumerate() {
			let bit = self.bitmap_test(sp.data_bitmap_start, index as u32)?;
			if bit != *used {
				let bno = sp.data_start + index as u32;
				error!("block {bno}: bitmap bit {bit}, reachability {used}");
				return Err(errno!(EUCLEAN));
			}
			if !bit {
				free_blocks += 1;
			}
		}
		if free_inodes != sp.free_inodes || free_blocks != sp.free_blocks {
			error!(
				"free counters: superblock has {}/{} inodes/blocks, bitmaps have {free_inodes}/{free_blocks}",
				sp.free_inodes, sp.free_blocks
			);
			return Err(errno!(EUCLEAN));
		}
		Ok(())
	}

	/// Marks every content and index block of `inode` in `block_used`.
	fn mark_content_blocks(&mut self, inode: &Inode, block_used: &mut [bool]) -> EResult<()> {
		let sp = self.sp;
		let mut mark = |bno: u32| -> EResult<()> {
			if bno < sp.data_start || bno >= sp.total_blocks {
				return Err(errno!(EUCLEAN));
			}
			block_used[(bno - sp.data_start) as usize] = true;
			Ok(())
		};
		for bno in &inode.blocks[..inode::DIRECT_BLOCKS_COUNT] {
			if *bno != 0 {
				mark(*bno)?;
			}
		}
		let single = inode.blocks[inode::SINGLE_INDIRECT_SLOT];
		if single != 0 {
			mark(single)?;
			for bno in self.index_entries(single)? {
				mark(bno)?;
			}
		}
		let double = inode.blocks[inode::DOUBLE_INDIRECT_SLOT];
		if double != 0 {
			mark(double)?;
			for mid in self.index_entries(double)? {
				mark(mid)?;
				for bno in self.index_entries(mid)? {
					mark(bno)?;
				}
			}
		}
		Ok(())
	}

	/// Returns the non-zero entries of the index block `bno`.
	pub(crate) fn index_entries(&mut self, bno: u32) -> EResult<Vec<u32>> {
		let page = self.block(bno)?;
		let buf = page.slice();
		Ok(buf
			.chunks_exact(4)
			.map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
			.filter(|b| *b != 0)
			.collect())
	}
}
