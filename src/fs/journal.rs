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

//! The journal makes metadata updates crash-consistent through write-ahead
//! logging, operated in ordered mode.
//!
//! Each externally visible mutating operation runs inside a transaction. A
//! transaction accumulates the final contents of every metadata block it
//! touches, plus the set of content blocks whose dirty pages must reach their
//! home location before the metadata referencing them becomes durable
//! (ordered mode). Content blocks are written in place, never into the log.
//!
//! Committing walks a fixed sequence, with a device barrier between phases:
//! 1. Flush the ordered content blocks in place
//! 2. Write a descriptor record listing the home of each metadata block
//! 3. Write the new contents of each metadata block into the log
//! 4. Write a commit record carrying the transaction id and a checksum over
//!    the descriptor and the metadata copies
//! 5. Checkpoint: write each metadata block to its home location, then
//!    advance the log head past the transaction
//!
//! A crash before step 4 leaves the transaction non-durable: recovery
//! discards it. A crash after step 4 leaves it replayable: recovery writes
//! the logged copies to their home locations. After step 5 the log space is
//! reclaimable.
//!
//! The log is a ring of blocks. Its first block holds the journal superblock
//! (head position and next transaction id); the remaining blocks carry
//! records. While idle, the log is empty and recovery is a no-op.

use crate::cache::page::PageCache;
use crate::checksum::{compute_crc32_lookuptable, compute_crc32_multi, CRC32_POLYNOM};
use crate::device::BlockDevice;
use crate::errno::EResult;
use crate::errno;
use crate::fs::Superblock;
use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use log::{debug, info, trace};
use std::collections::{BTreeMap, BTreeSet};
use std::mem::size_of;

/// Magic number of the journal superblock, `WJSB` in little-endian.
const JOURNAL_SB_MAGIC: u32 = 0x42534a57;
/// Magic number of a descriptor record, `WJDB` in little-endian.
const DESC_MAGIC: u32 = 0x42444a57;
/// Magic number of a commit record, `WJCB` in little-endian.
const COMMIT_MAGIC: u32 = 0x42434a57;

/// The journal superblock, stored in the first block of the journal region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct JournalSb {
	/// The journal superblock's magic number.
	pub magic: u32,
	/// Ring offset of the oldest record that has not been checkpointed.
	pub head: u32,
	/// The id of the next transaction expected at the head.
	pub sequence: u64,
}

/// The header of a descriptor record.
///
/// The header is followed by `count` entries of [`DescEntry`], one per
/// metadata block logged by the transaction, in log order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct DescHeader {
	/// The descriptor record's magic number.
	magic: u32,
	/// The number of metadata blocks in the transaction.
	count: u32,
	/// The transaction id.
	txn_id: u64,
}

/// A descriptor entry: the home location of one logged metadata block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct DescEntry {
	/// The home block number.
	bno: u32,
	/// Reserved flags. Zero on write, ignored on read.
	flags: u32,
}

/// A commit record, sealing a transaction.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct CommitRecord {
	/// The commit record's magic number.
	magic: u32,
	/// CRC32 over the descriptor block and the metadata copies, in log order.
	checksum: u32,
	/// The transaction id.
	txn_id: u64,
}

/// An open transaction, accumulating staged writes.
pub struct Transaction {
	/// The transaction id.
	id: u64,
	/// Final contents of each staged metadata block, keyed by home block
	/// number.
	meta: BTreeMap<u32, Box<[u8]>>,
	/// Content blocks whose dirty pages must be flushed before commit.
	ordered: BTreeSet<u32>,
}

/// The journal.
pub struct Journal {
	/// The first block of the journal region.
	start: u32,
	/// The number of blocks in the journal region.
	len: u32,
	/// Ring offset of the oldest record that has not been checkpointed.
	head: u32,
	/// The id of the next transaction.
	sequence: u64,
	/// CRC32 lookup table for commit records.
	crc_table: [u32; 256],
	/// The currently open transaction, if any.
	txn: Option<Transaction>,
}

impl Journal {
	/// Creates the journal manager for a mounted filesystem.
	///
	/// `head` and `sequence` are the log position returned by [`recover`].
	///
	/// [`recover`]: Journal::recover
	pub fn new(sp: &Superblock, head: u32, sequence: u64) -> Self {
		let mut crc_table = [0u32; 256];
		compute_crc32_lookuptable(&mut crc_table, CRC32_POLYNOM);
		Self {
			start: sp.journal_start,
			len: sp.journal_len,
			head,
			sequence,
			crc_table,
			txn: None,
		}
	}

	/// The number of ring blocks usable for records.
	fn usable(&self) -> u32 {
		self.len - 1
	}

	/// Returns the physical block holding the `i`-th record after the head.
	pub(crate) fn ring(&self, i: u32) -> u32 {
		self.start + 1 + ((self.head + i) % self.usable())
	}

	/// Tells whether a transaction is open.
	pub fn is_open(&self) -> bool {
		self.txn.is_some()
	}

	/// Opens a new transaction.
	///
	/// Only one transaction may be open at a time; a second `begin` returns
	/// [`EALREADY`].
	pub fn begin(&mut self) -> EResult<()> {
		if self.txn.is_some() {
			return Err(errno!(EALREADY));
		}
		trace!("journal: begin transaction {}", self.sequence);
		self.txn = Some(Transaction {
			id: self.sequence,
			meta: BTreeMap::new(),
			ordered: BTreeSet::new(),
		});
		Ok(())
	}

	/// Stages the final contents of the metadata block `bno` into the open
	/// transaction.
	///
	/// Staging the same block again replaces the previous contents.
	pub fn stage_meta(&mut self, bno: u32, buf: Box<[u8]>) -> EResult<()> {
		let txn = self.txn.as_mut().ok_or_else(|| errno!(EINVAL))?;
		txn.meta.insert(bno, buf);
		Ok(())
	}

	/// Adds the content block `bno` to the open transaction's ordered set.
	pub fn add_ordered(&mut self, bno: u32) -> EResult<()> {
		let txn = self.txn.as_mut().ok_or_else(|| errno!(EINVAL))?;
		txn.ordered.insert(bno);
		Ok(())
	}

	/// Commits the open transaction.
	///
	/// On success the transaction is durable and checkpointed. On failure
	/// before the commit record is durable, the transaction is rolled back
	/// and its staged metadata discarded from `pages`; on failure during the
	/// checkpoint, the transaction remains recoverable from the log and the
	/// head is left in place.
	pub fn commit(&mut self, dev: &mut BlockDevice, pages: &mut PageCache) -> EResult<()> {
		let txn = self.txn.take().ok_or_else(|| errno!(EINVAL))?;
		if txn.meta.is_empty() && txn.ordered.is_empty() {
			trace!("journal: transaction {} is empty, nothing to commit", txn.id);
			return Ok(());
		}
		debug!(
			"journal: commit transaction {} ({} metadata blocks, {} ordered blocks)",
			txn.id,
			txn.meta.len(),
			txn.ordered.len(),
		);
		if let Err(e) = self.write_log(&txn, dev, pages) {
			// The commit record is not durable: throw away the staged
			// metadata so the next access reloads the clean on-disk copies
			for bno in txn.meta.keys() {
				pages.discard(*bno);
			}
			return Err(e);
		}
		self.checkpoint(&txn, dev, pages)
	}

	/// Runs steps 1 to 4 of the commit sequence: ordered data flush, then
	/// descriptor, metadata copies and commit record, each made durable
	/// before the next.
	fn write_log(
		&mut self,
		txn: &Transaction,
		dev: &mut BlockDevice,
		pages: &mut PageCache,
	) -> EResult<()> {
		let blk_size = dev.block_size() as usize;
		let count = txn.meta.len();
		let max_entries = (blk_size - size_of::<DescHeader>()) / size_of::<DescEntry>();
		if count + 2 > self.usable() as usize || count > max_entries {
			return Err(errno!(ENOSPC));
		}
		// Ordered data flush
		pages.flush_set(dev, txn.ordered.iter().copied())?;
		dev.sync()?;
		// Descriptor record
		let mut desc = vec![0u8; blk_size];
		desc[..size_of::<DescHeader>()].copy_from_slice(bytes_of(&DescHeader {
			magic: DESC_MAGIC,
			count: count as u32,
			txn_id: txn.id,
		}));
		for (i, bno) in txn.meta.keys().enumerate() {
			let off = size_of::<DescHeader>() + i * size_of::<DescEntry>();
			desc[off..(off + size_of::<DescEntry>())].copy_from_slice(bytes_of(&DescEntry {
				bno: *bno,
				flags: 0,
			}));
		}
		dev.write_block(self.ring(0), &desc)?;
		dev.sync()?;
		// Metadata copies
		for (i, buf) in txn.meta.values().enumerate() {
			dev.write_block(self.ring(1 + i as u32), buf)?;
		}
		dev.sync()?;
		// Commit record
		let mut parts: Vec<&[u8]> = Vec::with_capacity(count + 1);
		parts.push(&desc);
		parts.extend(txn.meta.values().map(|buf| &buf[..]));
		let checksum = compute_crc32_multi(&parts, &self.crc_table);
		let mut commit = vec![0u8; blk_size];
		commit[..size_of::<CommitRecord>()].copy_from_slice(bytes_of(&CommitRecord {
			magic: COMMIT_MAGIC,
			checksum,
			txn_id: txn.id,
		}));
		dev.write_block(self.ring(1 + count as u32), &commit)?;
		dev.sync()?;
		Ok(())
	}

	/// Runs step 5 of the commit sequence: writes every logged metadata block
	/// to its home location through the page cache, then advances the head
	/// past the transaction.
	fn checkpoint(
		&mut self,
		txn: &Transaction,
		dev: &mut BlockDevice,
		pages: &mut PageCache,
	) -> EResult<()> {
		for (bno, buf) in &txn.meta {
			// The log is authoritative: overwrite the cached page with the
			// committed contents
			let page = pages.get(dev, *bno)?;
			page.slice_mut().copy_from_slice(buf);
			page.mark_dirty();
			pages.flush(dev, *bno)?;
		}
		dev.sync()?;
		self.head = (self.head + 2 + txn.meta.len() as u32) % self.usable();
		self.sequence = txn.id + 1;
		write_journal_sb(dev, self.start, self.head, self.sequence)?;
		dev.sync()?;
		trace!("journal: transaction {} checkpointed", txn.id);
		Ok(())
	}

	/// Aborts the open transaction, discarding its staged metadata from
	/// `pages` so the next access reloads the clean on-disk copies.
	///
	/// Aborting with no open transaction does nothing.
	pub fn abort(&mut self, pages: &mut PageCache) {
		let Some(txn) = self.txn.take() else {
			return;
		};
		debug!("journal: abort transaction {}", txn.id);
		for bno in txn.meta.keys() {
			pages.discard(*bno);
		}
	}

	/// Scans the log and replays every committed transaction, bringing the
	/// filesystem back to the state of the last durable commit.
	///
	/// Run at mount, before anything else reads the filesystem. A partial
	/// transaction (no commit record, or a checksum mismatch) and everything
	/// after it are discarded.
	///
	/// On success, the function returns the new head position and sequence
	/// number. If the journal superblock itself is invalid, the function
	/// returns [`EUCLEAN`].
	pub fn recover(dev: &mut BlockDevice, sp: &Superblock) -> EResult<(u32, u64)> {
		let blk_size = sp.block_size as usize;
		let mut buf = vec![0u8; blk_size];
		dev.read_block(sp.journal_start, &mut buf)?;
		let jsb: JournalSb = pod_read_unaligned(&buf[..size_of::<JournalSb>()]);
		let usable = sp.journal_len - 1;
		if jsb.magic != JOURNAL_SB_MAGIC || jsb.head >= usable {
			return Err(errno!(EUCLEAN));
		}
		let mut crc_table = [0u32; 256];
		compute_crc32_lookuptable(&mut crc_table, CRC32_POLYNOM);
		let ring = |off: u32| sp.journal_start + 1 + (off % usable);
		let max_entries = (blk_size - size_of::<DescHeader>()) / size_of::<DescEntry>();
		let mut head = jsb.head;
		let mut sequence = jsb.sequence;
		let mut replayed = 0u32;
		loop {
			// Descriptor record
			let mut desc = vec![0u8; blk_size];
			dev.read_block(ring(head), &mut desc)?;
			let dh: DescHeader = pod_read_unaligned(&desc[..size_of::<DescHeader>()]);
			if dh.magic != DESC_MAGIC || dh.txn_id != sequence {
				break;
			}
			let count = dh.count as usize;
			if count == 0 || count > max_entries || count + 2 > usable as usize {
				break;
			}
			let entries: Vec<DescEntry> = (0..count)
				.map(|i| {
					let off = size_of::<DescHeader>() + i * size_of::<DescEntry>();
					pod_read_unaligned(&desc[off..(off + size_of::<DescEntry>())])
				})
				.collect();
			// Metadata copies
			let mut metas = Vec::with_capacity(count);
			for i in 0..count {
				let mut meta = vec![0u8; blk_size];
				dev.read_block(ring(head + 1 + i as u32), &mut meta)?;
				metas.push(meta);
			}
			// Commit record
			let mut commit = vec![0u8; blk_size];
			dev.read_block(ring(head + 1 + count as u32), &mut commit)?;
			let cr: CommitRecord = pod_read_unaligned(&commit[..size_of::<CommitRecord>()]);
			if cr.magic != COMMIT_MAGIC || cr.txn_id != sequence {
				break;
			}
			let mut parts: Vec<&[u8]> = Vec::with_capacity(count + 1);
			parts.push(&desc);
			parts.extend(metas.iter().map(|buf| &buf[..]));
			if compute_crc32_multi(&parts, &crc_table) != cr.checksum {
				break;
			}
			// A committed transaction pointing into the journal region cannot
			// be replayed safely
			let homes_valid = entries
				.iter()
				.all(|e| e.bno < sp.total_blocks && (e.bno < sp.journal_start || e.bno >= sp.data_start));
			if !homes_valid {
				return Err(errno!(EUCLEAN));
			}
			// Replay
			for (entry, meta) in entries.iter().zip(&metas) {
				dev.write_block(entry.bno, meta)?;
			}
			debug!("journal: replayed transaction {sequence}");
			head = (head + 2 + count as u32) % usable;
			sequence += 1;
			replayed += 1;
		}
		if replayed > 0 {
			dev.sync()?;
			write_journal_sb(dev, sp.journal_start, head, sequence)?;
			dev.sync()?;
			info!("journal: recovery replayed {replayed} transaction(s)");
		}
		Ok((head, sequence))
	}

	/// Runs the commit sequence up to the durable commit record, leaving the
	/// checkpoint undone, as a crash between the two would. Returns the
	/// number of log records written.
	#[cfg(test)]
	pub(crate) fn commit_without_checkpoint(
		&mut self,
		dev: &mut BlockDevice,
		pages: &mut PageCache,
	) -> EResult<u32> {
		let txn = self.txn.take().ok_or_else(|| errno!(EINVAL))?;
		self.write_log(&txn, dev, pages)?;
		Ok(2 + txn.meta.len() as u32)
	}
}

/// Writes the journal superblock.
fn write_journal_sb(dev: &mut BlockDevice, start: u32, head: u32, sequence: u64) -> EResult<()> {
	let mut buf = vec![0u8; dev.block_size() as usize];
	buf[..size_of::<JournalSb>()].copy_from_slice(bytes_of(&JournalSb {
		magic: JOURNAL_SB_MAGIC,
		head,
		sequence,
	}));
	dev.write_block(start, &buf)
}

/// Initializes an empty journal region. Used by the formatter.
pub fn init_journal(dev: &mut BlockDevice, start: u32) -> EResult<()> {
	write_journal_sb(dev, start, 0, 1)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::fs::{FileType, WayneFs, ROOT_INO};
	use crate::test_util::TempImage;

	#[test]
	fn idle_log_recovery_is_noop() {
		let img = TempImage::small();
		let fs = WayneFs::mount(&img.path).unwrap();
		let sp = fs.sp;
		drop(fs);
		let mut fs = WayneFs::mount(&img.path).unwrap();
		assert_eq!(fs.journal.head, 0);
		assert_eq!(fs.journal.sequence, 1);
		assert_eq!(fs.sp.free_blocks, sp.free_blocks);
		fs.check_consistency().unwrap();
	}

	#[test]
	fn committed_transactions_advance_the_head() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.mkdir("/d", 0o755).unwrap();
		let seq = fs.journal.sequence;
		assert!(seq > 1);
		drop(fs);
		// After a clean run, the log is empty: recovery replays nothing
		let mut fs = WayneFs::mount(&img.path).unwrap();
		assert_eq!(fs.journal.sequence, seq);
		assert_eq!(fs.lookup("/", "d").unwrap().kind, FileType::Directory);
		fs.check_consistency().unwrap();
	}

	#[test]
	fn recovery_replays_committed_transaction() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		// Run a mkdir whose checkpoint never happens
		fs.journal.begin().unwrap();
		fs.do_mkdir("/r", 0o755).unwrap();
		{
			let WayneFs {
				journal,
				dev,
				pages,
				..
			} = &mut fs;
			journal.commit_without_checkpoint(dev, pages).unwrap();
		}
		// Drop without flushing anything: the only trace is the log
		drop(fs);
		let mut fs = WayneFs::mount(&img.path).unwrap();
		let stat = fs.getattr("/r").unwrap();
		assert_eq!(stat.kind, FileType::Directory);
		assert_eq!(stat.nlink, 2);
		let names: Vec<String> = fs
			.readdir("/r")
			.unwrap()
			.into_iter()
			.map(|e| e.name)
			.collect();
		assert_eq!(names, vec![".", ".."]);
		fs.check_consistency().unwrap();
	}

	#[test]
	fn recovery_discards_torn_transaction() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.journal.begin().unwrap();
		fs.do_mkdir("/r2", 0o755).unwrap();
		let records = {
			let WayneFs {
				journal,
				dev,
				pages,
				..
			} = &mut fs;
			journal.commit_without_checkpoint(dev, pages).unwrap()
		};
		// Simulate a crash before the commit record became durable
		let commit_bno = fs.journal.ring(records - 1);
		let zeros = vec![0u8; fs.sp.block_size as usize];
		fs.dev.write_block(commit_bno, &zeros).unwrap();
		drop(fs);
		let mut fs = WayneFs::mount(&img.path).unwrap();
		assert_eq!(fs.getattr("/r2").err(), Some(errno!(ENOENT)));
		fs.check_consistency().unwrap();
	}

	#[test]
	fn recovery_discards_corrupted_metadata() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.journal.begin().unwrap();
		fs.do_mkdir("/r3", 0o755).unwrap();
		{
			let WayneFs {
				journal,
				dev,
				pages,
				..
			} = &mut fs;
			journal.commit_without_checkpoint(dev, pages).unwrap();
		}
		// Flip a byte in the first logged metadata block: the checksum no
		// longer matches, so the transaction must be discarded
		let meta_bno = fs.journal.ring(1);
		let mut buf = vec![0u8; fs.sp.block_size as usize];
		fs.dev.read_block(meta_bno, &mut buf).unwrap();
		buf[0] ^= 0xff;
		fs.dev.write_block(meta_bno, &buf).unwrap();
		drop(fs);
		let mut fs = WayneFs::mount(&img.path).unwrap();
		assert_eq!(fs.getattr("/r3").err(), Some(errno!(ENOENT)));
		fs.check_consistency().unwrap();
	}

	#[test]
	fn rename_recovers_atomically() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.mkdir("/a", 0o755).unwrap();
		fs.mkdir("/b", 0o755).unwrap();
		fs.create("/a/f", 0o644).unwrap();
		// Crash between the rename's commit record and its checkpoint
		fs.journal.begin().unwrap();
		fs.do_rename("/a/f", "/b/g").unwrap();
		{
			let WayneFs {
				journal,
				dev,
				pages,
				..
			} = &mut fs;
			journal.commit_without_checkpoint(dev, pages).unwrap();
		}
		drop(fs);
		let mut fs = WayneFs::mount(&img.path).unwrap();
		// Replay applies the whole transaction: never both names, never none
		assert_eq!(fs.getattr("/a/f").err(), Some(errno!(ENOENT)));
		assert_eq!(fs.getattr("/b/g").unwrap().kind, FileType::Regular);
		fs.check_consistency().unwrap();
	}

	#[test]
	fn rename_crash_before_commit_keeps_the_source() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.mkdir("/a", 0o755).unwrap();
		fs.create("/a/f", 0o644).unwrap();
		// Crash before the commit record is durable: the rename never
		// happened
		fs.journal.begin().unwrap();
		fs.do_rename("/a/f", "/a/g").unwrap();
		let records = {
			let WayneFs {
				journal,
				dev,
				pages,
				..
			} = &mut fs;
			journal.commit_without_checkpoint(dev, pages).unwrap()
		};
		let commit_bno = fs.journal.ring(records - 1);
		let zeros = vec![0u8; fs.sp.block_size as usize];
		fs.dev.write_block(commit_bno, &zeros).unwrap();
		drop(fs);
		let mut fs = WayneFs::mount(&img.path).unwrap();
		assert_eq!(fs.getattr("/a/f").unwrap().kind, FileType::Regular);
		assert_eq!(fs.getattr("/a/g").err(), Some(errno!(ENOENT)));
		fs.check_consistency().unwrap();
	}

	#[test]
	fn ordered_data_is_durable_before_the_commit() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		let ino = fs.create("/f", 0o644).unwrap();
		// Write through a transaction whose checkpoint never happens: the
		// content must still be there after replay, because ordered mode
		// flushed it before the commit record became durable
		fs.journal.begin().unwrap();
		fs.do_write(ino, 0, b"ordered bytes").unwrap();
		{
			let WayneFs {
				journal,
				dev,
				pages,
				..
			} = &mut fs;
			journal.commit_without_checkpoint(dev, pages).unwrap();
		}
		drop(fs);
		let mut fs = WayneFs::mount(&img.path).unwrap();
		let ino = fs.open("/f", 0).unwrap();
		let mut buf = [0u8; 13];
		assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 13);
		assert_eq!(&buf, b"ordered bytes");
		fs.release(ino).unwrap();
		fs.check_consistency().unwrap();
	}

	#[test]
	fn abort_discards_staged_metadata() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		let free_inodes = fs.sp.free_inodes;
		// Fail after the mutations: the transaction must roll back entirely
		let res: crate::errno::EResult<()> = fs.run_txn(|fs| {
			fs.do_mkdir("/gone", 0o755)?;
			Err(errno!(EIO))
		});
		assert_eq!(res, Err(errno!(EIO)));
		assert_eq!(fs.getattr("/gone").err(), Some(errno!(ENOENT)));
		assert_eq!(fs.sp.free_inodes, free_inodes);
		let root = fs.read_inode(ROOT_INO).unwrap();
		assert_eq!(root.nlink, 2);
		fs.check_consistency().unwrap();
	}
}
