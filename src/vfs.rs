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

//! The operation layer implements the POSIX operation set on top of the
//! lower managers.
//!
//! Every externally visible mutating operation runs as a single journal
//! transaction, committed before the operation returns success. Non-mutating
//! operations (`getattr`, `readdir`, `lookup`, `read`, `readlink`, `statfs`)
//! open no transaction.
//!
//! Path resolution consults the dentry cache and falls back to walking the
//! directory entries; `.` and `..` components resolve through the entries
//! every directory stores for them.

use crate::errno::EResult;
use crate::errno;
use crate::fs::inode::Inode;
use crate::fs::{DirEntry, FileType, Stat, WayneFs, ROOT_INO};
use crate::limits::{LINK_MAX, SYMLINK_MAX};
use crate::path;
use log::debug;

/// Builds the canonical path of the entry `name` inside `parent`.
fn child_key(parent: &str, name: &str) -> String {
	if parent == "/" {
		format!("/{name}")
	} else {
		format!("{parent}/{name}")
	}
}

impl WayneFs {
	/// Resolves `pathname` to an inode number and file type.
	fn resolve(&mut self, pathname: &str) -> EResult<(u32, FileType)> {
		path::check(pathname)?;
		// Paths with `..` components bypass the dentry cache
		let key = path::canonical(pathname);
		if let Some(key) = &key {
			if key == "/" {
				return Ok((ROOT_INO, FileType::Directory));
			}
			match self.dentries.get(key) {
				Some(Some((ino, kind))) => {
					if self.dentry_valid(ino, kind)? {
						return Ok((ino, kind));
					}
					self.dentries.invalidate(key);
				}
				Some(None) => return Err(errno!(ENOENT)),
				None => {}
			}
		}
		// Walk from the root
		let mut cur = ROOT_INO;
		let mut cur_kind = FileType::Directory;
		let mut prefix = String::new();
		let mut comps = path::components(pathname).peekable();
		while let Some(name) = comps.next() {
			if cur_kind != FileType::Directory {
				return Err(errno!(ENOTDIR));
			}
			path::check_name(name)?;
			let dir = self.read_inode(cur)?;
			let Some((ino, _, kind)) = dir.get_dirent(name.as_bytes(), self)? else {
				if comps.peek().is_none() {
					if let Some(key) = key {
						self.dentries.insert_negative(key);
					}
				}
				return Err(errno!(ENOENT));
			};
			let kind = FileType::from_indicator(kind).ok_or_else(|| errno!(EUCLEAN))?;
			cur = ino;
			cur_kind = kind;
			if key.is_some() {
				prefix.push('/');
				prefix.push_str(name);
				self.dentries.insert(prefix.clone(), ino, kind);
			}
		}
		Ok((cur, cur_kind))
	}

	/// Validates a dentry cache hit: the inode must still be allocated and of
	/// the cached type.
	fn dentry_valid(&mut self, ino: u32, kind: FileType) -> EResult<bool> {
		if !self.inode_allocated(ino)? {
			return Ok(false);
		}
		Ok(self.read_inode(ino)?.file_type() == Some(kind))
	}

	/// Resolves the parent directory of `pathname` and validates the last
	/// component's name.
	///
	/// Returns the parent's inode, the parent path and the name.
	fn resolve_parent<'p>(&mut self, pathname: &'p str) -> EResult<(u32, &'p str, &'p str)> {
		let (parent_path, name) = path::split_parent(pathname)?;
		path::check_name(name)?;
		let (pino, pkind) = self.resolve(parent_path)?;
		if pkind != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		Ok((pino, parent_path, name))
	}

	/// Drops every dentry cached under the directory `parent_path`.
	fn invalidate_dir(&mut self, parent_path: &str) {
		match path::canonical(parent_path) {
			Some(canon) => self.dentries.invalidate_prefix(&canon),
			// A non-canonical parent: be conservative
			None => self.dentries.invalidate_prefix("/"),
		}
	}

	/// Reads the inode `ino`, failing with [`EBADF`] if it is not allocated.
	fn inode_checked(&mut self, ino: u32) -> EResult<Inode> {
		if !self.inode_allocated(ino)? {
			return Err(errno!(EBADF));
		}
		self.read_inode(ino)
	}

	/// Returns the attributes of the file at `pathname`.
	pub fn getattr(&mut self, pathname: &str) -> EResult<Stat> {
		let (ino, _) = self.resolve(pathname)?;
		self.read_inode(ino)?.stat()
	}

	/// Returns the attributes of the entry `name` inside the directory
	/// `parent`, consulting and populating the dentry cache.
	pub fn lookup(&mut self, parent: &str, name: &str) -> EResult<Stat> {
		path::check(parent)?;
		path::check_name(name)?;
		let (pino, pkind) = self.resolve(parent)?;
		if pkind != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let key = if name != "." && name != ".." {
			path::canonical(parent).map(|canon| child_key(&canon, name))
		} else {
			None
		};
		if let Some(key) = &key {
			match self.dentries.get(key) {
				Some(Some((ino, kind))) => {
					if self.dentry_valid(ino, kind)? {
						return self.read_inode(ino)?.stat();
					}
					self.dentries.invalidate(key);
				}
				Some(None) => return Err(errno!(ENOENT)),
				None => {}
			}
		}
		let dir = self.read_inode(pino)?;
		match dir.get_dirent(name.as_bytes(), self)? {
			Some((ino, _, kind)) => {
				let kind = FileType::from_indicator(kind).ok_or_else(|| errno!(EUCLEAN))?;
				if let Some(key) = key {
					self.dentries.insert(key, ino, kind);
				}
				self.read_inode(ino)?.stat()
			}
			None => {
				if let Some(key) = key {
					self.dentries.insert_negative(key);
				}
				Err(errno!(ENOENT))
			}
		}
	}

	/// Returns the entries of the directory at `pathname`, including `.` and
	/// `..`.
	pub fn readdir(&mut self, pathname: &str) -> EResult<Vec<DirEntry>> {
		let (ino, kind) = self.resolve(pathname)?;
		if kind != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let dir = self.read_inode(ino)?;
		let mut entries = Vec::new();
		let mut res = Ok(());
		dir.for_each_dirent(self, |_, ent| {
			if ent.is_free() {
				return true;
			}
			let Some(kind) = FileType::from_indicator(ent.kind) else {
				res = Err(errno!(EUCLEAN));
				return false;
			};
			let Ok(name) = String::from_utf8(ent.name.clone()) else {
				res = Err(errno!(EUCLEAN));
				return false;
			};
			entries.push(DirEntry {
				ino: ent.ino,
				kind,
				name,
			});
			true
		})?;
		res?;
		Ok(entries)
	}

	/// Creates the directory at `pathname` with the permission bits `mode`.
	pub fn mkdir(&mut self, pathname: &str, mode: u16) -> EResult<()> {
		self.run_txn(|fs| fs.do_mkdir(pathname, mode))
	}

	pub(crate) fn do_mkdir(&mut self, pathname: &str, mode: u16) -> EResult<()> {
		let (pino, parent_path, name) = self.resolve_parent(pathname)?;
		let mut parent = self.read_inode(pino)?;
		if parent.get_dirent(name.as_bytes(), self)?.is_some() {
			return Err(errno!(EEXIST));
		}
		if parent.nlink >= LINK_MAX {
			return Err(errno!(EMLINK));
		}
		let ino = self.alloc_inode_num()?;
		// `.` and the parent's entry make the initial link count 2
		let mut inode = Inode::new(FileType::Directory, mode, 0, 0, 2);
		inode.add_dirent(self, ino, b".", FileType::Directory)?;
		inode.add_dirent(self, pino, b"..", FileType::Directory)?;
		parent.add_dirent(self, ino, name.as_bytes(), FileType::Directory)?;
		parent.nlink += 1;
		parent.touch(true);
		self.write_inode(ino, &inode)?;
		self.write_inode(pino, &parent)?;
		self.invalidate_dir(parent_path);
		Ok(())
	}

	/// Removes the empty directory at `pathname`.
	pub fn rmdir(&mut self, pathname: &str) -> EResult<()> {
		self.run_txn(|fs| fs.do_rmdir(pathname))
	}

	fn do_rmdir(&mut self, pathname: &str) -> EResult<()> {
		let (pino, parent_path, name) = self.resolve_parent(pathname)?;
		if name == "." || name == ".." {
			return Err(errno!(EINVAL));
		}
		let mut parent = self.read_inode(pino)?;
		let (ino, off, kind) = parent
			.get_dirent(name.as_bytes(), self)?
			.ok_or_else(|| errno!(ENOENT))?;
		if FileType::from_indicator(kind) != Some(FileType::Directory) {
			return Err(errno!(ENOTDIR));
		}
		let mut target = self.read_inode(ino)?;
		if !target.is_dir_empty(self)? {
			return Err(errno!(ENOTEMPTY));
		}
		parent.set_dirent_ino(off, 0, 0, self)?;
		parent.nlink -= 1;
		parent.touch(true);
		target.nlink = 0;
		target.free_content(self)?;
		self.write_inode(ino, &target)?;
		self.free_inode_num(ino)?;
		self.write_inode(pino, &parent)?;
		self.invalidate_dir(parent_path);
		Ok(())
	}

	/// Creates a regular file at `pathname` with the permission bits `mode`
	/// and returns its inode number.
	pub fn create(&mut self, pathname: &str, mode: u16) -> EResult<u32> {
		self.run_txn(|fs| fs.do_create(pathname, mode))
	}

	fn do_create(&mut self, pathname: &str, mode: u16) -> EResult<u32> {
		let (pino, parent_path, name) = self.resolve_parent(pathname)?;
		let mut parent = self.read_inode(pino)?;
		if parent.get_dirent(name.as_bytes(), self)?.is_some() {
			return Err(errno!(EEXIST));
		}
		let ino = self.alloc_inode_num()?;
		let inode = Inode::new(FileType::Regular, mode, 0, 0, 1);
		parent.add_dirent(self, ino, name.as_bytes(), FileType::Regular)?;
		parent.touch(true);
		self.write_inode(ino, &inode)?;
		self.write_inode(pino, &parent)?;
		self.invalidate_dir(parent_path);
		Ok(ino)
	}

	/// Opens the file at `pathname` and returns its inode number as handle.
	///
	/// `flags` is accepted for the host layer's sake; symbolic links are
	/// expected to be resolved by the host before the call, so opening one
	/// returns [`ELOOP`].
	pub fn open(&mut self, pathname: &str, _flags: u32) -> EResult<u32> {
		let (ino, kind) = self.resolve(pathname)?;
		if kind == FileType::Link {
			return Err(errno!(ELOOP));
		}
		*self.open_inodes.entry(ino).or_insert(0) += 1;
		Ok(ino)
	}

	/// Closes one handle on `ino`.
	///
	/// Releasing the last handle of an unlinked inode reclaims its blocks
	/// and the inode itself.
	pub fn release(&mut self, ino: u32) -> EResult<()> {
		let Some(count) = self.open_inodes.get_mut(&ino) else {
			return Err(errno!(EBADF));
		};
		*count -= 1;
		if *count > 0 {
			return Ok(());
		}
		self.open_inodes.remove(&ino);
		let inode = self.read_inode(ino)?;
		if inode.nlink == 0 {
			debug!("reclaiming orphan inode {ino}");
			self.run_txn(|fs| {
				let mut inode = fs.read_inode(ino)?;
				inode.free_content(fs)?;
				fs.write_inode(ino, &inode)?;
				fs.free_inode_num(ino)
			})?;
		}
		Ok(())
	}

	/// Reads up to `buf.len()` bytes from the file `ino` at the byte offset
	/// `off`.
	///
	/// Holes read as zeros; reading at or past the end of the file returns a
	/// short count.
	pub fn read(&mut self, ino: u32, off: u64, buf: &mut [u8]) -> EResult<usize> {
		let inode = self.inode_checked(ino)?;
		match inode.file_type() {
			Some(FileType::Regular) => {}
			Some(FileType::Directory) => return Err(errno!(EISDIR)),
			Some(FileType::Link) => return Err(errno!(EINVAL)),
			None => return Err(errno!(EUCLEAN)),
		}
		if off >= inode.size {
			return Ok(0);
		}
		let blk_size = self.sp.block_size as u64;
		let max = (buf.len() as u64).min(inode.size - off) as usize;
		let mut i = 0;
		while i < max {
			let pos = off + i as u64;
			let inner = (pos % blk_size) as usize;
			let len = (max - i).min(blk_size as usize - inner);
			match inode.translate_blk_off((pos / blk_size) as u32, self)? {
				Some(bno) => {
					let page = self.block(bno)?;
					buf[i..(i + len)].copy_from_slice(&page.slice()[inner..(inner + len)]);
				}
				// Hole
				None => buf[i..(i + len)].fill(0),
			}
			i += len;
		}
		Ok(max)
	}

	/// Writes `buf` to the file `ino` at the byte offset `off`, extending the
	/// file and allocating blocks as needed.
	pub fn write(&mut self, ino: u32, off: u64, buf: &[u8]) -> EResult<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		self.run_txn(|fs| fs.do_write(ino, off, buf))
	}

	pub(crate) fn do_write(&mut self, ino: u32, off: u64, buf: &[u8]) -> EResult<usize> {
		let mut inode = self.inode_checked(ino)?;
		match inode.file_type() {
			Some(FileType::Regular) => {}
			Some(FileType::Directory) => return Err(errno!(EISDIR)),
			Some(FileType::Link) => return Err(errno!(EINVAL)),
			None => return Err(errno!(EUCLEAN)),
		}
		let end = off.checked_add(buf.len() as u64).ok_or_else(|| errno!(EFBIG))?;
		if end > self.sp.max_file_size() {
			return Err(errno!(EFBIG));
		}
		let blk_size = self.sp.block_size as u64;
		let mut i = 0;
		while i < buf.len() {
			let pos = off + i as u64;
			let blk_off = (pos / blk_size) as u32;
			let inner = (pos % blk_size) as usize;
			let len = (buf.len() - i).min(blk_size as usize - inner);
			let bno = match inode.translate_blk_off(blk_off, self)? {
				Some(bno) => bno,
				None => inode.alloc_content_blk(blk_off, self)?,
			};
			let page = self.block(bno)?;
			page.slice_mut()[inner..(inner + len)].copy_from_slice(&buf[i..(i + len)]);
			page.mark_dirty();
			self.add_ordered(bno)?;
			i += len;
		}
		if end > inode.size {
			inode.size = end;
		}
		inode.touch(true);
		self.write_inode(ino, &inode)?;
		Ok(buf.len())
	}

	/// Resizes the file at `pathname` to `new_size` bytes.
	pub fn truncate(&mut self, pathname: &str, new_size: u64) -> EResult<()> {
		self.run_txn(|fs| fs.do_truncate(pathname, new_size))
	}

	fn do_truncate(&mut self, pathname: &str, new_size: u64) -> EResult<()> {
		let (ino, kind) = self.resolve(pathname)?;
		match kind {
			FileType::Regular => {}
			FileType::Directory => return Err(errno!(EISDIR)),
			FileType::Link => return Err(errno!(EINVAL)),
		}
		if new_size > self.sp.max_file_size() {
			return Err(errno!(EFBIG));
		}
		let mut inode = self.read_inode(ino)?;
		inode.truncate_to(new_size, self)?;
		inode.touch(true);
		self.write_inode(ino, &inode)
	}

	/// Creates a hard link at `new` to the file at `old`.
	///
	/// Directories cannot be hard-linked.
	pub fn link(&mut self, old: &str, new: &str) -> EResult<()> {
		self.run_txn(|fs| fs.do_link(old, new))
	}

	fn do_link(&mut self, old: &str, new: &str) -> EResult<()> {
		let (ino, kind) = self.resolve(old)?;
		if kind == FileType::Directory {
			return Err(errno!(EPERM));
		}
		let (pino, parent_path, name) = self.resolve_parent(new)?;
		let mut parent = self.read_inode(pino)?;
		if parent.get_dirent(name.as_bytes(), self)?.is_some() {
			return Err(errno!(EEXIST));
		}
		let mut inode = self.read_inode(ino)?;
		if inode.nlink >= LINK_MAX {
			return Err(errno!(EMLINK));
		}
		parent.add_dirent(self, ino, name.as_bytes(), kind)?;
		parent.touch(true);
		inode.nlink += 1;
		inode.touch(false);
		self.write_inode(ino, &inode)?;
		self.write_inode(pino, &parent)?;
		self.invalidate_dir(parent_path);
		Ok(())
	}

	/// Removes the directory entry at `pathname`.
	///
	/// When the link count reaches zero and no handle is open, the inode and
	/// its blocks are freed; otherwise reclamation waits for the last
	/// [`release`].
	///
	/// [`release`]: WayneFs::release
	pub fn unlink(&mut self, pathname: &str) -> EResult<()> {
		self.run_txn(|fs| fs.do_unlink(pathname))
	}

	fn do_unlink(&mut self, pathname: &str) -> EResult<()> {
		let (pino, parent_path, name) = self.resolve_parent(pathname)?;
		if name == "." || name == ".." {
			return Err(errno!(EINVAL));
		}
		let mut parent = self.read_inode(pino)?;
		let (ino, off, kind) = parent
			.get_dirent(name.as_bytes(), self)?
			.ok_or_else(|| errno!(ENOENT))?;
		if FileType::from_indicator(kind) == Some(FileType::Directory) {
			return Err(errno!(EISDIR));
		}
		parent.set_dirent_ino(off, 0, 0, self)?;
		parent.touch(true);
		let mut inode = self.read_inode(ino)?;
		inode.nlink = inode.nlink.saturating_sub(1);
		inode.touch(false);
		if inode.nlink == 0 && !self.open_inodes.contains_key(&ino) {
			inode.free_content(self)?;
			self.write_inode(ino, &inode)?;
			self.free_inode_num(ino)?;
		} else {
			self.write_inode(ino, &inode)?;
		}
		self.write_inode(pino, &parent)?;
		self.invalidate_dir(parent_path);
		Ok(())
	}

	/// Creates a symbolic link at `pathname` whose target is `target`.
	pub fn symlink(&mut self, target: &str, pathname: &str) -> EResult<()> {
		self.run_txn(|fs| fs.do_symlink(target, pathname))
	}

	fn do_symlink(&mut self, target: &str, pathname: &str) -> EResult<()> {
		if target.is_empty() {
			return Err(errno!(EINVAL));
		}
		if target.len() > SYMLINK_MAX {
			return Err(errno!(ENAMETOOLONG));
		}
		let (pino, parent_path, name) = self.resolve_parent(pathname)?;
		let mut parent = self.read_inode(pino)?;
		if parent.get_dirent(name.as_bytes(), self)?.is_some() {
			return Err(errno!(EEXIST));
		}
		let ino = self.alloc_inode_num()?;
		let mut inode = Inode::new(FileType::Link, 0o777, 0, 0, 1);
		// The target is stored in the link's content blocks; it is written
		// once and read-only afterwards, so it goes through the log with the
		// rest of the metadata
		let blk_size = self.sp.block_size as usize;
		for (i, chunk) in target.as_bytes().chunks(blk_size).enumerate() {
			let bno = inode.alloc_content_blk(i as u32, self)?;
			let page = self.block(bno)?;
			page.slice_mut()[..chunk.len()].copy_from_slice(chunk);
			page.mark_dirty();
			self.stage_block(bno)?;
		}
		inode.size = target.len() as u64;
		parent.add_dirent(self, ino, name.as_bytes(), FileType::Link)?;
		parent.touch(true);
		self.write_inode(ino, &inode)?;
		self.write_inode(pino, &parent)?;
		self.invalidate_dir(parent_path);
		Ok(())
	}

	/// Returns the target of the symbolic link at `pathname`.
	pub fn readlink(&mut self, pathname: &str) -> EResult<String> {
		let (ino, kind) = self.resolve(pathname)?;
		if kind != FileType::Link {
			return Err(errno!(EINVAL));
		}
		let inode = self.read_inode(ino)?;
		if inode.size > SYMLINK_MAX as u64 {
			return Err(errno!(EUCLEAN));
		}
		let blk_size = self.sp.block_size as u64;
		let mut target = Vec::with_capacity(inode.size as usize);
		let mut pos = 0u64;
		while pos < inode.size {
			let len = (inode.size - pos).min(blk_size) as usize;
			// A symbolic link has no holes
			let bno = inode
				.translate_blk_off((pos / blk_size) as u32, self)?
				.ok_or_else(|| errno!(EUCLEAN))?;
			let page = self.block(bno)?;
			target.extend_from_slice(&page.slice()[..len]);
			pos += len as u64;
		}
		String::from_utf8(target).map_err(|_| errno!(EUCLEAN))
	}

	/// Atomically renames `old` to `new`.
	///
	/// An existing regular file at `new` is replaced; an existing directory
	/// must be empty. Both directories are updated in a single transaction.
	pub fn rename(&mut self, old: &str, new: &str) -> EResult<()> {
		self.run_txn(|fs| fs.do_rename(old, new))
	}

	pub(crate) fn do_rename(&mut self, old: &str, new: &str) -> EResult<()> {
		let (op_ino, old_parent_path, old_name) = self.resolve_parent(old)?;
		let (np_ino, new_parent_path, new_name) = self.resolve_parent(new)?;
		if [old_name, new_name].iter().any(|n| *n == "." || *n == "..") {
			return Err(errno!(EINVAL));
		}
		let same_parent = op_ino == np_ino;
		let oldp = self.read_inode(op_ino)?;
		let (ino, _, old_kind) = oldp
			.get_dirent(old_name.as_bytes(), self)?
			.ok_or_else(|| errno!(ENOENT))?;
		let old_kind = FileType::from_indicator(old_kind).ok_or_else(|| errno!(EUCLEAN))?;
		// Renaming an entry onto itself does nothing
		if same_parent && old_name == new_name {
			return Ok(());
		}
		if old_kind == FileType::Directory {
			// Moving a directory below itself would disconnect the subtree
			let mut cur = np_ino;
			while cur != ROOT_INO {
				if cur == ino {
					return Err(errno!(EINVAL));
				}
				let dir = self.read_inode(cur)?;
				cur = dir
					.get_dirent(b"..", self)?
					.ok_or_else(|| errno!(EUCLEAN))?
					.0;
			}
		}
		let newp = self.read_inode(np_ino)?;
		let existing = newp.get_dirent(new_name.as_bytes(), self)?;
		if let Some((new_ino, new_off, new_kind)) = existing {
			// Both names already point at the same inode: nothing to do
			if new_ino == ino {
				return Ok(());
			}
			let new_kind = FileType::from_indicator(new_kind).ok_or_else(|| errno!(EUCLEAN))?;
			let mut victim = self.read_inode(new_ino)?;
			if old_kind == FileType::Directory {
				if new_kind != FileType::Directory {
					return Err(errno!(ENOTDIR));
				}
				if !victim.is_dir_empty(self)? {
					return Err(errno!(ENOTEMPTY));
				}
			} else if new_kind == FileType::Directory {
				return Err(errno!(EISDIR));
			}
			// Point the existing entry at the moved inode
			let mut newp = self.read_inode(np_ino)?;
			newp.set_dirent_ino(new_off, ino, old_kind.indicator(), self)?;
			newp.touch(true);
			if new_kind == FileType::Directory {
				// The replaced directory loses both its self link and the
				// parent's reference
				newp.nlink -= 1;
				victim.nlink = 0;
			} else {
				victim.nlink = victim.nlink.saturating_sub(1);
				victim.touch(false);
			}
			self.write_inode(np_ino, &newp)?;
			if victim.nlink == 0 && !self.open_inodes.contains_key(&new_ino) {
				victim.free_content(self)?;
				self.write_inode(new_ino, &victim)?;
				self.free_inode_num(new_ino)?;
			} else {
				self.write_inode(new_ino, &victim)?;
			}
		} else {
			let mut newp = self.read_inode(np_ino)?;
			if old_kind == FileType::Directory && !same_parent && newp.nlink >= LINK_MAX {
				return Err(errno!(EMLINK));
			}
			newp.add_dirent(self, ino, new_name.as_bytes(), old_kind)?;
			newp.touch(true);
			self.write_inode(np_ino, &newp)?;
		}
		// Remove the old entry; re-find it since the insertion above may have
		// reshaped the directory
		let mut oldp = self.read_inode(op_ino)?;
		let (_, old_off, _) = oldp
			.get_dirent(old_name.as_bytes(), self)?
			.ok_or_else(|| errno!(EUCLEAN))?;
		oldp.set_dirent_ino(old_off, 0, 0, self)?;
		oldp.touch(true);
		self.write_inode(op_ino, &oldp)?;
		if old_kind == FileType::Directory && !same_parent {
			// The moved directory's `..` now points at the new parent
			let mut moved = self.read_inode(ino)?;
			let (_, dotdot_off, _) = moved
				.get_dirent(b"..", self)?
				.ok_or_else(|| errno!(EUCLEAN))?;
			moved.set_dirent_ino(dotdot_off, np_ino, FileType::Directory.indicator(), self)?;
			moved.touch(false);
			self.write_inode(ino, &moved)?;
			let mut oldp = self.read_inode(op_ino)?;
			oldp.nlink -= 1;
			self.write_inode(op_ino, &oldp)?;
			let mut newp = self.read_inode(np_ino)?;
			newp.nlink += 1;
			self.write_inode(np_ino, &newp)?;
		}
		self.invalidate_dir(old_parent_path);
		self.invalidate_dir(new_parent_path);
		Ok(())
	}

	/// Changes the permission bits of the file at `pathname`.
	pub fn chmod(&mut self, pathname: &str, mode: u16) -> EResult<()> {
		self.run_txn(|fs| {
			let (ino, _) = fs.resolve(pathname)?;
			let mut inode = fs.read_inode(ino)?;
			inode.mode = mode & 0o7777;
			inode.touch(false);
			fs.write_inode(ino, &inode)
		})
	}

	/// Changes the owner of the file at `pathname`.
	pub fn chown(&mut self, pathname: &str, uid: u32, gid: u32) -> EResult<()> {
		self.run_txn(|fs| {
			let (ino, _) = fs.resolve(pathname)?;
			let mut inode = fs.read_inode(ino)?;
			inode.uid = uid;
			inode.gid = gid;
			inode.touch(false);
			fs.write_inode(ino, &inode)
		})
	}

	/// Sets the access and modification timestamps of the file at `pathname`.
	///
	/// A `None` leaves the corresponding timestamp untouched.
	pub fn utimens(
		&mut self,
		pathname: &str,
		atime: Option<u64>,
		mtime: Option<u64>,
	) -> EResult<()> {
		self.run_txn(|fs| {
			let (ino, _) = fs.resolve(pathname)?;
			let mut inode = fs.read_inode(ino)?;
			if let Some(atime) = atime {
				inode.atime = atime;
			}
			if let Some(mtime) = mtime {
				inode.mtime = mtime;
			}
			inode.touch(false);
			fs.write_inode(ino, &inode)
		})
	}

	/// Forces everything written to `ino` onto stable storage.
	///
	/// Every operation commits its transaction before returning, so this
	/// flushes any remaining dirty page and issues a device barrier. On a
	/// directory it behaves the same.
	pub fn fsync(&mut self, ino: u32) -> EResult<()> {
		if !self.inode_allocated(ino)? {
			return Err(errno!(EBADF));
		}
		if self.journal.is_open() {
			let Self {
				journal,
				dev,
				pages,
				..
			} = self;
			journal.commit(dev, pages)?;
		}
		let Self {
			pages,
			dev,
			..
		} = self;
		pages.flush_all(dev)?;
		dev.sync()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::test_util::TempImage;

	#[test]
	fn dentry_cache_invalidation() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.mkdir("/d", 0o755).unwrap();
		fs.create("/d/f", 0o644).unwrap();
		// Populate the cache, then check a hit
		let stat = fs.lookup("/d", "f").unwrap();
		assert_eq!(stat.kind, FileType::Regular);
		assert!(fs.dentries.get("/d/f").is_some());
		// Unlinking must invalidate the whole directory
		fs.unlink("/d/f").unwrap();
		assert!(fs.dentries.get("/d/f").is_none());
		assert_eq!(fs.lookup("/d", "f").err(), Some(errno!(ENOENT)));
		// The miss is now cached as negative
		assert_eq!(fs.dentries.get("/d/f"), Some(None));
		// Creating the file again must drop the negative entry
		fs.create("/d/f", 0o644).unwrap();
		assert_eq!(fs.lookup("/d", "f").unwrap().kind, FileType::Regular);
		fs.check_consistency().unwrap();
	}

	#[test]
	fn orphan_file_reclaimed_on_release() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		let free_before = fs.statfs().free_blocks;
		fs.create("/f", 0o644).unwrap();
		let ino = fs.open("/f", 0).unwrap();
		fs.write(ino, 0, b"still readable").unwrap();
		fs.unlink("/f").unwrap();
		// The path is gone but the handle still works
		assert_eq!(fs.getattr("/f").err(), Some(errno!(ENOENT)));
		let mut buf = [0u8; 14];
		assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 14);
		assert_eq!(&buf, b"still readable");
		fs.check_consistency().unwrap();
		// The last release reclaims the space
		fs.release(ino).unwrap();
		assert_eq!(fs.read(ino, 0, &mut buf).err(), Some(errno!(EBADF)));
		assert_eq!(fs.statfs().free_blocks, free_before);
		fs.check_consistency().unwrap();
	}

	#[test]
	fn rename_same_entry_is_noop() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.create("/a", 0o644).unwrap();
		fs.link("/a", "/b").unwrap();
		// Both names point at the same inode
		fs.rename("/a", "/b").unwrap();
		assert_eq!(fs.getattr("/a").unwrap().nlink, 2);
		assert_eq!(fs.getattr("/b").unwrap().nlink, 2);
		fs.check_consistency().unwrap();
	}

	#[test]
	fn rename_into_own_subtree_fails() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.mkdir("/a", 0o755).unwrap();
		fs.mkdir("/a/b", 0o755).unwrap();
		assert_eq!(fs.rename("/a", "/a/b/c").err(), Some(errno!(EINVAL)));
		fs.check_consistency().unwrap();
	}

	#[test]
	fn dot_components_resolve() {
		let img = TempImage::small();
		let mut fs = WayneFs::mount(&img.path).unwrap();
		fs.mkdir("/a", 0o755).unwrap();
		fs.create("/a/f", 0o644).unwrap();
		let direct = fs.getattr("/a/f").unwrap();
		let dotted = fs.getattr("/a/./f").unwrap();
		let parent = fs.getattr("/a/../a/f").unwrap();
		assert_eq!(direct, dotted);
		assert_eq!(direct, parent);
		// `..` at the root loops back to the root
		assert_eq!(fs.getattr("/..").unwrap().kind, FileType::Directory);
	}
}
