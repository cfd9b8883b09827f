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

//! The dentry cache maps absolute paths to inode numbers, sparing a walk
//! through the directory blocks on repeated resolutions.
//!
//! The cache is advisory: a miss falls back to the directory codec. Entries
//! are keyed by canonical path; any operation that changes the content of a
//! directory invalidates every cached path under that directory.

use crate::fs::FileType;
use std::collections::HashMap;

/// A cached resolution result.
///
/// `None` records a negative result: the path is known not to exist.
type CachedDentry = Option<(u32, FileType)>;

/// The dentry cache.
#[derive(Default)]
pub struct DentryCache {
	/// Cached resolutions, keyed by canonical absolute path.
	entries: HashMap<String, CachedDentry>,
}

impl DentryCache {
	/// Creates an empty cache.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the cached resolution for `path`, if any.
	///
	/// The outer `Option` distinguishes a cache miss from a cached negative
	/// result.
	pub fn get(&self, path: &str) -> Option<CachedDentry> {
		self.entries.get(path).copied()
	}

	/// Records that `path` resolves to `ino` of type `kind`.
	pub fn insert(&mut self, path: String, ino: u32, kind: FileType) {
		self.entries.insert(path, Some((ino, kind)));
	}

	/// Records that `path` does not exist.
	pub fn insert_negative(&mut self, path: String) {
		self.entries.insert(path, None);
	}

	/// Drops the entry for `path`, if cached.
	pub fn invalidate(&mut self, path: &str) {
		self.entries.remove(path);
	}

	/// Drops every entry under the directory `dir` (inclusive).
	///
	/// `dir` must be canonical. This is the invalidation run by every
	/// operation that creates, removes or renames entries in `dir`.
	pub fn invalidate_prefix(&mut self, dir: &str) {
		if dir == "/" {
			self.entries.clear();
			return;
		}
		self.entries
			.retain(|path, _| path != dir && !path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/')));
	}
}
