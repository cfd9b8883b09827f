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

//! WayneFS is a user-space filesystem with POSIX semantics, stored in a single
//! fixed-size disk image.
//!
//! The filesystem divides the image into several regions, in order:
//! - Superblock: describes the geometry of the other regions
//! - Inode bitmap: allocation state of each inode
//! - Data bitmap: allocation state of each data block
//! - Inode table: the inodes themselves
//! - Journal: a write-ahead log making metadata updates crash-consistent
//! - Data: content blocks for files, directories and symbolic links
//!
//! Metadata updates are grouped into transactions and committed through the
//! journal in ordered mode: content blocks reach their home location before
//! the metadata that references them becomes durable. Mounting replays any
//! transaction whose commit record survived a crash.
//!
//! The entry points are [`WayneFs::mount`] to open an image and
//! [`format::format`] to create one.

pub mod cache;
pub mod checksum;
pub mod device;
pub mod errno;
pub mod format;
pub mod fs;
pub mod limits;
pub mod path;
pub mod vfs;

pub use format::{format, FormatOptions};
pub use fs::{DirEntry, FileType, Stat, Statfs, WayneFs};
