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

//! Unix error numbers.
//!
//! Every fallible operation of the filesystem returns an [`EResult`], carrying
//! an [`Errno`] on failure. Values match the Linux numbering so a host layer
//! can hand them to the kernel untouched.

use core::fmt;
use std::io;

/// Operation not permitted.
pub const EPERM: i32 = 1;
/// No such file or directory.
pub const ENOENT: i32 = 2;
/// I/O error.
pub const EIO: i32 = 5;
/// No such device or address.
pub const ENXIO: i32 = 6;
/// Bad file descriptor.
pub const EBADF: i32 = 9;
/// Resource unavailable, try again.
pub const EAGAIN: i32 = 11;
/// Not enough memory.
pub const ENOMEM: i32 = 12;
/// Permission denied.
pub const EACCES: i32 = 13;
/// Device or resource busy.
pub const EBUSY: i32 = 16;
/// File exists.
pub const EEXIST: i32 = 17;
/// Cross-device link.
pub const EXDEV: i32 = 18;
/// No such device.
pub const ENODEV: i32 = 19;
/// Not a directory.
pub const ENOTDIR: i32 = 20;
/// Is a directory.
pub const EISDIR: i32 = 21;
/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Too many open files.
pub const EMFILE: i32 = 24;
/// File too large.
pub const EFBIG: i32 = 27;
/// No space left on device.
pub const ENOSPC: i32 = 28;
/// Read-only filesystem.
pub const EROFS: i32 = 30;
/// Too many links.
pub const EMLINK: i32 = 31;
/// Result too large.
pub const ERANGE: i32 = 34;
/// Filename too long.
pub const ENAMETOOLONG: i32 = 36;
/// Directory not empty.
pub const ENOTEMPTY: i32 = 39;
/// Too many levels of symbolic links.
pub const ELOOP: i32 = 40;
/// Value too large to be stored in data type.
pub const EOVERFLOW: i32 = 75;
/// Operation already in progress.
pub const EALREADY: i32 = 114;
/// Structure needs cleaning.
pub const EUCLEAN: i32 = 117;

/// Result with an [`Errno`] as error type.
pub type EResult<T> = Result<T, Errno>;

/// A Unix error number.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Errno(i32);

impl Errno {
	/// Creates an instance from the given raw errno value.
	pub const fn from_int(errno: i32) -> Self {
		Self(errno)
	}

	/// Returns the raw errno value.
	pub const fn as_int(self) -> i32 {
		self.0
	}

	/// Returns the symbolic name of the error, if known.
	fn name(self) -> Option<&'static str> {
		let name = match self.0 {
			EPERM => "EPERM",
			ENOENT => "ENOENT",
			EIO => "EIO",
			ENXIO => "ENXIO",
			EBADF => "EBADF",
			EAGAIN => "EAGAIN",
			ENOMEM => "ENOMEM",
			EACCES => "EACCES",
			EBUSY => "EBUSY",
			EEXIST => "EEXIST",
			EXDEV => "EXDEV",
			ENODEV => "ENODEV",
			ENOTDIR => "ENOTDIR",
			EISDIR => "EISDIR",
			EINVAL => "EINVAL",
			EMFILE => "EMFILE",
			EFBIG => "EFBIG",
			ENOSPC => "ENOSPC",
			EROFS => "EROFS",
			EMLINK => "EMLINK",
			ERANGE => "ERANGE",
			ENAMETOOLONG => "ENAMETOOLONG",
			ENOTEMPTY => "ENOTEMPTY",
			ELOOP => "ELOOP",
			EOVERFLOW => "EOVERFLOW",
			EALREADY => "EALREADY",
			EUCLEAN => "EUCLEAN",
			_ => return None,
		};
		Some(name)
	}
}

impl fmt::Debug for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.name() {
			Some(name) => write!(f, "{name}"),
			None => write!(f, "errno {}", self.0),
		}
	}
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

impl From<io::Error> for Errno {
	fn from(err: io::Error) -> Self {
		Self(err.raw_os_error().unwrap_or(EIO))
	}
}

/// Builds an [`Errno`] from its symbolic name.
#[macro_export]
macro_rules! errno {
	($name:ident) => {
		$crate::errno::Errno::from_int($crate::errno::$name)
	};
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn errno_roundtrip() {
		assert_eq!(errno!(ENOENT).as_int(), ENOENT);
		assert_eq!(errno!(ENOENT), Errno::from_int(ENOENT));
		assert_ne!(errno!(ENOENT), errno!(EEXIST));
	}

	#[test]
	fn errno_from_io() {
		let err = io::Error::from_raw_os_error(ENOSPC);
		assert_eq!(Errno::from(err), errno!(ENOSPC));
		let err = io::Error::other("opaque");
		assert_eq!(Errno::from(err), errno!(EIO));
	}
}
