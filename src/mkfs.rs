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

//! The `waynefs-mkfs` tool creates a WayneFS filesystem image.

use std::env;
use std::path::PathBuf;
use std::process::exit;
use waynefs::FormatOptions;

/// Structure storing command line arguments.
struct Args {
	/// The name of the current program used in command line.
	prog: String,
	/// If true, print command line help.
	help: bool,
	/// The path to the image file to create.
	image_path: Option<PathBuf>,
	/// Geometry of the image.
	opts: FormatOptions,
}

fn parse_args() -> Result<Args, String> {
	let mut iter = env::args();
	let mut args = Args {
		prog: iter.next().unwrap_or("waynefs-mkfs".to_owned()),
		help: false,
		image_path: None,
		opts: FormatOptions::default(),
	};
	let mut size_mb = None;
	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"-b" | "--block-size" => {
				let val = iter.next().ok_or("missing value for `-b`")?;
				args.opts.block_size = val
					.parse()
					.map_err(|_| format!("invalid block size `{val}`"))?;
			}
			"-i" | "--inodes" => {
				let val = iter.next().ok_or("missing value for `-i`")?;
				args.opts.inode_count = val
					.parse()
					.map_err(|_| format!("invalid inode count `{val}`"))?;
			}
			_ if args.image_path.is_none() => args.image_path = Some(PathBuf::from(arg)),
			_ if size_mb.is_none() => {
				size_mb = Some(
					arg.parse()
						.map_err(|_| format!("invalid size `{arg}`"))?,
				);
			}
			_ => return Err(format!("unexpected argument `{arg}`")),
		}
	}
	if let Some(size_mb) = size_mb {
		args.opts.size_mb = size_mb;
	}
	Ok(args)
}

fn print_usage(prog: &str) {
	eprintln!("Usage:");
	eprintln!(" {prog} [-b block_size] [-i inode_count] <image> [size_mb]");
	eprintln!();
	eprintln!("Creates a WayneFS filesystem image.");
	eprintln!();
	eprintln!("Options:");
	eprintln!(" -b, --block-size\tsize of a block in bytes (default: 4096)");
	eprintln!(" -i, --inodes\t\ttotal number of inodes (default: 1024)");
}

fn main() {
	let args = parse_args().unwrap_or_else(|e| {
		eprintln!("waynefs-mkfs: {e}");
		exit(1);
	});
	if args.help {
		print_usage(&args.prog);
		exit(0);
	}
	let Some(image_path) = args.image_path else {
		eprintln!("{}: specify the path to the image", args.prog);
		print_usage(&args.prog);
		exit(1);
	};
	if let Err(e) = waynefs::format(&image_path, &args.opts) {
		eprintln!(
			"{}: failed to create filesystem on {}: {}",
			args.prog,
			image_path.display(),
			e
		);
		exit(1);
	}
	println!(
		"{}: created WayneFS image ({} MB, {} B blocks, {} inodes)",
		image_path.display(),
		args.opts.size_mb,
		args.opts.block_size,
		args.opts.inode_count
	);
}
