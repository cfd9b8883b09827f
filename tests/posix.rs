//! End-to-end tests of the POSIX operation set on a freshly formatted image.

mod common;

use common::TempImage;
use rand::{Rng, SeedableRng};
use waynefs::errno;
use waynefs::FileType;

#[test]
fn mkdir_readdir_rmdir() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.mkdir("/d", 0o755).unwrap();
	let names: Vec<String> = fs
		.readdir("/d")
		.unwrap()
		.into_iter()
		.map(|e| e.name)
		.collect();
	assert_eq!(names, vec![".", ".."]);
	// The parent gained a link from the child's `..`
	assert_eq!(fs.getattr("/").unwrap().nlink, 3);
	assert_eq!(fs.getattr("/d").unwrap().nlink, 2);
	fs.rmdir("/d").unwrap();
	assert_eq!(fs.getattr("/d").err(), Some(errno!(ENOENT)));
	assert_eq!(fs.getattr("/").unwrap().nlink, 2);
	fs.check_consistency().unwrap();
}

#[test]
fn mkdir_collision_and_missing_parent() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.mkdir("/d", 0o755).unwrap();
	assert_eq!(fs.mkdir("/d", 0o755).err(), Some(errno!(EEXIST)));
	assert_eq!(fs.mkdir("/missing/d", 0o755).err(), Some(errno!(ENOENT)));
	fs.create("/f", 0o644).unwrap();
	assert_eq!(fs.mkdir("/f/d", 0o755).err(), Some(errno!(ENOTDIR)));
	assert_eq!(fs.rmdir("/f").err(), Some(errno!(ENOTDIR)));
	fs.check_consistency().unwrap();
}

#[test]
fn create_write_read() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.create("/f", 0o644).unwrap();
	let ino = fs.open("/f", 0).unwrap();
	assert_eq!(fs.write(ino, 0, b"Hello WayneFS").unwrap(), 13);
	assert_eq!(fs.getattr("/f").unwrap().size, 13);
	let mut buf = [0u8; 13];
	assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 13);
	assert_eq!(&buf, b"Hello WayneFS");
	// Short read at the end of the file
	let mut buf = [0u8; 64];
	assert_eq!(fs.read(ino, 5, &mut buf).unwrap(), 8);
	assert_eq!(&buf[..8], b" WayneFS");
	assert_eq!(fs.read(ino, 13, &mut buf).unwrap(), 0);
	fs.release(ino).unwrap();
	fs.check_consistency().unwrap();
}

#[test]
fn truncate_shrink_and_grow() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.create("/f", 0o644).unwrap();
	let ino = fs.open("/f", 0).unwrap();
	fs.write(ino, 0, b"Hello WayneFS").unwrap();
	fs.truncate("/f", 5).unwrap();
	assert_eq!(fs.getattr("/f").unwrap().size, 5);
	let mut buf = [0u8; 16];
	assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 5);
	assert_eq!(&buf[..5], b"Hello");
	// Growing exposes zeros, not the truncated bytes
	fs.truncate("/f", 12).unwrap();
	assert_eq!(fs.getattr("/f").unwrap().size, 12);
	assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 12);
	assert_eq!(&buf[..12], b"Hello\x00\x00\x00\x00\x00\x00\x00");
	fs.release(ino).unwrap();
	fs.check_consistency().unwrap();
}

#[test]
fn truncate_is_idempotent() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.create("/f", 0o644).unwrap();
	let ino = fs.open("/f", 0).unwrap();
	fs.write(ino, 0, &[0x5a; 10000]).unwrap();
	fs.truncate("/f", 6000).unwrap();
	let free = fs.statfs().free_blocks;
	let mut first = vec![0u8; 6000];
	assert_eq!(fs.read(ino, 0, &mut first).unwrap(), 6000);
	fs.truncate("/f", 6000).unwrap();
	assert_eq!(fs.statfs().free_blocks, free);
	let mut second = vec![0u8; 6000];
	assert_eq!(fs.read(ino, 0, &mut second).unwrap(), 6000);
	assert_eq!(first, second);
	assert!(first.iter().all(|b| *b == 0x5a));
	fs.release(ino).unwrap();
	fs.check_consistency().unwrap();
}

#[test]
fn hard_links_share_the_inode() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.create("/a", 0o644).unwrap();
	let ino = fs.open("/a", 0).unwrap();
	fs.write(ino, 0, b"x").unwrap();
	fs.release(ino).unwrap();
	fs.link("/a", "/b").unwrap();
	assert_eq!(fs.getattr("/a").unwrap().nlink, 2);
	assert_eq!(fs.getattr("/b").unwrap().nlink, 2);
	fs.unlink("/a").unwrap();
	let ino = fs.open("/b", 0).unwrap();
	let mut buf = [0u8; 1];
	assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 1);
	assert_eq!(&buf, b"x");
	assert_eq!(fs.getattr("/b").unwrap().nlink, 1);
	fs.release(ino).unwrap();
	// Directories cannot be hard-linked
	fs.mkdir("/d", 0o755).unwrap();
	assert_eq!(fs.link("/d", "/d2").err(), Some(errno!(EPERM)));
	fs.check_consistency().unwrap();
}

#[test]
fn indirect_file_reclaimed_on_unlink() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	let free = fs.statfs().free_blocks;
	fs.create("/big", 0o644).unwrap();
	let ino = fs.open("/big", 0).unwrap();
	// 60 KiB spans the direct slots and part of the single indirect block
	let zeros = vec![0u8; 60 * 1024];
	assert_eq!(fs.write(ino, 0, &zeros).unwrap(), zeros.len());
	assert_eq!(fs.getattr("/big").unwrap().size, 61440);
	let mut buf = vec![0xffu8; 60 * 1024];
	assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), buf.len());
	assert_eq!(buf, zeros);
	fs.truncate("/big", 20 * 1024).unwrap();
	let mut buf = vec![0xffu8; 20 * 1024];
	assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), buf.len());
	assert!(buf.iter().all(|b| *b == 0));
	fs.release(ino).unwrap();
	fs.unlink("/big").unwrap();
	// The space is reclaimed and allocatable again
	assert_eq!(fs.statfs().free_blocks, free);
	fs.create("/big2", 0o644).unwrap();
	let ino = fs.open("/big2", 0).unwrap();
	assert_eq!(fs.write(ino, 0, &zeros).unwrap(), zeros.len());
	fs.release(ino).unwrap();
	fs.check_consistency().unwrap();
}

#[test]
fn writes_across_the_addressing_boundaries() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	let free = fs.statfs().free_blocks;
	fs.create("/sparse", 0o644).unwrap();
	let ino = fs.open("/sparse", 0).unwrap();
	const B: u64 = 4096;
	const P: u64 = 1024;
	// Last direct block, first single-indirect, first and last double-indirect
	let offsets = [9 * B, 10 * B, (10 + P) * B, (10 + P + P * P - 1) * B];
	for (i, off) in offsets.iter().enumerate() {
		let byte = [i as u8 + 1];
		assert_eq!(fs.write(ino, *off, &byte).unwrap(), 1);
	}
	for (i, off) in offsets.iter().enumerate() {
		let mut buf = [0u8];
		assert_eq!(fs.read(ino, *off, &mut buf).unwrap(), 1);
		assert_eq!(buf[0], i as u8 + 1);
	}
	// A hole in between reads as zeros
	let mut buf = [0xffu8; 16];
	assert_eq!(fs.read(ino, 100 * B, &mut buf).unwrap(), 16);
	assert!(buf.iter().all(|b| *b == 0));
	// Writing past the addressing limit must fail
	assert_eq!(
		fs.write(ino, (10 + P + P * P) * B, &[0]).err(),
		Some(errno!(EFBIG))
	);
	fs.check_consistency().unwrap();
	fs.release(ino).unwrap();
	fs.unlink("/sparse").unwrap();
	assert_eq!(fs.statfs().free_blocks, free);
	fs.check_consistency().unwrap();
}

#[test]
fn write_read_roundtrip_random() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	let mut rng = rand::rngs::StdRng::seed_from_u64(0xdead);
	fs.create("/r", 0o644).unwrap();
	let ino = fs.open("/r", 0).unwrap();
	let mut content = vec![0u8; 150_000];
	rng.fill(&mut content[..]);
	// Write in odd-sized chunks at increasing offsets
	let mut off = 0usize;
	while off < content.len() {
		let len = (content.len() - off).min(7919);
		fs.write(ino, off as u64, &content[off..(off + len)]).unwrap();
		off += len;
	}
	let mut back = vec![0u8; content.len()];
	assert_eq!(fs.read(ino, 0, &mut back).unwrap(), content.len());
	assert_eq!(back, content);
	// Overwrite a random window and check again
	let start = 40_000;
	let mut patch = vec![0u8; 30_000];
	rng.fill(&mut patch[..]);
	fs.write(ino, start as u64, &patch).unwrap();
	content[start..(start + patch.len())].copy_from_slice(&patch);
	assert_eq!(fs.read(ino, 0, &mut back).unwrap(), content.len());
	assert_eq!(back, content);
	fs.release(ino).unwrap();
	fs.check_consistency().unwrap();
}

#[test]
fn symlink_roundtrip() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.mkdir("/d", 0o755).unwrap();
	fs.create("/d/target", 0o644).unwrap();
	fs.symlink("/d/target", "/l").unwrap();
	let stat = fs.getattr("/l").unwrap();
	assert_eq!(stat.kind, FileType::Link);
	assert_eq!(stat.size, "/d/target".len() as u64);
	assert_eq!(fs.readlink("/l").unwrap(), "/d/target");
	// readlink on a non-link fails
	assert_eq!(fs.readlink("/d").err(), Some(errno!(EINVAL)));
	// Opening the link itself is refused; the host resolves it
	assert_eq!(fs.open("/l", 0).err(), Some(errno!(ELOOP)));
	fs.unlink("/l").unwrap();
	assert_eq!(fs.getattr("/l").err(), Some(errno!(ENOENT)));
	fs.check_consistency().unwrap();
}

#[test]
fn rename_replaces_files_atomically() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.create("/a", 0o644).unwrap();
	let ino = fs.open("/a", 0).unwrap();
	fs.write(ino, 0, b"from a").unwrap();
	fs.release(ino).unwrap();
	fs.create("/b", 0o644).unwrap();
	fs.rename("/a", "/b").unwrap();
	assert_eq!(fs.getattr("/a").err(), Some(errno!(ENOENT)));
	let ino = fs.open("/b", 0).unwrap();
	let mut buf = [0u8; 6];
	assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 6);
	assert_eq!(&buf, b"from a");
	fs.release(ino).unwrap();
	fs.check_consistency().unwrap();
}

#[test]
fn rename_directory_across_parents() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.mkdir("/a", 0o755).unwrap();
	fs.mkdir("/b", 0o755).unwrap();
	fs.mkdir("/a/d", 0o755).unwrap();
	fs.create("/a/d/f", 0o644).unwrap();
	assert_eq!(fs.getattr("/a").unwrap().nlink, 3);
	assert_eq!(fs.getattr("/b").unwrap().nlink, 2);
	fs.rename("/a/d", "/b/e").unwrap();
	assert_eq!(fs.getattr("/a/d").err(), Some(errno!(ENOENT)));
	assert_eq!(fs.getattr("/b/e/f").unwrap().kind, FileType::Regular);
	// Link counts moved with the directory
	assert_eq!(fs.getattr("/a").unwrap().nlink, 2);
	assert_eq!(fs.getattr("/b").unwrap().nlink, 3);
	// The moved directory's `..` follows its new parent
	assert_eq!(fs.getattr("/b/e/..").unwrap().nlink, 3);
	// Replacing a non-empty directory is refused
	fs.mkdir("/b/e2", 0o755).unwrap();
	assert_eq!(fs.rename("/b/e2", "/b/e").err(), Some(errno!(ENOTEMPTY)));
	fs.check_consistency().unwrap();
}

#[test]
fn chmod_chown_utimens() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.create("/f", 0o644).unwrap();
	fs.chmod("/f", 0o600).unwrap();
	assert_eq!(fs.getattr("/f").unwrap().mode, 0o600);
	fs.chown("/f", 1000, 1000).unwrap();
	let stat = fs.getattr("/f").unwrap();
	assert_eq!((stat.uid, stat.gid), (1000, 1000));
	fs.utimens("/f", Some(11), Some(22)).unwrap();
	let stat = fs.getattr("/f").unwrap();
	assert_eq!((stat.atime, stat.mtime), (11, 22));
	// A `None` leaves the timestamp untouched
	fs.utimens("/f", None, Some(33)).unwrap();
	let stat = fs.getattr("/f").unwrap();
	assert_eq!((stat.atime, stat.mtime), (11, 33));
	fs.check_consistency().unwrap();
}

#[test]
fn statfs_tracks_usage() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	let before = fs.statfs();
	assert_eq!(before.block_size, 4096);
	assert_eq!(before.total_inodes, 1024);
	fs.create("/f", 0o644).unwrap();
	let ino = fs.open("/f", 0).unwrap();
	fs.write(ino, 0, &[1u8; 8192]).unwrap();
	fs.release(ino).unwrap();
	let after = fs.statfs();
	assert_eq!(after.free_inodes, before.free_inodes - 1);
	assert_eq!(after.free_blocks, before.free_blocks - 2);
	fs.unlink("/f").unwrap();
	let end = fs.statfs();
	assert_eq!(end.free_inodes, before.free_inodes);
	assert_eq!(end.free_blocks, before.free_blocks);
}

#[test]
fn out_of_space_rolls_back_cleanly() {
	// A tiny image: 2 MB, most of it metadata and journal
	let img = TempImage::new(2, 4096, 64);
	let mut fs = img.mount();
	fs.create("/f", 0o644).unwrap();
	let ino = fs.open("/f", 0).unwrap();
	let chunk = vec![0xa5u8; 64 * 1024];
	let mut written = 0u64;
	let err = loop {
		match fs.write(ino, written, &chunk) {
			Ok(n) => written += n as u64,
			Err(e) => break e,
		}
	};
	assert_eq!(err, errno!(ENOSPC));
	// The failed write rolled back: size unchanged, allocations consistent
	assert_eq!(fs.getattr("/f").unwrap().size, written);
	fs.check_consistency().unwrap();
	// Releasing space makes writes possible again
	fs.release(ino).unwrap();
	fs.unlink("/f").unwrap();
	fs.create("/g", 0o644).unwrap();
	let ino = fs.open("/g", 0).unwrap();
	assert_eq!(fs.write(ino, 0, &chunk).unwrap(), chunk.len());
	fs.release(ino).unwrap();
	fs.check_consistency().unwrap();
}

#[test]
fn changes_survive_remount() {
	let img = TempImage::reference();
	let mut fs = img.mount();
	fs.mkdir("/d", 0o755).unwrap();
	fs.create("/d/f", 0o644).unwrap();
	let ino = fs.open("/d/f", 0).unwrap();
	fs.write(ino, 0, b"persistent").unwrap();
	fs.release(ino).unwrap();
	fs.fsync(1).unwrap();
	fs.unmount().unwrap();
	let mut fs = img.mount();
	let ino = fs.open("/d/f", 0).unwrap();
	let mut buf = [0u8; 10];
	assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 10);
	assert_eq!(&buf, b"persistent");
	fs.release(ino).unwrap();
	fs.check_consistency().unwrap();
}
