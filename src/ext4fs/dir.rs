/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Directory-entry packing and the per-inode-type construction paths (plain
//! file, directory, symlink, device/fifo/socket). Builds on `alloc` for
//! block/inode reservation and on `extent` to attach the resulting data to
//! an inode.

use crate::alloc::{blocks_for_len, BlockAllocation, BlockAllocator};
use crate::error::{Error, Result};
use crate::extent::build_extent_tree;
use crate::inode::{Inode, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG, S_IFSOCK};
use crate::util::align_up;

/// `file_type` byte values for a `dir_entry_2`, matching the kernel's
/// `EXT4_FT_*` constants.
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

/// Derives the `dir_entry_2` file type byte from a mode's file-type bits.
pub fn file_type_of_mode(mode: u16) -> u8 {
    match mode & 0o170000 {
        S_IFREG => FT_REG_FILE,
        S_IFDIR => FT_DIR,
        S_IFLNK => FT_SYMLINK,
        S_IFCHR => FT_CHRDEV,
        S_IFBLK => FT_BLKDEV,
        S_IFIFO => FT_FIFO,
        S_IFSOCK => FT_SOCK,
        _ => FT_UNKNOWN,
    }
}

/// One linear directory entry, pre-packing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub name: Vec<u8>,
    pub file_type: u8,
}

impl DirEntry {
    pub fn new(inode: u32, name: impl Into<Vec<u8>>, file_type: u8) -> Self {
        Self {
            inode,
            name: name.into(),
            file_type,
        }
    }

    /// Size this entry occupies when tightly packed (name plus the 8-byte
    /// fixed header, rounded up to a 4-byte boundary).
    fn packed_len(&self) -> u16 {
        align_up(8 + self.name.len() as u64, 4) as u16
    }
}

/// Packs `entries` into as few `block_size`-sized directory blocks as
/// possible. Entries never straddle a block boundary; the last entry of
/// each block has its `rec_len` stretched to the end of the block, per
/// `dir_entry_2` convention. An empty entry list still yields one empty
/// block (an allocated directory always has at least one data block).
pub fn pack_entries(entries: &[DirEntry], block_size: u64) -> Vec<Vec<u8>> {
    let block_size = block_size as usize;
    let mut blocks = Vec::new();
    let mut cur = Vec::new();
    let mut cur_len = 0usize;

    for entry in entries {
        let needed = entry.packed_len() as usize;
        if cur_len + needed > block_size {
            finish_block(&mut cur, cur_len, block_size);
            blocks.push(std::mem::take(&mut cur));
            cur_len = 0;
        }
        write_entry(&mut cur, entry, entry.packed_len());
        cur_len += needed;
    }
    finish_block(&mut cur, cur_len, block_size);
    blocks.push(cur);
    blocks
}

fn write_entry(buf: &mut Vec<u8>, entry: &DirEntry, rec_len: u16) {
    buf.extend_from_slice(&entry.inode.to_le_bytes());
    buf.extend_from_slice(&rec_len.to_le_bytes());
    buf.push(entry.name.len() as u8);
    buf.push(entry.file_type);
    buf.extend_from_slice(&entry.name);
    let pad = rec_len as usize - (8 + entry.name.len());
    buf.resize(buf.len() + pad, 0);
}

/// Stretches the last entry's `rec_len` field to cover the rest of the
/// block, and zero-fills any remainder.
fn finish_block(buf: &mut Vec<u8>, cur_len: usize, block_size: usize) {
    if cur_len == 0 {
        buf.resize(block_size, 0);
        return;
    }
    // Walk entries to find the offset of the last one's rec_len field.
    let mut off = 0usize;
    let mut last_off = 0usize;
    while off < cur_len {
        let rec_len = u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap()) as usize;
        last_off = off;
        off += rec_len;
    }
    let stretched = (block_size - last_off) as u16;
    buf[last_off + 4..last_off + 6].copy_from_slice(&stretched.to_le_bytes());
    buf.resize(block_size, 0);
}

/// Result of building one inode's worth of content: the inode itself, its
/// block allocation (kept so the caller can queue a block-list report entry
/// or free it), and any out-of-tree blocks (directory data, extent leaves,
/// ...) that must be written to the image verbatim, in `(block, bytes)`
/// pairs.
pub struct BuiltInode {
    pub inode: Inode,
    pub alloc: BlockAllocation,
    pub blocks: Vec<(u64, Vec<u8>)>,
}

/// Builds a directory inode containing `entries` (which must already
/// include `.` and `..`), allocating however many data blocks are needed
/// and attaching them through an extent tree.
pub fn build_directory_inode(
    allocator: &mut BlockAllocator,
    block_size: u64,
    mode: u16,
    uid: u32,
    gid: u32,
    mtime: u32,
    entries: &[DirEntry],
) -> Result<BuiltInode> {
    let packed = pack_entries(entries, block_size);
    let mut alloc = allocator.allocate_blocks(packed.len() as u64)?;
    let mut blocks = Vec::with_capacity(packed.len());
    {
        let mut cursor = alloc.main.clone();
        cursor.rewind();
        for data in packed.iter() {
            let b = cursor
                .next_block()
                .ok_or_else(|| Error::Geometry("directory block count mismatch".into()))?;
            blocks.push((b, data.clone()));
        }
    }

    let mut inode = Inode {
        mode: S_IFDIR | (mode & 0o7777),
        uid,
        gid,
        atime: mtime,
        ctime: mtime,
        mtime,
        links_count: 2,
        size: (packed.len() as u64) * block_size,
        ..Default::default()
    };
    build_extent_tree(&mut inode, &mut alloc, allocator, block_size, |b, d| {
        blocks.push((b, d))
    })?;
    inode.blocks_lo = ((alloc.main.total_blocks() + alloc.oob.total_blocks()) * (block_size / 512))
        as u32;

    Ok(BuiltInode { inode, alloc, blocks })
}

/// Builds a regular file's inode and data-block allocation for a file of
/// `len` bytes. Does not fill the block contents: the caller queues the
/// source file (or an in-memory buffer) into the sparse encoder directly,
/// keyed by the regions in `alloc.main`.
pub fn build_file_inode(
    allocator: &mut BlockAllocator,
    block_size: u64,
    mode: u16,
    uid: u32,
    gid: u32,
    mtime: u32,
    len: u64,
) -> Result<BuiltInode> {
    let n_blocks = blocks_for_len(len, block_size);
    let mut alloc = if n_blocks > 0 {
        allocator.allocate_blocks(n_blocks)?
    } else {
        BlockAllocation::default()
    };
    let mut inode = Inode {
        mode: S_IFREG | (mode & 0o7777),
        uid,
        gid,
        atime: mtime,
        ctime: mtime,
        mtime,
        links_count: 1,
        size: len,
        ..Default::default()
    };
    let mut blocks = Vec::new();
    build_extent_tree(&mut inode, &mut alloc, allocator, block_size, |b, d| {
        blocks.push((b, d))
    })?;
    inode.blocks_lo = ((alloc.main.total_blocks() + alloc.oob.total_blocks()) * (block_size / 512))
        as u32;
    Ok(BuiltInode { inode, alloc, blocks })
}

/// Builds a symlink inode. Targets under 60 bytes are stored inline in
/// `i_block`; longer targets get a one-block extent, mirroring
/// `make_link_entry`.
pub fn build_symlink_inode(
    allocator: &mut BlockAllocator,
    block_size: u64,
    uid: u32,
    gid: u32,
    mtime: u32,
    target: &[u8],
) -> Result<BuiltInode> {
    let mut inode = Inode {
        mode: S_IFLNK | 0o777,
        uid,
        gid,
        atime: mtime,
        ctime: mtime,
        mtime,
        links_count: 1,
        ..Default::default()
    };
    if target.len() < 60 {
        inode.set_inline_symlink(target);
        return Ok(BuiltInode {
            inode,
            alloc: BlockAllocation::default(),
            blocks: Vec::new(),
        });
    }
    let mut alloc = allocator.allocate_blocks(1)?;
    inode.size = target.len() as u64;
    let mut buf = vec![0u8; block_size as usize];
    buf[..target.len()].copy_from_slice(target);
    let mut blocks = Vec::new();
    build_extent_tree(&mut inode, &mut alloc, allocator, block_size, |b, d| {
        blocks.push((b, d))
    })?;
    if let Some(region) = alloc.main.regions().first() {
        blocks.push((region.block, buf));
    }
    inode.blocks_lo = (block_size / 512) as u32;
    Ok(BuiltInode { inode, alloc, blocks })
}

fn old_valid_dev(major: u32, minor: u32) -> bool {
    major < 256 && minor < 256
}

fn old_encode_dev(major: u32, minor: u32) -> u32 {
    (major << 8) | minor
}

fn new_encode_dev(major: u32, minor: u32) -> u32 {
    (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)
}

/// Builds a character/block device, FIFO or socket inode. `rdev` is ignored
/// for FIFOs and sockets.
pub fn build_special_inode(
    mode: u16,
    uid: u32,
    gid: u32,
    mtime: u32,
    major: u32,
    minor: u32,
) -> Result<BuiltInode> {
    let file_type = mode & 0o170000;
    let mut inode = Inode {
        mode,
        uid,
        gid,
        atime: mtime,
        ctime: mtime,
        mtime,
        links_count: 1,
        ..Default::default()
    };
    if file_type == S_IFCHR || file_type == S_IFBLK {
        if old_valid_dev(major, minor) {
            inode.block[0] = old_encode_dev(major, minor);
        } else {
            inode.block[1] = new_encode_dev(major, minor);
        }
    }
    Ok(BuiltInode {
        inode,
        alloc: BlockAllocation::default(),
        blocks: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{FsAux, FsInfo};

    fn allocator() -> BlockAllocator {
        let info = FsInfo {
            len: 16 * 1024 * 1024,
            ..Default::default()
        }
        .finalize()
        .unwrap();
        let aux = FsAux::compute(&info).unwrap();
        BlockAllocator::new(&info, &aux)
    }

    #[test]
    fn pack_single_block_stretches_last_entry() {
        let entries = vec![
            DirEntry::new(2, *b".", FT_DIR),
            DirEntry::new(2, *b"..", FT_DIR),
            DirEntry::new(12, "foo.txt", FT_REG_FILE),
        ];
        let blocks = pack_entries(&entries, 1024);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        let last_rec_len = u16::from_le_bytes(
            block[block.len() - 1024 + 20..block.len() - 1024 + 22]
                .try_into()
                .unwrap(),
        );
        // Last entry starts at offset 24 (12 + 12) and should reach 1024.
        assert!(last_rec_len > 0);
        assert_eq!(block.len(), 1024);
    }

    #[test]
    fn pack_overflows_into_multiple_blocks() {
        let mut entries = vec![DirEntry::new(2, *b".", FT_DIR), DirEntry::new(2, *b"..", FT_DIR)];
        for i in 0..200 {
            entries.push(DirEntry::new(100 + i, format!("file{i}"), FT_REG_FILE));
        }
        let blocks = pack_entries(&entries, 1024);
        assert!(blocks.len() > 1);
        for b in &blocks {
            assert_eq!(b.len(), 1024);
        }
    }

    #[test]
    fn directory_inode_has_two_links_and_extents() {
        let mut allocator = allocator();
        let entries = vec![DirEntry::new(2, *b".", FT_DIR), DirEntry::new(2, *b"..", FT_DIR)];
        let built = build_directory_inode(&mut allocator, 1024, 0o755, 0, 0, 0, &entries).unwrap();
        assert_eq!(built.inode.links_count, 2);
        assert!(built.inode.has_extents());
        assert!(!built.blocks.is_empty());
    }

    #[test]
    fn short_symlink_is_inline() {
        let mut allocator = allocator();
        let built = build_symlink_inode(&mut allocator, 1024, 0, 0, 0, b"/bin/sh").unwrap();
        assert_eq!(built.inode.size, 7);
        assert!(built.blocks.is_empty());
    }

    #[test]
    fn device_node_encodes_rdev() {
        let built = build_special_inode(S_IFCHR | 0o666, 0, 0, 0, 1, 3).unwrap();
        assert_eq!(built.inode.block[0], (1 << 8) | 3);
    }
}
