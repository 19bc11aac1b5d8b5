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

//! Filesystem parameters (`FsInfo`, caller/CLI-supplied) and their derived
//! layout (`FsAux`), mirroring `ext4_init_fs_aux_info`/`make_ext4fs_internal`.

use crate::error::{Error, Result};
use crate::util::ceil_division;

/// Compat feature: the filesystem has a journal.
pub const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
/// Compat feature: inodes have extended attributes.
pub const FEATURE_COMPAT_EXT_ATTR: u32 = 0x0008;
/// Compat feature: a resize inode is present.
pub const FEATURE_COMPAT_RESIZE_INODE: u32 = 0x0010;

/// Incompat feature: directory entries carry a file-type byte.
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
/// Incompat feature: inodes use extent trees instead of block maps.
pub const FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;

/// Ro-compat feature: only some groups carry a superblock backup.
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
/// Ro-compat feature: files may exceed 2 GiB.
pub const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
/// Ro-compat feature: group descriptors carry a CRC16 checksum.
pub const FEATURE_RO_COMPAT_GDT_CSUM: u32 = 0x0010;

/// Inode flag: do not update atime.
pub const EXT4_NOATIME_FL: u32 = 0x80;
/// Inode flag: data is addressed through an extent tree.
pub const EXT4_EXTENTS_FL: u32 = 0x80000;

/// The inode number of the root directory.
pub const ROOT_INODE: u32 = 2;
/// The inode number reserved for the resize inode.
pub const RESIZE_INODE: u32 = 7;
/// The inode number reserved for the journal.
pub const JOURNAL_INODE: u32 = 8;
/// The first inode number available for ordinary files once the ten
/// reserved/special inodes have been set aside.
pub const FIRST_NON_RESERVED_INODE: u32 = 11;

/// Caller-supplied (or defaulted) filesystem parameters.
#[derive(Debug, Clone)]
pub struct FsInfo {
    /// Total image length in bytes.
    pub len: u64,
    /// Block size in bytes. Must be a power of two, >= 1024.
    pub block_size: u64,
    /// Number of blocks per block group.
    pub blocks_per_group: u32,
    /// Total number of inodes across the whole filesystem.
    pub inodes: u32,
    /// Number of inodes per block group.
    pub inodes_per_group: u32,
    /// Size in bytes of a single on-disk inode (128 or 256).
    pub inode_size: u16,
    /// Number of journal blocks, or 0 for no journal.
    pub journal_blocks: u32,
    /// Reserved-blocks percentage (0..=100).
    pub reserve_pcnt: u8,
    /// Volume label, at most 16 bytes.
    pub label: [u8; 16],
    /// Filesystem UUID.
    pub uuid: [u8; 16],
    /// Compat feature bitmap.
    pub feat_compat: u32,
    /// Incompat feature bitmap.
    pub feat_incompat: u32,
    /// Ro-compat feature bitmap.
    pub feat_ro_compat: u32,
    /// If true, recoverable errors are downgraded to warnings.
    pub force: bool,
}

impl FsInfo {
    /// Computes the default block size: 4096.
    pub fn compute_block_size() -> u64 {
        4096
    }

    /// Computes the default journal size in blocks, matching
    /// `compute_journal_blocks`: `len/block_size/64`, clamped to
    /// `[1024, 32768]`.
    pub fn compute_journal_blocks(len: u64, block_size: u64) -> u32 {
        let blocks = len / block_size / 64;
        blocks.clamp(1024, 32768) as u32
    }

    /// Computes the default blocks-per-group: one bitmap block's worth of
    /// bits.
    pub fn compute_blocks_per_group(block_size: u64) -> u32 {
        (block_size * 8) as u32
    }

    /// Computes the default inode count: `len/block_size/4`.
    pub fn compute_inodes(len: u64, block_size: u64) -> u32 {
        (len / block_size / 4) as u32
    }

    /// Computes inodes-per-group from a total inode count and the number of
    /// groups, rounding up to a whole number of inode-table blocks per group.
    pub fn compute_inodes_per_group(
        inodes: u32,
        groups: u32,
        block_size: u64,
        inode_size: u16,
    ) -> u32 {
        let inodes_per_group = ceil_division(inodes as u64, groups as u64) as u32;
        let inodes_per_block = (block_size / inode_size as u64) as u32;
        ceil_division(inodes_per_group, inodes_per_block) * inodes_per_block
    }

    /// Computes the number of blocks reserved past the group-descriptor
    /// table, for future online resize (`compute_bg_desc_reserve_blocks`).
    pub fn compute_bg_desc_reserve_blocks(
        bg_desc_blocks: u32,
        block_size: u64,
        groups: u32,
    ) -> u32 {
        let max_bg_desc_blocks = (block_size / 32).min(block_size - 1) as u32;
        let bg_desc_reserve_blocks = (max_bg_desc_blocks.saturating_sub(bg_desc_blocks)).min(groups);
        bg_desc_reserve_blocks
    }

    /// Fills in defaulted fields and validates the result. Mirrors the
    /// parameter-derivation section of `make_ext4fs_internal`.
    pub fn finalize(mut self) -> Result<Self> {
        if self.block_size == 0 || self.block_size & (self.block_size - 1) != 0 {
            return Err(Error::Parameter(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.block_size < 1024 {
            return Err(Error::Parameter("block size must be at least 1024".into()));
        }
        self.len -= self.len % self.block_size;
        if self.len == 0 {
            return Err(Error::Parameter("image length must be non-zero".into()));
        }
        if self.blocks_per_group == 0 {
            self.blocks_per_group = Self::compute_blocks_per_group(self.block_size);
        }
        if self.inode_size == 0 {
            self.inode_size = 256;
        }
        if self.inodes == 0 {
            self.inodes = Self::compute_inodes(self.len, self.block_size);
        }
        if self.inodes_per_group == 0 {
            let first_data_block = if self.block_size > 1024 { 0 } else { 1 };
            let len_blocks = (self.len / self.block_size) as u32;
            let groups = ceil_division(
                (len_blocks - first_data_block) as u64,
                self.blocks_per_group as u64,
            ) as u32;
            self.inodes_per_group = Self::compute_inodes_per_group(
                self.inodes,
                groups.max(1),
                self.block_size,
                self.inode_size,
            );
            self.inodes = self.inodes_per_group * groups.max(1);
        }
        Ok(self)
    }
}

impl Default for FsInfo {
    fn default() -> Self {
        Self {
            len: 0,
            block_size: Self::compute_block_size(),
            blocks_per_group: 0,
            inodes: 0,
            inodes_per_group: 0,
            inode_size: 256,
            journal_blocks: 0,
            reserve_pcnt: 5,
            label: [0; 16],
            uuid: [0; 16],
            feat_compat: FEATURE_COMPAT_EXT_ATTR | FEATURE_COMPAT_RESIZE_INODE,
            feat_incompat: FEATURE_INCOMPAT_FILETYPE | FEATURE_INCOMPAT_EXTENTS,
            feat_ro_compat: FEATURE_RO_COMPAT_SPARSE_SUPER
                | FEATURE_RO_COMPAT_LARGE_FILE
                | FEATURE_RO_COMPAT_GDT_CSUM,
            force: false,
        }
    }
}

/// Layout derived from `FsInfo`, mirroring `struct fs_aux_info`.
#[derive(Debug, Clone)]
pub struct FsAux {
    /// The first block usable for data (0 for block sizes > 1024, else 1).
    pub first_data_block: u32,
    /// Total number of blocks in the filesystem (after tail-group truncation).
    pub len_blocks: u32,
    /// Number of blocks making up one group's inode table.
    pub inode_table_blocks: u32,
    /// Number of block groups.
    pub groups: u32,
    /// Number of blocks making up the group-descriptor table.
    pub bg_desc_blocks: u32,
    /// Number of blocks reserved past the descriptor table for online resize.
    pub bg_desc_reserve_blocks: u32,
    /// Number of block pointers held by one indirect block.
    pub blocks_per_ind: u32,
    /// Number of block pointers reachable through one double-indirect block.
    pub blocks_per_dind: u32,
    /// Number of block pointers reachable through one triple-indirect block.
    pub blocks_per_tind: u32,
    /// Default flags applied to every inode created by this tool.
    pub default_i_flags: u32,
}

impl FsAux {
    /// Computes the auxiliary layout from validated `FsInfo`, mirroring
    /// `ext4_init_fs_aux_info`.
    pub fn compute(info: &FsInfo) -> Result<Self> {
        let first_data_block = if info.block_size > 1024 { 0 } else { 1 };
        let mut len_blocks = (info.len / info.block_size) as u32;

        let inode_table_blocks = ceil_division(
            info.inodes_per_group as u64 * info.inode_size as u64,
            info.block_size,
        ) as u32;
        let groups = ceil_division(
            (len_blocks - first_data_block) as u64,
            info.blocks_per_group as u64,
        ) as u32;
        if groups == 0 {
            return Err(Error::Geometry("image is too small for even one group".into()));
        }

        let blocks_per_ind = (info.block_size / 4) as u32;
        let blocks_per_dind = blocks_per_ind * blocks_per_ind;
        let blocks_per_tind = blocks_per_dind * blocks_per_ind;

        let bg_desc_blocks =
            ceil_division(groups as u64 * 32, info.block_size) as u32;
        let bg_desc_reserve_blocks =
            FsInfo::compute_bg_desc_reserve_blocks(bg_desc_blocks, info.block_size, groups);

        // Truncate a final group that is too small to hold its own header.
        let last_group_size = len_blocks - ((groups - 1) * info.blocks_per_group) - first_data_block;
        let last_header_size =
            2 + bg_desc_blocks + bg_desc_reserve_blocks + inode_table_blocks;
        let groups = if groups > 1 && last_group_size < last_header_size {
            len_blocks -= last_group_size;
            groups - 1
        } else {
            groups
        };

        Ok(Self {
            first_data_block,
            len_blocks,
            inode_table_blocks,
            groups,
            bg_desc_blocks,
            bg_desc_reserve_blocks,
            blocks_per_ind,
            blocks_per_dind,
            blocks_per_tind,
            default_i_flags: EXT4_NOATIME_FL,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_blocks_clamped() {
        assert_eq!(FsInfo::compute_journal_blocks(1_000_000, 4096), 1024);
        assert_eq!(FsInfo::compute_journal_blocks(1 << 40, 4096), 32768);
    }

    #[test]
    fn inodes_per_group_rounds_to_block() {
        // 4096 / 256 = 16 inodes per inode-table block.
        let v = FsInfo::compute_inodes_per_group(100, 1, 4096, 256);
        assert_eq!(v % 16, 0);
        assert!(v >= 100);
    }

    #[test]
    fn aux_small_image() {
        let info = FsInfo {
            len: 16 * 1024 * 1024,
            ..Default::default()
        }
        .finalize()
        .unwrap();
        let aux = FsAux::compute(&info).unwrap();
        assert_eq!(aux.first_data_block, 0);
        assert_eq!(aux.groups, 1);
    }
}
