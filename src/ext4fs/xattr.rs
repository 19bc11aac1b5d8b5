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

//! External xattr block construction. Used only to attach
//! `security.capability` to inodes whose fs_config entry carries a nonzero
//! capability mask.

use crate::crc32;

/// Header magic for an external attribute block.
const XATTR_MAGIC: u32 = 0xEA020000;
/// Name index for attributes in the `security` namespace.
const EXT4_XATTR_INDEX_SECURITY: u8 = 6;
const CAPABILITY_NAME: &[u8] = b"capability";

/// `struct vfs_cap_data`: version 2, two (permitted, inheritable) pairs.
const VFS_CAP_REVISION_2: u32 = 0x02000000;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Encodes a `security.capability` value (`vfs_cap_data`, version 2) from a
/// 64-bit permitted-and-inheritable capability mask, mirroring
/// `fs_config`'s interpretation of its capability column.
pub fn encode_capability_value(capabilities: u64) -> Vec<u8> {
    let permitted = capabilities as u32;
    let permitted_hi = (capabilities >> 32) as u32;
    let mut v = Vec::with_capacity(20);
    v.extend_from_slice(&VFS_CAP_REVISION_2.to_le_bytes());
    v.extend_from_slice(&permitted.to_le_bytes());
    v.extend_from_slice(&0u32.to_le_bytes()); // inheritable[0]
    v.extend_from_slice(&permitted_hi.to_le_bytes());
    v.extend_from_slice(&0u32.to_le_bytes()); // inheritable[1]
    v
}

/// Renders one external xattr block containing a single `security.capability`
/// entry, sized to `block_size` bytes.
pub fn build_capability_block(block_size: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; block_size as usize];
    buf[0..4].copy_from_slice(&XATTR_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&1u32.to_le_bytes()); // refcount
    buf[8..12].copy_from_slice(&1u32.to_le_bytes()); // blocks
    // hash (12..16) left 0: single-entry blocks are not deduplicated here.
    // checksum (16..20) filled in below.

    let entry_off = 32usize;
    let name_len = CAPABILITY_NAME.len();
    let entry_len = align4(16 + name_len);
    let value_off = entry_off + entry_len;
    let value_len = align4(value.len());

    buf[entry_off] = name_len as u8;
    buf[entry_off + 1] = EXT4_XATTR_INDEX_SECURITY;
    buf[entry_off + 2..entry_off + 4].copy_from_slice(&(value_off as u16).to_le_bytes());
    buf[entry_off + 4..entry_off + 8].copy_from_slice(&0u32.to_le_bytes()); // e_value_block
    buf[entry_off + 8..entry_off + 12].copy_from_slice(&(value.len() as u32).to_le_bytes());
    buf[entry_off + 12..entry_off + 16].copy_from_slice(&0u32.to_le_bytes()); // e_hash
    buf[entry_off + 16..entry_off + 16 + name_len].copy_from_slice(CAPABILITY_NAME);

    buf[value_off..value_off + value.len()].copy_from_slice(value);
    let _ = value_len;

    let table = crc32::ieee_table();
    let checksum = crc32::compute(&buf, &table);
    buf[16..20].copy_from_slice(&checksum.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_block_is_self_consistent() {
        let value = encode_capability_value(0x0000_0000_0000_0003);
        let block = build_capability_block(1024, &value);
        assert_eq!(block.len(), 1024);
        assert_eq!(u32::from_le_bytes(block[0..4].try_into().unwrap()), XATTR_MAGIC);
        let name_len = block[32] as usize;
        assert_eq!(&block[48..48 + name_len], CAPABILITY_NAME);
    }

    #[test]
    fn capability_value_splits_high_and_low() {
        let value = encode_capability_value(0x0000_0002_0000_0001);
        assert_eq!(u32::from_le_bytes(value[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(value[12..16].try_into().unwrap()), 2);
    }
}
