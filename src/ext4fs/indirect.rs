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

//! Legacy direct/indirect/double-indirect/triple-indirect block map, used
//! when `EXTENTS_FL` is not set. Kept as a standalone, tested traversal: the
//! write side is exercised by this tool when asked to build a non-extent
//! inode; the read side exists for the same reason the original kept it
//! available to the (out-of-scope) re-layout tool — traversing an existing
//! block-mapped inode is a useful, independently testable capability.

use crate::alloc::{BlockAllocation, BlockAllocator};
use crate::error::{Error, Result};
use crate::inode::Inode;
use crate::util::ceil_division;

const DIRECT_COUNT: usize = 12;

/// Number of `u32` pointers held by one indirect block.
pub fn blocks_per_indirect(block_size: u64) -> u64 {
    block_size / 4
}

/// Builds a direct/indirect/double/triple block map over `alloc.main`'s
/// blocks (assumed already in ascending logical order) and writes it into
/// `inode.block`. Reserves whatever metadata blocks are needed via
/// `allocator.reserve_oob_blocks`, rendering each one through `on_node`.
pub fn build_indirect_blocks(
    inode: &mut Inode,
    alloc: &mut BlockAllocation,
    allocator: &mut BlockAllocator,
    block_size: u64,
    mut on_node: impl FnMut(u64, Vec<u8>),
) -> Result<()> {
    let blocks: Vec<u64> = {
        let mut list = alloc.main.clone();
        list.rewind();
        std::iter::from_fn(|| list.next_block()).collect()
    };
    let per_ind = blocks_per_indirect(block_size) as usize;

    let mut it = blocks.into_iter();
    let mut block = [0u32; 15];
    for slot in block.iter_mut().take(DIRECT_COUNT) {
        if let Some(b) = it.next() {
            *slot = b as u32;
        }
    }

    let remaining: Vec<u64> = it.collect();
    if remaining.is_empty() {
        inode.block = block;
        return Ok(());
    }

    // Single indirect: up to `per_ind` more blocks.
    let (single, rest) = split_at_most(&remaining, per_ind);
    let single_node_block = write_indirect_level(single, allocator, alloc, block_size, &mut on_node)?;
    block[12] = single_node_block as u32;
    if rest.is_empty() {
        inode.block = block;
        return Ok(());
    }

    // Double indirect: up to `per_ind * per_ind` more blocks, grouped into
    // `per_ind`-sized single-indirect children.
    let dind_capacity = per_ind * per_ind;
    let (double, rest) = split_at_most(&rest, dind_capacity);
    let dind_block = write_double_indirect(&double, allocator, alloc, block_size, per_ind, &mut on_node)?;
    block[13] = dind_block as u32;
    if rest.is_empty() {
        inode.block = block;
        return Ok(());
    }

    // Triple indirect: the remainder, grouped into double-indirect children.
    let tind_block = write_triple_indirect(&rest, allocator, alloc, block_size, per_ind, &mut on_node)?;
    block[14] = tind_block as u32;
    inode.block = block;
    Ok(())
}

fn split_at_most(v: &[u64], n: usize) -> (Vec<u64>, Vec<u64>) {
    if v.len() <= n {
        (v.to_vec(), Vec::new())
    } else {
        (v[..n].to_vec(), v[n..].to_vec())
    }
}

fn render_pointer_block(pointers: &[u32], block_size: u64) -> Vec<u8> {
    let mut buf = vec![0u8; block_size as usize];
    for (i, p) in pointers.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
    }
    buf
}

fn write_indirect_level(
    data_blocks: Vec<u64>,
    allocator: &mut BlockAllocator,
    alloc: &mut BlockAllocation,
    block_size: u64,
    on_node: &mut impl FnMut(u64, Vec<u8>),
) -> Result<u64> {
    allocator.reserve_oob_blocks(alloc, 1)?;
    let node_block = alloc
        .oob
        .next_block()
        .ok_or_else(|| Error::Geometry("missing reserved indirect block".into()))?;
    let pointers: Vec<u32> = data_blocks.iter().map(|&b| b as u32).collect();
    on_node(node_block, render_pointer_block(&pointers, block_size));
    Ok(node_block)
}

fn write_double_indirect(
    blocks: &[u64],
    allocator: &mut BlockAllocator,
    alloc: &mut BlockAllocation,
    block_size: u64,
    per_ind: usize,
    on_node: &mut impl FnMut(u64, Vec<u8>),
) -> Result<u64> {
    let child_count = ceil_division(blocks.len(), per_ind);
    allocator.reserve_oob_blocks(alloc, 1)?;
    let dind_block = alloc
        .oob
        .next_block()
        .ok_or_else(|| Error::Geometry("missing reserved double-indirect block".into()))?;
    let mut child_pointers = Vec::with_capacity(child_count);
    for chunk in blocks.chunks(per_ind) {
        let node = write_indirect_level(chunk.to_vec(), allocator, alloc, block_size, on_node)?;
        child_pointers.push(node as u32);
    }
    on_node(dind_block, render_pointer_block(&child_pointers, block_size));
    Ok(dind_block)
}

fn write_triple_indirect(
    blocks: &[u64],
    allocator: &mut BlockAllocator,
    alloc: &mut BlockAllocation,
    block_size: u64,
    per_ind: usize,
    on_node: &mut impl FnMut(u64, Vec<u8>),
) -> Result<u64> {
    let dind_capacity = per_ind * per_ind;
    let child_count = ceil_division(blocks.len(), dind_capacity);
    allocator.reserve_oob_blocks(alloc, 1)?;
    let tind_block = alloc
        .oob
        .next_block()
        .ok_or_else(|| Error::Geometry("missing reserved triple-indirect block".into()))?;
    let mut child_pointers = Vec::with_capacity(child_count);
    for chunk in blocks.chunks(dind_capacity) {
        let node = write_double_indirect(chunk, allocator, alloc, block_size, per_ind, on_node)?;
        child_pointers.push(node as u32);
    }
    on_node(tind_block, render_pointer_block(&child_pointers, block_size));
    Ok(tind_block)
}

/// Reads back the logical block list of a legacy block-mapped inode, given a
/// function to fetch the raw bytes of any physical block. Traverses direct,
/// then single, double and triple indirect pointers, in that order.
pub fn read_indirect_blocks(
    inode: &Inode,
    block_size: u64,
    mut read_block: impl FnMut(u64) -> Result<Vec<u8>>,
) -> Result<Vec<u64>> {
    let per_ind = blocks_per_indirect(block_size) as usize;
    let mut out = Vec::new();

    for &p in &inode.block[0..DIRECT_COUNT] {
        if p != 0 {
            out.push(p as u64);
        }
    }
    if inode.block[12] != 0 {
        read_pointer_block(inode.block[12] as u64, &mut read_block, &mut out)?;
    }
    if inode.block[13] != 0 {
        let children = read_pointer_list(inode.block[13] as u64, &mut read_block)?;
        for child in children {
            if child != 0 {
                read_pointer_block(child, &mut read_block, &mut out)?;
            }
        }
    }
    if inode.block[14] != 0 {
        let dinds = read_pointer_list(inode.block[14] as u64, &mut read_block)?;
        for dind in dinds {
            if dind == 0 {
                continue;
            }
            let children = read_pointer_list(dind, &mut read_block)?;
            for child in children {
                if child != 0 {
                    read_pointer_block(child, &mut read_block, &mut out)?;
                }
            }
        }
    }
    let _ = per_ind;
    Ok(out)
}

fn read_pointer_list(
    block: u64,
    read_block: &mut impl FnMut(u64) -> Result<Vec<u8>>,
) -> Result<Vec<u32>> {
    let buf = read_block(block)?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn read_pointer_block(
    block: u64,
    read_block: &mut impl FnMut(u64) -> Result<Vec<u8>>,
    out: &mut Vec<u64>,
) -> Result<()> {
    for p in read_pointer_list(block, read_block)? {
        if p != 0 {
            out.push(p as u64);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{FsAux, FsInfo};
    use std::collections::HashMap;

    #[test]
    fn round_trip_beyond_direct_blocks() {
        let info = FsInfo {
            len: 64 * 1024 * 1024,
            block_size: 1024,
            ..Default::default()
        }
        .finalize()
        .unwrap();
        let aux = FsAux::compute(&info).unwrap();
        let mut allocator = BlockAllocator::new(&info, &aux);
        // 1024-byte blocks give 256 pointers per indirect block; ask for
        // more than 12 direct blocks to force a single-indirect node.
        let mut alloc = allocator.allocate_blocks(20).unwrap();
        let mut inode = Inode::default();
        let mut written = HashMap::new();
        build_indirect_blocks(&mut inode, &mut alloc, &mut allocator, info.block_size, |b, d| {
            written.insert(b, d);
        })
        .unwrap();
        assert_ne!(inode.block[12], 0);

        let read_back = read_indirect_blocks(&inode, info.block_size, |b| {
            written
                .get(&b)
                .cloned()
                .ok_or_else(|| Error::Format("unknown block".into()))
        })
        .unwrap();
        assert_eq!(read_back.len(), 20);
    }
}
