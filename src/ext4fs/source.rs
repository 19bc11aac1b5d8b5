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

//! The host-directory-walk interface. A real walk over `std::fs` lives in
//! the CLI binary (out of scope for this crate's core, per the
//! specification); `Engine::build_tree` only needs something shaped like
//! `DirSource` to recurse over. Kept here, rather than behind a feature
//! flag, so the trait boundary and its invariants are documented alongside
//! the engine that consumes it.

use crate::error::Result;
use std::fs::File;

/// What kind of filesystem entry a `DirSource` node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Directory,
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// One node of a host directory tree, as `Engine::build_tree` needs it.
/// Implementations are expected to yield entries in a stable, sorted
/// order (typically by name) so that repeated builds from the same
/// tree are byte-for-byte identical.
pub trait DirSource {
    /// The entry's base name (no path separators).
    fn name(&self) -> &str;

    /// The entry's path relative to the tree root, using `/` separators;
    /// used as the lookup key into a loaded `FsConfigTable` and in
    /// block-list reports.
    fn relative_path(&self) -> &str;

    /// What this entry is.
    fn kind(&self) -> SourceKind;

    /// Content length in bytes; meaningful only for `Regular`.
    fn len(&self) -> u64;

    /// The symlink target; meaningful only for `Symlink`.
    fn symlink_target(&self) -> Option<Vec<u8>>;

    /// `(major, minor)`; meaningful only for `CharDevice`/`BlockDevice`.
    fn rdev(&self) -> Option<(u32, u32)>;

    /// Opens the entry's content for reading; meaningful only for
    /// `Regular`.
    fn open(&self) -> Result<File>;

    /// Lists this directory's children, sorted by name; meaningful only
    /// for `Directory`.
    fn children(&self) -> Result<Vec<Box<dyn DirSource>>>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A minimal in-memory `DirSource`, used by engine tests so they don't
    /// depend on real files on disk.
    pub struct MemNode {
        pub name: String,
        pub relative_path: String,
        pub kind: SourceKind,
        pub content: Vec<u8>,
        pub target: Option<Vec<u8>>,
        pub children: Vec<MemNode>,
    }

    impl DirSource for MemNode {
        fn name(&self) -> &str {
            &self.name
        }

        fn relative_path(&self) -> &str {
            &self.relative_path
        }

        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn len(&self) -> u64 {
            self.content.len() as u64
        }

        fn symlink_target(&self) -> Option<Vec<u8>> {
            self.target.clone()
        }

        fn rdev(&self) -> Option<(u32, u32)> {
            None
        }

        fn open(&self) -> Result<File> {
            // Not exercised directly; engine tests feed content through a
            // different seam (see engine.rs tests).
            unimplemented!("MemNode has no backing file")
        }

        fn children(&self) -> Result<Vec<Box<dyn DirSource>>> {
            Ok(self
                .children
                .iter()
                .map(|c| {
                    let boxed: Box<dyn DirSource> = Box::new(MemNode {
                        name: c.name.clone(),
                        relative_path: c.relative_path.clone(),
                        kind: c.kind,
                        content: c.content.clone(),
                        target: c.target.clone(),
                        children: c
                            .children
                            .iter()
                            .map(|gc| MemNode {
                                name: gc.name.clone(),
                                relative_path: gc.relative_path.clone(),
                                kind: gc.kind,
                                content: gc.content.clone(),
                                target: gc.target.clone(),
                                children: Vec::new(),
                            })
                            .collect(),
                    });
                    boxed
                })
                .collect())
        }
    }

    #[test]
    fn mem_node_reports_kind_and_len() {
        let node = MemNode {
            name: "hello.txt".into(),
            relative_path: "hello.txt".into(),
            kind: SourceKind::Regular,
            content: b"hi".to_vec(),
            target: None,
            children: Vec::new(),
        };
        assert_eq!(node.kind(), SourceKind::Regular);
        assert_eq!(node.len(), 2);
    }
}
