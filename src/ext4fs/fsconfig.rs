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

//! Canned fs_config table: a flat text file mapping a source-relative path
//! to the `uid gid mode [capabilities=N]` it should be assigned in the
//! image, looked up by exact path match. Grounded on
//! `canned_fs_config.c`'s `load_canned_fs_config`/`canned_fs_config`, here
//! built as a sorted `Vec` searched with `binary_search_by` instead of
//! `qsort`/`bsearch` over a realloc'd C array.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// One entry of the canned table.
#[derive(Debug, Clone)]
struct Entry {
    path: String,
    uid: u32,
    gid: u32,
    mode: u32,
    capabilities: u64,
}

/// A loaded, path-sorted fs_config table.
#[derive(Debug, Clone, Default)]
pub struct FsConfigTable {
    entries: Vec<Entry>,
}

/// What `lookup` returns for a path present in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfigEntry {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub capabilities: u64,
}

impl FsConfigTable {
    /// Parses a canned fs_config file. Each non-empty, non-comment line is
    /// `path uid gid mode [capabilities=N]`, whitespace-separated; `mode` is
    /// octal. Blank lines and lines whose first token starts with `#` are
    /// skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let mut it = line.split_whitespace();
            let Some(p) = it.next() else { continue };
            if p.is_empty() || p.starts_with('#') {
                continue;
            }
            let uid = it
                .next()
                .ok_or_else(|| Error::Format(format!("fs_config: missing uid for {p}")))?
                .parse()
                .map_err(|_| Error::Format(format!("fs_config: bad uid for {p}")))?;
            let gid = it
                .next()
                .ok_or_else(|| Error::Format(format!("fs_config: missing gid for {p}")))?
                .parse()
                .map_err(|_| Error::Format(format!("fs_config: bad gid for {p}")))?;
            let mode_str = it
                .next()
                .ok_or_else(|| Error::Format(format!("fs_config: missing mode for {p}")))?;
            let mode = u32::from_str_radix(mode_str, 8)
                .map_err(|_| Error::Format(format!("fs_config: bad octal mode for {p}")))?;
            let mut capabilities = 0u64;
            for token in it {
                if let Some(rest) = token.strip_prefix("capabilities=") {
                    capabilities = parse_capabilities(rest)?;
                    break;
                }
            }
            entries.push(Entry {
                path: p.to_string(),
                uid,
                gid,
                mode,
                capabilities,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { entries })
    }

    /// Looks up `path` (the source-relative path as it will appear in the
    /// image, e.g. `system/bin/sh`) by exact match.
    pub fn lookup(&self, path: &str) -> Option<FsConfigEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| {
                let e = &self.entries[i];
                FsConfigEntry {
                    uid: e.uid,
                    gid: e.gid,
                    mode: e.mode,
                    capabilities: e.capabilities,
                }
            })
    }

    /// Number of entries loaded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_capabilities(s: &str) -> Result<u64> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else {
        (s, 10)
    };
    u64::from_str_radix(digits, radix)
        .map_err(|_| Error::Format(format!("fs_config: bad capabilities value {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("fs_config_test_{:p}", contents.as_ptr()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn looks_up_exact_path() {
        let path = write_temp(
            "# comment\n\
             system/bin/sh 0 2000 0755\n\
             system/bin/run-as 0 2000 06755 capabilities=0x3\n",
        );
        let table = FsConfigTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        let sh = table.lookup("system/bin/sh").unwrap();
        assert_eq!(sh.mode, 0o755);
        assert_eq!(sh.capabilities, 0);
        let run_as = table.lookup("system/bin/run-as").unwrap();
        assert_eq!(run_as.mode, 0o6755);
        assert_eq!(run_as.capabilities, 3);
        assert!(table.lookup("nonexistent").is_none());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn accepts_decimal_capabilities() {
        let path = write_temp("bin/foo 1000 1000 0644 capabilities=7\n");
        let table = FsConfigTable::load(&path).unwrap();
        assert_eq!(table.lookup("bin/foo").unwrap().capabilities, 7);
        let _ = fs::remove_file(&path);
    }
}
