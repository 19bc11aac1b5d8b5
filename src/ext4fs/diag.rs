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

//! Plain stderr/stdout diagnostics, in the same spirit as `utils::error`: no
//! logging framework, one line per message.

use std::fmt;
use std::process::exit;

/// Writes an error to stderr, then exits with status 1.
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}

/// Writes a non-fatal warning to stderr (used when `-f`/force downgrades a
/// recoverable error).
pub fn warn<M: fmt::Display>(bin: &str, msg: M) {
    eprintln!("{bin}: warning: {msg}");
}

/// Writes a verbose-mode line to stdout, only if `enabled`.
pub fn verbose<M: fmt::Display>(enabled: bool, msg: M) {
    if enabled {
        println!("{msg}");
    }
}
