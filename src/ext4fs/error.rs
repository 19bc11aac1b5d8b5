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

//! Error type shared by every stage of the image-building engine.

use std::fmt;
use std::io;

/// The error type returned by fallible operations in this crate.
#[derive(Debug)]
pub enum Error {
    /// A caller-supplied parameter is invalid or conflicts with another one.
    Parameter(String),
    /// The computed on-disk layout is inconsistent.
    Geometry(String),
    /// A block or inode allocation request could not be satisfied.
    Allocation(String),
    /// An I/O error occurred while reading input or writing the image.
    Io(io::Error),
    /// A sparse-image header or chunk was malformed.
    Format(String),
    /// A host-side directory-walk operation (stat, readlink, scandir) failed.
    Host(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameter(msg) => write!(fmt, "invalid parameter: {msg}"),
            Self::Geometry(msg) => write!(fmt, "invalid layout: {msg}"),
            Self::Allocation(msg) => write!(fmt, "allocation failed: {msg}"),
            Self::Io(e) => write!(fmt, "I/O error: {e}"),
            Self::Format(msg) => write!(fmt, "malformed image: {msg}"),
            Self::Host(e) => write!(fmt, "host error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::Host(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Shorthand for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
