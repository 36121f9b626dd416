//! Shared building blocks for the `rmv` migration tools.
//!
//! This crate carries the pieces that are independent of the migration engine
//! itself: retry-hardened filesystem primitives ([`fs`]) and byte-level
//! progress accounting with throttled percent emission ([`progress`]).

pub mod fs;
pub mod progress;

#[cfg(test)]
pub mod testutils;
