//! Common primitives shared by the norbm crates.
//!
//! This crate carries the pieces of the translation layer that are useful on
//! their own: the multi-byte codec for configurable on-flash endianness, the
//! CRC back-ends used for header and payload checking, and the Hamming ECC
//! used for bit-error correction.

#![no_std]

/// CRC-8 and CRC-16 back-ends.
pub mod crc;
/// Single-error-correcting ECC over power-of-two blocks.
pub mod ecc;
/// Multi-byte field codec.
pub mod endian;

pub use crc::{CrcApi, CrcSoftware};
pub use ecc::{EccApi, EccError, EccHamming};
pub use endian::ByteOrder;
