//! Block-mapping flash translation layer for raw NOR flash.
//!
//! The medium only clears bits on write and erases in coarse sectors;
//! this crate presents it as a linear array of fixed-size logical sectors
//! anyway. One physical sector holds one logical block as a *data block*
//! (sectors at their native positions) or absorbs scattered updates to
//! one block as a *work block* (sectors anywhere, tracked in RAM).
//! Conversion merges work blocks back into data blocks; allocation
//! wear-levels the erase pool; every visible state transition commits
//! with a single flash-line write, so a power cut at any point leaves a
//! mountable medium where each logical sector reads as either its old or
//! its new content.
//!
//! ```
//! use norbm::{Config, Features, Instance};
//! use norbm_phy::RamNor;
//!
//! let cfg = Config::with_features(Features::FAIL_SAFE_ERASE | Features::CRC);
//! let mut inst = Instance::new(RamNor::new(32, 4096), cfg);
//! inst.format()?;
//! inst.mount()?;
//!
//! let payload = [0xAB; 512];
//! inst.write_sector(0, &payload)?;
//! let mut back = [0u8; 512];
//! inst.read_sector(0, &mut back)?;
//! assert_eq!(back, payload);
//! # Ok::<(), norbm::Error>(())
//! ```
//!
//! ## Cargo features
//!
//! - **std**: host-side conveniences in the phy layer; the engine itself
//!   is `no_std` + `alloc`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod structures;

mod cache;
mod freemap;
mod ftl;
mod l2p;

pub use config::{Config, Features, OnFatalError};
pub use device::{DeviceStatus, NorDevice};
pub use error::{Error, FatalErrorInfo, FatalPolicy};
pub use ftl::{DiskInfo, Instance, SectorUsage};
