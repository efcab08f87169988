//! NoctFS boot sector
//!
//! The first sector of a NoctFS device does not load anything. When a machine is booted from it,
//! it prints a message saying the disk is not bootable and halts. This crate produces that sector
//! and checks it:
//!
//! - [`BootImageBuilder`] assembles the real-mode stub and pads it into a signed 512-byte sector
//! - [`verify()`] reports every way a sector breaks the layout in [`layout`]
//! - [`emu`] runs a sector on a tiny 8086 model, recording the teletype output
//! - [`install()`] writes the sector to a device (requires the `std` feature)
//!
//! ## Cargo Features
//!
//! - **std**: Enables installing to [`std::io`] devices. Everything else only needs `alloc`.
//!
//! ## Example
//! ```
//! use noctfs_boot::{BootImage, emu};
//!
//! let image = BootImage::reference();
//! let run = emu::run_boot_sector(image.as_bytes(), 10_000)?;
//! assert_eq!(run.output, image.message());
//! # Ok::<(), noctfs_boot::emu::EmuError>(())
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod asm;
pub mod emu;
pub mod image;
pub mod layout;
pub mod raw;
pub mod verify;

#[cfg(feature = "std")]
pub mod install;

pub use image::{BootImage, BootImageBuilder, ImageError};
pub use raw::RawBootSector;
pub use verify::{Report, Violation, verify};

#[cfg(feature = "std")]
pub use install::{InstallError, InstallOptions, install, read_boot_sector};
