//! Core library for preparing and patching an Apple XNU prelinked-kernel boot image prior to
//! kernel handoff: reads a possibly-FAT, possibly-compressed image (component A), edits Mach-O
//! load commands and symbols in place (component B), manages the prelinked kext list and
//! `__PRELINK_INFO` plist (component C), applies an ordered table of byte patches and named
//! quirks (component D), and injects additional kexts (component E).
//!
//! Because of the nature of this crate, there are lots of times we cast aliased types to `u64`.
//! Often, on 64-bit platforms, it's already that, so Clippy gets upset at the u64-to-u64
//! conversion.
#![allow(clippy::useless_conversion)]

pub mod boot;
pub mod byte_source;
pub mod config;
pub mod darwin_version;
pub mod decompress;
pub mod error;
pub mod error_list;
pub mod fail_enabled;
pub mod image_reader;
pub mod kext;
pub mod macho;
pub mod patch;
pub mod plist_doc;
pub mod prelinked;
mod serializers;
