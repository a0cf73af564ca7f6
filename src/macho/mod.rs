//! Mach-O 64 parsing and in-place editing.

pub mod editor;
pub mod structs;

pub use editor::{MachoEditor, SectionHandle, SegmentHandle};
