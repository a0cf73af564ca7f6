//! On-disk Mach-O 64-bit structures, readable/writable in place via `scroll`.
//!
//! Field layouts are taken from `usr/include/mach-o/loader.h` and `nlist.h`, the same
//! reference the teacher's own hand-rolled `MachHeader`/`SegmentCommand64` structs in
//! `mac/streams/module_list.rs` cite. Unlike that module (which reads live process memory
//! through raw pointer casts), this one edits an owned, growable buffer, so it goes through
//! `scroll::Pread`/`Pwrite` instead of `unsafe` casts.

use scroll::{Pread, Pwrite};

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;

pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_I386: u32 = 0x0000_0007;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub file_type: u32,
    pub num_commands: u32,
    pub size_commands: u32,
    pub flags: u32,
    pub reserved: u32,
}

pub const MACH_HEADER_64_SIZE: usize = std::mem::size_of::<MachHeader64>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmd_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmd_size: u32,
    pub segname: [u8; 16],
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_off: u64,
    pub file_size: u64,
    pub max_prot: i32,
    pub init_prot: i32,
    pub num_sections: u32,
    pub flags: u32,
}

pub const SEGMENT_COMMAND_64_SIZE: usize = std::mem::size_of::<SegmentCommand64>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

pub const SECTION_64_SIZE: usize = std::mem::size_of::<Section64>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmd_size: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite)]
pub struct Nlist64 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

pub const NLIST_64_SIZE: usize = std::mem::size_of::<Nlist64>();

/// A 16-byte fixed Mach-O name field (`segname`/`sectname`), null-padded.
pub fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

pub fn name16_str(raw: &[u8; 16]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(16);
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite)]
pub struct FatHeader {
    pub magic: u32,
    pub nfat_arch: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite)]
pub struct FatArch {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

pub const FAT_ARCH_SIZE: usize = std::mem::size_of::<FatArch>();
