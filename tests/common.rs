use opencore_kernel_core::macho::structs::{
    name16, MachHeader64, Section64, SegmentCommand64, LC_SEGMENT_64, MACH_HEADER_64_SIZE,
    MH_MAGIC_64, SECTION_64_SIZE, SEGMENT_COMMAND_64_SIZE,
};
use scroll::{Pwrite, LE};

pub fn round_up(n: u64) -> u64 {
    (n + 4095) & !4095
}

pub const EMPTY_INFO_PLIST: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>_PrelinkInfoDictionary</key>
    <array/>
</dict>
</plist>"#;

pub const KEXT_INFO_PLIST: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>com.example.kext</string>
</dict>
</plist>"#;

/// One Mach-O with `__PRELINK_TEXT` (header, load commands, and `marker` bytes) followed by
/// `__PRELINK_INFO` holding an empty kext list, the same layout `kext.rs`'s own fixture uses.
/// Returns the raw buffer plus the file offset `marker` was written at, so a caller can build a
/// find/replace patch anchored there.
pub fn build_fixture_image(marker: &[u8], darwin_version_string: &str) -> (Vec<u8>, u64) {
    let header_commands_size = 2 * SEGMENT_COMMAND_64_SIZE + 2 * SECTION_64_SIZE;
    let text_off = MACH_HEADER_64_SIZE + header_commands_size;
    let marker_off = text_off + 64;
    let version_off = marker_off + marker.len() + 16;
    let text_size = round_up((version_off + darwin_version_string.len() + 32) as u64)
        .max(4096);
    let info_off = text_off as u64 + text_size;
    let info_padded = round_up(EMPTY_INFO_PLIST.len() as u64);
    let payload_size = info_off + info_padded;
    let file_size = round_up(payload_size);

    let mut buf = vec![0u8; file_size as usize];
    buf.pwrite_with(
        MachHeader64 {
            magic: MH_MAGIC_64,
            cpu_type: opencore_kernel_core::macho::structs::CPU_TYPE_X86_64,
            cpu_subtype: 3,
            file_type: 2,
            num_commands: 2,
            size_commands: header_commands_size as u32,
            flags: 0,
            reserved: 0,
        },
        0,
        LE,
    )
    .unwrap();

    let text_seg_off = MACH_HEADER_64_SIZE;
    buf.pwrite_with(
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmd_size: (SEGMENT_COMMAND_64_SIZE + SECTION_64_SIZE) as u32,
            segname: name16("__PRELINK_TEXT"),
            vm_addr: 0x10_0000,
            vm_size: text_size,
            file_off: text_off as u64,
            file_size: text_size,
            max_prot: 7,
            init_prot: 5,
            num_sections: 1,
            flags: 0,
        },
        text_seg_off,
        LE,
    )
    .unwrap();
    buf.pwrite_with(
        Section64 {
            sectname: name16("__text"),
            segname: name16("__PRELINK_TEXT"),
            addr: 0x10_0000,
            size: text_size,
            offset: text_off as u32,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        },
        text_seg_off + SEGMENT_COMMAND_64_SIZE,
        LE,
    )
    .unwrap();

    let info_seg_off = text_seg_off + SEGMENT_COMMAND_64_SIZE + SECTION_64_SIZE;
    buf.pwrite_with(
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmd_size: (SEGMENT_COMMAND_64_SIZE + SECTION_64_SIZE) as u32,
            segname: name16("__PRELINK_INFO"),
            vm_addr: 0x10_0000 + text_size,
            vm_size: info_padded,
            file_off: info_off,
            file_size: EMPTY_INFO_PLIST.len() as u64,
            max_prot: 7,
            init_prot: 3,
            num_sections: 1,
            flags: 0,
        },
        info_seg_off,
        LE,
    )
    .unwrap();
    buf.pwrite_with(
        Section64 {
            sectname: name16("__info"),
            segname: name16("__PRELINK_INFO"),
            addr: 0x10_0000 + text_size,
            size: EMPTY_INFO_PLIST.len() as u64,
            offset: info_off as u32,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        },
        info_seg_off + SEGMENT_COMMAND_64_SIZE,
        LE,
    )
    .unwrap();

    buf[marker_off..marker_off + marker.len()].copy_from_slice(marker);
    let version_bytes = format!("Darwin Kernel Version {darwin_version_string}: ...");
    buf[version_off..version_off + version_bytes.len()].copy_from_slice(version_bytes.as_bytes());

    buf[info_off as usize..info_off as usize + EMPTY_INFO_PLIST.len()]
        .copy_from_slice(EMPTY_INFO_PLIST);

    (buf, payload_size)
}
