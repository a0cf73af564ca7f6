//! The generic find/replace byte patch: a symbol-relative or absolute anchor, an optional
//! masked find pattern, a masked replace, and version/arch/count/skip/limit gates.
//!
//! Grounded on the `PATCHER_GENERIC_PATCH` construction and gating order in
//! `OcKernelApplyPatches` (`OpenCoreKernelPatch.c`): arch check, then version check, then the
//! "is this patch borked" shape check, then apply.

use crate::darwin_version::{matches_darwin_version, parse_darwin_version};
use crate::error::SkipReason;
use crate::macho::editor::MachoEditor;

/// One ordered byte patch. Borrows its byte slices from the caller's configuration tree.
#[derive(Debug, Clone)]
pub struct GenericPatch<'a> {
    pub identifier: String,
    pub comment: String,
    pub arch: &'a str,
    pub min_kernel: &'a str,
    pub max_kernel: &'a str,
    pub base: Option<&'a str>,
    pub find: Option<&'a [u8]>,
    pub replace: &'a [u8],
    pub mask: Option<&'a [u8]>,
    pub replace_mask: Option<&'a [u8]>,
    pub count: u32,
    pub skip: u32,
    pub limit: u32,
}

/// Applies one patch to `editor`, anchored and bounded anywhere in the whole payload.
/// `detected_darwin` is the packed Darwin version extracted from the image; `is_32_bit` selects
/// which architecture tag this patch must *not* match.
pub fn apply_generic_patch(
    editor: &mut MachoEditor,
    patch: &GenericPatch<'_>,
    detected_darwin: u32,
    is_32_bit: bool,
) -> Result<(), SkipReason> {
    apply_generic_patch_in_window(editor, patch, detected_darwin, is_32_bit, None)
}

/// Applies one patch the same way as [apply_generic_patch], but confines the find/replace scan
/// to `(file_offset, size)` — the in-context executable region of one injected kext. A symbolic
/// `base` is still resolved against the image's own symbol table (this engine does not maintain
/// a per-kext symbol table, so a kext-local `base` symbol falls back to the shared one); a find
/// pattern with no `base` is scanned from the start of the kext's own bytes rather than the start
/// of the whole image, matching the "patches are kext-relative" intent of a kext-targeted patch.
pub fn apply_generic_patch_in_kext(
    editor: &mut MachoEditor,
    patch: &GenericPatch<'_>,
    detected_darwin: u32,
    is_32_bit: bool,
    kext_file_offset: u64,
    kext_size: u64,
) -> Result<(), SkipReason> {
    apply_generic_patch_in_window(
        editor,
        patch,
        detected_darwin,
        is_32_bit,
        Some((kext_file_offset, kext_size)),
    )
}

fn apply_generic_patch_in_window(
    editor: &mut MachoEditor,
    patch: &GenericPatch<'_>,
    detected_darwin: u32,
    is_32_bit: bool,
    window: Option<(u64, u64)>,
) -> Result<(), SkipReason> {
    let other_arch = if is_32_bit { "x86_64" } else { "i386" };
    if !patch.arch.is_empty() && patch.arch == other_arch {
        return Err(SkipReason::ArchMismatch {
            identifier: patch.identifier.clone(),
            comment: patch.comment.clone(),
            arch: patch.arch.to_string(),
        });
    }

    let min_kernel = parse_darwin_version(patch.min_kernel);
    let max_kernel = parse_darwin_version(patch.max_kernel);
    if !matches_darwin_version(detected_darwin, min_kernel, max_kernel) {
        return Err(SkipReason::VersionMismatch {
            identifier: patch.identifier.clone(),
            comment: patch.comment.clone(),
            min_kernel,
            max_kernel,
        });
    }

    if is_malformed(patch) {
        return Err(SkipReason::MalformedPatch {
            identifier: patch.identifier.clone(),
            comment: patch.comment.clone(),
        });
    }

    let window_start = window.map_or(0, |(start, _)| start);
    let anchor = match patch.base {
        Some(symbol) => editor.symbol_address(symbol).map_err(|_| SkipReason::SymbolNotFound {
            identifier: patch.identifier.clone(),
            comment: patch.comment.clone(),
        })?,
        None => window_start,
    };

    let Some(find) = patch.find else {
        write_masked(editor, anchor, patch.replace, patch.replace_mask)
            .map_err(|_| SkipReason::PatternNotFound {
                identifier: patch.identifier.clone(),
                comment: patch.comment.clone(),
            })?;
        return Ok(());
    };

    let region_end = match window {
        Some((start, size)) => start + size,
        None => editor.payload_size(),
    };
    let available = region_end.saturating_sub(anchor);
    let scan_len = if patch.limit > 0 {
        available.min(u64::from(patch.limit))
    } else {
        available
    };
    let haystack = editor
        .read_bytes(anchor, scan_len)
        .map_err(|_| SkipReason::PatternNotFound {
            identifier: patch.identifier.clone(),
            comment: patch.comment.clone(),
        })?
        .to_vec();

    let find_mask = patch.mask;
    let mut seen = 0u32;
    let mut rewritten = 0u32;
    let mut i = 0usize;
    while i + find.len() <= haystack.len() {
        if bytes_match(&haystack[i..i + find.len()], find, find_mask) {
            if seen >= patch.skip {
                write_masked(editor, anchor + i as u64, patch.replace, patch.replace_mask)
                    .map_err(|_| SkipReason::PatternNotFound {
                        identifier: patch.identifier.clone(),
                        comment: patch.comment.clone(),
                    })?;
                rewritten += 1;
                if patch.count > 0 && rewritten >= patch.count {
                    return Ok(());
                }
            }
            seen += 1;
            i += find.len();
        } else {
            i += 1;
        }
    }

    if rewritten == 0 {
        return Err(SkipReason::PatternNotFound {
            identifier: patch.identifier.clone(),
            comment: patch.comment.clone(),
        });
    }
    Ok(())
}

/// Mirrors the source's "borked patch" shape check, translated from null-pointer/zero-size
/// sentinels to `Option`: no replace data, neither a symbolic base nor find data, or a
/// mask/replace-mask whose length doesn't match find's.
fn is_malformed(patch: &GenericPatch<'_>) -> bool {
    if patch.replace.is_empty() {
        return true;
    }
    match patch.find {
        Some(find) => {
            if find.len() != patch.replace.len() {
                return true;
            }
            if patch.mask.is_some_and(|m| m.len() != find.len()) {
                return true;
            }
            if patch.replace_mask.is_some_and(|m| m.len() != find.len()) {
                return true;
            }
        }
        None => {
            if patch.base.is_none() {
                return true;
            }
            if patch.mask.is_some() || patch.replace_mask.is_some() {
                return true;
            }
        }
    }
    false
}

/// One kext-blocking request: remove a bundle identifier from the prelinked kext list, subject
/// to the same arch/version gates a patch goes through.
///
/// Grounded on `OcKernelBlockKexts` (`OpenCoreKernelPatch.c`): identical gating order to
/// `OcKernelApplyPatches`, dispatching to `PrelinkedContextBlock` for the cache type this
/// repository supports.
#[derive(Debug, Clone)]
pub struct BlockEntry<'a> {
    pub identifier: &'a str,
    pub comment: &'a str,
    pub arch: &'a str,
    pub min_kernel: &'a str,
    pub max_kernel: &'a str,
}

/// Removes `block.identifier` from `kext_list` (a prelinked context's kext list) if the arch
/// and version gates pass. Returns the gate failure as a [SkipReason] without touching the
/// list; on a pass with no matching entry, this is simply a no-op removal of zero entries.
pub fn apply_block(
    kext_list_remove: impl FnOnce(&str) -> usize,
    block: &BlockEntry<'_>,
    detected_darwin: u32,
    is_32_bit: bool,
) -> Result<usize, SkipReason> {
    let other_arch = if is_32_bit { "x86_64" } else { "i386" };
    if !block.arch.is_empty() && block.arch == other_arch {
        return Err(SkipReason::ArchMismatch {
            identifier: block.identifier.to_string(),
            comment: block.comment.to_string(),
            arch: block.arch.to_string(),
        });
    }

    let min_kernel = parse_darwin_version(block.min_kernel);
    let max_kernel = parse_darwin_version(block.max_kernel);
    if !matches_darwin_version(detected_darwin, min_kernel, max_kernel) {
        return Err(SkipReason::VersionMismatch {
            identifier: block.identifier.to_string(),
            comment: block.comment.to_string(),
            min_kernel,
            max_kernel,
        });
    }

    Ok(kext_list_remove(block.identifier))
}

fn bytes_match(candidate: &[u8], find: &[u8], mask: Option<&[u8]>) -> bool {
    candidate.iter().zip(find).enumerate().all(|(i, (&c, &f))| {
        let m = mask.map(|m| m[i]).unwrap_or(0xFF);
        (c & m) == (f & m)
    })
}

fn write_masked(
    editor: &mut MachoEditor,
    offset: u64,
    replace: &[u8],
    replace_mask: Option<&[u8]>,
) -> Result<(), crate::error::MachoError> {
    match replace_mask {
        None => editor.write_bytes(offset, replace),
        Some(mask) => {
            let current = editor.read_bytes(offset, replace.len() as u64)?.to_vec();
            let merged: Vec<u8> = current
                .iter()
                .zip(replace)
                .enumerate()
                .map(|(i, (&c, &r))| (c & !mask[i]) | (r & mask[i]))
                .collect();
            editor.write_bytes(offset, &merged)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::macho::structs::{
        name16, MachHeader64, Nlist64, SegmentCommand64, SymtabCommand, LC_SEGMENT_64, LC_SYMTAB,
        MACH_HEADER_64_SIZE, MH_MAGIC_64, NLIST_64_SIZE, SEGMENT_COMMAND_64_SIZE,
    };
    use scroll::{Pwrite, LE};

    fn fixture(text: &[u8]) -> MachoEditor {
        let file_size = 4096u64.max(round_up(text.len() as u64));
        let mut buf = vec![0u8; file_size as usize];
        buf.pwrite_with(
            MachHeader64 {
                magic: MH_MAGIC_64,
                cpu_type: crate::macho::structs::CPU_TYPE_X86_64,
                cpu_subtype: 3,
                file_type: 2,
                num_commands: 1,
                size_commands: SEGMENT_COMMAND_64_SIZE as u32,
                flags: 0,
                reserved: 0,
            },
            0,
            LE,
        )
        .unwrap();
        buf.pwrite_with(
            SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmd_size: SEGMENT_COMMAND_64_SIZE as u32,
                segname: name16("__TEXT"),
                vm_addr: 0x1000,
                vm_size: file_size,
                file_off: 0,
                file_size,
                max_prot: 7,
                init_prot: 5,
                num_sections: 0,
                flags: 0,
            },
            MACH_HEADER_64_SIZE,
            LE,
        )
        .unwrap();
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        buf[start..start + text.len()].copy_from_slice(text);
        MachoEditor::new(buf, file_size, file_size).unwrap()
    }

    fn round_up(n: u64) -> u64 {
        (n + 4095) & !4095
    }

    fn patch<'a>(find: &'a [u8], replace: &'a [u8]) -> GenericPatch<'a> {
        GenericPatch {
            identifier: "test".into(),
            comment: "test patch".into(),
            arch: "",
            min_kernel: "",
            max_kernel: "",
            base: None,
            find: Some(find),
            replace,
            mask: None,
            replace_mask: None,
            count: 0,
            skip: 0,
            limit: 0,
        }
    }

    #[test]
    fn replaces_first_match() {
        let mut editor = fixture(b"AAAABBBBCCCC");
        let p = patch(b"BBBB", b"ZZZZ");
        apply_generic_patch(&mut editor, &p, 0, false).unwrap();
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        assert_eq!(&editor.read_bytes(start as u64, 12).unwrap(), b"AAAAZZZZCCCC");
    }

    #[test]
    fn skip_selects_second_match() {
        let mut editor = fixture(b"XXAAXXAAXXAA");
        let mut p = patch(b"AA", b"ZZ");
        p.skip = 1;
        p.count = 1;
        apply_generic_patch(&mut editor, &p, 0, false).unwrap();
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        assert_eq!(&editor.read_bytes(start as u64, 12).unwrap(), b"XXAAXXZZXXAA");
    }

    #[test]
    fn count_zero_rewrites_every_match() {
        let mut editor = fixture(b"AABBAABBAABB");
        let p = patch(b"AA", b"ZZ");
        apply_generic_patch(&mut editor, &p, 0, false).unwrap();
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        assert_eq!(&editor.read_bytes(start as u64, 12).unwrap(), b"ZZBBZZBBZZBB");
    }

    #[test]
    fn mask_ignores_dont_care_bits() {
        let mut editor = fixture(b"\xAA\xBB\xCC\xDD");
        let mut p = patch(b"\xAA\x00\xCC\xDD", b"\x11\x22\x33\x44");
        let find_mask = [0xFFu8, 0x00, 0xFF, 0xFF];
        p.mask = Some(&find_mask);
        apply_generic_patch(&mut editor, &p, 0, false).unwrap();
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        assert_eq!(
            editor.read_bytes(start as u64, 4).unwrap(),
            &[0x11, 0x22, 0x33, 0x44]
        );
    }

    #[test]
    fn replace_mask_preserves_unmasked_bits() {
        let mut editor = fixture(b"\xFF\xFF\xFF\xFF");
        let mut p = patch(b"\xFF\xFF\xFF\xFF", b"\x00\x00\x00\x00");
        let replace_mask = [0xFFu8, 0x00, 0xFF, 0x00];
        p.replace_mask = Some(&replace_mask);
        apply_generic_patch(&mut editor, &p, 0, false).unwrap();
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        assert_eq!(
            editor.read_bytes(start as u64, 4).unwrap(),
            &[0x00, 0xFF, 0x00, 0xFF]
        );
    }

    #[test]
    fn arch_mismatch_is_skipped() {
        let mut editor = fixture(b"AAAABBBB");
        let mut p = patch(b"AAAA", b"ZZZZ");
        p.arch = "i386";
        assert!(matches!(
            apply_generic_patch(&mut editor, &p, 0, false),
            Err(SkipReason::ArchMismatch { .. })
        ));
    }

    #[test]
    fn version_out_of_range_is_skipped() {
        let mut editor = fixture(b"AAAABBBB");
        let mut p = patch(b"AAAA", b"ZZZZ");
        p.min_kernel = "21.0.0";
        let detected = parse_darwin_version("19.6.0");
        assert!(matches!(
            apply_generic_patch(&mut editor, &p, detected, false),
            Err(SkipReason::VersionMismatch { .. })
        ));
    }

    #[test]
    fn mismatched_find_replace_length_is_malformed() {
        let mut editor = fixture(b"AAAABBBB");
        let p = patch(b"AAAA", b"ZZ");
        assert!(matches!(
            apply_generic_patch(&mut editor, &p, 0, false),
            Err(SkipReason::MalformedPatch { .. })
        ));
    }

    #[test]
    fn missing_pattern_in_range_is_reported() {
        let mut editor = fixture(b"AAAABBBB");
        let p = patch(b"ZZZZ", b"QQQQ");
        assert!(matches!(
            apply_generic_patch(&mut editor, &p, 0, false),
            Err(SkipReason::PatternNotFound { .. })
        ));
    }

    #[test]
    fn no_base_and_no_find_is_malformed() {
        // Mirrors the source: a blank base with Find.Size == 0 never matches Replace.Size, so
        // this shape is always rejected before an anchor is ever considered.
        let mut editor = fixture(b"AAAABBBB");
        let p = GenericPatch {
            identifier: "test".into(),
            comment: "".into(),
            arch: "",
            min_kernel: "",
            max_kernel: "",
            base: None,
            find: None,
            replace: b"ZZZZ",
            mask: None,
            replace_mask: None,
            count: 0,
            skip: 0,
            limit: 0,
        };
        assert!(matches!(
            apply_generic_patch(&mut editor, &p, 0, false),
            Err(SkipReason::MalformedPatch { .. })
        ));
    }

    /// Builds an editor with one `__TEXT` segment, a symbol table with a single symbol
    /// `_test_symbol` resolving to the start of a trailing data region, and no sections.
    fn fixture_with_symbol(data: &[u8]) -> MachoEditor {
        let name = b"_test_symbol\0";
        let symtab_off = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        let nlist_off = symtab_off + std::mem::size_of::<SymtabCommand>();
        let strtab_off = nlist_off + NLIST_64_SIZE;
        let data_off = round_up(strtab_off as u64 + name.len() as u64) as usize;
        let file_size = round_up(data_off as u64 + data.len() as u64).max(4096);

        let mut buf = vec![0u8; file_size as usize];
        buf.pwrite_with(
            MachHeader64 {
                magic: MH_MAGIC_64,
                cpu_type: crate::macho::structs::CPU_TYPE_X86_64,
                cpu_subtype: 3,
                file_type: 2,
                num_commands: 2,
                size_commands: (SEGMENT_COMMAND_64_SIZE + std::mem::size_of::<SymtabCommand>())
                    as u32,
                flags: 0,
                reserved: 0,
            },
            0,
            LE,
        )
        .unwrap();
        buf.pwrite_with(
            SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmd_size: SEGMENT_COMMAND_64_SIZE as u32,
                segname: name16("__TEXT"),
                vm_addr: 0x1000,
                vm_size: file_size,
                file_off: 0,
                file_size,
                max_prot: 7,
                init_prot: 5,
                num_sections: 0,
                flags: 0,
            },
            MACH_HEADER_64_SIZE,
            LE,
        )
        .unwrap();
        buf.pwrite_with(
            SymtabCommand {
                cmd: LC_SYMTAB,
                cmd_size: std::mem::size_of::<SymtabCommand>() as u32,
                symoff: nlist_off as u32,
                nsyms: 1,
                stroff: strtab_off as u32,
                strsize: name.len() as u32,
            },
            symtab_off,
            LE,
        )
        .unwrap();
        buf.pwrite_with(
            Nlist64 {
                n_strx: 0,
                n_type: 0x0e,
                n_sect: 1,
                n_desc: 0,
                n_value: 0x1000 + data_off as u64,
            },
            nlist_off,
            LE,
        )
        .unwrap();
        buf[strtab_off..strtab_off + name.len()].copy_from_slice(name);
        buf[data_off..data_off + data.len()].copy_from_slice(data);
        MachoEditor::new(buf, file_size, file_size).unwrap()
    }

    #[test]
    fn base_symbol_with_no_find_writes_at_resolved_anchor() {
        let mut editor = fixture_with_symbol(b"AAAA");
        let p = GenericPatch {
            identifier: "test".into(),
            comment: "".into(),
            arch: "",
            min_kernel: "",
            max_kernel: "",
            base: Some("_test_symbol"),
            find: None,
            replace: b"ZZZZ",
            mask: None,
            replace_mask: None,
            count: 0,
            skip: 0,
            limit: 0,
        };
        apply_generic_patch(&mut editor, &p, 0, false).unwrap();
        let anchor = editor.symbol_address("_test_symbol").unwrap();
        assert_eq!(editor.read_bytes(anchor, 4).unwrap(), b"ZZZZ");
    }

    #[test]
    fn block_removes_matching_identifier() {
        let block = BlockEntry {
            identifier: "com.example.kext",
            comment: "",
            arch: "",
            min_kernel: "",
            max_kernel: "",
        };
        let mut removed_with = None;
        let result = apply_block(
            |id| {
                removed_with = Some(id.to_string());
                1
            },
            &block,
            0,
            false,
        );
        assert_eq!(result.unwrap(), 1);
        assert_eq!(removed_with.as_deref(), Some("com.example.kext"));
    }

    #[test]
    fn block_arch_mismatch_is_skipped_without_removing() {
        let block = BlockEntry {
            identifier: "com.example.kext",
            comment: "",
            arch: "i386",
            min_kernel: "",
            max_kernel: "",
        };
        let mut called = false;
        let result = apply_block(
            |_| {
                called = true;
                1
            },
            &block,
            0,
            false,
        );
        assert!(matches!(result, Err(SkipReason::ArchMismatch { .. })));
        assert!(!called);
    }

    #[test]
    fn kext_window_confines_scan_to_its_own_region() {
        // Two kexts' bytes are laid out back to back; a match for the first kext's find pattern
        // sitting just past its own window, inside the second kext's region, must not be found.
        let mut editor = fixture(b"AAAABBBBAAAACCCC");
        let p = patch(b"AAAA", b"ZZZZ");
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        // First kext owns bytes [start, start+8): "AAAABBBB"; its own AAAA is inside the window.
        apply_generic_patch_in_kext(&mut editor, &p, 0, false, start as u64, 8).unwrap();
        assert_eq!(&editor.read_bytes(start as u64, 16).unwrap(), b"ZZZZBBBBAAAACCCC");
    }

    #[test]
    fn kext_window_rejects_pattern_outside_its_bounds() {
        let mut editor = fixture(b"AAAABBBBCCCCDDDD");
        let p = patch(b"CCCC", b"ZZZZ");
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        // Window only covers the first 8 bytes; "CCCC" lives past it.
        assert!(matches!(
            apply_generic_patch_in_kext(&mut editor, &p, 0, false, start as u64, 8),
            Err(SkipReason::PatternNotFound { .. })
        ));
    }

    #[test]
    fn kext_window_with_no_find_anchors_at_window_start() {
        let mut editor = fixture(b"AAAABBBBCCCC");
        let start = MACH_HEADER_64_SIZE + SEGMENT_COMMAND_64_SIZE;
        let p = GenericPatch {
            identifier: "test".into(),
            comment: "".into(),
            arch: "",
            min_kernel: "",
            max_kernel: "",
            base: None,
            find: None,
            replace: b"ZZZZ",
            mask: None,
            replace_mask: None,
            count: 0,
            skip: 0,
            limit: 0,
        };
        apply_generic_patch_in_kext(&mut editor, &p, 0, false, start as u64 + 8, 4).unwrap();
        assert_eq!(&editor.read_bytes(start as u64, 12).unwrap(), b"AAAABBBBZZZZ");
    }

    #[test]
    fn unresolvable_base_symbol_is_reported() {
        let mut editor = fixture_with_symbol(b"AAAA");
        let p = GenericPatch {
            identifier: "test".into(),
            comment: "".into(),
            arch: "",
            min_kernel: "",
            max_kernel: "",
            base: Some("_does_not_exist"),
            find: None,
            replace: b"ZZZZ",
            mask: None,
            replace_mask: None,
            count: 0,
            skip: 0,
            limit: 0,
        };
        assert!(matches!(
            apply_generic_patch(&mut editor, &p, 0, false),
            Err(SkipReason::SymbolNotFound { .. })
        ));
    }
}
