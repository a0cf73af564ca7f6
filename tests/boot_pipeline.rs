mod common;

use common::{build_fixture_image, KEXT_INFO_PLIST};
use opencore_kernel_core::boot::{prepare_image, prepare_image_with_linker};
use opencore_kernel_core::byte_source::MemoryByteSource;
use opencore_kernel_core::config::{AddConfig, BlockConfig, KernelConfig, PatchConfig};
use opencore_kernel_core::error::{KextSkipSource, SkipReason};
use opencore_kernel_core::macho::editor::MachoEditor;
use opencore_kernel_core::prelinked::KextLinker;

/// A linker that always succeeds, so tests can observe patches applied to a kext whose
/// injection actually committed rather than rolled back.
struct SucceedingLinker;

impl KextLinker for SucceedingLinker {
    fn link_executable(
        &mut self,
        _editor: &MachoEditor,
        _existing_kexts: &[plist::Value],
        source_vaddr: u64,
        _size: u64,
    ) -> Result<(u64, u64), KextSkipSource> {
        Ok((source_vaddr, 0))
    }
}

#[test]
fn pipeline_applies_a_kernel_patch() {
    let (image, _payload) = build_fixture_image(b"HELLOFLAG", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let config = KernelConfig {
        patches: vec![PatchConfig {
            identifier: "kernel".into(),
            comment: "flip the flag".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            base: None,
            find: b"HELLOFLAG".to_vec(),
            replace: b"GOODBYEFL".to_vec(),
            mask: vec![],
            replace_mask: vec![],
            count: 0,
            skip: 0,
            limit: 0,
        }],
        ..Default::default()
    };

    let prepared = prepare_image(&mut source, &config, false).unwrap();
    assert!(prepared.soft_errors.is_empty());
    assert!(prepared.buffer.windows(9).any(|w| w == b"GOODBYEFL"));
    assert!(!prepared.buffer.windows(9).any(|w| w == b"HELLOFLAG"));
}

#[test]
fn pipeline_skips_a_kext_patch_targeting_an_unregistered_kext() {
    let (image, _payload) = build_fixture_image(b"UNCHANGED", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let config = KernelConfig {
        patches: vec![PatchConfig {
            identifier: "com.apple.driver.AppleACPIPlatform".into(),
            comment: "".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            base: None,
            find: b"UNCHANGED".to_vec(),
            replace: b"SHOULDNOT".to_vec(),
            mask: vec![],
            replace_mask: vec![],
            count: 0,
            skip: 0,
            limit: 0,
        }],
        ..Default::default()
    };

    let prepared = prepare_image(&mut source, &config, false).unwrap();
    assert_eq!(prepared.soft_errors.len(), 1);
    assert!(
        matches!(prepared.soft_errors.iter().next(), Some(SkipReason::KextPatchTargetNotFound(id)) if id == "com.apple.driver.AppleACPIPlatform")
    );
    assert!(prepared.buffer.windows(9).any(|w| w == b"UNCHANGED"));
}

#[test]
fn pipeline_applies_a_kext_targeted_patch_to_the_injected_executable() {
    let (image, _payload) = build_fixture_image(b"NOCHANGEX", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let mut exec = vec![0x90u8; 64];
    exec[10..19].copy_from_slice(b"FINDTHIS!");

    let config = KernelConfig {
        adds: vec![AddConfig {
            bundle_path: "/Library/Extensions/Example.kext".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            info_plist: KEXT_INFO_PLIST.to_vec(),
            executable: Some(opencore_kernel_core::config::AddExecutable {
                relative_path: "Contents/MacOS/Example".into(),
                bytes: exec,
            }),
        }],
        patches: vec![PatchConfig {
            identifier: "com.example.kext".into(),
            comment: "".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            base: None,
            find: b"FINDTHIS!".to_vec(),
            replace: b"PATCHEDIT".to_vec(),
            mask: vec![],
            replace_mask: vec![],
            count: 0,
            skip: 0,
            limit: 0,
        }],
        ..Default::default()
    };

    let mut linker = SucceedingLinker;
    let prepared = prepare_image_with_linker(&mut source, &config, false, &mut linker).unwrap();
    assert!(prepared.soft_errors.is_empty(), "{:?}", prepared.soft_errors);
    assert!(prepared.buffer.windows(9).any(|w| w == b"PATCHEDIT"));
    assert!(!prepared.buffer.windows(9).any(|w| w == b"FINDTHIS!"));
}

#[test]
fn pipeline_kext_patch_target_not_found_when_kext_rolled_back() {
    let (image, _payload) = build_fixture_image(b"NOCHANGEX", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let config = KernelConfig {
        adds: vec![AddConfig {
            bundle_path: "/Library/Extensions/Example.kext".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            info_plist: KEXT_INFO_PLIST.to_vec(),
            executable: Some(opencore_kernel_core::config::AddExecutable {
                relative_path: "Contents/MacOS/Example".into(),
                bytes: vec![0x90u8; 64],
            }),
        }],
        patches: vec![PatchConfig {
            identifier: "com.example.kext".into(),
            comment: "".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            base: None,
            find: vec![0x90u8; 4],
            replace: vec![0x90u8; 4],
            mask: vec![],
            replace_mask: vec![],
            count: 0,
            skip: 0,
            limit: 0,
        }],
        ..Default::default()
    };

    // Default linker is unsupported, so the kext injection itself rolls back and the kext is
    // never registered; the patch targeting it must report the target as not found rather than
    // silently applying against stale bytes.
    let prepared = prepare_image(&mut source, &config, false).unwrap();
    assert!(prepared
        .soft_errors
        .iter()
        .any(|e| matches!(e, SkipReason::KextPatchTargetNotFound(id) if id == "com.example.kext")));
    assert!(prepared
        .soft_errors
        .iter()
        .any(|e| matches!(e, SkipReason::KextInjectionFailed { .. })));
}

#[test]
fn pipeline_skips_patch_outside_its_version_range() {
    let (image, _payload) = build_fixture_image(b"UNCHANGED", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let config = KernelConfig {
        patches: vec![PatchConfig {
            identifier: "kernel".into(),
            comment: "".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: "21.0.0".into(),
            max_kernel: String::new(),
            base: None,
            find: b"UNCHANGED".to_vec(),
            replace: b"SHOULDNOT".to_vec(),
            mask: vec![],
            replace_mask: vec![],
            count: 0,
            skip: 0,
            limit: 0,
        }],
        ..Default::default()
    };

    let prepared = prepare_image(&mut source, &config, false).unwrap();
    assert_eq!(prepared.soft_errors.len(), 1);
    assert!(matches!(
        prepared.soft_errors.iter().next(),
        Some(SkipReason::VersionMismatch { .. })
    ));
}

#[test]
fn pipeline_injects_an_info_only_kext() {
    let (image, _payload) = build_fixture_image(b"NOCHANGEX", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let config = KernelConfig {
        adds: vec![AddConfig {
            bundle_path: "/Library/Extensions/Example.kext".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            info_plist: KEXT_INFO_PLIST.to_vec(),
            executable: None,
        }],
        ..Default::default()
    };

    let prepared = prepare_image(&mut source, &config, false).unwrap();
    assert!(prepared.soft_errors.is_empty(), "{:?}", prepared.soft_errors);
}

#[test]
fn pipeline_records_unsupported_link_but_keeps_booting() {
    let (image, _payload) = build_fixture_image(b"NOCHANGEX", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let config = KernelConfig {
        adds: vec![AddConfig {
            bundle_path: "/Library/Extensions/Example.kext".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            info_plist: KEXT_INFO_PLIST.to_vec(),
            executable: Some(opencore_kernel_core::config::AddExecutable {
                relative_path: "Contents/MacOS/Example".into(),
                bytes: vec![0x90; 64],
            }),
        }],
        ..Default::default()
    };

    let prepared = prepare_image(&mut source, &config, false).unwrap();
    assert_eq!(prepared.soft_errors.len(), 1);
    assert!(matches!(
        prepared.soft_errors.iter().next(),
        Some(SkipReason::KextInjectionFailed { .. })
    ));
}

#[test]
fn pipeline_applies_a_block() {
    let (image, _payload) = build_fixture_image(b"NOCHANGEX", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let config = KernelConfig {
        adds: vec![AddConfig {
            bundle_path: "/Library/Extensions/Example.kext".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            info_plist: KEXT_INFO_PLIST.to_vec(),
            executable: None,
        }],
        blocks: vec![BlockConfig {
            identifier: "com.example.kext".into(),
            comment: "".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
        }],
        ..Default::default()
    };

    let prepared = prepare_image(&mut source, &config, false).unwrap();
    assert!(prepared.soft_errors.is_empty(), "{:?}", prepared.soft_errors);
}

#[test]
fn pipeline_reserves_room_for_adds_up_front() {
    let small_exec = vec![0x90u8; 16 * 1024];
    let (image, _payload) = build_fixture_image(b"NOCHANGEX", "19.6.0");
    let mut source = MemoryByteSource::new(image);

    let config = KernelConfig {
        adds: vec![AddConfig {
            bundle_path: "/Library/Extensions/Big.kext".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            info_plist: KEXT_INFO_PLIST.to_vec(),
            executable: Some(opencore_kernel_core::config::AddExecutable {
                relative_path: "Contents/MacOS/Big".into(),
                bytes: small_exec,
            }),
        }],
        ..Default::default()
    };

    // Must not fail with BufferTooSmall: the pipeline precomputes reservation from adds[] before
    // reading the image, so there is always enough slack for the append even though the link
    // itself remains unsupported.
    let prepared = prepare_image(&mut source, &config, false).unwrap();
    assert_eq!(prepared.soft_errors.len(), 1);
}
