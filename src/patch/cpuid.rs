//! CPUID leaf-1 emulation: rewrites the kernel's cached CPUID leaf-1 record (the one the CPU
//! identification code reads back at runtime) so reported family/model/stepping/feature bits
//! can be overridden without a real CPU that reports them.
//!
//! Grounded on `PatchKernelCpuId`'s gating (`OpenCoreKernelPatch.c`): version-gated by
//! `emulate.min_kernel`/`max_kernel`, a no-op when `cpuid1_data` is all zero. The substitution
//! itself is expressed as a masked, symbol-anchored [GenericPatch] rather than a bespoke
//! instruction rewrite, since that's exactly what the masked-write half of the generic patch
//! engine already does.

use crate::darwin_version::{matches_darwin_version, parse_darwin_version};
use crate::error::SkipReason;
use crate::macho::editor::MachoEditor;
use crate::patch::descriptor::{apply_generic_patch, GenericPatch};

/// The well-known symbol naming the kernel's cached CPUID leaf-1 record: four consecutive
/// 32-bit words, `eax`/`ebx`/`ecx`/`edx`, in that order.
pub const CPUID_LEAF1_SYMBOL: &str = "_cpuid_info";

pub struct CpuidEmulation<'a> {
    pub identifier: String,
    pub data: [u32; 4],
    pub mask: [u32; 4],
    pub min_kernel: &'a str,
    pub max_kernel: &'a str,
}

/// Applies (or skips) one CPUID leaf-1 emulation request against the kernel Mach-O.
pub fn apply_cpuid_emulation(
    editor: &mut MachoEditor,
    emulation: &CpuidEmulation<'_>,
    detected_darwin: u32,
) -> Result<(), SkipReason> {
    if emulation.data == [0; 4] {
        return Ok(());
    }

    let min_kernel = parse_darwin_version(emulation.min_kernel);
    let max_kernel = parse_darwin_version(emulation.max_kernel);
    if !matches_darwin_version(detected_darwin, min_kernel, max_kernel) {
        return Err(SkipReason::VersionMismatch {
            identifier: emulation.identifier.clone(),
            comment: "cpuid emulation".to_string(),
            min_kernel,
            max_kernel,
        });
    }

    let mut replace = [0u8; 16];
    let mut replace_mask = [0u8; 16];
    for (i, (&word, &mask)) in emulation.data.iter().zip(emulation.mask.iter()).enumerate() {
        replace[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        replace_mask[i * 4..i * 4 + 4].copy_from_slice(&mask.to_le_bytes());
    }

    let patch = GenericPatch {
        identifier: emulation.identifier.clone(),
        comment: "cpuid emulation".to_string(),
        arch: "",
        min_kernel: emulation.min_kernel,
        max_kernel: emulation.max_kernel,
        base: Some(CPUID_LEAF1_SYMBOL),
        find: None,
        replace: &replace,
        mask: None,
        replace_mask: Some(&replace_mask),
        count: 0,
        skip: 0,
        limit: 0,
    };
    apply_generic_patch(editor, &patch, detected_darwin, false)
}
