//! Component F (orchestration, §6/§10): stitches the image reader, prelinked context, patch
//! engine, and kext injector into the single entry point a bootstrap driver calls once per
//! image. Grounded on the call sequence in `Utilities/TestProcessKernel/ProcessKernel.c`
//! (`OcKernelApplyPatches` with `Context == NULL`, then `OcKernelProcessPrelinked`): apply
//! direct-kernel patches and quirks first, then inject kexts, then apply kext-targeted patches,
//! then blocks, then prelinked-context-targeted quirks, then finalize.

use log::{error, info, warn};

use crate::byte_source::ByteSource;
use crate::config::KernelConfig;
use crate::darwin_version::detect_darwin_version;
use crate::error::{CoreError, SkipReason};
use crate::error_list::SoftErrorList;
use crate::image_reader::read_apple_kernel;
use crate::kext::{inject_kexts, KextRequest};
use crate::patch::descriptor::{apply_block, apply_generic_patch_in_kext};
use crate::patch::quirks::{
    apply_apfs_trim_timeout, apply_kernel_quirk, apply_prelinked_quirk, KernelQuirk,
    PrelinkedQuirk, KERNEL_QUIRK_ORDER, PRELINKED_QUIRK_ORDER,
};
use crate::patch::{apply_generic_patch, GenericPatch};
use crate::prelinked::{KextLinker, PrelinkedContext, UnsupportedLinker};

/// Identifier a [crate::config::PatchConfig] uses to mean "patch the kernel Mach-O directly";
/// any other identifier names a kext's `CFBundleIdentifier` and is applied to that kext's own
/// in-context executable bytes instead (see [apply_kext_patches]).
const KERNEL_PATCH_IDENTIFIER: &str = "kernel";

/// Everything produced by one successful image-preparation pass: the ready-to-boot buffer, the
/// size of its meaningful payload, and every contained (non-fatal) failure encountered along
/// the way.
pub struct PreparedImage {
    pub buffer: Vec<u8>,
    pub payload_size: u64,
    pub digest: Option<[u8; 48]>,
    pub soft_errors: SoftErrorList<SkipReason>,
}

/// Runs the full image-preparation pipeline against `source` using the already-built `config`
/// tree, with the repository's own [UnsupportedLinker] as the kext linker.
pub fn prepare_image<S: ByteSource>(
    source: &mut S,
    config: &KernelConfig,
    want_digest: bool,
) -> Result<PreparedImage, CoreError>
where
    S::Error: Into<std::io::Error>,
{
    prepare_image_with_linker(source, config, want_digest, &mut UnsupportedLinker)
}

/// As [prepare_image], but with a caller-supplied [KextLinker] (mainly for tests that want to
/// observe or simulate a successful link).
pub fn prepare_image_with_linker<S: ByteSource>(
    source: &mut S,
    config: &KernelConfig,
    want_digest: bool,
    linker: &mut dyn KextLinker,
) -> Result<PreparedImage, CoreError>
where
    S::Error: Into<std::io::Error>,
{
    let reserved = reserve_size_for_adds(config);

    let read = read_apple_kernel(source, reserved, want_digest, config.prefer_32_bit)?;
    let detected_darwin = detect_darwin_version(&read.buffer);
    info!("detected Darwin version {detected_darwin:#x}");

    let mut context =
        PrelinkedContext::initialize(read.buffer, read.payload_size, read.allocated_size)?;
    context.prepare_inject()?;
    let is_32_bit = context.editor().is_32_bit();

    let mut soft_errors = SoftErrorList::default();

    apply_kernel_patches(&mut context, config, detected_darwin, is_32_bit, &mut soft_errors);
    apply_kernel_quirks(&mut context, config, detected_darwin, &mut soft_errors);

    let requests: Vec<KextRequest<'_>> = config
        .adds
        .iter()
        .filter(|add| add.enabled)
        .map(|add| KextRequest {
            bundle_path: &add.bundle_path,
            arch: &add.arch,
            min_kernel: &add.min_kernel,
            max_kernel: &add.max_kernel,
            info_plist: &add.info_plist,
            executable: add
                .executable
                .as_ref()
                .map(|exe| (exe.relative_path.as_str(), exe.bytes.as_slice())),
        })
        .collect();
    {
        let mut sublist = soft_errors.inserted_sublist();
        inject_kexts(&mut context, linker, &requests, detected_darwin, is_32_bit, &mut sublist);
    }

    apply_kext_patches(&mut context, config, detected_darwin, is_32_bit, &mut soft_errors);
    apply_blocks(&mut context, config, detected_darwin, is_32_bit, &mut soft_errors);
    apply_prelinked_quirks(&mut context, config, detected_darwin, &mut soft_errors);

    context.finalize()?;

    if !soft_errors.is_empty() {
        warn!("image prepared with {} contained failure(s)", soft_errors.len());
    }

    let (buffer, payload_size) = context.into_buffer();
    Ok(PreparedImage {
        buffer,
        payload_size,
        digest: read.digest,
        soft_errors,
    })
}

/// Sums [PrelinkedContext::reserve_kext_size] over every enabled `adds[]` entry, so the image
/// buffer is allocated with enough slack before a single byte is injected (§4.E step 3's
/// precondition). Entries are summed regardless of arch/version gating, since under-reserving
/// is the caller bug this accounting exists to prevent, and a gated-out kext simply leaves its
/// share of the slack unused.
fn reserve_size_for_adds(config: &KernelConfig) -> u64 {
    let mut total = 0u64;
    for add in config.adds.iter().filter(|add| add.enabled) {
        let executable_size = add.executable.as_ref().map_or(0, |exe| exe.bytes.len() as u64);
        if let Err(err) =
            PrelinkedContext::reserve_kext_size(&mut total, add.info_plist.len() as u64, executable_size)
        {
            error!("reserving size for kext {:?} overflowed: {err}", add.bundle_path);
        }
    }
    total
}

fn apply_kernel_patches(
    context: &mut PrelinkedContext,
    config: &KernelConfig,
    detected_darwin: u32,
    is_32_bit: bool,
    soft_errors: &mut SoftErrorList<SkipReason>,
) {
    let mut sublist = soft_errors.inserted_sublist();
    for patch in &config.patches {
        if !patch.enabled || patch.identifier != KERNEL_PATCH_IDENTIFIER {
            continue;
        }
        let generic: GenericPatch<'_> = patch.as_generic_patch();
        if let Err(reason) =
            apply_generic_patch(context.editor_mut(), &generic, detected_darwin, is_32_bit)
        {
            warn!("{reason}");
            sublist.push(reason);
        }
    }
}

/// Applies every enabled patch whose identifier isn't `"kernel"` to the named kext's own
/// in-context executable bytes, scanning only that kext's appended region rather than the whole
/// image.
fn apply_kext_patches(
    context: &mut PrelinkedContext,
    config: &KernelConfig,
    detected_darwin: u32,
    is_32_bit: bool,
    soft_errors: &mut SoftErrorList<SkipReason>,
) {
    let mut sublist = soft_errors.inserted_sublist();
    for patch in &config.patches {
        if !patch.enabled || patch.identifier == KERNEL_PATCH_IDENTIFIER {
            continue;
        }
        let Some((file_offset, size)) = context.kext_executable_region(&patch.identifier) else {
            sublist.push(SkipReason::KextPatchTargetNotFound(patch.identifier.clone()));
            continue;
        };
        let generic: GenericPatch<'_> = patch.as_generic_patch();
        if let Err(reason) = apply_generic_patch_in_kext(
            context.editor_mut(),
            &generic,
            detected_darwin,
            is_32_bit,
            file_offset,
            size,
        ) {
            warn!("{reason}");
            sublist.push(reason);
        }
    }
}

fn apply_blocks(
    context: &mut PrelinkedContext,
    config: &KernelConfig,
    detected_darwin: u32,
    is_32_bit: bool,
    soft_errors: &mut SoftErrorList<SkipReason>,
) {
    let mut sublist = soft_errors.inserted_sublist();
    for block in &config.blocks {
        if !block.enabled {
            continue;
        }
        let entry = block.as_block_entry();
        let removed = apply_block(
            |id| context.remove_kext_by_identifier(id),
            &entry,
            detected_darwin,
            is_32_bit,
        );
        if let Err(reason) = removed {
            warn!("{reason}");
            sublist.push(reason);
        }
    }
}

fn apply_prelinked_quirks(
    context: &mut PrelinkedContext,
    config: &KernelConfig,
    detected_darwin: u32,
    soft_errors: &mut SoftErrorList<SkipReason>,
) {
    let mut sublist = soft_errors.inserted_sublist();
    for name in PRELINKED_QUIRK_ORDER {
        let quirk = PrelinkedQuirk::by_name(name).expect("every listed name resolves");
        if !config.quirks.is_prelinked_quirk_enabled(quirk) {
            continue;
        }
        let result = if quirk == PrelinkedQuirk::SetApfsTrimTimeout {
            let timeout = config.quirks.set_apfs_trim_timeout.unwrap_or(0);
            apply_apfs_trim_timeout(context, timeout, detected_darwin)
        } else {
            apply_prelinked_quirk(
                context,
                quirk,
                detected_darwin,
                &config.emulate.min_kernel,
                &config.emulate.max_kernel,
            )
        };
        if let Err(reason) = result {
            warn!("{reason}");
            sublist.push(reason);
        }
    }
}

fn apply_kernel_quirks(
    context: &mut PrelinkedContext,
    config: &KernelConfig,
    detected_darwin: u32,
    soft_errors: &mut SoftErrorList<SkipReason>,
) {
    let mut sublist = soft_errors.inserted_sublist();
    for name in KERNEL_QUIRK_ORDER {
        let quirk = KernelQuirk::by_name(name).expect("every listed name resolves");
        if !config.quirks.is_kernel_quirk_enabled(quirk) {
            continue;
        }
        if let Err(reason) = apply_kernel_quirk(context.editor_mut(), quirk, detected_darwin) {
            warn!("{reason}");
            sublist.push(reason);
        }
    }

    if config.emulate.data_is_nonzero() {
        let emulation = crate::patch::cpuid::CpuidEmulation {
            identifier: "cpuid".to_string(),
            data: config.emulate.cpuid1_data,
            mask: config.emulate.cpuid1_mask,
            min_kernel: &config.emulate.min_kernel,
            max_kernel: &config.emulate.max_kernel,
        };
        if let Err(reason) =
            crate::patch::apply_cpuid_emulation(context.editor_mut(), &emulation, detected_darwin)
        {
            warn!("{reason}");
            sublist.push(reason);
        }
    }
}
