//! Component E: the kext injector — walks a list of kext requests in declaratio­n order, gates
//! each by arch/version the same way a patch is gated, and drives [PrelinkedContext] through
//! reservation and injection.
//!
//! Grounded on `OcKernelInjectKexts` (`OpenCoreKernelPatch.c`): identical arch/version gating
//! order to the patch engine, one kext's failure recorded and skipped without aborting the pass.
//!
//! ```text
//! Pending  --reserve--> Reserved --append_exec--> ExecAppended --link--> Linked --register--> Registered
//!    |          |             |                        |                   |
//!    |          v             v                        v                   v
//!    +---- Skipped        Skipped                 RevertAppend         RevertAppend
//!                                                     |                    |
//!                                                     v                    v
//!                                                 Skipped              Skipped
//! ```
//!
//! The intermediate states are [PrelinkedContext::inject_kext]'s internal rollback bookkeeping;
//! from this module's point of view every kext request resolves to one of the two terminal
//! states, `Registered` (this function returns `Ok`) or `Skipped` (recorded in the returned
//! error list).

use crate::darwin_version::{matches_darwin_version, parse_darwin_version};
use crate::error::SkipReason;
use crate::error_list::SoftErrorSublist;
use crate::prelinked::{KextLinker, PrelinkedContext};

/// One kext to inject, borrowing its bytes from the caller's configuration layer (the injector
/// never owns kext bytes, per the resource model).
#[derive(Debug, Clone)]
pub struct KextRequest<'a> {
    pub bundle_path: &'a str,
    pub arch: &'a str,
    pub min_kernel: &'a str,
    pub max_kernel: &'a str,
    pub info_plist: &'a [u8],
    pub executable: Option<(&'a str, &'a [u8])>,
}

/// Injects every enabled kext request in order, collecting per-kext failures into `errors`
/// rather than aborting. Returns the running reservation total actually consumed, mirroring
/// the accounting a caller would have performed before allocating the image.
pub fn inject_kexts(
    context: &mut PrelinkedContext,
    linker: &mut dyn KextLinker,
    requests: &[KextRequest<'_>],
    detected_darwin: u32,
    is_32_bit: bool,
    errors: &mut SoftErrorSublist<'_, SkipReason>,
) -> u64 {
    let mut running_total = 0u64;

    for request in requests {
        let other_arch = if is_32_bit { "x86_64" } else { "i386" };
        if !request.arch.is_empty() && request.arch == other_arch {
            errors.push(SkipReason::ArchMismatch {
                identifier: request.bundle_path.to_string(),
                comment: "kext injection".to_string(),
                arch: request.arch.to_string(),
            });
            continue;
        }

        let min_kernel = parse_darwin_version(request.min_kernel);
        let max_kernel = parse_darwin_version(request.max_kernel);
        if !matches_darwin_version(detected_darwin, min_kernel, max_kernel) {
            errors.push(SkipReason::VersionMismatch {
                identifier: request.bundle_path.to_string(),
                comment: "kext injection".to_string(),
                min_kernel,
                max_kernel,
            });
            continue;
        }

        let executable_size = request.executable.map(|(_, bytes)| bytes.len() as u64).unwrap_or(0);
        if PrelinkedContext::reserve_kext_size(
            &mut running_total,
            request.info_plist.len() as u64,
            executable_size,
        )
        .is_err()
        {
            errors.push(SkipReason::KextInjectionFailed {
                bundle_path: request.bundle_path.to_string(),
                source: crate::error::KextSkipSource::Prelinked(crate::error::PrelinkedError::Overflow),
            });
            continue;
        }

        if let Err(source) = context.inject_kext(
            linker,
            request.bundle_path,
            request.info_plist,
            request.executable,
        ) {
            errors.push(SkipReason::KextInjectionFailed {
                bundle_path: request.bundle_path.to_string(),
                source,
            });
        }
    }

    running_total
}
