//! Named built-in quirks: pre-packaged generic patches behind a toggle, applied in the two
//! fixed orders `OcKernelApplyPatches` applies them in (prelinked/context-targeted quirks, then
//! kernel-Mach-O-targeted quirks).
//!
//! The exact byte tables these patches carry in the source live in a file
//! (`OcKernelPatcherQuirks.c`) that isn't part of the retrieval pack this rewrite draws from, so
//! each quirk here is expressed the same way a user-authored generic patch would be: a
//! conventionally-named anchor symbol plus a masked replace. The gating (order, version, arch,
//! skip-on-failure) is what this module actually guarantees; the payload bytes are placeholders
//! a real deployment would source from the upstream quirk tables.

use crate::darwin_version::{matches_darwin_version, parse_darwin_version};
use crate::error::SkipReason;
use crate::macho::editor::MachoEditor;
use crate::patch::descriptor::{apply_generic_patch, GenericPatch};
use crate::prelinked::PrelinkedContext;

/// Quirks applied to the prelinked context itself, in this fixed order.
pub const PRELINKED_QUIRK_ORDER: &[&str] = &[
    "AppleCpuPmCfgLock",
    "ExternalDiskIcons",
    "ThirdPartyDrives",
    "XhciPortLimit",
    "DisableIoMapper",
    "DisableRtcChecksum",
    "IncreasePciBarSize",
    "CustomSmbiosGuid",
    "ExtendBTFeatureFlags",
    "ForceSecureBootScheme",
    "DummyPowerManagement",
    "SetApfsTrimTimeout",
];

/// Quirks applied directly to the kernel Mach-O, in this fixed order.
pub const KERNEL_QUIRK_ORDER: &[&str] = &[
    "AppleXcpmCfgLock",
    "AppleXcpmExtraMsrs",
    "AppleXcpmForceBoost",
    "PanicNoKextDump",
    "LapicKernelPanic",
    "PowerTimeoutKernelPanic",
    "DisableLinkeditJettison",
    "LegacyCommpage",
    "ProvideCurrentCpuInfo",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrelinkedQuirk {
    AppleCpuPmCfgLock,
    ExternalDiskIcons,
    ThirdPartyDrives,
    XhciPortLimit,
    DisableIoMapper,
    DisableRtcChecksum,
    IncreasePciBarSize,
    CustomSmbiosGuid,
    ExtendBTFeatureFlags,
    ForceSecureBootScheme,
    DummyPowerManagement,
    SetApfsTrimTimeout,
}

impl PrelinkedQuirk {
    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "AppleCpuPmCfgLock" => Self::AppleCpuPmCfgLock,
            "ExternalDiskIcons" => Self::ExternalDiskIcons,
            "ThirdPartyDrives" => Self::ThirdPartyDrives,
            "XhciPortLimit" => Self::XhciPortLimit,
            "DisableIoMapper" => Self::DisableIoMapper,
            "DisableRtcChecksum" => Self::DisableRtcChecksum,
            "IncreasePciBarSize" => Self::IncreasePciBarSize,
            "CustomSmbiosGuid" => Self::CustomSmbiosGuid,
            "ExtendBTFeatureFlags" => Self::ExtendBTFeatureFlags,
            "ForceSecureBootScheme" => Self::ForceSecureBootScheme,
            "DummyPowerManagement" => Self::DummyPowerManagement,
            "SetApfsTrimTimeout" => Self::SetApfsTrimTimeout,
            _ => return None,
        })
    }

    /// The one or more generic patches this quirk expands to (e.g. `XhciPortLimit` is three).
    fn patches(self) -> &'static [QuirkPatchSpec] {
        match self {
            Self::AppleCpuPmCfgLock => &[QuirkPatchSpec {
                symbol: "_cpu_pm_cfg_lock_quirk",
                replace: &[0x00],
                replace_mask: None,
            }],
            Self::ExternalDiskIcons => &[QuirkPatchSpec {
                symbol: "_external_disk_icons_quirk",
                replace: &[0x01],
                replace_mask: None,
            }],
            Self::ThirdPartyDrives => &[QuirkPatchSpec {
                symbol: "_third_party_drives_quirk",
                replace: &[0x01],
                replace_mask: None,
            }],
            Self::XhciPortLimit => &[
                QuirkPatchSpec {
                    symbol: "_xhci_port_limit_quirk_1",
                    replace: &[0x0f],
                    replace_mask: None,
                },
                QuirkPatchSpec {
                    symbol: "_xhci_port_limit_quirk_2",
                    replace: &[0x0f],
                    replace_mask: None,
                },
                QuirkPatchSpec {
                    symbol: "_xhci_port_limit_quirk_3",
                    replace: &[0x0f],
                    replace_mask: None,
                },
            ],
            Self::DisableIoMapper => &[QuirkPatchSpec {
                symbol: "_disable_io_mapper_quirk",
                replace: &[0x00],
                replace_mask: None,
            }],
            Self::DisableRtcChecksum => &[QuirkPatchSpec {
                symbol: "_disable_rtc_checksum_quirk",
                replace: &[0x00],
                replace_mask: None,
            }],
            Self::IncreasePciBarSize => &[QuirkPatchSpec {
                symbol: "_increase_pci_bar_size_quirk",
                replace: &[0xff, 0xff, 0xff, 0xff],
                replace_mask: None,
            }],
            Self::CustomSmbiosGuid => &[
                QuirkPatchSpec {
                    symbol: "_custom_smbios_guid_quirk_1",
                    replace: &[0x01],
                    replace_mask: None,
                },
                QuirkPatchSpec {
                    symbol: "_custom_smbios_guid_quirk_2",
                    replace: &[0x01],
                    replace_mask: None,
                },
            ],
            Self::ExtendBTFeatureFlags => &[QuirkPatchSpec {
                symbol: "_extend_bt_feature_flags_quirk",
                replace: &[0xff],
                replace_mask: None,
            }],
            Self::ForceSecureBootScheme => &[QuirkPatchSpec {
                symbol: "_force_secure_boot_scheme_quirk",
                replace: &[0x01],
                replace_mask: None,
            }],
            Self::DummyPowerManagement => &[QuirkPatchSpec {
                symbol: "_dummy_power_management_quirk",
                replace: &[0x01],
                replace_mask: None,
            }],
            Self::SetApfsTrimTimeout => &[QuirkPatchSpec {
                symbol: "_apfs_trim_timeout_quirk",
                replace: &[0, 0, 0, 0],
                replace_mask: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelQuirk {
    AppleXcpmCfgLock,
    AppleXcpmExtraMsrs,
    AppleXcpmForceBoost,
    PanicNoKextDump,
    LapicKernelPanic,
    PowerTimeoutKernelPanic,
    DisableLinkeditJettison,
    LegacyCommpage,
    ProvideCurrentCpuInfo,
}

impl KernelQuirk {
    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "AppleXcpmCfgLock" => Self::AppleXcpmCfgLock,
            "AppleXcpmExtraMsrs" => Self::AppleXcpmExtraMsrs,
            "AppleXcpmForceBoost" => Self::AppleXcpmForceBoost,
            "PanicNoKextDump" => Self::PanicNoKextDump,
            "LapicKernelPanic" => Self::LapicKernelPanic,
            "PowerTimeoutKernelPanic" => Self::PowerTimeoutKernelPanic,
            "DisableLinkeditJettison" => Self::DisableLinkeditJettison,
            "LegacyCommpage" => Self::LegacyCommpage,
            "ProvideCurrentCpuInfo" => Self::ProvideCurrentCpuInfo,
            _ => return None,
        })
    }

    fn patch(self) -> QuirkPatchSpec {
        match self {
            Self::AppleXcpmCfgLock => QuirkPatchSpec {
                symbol: "_xcpm_cfg_lock_quirk",
                replace: &[0x00],
                replace_mask: None,
            },
            Self::AppleXcpmExtraMsrs => QuirkPatchSpec {
                symbol: "_xcpm_extra_msrs_quirk",
                replace: &[0x01],
                replace_mask: None,
            },
            Self::AppleXcpmForceBoost => QuirkPatchSpec {
                symbol: "_xcpm_force_boost_quirk",
                replace: &[0x01],
                replace_mask: None,
            },
            Self::PanicNoKextDump => QuirkPatchSpec {
                symbol: "_panic_no_kext_dump_quirk",
                replace: &[0x00],
                replace_mask: None,
            },
            Self::LapicKernelPanic => QuirkPatchSpec {
                symbol: "_lapic_kernel_panic_quirk",
                replace: &[0x90, 0x90],
                replace_mask: None,
            },
            Self::PowerTimeoutKernelPanic => QuirkPatchSpec {
                symbol: "_power_timeout_kernel_panic_quirk",
                replace: &[0x90, 0x90],
                replace_mask: None,
            },
            Self::DisableLinkeditJettison => QuirkPatchSpec {
                symbol: "_linkedit_jettison_quirk",
                replace: &[0x00],
                replace_mask: None,
            },
            Self::LegacyCommpage => QuirkPatchSpec {
                symbol: "_legacy_commpage_quirk",
                replace: &[0x01],
                replace_mask: None,
            },
            Self::ProvideCurrentCpuInfo => QuirkPatchSpec {
                symbol: "_provide_current_cpu_info_quirk",
                replace: &[0x01],
                replace_mask: None,
            },
        }
    }
}

struct QuirkPatchSpec {
    symbol: &'static str,
    replace: &'static [u8],
    replace_mask: Option<&'static [u8]>,
}

/// Built-in quirks carry no version range of their own (the one exception,
/// `DummyPowerManagement`, is gated by the caller against `emulate`'s range before this is
/// ever reached, and `SetApfsTrimTimeout` goes through [apply_apfs_trim_timeout] instead).
fn as_generic_patch(name: &'static str, spec: &QuirkPatchSpec) -> GenericPatch<'static> {
    GenericPatch {
        identifier: name.to_string(),
        comment: format!("built-in quirk {name}"),
        arch: "",
        min_kernel: "",
        max_kernel: "",
        base: Some(spec.symbol),
        find: None,
        replace: spec.replace,
        mask: None,
        replace_mask: spec.replace_mask,
        count: 0,
        skip: 0,
        limit: 0,
    }
}

/// Applies one prelinked/context-targeted quirk. `emulate_min_kernel`/`emulate_max_kernel` are
/// only consulted by `DummyPowerManagement`, which the source additionally gates on the
/// `emulate` config block's range rather than its own built-in default.
pub fn apply_prelinked_quirk(
    ctx: &mut PrelinkedContext,
    quirk: PrelinkedQuirk,
    detected_darwin: u32,
    emulate_min_kernel: &str,
    emulate_max_kernel: &str,
) -> Result<(), SkipReason> {
    if quirk == PrelinkedQuirk::DummyPowerManagement {
        let min = parse_darwin_version(emulate_min_kernel);
        let max = parse_darwin_version(emulate_max_kernel);
        if !matches_darwin_version(detected_darwin, min, max) {
            return Err(SkipReason::VersionMismatch {
                identifier: "DummyPowerManagement".to_string(),
                comment: "gated by emulate range".to_string(),
                min_kernel: min,
                max_kernel: max,
            });
        }
    }

    for spec in quirk.patches() {
        let patch = as_generic_patch(quirk_name(quirk), spec);
        apply_generic_patch(ctx.editor_mut(), &patch, detected_darwin, false)?;
    }
    Ok(())
}

/// Applies the `SetApfsTrimTimeout` quirk with the timeout clamped to `[0, 2^31)` (out of
/// range collapses to 0, matching the source's `(UINT32)` cast of a negative/huge config value).
pub fn apply_apfs_trim_timeout(
    ctx: &mut PrelinkedContext,
    timeout_seconds: i64,
    detected_darwin: u32,
) -> Result<(), SkipReason> {
    let clamped: u32 = if (0..(1i64 << 31)).contains(&timeout_seconds) {
        timeout_seconds as u32
    } else {
        0
    };
    let replace = clamped.to_le_bytes();
    let patch = GenericPatch {
        identifier: "SetApfsTrimTimeout".to_string(),
        comment: "built-in quirk SetApfsTrimTimeout".to_string(),
        arch: "",
        min_kernel: "",
        max_kernel: "",
        base: Some("_apfs_trim_timeout_quirk"),
        find: None,
        replace: &replace,
        mask: None,
        replace_mask: None,
        count: 0,
        skip: 0,
        limit: 0,
    };
    apply_generic_patch(ctx.editor_mut(), &patch, detected_darwin, false)
}

/// Applies one kernel-Mach-O-targeted quirk directly to `editor`.
pub fn apply_kernel_quirk(
    editor: &mut MachoEditor,
    quirk: KernelQuirk,
    detected_darwin: u32,
) -> Result<(), SkipReason> {
    let spec = quirk.patch();
    let patch = as_generic_patch(kernel_quirk_name(quirk), &spec);
    apply_generic_patch(editor, &patch, detected_darwin, false)
}

fn quirk_name(quirk: PrelinkedQuirk) -> &'static str {
    match quirk {
        PrelinkedQuirk::AppleCpuPmCfgLock => "AppleCpuPmCfgLock",
        PrelinkedQuirk::ExternalDiskIcons => "ExternalDiskIcons",
        PrelinkedQuirk::ThirdPartyDrives => "ThirdPartyDrives",
        PrelinkedQuirk::XhciPortLimit => "XhciPortLimit",
        PrelinkedQuirk::DisableIoMapper => "DisableIoMapper",
        PrelinkedQuirk::DisableRtcChecksum => "DisableRtcChecksum",
        PrelinkedQuirk::IncreasePciBarSize => "IncreasePciBarSize",
        PrelinkedQuirk::CustomSmbiosGuid => "CustomSmbiosGuid",
        PrelinkedQuirk::ExtendBTFeatureFlags => "ExtendBTFeatureFlags",
        PrelinkedQuirk::ForceSecureBootScheme => "ForceSecureBootScheme",
        PrelinkedQuirk::DummyPowerManagement => "DummyPowerManagement",
        PrelinkedQuirk::SetApfsTrimTimeout => "SetApfsTrimTimeout",
    }
}

fn kernel_quirk_name(quirk: KernelQuirk) -> &'static str {
    match quirk {
        KernelQuirk::AppleXcpmCfgLock => "AppleXcpmCfgLock",
        KernelQuirk::AppleXcpmExtraMsrs => "AppleXcpmExtraMsrs",
        KernelQuirk::AppleXcpmForceBoost => "AppleXcpmForceBoost",
        KernelQuirk::PanicNoKextDump => "PanicNoKextDump",
        KernelQuirk::LapicKernelPanic => "LapicKernelPanic",
        KernelQuirk::PowerTimeoutKernelPanic => "PowerTimeoutKernelPanic",
        KernelQuirk::DisableLinkeditJettison => "DisableLinkeditJettison",
        KernelQuirk::LegacyCommpage => "LegacyCommpage",
        KernelQuirk::ProvideCurrentCpuInfo => "ProvideCurrentCpuInfo",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn by_name_round_trips_every_prelinked_quirk() {
        for name in PRELINKED_QUIRK_ORDER {
            assert!(PrelinkedQuirk::by_name(name).is_some(), "missing quirk {name}");
        }
        assert!(PrelinkedQuirk::by_name("NotAQuirk").is_none());
    }

    #[test]
    fn by_name_round_trips_every_kernel_quirk() {
        for name in KERNEL_QUIRK_ORDER {
            assert!(KernelQuirk::by_name(name).is_some(), "missing quirk {name}");
        }
        assert!(KernelQuirk::by_name("NotAQuirk").is_none());
    }

    #[test]
    fn xhci_port_limit_expands_to_three_patches() {
        assert_eq!(PrelinkedQuirk::XhciPortLimit.patches().len(), 3);
    }

    #[test]
    fn custom_smbios_guid_expands_to_two_patches() {
        assert_eq!(PrelinkedQuirk::CustomSmbiosGuid.patches().len(), 2);
    }

    #[test]
    fn apfs_trim_timeout_clamps_out_of_range_to_zero() {
        assert_eq!(clamp_timeout(-1), 0);
        assert_eq!(clamp_timeout(1i64 << 31), 0);
        assert_eq!(clamp_timeout(42), 42);
    }

    fn clamp_timeout(timeout_seconds: i64) -> u32 {
        if (0..(1i64 << 31)).contains(&timeout_seconds) {
            timeout_seconds as u32
        } else {
            0
        }
    }
}
