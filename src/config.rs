//! The boundary configuration tree (§6): plain `serde`-derived structs a caller builds from
//! whatever format it parses its own outer configuration document in. This core only consumes
//! the already-built tree; parsing that document is out of scope.
//!
//! Grounded on `error_list.rs`'s own `to_json`/`Serialize` habits and on `serializers.rs`'s
//! pattern of small dedicated (de)serialize helpers for foreign-shaped data, applied here to
//! render patch byte fields as hex strings rather than JSON integer arrays.

use serde::{Deserialize, Serialize};

use crate::patch::descriptor::{BlockEntry, GenericPatch};
use crate::patch::quirks::{KernelQuirk, PrelinkedQuirk};
use crate::serializers::{deserialize_hex_bytes, serialize_hex_bytes};

/// One entry of `patches[]` (§6). `identifier` is `"kernel"` for a kernel-targeted patch,
/// otherwise a kext bundle identifier, in which case the patch is scanned against that kext's
/// own in-context executable bytes rather than the whole image (see `boot.rs`'s kext-targeted
/// patch pass).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    pub identifier: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub min_kernel: String,
    #[serde(default)]
    pub max_kernel: String,
    #[serde(default)]
    pub base: Option<String>,
    /// Empty means "no find pattern" (write-at-anchor), matching the source's zero-size
    /// sentinel convention already mirrored by [GenericPatch::find] being an `Option`.
    #[serde(
        default,
        serialize_with = "serialize_hex_bytes",
        deserialize_with = "deserialize_hex_bytes"
    )]
    pub find: Vec<u8>,
    #[serde(serialize_with = "serialize_hex_bytes", deserialize_with = "deserialize_hex_bytes")]
    pub replace: Vec<u8>,
    #[serde(
        default,
        serialize_with = "serialize_hex_bytes",
        deserialize_with = "deserialize_hex_bytes"
    )]
    pub mask: Vec<u8>,
    #[serde(
        default,
        serialize_with = "serialize_hex_bytes",
        deserialize_with = "deserialize_hex_bytes"
    )]
    pub replace_mask: Vec<u8>,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub skip: u32,
    #[serde(default)]
    pub limit: u32,
}

impl PatchConfig {
    /// Borrows this entry as a [GenericPatch]. An empty `find`/`mask`/`replace_mask` vec is
    /// surfaced as `None`, matching the patch engine's own optional-field convention.
    pub fn as_generic_patch(&self) -> GenericPatch<'_> {
        GenericPatch {
            identifier: self.identifier.clone(),
            comment: self.comment.clone(),
            arch: &self.arch,
            min_kernel: &self.min_kernel,
            max_kernel: &self.max_kernel,
            base: self.base.as_deref(),
            find: non_empty(&self.find),
            replace: &self.replace,
            mask: non_empty(&self.mask),
            replace_mask: non_empty(&self.replace_mask),
            count: self.count,
            skip: self.skip,
            limit: self.limit,
        }
    }
}

fn non_empty(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

/// One entry of `blocks[]` (§6): remove a bundle identifier from the prelinked kext list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    pub identifier: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub min_kernel: String,
    #[serde(default)]
    pub max_kernel: String,
}

impl BlockConfig {
    pub fn as_block_entry(&self) -> BlockEntry<'_> {
        BlockEntry {
            identifier: &self.identifier,
            comment: &self.comment,
            arch: &self.arch,
            min_kernel: &self.min_kernel,
            max_kernel: &self.max_kernel,
        }
    }
}

/// One entry of `adds[]` (§6). The original's `plist_path`/`executable_path` fields name files
/// on disk; since this core has no filesystem access (§6 "Persistent state: None"), the
/// bootstrap driver reads them first and hands the resulting bytes in here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddConfig {
    pub bundle_path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub min_kernel: String,
    #[serde(default)]
    pub max_kernel: String,
    #[serde(
        serialize_with = "serialize_hex_bytes",
        deserialize_with = "deserialize_hex_bytes"
    )]
    pub info_plist: Vec<u8>,
    /// `(relative_path, executable_bytes)`, absent for an info-plist-only kext.
    #[serde(default)]
    pub executable: Option<AddExecutable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddExecutable {
    pub relative_path: String,
    #[serde(
        serialize_with = "serialize_hex_bytes",
        deserialize_with = "deserialize_hex_bytes"
    )]
    pub bytes: Vec<u8>,
}

/// `quirks` (§6): one toggle per named built-in quirk, plus `SetApfsTrimTimeout`'s value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuirksConfig {
    #[serde(default)]
    pub apple_cpu_pm_cfg_lock: bool,
    #[serde(default)]
    pub external_disk_icons: bool,
    #[serde(default)]
    pub third_party_drives: bool,
    #[serde(default)]
    pub xhci_port_limit: bool,
    #[serde(default)]
    pub disable_io_mapper: bool,
    #[serde(default)]
    pub disable_rtc_checksum: bool,
    #[serde(default)]
    pub increase_pci_bar_size: bool,
    #[serde(default)]
    pub custom_smbios_guid: bool,
    #[serde(default)]
    pub extend_bt_feature_flags: bool,
    #[serde(default)]
    pub force_secure_boot_scheme: bool,
    #[serde(default)]
    pub dummy_power_management: bool,
    /// `None` means the quirk is off; `Some(seconds)` turns it on with that timeout.
    #[serde(default)]
    pub set_apfs_trim_timeout: Option<i64>,
    #[serde(default)]
    pub apple_xcpm_cfg_lock: bool,
    #[serde(default)]
    pub apple_xcpm_extra_msrs: bool,
    #[serde(default)]
    pub apple_xcpm_force_boost: bool,
    #[serde(default)]
    pub panic_no_kext_dump: bool,
    #[serde(default)]
    pub lapic_kernel_panic: bool,
    #[serde(default)]
    pub power_timeout_kernel_panic: bool,
    #[serde(default)]
    pub disable_linkedit_jettison: bool,
    #[serde(default)]
    pub legacy_commpage: bool,
    #[serde(default)]
    pub provide_current_cpu_info: bool,
}

impl QuirksConfig {
    pub fn is_prelinked_quirk_enabled(&self, quirk: PrelinkedQuirk) -> bool {
        match quirk {
            PrelinkedQuirk::AppleCpuPmCfgLock => self.apple_cpu_pm_cfg_lock,
            PrelinkedQuirk::ExternalDiskIcons => self.external_disk_icons,
            PrelinkedQuirk::ThirdPartyDrives => self.third_party_drives,
            PrelinkedQuirk::XhciPortLimit => self.xhci_port_limit,
            PrelinkedQuirk::DisableIoMapper => self.disable_io_mapper,
            PrelinkedQuirk::DisableRtcChecksum => self.disable_rtc_checksum,
            PrelinkedQuirk::IncreasePciBarSize => self.increase_pci_bar_size,
            PrelinkedQuirk::CustomSmbiosGuid => self.custom_smbios_guid,
            PrelinkedQuirk::ExtendBTFeatureFlags => self.extend_bt_feature_flags,
            PrelinkedQuirk::ForceSecureBootScheme => self.force_secure_boot_scheme,
            PrelinkedQuirk::DummyPowerManagement => self.dummy_power_management,
            PrelinkedQuirk::SetApfsTrimTimeout => self.set_apfs_trim_timeout.is_some(),
        }
    }

    pub fn is_kernel_quirk_enabled(&self, quirk: KernelQuirk) -> bool {
        match quirk {
            KernelQuirk::AppleXcpmCfgLock => self.apple_xcpm_cfg_lock,
            KernelQuirk::AppleXcpmExtraMsrs => self.apple_xcpm_extra_msrs,
            KernelQuirk::AppleXcpmForceBoost => self.apple_xcpm_force_boost,
            KernelQuirk::PanicNoKextDump => self.panic_no_kext_dump,
            KernelQuirk::LapicKernelPanic => self.lapic_kernel_panic,
            KernelQuirk::PowerTimeoutKernelPanic => self.power_timeout_kernel_panic,
            KernelQuirk::DisableLinkeditJettison => self.disable_linkedit_jettison,
            KernelQuirk::LegacyCommpage => self.legacy_commpage,
            KernelQuirk::ProvideCurrentCpuInfo => self.provide_current_cpu_info,
        }
    }
}

/// `emulate` (§6): CPUID leaf-1 substitution plus the version range `DummyPowerManagement`
/// additionally consults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmulateConfig {
    #[serde(default)]
    pub cpuid1_data: [u32; 4],
    #[serde(default)]
    pub cpuid1_mask: [u32; 4],
    #[serde(default)]
    pub dummy_power_management: bool,
    #[serde(default)]
    pub min_kernel: String,
    #[serde(default)]
    pub max_kernel: String,
}

impl EmulateConfig {
    /// Whether `cpuid1_data` carries a real override, matching [crate::patch::cpuid]'s own
    /// all-zero-is-a-no-op convention.
    pub fn data_is_nonzero(&self) -> bool {
        self.cpuid1_data != [0; 4]
    }
}

/// The root configuration tree (§6): everything a single boot's image preparation pass
/// consumes, built by the bootstrap driver from its own outer document format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub patches: Vec<PatchConfig>,
    #[serde(default)]
    pub blocks: Vec<BlockConfig>,
    #[serde(default)]
    pub adds: Vec<AddConfig>,
    #[serde(default)]
    pub quirks: QuirksConfig,
    #[serde(default)]
    pub emulate: EmulateConfig,
    /// Selects the `i386` slice of a FAT image instead of the default `x86_64` one (§4.A). Has
    /// no effect on a non-FAT image, which carries only one architecture.
    #[serde(default)]
    pub prefer_32_bit: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn patch_config_round_trips_through_json() {
        let cfg = PatchConfig {
            identifier: "kernel".into(),
            comment: "test".into(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            base: None,
            find: vec![0xDE, 0xAD],
            replace: vec![0xBE, 0xEF],
            mask: vec![],
            replace_mask: vec![],
            count: 1,
            skip: 0,
            limit: 0,
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["find"], "DEAD");
        assert_eq!(json["replace"], "BEEF");
        let back: PatchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.find, vec![0xDE, 0xAD]);
    }

    #[test]
    fn empty_find_becomes_none_in_generic_patch() {
        let cfg = PatchConfig {
            identifier: "kernel".into(),
            comment: String::new(),
            enabled: true,
            arch: String::new(),
            min_kernel: String::new(),
            max_kernel: String::new(),
            base: Some("_some_symbol".into()),
            find: vec![],
            replace: vec![0x01],
            mask: vec![],
            replace_mask: vec![],
            count: 0,
            skip: 0,
            limit: 0,
        };
        let patch = cfg.as_generic_patch();
        assert!(patch.find.is_none());
        assert_eq!(patch.base, Some("_some_symbol"));
    }

    #[test]
    fn quirks_config_maps_every_prelinked_quirk() {
        let mut cfg = QuirksConfig::default();
        cfg.xhci_port_limit = true;
        assert!(cfg.is_prelinked_quirk_enabled(PrelinkedQuirk::XhciPortLimit));
        assert!(!cfg.is_prelinked_quirk_enabled(PrelinkedQuirk::ThirdPartyDrives));
    }

    #[test]
    fn set_apfs_trim_timeout_enabled_iff_value_present() {
        let mut cfg = QuirksConfig::default();
        assert!(!cfg.is_prelinked_quirk_enabled(PrelinkedQuirk::SetApfsTrimTimeout));
        cfg.set_apfs_trim_timeout = Some(30);
        assert!(cfg.is_prelinked_quirk_enabled(PrelinkedQuirk::SetApfsTrimTimeout));
    }
}
