//! Component D: the ordered byte-patch rule engine — generic find/replace patches, named
//! built-in quirks, kext blocking, and CPUID leaf-1 emulation.

pub mod cpuid;
pub mod descriptor;
pub mod quirks;

pub use cpuid::{apply_cpuid_emulation, CpuidEmulation};
pub use descriptor::{apply_block, apply_generic_patch, BlockEntry, GenericPatch};
pub use quirks::{
    apply_apfs_trim_timeout, apply_kernel_quirk, apply_prelinked_quirk, KernelQuirk,
    PrelinkedQuirk, KERNEL_QUIRK_ORDER, PRELINKED_QUIRK_ORDER,
};
