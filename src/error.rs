//! Error taxonomy for the core, grouped the way [crate::error_list] expects to collect them:
//! image-structural and capacity errors abort the boot, everything else is a soft error that
//! gets logged and skipped by the caller.

use thiserror::Error;

/// Errors produced while reading the boot image off its byte source (component A).
#[derive(Debug, Error)]
pub enum ImageReadError {
    #[error("fat header claims {0} architectures, which doesn't fit the header window")]
    MalformedFatArchCount(u32),
    #[error("fat header has no entry for the requested architecture")]
    MalformedFatNoSuchArch,
    #[error("fat architecture entry offset/size overflows")]
    MalformedFatOverflow,
    #[error("nested FAT or compressed header (recursion) at offset {0}")]
    RecursiveEnvelope(u64),
    #[error("compressed image declares decompressed size {0}, outside the allowed range")]
    InvalidDecompressedSize(u64),
    #[error("decompression produced {produced} bytes, expected {expected}")]
    DecompressionSizeMismatch { produced: usize, expected: usize },
    #[error("unrecognized compression algorithm tag {0:?}")]
    UnknownCompression([u8; 4]),
    #[error("image is smaller than its own declared size")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors produced by the Mach-O editor (component B).
#[derive(Debug, Error)]
pub enum MachoError {
    #[error("bad Mach-O magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported CPU type {0:#010x}")]
    UnsupportedCpuType(u32),
    #[error("load commands extend past the first segment's file range")]
    LoadCommandsOutOfRange,
    #[error("segment {0:?} file range overlaps another segment")]
    OverlappingFileRange(String),
    #[error("segment {0:?} virtual range overlaps another segment")]
    OverlappingVirtualRange(String),
    #[error("segment or section named {0:?} not found")]
    NotFound(String),
    #[error("symbol {0:?} not found")]
    SymbolNotFound(String),
    #[error("segment {0:?} is not the file-last segment, cannot grow its tail")]
    NotTailSegment(String),
    #[error("growing by {delta} bytes would exceed the allocated buffer ({allocated})")]
    BufferTooSmall { delta: u64, allocated: u64 },
    #[error("offset {offset} + length {length} is out of bounds for a payload of size {payload_size}")]
    OutOfBounds {
        offset: u64,
        length: u64,
        payload_size: u64,
    },
    #[error(transparent)]
    Scroll(#[from] scroll::Error),
}

/// Errors produced while managing the prelinked context (component C).
#[derive(Debug, Error)]
pub enum PrelinkedError {
    #[error(transparent)]
    Macho(#[from] MachoError),
    #[error(transparent)]
    Plist(#[from] plist::Error),
    #[error("__PRELINK_INFO is not positioned so that kexts can be appended after it")]
    Unsupported,
    #[error("appending would need {needed} bytes but only {available} are allocated")]
    BufferTooSmall { needed: u64, available: u64 },
    #[error("integer overflow computing a reserved size")]
    Overflow,
    #[error("the root plist is not a dictionary, or is missing the kext list key")]
    InvalidPlistShape,
}

/// Top-level error returned by orchestration entry points (§6); everything that is not
/// contained by a soft-error list bubbles up as one of these.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    ImageRead(#[from] ImageReadError),
    #[error(transparent)]
    Macho(#[from] MachoError),
    #[error(transparent)]
    Prelinked(#[from] PrelinkedError),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
}

/// A single contained (recoverable) failure: a patch or kext that was skipped, plus why.
///
/// Collected into a [crate::error_list::SoftErrorList] per boot rather than propagated, matching
/// §7's "reported and skipped; boot continues" policy.
#[derive(Debug, Error, serde::Serialize)]
pub enum SkipReason {
    #[error("identifier {identifier:?} ({comment}): architecture {arch} does not match image")]
    ArchMismatch { identifier: String, comment: String, arch: String },
    #[error(
        "identifier {identifier:?} ({comment}): kernel version outside [{min_kernel}, {max_kernel}]"
    )]
    VersionMismatch {
        identifier: String,
        comment: String,
        min_kernel: u32,
        max_kernel: u32,
    },
    #[error("identifier {identifier:?} ({comment}): find/replace/mask length mismatch, patch is borked")]
    MalformedPatch { identifier: String, comment: String },
    #[error("identifier {identifier:?} ({comment}): base symbol not found")]
    SymbolNotFound { identifier: String, comment: String },
    #[error("identifier {identifier:?} ({comment}): no match found in range")]
    PatternNotFound { identifier: String, comment: String },
    #[error("unknown quirk {0:?}")]
    UnknownQuirk(String),
    #[error("patch identifier {0:?} targets a kext that is not currently registered")]
    KextPatchTargetNotFound(String),
    #[error("kext {bundle_path:?}: {source}")]
    KextInjectionFailed {
        bundle_path: String,
        #[source]
        source: KextSkipSource,
    },
}

#[derive(Debug, Error, serde::Serialize)]
pub enum KextSkipSource {
    #[error("linking the executable is not supported")]
    LinkUnsupported,
    #[error(transparent)]
    Prelinked(
        #[serde(serialize_with = "crate::serializers::serialize_generic_error")]
        #[from]
        PrelinkedError,
    ),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
