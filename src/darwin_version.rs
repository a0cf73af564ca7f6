//! Darwin version parsing and the min/max range gate patches and blocks are checked against.
//!
//! Grounded on `OcParseDarwinVersion`/`OcMatchDarwinVersion` (`OpenCoreKernelPatch.c`): a
//! version is packed as `major*10000 + minor*100 + patch`, each component clamped to two
//! decimal digits, and a parse failure yields `0`.

/// Packs `major.minor.patch` into `major*10000 + minor*100 + patch`.
///
/// Each component is clamped to `0..=99`; out-of-range components make the whole string
/// unparsable, same as a missing component does.
pub fn parse_darwin_version(version: &str) -> u32 {
    parse_darwin_version_checked(version).unwrap_or(0)
}

fn parse_darwin_version_checked(version: &str) -> Option<u32> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    let patch: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || major > 99 || minor > 99 || patch > 99 {
        return None;
    }
    Some(major * 10_000 + minor * 100 + patch)
}

/// The string XNU embeds verbatim in its kernel image (`osversion`/`version` section),
/// e.g. `"Darwin Kernel Version 21.6.0: ..."`. Scanning for this prefix and parsing the
/// `major.minor.patch` that follows is how `OcKernelReadDarwinVersion` determines the running
/// kernel version without needing a pre-parsed field anywhere in the prelinked info plist.
const DARWIN_VERSION_PREFIX: &[u8] = b"Darwin Kernel Version ";

/// Scans `buffer` for [DARWIN_VERSION_PREFIX] and packs the version string that follows it, up
/// to the next `:` or whitespace. Returns `0` (unparsable) if the prefix isn't found or the
/// text after it isn't a well-formed three-component version.
pub fn detect_darwin_version(buffer: &[u8]) -> u32 {
    let Some(pos) = find_subslice(buffer, DARWIN_VERSION_PREFIX) else {
        return 0;
    };
    let rest = &buffer[pos + DARWIN_VERSION_PREFIX.len()..];
    let end = rest
        .iter()
        .position(|&b| b == b':' || b == b' ' || b == b'\0' || b == b'\n')
        .unwrap_or(rest.len());
    let Ok(version_str) = std::str::from_utf8(&rest[..end]) else {
        return 0;
    };
    parse_darwin_version(version_str)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Returns whether `detected` falls within `[min_kernel, max_kernel]`, treating a `0` bound
/// as unconstrained in that direction — except when `detected == 0` (version could not be
/// parsed from the image), which only matches a patch whose bounds are *both* explicitly 0.
pub fn matches_darwin_version(detected: u32, min_kernel: u32, max_kernel: u32) -> bool {
    if detected == 0 {
        return min_kernel == 0 && max_kernel == 0;
    }
    if min_kernel != 0 && detected < min_kernel {
        return false;
    }
    if max_kernel != 0 && detected > max_kernel {
        return false;
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packs_components() {
        assert_eq!(parse_darwin_version("19.6.0"), 19 * 10_000 + 6 * 100);
        assert_eq!(parse_darwin_version("21.0.0"), 21 * 10_000);
        assert_eq!(parse_darwin_version("20.99.99"), 20 * 10_000 + 99 * 100 + 99);
    }

    #[test]
    fn unparsable_yields_zero() {
        assert_eq!(parse_darwin_version(""), 0);
        assert_eq!(parse_darwin_version("19.6"), 0);
        assert_eq!(parse_darwin_version("19.6.0.1"), 0);
        assert_eq!(parse_darwin_version("nope"), 0);
        assert_eq!(parse_darwin_version("100.0.0"), 0);
    }

    #[test]
    fn zero_bounds_are_unconstrained() {
        let v = parse_darwin_version("19.6.0");
        assert!(matches_darwin_version(v, 0, 0));
        assert!(matches_darwin_version(v, 0, parse_darwin_version("19.6.0")));
        assert!(matches_darwin_version(v, parse_darwin_version("19.0.0"), 0));
    }

    #[test]
    fn version_gated_skip() {
        let detected = parse_darwin_version("21.0.0");
        let min = parse_darwin_version("20.0.0");
        let max = parse_darwin_version("20.99.99");
        assert!(!matches_darwin_version(detected, min, max));
    }

    #[test]
    fn unparsed_detected_only_matches_explicit_zero_bounds() {
        assert!(matches_darwin_version(0, 0, 0));
        assert!(!matches_darwin_version(0, 0, parse_darwin_version("19.0.0")));
    }

    #[test]
    fn detects_version_string_embedded_in_kernel_bytes() {
        let mut buf = vec![0u8; 64];
        buf.extend_from_slice(b"Darwin Kernel Version 21.6.0: Mon Aug ...");
        assert_eq!(detect_darwin_version(&buf), parse_darwin_version("21.6.0"));
    }

    #[test]
    fn missing_version_string_yields_zero() {
        let buf = vec![0u8; 128];
        assert_eq!(detect_darwin_version(&buf), 0);
    }
}
