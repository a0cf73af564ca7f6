//! Functions used by Serde to serialize types that we don't own (and thus can't implement
//! [Serialize] for), plus helpers for rendering raw patch bytes as hex in diagnostics.

use serde::{Deserializer, Serializer};

/// Useful for types that implement [Error][std::error::Error] and don't need any special
/// treatment.
pub fn serialize_generic_error<S: Serializer, E: std::error::Error>(
    error: &E,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let dbg = format!("{error:#?}");
    serializer.serialize_str(&dbg)
}
/// Render a byte pattern (`find`/`replace`/masks) as a hex string for diagnostics/JSON.
pub fn serialize_hex_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        hex.push_str(&format!("{b:02X}"));
    }
    serializer.serialize_str(&hex)
}

/// Parse a hex string back into bytes for `PatchConfig` round-tripping through JSON.
pub fn deserialize_hex_bytes<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<u8>, D::Error> {
    use serde::de::Error;
    let hex = String::deserialize(deserializer)?;
    if hex.len() % 2 != 0 {
        return Err(D::Error::custom("odd-length hex string"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(D::Error::custom))
        .collect()
}
