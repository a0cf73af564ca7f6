//! Thin wrapper over the `plist` crate for the one thing the prelinked context needs: a root
//! dictionary with an ordered array of kext info dictionaries under a well-known key.
//!
//! Grounded on `PrelinkedContextInit`/`PrelinkedInjectComplete` in `Prelinked.c`, which walk an
//! XML document by hand to find `_PrelinkInfoDictionary`. Using `plist::Value` here buys us a
//! real parser/serializer instead of the original's raw XML-node splicing, so kext info
//! dictionaries are inserted as structured values directly rather than string-spliced text.

use plist::Value;

use crate::error::PrelinkedError;

pub const PRELINK_INFO_DICTIONARY_KEY: &str = "_PrelinkInfoDictionary";
pub const PRELINK_INFO_BUNDLE_PATH_KEY: &str = "_PrelinkBundlePath";
pub const PRELINK_INFO_EXECUTABLE_RELATIVE_PATH_KEY: &str = "_PrelinkExecutableRelativePath";
pub const PRELINK_INFO_EXECUTABLE_LOAD_ADDR_KEY: &str = "_PrelinkExecutableLoadAddr";
pub const PRELINK_INFO_EXECUTABLE_SOURCE_ADDR_KEY: &str = "_PrelinkExecutableSourceAddr";
pub const PRELINK_INFO_EXECUTABLE_SIZE_KEY: &str = "_PrelinkExecutableSize";
pub const PRELINK_INFO_KMOD_INFO_KEY: &str = "_PrelinkKmodInfo";

/// A parsed prelinked info plist: a root dictionary holding the kext list array.
pub struct PrelinkedInfoDoc {
    root: plist::Dictionary,
}

impl PrelinkedInfoDoc {
    pub fn parse(bytes: &[u8]) -> Result<Self, PrelinkedError> {
        let value = Value::from_reader_xml(bytes)?;
        let root = value
            .into_dictionary()
            .ok_or(PrelinkedError::InvalidPlistShape)?;
        if !matches!(root.get(PRELINK_INFO_DICTIONARY_KEY), Some(Value::Array(_))) {
            return Err(PrelinkedError::InvalidPlistShape);
        }
        Ok(Self { root })
    }

    pub fn kext_list(&self) -> &[Value] {
        match self.root.get(PRELINK_INFO_DICTIONARY_KEY) {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }

    pub fn kext_list_mut(&mut self) -> &mut Vec<Value> {
        match self.root.get_mut(PRELINK_INFO_DICTIONARY_KEY) {
            Some(Value::Array(items)) => items,
            _ => unreachable!("shape checked at parse time"),
        }
    }

    /// Remove every kext dictionary whose `CFBundleIdentifier` equals `identifier`. Returns the
    /// number removed.
    pub fn remove_kext_by_identifier(&mut self, identifier: &str) -> usize {
        let before = self.kext_list().len();
        self.kext_list_mut().retain(|item| {
            item.as_dictionary()
                .and_then(|d| d.get("CFBundleIdentifier"))
                .and_then(Value::as_string)
                != Some(identifier)
        });
        before - self.kext_list().len()
    }

    pub fn to_xml_bytes(&self) -> Result<Vec<u8>, PrelinkedError> {
        let mut out = Vec::new();
        Value::Dictionary(self.root.clone()).to_writer_xml(&mut out)?;
        Ok(out)
    }
}

/// Builds a single kext's info dictionary (the per-kext plist passed by the caller, enriched
/// with the `_Prelink*` bookkeeping keys) as a structured value ready to push onto a
/// [PrelinkedInfoDoc]'s kext list.
pub struct KextInfoBuilder {
    dict: plist::Dictionary,
}

impl KextInfoBuilder {
    pub fn parse(bytes: &[u8]) -> Result<Self, PrelinkedError> {
        let value = Value::from_reader_xml(bytes)?;
        let dict = value
            .into_dictionary()
            .ok_or(PrelinkedError::InvalidPlistShape)?;
        Ok(Self { dict })
    }

    /// The kext's own `CFBundleIdentifier`, carried over from the caller-supplied info plist, if
    /// present. Used to key the kext-targeted patch lookup.
    pub fn identifier(&self) -> Option<String> {
        self.dict.get("CFBundleIdentifier").and_then(Value::as_string).map(str::to_string)
    }

    pub fn set_bundle_path(&mut self, path: &str) -> &mut Self {
        self.dict
            .insert(PRELINK_INFO_BUNDLE_PATH_KEY.to_string(), Value::String(path.to_string()));
        self
    }

    pub fn set_executable_fields(
        &mut self,
        relative_path: &str,
        source_addr: u64,
        size: u64,
    ) -> &mut Self {
        self.dict.insert(
            PRELINK_INFO_EXECUTABLE_RELATIVE_PATH_KEY.to_string(),
            Value::String(relative_path.to_string()),
        );
        self.dict.insert(
            PRELINK_INFO_EXECUTABLE_SOURCE_ADDR_KEY.to_string(),
            Value::Integer(source_addr.into()),
        );
        self.dict.insert(
            PRELINK_INFO_EXECUTABLE_SIZE_KEY.to_string(),
            Value::Integer(size.into()),
        );
        self
    }

    pub fn set_link_result(&mut self, load_addr: u64, kmod_info: u64) -> &mut Self {
        self.dict.insert(
            PRELINK_INFO_EXECUTABLE_LOAD_ADDR_KEY.to_string(),
            Value::Integer(load_addr.into()),
        );
        self.dict
            .insert(PRELINK_INFO_KMOD_INFO_KEY.to_string(), Value::Integer(kmod_info.into()));
        self
    }

    pub fn build(self) -> Value {
        Value::Dictionary(self.dict)
    }
}
