//! Component C: the prelinked kernel context — a Mach-O image paired with its parsed
//! `__PRELINK_INFO` plist and kext list, supporting reservation, injection, and finalization.
//!
//! Grounded on `PrelinkedContextInit`/`PrelinkedInjectPrepare`/`PrelinkedInjectComplete` in
//! `Prelinked.c`. Every failure path out of `inject_kext`, including `link_executable` returning
//! `Unsupported`, rolls back the executable bytes and segment/section/`payload_size`/
//! `last_vaddr` growth performed for them in full, matching `PrelinkedInjectKext`'s own early
//! return before its size/address bookkeeping runs.

use log::{debug, warn};

use crate::error::{KextSkipSource, MachoError, PrelinkedError};
use crate::macho::editor::{MachoEditor, SectionHandle, SegmentHandle};
use crate::macho::structs::{Section64, SegmentCommand64};
use crate::plist_doc::{KextInfoBuilder, PrelinkedInfoDoc};

pub const PRELINK_INFO_SEGMENT: &str = "__PRELINK_INFO";
pub const PRELINK_INFO_SECTION: &str = "__info";
pub const PRELINK_TEXT_SEGMENT: &str = "__PRELINK_TEXT";
pub const PRELINK_TEXT_SECTION: &str = "__text";

fn round_up_4096(n: u64) -> u64 {
    (n + 4095) & !4095
}

/// Result of attempting to link a newly-appended kext executable into the prelinked image.
///
/// The repository at specification time does not implement the XNU prelink-time linker; this
/// hook exists so that limitation is visible (an explicit `Unsupported` outcome) rather than
/// silently producing a kext with unresolved symbol references.
pub trait KextLinker {
    fn link_executable(
        &mut self,
        editor: &MachoEditor,
        existing_kexts: &[plist::Value],
        source_vaddr: u64,
        size: u64,
    ) -> Result<(u64, u64), KextSkipSource>;
}

/// The linker the repository ships: always reports that linking isn't implemented.
#[derive(Debug, Default)]
pub struct UnsupportedLinker;

impl KextLinker for UnsupportedLinker {
    fn link_executable(
        &mut self,
        _editor: &MachoEditor,
        _existing_kexts: &[plist::Value],
        _source_vaddr: u64,
        _size: u64,
    ) -> Result<(u64, u64), KextSkipSource> {
        Err(KextSkipSource::LinkUnsupported)
    }
}

pub struct PrelinkedContext {
    editor: MachoEditor,
    info_segment: SegmentHandle,
    info_section: SectionHandle,
    text_segment: SegmentHandle,
    text_section: SectionHandle,
    info_doc: PrelinkedInfoDoc,
    last_vaddr: u64,
    /// `(identifier, file_offset, size)` of every registered kext's executable, for kext-
    /// targeted patch lookup. Kept alongside `info_doc` rather than re-derived from its plist
    /// values, since the file offset isn't itself one of `_PrelinkExecutable*`'s stored fields
    /// (only the vaddr is).
    kext_regions: Vec<(String, u64, u64)>,
}

impl PrelinkedContext {
    pub fn initialize(
        buffer: Vec<u8>,
        payload_size: u64,
        allocated_size: u64,
    ) -> Result<Self, PrelinkedError> {
        let payload_size = round_up_4096(payload_size);
        let mut editor = MachoEditor::new(buffer, payload_size, allocated_size)?;
        editor.ensure_capacity(payload_size)?;

        let info_segment = editor.segment_by_name(PRELINK_INFO_SEGMENT)?;
        let info_section = editor.section_by_name(info_segment, PRELINK_INFO_SECTION)?;
        let text_segment = editor.segment_by_name(PRELINK_TEXT_SEGMENT)?;
        let text_section = editor.section_by_name(text_segment, PRELINK_TEXT_SECTION)?;

        let last_vaddr = round_up_4096(editor.last_vaddr()?);
        if last_vaddr == 0 {
            return Err(MachoError::NotFound("no segments".to_string()).into());
        }

        let info_sect = editor.section(info_section)?;
        let info_bytes = editor
            .read_bytes(u64::from(info_sect.offset), info_sect.size)?
            .to_vec();
        let info_doc = PrelinkedInfoDoc::parse(&info_bytes)?;

        Ok(Self {
            editor,
            info_segment,
            info_section,
            text_segment,
            text_section,
            info_doc,
            last_vaddr,
            kext_regions: Vec::new(),
        })
    }

    /// Zeroes `__PRELINK_INFO`, reclaiming its space if it was file-last, so new kexts can be
    /// appended to `__PRELINK_TEXT` contiguously.
    pub fn prepare_inject(&mut self) -> Result<(), PrelinkedError> {
        let info_seg = self.editor.segment(self.info_segment)?;
        let info_end = round_up_4096(info_seg.file_off + info_seg.file_size);
        if info_end == self.editor.payload_size() {
            self.editor
                .set_payload_size(round_up_4096(info_seg.file_off));
        }

        self.editor.set_segment(
            self.info_segment,
            SegmentCommand64 {
                vm_addr: 0,
                vm_size: 0,
                file_off: 0,
                file_size: 0,
                ..info_seg
            },
        )?;
        let info_sect = self.editor.section(self.info_section)?;
        self.editor.set_section(
            self.info_section,
            Section64 {
                addr: 0,
                size: 0,
                offset: 0,
                ..info_sect
            },
        )?;

        self.last_vaddr = round_up_4096(self.editor.last_vaddr()?);

        let text_seg = self.editor.segment(self.text_segment)?;
        let text_end = round_up_4096(text_seg.file_off + text_seg.file_size);
        if text_end != self.editor.payload_size() {
            return Err(PrelinkedError::Unsupported);
        }
        Ok(())
    }

    /// Pure helper: adds the slack one kext injection will need to a caller-held running total.
    pub fn reserve_kext_size(
        running_total: &mut u64,
        info_plist_size: u64,
        executable_size: u64,
    ) -> Result<(), PrelinkedError> {
        crate::return_err_if_fail_enabled!(ReserveKextSizeOverflow, PrelinkedError::Overflow);
        let info_part = round_up_4096(
            info_plist_size
                .checked_add(512)
                .ok_or(PrelinkedError::Overflow)?,
        );
        let exec_part = round_up_4096(executable_size);
        let total = info_part
            .checked_add(exec_part)
            .ok_or(PrelinkedError::Overflow)?;
        *running_total = running_total
            .checked_add(total)
            .ok_or(PrelinkedError::Overflow)?;
        Ok(())
    }

    fn file_offset_to_vaddr(&self, segment: SegmentHandle, file_offset: u64) -> Result<u64, PrelinkedError> {
        let seg = self.editor.segment(segment)?;
        Ok(seg.vm_addr + (file_offset - seg.file_off))
    }

    /// Injects one kext. On success the kext is registered in the info dictionary. On any
    /// failure, including `KextSkipSource::LinkUnsupported`, all buffer growth from this call
    /// is rolled back in full and the error is returned: `payload_size`, `last_vaddr`, and the
    /// `__PRELINK_TEXT` segment/section are bitwise-unchanged from entry.
    pub fn inject_kext(
        &mut self,
        linker: &mut dyn KextLinker,
        bundle_path: &str,
        info_plist_bytes: &[u8],
        executable: Option<(&str, &[u8])>,
    ) -> Result<(), KextSkipSource> {
        let rollback_payload_size = self.editor.payload_size();
        let rollback_text_seg = self
            .editor
            .segment(self.text_segment)
            .map_err(PrelinkedError::from)?;
        let rollback_text_sect = self
            .editor
            .section(self.text_section)
            .map_err(PrelinkedError::from)?;
        let rollback_last_vaddr = self.last_vaddr;

        match self.inject_kext_inner(linker, bundle_path, info_plist_bytes, executable) {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, KextSkipSource::LinkUnsupported) {
                    warn!("kext {bundle_path:?}: link_executable unsupported");
                }
                self.editor
                    .set_segment(self.text_segment, rollback_text_seg)
                    .map_err(PrelinkedError::from)?;
                self.editor
                    .set_section(self.text_section, rollback_text_sect)
                    .map_err(PrelinkedError::from)?;
                self.editor.set_payload_size(rollback_payload_size);
                self.last_vaddr = rollback_last_vaddr;
                Err(err)
            }
        }
    }

    fn inject_kext_inner(
        &mut self,
        linker: &mut dyn KextLinker,
        bundle_path: &str,
        info_plist_bytes: &[u8],
        executable: Option<(&str, &[u8])>,
    ) -> Result<(), KextSkipSource> {
        let mut builder = KextInfoBuilder::parse(info_plist_bytes)?;
        builder.set_bundle_path(bundle_path);

        let Some((relative_path, exec_bytes)) = executable else {
            self.register(builder, None);
            return Ok(());
        };

        let padded_len = round_up_4096(exec_bytes.len() as u64);
        let source_offset = self.editor.payload_size();
        self.editor
            .ensure_capacity(source_offset + padded_len)
            .map_err(PrelinkedError::from)?;
        self.editor
            .grow_segment_tail(self.text_segment, padded_len)
            .map_err(PrelinkedError::from)?;
        self.editor
            .write_bytes(source_offset, exec_bytes)
            .map_err(PrelinkedError::from)?;
        self.last_vaddr = round_up_4096(self.last_vaddr + padded_len);

        let source_vaddr = self
            .file_offset_to_vaddr(self.text_segment, source_offset)
            .map_err(KextSkipSource::from)?;
        builder.set_executable_fields(relative_path, source_vaddr, padded_len);

        crate::return_err_if_fail_enabled!(LinkExecutable, KextSkipSource::LinkUnsupported);
        let existing = self.info_doc.kext_list().to_vec();
        let (load_addr, kmod_info) =
            linker.link_executable(&self.editor, &existing, source_vaddr, padded_len)?;
        builder.set_link_result(load_addr, kmod_info);

        debug!("injected kext {bundle_path:?} at vaddr {source_vaddr:#x}, {padded_len} bytes");
        self.register(builder, Some((source_offset, padded_len)));
        Ok(())
    }

    fn register(&mut self, builder: KextInfoBuilder, region: Option<(u64, u64)>) {
        let identifier = builder.identifier();
        let value = builder.build();
        self.info_doc.kext_list_mut().push(value);
        if let (Some(identifier), Some((file_offset, size))) = (identifier, region) {
            self.kext_regions.push((identifier, file_offset, size));
        }
    }

    /// The in-buffer `(file_offset, size)` of a registered kext's executable, for the kext-
    /// targeted patch pass. `None` if the identifier names no currently-registered kext, or one
    /// with no executable (info-only kexts have nothing to patch).
    pub fn kext_executable_region(&self, identifier: &str) -> Option<(u64, u64)> {
        self.kext_regions
            .iter()
            .find(|(id, _, _)| id == identifier)
            .map(|(_, offset, size)| (*offset, *size))
    }

    /// Serializes the root plist and appends it as the new `__PRELINK_INFO`/`__info`.
    pub fn finalize(&mut self) -> Result<(), PrelinkedError> {
        let mut xml = self.info_doc.to_xml_bytes()?;
        xml.push(0);
        let padded_len = round_up_4096(xml.len() as u64);
        xml.resize(padded_len as usize, 0);

        let offset = self.editor.payload_size();
        let new_size = offset
            .checked_add(padded_len)
            .ok_or(PrelinkedError::Overflow)?;
        crate::return_err_if_fail_enabled!(
            FinalizeBufferTooSmall,
            PrelinkedError::BufferTooSmall {
                needed: new_size,
                available: self.editor.allocated_size(),
            }
        );
        if new_size > self.editor.allocated_size() {
            return Err(PrelinkedError::BufferTooSmall {
                needed: new_size,
                available: self.editor.allocated_size(),
            });
        }
        self.editor.ensure_capacity(new_size)?;
        self.editor.set_payload_size(new_size);
        self.editor.write_bytes(offset, &xml)?;

        let vaddr = self.last_vaddr;
        let info_seg = self.editor.segment(self.info_segment)?;
        self.editor.set_segment(
            self.info_segment,
            SegmentCommand64 {
                vm_addr: vaddr,
                vm_size: padded_len,
                file_off: offset,
                file_size: padded_len,
                ..info_seg
            },
        )?;
        let info_sect = self.editor.section(self.info_section)?;
        self.editor.set_section(
            self.info_section,
            Section64 {
                addr: vaddr,
                size: padded_len,
                offset: offset as u32,
                ..info_sect
            },
        )?;
        self.last_vaddr = round_up_4096(vaddr + padded_len);
        Ok(())
    }

    pub fn into_buffer(self) -> (Vec<u8>, u64) {
        let payload_size = self.editor.payload_size();
        (self.editor.into_buffer(), payload_size)
    }

    pub fn editor(&self) -> &MachoEditor {
        &self.editor
    }

    pub fn editor_mut(&mut self) -> &mut MachoEditor {
        &mut self.editor
    }

    pub fn kext_list(&self) -> &[plist::Value] {
        self.info_doc.kext_list()
    }

    pub fn remove_kext_by_identifier(&mut self, identifier: &str) -> usize {
        self.kext_regions.retain(|(id, _, _)| id != identifier);
        self.info_doc.remove_kext_by_identifier(identifier)
    }
}
