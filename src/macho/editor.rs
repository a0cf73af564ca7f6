//! In-place Mach-O 64 editor: owns the image buffer, exposes segments/sections/symbols, and
//! grows the file-last segment's tail for appended content.
//!
//! Grounded on the load-command walk in `mac/streams/module_list.rs::read_module`, adapted
//! from "read live memory through raw pointers" to "read/write an owned buffer through
//! `scroll`", since here the buffer is ours to mutate rather than a snapshot of someone else's
//! address space.

use scroll::{Pread, Pwrite, LE};

use crate::error::MachoError;
use crate::macho::structs::{
    name16_str, LoadCommand, MachHeader64, Nlist64, Section64, SegmentCommand64, SymtabCommand,
    LC_SEGMENT_64, LC_SYMTAB, MACH_HEADER_64_SIZE, MH_MAGIC_64, NLIST_64_SIZE,
    SECTION_64_SIZE, SEGMENT_COMMAND_64_SIZE,
};

/// Offset of a `SegmentCommand64` load command within the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHandle(usize);

/// Offset of a `Section64` within the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHandle(usize);

pub struct MachoEditor {
    buffer: Vec<u8>,
    payload_size: u64,
    allocated_size: u64,
    segment_offsets: Vec<usize>,
    symtab_offset: Option<usize>,
    cpu_type: u32,
}

fn round_up_4096(n: u64) -> u64 {
    (n + 4095) & !4095
}

impl MachoEditor {
    pub fn new(buffer: Vec<u8>, payload_size: u64, allocated_size: u64) -> Result<Self, MachoError> {
        let header: MachHeader64 = buffer.pread_with(0, LE)?;
        if header.magic != MH_MAGIC_64 {
            return Err(MachoError::BadMagic(header.magic));
        }

        let mut offset = MACH_HEADER_64_SIZE;
        let commands_end = offset
            .checked_add(header.size_commands as usize)
            .ok_or(MachoError::LoadCommandsOutOfRange)?;
        if commands_end as u64 > payload_size {
            return Err(MachoError::LoadCommandsOutOfRange);
        }

        let mut segment_offsets = Vec::new();
        let mut symtab_offset = None;

        for _ in 0..header.num_commands {
            let lc: LoadCommand = buffer.pread_with(offset, LE)?;
            if lc.cmd == LC_SEGMENT_64 {
                segment_offsets.push(offset);
            } else if lc.cmd == LC_SYMTAB {
                symtab_offset = Some(offset);
            }
            offset += lc.cmd_size as usize;
        }

        let first_segment_end = segment_offsets
            .first()
            .map(|&off| -> Result<u64, MachoError> {
                let seg: SegmentCommand64 = buffer.pread_with(off, LE)?;
                Ok(seg.file_off + seg.file_size)
            })
            .transpose()?;
        if let Some(end) = first_segment_end {
            if commands_end as u64 > end {
                return Err(MachoError::LoadCommandsOutOfRange);
            }
        }

        let editor = Self {
            buffer,
            payload_size,
            allocated_size,
            segment_offsets,
            symtab_offset,
            cpu_type: header.cpu_type,
        };
        editor.check_no_overlaps()?;
        Ok(editor)
    }

    /// Whether the image is `i386` rather than `x86_64`, per its Mach header's `cputype`.
    pub fn is_32_bit(&self) -> bool {
        self.cpu_type == crate::macho::structs::CPU_TYPE_I386
    }

    fn check_no_overlaps(&self) -> Result<(), MachoError> {
        let segs: Vec<SegmentCommand64> = self
            .segment_offsets
            .iter()
            .map(|&off| self.buffer.pread_with::<SegmentCommand64>(off, LE))
            .collect::<Result<_, _>>()?;

        for i in 0..segs.len() {
            let a = &segs[i];
            if a.file_off + a.file_size > self.payload_size {
                return Err(MachoError::OverlappingFileRange(
                    name16_str(&a.segname).to_string(),
                ));
            }
            for b in &segs[i + 1..] {
                let a_file = a.file_off..a.file_off + a.file_size;
                let b_file = b.file_off..b.file_off + b.file_size;
                if a.file_size > 0 && b.file_size > 0 && ranges_overlap(&a_file, &b_file) {
                    return Err(MachoError::OverlappingFileRange(
                        name16_str(&a.segname).to_string(),
                    ));
                }
                let a_vm = a.vm_addr..a.vm_addr + a.vm_size;
                let b_vm = b.vm_addr..b.vm_addr + b.vm_size;
                if a.vm_size > 0 && b.vm_size > 0 && ranges_overlap(&a_vm, &b_vm) {
                    return Err(MachoError::OverlappingVirtualRange(
                        name16_str(&a.segname).to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    fn segment_at(&self, off: usize) -> Result<SegmentCommand64, MachoError> {
        Ok(self.buffer.pread_with(off, LE)?)
    }

    pub fn segment_by_name(&self, name: &str) -> Result<SegmentHandle, MachoError> {
        for &off in &self.segment_offsets {
            let seg = self.segment_at(off)?;
            if name16_str(&seg.segname) == name {
                return Ok(SegmentHandle(off));
            }
        }
        Err(MachoError::NotFound(name.to_string()))
    }

    pub fn segment(&self, handle: SegmentHandle) -> Result<SegmentCommand64, MachoError> {
        self.segment_at(handle.0)
    }

    pub fn set_segment(&mut self, handle: SegmentHandle, seg: SegmentCommand64) -> Result<(), MachoError> {
        self.buffer.pwrite_with(seg, handle.0, LE)?;
        Ok(())
    }

    pub fn section_by_name(
        &self,
        segment: SegmentHandle,
        name: &str,
    ) -> Result<SectionHandle, MachoError> {
        let seg = self.segment_at(segment.0)?;
        let mut off = segment.0 + SEGMENT_COMMAND_64_SIZE;
        for _ in 0..seg.num_sections {
            let sect: Section64 = self.buffer.pread_with(off, LE)?;
            if name16_str(&sect.sectname) == name && name16_str(&sect.segname) == name16_str(&seg.segname)
            {
                return Ok(SectionHandle(off));
            }
            off += SECTION_64_SIZE;
        }
        Err(MachoError::NotFound(name.to_string()))
    }

    pub fn section(&self, handle: SectionHandle) -> Result<Section64, MachoError> {
        Ok(self.buffer.pread_with(handle.0, LE)?)
    }

    pub fn set_section(&mut self, handle: SectionHandle, sect: Section64) -> Result<(), MachoError> {
        self.buffer.pwrite_with(sect, handle.0, LE)?;
        Ok(())
    }

    /// Maximum `vaddr + vsize` across every segment, rounded up to a page.
    pub fn last_vaddr(&self) -> Result<u64, MachoError> {
        let mut max = 0u64;
        for &off in &self.segment_offsets {
            let seg = self.segment_at(off)?;
            max = max.max(seg.vm_addr + seg.vm_size);
        }
        Ok(round_up_4096(max))
    }

    /// Resolve a symbol name to its file offset by walking the symbol/string tables.
    pub fn symbol_address(&self, name: &str) -> Result<u64, MachoError> {
        let Some(symtab_off) = self.symtab_offset else {
            return Err(MachoError::SymbolNotFound(name.to_string()));
        };
        let symtab: SymtabCommand = self.buffer.pread_with(symtab_off, LE)?;

        for i in 0..symtab.nsyms {
            let entry_off = symtab.symoff as usize + i as usize * NLIST_64_SIZE;
            let Ok(entry) = self.buffer.pread_with::<Nlist64>(entry_off, LE) else {
                continue;
            };
            let str_off = symtab.stroff as usize + entry.n_strx as usize;
            let Some(sym_name) = read_c_string(&self.buffer, str_off) else {
                continue;
            };
            let sym_name = sym_name.trim_start_matches('_');
            if sym_name == name.trim_start_matches('_') {
                return self.file_offset_for_vaddr(entry.n_value);
            }
        }
        Err(MachoError::SymbolNotFound(name.to_string()))
    }

    fn file_offset_for_vaddr(&self, vaddr: u64) -> Result<u64, MachoError> {
        for &off in &self.segment_offsets {
            let seg = self.segment_at(off)?;
            if vaddr >= seg.vm_addr && vaddr < seg.vm_addr + seg.vm_size {
                return Ok(seg.file_off + (vaddr - seg.vm_addr));
            }
        }
        Err(MachoError::SymbolNotFound(format!("{vaddr:#x}")))
    }

    /// Grows the file-last segment's tail (and its own tail section) by `delta` bytes, and
    /// advances `payload_size` accordingly. Fails if `segment` isn't file-last or the growth
    /// would exceed `allocated_size`.
    pub fn grow_segment_tail(&mut self, segment: SegmentHandle, delta: u64) -> Result<(), MachoError> {
        let mut seg = self.segment_at(segment.0)?;
        if seg.file_off + seg.file_size != self.payload_size {
            return Err(MachoError::NotTailSegment(
                name16_str(&seg.segname).to_string(),
            ));
        }
        let new_payload = self
            .payload_size
            .checked_add(delta)
            .ok_or(MachoError::BufferTooSmall {
                delta,
                allocated: self.allocated_size,
            })?;
        if new_payload > self.allocated_size {
            return Err(MachoError::BufferTooSmall {
                delta,
                allocated: self.allocated_size,
            });
        }

        // Grow the tail section: the one whose file range currently ends where the segment
        // does.
        let mut off = segment.0 + SEGMENT_COMMAND_64_SIZE;
        let old_end = seg.file_off + seg.file_size;
        for _ in 0..seg.num_sections {
            let mut sect: Section64 = self.buffer.pread_with(off, LE)?;
            if u64::from(sect.offset) + sect.size == old_end {
                sect.size += delta;
                self.buffer.pwrite_with(sect, off, LE)?;
                break;
            }
            off += SECTION_64_SIZE;
        }

        seg.file_size += delta;
        seg.vm_size += delta;
        self.buffer.pwrite_with(seg, segment.0, LE)?;

        if self.buffer.len() < new_payload as usize {
            self.buffer.resize(new_payload as usize, 0);
        }
        self.payload_size = new_payload;
        Ok(())
    }

    pub fn set_payload_size(&mut self, size: u64) {
        self.payload_size = size;
    }

    pub fn ensure_capacity(&mut self, size: u64) -> Result<(), MachoError> {
        if size > self.allocated_size {
            return Err(MachoError::BufferTooSmall {
                delta: size - self.payload_size,
                allocated: self.allocated_size,
            });
        }
        if self.buffer.len() < size as usize {
            self.buffer.resize(size as usize, 0);
        }
        Ok(())
    }

    pub fn bounds_check(&self, offset: u64, length: u64) -> Result<(), MachoError> {
        let end = offset.checked_add(length).ok_or(MachoError::OutOfBounds {
            offset,
            length,
            payload_size: self.payload_size,
        })?;
        if end > self.payload_size {
            return Err(MachoError::OutOfBounds {
                offset,
                length,
                payload_size: self.payload_size,
            });
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, length: u64) -> Result<&[u8], MachoError> {
        self.bounds_check(offset, length)?;
        Ok(&self.buffer[offset as usize..(offset + length) as usize])
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), MachoError> {
        self.bounds_check(offset, data.len() as u64)?;
        let start = offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

fn ranges_overlap(a: &std::ops::Range<u64>, b: &std::ops::Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

fn read_c_string(buf: &[u8], offset: usize) -> Option<String> {
    let slice = buf.get(offset..)?;
    let end = slice.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&slice[..end]).ok().map(String::from)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::macho::structs::name16;

    fn build_minimal_macho() -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cpu_type: crate::macho::structs::CPU_TYPE_X86_64,
            cpu_subtype: 3,
            file_type: 2,
            num_commands: 1,
            size_commands: SEGMENT_COMMAND_64_SIZE as u32,
            flags: 0,
            reserved: 0,
        };
        buf.pwrite_with(header, 0, LE).unwrap();

        let seg = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmd_size: SEGMENT_COMMAND_64_SIZE as u32,
            segname: name16("__TEXT"),
            vm_addr: 0x1000,
            vm_size: 0x1000,
            file_off: 0,
            file_size: 4096,
            max_prot: 7,
            init_prot: 5,
            num_sections: 0,
            flags: 0,
        };
        buf.pwrite_with(seg, MACH_HEADER_64_SIZE, LE).unwrap();
        buf
    }

    #[test]
    fn parses_minimal_image() {
        let buf = build_minimal_macho();
        let editor = MachoEditor::new(buf, 4096, 4096).unwrap();
        assert!(editor.segment_by_name("__TEXT").is_ok());
        assert!(editor.segment_by_name("__DATA").is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = build_minimal_macho();
        buf.pwrite_with(0xDEAD_BEEFu32, 0, LE).unwrap();
        assert!(matches!(
            MachoEditor::new(buf, 4096, 4096),
            Err(MachoError::BadMagic(_))
        ));
    }

    #[test]
    fn grows_tail_segment() {
        let buf = build_minimal_macho();
        let mut editor = MachoEditor::new(buf, 4096, 8192).unwrap();
        let handle = editor.segment_by_name("__TEXT").unwrap();
        editor.grow_segment_tail(handle, 4096).unwrap();
        assert_eq!(editor.payload_size(), 8192);
        let seg = editor.segment(handle).unwrap();
        assert_eq!(seg.file_size, 8192);
        assert_eq!(seg.vm_size, 0x2000);
    }

    #[test]
    fn grow_beyond_allocated_fails() {
        let buf = build_minimal_macho();
        let mut editor = MachoEditor::new(buf, 4096, 4096).unwrap();
        let handle = editor.segment_by_name("__TEXT").unwrap();
        assert!(matches!(
            editor.grow_segment_tail(handle, 4096),
            Err(MachoError::BufferTooSmall { .. })
        ));
    }
}
