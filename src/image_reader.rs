//! Component A: reads a possibly-FAT, possibly-compressed XNU image off a [ByteSource] into a
//! contiguous buffer with slack for later growth.
//!
//! Ported from `ReadAppleKernelImage`/`ParseFatArchitecture`/`ParseCompressedHeader` in
//! `KernelReader.c`: a `while` loop over the magic at the front of the buffer, re-entering
//! itself after peeling off a FAT or compressed envelope, with FAT forbidden at any offset
//! greater than zero and compression forbidden from recurring into itself.

use log::{debug, trace};
use scroll::{Pread, LE};
use sha2::{Digest, Sha384};

use crate::byte_source::ByteSource;
use crate::decompress::{decompress_lzss, decompress_lzvn};
use crate::error::ImageReadError;
use crate::macho::structs::{FatArch, FatHeader, FAT_ARCH_SIZE, FAT_CIGAM, FAT_MAGIC, MH_MAGIC_64};

/// Header probe window, matching `KERNEL_HEADER_SIZE` (two EFI pages).
const HEADER_PROBE_SIZE: usize = 4096 * 2;
const COMPRESSION_MAX_LENGTH: u64 = 0x1000_0000; // OC_COMPRESSION_MAX_LENGTH, 256 MiB
const COMP_HEADER_SIZE: usize = 12;
/// Raw on-disk compressed-header signature bytes (`MACH_COMPRESSED_BINARY_INVERT_SIGNATURE`).
const COMP_SIGNATURE: [u8; 4] = *b"pmoc";

pub struct ReadImageResult {
    pub buffer: Vec<u8>,
    pub payload_size: u64,
    pub allocated_size: u64,
    pub digest: Option<[u8; 48]>,
}

/// Reads the whole image (after resolving FAT/compression envelopes), allocating
/// `payload_size + reserved_size` bytes of room for later kext/patch growth.
///
/// `prefer_32_bit` selects the `i386` entry of a FAT image instead of the default `x86_64` one
/// (§4.A); it has no effect on a non-FAT image.
///
/// When `want_digest` is set, a SHA-384 is computed over the *original* on-disk bytes in file
/// order, independent of how many envelope layers were peeled off, by tracking a running
/// digest cursor and hashing every gap before servicing each read (mirroring
/// `KernelGetFileData`'s prefix/suffix hashing around the running `mKernelDigestPosition`).
pub fn read_apple_kernel<S: ByteSource>(
    source: &mut S,
    reserved_size: u64,
    want_digest: bool,
    prefer_32_bit: bool,
) -> Result<ReadImageResult, ImageReadError>
where
    S::Error: Into<std::io::Error>,
{
    let mut cursor = DigestingReader::new(source, want_digest);
    let (buffer, payload_size) =
        read_image_recursive(&mut cursor, 0, None, reserved_size, false, false, prefer_32_bit)?;
    let allocated_size = (buffer.len() as u64).max(payload_size);
    Ok(ReadImageResult {
        buffer,
        payload_size,
        allocated_size,
        digest: cursor.finish(),
    })
}

struct DigestingReader<'a, S: ByteSource> {
    source: &'a mut S,
    hasher: Option<Sha384>,
    position: u64,
}

impl<'a, S: ByteSource> DigestingReader<'a, S>
where
    S::Error: Into<std::io::Error>,
{
    fn new(source: &'a mut S, want_digest: bool) -> Self {
        Self {
            source,
            hasher: want_digest.then(Sha384::new),
            position: 0,
        }
    }

    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, ImageReadError> {
        if let Some(hasher) = &mut self.hasher {
            if offset > self.position {
                let gap = offset - self.position;
                let filler = self
                    .source
                    .read(self.position, gap as usize)
                    .map_err(Into::into)?;
                hasher.update(&filler);
                self.position = offset;
            }
        }
        let data = self.source.read(offset, len).map_err(Into::into)?;
        if let Some(hasher) = &mut self.hasher {
            if offset >= self.position {
                let already_hashed = self.position.saturating_sub(offset) as usize;
                hasher.update(&data[already_hashed.min(data.len())..]);
                self.position = offset + data.len() as u64;
            }
        }
        Ok(data)
    }

    fn finish(self) -> Option<[u8; 48]> {
        self.hasher.map(|h| h.finalize().into())
    }
}

fn read_image_recursive<S: ByteSource>(
    reader: &mut DigestingReader<'_, S>,
    offset: u64,
    known_size: Option<u64>,
    reserved_size: u64,
    forbid_fat: bool,
    already_compressed: bool,
    prefer_32_bit: bool,
) -> Result<(Vec<u8>, u64), ImageReadError>
where
    S::Error: Into<std::io::Error>,
{
    let probe_len = HEADER_PROBE_SIZE.min(reader.source.size().saturating_sub(offset) as usize);
    let header = reader.read(offset, probe_len)?;
    if header.len() < 4 {
        return Err(ImageReadError::Truncated);
    }
    let magic: u32 = header.pread_with(0, LE)?;

    match magic {
        MH_MAGIC_64 => {
            trace!("found Mach-O header at offset {offset}, compressed={already_compressed}");
            if already_compressed {
                // The decompressed buffer built by the compressed branch already *is* the
                // payload; nothing further to read.
                return Err(ImageReadError::Truncated);
            }
            let size = match known_size {
                Some(size) => size,
                // Offset 0 and no caller-supplied size: a plain (non-FAT) file, whole size.
                None => reader.source.size(),
            };
            let mut buffer = reader.read(offset, size as usize)?;
            let payload_size = size;
            buffer.resize((payload_size + reserved_size) as usize, 0);
            Ok((buffer, payload_size))
        }
        FAT_MAGIC | FAT_CIGAM => {
            if forbid_fat {
                return Err(ImageReadError::RecursiveEnvelope(offset));
            }
            let (arch_offset, arch_size) =
                parse_fat_architecture(&header, magic == FAT_CIGAM, prefer_32_bit)?;
            read_image_recursive(
                reader,
                arch_offset,
                Some(arch_size),
                reserved_size,
                true,
                already_compressed,
                prefer_32_bit,
            )
        }
        _ if header.len() >= 4 && header[0..4] == COMP_SIGNATURE => {
            if already_compressed {
                return Err(ImageReadError::RecursiveEnvelope(offset));
            }
            let (buffer, payload_size) =
                parse_compressed_header(reader, &header, offset, reserved_size)?;
            let decompressed_magic: u32 = buffer.pread_with(0, LE)?;
            if decompressed_magic != MH_MAGIC_64 {
                return Err(ImageReadError::UnknownCompression(
                    decompressed_magic.to_le_bytes(),
                ));
            }
            Ok((buffer, payload_size))
        }
        _ => Err(ImageReadError::UnknownCompression(
            magic.to_le_bytes(),
        )),
    }
}

fn parse_fat_architecture(
    header: &[u8],
    swap: bool,
    prefer_32_bit: bool,
) -> Result<(u64, u64), ImageReadError> {
    let fat_header: FatHeader = header.pread_with(0, LE)?;
    let nfat_arch = if swap {
        fat_header.nfat_arch.swap_bytes()
    } else {
        fat_header.nfat_arch
    };

    let table_size = (nfat_arch as usize)
        .checked_mul(FAT_ARCH_SIZE)
        .and_then(|n| n.checked_add(std::mem::size_of::<FatHeader>()))
        .ok_or(ImageReadError::MalformedFatArchCount(nfat_arch))?;
    if table_size > HEADER_PROBE_SIZE {
        return Err(ImageReadError::MalformedFatArchCount(nfat_arch));
    }

    let wanted_cpu_type = if prefer_32_bit {
        crate::macho::structs::CPU_TYPE_I386
    } else {
        crate::macho::structs::CPU_TYPE_X86_64
    };

    for i in 0..nfat_arch {
        let entry_off = std::mem::size_of::<FatHeader>() + i as usize * FAT_ARCH_SIZE;
        let arch: FatArch = header.pread_with(entry_off, LE)?;
        let cpu_type = if swap { arch.cpu_type.swap_bytes() } else { arch.cpu_type };
        if cpu_type == wanted_cpu_type {
            let arch_offset = if swap { arch.offset.swap_bytes() } else { arch.offset };
            let arch_size = if swap { arch.size.swap_bytes() } else { arch.size };
            if arch_offset == 0 {
                return Err(ImageReadError::MalformedFatOverflow);
            }
            arch_offset
                .checked_add(arch_size)
                .ok_or(ImageReadError::MalformedFatOverflow)?;
            return Ok((u64::from(arch_offset), u64::from(arch_size)));
        }
    }
    Err(ImageReadError::MalformedFatNoSuchArch)
}

fn parse_compressed_header<S: ByteSource>(
    reader: &mut DigestingReader<'_, S>,
    header: &[u8],
    offset: u64,
    reserved_size: u64,
) -> Result<(Vec<u8>, u64), ImageReadError>
where
    S::Error: Into<std::io::Error>,
{
    // Fields stored big-endian-in-file ("inverted"); compression tag is the four bytes at
    // offset 4.
    let compression_tag = [header[4], header[5], header[6], header[7]];
    let compressed_size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let decompressed_size = u32::from_be_bytes(
        header
            .get(12..16)
            .ok_or(ImageReadError::Truncated)?
            .try_into()
            .unwrap(),
    );

    if u64::from(compressed_size) > COMPRESSION_MAX_LENGTH
        || compressed_size == 0
        || u64::from(decompressed_size) > COMPRESSION_MAX_LENGTH
        || (decompressed_size as usize) < HEADER_PROBE_SIZE
    {
        return Err(ImageReadError::InvalidDecompressedSize(u64::from(
            decompressed_size,
        )));
    }

    let compressed = reader.read(
        offset + COMP_HEADER_SIZE as u64,
        compressed_size as usize,
    )?;

    let mut buffer = match &compression_tag {
        b"nvzl" => decompress_lzvn(&compressed, decompressed_size as usize)?,
        b"sszl" => decompress_lzss(&compressed, decompressed_size as usize)?,
        other => return Err(ImageReadError::UnknownCompression(*other)),
    };

    debug!(
        "decompressed kernel at offset {offset}: {compressed_size} -> {decompressed_size} bytes"
    );
    buffer.resize((decompressed_size as u64 + reserved_size) as usize, 0);
    Ok((buffer, u64::from(decompressed_size)))
}
