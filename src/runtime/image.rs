//! Binary image inspection.
//!
//! Runtime selection needs two facts about each test binary: which CLR
//! version it was built against and whether it must run in a 32-bit
//! process. Those facts come from a [`BinaryImageInspector`]. The stock
//! implementation, [`PeImageInspector`], reads them straight from the PE
//! headers without loading the image.
//!
//! ```text
//! DOS header ── e_lfanew ──► "PE\0\0" + COFF header
//!                            optional header (PE32 / PE32+)
//!                              └─ data directory #14 ──► CLI header
//!                                                        ├─ metadata RVA ──► "BSJB" + version string
//!                                                        └─ CorFlags (32BITREQUIRED, ...)
//! ```

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use super::Version;

const DOS_MAGIC: u16 = 0x5a4d;
const PE_SIGNATURE: u32 = 0x0000_4550;
const PE32: u16 = 0x10b;
const PE32_PLUS: u16 = 0x20b;
const CLI_HEADER_DIRECTORY: u64 = 14;
const METADATA_SIGNATURE: u32 = 0x424a_5342;
const FLAG_32BIT_REQUIRED: u32 = 0x0000_0002;
const FLAG_32BIT_PREFERRED: u32 = 0x0002_0000;
const SECTION_HEADER_SIZE: u64 = 40;
const MAX_VERSION_LENGTH: u32 = 255;

/// What an inspector learned about a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageInfo {
    /// The file is a well-formed executable image.
    pub is_valid_image: bool,
    /// The image carries managed metadata.
    pub is_managed_image: bool,
    /// The image can only run in a 32-bit process.
    pub requires_32bit: bool,
    /// CLR version recorded in the metadata root, if readable.
    pub runtime_version: Option<Version>,
}

impl ImageInfo {
    /// The definite negative: not an image at all.
    pub fn negative() -> Self {
        Self::default()
    }

    /// A valid image without managed metadata.
    pub fn native() -> Self {
        Self {
            is_valid_image: true,
            ..Self::default()
        }
    }

    /// A managed image built against `version`.
    pub fn managed(version: Version, requires_32bit: bool) -> Self {
        Self {
            is_valid_image: true,
            is_managed_image: true,
            requires_32bit,
            runtime_version: Some(version),
        }
    }
}

/// Reads runtime requirements from a binary on disk.
///
/// Implementations must not fail: unreadable or foreign files produce
/// [`ImageInfo::negative`].
pub trait BinaryImageInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> ImageInfo;
}

/// Inspector that parses PE/COFF headers directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeImageInspector;

impl BinaryImageInspector for PeImageInspector {
    fn inspect(&self, path: &Path) -> ImageInfo {
        match read_image(path) {
            Ok(info) => info,
            Err(e) => {
                debug!("Unable to read image {}: {}", path.display(), e);
                ImageInfo::negative()
            }
        }
    }
}

struct Section {
    virtual_address: u32,
    virtual_size: u32,
    pointer_to_raw_data: u32,
}

fn read_image(path: &Path) -> io::Result<ImageInfo> {
    let mut file = File::open(path)?;

    if read_u16(&mut file, 0)? != DOS_MAGIC {
        return Ok(ImageInfo::negative());
    }

    let pe_offset = u64::from(read_u32(&mut file, 0x3c)?);
    if read_u32(&mut file, pe_offset)? != PE_SIGNATURE {
        return Ok(ImageInfo::negative());
    }

    let coff = pe_offset + 4;
    let section_count = read_u16(&mut file, coff + 2)?;
    let optional_size = read_u16(&mut file, coff + 16)?;
    let optional = coff + 20;

    let magic = read_u16(&mut file, optional)?;
    let (count_offset, directory_offset) = match magic {
        PE32 => (92, 96),
        PE32_PLUS => (108, 112),
        _ => return Ok(ImageInfo::negative()),
    };

    let directory_count = read_u32(&mut file, optional + count_offset)?;
    if u64::from(directory_count) <= CLI_HEADER_DIRECTORY {
        return Ok(ImageInfo::native());
    }

    let cli_rva = read_u32(
        &mut file,
        optional + directory_offset + CLI_HEADER_DIRECTORY * 8,
    )?;
    if cli_rva == 0 {
        return Ok(ImageInfo::native());
    }

    let sections_start = optional + u64::from(optional_size);
    let mut sections = Vec::with_capacity(usize::from(section_count));
    for i in 0..u64::from(section_count) {
        let header = sections_start + i * SECTION_HEADER_SIZE;
        sections.push(Section {
            virtual_size: read_u32(&mut file, header + 8)?,
            virtual_address: read_u32(&mut file, header + 12)?,
            pointer_to_raw_data: read_u32(&mut file, header + 20)?,
        });
    }

    let Some(cli_offset) = rva_to_offset(&sections, cli_rva) else {
        return Ok(ImageInfo::native());
    };
    let metadata_rva = read_u32(&mut file, cli_offset + 8)?;
    let flags = read_u32(&mut file, cli_offset + 16)?;

    let Some(metadata_offset) = rva_to_offset(&sections, metadata_rva) else {
        return Ok(ImageInfo::native());
    };
    if read_u32(&mut file, metadata_offset)? != METADATA_SIGNATURE {
        return Ok(ImageInfo::native());
    }

    let length = read_u32(&mut file, metadata_offset + 12)?.min(MAX_VERSION_LENGTH);
    let mut raw = vec![0u8; length as usize];
    file.seek(SeekFrom::Start(metadata_offset + 16))?;
    file.read_exact(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);
    let runtime_version = text.trim_end_matches('\0').parse::<Version>().ok();

    let requires_32bit =
        magic == PE32 && flags & FLAG_32BIT_REQUIRED != 0 && flags & FLAG_32BIT_PREFERRED == 0;

    Ok(ImageInfo {
        is_valid_image: true,
        is_managed_image: true,
        requires_32bit,
        runtime_version,
    })
}

fn rva_to_offset(sections: &[Section], rva: u32) -> Option<u64> {
    sections
        .iter()
        .find(|s| rva >= s.virtual_address && rva < s.virtual_address.saturating_add(s.virtual_size))
        .map(|s| u64::from(rva - s.virtual_address) + u64::from(s.pointer_to_raw_data))
}

fn read_u16(file: &mut File, offset: u64) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(file: &mut File, offset: u64) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Builds a minimal managed PE image for tests in this crate.
#[cfg(test)]
pub(crate) fn synthetic_image(version: &str, cor_flags: u32, pe32_plus: bool) -> Vec<u8> {
    fn put_u16(buf: &mut [u8], at: usize, v: u16) {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    let mut buf = vec![0u8; 0x400];
    put_u16(&mut buf, 0, DOS_MAGIC);
    put_u32(&mut buf, 0x3c, 0x80);
    put_u32(&mut buf, 0x80, PE_SIGNATURE);

    let coff = 0x84;
    let (optional_size, magic, count_offset, directory_offset) = if pe32_plus {
        (240u16, PE32_PLUS, 108, 112)
    } else {
        (224u16, PE32, 92, 96)
    };
    put_u16(&mut buf, coff, if pe32_plus { 0x8664 } else { 0x14c });
    put_u16(&mut buf, coff + 2, 1);
    put_u16(&mut buf, coff + 16, optional_size);

    let optional = coff + 20;
    put_u16(&mut buf, optional, magic);
    put_u32(&mut buf, optional + count_offset, 16);
    put_u32(&mut buf, optional + directory_offset + 14 * 8, 0x2000);
    put_u32(&mut buf, optional + directory_offset + 14 * 8 + 4, 72);

    let section = optional + optional_size as usize;
    buf[section..section + 5].copy_from_slice(b".text");
    put_u32(&mut buf, section + 8, 0x1000);
    put_u32(&mut buf, section + 12, 0x2000);
    put_u32(&mut buf, section + 16, 0x200);
    put_u32(&mut buf, section + 20, 0x200);

    let cli = 0x200;
    put_u32(&mut buf, cli, 72);
    put_u32(&mut buf, cli + 8, 0x2048);
    put_u32(&mut buf, cli + 16, cor_flags);

    let metadata = 0x248;
    put_u32(&mut buf, metadata, METADATA_SIGNATURE);
    let mut text = version.as_bytes().to_vec();
    text.resize(version.len().div_ceil(4) * 4 + 4, 0);
    put_u32(&mut buf, metadata + 12, text.len() as u32);
    buf[metadata + 16..metadata + 16 + text.len()].copy_from_slice(&text);

    buf
}
