//! Just enough of ELF64 to find the loadable segments of an executable.

use thiserror::Error;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELF64_HDR_SIZE: usize = 64;
pub const ELF64_PHDR_SIZE: usize = 56;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const PT_LOAD: u32 = 1;
pub const PF_X: u32 = 0x1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ElfError {
    #[error("not a little-endian ELF64 file")]
    Unsupported,

    #[error("truncated ELF: {what} at {off:#x}+{len:#x} is past the end of the file ({size:#x})")]
    Truncated { what: &'static str, off: usize, len: usize, size: usize },

    #[error("program header entry size {0} is too small")]
    BadPhentsize(usize),

    #[error("segment at {vaddr:#x} has a file size larger than its memory size")]
    BadSegment { vaddr: u64 },

    #[error("no PT_LOAD segments")]
    NoSegments,
}

/// A PT_LOAD program header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub mem_size: u64,
    pub file_off: u64,
    pub file_size: u64,
    pub flags: u32,
}
impl Segment {
    pub fn is_exec(&self) -> bool { self.flags & PF_X != 0 }
}

/// Returns true if `bytes` starts with the ELF magic.
pub fn is_elf(bytes: &[u8]) -> bool {
    bytes.starts_with(&ELF_MAGIC)
}

fn field<const N: usize>(bytes: &[u8], off: usize, what: &'static str)
    -> Result<[u8; N], ElfError>
{
    let end = off.checked_add(N);
    match end.and_then(|end| bytes.get(off..end)) {
        Some(s) => {
            let mut res = [0u8; N];
            res.copy_from_slice(s);
            Ok(res)
        },
        None => Err(ElfError::Truncated { what, off, len: N, size: bytes.len() }),
    }
}
fn u16_at(b: &[u8], off: usize, what: &'static str) -> Result<u16, ElfError> {
    Ok(u16::from_le_bytes(field(b, off, what)?))
}
fn u32_at(b: &[u8], off: usize, what: &'static str) -> Result<u32, ElfError> {
    Ok(u32::from_le_bytes(field(b, off, what)?))
}
fn u64_at(b: &[u8], off: usize, what: &'static str) -> Result<u64, ElfError> {
    Ok(u64::from_le_bytes(field(b, off, what)?))
}

/// Parse the PT_LOAD segments of an ELF64 image, in program header order.
///
/// The file contents of every segment are checked to be inside `bytes`.
pub fn load_segments(bytes: &[u8]) -> Result<Vec<Segment>, ElfError> {
    if !is_elf(bytes) || bytes.len() < ELF64_HDR_SIZE {
        return Err(ElfError::Unsupported);
    }
    if bytes[4] != ELFCLASS64 || bytes[5] != ELFDATA2LSB {
        return Err(ElfError::Unsupported);
    }

    let phoff = u64_at(bytes, 0x20, "e_phoff")? as usize;
    let phentsize = u16_at(bytes, 0x36, "e_phentsize")? as usize;
    let phnum = u16_at(bytes, 0x38, "e_phnum")? as usize;
    if phentsize < ELF64_PHDR_SIZE {
        return Err(ElfError::BadPhentsize(phentsize));
    }

    let mut res = Vec::new();
    for i in 0..phnum {
        let ph = phoff.checked_add(i * phentsize)
            .filter(|ph| ph.checked_add(phentsize).map_or(false, |end| end <= bytes.len()))
            .ok_or(ElfError::Truncated {
                what: "program header", off: phoff, len: phentsize, size: bytes.len()
            })?;
        if u32_at(bytes, ph, "p_type")? != PT_LOAD {
            continue;
        }
        let seg = Segment {
            flags:     u32_at(bytes, ph + 0x04, "p_flags")?,
            file_off:  u64_at(bytes, ph + 0x08, "p_offset")?,
            vaddr:     u64_at(bytes, ph + 0x10, "p_vaddr")?,
            file_size: u64_at(bytes, ph + 0x20, "p_filesz")?,
            mem_size:  u64_at(bytes, ph + 0x28, "p_memsz")?,
        };
        if seg.file_size > seg.mem_size {
            return Err(ElfError::BadSegment { vaddr: seg.vaddr });
        }
        let (off, len) = (seg.file_off as usize, seg.file_size as usize);
        if off.checked_add(len).map_or(true, |end| end > bytes.len()) {
            return Err(ElfError::Truncated {
                what: "segment", off, len, size: bytes.len()
            });
        }
        res.push(seg);
    }
    if res.is_empty() {
        return Err(ElfError::NoSegments);
    }
    Ok(res)
}
