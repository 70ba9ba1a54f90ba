//! Loading an executable image at a fixed virtual address.

use std::fs::File;
use std::path::{ Path, PathBuf };

use iced_x86::{ Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter };
use log::{ debug, info };
use memmap2::Mmap;
use nix::sys::mman::ProtFlags;
use thiserror::Error;

use crate::elf::{ self, ElfError };
use crate::gadget::Gadget;
use crate::mem::*;
use crate::victim::VictimFn;

/// Default base address for position-independent executables when ASLR
/// is disabled.
pub const DEFAULT_PIE_BASE: usize = 0x0000_5555_5555_4000;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("open {}: {source}", .path.display())]
    Open { path: PathBuf, source: std::io::Error },

    #[error("mmap {}: {source}", .path.display())]
    MapFile { path: PathBuf, source: std::io::Error },

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Elf(#[from] ElfError),
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("{len:#x} bytes at offset {offset:#x} fall outside the {size:#x}-byte image")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("cannot assemble gadget '{gadget}': {msg}")]
    Assemble { gadget: Gadget, msg: String },

    #[error("image at {base:#x} is not backed by executable memory")]
    NotExecutable { base: usize },
}

/// A copy of an on-disk image, mapped read/write/execute at a fixed base.
pub struct Image {
    mapping: Mapping,
    path: Option<PathBuf>,
}
impl Image {
    fn prot() -> ProtFlags {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC
    }

    /// Map the file at `path` at virtual address `base`.
    ///
    /// ELF executables are laid out by their PT_LOAD segments, so that
    /// image-relative offsets are virtual-address offsets from the first
    /// loaded page. Anything else is copied verbatim. `size` overrides the
    /// length of the mapping; bytes which don't fit are dropped and bytes
    /// with no file contents are zero.
    pub fn load<M: MapFixed>(mapper: &mut M, path: impl AsRef<Path>,
        base: usize, size: Option<usize>) -> Result<Self, LoadError>
    {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| {
            LoadError::Open { path: path.to_path_buf(), source }
        })?;
        let src = unsafe { Mmap::map(&file) }.map_err(|source| {
            LoadError::MapFile { path: path.to_path_buf(), source }
        })?;

        let mut image = if elf::is_elf(&src) {
            Self::from_elf(mapper, &src, base, size)?
        } else {
            Self::from_bytes(mapper, &src, base, size)?
        };
        image.path = Some(path.to_path_buf());
        info!("loaded {} at {:016x}-{:016x}",
            path.display(), image.base(), image.end());
        Ok(image)
    }

    /// Map a copy of `bytes` at virtual address `base`.
    pub fn from_bytes<M: MapFixed>(mapper: &mut M, bytes: &[u8],
        base: usize, size: Option<usize>) -> Result<Self, MapError>
    {
        let size = size.unwrap_or(bytes.len());
        let mut mapping = map_exact(mapper, base, size, Self::prot())?;
        let n = size.min(bytes.len());
        mapping.as_mut_slice()[..n].copy_from_slice(&bytes[..n]);
        debug!("copied {:#x} bytes into image at {:016x}", n, base);
        Ok(Self { mapping, path: None })
    }

    /// Map the PT_LOAD segments of the ELF executable in `bytes`, with the
    /// first loaded page at virtual address `base`.
    pub fn from_elf<M: MapFixed>(mapper: &mut M, bytes: &[u8],
        base: usize, size: Option<usize>) -> Result<Self, LoadError>
    {
        let segs = elf::load_segments(bytes)?;
        let first = segs.iter().map(|s| s.vaddr as usize).min().unwrap_or(0);
        let first = page_align_down(first);
        let span = segs.iter()
            .map(|s| (s.vaddr as usize).saturating_add(s.mem_size as usize))
            .max()
            .unwrap_or(first) - first;

        let size = size.unwrap_or(span);
        let mut mapping = map_exact(mapper, base, size, Self::prot())?;
        let dst = mapping.as_mut_slice();
        for seg in segs.iter() {
            let off = seg.vaddr as usize - first;
            if off >= dst.len() {
                continue;
            }
            let n = (seg.file_size as usize).min(dst.len() - off);
            let src = seg.file_off as usize;
            dst[off..off + n].copy_from_slice(&bytes[src..src + n]);
            debug!("segment {:#x} bytes at file {:#x} -> {:016x}{}",
                n, src, base + off, if seg.is_exec() { " (x)" } else { "" });
        }
        Ok(Self { mapping, path: None })
    }

    pub fn base(&self) -> usize { self.mapping.base() }
    pub fn len(&self) -> usize { self.mapping.len() }
    pub fn is_empty(&self) -> bool { self.mapping.is_empty() }
    pub fn end(&self) -> usize { self.mapping.end() }
    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }

    /// Virtual address of an image-relative offset inside the image.
    pub fn addr_of(&self, offset: usize) -> Result<usize, ImageError> {
        self.check(offset, 0)?;
        Ok(self.base() + offset)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), ImageError> {
        if self.mapping.contains(offset, len) {
            Ok(())
        } else {
            Err(ImageError::OutOfBounds { offset, len, size: self.len() })
        }
    }

    /// Read `len` bytes at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], ImageError> {
        self.check(offset, len)?;
        Ok(&self.mapping.as_slice()[offset..offset + len])
    }

    /// Overwrite bytes at `offset`.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ImageError> {
        self.check(offset, bytes.len())?;
        self.mapping.as_mut_slice()[offset..offset + bytes.len()]
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) -> Result<(), ImageError> {
        self.patch(offset, &value.to_le_bytes())
    }

    /// Fill `len` bytes at `offset` with `nop`.
    pub fn nop(&mut self, offset: usize, len: usize) -> Result<(), ImageError> {
        self.check(offset, len)?;
        self.mapping.as_mut_slice()[offset..offset + len].fill(0x90);
        Ok(())
    }

    /// Write `gadget` over the code at `offset`.
    pub fn plant(&mut self, offset: usize, gadget: Gadget) -> Result<(), ImageError> {
        let bytes = gadget.assemble().map_err(|e| {
            ImageError::Assemble { gadget, msg: e.to_string() }
        })?;
        self.patch(offset, &bytes)?;
        debug!("planted '{}' at {:016x}", gadget, self.base() + offset);
        Ok(())
    }

    /// Return a function pointer to the code at `offset`.
    ///
    /// # Safety
    /// The bytes at `offset` must be a function with the [`VictimFn`]
    /// signature, and every absolute or RIP-relative reference it makes
    /// must resolve to mapped memory.
    pub unsafe fn entry(&self, offset: usize) -> Result<VictimFn, ImageError> {
        self.check(offset, 1)?;
        if self.mapping.is_sandboxed() {
            return Err(ImageError::NotExecutable { base: self.base() });
        }
        Ok(std::mem::transmute::<*mut u8, VictimFn>(self.mapping.host_ptr(offset)))
    }

    /// Disassemble at most `max_inst` instructions starting at `offset`.
    pub fn disas(&self, offset: usize, max_inst: usize)
        -> Result<Vec<String>, ImageError>
    {
        self.check(offset, 1)?;
        let buf  = &self.mapping.as_slice()[offset..];
        let addr = (self.base() + offset) as u64;

        let mut decoder = Decoder::with_ip(64, buf, addr, DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        formatter.options_mut().set_digit_separator("_");
        let mut output = String::new();
        let mut instr  = Instruction::default();

        let mut res = Vec::new();
        while decoder.can_decode() && res.len() < max_inst {
            decoder.decode_out(&mut instr);
            output.clear();
            formatter.format(&instr, &mut output);

            let start_idx = (instr.ip() - addr) as usize;
            let instr_bytes = &buf[start_idx..start_idx + instr.len()];
            let mut bytestr = String::new();
            for b in instr_bytes.iter() {
                bytestr.push_str(&format!("{:02x}", b));
            }
            res.push(format!("{:016x}: {:24} {}", instr.ip(), bytestr, output));
        }
        Ok(res)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    const BASE: usize = DEFAULT_PIE_BASE;

    fn sample() -> Vec<u8> {
        (0..0x1800).map(|i| (i & 0xff) as u8).collect()
    }

    #[test]
    fn loads_at_requested_base() {
        let mut mapper = SandboxMapper::new();
        let img = Image::from_bytes(&mut mapper, &sample(), BASE, Some(0x2000))
            .unwrap();
        assert_eq!(img.base(), BASE);
        assert_eq!(img.len(), 0x2000);
        assert_eq!(mapper.requests.len(), 1);
        assert_eq!(mapper.requests[0].0, BASE);
        assert!(mapper.requests[0].2.contains(ProtFlags::PROT_EXEC));

        // Copied prefix, zeroed tail
        assert_eq!(img.read(0x17ff, 1).unwrap(), &[0xff]);
        assert_eq!(img.read(0x1800, 4).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn truncates_to_size() {
        let mut mapper = SandboxMapper::new();
        let img = Image::from_bytes(&mut mapper, &sample(), BASE, Some(0x10))
            .unwrap();
        assert_eq!(img.len(), 0x1000);
        assert_eq!(img.read(0, 0x10).unwrap(), &sample()[..0x10]);
        assert_eq!(img.read(0x10, 1).unwrap(), &[0]);
    }

    #[test]
    fn patch_then_read() {
        let mut mapper = SandboxMapper::new();
        let mut img = Image::from_bytes(&mut mapper, &sample(), BASE, None)
            .unwrap();
        for (off, bytes) in [
            (0usize, &b"\xc3"[..]),
            (0x1149, &b"\x90\x90\xc3"[..]),
            (0x1ff8, &b"ABCDEFGH"[..]),
        ] {
            img.patch(off, bytes).unwrap();
            assert_eq!(img.read(off, bytes.len()).unwrap(), bytes);
        }
        img.put_u64(0x100, 0x5555_5555_5149).unwrap();
        assert_eq!(img.read(0x100, 8).unwrap(), &0x5555_5555_5149u64.to_le_bytes());
    }

    #[test]
    fn patch_out_of_bounds() {
        let mut mapper = SandboxMapper::new();
        let mut img = Image::from_bytes(&mut mapper, &sample(), BASE, None)
            .unwrap();
        let before = img.read(0, img.len()).unwrap().to_vec();
        assert!(matches!(img.patch(0x1ffc, b"ABCDEFGH"),
            Err(ImageError::OutOfBounds { offset: 0x1ffc, len: 8, size: 0x2000 })));
        assert!(img.nop(0x2000, 1).is_err());
        assert!(img.read(usize::MAX, 2).is_err());
        assert_eq!(img.read(0, img.len()).unwrap(), &before[..]);
    }

    #[test]
    fn plant_and_disassemble() {
        let mut mapper = SandboxMapper::new();
        let mut img = Image::from_bytes(&mut mapper, &[0xcc; 0x40], BASE, None)
            .unwrap();
        img.nop(0x10, 2).unwrap();
        img.plant(0x12, Gadget::Ret).unwrap();
        let lines = img.disas(0x10, 3).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0000555555554010"));
        assert!(lines[0].ends_with("nop"));
        assert!(lines[2].ends_with("ret"));
    }

    #[test]
    fn sandboxed_image_has_no_entry() {
        let mut mapper = SandboxMapper::new();
        let img = Image::from_bytes(&mut mapper, &[0xc3], BASE, None).unwrap();
        let res = unsafe { img.entry(0) };
        assert!(matches!(res, Err(ImageError::NotExecutable { .. })));
    }

    #[test]
    fn load_from_disk() {
        let path = std::env::temp_dir()
            .join(format!("bti-image-{}.bin", std::process::id()));
        std::fs::write(&path, sample()).unwrap();
        let mut mapper = SandboxMapper::new();
        let img = Image::load(&mut mapper, &path, BASE, None).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(img.base(), BASE);
        assert_eq!(img.path(), Some(path.as_path()));
        assert_eq!(img.read(0, 0x1800).unwrap(), &sample()[..]);

        let missing = Image::load(&mut mapper, "/nonexistent/bti-victim",
            BASE, None);
        assert!(matches!(missing, Err(LoadError::Open { .. })));
    }

    #[test]
    fn elf_segments_land_at_their_vaddr() {
        // File offsets and virtual addresses disagree by a page
        let code = [0x41, 0x54, 0x53, 0x50, 0xc3];
        let bytes = crate::elf::test::build(&[
            (0x0000, 0x0000, &[], 0x40, 4),
            (0x2150, 0x1150, &code, code.len() as u64, 5),
            (0x4e00, 0x1e00, &[0xaa; 8], 0x300, 6),
        ]);
        let mut mapper = SandboxMapper::new();
        let img = Image::from_elf(&mut mapper, &bytes, BASE, None).unwrap();
        assert_eq!(img.len(), 0x6000);
        assert_eq!(img.read(0x2150, code.len()).unwrap(), &code);
        assert_ne!(img.read(0x1150, code.len()).unwrap(), &code);
        assert_eq!(img.read(0x4e00, 8).unwrap(), &[0xaa; 8]);
        // Zero-filled up to the memory size
        assert!(img.read(0x4e08, 0x2f8).unwrap().iter().all(|b| *b == 0));

        let small = Image::from_elf(&mut mapper, &bytes, BASE, Some(0x3000))
            .unwrap();
        assert_eq!(small.len(), 0x3000);
        assert_eq!(small.read(0x2150, code.len()).unwrap(), &code);
    }

    #[test]
    fn load_detects_elf() {
        let bytes = crate::elf::test::build(&[(0x1000, 0x100, &[0xc3], 1, 5)]);
        let path = std::env::temp_dir()
            .join(format!("bti-elf-{}.bin", std::process::id()));
        std::fs::write(&path, &bytes).unwrap();
        let mut mapper = SandboxMapper::new();
        let img = Image::load(&mut mapper, &path, BASE, None).unwrap();
        std::fs::remove_file(&path).unwrap();
        // The first loaded page is at the base
        assert_eq!(img.len(), 0x1000);
        assert_eq!(img.read(0, 1).unwrap(), &[0xc3]);
    }

    #[test]
    fn addr_of_stays_inside() {
        let mut mapper = SandboxMapper::new();
        let img = Image::from_bytes(&mut mapper, &sample(), BASE, None).unwrap();
        assert_eq!(img.addr_of(0x1149).unwrap(), BASE + 0x1149);
        assert_eq!(img.addr_of(0x2000).unwrap(), BASE + 0x2000);
        assert!(img.addr_of(0x2001).is_err());
        assert!(img.addr_of(usize::MAX).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn own_executable_matches_running_code() {
        let layout = crate::layout::ImageLayout::current().unwrap();
        let mut mapper = SandboxMapper::new();
        let img = Image::load(&mut mapper, "/proc/self/exe", BASE, None).unwrap();

        let victim = crate::victim::bti_victim as usize as *const u8;
        let running = unsafe { std::slice::from_raw_parts(victim, 16) };
        assert_eq!(img.read(layout.victim, 16).unwrap(), running);

        let gadget = crate::victim::bti_gadget as usize as *const u8;
        let running = unsafe { std::slice::from_raw_parts(gadget, 16) };
        assert_eq!(img.read(layout.gadget, 16).unwrap(), running);
        assert!(img.len() > layout.target);
    }
}
