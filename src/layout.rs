//! Where the running executable and its interesting symbols live.

use std::path::{ Path, PathBuf };
use thiserror::Error;

use crate::util::parse_hex;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("cannot read {path}: {source}")]
    Io { path: &'static str, source: std::io::Error },

    #[error("no mapping of {} found in /proc/self/maps", .0.display())]
    NotMapped(PathBuf),
}

/// The load base of an image, and image-relative offsets of the gadget,
/// the victim function and the indirect call's target slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageLayout {
    pub base: usize,
    pub gadget: usize,
    pub victim: usize,
    pub target: usize,
}
impl ImageLayout {
    /// Find the lowest mapping of `exe` with file offset 0 in the contents
    /// of a `/proc/<pid>/maps` file.
    pub fn parse_base(maps: &str, exe: &Path) -> Option<usize> {
        maps.lines().filter_map(|line| {
            let mut fields = line.split_whitespace();
            let range  = fields.next()?;
            let _perms = fields.next()?;
            let offset = fields.next()?;
            let _dev   = fields.next()?;
            let _inode = fields.next()?;
            let path   = fields.next()?;
            if Path::new(path) != exe || parse_hex(offset).ok()? != 0 {
                return None;
            }
            parse_hex(range.split('-').next()?).ok()
        }).min()
    }

    /// Layout of the running executable.
    #[cfg(target_arch = "x86_64")]
    pub fn current() -> Result<Self, LayoutError> {
        const MAPS: &str = "/proc/self/maps";
        const EXE: &str = "/proc/self/exe";
        let exe = std::fs::read_link(EXE)
            .map_err(|source| LayoutError::Io { path: EXE, source })?;
        let maps = std::fs::read_to_string(MAPS)
            .map_err(|source| LayoutError::Io { path: MAPS, source })?;
        let base = Self::parse_base(&maps, &exe)
            .ok_or(LayoutError::NotMapped(exe))?;
        let (gadget, victim, target) = crate::victim::CallSite::offsets(base);
        Ok(Self { base, gadget, victim, target })
    }
}
impl std::fmt::Display for ImageLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "image base {:#x}, gadget +{:#x}, victim +{:#x}, target +{:#x}",
            self.base, self.gadget, self.victim, self.target)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    const MAPS: &str = "\
555555554000-555555555000 r--p 00000000 fd:01 1049123                    /home/user/bti-victim
555555555000-555555556000 r-xp 00001000 fd:01 1049123                    /home/user/bti-victim
555555556000-555555557000 r--p 00002000 fd:01 1049123                    /home/user/bti-victim
555555557000-555555559000 rw-p 00002000 fd:01 1049123                    /home/user/bti-victim
555555559000-55555557a000 rw-p 00000000 00:00 0                          [heap]
7ffff7d80000-7ffff7da8000 r--p 00000000 fd:01 2228303                    /usr/lib/x86_64-linux-gnu/libc.so.6
7ffffffde000-7ffffffff000 rw-p 00000000 00:00 0                          [stack]
";

    #[test]
    fn finds_executable_base() {
        let exe = Path::new("/home/user/bti-victim");
        assert_eq!(ImageLayout::parse_base(MAPS, exe), Some(0x5555_5555_4000));

        let libc = Path::new("/usr/lib/x86_64-linux-gnu/libc.so.6");
        assert_eq!(ImageLayout::parse_base(MAPS, libc), Some(0x7fff_f7d8_0000));
    }

    #[test]
    fn ignores_anonymous_and_other_files() {
        assert_eq!(ImageLayout::parse_base(MAPS, Path::new("/bin/true")), None);
        assert_eq!(ImageLayout::parse_base(MAPS, Path::new("0")), None);
        assert_eq!(ImageLayout::parse_base("", Path::new("/bin/true")), None);
        assert_eq!(ImageLayout::parse_base("garbage\n\n", Path::new("garbage")), None);
    }

    #[test]
    fn display() {
        let l = ImageLayout { base: 0x5555_5555_4000, gadget: 0x1149,
            victim: 0x1160, target: 0x3fd8 };
        assert_eq!(l.to_string(),
            "image base 0x555555554000, gadget +0x1149, victim +0x1160, target +0x3fd8");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn current_process() {
        let l = ImageLayout::current().unwrap();
        assert_eq!(l.base & 0xfff, 0);
        assert_eq!(l.base + l.victim, crate::victim::bti_victim as usize);
        assert_eq!(l.base + l.target,
            &crate::victim::BTI_TARGET as *const _ as usize);
    }
}
