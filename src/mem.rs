//! Fixed-address memory mappings.
//!
//! Everything that needs memory at a particular virtual address goes through
//! [`MapFixed`], so the loader and trainer can be exercised against a
//! heap-backed [`SandboxMapper`] as well as the real [`NixMapper`].

use nix::sys::mman::{ ProtFlags, MapFlags, mmap };
use std::num::NonZeroUsize;
use thiserror::Error;
use log::debug;

use crate::util::parse_hex;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Userspace ends at `0000_7fff_ffff_ffff`.
/// See https://www.kernel.org/doc/html/latest/arch/x86/x86_64/mm.html
pub const USER_LIMIT: usize = 0x0000_7fff_ffff_ffff;

pub const fn page_align_down(addr: usize) -> usize { addr & !PAGE_MASK }
pub const fn page_align_up(len: usize) -> usize {
    (len + PAGE_MASK) & !PAGE_MASK
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("zero-length mapping requested at {0:#x}")]
    Empty(usize),

    #[error("requested mapping {addr:#x}-{end:#x} exceeds userspace limits")]
    OutOfRange { addr: usize, end: usize },

    #[error("requested address {addr:#x} is not page-aligned")]
    Unaligned { addr: usize },

    #[error("requested address {addr:#x} is below vm.mmap_min_addr ({min:#x})")]
    BelowMinAddr { addr: usize, min: usize },

    #[error("mmap at {addr:#x} failed: {errno}")]
    Mmap { addr: usize, #[source] errno: nix::errno::Errno },

    #[error("mmap not at addr: requested {requested:#x}, got {actual:#x}")]
    Misplaced { requested: usize, actual: usize },

    #[error("requested mapping {addr:#x}-{end:#x} would replace {start:#x}-{stop:#x}, \
        which is already mapped")]
    Occupied { addr: usize, end: usize, start: usize, stop: usize },

    #[error("cannot read /proc/self/maps: {0}")]
    Maps(#[source] std::io::Error),
}

/// A region of memory that claims to live at virtual address `base`.
///
/// Real mappings are never unmapped: they live until the process exits.
/// Sandboxed mappings are backed by a heap allocation which is released
/// with the [`Mapping`].
pub struct Mapping {
    base: usize,
    len: usize,
    ptr: *mut u8,
    backing: Option<Box<[u8]>>,
}
impl Mapping {
    /// Wrap memory which is actually present at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for the rest
    /// of the process lifetime.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { base: ptr as usize, len, ptr, backing: None }
    }

    /// Create a heap-backed mapping which pretends to live at `base`.
    pub fn sandboxed(base: usize, len: usize) -> Self {
        let mut backing = vec![0u8; len].into_boxed_slice();
        let ptr = backing.as_mut_ptr();
        Self { base, len, ptr, backing: Some(backing) }
    }

    /// The virtual address of this mapping.
    pub fn base(&self) -> usize { self.base }
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn end(&self) -> usize { self.base + self.len }
    pub fn is_sandboxed(&self) -> bool { self.backing.is_some() }

    /// Returns true if `[offset, offset + len)` falls inside the mapping.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).map_or(false, |end| end <= self.len)
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Pointer to the byte at `offset` in *this* address space.
    /// For real mappings this is `base + offset`.
    pub fn host_ptr(&self, offset: usize) -> *mut u8 {
        self.ptr.wrapping_add(offset)
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.as_slice()[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.as_mut_slice()[offset..offset + 8]
            .copy_from_slice(&value.to_le_bytes());
    }
}
impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
         .field("base", &format_args!("{:#x}", self.base))
         .field("len", &format_args!("{:#x}", self.len))
         .field("sandboxed", &self.is_sandboxed())
         .finish()
    }
}

/// Implemented on things which can produce memory at a fixed address.
pub trait MapFixed {
    fn map_fixed(&mut self, addr: usize, len: usize, prot: ProtFlags)
        -> Result<Mapping, MapError>;
}

/// Request a mapping from `mapper` and check that it really landed at
/// `addr`. The length is rounded up to a whole number of pages.
pub fn map_exact<M: MapFixed>(mapper: &mut M, addr: usize, len: usize,
    prot: ProtFlags) -> Result<Mapping, MapError>
{
    if len == 0 {
        return Err(MapError::Empty(addr));
    }
    if addr & PAGE_MASK != 0 {
        return Err(MapError::Unaligned { addr });
    }
    let len = page_align_up(len);
    let end = addr.checked_add(len).unwrap_or(usize::MAX);
    if end > USER_LIMIT {
        return Err(MapError::OutOfRange { addr, end });
    }

    let mapping = mapper.map_fixed(addr, len, prot)?;
    if mapping.base() != addr {
        return Err(MapError::Misplaced {
            requested: addr, actual: mapping.base()
        });
    }
    debug!("mapped {:016x}-{:016x} {:?}", mapping.base(), mapping.end(), prot);
    Ok(mapping)
}

/// Address ranges in the contents of a `/proc/<pid>/maps` file.
pub fn parse_maps(maps: &str) -> Vec<(usize, usize)> {
    maps.lines().filter_map(|line| {
        let (start, end) = line.split_whitespace().next()?.split_once('-')?;
        Some((parse_hex(start).ok()?, parse_hex(end).ok()?))
    }).collect()
}

/// Returns true if `[start, end)` is covered by the union of `ranges`.
fn covered(ranges: &[(usize, usize)], start: usize, end: usize) -> bool {
    let mut cur = start;
    while cur < end {
        match ranges.iter().find(|(s, e)| *s <= cur && cur < *e) {
            Some((_, e)) => cur = *e,
            None => return false,
        }
    }
    true
}

/// Find the first part of `[addr, end)` which is present in `existing` but
/// was not mapped by us.
fn find_conflict(existing: &[(usize, usize)], ours: &[(usize, usize)],
    addr: usize, end: usize) -> Option<(usize, usize)>
{
    existing.iter()
        .map(|&(s, e)| (s.max(addr), e.min(end)))
        .filter(|(s, e)| s < e)
        .find(|&(s, e)| !covered(ours, s, e))
}

/// Real anonymous mappings with `MAP_FIXED`.
///
/// `MAP_FIXED` silently replaces anything already at the requested
/// address. Requests are checked against `/proc/self/maps` first, and
/// only memory previously mapped through this mapper may be replaced.
pub struct NixMapper {
    min_addr: Option<usize>,
    mapped: Vec<(usize, usize)>,
}
impl NixMapper {
    pub fn new() -> Self {
        Self {
            min_addr: crate::util::Env::mmap_min_addr().ok(),
            mapped: Vec::new(),
        }
    }

    fn check_vacant(&self, addr: usize, end: usize) -> Result<(), MapError> {
        let maps = std::fs::read_to_string("/proc/self/maps")
            .map_err(MapError::Maps)?;
        match find_conflict(&parse_maps(&maps), &self.mapped, addr, end) {
            Some((start, stop)) => {
                Err(MapError::Occupied { addr, end, start, stop })
            },
            None => Ok(()),
        }
    }
}
impl Default for NixMapper {
    fn default() -> Self { Self::new() }
}
impl MapFixed for NixMapper {
    fn map_fixed(&mut self, addr: usize, len: usize, prot: ProtFlags)
        -> Result<Mapping, MapError>
    {
        if let Some(min) = self.min_addr {
            if addr < min {
                return Err(MapError::BelowMinAddr { addr, min });
            }
        }
        let req = NonZeroUsize::new(addr);
        let len = NonZeroUsize::new(len).ok_or(MapError::Empty(addr))?;
        let end = addr.checked_add(len.get())
            .ok_or(MapError::OutOfRange { addr, end: usize::MAX })?;
        self.check_vacant(addr, end)?;
        let flag = MapFlags::MAP_ANONYMOUS
                 | MapFlags::MAP_PRIVATE
                 | MapFlags::MAP_FIXED;
        let ptr = unsafe {
            mmap(req, len, prot, flag, -1, 0)
                .map_err(|errno| MapError::Mmap { addr, errno })?
        };
        self.mapped.push((addr, end));
        Ok(unsafe { Mapping::from_raw(ptr as *mut u8, len.get()) })
    }
}

/// Heap-backed mappings which are always "placed" at the requested address.
/// Every request is recorded.
#[derive(Default)]
pub struct SandboxMapper {
    pub requests: Vec<(usize, usize, ProtFlags)>,
}
impl SandboxMapper {
    pub fn new() -> Self { Self::default() }
}
impl MapFixed for SandboxMapper {
    fn map_fixed(&mut self, addr: usize, len: usize, prot: ProtFlags)
        -> Result<Mapping, MapError>
    {
        self.requests.push((addr, len, prot));
        Ok(Mapping::sandboxed(addr, len))
    }
}
