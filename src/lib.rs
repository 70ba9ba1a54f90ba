//! Branch-target injection across two processes.
//!
//! An attacker maps a copy of the victim's executable at the victim's load
//! address ([`image`]), points the copy's indirect call at a planted `ret`
//! ([`trainer`]) and calls it in a loop. The victim's own call through the
//! same virtual address is then speculatively redirected to a gadget which
//! encodes a secret byte into the cache ([`channel`]), and the victim reads
//! it back with Flush+Reload ([`recover`]).

pub mod mem;
pub mod elf;
pub mod util;
pub mod gadget;
pub mod image;
pub mod trainer;
pub mod timing;
pub mod channel;
pub mod victim;
pub mod recover;
pub mod stats;
pub mod calibrate;
pub mod layout;

pub use crate::mem::{ MapFixed, MapError, Mapping, NixMapper, SandboxMapper };
pub use crate::util::*;
pub use crate::gadget::Gadget;
pub use crate::image::{ Image, ImageError, LoadError, DEFAULT_PIE_BASE };
pub use crate::trainer::{ GotChain, TrainerError };
pub use crate::timing::*;
pub use crate::channel::Channel;
pub use crate::victim::*;
pub use crate::recover::*;
pub use crate::calibrate::{ calibrate, Calibration };
pub use crate::layout::{ ImageLayout, LayoutError };
