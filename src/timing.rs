//! Cache maintenance and timing primitives.
//!
//! The recoverer only ever talks to the cache through [`TimingPrimitives`].
//! [`X86Timing`] issues the real instructions; [`SimulatedCache`] models a
//! cache as a set of resident lines, for running the recovery logic
//! somewhere the timing channel doesn't exist (or in tests).

use std::cell::{ Cell, RefCell };
use std::collections::HashSet;
use std::rc::Rc;

use rand::{ Rng, SeedableRng };
use rand::rngs::StdRng;

/// Flush, fence and timed-load primitives for one target architecture.
pub trait TimingPrimitives {
    /// Store `val` at `addr`.
    ///
    /// # Safety
    /// `addr` must be valid for writes.
    unsafe fn store(&self, addr: *mut u8, val: u8);

    /// Evict the line containing `addr` from every level of the cache.
    ///
    /// # Safety
    /// `addr` must be mapped.
    unsafe fn flush(&self, addr: *const u8);

    /// Serialize all outstanding memory operations.
    fn fence(&self);

    /// Load from `addr` and return the number of elapsed cycles.
    ///
    /// # Safety
    /// `addr` must be valid for reads.
    unsafe fn timed_load(&self, addr: *const u8) -> u64;
}

impl <T: TimingPrimitives + ?Sized> TimingPrimitives for Rc<T> {
    unsafe fn store(&self, addr: *mut u8, val: u8) { (**self).store(addr, val) }
    unsafe fn flush(&self, addr: *const u8) { (**self).flush(addr) }
    fn fence(&self) { (**self).fence() }
    unsafe fn timed_load(&self, addr: *const u8) -> u64 {
        (**self).timed_load(addr)
    }
}

impl <T: TimingPrimitives + ?Sized> TimingPrimitives for &T {
    unsafe fn store(&self, addr: *mut u8, val: u8) { (**self).store(addr, val) }
    unsafe fn flush(&self, addr: *const u8) { (**self).flush(addr) }
    fn fence(&self) { (**self).fence() }
    unsafe fn timed_load(&self, addr: *const u8) -> u64 {
        (**self).timed_load(addr)
    }
}


/// CLFLUSH, MFENCE/LFENCE and RDTSC.
#[cfg(target_arch = "x86_64")]
#[derive(Clone, Copy, Debug, Default)]
pub struct X86Timing;

#[cfg(target_arch = "x86_64")]
impl TimingPrimitives for X86Timing {
    unsafe fn store(&self, addr: *mut u8, val: u8) {
        core::ptr::write_volatile(addr, val);
    }

    unsafe fn flush(&self, addr: *const u8) {
        core::arch::x86_64::_mm_clflush(addr);
    }

    fn fence(&self) {
        unsafe { core::arch::x86_64::_mm_mfence(); }
    }

    unsafe fn timed_load(&self, addr: *const u8) -> u64 {
        use core::arch::x86_64::{ _mm_lfence, _mm_mfence, _rdtsc };
        _mm_lfence();
        let start = _rdtsc();
        _mm_lfence();
        let _ = core::ptr::read_volatile(addr);
        // The load must complete before the timer is read again
        _mm_mfence();
        _mm_lfence();
        let end = _rdtsc();
        _mm_lfence();
        end.wrapping_sub(start)
    }
}


/// A cache model: a set of resident 64-byte lines.
///
/// Loads of resident lines take `hit` cycles, everything else takes `miss`
/// cycles (and makes the line resident). Optionally, a fraction of misses
/// are reported as hits to model measurement noise.
pub struct SimulatedCache {
    lines: RefCell<HashSet<usize>>,
    hit: u64,
    miss: u64,
    noise: Option<(RefCell<StdRng>, f64)>,
    loads: Cell<usize>,
}
impl SimulatedCache {
    pub const LINE_SIZE: usize = 64;
    pub const DEFAULT_HIT: u64 = 40;
    pub const DEFAULT_MISS: u64 = 300;

    pub fn new() -> Self {
        Self::with_latencies(Self::DEFAULT_HIT, Self::DEFAULT_MISS)
    }

    pub fn with_latencies(hit: u64, miss: u64) -> Self {
        Self {
            lines: RefCell::new(HashSet::new()),
            hit,
            miss,
            noise: None,
            loads: Cell::new(0),
        }
    }

    /// Report a miss as a hit with probability `rate`.
    pub fn with_noise(mut self, seed: u64, rate: f64) -> Self {
        self.noise = Some((RefCell::new(StdRng::seed_from_u64(seed)), rate));
        self
    }

    fn line(addr: *const u8) -> usize {
        addr as usize & !(Self::LINE_SIZE - 1)
    }

    /// Make the line containing `addr` resident without timing it.
    pub fn touch(&self, addr: *const u8) {
        self.lines.borrow_mut().insert(Self::line(addr));
    }

    pub fn is_cached(&self, addr: *const u8) -> bool {
        self.lines.borrow().contains(&Self::line(addr))
    }

    /// Number of resident lines.
    pub fn resident(&self) -> usize { self.lines.borrow().len() }

    /// Number of timed loads performed so far.
    pub fn loads(&self) -> usize { self.loads.get() }

    fn spurious_hit(&self) -> bool {
        match &self.noise {
            Some((rng, rate)) => rng.borrow_mut().gen_bool(*rate),
            None => false,
        }
    }
}
impl Default for SimulatedCache {
    fn default() -> Self { Self::new() }
}

impl TimingPrimitives for SimulatedCache {
    unsafe fn store(&self, addr: *mut u8, _val: u8) {
        self.touch(addr);
    }

    unsafe fn flush(&self, addr: *const u8) {
        self.lines.borrow_mut().remove(&Self::line(addr));
    }

    fn fence(&self) {}

    unsafe fn timed_load(&self, addr: *const u8) -> u64 {
        self.loads.set(self.loads.get() + 1);
        let resident = !self.lines.borrow_mut().insert(Self::line(addr));
        if resident || self.spurious_hit() { self.hit } else { self.miss }
    }
}
