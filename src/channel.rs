//! The cache channel: one probe slot per possible byte value.

use crate::timing::TimingPrimitives;

/// Number of slots, one for every byte value.
pub const NUM_SLOTS: usize = 256;

/// Distance between two slots. Much larger than a cache line so that
/// neighbouring slots never share a line and the stride prefetcher has
/// nothing useful to latch on to.
pub const STRIDE: usize = 1024;

/// Probe order for the slots: `i -> (i * 167 + 13) mod 256`.
///
/// Probing the slots linearly trains the hardware prefetcher, which then
/// pulls in lines that were never touched by the victim. 167 is odd, so
/// this is a fixed permutation of 0..=255.
#[inline(always)]
pub const fn mix(i: usize) -> usize {
    ((i * 167) + 13) & 0xff
}

/// `256 * STRIDE` bytes on the heap.
///
/// Keeping the channel in the heap rather than in `.bss` matters: with some
/// loaders the `.bss` placement behaves as if `clflush`/`mfence` did
/// nothing, and every slot always hits.
pub struct Channel {
    buf: Box<[u8]>,
}
impl Channel {
    pub fn new() -> Self {
        Self { buf: vec![0u8; NUM_SLOTS * STRIDE].into_boxed_slice() }
    }

    pub fn as_ptr(&self) -> *const u8 { self.buf.as_ptr() }

    /// Address of the slot for byte value `i`.
    pub fn slot(&self, i: usize) -> *const u8 {
        assert!(i < NUM_SLOTS);
        self.buf[i * STRIDE..].as_ptr()
    }

    fn slot_mut(&mut self, i: usize) -> *mut u8 {
        assert!(i < NUM_SLOTS);
        self.buf[i * STRIDE..].as_mut_ptr()
    }

    /// Store to slot `i`, bringing it into the cache.
    pub fn touch<T: TimingPrimitives>(&mut self, timing: &T, i: usize) {
        let p = self.slot_mut(i);
        unsafe { timing.store(p, 1); }
    }

    /// Touch every slot.
    pub fn reset<T: TimingPrimitives>(&mut self, timing: &T) {
        for i in 0..NUM_SLOTS {
            self.touch(timing, i);
        }
    }

    /// Evict slot `i`.
    pub fn flush_slot<T: TimingPrimitives>(&self, timing: &T, i: usize) {
        unsafe { timing.flush(self.slot(i)); }
    }

    /// Evict every slot, then fence.
    pub fn flush<T: TimingPrimitives>(&self, timing: &T) {
        for i in 0..NUM_SLOTS {
            self.flush_slot(timing, i);
        }
        timing.fence();
    }

    /// Time a load from slot `i`.
    pub fn timed_read<T: TimingPrimitives>(&self, timing: &T, i: usize) -> u64 {
        unsafe { timing.timed_load(self.slot(i)) }
    }
}
impl Default for Channel {
    fn default() -> Self { Self::new() }
}
