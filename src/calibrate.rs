//! Picking a hit/miss threshold for the cache channel on this machine.

use log::info;

use crate::channel::*;
use crate::stats::*;
use crate::timing::TimingPrimitives;

/// Observed cache-hit and cache-miss latencies for channel slots.
#[derive(Clone, Debug)]
pub struct Calibration {
    pub hit: RawResults,
    pub miss: RawResults,
    /// Midpoint between the median hit and median miss latency.
    pub threshold: u64,
}

/// Time `samples` loads from a freshly-touched slot and `samples` loads from
/// a freshly-flushed slot, cycling through the slots in probe order.
///
/// Returns `None` when there is nothing to measure, or when hits are not
/// faster than misses.
pub fn calibrate<T: TimingPrimitives>(timing: &T, channel: &mut Channel,
    samples: usize) -> Option<Calibration>
{
    let mut hit = RawResults::new();
    let mut miss = RawResults::new();
    for i in 0..samples {
        let s = mix(i % NUM_SLOTS);

        channel.touch(timing, s);
        timing.fence();
        hit.push(channel.timed_read(timing, s));

        channel.flush_slot(timing, s);
        timing.fence();
        miss.push(channel.timed_read(timing, s));
    }

    let (h, m) = (hit.get_median()?, miss.get_median()?);
    if h >= m {
        return None;
    }
    let threshold = (h + m) / 2;
    info!("calibration: hit median {} (min {}), miss median {} (min {}), threshold {}",
        h, hit.get_min().unwrap_or(h), m, miss.get_min().unwrap_or(m), threshold);
    Some(Calibration { hit, miss, threshold })
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::timing::SimulatedCache;

    #[test]
    fn simulated_midpoint() {
        let cache = SimulatedCache::new();
        let mut ch = Channel::new();
        let c = calibrate(&cache, &mut ch, 1000).unwrap();
        assert_eq!(c.hit.len(), 1000);
        assert_eq!(c.miss.len(), 1000);
        assert_eq!(c.hit.get_max(), Some(SimulatedCache::DEFAULT_HIT));
        assert_eq!(c.miss.get_min(), Some(SimulatedCache::DEFAULT_MISS));
        assert_eq!(c.threshold, 170);
    }

    #[test]
    fn custom_latencies() {
        let cache = SimulatedCache::with_latencies(100, 180);
        let mut ch = Channel::new();
        assert_eq!(calibrate(&cache, &mut ch, 16).unwrap().threshold, 140);
    }

    #[test]
    fn no_difference_means_no_threshold() {
        let cache = SimulatedCache::with_latencies(200, 200);
        let mut ch = Channel::new();
        assert!(calibrate(&cache, &mut ch, 64).is_none());
        assert!(calibrate(&SimulatedCache::new(), &mut ch, 0).is_none());
    }
}
