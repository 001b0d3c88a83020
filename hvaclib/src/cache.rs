//! Per-board state cache: ring buffers of AI/DO/PMIC/calibration values.
//!
//! The serial worker writes board responses here; the logic loop and the
//! server dispatcher read copies out under the worker's lock. All
//! operations are O(1). Every entry carries a monotonic timestamp so
//! consumers can distinguish a fresh reading from a stale one.
//!
//! An AI channel can be *forced*: while forced, newly arriving samples for
//! that channel re-stamp the forced value instead of storing the live
//! reading, and the force persists across ring rotations until explicitly
//! cleared.

use std::fmt;

use crate::error::CacheError;

/// Number of analog input channels on a board.
pub const AI_COUNT: usize = 8;

/// Number of digital output bits on a board.
pub const DO_COUNT: usize = 4;

/// Depth of the state rings.
pub const STATE_BUFFER_DEPTH: usize = 1;

/// Monotonic timestamp attached to every cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stamp {
    /// Seconds of the monotonic clock.
    pub secs: i64,
    /// Nanosecond remainder.
    pub nanos: i64,
}

impl Stamp {
    /// Reads the monotonic clock.
    pub fn now() -> Self {
        match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Self {
                secs: ts.tv_sec(),
                nanos: ts.tv_nsec(),
            },
            Err(_) => Self::default(),
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.secs, self.nanos)
    }
}

/// A 16-bit cache entry (AI reading, calibration value, boot count).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheEntry16 {
    /// When the value was cached.
    pub stamp: Stamp,
    /// Raw board value.
    pub value: u16,
}

impl CacheEntry16 {
    /// A freshly stamped entry.
    pub fn new(value: u16) -> Self {
        Self {
            stamp: Stamp::now(),
            value,
        }
    }

    /// Serializes to the wire text form `[<secs>.<nsec>:<value>]`.
    pub fn to_wire(self) -> String {
        format!("[{}:{}]", self.stamp, self.value)
    }

    /// Parses the wire text form.
    pub fn from_wire(text: &str) -> Option<Self> {
        let (stamp, value) = parse_wire(text)?;
        Some(Self {
            stamp,
            value: value.parse().ok()?,
        })
    }
}

/// An 8-bit cache entry (DO bits, PMIC bits).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheEntry8 {
    /// When the value was cached.
    pub stamp: Stamp,
    /// Raw board value.
    pub value: u8,
}

impl CacheEntry8 {
    /// A freshly stamped entry.
    pub fn new(value: u8) -> Self {
        Self {
            stamp: Stamp::now(),
            value,
        }
    }

    /// Serializes to the wire text form `[<secs>.<nsec>:<value>]`.
    pub fn to_wire(self) -> String {
        format!("[{}:{}]", self.stamp, self.value)
    }

    /// Parses the wire text form.
    pub fn from_wire(text: &str) -> Option<Self> {
        let (stamp, value) = parse_wire(text)?;
        Some(Self {
            stamp,
            value: value.parse().ok()?,
        })
    }
}

fn parse_wire(text: &str) -> Option<(Stamp, &str)> {
    let body = text.strip_prefix('[')?.strip_suffix(']')?;
    let (stamp_text, value_text) = body.split_once(':')?;
    let (secs, nanos) = stamp_text.split_once('.')?;
    Some((
        Stamp {
            secs: secs.parse().ok()?,
            nanos: nanos.parse().ok()?,
        },
        value_text,
    ))
}

/// Ring-buffered snapshot state for one IO board.
#[derive(Debug, Clone)]
pub struct BoardStateCache {
    ai: Vec<[CacheEntry16; AI_COUNT]>,
    do_state: Vec<CacheEntry8>,
    pmic: Vec<CacheEntry8>,
    cal_l1: Vec<[CacheEntry16; AI_COUNT]>,
    cal_l2: Vec<[CacheEntry16; AI_COUNT]>,
    ai_idx: usize,
    do_idx: usize,
    pmic_idx: usize,
    l1_idx: usize,
    l2_idx: usize,
    boot_count: u16,
    forced: [bool; AI_COUNT],
}

impl Default for BoardStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardStateCache {
    /// A cache with the standard ring depth.
    pub fn new() -> Self {
        Self::with_depth(STATE_BUFFER_DEPTH)
    }

    /// A cache with an explicit ring depth (test use).
    pub fn with_depth(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            ai: vec![[CacheEntry16::default(); AI_COUNT]; depth],
            do_state: vec![CacheEntry8::default(); depth],
            pmic: vec![CacheEntry8::default(); depth],
            cal_l1: vec![[CacheEntry16::default(); AI_COUNT]; depth],
            cal_l2: vec![[CacheEntry16::default(); AI_COUNT]; depth],
            ai_idx: 0,
            do_idx: 0,
            pmic_idx: 0,
            l1_idx: 0,
            l2_idx: 0,
            boot_count: 0,
            forced: [false; AI_COUNT],
        }
    }

    fn depth(&self) -> usize {
        self.ai.len()
    }

    fn prev(&self, idx: usize) -> usize {
        (idx + self.depth() - 1) % self.depth()
    }

    fn check_channel(channel: usize) -> Result<(), CacheError> {
        if channel >= AI_COUNT {
            return Err(CacheError::ChannelOutOfRange {
                channel,
                limit: AI_COUNT,
            });
        }
        Ok(())
    }

    /// Stores one AI sample.
    ///
    /// A forced channel keeps its forced value and only its timestamp is
    /// refreshed. The ring cursor advances only after the last channel,
    /// so a full 8-channel sweep moves the head exactly once.
    ///
    /// # Errors
    ///
    /// [`CacheError::ChannelOutOfRange`] for channels >= [`AI_COUNT`].
    pub fn add_ai(&mut self, channel: usize, value: u16) -> Result<(), CacheError> {
        Self::check_channel(channel)?;

        if self.forced[channel] {
            let held = self.ai[self.prev(self.ai_idx)][channel].value;
            self.ai[self.ai_idx][channel] = CacheEntry16::new(held);
        } else {
            self.ai[self.ai_idx][channel] = CacheEntry16::new(value);
        }

        if channel == AI_COUNT - 1 {
            self.ai_idx = (self.ai_idx + 1) % self.depth();
        }

        Ok(())
    }

    /// Stores a DO bit snapshot.
    pub fn add_do(&mut self, value: u8) {
        self.do_state[self.do_idx] = CacheEntry8::new(value);
        self.do_idx = (self.do_idx + 1) % self.depth();
    }

    /// Stores a PMIC bit snapshot.
    pub fn add_pmic(&mut self, value: u8) {
        self.pmic[self.pmic_idx] = CacheEntry8::new(value);
        self.pmic_idx = (self.pmic_idx + 1) % self.depth();
    }

    /// Stores one L1 calibration value.
    ///
    /// # Errors
    ///
    /// [`CacheError::ChannelOutOfRange`] for channels >= [`AI_COUNT`].
    pub fn add_cal_l1(&mut self, channel: usize, value: u16) -> Result<(), CacheError> {
        Self::check_channel(channel)?;
        self.cal_l1[self.l1_idx][channel] = CacheEntry16::new(value);
        if channel == AI_COUNT - 1 {
            self.l1_idx = (self.l1_idx + 1) % self.depth();
        }
        Ok(())
    }

    /// Stores one L2 calibration value.
    ///
    /// # Errors
    ///
    /// [`CacheError::ChannelOutOfRange`] for channels >= [`AI_COUNT`].
    pub fn add_cal_l2(&mut self, channel: usize, value: u16) -> Result<(), CacheError> {
        Self::check_channel(channel)?;
        self.cal_l2[self.l2_idx][channel] = CacheEntry16::new(value);
        if channel == AI_COUNT - 1 {
            self.l2_idx = (self.l2_idx + 1) % self.depth();
        }
        Ok(())
    }

    /// Overrides `channel` with `value` until [`Self::unforce_ai`].
    ///
    /// The value lands in the slot behind the write cursor so the next
    /// read observes it immediately. Returns `false` when the channel was
    /// already forced (the existing force is kept).
    ///
    /// # Errors
    ///
    /// [`CacheError::ChannelOutOfRange`] for channels >= [`AI_COUNT`].
    pub fn force_ai(&mut self, channel: usize, value: u16) -> Result<bool, CacheError> {
        Self::check_channel(channel)?;

        if self.forced[channel] {
            return Ok(false);
        }

        let slot = self.prev(self.ai_idx);
        self.ai[slot][channel] = CacheEntry16::new(value);
        self.forced[channel] = true;
        Ok(true)
    }

    /// Clears the force on `channel`; returns `false` if it was not forced.
    ///
    /// # Errors
    ///
    /// [`CacheError::ChannelOutOfRange`] for channels >= [`AI_COUNT`].
    pub fn unforce_ai(&mut self, channel: usize) -> Result<bool, CacheError> {
        Self::check_channel(channel)?;

        if !self.forced[channel] {
            return Ok(false);
        }

        self.forced[channel] = false;
        Ok(true)
    }

    /// Whether `channel` is currently forced.
    pub fn is_forced(&self, channel: usize) -> bool {
        channel < AI_COUNT && self.forced[channel]
    }

    /// Latest full AI sweep (the slot behind the write cursor).
    pub fn latest_ai(&self) -> [CacheEntry16; AI_COUNT] {
        self.ai[self.prev(self.ai_idx)]
    }

    /// Latest DO snapshot.
    pub fn latest_do(&self) -> CacheEntry8 {
        self.do_state[self.prev(self.do_idx)]
    }

    /// Latest PMIC snapshot.
    pub fn latest_pmic(&self) -> CacheEntry8 {
        self.pmic[self.prev(self.pmic_idx)]
    }

    /// Latest L1 calibration sweep.
    pub fn latest_cal_l1(&self) -> [CacheEntry16; AI_COUNT] {
        self.cal_l1[self.prev(self.l1_idx)]
    }

    /// Latest L2 calibration sweep.
    pub fn latest_cal_l2(&self) -> [CacheEntry16; AI_COUNT] {
        self.cal_l2[self.prev(self.l2_idx)]
    }

    /// The whole AI ring, oldest sweep first.
    pub fn ai_ring(&self) -> Vec<[CacheEntry16; AI_COUNT]> {
        let depth = self.depth();
        (0..depth)
            .map(|offset| self.ai[(self.ai_idx + offset) % depth])
            .collect()
    }

    /// Board boot counter as last reported.
    pub fn boot_count(&self) -> u16 {
        self.boot_count
    }

    /// Records the board boot counter.
    pub fn set_boot_count(&mut self, value: u16) {
        self.boot_count = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(cache: &mut BoardStateCache, base: u16) {
        for ch in 0..AI_COUNT {
            cache.add_ai(ch, base + ch as u16).unwrap();
        }
    }

    #[test]
    fn test_ring_advances_once_per_full_sweep() {
        let mut cache = BoardStateCache::with_depth(4);
        assert_eq!(cache.ai_idx, 0);

        // Seven writes: cursor stays put.
        for ch in 0..AI_COUNT - 1 {
            cache.add_ai(ch, 1).unwrap();
        }
        assert_eq!(cache.ai_idx, 0);

        // The eighth write advances exactly once.
        cache.add_ai(AI_COUNT - 1, 1).unwrap();
        assert_eq!(cache.ai_idx, 1);

        sweep(&mut cache, 10);
        assert_eq!(cache.ai_idx, 2);
    }

    #[test]
    fn test_latest_ai_reads_behind_cursor() {
        let mut cache = BoardStateCache::with_depth(2);
        sweep(&mut cache, 100);

        let latest = cache.latest_ai();
        for (ch, entry) in latest.iter().enumerate() {
            assert_eq!(entry.value, 100 + ch as u16);
        }
    }

    #[test]
    fn test_force_persists_across_rotations() {
        let mut cache = BoardStateCache::with_depth(2);
        sweep(&mut cache, 0);

        assert!(cache.force_ai(3, 2048).unwrap());
        assert_eq!(cache.latest_ai()[3].value, 2048);

        // Live sweeps keep the forced value with a fresh stamp.
        sweep(&mut cache, 500);
        assert_eq!(cache.latest_ai()[3].value, 2048);
        sweep(&mut cache, 700);
        assert_eq!(cache.latest_ai()[3].value, 2048);
        assert_eq!(cache.latest_ai()[4].value, 704);

        // Unforce: the next sweep reports live values again.
        assert!(cache.unforce_ai(3).unwrap());
        sweep(&mut cache, 900);
        assert_eq!(cache.latest_ai()[3].value, 903);
    }

    #[test]
    fn test_double_force_and_unforce_report_false() {
        let mut cache = BoardStateCache::new();
        assert!(cache.force_ai(0, 1).unwrap());
        assert!(!cache.force_ai(0, 2).unwrap());
        assert!(cache.unforce_ai(0).unwrap());
        assert!(!cache.unforce_ai(0).unwrap());
    }

    #[test]
    fn test_channel_out_of_range() {
        let mut cache = BoardStateCache::new();
        assert!(matches!(
            cache.add_ai(AI_COUNT, 0),
            Err(CacheError::ChannelOutOfRange { channel: 8, .. })
        ));
        assert!(cache.force_ai(99, 0).is_err());
    }

    #[test]
    fn test_do_and_pmic_latest() {
        let mut cache = BoardStateCache::new();
        cache.add_do(0x05);
        cache.add_pmic(0x03);
        assert_eq!(cache.latest_do().value, 0x05);
        assert_eq!(cache.latest_pmic().value, 0x03);
    }

    #[test]
    fn test_wire_round_trip() {
        let entry = CacheEntry16::new(4095);
        let parsed = CacheEntry16::from_wire(&entry.to_wire()).unwrap();
        assert_eq!(parsed, entry);

        let entry8 = CacheEntry8::new(0x0F);
        let parsed8 = CacheEntry8::from_wire(&entry8.to_wire()).unwrap();
        assert_eq!(parsed8, entry8);
    }
}
