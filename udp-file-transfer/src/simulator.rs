//! Network simulator for deterministic testing.
//!
//! Real networks drop, reorder, and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! a [`crate::socket::Socket`] can carry a [`Simulator`] that decides the
//! fate of every outbound segment:
//!
//! | Fault            | Description                                          |
//! |------------------|------------------------------------------------------|
//! | Packet loss      | Drop a segment with probability `loss_rate`.         |
//! | Reordering       | Delay a segment by `reorder_delay`, letting later    |
//! |                  | segments overtake it.                                |
//! | Duplication      | Deliver a segment twice.                             |
//! | Startup loss     | Drop the first `drop_first` segments sent.           |
//! | Targeted loss    | Drop the first transmission of chosen data seqs.     |
//!
//! All randomness comes from a `StdRng` seeded with `seed`, so a failing
//! test replays identically.

use std::collections::HashSet;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::Segment;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`; values outside are
/// clamped.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given segment is silently dropped.
    pub loss_rate: f64,
    /// Probability that a segment is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a segment is held back by `reorder_delay`.
    pub reorder_rate: f64,
    pub reorder_delay: Duration,
    /// Number of segments (of any kind) dropped at start-up.
    pub drop_first: usize,
    /// Data sequence numbers whose first transmission is dropped.
    pub drop_once: Vec<u32>,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::from_millis(20),
            drop_first: 0,
            drop_once: Vec::new(),
            seed: 0,
        }
    }
}

/// What happens to one outbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Drop,
    Deliver { copies: u8, delay: Option<Duration> },
}

/// Counters of injected faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub dropped: u64,
    pub duplicated: u64,
    pub delayed: u64,
}

#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    seen: usize,
    pending_drops: HashSet<u32>,
    stats: SimulatorStats,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let pending_drops = config.drop_once.iter().copied().collect();
        Self {
            config,
            rng,
            seen: 0,
            pending_drops,
            stats: SimulatorStats::default(),
        }
    }

    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }

    /// Decide the fate of `segment`.
    pub fn plan(&mut self, segment: &Segment) -> Fate {
        self.seen += 1;
        if self.seen <= self.config.drop_first {
            self.stats.dropped += 1;
            return Fate::Drop;
        }
        if segment.is_data() && self.pending_drops.remove(&segment.header.seq) {
            self.stats.dropped += 1;
            return Fate::Drop;
        }
        if self.chance(self.config.loss_rate) {
            self.stats.dropped += 1;
            return Fate::Drop;
        }
        let copies = if self.chance(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };
        let delay = if self.chance(self.config.reorder_rate) {
            self.stats.delayed += 1;
            Some(self.config.reorder_delay)
        } else {
            None
        };
        Fate::Deliver { copies, delay }
    }

    fn chance(&mut self, p: f64) -> bool {
        let p = p.clamp(0.0, 1.0);
        p > 0.0 && self.rng.random_bool(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    const CLEAN: Fate = Fate::Deliver {
        copies: 1,
        delay: None,
    };

    #[test]
    fn default_is_pass_through() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        for seq in 0..100 {
            assert_eq!(sim.plan(&Segment::data(seq, 0, vec![1])), CLEAN);
        }
        assert_eq!(sim.stats(), SimulatorStats::default());
    }

    #[test]
    fn drop_first_counts_every_segment() {
        let mut sim = Simulator::new(SimulatorConfig {
            drop_first: 2,
            ..SimulatorConfig::default()
        });
        let syn = Segment::control(1, 0, flags::SYN, 0);
        assert_eq!(sim.plan(&syn), Fate::Drop);
        assert_eq!(sim.plan(&syn), Fate::Drop);
        assert_eq!(sim.plan(&syn), CLEAN);
        assert_eq!(sim.stats().dropped, 2);
    }

    #[test]
    fn drop_once_hits_only_first_transmission_of_data() {
        let mut sim = Simulator::new(SimulatorConfig {
            drop_once: vec![3],
            ..SimulatorConfig::default()
        });
        // Control segment with the same seq is not targeted.
        assert_eq!(sim.plan(&Segment::control(3, 0, flags::ACK, 0)), CLEAN);
        assert_eq!(sim.plan(&Segment::data(3, 0, vec![0])), Fate::Drop);
        assert_eq!(sim.plan(&Segment::data(3, 0, vec![0])), CLEAN);
    }

    #[test]
    fn same_seed_same_decisions() {
        let cfg = SimulatorConfig {
            loss_rate: 0.3,
            duplicate_rate: 0.2,
            reorder_rate: 0.2,
            seed: 42,
            ..SimulatorConfig::default()
        };
        let mut a = Simulator::new(cfg.clone());
        let mut b = Simulator::new(cfg);
        for seq in 0..200 {
            let seg = Segment::data(seq, 0, vec![0]);
            assert_eq!(a.plan(&seg), b.plan(&seg));
        }
        assert!(a.stats().dropped > 0);
    }

    #[test]
    fn certain_loss_drops_everything() {
        let mut sim = Simulator::new(SimulatorConfig {
            loss_rate: 1.5,
            ..SimulatorConfig::default()
        });
        for seq in 0..10 {
            assert_eq!(sim.plan(&Segment::data(seq, 0, vec![0])), Fate::Drop);
        }
    }
}
