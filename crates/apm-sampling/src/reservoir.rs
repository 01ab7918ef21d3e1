//! Fixed-size weighted reservoir sampling.
//!
//! A-Res scheme: every offered item draws the key `u^(1/w)` for a uniform
//! `u`, and the reservoir retains the `k` largest keys seen this interval.
//! Equal keys break ties lexicographically by trace id so repeated runs over
//! the same randomness are deterministic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
struct Entry {
    key: f64,
    trace_id: String,
}

impl Entry {
    fn beats(&self, other: &Entry) -> bool {
        match self.key.partial_cmp(&other.key) {
            Some(std::cmp::Ordering::Greater) => true,
            Some(std::cmp::Ordering::Less) => false,
            _ => self.trace_id < other.trace_id,
        }
    }
}

/// A bounded random-admission sampler over one flush interval's trace roots.
#[derive(Debug)]
pub struct WeightedReservoir {
    capacity: usize,
    entries: Vec<Entry>,
    rng: StdRng,
}

impl WeightedReservoir {
    pub fn new(capacity: usize) -> Self {
        WeightedReservoir {
            capacity: capacity.max(1),
            entries: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        WeightedReservoir {
            capacity: capacity.max(1),
            entries: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offers a trace id with the given weight; heavier items are more
    /// likely to be retained. Returns whether the item currently sits in
    /// the reservoir.
    pub fn offer(&mut self, trace_id: &str, weight: f64) -> bool {
        let weight = if weight > 0.0 { weight } else { f64::MIN_POSITIVE };
        let uniform: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let entry = Entry {
            key: uniform.powf(1.0 / weight),
            trace_id: trace_id.to_owned(),
        };

        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return true;
        }
        let weakest = self
            .entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                if a.beats(b) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Less
                }
            })
            .map(|(index, _)| index);
        if let Some(index) = weakest {
            if entry.beats(&self.entries[index]) {
                self.entries[index] = entry;
                return true;
            }
        }
        false
    }

    /// Empties the reservoir, returning the retained trace ids.
    pub fn drain(&mut self) -> Vec<String> {
        self.entries.drain(..).map(|entry| entry.trace_id).collect()
    }

    /// Adjusts the capacity for the next interval; surplus entries are
    /// dropped weakest-first.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            let weakest = self
                .entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    if a.beats(b) {
                        std::cmp::Ordering::Greater
                    } else {
                        std::cmp::Ordering::Less
                    }
                })
                .map(|(index, _)| index);
            if let Some(index) = weakest {
                self.entries.swap_remove(index);
            }
        }
    }
}
