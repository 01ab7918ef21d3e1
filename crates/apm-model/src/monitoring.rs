//! Process-wide monitoring registries.
//!
//! Registries hold named counters and gauges grouped under a dotted
//! namespace such as `apm-server.sampling.tail`. They are created once per
//! process and reused on pipeline restarts: looking up a registry or an
//! instrument that already exists returns the existing instance, so
//! re-registration is always a no-op rather than an error. Instruments are
//! plain atomics and safe to update from any task.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

lazy_static! {
    static ref REGISTRIES: RwLock<HashMap<String, Arc<Registry>>> = RwLock::new(HashMap::new());
}

/// Returns the registry with the given name, creating it on first use.
pub fn registry(name: &str) -> Arc<Registry> {
    if let Some(existing) = REGISTRIES.read().expect("registry table poisoned").get(name) {
        return Arc::clone(existing);
    }
    let mut table = REGISTRIES.write().expect("registry table poisoned");
    Arc::clone(
        table
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Registry::new(name))),
    )
}

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge holding the most recently observed value.
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

enum Instrument {
    Counter(Counter),
    Gauge(Gauge),
}

/// A named group of instruments.
pub struct Registry {
    name: String,
    instruments: RwLock<HashMap<String, Instrument>>,
}

impl Registry {
    fn new(name: &str) -> Self {
        Registry {
            name: name.to_owned(),
            instruments: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the counter with the given name, registering it on first use.
    /// If the name is already registered as a gauge, a fresh detached counter
    /// is returned so callers keep working; its values are not exported.
    pub fn counter(&self, name: &str) -> Counter {
        let mut instruments = self.instruments.write().expect("instrument table poisoned");
        match instruments
            .entry(name.to_owned())
            .or_insert_with(|| Instrument::Counter(Counter::default()))
        {
            Instrument::Counter(counter) => counter.clone(),
            Instrument::Gauge(_) => Counter::default(),
        }
    }

    /// Returns the gauge with the given name, registering it on first use.
    pub fn gauge(&self, name: &str) -> Gauge {
        let mut instruments = self.instruments.write().expect("instrument table poisoned");
        match instruments
            .entry(name.to_owned())
            .or_insert_with(|| Instrument::Gauge(Gauge::default()))
        {
            Instrument::Gauge(gauge) => gauge.clone(),
            Instrument::Counter(_) => Gauge::default(),
        }
    }

    /// Snapshot of every instrument's current value, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let instruments = self.instruments.read().expect("instrument table poisoned");
        instruments
            .iter()
            .map(|(name, instrument)| {
                let value = match instrument {
                    Instrument::Counter(c) => c.get() as i64,
                    Instrument::Gauge(g) => g.get(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}
