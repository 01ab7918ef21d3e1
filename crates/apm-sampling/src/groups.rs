//! Per-policy, per-service trace groups.
//!
//! Each (policy, service) pair observed within a flush interval owns a
//! weighted reservoir and an ingest-rate estimate. Boundary sample rates
//! resolve synchronously; fractional rates collect trace roots until the
//! interval's finalize pass drains the reservoirs. The group table is
//! LRU-capped: quiet services are evicted once `max_dynamic_services`
//! distinct (policy, service) pairs exist, and their pending traces are left
//! to expire via the storage TTL.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::debug;

use apm_model::Event;

use crate::ewma::IngestRateEstimate;
use crate::policy::{match_policy, Policy};
use crate::reservoir::WeightedReservoir;

/// Reservoir capacity used until the ingest-rate estimate is primed.
const MIN_RESERVOIR_SIZE: usize = 1000;

/// Outcome of offering a trace root to its sampling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    /// Keep the trace; decided synchronously (sample rate 1.0).
    Sampled,
    /// Drop the trace; decided synchronously (sample rate 0.0).
    Unsampled,
    /// Still observing; resolved by the next finalize pass.
    Pending,
}

/// Trace ids decided by one finalize pass.
#[derive(Debug, Default)]
pub struct FinalizedDecisions {
    pub sampled: Vec<String>,
    pub unsampled: Vec<String>,
}

pub struct TraceGroupsConfig {
    pub policies: Vec<Policy>,
    /// Rate applied when no policy matches.
    pub default_sample_rate: f64,
    pub max_dynamic_services: usize,
    pub flush_interval: Duration,
    pub ingest_rate_decay_factor: f64,
}

struct ServiceGroup {
    sample_rate: f64,
    reservoir: WeightedReservoir,
    ingest_rate: IngestRateEstimate,
    /// Roots observed this interval, in arrival order.
    observed: Vec<String>,
    last_used: u64,
}

/// The sampling state shared by all traces a node observes locally.
pub struct TraceGroups {
    config: TraceGroupsConfig,
    groups: HashMap<(usize, String), ServiceGroup>,
    clock: u64,
}

impl TraceGroups {
    pub fn new(config: TraceGroupsConfig) -> Self {
        TraceGroups {
            config,
            groups: HashMap::new(),
            clock: 0,
        }
    }

    /// Number of live (policy, service) groups.
    pub fn dynamic_service_count(&self) -> usize {
        self.groups.len()
    }

    /// Offers a trace root for sampling under the first matching policy.
    pub fn observe_root(&mut self, root: &Event) -> AdmitDecision {
        let (policy_index, sample_rate) = match match_policy(&self.config.policies, root) {
            Some(found) => found,
            None => (self.config.policies.len(), self.config.default_sample_rate),
        };
        if sample_rate >= 1.0 {
            return AdmitDecision::Sampled;
        }
        if sample_rate <= 0.0 {
            return AdmitDecision::Unsampled;
        }
        let Some(trace_id) = &root.trace_id else {
            return AdmitDecision::Unsampled;
        };

        self.clock += 1;
        let clock = self.clock;
        let key = (policy_index, root.service.name.clone());
        if !self.groups.contains_key(&key) {
            self.evict_if_full();
            let decay = self.config.ingest_rate_decay_factor;
            self.groups.insert(
                key.clone(),
                ServiceGroup {
                    sample_rate,
                    reservoir: WeightedReservoir::new(MIN_RESERVOIR_SIZE),
                    ingest_rate: IngestRateEstimate::new(decay),
                    observed: Vec::new(),
                    last_used: clock,
                },
            );
        }
        if let Some(group) = self.groups.get_mut(&key) {
            group.last_used = clock;
            group.observed.push(trace_id.clone());
            group.reservoir.offer(trace_id, 1.0);
        }
        AdmitDecision::Pending
    }

    /// Drains every group's reservoir: retained roots become sampled, the
    /// interval's remaining observed roots become unsampled, and reservoirs
    /// are resized from the refreshed ingest-rate estimates.
    pub fn finalize(&mut self) -> FinalizedDecisions {
        let interval = self.config.flush_interval;
        let mut decisions = FinalizedDecisions::default();
        for group in self.groups.values_mut() {
            let total = group.observed.len() as u64;
            let winners = group.reservoir.drain();
            let retained: HashSet<&str> = winners.iter().map(String::as_str).collect();
            for trace_id in group.observed.drain(..) {
                if !retained.contains(trace_id.as_str()) {
                    decisions.unsampled.push(trace_id);
                }
            }
            decisions.sampled.extend(winners);

            let rate = group.ingest_rate.observe_interval(total, interval);
            let capacity =
                (rate * group.sample_rate * interval.as_secs_f64()).ceil() as usize;
            group.reservoir.resize(capacity.max(1));
        }
        decisions
    }

    fn evict_if_full(&mut self) {
        if self.groups.len() < self.config.max_dynamic_services {
            return;
        }
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            debug!(service = %key.1, "evicting least recently used sampling group");
            self.groups.remove(&key);
        }
    }
}
