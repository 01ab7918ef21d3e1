//! Sampling policies and first-match selection.

use apm_model::{Event, Outcome};

/// Criteria a trace root is matched against. Unset fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyCriteria {
    pub service_name: Option<String>,
    pub service_environment: Option<String>,
    pub trace_name: Option<String>,
    pub trace_outcome: Option<Outcome>,
}

impl PolicyCriteria {
    /// True when every set criterion matches the trace's root transaction.
    pub fn matches(&self, root: &Event) -> bool {
        if let Some(name) = &self.service_name {
            if *name != root.service.name {
                return false;
            }
        }
        if let Some(environment) = &self.service_environment {
            if *environment != root.service.environment {
                return false;
            }
        }
        let (trace_name, trace_outcome) = match &root.transaction {
            Some(tx) => (tx.name.as_str(), tx.outcome),
            None => ("", Outcome::Unknown),
        };
        if let Some(name) = &self.trace_name {
            if name != trace_name {
                return false;
            }
        }
        if let Some(outcome) = self.trace_outcome {
            if outcome != trace_outcome {
                return false;
            }
        }
        true
    }
}

/// A sampling rule: the first policy whose criteria match a trace root
/// determines the trace's target sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub criteria: PolicyCriteria,
    /// Fraction of matching traces to keep, in `[0, 1]`.
    pub sample_rate: f64,
}

/// Returns the index and sample rate of the first matching policy, or
/// `None` when no policy matches.
pub fn match_policy(policies: &[Policy], root: &Event) -> Option<(usize, f64)> {
    policies
        .iter()
        .position(|policy| policy.criteria.matches(root))
        .map(|index| (index, policies[index].sample_rate))
}
