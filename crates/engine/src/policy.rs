//! Policy gate for inbound transfer requests.

use std::collections::{BTreeSet, HashMap};

use remotedrop_transfer::TransferRequest;

/// Immutable view of the policy state used for one evaluation.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub max_file_size: u64,
    /// Lowercased extensions including the leading dot.
    pub allowed_extensions: BTreeSet<String>,
    pub auto_approval_enabled: bool,
    /// Persisted decisions keyed by request id.
    pub remembered_decisions: HashMap<String, bool>,
}

/// Outcome of the policy gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    AutoAllow,
    AutoDeny(String),
    Prompt,
}

/// Evaluates a request against the policy. First match wins; deny rules
/// run before auto-approval so a permissive default never admits unsafe
/// types or oversized payloads.
pub fn evaluate(request: &TransferRequest, policy: &PolicySnapshot) -> PolicyDecision {
    if let Some(approved) = policy.remembered_decisions.get(&request.id) {
        return if *approved {
            PolicyDecision::AutoAllow
        } else {
            PolicyDecision::AutoDeny("remembered".into())
        };
    }

    if !policy.allowed_extensions.contains(&request.extension()) {
        return PolicyDecision::AutoDeny("extension not allowed".into());
    }

    if request.file_size == 0 || request.file_size > policy.max_file_size {
        return PolicyDecision::AutoDeny("size out of range".into());
    }

    if policy.auto_approval_enabled {
        return PolicyDecision::AutoAllow;
    }

    PolicyDecision::Prompt
}
