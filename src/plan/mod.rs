//! Operation plans: a DAG of phases driven by the FSM executor.

pub mod builder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ops::{DnsConfig, OperationType, Server};

/// Phase id addressing the whole plan.
pub const ROOT_PHASE: &str = "/";

/// A unit of the plan.
///
/// Non-leaf phases model grouping: a parent is complete iff all of its
/// children are complete. Leaf phases are executable and resolve through the
/// phase registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Slash-separated path, e.g. `/masters/node-1/install`
    pub id: String,
    /// Registry key of the executor implementing this phase
    pub executor: String,
    /// Hostname of the server this phase runs on; empty means
    /// orchestrator-local
    #[serde(default)]
    pub node_ref: Option<String>,
    /// Ids of phases that must complete before this one may start
    #[serde(default)]
    pub requires: Vec<String>,
    /// Executor-specific payload
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub phases: Vec<Phase>,
}

impl Phase {
    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty()
    }

    fn visit<'a>(&'a self, out: &mut Vec<&'a Phase>) {
        out.push(self);
        for child in &self.phases {
            child.visit(out);
        }
    }
}

/// Execution status of a single phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    RolledBack,
    Failed,
}

impl PhaseStatus {
    /// Valid transitions; `force` re-enters a failed phase.
    pub fn can_transition(self, to: PhaseStatus, force: bool) -> bool {
        use PhaseStatus::*;
        match (self, to) {
            (Pending, InProgress) => true,
            (InProgress, Completed) | (InProgress, Failed) => true,
            (Completed, RolledBack) => true,
            // A rolled back phase may be executed again.
            (RolledBack, InProgress) => true,
            (Failed, InProgress) => force,
            // Idempotent re-execution after an interrupted run.
            (InProgress, InProgress) => true,
            _ => false,
        }
    }
}

/// Persisted state of a single phase. The union of phase states is the
/// resumable state of the operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PhaseState {
    pub fn new(phase_id: impl Into<String>, status: PhaseStatus) -> PhaseState {
        PhaseState {
            phase_id: phase_id.into(),
            status,
            updated_at: Utc::now(),
            error: None,
        }
    }
}

/// DAG of phases comprising an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPlan {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub account_id: String,
    pub cluster_name: String,
    pub servers: Vec<Server>,
    pub dns_config: DnsConfig,
    pub phases: Vec<Phase>,
}

impl OperationPlan {
    /// All phases in pre-order.
    pub fn all_phases(&self) -> Vec<&Phase> {
        let mut out = Vec::new();
        for phase in &self.phases {
            phase.visit(&mut out);
        }
        out
    }

    /// Executable leaf phases in pre-order.
    pub fn leaves(&self) -> Vec<&Phase> {
        self.all_phases()
            .into_iter()
            .filter(|phase| phase.is_leaf())
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&Phase> {
        self.all_phases().into_iter().find(|phase| phase.id == id)
    }

    /// Leaf ids in the subtree rooted at `id` (the phase itself if a leaf).
    pub fn leaf_ids_under(&self, id: &str) -> Vec<String> {
        match self.find(id) {
            Some(phase) => {
                let mut out = Vec::new();
                phase.visit(&mut out);
                out.into_iter()
                    .filter(|p| p.is_leaf())
                    .map(|p| p.id.clone())
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Leaves paired with their effective dependencies: a leaf inherits the
    /// `requires` of every ancestor group in addition to its own.
    pub fn leaves_with_requires(&self) -> Vec<(&Phase, Vec<String>)> {
        fn walk<'a>(
            phase: &'a Phase,
            inherited: &[String],
            out: &mut Vec<(&'a Phase, Vec<String>)>,
        ) {
            let mut requires = inherited.to_vec();
            for dep in &phase.requires {
                if !requires.contains(dep) {
                    requires.push(dep.clone());
                }
            }
            if phase.is_leaf() {
                out.push((phase, requires));
            } else {
                for child in &phase.phases {
                    walk(child, &requires, out);
                }
            }
        }
        let mut out = Vec::new();
        for phase in &self.phases {
            walk(phase, &[], &mut out);
        }
        out
    }

    /// The server a phase is bound to, if any.
    pub fn server_for(&self, phase: &Phase) -> Option<&Server> {
        let hostname = phase.node_ref.as_deref()?;
        self.servers.iter().find(|s| s.hostname == hostname)
    }

    /// Validates the well-formedness invariants: unique ids, every
    /// dependency referring to a phase earlier in pre-order (which also
    /// rules out cycles), and every leaf naming an executor.
    pub fn validate(&self) -> Result<()> {
        let phases = self.all_phases();
        let mut seen: Vec<&str> = Vec::with_capacity(phases.len());
        for phase in &phases {
            if seen.contains(&phase.id.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "duplicate phase id {:?}",
                    phase.id
                )));
            }
            for dep in &phase.requires {
                if !seen.contains(&dep.as_str()) {
                    return Err(Error::invalid_argument(format!(
                        "phase {:?} depends on {:?} which does not precede it",
                        phase.id, dep
                    )));
                }
            }
            if phase.is_leaf() && phase.executor.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "leaf phase {:?} has no executor",
                    phase.id
                )));
            }
            seen.push(&phase.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str, requires: &[&str]) -> Phase {
        Phase {
            id: id.to_string(),
            executor: "noop".to_string(),
            node_ref: None,
            requires: requires.iter().map(|s| s.to_string()).collect(),
            data: None,
            phases: Vec::new(),
        }
    }

    fn sample_plan(phases: Vec<Phase>) -> OperationPlan {
        OperationPlan {
            operation_id: "op-1".to_string(),
            operation_type: OperationType::Install,
            account_id: "system".to_string(),
            cluster_name: "example.com".to_string(),
            servers: Vec::new(),
            dns_config: DnsConfig::default(),
            phases,
        }
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let plan = sample_plan(vec![leaf("/a", &["/b"]), leaf("/b", &[])]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let plan = sample_plan(vec![leaf("/a", &[]), leaf("/a", &[])]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_leaves_under_group() {
        let group = Phase {
            id: "/masters".to_string(),
            executor: String::new(),
            node_ref: None,
            requires: vec![],
            data: None,
            phases: vec![leaf("/masters/node-1", &[]), leaf("/masters/node-2", &[])],
        };
        let plan = sample_plan(vec![group]);
        assert!(plan.validate().is_ok());
        assert_eq!(
            plan.leaf_ids_under("/masters"),
            vec!["/masters/node-1", "/masters/node-2"]
        );
    }

    #[test]
    fn test_phase_status_transitions() {
        use PhaseStatus::*;
        assert!(Pending.can_transition(InProgress, false));
        assert!(InProgress.can_transition(Completed, false));
        assert!(InProgress.can_transition(Failed, false));
        assert!(Completed.can_transition(RolledBack, false));
        assert!(!Failed.can_transition(InProgress, false));
        assert!(Failed.can_transition(InProgress, true));
        assert!(!Completed.can_transition(InProgress, true));
    }
}
