//! Durable store for operations, plans and phase states.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ops::backend::Backend;
use crate::ops::{Cluster, Operation, OperationState};
use crate::plan::{OperationPlan, PhaseState, PhaseStatus};

/// Typed view over the key-value backend.
///
/// The store is the single serialization point for phase states: all writes
/// go through atomic single-key updates on the backend.
#[derive(Clone)]
pub struct OperationStore {
    backend: Arc<dyn Backend>,
}

fn operation_key(id: &str) -> String {
    format!("operations/{}/operation.json", id)
}

fn plan_key(id: &str) -> String {
    format!("operations/{}/plan.json", id)
}

fn phase_key(id: &str, phase_id: &str) -> String {
    // Phase ids are absolute slash paths, e.g. `/masters/node-1/install`.
    format!("operations/{}/phases{}.json", id, phase_id)
}

fn log_key(id: &str) -> String {
    format!("operations/{}/log", id)
}

impl OperationStore {
    pub fn new(backend: Arc<dyn Backend>) -> OperationStore {
        OperationStore { backend }
    }

    pub async fn put_cluster(&self, cluster: &Cluster) -> Result<()> {
        let value = serde_json::to_vec_pretty(cluster)?;
        self.backend.put("cluster.json", value).await
    }

    pub async fn get_cluster(&self) -> Result<Cluster> {
        let data = self.backend.get("cluster.json").await.map_err(|err| {
            match err {
                Error::NotFound(_) => Error::not_found("no cluster created yet"),
                other => other,
            }
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let value = serde_json::to_vec_pretty(operation)?;
        self.backend
            .put_if_absent(&operation_key(&operation.id), value)
            .await
            .map_err(|err| match err {
                Error::AlreadyExists(_) => {
                    Error::already_exists(format!("operation {}", operation.id))
                }
                other => other,
            })
    }

    pub async fn get_operation(&self, id: &str) -> Result<Operation> {
        let data = self.backend.get(&operation_key(id)).await.map_err(|err| {
            match err {
                Error::NotFound(_) => Error::not_found(format!("operation {}", id)),
                other => other,
            }
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// All operations in the store, newest first.
    pub async fn list_operations(&self) -> Result<Vec<Operation>> {
        let keys = self.backend.list("operations").await?;
        let mut operations = Vec::new();
        for key in keys {
            if key.ends_with("/operation.json") {
                let data = self.backend.get(&key).await?;
                operations.push(serde_json::from_slice::<Operation>(&data)?);
            }
        }
        operations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(operations)
    }

    /// Compare-and-set state transition. Rejects transitions the operation
    /// lifecycle does not allow.
    pub async fn set_operation_state(&self, id: &str, state: OperationState) -> Result<Operation> {
        let current = self.get_operation(id).await?;
        if current.state == state {
            return Ok(current);
        }
        if !current.state.can_transition(state) {
            return Err(Error::compare_failed(format!(
                "operation {} cannot move from {:?} to {:?}",
                id, current.state, state
            )));
        }
        let expect = serde_json::to_vec_pretty(&current)?;
        let mut updated = current;
        updated.state = state;
        let value = serde_json::to_vec_pretty(&updated)?;
        self.backend
            .compare_and_swap(&operation_key(id), &expect, value)
            .await?;
        Ok(updated)
    }

    /// Replaces the operation record. Used to attach reported servers.
    pub async fn update_operation(&self, operation: &Operation) -> Result<()> {
        // Ensure the record exists so an update cannot create an operation.
        self.get_operation(&operation.id).await?;
        let value = serde_json::to_vec_pretty(operation)?;
        self.backend.put(&operation_key(&operation.id), value).await
    }

    pub async fn delete_operation(&self, id: &str) -> Result<()> {
        self.backend
            .delete_prefix(&format!("operations/{}", id))
            .await
    }

    /// Persists the plan. At most one plan may exist per operation.
    pub async fn create_plan(&self, plan: &OperationPlan) -> Result<()> {
        plan.validate()?;
        let value = serde_json::to_vec_pretty(plan)?;
        self.backend
            .put_if_absent(&plan_key(&plan.operation_id), value)
            .await
            .map_err(|err| match err {
                Error::AlreadyExists(_) => Error::already_exists(format!(
                    "plan for operation {}",
                    plan.operation_id
                )),
                other => other,
            })
    }

    /// Overwrites the local copy of a plan. Used by the join peer to mirror
    /// the authoritative plan into its own state dir.
    pub async fn sync_plan(&self, plan: &OperationPlan) -> Result<()> {
        let value = serde_json::to_vec_pretty(plan)?;
        self.backend.put(&plan_key(&plan.operation_id), value).await
    }

    pub async fn get_plan(&self, id: &str) -> Result<OperationPlan> {
        let data = self.backend.get(&plan_key(id)).await.map_err(|err| {
            match err {
                Error::NotFound(_) => Error::not_found(format!("plan for operation {}", id)),
                other => other,
            }
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// State of a single phase; an unrecorded phase is `Pending`.
    pub async fn get_phase_state(&self, id: &str, phase_id: &str) -> Result<PhaseState> {
        match self.backend.get(&phase_key(id, phase_id)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(Error::NotFound(_)) => Ok(PhaseState::new(phase_id, PhaseStatus::Pending)),
            Err(err) => Err(err),
        }
    }

    pub async fn update_phase_state(&self, id: &str, state: &PhaseState) -> Result<()> {
        let value = serde_json::to_vec_pretty(state)?;
        self.backend
            .put(&phase_key(id, &state.phase_id), value)
            .await
    }

    pub async fn list_phase_states(&self, id: &str) -> Result<Vec<PhaseState>> {
        let keys = self
            .backend
            .list(&format!("operations/{}/phases", id))
            .await?;
        let mut states = Vec::new();
        for key in keys {
            let data = self.backend.get(&key).await?;
            states.push(serde_json::from_slice::<PhaseState>(&data)?);
        }
        Ok(states)
    }

    pub async fn append_log(&self, id: &str, data: &[u8]) -> Result<()> {
        self.backend.append(&log_key(id), data).await
    }

    pub async fn read_log(&self, id: &str) -> Result<Vec<u8>> {
        match self.backend.get(&log_key(id)).await {
            Ok(data) => Ok(data),
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::backend::MemBackend;
    use crate::ops::{OperationType, OperationVars};
    use std::collections::BTreeMap;

    fn operation(id: &str) -> Operation {
        Operation {
            id: id.to_string(),
            cluster_domain: "example.com".to_string(),
            account_id: "system".to_string(),
            op_type: OperationType::Install,
            state: OperationState::Created,
            created_at: chrono::Utc::now(),
            created_by: "installer@example.com".to_string(),
            servers: Vec::new(),
            vars: OperationVars::default(),
            agents: BTreeMap::new(),
        }
    }

    fn store() -> OperationStore {
        OperationStore::new(Arc::new(MemBackend::new()))
    }

    #[tokio::test]
    async fn test_operation_create_once() {
        let store = store();
        store.create_operation(&operation("op-1")).await.unwrap();
        let err = store.create_operation(&operation("op-1")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_state_cas_rejects_invalid_transition() {
        let store = store();
        store.create_operation(&operation("op-1")).await.unwrap();

        // Created -> Running skips Ready.
        let err = store
            .set_operation_state("op-1", OperationState::Running)
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());

        store
            .set_operation_state("op-1", OperationState::Ready)
            .await
            .unwrap();
        let updated = store
            .set_operation_state("op-1", OperationState::Running)
            .await
            .unwrap();
        assert_eq!(updated.state, OperationState::Running);
    }

    #[tokio::test]
    async fn test_phase_state_roundtrip() {
        let store = store();
        // Unknown phases report Pending.
        let state = store.get_phase_state("op-1", "/configure").await.unwrap();
        assert_eq!(state.status, PhaseStatus::Pending);

        let mut state = PhaseState::new("/configure", PhaseStatus::InProgress);
        store.update_phase_state("op-1", &state).await.unwrap();
        state.status = PhaseStatus::Completed;
        store.update_phase_state("op-1", &state).await.unwrap();

        let read = store.get_phase_state("op-1", "/configure").await.unwrap();
        assert_eq!(read.status, PhaseStatus::Completed);
        assert_eq!(store.list_phase_states("op-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_log_append() {
        let store = store();
        store.append_log("op-1", b"phase started\n").await.unwrap();
        store.append_log("op-1", b"phase completed\n").await.unwrap();
        let log = store.read_log("op-1").await.unwrap();
        assert_eq!(log, b"phase started\nphase completed\n");
    }

    #[tokio::test]
    async fn test_delete_operation() {
        let store = store();
        store.create_operation(&operation("op-1")).await.unwrap();
        store
            .update_phase_state("op-1", &PhaseState::new("/configure", PhaseStatus::Completed))
            .await
            .unwrap();
        store.delete_operation("op-1").await.unwrap();
        assert!(store.get_operation("op-1").await.unwrap_err().is_not_found());
    }
}
