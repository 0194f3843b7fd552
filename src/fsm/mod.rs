//! FSM executor: drives an operation plan to completion on one orchestrator
//! node.
//!
//! Leaves run concurrently where the plan's DAG permits; every phase
//! transition is persisted through the operator before and after execution,
//! making the union of phase states the resumable state of the operation.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use slog::{info, warn, Logger};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventSender};
use crate::error::{Error, Result};
use crate::fsm::registry::{PhaseContext, PhaseRegistry};
use crate::ops::operator::Operator;
use crate::ops::{OperationKey, OperationState, ProgressEntry, Server, COMPLETION_DONE};
use crate::plan::{OperationPlan, PhaseState, PhaseStatus};

/// Executes a command on a remote node on behalf of the FSM. Implemented by
/// the agent fleet.
#[tonic::async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Runs the command on the given server, streaming per-line output as
    /// progress events.
    async fn run(
        &self,
        key: &OperationKey,
        server: &Server,
        args: Vec<String>,
        progress: &EventSender,
    ) -> Result<()>;
}

/// Configuration of the FSM executor.
pub struct FsmConfig {
    pub operator: Arc<dyn Operator>,
    pub key: OperationKey,
    pub registry: Arc<PhaseRegistry>,
    /// Remote dispatch; required when the plan has phases bound to other
    /// nodes.
    pub runner: Option<Arc<dyn RemoteRunner>>,
    /// Hostname of the node this executor runs on. Phases bound to it run
    /// locally.
    pub local_hostname: Option<String>,
    pub progress: EventSender,
    pub logger: Logger,
}

/// The plan executor.
pub struct Fsm {
    operator: Arc<dyn Operator>,
    key: OperationKey,
    registry: Arc<PhaseRegistry>,
    runner: Option<Arc<dyn RemoteRunner>>,
    local_hostname: Option<String>,
    progress: EventSender,
    logger: Logger,
}

/// The argv a remote agent runs to execute a single phase of the synced
/// plan. The agent prepends its own executable path.
pub fn remote_phase_args(phase_id: &str, key: &OperationKey) -> Vec<String> {
    vec![
        "plan".to_string(),
        "execute".to_string(),
        format!("--phase={}", phase_id),
        format!("--operation-id={}", key.operation_id),
    ]
}

impl Fsm {
    pub fn new(config: FsmConfig) -> Fsm {
        Fsm {
            operator: config.operator,
            key: config.key,
            registry: config.registry,
            runner: config.runner,
            local_hostname: config.local_hostname,
            progress: config.progress,
            logger: config.logger,
        }
    }

    /// Runs all leaf phases in dependency order, concurrently where the DAG
    /// permits. On failure no new phases are scheduled; in-flight phases
    /// drain and the first error is returned.
    pub async fn execute_plan(&self, cancel: &CancellationToken) -> Result<()> {
        let operation = self.operator.get_operation(&self.key).await?;
        match operation.state {
            OperationState::Completed => return Ok(()),
            OperationState::Ready | OperationState::Failed => {
                self.operator
                    .set_operation_state(&self.key, OperationState::Running)
                    .await?;
            }
            OperationState::Running => {} // resuming
            other => {
                return Err(Error::compare_failed(format!(
                    "operation {} is not ready to execute (state {:?})",
                    self.key.operation_id, other
                )))
            }
        }

        let plan = Arc::new(self.operator.get_plan(&self.key).await?);
        let mut statuses = self.load_statuses(&plan).await?;

        let leaves: Vec<(String, Vec<String>)> = plan
            .leaves_with_requires()
            .into_iter()
            .map(|(phase, requires)| (phase.id.clone(), requires))
            .collect();
        let total = leaves.len();
        let mut completed = leaves
            .iter()
            .filter(|(id, _)| statuses.get(id) == Some(&PhaseStatus::Completed))
            .count();

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut in_flight: Vec<String> = Vec::new();
        let mut first_error: Option<Error> = None;

        loop {
            if first_error.is_none() && !cancel.is_cancelled() {
                let mut ready: Vec<&str> = leaves
                    .iter()
                    .filter(|(id, requires)| {
                        !in_flight.iter().any(|f| f == id)
                            && matches!(
                                statuses.get(id),
                                None | Some(PhaseStatus::Pending) | Some(PhaseStatus::RolledBack)
                            )
                            && deps_satisfied(requires, &plan, &statuses)
                    })
                    .map(|(id, _)| id.as_str())
                    .collect();
                ready.sort_unstable();

                for id in ready {
                    let phase = plan
                        .find(id)
                        .ok_or_else(|| Error::internal(format!("phase {} vanished", id)))?
                        .clone();
                    self.persist(id, PhaseStatus::InProgress, None).await?;
                    statuses.insert(id.to_string(), PhaseStatus::InProgress);
                    in_flight.push(id.to_string());
                    self.send_progress(completed, total, format!("Executing phase {}", id));

                    let task = self.leaf_task(phase, plan.clone());
                    tasks.spawn(task);
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (id, result) = joined
                .map_err(|err| Error::internal(format!("phase task panicked: {}", err)))?;
            in_flight.retain(|f| f != &id);
            match result {
                Ok(()) => {
                    self.persist(&id, PhaseStatus::Completed, None).await?;
                    statuses.insert(id.clone(), PhaseStatus::Completed);
                    completed += 1;
                    self.send_progress(completed, total, format!("Completed phase {}", id));
                }
                Err(err) => {
                    warn!(self.logger, "Phase failed"; "phase" => &id, "error" => %err);
                    self.persist(&id, PhaseStatus::Failed, Some(err.to_string()))
                        .await?;
                    statuses.insert(id.clone(), PhaseStatus::Failed);
                    self.progress.send_error(err.clone());
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(Error::aborted("operation canceled"));
        }
        // All leaves either completed now or failed on a previous run.
        if let Some((id, _)) = leaves
            .iter()
            .find(|(id, _)| statuses.get(id) != Some(&PhaseStatus::Completed))
        {
            let state = self.operator.get_phase_state(&self.key, id).await?;
            return Err(Error::aborted(format!(
                "phase {} failed previously: {}; retry it with force",
                id,
                state.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(())
    }

    /// Runs a single phase. With `force`, missing prerequisites are executed
    /// first and a failed phase may be retried.
    pub async fn execute_phase(&self, phase_id: &str, force: bool) -> Result<()> {
        let plan = Arc::new(self.operator.get_plan(&self.key).await?);
        let leaf_ids = plan.leaf_ids_under(phase_id);
        if leaf_ids.is_empty() {
            return Err(Error::not_found(format!("phase {:?}", phase_id)));
        }
        for id in leaf_ids {
            self.execute_leaf(&plan, &id, force).await?;
        }
        Ok(())
    }

    fn execute_leaf<'a>(
        &'a self,
        plan: &'a Arc<OperationPlan>,
        phase_id: &'a str,
        force: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.operator.get_phase_state(&self.key, phase_id).await?;
            match state.status {
                PhaseStatus::Completed => return Ok(()),
                PhaseStatus::Failed if !force => {
                    return Err(Error::compare_failed(format!(
                        "phase {} has failed; retry it with force",
                        phase_id
                    )))
                }
                _ => {}
            }

            let requires = plan
                .leaves_with_requires()
                .into_iter()
                .find(|(phase, _)| phase.id == phase_id)
                .map(|(_, requires)| requires)
                .unwrap_or_default();
            for dep in &requires {
                for dep_leaf in plan.leaf_ids_under(dep) {
                    let dep_state = self.operator.get_phase_state(&self.key, &dep_leaf).await?;
                    if dep_state.status != PhaseStatus::Completed {
                        if force {
                            self.execute_leaf(plan, &dep_leaf, force).await?;
                        } else {
                            return Err(Error::compare_failed(format!(
                                "phase {} requires {} which has not completed",
                                phase_id, dep_leaf
                            )));
                        }
                    }
                }
            }

            let phase = plan
                .find(phase_id)
                .ok_or_else(|| Error::not_found(format!("phase {:?}", phase_id)))?
                .clone();
            self.persist(phase_id, PhaseStatus::InProgress, None).await?;
            match self.leaf_task(phase, plan.clone()).await.1 {
                Ok(()) => {
                    self.persist(phase_id, PhaseStatus::Completed, None).await?;
                    Ok(())
                }
                Err(err) => {
                    self.persist(phase_id, PhaseStatus::Failed, Some(err.to_string()))
                        .await?;
                    Err(err)
                }
            }
        })
    }

    /// Rolls back a phase. Rolling back a group rolls back its completed
    /// descendants in reverse of the order in which they completed.
    pub async fn rollback_phase(&self, phase_id: &str, force: bool) -> Result<()> {
        let plan = Arc::new(self.operator.get_plan(&self.key).await?);
        let leaf_ids = plan.leaf_ids_under(phase_id);
        if leaf_ids.is_empty() {
            return Err(Error::not_found(format!("phase {:?}", phase_id)));
        }

        let mut targets = Vec::new();
        for id in leaf_ids {
            let state = self.operator.get_phase_state(&self.key, &id).await?;
            let eligible = state.status == PhaseStatus::Completed
                || (force && state.status == PhaseStatus::Failed);
            if eligible {
                targets.push(state);
            }
        }
        // Reverse completion order.
        targets.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        for state in targets {
            let phase = plan
                .find(&state.phase_id)
                .ok_or_else(|| Error::not_found(format!("phase {:?}", state.phase_id)))?
                .clone();
            info!(self.logger, "Rolling back phase"; "phase" => &phase.id);
            let executor = self.registry.get(&phase.executor)?;
            let ctx = self.context(phase.clone(), plan.clone());
            executor.rollback(ctx).await?;
            self.persist(&phase.id, PhaseStatus::RolledBack, None).await?;
        }
        Ok(())
    }

    /// Writes the terminal operation state based on the plan result.
    /// Idempotent: completing a terminal operation is a no-op.
    pub async fn complete(&self, result: std::result::Result<(), Error>) -> Result<()> {
        let operation = self.operator.get_operation(&self.key).await?;
        if operation.state.is_terminal() {
            return Ok(());
        }
        if operation.state != OperationState::Running {
            // The plan may have failed before any phase ran.
            let _ = self
                .operator
                .set_operation_state(&self.key, OperationState::Running)
                .await;
        }
        let (state, entry) = match &result {
            Ok(()) => (
                OperationState::Completed,
                ProgressEntry {
                    operation_id: self.key.operation_id.clone(),
                    completion: COMPLETION_DONE,
                    message: "Operation has completed".to_string(),
                    created: Utc::now(),
                },
            ),
            Err(err) => (
                OperationState::Failed,
                ProgressEntry {
                    operation_id: self.key.operation_id.clone(),
                    completion: COMPLETION_DONE,
                    message: format!("Operation has failed: {}", err),
                    created: Utc::now(),
                },
            ),
        };
        self.operator.set_operation_state(&self.key, state).await?;
        self.operator
            .create_progress_entry(&self.key, entry.clone())
            .await?;
        self.progress.send(Event::Completed(entry));
        Ok(())
    }

    async fn load_statuses(&self, plan: &OperationPlan) -> Result<HashMap<String, PhaseStatus>> {
        let mut statuses = HashMap::new();
        for state in self.operator.list_phase_states(&self.key).await? {
            // Idempotent re-execution: phases interrupted mid-flight are
            // treated as pending on resume.
            let status = match state.status {
                PhaseStatus::InProgress => PhaseStatus::Pending,
                other => other,
            };
            statuses.insert(state.phase_id, status);
        }
        // Ignore states for phases the plan no longer contains.
        let known: Vec<String> = plan.leaves().iter().map(|p| p.id.clone()).collect();
        statuses.retain(|id, _| known.contains(id));
        Ok(statuses)
    }

    fn context(&self, phase: crate::plan::Phase, plan: Arc<OperationPlan>) -> PhaseContext {
        PhaseContext {
            phase,
            plan,
            key: self.key.clone(),
            progress: self.progress.clone(),
            logger: self.logger.clone(),
        }
    }

    /// Builds the future executing one leaf, either locally through the
    /// registry or remotely through the agent fleet.
    fn leaf_task(
        &self,
        phase: crate::plan::Phase,
        plan: Arc<OperationPlan>,
    ) -> impl std::future::Future<Output = (String, Result<()>)> + Send + 'static {
        let id = phase.id.clone();
        let remote = match &phase.node_ref {
            Some(node) => self.local_hostname.as_deref() != Some(node.as_str()),
            None => false,
        };
        let registry = self.registry.clone();
        let runner = self.runner.clone();
        let progress = self.progress.clone();
        let key = self.key.clone();
        let ctx = self.context(phase.clone(), plan.clone());

        async move {
            let result = if remote {
                match runner {
                    Some(runner) => {
                        let server = match plan.server_for(&phase) {
                            Some(server) => server.clone(),
                            None => {
                                return (
                                    id,
                                    Err(Error::not_found(format!(
                                        "no server {:?} in plan",
                                        phase.node_ref
                                    ))),
                                )
                            }
                        };
                        let args = remote_phase_args(&phase.id, &key);
                        runner.run(&key, &server, args, &progress).await
                    }
                    None => Err(Error::internal(format!(
                        "phase {} is bound to a remote node but no agent fleet is configured",
                        phase.id
                    ))),
                }
            } else {
                match registry.get(&phase.executor) {
                    Ok(executor) => executor.execute(ctx).await,
                    Err(err) => Err(err),
                }
            };
            (id, result)
        }
    }

    async fn persist(
        &self,
        phase_id: &str,
        status: PhaseStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = PhaseState::new(phase_id, status);
        state.error = error;
        self.operator.update_phase_state(&self.key, state).await
    }

    fn send_progress(&self, completed: usize, total: usize, message: String) {
        // 100 is reserved for the terminal entry written by complete().
        let completion = if total == 0 {
            0
        } else {
            ((completed * 100) / total).min(99) as u8
        };
        let entry = ProgressEntry {
            operation_id: self.key.operation_id.clone(),
            completion,
            message,
            created: Utc::now(),
        };
        self.progress.send(Event::Progress(entry));
    }
}

fn deps_satisfied(
    deps: &[String],
    plan: &OperationPlan,
    statuses: &HashMap<String, PhaseStatus>,
) -> bool {
    deps.iter().all(|dep| {
        plan.leaf_ids_under(dep)
            .iter()
            .all(|leaf| statuses.get(leaf) == Some(&PhaseStatus::Completed))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_phase_args() {
        let key = OperationKey {
            account_id: "system".to_string(),
            cluster_domain: "example.com".to_string(),
            operation_id: "op-1".to_string(),
        };
        assert_eq!(
            remote_phase_args("/masters/node-1/install", &key),
            vec![
                "plan",
                "execute",
                "--phase=/masters/node-1/install",
                "--operation-id=op-1",
            ]
        );
    }
}
