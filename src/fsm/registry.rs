//! Phase registry: maps executor kinds to `{execute, rollback}` capabilities.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use slog::Logger;

use crate::bus::EventSender;
use crate::error::{Error, Result};
use crate::ops::OperationKey;
use crate::plan::{OperationPlan, Phase};

/// Everything an executor needs to run a phase: the phase record, the plan it
/// belongs to, and a handle for streaming sub-progress.
#[derive(Clone)]
pub struct PhaseContext {
    pub phase: Phase,
    pub plan: Arc<OperationPlan>,
    pub key: OperationKey,
    pub progress: EventSender,
    pub logger: Logger,
}

/// A phase capability.
///
/// `execute` must be idempotent: remote dispatch is at-least-once under agent
/// reconnect, and the FSM re-runs phases found `InProgress` after a crash.
#[tonic::async_trait]
pub trait PhaseExecutor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, ctx: PhaseContext) -> Result<()>;
    async fn rollback(&self, ctx: PhaseContext) -> Result<()>;
}

type PhaseFn =
    Box<dyn Fn(PhaseContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

struct FnExecutor {
    execute: PhaseFn,
    rollback: PhaseFn,
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl PhaseExecutor for FnExecutor {
    async fn execute(&self, ctx: PhaseContext) -> Result<()> {
        (self.execute)(ctx).await
    }

    async fn rollback(&self, ctx: PhaseContext) -> Result<()> {
        (self.rollback)(ctx).await
    }
}

/// Static map from executor kind to phase capability. Populated by the
/// embedding application before the FSM runs.
#[derive(Default)]
pub struct PhaseRegistry {
    executors: HashMap<String, Arc<dyn PhaseExecutor>>,
}

impl PhaseRegistry {
    pub fn new() -> PhaseRegistry {
        PhaseRegistry::default()
    }

    /// Register an executor for the given kind.
    pub fn register(
        &mut self,
        kind: &str,
        executor: Arc<dyn PhaseExecutor>,
    ) -> Result<()> {
        if self.executors.contains_key(kind) {
            return Err(Error::already_exists(format!(
                "executor kind {:?} is already registered",
                kind
            )));
        }
        self.executors.insert(kind.to_string(), executor);
        Ok(())
    }

    /// Register a closure as the execute capability with a no-op rollback.
    pub fn register_fn<F, Fut>(&mut self, kind: &str, execute: F) -> Result<()>
    where
        F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fns(kind, execute, |_ctx| async { Ok(()) })
    }

    /// Register closures for both capabilities.
    pub fn register_fns<F, Fut, R, RFut>(
        &mut self,
        kind: &str,
        execute: F,
        rollback: R,
    ) -> Result<()>
    where
        F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        R: Fn(PhaseContext) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(
            kind,
            Arc::new(FnExecutor {
                execute: Box::new(move |ctx| Box::pin(execute(ctx))),
                rollback: Box::new(move |ctx| Box::pin(rollback(ctx))),
            }),
        )
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn PhaseExecutor>> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no executor for kind {:?}", kind)))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_fails() {
        let mut registry = PhaseRegistry::new();
        registry.register_fn("noop", |_ctx| async { Ok(()) }).unwrap();
        let err = registry
            .register_fn("noop", |_ctx| async { Ok(()) })
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_unknown_kind() {
        let registry = PhaseRegistry::new();
        assert!(registry.get("missing").unwrap_err().is_not_found());
        assert!(!registry.contains("missing"));
    }
}
