//! Reversible-operation scaffolding.
//!
//! Multi-step operations push a compensating action after each effect
//! succeeds. On failure the accumulated actions run in reverse push order,
//! each best-effort: an action that fails is logged and the remaining
//! actions still run. On success the stack is dropped without running.
//!
//! Some operations (optimized restore, migration receive) also hand a
//! [`RevertHook`] back to the caller so an outer operation can unwind the
//! whole composition later.

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

type RevertAction = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// LIFO stack of compensating actions.
pub struct Reverter {
    actions: Vec<RevertAction>,
}

impl Reverter {
    /// Create an empty rollback stack.
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    /// Push a compensating action for an effect that just succeeded.
    ///
    /// The future is not polled unless the operation fails.
    pub fn add<F>(&mut self, action: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.actions.push(Box::pin(action));
    }

    /// Run all accumulated actions in reverse push order.
    ///
    /// Individual failures are logged and swallowed so that later actions
    /// still get a chance to run.
    pub async fn fail(mut self) {
        while let Some(action) = self.actions.pop() {
            if let Err(e) = action.await {
                warn!(error = %e, "Rollback action failed");
            }
        }
    }

    /// Commit: drop all actions without running them.
    pub fn success(mut self) {
        self.actions.clear();
    }

    /// Commit, handing the accumulated actions to the caller as a hook so a
    /// later step outside this operation can still unwind the composition.
    pub fn into_hook(self) -> RevertHook {
        RevertHook { actions: self.actions }
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for Reverter {
    fn default() -> Self {
        Self::new()
    }
}

/// A committed rollback stack handed to the caller.
pub struct RevertHook {
    actions: Vec<RevertAction>,
}

impl std::fmt::Debug for RevertHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevertHook").field("actions", &self.actions.len()).finish()
    }
}

impl RevertHook {
    /// Build a hook from a single compensating action.
    pub fn from_action<F>(action: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self { actions: vec![Box::pin(action)] }
    }

    /// Run the hook: all actions in reverse push order, best-effort.
    pub async fn run(mut self) {
        while let Some(action) = self.actions.pop() {
            if let Err(e) = action.await {
                warn!(error = %e, "Revert hook action failed");
            }
        }
    }
}
