use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use gqd_common::{GqdError, Result};
use serde_json::Value;

use crate::traversal::{Step, Traversal};

/// Traversal rewrite applied by the front end before compilation.
///
/// Implementations must be pure and idempotent: applying a strategy to its own
/// output returns the same traversal.
pub trait TraversalStrategy: Send + Sync {
    /// Stable strategy name used by registry.
    fn name(&self) -> &str;
    fn apply(&self, traversal: Traversal) -> Result<Traversal>;
}

/// Drops `identity()` steps.
#[derive(Debug, Default)]
pub struct RemoveIdentitySteps;

impl TraversalStrategy for RemoveIdentitySteps {
    fn name(&self) -> &str {
        "remove_identity_steps"
    }

    fn apply(&self, mut traversal: Traversal) -> Result<Traversal> {
        traversal.steps.retain(|s| s.name != "identity");
        Ok(traversal)
    }
}

/// Folds `limit(a).limit(b)` into `limit(min(a, b))`.
#[derive(Debug, Default)]
pub struct MergeAdjacentLimits;

impl TraversalStrategy for MergeAdjacentLimits {
    fn name(&self) -> &str {
        "merge_adjacent_limits"
    }

    fn apply(&self, traversal: Traversal) -> Result<Traversal> {
        let mut steps: Vec<Step> = Vec::with_capacity(traversal.steps.len());
        for step in traversal.steps {
            if step.name == "limit" {
                let n = limit_value(&step)?;
                if let Some(prev) = steps.last_mut().filter(|p| p.name == "limit") {
                    let merged = limit_value(prev)?.min(n);
                    prev.args = vec![Value::from(merged)];
                    continue;
                }
            }
            steps.push(step);
        }
        Ok(Traversal::new(traversal.source, steps))
    }
}

fn limit_value(step: &Step) -> Result<u64> {
    match step.args.as_slice() {
        [v] => v.as_u64().ok_or_else(|| {
            GqdError::Planning(format!("limit expects a non-negative integer, found {v}"))
        }),
        _ => Err(GqdError::Planning(format!(
            "limit expects exactly one argument, found {}",
            step.args.len()
        ))),
    }
}

/// Built-in strategies followed by registered custom strategies.
///
/// Custom strategies run in name order so the pipeline is deterministic.
pub struct StrategyChain {
    builtin: Vec<Arc<dyn TraversalStrategy>>,
    custom: RwLock<BTreeMap<String, Arc<dyn TraversalStrategy>>>,
}

impl std::fmt::Debug for StrategyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.custom.read().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("StrategyChain")
            .field("builtin", &self.builtin.len())
            .field("custom", &count)
            .finish()
    }
}

impl Default for StrategyChain {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyChain {
    pub fn new() -> Self {
        Self {
            builtin: vec![Arc::new(RemoveIdentitySteps), Arc::new(MergeAdjacentLimits)],
            custom: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register or replace a custom strategy.
    ///
    /// Returns `true` when an existing strategy with the same name was replaced.
    pub fn register(&self, strategy: Arc<dyn TraversalStrategy>) -> bool {
        self.custom
            .write()
            .expect("strategy registry lock poisoned")
            .insert(strategy.name().to_string(), strategy)
            .is_some()
    }

    /// Returns `true` when an existing strategy was removed.
    pub fn deregister(&self, name: &str) -> bool {
        self.custom
            .write()
            .expect("strategy registry lock poisoned")
            .remove(name)
            .is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut out = self
            .builtin
            .iter()
            .map(|s| s.name().to_string())
            .collect::<Vec<_>>();
        if let Ok(custom) = self.custom.read() {
            out.extend(custom.keys().cloned());
        }
        out
    }

    pub fn apply(&self, traversal: Traversal) -> Result<Traversal> {
        let custom = self
            .custom
            .read()
            .map_err(|_| GqdError::Planning("strategy registry lock poisoned".to_string()))?
            .values()
            .cloned()
            .collect::<Vec<_>>();
        self.builtin
            .iter()
            .chain(custom.iter())
            .try_fold(traversal, |t, strategy| strategy.apply(t))
    }
}
