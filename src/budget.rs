//! Budget accounting: token/cost tracking, warnings, and halting
//!
//! The guard is pure accounting. It never performs I/O; it mutates the
//! per-agent [`AgentStatus`] counters and decides whether a hard limit has
//! been crossed. The scheduler is responsible for refusing dispatch to a
//! halted agent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::plan::AgentStatus;
use crate::process::{Agent, Budget};

/// Cost categories an agent run is split into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    Intent,
    Planning,
    Progress,
    Codegen,
    Validation,
}

impl CostCategory {
    pub const ALL: [CostCategory; 5] = [
        Self::Intent,
        Self::Planning,
        Self::Progress,
        Self::Codegen,
        Self::Validation,
    ];
}

/// Prompt/completion token counts for one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTokens {
    pub prompt: u64,
    pub completion: u64,
}

/// Token usage reported by one agent run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Total tokens across all categories
    pub total: u64,

    /// Per-category splits; may be absent when the executor only reports
    /// a total
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub splits: BTreeMap<CostCategory, CategoryTokens>,
}

impl TokenUsage {
    /// Usage with only a total, no category splits
    pub fn total_only(total: u64) -> Self {
        Self {
            total,
            splits: BTreeMap::new(),
        }
    }

    /// Record a category split and keep the total consistent
    pub fn with_split(mut self, category: CostCategory, prompt: u64, completion: u64) -> Self {
        self.splits.insert(category, CategoryTokens { prompt, completion });
        self.total = self.splits.values().map(|c| c.prompt + c.completion).sum();
        self
    }
}

/// Computes the dollar cost of a prompt/completion token pair on a model
pub trait CostCalculator: Send + Sync {
    fn cost(&self, prompt_tokens: u64, completion_tokens: u64, model: &str) -> f64;
}

/// Per-million-token pricing matched by model-name substring
#[derive(Debug, Clone)]
pub struct PricingTable {
    /// (substring, prompt $/M, completion $/M), first match wins
    tiers: Vec<(String, f64, f64)>,

    /// Fallback when no tier matches
    default_prices: (f64, f64),
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                ("opus".to_string(), 15.0, 75.0),
                ("sonnet".to_string(), 3.0, 15.0),
                ("haiku".to_string(), 0.25, 1.25),
            ],
            default_prices: (3.0, 15.0),
        }
    }
}

impl CostCalculator for PricingTable {
    fn cost(&self, prompt_tokens: u64, completion_tokens: u64, model: &str) -> f64 {
        let (prompt_price, completion_price) = self
            .tiers
            .iter()
            .find(|(needle, _, _)| model.contains(needle.as_str()))
            .map(|(_, p, c)| (*p, *c))
            .unwrap_or(self.default_prices);

        (prompt_tokens as f64 / 1_000_000.0) * prompt_price
            + (completion_tokens as f64 / 1_000_000.0) * completion_price
    }
}

/// The models an agent bills against, derived by the agent runner
#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    /// Model used for code-producing work (codegen, validation)
    pub edit_model: String,

    /// Model used for orchestration work (intent, planning, progress)
    pub orchestration_model: String,
}

impl ModelSet {
    /// The model a cost category bills against
    pub fn model_for(&self, category: CostCategory) -> &str {
        match category {
            CostCategory::Codegen | CostCategory::Validation => &self.edit_model,
            CostCategory::Intent | CostCategory::Planning | CostCategory::Progress => &self.orchestration_model,
        }
    }
}

/// Token/cost accounting for all agents of a plan
pub struct BudgetGuard {
    calculator: Box<dyn CostCalculator>,
}

impl Default for BudgetGuard {
    fn default() -> Self {
        Self::new(Box::new(PricingTable::default()))
    }
}

impl BudgetGuard {
    pub fn new(calculator: Box<dyn CostCalculator>) -> Self {
        Self { calculator }
    }

    /// Refuse execution only when a hard limit is crossed AND the budget
    /// says to stop; otherwise warn and allow.
    pub fn check(&self, agent: &Agent, status: &AgentStatus) -> Result<(), EngineError> {
        let budget = &agent.budget;

        if let Some(reason) = hard_limit_crossed(budget, status) {
            if budget.stop_on_limit {
                return Err(EngineError::BudgetExceeded {
                    agent: agent.id.clone(),
                    reason,
                });
            }
            warn!(agent_id = %agent.id, %reason, "Budget limit crossed, continuing (stop_on_limit=false)");
        }

        Ok(())
    }

    /// Fold one run's usage into the agent status.
    ///
    /// Adds `usage.total` to the token counter and the incremental cost to
    /// the cost counter. Cost is the per-category sum when splits are
    /// present; otherwise all tokens are treated as prompt tokens on the
    /// edit model, a conservative lower bound on the true cost.
    ///
    /// Returns the incremental cost of this update.
    pub fn update(&self, agent: &Agent, status: &mut AgentStatus, usage: &TokenUsage, models: &ModelSet) -> f64 {
        let budget = &agent.budget;
        let prev_tokens = status.token_usage;
        let prev_cost = status.cost;

        status.token_usage += usage.total;

        let increment = if usage.splits.is_empty() {
            self.calculator.cost(usage.total, 0, &models.edit_model)
        } else {
            usage
                .splits
                .iter()
                .map(|(category, tokens)| {
                    self.calculator
                        .cost(tokens.prompt, tokens.completion, models.model_for(*category))
                })
                .sum()
        };
        status.cost += increment;

        if crossed(prev_tokens as f64, status.token_usage as f64, budget.token_warning as f64) {
            warn!(
                agent_id = %agent.id,
                tokens = status.token_usage,
                threshold = budget.token_warning,
                "Token usage crossed warning threshold"
            );
        }
        if crossed(prev_cost, status.cost, budget.cost_warning) {
            warn!(
                agent_id = %agent.id,
                cost = status.cost,
                threshold = budget.cost_warning,
                "Cost crossed warning threshold"
            );
        }

        if let Some(reason) = hard_limit_crossed(budget, status) {
            if !status.halted {
                status.halted = true;
                status.halt_reason = reason.clone();
                if budget.alert_on_limit || budget.stop_on_limit {
                    warn!(agent_id = %agent.id, %reason, "Agent halted");
                }
            }
        }

        increment
    }
}

/// Returns the halt reason when a hard limit is crossed
fn hard_limit_crossed(budget: &Budget, status: &AgentStatus) -> Option<String> {
    if budget.max_tokens > 0 && status.token_usage > budget.max_tokens {
        return Some(format!(
            "budget exceeded: {} tokens over limit of {}",
            status.token_usage, budget.max_tokens
        ));
    }
    if budget.max_cost > 0.0 && status.cost > budget.max_cost {
        return Some(format!(
            "budget exceeded: ${:.4} over limit of ${:.4}",
            status.cost, budget.max_cost
        ));
    }
    None
}

/// True when `threshold` is active and the counter moved from below to at-or-above it
fn crossed(prev: f64, current: f64, threshold: f64) -> bool {
    threshold > 0.0 && prev < threshold && current >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::AgentWorkStatus;

    fn agent_with_budget(budget: Budget) -> Agent {
        Agent {
            id: "a1".into(),
            name: "Agent".into(),
            persona: "persona".into(),
            description: String::new(),
            skills: Vec::new(),
            model: String::new(),
            priority: 100,
            depends_on: Vec::new(),
            config: Default::default(),
            budget,
        }
    }

    fn models() -> ModelSet {
        ModelSet {
            edit_model: "claude-sonnet-4".into(),
            orchestration_model: "claude-haiku-3".into(),
        }
    }

    #[test]
    fn test_pricing_table_tiers() {
        let table = PricingTable::default();

        // 1M prompt + 100k completion on sonnet: $3 + $1.50
        let cost = table.cost(1_000_000, 100_000, "claude-sonnet-4");
        assert!((cost - 4.5).abs() < 1e-9);

        // Unknown model falls back to sonnet pricing
        let fallback = table.cost(1_000_000, 0, "mystery-model");
        assert!((fallback - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_accumulates_monotonically() {
        let guard = BudgetGuard::default();
        let agent = agent_with_budget(Budget::default());
        let mut status = AgentStatus::default();

        guard.update(&agent, &mut status, &TokenUsage::total_only(100), &models());
        assert_eq!(status.token_usage, 100);
        let first_cost = status.cost;
        assert!(first_cost > 0.0);

        guard.update(&agent, &mut status, &TokenUsage::total_only(50), &models());
        assert_eq!(status.token_usage, 150);
        assert!(status.cost > first_cost);
    }

    #[test]
    fn test_update_without_splits_uses_edit_model_lower_bound() {
        let guard = BudgetGuard::default();
        let agent = agent_with_budget(Budget::default());
        let mut status = AgentStatus::default();

        let increment = guard.update(&agent, &mut status, &TokenUsage::total_only(1_000_000), &models());

        // All tokens billed as prompt on the edit model (sonnet: $3/M)
        assert!((increment - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_with_splits_bills_per_category_model() {
        let guard = BudgetGuard::default();
        let agent = agent_with_budget(Budget::default());
        let mut status = AgentStatus::default();

        let usage = TokenUsage::default()
            .with_split(CostCategory::Planning, 1_000_000, 0)
            .with_split(CostCategory::Codegen, 1_000_000, 0);

        let increment = guard.update(&agent, &mut status, &usage, &models());

        // Planning bills at haiku ($0.25/M), codegen at sonnet ($3/M)
        assert!((increment - 3.25).abs() < 1e-9);
        assert_eq!(status.token_usage, 2_000_000);
    }

    #[test]
    fn test_hard_limit_halts_agent() {
        let guard = BudgetGuard::default();
        let agent = agent_with_budget(Budget {
            max_tokens: 100,
            stop_on_limit: true,
            ..Default::default()
        });
        let mut status = AgentStatus::default();

        guard.update(&agent, &mut status, &TokenUsage::total_only(120), &models());

        assert!(status.halted);
        assert!(status.halt_reason.contains("budget exceeded"));
    }

    #[test]
    fn test_check_rejects_only_with_stop_on_limit() {
        let guard = BudgetGuard::default();

        let stopping = agent_with_budget(Budget {
            max_tokens: 100,
            stop_on_limit: true,
            ..Default::default()
        });
        let mut status = AgentStatus {
            status: AgentWorkStatus::Working,
            ..Default::default()
        };
        status.token_usage = 120;

        assert!(matches!(
            guard.check(&stopping, &status),
            Err(EngineError::BudgetExceeded { .. })
        ));

        let warning_only = agent_with_budget(Budget {
            max_tokens: 100,
            stop_on_limit: false,
            ..Default::default()
        });
        assert!(guard.check(&warning_only, &status).is_ok());
    }

    #[test]
    fn test_zero_budget_means_no_limit() {
        let guard = BudgetGuard::default();
        let agent = agent_with_budget(Budget::default());
        let mut status = AgentStatus::default();

        guard.update(&agent, &mut status, &TokenUsage::total_only(10_000_000), &models());

        assert!(!status.halted);
        assert!(guard.check(&agent, &status).is_ok());
    }

    #[test]
    fn test_usage_with_split_keeps_total_consistent() {
        let usage = TokenUsage::default()
            .with_split(CostCategory::Intent, 10, 5)
            .with_split(CostCategory::Codegen, 100, 50);
        assert_eq!(usage.total, 165);
    }
}
