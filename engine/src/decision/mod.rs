//! Decision engine
//!
//! Picks a tool for a pending step. Three interchangeable strategies sit
//! behind the [`Strategy`] trait:
//!
//! - [`fuzzy::FuzzyStrategy`]: weighted Mamdani rules over risk, load,
//!   expertise, and per-tool features, defuzzified by centroid
//! - [`evolutionary::EvolutionaryStrategy`]: a population of weight vectors
//!   over the tool features, evolved from recent outcomes
//! - [`q_learning::QLearningStrategy`]: an action-value table over coarse
//!   (capability, risk, load) states with epsilon-greedy exploration
//!
//! Strategies only ever read a [`DecisionContext`], which is built from a
//! registry snapshot, so selection never holds a registry lock.

pub mod evolutionary;
pub mod fuzzy;
pub mod q_learning;

use crate::config::{Config, StrategyKind};
use crate::registry::AgentSnapshot;
use crate::tools::ToolSet;
use sdk::errors::EngineError;
use sdk::types::{Capability, Priority};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub use evolutionary::EvolutionaryStrategy;
pub use fuzzy::FuzzyStrategy;
pub use q_learning::QLearningStrategy;

/// Success rate assumed for a tool that has never run
pub const PRIOR_SUCCESS_RATE: f64 = 0.5;

/// Number of per-tool features, and genes in an evolutionary genome
pub const FEATURES: usize = 5;

/// One tool a step could run, with what the registry knows about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTool {
    pub name: String,
    pub intrusiveness: f64,
    pub thoroughness: f64,
    pub timeout_secs: f64,
    pub uses: usize,
    pub success_rate: f64,
    pub avg_duration_secs: Option<f64>,
    /// In-flight steps currently running this tool
    pub load: usize,
    pub load_ratio: f64,
}

impl CandidateTool {
    /// Feature vector in [0, 1]: reliability, speed, thoroughness, stealth,
    /// and load aversion.
    pub fn features(&self) -> [f64; FEATURES] {
        let speed = match self.avg_duration_secs {
            Some(avg) if self.timeout_secs > 0.0 => 1.0 - avg / self.timeout_secs,
            _ => 0.5,
        };
        [
            self.success_rate,
            speed,
            self.thoroughness,
            1.0 - self.intrusiveness,
            1.0 - self.load_ratio,
        ]
        .map(sanitize)
    }

    fn expected_duration(&self) -> f64 {
        self.avg_duration_secs.unwrap_or(self.timeout_secs)
    }
}

/// Everything a strategy may look at for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub step_id: String,
    pub capability: Capability,
    pub target_risk: f64,
    pub priority: Priority,
    pub agent: AgentSnapshot,
    pub candidates: Vec<CandidateTool>,
    pub max_concurrency: usize,
}

impl DecisionContext {
    /// Build a context for the named tools of a capability. Names the tool
    /// set does not know are dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        step_id: impl Into<String>,
        capability: Capability,
        target_risk: f64,
        priority: Priority,
        agent: AgentSnapshot,
        tools: &ToolSet,
        names: &[&str],
        max_concurrency: usize,
    ) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let candidates = names
            .iter()
            .filter_map(|name| {
                let adapter = tools.get(name)?;
                let spec = adapter.spec();
                let ceiling = tools.ceiling(name)?;
                let stats = agent.stats_for(name);
                let load = agent.load_of(name);
                Some(CandidateTool {
                    name: spec.name.to_string(),
                    intrusiveness: spec.intrusiveness,
                    thoroughness: spec.thoroughness,
                    timeout_secs: ceiling.as_secs_f64(),
                    uses: stats.uses,
                    success_rate: stats.success_rate_or(PRIOR_SUCCESS_RATE),
                    avg_duration_secs: stats.avg_duration().map(|d| d.as_secs_f64()),
                    load,
                    load_ratio: (load as f64 / max_concurrency as f64).min(1.0),
                })
            })
            .collect();

        Self {
            step_id: step_id.into(),
            capability,
            target_risk: sanitize(target_risk),
            priority,
            agent,
            candidates,
            max_concurrency,
        }
    }

    /// Capability-wide load as a fraction of the concurrency bound.
    pub fn load_ratio(&self) -> f64 {
        (self.agent.load as f64 / self.max_concurrency.max(1) as f64).min(1.0)
    }

    pub fn candidate(&self, name: &str) -> Option<&CandidateTool> {
        self.candidates.iter().find(|c| c.name == name)
    }
}

/// A strategy's choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub tool: String,
    pub confidence: f64,
    pub strategy: StrategyKind,
}

/// What the learning loop hands back to the strategies after a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSample {
    pub capability: Capability,
    pub tool: String,
    /// The candidate as it looked when the decision was made
    pub candidate: CandidateTool,
    pub target_risk: f64,
    pub load_ratio: f64,
    pub expertise: f64,
    /// Reward in [-1, 1]
    pub reward: f64,
    pub success: bool,
    /// Recent success rate of the capability after this outcome
    pub agent_success_rate: f64,
}

impl LearningSample {
    /// Sample for the tool a context chose. `None` if the tool was not a
    /// candidate of that context.
    pub fn from_context(
        ctx: &DecisionContext,
        tool: &str,
        reward: f64,
        success: bool,
    ) -> Option<Self> {
        let candidate = ctx.candidate(tool)?.clone();
        Some(Self {
            capability: ctx.capability,
            tool: tool.to_string(),
            candidate,
            target_risk: ctx.target_risk,
            load_ratio: ctx.load_ratio(),
            expertise: ctx.agent.expertise,
            reward: reward.clamp(-1.0, 1.0),
            success,
            agent_success_rate: ctx.agent.success_rate(),
        })
    }

    /// Reward rescaled to [0, 1]
    pub fn target(&self) -> f64 {
        ((self.reward + 1.0) / 2.0).clamp(0.0, 1.0)
    }
}

/// A tool selection algorithm.
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Choose among `ctx.candidates`, which the engine guarantees is non-empty.
    fn select(&self, ctx: &DecisionContext) -> Result<Decision, EngineError>;

    /// Update internal state from one completed step.
    fn learn(&self, sample: &LearningSample);
}

/// Index of the best-scoring candidate. Scores within `epsilon` of the best
/// tie; ties go to lower load, then lower expected duration, then name.
pub(crate) fn pick_best(candidates: &[CandidateTool], scores: &[f64], epsilon: f64) -> usize {
    let best = scores
        .iter()
        .copied()
        .map(sanitize_score)
        .fold(f64::NEG_INFINITY, f64::max);
    (0..candidates.len().min(scores.len()))
        .filter(|&i| sanitize_score(scores[i]) >= best - epsilon)
        .min_by(|&a, &b| {
            let (ca, cb) = (&candidates[a], &candidates[b]);
            ca.load
                .cmp(&cb.load)
                .then_with(|| ca.expected_duration().total_cmp(&cb.expected_duration()))
                .then_with(|| ca.name.cmp(&cb.name))
        })
        .unwrap_or(0)
}

/// Clamp to [0, 1], mapping NaN to 0.
pub(crate) fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn sanitize_score(value: f64) -> f64 {
    if value.is_nan() {
        f64::NEG_INFINITY
    } else {
        value
    }
}

/// Holds all three strategies and routes each step to one of them.
pub struct DecisionEngine {
    strategies: HashMap<StrategyKind, Arc<dyn Strategy>>,
    q_learning: Arc<QLearningStrategy>,
    default: StrategyKind,
    overrides: HashMap<Capability, StrategyKind>,
}

impl DecisionEngine {
    pub fn new(config: &Config) -> Result<Self, EngineError> {
        let tie = config.strategy.tie_epsilon;
        let q_learning = Arc::new(QLearningStrategy::new(&config.q_learning, tie));
        let strategies: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(FuzzyStrategy::new(&config.fuzzy, tie)),
            Arc::new(EvolutionaryStrategy::new(&config.evolutionary, tie)),
            Arc::clone(&q_learning) as Arc<dyn Strategy>,
        ];

        let mut overrides = HashMap::new();
        for (capability, strategy) in &config.strategy.overrides {
            let capability = capability
                .parse::<Capability>()
                .map_err(EngineError::Config)?;
            overrides.insert(capability, strategy.parse::<StrategyKind>()?);
        }

        Ok(Self {
            strategies: strategies.into_iter().map(|s| (s.kind(), s)).collect(),
            q_learning,
            default: config.strategy.default.parse()?,
            overrides,
        })
    }

    pub fn default_kind(&self) -> StrategyKind {
        self.default
    }

    /// Strategy for a capability unless the request names one.
    pub fn resolve(&self, capability: Capability, requested: Option<StrategyKind>) -> StrategyKind {
        requested
            .or_else(|| self.overrides.get(&capability).copied())
            .unwrap_or(self.default)
    }

    pub fn strategy(&self, kind: StrategyKind) -> Option<&Arc<dyn Strategy>> {
        self.strategies.get(&kind)
    }

    /// Learned action value of `tool` in the state a context maps to.
    pub fn action_value(&self, ctx: &DecisionContext, tool: &str) -> Option<f64> {
        self.action_value_at(ctx.capability, ctx.target_risk, ctx.load_ratio(), tool)
    }

    pub fn action_value_at(
        &self,
        capability: Capability,
        target_risk: f64,
        load_ratio: f64,
        tool: &str,
    ) -> Option<f64> {
        let state = self.q_learning.state_for(capability, target_risk, load_ratio);
        self.q_learning.q_value(&state, tool)
    }

    pub fn select(
        &self,
        ctx: &DecisionContext,
        requested: Option<StrategyKind>,
    ) -> Result<Decision, EngineError> {
        if ctx.candidates.is_empty() {
            return Err(EngineError::NoEligibleTool(ctx.capability));
        }
        let kind = self.resolve(ctx.capability, requested);
        let strategy = self.strategy(kind).ok_or_else(|| {
            EngineError::Orchestration(format!("strategy {} not registered", kind.as_str()))
        })?;

        let mut decision = strategy.select(ctx)?;
        if ctx.candidate(&decision.tool).is_none() {
            return Err(EngineError::Orchestration(format!(
                "strategy {} chose unknown tool {}",
                kind.as_str(),
                decision.tool
            )));
        }
        decision.confidence = sanitize(decision.confidence);

        debug!(
            step_id = %ctx.step_id,
            capability = %ctx.capability,
            strategy = kind.as_str(),
            tool = %decision.tool,
            confidence = decision.confidence,
            "Tool selected"
        );
        Ok(decision)
    }

    /// Every strategy learns from every sample, so switching strategy
    /// starts from a trained model.
    pub fn learn(&self, sample: &LearningSample) {
        for strategy in self.strategies.values() {
            strategy.learn(sample);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    pub fn candidate(name: &str, success_rate: f64, intrusiveness: f64) -> CandidateTool {
        CandidateTool {
            name: name.to_string(),
            intrusiveness,
            thoroughness: 0.5,
            timeout_secs: 300.0,
            uses: 10,
            success_rate,
            avg_duration_secs: Some(60.0),
            load: 0,
            load_ratio: 0.0,
        }
    }

    pub fn context(capability: Capability, risk: f64, candidates: Vec<CandidateTool>) -> DecisionContext {
        DecisionContext {
            step_id: "step_1".to_string(),
            capability,
            target_risk: risk,
            priority: Priority::Medium,
            agent: AgentSnapshot {
                capability,
                load: 0,
                tool_load: HashMap::new(),
                expertise: 0.5,
                history_len: 0,
                successes: 0,
                tool_stats: HashMap::new(),
            },
            candidates,
            max_concurrency: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{candidate, context};
    use super::*;
    use crate::command_executor::ScriptedRunner;
    use crate::registry::AgentRegistry;

    #[test]
    fn test_tie_break_prefers_lower_load_then_duration() {
        let mut a = candidate("alpha", 0.8, 0.5);
        let mut b = candidate("beta", 0.8, 0.5);
        a.load = 2;
        b.load = 1;
        assert_eq!(pick_best(&[a.clone(), b.clone()], &[0.700, 0.695], 0.01), 1);

        b.load = 2;
        b.avg_duration_secs = Some(10.0);
        assert_eq!(pick_best(&[a.clone(), b.clone()], &[0.70, 0.70], 0.01), 1);

        // Outside the epsilon the score wins regardless of load
        assert_eq!(pick_best(&[a, b], &[0.9, 0.5], 0.01), 0);
    }

    #[test]
    fn test_nan_scores_never_win() {
        let a = candidate("alpha", 0.8, 0.5);
        let b = candidate("beta", 0.8, 0.5);
        assert_eq!(pick_best(&[a, b], &[f64::NAN, 0.1], 0.01), 1);
    }

    #[test]
    fn test_features_in_unit_range() {
        let mut c = candidate("nmap", 1.0, 0.6);
        c.avg_duration_secs = Some(900.0);
        for f in c.features() {
            assert!((0.0..=1.0).contains(&f));
        }
        c.avg_duration_secs = None;
        assert_eq!(c.features()[1], 0.5);
    }

    #[test]
    fn test_context_build_from_registry() {
        let config = Config::default();
        let tools = ToolSet::with_runner(&config, Arc::new(ScriptedRunner::new()));
        let registry = Arc::new(AgentRegistry::new(&config.registry));
        let _guard = registry.acquire(Capability::Network, "nmap");
        let snapshot = registry.snapshot(Capability::Network);

        let names = tools.tools_for(Capability::Network);
        let ctx = DecisionContext::build(
            "step_1",
            Capability::Network,
            0.4,
            Priority::High,
            snapshot,
            &tools,
            &names,
            5,
        );
        assert_eq!(ctx.candidates.len(), names.len());
        let nmap = ctx.candidate("nmap").unwrap();
        assert_eq!(nmap.load, 1);
        assert_eq!(nmap.success_rate, PRIOR_SUCCESS_RATE);
        assert!((ctx.load_ratio() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_engine_rejects_empty_candidates() {
        let engine = DecisionEngine::new(&Config::default()).unwrap();
        let ctx = context(Capability::Web, 0.5, Vec::new());
        assert!(matches!(
            engine.select(&ctx, None),
            Err(EngineError::NoEligibleTool(Capability::Web))
        ));
    }

    #[test]
    fn test_engine_routes_overrides() {
        let mut config = Config::default();
        config
            .strategy
            .overrides
            .insert("forensic".to_string(), "q_learning".to_string());
        config.strategy.default = "evolutionary".to_string();
        let engine = DecisionEngine::new(&config).unwrap();
        assert_eq!(engine.resolve(Capability::Forensic, None), StrategyKind::QLearning);
        assert_eq!(engine.default_kind(), StrategyKind::Evolutionary);
        assert_eq!(engine.resolve(Capability::Network, None), StrategyKind::Evolutionary);
        assert_eq!(
            engine.resolve(Capability::Forensic, Some(StrategyKind::Evolutionary)),
            StrategyKind::Evolutionary
        );
    }

    #[test]
    fn test_every_strategy_confidence_in_range() {
        let engine = DecisionEngine::new(&Config::default()).unwrap();
        let ctx = context(
            Capability::Network,
            0.7,
            vec![candidate("nmap", 0.9, 0.6), candidate("masscan", 0.3, 0.8)],
        );
        for kind in [StrategyKind::Fuzzy, StrategyKind::Evolutionary, StrategyKind::QLearning] {
            let decision = engine.select(&ctx, Some(kind)).unwrap();
            assert!((0.0..=1.0).contains(&decision.confidence));
            assert_eq!(decision.strategy, kind);
        }
    }

    #[test]
    fn test_sample_from_context() {
        let ctx = context(Capability::Network, 0.7, vec![candidate("nmap", 0.9, 0.6)]);
        let sample = LearningSample::from_context(&ctx, "nmap", 2.0, true).unwrap();
        assert_eq!(sample.reward, 1.0);
        assert_eq!(sample.target(), 1.0);
        assert!(LearningSample::from_context(&ctx, "masscan", 1.0, true).is_none());
    }
}
