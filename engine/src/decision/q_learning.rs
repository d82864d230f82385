//! Action-value learning
//!
//! State is the capability plus a target-risk bucket and a load bucket.
//! Actions are tool names. Values start at zero and follow the one-step
//! update `q += lr * (reward + discount * max_next - q)`. A tool selection
//! ends its episode, so learned samples update with `max_next = 0` and each
//! value settles on the mean reward of its action.
//!
//! Selection is epsilon-greedy. Epsilon itself adapts from the capability's
//! recent success rate: a struggling agent explores more.

use super::{pick_best, sanitize, Decision, DecisionContext, LearningSample, Strategy};
use crate::config::{QLearningConfig, StrategyKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sdk::errors::EngineError;
use sdk::types::Capability;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;

/// Success rate below which exploration grows
const EXPLORE_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub capability: Capability,
    pub risk_bucket: usize,
    pub load_bucket: usize,
}

struct Explorer {
    rng: StdRng,
    epsilon: f64,
}

pub struct QLearningStrategy {
    table: RwLock<HashMap<StateKey, HashMap<String, f64>>>,
    explorer: Mutex<Explorer>,
    learning_rate: f64,
    discount_factor: f64,
    min_epsilon: f64,
    max_epsilon: f64,
    risk_buckets: usize,
    load_buckets: usize,
    temperature: f64,
    tie_epsilon: f64,
}

fn bucket(value: f64, buckets: usize) -> usize {
    let buckets = buckets.max(1);
    ((sanitize(value) * buckets as f64) as usize).min(buckets - 1)
}

impl QLearningStrategy {
    pub fn new(config: &QLearningConfig, tie_epsilon: f64) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            table: RwLock::new(HashMap::new()),
            explorer: Mutex::new(Explorer {
                rng,
                epsilon: config.epsilon,
            }),
            learning_rate: config.learning_rate,
            discount_factor: config.discount_factor,
            min_epsilon: config.min_epsilon,
            max_epsilon: config.max_epsilon,
            risk_buckets: config.risk_buckets,
            load_buckets: config.load_buckets,
            temperature: if config.temperature > 0.0 {
                config.temperature
            } else {
                1.0
            },
            tie_epsilon,
        }
    }

    fn explorer(&self) -> MutexGuard<'_, Explorer> {
        self.explorer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state_for(&self, capability: Capability, target_risk: f64, load_ratio: f64) -> StateKey {
        StateKey {
            capability,
            risk_bucket: bucket(target_risk, self.risk_buckets),
            load_bucket: bucket(load_ratio, self.load_buckets),
        }
    }

    pub fn q_value(&self, state: &StateKey, action: &str) -> Option<f64> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.get(state)?.get(action).copied()
    }

    pub fn epsilon(&self) -> f64 {
        self.explorer().epsilon
    }

    /// One-step update. `next = None` treats the step as terminal.
    pub fn update(&self, state: StateKey, action: &str, reward: f64, next: Option<StateKey>) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let max_next = next
            .and_then(|n| table.get(&n))
            .and_then(|actions| actions.values().copied().reduce(f64::max))
            .unwrap_or(0.0);
        let q = table
            .entry(state)
            .or_default()
            .entry(action.to_string())
            .or_insert(0.0);
        *q += self.learning_rate * (reward + self.discount_factor * max_next - *q);
    }

    fn adapt_epsilon(&self, success_rate: f64) {
        let mut explorer = self.explorer();
        explorer.epsilon = if success_rate < EXPLORE_THRESHOLD {
            (explorer.epsilon * 1.1).min(self.max_epsilon)
        } else {
            (explorer.epsilon * 0.9).max(self.min_epsilon)
        };
    }

    /// Softmax probability of `index` under the configured temperature.
    fn softmax(&self, values: &[f64], index: usize) -> f64 {
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = values
            .iter()
            .map(|v| ((v - max) / self.temperature).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        if total > 0.0 && total.is_finite() {
            sanitize(weights[index] / total)
        } else {
            0.0
        }
    }
}

impl Strategy for QLearningStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::QLearning
    }

    fn select(&self, ctx: &DecisionContext) -> Result<Decision, EngineError> {
        if ctx.candidates.is_empty() {
            return Err(EngineError::NoEligibleTool(ctx.capability));
        }
        let state = self.state_for(ctx.capability, ctx.target_risk, ctx.load_ratio());
        let values: Vec<f64> = ctx
            .candidates
            .iter()
            .map(|c| self.q_value(&state, &c.name).unwrap_or(0.0))
            .collect();

        let (index, explored) = {
            let mut explorer = self.explorer();
            let epsilon = explorer.epsilon;
            if explorer.rng.gen::<f64>() < epsilon {
                (explorer.rng.gen_range(0..ctx.candidates.len()), true)
            } else {
                (pick_best(&ctx.candidates, &values, self.tie_epsilon), false)
            }
        };

        let tool = ctx.candidates[index].name.clone();
        debug!(
            step_id = %ctx.step_id,
            tool = %tool,
            explored,
            risk_bucket = state.risk_bucket,
            load_bucket = state.load_bucket,
            "Action chosen"
        );
        Ok(Decision {
            tool,
            confidence: self.softmax(&values, index),
            strategy: StrategyKind::QLearning,
        })
    }

    fn learn(&self, sample: &LearningSample) {
        let state = self.state_for(sample.capability, sample.target_risk, sample.load_ratio);
        self.update(state, &sample.tool, sample.reward, None);
        self.adapt_epsilon(sample.agent_success_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{candidate, context};
    use super::*;

    fn greedy() -> QLearningStrategy {
        QLearningStrategy::new(
            &QLearningConfig {
                epsilon: 0.0,
                min_epsilon: 0.0,
                seed: Some(1),
                ..QLearningConfig::default()
            },
            0.01,
        )
    }

    #[test]
    fn test_buckets() {
        let q = greedy();
        let low = q.state_for(Capability::Network, 0.0, 0.0);
        assert_eq!((low.risk_bucket, low.load_bucket), (0, 0));
        let mid = q.state_for(Capability::Network, 0.5, 0.4);
        assert_eq!((mid.risk_bucket, mid.load_bucket), (1, 1));
        let top = q.state_for(Capability::Network, 1.0, 7.0);
        assert_eq!((top.risk_bucket, top.load_bucket), (2, 2));
    }

    #[test]
    fn test_terminal_updates_converge_to_reward() {
        let q = greedy();
        let state = q.state_for(Capability::Forensic, 0.2, 0.0);
        for _ in 0..100 {
            q.update(state, "strings", 0.8, None);
        }
        let value = q.q_value(&state, "strings").unwrap();
        assert!((value - 0.8).abs() < 0.01, "q = {}", value);
    }

    #[test]
    fn test_learned_samples_converge_to_reward() {
        let q = greedy();
        let ctx = context(Capability::Network, 0.3, vec![candidate("nmap", 0.9, 0.6)]);
        let sample = LearningSample::from_context(&ctx, "nmap", 0.8, true).unwrap();
        for _ in 0..100 {
            q.learn(&sample);
        }
        let state = q.state_for(ctx.capability, ctx.target_risk, ctx.load_ratio());
        let value = q.q_value(&state, "nmap").unwrap();
        assert!((value - 0.8).abs() < 0.05, "q = {}", value);
    }

    #[test]
    fn test_next_state_bootstraps() {
        let q = greedy();
        let s1 = q.state_for(Capability::Web, 0.5, 0.0);
        let s2 = q.state_for(Capability::Web, 0.5, 0.9);
        q.update(s2, "nikto", 1.0, None);
        q.update(s1, "gobuster", 0.0, Some(s2));
        let value = q.q_value(&s1, "gobuster").unwrap();
        assert!((value - 0.1 * 0.9 * 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_greedy_picks_highest_value() {
        let q = greedy();
        let ctx = context(
            Capability::Network,
            0.4,
            vec![candidate("nmap", 0.5, 0.6), candidate("masscan", 0.5, 0.8)],
        );
        let state = q.state_for(ctx.capability, ctx.target_risk, ctx.load_ratio());
        q.update(state, "masscan", 1.0, None);
        let decision = q.select(&ctx).unwrap();
        assert_eq!(decision.tool, "masscan");
        assert!(decision.confidence > 0.5 && decision.confidence <= 1.0);
    }

    #[test]
    fn test_single_candidate_full_confidence() {
        let q = greedy();
        let ctx = context(Capability::Social, 0.1, vec![candidate("theharvester", 0.5, 0.1)]);
        assert_eq!(q.select(&ctx).unwrap().confidence, 1.0);
    }

    #[test]
    fn test_epsilon_adapts_within_bounds() {
        let q = QLearningStrategy::new(&QLearningConfig::default(), 0.01);
        let ctx = context(Capability::Web, 0.5, vec![candidate("nikto", 0.5, 0.5)]);
        let mut sample = LearningSample::from_context(&ctx, "nikto", -0.5, false).unwrap();

        sample.agent_success_rate = 0.2;
        q.learn(&sample);
        assert!((q.epsilon() - 0.11).abs() < 1e-9);
        for _ in 0..50 {
            q.learn(&sample);
        }
        assert!((q.epsilon() - 0.3).abs() < 1e-9);

        sample.agent_success_rate = 0.9;
        for _ in 0..200 {
            q.learn(&sample);
        }
        assert!((q.epsilon() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_full_exploration_still_picks_a_candidate() {
        let q = QLearningStrategy::new(
            &QLearningConfig {
                epsilon: 1.0,
                seed: Some(9),
                ..QLearningConfig::default()
            },
            0.01,
        );
        let ctx = context(
            Capability::Forensic,
            0.2,
            vec![candidate("strings", 0.5, 0.0), candidate("binwalk", 0.5, 0.1)],
        );
        for _ in 0..20 {
            let decision = q.select(&ctx).unwrap();
            assert!(ctx.candidate(&decision.tool).is_some());
            assert!((0.0..=1.0).contains(&decision.confidence));
        }
    }
}
