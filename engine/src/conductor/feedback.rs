//! Learning feedback loop
//!
//! After a step runs, its outcome is appended to the agent registry and
//! turned into a reward for the decision engine. Only steps whose tool
//! actually ran reach this module.

use crate::decision::{DecisionContext, DecisionEngine, LearningSample};
use crate::registry::{AgentRegistry, PerformanceMetric};
use sdk::errors::EngineError;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reward of a step that failed outright
pub const FAILURE_REWARD: f64 = -0.5;

/// Reward of a step killed at its timeout
pub const TIMEOUT_REWARD: f64 = -1.0;

const FINDING_BONUS: f64 = 0.05;
const MAX_FINDING_BONUS: f64 = 0.25;

/// Reward in [-1, 1] for one step outcome.
///
/// Success earns up to 1.0, less for using more of the tool's ceiling, plus a
/// small bonus per finding.
pub fn reward(
    success: bool,
    timed_out: bool,
    duration: Duration,
    ceiling: Duration,
    findings: usize,
) -> f64 {
    if timed_out {
        return TIMEOUT_REWARD;
    }
    if !success {
        return FAILURE_REWARD;
    }
    let used = if ceiling.is_zero() {
        0.0
    } else {
        (duration.as_secs_f64() / ceiling.as_secs_f64()).min(1.0)
    };
    let bonus = (FINDING_BONUS * findings as f64).min(MAX_FINDING_BONUS);
    (1.0 - 0.5 * used + bonus).clamp(-1.0, 1.0)
}

/// What the dispatcher knows about a finished step.
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome<'a> {
    pub tool: &'a str,
    pub duration: Duration,
    pub ceiling: Duration,
    pub findings: usize,
    pub error: Option<&'a EngineError>,
}

pub struct LearningLoop {
    registry: Arc<AgentRegistry>,
    engine: Arc<DecisionEngine>,
}

impl LearningLoop {
    pub fn new(registry: Arc<AgentRegistry>, engine: Arc<DecisionEngine>) -> Self {
        Self { registry, engine }
    }

    /// Record a step and train the strategies on it. Must run after the
    /// step's load was released so the registry snapshot is current.
    pub fn record(&self, ctx: &DecisionContext, outcome: StepOutcome<'_>) -> f64 {
        let success = outcome.error.is_none();
        let timed_out = matches!(outcome.error, Some(EngineError::Timeout { .. }));

        let mut metric = PerformanceMetric::new(
            ctx.capability,
            outcome.tool,
            success,
            outcome.duration,
            outcome.findings,
        );
        if timed_out {
            metric = metric.timed_out();
        }
        self.registry.record(metric);

        let value = reward(
            success,
            timed_out,
            outcome.duration,
            outcome.ceiling,
            outcome.findings,
        );
        let Some(mut sample) = LearningSample::from_context(ctx, outcome.tool, value, success)
        else {
            return value;
        };

        let after = self.registry.snapshot(ctx.capability);
        sample.agent_success_rate = after.success_rate();
        sample.expertise = after.expertise;
        self.engine.learn(&sample);

        debug!(
            step_id = %ctx.step_id,
            capability = %ctx.capability,
            tool = outcome.tool,
            reward = value,
            action_value = self.engine.action_value(ctx, outcome.tool),
            success,
            "Learning sample recorded"
        );
        value
    }
}
