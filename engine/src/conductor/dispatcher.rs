//! Execution dispatcher
//!
//! Walks a plan's ready steps under a global concurrency bound. For each step
//! the decision engine picks a tool, the agent's load is held for the length
//! of the call, and the tool runs on its own task. Completions feed the
//! learning loop. A failure only affects the steps that depend on it; the
//! whole plan stops early only when its cancellation token fires.

use super::feedback::{LearningLoop, StepOutcome};
use super::types::{
    http_port, Condition, ExecutionPlan, PlanReport, PlanState, SkipReason, Step, StepResult,
    StepStatus,
};
use crate::decision::{Decision, DecisionContext, DecisionEngine};
use crate::message_bus::{Event, MessageBus};
use crate::registry::AgentRegistry;
use crate::risk_assessor::{RiskAssessment, RiskAssessor};
use crate::target::Target;
use crate::tools::{Invocation, ToolOutcome, ToolSet};
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, HealthReport, ToolInput};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A step that has been assigned a tool and handed to a task.
struct Launched {
    step_id: String,
    ctx: DecisionContext,
    decision: Decision,
    target: Target,
    risk: RiskAssessment,
    ceiling: Duration,
}

/// What a step task hands back.
struct Completion {
    launched: Launched,
    elapsed: Duration,
    result: Result<ToolOutcome, EngineError>,
}

/// Dependency check result for one pending step.
enum Readiness {
    Ready,
    Waiting,
    Skip(SkipReason),
}

pub struct Dispatcher {
    tools: Arc<ToolSet>,
    registry: Arc<AgentRegistry>,
    engine: Arc<DecisionEngine>,
    learning: LearningLoop,
    bus: MessageBus,
    risk: RiskAssessor,
    max_concurrency: usize,
}

impl Dispatcher {
    pub fn new(
        tools: Arc<ToolSet>,
        registry: Arc<AgentRegistry>,
        engine: Arc<DecisionEngine>,
        bus: MessageBus,
        max_concurrency: usize,
    ) -> Self {
        Self {
            learning: LearningLoop::new(Arc::clone(&registry), Arc::clone(&engine)),
            tools,
            registry,
            engine,
            bus,
            risk: RiskAssessor::new(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run every step of the plan to a terminal status.
    pub async fn run(&self, plan: &mut ExecutionPlan, cancel: &CancellationToken) -> PlanReport {
        let started = Instant::now();
        info!(plan_id = %plan.id, steps = plan.steps.len(), "Plan started");
        self.bus
            .publish(Event::PlanStarted {
                plan_id: plan.id.clone(),
                steps: plan.steps.len(),
            })
            .await;

        self.preflight(plan).await;

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut running: JoinSet<Completion> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() && !cancelled {
                cancelled = true;
                info!(plan_id = %plan.id, in_flight = running.len(), "Plan cancelled");
                self.skip_pending(plan).await;
            }

            let mut progressed = false;
            if !cancelled {
                self.propagate(plan).await;
                for id in ready_steps(plan) {
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };
                    if !self.launch(plan, &id, permit, &mut running, cancel).await {
                        progressed = true;
                    }
                }
            }

            if running.is_empty() {
                if progressed {
                    continue;
                }
                break;
            }

            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok(completion)) => self.complete(plan, completion).await,
                    Some(Err(e)) => warn!(plan_id = %plan.id, "Step task did not finish: {}", e),
                    None => {}
                },
                _ = cancel.cancelled(), if !cancelled => {}
            }
        }

        // A task that panicked never reports back
        for step in plan.steps.iter_mut() {
            if step.status == StepStatus::Running && step.transition(StepStatus::Failed).is_ok() {
                let result = step.result.get_or_insert_with(StepResult::default);
                result.error = Some("step task aborted".to_string());
                result.error_kind = Some("orchestration".to_string());
            }
        }

        let state = final_state(plan, cancelled);
        info!(plan_id = %plan.id, %state, "Plan finished");
        self.bus
            .publish(Event::PlanFinished {
                plan_id: plan.id.clone(),
                state,
            })
            .await;
        PlanReport::new(plan, state, started.elapsed())
    }

    /// Skip steps none of whose tools is installed.
    async fn preflight(&self, plan: &mut ExecutionPlan) {
        let mut health: HashMap<Capability, HealthReport> = HashMap::new();
        let mut skips = Vec::new();
        for step in &plan.steps {
            let report = health
                .entry(step.capability)
                .or_insert_with(|| self.tools.health_check(step.capability));
            let names = self.eligible_names(step);
            if !names.iter().any(|n| report.is_available(n)) {
                skips.push((step.id.clone(), SkipReason::ToolUnavailable(names)));
            }
        }
        for (id, reason) in skips {
            self.skip(plan, &id, reason).await;
        }
    }

    /// Skip pending steps whose dependencies can no longer be met, until no
    /// more change. Skips cascade through the whole graph.
    async fn propagate(&self, plan: &mut ExecutionPlan) {
        loop {
            let skips: Vec<(String, SkipReason)> = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .filter_map(|s| match readiness(plan, s) {
                    Readiness::Skip(reason) => Some((s.id.clone(), reason)),
                    _ => None,
                })
                .collect();
            if skips.is_empty() {
                return;
            }
            for (id, reason) in skips {
                self.skip(plan, &id, reason).await;
            }
        }
    }

    async fn skip_pending(&self, plan: &mut ExecutionPlan) {
        let pending: Vec<String> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id.clone())
            .collect();
        for id in pending {
            self.skip(plan, &id, SkipReason::Cancelled).await;
        }
    }

    async fn skip(&self, plan: &mut ExecutionPlan, id: &str, reason: SkipReason) {
        let plan_id = plan.id.clone();
        let Some(step) = plan.step_mut(id) else {
            return;
        };
        if step.transition(StepStatus::Skipped).is_err() {
            return;
        }
        info!(plan_id = %plan_id, step_id = id, reason = %reason, "Step skipped");
        let text = reason.to_string();
        step.result = Some(StepResult {
            skip_reason: Some(reason),
            ..StepResult::default()
        });
        self.bus
            .publish(Event::StepSkipped {
                plan_id,
                step_id: id.to_string(),
                reason: text,
            })
            .await;
    }

    fn eligible_names(&self, step: &Step) -> Vec<String> {
        if step.tool_hints.is_empty() {
            self.tools
                .tools_for(step.capability)
                .into_iter()
                .map(String::from)
                .collect()
        } else {
            step.tool_hints.clone()
        }
    }

    /// Start one ready step. Returns false when the step failed before any
    /// task was spawned.
    async fn launch(
        &self,
        plan: &mut ExecutionPlan,
        id: &str,
        permit: OwnedSemaphorePermit,
        running: &mut JoinSet<Completion>,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(step) = plan.step_mut(id) else {
            return false;
        };
        if step.transition(StepStatus::Running).is_err() {
            return false;
        }

        let (launched, input, upstream) = match self.assign(plan, id) {
            Ok(assigned) => assigned,
            Err(e) => {
                self.fail_unstarted(plan, id, e).await;
                return false;
            }
        };

        let guard = self.registry.acquire(launched.ctx.capability, &launched.decision.tool);
        info!(
            plan_id = %plan.id,
            step_id = id,
            capability = %launched.ctx.capability,
            tool = %launched.decision.tool,
            strategy = launched.decision.strategy.as_str(),
            confidence = launched.decision.confidence,
            target = %launched.target,
            "Step dispatched"
        );
        self.bus
            .publish(Event::StepStarted {
                plan_id: plan.id.clone(),
                step_id: id.to_string(),
                capability: launched.ctx.capability,
                tool: launched.decision.tool.clone(),
                confidence: launched.decision.confidence,
            })
            .await;

        let timeout = plan.step(id).and_then(|s| s.timeout);
        let tools = Arc::clone(&self.tools);
        let token = cancel.child_token();
        running.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let result = tools
                .invoke(
                    Invocation {
                        capability: launched.ctx.capability,
                        tool: &launched.decision.tool,
                        target: &launched.target,
                        input: &input,
                        timeout,
                        upstream: &upstream,
                    },
                    &token,
                )
                .await;
            // Load is released before the outcome is learned from
            drop(guard);
            Completion {
                launched,
                elapsed: started.elapsed(),
                result,
            }
        });
        true
    }

    /// Resolve the target, assess risk, and let the decision engine choose.
    fn assign(
        &self,
        plan: &ExecutionPlan,
        id: &str,
    ) -> Result<(Launched, ToolInput, Vec<Finding>), EngineError> {
        let step = plan
            .step(id)
            .ok_or_else(|| EngineError::Orchestration(format!("unknown step {}", id)))?;
        let target = resolve_target(plan, step)?;
        let upstream: Vec<Finding> = step
            .depends_on
            .iter()
            .filter_map(|d| plan.step(&d.step))
            .flat_map(|s| s.findings().iter().cloned())
            .collect();

        let mut input = step.options.clone();
        input.target = target.as_arg();
        let risk = self
            .risk
            .assess(step.capability, &target, plan.priority, &input);

        let names: Vec<String> = self
            .eligible_names(step)
            .into_iter()
            .filter(|n| self.tools.is_available(n))
            .filter(|n| self.tools.get(n).is_some_and(|a| a.accepts(&target)))
            .collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let ctx = DecisionContext::build(
            id,
            step.capability,
            risk.score,
            plan.priority,
            self.registry.snapshot(step.capability),
            &self.tools,
            &names,
            self.max_concurrency,
        );
        let decision = self.engine.select(&ctx, plan.strategy)?;
        let ceiling = self.tools.ceiling(&decision.tool).unwrap_or_default();

        Ok((
            Launched {
                step_id: id.to_string(),
                ctx,
                decision,
                target,
                risk,
                ceiling,
            },
            input,
            upstream,
        ))
    }

    async fn fail_unstarted(&self, plan: &mut ExecutionPlan, id: &str, error: EngineError) {
        let plan_id = plan.id.clone();
        let Some(step) = plan.step_mut(id) else {
            return;
        };
        warn!(plan_id = %plan_id, step_id = id, "Step could not be assigned: {}", error);
        if step.transition(StepStatus::Failed).is_err() {
            return;
        }
        step.result = Some(StepResult {
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            ..StepResult::default()
        });
        self.bus
            .publish(Event::StepFinished {
                plan_id,
                step_id: id.to_string(),
                status: StepStatus::Failed,
                findings: 0,
                duration_ms: 0,
            })
            .await;
    }

    async fn complete(&self, plan: &mut ExecutionPlan, completion: Completion) {
        let Completion {
            launched,
            elapsed,
            result,
        } = completion;
        let plan_id = plan.id.clone();
        let Some(step) = plan.step_mut(&launched.step_id) else {
            return;
        };

        let mut step_result = StepResult {
            tool: Some(launched.decision.tool.clone()),
            strategy: Some(launched.decision.strategy),
            confidence: Some(launched.decision.confidence),
            resolved_target: (launched.target != step.target).then(|| launched.target.clone()),
            risk: Some(launched.risk),
            duration: elapsed,
            ..StepResult::default()
        };
        let status = match &result {
            Ok(outcome) => {
                step_result.argv = outcome.argv.clone();
                step_result.findings = outcome.findings.clone();
                step_result.truncated = outcome.truncated;
                step_result.exit_code = outcome.exit_code;
                StepStatus::Succeeded
            }
            Err(e) => {
                step_result.error = Some(e.to_string());
                step_result.error_kind = Some(e.kind().to_string());
                StepStatus::Failed
            }
        };
        let findings = step_result.findings.len();

        if let Err(e) = step.transition(status) {
            warn!(plan_id = %plan_id, "{}", e);
            return;
        }
        step.result = Some(step_result);

        match &result {
            Ok(_) => info!(
                plan_id = %plan_id,
                step_id = %launched.step_id,
                tool = %launched.decision.tool,
                findings,
                duration_ms = elapsed.as_millis() as u64,
                "Step succeeded"
            ),
            Err(e) => warn!(
                plan_id = %plan_id,
                step_id = %launched.step_id,
                tool = %launched.decision.tool,
                "Step failed: {}",
                e
            ),
        }

        match &result {
            Err(e) if !e.is_tool_outcome() => debug!(
                step_id = %launched.step_id,
                error_kind = e.kind(),
                "Step not learned from"
            ),
            _ => {
                self.learning.record(
                    &launched.ctx,
                    StepOutcome {
                        tool: &launched.decision.tool,
                        duration: elapsed,
                        ceiling: launched.ceiling,
                        findings,
                        error: result.as_ref().err(),
                    },
                );
            }
        }

        self.bus
            .publish(Event::StepFinished {
                plan_id,
                step_id: launched.step_id,
                status,
                findings,
                duration_ms: elapsed.as_millis() as u64,
            })
            .await;
    }
}

fn readiness(plan: &ExecutionPlan, step: &Step) -> Readiness {
    let mut waiting = false;
    for dep in &step.depends_on {
        let Some(upstream) = plan.step(&dep.step) else {
            return Readiness::Skip(SkipReason::DependencyFailed(dep.step.clone()));
        };
        if !upstream.status.is_terminal() {
            waiting = true;
            continue;
        }
        if dep.condition == Condition::Finished {
            continue;
        }
        match upstream.status {
            StepStatus::Succeeded => {
                if !dep.condition.satisfied_by(upstream.findings()) {
                    return Readiness::Skip(SkipReason::ConditionNotMet(
                        dep.condition.unmet_reason().to_string(),
                    ));
                }
            }
            // A benign skip upstream stays benign downstream
            StepStatus::Skipped => match upstream.skip_reason() {
                Some(reason @ SkipReason::ConditionNotMet(_)) => {
                    return Readiness::Skip(reason.clone())
                }
                _ => return Readiness::Skip(SkipReason::DependencyFailed(dep.step.clone())),
            },
            _ => return Readiness::Skip(SkipReason::DependencyFailed(dep.step.clone())),
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Pending steps whose dependencies are all met, in plan order.
fn ready_steps(plan: &ExecutionPlan) -> Vec<String> {
    plan.steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| matches!(readiness(plan, s), Readiness::Ready))
        .map(|s| s.id.clone())
        .collect()
}

/// The URL of a discovered HTTP port for `HttpPortOpen` dependents,
/// otherwise the planned target.
fn resolve_target(plan: &ExecutionPlan, step: &Step) -> Result<Target, EngineError> {
    for dep in &step.depends_on {
        if dep.condition != Condition::HttpPortOpen {
            continue;
        }
        let found = plan.step(&dep.step).and_then(|s| http_port(s.findings()));
        if let Some((host, port, tls)) = found {
            return Target::http_url(&host, port, tls);
        }
    }
    Ok(step.target.clone())
}

fn final_state(plan: &ExecutionPlan, cancelled: bool) -> PlanState {
    if cancelled {
        return PlanState::Aborted;
    }
    let clean = plan.steps.iter().all(|s| match s.status {
        StepStatus::Succeeded => true,
        StepStatus::Skipped => s.skip_reason().is_some_and(SkipReason::is_benign),
        _ => false,
    });
    if clean {
        PlanState::Completed
    } else {
        PlanState::PartiallyFailed
    }
}
